//! Caller-facing buffer handles and scoped locks.
//!
//! A [`BufferHandle`] is a shared reference to one registered buffer; its
//! clones all see the same content. The record is unregistered when the last
//! clone (and the last lock taken from it) is gone.

use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{BufferAllocator, ExternalAllocator, HeapAllocator};
use crate::manager::{BufferManager, LockGrant};
use crate::types::{BufferId, Result};

struct HandleInner {
    id: BufferId,
    manager: Arc<BufferManager>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Fire and forget; a stopped manager has nothing left to release
        let _ = self.manager.unregister(self.id);
    }
}

/// Shared reference to one managed buffer
#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<HandleInner>,
}

impl BufferHandle {
    /// Register a new, empty buffer with the process-wide manager
    pub fn new() -> Result<Self> {
        BufferManager::global()?.new_handle()
    }

    /// Register a new, empty buffer with `manager`
    pub fn new_in(manager: &Arc<BufferManager>) -> Result<Self> {
        let id = manager.register().wait()?;
        Ok(Self {
            inner: Arc::new(HandleInner {
                id,
                manager: Arc::clone(manager),
            }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.inner.manager
    }

    /// Fresh zeroed content of `size` bytes from the heap
    pub fn allocate(&self, size: usize) -> Result<()> {
        self.allocate_with(size, Arc::new(HeapAllocator::new()))
    }

    /// Fresh zeroed content of `size` bytes from `allocator`
    pub fn allocate_with(&self, size: usize, allocator: Arc<dyn BufferAllocator>) -> Result<()> {
        self.manager().allocate(self.id(), size, allocator).wait()
    }

    /// Resize, keeping the leading `min(old, new)` bytes
    pub fn reallocate(&self, size: usize) -> Result<()> {
        self.manager().reallocate(self.id(), size).wait()
    }

    /// Hand `size` bytes at `ptr` over to the manager.
    ///
    /// # Safety
    /// Same contract as [`BufferManager::set_buffer`].
    pub unsafe fn set_buffer(
        &self,
        ptr: *mut u8,
        size: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<()> {
        self.manager()
            .set_buffer(self.id(), ptr, size, allocator)
            .wait()
    }

    /// Hand a boxed slice over to the manager
    pub fn adopt_boxed(&self, data: Box<[u8]>) -> Result<()> {
        let size = data.len();
        let ptr = Box::into_raw(data) as *mut u8;
        // SAFETY: the box is leaked into the manager and released by the
        // allocator that reconstructs it
        unsafe { self.set_buffer(ptr, size, Arc::new(ExternalAllocator::boxed_slice())) }
    }

    /// Use an existing file as dumped content (see [`BufferManager::adopt_file`])
    pub fn adopt_file(&self, path: impl Into<PathBuf>, size: usize) -> Result<()> {
        self.manager()
            .adopt_file(self.id(), path, size, Arc::new(HeapAllocator::new()))
            .wait()
    }

    /// Exchange content with `other`
    pub fn swap(&self, other: &BufferHandle) -> Result<()> {
        self.manager().swap(self.id(), other.id()).wait()
    }

    /// Release the content; the handle stays valid and empty
    pub fn destroy(&self) -> Result<()> {
        self.manager().destroy(self.id()).wait()
    }

    /// Pin the buffer in memory for writing, restoring it first if dumped
    pub fn lock(&self) -> Result<BufferLock> {
        Ok(BufferLock {
            guard: self.pin()?,
        })
    }

    /// Pin the buffer in memory for reading, restoring it first if dumped
    pub fn const_lock(&self) -> Result<ConstBufferLock> {
        Ok(ConstBufferLock {
            guard: self.pin()?,
        })
    }

    fn pin(&self) -> Result<LockGuard> {
        let grant = self.manager().lock(self.id()).wait()?;
        Ok(LockGuard {
            handle: Arc::clone(&self.inner),
            grant,
        })
    }

    /// Outstanding locks across every clone of this handle
    pub fn lock_count(&self) -> i64 {
        self.manager().lock_count(self.id()).wait().unwrap_or(0)
    }

    pub fn size(&self) -> u64 {
        self.manager().size(self.id()).wait().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

/// Extension trait to create handles straight from a shared manager
pub trait ManagerHandleExt {
    /// Register a new, empty buffer and return its handle
    fn new_handle(&self) -> Result<BufferHandle>;
}

impl ManagerHandleExt for Arc<BufferManager> {
    fn new_handle(&self) -> Result<BufferHandle> {
        BufferHandle::new_in(self)
    }
}

/// Keeps the record pinned; posts the unlock on drop
struct LockGuard {
    handle: Arc<HandleInner>,
    grant: LockGrant,
}

impl LockGuard {
    fn as_slice(&self) -> &[u8] {
        if self.grant.ptr.is_null() {
            return &[];
        }
        // SAFETY: the record is pinned, so the block stays put for our lifetime
        unsafe { std::slice::from_raw_parts(self.grant.ptr, self.grant.len) }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Posted before returning; the next operation in queue order sees it
        let _ = self.handle.manager.unlock(self.handle.id);
    }
}

/// Scoped write access to a pinned buffer.
///
/// The memory stays resident and at the same address until the lock is
/// dropped. Several locks (from any clones) may coexist; they all see the
/// same bytes and coordinating writes between them is up to the caller.
pub struct BufferLock {
    guard: LockGuard,
}

impl BufferLock {
    /// Start of the buffer, null when it is empty
    pub fn get_buffer(&self) -> *mut u8 {
        self.guard.grant.ptr
    }

    pub fn len(&self) -> usize {
        self.guard.grant.len
    }

    pub fn is_empty(&self) -> bool {
        self.guard.grant.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.guard.as_slice()
    }

    /// Mutable view of the buffer.
    ///
    /// # Safety
    /// No other lock on the same buffer may read or write it while the
    /// returned slice is alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.guard.grant.ptr.is_null() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.guard.grant.ptr, self.guard.grant.len)
    }
}

impl std::fmt::Debug for BufferLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLock")
            .field("id", &self.guard.handle.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Scoped read access to a pinned buffer
pub struct ConstBufferLock {
    guard: LockGuard,
}

impl ConstBufferLock {
    /// Start of the buffer, null when it is empty
    pub fn get_buffer(&self) -> *const u8 {
        self.guard.grant.ptr
    }

    pub fn len(&self) -> usize {
        self.guard.grant.len
    }

    pub fn is_empty(&self) -> bool {
        self.guard.grant.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

impl std::fmt::Debug for ConstBufferLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstBufferLock")
            .field("id", &self.guard.handle.id)
            .field("len", &self.len())
            .finish()
    }
}
