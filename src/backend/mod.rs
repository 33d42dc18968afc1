use std::fmt;
use std::ptr::NonNull;

use crate::types::Result;

/// A raw memory region handed out by a [`BufferAllocator`].
///
/// Owns nothing by itself: the allocator that produced it (or adopted it)
/// is responsible for releasing it.
#[derive(Debug)]
pub struct RawBlock {
    ptr: NonNull<u8>,
    len: usize,
}

impl RawBlock {
    /// Wrap an existing region.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until the block
    /// is passed back to the allocator that will release it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed valid for `len` bytes by construction
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed valid for `len` bytes by construction
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

// Thread safety: a block is only ever touched by the worker or through a lock
unsafe impl Send for RawBlock {}

/// Strategy used to obtain and release the memory of one buffer
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Short name shown in reports
    fn name(&self) -> &'static str;

    /// Allocate `size` bytes (zeroed)
    fn allocate(&self, size: usize) -> Result<RawBlock>;

    /// Resize `block` in place or by moving it, preserving `min(old, new)` bytes.
    /// On failure `block` is left untouched.
    fn reallocate(&self, block: &mut RawBlock, new_size: usize) -> Result<()>;

    /// Release a block previously produced or adopted by this allocator
    fn release(&self, block: RawBlock);

    /// Take responsibility for an externally supplied block
    fn adopt(&self, _block: &RawBlock) {}
}

pub mod external;
pub mod heap;
pub mod mapped;

pub use external::ExternalAllocator;
pub use heap::HeapAllocator;
pub use mapped::MappedAllocator;
