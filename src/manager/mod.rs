//! The buffer manager: one registry, one worker thread, one active policy.
//!
//! Every operation is queued on the worker and answered through a
//! [`Completion`], so callers on any thread observe a single total order of
//! operations.

use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};
use tracing::info;

use crate::backend::{BufferAllocator, RawBlock};
use crate::policy::{DumpPolicy, NeverDump};
use crate::profiling::Profiler;
use crate::types::{BufferId, LoadingMode, ManagerConfig, Result};

mod completion;
mod record;
mod registry;
mod worker;

pub use completion::Completion;
pub use record::{BufferInfo, BufferStats, ManagerEvent, StreamInfo};
pub(crate) use registry::LockGrant;

use registry::{Registry, ScratchDir};
use worker::Worker;

static GLOBAL: OnceLock<Arc<BufferManager>> = OnceLock::new();

/// Owns every managed buffer and the worker that operates on them
pub struct BufferManager {
    worker: Worker,

    /// Active policy, written only by the worker
    policy: Arc<RwLock<Arc<dyn DumpPolicy>>>,

    profiler: Profiler,
    scratch_dir: PathBuf,
}

impl BufferManager {
    /// Start a manager with the never-dump policy
    pub fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        let scratch = ScratchDir::open(&config)?;
        let scratch_dir = scratch.path().to_path_buf();

        let policy: Arc<RwLock<Arc<dyn DumpPolicy>>> =
            Arc::new(RwLock::new(Arc::new(NeverDump::new())));
        let profiler = Profiler::new();

        let registry = Registry::new(&config, scratch, Arc::clone(&policy), profiler.clone());
        let worker = Worker::spawn(config.worker_name.clone(), registry)?;

        info!(
            scratch_dir = %scratch_dir.display(),
            loading_mode = ?config.loading_mode,
            "buffer manager started"
        );

        Ok(Arc::new(Self {
            worker,
            policy,
            profiler,
            scratch_dir,
        }))
    }

    /// Start a manager with default configuration
    pub fn with_defaults() -> Result<Arc<Self>> {
        Self::new(ManagerConfig::default())
    }

    /// Process-wide manager, started on first use and never shut down
    pub fn global() -> Result<Arc<Self>> {
        if let Some(manager) = GLOBAL.get() {
            return Ok(Arc::clone(manager));
        }
        let manager = Self::with_defaults()?;
        // Another thread may have won the race; its manager is kept
        Ok(Arc::clone(GLOBAL.get_or_init(|| manager)))
    }

    /// Directory receiving dump files
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Currently installed policy
    pub fn policy(&self) -> Arc<dyn DumpPolicy> {
        Arc::clone(&*self.policy.read())
    }

    /// Install `policy`; it is immediately consulted over every record
    pub fn set_policy(&self, policy: Arc<dyn DumpPolicy>) -> Completion<()> {
        self.worker.post(move |registry| {
            registry.set_policy(policy);
            Ok(())
        })
    }

    /// Create a new, empty record
    pub fn register(&self) -> Completion<BufferId> {
        self.worker.post(|registry| Ok(registry.register()))
    }

    /// Remove a record, releasing its content and its identity
    pub fn unregister(&self, id: BufferId) -> Completion<()> {
        self.worker.post(move |registry| registry.unregister(id))
    }

    /// Give the buffer fresh zeroed content of `size` bytes, replacing any
    /// previous content
    pub fn allocate(
        &self,
        id: BufferId,
        size: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Completion<()> {
        self.worker.post(move |registry| registry.allocate(id, size, allocator))
    }

    /// Resize, keeping the leading `min(old, new)` bytes
    pub fn reallocate(&self, id: BufferId, size: usize) -> Completion<()> {
        self.worker.post(move |registry| registry.reallocate(id, size))
    }

    /// Take ownership of `size` bytes at `ptr`, released later by `allocator`.
    ///
    /// A null `ptr` or zero `size` leaves the buffer empty.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes, must not be
    /// used by the caller afterwards, and must be releasable by `allocator`.
    pub unsafe fn set_buffer(
        &self,
        id: BufferId,
        ptr: *mut u8,
        size: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Completion<()> {
        let block = match NonNull::new(ptr) {
            Some(ptr) if size > 0 => Some(RawBlock::from_raw_parts(ptr, size)),
            _ => None,
        };
        self.worker.post(move |registry| registry.set_buffer(id, block, allocator))
    }

    /// Use an existing file of `size` bytes as the buffer's dumped content.
    ///
    /// The file is read on first lock (or right away in
    /// [`LoadingMode::Direct`]) and is never deleted by the manager.
    pub fn adopt_file(
        &self,
        id: BufferId,
        path: impl Into<PathBuf>,
        size: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Completion<()> {
        let path = path.into();
        self.worker.post(move |registry| registry.adopt_file(id, path, size, allocator))
    }

    /// Release the content; the identity stays registered and empty
    pub fn destroy(&self, id: BufferId) -> Completion<()> {
        self.worker.post(move |registry| registry.destroy(id))
    }

    /// Exchange the content of two buffers
    pub fn swap(&self, a: BufferId, b: BufferId) -> Completion<()> {
        self.worker.post(move |registry| registry.swap(a, b))
    }

    pub(crate) fn lock(&self, id: BufferId) -> Completion<LockGrant> {
        self.worker.post(move |registry| registry.lock(id))
    }

    pub(crate) fn unlock(&self, id: BufferId) -> Completion<()> {
        self.worker.post(move |registry| registry.unlock(id))
    }

    /// Write the buffer to disk and free its memory (false if nothing to do)
    pub fn dump(&self, id: BufferId) -> Completion<bool> {
        self.worker.post(move |registry| registry.dump(id))
    }

    /// Read a dumped buffer back into memory (false if already resident)
    pub fn restore(&self, id: BufferId) -> Completion<bool> {
        self.worker.post(move |registry| registry.restore(id))
    }

    pub fn lock_count(&self, id: BufferId) -> Completion<i64> {
        self.worker.post(move |registry| registry.lock_count(id))
    }

    pub fn size(&self, id: BufferId) -> Completion<u64> {
        self.worker.post(move |registry| registry.size(id))
    }

    pub fn info(&self, id: BufferId) -> Completion<BufferInfo> {
        self.worker.post(move |registry| registry.info(id))
    }

    /// Stream the content without restoring it (see [`StreamInfo`])
    pub fn stream_info(&self, id: BufferId) -> Completion<StreamInfo> {
        self.worker.post(move |registry| registry.stream_info(id))
    }

    pub fn stats(&self) -> Completion<BufferStats> {
        self.worker.post(|registry| Ok(registry.stats()))
    }

    /// Snapshot of every record
    pub fn buffer_infos(&self) -> Completion<HashMap<BufferId, BufferInfo>> {
        self.worker.post(|registry| Ok(registry.infos()))
    }

    /// Human-readable table of every record
    pub fn report(&self) -> Completion<String> {
        self.worker.post(|registry| Ok(registry.report()))
    }

    pub fn loading_mode(&self) -> Completion<LoadingMode> {
        self.worker.post(|registry| Ok(registry.loading_mode()))
    }

    pub fn set_loading_mode(&self, mode: LoadingMode) -> Completion<()> {
        self.worker.post(move |registry| {
            registry.set_loading_mode(mode);
            Ok(())
        })
    }

    /// Receive every change made after this call, in queue order
    pub fn subscribe(&self) -> Receiver<ManagerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.worker.post(move |registry| {
            registry.subscribe(tx);
            Ok(())
        });
        rx
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("worker", &self.worker)
            .field("policy", &self.policy().name())
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}
