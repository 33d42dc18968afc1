//! Record table and every operation on it.
//!
//! Only the worker thread ever holds a `Registry`, so nothing in here needs
//! synchronization beyond the shared policy slot.

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::backend::{BufferAllocator, RawBlock};
use crate::manager::record::{
    BackingFile, BufferInfo, BufferRecord, BufferStats, ManagerEvent, StreamInfo,
};
use crate::policy::{DumpPolicy, EventKind, PolicyEvent, RecordView};
use crate::profiling::Profiler;
use crate::types::{BufferError, BufferId, LoadingMode, ManagerConfig, Result};

/// Where dump files go
#[derive(Debug)]
pub(crate) enum ScratchDir {
    /// Removed with everything in it when the manager shuts down
    Owned(TempDir),
    /// Caller's directory, left in place
    Provided(PathBuf),
}

impl ScratchDir {
    pub fn open(config: &ManagerConfig) -> Result<Self> {
        match &config.scratch_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Ok(Self::Provided(dir.clone()))
            }
            None => Ok(Self::Owned(
                tempfile::Builder::new().prefix("spillable-").tempdir()?,
            )),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Owned(dir) => dir.path(),
            Self::Provided(dir) => dir,
        }
    }
}

/// Memory handed to the holder of a new lock
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockGrant {
    /// Null when the buffer is empty
    pub ptr: *mut u8,
    pub len: usize,
}

// Thread safety: the pointer is only dereferenced by the lock holder while
// the record stays pinned
unsafe impl Send for LockGrant {}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<BufferRecord>,
}

pub(crate) struct Registry {
    slots: Vec<Slot>,

    /// Min-heap of recycled slot indices (fill holes first)
    free_slots: BinaryHeap<Reverse<u32>>,

    /// Logical clock stamped into `last_access`
    clock: u64,

    scratch: ScratchDir,
    file_prefix: String,
    loading_mode: LoadingMode,

    /// Shared with the manager so the active policy can be read off-thread
    policy: Arc<RwLock<Arc<dyn DumpPolicy>>>,

    profiler: Profiler,
    subscribers: Vec<Sender<ManagerEvent>>,
}

impl Registry {
    pub fn new(
        config: &ManagerConfig,
        scratch: ScratchDir,
        policy: Arc<RwLock<Arc<dyn DumpPolicy>>>,
        profiler: Profiler,
    ) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: BinaryHeap::new(),
            clock: 0,
            scratch,
            file_prefix: config.file_prefix.clone(),
            loading_mode: config.loading_mode,
            policy,
            profiler,
            subscribers: Vec::new(),
        }
    }

    // ---- lookup ----

    fn record(&self, id: BufferId) -> Result<&BufferRecord> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_ref())
            .ok_or(BufferError::UnknownBuffer(id))
    }

    fn record_mut(&mut self, id: BufferId) -> Result<&mut BufferRecord> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_mut())
            .ok_or(BufferError::UnknownBuffer(id))
    }

    /// Two distinct records at once
    fn record_pair_mut(
        &mut self,
        a: BufferId,
        b: BufferId,
    ) -> Result<(&mut BufferRecord, &mut BufferRecord)> {
        self.record(a)?;
        self.record(b)?;

        let (ia, ib) = (a.index() as usize, b.index() as usize);
        let (low, high) = if ia < ib { (ia, ib) } else { (ib, ia) };
        let (head, tail) = self.slots.split_at_mut(high);
        let (first, second) = (&mut head[low], &mut tail[0]);
        let (ra, rb) = if ia < ib {
            (first, second)
        } else {
            (second, first)
        };
        match (ra.record.as_mut(), rb.record.as_mut()) {
            (Some(ra), Some(rb)) => Ok((ra, rb)),
            (None, _) => Err(BufferError::UnknownBuffer(a)),
            (_, None) => Err(BufferError::UnknownBuffer(b)),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ensure_unlocked(id: BufferId, record: &BufferRecord) -> Result<()> {
        if record.lock_count > 0 {
            return Err(BufferError::LockedBuffer {
                id,
                lock_count: record.lock_count,
            });
        }
        Ok(())
    }

    fn notify(&mut self, event: ManagerEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn views(&self) -> Vec<RecordView> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.record
                    .as_ref()
                    .map(|record| record.view(BufferId::new(index as u32, slot.generation)))
            })
            .collect()
    }

    /// Ask the active policy what to dump after `kind` happened to `subject`
    fn consult(&mut self, kind: EventKind, subject: Option<BufferId>) {
        let policy = Arc::clone(&*self.policy.read());
        let views = self.views();
        let victims = policy.on_event(&PolicyEvent { kind, subject }, &views);

        for victim in victims {
            match self.dump(victim) {
                Ok(true) => self.profiler.record_policy_eviction(),
                Ok(false) => {}
                Err(err) => warn!(
                    policy = policy.name(),
                    id = %victim,
                    error = %err,
                    "policy-requested dump failed"
                ),
            }
        }
    }

    // ---- lifecycle ----

    pub fn register(&mut self) -> BufferId {
        let mut record = BufferRecord::new();
        record.last_access = self.tick();

        let id = match self.free_slots.pop() {
            Some(Reverse(index)) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                BufferId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                BufferId::new(index, 0)
            }
        };

        self.notify(ManagerEvent::Registered(id));
        id
    }

    pub fn unregister(&mut self, id: BufferId) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.lock_count > 0 {
            error!(%id, lock_count = record.lock_count, "unregistering a locked buffer");
            return Err(BufferError::LockedBuffer {
                id,
                lock_count: record.lock_count,
            });
        }
        record.clear();

        let slot = &mut self.slots[id.index() as usize];
        slot.record = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(Reverse(id.index()));

        self.notify(ManagerEvent::Unregistered(id));
        Ok(())
    }

    pub fn allocate(
        &mut self,
        id: BufferId,
        size: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<()> {
        if size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        let stamp = self.tick();
        let record = self.record_mut(id)?;
        Self::ensure_unlocked(id, record)?;

        // Old content survives a failed allocation
        let block = allocator.allocate(size)?;
        record.clear();
        record.block = Some(block);
        record.size = size;
        record.allocator = allocator;
        record.last_access = stamp;

        debug!(%id, size, allocator = record.allocator.name(), "buffer allocated");
        self.profiler.record_allocation(size);
        self.notify(ManagerEvent::Allocated(id));
        self.consult(EventKind::Allocate, Some(id));
        Ok(())
    }

    /// Take over `block`, which `allocator` will release
    pub fn set_buffer(
        &mut self,
        id: BufferId,
        block: Option<RawBlock>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<()> {
        if let Some(block) = &block {
            allocator.adopt(block);
        }
        let stamp = self.tick();
        let record = match self.record_mut(id) {
            Ok(record) => record,
            Err(err) => {
                if let Some(block) = block {
                    allocator.release(block);
                }
                return Err(err);
            }
        };
        if let Err(err) = Self::ensure_unlocked(id, record) {
            if let Some(block) = block {
                allocator.release(block);
            }
            return Err(err);
        }

        record.clear();
        record.size = block.as_ref().map_or(0, RawBlock::len);
        record.block = block;
        record.allocator = allocator;
        record.last_access = stamp;

        debug!(%id, size = record.size, "buffer adopted");
        self.notify(ManagerEvent::Allocated(id));
        self.consult(EventKind::SetBuffer, Some(id));
        Ok(())
    }

    /// Adopt `path` as the dumped content of the buffer; the file is never
    /// deleted by the manager.
    ///
    /// In direct mode the file is read before the old content is released,
    /// so a bad file leaves the buffer as it was.
    pub fn adopt_file(
        &mut self,
        id: BufferId,
        path: PathBuf,
        size: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<()> {
        if size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        Self::ensure_unlocked(id, self.record(id)?)?;

        let loaded = match self.loading_mode {
            LoadingMode::Direct => {
                let mut block = allocator.allocate(size)?;
                if let Err(err) = read_dump(&path, size as u64, block.as_mut_slice()) {
                    allocator.release(block);
                    warn!(%id, path = %path.display(), error = %err, "adopted file unreadable");
                    return Err(err);
                }
                Some(block)
            }
            LoadingMode::Lazy => None,
        };

        let stamp = self.tick();
        let record = self.record_mut(id)?;
        record.clear();
        record.size = size;
        record.allocator = allocator;
        record.last_access = stamp;
        let restored = loaded.is_some();
        match loaded {
            Some(block) => record.block = Some(block),
            None => {
                record.loaded = false;
                record.backing = Some(BackingFile::borrowed(path));
            }
        }

        debug!(%id, size, restored, "file adopted");
        self.notify(ManagerEvent::Allocated(id));
        if restored {
            self.profiler.record_restore(size);
            self.notify(ManagerEvent::Restored(id));
        }
        self.consult(EventKind::SetBuffer, Some(id));
        Ok(())
    }

    pub fn reallocate(&mut self, id: BufferId, new_size: usize) -> Result<()> {
        let stamp = self.tick();
        let record = self.record_mut(id)?;
        if record.size == 0 {
            return Err(BufferError::NotAllocated(id));
        }
        if new_size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        Self::ensure_unlocked(id, record)?;

        if record.loaded {
            let allocator = Arc::clone(&record.allocator);
            let block = record.block.as_mut().ok_or(BufferError::NotAllocated(id))?;
            allocator.reallocate(block, new_size)?;
            record.size = new_size;
            record.last_access = stamp;
        } else {
            // Straight from the dump into the new size
            self.restore_into(id, Some(new_size))?;
        }

        debug!(%id, new_size, "buffer reallocated");
        self.profiler.record_reallocation();
        self.notify(ManagerEvent::Reallocated(id));
        self.consult(EventKind::Reallocate, Some(id));
        Ok(())
    }

    /// Release the content but keep the identity registered
    pub fn destroy(&mut self, id: BufferId) -> Result<()> {
        let stamp = self.tick();
        let record = self.record_mut(id)?;
        if record.lock_count > 0 {
            error!(%id, lock_count = record.lock_count, "attempt to destroy a locked buffer");
            return Err(BufferError::LockedBuffer {
                id,
                lock_count: record.lock_count,
            });
        }
        record.clear();
        record.last_access = stamp;

        self.notify(ManagerEvent::Destroyed(id));
        self.consult(EventKind::Destroy, Some(id));
        Ok(())
    }

    /// Exchange the content of two buffers without copying it
    pub fn swap(&mut self, a: BufferId, b: BufferId) -> Result<()> {
        if a == b {
            return self.record(a).map(|_| ());
        }
        let stamp = self.tick();
        let (ra, rb) = self.record_pair_mut(a, b)?;
        Self::ensure_unlocked(a, ra)?;
        Self::ensure_unlocked(b, rb)?;

        ra.swap_content(rb);
        ra.last_access = stamp;
        rb.last_access = stamp;

        self.notify(ManagerEvent::Swapped(a, b));
        Ok(())
    }

    // ---- locking ----

    pub fn lock(&mut self, id: BufferId) -> Result<LockGrant> {
        self.record(id)?;

        // The policy sees the buffer before it is pinned, so it may still
        // evict it; the restore below brings it straight back
        self.consult(EventKind::Lock, Some(id));

        let stamp = self.tick();
        let record = self.record_mut(id)?;
        record.lock_count += 1;
        record.last_access = stamp;

        if let Err(err) = self.restore_into(id, None) {
            if let Ok(record) = self.record_mut(id) {
                record.lock_count -= 1;
            }
            return Err(err);
        }
        self.profiler.record_lock();

        let record = self.record(id)?;
        Ok(LockGrant {
            ptr: record
                .block
                .as_ref()
                .map_or(std::ptr::null_mut(), RawBlock::as_ptr),
            len: record.size,
        })
    }

    pub fn unlock(&mut self, id: BufferId) -> Result<()> {
        let stamp = self.tick();
        let record = self.record_mut(id)?;
        if record.lock_count <= 0 {
            error!(%id, "unlock without a matching lock");
            return Ok(());
        }
        record.lock_count -= 1;
        record.last_access = stamp;

        self.profiler.record_unlock();
        self.consult(EventKind::Unlock, Some(id));
        Ok(())
    }

    // ---- dump / restore ----

    /// Dump file name prefix naming the record it belongs to
    fn dump_prefix(&self, id: BufferId) -> String {
        format!("{}{}-{}-", self.file_prefix, id.index(), id.generation())
    }

    /// Write the content to a fresh file and release the memory.
    ///
    /// Returns false when there was nothing to dump (empty or already dumped).
    pub fn dump(&mut self, id: BufferId) -> Result<bool> {
        let record = self.record(id)?;
        Self::ensure_unlocked(id, record)?;
        if !record.loaded || record.size == 0 {
            return Ok(false);
        }

        let prefix = self.dump_prefix(id);
        let dir = self.scratch.path().to_path_buf();
        let profiler = self.profiler.clone();
        let record = self.record_mut(id)?;
        let Some(block) = record.block.take() else {
            return Ok(false);
        };

        let path = match write_dump(&dir, &prefix, block.as_slice()) {
            Ok(path) => path,
            Err(err) => {
                record.block = Some(block);
                profiler.record_dump_failure();
                warn!(%id, dir = %dir.display(), error = %err, "dump failed, buffer kept");
                return Err(err.into());
            }
        };

        let size = record.size;
        record.allocator.release(block);
        record.loaded = false;
        record.backing = Some(BackingFile::owned(path));

        profiler.record_dump(size);
        debug!(%id, size, "buffer dumped");
        self.notify(ManagerEvent::Dumped(id));
        Ok(true)
    }

    /// Bring dumped content back into memory.
    ///
    /// Returns false when the buffer was already resident (or empty).
    pub fn restore(&mut self, id: BufferId) -> Result<bool> {
        self.restore_into(id, None)
    }

    /// Restore into a block of `new_size` bytes (the current size if None),
    /// keeping the leading `min(size, new_size)` bytes of the dump
    fn restore_into(&mut self, id: BufferId, new_size: Option<usize>) -> Result<bool> {
        let stamp = self.tick();
        let profiler = self.profiler.clone();
        let record = self.record_mut(id)?;
        if record.loaded || record.size == 0 {
            return Ok(false);
        }

        let expected = record.size as u64;
        let Some(backing) = record.backing.as_ref() else {
            return Err(BufferError::CorruptedDump {
                path: PathBuf::new(),
                expected,
                found: 0,
            });
        };

        let target = new_size.unwrap_or(record.size);
        let keep = target.min(record.size);
        let mut block = record.allocator.allocate(target)?;
        if let Err(err) = read_dump(&backing.path, expected, &mut block.as_mut_slice()[..keep]) {
            record.allocator.release(block);
            warn!(%id, error = %err, "restore failed, buffer stays dumped");
            return Err(err);
        }

        if let Some(file) = record.backing.take() {
            file.discard();
        }
        let restored = record.size;
        record.block = Some(block);
        record.size = target;
        record.loaded = true;
        record.last_access = stamp;

        profiler.record_restore(restored);
        debug!(%id, size = restored, "buffer restored");
        self.notify(ManagerEvent::Restored(id));
        Ok(true)
    }

    // ---- policy & configuration ----

    pub fn set_policy(&mut self, policy: Arc<dyn DumpPolicy>) {
        let name = policy.name();
        *self.policy.write() = policy;
        info!(policy = name, "dump policy installed");
        self.notify(ManagerEvent::PolicyChanged(name));
        self.consult(EventKind::Refresh, None);
    }

    pub fn loading_mode(&self) -> LoadingMode {
        self.loading_mode
    }

    pub fn set_loading_mode(&mut self, mode: LoadingMode) {
        self.loading_mode = mode;
    }

    pub fn subscribe(&mut self, tx: Sender<ManagerEvent>) {
        self.subscribers.push(tx);
    }

    // ---- queries ----

    pub fn lock_count(&self, id: BufferId) -> Result<i64> {
        Ok(self.record(id)?.lock_count)
    }

    pub fn size(&self, id: BufferId) -> Result<u64> {
        Ok(self.record(id)?.size as u64)
    }

    pub fn info(&self, id: BufferId) -> Result<BufferInfo> {
        Ok(self.record(id)?.info())
    }

    /// Content stream for writers; a dumped buffer is read from its file
    /// and stays dumped
    pub fn stream_info(&self, id: BufferId) -> Result<StreamInfo> {
        let record = self.record(id)?;
        let stream: Box<dyn Read + Send> = match (&record.backing, &record.block) {
            (Some(file), _) if !record.loaded => {
                let expected = record.size as u64;
                match File::open(&file.path) {
                    Ok(handle) => Box::new(io::BufReader::new(handle)),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        return Err(BufferError::CorruptedDump {
                            path: file.path.clone(),
                            expected,
                            found: 0,
                        })
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            (_, Some(block)) => Box::new(io::Cursor::new(block.as_slice().to_vec())),
            _ => Box::new(io::empty()),
        };

        Ok(StreamInfo {
            size: record.size as u64,
            backing_file: record.backing.as_ref().map(|f| f.path.clone()),
            stream,
        })
    }

    fn records(&self) -> impl Iterator<Item = (BufferId, &BufferRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record
                .as_ref()
                .map(|record| (BufferId::new(index as u32, slot.generation), record))
        })
    }

    pub fn stats(&self) -> BufferStats {
        self.records()
            .fold(BufferStats::default(), |mut stats, (_, record)| {
                stats.buffer_count += 1;
                stats.total_managed += record.size as u64;
                if !record.loaded {
                    stats.total_dumped += record.size as u64;
                }
                stats
            })
    }

    pub fn infos(&self) -> HashMap<BufferId, BufferInfo> {
        self.records()
            .map(|(id, record)| (id, record.info()))
            .collect()
    }

    /// Human-readable table of every record
    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "policy: {}  buffers: {}  managed: {} B  dumped: {} B",
            self.policy.read().name(),
            stats.buffer_count,
            stats.total_managed,
            stats.total_dumped
        );
        let _ = writeln!(
            out,
            "{:<10} {:>12} {:>7} {:>5} {:>8} {:<8} {:>18}  file",
            "id", "size", "loaded", "locks", "access", "alloc", "address"
        );
        for (id, record) in self.records() {
            let _ = writeln!(
                out,
                "{:<10} {:>12} {:>7} {:>5} {:>8} {:<8} {:>#18x}  {}",
                id.to_string(),
                record.size,
                record.loaded,
                record.lock_count,
                record.last_access,
                record.allocator.name(),
                record.address(),
                record
                    .backing
                    .as_ref()
                    .map(|f| f.path.display().to_string())
                    .unwrap_or_default()
            );
        }
        out
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut released = 0usize;
        for slot in &mut self.slots {
            if let Some(record) = slot.record.as_mut() {
                record.clear();
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "released buffers still registered at shutdown");
        }
    }
}

/// Write `data` to a newly created file in `dir` and return its path.
///
/// The file name is never reused, even by another manager sharing `dir`; a
/// partially written file is removed on error.
fn write_dump(dir: &Path, prefix: &str, data: &[u8]) -> io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".raw")
        .tempfile_in(dir)?;
    file.write_all(data)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|err| err.error)?;
    Ok(path)
}

/// Fill `buf` from the start of the file at `path`, which must hold exactly
/// `expected` bytes
fn read_dump(path: &Path, expected: u64, buf: &mut [u8]) -> Result<()> {
    let corrupted = |found: u64| BufferError::CorruptedDump {
        path: path.to_path_buf(),
        expected,
        found,
    };

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(corrupted(0)),
        Err(err) => return Err(err.into()),
    };
    let found = file.metadata()?.len();
    if found != expected {
        return Err(corrupted(found));
    }
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(corrupted(found)),
        Err(err) => Err(err.into()),
    }
}
