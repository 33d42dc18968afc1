use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::backend::{BufferAllocator, HeapAllocator, RawBlock};
use crate::policy::RecordView;
use crate::types::BufferId;

/// File holding the content of a dumped buffer
#[derive(Debug)]
pub(crate) struct BackingFile {
    pub path: PathBuf,

    /// Written by the manager (deleted once no longer needed) or adopted
    /// from the caller (never deleted)
    pub owned: bool,
}

impl BackingFile {
    pub fn owned(path: PathBuf) -> Self {
        Self { path, owned: true }
    }

    pub fn borrowed(path: PathBuf) -> Self {
        Self { path, owned: false }
    }

    /// Delete the file if the manager wrote it
    pub fn discard(self) {
        if !self.owned {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to delete dump file")
            }
        }
    }
}

/// Manager-side metadata and memory of one buffer
#[derive(Debug)]
pub(crate) struct BufferRecord {
    /// Current size in bytes (0 when empty)
    pub size: usize,

    /// Strategy that owns `block`
    pub allocator: Arc<dyn BufferAllocator>,

    /// Resident memory, None when empty or dumped
    pub block: Option<RawBlock>,

    /// False while the content only lives in `backing`
    pub loaded: bool,

    /// Present exactly while the record is dumped
    pub backing: Option<BackingFile>,

    /// Outstanding scoped locks
    pub lock_count: i64,

    /// Manager clock value at the last access
    pub last_access: u64,
}

impl BufferRecord {
    pub fn new() -> Self {
        Self {
            size: 0,
            allocator: Arc::new(HeapAllocator),
            block: None,
            loaded: true,
            backing: None,
            lock_count: 0,
            last_access: 0,
        }
    }

    /// Release memory and owned dump file, leaving an empty record
    pub fn clear(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.release(block);
        }
        if let Some(file) = self.backing.take() {
            file.discard();
        }
        self.size = 0;
        self.loaded = true;
    }

    /// Exchange content with `other`; lock counts and identities stay put
    pub fn swap_content(&mut self, other: &mut BufferRecord) {
        std::mem::swap(&mut self.size, &mut other.size);
        std::mem::swap(&mut self.allocator, &mut other.allocator);
        std::mem::swap(&mut self.block, &mut other.block);
        std::mem::swap(&mut self.loaded, &mut other.loaded);
        std::mem::swap(&mut self.backing, &mut other.backing);
    }

    pub fn address(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.as_ptr() as usize)
    }

    pub fn view(&self, id: BufferId) -> RecordView {
        RecordView {
            id,
            size: self.size as u64,
            loaded: self.loaded,
            lock_count: self.lock_count,
            last_access: self.last_access,
        }
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            size: self.size as u64,
            loaded: self.loaded,
            lock_count: self.lock_count,
            last_access: self.last_access,
            backing_file: self.backing.as_ref().map(|f| f.path.clone()),
            allocator: Arc::clone(&self.allocator),
            address: self.address(),
        }
    }
}

/// Snapshot of one record, as returned by `BufferManager::buffer_infos`
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub size: u64,
    pub loaded: bool,
    pub lock_count: i64,
    pub last_access: u64,
    pub backing_file: Option<PathBuf>,
    pub allocator: Arc<dyn BufferAllocator>,
    /// Resident address, 0 when empty or dumped
    pub address: usize,
}

/// Readable view of a buffer's content, resident or dumped.
///
/// Obtaining it never restores a dumped buffer: the stream reads the dump
/// file directly, or a copy of the resident bytes.
pub struct StreamInfo {
    pub size: u64,
    /// Dump or adopted file, present while the buffer is not resident
    pub backing_file: Option<PathBuf>,
    pub stream: Box<dyn Read + Send>,
}

impl std::fmt::Debug for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInfo")
            .field("size", &self.size)
            .field("backing_file", &self.backing_file)
            .finish_non_exhaustive()
    }
}

/// Byte totals across every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub buffer_count: usize,
    pub total_managed: u64,
    pub total_dumped: u64,
}

/// Change notifications delivered to subscribers, in queue order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    Registered(BufferId),
    Allocated(BufferId),
    Reallocated(BufferId),
    Destroyed(BufferId),
    Swapped(BufferId, BufferId),
    Dumped(BufferId),
    Restored(BufferId),
    Unregistered(BufferId),
    PolicyChanged(&'static str),
}
