use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Stable identity of one managed buffer.
///
/// Slot index plus generation stamp: a recycled slot gets a new generation,
/// so an identity held after its record was removed never aliases a new one.
/// Total size: 8 bytes, cheap to copy into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    /// Slot index in the manager's record table
    pub(crate) index: u32,

    /// Generation counter for ABA problem prevention
    pub(crate) generation: u32,
}

impl BufferId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Get the slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get the generation counter
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// When content adopted from an existing file becomes resident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingMode {
    /// Read the file as soon as it is adopted
    Direct,

    /// Leave the record dumped until its first lock
    #[default]
    Lazy,
}

/// Configuration for a buffer manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory receiving dump files (default: None, a fresh temp dir
    /// that is removed when the manager shuts down)
    pub scratch_dir: Option<PathBuf>,

    /// File name prefix for dump files (default: "buffer-")
    pub file_prefix: String,

    /// Loading mode for adopted files (default: Lazy)
    pub loading_mode: LoadingMode,

    /// Name of the worker thread (default: "buffer-manager")
    pub worker_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            file_prefix: "buffer-".to_string(),
            loading_mode: LoadingMode::Lazy,
            worker_name: "buffer-manager".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Dump into a caller-chosen directory (created if missing, never removed)
    pub fn with_scratch_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Restore adopted files eagerly
    pub fn eager() -> Self {
        Self {
            loading_mode: LoadingMode::Direct,
            ..Default::default()
        }
    }
}

/// Errors that can occur in the buffer manager
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Cannot allocate a zero-sized buffer")]
    ZeroSizeAllocation,

    #[error("Out of memory (failed to allocate {size} bytes)")]
    OutOfMemory { size: usize },

    #[error("Buffer {0} has not been allocated")]
    NotAllocated(BufferId),

    #[error("Buffer {id} is locked ({lock_count} outstanding locks)")]
    LockedBuffer { id: BufferId, lock_count: i64 },

    #[error("Corrupted dump {path:?} (expected {expected} bytes, found {found})")]
    CorruptedDump {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("Invalid value {value:?} for parameter {name:?}")]
    InvalidParam { name: String, value: String },

    #[error("Unknown buffer {0} (never registered or already released)")]
    UnknownBuffer(BufferId),

    #[error("Buffer manager worker has stopped")]
    ManagerStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BufferError>;
