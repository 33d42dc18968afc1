mod byte_size;
#[allow(clippy::module_inception)]
mod types;

pub use byte_size::ByteSize;
pub use types::{BufferError, BufferId, LoadingMode, ManagerConfig, Result};
