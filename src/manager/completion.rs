use crossbeam_channel::{Receiver, TryRecvError};

use crate::types::{BufferError, Result};

/// Result of an operation queued on the manager's worker.
///
/// Dropping a completion does not cancel the operation; it still runs in
/// queue order. There is no timeout: a slow disk only delays the answer.
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// Block until the operation has run
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(BufferError::ManagerStopped))
    }

    /// Take the result if the operation has already run.
    ///
    /// The result can only be taken once; later calls report `ManagerStopped`.
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(BufferError::ManagerStopped)),
        }
    }

    /// Whether the operation has completed and its result is waiting
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }
}
