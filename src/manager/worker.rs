//! The single thread every manager operation runs on.
//!
//! Tasks are applied strictly in submission order, which is what gives the
//! dump policy a coherent view of all records.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use crate::manager::completion::Completion;
use crate::manager::registry::Registry;
use crate::types::Result;

pub(crate) type Task = Box<dyn FnOnce(&mut Registry) + Send>;

/// Owns the worker thread and the sending side of its queue
pub(crate) struct Worker {
    /// Closed on drop so the thread drains the queue and exits
    sender: Option<Sender<Task>>,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start the worker thread, which takes ownership of the registry
    pub fn spawn(name: String, mut registry: Registry) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        let thread = thread::Builder::new().name(name).spawn(move || {
            for task in receiver {
                task(&mut registry);
            }
            debug!("buffer manager worker stopped");
        })?;

        Ok(Self {
            sender: Some(sender),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue `f` and return a completion for its result
    pub fn post<T, F>(&self, f: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Registry) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task: Task = Box::new(move |registry| {
            // The caller may have dropped its completion
            let _ = tx.send(f(registry));
        });

        // A stopped worker drops the task, which disconnects the completion
        if let Some(sender) = &self.sender {
            let _ = sender.send(task);
        }

        Completion::new(rx)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.sender.take();

        if let Some(thread) = self.thread.lock().take() {
            // Never join ourselves
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("buffer manager worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("running", &self.sender.is_some())
            .finish()
    }
}
