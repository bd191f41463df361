//! Task management support

use std::future::Future;
use tokio::{runtime::Handle, task::JoinHandle};

/// A helper struct for managing additional tokio tasks.
pub struct TaskManager {
    /// Tokio runtime handle that's used to spawn futures, See [tokio::runtime::Handle].
    tokio_handle: Handle,
}

// === impl TaskManager ===

impl TaskManager {
    /// Creates a new instance of the task manager
    pub fn new(tokio_handle: Handle) -> Self {
        Self { tokio_handle }
    }

    /// Spawns the given task.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
        self.tokio_handle.spawn(async move { task.await })
    }
}
