//! Owned handles for engine tasks.
//!
//! Timers, DNS requests, connect attempts, accept loops and connection I/O
//! all run as tokio tasks. An [`OwnedTask`] is the only reference the engine
//! keeps to such a task: it cannot be cloned, moving it transfers ownership,
//! and dropping it aborts the task. A task is therefore released exactly once,
//! when it leaves the collection that owns it.

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Move-only handle to a spawned task that aborts it on drop.
#[derive(Debug)]
pub struct OwnedTask {
    handle: JoinHandle<()>,
}

impl OwnedTask {
    /// Spawn a future on the given runtime.
    pub fn spawn<F>(runtime: &Handle, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: runtime.spawn(future),
        }
    }

    /// Check whether the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for OwnedTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
