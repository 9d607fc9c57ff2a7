//! Explicit handles to the two thread pools.
//!
//! The worker runtime runs protocol logic and scheduled storage tasks; the io
//! runtime's blocking pool performs every blocking file-system call. Both are
//! passed to constructors instead of being looked up globally.

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Executors {
    pub worker: Handle,
    pub io: Handle,
}

impl Executors {
    pub fn new(worker: Handle, io: Handle) -> Self {
        Self { worker, io }
    }

    /// Use the runtime of the calling task for both roles (tests, small tools).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        let handle = Handle::current();
        Self {
            worker: handle.clone(),
            io: handle,
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.worker.spawn(future)
    }

    pub fn spawn_io<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.io.spawn_blocking(f)
    }
}
