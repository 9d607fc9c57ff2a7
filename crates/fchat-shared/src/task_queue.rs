//! Serializes asynchronous steps into one logical thread of control.
//!
//! ```text
//! submit(a) ─► [a] ─► done ─► [b] ─► done ─► [c]
//! submit(b) ───────────────────┘              │
//! submit(c) ──────────────────────────────────┘
//! ```
//!
//! The position of a step is fixed when `submit` returns, not when the
//! returned handle is first polled, so the order seen by the queue is the
//! order of the `submit` calls. Each step is spawned immediately and waits for
//! its predecessor to finish (normally, with an error, or by panicking).

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TaskQueue {
    runtime: Handle,
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    pending: Arc<()>,
}

impl TaskQueue {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tail: Mutex::new(None),
            pending: Arc::new(()),
        }
    }

    /// Append a step. It starts once every previously submitted step is done.
    pub fn submit<F>(&self, step: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = self
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(done_rx);
        let pending = Arc::clone(&self.pending);

        self.runtime.spawn(async move {
            // Dropping the predecessor's sender counts as completion too.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let output = step.await;
            drop(done_tx);
            drop(pending);
            output
        })
    }

    /// True when no submitted step is waiting or running.
    pub fn is_idle(&self) -> bool {
        Arc::strong_count(&self.pending) == 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_steps_run_in_submission_order() {
        let queue = TaskQueue::new(Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = {
            let log = log.clone();
            queue.submit(async move {
                let _ = release_rx.await;
                log.lock().unwrap().push(1);
            })
        };

        let mut rest = Vec::new();
        for i in 2..=5 {
            let log = log.clone();
            rest.push(queue.submit(async move {
                log.lock().unwrap().push(i);
            }));
        }

        assert!(!queue.is_idle());
        release_tx.send(()).unwrap();

        first.await.unwrap();
        for handle in rest {
            handle.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_steps_never_overlap() {
        let queue = TaskQueue::new(Handle::current());
        let running = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let running = running.clone();
                queue.submit(async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_panicking_step_releases_queue() {
        let queue = TaskQueue::new(Handle::current());

        let failed = queue.submit(async { panic!("step failed") });
        let next = queue.submit(async { 42 });

        assert!(failed.await.unwrap_err().is_panic());
        assert_eq!(next.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_step_returns_value() {
        let queue = TaskQueue::new(Handle::current());
        let result: Result<u8, &str> = queue.submit(async { Err("nope") }).await.unwrap();
        assert_eq!(result, Err("nope"));
    }
}
