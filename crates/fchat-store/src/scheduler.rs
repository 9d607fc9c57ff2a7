//! Per-key multi-reader / single-writer task scheduling.
//!
//! For every key the scheduler keeps an ordered list of layers:
//!
//! ```text
//! key ─► [read: r1 r2 r5] ─► [write: w3] ─► [read: r4 r6]
//!         (running)           (gated)        (gated)
//! ```
//!
//! - a read joins the trailing layer if that layer is a read layer,
//!   otherwise it opens a new read layer;
//! - a write always opens a new layer holding only itself;
//! - only the head layer runs; it is popped once every task that joined it
//!   has finished, which opens the gates of the next layer.
//!
//! Placement happens synchronously when `read`/`write` is called, so the
//! order of calls is the order of execution. Tasks for different keys never
//! wait on each other. A key is dropped from the registry as soon as its last
//! layer drains.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug)]
struct Layer {
    access: Access,
    /// Tasks that joined this layer and have not finished yet.
    outstanding: usize,
    /// Gates of joined tasks waiting for this layer to reach the head.
    gates: Vec<oneshot::Sender<()>>,
}

impl Layer {
    fn new(access: Access) -> Self {
        Self {
            access,
            outstanding: 0,
            gates: Vec::new(),
        }
    }
}

type Registry<K> = HashMap<K, VecDeque<Layer>>;

#[derive(Debug)]
pub struct Scheduler<K> {
    registry: Arc<Mutex<Registry<K>>>,
    runtime: Handle,
}

impl<K> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            runtime: self.runtime.clone(),
        }
    }
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(runtime: Handle) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            runtime,
        }
    }

    /// Run `task` concurrently with other reads of `key`, excluded from writes.
    pub fn read<F>(&self, key: K, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.schedule(key, Access::Read, task)
    }

    /// Run `task` alone: no other task for `key` overlaps it.
    pub fn write<F>(&self, key: K, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.schedule(key, Access::Write, task)
    }

    /// Number of keys with pending or running layers.
    pub fn key_count(&self) -> usize {
        lock(&self.registry).len()
    }

    fn schedule<F>(&self, key: K, access: Access, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let gate = self.enqueue(&key, access);
        let registry = Arc::clone(&self.registry);

        self.runtime.spawn(async move {
            if let Some(gate) = gate {
                // A dropped sender only happens on teardown; run anyway.
                let _ = gate.await;
            }
            let _release = Release { registry, key };
            task.await
        })
    }

    /// Place a task in the layer list of `key`. Returns `None` when the task
    /// belongs to the head layer and may start right away.
    fn enqueue(&self, key: &K, access: Access) -> Option<oneshot::Receiver<()>> {
        let mut registry = lock(&self.registry);
        let layers = registry.entry(key.clone()).or_default();

        let joins_trailing = access == Access::Read
            && matches!(layers.back(), Some(layer) if layer.access == Access::Read);
        if !joins_trailing {
            layers.push_back(Layer::new(access));
        }

        let is_head = layers.len() == 1;
        let layer = layers.back_mut()?;
        layer.outstanding += 1;

        if is_head {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            layer.gates.push(tx);
            Some(rx)
        }
    }
}

/// Marks one task of the head layer as finished when dropped, including
/// when the task panics.
struct Release<K: Eq + Hash> {
    registry: Arc<Mutex<Registry<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for Release<K> {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        let Some(layers) = registry.get_mut(&self.key) else {
            return;
        };

        if let Some(head) = layers.front_mut() {
            head.outstanding = head.outstanding.saturating_sub(1);
            if head.outstanding == 0 {
                layers.pop_front();
                if let Some(next) = layers.front_mut() {
                    for gate in next.gates.drain(..) {
                        let _ = gate.send(());
                    }
                }
            }
        }

        if layers.is_empty() {
            registry.remove(&self.key);
        }
    }
}

fn lock<K>(registry: &Mutex<Registry<K>>) -> MutexGuard<'_, Registry<K>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
