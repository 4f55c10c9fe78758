//! Releases error events held back while a create or close operation of the
//! emitting entity is in flight.
//!
//! Deferred emissions are queued per entity. Each queue is drained in order
//! by its own task, so one entity's pending operation never delays the
//! events of another.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc};

use crate::util::PendingOperations;

struct Deferred {
    pending: PendingOperations,
    emit: Box<dyn FnOnce() + Send>,
}

type Queues = Mutex<HashMap<usize, mpsc::UnboundedSender<Deferred>>>;

/// Per-entity queues of deferred emissions on one connection
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    runtime: Handle,
    queues: Arc<Queues>,
}

impl Dispatcher {
    pub fn new(runtime: &Handle) -> Self {
        Self {
            runtime: runtime.clone(),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `emit` once the operations counted by `pending` have settled,
    /// after every emission deferred earlier for the same entity
    pub fn defer(&self, pending: PendingOperations, emit: impl FnOnce() + Send + 'static) {
        let key = pending.key();
        let mut deferred = Deferred {
            pending,
            emit: Box::new(emit),
        };

        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&key) {
            match queue.send(deferred) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => deferred = returned,
            }
        }

        let (queue, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the task below exits
        let _ = queue.send(deferred);
        queues.insert(key, queue);
        drop(queues);

        self.runtime.spawn(drain(key, Arc::downgrade(&self.queues), rx));
    }

    #[cfg(test)]
    fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

/// Drains the queue of one entity, and removes it once it runs empty
async fn drain(key: usize, queues: Weak<Queues>, mut rx: mpsc::UnboundedReceiver<Deferred>) {
    loop {
        let next = match rx.try_recv() {
            Ok(deferred) => deferred,
            Err(_) => {
                let registry = match queues.upgrade() {
                    Some(registry) => registry,
                    None => return,
                };
                // Checked again under the lock `defer` sends under
                let mut queues = registry.lock();
                match rx.try_recv() {
                    Ok(deferred) => deferred,
                    Err(_) => {
                        queues.remove(&key);
                        return;
                    }
                }
            }
        };
        next.pending.settled().await;
        (next.emit)();
    }
}
