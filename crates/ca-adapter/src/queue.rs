//! Asynchronous send queue
//!
//! A FIFO with a single consumer task. Producers append without blocking; the
//! worker wakes, takes every item queued so far and runs each one through a
//! [`QueueHandler`] before sleeping again. Stopping the queue rejects new items
//! but lets the worker finish one last full drain before it exits.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ca_core::{CaError, CaResult};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Processes items taken off a [`SendQueue`]
#[async_trait]
pub trait QueueHandler<T>: Send + Sync {
    async fn process(&self, item: T);
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    wake: Notify,
    capacity: usize,
}

impl<T> QueueShared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Send Queue
// ----------------------------------------------------------------------------

/// Bounded FIFO dispatch queue with one worker task
pub struct SendQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for SendQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> SendQueue<T> {
    /// Create an open queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    stopped: false,
                }),
                wake: Notify::new(),
                capacity,
            }),
        }
    }

    /// Append an item and wake the worker
    pub fn enqueue(&self, item: T) -> CaResult<()> {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(CaError::QueueClosed);
            }
            if state.items.len() >= self.shared.capacity {
                return Err(CaError::QueueFull {
                    capacity: self.shared.capacity,
                });
            }
            state.items.push_back(item);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Reject further items and tell the worker to exit after a final drain
    ///
    /// Never waits for the worker, so it is safe to call from a handler.
    pub fn stop(&self) {
        let newly_stopped = {
            let mut state = self.shared.lock();
            !mem::replace(&mut state.stopped, true)
        };
        if newly_stopped {
            debug!("Send queue stopping");
            self.shared.wake.notify_one();
        }
    }

    /// Accept items again after [`stop`](Self::stop)
    ///
    /// Callers must have joined the previous worker first.
    pub fn reopen(&self) {
        self.shared.lock().stopped = false;
    }

    /// Drop every queued item, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut state = self.shared.lock();
        let dropped = state.items.len();
        state.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Spawn the consumer task on `runtime`
    pub fn spawn_worker<H>(&self, runtime: &Handle, handler: H) -> WorkerHandle
    where
        H: QueueHandler<T> + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(async move {
            loop {
                let (batch, stopped) = {
                    let mut state = shared.lock();
                    (mem::take(&mut state.items), state.stopped)
                };

                if !batch.is_empty() {
                    debug!("Send worker draining {} item(s)", batch.len());
                    for item in batch {
                        handler.process(item).await;
                    }
                    continue;
                }

                if stopped {
                    break;
                }

                shared.wake.notified().await;
            }
            debug!("Send worker exited");
        });

        WorkerHandle { task }
    }
}

// ----------------------------------------------------------------------------
// Worker Handle
// ----------------------------------------------------------------------------

/// Owned handle to a running send worker
pub struct WorkerHandle {
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait for the worker to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Send worker ended abnormally: {}", e);
        }
    }

    /// Wait up to `grace` for the worker, aborting it if it is still running
    ///
    /// Returns `true` when the worker exited on its own.
    pub async fn join_within(mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Send worker ended abnormally: {}", e);
                true
            }
            Err(_) => {
                warn!("Send worker still busy after {:?}, aborting", grace);
                self.task.abort();
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the worker without waiting for its drain
    pub fn abort(&self) {
        self.task.abort();
    }
}
