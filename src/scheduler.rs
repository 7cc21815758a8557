//! Delayed, cancellable background tasks.
//!
//! Tasks are keyed by purpose so that scheduling a new refresh or poll for a
//! provider replaces the old one instead of piling up. A task that has fired
//! leaves the pending map (it may reschedule its own key) but stays
//! cancellable, by key or by provider, until its operation finishes.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// What a scheduled task is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Auto-refresh of a provider's credential.
    Refresh(String),
    /// Device code poll for a provider.
    Poll(String),
    /// A one-shot network request started by `authorize`.
    Request(String),
}

impl TaskKey {
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Refresh(id) | Self::Poll(id) | Self::Request(id) => id,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refresh(id) => write!(f, "refresh:{}", id),
            Self::Poll(id) => write!(f, "poll:{}", id),
            Self::Request(id) => write!(f, "request:{}", id),
        }
    }
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    token: CancellationToken,
}

impl TaskHandle {
    /// Cancel the task. Pending tasks never run; running ones are dropped at
    /// their next await point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Default)]
struct Tasks {
    next_id: u64,
    pending: HashMap<TaskKey, TaskHandle>,
    running: HashMap<u64, (TaskKey, TaskHandle)>,
}

/// Spawns operations on the tokio runtime after a delay.
#[derive(Clone, Default)]
pub struct Scheduler {
    tasks: Arc<Mutex<Tasks>>,
}

fn lock(tasks: &Mutex<Tasks>) -> MutexGuard<'_, Tasks> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` after `after`, replacing any task under `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: TaskKey, after: Duration, operation: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let operation: BoxFuture<'static, ()> = operation.boxed();

        // Held across spawn so the task cannot fire before it is registered.
        let mut tasks = lock(&self.tasks);
        tasks.next_id += 1;
        let handle = TaskHandle {
            id: tasks.next_id,
            token: CancellationToken::new(),
        };
        if let Some(previous) = tasks.pending.insert(key.clone(), handle.clone()) {
            previous.cancel();
        }
        trace!(task = %key, delay_ms = after.as_millis() as u64, "scheduled");

        let registry = Arc::clone(&self.tasks);
        let own = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = own.token.cancelled() => return,
                _ = tokio::time::sleep(after) => {}
            }

            {
                let mut tasks = lock(&registry);
                let current = tasks.pending.get(&key).map(|h| h.id);
                if current != Some(own.id) || own.is_cancelled() {
                    return;
                }
                tasks.pending.remove(&key);
                tasks.running.insert(own.id, (key.clone(), own.clone()));
            }

            trace!(task = %key, "running");
            // Cancellation wins over a ready operation once requested.
            tokio::select! {
                biased;
                _ = own.token.cancelled() => trace!(task = %key, "cancelled while running"),
                _ = operation => {}
            }

            lock(&registry).running.remove(&own.id);
        });

        handle
    }

    /// Cancel the pending task under `key` and any running one with the same
    /// key. Returns whether anything was cancelled.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let mut tasks = lock(&self.tasks);
        let mut cancelled = false;
        if let Some(handle) = tasks.pending.remove(key) {
            handle.cancel();
            cancelled = true;
        }
        tasks.running.retain(|_, (running, handle)| {
            if *running == *key {
                handle.cancel();
                cancelled = true;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Cancel the pending task under `key`, leaving a running one alone.
    pub fn cancel_pending(&self, key: &TaskKey) -> bool {
        match lock(&self.tasks).pending.remove(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending and running task for a provider.
    pub fn cancel_provider(&self, provider_id: &str) {
        let mut tasks = lock(&self.tasks);
        tasks.pending.retain(|key, handle| {
            if key.provider_id() == provider_id {
                handle.cancel();
                false
            } else {
                true
            }
        });
        tasks.running.retain(|_, (key, handle)| {
            if key.provider_id() == provider_id {
                handle.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Cancel everything, pending and running.
    pub fn cancel_all(&self) {
        let mut tasks = lock(&self.tasks);
        for (_, handle) in tasks.pending.drain() {
            handle.cancel();
        }
        for (_, (_, handle)) in tasks.running.drain() {
            handle.cancel();
        }
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        lock(&self.tasks).pending.contains_key(key)
    }

    /// Number of tasks waiting to fire.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).pending.len()
    }

    /// Number of tasks whose operation is underway.
    pub fn running(&self) -> usize {
        lock(&self.tasks).running.len()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = lock(&self.tasks);
        f.debug_struct("Scheduler")
            .field("pending", &tasks.pending.len())
            .field("running", &tasks.running.len())
            .finish()
    }
}
