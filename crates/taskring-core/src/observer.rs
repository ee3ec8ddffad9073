//! Task lifecycle observers.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::task::{CompletionCallback, TaskCompletion, TaskKind};
use crate::types::{LogicalTaskId, StreamId};

/// Receives task lifecycle events.
///
/// Called from engine threads (or the submitting thread for the direct
/// engine) with no stream lock held.
pub trait TaskObserver: Send + Sync {
    /// A task was written to its ring.
    fn task_launched(&self, _stream_id: StreamId, _task_id: LogicalTaskId, _kind: TaskKind) {}

    /// A task retired.
    fn task_finished(&self, _completion: &TaskCompletion) {}
}

/// A retired task whose notifications have not been delivered yet.
///
/// Produced under the synchronization lock, delivered after it is released.
pub struct FinishedTask {
    /// Outcome.
    pub completion: TaskCompletion,
    /// Per-task callback.
    pub callback: Option<CompletionCallback>,
}

impl std::fmt::Debug for FinishedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishedTask")
            .field("completion", &self.completion)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Registered observers.
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn TaskObserver>>>,
}

impl ObserverSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    pub fn register(&self, observer: Arc<dyn TaskObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// True if nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Announce a launch.
    pub fn launched(&self, stream_id: StreamId, task_id: LogicalTaskId, kind: TaskKind) {
        for observer in self.observers.read().iter() {
            observer.task_launched(stream_id, task_id, kind);
        }
    }

    /// Deliver callbacks and observer notifications for retired tasks.
    pub fn deliver(&self, finished: Vec<FinishedTask>) {
        if finished.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for task in finished {
            if let Some(callback) = task.callback {
                callback(&task.completion);
            }
            for observer in &observers {
                observer.task_finished(&task.completion);
            }
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}
