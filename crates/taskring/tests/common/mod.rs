//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use taskring::prelude::*;

/// Install a subscriber honouring `RUST_LOG`. Repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small, fast-polling configuration.
pub fn config(strategy: EngineStrategy, depth: u32) -> TaskRingConfig {
    TaskRingConfig::builder()
        .with_strategy(strategy)
        .with_ring_depth(depth)
        .with_admission_timeout(Duration::from_millis(100))
        .with_sync_timeout(Duration::from_secs(5))
        .with_completion_poll_interval(Duration::from_millis(2))
        .with_sender_wait_slice(Duration::from_millis(5))
        .build()
        .expect("valid config")
}

/// A ring over `sim`.
pub fn ring(sim: &Arc<SimDriver>, config: TaskRingConfig) -> TaskRing {
    init_tracing();
    TaskRing::builder()
        .config(config)
        .driver(sim.clone())
        .build()
        .expect("device opens")
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Callback that records the outcome of every task it is attached to.
#[derive(Clone, Default)]
pub struct Outcomes {
    inner: Arc<Mutex<Vec<TaskCompletion>>>,
}

impl Outcomes {
    pub fn callback(&self) -> CompletionCallback {
        let inner = self.inner.clone();
        Box::new(move |completion| inner.lock().push(completion.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn ids(&self) -> Vec<LogicalTaskId> {
        self.inner.lock().iter().map(|c| c.task_id).collect()
    }

    pub fn get(&self, id: LogicalTaskId) -> Option<TaskCompletion> {
        self.inner.lock().iter().find(|c| c.task_id == id).cloned()
    }
}

/// Observer counting lifecycle events.
#[derive(Default)]
pub struct Counter {
    pub launched: AtomicUsize,
    pub finished: AtomicUsize,
    pub failed: AtomicUsize,
}

impl Counter {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

impl TaskObserver for Counter {
    fn task_launched(&self, _: StreamId, _: LogicalTaskId, _: TaskKind) {
        self.launched.fetch_add(1, Ordering::SeqCst);
    }

    fn task_finished(&self, completion: &TaskCompletion) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        if completion.result.is_err() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
