//! Dispatch engines.
//!
//! Two strategies share one [`EngineContext`]:
//!
//! * [`ThreadedEngine`]: callers stage tasks on a channel; a sender
//!   thread writes them to the rings and a receiver thread drains the
//!   device's completion ring.
//! * [`DirectEngine`]: no background threads; the calling thread writes
//!   commands and reconciles completions inline whenever it needs space or
//!   waits.

mod direct;
mod threaded;

pub use direct::DirectEngine;
pub use threaded::ThreadedEngine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::{EngineStrategy, TaskRingConfig};
use crate::driver::{CompletionRecord, Driver};
use crate::error::{AdmissionError, DriverError, ExecutionError, SyncError, TaskRingError};
use crate::failure::AbortCause;
use crate::flow::AdmissionDecision;
use crate::observer::{FinishedTask, ObserverSet};
use crate::reconcile::Reconciler;
use crate::ring::RingPos;
use crate::stream::{Admitted, Stream, SubmitGuard};
use crate::task::{CompletionCallback, TaskPayload};
use crate::types::{LogicalTaskId, StreamId};

// ============================================================================
// Requests and statistics
// ============================================================================

/// A task to submit.
pub struct SubmitRequest {
    /// Contents.
    pub payload: TaskPayload,
    /// Callback run once when the task retires.
    pub callback: Option<CompletionCallback>,
}

impl SubmitRequest {
    /// Request without a callback.
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            callback: None,
        }
    }

    /// Attach a callback.
    #[must_use]
    pub fn with_callback(mut self, callback: CompletionCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl std::fmt::Debug for SubmitRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitRequest")
            .field("payload", &self.payload)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Tasks written to rings.
    pub tasks_issued: u64,
    /// `RingFull` results from the driver.
    pub ring_full_retries: u64,
    /// Times the sender parked waiting for reclaimed space.
    pub sender_waits: u64,
    /// Completion records read.
    pub reports_received: u64,
    /// Records for streams that no longer exist.
    pub reports_unrouted: u64,
    /// Inline reconciliation sweeps (direct engine).
    pub sweeps: u64,
}

#[derive(Default)]
pub(crate) struct EngineStatsInner {
    pub(crate) tasks_issued: AtomicU64,
    pub(crate) ring_full_retries: AtomicU64,
    pub(crate) sender_waits: AtomicU64,
    pub(crate) reports_received: AtomicU64,
    pub(crate) reports_unrouted: AtomicU64,
    pub(crate) sweeps: AtomicU64,
}

/// Kind of relief an admission needs before it is asked again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Relief {
    /// Reconcile what has already arrived.
    Sweep,
    /// Wait until ring or arena space is reclaimed.
    Space,
    /// Wait until the stream is empty.
    Drain,
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancellation flag checked at every blocking point of the engine threads.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake sleepers.
    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cv.notify_all();
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleep up to `timeout`; returns true if cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut cancelled = self.cancelled.lock();
        if !*cancelled {
            self.cv.wait_for(&mut cancelled, timeout);
        }
        *cancelled
    }
}

/// Wakes a parked sender when the receiver reclaims ring space.
#[derive(Debug, Default)]
pub(crate) struct ReclaimSignal {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl ReclaimSignal {
    /// Current generation; pass it to [`ReclaimSignal::wait`].
    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Announce reclaimed space.
    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.cv.notify_all();
    }

    /// Wait until the generation moves past `seen` or `timeout` passes.
    pub(crate) fn wait(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cv.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}

// ============================================================================
// Engine trait
// ============================================================================

/// Completion predicate used by [`Engine::wait`].
pub type WaitCondition<'a> = &'a dyn Fn(&Stream) -> Option<Result<(), SyncError>>;

/// A dispatch strategy.
pub trait Engine: Send + Sync {
    /// Strategy implemented.
    fn strategy(&self) -> EngineStrategy;

    /// Shared state.
    fn context(&self) -> &Arc<EngineContext>;

    /// Admit a task and hand it to the hardware.
    fn submit(
        &self,
        stream: &Arc<Stream>,
        request: SubmitRequest,
    ) -> Result<LogicalTaskId, TaskRingError>;

    /// Block until `done` yields a result or `timeout` passes.
    fn wait(
        &self,
        stream: &Arc<Stream>,
        timeout: Duration,
        done: WaitCondition<'_>,
    ) -> Result<(), SyncError>;

    /// Stop background work. Further submissions fail.
    fn shutdown(&self);

    /// Wait until `up_to` (or everything admitted) retired and report the
    /// stream's recorded error, if any.
    fn synchronize(
        &self,
        stream: &Arc<Stream>,
        up_to: Option<LogicalTaskId>,
        timeout: Duration,
    ) -> Result<(), SyncError> {
        let ctx = self.context();
        self.wait(stream, timeout, &|s: &Stream| ctx.sync_status(s, up_to))
    }

    /// Wait until one task retired, ignoring the stream's failure state.
    fn wait_task(
        &self,
        stream: &Arc<Stream>,
        id: LogicalTaskId,
        timeout: Duration,
    ) -> Result<(), SyncError> {
        let ctx = self.context();
        self.wait(stream, timeout, &|s: &Stream| ctx.task_status(s, id))
    }

    /// Statistics.
    fn stats(&self) -> EngineStats {
        self.context().stats()
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// State shared by the engine, the device and the control channel.
pub struct EngineContext {
    driver: Arc<dyn Driver>,
    config: TaskRingConfig,
    reconciler: Reconciler,
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
    observers: ObserverSet,
    transport_down: AtomicBool,
    transport_reason: Mutex<Option<String>>,
    device_aborting: AtomicBool,
    pub(crate) stats: EngineStatsInner,
}

impl EngineContext {
    /// Create a context.
    pub fn new(driver: Arc<dyn Driver>, config: TaskRingConfig) -> Self {
        Self {
            driver,
            reconciler: Reconciler::new(config.reconcile.retry_limit),
            config,
            streams: RwLock::new(HashMap::new()),
            observers: ObserverSet::new(),
            transport_down: AtomicBool::new(false),
            transport_reason: Mutex::new(None),
            device_aborting: AtomicBool::new(false),
            stats: EngineStatsInner::default(),
        }
    }

    /// Driver handle.
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Configuration.
    pub fn config(&self) -> &TaskRingConfig {
        &self.config
    }

    /// Registered observers.
    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// Look up a stream.
    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.read().get(&id).cloned()
    }

    /// All streams.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    /// Stream ids, sorted.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn insert_stream(&self, stream: Arc<Stream>) {
        self.streams.write().insert(stream.id(), stream);
    }

    pub(crate) fn remove_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.write().remove(&id)
    }

    /// Returns true once the transport is gone.
    pub fn is_transport_down(&self) -> bool {
        self.transport_down.load(Ordering::Acquire)
    }

    /// Returns true while some abort-on-failure stream has failed.
    pub fn is_device_aborting(&self) -> bool {
        self.device_aborting.load(Ordering::Acquire)
    }

    /// Set the device-wide abort flag.
    pub fn set_device_aborting(&self) {
        if !self.device_aborting.swap(true, Ordering::AcqRel) {
            tracing::error!("device abort raised");
        }
    }

    /// Clear the device-wide abort flag once no stream is aborted.
    pub fn clear_device_aborting(&self) {
        let any_aborted = self
            .streams
            .read()
            .values()
            .any(|s| s.failure().is_aborted());
        if !any_aborted && self.device_aborting.swap(false, Ordering::AcqRel) {
            tracing::info!("device abort cleared");
        }
    }

    fn transport_error(&self) -> SyncError {
        SyncError::TransportDown(
            self.transport_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "transport down".to_string()),
        )
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tasks_issued: self.stats.tasks_issued.load(Ordering::Relaxed),
            ring_full_retries: self.stats.ring_full_retries.load(Ordering::Relaxed),
            sender_waits: self.stats.sender_waits.load(Ordering::Relaxed),
            reports_received: self.stats.reports_received.load(Ordering::Relaxed),
            reports_unrouted: self.stats.reports_unrouted.load(Ordering::Relaxed),
            sweeps: self.stats.sweeps.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Run the flow controller until the task is allocated.
    ///
    /// The submission lock is released while `relieve` runs so the engine can
    /// issue and reconcile. Returns with the lock held.
    pub(crate) fn admit<'s>(
        &self,
        stream: &'s Stream,
        request: SubmitRequest,
        relieve: &mut dyn FnMut(&'s Stream, Relief, Instant) -> Result<(), TaskRingError>,
    ) -> Result<(SubmitGuard<'s>, Admitted), TaskRingError> {
        let SubmitRequest {
            payload,
            mut callback,
        } = request;
        payload.validate()?;
        let deadline = Instant::now() + self.config.stream.admission_timeout();
        let mut swept = false;

        loop {
            let mut guard = stream.lock_submit();
            let demand = guard.demand(&payload);
            let snapshot = stream.flow_snapshot(self.is_transport_down());
            let (relief, error) = match stream.flow().admit(&snapshot, demand) {
                AdmissionDecision::Admit => {
                    let admitted = guard.allocate(payload, callback.take())?;
                    return Ok((guard, admitted));
                }
                AdmissionDecision::Limited if swept => {
                    let admitted = guard.allocate(payload, callback.take())?;
                    return Ok((guard, admitted));
                }
                AdmissionDecision::Limited => {
                    stream.count_limited();
                    tracing::debug!(
                        stream_id = %stream.id(),
                        pending = snapshot.pending,
                        "stream limited"
                    );
                    (Relief::Sweep, None)
                }
                AdmissionDecision::Full(error) => (Relief::Space, Some(error)),
                AdmissionDecision::Drain => (
                    Relief::Drain,
                    Some(AdmissionError::PoolExhausted {
                        stream_id: stream.id(),
                        capacity: snapshot.pool_capacity,
                    }),
                ),
                AdmissionDecision::Reject(error) => return Err(error.into()),
            };
            drop(guard);

            if let Some(error) = error {
                if Instant::now() >= deadline {
                    tracing::debug!(
                        stream_id = %stream.id(),
                        error = %error,
                        "admission timed out"
                    );
                    return Err(error.into());
                }
            }
            relieve(stream, relief, deadline)?;
            swept = relief == Relief::Sweep;
        }
    }

    // ------------------------------------------------------------------------
    // Issuing
    // ------------------------------------------------------------------------

    pub(crate) fn count_issued(&self) {
        self.stats.tasks_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_ring_full(&self) {
        self.stats.ring_full_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Write queued retries of `stream`.
    pub(crate) fn flush_retries(&self, stream: &Stream) {
        if !stream.has_retries() {
            return;
        }
        let mut guard = stream.lock_submit();
        let finished = self.flush_retries_locked(&mut guard);
        drop(guard);
        self.observers.deliver(finished);
    }

    /// Write queued retries with the submission lock already held.
    pub(crate) fn flush_retries_locked(&self, guard: &mut SubmitGuard<'_>) -> Vec<FinishedTask> {
        let mut finished = Vec::new();
        let mut ids = guard.take_retries().into_iter();
        while let Some(id) = ids.next() {
            match guard.issue(self.driver(), id) {
                Ok(written) => {
                    if written {
                        self.count_issued();
                        tracing::debug!(
                            stream_id = %guard.stream().id(),
                            task_id = %id,
                            "retry issued"
                        );
                    }
                }
                Err(DriverError::RingFull(_)) => {
                    self.count_ring_full();
                    guard.requeue_retries(std::iter::once(id).chain(ids));
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        stream_id = %guard.stream().id(),
                        task_id = %id,
                        error = %e,
                        "retry could not be written"
                    );
                    let error = ExecutionError::SubmitFailed(e.to_string());
                    finished.extend(guard.fail_unissued(id, error));
                }
            }
        }
        finished
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Reconcile records that belong to `stream`.
    pub(crate) fn apply_reports(&self, stream: &Stream, records: &[CompletionRecord]) {
        if records.is_empty() {
            return;
        }
        let mut guard = stream.lock_sync();
        let (finished, aborted) =
            self.reconciler
                .reconcile_batch(&mut guard, records, self.is_device_aborting());
        drop(guard);
        stream.notify_retired();
        if aborted {
            self.set_device_aborting();
        }
        self.observers.deliver(finished);
    }

    /// Retire lazily reported tasks the device consumed before `head`.
    pub(crate) fn retire_consumed(&self, stream: &Stream, head: RingPos) {
        stream.observe_head(head);
        let mut guard = stream.lock_sync();
        let finished = guard.retire_through(head);
        drop(guard);
        if !finished.is_empty() {
            stream.notify_retired();
            self.observers.deliver(finished);
        }
    }

    /// Abort one stream and retire its outstanding tasks.
    pub fn abort_stream(&self, stream: &Stream, cause: AbortCause) {
        stream.failure().abort(cause);
        let mut guard = stream.lock_sync();
        let finished = guard.abort_all();
        drop(guard);
        stream.notify_retired();
        self.observers.deliver(finished);
    }

    /// The device is unreachable: abort every stream. Never retried.
    pub(crate) fn transport_down(&self, error: &DriverError) {
        if self.transport_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = error.to_string();
        tracing::error!(error = %reason, "device transport down, aborting all streams");
        *self.transport_reason.lock() = Some(reason.clone());
        self.device_aborting.store(true, Ordering::Release);
        for stream in self.streams() {
            self.abort_stream(&stream, AbortCause::TransportDown(reason.clone()));
        }
    }

    // ------------------------------------------------------------------------
    // Wait conditions
    // ------------------------------------------------------------------------

    /// Completion predicate of `synchronize`.
    pub fn sync_status(
        &self,
        stream: &Stream,
        up_to: Option<LogicalTaskId>,
    ) -> Option<Result<(), SyncError>> {
        if self.is_transport_down() {
            return Some(Err(self.transport_error()));
        }
        if stream.failure().is_aborted() {
            return Some(Err(stream
                .failure()
                .take_sync_error()
                .unwrap_or(SyncError::Aborted(stream.id()))));
        }
        let done = match up_to {
            Some(id) => stream.is_retired(id),
            None => stream.query_pending() == 0,
        };
        if !done {
            return None;
        }
        Some(match stream.failure().take_sync_error() {
            Some(error) => Err(error),
            None => Ok(()),
        })
    }

    /// Completion predicate of `wait_task`.
    pub fn task_status(&self, stream: &Stream, id: LogicalTaskId) -> Option<Result<(), SyncError>> {
        if self.is_transport_down() {
            return Some(Err(self.transport_error()));
        }
        stream.is_retired(id).then_some(Ok(()))
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("streams", &self.streams.read().len())
            .field("transport_down", &self.is_transport_down())
            .field("device_aborting", &self.is_device_aborting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_token_wakes_sleeper() {
        let token = Arc::new(CancelToken::new());
        let t = token.clone();
        let handle = thread::spawn(move || t.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reclaim_signal_generation() {
        let signal = ReclaimSignal::default();
        let seen = signal.generation();
        assert!(!signal.wait(seen, Duration::from_millis(5)));
        signal.notify();
        assert!(signal.wait(seen, Duration::from_millis(5)));
    }
}
