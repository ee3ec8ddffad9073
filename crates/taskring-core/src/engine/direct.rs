//! Direct dispatch: the calling thread does all the work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Engine, EngineContext, Relief, SubmitRequest, WaitCondition};
use crate::config::EngineStrategy;
use crate::error::{AdmissionError, DriverError, ExecutionError, SyncError, TaskRingError};
use crate::observer::FinishedTask;
use crate::stream::{Stream, SubmitGuard};
use crate::task::TaskKind;
use crate::types::LogicalTaskId;

/// Engine without background threads.
///
/// Each stream owns its completion ring. Submitting writes commands
/// immediately; whenever admission needs space, or a caller waits, the
/// calling thread reads the stream's hardware head and completion ring and
/// reconciles inline.
pub struct DirectEngine {
    ctx: Arc<EngineContext>,
    stopped: AtomicBool,
}

impl DirectEngine {
    /// Create an engine over `ctx`.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        info!("direct engine ready");
        Self {
            ctx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Reconcile whatever the device reported for `stream`, waiting up to
    /// `wait` for the first report.
    pub fn sweep(&self, stream: &Stream, wait: Duration) -> Result<(), SyncError> {
        let finished = self.collect(stream, wait)?;
        self.finish(stream, finished);
        Ok(())
    }

    /// Sweep without delivering notifications, for callers holding the
    /// submission lock.
    ///
    /// The hardware head is read before the completion ring is drained so
    /// that lazily reported tasks are never retired ahead of a report the
    /// device already wrote for them.
    fn collect(&self, stream: &Stream, wait: Duration) -> Result<Vec<FinishedTask>, SyncError> {
        if self.ctx.is_transport_down() {
            return Ok(Vec::new());
        }
        stream.count_sweep();
        self.ctx.stats.sweeps.fetch_add(1, Ordering::Relaxed);

        let driver = self.ctx.driver();
        let head = match driver.query_head(stream.sq()) {
            Ok(head) => head,
            Err(e) => return self.sweep_failed(stream, e),
        };

        let mut guard = stream.lock_sync();
        let records = match driver.poll_completion(stream.cq(), wait) {
            Ok(records) => records,
            Err(e) => {
                drop(guard);
                return self.sweep_failed(stream, e);
            }
        };
        self.ctx
            .stats
            .reports_received
            .fetch_add(records.len() as u64, Ordering::Relaxed);

        let (mut finished, aborted) =
            self.ctx
                .reconciler
                .reconcile_batch(&mut guard, &records, self.ctx.is_device_aborting());
        stream.observe_head(head);
        finished.extend(guard.retire_through(head));
        drop(guard);

        if aborted {
            self.ctx.set_device_aborting();
        }
        if !finished.is_empty() {
            stream.notify_retired();
        }
        Ok(finished)
    }

    fn sweep_failed(
        &self,
        stream: &Stream,
        error: DriverError,
    ) -> Result<Vec<FinishedTask>, SyncError> {
        if error.is_transport_down() {
            self.ctx.transport_down(&error);
            return Ok(Vec::new());
        }
        warn!(stream_id = %stream.id(), error = %error, "sweep failed");
        Err(SyncError::Driver(error))
    }

    fn finish(&self, stream: &Stream, finished: Vec<FinishedTask>) {
        if !finished.is_empty() {
            stream.notify_retired();
            self.ctx.observers().deliver(finished);
        }
    }

    fn relieve(
        &self,
        stream: &Stream,
        relief: Relief,
        deadline: Instant,
    ) -> Result<(), TaskRingError> {
        let interval = self.ctx.config().engine.completion_poll_interval();
        match relief {
            Relief::Sweep => self.sweep(stream, Duration::ZERO)?,
            Relief::Space => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.sweep(stream, interval.min(remaining))?;
            }
            Relief::Drain => {
                while stream.query_pending() > 0 && Instant::now() < deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.sweep(stream, interval.min(remaining))?;
                    if self.ctx.is_transport_down() {
                        break;
                    }
                }
            }
        }
        self.ctx.flush_retries(stream);
        Ok(())
    }

    /// Issue admitted ids in order, sweeping while the ring is full.
    /// Retired tasks are appended to `finished` for delivery once the
    /// submission lock is released.
    fn issue_admitted(
        &self,
        guard: &mut SubmitGuard<'_>,
        ids: Vec<LogicalTaskId>,
        deadline: Instant,
        finished: &mut Vec<FinishedTask>,
    ) -> Result<(), TaskRingError> {
        let stream = guard.stream();
        let interval = self.ctx.config().engine.completion_poll_interval();
        let mut pending = ids.into_iter().peekable();

        while let Some(&id) = pending.peek() {
            match guard.issue(self.ctx.driver(), id) {
                Ok(written) => {
                    if written {
                        self.ctx.count_issued();
                    }
                    pending.next();
                }
                Err(DriverError::RingFull(ring)) => {
                    self.ctx.count_ring_full();
                    if Instant::now() >= deadline {
                        let in_flight = stream.window().len();
                        for id in pending {
                            finished.extend(guard.fail_unissued(
                                id,
                                ExecutionError::SubmitFailed(format!("{ring} full")),
                            ));
                        }
                        return Err(AdmissionError::RingFull {
                            stream_id: stream.id(),
                            in_flight,
                            depth: stream.depth(),
                        }
                        .into());
                    }
                    // the synchronization lock nests inside the submission lock
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.collect(stream, interval.min(remaining)) {
                        Ok(retired) => finished.extend(retired),
                        Err(e) => {
                            let error = ExecutionError::SubmitFailed(e.to_string());
                            for id in pending {
                                finished.extend(guard.fail_unissued(id, error.clone()));
                            }
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => {
                    let error = ExecutionError::SubmitFailed(e.to_string());
                    for id in pending {
                        finished.extend(guard.fail_unissued(id, error.clone()));
                    }
                    if e.is_transport_down() {
                        self.ctx.transport_down(&e);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl Engine for DirectEngine {
    fn strategy(&self) -> EngineStrategy {
        EngineStrategy::Direct
    }

    fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn submit(
        &self,
        stream: &Arc<Stream>,
        request: SubmitRequest,
    ) -> Result<LogicalTaskId, TaskRingError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(AdmissionError::EngineStopped.into());
        }
        let deadline = Instant::now() + self.ctx.config().stream.admission_timeout();
        let kind = request.payload.kind();

        let (mut guard, admitted) = self.ctx.admit(stream, request, &mut |s, relief, deadline| {
            self.relieve(s, relief, deadline)
        })?;

        // retries go first so the device sees them before newer work
        let mut finished = self.ctx.flush_retries_locked(&mut guard);
        let issued =
            self.issue_admitted(&mut guard, admitted.in_order().collect(), deadline, &mut finished);
        drop(guard);
        self.finish(stream, finished);
        issued?;

        let observers = self.ctx.observers();
        if let Some(flip) = admitted.flip {
            observers.launched(stream.id(), flip, TaskKind::Flip);
        }
        observers.launched(stream.id(), admitted.task, kind);
        if kind == TaskKind::Terminal {
            self.shutdown();
        }

        debug!(stream_id = %stream.id(), task_id = %admitted.task, "task issued inline");
        Ok(admitted.task)
    }

    fn wait(
        &self,
        stream: &Arc<Stream>,
        timeout: Duration,
        done: WaitCondition<'_>,
    ) -> Result<(), SyncError> {
        let deadline = Instant::now() + timeout;
        let interval = self.ctx.config().engine.completion_poll_interval();
        loop {
            if let Some(result) = done(stream) {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::Timeout(timeout));
            }
            self.sweep(stream, interval.min(deadline - now))?;
            self.ctx.flush_retries(stream);
        }
    }

    fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("direct engine stopped");
        }
    }
}

impl std::fmt::Debug for DirectEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectEngine")
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}
