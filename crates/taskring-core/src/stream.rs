//! Streams.
//!
//! A stream is one strictly ordered command channel bound to a submission
//! ring and a completion ring. All mutable state sits behind one of two
//! locks:
//!
//! * the submission lock ([`Stream::lock_submit`]) serializes allocating
//!   task slots and writing command entries;
//! * the synchronization lock ([`Stream::lock_sync`]) serializes reading
//!   completion reports and retiring tasks.
//!
//! A waiter therefore never blocks a submitter. When both are needed the
//! submission lock is taken first. Counters that are only read for
//! queries (pending count, ring positions) are atomics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::arena::TaskArena;
use crate::command;
use crate::config::{FlowConfig, StreamConfig};
use crate::driver::Driver;
use crate::error::{AdmissionError, ConfigError, DriverError, ExecutionError};
use crate::failure::{FailureController, FailureMode};
use crate::flip::{FlipTracker, TaskIdSpace};
use crate::flow::{Demand, FlowController, FlowSnapshot};
use crate::observer::FinishedTask;
use crate::ring::{AtomicRingPos, RingPos, RingWindow};
use crate::task::{CompletionCallback, TaskPayload, TaskRecord, TaskState};
use crate::types::{LogicalTaskId, RingId, StreamId, TaskId};

// ============================================================================
// Options
// ============================================================================

/// Options for creating a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    /// Scheduling priority hint passed to the driver (lower is higher).
    pub priority: i32,
    /// Failure mode.
    pub failure_mode: FailureMode,
    /// Start graph-bound.
    pub bound: bool,
    /// Ring depth override.
    pub ring_depth: Option<u32>,
    /// Arena size override.
    pub pool_size: Option<u32>,
    /// Report override (eager or lazy completion).
    pub eager_completion: Option<bool>,
}

impl StreamOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority hint.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Starts the stream graph-bound.
    #[must_use]
    pub fn with_bound(mut self, bound: bool) -> Self {
        self.bound = bound;
        self
    }

    /// Overrides the ring depth.
    #[must_use]
    pub fn with_ring_depth(mut self, depth: u32) -> Self {
        self.ring_depth = Some(depth);
        self
    }

    /// Overrides the arena size.
    #[must_use]
    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Overrides eager completion.
    #[must_use]
    pub fn with_eager_completion(mut self, eager: bool) -> Self {
        self.eager_completion = Some(eager);
        self
    }

    /// Apply the overrides to the device defaults.
    pub fn resolve(&self, defaults: &StreamConfig) -> Result<StreamConfig, ConfigError> {
        let mut config = defaults.clone();
        if let Some(depth) = self.ring_depth {
            config.ring_depth = depth;
        }
        if let Some(pool) = self.pool_size {
            config.pool_size = Some(pool);
        }
        if let Some(eager) = self.eager_completion {
            config.eager_completion = eager;
        }
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Stream statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Tasks admitted (flip markers included).
    pub submitted: u64,
    /// Tasks retired.
    pub retired: u64,
    /// Re-issues after retryable faults.
    pub retried: u64,
    /// Tasks retired with an error.
    pub errors: u64,
    /// Duplicate or stale reports dropped.
    pub duplicates: u64,
    /// Flip markers injected.
    pub flips: u64,
    /// Reconciliation sweeps.
    pub sweeps: u64,
    /// Admissions that found the stream limited.
    pub limited: u64,
}

#[derive(Default)]
struct StreamStatsInner {
    submitted: AtomicU64,
    retired: AtomicU64,
    retried: AtomicU64,
    errors: AtomicU64,
    duplicates: AtomicU64,
    flips: AtomicU64,
    sweeps: AtomicU64,
    limited: AtomicU64,
}

// ============================================================================
// Stream
// ============================================================================

#[derive(Debug, Default)]
struct SubmitSide {
    issued_any: bool,
}

/// State owned by the synchronization lock.
#[derive(Debug, Default)]
pub struct SyncSide {
    /// Ring position of the last processed report.
    pub last_seq: RingPos,
    /// Flip markers observed.
    pub flips: FlipTracker,
    /// Tasks waiting to be written again.
    pub retries: VecDeque<LogicalTaskId>,
}

/// Ids produced by one admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// The caller's task.
    pub task: LogicalTaskId,
    /// Flip marker allocated in front of it.
    pub flip: Option<LogicalTaskId>,
}

impl Admitted {
    /// Ids to issue, in ring order.
    pub fn in_order(&self) -> impl Iterator<Item = LogicalTaskId> {
        self.flip.into_iter().chain(std::iter::once(self.task))
    }
}

/// A logical command channel.
pub struct Stream {
    id: StreamId,
    sq: RingId,
    cq: RingId,
    depth: u32,
    priority: i32,
    eager: bool,
    ids: TaskIdSpace,
    arena: TaskArena,
    flow: FlowController,
    failure: FailureController,
    bound: AtomicBool,
    submit: Mutex<SubmitSide>,
    sync: Mutex<SyncSide>,
    retired_cv: Condvar,
    has_retries: AtomicBool,
    pending: AtomicU32,
    pending_entries: AtomicU32,
    sq_tail: AtomicRingPos,
    hw_head: AtomicRingPos,
    persistent_head: AtomicRingPos,
    persistent_tail: AtomicRingPos,
    stats: StreamStatsInner,
}

impl Stream {
    /// Create a stream over already allocated rings.
    pub fn new(
        id: StreamId,
        sq: RingId,
        cq: RingId,
        config: &StreamConfig,
        flow: &FlowConfig,
        options: &StreamOptions,
    ) -> Self {
        Self {
            id,
            sq,
            cq,
            depth: config.ring_depth,
            priority: options.priority,
            eager: config.eager_completion,
            ids: TaskIdSpace::new(config.task_id_bits),
            arena: TaskArena::new(config.arena_capacity()),
            flow: FlowController::new(id, config.ring_depth, flow),
            failure: FailureController::new(id, options.failure_mode),
            bound: AtomicBool::new(options.bound),
            submit: Mutex::new(SubmitSide::default()),
            sync: Mutex::new(SyncSide::default()),
            retired_cv: Condvar::new(),
            has_retries: AtomicBool::new(false),
            pending: AtomicU32::new(0),
            pending_entries: AtomicU32::new(0),
            sq_tail: AtomicRingPos::default(),
            hw_head: AtomicRingPos::default(),
            persistent_head: AtomicRingPos::default(),
            persistent_tail: AtomicRingPos::default(),
            stats: StreamStatsInner::default(),
        }
    }

    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Submission ring.
    pub fn sq(&self) -> RingId {
        self.sq
    }

    /// Completion ring.
    pub fn cq(&self) -> RingId {
        self.cq
    }

    /// Ring depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Priority hint.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Every task requests a report.
    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// Hardware task id geometry.
    pub fn id_space(&self) -> TaskIdSpace {
        self.ids
    }

    /// Hardware id of a logical id.
    pub fn hardware_id(&self, id: LogicalTaskId) -> TaskId {
        self.ids.raw_of(id)
    }

    /// Task arena.
    pub fn arena(&self) -> &TaskArena {
        &self.arena
    }

    /// Admission policy.
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Failure state.
    pub fn failure(&self) -> &FailureController {
        &self.failure
    }

    /// Driven by a graph.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    /// Tasks admitted and not yet retired.
    pub fn query_pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Issued-but-unretired window as seen by the host.
    pub fn window(&self) -> RingWindow {
        RingWindow::new(self.hw_head.load(), self.sq_tail.load())
    }

    /// Persistent window of a graph-bound stream.
    pub fn persistent_window(&self) -> RingWindow {
        RingWindow::new(self.persistent_head.load(), self.persistent_tail.load())
    }

    /// Returns true if retries are queued.
    pub fn has_retries(&self) -> bool {
        self.has_retries.load(Ordering::Acquire)
    }

    /// Snapshot for the flow controller.
    pub fn flow_snapshot(&self, device_aborted: bool) -> FlowSnapshot {
        FlowSnapshot {
            pending: self.pending.load(Ordering::Acquire),
            pending_entries: self.pending_entries.load(Ordering::Acquire),
            unconsumed: self.window().len(),
            arena_free: self.arena.free(),
            pool_capacity: self.arena.capacity(),
            persistent_len: self.persistent_window().len(),
            bound: self.is_bound(),
            failure: self.failure.snapshot(),
            device_aborted,
        }
    }

    /// Returns true once `id` and every task admitted before it retired.
    ///
    /// A task that retired ahead of an older one (for example behind a
    /// retry) keeps its slot until the older task retires, so only ids the
    /// arena has recycled count.
    pub fn is_retired(&self, id: LogicalTaskId) -> bool {
        id.precedes(self.arena.head())
    }

    /// Most recently admitted id.
    pub fn last_task(&self) -> Option<LogicalTaskId> {
        (self.stats.submitted.load(Ordering::Acquire) > 0).then(|| self.arena.tail().prev())
    }

    /// Take the submission lock.
    pub fn lock_submit(&self) -> SubmitGuard<'_> {
        SubmitGuard {
            stream: self,
            side: self.submit.lock(),
        }
    }

    /// Take the synchronization lock.
    pub fn lock_sync(&self) -> SyncGuard<'_> {
        SyncGuard {
            stream: self,
            side: self.sync.lock(),
        }
    }

    /// Wake synchronization waiters.
    pub fn notify_retired(&self) {
        self.retired_cv.notify_all();
    }

    /// Record the device's consumer position.
    pub fn observe_head(&self, head: RingPos) {
        self.hw_head.advance_to(head);
    }

    /// Bind or unbind the stream to a graph. The persistent window restarts
    /// at the current tail.
    pub fn set_bound(&self, bound: bool) {
        let tail = self.sq_tail.load();
        self.persistent_head.store(tail);
        self.persistent_tail.store(tail);
        self.bound.store(bound, Ordering::Release);
        tracing::debug!(stream_id = %self.id, bound, "stream bind state changed");
    }

    pub(crate) fn count_limited(&self) {
        self.stats.limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_sweep(&self) {
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_duplicate(&self) {
        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            retired: self.stats.retired.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            flips: self.stats.flips.load(Ordering::Relaxed),
            sweeps: self.stats.sweeps.load(Ordering::Relaxed),
            limited: self.stats.limited.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("sq", &self.sq)
            .field("cq", &self.cq)
            .field("depth", &self.depth)
            .field("pending", &self.query_pending())
            .field("window", &self.window())
            .field("bound", &self.is_bound())
            .finish()
    }
}

// ============================================================================
// Submission side
// ============================================================================

/// Holder of a stream's submission lock.
pub struct SubmitGuard<'a> {
    stream: &'a Stream,
    side: MutexGuard<'a, SubmitSide>,
}

impl<'a> SubmitGuard<'a> {
    /// The stream.
    pub fn stream(&self) -> &'a Stream {
        self.stream
    }

    /// Returns true if the next allocation must be preceded by a flip marker.
    pub fn flip_due(&self) -> bool {
        self.stream
            .ids
            .needs_flip(self.stream.arena.tail(), !self.side.issued_any)
    }

    /// Resources `payload` needs, flip marker included.
    pub fn demand(&self, payload: &TaskPayload) -> Demand {
        let flip = u32::from(self.flip_due());
        Demand {
            entries: u32::from(payload.entry_count()) + flip,
            slots: 1 + flip,
            maintenance: matches!(payload, TaskPayload::Maintenance(_)),
        }
    }

    /// Allocate a slot for `payload`, preceded by a flip marker when the
    /// hardware id space wraps. Nothing is written to the ring yet.
    pub fn allocate(
        &mut self,
        payload: TaskPayload,
        callback: Option<CompletionCallback>,
    ) -> Result<Admitted, AdmissionError> {
        let stream = self.stream;
        let slots = if self.flip_due() { 2 } else { 1 };
        if stream.arena.free() < slots {
            return Err(AdmissionError::PoolExhausted {
                stream_id: stream.id,
                capacity: stream.arena.capacity(),
            });
        }

        let flip = if slots == 2 {
            let flip_num = stream.ids.flip_of(stream.arena.tail());
            let id = self.allocate_one(TaskPayload::Flip { flip_num }, None)?;
            stream.stats.flips.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                stream_id = %stream.id,
                task_id = %id,
                flip_num,
                "flip marker injected"
            );
            Some(id)
        } else {
            None
        };
        let task = self.allocate_one(payload, callback)?;
        self.side.issued_any = true;
        Ok(Admitted { task, flip })
    }

    fn allocate_one(
        &mut self,
        payload: TaskPayload,
        callback: Option<CompletionCallback>,
    ) -> Result<LogicalTaskId, AdmissionError> {
        let stream = self.stream;
        let entries = u32::from(payload.entry_count());
        let bound = stream.is_bound();
        let eager = stream.eager && !bound;

        let handle = stream
            .arena
            .allocate(|id| {
                let mut record = TaskRecord::new(id, stream.ids.raw_of(id), stream.id, payload);
                record.flags.needs_report |= eager;
                record.flags.needs_stream_sync = bound;
                if let Some(callback) = callback {
                    record.set_callback(callback);
                }
                record
            })
            .ok_or(AdmissionError::PoolExhausted {
                stream_id: stream.id,
                capacity: stream.arena.capacity(),
            })?;

        stream.pending.fetch_add(1, Ordering::AcqRel);
        stream.pending_entries.fetch_add(entries, Ordering::AcqRel);
        stream.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if bound {
            stream.persistent_tail.fetch_advance(entries);
        }
        Ok(handle.id())
    }

    /// Write an allocated (or retrying) task to the ring.
    ///
    /// Returns false if the task no longer needs writing (it was retired by
    /// an abort). On failure the task stays where it was and may be issued
    /// again.
    pub fn issue(&mut self, driver: &dyn Driver, id: LogicalTaskId) -> Result<bool, DriverError> {
        let stream = self.stream;
        let tail = stream.sq_tail.load();

        let prepared = stream.arena.with_task(id, |record| {
            if !matches!(record.state, TaskState::Pending | TaskState::Retrying) {
                return None;
            }
            let retry = record.state == TaskState::Retrying;
            let entries = command::encode_task(record, retry);
            let prev = (record.state, record.end_pos);
            record.end_pos = tail.advance(entries.len() as u32);
            record.outstanding = record.entry_count();
            record.state = TaskState::InFlight;
            Some((command::to_bytes(&entries), entries.len() as u32, prev))
        });

        let Some(Some((bytes, count, prev))) = prepared else {
            return Ok(false);
        };

        if let Err(e) = driver.enqueue(stream.sq, &bytes) {
            stream.arena.with_task(id, |record| {
                if record.state == TaskState::InFlight {
                    record.state = prev.0;
                    record.end_pos = prev.1;
                }
            });
            return Err(e);
        }

        stream.sq_tail.store(tail.advance(count));
        tracing::trace!(
            stream_id = %stream.id,
            task_id = %id,
            entries = count,
            tail = %tail.advance(count),
            "task issued"
        );
        Ok(true)
    }

    /// Retire a task that could not be written at all.
    pub fn fail_unissued(
        &mut self,
        id: LogicalTaskId,
        error: ExecutionError,
    ) -> Option<FinishedTask> {
        let mut sync = self.stream.lock_sync();
        let finished = sync.retire(id, Some(error));
        drop(sync);
        self.stream.notify_retired();
        finished
    }

    /// Take the queued retries. Acquires the synchronization lock briefly.
    pub fn take_retries(&mut self) -> Vec<LogicalTaskId> {
        if !self.stream.has_retries() {
            return Vec::new();
        }
        let mut sync = self.stream.sync.lock();
        self.stream.has_retries.store(false, Ordering::Release);
        sync.retries.drain(..).collect()
    }

    /// Put back retries that could not be written.
    pub fn requeue_retries(&mut self, ids: impl IntoIterator<Item = LogicalTaskId>) {
        let mut sync = self.stream.sync.lock();
        for (i, id) in ids.into_iter().enumerate() {
            sync.retries.insert(i, id);
        }
        if !sync.retries.is_empty() {
            self.stream.has_retries.store(true, Ordering::Release);
        }
    }

    /// Drop hardware entries left behind by an abort and restart the window
    /// at the driver's tail.
    pub fn reset_ring(&mut self, driver: &dyn Driver) -> Result<(), DriverError> {
        let stream = self.stream;
        let tail = driver.query_tail(stream.sq)?;
        driver.set_head(stream.sq, tail)?;
        let flips = if self.side.issued_any {
            stream.ids.flip_of(stream.arena.tail().prev())
        } else {
            0
        };
        let mut sync = stream.sync.lock();
        sync.last_seq = tail;
        sync.flips.reset_to(flips);
        sync.retries.clear();
        stream.has_retries.store(false, Ordering::Release);
        stream.sq_tail.store(tail);
        stream.hw_head.store(tail);
        stream.persistent_head.store(tail);
        stream.persistent_tail.store(tail);
        tracing::info!(stream_id = %stream.id, tail = %tail, "stream ring reset");
        Ok(())
    }
}

// ============================================================================
// Synchronization side
// ============================================================================

/// Holder of a stream's synchronization lock.
pub struct SyncGuard<'a> {
    stream: &'a Stream,
    side: MutexGuard<'a, SyncSide>,
}

impl<'a> SyncGuard<'a> {
    /// The stream.
    pub fn stream(&self) -> &'a Stream {
        self.stream
    }

    /// Locked state.
    pub fn side(&mut self) -> &mut SyncSide {
        &mut self.side
    }

    /// Block until the next retirement notification or `deadline`.
    /// Returns false on timeout.
    pub fn wait_until(&mut self, deadline: Instant) -> bool {
        !self
            .stream
            .retired_cv
            .wait_until(&mut self.side, deadline)
            .timed_out()
    }

    /// Block for at most `timeout`.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Queue a task to be written again.
    pub fn push_retry(&mut self, id: LogicalTaskId) {
        self.stream.stats.retried.fetch_add(1, Ordering::Relaxed);
        self.side.retries.push_back(id);
        self.stream.has_retries.store(true, Ordering::Release);
    }

    /// Retire `id` with `error` (or success). Returns the notification to
    /// deliver, or `None` if the task was already retired.
    pub fn retire(
        &mut self,
        id: LogicalTaskId,
        error: Option<ExecutionError>,
    ) -> Option<FinishedTask> {
        let stream = self.stream;
        let finished = stream.arena.with_task(id, |record| {
            if record.is_retired() {
                return None;
            }
            if record.error.is_none() {
                record.error = error;
            }
            record.state = TaskState::Retired;
            record.flags.reclaimed = true;
            record.outstanding = 0;
            Some((
                FinishedTask {
                    completion: record.completion(),
                    callback: record.callback.take(),
                },
                u32::from(record.entry_count()),
                match record.payload {
                    TaskPayload::Flip { flip_num } => Some(flip_num),
                    _ => None,
                },
                record.flags.needs_stream_sync,
            ))
        })??;

        let (task, entries, flip, bound) = finished;
        if let Some(flip_num) = flip {
            self.side.flips.observe(flip_num);
        }
        if bound {
            stream.persistent_head.fetch_advance(entries);
        }
        stream.pending.fetch_sub(1, Ordering::AcqRel);
        stream.pending_entries.fetch_sub(entries, Ordering::AcqRel);
        stream.stats.retired.fetch_add(1, Ordering::Relaxed);
        if task.completion.result.is_err() {
            stream.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        stream.arena.release(id);
        tracing::trace!(
            stream_id = %stream.id,
            task_id = %id,
            ok = task.completion.result.is_ok(),
            "task retired"
        );
        Some(task)
    }

    /// Retire lazily reported tasks whose entries the device consumed
    /// before `head`. Reporting tasks are left for their reports.
    pub fn retire_through(&mut self, head: RingPos) -> Vec<FinishedTask> {
        let stream = self.stream;
        let mut due = Vec::new();
        for id in stream.arena.live_ids() {
            let state = stream
                .arena
                .with_task(id, |r| (r.state, r.end_pos, r.flags.needs_report));
            match state {
                // not (re)written yet; later tasks retire after it
                Some((TaskState::Pending | TaskState::Retrying, _, _)) => break,
                Some((TaskState::InFlight, end, _)) if end.is_after(head) => break,
                Some((TaskState::InFlight, _, false)) => due.push(id),
                _ => {}
            }
        }
        due.into_iter()
            .filter_map(|id| self.retire(id, None))
            .collect()
    }

    /// Retire every live task. Tasks without an error get
    /// [`ExecutionError::Aborted`].
    pub fn abort_all(&mut self) -> Vec<FinishedTask> {
        let ids: Vec<_> = self.stream.arena.live_ids().collect();
        self.side.retries.clear();
        self.stream.has_retries.store(false, Ordering::Release);
        let finished: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.retire(id, Some(ExecutionError::Aborted)))
            .collect();
        if !finished.is_empty() {
            tracing::warn!(
                stream_id = %self.stream.id,
                retired = finished.len(),
                "outstanding tasks aborted"
            );
        }
        finished
    }
}
