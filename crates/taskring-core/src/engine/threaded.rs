//! Threaded dispatch: one sender and one receiver thread per device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    CancelToken, Engine, EngineContext, ReclaimSignal, Relief, SubmitRequest, WaitCondition,
};
use crate::config::EngineStrategy;
use crate::driver::CompletionRecord;
use crate::error::{AdmissionError, DriverError, ExecutionError, SyncError, TaskRingError};
use crate::stream::Stream;
use crate::task::TaskPayload;
use crate::types::{LogicalTaskId, RingId, StreamId};

/// Work item on the staging channel.
enum Staged {
    /// Write a task.
    Task(Arc<Stream>, LogicalTaskId),
    /// A stream has retries queued.
    Retry(StreamId),
    /// Stop the sender.
    Stop,
}

/// Producer/consumer engine.
///
/// Callers admit tasks and stage them in submission order. The sender
/// thread writes staged tasks to their rings and backs off when a ring is
/// full; after `sender_backoff_threshold` consecutive `RingFull` results it
/// parks until the receiver reclaims space. The receiver thread drains the
/// device's shared completion ring and reconciles reports per stream.
pub struct ThreadedEngine {
    ctx: Arc<EngineContext>,
    staging: Sender<Staged>,
    cancel: Arc<CancelToken>,
    reclaim: Arc<ReclaimSignal>,
    stopped: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    cq: RingId,
}

impl ThreadedEngine {
    /// Start the sender and receiver threads. `cq` is the completion ring
    /// shared by every stream of the device.
    pub fn start(ctx: Arc<EngineContext>, cq: RingId) -> Result<Self, TaskRingError> {
        // admission bounds how much each stream can have staged
        let (tx, rx) = channel::unbounded();
        let cancel = Arc::new(CancelToken::new());
        let reclaim = Arc::new(ReclaimSignal::default());
        let stopped = Arc::new(AtomicBool::new(false));

        let sender = SenderLoop {
            ctx: ctx.clone(),
            staging: rx,
            cancel: cancel.clone(),
            reclaim: reclaim.clone(),
            stopped: stopped.clone(),
        };
        let receiver = ReceiverLoop {
            ctx: ctx.clone(),
            staging: tx.clone(),
            cancel: cancel.clone(),
            reclaim: reclaim.clone(),
            cq,
        };

        let send_thread = thread::Builder::new()
            .name("taskring-send".to_string())
            .spawn(move || sender.run())
            .map_err(|e| DriverError::Io(format!("failed to spawn sender: {e}")))?;
        let recv_thread = match thread::Builder::new()
            .name("taskring-recv".to_string())
            .spawn(move || receiver.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                let _ = tx.send(Staged::Stop);
                let _ = send_thread.join();
                return Err(DriverError::Io(format!("failed to spawn receiver: {e}")).into());
            }
        };

        info!(cq = %cq, "threaded engine started");

        Ok(Self {
            ctx,
            staging: tx,
            cancel,
            reclaim,
            stopped,
            threads: Mutex::new(vec![send_thread, recv_thread]),
            cq,
        })
    }

    /// Shared completion ring.
    pub fn completion_ring(&self) -> RingId {
        self.cq
    }

    /// Returns true once the sender stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn relieve(
        &self,
        stream: &Stream,
        relief: Relief,
        deadline: Instant,
    ) -> Result<(), TaskRingError> {
        match relief {
            // the receiver reconciles continuously
            Relief::Sweep => Ok(()),
            Relief::Space | Relief::Drain => {
                if self.is_stopped() {
                    return Err(AdmissionError::EngineStopped.into());
                }
                let mut guard = stream.lock_sync();
                if relief == Relief::Drain && stream.query_pending() == 0 {
                    return Ok(());
                }
                let slice = Instant::now() + self.ctx.config().engine.completion_poll_interval();
                guard.wait_until(deadline.min(slice));
                Ok(())
            }
        }
    }
}

impl Engine for ThreadedEngine {
    fn strategy(&self) -> EngineStrategy {
        EngineStrategy::Threaded
    }

    fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn submit(
        &self,
        stream: &Arc<Stream>,
        request: SubmitRequest,
    ) -> Result<LogicalTaskId, TaskRingError> {
        if self.is_stopped() {
            return Err(AdmissionError::EngineStopped.into());
        }

        let terminal = matches!(request.payload, TaskPayload::Terminal);
        let (mut guard, admitted) = self
            .ctx
            .admit(stream, request, &mut |s, relief, deadline| self.relieve(s, relief, deadline))?;
        if terminal {
            // nothing may be staged behind a terminal task
            self.stopped.store(true, Ordering::Release);
        }

        // staged under the submission lock so the sender sees ring order
        let mut ids = admitted.in_order();
        while let Some(id) = ids.next() {
            if self.staging.send(Staged::Task(stream.clone(), id)).is_err() {
                let finished: Vec<_> = std::iter::once(id)
                    .chain(ids)
                    .filter_map(|id| guard.fail_unissued(id, engine_stopped()))
                    .collect();
                drop(guard);
                self.ctx.observers().deliver(finished);
                return Err(AdmissionError::EngineStopped.into());
            }
        }
        drop(guard);

        debug!(stream_id = %stream.id(), task_id = %admitted.task, "task staged");
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
        let mut guard = stream.lock_sync();
        loop {
            if let Some(result) = done(stream) {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::Timeout(timeout));
            }
            // wake periodically to re-check abort state
            guard.wait_until(deadline.min(now + interval));
        }
    }

    fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.stopped.store(true, Ordering::Release);
        self.reclaim.notify();
        let _ = self.staging.send(Staged::Stop);

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("engine thread panicked");
            }
        }
        info!("threaded engine stopped");
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Sender
// ============================================================================

fn engine_stopped() -> ExecutionError {
    ExecutionError::SubmitFailed("engine stopped".into())
}

struct SenderLoop {
    ctx: Arc<EngineContext>,
    staging: Receiver<Staged>,
    cancel: Arc<CancelToken>,
    reclaim: Arc<ReclaimSignal>,
    stopped: Arc<AtomicBool>,
}

impl SenderLoop {
    fn run(self) {
        debug!("sender thread running");
        let slice = self.ctx.config().engine.sender_wait_slice();

        while !self.cancel.is_cancelled() {
            match self.staging.recv_timeout(slice) {
                Ok(Staged::Task(stream, id)) => {
                    if self.send(&stream, id) {
                        self.stopped.store(true, Ordering::Release);
                        info!(
                            stream_id = %stream.id(),
                            task_id = %id,
                            "terminal task written, sender stopping"
                        );
                        break;
                    }
                }
                Ok(Staged::Retry(stream_id)) => {
                    if let Some(stream) = self.ctx.stream(stream_id) {
                        self.ctx.flush_retries(&stream);
                    }
                }
                Ok(Staged::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            for stream in self.ctx.streams() {
                if stream.has_retries() {
                    self.ctx.flush_retries(&stream);
                }
            }
        }

        self.stopped.store(true, Ordering::Release);
        let mut abandoned = 0usize;
        for item in self.staging.try_iter() {
            if let Staged::Task(stream, id) = item {
                let mut guard = stream.lock_submit();
                let finished = guard.fail_unissued(id, engine_stopped());
                drop(guard);
                self.ctx.observers().deliver(finished.into_iter().collect());
                abandoned += 1;
            }
        }
        debug!(abandoned, "sender thread exiting");
    }

    /// Write one task, backing off while its ring is full. Returns true if
    /// the task was terminal.
    fn send(&self, stream: &Arc<Stream>, id: LogicalTaskId) -> bool {
        let threshold = self.ctx.config().engine.sender_backoff_threshold;
        let slice = self.ctx.config().engine.sender_wait_slice();
        let task = stream.arena().with_task(id, |r| (r.kind(), r.flags.terminal));
        let Some((kind, terminal)) = task else {
            return false;
        };
        let mut failures = 0u32;

        loop {
            let seen = self.reclaim.generation();
            let mut guard = stream.lock_submit();
            let result = guard.issue(self.ctx.driver(), id);
            match result {
                Ok(written) => {
                    drop(guard);
                    if written {
                        self.ctx.count_issued();
                        self.ctx.observers().launched(stream.id(), id, kind);
                    }
                    return terminal && written;
                }
                Err(DriverError::RingFull(ring)) => {
                    drop(guard);
                    self.ctx.count_ring_full();
                    failures += 1;
                    if failures >= threshold {
                        self.ctx.stats.sender_waits.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            stream_id = %stream.id(),
                            ring = %ring,
                            failures,
                            "ring full, sender waiting for reclaim"
                        );
                        self.reclaim.wait(seen, slice);
                    } else {
                        thread::yield_now();
                    }
                    if self.cancel.is_cancelled() {
                        let finished = stream.lock_submit().fail_unissued(id, engine_stopped());
                        self.ctx.observers().deliver(finished.into_iter().collect());
                        return false;
                    }
                }
                Err(e) => {
                    let finished =
                        guard.fail_unissued(id, ExecutionError::SubmitFailed(e.to_string()));
                    drop(guard);
                    error!(
                        stream_id = %stream.id(),
                        task_id = %id,
                        error = %e,
                        "task could not be written"
                    );
                    self.ctx.observers().deliver(finished.into_iter().collect());
                    if e.is_transport_down() {
                        self.ctx.transport_down(&e);
                    }
                    return false;
                }
            }
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

struct ReceiverLoop {
    ctx: Arc<EngineContext>,
    staging: Sender<Staged>,
    cancel: Arc<CancelToken>,
    reclaim: Arc<ReclaimSignal>,
    cq: RingId,
}

impl ReceiverLoop {
    fn run(self) {
        debug!(cq = %self.cq, "receiver thread running");
        let interval = self.ctx.config().engine.completion_poll_interval();

        while !self.cancel.is_cancelled() {
            match self.ctx.driver().poll_completion(self.cq, interval) {
                Ok(records) if records.is_empty() => self.refresh(),
                Ok(records) => self.dispatch(&records),
                Err(e) if e.is_transport_down() => {
                    self.ctx.transport_down(&e);
                    self.reclaim.notify();
                    break;
                }
                Err(e) => {
                    warn!(cq = %self.cq, error = %e, "completion poll failed");
                    if self.cancel.sleep(interval) {
                        break;
                    }
                }
            }
        }
        debug!("receiver thread exiting");
    }

    fn dispatch(&self, records: &[CompletionRecord]) {
        self.ctx
            .stats
            .reports_received
            .fetch_add(records.len() as u64, Ordering::Relaxed);

        let mut by_stream: HashMap<StreamId, Vec<CompletionRecord>> = HashMap::new();
        for record in records {
            by_stream.entry(record.stream()).or_default().push(*record);
        }

        for (stream_id, records) in by_stream {
            let Some(stream) = self.ctx.stream(stream_id) else {
                self.ctx
                    .stats
                    .reports_unrouted
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                warn!(
                    stream_id = %stream_id,
                    count = records.len(),
                    "reports for unknown stream dropped"
                );
                continue;
            };
            self.ctx.apply_reports(&stream, &records);
            if stream.has_retries() {
                // a stopped sender drops retries with the rest of its queue
                let _ = self.staging.send(Staged::Retry(stream_id));
            }
        }
        self.reclaim.notify();
    }

    /// No reports arrived: retire lazily reported work the device consumed.
    fn refresh(&self) {
        let busy: Vec<_> = self
            .ctx
            .streams()
            .into_iter()
            .filter(|s| s.query_pending() > 0)
            .collect();
        if busy.is_empty() {
            return;
        }

        let mut heads = Vec::with_capacity(busy.len());
        for stream in busy {
            match self.ctx.driver().query_head(stream.sq()) {
                Ok(head) => heads.push((stream, head)),
                Err(e) if e.is_transport_down() => {
                    self.ctx.transport_down(&e);
                    return;
                }
                Err(e) => debug!(stream_id = %stream.id(), error = %e, "head query failed"),
            }
        }

        // reports written before the heads were read must be applied first
        match self.ctx.driver().poll_completion(self.cq, Duration::ZERO) {
            Ok(records) if !records.is_empty() => self.dispatch(&records),
            Ok(_) => {}
            Err(e) if e.is_transport_down() => {
                self.ctx.transport_down(&e);
                return;
            }
            Err(e) => {
                warn!(cq = %self.cq, error = %e, "completion drain failed");
                return;
            }
        }

        for (stream, head) in heads {
            self.ctx.retire_consumed(&stream, head);
        }
        self.reclaim.notify();
    }
}
