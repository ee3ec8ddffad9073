//! Completion reconciliation.
//!
//! Matches completion records to task slots and retires them. Runs with the
//! stream's synchronization lock held; callbacks are returned to the caller
//! to run after the lock is released.

use crate::driver::{error_bits, CompletionRecord, RecordKind};
use crate::error::ExecutionError;
use crate::failure::FailureAction;
use crate::observer::FinishedTask;
use crate::ring::RingPos;
use crate::stream::SyncGuard;
use crate::task::{TaskKind, TaskState};

/// How a report's error bits are treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportClass {
    /// Clean completion.
    Success,
    /// Completed; the device flagged something informational.
    Warning,
    /// Recoverable fault; write the task again.
    Retryable,
    /// The task failed.
    Fatal(ExecutionError),
}

/// What reconciling one record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Sequence at or before the last processed report; dropped.
    Stale,
    /// Out-of-band record; nothing to retire.
    Informational,
    /// The task was already retired by an earlier sweep.
    AlreadyRetired,
    /// One entry of a multi-entry task completed.
    Partial,
    /// The task was queued for another attempt.
    Retrying,
    /// The task retired successfully.
    Retired,
    /// The task retired with an error.
    Failed(FailureAction),
}

/// Classify the error bits of a report for a task of `kind`.
pub fn classify(bits: u16, code: u32, kind: TaskKind, retries: u8, retry_limit: u8) -> ReportClass {
    if bits == 0 {
        return ReportClass::Success;
    }
    if bits & error_bits::SQE_ERROR != 0 {
        return ReportClass::Fatal(ExecutionError::MalformedCommand { code });
    }
    if bits & error_bits::EXCEPTION != 0 {
        return ReportClass::Fatal(ExecutionError::Exception { code });
    }
    if bits & error_bits::TRAP != 0 {
        return ReportClass::Fatal(ExecutionError::Trap { code });
    }
    if bits & error_bits::TIMEOUT != 0 {
        return ReportClass::Fatal(ExecutionError::DeviceTimeout { code });
    }
    if bits & error_bits::DECODER_FAULT != 0 {
        if kind == TaskKind::Decode && retries < retry_limit {
            return ReportClass::Retryable;
        }
        return ReportClass::Fatal(ExecutionError::DecoderFault { code, retries });
    }
    if bits & !error_bits::DEBUG_OVERFLOW == 0 {
        return ReportClass::Warning;
    }
    ReportClass::Fatal(ExecutionError::Exception { code })
}

/// Applies completion records to streams.
#[derive(Debug, Clone)]
pub struct Reconciler {
    retry_limit: u8,
}

impl Reconciler {
    /// Create a reconciler allowing `retry_limit` re-issues per task.
    pub fn new(retry_limit: u8) -> Self {
        Self { retry_limit }
    }

    /// Retry limit.
    pub fn retry_limit(&self) -> u8 {
        self.retry_limit
    }

    /// Reconcile one record against the locked stream.
    ///
    /// Retired tasks are appended to `finished`. `device_aborting` is
    /// forwarded to the failure controller.
    pub fn reconcile(
        &self,
        guard: &mut SyncGuard<'_>,
        record: &CompletionRecord,
        device_aborting: bool,
        finished: &mut Vec<FinishedTask>,
    ) -> ReconcileOutcome {
        let stream = guard.stream();
        let stream_id = stream.id();

        match record.record_kind() {
            Some(RecordKind::Task) => {}
            Some(RecordKind::ErrorInfo) => {
                tracing::debug!(
                    stream_id = %stream_id,
                    task_id = record.task_id,
                    code = record.error_code,
                    "error info record"
                );
                return ReconcileOutcome::Informational;
            }
            None => {
                tracing::warn!(stream_id = %stream_id, kind = record.kind, "unknown record kind");
                return ReconcileOutcome::Informational;
            }
        }

        let pos = record.head();
        if !pos.is_after(guard.side().last_seq) {
            stream.count_duplicate();
            tracing::warn!(
                stream_id = %stream_id,
                task_id = record.task_id,
                seq = %pos,
                last = %guard.side().last_seq,
                "stale report dropped"
            );
            return ReconcileOutcome::Stale;
        }
        guard.side().last_seq = pos;
        stream.observe_head(pos);

        // lazy predecessors were consumed before this entry
        finished.extend(guard.retire_through(RingPos::new(pos.get().wrapping_sub(1))));

        let flips = guard.side().flips.observed();
        let resolved = stream
            .id_space()
            .resolve(record.hw_task(), flips, |id| stream.arena().contains(id));
        let Some(id) = resolved else {
            tracing::debug!(
                stream_id = %stream_id,
                task_id = record.task_id,
                "report for retired task"
            );
            finished.extend(guard.retire_through(pos));
            return ReconcileOutcome::AlreadyRetired;
        };

        let view = stream.arena().with_task(id, |r| {
            let start = RingPos::new(r.end_pos.get().wrapping_sub(u32::from(r.entry_count())));
            let current = pos.is_after(start) && !pos.is_after(r.end_pos);
            (r.state, current, r.kind(), r.retries)
        });
        let (kind, retries) = match view {
            None | Some((TaskState::Retired, ..)) => {
                finished.extend(guard.retire_through(pos));
                return ReconcileOutcome::AlreadyRetired;
            }
            Some((TaskState::InFlight, true, kind, retries)) => (kind, retries),
            // report for an earlier attempt
            Some(_) => {
                stream.count_duplicate();
                return ReconcileOutcome::Stale;
            }
        };

        match classify(record.error_bits, record.error_code, kind, retries, self.retry_limit) {
            class @ (ReportClass::Success | ReportClass::Warning) => {
                if class == ReportClass::Warning {
                    tracing::warn!(
                        stream_id = %stream_id,
                        task_id = %id,
                        bits = record.error_bits,
                        "task completed with warning"
                    );
                }
                let remaining = stream
                    .arena()
                    .with_task(id, |r| {
                        r.outstanding = r.outstanding.saturating_sub(1);
                        r.outstanding
                    })
                    .unwrap_or(0);
                if remaining > 0 {
                    return ReconcileOutcome::Partial;
                }
                finished.extend(guard.retire(id, None));
                ReconcileOutcome::Retired
            }
            ReportClass::Retryable => {
                stream.arena().with_task(id, |r| {
                    r.state = TaskState::Retrying;
                    r.retries += 1;
                });
                guard.push_retry(id);
                tracing::warn!(
                    stream_id = %stream_id,
                    task_id = %id,
                    attempt = retries + 1,
                    code = record.error_code,
                    "retrying task after decoder fault"
                );
                ReconcileOutcome::Retrying
            }
            ReportClass::Fatal(error) => {
                tracing::error!(
                    stream_id = %stream_id,
                    task_id = %id,
                    error = %error,
                    "task failed"
                );
                // outstanding sub-completions are drained, not waited for
                finished.extend(guard.retire(id, Some(error.clone())));
                let action = stream
                    .failure()
                    .on_task_error(id, &error, device_aborting);
                if action == FailureAction::AbortStream {
                    finished.extend(guard.abort_all());
                }
                ReconcileOutcome::Failed(action)
            }
        }
    }

    /// Reconcile a batch for one stream and wake its waiters.
    pub fn reconcile_batch(
        &self,
        guard: &mut SyncGuard<'_>,
        records: &[CompletionRecord],
        device_aborting: bool,
    ) -> (Vec<FinishedTask>, bool) {
        let mut finished = Vec::new();
        let mut aborted = false;
        for record in records {
            let outcome = self.reconcile(guard, record, device_aborting, &mut finished);
            tracing::trace!(
                stream_id = record.stream_id,
                task_id = record.task_id,
                outcome = ?outcome,
                "report reconciled"
            );
            aborted |= outcome == ReconcileOutcome::Failed(FailureAction::AbortStream);
        }
        (finished, aborted)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskRingConfig;
    use crate::failure::FailureMode;
    use crate::stream::{Stream, StreamOptions};
    use crate::task::TaskPayload;
    use crate::types::{LogicalTaskId, RingId, StreamId};

    struct NullDriver;

    impl crate::driver::Driver for NullDriver {
        fn allocate_ring(
            &self,
            _: crate::driver::RingRequest,
        ) -> Result<RingId, crate::error::DriverError> {
            Ok(RingId(0))
        }
        fn free_ring(&self, _: RingId) -> Result<(), crate::error::DriverError> {
            Ok(())
        }
        fn enqueue(&self, _: RingId, _: &[u8]) -> Result<(), crate::error::DriverError> {
            Ok(())
        }
        fn poll_completion(
            &self,
            _: RingId,
            _: std::time::Duration,
        ) -> Result<Vec<CompletionRecord>, crate::error::DriverError> {
            Ok(Vec::new())
        }
        fn query_head(&self, _: RingId) -> Result<RingPos, crate::error::DriverError> {
            Ok(RingPos::ZERO)
        }
        fn query_tail(&self, _: RingId) -> Result<RingPos, crate::error::DriverError> {
            Ok(RingPos::ZERO)
        }
        fn set_head(&self, _: RingId, _: RingPos) -> Result<(), crate::error::DriverError> {
            Ok(())
        }
        fn enable_ring(&self, _: RingId) -> Result<(), crate::error::DriverError> {
            Ok(())
        }
        fn disable_ring(&self, _: RingId) -> Result<(), crate::error::DriverError> {
            Ok(())
        }
    }

    fn stream(mode: FailureMode) -> Stream {
        let config = TaskRingConfig::builder().with_ring_depth(8).build().unwrap();
        Stream::new(
            StreamId(1),
            RingId(0),
            RingId(1),
            &config.stream,
            &config.flow,
            &StreamOptions::new().with_failure_mode(mode),
        )
    }

    fn issue(s: &Stream, payload: TaskPayload) -> LogicalTaskId {
        let mut submit = s.lock_submit();
        let id = submit.allocate(payload, None).unwrap().task;
        submit.issue(&NullDriver, id).unwrap();
        id
    }

    fn report(s: &Stream, id: LogicalTaskId, head: u32) -> CompletionRecord {
        CompletionRecord::task(s.id(), s.hardware_id(id), RingPos::new(head))
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, 0, TaskKind::Kernel, 0, 1), ReportClass::Success);
        assert_eq!(
            classify(error_bits::DEBUG_OVERFLOW, 0, TaskKind::Kernel, 0, 1),
            ReportClass::Warning
        );
        assert_eq!(
            classify(error_bits::DECODER_FAULT, 3, TaskKind::Decode, 0, 1),
            ReportClass::Retryable
        );
        assert_eq!(
            classify(error_bits::DECODER_FAULT, 3, TaskKind::Decode, 1, 1),
            ReportClass::Fatal(ExecutionError::DecoderFault { code: 3, retries: 1 })
        );
        assert_eq!(
            classify(
                error_bits::DECODER_FAULT | error_bits::SQE_ERROR,
                3,
                TaskKind::Decode,
                0,
                1
            ),
            ReportClass::Fatal(ExecutionError::MalformedCommand { code: 3 })
        );
        assert_eq!(
            classify(error_bits::DECODER_FAULT, 3, TaskKind::Kernel, 0, 1),
            ReportClass::Fatal(ExecutionError::DecoderFault { code: 3, retries: 0 })
        );
    }

    #[test]
    fn test_duplicate_report_is_dropped() {
        let s = stream(FailureMode::Continuing);
        let rc = Reconciler::default();
        let id = issue(&s, TaskPayload::kernel(1, 0));
        let rec = report(&s, id, 1);

        let mut guard = s.lock_sync();
        let mut finished = Vec::new();
        assert_eq!(
            rc.reconcile(&mut guard, &rec, false, &mut finished),
            ReconcileOutcome::Retired
        );
        assert_eq!(
            rc.reconcile(&mut guard, &rec, false, &mut finished),
            ReconcileOutcome::Stale
        );
        assert_eq!(finished.len(), 1);
        drop(guard);
        assert_eq!(s.stats().duplicates, 1);
        assert_eq!(s.query_pending(), 0);
    }

    #[test]
    fn test_multi_task_fatal_drains_remaining() {
        let s = stream(FailureMode::Continuing);
        let rc = Reconciler::default();
        let id = issue(
            &s,
            TaskPayload::Multi {
                functions: vec![1, 2, 3],
            },
        );
        let mut guard = s.lock_sync();
        let mut finished = Vec::new();
        assert_eq!(
            rc.reconcile(&mut guard, &report(&s, id, 1), false, &mut finished),
            ReconcileOutcome::Partial
        );
        let fatal = report(&s, id, 2).with_error(error_bits::EXCEPTION, 9);
        assert_eq!(
            rc.reconcile(&mut guard, &fatal, false, &mut finished),
            ReconcileOutcome::Failed(FailureAction::Record)
        );
        drop(guard);
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0].completion.result,
            Err(ExecutionError::Exception { code: 9 })
        );
        assert!(s.is_retired(id));
    }

    #[test]
    fn test_abort_on_failure_retires_all() {
        let s = stream(FailureMode::AbortOnFailure);
        let rc = Reconciler::default();
        let first = issue(&s, TaskPayload::kernel(1, 0));
        for _ in 0..3 {
            issue(&s, TaskPayload::kernel(1, 0));
        }
        let fatal = report(&s, first, 1).with_error(error_bits::TRAP, 1);
        let mut guard = s.lock_sync();
        let mut finished = Vec::new();
        assert_eq!(
            rc.reconcile(&mut guard, &fatal, false, &mut finished),
            ReconcileOutcome::Failed(FailureAction::AbortStream)
        );
        drop(guard);
        assert_eq!(finished.len(), 4);
        assert!(finished[1..]
            .iter()
            .all(|f| f.completion.result == Err(ExecutionError::Aborted)));
        assert_eq!(s.query_pending(), 0);
        assert!(s.failure().is_aborted());
    }

    #[test]
    fn test_lazy_predecessors_retire_on_later_report() {
        let config = TaskRingConfig::builder()
            .with_ring_depth(8)
            .with_eager_completion(false)
            .build()
            .unwrap();
        let s = Stream::new(
            StreamId(1),
            RingId(0),
            RingId(1),
            &config.stream,
            &config.flow,
            &StreamOptions::new(),
        );
        let rc = Reconciler::default();
        let a = issue(&s, TaskPayload::kernel(1, 0));
        let b = issue(&s, TaskPayload::kernel(1, 0));
        let barrier = issue(&s, TaskPayload::Barrier);

        let mut guard = s.lock_sync();
        let mut finished = Vec::new();
        assert_eq!(
            rc.reconcile(&mut guard, &report(&s, barrier, 3), false, &mut finished),
            ReconcileOutcome::Retired
        );
        drop(guard);
        let order: Vec<_> = finished.iter().map(|f| f.completion.task_id).collect();
        assert_eq!(order, vec![a, b, barrier]);
    }

    #[test]
    fn test_decoder_fault_retries_once() {
        let s = stream(FailureMode::Continuing);
        let rc = Reconciler::default();
        let id = issue(&s, TaskPayload::Decode { input: 1, output: 2 });
        let fault = report(&s, id, 1).with_error(error_bits::DECODER_FAULT, 5);

        let mut guard = s.lock_sync();
        let mut finished = Vec::new();
        assert_eq!(
            rc.reconcile(&mut guard, &fault, false, &mut finished),
            ReconcileOutcome::Retrying
        );
        drop(guard);
        assert!(finished.is_empty());

        let mut submit = s.lock_submit();
        let retries = submit.take_retries();
        assert_eq!(retries, vec![id]);
        submit.issue(&NullDriver, id).unwrap();
        drop(submit);

        let fault = report(&s, id, 2).with_error(error_bits::DECODER_FAULT, 5);
        let mut guard = s.lock_sync();
        assert!(matches!(
            rc.reconcile(&mut guard, &fault, false, &mut finished),
            ReconcileOutcome::Failed(_)
        ));
        drop(guard);
        assert_eq!(
            finished[0].completion.result,
            Err(ExecutionError::DecoderFault { code: 5, retries: 1 })
        );
        assert_eq!(s.stats().retried, 1);
    }
}
