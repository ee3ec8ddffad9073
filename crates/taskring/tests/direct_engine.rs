//! Integration tests for the direct (inline) dispatch strategy.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, ring, Outcomes};
use taskring::prelude::*;

/// Admission stops at ring depth and resumes once the device consumes work.
#[test]
fn test_backpressure_at_ring_depth() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 4));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();

    for i in 0..4 {
        stream.submit(TaskPayload::kernel(0x100, i)).unwrap();
    }
    assert_eq!(stream.query_pending(), 4);

    let err = stream.submit(TaskPayload::kernel(0x100, 4)).unwrap_err();
    assert!(
        matches!(err, TaskRingError::Admission(AdmissionError::RingFull { depth: 4, .. })),
        "unexpected error: {err}"
    );
    assert_eq!(sim.queued(sq), 4);

    assert_eq!(sim.complete(sq, 4), 4);
    let id = stream.submit(TaskPayload::kernel(0x100, 4)).unwrap();
    assert_eq!(id, LogicalTaskId(4));

    sim.complete_all();
    stream.synchronize(None).unwrap();
    assert_eq!(stream.query_pending(), 0);
    assert_eq!(stream.stats().retired, 5);
}

/// Every task retires once even when the device reports twice.
#[test]
fn test_duplicate_reports_retire_once() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    sim.duplicate_reports(true);
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let outcomes = Outcomes::default();

    for i in 0..10 {
        stream
            .submit_with_callback(TaskPayload::kernel(0x200, i), outcomes.callback())
            .unwrap();
    }
    stream.synchronize(None).unwrap();

    assert_eq!(outcomes.len(), 10);
    let stats = stream.stats();
    assert_eq!(stats.retired, 10);
    assert!(stats.duplicates >= 10, "duplicates: {}", stats.duplicates);
}

/// Tasks that do not ask for a report retire in ring order, ahead of the
/// barrier that follows them.
#[test]
fn test_lazy_tasks_retire_in_order() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring
        .create_stream(StreamOptions::default().with_eager_completion(false))
        .unwrap();
    let outcomes = Outcomes::default();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            stream
                .submit_with_callback(TaskPayload::kernel(0x300, i), outcomes.callback())
                .unwrap(),
        );
    }
    ids.push(
        stream
            .submit_with_callback(TaskPayload::Barrier, outcomes.callback())
            .unwrap(),
    );

    let reporting = sim.submitted().iter().filter(|e| e.wants_report()).count();
    assert_eq!(reporting, 1);

    sim.complete_all();
    stream.synchronize(None).unwrap();
    assert_eq!(outcomes.ids(), ids);
}

/// Lazy tasks also retire from the hardware head alone.
#[test]
fn test_lazy_tasks_retire_from_head() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring
        .create_stream(StreamOptions::default().with_eager_completion(false))
        .unwrap();

    let a = stream.submit(TaskPayload::kernel(0x400, 0)).unwrap();
    let b = stream.submit(TaskPayload::kernel(0x400, 1)).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();
    sim.complete(sq, 1);

    stream.synchronize_task(a, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(stream.query_pending(), 1);
    assert!(stream
        .synchronize_task(b, Some(Duration::from_millis(20)))
        .is_err());

    sim.complete_all();
    stream.synchronize(None).unwrap();
    assert_eq!(stream.query_pending(), 0);
}

/// A fatal error on one entry of a multi-entry task retires the task at
/// once; the remaining entry reports are ignored.
#[test]
fn test_multi_entry_fatal_drains_task() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let outcomes = Outcomes::default();

    sim.inject_fault(
        stream.id(),
        TaskId(0),
        Fault::new(error_bits::EXCEPTION, 7).at_entry(1),
    );
    let multi = stream
        .submit_with_callback(
            TaskPayload::Multi {
                functions: vec![0x10, 0x20, 0x30],
            },
            outcomes.callback(),
        )
        .unwrap();
    let after = stream
        .submit_with_callback(TaskPayload::kernel(0x40, 0), outcomes.callback())
        .unwrap();

    match stream.synchronize(None) {
        Err(SyncError::TaskFailed { task_id, error, .. }) => {
            assert_eq!(task_id, multi);
            assert_eq!(error, ExecutionError::Exception { code: 7 });
        }
        other => panic!("expected task failure, got {other:?}"),
    }
    // reported once, then cleared
    stream.synchronize(None).unwrap();

    assert_eq!(
        outcomes.get(multi).map(|c| c.result),
        Some(Err(ExecutionError::Exception { code: 7 }))
    );
    assert_eq!(outcomes.get(after).map(|c| c.result), Some(Ok(())));
    assert_eq!(stream.stats().errors, 1);
}

/// A recoverable decoder fault is retried once.
#[test]
fn test_decoder_fault_retried_once() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DECODER_FAULT, 3));
    stream
        .submit(TaskPayload::Decode {
            input: 0x1000,
            output: 0x2000,
        })
        .unwrap();
    stream.synchronize(None).unwrap();

    assert_eq!(stream.stats().retried, 1);
    let attempts: Vec<_> = sim
        .submitted()
        .into_iter()
        .filter(|e| e.kind == TaskKind::Decode as u8)
        .collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].flags & taskring::command::FLAG_RETRY, 0);
    assert_ne!(attempts[1].flags & taskring::command::FLAG_RETRY, 0);
}

/// A second decoder fault exhausts the retry budget and fails the task.
#[test]
fn test_decoder_fault_retry_limit() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DECODER_FAULT, 3));
    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DECODER_FAULT, 4));
    let id = stream
        .submit(TaskPayload::Decode {
            input: 0x1000,
            output: 0x2000,
        })
        .unwrap();

    match stream.synchronize(None) {
        Err(SyncError::TaskFailed { task_id, error, .. }) => {
            assert_eq!(task_id, id);
            assert_eq!(error, ExecutionError::DecoderFault { code: 4, retries: 1 });
        }
        other => panic!("expected decoder failure, got {other:?}"),
    }
}

/// Malformed commands are never retried, decoder or not.
#[test]
fn test_malformed_command_not_retried() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    sim.inject_fault(
        stream.id(),
        TaskId(0),
        Fault::new(error_bits::SQE_ERROR | error_bits::DECODER_FAULT, 9),
    );
    stream
        .submit(TaskPayload::Decode {
            input: 0x1000,
            output: 0x2000,
        })
        .unwrap();

    let err = stream.synchronize(None).unwrap_err();
    assert!(matches!(
        err,
        SyncError::TaskFailed {
            error: ExecutionError::MalformedCommand { code: 9 },
            ..
        }
    ));
    assert_eq!(stream.stats().retried, 0);
}

/// Debug overflow is informational: the task still succeeds.
#[test]
fn test_debug_overflow_is_a_warning() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let outcomes = Outcomes::default();

    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DEBUG_OVERFLOW, 0));
    let id = stream
        .submit_with_callback(TaskPayload::kernel(0x500, 0), outcomes.callback())
        .unwrap();
    stream.synchronize(None).unwrap();
    assert_eq!(outcomes.get(id).map(|c| c.result), Some(Ok(())));
}

/// Sweeps are counted per stream and per engine.
#[test]
fn test_sweep_statistics() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    stream.submit(TaskPayload::kernel(0x600, 0)).unwrap();
    stream.synchronize(None).unwrap();

    assert!(stream.stats().sweeps >= 1);
    let stats = ring.stats();
    assert!(stats.engine.sweeps >= 1);
    assert_eq!(stats.engine.tasks_issued, 1);
    assert_eq!(stats.engine.reports_received, 1);
}

/// A task that retired behind a retrying one does not count as retired
/// until the retry finishes.
#[test]
fn test_sync_waits_for_outstanding_retry() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();
    let outcomes = Outcomes::default();

    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DECODER_FAULT, 3));
    let a = stream
        .submit_with_callback(
            TaskPayload::Decode {
                input: 0x1000,
                output: 0x2000,
            },
            outcomes.callback(),
        )
        .unwrap();
    let b = stream
        .submit_with_callback(TaskPayload::kernel(0x700, 0), outcomes.callback())
        .unwrap();
    assert_eq!(sim.complete(sq, 2), 2);

    let err = stream
        .synchronize(Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)), "got {err:?}");
    assert_eq!(stream.query_pending(), 1);
    assert!(stream
        .synchronize_task(b, Some(Duration::from_millis(20)))
        .is_err());
    assert!(outcomes.get(a).is_none());

    // the retry went to the ring behind b
    assert_eq!(sim.complete(sq, 1), 1);
    stream.synchronize(Some(Duration::from_secs(1))).unwrap();
    stream.synchronize_task(b, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(stream.query_pending(), 0);
    assert_eq!(stream.stats().retried, 1);
    assert_eq!(outcomes.get(a).map(|c| c.result), Some(Ok(())));
    assert_eq!(outcomes.get(b).map(|c| c.result), Some(Ok(())));
}

/// A retry that fails again is reported by the sync that waited for it.
#[test]
fn test_sync_reports_failed_retry() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();

    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DECODER_FAULT, 3));
    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::DECODER_FAULT, 4));
    let a = stream
        .submit(TaskPayload::Decode {
            input: 0x1000,
            output: 0x2000,
        })
        .unwrap();
    stream.submit(TaskPayload::kernel(0x700, 1)).unwrap();
    sim.complete(sq, 2);

    let err = stream
        .synchronize(Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)), "got {err:?}");

    sim.complete(sq, 1);
    match stream.synchronize(Some(Duration::from_secs(1))) {
        Err(SyncError::TaskFailed { task_id, error, .. }) => {
            assert_eq!(task_id, a);
            assert_eq!(error, ExecutionError::DecoderFault { code: 4, retries: 1 });
        }
        other => panic!("expected decoder failure, got {other:?}"),
    }
    assert_eq!(stream.query_pending(), 0);
}

/// When sweeping for space fails, the task that could not be written is
/// failed instead of left pending.
#[test]
fn test_failed_sweep_fails_unissued_task() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let outcomes = Outcomes::default();

    sim.free_ring(stream.stream().cq()).unwrap();
    sim.reject_enqueues(1);
    let err = stream
        .submit_with_callback(TaskPayload::kernel(0x800, 0), outcomes.callback())
        .unwrap_err();
    assert!(
        matches!(err.as_sync(), Some(SyncError::Driver(DriverError::UnknownRing(_)))),
        "got {err:?}"
    );

    assert_eq!(stream.query_pending(), 0);
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes.get(LogicalTaskId(0)).map(|c| c.result),
        Some(Err(ExecutionError::SubmitFailed(_)))
    ));
    assert!(!ring.stats().transport_down);
}

/// Multi-entry tasks carry between 1 and 255 functions.
#[test]
fn test_multi_function_count_bounds() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Direct, 256));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();

    for count in [0u64, 256, 300] {
        let err = stream
            .submit(TaskPayload::Multi {
                functions: (0..count).collect(),
            })
            .unwrap_err();
        assert!(
            matches!(
                err.as_admission(),
                Some(AdmissionError::InvalidPayload {
                    kind: TaskKind::Multi,
                    ..
                })
            ),
            "{count} functions: {err:?}"
        );
    }
    assert_eq!(stream.query_pending(), 0);
    assert_eq!(sim.enqueue_attempts(), 0);

    stream
        .submit(TaskPayload::Multi {
            functions: (0..255).map(|f| 0x1000 + f).collect(),
        })
        .unwrap();
    assert_eq!(sim.queued(sq), 255);
    let entries = sim.submitted();
    assert_eq!(entries.len(), 255);
    assert!(entries.iter().all(|e| e.entry_count == 255));
    assert_eq!(entries[254].entry_index, 254);

    sim.complete_all();
    stream.synchronize(None).unwrap();
}
