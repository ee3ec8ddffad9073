//! Maintenance operations issued through the control channel.

mod common;

use std::sync::Arc;

use common::{config, ring};
use taskring::prelude::*;

fn maintenance_entries(sim: &SimDriver) -> Vec<(u32, u64)> {
    sim.submitted()
        .into_iter()
        .filter(|e| e.kind == TaskKind::Maintenance as u8)
        .map(|e| (e.arg2, e.arg0))
        .collect()
}

#[test]
fn test_bind_and_unbind_model() {
    for strategy in [EngineStrategy::Direct, EngineStrategy::Threaded] {
        let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
        let ring = ring(&sim, config(strategy, 16));
        let stream = ring.create_stream(StreamOptions::default()).unwrap();

        stream.control(ControlOp::ModelBind { model_id: 7 }).unwrap();
        assert!(stream.stream().is_bound());
        stream.control(ControlOp::ModelUnbind { model_id: 7 }).unwrap();
        assert!(!stream.stream().is_bound());

        assert_eq!(maintenance_entries(&sim), vec![(3, 7), (4, 7)]);
    }
}

#[test]
fn test_operations_reach_the_device() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Threaded, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    stream.control(ControlOp::NotifyReset { notify_id: 5 }).unwrap();
    stream
        .control(ControlOp::DebugRegister { buffer: 0x8000 })
        .unwrap();
    stream.control(ControlOp::DebugUnregister).unwrap();

    assert_eq!(
        maintenance_entries(&sim),
        vec![(2, 5), (5, 0x8000), (6, 0)]
    );
    // maintenance always asks for a report
    assert!(sim
        .submitted()
        .iter()
        .filter(|e| e.kind == TaskKind::Maintenance as u8)
        .all(|e| e.wants_report()));
    assert_eq!(stream.query_pending(), 0);
}

#[test]
fn test_set_failure_mode_through_device() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    stream.set_failure_mode(FailureMode::StopOnFailure).unwrap();
    assert_eq!(stream.failure().mode, FailureMode::StopOnFailure);
    assert_eq!(
        maintenance_entries(&sim),
        vec![(7, FailureMode::StopOnFailure.code())]
    );
}

#[test]
fn test_rejected_transition_sends_nothing() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring
        .create_stream(StreamOptions::default().with_failure_mode(FailureMode::AbortOnFailure))
        .unwrap();

    assert!(stream.set_failure_mode(FailureMode::StopOnFailure).is_err());
    assert!(maintenance_entries(&sim).is_empty());
}

#[test]
fn test_failed_operation_is_reported() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();

    sim.inject_fault(stream.id(), TaskId(0), Fault::new(error_bits::TRAP, 0x11));
    let err = stream.control(ControlOp::ModelBind { model_id: 1 }).unwrap_err();
    match err {
        TaskRingError::Sync(SyncError::TaskFailed { error, .. }) => {
            assert_eq!(error, ExecutionError::Trap { code: 0x11 });
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // the host-side effect is not applied
    assert!(!stream.stream().is_bound());
}

#[test]
fn test_clear_works_on_aborted_stream() {
    let sim = Arc::new(SimDriver::new());
    let ring = ring(&sim, config(EngineStrategy::Threaded, 16));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();

    stream.submit(TaskPayload::kernel(0x70, 0)).unwrap();
    stream.submit(TaskPayload::kernel(0x70, 1)).unwrap();
    assert!(common::eventually(std::time::Duration::from_secs(2), || {
        sim.queued(sq) == 2
    }));
    stream.abort();

    sim.set_mode(CompletionMode::Immediate);
    stream.control(ControlOp::StreamClear).unwrap();
    assert_eq!(sim.queued(sq), 0);
    assert!(!stream.failure().aborted);

    stream.submit(TaskPayload::kernel(0x70, 2)).unwrap();
    stream.synchronize(None).unwrap();
}

#[test]
fn test_bound_stream_retires_graph_in_batch() {
    let sim = Arc::new(SimDriver::with_mode(CompletionMode::Immediate));
    let ring = ring(&sim, config(EngineStrategy::Direct, 8));
    let stream = ring.create_stream(StreamOptions::default()).unwrap();
    let sq = sim.ring_for_stream(stream.id()).unwrap();
    let outcomes = common::Outcomes::default();

    stream.control(ControlOp::ModelBind { model_id: 9 }).unwrap();
    sim.set_mode(CompletionMode::Manual);
    let written = sim.submitted().len();

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            stream
                .submit_with_callback(TaskPayload::kernel(0x90, i), outcomes.callback())
                .unwrap(),
        );
    }
    ids.push(
        stream
            .submit_with_callback(TaskPayload::Barrier, outcomes.callback())
            .unwrap(),
    );
    assert_eq!(stream.stream().persistent_window().len(), 7);

    // only the closing barrier asks for a report
    let graph = &sim.submitted()[written..];
    assert_eq!(graph.len(), 7);
    assert_eq!(graph.iter().filter(|e| e.wants_report()).count(), 1);

    // the graph must fit the ring; no backpressure
    let err = stream
        .submit(TaskPayload::Multi {
            functions: vec![0x10, 0x20],
        })
        .unwrap_err();
    assert_eq!(
        err.as_admission(),
        Some(&AdmissionError::GraphOverflow(stream.id()))
    );
    assert_eq!(stream.query_pending(), 7);

    assert_eq!(sim.complete(sq, 7), 7);
    stream.synchronize(None).unwrap();
    assert_eq!(outcomes.ids(), ids);
    assert_eq!(stream.query_pending(), 0);
    assert!(stream.stream().persistent_window().is_empty());

    sim.set_mode(CompletionMode::Immediate);
    stream.control(ControlOp::ModelUnbind { model_id: 9 }).unwrap();
    assert!(!stream.stream().is_bound());
    stream
        .submit(TaskPayload::Multi {
            functions: vec![0x10, 0x20],
        })
        .unwrap();
    stream.synchronize(None).unwrap();
}
