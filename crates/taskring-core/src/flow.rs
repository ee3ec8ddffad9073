//! Admission control.
//!
//! The flow controller never blocks. It looks at a snapshot of a stream and
//! tells the engine whether to admit, to reconcile first, to wait, to drain
//! or to reject.

use crate::config::FlowConfig;
use crate::error::AdmissionError;
use crate::failure::{FailureMode, FailureSnapshot};
use crate::types::StreamId;

/// Load of a stream at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSnapshot {
    /// Tasks admitted and not yet retired.
    pub pending: u32,
    /// Ring entries held by those tasks.
    pub pending_entries: u32,
    /// Entries written to the ring that the device has not consumed.
    pub unconsumed: u32,
    /// Free arena slots.
    pub arena_free: u32,
    /// Usable arena slots.
    pub pool_capacity: u32,
    /// Occupied part of the persistent window (graph-bound streams).
    pub persistent_len: u32,
    /// The stream is driven by a graph.
    pub bound: bool,
    /// Failure state.
    pub failure: FailureSnapshot,
    /// The device lost its transport.
    pub device_aborted: bool,
}

/// What the caller wants to admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    /// Ring entries.
    pub entries: u32,
    /// Arena slots (2 when a flip marker rides along).
    pub slots: u32,
    /// Control channel task.
    pub maintenance: bool,
}

impl Demand {
    /// Demand of an ordinary single-entry task.
    pub fn single() -> Self {
        Self {
            entries: 1,
            slots: 1,
            maintenance: false,
        }
    }
}

/// Admission verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Go ahead.
    Admit,
    /// Go ahead after a reconciliation pass.
    Limited,
    /// No room; wait for completions and ask again.
    Full(AdmissionError),
    /// Abort-on-failure stream close to full: drain everything first.
    Drain,
    /// Fail the call.
    Reject(AdmissionError),
}

/// Per-stream admission policy.
#[derive(Debug, Clone)]
pub struct FlowController {
    stream_id: StreamId,
    depth: u32,
    high_water: u32,
    wait_exec: u32,
    drain_margin: u32,
}

impl FlowController {
    /// Create a controller for a ring of `depth`.
    pub fn new(stream_id: StreamId, depth: u32, config: &FlowConfig) -> Self {
        Self {
            stream_id,
            depth,
            high_water: config.high_water_mark(depth),
            wait_exec: config.wait_exec_threshold(depth),
            drain_margin: config.abort_drain_margin,
        }
    }

    /// Ring depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Pending count at which the stream is limited.
    pub fn high_water_mark(&self) -> u32 {
        self.high_water
    }

    /// Decide on `demand` given `snapshot`.
    pub fn admit(&self, snapshot: &FlowSnapshot, demand: Demand) -> AdmissionDecision {
        if snapshot.device_aborted {
            return AdmissionDecision::Reject(AdmissionError::DeviceAborted);
        }

        if !demand.maintenance {
            if let Err(error) = snapshot.failure.check_admission(self.stream_id) {
                return AdmissionDecision::Reject(error);
            }
            if snapshot.failure.mode == FailureMode::AbortOnFailure
                && snapshot.pending + demand.slots
                    > snapshot.pool_capacity.saturating_sub(self.drain_margin)
                && snapshot.pending > 0
            {
                return AdmissionDecision::Drain;
            }
        }

        if snapshot.bound && snapshot.persistent_len + demand.entries > self.depth {
            return AdmissionDecision::Reject(AdmissionError::GraphOverflow(self.stream_id));
        }

        if demand.entries > self.depth {
            return AdmissionDecision::Reject(AdmissionError::RingFull {
                stream_id: self.stream_id,
                in_flight: snapshot.pending_entries,
                depth: self.depth,
            });
        }

        if snapshot.pending_entries + demand.entries > self.depth {
            return AdmissionDecision::Full(AdmissionError::RingFull {
                stream_id: self.stream_id,
                in_flight: snapshot.pending_entries,
                depth: self.depth,
            });
        }

        if snapshot.arena_free < demand.slots {
            return AdmissionDecision::Full(AdmissionError::PoolExhausted {
                stream_id: self.stream_id,
                capacity: snapshot.pool_capacity,
            });
        }

        if snapshot.pending >= self.high_water || snapshot.unconsumed >= self.wait_exec {
            return AdmissionDecision::Limited;
        }

        AdmissionDecision::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle() -> FlowSnapshot {
        FlowSnapshot {
            pending: 0,
            pending_entries: 0,
            unconsumed: 0,
            arena_free: 7,
            pool_capacity: 7,
            persistent_len: 0,
            bound: false,
            failure: FailureSnapshot {
                mode: FailureMode::Continuing,
                failing: false,
                aborted: false,
            },
            device_aborted: false,
        }
    }

    fn controller() -> FlowController {
        FlowController::new(StreamId(1), 4, &FlowConfig::default())
    }

    #[test]
    fn test_admit_then_limited_then_full() {
        let fc = controller();
        assert_eq!(fc.admit(&idle(), Demand::single()), AdmissionDecision::Admit);

        let busy = FlowSnapshot {
            pending: 3,
            pending_entries: 3,
            ..idle()
        };
        assert_eq!(fc.admit(&busy, Demand::single()), AdmissionDecision::Limited);

        let full = FlowSnapshot {
            pending: 4,
            pending_entries: 4,
            ..idle()
        };
        assert!(matches!(
            fc.admit(&full, Demand::single()),
            AdmissionDecision::Full(AdmissionError::RingFull { in_flight: 4, depth: 4, .. })
        ));
    }

    #[test]
    fn test_wait_exec_threshold_limits() {
        let fc = controller();
        let snap = FlowSnapshot {
            pending: 1,
            pending_entries: 1,
            unconsumed: 3,
            ..idle()
        };
        assert_eq!(fc.admit(&snap, Demand::single()), AdmissionDecision::Limited);
    }

    #[test]
    fn test_failure_states_reject() {
        let fc = controller();
        let mut snap = idle();
        snap.failure.aborted = true;
        assert_eq!(
            fc.admit(&snap, Demand::single()),
            AdmissionDecision::Reject(AdmissionError::Aborted(StreamId(1)))
        );
        let maintenance = Demand {
            maintenance: true,
            ..Demand::single()
        };
        assert_eq!(fc.admit(&snap, maintenance), AdmissionDecision::Admit);

        let mut snap = idle();
        snap.failure.mode = FailureMode::StopOnFailure;
        snap.failure.failing = true;
        assert_eq!(
            fc.admit(&snap, Demand::single()),
            AdmissionDecision::Reject(AdmissionError::Stopped(StreamId(1)))
        );

        let snap = FlowSnapshot {
            device_aborted: true,
            ..idle()
        };
        assert_eq!(
            fc.admit(&snap, maintenance),
            AdmissionDecision::Reject(AdmissionError::DeviceAborted)
        );
    }

    #[test]
    fn test_abort_on_failure_drains_near_full() {
        let fc = controller();
        let mut snap = FlowSnapshot {
            pending: 5,
            pending_entries: 2,
            arena_free: 2,
            ..idle()
        };
        snap.failure.mode = FailureMode::AbortOnFailure;
        assert_eq!(fc.admit(&snap, Demand::single()), AdmissionDecision::Drain);
    }

    #[test]
    fn test_bound_stream_rejects_overflow() {
        let fc = controller();
        let snap = FlowSnapshot {
            bound: true,
            persistent_len: 4,
            ..idle()
        };
        assert_eq!(
            fc.admit(&snap, Demand::single()),
            AdmissionDecision::Reject(AdmissionError::GraphOverflow(StreamId(1)))
        );
    }

    #[test]
    fn test_pool_exhausted() {
        let fc = controller();
        let snap = FlowSnapshot {
            pending: 1,
            pending_entries: 1,
            arena_free: 1,
            ..idle()
        };
        let demand = Demand {
            slots: 2,
            ..Demand::single()
        };
        assert!(matches!(
            fc.admit(&snap, demand),
            AdmissionDecision::Full(AdmissionError::PoolExhausted { .. })
        ));
    }
}
