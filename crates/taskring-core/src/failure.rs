//! Per-stream failure and abort state.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, ExecutionError, SyncError, TaskRingError};
use crate::types::{LogicalTaskId, StreamId};

/// How a stream reacts to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Record the error; admission is unaffected.
    #[default]
    Continuing,
    /// Record the error and stop admitting until it is observed.
    StopOnFailure,
    /// Retire everything outstanding with an abort error and fail fast.
    AbortOnFailure,
}

impl FailureMode {
    /// Wire code used by the control channel.
    pub fn code(self) -> u64 {
        match self {
            FailureMode::Continuing => 0,
            FailureMode::StopOnFailure => 1,
            FailureMode::AbortOnFailure => 2,
        }
    }
}

/// What the engine must do after a task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Keep going.
    Record,
    /// Stop admitting; outstanding work drains.
    HaltAdmission,
    /// Retire every outstanding task with an abort error.
    AbortStream,
}

/// Why a stream was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// A task failed on an abort-on-failure stream.
    TaskFailure {
        /// Failed task.
        task_id: LogicalTaskId,
        /// Its error.
        error: ExecutionError,
    },
    /// Requested by the caller.
    User,
    /// The device transport went down.
    TransportDown(String),
    /// The stream is being destroyed.
    Destroyed,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::TaskFailure { task_id, error } => {
                write!(f, "task {task_id} failed: {error}")
            }
            AbortCause::User => write!(f, "user request"),
            AbortCause::TransportDown(reason) => write!(f, "transport down: {reason}"),
            AbortCause::Destroyed => write!(f, "stream destroyed"),
        }
    }
}

/// Read-only view used by the flow controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureSnapshot {
    /// Current mode.
    pub mode: FailureMode,
    /// An unobserved error halts admission.
    pub failing: bool,
    /// The stream is aborted.
    pub aborted: bool,
}

impl FailureSnapshot {
    /// Whether ordinary work may be admitted to `stream_id`. Maintenance
    /// tasks skip this check so a stream can always be cleared.
    pub fn check_admission(&self, stream_id: StreamId) -> Result<(), AdmissionError> {
        if self.aborted {
            return Err(AdmissionError::Aborted(stream_id));
        }
        if self.failing && self.mode == FailureMode::StopOnFailure {
            return Err(AdmissionError::Stopped(stream_id));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FailureState {
    mode: FailureMode,
    failing: bool,
    error: Option<(LogicalTaskId, ExecutionError)>,
    aborted: Option<AbortCause>,
}

/// Failure state machine of one stream.
#[derive(Debug)]
pub struct FailureController {
    stream_id: StreamId,
    state: Mutex<FailureState>,
}

impl FailureController {
    /// Create a controller in `mode`.
    pub fn new(stream_id: StreamId, mode: FailureMode) -> Self {
        Self {
            stream_id,
            state: Mutex::new(FailureState {
                mode,
                failing: false,
                error: None,
                aborted: None,
            }),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> FailureMode {
        self.state.lock().mode
    }

    /// Change the mode. `AbortOnFailure` can never be left.
    pub fn set_mode(&self, mode: FailureMode) -> Result<(), TaskRingError> {
        let mut state = self.state.lock();
        if state.mode == FailureMode::AbortOnFailure && mode != FailureMode::AbortOnFailure {
            return Err(TaskRingError::InvalidTransition {
                from: state.mode,
                to: mode,
            });
        }
        if state.mode != mode {
            tracing::info!(
                stream_id = %self.stream_id,
                from = ?state.mode,
                to = ?mode,
                "failure mode changed"
            );
        }
        state.mode = mode;
        Ok(())
    }

    /// Snapshot for admission decisions.
    pub fn snapshot(&self) -> FailureSnapshot {
        let state = self.state.lock();
        FailureSnapshot {
            mode: state.mode,
            failing: state.failing,
            aborted: state.aborted.is_some(),
        }
    }

    /// Returns true if the stream is aborted.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted.is_some()
    }

    /// Record a fatal task error and decide what happens next.
    ///
    /// `device_aborting` escalates stop-on-failure streams to
    /// abort-on-failure.
    pub fn on_task_error(
        &self,
        task_id: LogicalTaskId,
        error: &ExecutionError,
        device_aborting: bool,
    ) -> FailureAction {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some((task_id, error.clone()));
        }

        if state.mode == FailureMode::StopOnFailure && device_aborting {
            tracing::warn!(stream_id = %self.stream_id, "escalating to abort-on-failure");
            state.mode = FailureMode::AbortOnFailure;
        }

        match state.mode {
            FailureMode::Continuing => FailureAction::Record,
            FailureMode::StopOnFailure => {
                state.failing = true;
                FailureAction::HaltAdmission
            }
            FailureMode::AbortOnFailure => {
                if state.aborted.is_none() {
                    state.aborted = Some(AbortCause::TaskFailure {
                        task_id,
                        error: error.clone(),
                    });
                }
                FailureAction::AbortStream
            }
        }
    }

    /// Mark the stream aborted. Returns true if it was not aborted before.
    pub fn abort(&self, cause: AbortCause) -> bool {
        let mut state = self.state.lock();
        if state.aborted.is_some() {
            return false;
        }
        tracing::warn!(stream_id = %self.stream_id, cause = %cause, "stream aborted");
        state.aborted = Some(cause);
        true
    }

    /// Error a synchronization call must report.
    ///
    /// Clears the recorded error in `Continuing` and `StopOnFailure`; an
    /// aborted or abort-on-failure stream keeps reporting it.
    pub fn take_sync_error(&self) -> Option<SyncError> {
        let mut state = self.state.lock();
        if let Some(cause) = &state.aborted {
            return Some(match cause {
                AbortCause::TaskFailure { task_id, error } => SyncError::TaskFailed {
                    stream_id: self.stream_id,
                    task_id: *task_id,
                    error: error.clone(),
                },
                AbortCause::TransportDown(reason) => SyncError::TransportDown(reason.clone()),
                AbortCause::User | AbortCause::Destroyed => SyncError::Aborted(self.stream_id),
            });
        }

        let (task_id, error) = if state.mode == FailureMode::AbortOnFailure {
            state.error.clone()?
        } else {
            state.failing = false;
            state.error.take()?
        };
        Some(SyncError::TaskFailed {
            stream_id: self.stream_id,
            task_id,
            error,
        })
    }

    /// Forget errors and abort state. The mode is kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.failing = false;
        state.error = None;
        state.aborted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAULT: ExecutionError = ExecutionError::Exception { code: 1 };

    #[test]
    fn test_continuing_reports_error_once() {
        let fc = FailureController::new(StreamId(1), FailureMode::Continuing);
        assert_eq!(
            fc.on_task_error(LogicalTaskId(3), &FAULT, false),
            FailureAction::Record
        );
        assert!(fc.snapshot().check_admission(StreamId(1)).is_ok());
        assert!(matches!(
            fc.take_sync_error(),
            Some(SyncError::TaskFailed { task_id: LogicalTaskId(3), .. })
        ));
        assert!(fc.take_sync_error().is_none());
    }

    #[test]
    fn test_stop_on_failure_halts_until_observed() {
        let fc = FailureController::new(StreamId(1), FailureMode::StopOnFailure);
        assert_eq!(
            fc.on_task_error(LogicalTaskId(0), &FAULT, false),
            FailureAction::HaltAdmission
        );
        assert_eq!(
            fc.snapshot().check_admission(StreamId(1)),
            Err(AdmissionError::Stopped(StreamId(1)))
        );
        assert!(fc.take_sync_error().is_some());
        assert!(fc.snapshot().check_admission(StreamId(1)).is_ok());
    }

    #[test]
    fn test_abort_on_failure_persists() {
        let fc = FailureController::new(StreamId(2), FailureMode::AbortOnFailure);
        assert_eq!(
            fc.on_task_error(LogicalTaskId(5), &FAULT, false),
            FailureAction::AbortStream
        );
        assert_eq!(
            fc.snapshot().check_admission(StreamId(2)),
            Err(AdmissionError::Aborted(StreamId(2)))
        );
        assert!(fc.take_sync_error().is_some());
        assert!(fc.take_sync_error().is_some());
        fc.clear();
        assert!(fc.take_sync_error().is_none());
        assert_eq!(fc.mode(), FailureMode::AbortOnFailure);
    }

    #[test]
    fn test_no_downgrade_from_abort() {
        let fc = FailureController::new(StreamId(1), FailureMode::Continuing);
        fc.set_mode(FailureMode::StopOnFailure).unwrap();
        fc.set_mode(FailureMode::AbortOnFailure).unwrap();
        assert!(matches!(
            fc.set_mode(FailureMode::Continuing),
            Err(TaskRingError::InvalidTransition { .. })
        ));
        assert!(fc.set_mode(FailureMode::AbortOnFailure).is_ok());
    }

    #[test]
    fn test_stop_escalates_when_device_aborting() {
        let fc = FailureController::new(StreamId(1), FailureMode::StopOnFailure);
        assert_eq!(
            fc.on_task_error(LogicalTaskId(0), &FAULT, true),
            FailureAction::AbortStream
        );
        assert_eq!(fc.mode(), FailureMode::AbortOnFailure);
    }

    #[test]
    fn test_transport_down_surfaces() {
        let fc = FailureController::new(StreamId(1), FailureMode::Continuing);
        assert!(fc.abort(AbortCause::TransportDown("heartbeat".into())));
        assert!(!fc.abort(AbortCause::User));
        assert_eq!(
            fc.take_sync_error(),
            Some(SyncError::TransportDown("heartbeat".into()))
        );
    }
}
