//! Error types for taskring.

use std::time::Duration;

use thiserror::Error;

use crate::failure::FailureMode;
use crate::task::TaskKind;
use crate::types::{LogicalTaskId, RingId, StreamId};

/// Result type alias for taskring operations.
pub type Result<T> = std::result::Result<T, TaskRingError>;

/// A task could not be admitted to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The hardware ring has no room; retry after completions are reconciled.
    #[error("stream {stream_id} ring full ({in_flight} of {depth} entries in flight)")]
    RingFull {
        /// Stream that rejected the task.
        stream_id: StreamId,
        /// Entries issued and not yet consumed.
        in_flight: u32,
        /// Ring depth.
        depth: u32,
    },

    /// Every task slot of the stream is occupied.
    #[error("stream {stream_id} task pool exhausted ({capacity} slots)")]
    PoolExhausted {
        /// Stream that rejected the task.
        stream_id: StreamId,
        /// Usable slots.
        capacity: u32,
    },

    /// The stream was aborted; nothing more is accepted until it is cleared.
    #[error("stream {0} is aborted")]
    Aborted(StreamId),

    /// The stream is in stop-on-failure and has an unobserved error.
    #[error("stream {0} stopped after a task failure")]
    Stopped(StreamId),

    /// A graph-bound stream cannot hold the task without wrapping.
    #[error("stream {0} is bound to a graph that does not fit the ring")]
    GraphOverflow(StreamId),

    /// The engine is shutting down.
    #[error("dispatch engine is stopped")]
    EngineStopped,

    /// The device lost its transport and aborted all streams.
    #[error("device aborted")]
    DeviceAborted,

    /// The payload cannot be encoded as ring entries.
    #[error("invalid {kind:?} payload: {reason}")]
    InvalidPayload {
        /// Kind of the rejected task.
        kind: TaskKind,
        /// What is wrong with it.
        reason: String,
    },
}

impl AdmissionError {
    /// Returns true if the caller may retry once backpressure clears.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::RingFull { .. } | AdmissionError::PoolExhausted { .. }
        )
    }
}

/// A task failed on the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The task raised an exception.
    #[error("task exception (code {code:#x})")]
    Exception {
        /// Device error code.
        code: u32,
    },

    /// The task trapped.
    #[error("task trap (code {code:#x})")]
    Trap {
        /// Device error code.
        code: u32,
    },

    /// The device timed the task out.
    #[error("task timed out on device (code {code:#x})")]
    DeviceTimeout {
        /// Device error code.
        code: u32,
    },

    /// The decoder fault persisted after the allowed retries.
    #[error("decoder fault after {retries} retries (code {code:#x})")]
    DecoderFault {
        /// Device error code.
        code: u32,
        /// Retries already spent.
        retries: u8,
    },

    /// The device rejected the command entry itself.
    #[error("malformed command entry (code {code:#x})")]
    MalformedCommand {
        /// Device error code.
        code: u32,
    },

    /// The command could not be written to the ring.
    #[error("task could not be submitted: {0}")]
    SubmitFailed(String),

    /// Retired without a real completion because the stream or device aborted.
    #[error("task aborted")]
    Aborted,
}

/// Waiting for completion failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The deadline passed; the tasks may still complete.
    #[error("synchronization timed out after {0:?}")]
    Timeout(Duration),

    /// The device transport is gone; every stream has been aborted.
    #[error("device transport down: {0}")]
    TransportDown(String),

    /// A task on the stream failed.
    #[error("stream {stream_id} task {task_id} failed: {error}")]
    TaskFailed {
        /// Stream the task ran on.
        stream_id: StreamId,
        /// Failed task.
        task_id: LogicalTaskId,
        /// Recorded failure.
        error: ExecutionError,
    },

    /// The stream was aborted while waiting.
    #[error("stream {0} aborted")]
    Aborted(StreamId),

    /// Reading completions failed; the transport is still up.
    #[error("completion polling failed: {0}")]
    Driver(DriverError),
}

/// Errors reported by the driver collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// No free entries on the ring right now.
    #[error("{0} is full")]
    RingFull(RingId),

    /// Unknown ring id.
    #[error("{0} does not exist")]
    UnknownRing(RingId),

    /// The ring is disabled.
    #[error("{0} is disabled")]
    RingDisabled(RingId),

    /// No ring resources left on the device.
    #[error("no ring resources left")]
    Exhausted,

    /// The command bytes are not a whole number of entries.
    #[error("malformed command buffer ({0} bytes)")]
    MalformedCommand(usize),

    /// The device stopped answering heartbeats.
    #[error("device heartbeat lost")]
    HeartbeatLost,

    /// Other transport failure.
    #[error("driver failure: {0}")]
    Io(String),
}

impl DriverError {
    /// Returns true for failures that mean the device is gone.
    pub fn is_transport_down(&self) -> bool {
        matches!(self, DriverError::HeartbeatLost)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML document did not parse.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config file could not be read.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Umbrella error type.
#[derive(Debug, Error)]
pub enum TaskRingError {
    /// Admission failed.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Synchronization failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Task execution failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No stream with this id.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// Every stream id is in use.
    #[error("no free stream id")]
    StreamIdsExhausted,

    /// Failure mode change not permitted.
    #[error("failure mode cannot change from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current mode.
        from: FailureMode,
        /// Requested mode.
        to: FailureMode,
    },

    /// Operation not valid in the current state.
    #[error("invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },
}

impl TaskRingError {
    /// Returns true if the error is a synchronization timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskRingError::Sync(SyncError::Timeout(_)))
    }

    /// Returns the admission error, if this is one.
    pub fn as_admission(&self) -> Option<&AdmissionError> {
        match self {
            TaskRingError::Admission(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the synchronization error, if this is one.
    pub fn as_sync(&self) -> Option<&SyncError> {
        match self {
            TaskRingError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_retryable() {
        let full = AdmissionError::RingFull {
            stream_id: StreamId(1),
            in_flight: 4,
            depth: 4,
        };
        assert!(full.is_retryable());
        assert!(!AdmissionError::Aborted(StreamId(1)).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err: TaskRingError = SyncError::TaskFailed {
            stream_id: StreamId(3),
            task_id: LogicalTaskId(7),
            error: ExecutionError::Exception { code: 0x21 },
        }
        .into();
        assert_eq!(
            err.to_string(),
            "stream 3 task 7 failed: task exception (code 0x21)"
        );
        assert!(err.as_sync().is_some());
        assert!(!err.is_timeout());
    }
}
