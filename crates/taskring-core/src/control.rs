//! Maintenance operations serialized with user work.
//!
//! Every operation is submitted as a [`TaskPayload::Maintenance`] task on the
//! target stream and synchronized like any other task; host-side effects are
//! applied only after the device acknowledged it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::engine::{Engine, SubmitRequest};
use crate::error::{Result, SyncError, TaskRingError};
use crate::failure::FailureMode;
use crate::stream::Stream;
use crate::task::{TaskCompletion, TaskPayload};

/// Administrative operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Drop a stream's failure state and, if it was aborted, its leftover
    /// hardware entries.
    StreamClear,
    /// Reset a notify counter.
    NotifyReset {
        /// Notify id.
        notify_id: u32,
    },
    /// Bind an execution graph; the stream becomes graph-bound.
    ModelBind {
        /// Graph id.
        model_id: u32,
    },
    /// Unbind an execution graph.
    ModelUnbind {
        /// Graph id.
        model_id: u32,
    },
    /// Register a debug buffer.
    DebugRegister {
        /// Device address of the buffer.
        buffer: u64,
    },
    /// Unregister the debug buffer.
    DebugUnregister,
    /// Switch the device-visible failure mode.
    SetFailureMode(FailureMode),
}

impl ControlOp {
    /// Opcode written to the command entry.
    pub const fn code(&self) -> u32 {
        match self {
            ControlOp::StreamClear => 1,
            ControlOp::NotifyReset { .. } => 2,
            ControlOp::ModelBind { .. } => 3,
            ControlOp::ModelUnbind { .. } => 4,
            ControlOp::DebugRegister { .. } => 5,
            ControlOp::DebugUnregister => 6,
            ControlOp::SetFailureMode(_) => 7,
        }
    }

    /// Opcode and argument.
    pub fn encode(&self) -> (u32, u64) {
        let arg = match *self {
            ControlOp::StreamClear | ControlOp::DebugUnregister => 0,
            ControlOp::NotifyReset { notify_id } => u64::from(notify_id),
            ControlOp::ModelBind { model_id } | ControlOp::ModelUnbind { model_id } => {
                u64::from(model_id)
            }
            ControlOp::DebugRegister { buffer } => buffer,
            ControlOp::SetFailureMode(mode) => mode.code(),
        };
        (self.code(), arg)
    }

    /// Name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            ControlOp::StreamClear => "stream_clear",
            ControlOp::NotifyReset { .. } => "notify_reset",
            ControlOp::ModelBind { .. } => "model_bind",
            ControlOp::ModelUnbind { .. } => "model_unbind",
            ControlOp::DebugRegister { .. } => "debug_register",
            ControlOp::DebugUnregister => "debug_unregister",
            ControlOp::SetFailureMode(_) => "set_failure_mode",
        }
    }
}

#[derive(Default)]
struct Acknowledgement {
    completion: Mutex<Option<TaskCompletion>>,
    cv: Condvar,
}

impl Acknowledgement {
    fn set(&self, completion: TaskCompletion) {
        *self.completion.lock() = Some(completion);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<TaskCompletion> {
        let deadline = Instant::now() + timeout;
        let mut completion = self.completion.lock();
        while completion.is_none() {
            if self.cv.wait_until(&mut completion, deadline).timed_out() {
                break;
            }
        }
        completion.take()
    }
}

/// Issues [`ControlOp`]s through an engine.
pub struct ControlChannel {
    engine: Arc<dyn Engine>,
    timeout: Duration,
}

impl ControlChannel {
    /// Channel waiting up to `timeout` for each acknowledgement.
    pub fn new(engine: Arc<dyn Engine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Acknowledgement timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` on `stream` and apply its host-side effect.
    pub fn execute(&self, stream: &Arc<Stream>, op: ControlOp) -> Result<()> {
        let ctx = self.engine.context();

        if let ControlOp::SetFailureMode(mode) = op {
            let current = stream.failure().mode();
            if current == FailureMode::AbortOnFailure && mode != FailureMode::AbortOnFailure {
                return Err(TaskRingError::InvalidTransition { from: current, to: mode });
            }
        }

        let was_aborted = stream.failure().is_aborted();
        if op == ControlOp::StreamClear && was_aborted {
            stream.lock_submit().reset_ring(ctx.driver())?;
        }

        let outcome = Arc::new(Acknowledgement::default());
        let ack = outcome.clone();
        let request = SubmitRequest::new(TaskPayload::Maintenance(op))
            .with_callback(Box::new(move |completion| ack.set(completion.clone())));

        let id = self.engine.submit(stream, request)?;
        debug!(stream_id = %stream.id(), task_id = %id, op = op.name(), "control operation issued");
        self.engine.wait_task(stream, id, self.timeout)?;

        // callbacks are delivered after waiters see the task retired
        let completion = outcome
            .wait(self.timeout)
            .ok_or(SyncError::Timeout(self.timeout))?;
        if let Err(error) = completion.result {
            return Err(SyncError::TaskFailed {
                stream_id: stream.id(),
                task_id: id,
                error,
            }
            .into());
        }

        match op {
            ControlOp::StreamClear => {
                stream.failure().clear();
                ctx.clear_device_aborting();
            }
            ControlOp::ModelBind { .. } => stream.set_bound(true),
            ControlOp::ModelUnbind { .. } => stream.set_bound(false),
            ControlOp::SetFailureMode(mode) => stream.failure().set_mode(mode)?,
            ControlOp::NotifyReset { .. }
            | ControlOp::DebugRegister { .. }
            | ControlOp::DebugUnregister => {}
        }
        info!(stream_id = %stream.id(), op = op.name(), "control operation applied");
        Ok(())
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("strategy", &self.engine.strategy())
            .field("timeout", &self.timeout)
            .finish()
    }
}
