//! Task records and payloads.

use std::fmt;

use crate::control::ControlOp;
use crate::error::{AdmissionError, ExecutionError};
use crate::ring::RingPos;
use crate::types::{LogicalTaskId, StreamId, TaskId};

/// Most ring entries one task may occupy.
pub const MAX_TASK_ENTRIES: usize = u8::MAX as usize;

/// Discriminant of a [`TaskPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskKind {
    /// Kernel launch.
    Kernel = 1,
    /// Device memory copy.
    MemoryCopy = 2,
    /// Record an event.
    EventRecord = 3,
    /// Wait for an event.
    EventWait = 4,
    /// Record a notify.
    NotifyRecord = 5,
    /// Several kernels written as consecutive entries.
    Multi = 6,
    /// Decoder job whose recoverable fault is retried.
    Decode = 7,
    /// Task id wraparound marker.
    Flip = 8,
    /// Control channel operation.
    Maintenance = 9,
    /// Synchronization point.
    Barrier = 10,
    /// Last task of the stream; stops the sender.
    Terminal = 11,
}

impl TaskKind {
    /// Decode the wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => TaskKind::Kernel,
            2 => TaskKind::MemoryCopy,
            3 => TaskKind::EventRecord,
            4 => TaskKind::EventWait,
            5 => TaskKind::NotifyRecord,
            6 => TaskKind::Multi,
            7 => TaskKind::Decode,
            8 => TaskKind::Flip,
            9 => TaskKind::Maintenance,
            10 => TaskKind::Barrier,
            11 => TaskKind::Terminal,
            _ => return None,
        })
    }
}

/// Kind-specific task contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Launch a kernel.
    Kernel {
        /// Device address of the function.
        function: u64,
        /// Device address of the argument block.
        args: u64,
        /// Block dimension.
        block_dim: u32,
    },
    /// Copy device memory.
    MemoryCopy {
        /// Source address.
        src: u64,
        /// Destination address.
        dst: u64,
        /// Byte count.
        len: u32,
    },
    /// Record an event.
    EventRecord {
        /// Event id.
        event_id: u32,
    },
    /// Block the stream until an event is recorded.
    EventWait {
        /// Event id.
        event_id: u32,
    },
    /// Record a notify.
    NotifyRecord {
        /// Notify id.
        notify_id: u32,
    },
    /// Several kernels, one ring entry each, completing independently.
    Multi {
        /// Function addresses.
        functions: Vec<u64>,
    },
    /// Decoder job.
    Decode {
        /// Input bitstream address.
        input: u64,
        /// Output frame address.
        output: u64,
    },
    /// Flip marker carrying the new generation.
    Flip {
        /// Generation that starts with this marker.
        flip_num: u32,
    },
    /// Control channel operation.
    Maintenance(ControlOp),
    /// Synchronization point.
    Barrier,
    /// Stop marker.
    Terminal,
}

impl TaskPayload {
    /// Kind tag.
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Kernel { .. } => TaskKind::Kernel,
            TaskPayload::MemoryCopy { .. } => TaskKind::MemoryCopy,
            TaskPayload::EventRecord { .. } => TaskKind::EventRecord,
            TaskPayload::EventWait { .. } => TaskKind::EventWait,
            TaskPayload::NotifyRecord { .. } => TaskKind::NotifyRecord,
            TaskPayload::Multi { .. } => TaskKind::Multi,
            TaskPayload::Decode { .. } => TaskKind::Decode,
            TaskPayload::Flip { .. } => TaskKind::Flip,
            TaskPayload::Maintenance(_) => TaskKind::Maintenance,
            TaskPayload::Barrier => TaskKind::Barrier,
            TaskPayload::Terminal => TaskKind::Terminal,
        }
    }

    /// Ring entries the task occupies. Only meaningful for payloads that
    /// passed [`TaskPayload::validate`].
    pub fn entry_count(&self) -> u8 {
        match self {
            TaskPayload::Multi { functions } => u8::try_from(functions.len()).unwrap_or(u8::MAX),
            _ => 1,
        }
    }

    /// Reject payloads that cannot be written as ring entries.
    pub fn validate(&self) -> Result<(), AdmissionError> {
        if let TaskPayload::Multi { functions } = self {
            if functions.is_empty() || functions.len() > MAX_TASK_ENTRIES {
                return Err(AdmissionError::InvalidPayload {
                    kind: TaskKind::Multi,
                    reason: format!(
                        "{} functions, expected 1..={MAX_TASK_ENTRIES}",
                        functions.len()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Returns true for kinds that request a report even on lazy streams.
    pub fn always_reports(&self) -> bool {
        matches!(
            self,
            TaskPayload::Flip { .. }
                | TaskPayload::Maintenance(_)
                | TaskPayload::Barrier
                | TaskPayload::Terminal
        )
    }

    /// Convenience constructor for a kernel launch.
    pub fn kernel(function: u64, args: u64) -> Self {
        TaskPayload::Kernel {
            function,
            args,
            block_dim: 1,
        }
    }
}

/// Status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    /// Stops the threaded sender after it is written.
    pub terminal: bool,
    /// Callers must synchronize the stream after this task.
    pub needs_stream_sync: bool,
    /// The device writes a completion report for this task.
    pub needs_report: bool,
    /// The slot has been retired and is waiting to be recycled.
    pub reclaimed: bool,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Allocated, not yet on the ring.
    Pending,
    /// Written to the ring.
    InFlight,
    /// Waiting to be written again after a retryable fault.
    Retrying,
    /// Finished; the slot is recyclable.
    Retired,
}

/// Outcome handed to callbacks and observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    /// Stream the task ran on.
    pub stream_id: StreamId,
    /// Logical id.
    pub task_id: LogicalTaskId,
    /// Kind.
    pub kind: TaskKind,
    /// Success or the recorded failure.
    pub result: Result<(), ExecutionError>,
}

/// Callback invoked once when a task retires.
pub type CompletionCallback = Box<dyn FnOnce(&TaskCompletion) + Send + 'static>;

/// One task slot.
pub struct TaskRecord {
    /// Flip-adjusted id.
    pub logical_id: LogicalTaskId,
    /// Id carried on the ring.
    pub task_id: TaskId,
    /// Owning stream.
    pub stream_id: StreamId,
    /// Contents.
    pub payload: TaskPayload,
    /// Status flags.
    pub flags: TaskFlags,
    /// Lifecycle state.
    pub state: TaskState,
    /// Reports still expected before the task retires.
    pub outstanding: u8,
    /// Re-issues spent on retryable faults.
    pub retries: u8,
    /// Recorded failure.
    pub error: Option<ExecutionError>,
    /// Ring position just past the task's last entry.
    pub end_pos: RingPos,
    /// Completion callback.
    pub callback: Option<CompletionCallback>,
}

impl TaskRecord {
    /// Create a pending record.
    pub fn new(
        logical_id: LogicalTaskId,
        task_id: TaskId,
        stream_id: StreamId,
        payload: TaskPayload,
    ) -> Self {
        let outstanding = payload.entry_count();
        Self {
            logical_id,
            task_id,
            stream_id,
            flags: TaskFlags {
                terminal: matches!(payload, TaskPayload::Terminal),
                needs_report: payload.always_reports(),
                ..TaskFlags::default()
            },
            payload,
            state: TaskState::Pending,
            outstanding,
            retries: 0,
            error: None,
            end_pos: RingPos::ZERO,
            callback: None,
        }
    }

    /// Kind tag.
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// Ring entries.
    pub fn entry_count(&self) -> u8 {
        self.payload.entry_count()
    }

    /// Returns true once retired.
    pub fn is_retired(&self) -> bool {
        self.state == TaskState::Retired
    }

    /// Attach a completion callback.
    pub fn set_callback(&mut self, callback: CompletionCallback) {
        self.callback = Some(callback);
    }

    /// Build the completion delivered to observers.
    pub fn completion(&self) -> TaskCompletion {
        TaskCompletion {
            stream_id: self.stream_id,
            task_id: self.logical_id,
            kind: self.kind(),
            result: match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
        }
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("logical_id", &self.logical_id)
            .field("task_id", &self.task_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind())
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("outstanding", &self.outstanding)
            .field("retries", &self.retries)
            .field("error", &self.error)
            .field("end_pos", &self.end_pos)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
