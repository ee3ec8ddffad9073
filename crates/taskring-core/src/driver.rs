//! Driver collaborator interface.
//!
//! The driver owns the physical rings. The engine only allocates them,
//! writes command bytes, polls completion records and moves positions.

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::error::DriverError;
use crate::ring::RingPos;
use crate::types::{RingId, StreamId, TaskId};

/// Error bits carried in [`CompletionRecord::error_bits`].
pub mod error_bits {
    /// Task raised an exception. Fatal.
    pub const EXCEPTION: u16 = 1 << 0;
    /// Task trapped. Fatal.
    pub const TRAP: u16 = 1 << 1;
    /// Device-side task timeout. Fatal.
    pub const TIMEOUT: u16 = 1 << 2;
    /// Recoverable decoder fault. Retried on decoder tasks.
    pub const DECODER_FAULT: u16 = 1 << 3;
    /// Debug buffer overflowed. Informational.
    pub const DEBUG_OVERFLOW: u16 = 1 << 4;
    /// The command entry was malformed. Fatal, never retried.
    pub const SQE_ERROR: u16 = 1 << 5;
}

/// Kind of a completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Report for one task entry.
    Task = 0,
    /// Out-of-band error information.
    ErrorInfo = 1,
}

/// Completion record as read from a completion ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CompletionRecord {
    /// Stream id.
    pub stream_id: u16,
    /// Hardware task id.
    pub task_id: u16,
    /// Submission ring head at report time (just past the reported entry).
    pub sq_head: u32,
    /// `error_bits::*`.
    pub error_bits: u16,
    /// [`RecordKind`] tag.
    pub kind: u8,
    /// Reserved.
    pub reserved: u8,
    /// Device error code.
    pub error_code: u32,
}

/// Record size in bytes.
pub const COMPLETION_RECORD_SIZE: usize = std::mem::size_of::<CompletionRecord>();

const _: () = assert!(COMPLETION_RECORD_SIZE == 16);

impl CompletionRecord {
    /// Successful task report.
    pub fn task(stream_id: StreamId, task_id: TaskId, sq_head: RingPos) -> Self {
        Self {
            stream_id: stream_id.get(),
            task_id: task_id.0,
            sq_head: sq_head.get(),
            kind: RecordKind::Task as u8,
            ..Self::zeroed()
        }
    }

    /// Set error bits and code.
    #[must_use]
    pub fn with_error(mut self, bits: u16, code: u32) -> Self {
        self.error_bits = bits;
        self.error_code = code;
        self
    }

    /// Record kind, if the tag is known.
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self.kind {
            0 => Some(RecordKind::Task),
            1 => Some(RecordKind::ErrorInfo),
            _ => None,
        }
    }

    /// Stream id.
    pub fn stream(&self) -> StreamId {
        StreamId(self.stream_id)
    }

    /// Hardware task id.
    pub fn hw_task(&self) -> TaskId {
        TaskId(self.task_id)
    }

    /// Ring head at report time.
    pub fn head(&self) -> RingPos {
        RingPos::new(self.sq_head)
    }

    /// Decode from raw ring bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == COMPLETION_RECORD_SIZE).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}

/// Kind of ring to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// Submission ring.
    Submission,
    /// Completion ring.
    Completion,
}

/// Ring allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRequest {
    /// Stream the ring serves. Shared completion rings use the stream that
    /// created them.
    pub stream_id: StreamId,
    /// Submission or completion.
    pub kind: RingKind,
    /// Depth in entries.
    pub depth: u32,
    /// Completion ring that receives reports for a submission ring.
    pub completion_ring: Option<RingId>,
    /// Scheduling priority hint (lower is higher).
    pub priority: i32,
}

/// Physical ring operations.
///
/// Implementations must be thread safe: the threaded engine calls
/// `enqueue` from its sender thread while the receiver thread blocks in
/// `poll_completion`.
pub trait Driver: Send + Sync {
    /// Allocate a ring.
    fn allocate_ring(&self, request: RingRequest) -> Result<RingId, DriverError>;

    /// Release a ring.
    fn free_ring(&self, ring: RingId) -> Result<(), DriverError>;

    /// Write whole command entries. All-or-nothing: fails with
    /// [`DriverError::RingFull`] without writing anything if they do not fit.
    fn enqueue(&self, ring: RingId, commands: &[u8]) -> Result<(), DriverError>;

    /// Wait up to `timeout` for completion records and return them in ring
    /// order. An empty vector means the wait timed out.
    fn poll_completion(
        &self,
        ring: RingId,
        timeout: Duration,
    ) -> Result<Vec<CompletionRecord>, DriverError>;

    /// Position the device will consume next.
    fn query_head(&self, ring: RingId) -> Result<RingPos, DriverError>;

    /// Position the host will write next.
    fn query_tail(&self, ring: RingId) -> Result<RingPos, DriverError>;

    /// Move the consumer position, discarding entries before it.
    fn set_head(&self, ring: RingId, head: RingPos) -> Result<(), DriverError>;

    /// Let the device consume the ring.
    fn enable_ring(&self, ring: RingId) -> Result<(), DriverError>;

    /// Stop the device from consuming the ring.
    fn disable_ring(&self, ring: RingId) -> Result<(), DriverError>;
}
