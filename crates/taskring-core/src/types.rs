//! Identifier types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical stream identifier, unique per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u16);

impl StreamId {
    /// Raw numeric value as carried in command entries and completion records.
    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Driver-assigned ring identifier (submission or completion ring).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingId(pub u32);

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring#{}", self.0)
    }
}

/// Hardware task id.
///
/// This is the small fixed-width id the device sees. It wraps long before
/// older tasks are guaranteed retired, so it must never be used for ordering;
/// see [`LogicalTaskId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u16);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flip-adjusted, monotonically increasing task id.
///
/// Allocated from the stream's task arena in submission order. Comparisons use
/// wrapping arithmetic so the ordering survives the 32-bit wrap as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalTaskId(pub u32);

impl LogicalTaskId {
    /// Raw value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Id that follows this one.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Id that precedes this one.
    #[inline]
    pub const fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    /// Returns true if `self` was issued strictly before `other`.
    #[inline]
    pub fn precedes(self, other: Self) -> bool {
        let d = other.0.wrapping_sub(self.0);
        d != 0 && d < (1 << 31)
    }
}

impl fmt::Display for LogicalTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
