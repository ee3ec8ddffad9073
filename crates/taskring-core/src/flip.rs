//! Hardware task id wraparound.
//!
//! The device only sees a narrow task id that wraps every `2^bits` tasks.
//! Each time it is about to wrap, a flip marker is injected into the ring so
//! that every later report can be mapped back to a logical id:
//!
//! ```text
//! logical = (flips << bits) | raw
//! ```
//!
//! The flip count is the generation. A report is resolved against the live
//! arena window, which is never wider than the id space, so at most one
//! generation can match.

use crate::types::{LogicalTaskId, TaskId};

/// Geometry of the hardware task id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIdSpace {
    bits: u8,
    mask: u32,
}

impl TaskIdSpace {
    /// Id space of `bits` width (1..=16).
    pub fn new(bits: u8) -> Self {
        let bits = bits.clamp(1, 16);
        Self {
            bits,
            mask: (1u32 << bits) - 1,
        }
    }

    /// Id width.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Number of distinct hardware ids.
    pub fn size(&self) -> u32 {
        self.mask + 1
    }

    /// Largest hardware id.
    pub fn max_raw(&self) -> TaskId {
        TaskId(self.mask as u16)
    }

    /// Hardware id carried on the ring for a logical id.
    #[inline]
    pub fn raw_of(&self, id: LogicalTaskId) -> TaskId {
        TaskId((id.get() & self.mask) as u16)
    }

    /// Generation (flip count) a logical id belongs to.
    #[inline]
    pub fn flip_of(&self, id: LogicalTaskId) -> u32 {
        id.get() >> self.bits
    }

    /// Logical id for `raw` in generation `flips`.
    #[inline]
    pub fn logical_from(&self, raw: TaskId, flips: u32) -> LogicalTaskId {
        LogicalTaskId((flips << self.bits) | (raw.0 as u32 & self.mask))
    }

    /// Returns true if allocating `next` crosses into a new generation.
    ///
    /// The very first id of a stream starts generation zero and needs no
    /// marker.
    #[inline]
    pub fn needs_flip(&self, next: LogicalTaskId, first: bool) -> bool {
        !first && next.get() & self.mask == 0
    }

    /// Map a reported hardware id back to a logical id.
    ///
    /// `observed_flips` is the generation of the last flip marker retired by
    /// the stream; `live` reports whether a logical id is still in flight.
    /// The current generation is tried first, then the one after it (the
    /// marker may not be reconciled yet) and then the one before it.
    pub fn resolve(
        &self,
        raw: TaskId,
        observed_flips: u32,
        live: impl Fn(LogicalTaskId) -> bool,
    ) -> Option<LogicalTaskId> {
        [
            observed_flips,
            observed_flips.wrapping_add(1),
            observed_flips.wrapping_sub(1),
        ]
        .into_iter()
        .map(|flips| self.logical_from(raw, flips))
        .find(|id| live(*id))
    }
}

impl Default for TaskIdSpace {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Per-stream flip bookkeeping on the synchronization side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlipTracker {
    observed: u32,
}

impl FlipTracker {
    /// Generation of the last retired flip marker.
    pub fn observed(&self) -> u32 {
        self.observed
    }

    /// Record a retired flip marker of generation `flip_num`.
    ///
    /// Markers retire in ring order, so this only ever moves forward.
    pub fn observe(&mut self, flip_num: u32) {
        let d = flip_num.wrapping_sub(self.observed);
        if d != 0 && d < (1 << 31) {
            self.observed = flip_num;
        }
    }

    /// Restart at generation `flips` when a cleared stream drops its ring.
    pub fn reset_to(&mut self, flips: u32) {
        self.observed = flips;
    }
}
