//! Ring position arithmetic.
//!
//! Hardware submission rings are addressed by free-running 32-bit positions.
//! The slot a position lands in is `pos % depth`, but all occupancy and
//! ordering questions are answered on the unreduced positions with wrapping
//! arithmetic, so a full ring and an empty ring are never confused.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A free-running position on a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RingPos(u32);

impl RingPos {
    /// Position zero.
    pub const ZERO: RingPos = RingPos(0);

    /// Create from a raw value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Position `n` entries further along the ring.
    #[inline]
    #[must_use]
    pub const fn advance(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Number of entries from `earlier` up to `self`.
    #[inline]
    pub const fn distance_from(self, earlier: RingPos) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Returns true if `self` lies strictly after `other`.
    #[inline]
    pub const fn is_after(self, other: RingPos) -> bool {
        let d = self.0.wrapping_sub(other.0);
        d != 0 && d < (1 << 31)
    }

    /// Slot index on a ring of the given depth.
    #[inline]
    pub const fn slot(self, depth: u32) -> u32 {
        self.0 % depth
    }
}

impl fmt::Display for RingPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Head/tail pair describing the occupied part of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingWindow {
    /// First position not yet consumed.
    pub head: RingPos,
    /// Next position to be written.
    pub tail: RingPos,
}

impl RingWindow {
    /// Create a window.
    pub const fn new(head: RingPos, tail: RingPos) -> Self {
        Self { head, tail }
    }

    /// Occupied entries.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.tail.distance_from(self.head)
    }

    /// True when nothing is outstanding.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head.0 == self.tail.0
    }

    /// Returns true if `pos` is inside `[head, tail)`.
    #[inline]
    pub const fn contains(&self, pos: RingPos) -> bool {
        pos.distance_from(self.head) < self.len()
    }
}

/// Atomic cell holding a [`RingPos`].
///
/// Read without locks for queries; written only by the side that owns the
/// position (submission lock for tails, synchronization lock for heads).
#[derive(Debug, Default)]
pub struct AtomicRingPos(AtomicU32);

impl AtomicRingPos {
    /// Create a cell.
    pub const fn new(pos: RingPos) -> Self {
        Self(AtomicU32::new(pos.0))
    }

    /// Load with acquire ordering.
    #[inline]
    pub fn load(&self) -> RingPos {
        RingPos(self.0.load(Ordering::Acquire))
    }

    /// Store with release ordering.
    #[inline]
    pub fn store(&self, pos: RingPos) {
        self.0.store(pos.0, Ordering::Release);
    }

    /// Advance by `n` and return the previous position.
    #[inline]
    pub fn fetch_advance(&self, n: u32) -> RingPos {
        RingPos(self.0.fetch_add(n, Ordering::AcqRel))
    }

    /// Move forward to `pos` unless the cell is already at or past it.
    ///
    /// Returns true if the cell moved.
    pub fn advance_to(&self, pos: RingPos) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !pos.is_after(RingPos(current)) {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(current, pos.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_len_across_wrap() {
        let head = RingPos::new(u32::MAX - 1);
        let tail = head.advance(4);
        assert_eq!(tail.get(), 2);
        let w = RingWindow::new(head, tail);
        assert_eq!(w.len(), 4);
        assert!(w.contains(RingPos::new(u32::MAX)));
        assert!(w.contains(RingPos::new(1)));
        assert!(!w.contains(RingPos::new(2)));
    }

    #[test]
    fn test_full_and_empty_are_distinct() {
        let w = RingWindow::new(RingPos::new(8), RingPos::new(12));
        assert!(!w.is_empty());
        assert_eq!(w.len(), 4);

        let empty = RingWindow::new(RingPos::new(12), RingPos::new(12));
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
    }

    #[test]
    fn test_is_after_wraps() {
        assert!(RingPos::new(1).is_after(RingPos::new(u32::MAX)));
        assert!(!RingPos::new(u32::MAX).is_after(RingPos::new(1)));
        assert!(!RingPos::new(5).is_after(RingPos::new(5)));
    }

    #[test]
    fn test_slot_index() {
        assert_eq!(RingPos::new(9).slot(4), 1);
        assert_eq!(RingPos::new(u32::MAX).slot(1 << 4), 15);
        assert_eq!(RingPos::new(u32::MAX).advance(1).slot(1 << 4), 0);
    }

    #[test]
    fn test_atomic_advance_to_is_monotonic() {
        let cell = AtomicRingPos::new(RingPos::new(10));
        assert!(cell.advance_to(RingPos::new(12)));
        assert!(!cell.advance_to(RingPos::new(11)));
        assert!(!cell.advance_to(RingPos::new(12)));
        assert_eq!(cell.load(), RingPos::new(12));
        assert_eq!(cell.fetch_advance(3), RingPos::new(12));
        assert_eq!(cell.load(), RingPos::new(15));
    }
}
