//! Task slot arena.
//!
//! A fixed ring of reusable task records. Slots are addressed by logical
//! task id: the slot of id `n` is `n & mask`. `tail` is the next id to
//! allocate and `head` the oldest id not yet recycled, so the live window is
//! `[head, tail)`.
//!
//! Release is FIFO. Releasing an id out of order only marks it; `head`
//! advances over the contiguous run of released slots once the oldest one is
//! released. A record is never readable after its slot is recycled.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::task::TaskRecord;
use crate::types::LogicalTaskId;

/// Handle to a freshly allocated slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    id: LogicalTaskId,
    index: u32,
}

impl SlotHandle {
    /// Logical id the slot was allocated for.
    pub fn id(&self) -> LogicalTaskId {
        self.id
    }

    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Arena statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Slots handed out.
    pub allocated: u64,
    /// Slots recycled.
    pub recycled: u64,
    /// Allocations refused because the arena was full.
    pub exhausted: u64,
    /// Releases that had to wait for an older slot.
    pub deferred: u64,
}

struct Slot {
    record: Option<TaskRecord>,
    released: bool,
}

struct ArenaStatsInner {
    allocated: AtomicU64,
    recycled: AtomicU64,
    exhausted: AtomicU64,
    deferred: AtomicU64,
}

/// Fixed pool of task records.
///
/// Allocation is serialized by the stream's submission lock and release by
/// its synchronization lock; the atomics make `len` and `head` readable
/// without either.
pub struct TaskArena {
    /// Slot storage.
    slots: Vec<Mutex<Slot>>,
    /// Mask for slot indexing.
    mask: u32,
    /// Oldest live id.
    head: AtomicU32,
    /// Next id to allocate.
    tail: AtomicU32,
    /// Statistics.
    stats: ArenaStatsInner,
}

impl TaskArena {
    /// Create an arena. Capacity is rounded up to a power of two (minimum 2).
    pub fn new(capacity: u32) -> Self {
        Self::starting_at(capacity, LogicalTaskId(0))
    }

    /// Create an arena whose first allocation is `first`.
    pub fn starting_at(capacity: u32, first: LogicalTaskId) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    record: None,
                    released: false,
                })
            })
            .collect();

        Self {
            slots,
            mask: capacity - 1,
            head: AtomicU32::new(first.get()),
            tail: AtomicU32::new(first.get()),
            stats: ArenaStatsInner {
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
                deferred: AtomicU64::new(0),
            },
        }
    }

    /// Slot count.
    pub fn slot_count(&self) -> u32 {
        self.mask + 1
    }

    /// Usable slots; one is always kept free.
    pub fn capacity(&self) -> u32 {
        self.mask
    }

    /// Live (allocated, not recycled) slots.
    pub fn len(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// True when no slot is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `allocate` would fail.
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Slots available to `allocate`.
    pub fn free(&self) -> u32 {
        self.capacity().saturating_sub(self.len())
    }

    /// Oldest live id (equal to `tail` when empty).
    pub fn head(&self) -> LogicalTaskId {
        LogicalTaskId(self.head.load(Ordering::Acquire))
    }

    /// Id the next allocation will receive.
    pub fn tail(&self) -> LogicalTaskId {
        LogicalTaskId(self.tail.load(Ordering::Acquire))
    }

    /// Returns true if `id` is inside the live window.
    pub fn contains(&self, id: LogicalTaskId) -> bool {
        let head = self.head.load(Ordering::Acquire);
        id.get().wrapping_sub(head) < self.len()
    }

    /// Allocate the next slot and fill it with the record built for its id.
    ///
    /// Returns `None` when the arena is full; the caller must apply
    /// backpressure.
    pub fn allocate(
        &self,
        build: impl FnOnce(LogicalTaskId) -> TaskRecord,
    ) -> Option<SlotHandle> {
        if self.is_full() {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tail = self.tail.load(Ordering::Acquire);
        let id = LogicalTaskId(tail);
        let index = tail & self.mask;

        let mut slot = self.slots[index as usize].lock();
        slot.record = Some(build(id));
        slot.released = false;
        drop(slot);

        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);

        Some(SlotHandle { id, index })
    }

    /// Run `f` on a live, unreleased record.
    pub fn with_task<R>(
        &self,
        id: LogicalTaskId,
        f: impl FnOnce(&mut TaskRecord) -> R,
    ) -> Option<R> {
        if !self.contains(id) {
            return None;
        }
        let mut slot = self.slots[(id.get() & self.mask) as usize].lock();
        if slot.released {
            return None;
        }
        match slot.record.as_mut() {
            Some(record) if record.logical_id == id => Some(f(record)),
            _ => None,
        }
    }

    /// Live ids in allocation order.
    pub fn live_ids(&self) -> impl Iterator<Item = LogicalTaskId> {
        let head = self.head.load(Ordering::Acquire);
        let len = self.len();
        (0..len).map(move |i| LogicalTaskId(head.wrapping_add(i)))
    }

    /// Release `id`.
    ///
    /// A no-op for ids that are already released or not live. Returns true
    /// if this call released the slot.
    pub fn release(&self, id: LogicalTaskId) -> bool {
        if !self.contains(id) {
            return false;
        }
        {
            let mut slot = self.slots[(id.get() & self.mask) as usize].lock();
            if slot.released {
                return false;
            }
            slot.released = true;
        }
        if id != self.head() {
            self.stats.deferred.fetch_add(1, Ordering::Relaxed);
        }
        self.recycle_head();
        true
    }

    /// Advance `head` over released slots.
    fn recycle_head(&self) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == self.tail.load(Ordering::Acquire) {
                return;
            }
            let mut slot = self.slots[(head & self.mask) as usize].lock();
            if !slot.released {
                return;
            }
            slot.record = None;
            slot.released = false;
            drop(slot);
            self.head.store(head.wrapping_add(1), Ordering::Release);
            self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocated: self.stats.allocated.load(Ordering::Relaxed),
            recycled: self.stats.recycled.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            deferred: self.stats.deferred.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TaskArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskArena")
            .field("slots", &self.slot_count())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}
