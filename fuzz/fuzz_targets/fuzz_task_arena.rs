//! Fuzz target for the task slot arena.
//!
//! Drives allocation and out-of-order release and checks that the live
//! window stays contiguous and recycled records are never readable.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use taskring_core::arena::TaskArena;
use taskring_core::task::{TaskPayload, TaskRecord};
use taskring_core::types::{LogicalTaskId, StreamId, TaskId};

#[derive(Debug, Arbitrary)]
enum ArenaOp {
    /// Allocate one record.
    Allocate,
    /// Release the live id at `offset` from head (modulo length).
    Release { offset: u16 },
    /// Release an id that may be outside the window.
    ReleaseRaw { id: u32 },
    /// Read a record.
    Read { offset: u16 },
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    capacity_log2: u8,
    first: u32,
    ops: Vec<ArenaOp>,
}

fuzz_target!(|input: FuzzInput| {
    let capacity = 1u32 << (input.capacity_log2 % 8).max(1);
    if input.ops.len() > 2000 {
        return;
    }

    let arena = TaskArena::starting_at(capacity, LogicalTaskId(input.first));
    let mut released = std::collections::HashSet::new();

    for op in &input.ops {
        match op {
            ArenaOp::Allocate => {
                let was_full = arena.is_full();
                let tail = arena.tail();
                let handle = arena.allocate(|id| {
                    TaskRecord::new(id, TaskId(id.get() as u16), StreamId(1), TaskPayload::Barrier)
                });
                assert_eq!(handle.is_none(), was_full);
                if let Some(handle) = handle {
                    assert_eq!(handle.id(), tail);
                    released.remove(&handle.id());
                }
            }
            ArenaOp::Release { offset } => {
                let len = arena.len();
                if len == 0 {
                    continue;
                }
                let id = LogicalTaskId(arena.head().get().wrapping_add(u32::from(*offset) % len));
                let first = arena.release(id);
                assert_eq!(first, !released.contains(&id));
                released.insert(id);
                assert!(arena.with_task(id, |_| ()).is_none());
            }
            ArenaOp::ReleaseRaw { id } => {
                let id = LogicalTaskId(*id);
                if !arena.contains(id) {
                    assert!(!arena.release(id));
                }
            }
            ArenaOp::Read { offset } => {
                let len = arena.len();
                if len == 0 {
                    continue;
                }
                let id = LogicalTaskId(arena.head().get().wrapping_add(u32::from(*offset) % len));
                let seen = arena.with_task(id, |record| record.logical_id);
                if !released.contains(&id) {
                    assert_eq!(seen, Some(id));
                }
            }
        }

        // invariants
        assert!(arena.len() <= arena.capacity());
        assert_eq!(arena.free() + arena.len(), arena.capacity());
        if let Some(head) = arena.live_ids().next() {
            assert_eq!(head, arena.head());
            assert!(!released.contains(&head));
        }
    }
});
