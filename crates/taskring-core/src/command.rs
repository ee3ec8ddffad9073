//! On-ring command entries.
//!
//! Only the envelope the engine needs is fixed here; kind-specific payloads
//! are packed into the four argument words.

use bytemuck::{Pod, Zeroable};

use crate::error::DriverError;
use crate::task::{TaskPayload, TaskRecord};

/// Entry flag: write a completion report for this entry.
pub const FLAG_REPORT: u8 = 1 << 0;
/// Entry flag: last task of the stream.
pub const FLAG_TERMINAL: u8 = 1 << 1;
/// Entry flag: re-issue after a retryable fault.
pub const FLAG_RETRY: u8 = 1 << 2;

/// Command entry as written to a submission ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CommandEntry {
    /// Stream id.
    pub stream_id: u16,
    /// Hardware task id.
    pub task_id: u16,
    /// [`TaskKind`](crate::task::TaskKind) tag.
    pub kind: u8,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Index of this entry within its task.
    pub entry_index: u8,
    /// Entries the task occupies.
    pub entry_count: u8,
    /// First argument word.
    pub arg0: u64,
    /// Second argument word.
    pub arg1: u64,
    /// Third argument.
    pub arg2: u32,
    /// Fourth argument.
    pub arg3: u32,
}

/// Entry size in bytes.
pub const COMMAND_ENTRY_SIZE: usize = std::mem::size_of::<CommandEntry>();

const _: () = assert!(COMMAND_ENTRY_SIZE == 32);

impl CommandEntry {
    /// Returns true if the entry asks for a report.
    pub fn wants_report(&self) -> bool {
        self.flags & FLAG_REPORT != 0
    }
}

/// Build the ring entries for a task.
pub fn encode_task(record: &TaskRecord, retry: bool) -> Vec<CommandEntry> {
    let count = record.entry_count();
    let mut flags = 0;
    if record.flags.needs_report {
        flags |= FLAG_REPORT;
    }
    if record.flags.terminal {
        flags |= FLAG_TERMINAL;
    }
    if retry {
        flags |= FLAG_RETRY;
    }

    (0..count)
        .map(|index| {
            let mut entry = CommandEntry {
                stream_id: record.stream_id.get(),
                task_id: record.task_id.0,
                kind: record.kind() as u8,
                flags,
                entry_index: index,
                entry_count: count,
                ..CommandEntry::zeroed()
            };
            pack_args(&record.payload, index, &mut entry);
            entry
        })
        .collect()
}

fn pack_args(payload: &TaskPayload, index: u8, entry: &mut CommandEntry) {
    match payload {
        TaskPayload::Kernel {
            function,
            args,
            block_dim,
        } => {
            entry.arg0 = *function;
            entry.arg1 = *args;
            entry.arg2 = *block_dim;
        }
        TaskPayload::MemoryCopy { src, dst, len } => {
            entry.arg0 = *src;
            entry.arg1 = *dst;
            entry.arg2 = *len;
        }
        TaskPayload::EventRecord { event_id } | TaskPayload::EventWait { event_id } => {
            entry.arg2 = *event_id;
        }
        TaskPayload::NotifyRecord { notify_id } => entry.arg2 = *notify_id,
        TaskPayload::Multi { functions } => {
            entry.arg0 = functions.get(index as usize).copied().unwrap_or(0);
        }
        TaskPayload::Decode { input, output } => {
            entry.arg0 = *input;
            entry.arg1 = *output;
        }
        TaskPayload::Flip { flip_num } => entry.arg2 = *flip_num,
        TaskPayload::Maintenance(op) => {
            let (code, arg) = op.encode();
            entry.arg2 = code;
            entry.arg0 = arg;
        }
        TaskPayload::Barrier | TaskPayload::Terminal => {}
    }
}

/// Serialize entries for [`Driver::enqueue`](crate::driver::Driver::enqueue).
pub fn to_bytes(entries: &[CommandEntry]) -> Vec<u8> {
    bytemuck::cast_slice(entries).to_vec()
}

/// Parse a command buffer back into entries.
pub fn decode(bytes: &[u8]) -> Result<Vec<CommandEntry>, DriverError> {
    if bytes.len() % COMMAND_ENTRY_SIZE != 0 {
        return Err(DriverError::MalformedCommand(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMMAND_ENTRY_SIZE)
        .map(bytemuck::pod_read_unaligned::<CommandEntry>)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use crate::types::{LogicalTaskId, StreamId, TaskId};

    #[test]
    fn test_multi_task_spans_entries() {
        let mut rec = TaskRecord::new(
            LogicalTaskId(9),
            TaskId(9),
            StreamId(2),
            TaskPayload::Multi {
                functions: vec![0x10, 0x20, 0x30],
            },
        );
        rec.flags.needs_report = true;
        let entries = encode_task(&rec, false);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].arg0, 0x20);
        assert_eq!(entries[2].entry_index, 2);
        assert!(entries.iter().all(|e| e.entry_count == 3));
        assert!(entries.iter().all(|e| e.wants_report()));
        assert!(entries.iter().all(|e| e.kind == TaskKind::Multi as u8));
    }

    #[test]
    fn test_bytes_layout() {
        let rec = TaskRecord::new(
            LogicalTaskId(1),
            TaskId(1),
            StreamId(7),
            TaskPayload::kernel(0xdead_beef, 0x40),
        );
        let bytes = to_bytes(&encode_task(&rec, true));
        assert_eq!(bytes.len(), COMMAND_ENTRY_SIZE);
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 7);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded[0].arg0, 0xdead_beef);
        assert_eq!(decoded[0].flags & FLAG_RETRY, FLAG_RETRY);
        assert!(!decoded[0].wants_report());
    }

    #[test]
    fn test_decode_rejects_partial_entry() {
        assert!(matches!(
            decode(&[0u8; 33]),
            Err(DriverError::MalformedCommand(33))
        ));
    }
}
