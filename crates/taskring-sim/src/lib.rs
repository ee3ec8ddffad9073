//! # TaskRing Sim
//!
//! In-memory accelerator implementing [`Driver`]. Submission rings are
//! FIFOs of decoded [`CommandEntry`]s; the "device" consumes them when told
//! to ([`CompletionMode::Manual`]) or as soon as they are written
//! ([`CompletionMode::Immediate`]) and posts [`CompletionRecord`]s to the
//! completion ring bound to the submission ring.
//!
//! Faults can be injected per task, and the transport can be broken with
//! ring-full bursts, duplicate reports or a lost heartbeat.

#![warn(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use taskring_core::command::{self, CommandEntry};
use taskring_core::driver::{CompletionRecord, Driver, RingKind, RingRequest};
use taskring_core::error::DriverError;
use taskring_core::ring::RingPos;
use taskring_core::types::{RingId, StreamId, TaskId};

/// When the simulated device consumes entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Only on [`SimDriver::complete`] / [`SimDriver::complete_all`].
    #[default]
    Manual,
    /// As soon as an entry is written.
    Immediate,
}

/// Error reported for a task entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Error bits of the report.
    pub bits: u16,
    /// Error code of the report.
    pub code: u32,
    /// Entry of the task that fails; `None` fails the first entry consumed.
    pub entry: Option<u8>,
}

impl Fault {
    /// Fault on the first consumed entry.
    pub fn new(bits: u16, code: u32) -> Self {
        Self { bits, code, entry: None }
    }

    /// Fault on entry `index` only.
    #[must_use]
    pub fn at_entry(mut self, index: u8) -> Self {
        self.entry = Some(index);
        self
    }
}

#[derive(Debug)]
struct SimRing {
    kind: RingKind,
    stream_id: StreamId,
    depth: u32,
    enabled: bool,
    completion_ring: Option<RingId>,
    entries: VecDeque<CommandEntry>,
    head: RingPos,
    tail: RingPos,
    records: VecDeque<CompletionRecord>,
}

impl SimRing {
    fn new(request: &RingRequest) -> Self {
        Self {
            kind: request.kind,
            stream_id: request.stream_id,
            depth: request.depth,
            enabled: false,
            completion_ring: request.completion_ring,
            entries: VecDeque::new(),
            head: RingPos::ZERO,
            tail: RingPos::ZERO,
            records: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    next_ring: u32,
    rings: HashMap<RingId, SimRing>,
    mode: CompletionMode,
    faults: HashMap<(StreamId, TaskId), VecDeque<Fault>>,
    reject_enqueues: u32,
    heartbeat_lost: bool,
    duplicate_reports: bool,
    enqueue_attempts: u64,
    history: Vec<CommandEntry>,
}

/// Simulated accelerator.
#[derive(Debug, Default)]
pub struct SimDriver {
    state: Mutex<SimState>,
    reports: Condvar,
}

impl SimDriver {
    /// Device that completes entries on request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Device with the given completion mode.
    pub fn with_mode(mode: CompletionMode) -> Self {
        let driver = Self::default();
        driver.state.lock().mode = mode;
        driver
    }

    /// Switch completion mode. Switching to [`CompletionMode::Immediate`]
    /// consumes everything already written.
    pub fn set_mode(&self, mode: CompletionMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        if mode == CompletionMode::Immediate {
            let rings = submission_rings(&state);
            for ring in rings {
                consume(&mut state, ring, usize::MAX);
            }
            drop(state);
            self.reports.notify_all();
        }
    }

    /// Consume up to `count` entries of submission ring `ring`. Returns the
    /// number consumed.
    pub fn complete(&self, ring: RingId, count: usize) -> usize {
        let mut state = self.state.lock();
        let done = consume(&mut state, ring, count);
        drop(state);
        if done > 0 {
            self.reports.notify_all();
        }
        done
    }

    /// Consume every entry of every submission ring.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let rings = submission_rings(&state);
        let done = rings
            .into_iter()
            .map(|ring| consume(&mut state, ring, usize::MAX))
            .sum();
        drop(state);
        self.reports.notify_all();
        done
    }

    /// Submission ring of `stream`.
    pub fn ring_for_stream(&self, stream: StreamId) -> Option<RingId> {
        self.state
            .lock()
            .rings
            .iter()
            .find(|(_, r)| r.kind == RingKind::Submission && r.stream_id == stream)
            .map(|(id, _)| *id)
    }

    /// Entries written and not yet consumed on `ring`.
    pub fn queued(&self, ring: RingId) -> usize {
        self.state
            .lock()
            .rings
            .get(&ring)
            .map_or(0, |r| r.entries.len())
    }

    /// Report `fault` for the next attempt of hardware task `task` on
    /// `stream`. Faults queue up: each fires once.
    pub fn inject_fault(&self, stream: StreamId, task: TaskId, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry((stream, task))
            .or_default()
            .push_back(fault);
    }

    /// Fail the next `count` enqueues with `RingFull`.
    pub fn reject_enqueues(&self, count: u32) {
        self.state.lock().reject_enqueues = count;
    }

    /// Break the transport: every later call fails with `HeartbeatLost`.
    pub fn lose_heartbeat(&self) {
        self.state.lock().heartbeat_lost = true;
        self.reports.notify_all();
    }

    /// Post every report twice.
    pub fn duplicate_reports(&self, enabled: bool) {
        self.state.lock().duplicate_reports = enabled;
    }

    /// Post a raw record on completion ring `cq`.
    pub fn post_record(&self, cq: RingId, record: CompletionRecord) {
        if let Some(ring) = self.state.lock().rings.get_mut(&cq) {
            ring.records.push_back(record);
        }
        self.reports.notify_all();
    }

    /// Calls to [`Driver::enqueue`], rejected ones included.
    pub fn enqueue_attempts(&self) -> u64 {
        self.state.lock().enqueue_attempts
    }

    /// Every entry accepted so far, in write order.
    pub fn submitted(&self) -> Vec<CommandEntry> {
        self.state.lock().history.clone()
    }

    /// Number of allocated rings.
    pub fn ring_count(&self) -> usize {
        self.state.lock().rings.len()
    }

    fn check_transport(state: &SimState) -> Result<(), DriverError> {
        if state.heartbeat_lost {
            return Err(DriverError::HeartbeatLost);
        }
        Ok(())
    }
}

fn submission_rings(state: &SimState) -> Vec<RingId> {
    let mut rings: Vec<_> = state
        .rings
        .iter()
        .filter(|(_, r)| r.kind == RingKind::Submission)
        .map(|(id, _)| *id)
        .collect();
    rings.sort();
    rings
}

/// Execute up to `count` entries of `ring`, posting reports.
fn consume(state: &mut SimState, ring: RingId, count: usize) -> usize {
    let mut done = 0;
    while done < count {
        let Some(sq) = state.rings.get_mut(&ring) else {
            break;
        };
        let Some(entry) = sq.entries.pop_front() else {
            break;
        };
        sq.head = sq.head.advance(1);
        let head = sq.head;
        let cq = sq.completion_ring;
        done += 1;

        let key = (StreamId(entry.stream_id), TaskId(entry.task_id));
        let fault = match state.faults.get_mut(&key) {
            Some(queue) => match queue.front() {
                Some(f) if f.entry.map_or(true, |i| i == entry.entry_index) => queue.pop_front(),
                _ => None,
            },
            None => None,
        };

        if !entry.wants_report() && fault.is_none() {
            continue;
        }
        let mut record = CompletionRecord::task(key.0, key.1, head);
        if let Some(fault) = fault {
            record = record.with_error(fault.bits, fault.code);
            debug!(stream_id = %key.0, task_id = %key.1, bits = fault.bits, "fault reported");
        }
        trace!(stream_id = %key.0, task_id = %key.1, head = %head, "report posted");

        let duplicate = state.duplicate_reports;
        match cq.and_then(|cq| state.rings.get_mut(&cq)) {
            Some(cq) => {
                cq.records.push_back(record);
                if duplicate {
                    cq.records.push_back(record);
                }
            }
            None => warn!(ring = %ring, "submission ring has no completion ring"),
        }
    }
    done
}

impl Driver for SimDriver {
    fn allocate_ring(&self, request: RingRequest) -> Result<RingId, DriverError> {
        let mut state = self.state.lock();
        Self::check_transport(&state)?;
        if request.depth == 0 {
            return Err(DriverError::Exhausted);
        }
        state.next_ring += 1;
        let id = RingId(state.next_ring);
        state.rings.insert(id, SimRing::new(&request));
        debug!(
            ring = %id,
            stream_id = %request.stream_id,
            kind = ?request.kind,
            depth = request.depth,
            "ring allocated"
        );
        Ok(id)
    }

    fn free_ring(&self, ring: RingId) -> Result<(), DriverError> {
        self.state
            .lock()
            .rings
            .remove(&ring)
            .map(|_| ())
            .ok_or(DriverError::UnknownRing(ring))
    }

    fn enqueue(&self, ring: RingId, commands: &[u8]) -> Result<(), DriverError> {
        let entries = command::decode(commands)?;
        let mut state = self.state.lock();
        state.enqueue_attempts += 1;
        Self::check_transport(&state)?;
        if state.reject_enqueues > 0 {
            state.reject_enqueues -= 1;
            return Err(DriverError::RingFull(ring));
        }

        let sq = state.rings.get_mut(&ring).ok_or(DriverError::UnknownRing(ring))?;
        if !sq.enabled {
            return Err(DriverError::RingDisabled(ring));
        }
        if sq.entries.len() + entries.len() > sq.depth as usize {
            return Err(DriverError::RingFull(ring));
        }
        sq.tail = sq.tail.advance(entries.len() as u32);
        sq.entries.extend(entries.iter().copied());
        state.history.extend(entries);

        if state.mode == CompletionMode::Immediate {
            consume(&mut state, ring, usize::MAX);
            drop(state);
            self.reports.notify_all();
        }
        Ok(())
    }

    fn poll_completion(
        &self,
        ring: RingId,
        timeout: Duration,
    ) -> Result<Vec<CompletionRecord>, DriverError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            Self::check_transport(&state)?;
            let cq = state.rings.get_mut(&ring).ok_or(DriverError::UnknownRing(ring))?;
            if !cq.records.is_empty() {
                return Ok(cq.records.drain(..).collect());
            }
            if timeout.is_zero() || self.reports.wait_until(&mut state, deadline).timed_out() {
                return Ok(Vec::new());
            }
        }
    }

    fn query_head(&self, ring: RingId) -> Result<RingPos, DriverError> {
        let state = self.state.lock();
        Self::check_transport(&state)?;
        state
            .rings
            .get(&ring)
            .map(|r| r.head)
            .ok_or(DriverError::UnknownRing(ring))
    }

    fn query_tail(&self, ring: RingId) -> Result<RingPos, DriverError> {
        let state = self.state.lock();
        Self::check_transport(&state)?;
        state
            .rings
            .get(&ring)
            .map(|r| r.tail)
            .ok_or(DriverError::UnknownRing(ring))
    }

    fn set_head(&self, ring: RingId, head: RingPos) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        Self::check_transport(&state)?;
        let sq = state.rings.get_mut(&ring).ok_or(DriverError::UnknownRing(ring))?;
        let skip = (head.distance_from(sq.head) as usize).min(sq.entries.len());
        sq.entries.drain(..skip);
        sq.head = head;
        debug!(ring = %ring, head = %head, dropped = skip, "ring head moved");
        Ok(())
    }

    fn enable_ring(&self, ring: RingId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let r = state.rings.get_mut(&ring).ok_or(DriverError::UnknownRing(ring))?;
        r.enabled = true;
        Ok(())
    }

    fn disable_ring(&self, ring: RingId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let r = state.rings.get_mut(&ring).ok_or(DriverError::UnknownRing(ring))?;
        r.enabled = false;
        Ok(())
    }
}
