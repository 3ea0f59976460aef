//! Per-connection sequencing and duplicate suppression.
//!
//! Packets of one virtual connection may arrive on any physical link, in any
//! order, and more than once. Instead of buffering and reordering, every
//! packet is admitted against the last delivered sequence number of its
//! connection:
//!
//! - `seq == last + 1` is delivered and becomes the new `last`
//! - `seq` at or behind `last` is a duplicate and is dropped
//! - anything further ahead waits until the gap before it has been delivered
//!
//! The delivery callback runs inside the same critical section that advances
//! `last`, so two links can never hand payloads to the reader out of order.
//! Slots live in a bounded map keyed by [`ConnKey`] and are evicted when the
//! connection is torn down; eviction wakes every waiter. Evicted keys are
//! remembered for a while so that straggling duplicates of a finished
//! connection are dropped instead of reviving its slot.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default number of connections tracked at once
pub const DEFAULT_CAPACITY: usize = u16::MAX as usize;

/// Number of evicted connections remembered
pub const RETIRED_CAPACITY: usize = 4096;

/// Identity of one virtual connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey {
    /// Identity of the process that opened the connection
    pub sender_id: u32,
    /// Connection number assigned by that process
    pub conn_id: u32,
}

impl ConnKey {
    pub fn new(sender_id: u32, conn_id: u32) -> Self {
        Self { sender_id, conn_id }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}/{}", self.sender_id, self.conn_id)
    }
}

/// Classification of a sequence number against the last delivered one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Next in line
    Deliver,
    /// Already delivered
    Duplicate,
    /// Ahead of a gap
    MustWait,
}

/// Classify `seq` given the last delivered sequence number.
///
/// Distances are computed with wrapping arithmetic so the counter may roll
/// over `u32::MAX`.
pub fn verdict(last: u32, seq: u32) -> Verdict {
    let ahead = seq.wrapping_sub(last);
    if ahead == 1 {
        Verdict::Deliver
    } else if ahead == 0 || ahead > u32::MAX / 2 {
        Verdict::Duplicate
    } else {
        Verdict::MustWait
    }
}

/// Outcome of a completed admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The delivery callback ran and `last` advanced
    Delivered,
    /// The packet was dropped as already delivered
    Duplicate,
}

/// Sequencer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequencerError {
    #[error("Sequencer table full: {capacity} connections tracked")]
    TableFull { capacity: usize },

    #[error("Connection was torn down while waiting")]
    Evicted,

    #[error("Waited too long for the missing sequence before {0}")]
    Stalled(u32),

    #[error("Wait cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    last: u32,
    evicted: bool,
}

type Slot = Arc<watch::Sender<SlotState>>;

#[derive(Default)]
struct Table {
    slots: HashMap<ConnKey, Slot>,
    retired: HashSet<ConnKey>,
    retired_order: VecDeque<ConnKey>,
}

impl Table {
    fn retire(&mut self, key: ConnKey) {
        if !self.retired.insert(key) {
            return;
        }
        self.retired_order.push_back(key);
        if self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

/// Bounded table of per-connection sequence state
pub struct Sequencer {
    table: Mutex<Table>,
    capacity: usize,
}

impl Sequencer {
    /// Create a sequencer tracking at most `capacity` connections
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            capacity,
        }
    }

    /// Classify `seq` without waiting or allocating a slot.
    ///
    /// Anything for an evicted connection is a duplicate.
    pub fn peek(&self, key: ConnKey, seq: u32) -> Verdict {
        let table = self.table.lock();
        if table.retired.contains(&key) {
            return Verdict::Duplicate;
        }
        let last = table.slots.get(&key).map_or(0, |slot| slot.borrow().last);
        verdict(last, seq)
    }

    /// Last delivered sequence number, if the connection is tracked
    pub fn last(&self, key: ConnKey) -> Option<u32> {
        self.table
            .lock()
            .slots
            .get(&key)
            .map(|slot| slot.borrow().last)
    }

    /// Whether `key` was evicted recently
    pub fn is_retired(&self, key: ConnKey) -> bool {
        self.table.lock().retired.contains(&key)
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().slots.is_empty()
    }

    /// Admit one packet, waiting while it is ahead of a gap.
    ///
    /// `deliver` runs at most once, while the connection's state is locked
    /// and right before `last` advances to `seq`. It must not call back into
    /// this sequencer.
    ///
    /// The wait ends with an error when `cancel` fires, when `stall` elapses
    /// without the gap closing, or when the connection is evicted.
    pub async fn admit<F>(
        &self,
        key: ConnKey,
        seq: u32,
        cancel: &CancellationToken,
        stall: Option<Duration>,
        deliver: F,
    ) -> Result<Admission, SequencerError>
    where
        F: FnOnce(),
    {
        let slot = self.slot(key)?;
        let mut rx = slot.subscribe();
        let mut deliver = Some(deliver);
        let deadline = stall.map(|d| Instant::now() + d);

        loop {
            let mut outcome = None;
            slot.send_if_modified(|state| {
                if state.evicted {
                    outcome = Some(Err(SequencerError::Evicted));
                    return false;
                }
                match verdict(state.last, seq) {
                    Verdict::Deliver => {
                        if let Some(f) = deliver.take() {
                            f();
                        }
                        state.last = seq;
                        outcome = Some(Ok(Admission::Delivered));
                        true
                    }
                    Verdict::Duplicate => {
                        outcome = Some(Ok(Admission::Duplicate));
                        false
                    }
                    Verdict::MustWait => false,
                }
            });
            if let Some(outcome) = outcome {
                return outcome;
            }

            tracing::trace!(conn = %key, seq, "waiting for earlier sequence");
            let ready = async {
                rx.wait_for(|s| s.evicted || verdict(s.last, seq) != Verdict::MustWait)
                    .await
                    .is_ok()
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(SequencerError::Cancelled),
                _ = stall_timer(deadline) => return Err(SequencerError::Stalled(seq)),
                woke = ready => {
                    if !woke {
                        return Err(SequencerError::Evicted);
                    }
                }
            }
        }
    }

    /// Forget a connection and wake everyone waiting on it.
    ///
    /// Later admissions for `key` fail with [`SequencerError::Evicted`] until
    /// it ages out of the retired set. Returns `false` if the connection was
    /// not tracked.
    pub fn evict(&self, key: ConnKey) -> bool {
        let slot = {
            let mut table = self.table.lock();
            table.retire(key);
            table.slots.remove(&key)
        };
        match slot {
            Some(slot) => {
                slot.send_modify(|state| state.evicted = true);
                true
            }
            None => false,
        }
    }

    fn slot(&self, key: ConnKey) -> Result<Slot, SequencerError> {
        let mut table = self.table.lock();
        if let Some(slot) = table.slots.get(&key) {
            return Ok(Arc::clone(slot));
        }
        if table.retired.contains(&key) {
            return Err(SequencerError::Evicted);
        }
        if table.slots.len() >= self.capacity {
            return Err(SequencerError::TableFull {
                capacity: self.capacity,
            });
        }
        let (tx, _rx) = watch::channel(SlotState::default());
        let slot = Arc::new(tx);
        table.slots.insert(key, Arc::clone(&slot));
        Ok(slot)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

async fn stall_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
