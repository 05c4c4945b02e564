//! TX scheduler: a single priority queue of outbound frames, a token bucket
//! per destination for airtime rate-limiting, and completed-entry pruning.
//!
//! Pure in the same sense as the rest of this crate's protocol logic: nothing
//! here reads a clock. Every method that needs to reason about elapsed time
//! takes `now: Instant` from the caller.

use crate::address::Address;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const PRIORITY_BULK: i32 = 10;
pub const PRIORITY_NORMAL: i32 = 50;
pub const PRIORITY_INTERACTIVE: i32 = 100;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutboundFrame {
    pub id: Uuid,
    pub destination: Address,
    pub priority: i32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TxFrameStatus {
    Queued,
    Sending,
    Sent,
    AwaitingAck,
    Acked,
    Failed,
    Cancelled,
}

impl TxFrameStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxFrameStatus::Acked | TxFrameStatus::Failed | TxFrameStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TxFrameState {
    pub status: TxFrameStatus,
    pub attempts: u32,
}

impl TxFrameState {
    fn new() -> Self {
        Self {
            status: TxFrameStatus::Queued,
            attempts: 0,
        }
    }
}

/// An entry owned by the scheduler. Not persisted directly - `updated_at` is
/// a monotonic `Instant` with no meaningful serialized form; only the
/// `OutboundFrame`/`TxFrameState` pair inside it is the persistence boundary.
struct TxQueueEntry {
    frame: OutboundFrame,
    state: TxFrameState,
    enqueue_order: u64,
    updated_at: Instant,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct HeapKey {
    priority: i32,
    enqueue_order: u64,
    id: Uuid,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_order.cmp(&self.enqueue_order))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-destination token bucket. Buckets are created lazily on first use and
/// are never evicted - a station we stop hearing from just stops consuming
/// scheduler memory growth beyond its one bucket.
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill by `rate * elapsed` (capped at `capacity`), then attempt to
    /// spend `cost`. Returns whether the spend succeeded.
    pub fn allow(&mut self, cost: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub rate: f64,
    pub burst: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate: 2.0,
            burst: 5.0,
        }
    }
}

pub struct TxScheduler {
    config: SchedulerConfig,
    entries: HashMap<Uuid, TxQueueEntry>,
    heap: BinaryHeap<HeapKey>,
    next_enqueue_order: u64,
    buckets: HashMap<Address, TokenBucket>,
}

impl TxScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            next_enqueue_order: 0,
            buckets: HashMap::new(),
        }
    }

    pub fn enqueue(&mut self, frame: OutboundFrame, now: Instant) -> Uuid {
        let id = frame.id;
        let enqueue_order = self.next_enqueue_order;
        self.next_enqueue_order += 1;
        self.heap.push(HeapKey {
            priority: frame.priority,
            enqueue_order,
            id,
        });
        self.entries.insert(
            id,
            TxQueueEntry {
                frame,
                state: TxFrameState::new(),
                enqueue_order,
                updated_at: now,
            },
        );
        id
    }

    /// Walk the queue head-first, skipping any entry whose destination is
    /// currently rate-limited, and return the first one allowed through. The
    /// returned entry transitions to `Sending`. Entries skipped because their
    /// destination is rate-limited are left in place for the next call.
    pub fn dequeue(&mut self, now: Instant) -> Option<Uuid> {
        let mut deferred = Vec::new();
        let mut chosen = None;
        while let Some(key) = self.heap.pop() {
            let Some(entry) = self.entries.get(&key.id) else {
                continue; // stale key from a pruned/removed entry
            };
            if entry.state.status != TxFrameStatus::Queued {
                continue; // stale key from before a requeue or status change
            }
            let destination = entry.frame.destination.clone();
            let bucket = self
                .buckets
                .entry(destination)
                .or_insert_with(|| TokenBucket::new(self.config.rate, self.config.burst, now));
            if bucket.allow(1.0, now) {
                chosen = Some(key);
                break;
            }
            deferred.push(key);
        }
        for key in deferred {
            self.heap.push(key);
        }
        let key = chosen?;
        if let Some(entry) = self.entries.get_mut(&key.id) {
            entry.state.status = TxFrameStatus::Sending;
            entry.updated_at = now;
        }
        Some(key.id)
    }

    pub fn set_status(&mut self, id: Uuid, status: TxFrameStatus, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state.status = status;
            entry.updated_at = now;
        }
    }

    /// Put a frame back into the queue for another attempt, incrementing its
    /// attempt counter and re-inserting its key into the priority heap.
    pub fn requeue(&mut self, id: Uuid, now: Instant) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.state.status = TxFrameStatus::Queued;
        entry.state.attempts += 1;
        entry.updated_at = now;
        self.heap.push(HeapKey {
            priority: entry.frame.priority,
            enqueue_order: entry.enqueue_order,
            id,
        });
    }

    pub fn state_of(&self, id: Uuid) -> Option<&TxFrameState> {
        self.entries.get(&id).map(|e| &e.state)
    }

    pub fn frame_of(&self, id: Uuid) -> Option<&OutboundFrame> {
        self.entries.get(&id).map(|e| &e.frame)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry's `(OutboundFrame, TxFrameState)` pair - the persistence
    /// boundary a caller saves across restarts.
    pub fn snapshot(&self) -> Vec<(OutboundFrame, TxFrameState)> {
        self.entries
            .values()
            .map(|e| (e.frame.clone(), e.state.clone()))
            .collect()
    }

    /// Reinsert a persisted `(frame, state)` pair. Any non-terminal status is
    /// normalized back to `queued` since an in-flight send cannot be assumed
    /// to have landed across a restart.
    pub fn restore(&mut self, frame: OutboundFrame, mut state: TxFrameState, now: Instant) {
        if !state.status.is_terminal() {
            state.status = TxFrameStatus::Queued;
        }
        let id = frame.id;
        let enqueue_order = self.next_enqueue_order;
        self.next_enqueue_order += 1;
        if state.status == TxFrameStatus::Queued {
            self.heap.push(HeapKey {
                priority: frame.priority,
                enqueue_order,
                id,
            });
        }
        self.entries.insert(
            id,
            TxQueueEntry {
                frame,
                state,
                enqueue_order,
                updated_at: now,
            },
        );
    }

    /// Remove terminal-state entries whose last status change happened more
    /// than `older_than` before `now`. Returns how many were reclaimed.
    pub fn prune_completed(&mut self, now: Instant, older_than: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.state.status.is_terminal()
                && now.saturating_duration_since(entry.updated_at) >= older_than)
        });
        before - self.entries.len()
    }
}
