//! In-memory broker: per-queue ready/active/delayed/failed sets.
//!
//! Each queue keeps its four sets and pause flag behind one mutex; a
//! `Notify` per queue wakes workers when something becomes claimable.
//! The broker holds scheduling state only - the durable store remains
//! authoritative and the broker can be rebuilt from it at any time.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use super::job::Envelope;
use crate::common::{CoreError, CoreResult};

/// Ordering key for the ready and failed sets: priority first, then FIFO by
/// enqueue sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: i16,
    seq: u64,
    id: Uuid,
}

/// Ordering key for the delayed min-heap: earliest due time first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedKey {
    due: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Ready(ReadyKey),
    Delayed,
    Active,
    Failed(ReadyKey),
}

struct Slot {
    envelope: Envelope,
    seq: u64,
    membership: Membership,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    slots: HashMap<Uuid, Slot>,
    ready: BTreeSet<ReadyKey>,
    delayed: BinaryHeap<Reverse<DelayedKey>>,
    failed: BTreeSet<ReadyKey>,
    active_count: usize,
    paused: bool,
}

impl QueueState {
    fn insert(&mut self, envelope: Envelope, due: Option<DateTime<Utc>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = envelope.id;
        let membership = match due {
            Some(due) => {
                self.delayed.push(Reverse(DelayedKey { due, seq, id }));
                Membership::Delayed
            }
            None => {
                let key = ReadyKey {
                    priority: envelope.priority,
                    seq,
                    id,
                };
                self.ready.insert(key);
                Membership::Ready(key)
            }
        };
        self.slots.insert(
            id,
            Slot {
                envelope,
                seq,
                membership,
            },
        );
    }

    fn counts(&self) -> QueueStats {
        QueueStats {
            waiting: self.ready.len(),
            active: self.active_count,
            delayed: self.slots.len() - self.ready.len() - self.active_count - self.failed.len(),
            failed: self.failed.len(),
            paused: self.paused,
        }
    }
}

struct QueueCell {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Per-queue set cardinalities plus the pause flag.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub failed: usize,
    pub paused: bool,
}

/// The in-memory broker. The queue map is fixed at construction (one entry
/// per registered type); all per-queue state lives behind that queue's mutex.
pub struct Broker {
    queues: HashMap<String, QueueCell>,
}

impl Broker {
    pub fn new(types: impl IntoIterator<Item = String>) -> Self {
        let queues = types
            .into_iter()
            .map(|name| {
                (
                    name,
                    QueueCell {
                        state: Mutex::new(QueueState::default()),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();
        Self { queues }
    }

    pub fn has_queue(&self, job_type: &str) -> bool {
        self.queues.contains_key(job_type)
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    fn cell(&self, job_type: &str) -> CoreResult<&QueueCell> {
        self.queues
            .get(job_type)
            .ok_or_else(|| CoreError::Validation(format!("unknown queue type: {job_type}")))
    }

    /// Place an envelope into `ready`, or into `delayed` when `delay_ms` is
    /// positive.
    pub fn enqueue(&self, envelope: Envelope, delay_ms: Option<u64>) -> CoreResult<()> {
        let cell = self.cell(&envelope.job_type)?;
        let due = match delay_ms {
            Some(ms) if ms > 0 => Some(Utc::now() + Duration::milliseconds(ms as i64)),
            _ => None,
        };
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let claimable = due.is_none() && !state.paused;
        state.insert(envelope, due);
        drop(state);
        if claimable {
            cell.notify.notify_waiters();
        }
        Ok(())
    }

    /// Place an envelope directly into `delayed` with an absolute due time.
    /// Used when rebuilding the broker from durable `delayed` records.
    pub fn enqueue_delayed_until(&self, envelope: Envelope, due: DateTime<Utc>) -> CoreResult<()> {
        let cell = self.cell(&envelope.job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        state.insert(envelope, Some(due));
        Ok(())
    }

    /// Place an envelope directly into the failed set. Used when rebuilding
    /// from durable `failed` records on boot.
    pub fn enqueue_failed(&self, envelope: Envelope) -> CoreResult<()> {
        let cell = self.cell(&envelope.job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        let key = ReadyKey {
            priority: envelope.priority,
            seq,
            id: envelope.id,
        };
        state.failed.insert(key);
        state.slots.insert(
            envelope.id,
            Slot {
                envelope,
                seq,
                membership: Membership::Failed(key),
            },
        );
        Ok(())
    }

    /// Claim up to `n` ready envelopes in `(priority, enqueue_seq)` order,
    /// moving them to `active`. A paused queue yields nothing.
    pub fn claim(&self, job_type: &str, n: usize) -> CoreResult<Vec<Envelope>> {
        let cell = self.cell(job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        if state.paused {
            return Ok(Vec::new());
        }
        let mut claimed = Vec::new();
        while claimed.len() < n {
            let Some(key) = state.ready.iter().next().copied() else {
                break;
            };
            state.ready.remove(&key);
            state.active_count += 1;
            let slot = state
                .slots
                .get_mut(&key.id)
                .expect("ready key without slot");
            slot.membership = Membership::Active;
            claimed.push(slot.envelope.clone());
        }
        Ok(claimed)
    }

    /// Remove a completed job from `active`.
    pub fn ack(&self, job_type: &str, id: Uuid) -> CoreResult<bool> {
        let cell = self.cell(job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let is_active = matches!(
            state.slots.get(&id),
            Some(slot) if slot.membership == Membership::Active
        );
        if !is_active {
            return Ok(false);
        }
        state.slots.remove(&id);
        state.active_count -= 1;
        Ok(true)
    }

    /// Remove a job from `active`; with `retry_in_ms` it re-enters `delayed`,
    /// otherwise it parks in the failed set.
    pub fn fail(&self, job_type: &str, id: Uuid, retry_in_ms: Option<u64>) -> CoreResult<bool> {
        let cell = self.cell(job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let Some(slot) = state.slots.get(&id) else {
            return Ok(false);
        };
        if slot.membership != Membership::Active {
            return Ok(false);
        }
        let seq = slot.seq;
        let priority = slot.envelope.priority;
        state.active_count -= 1;
        match retry_in_ms {
            Some(ms) => {
                let due = Utc::now() + Duration::milliseconds(ms as i64);
                state.delayed.push(Reverse(DelayedKey { due, seq, id }));
                state.slots.get_mut(&id).expect("slot vanished").membership =
                    Membership::Delayed;
            }
            None => {
                let key = ReadyKey { priority, seq, id };
                state.failed.insert(key);
                state.slots.get_mut(&id).expect("slot vanished").membership =
                    Membership::Failed(key);
            }
        }
        Ok(true)
    }

    /// Permanently drop a job from the broker (terminal `dead`).
    pub fn discard(&self, job_type: &str, id: Uuid) -> CoreResult<bool> {
        let cell = self.cell(job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let Some(slot) = state.slots.remove(&id) else {
            return Ok(false);
        };
        match slot.membership {
            Membership::Active => state.active_count -= 1,
            Membership::Ready(key) => {
                state.ready.remove(&key);
            }
            Membership::Failed(key) => {
                state.failed.remove(&key);
            }
            // Delayed heap entries are lazily dropped on promotion.
            Membership::Delayed => {}
        }
        Ok(true)
    }

    /// Move delayed items whose due time has passed into `ready`, preserving
    /// priority order. Returns the promoted job ids.
    pub fn promote_due(&self, job_type: &str, now: DateTime<Utc>) -> CoreResult<Vec<Uuid>> {
        let cell = self.cell(job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let mut promoted = Vec::new();
        while let Some(Reverse(key)) = state.delayed.peek().copied() {
            if key.due > now {
                break;
            }
            state.delayed.pop();
            // Entries whose job was discarded while delayed are skipped.
            let Some(slot) = state.slots.get_mut(&key.id) else {
                continue;
            };
            if slot.membership != Membership::Delayed {
                continue;
            }
            let ready_key = ReadyKey {
                priority: slot.envelope.priority,
                seq: key.seq,
                id: key.id,
            };
            slot.membership = Membership::Ready(ready_key);
            state.ready.insert(ready_key);
            promoted.push(key.id);
        }
        let wake = !promoted.is_empty() && !state.paused;
        drop(state);
        if wake {
            cell.notify.notify_waiters();
        }
        Ok(promoted)
    }

    /// Pause claiming for a queue. Idempotent; jobs already active finish.
    pub fn pause(&self, job_type: &str) -> CoreResult<()> {
        let cell = self.cell(job_type)?;
        cell.state.lock().expect("broker mutex poisoned").paused = true;
        Ok(())
    }

    /// Resume claiming. Idempotent.
    pub fn resume(&self, job_type: &str) -> CoreResult<()> {
        let cell = self.cell(job_type)?;
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        state.paused = false;
        let wake = !state.ready.is_empty();
        drop(state);
        if wake {
            cell.notify.notify_waiters();
        }
        Ok(())
    }

    pub fn is_paused(&self, job_type: &str) -> CoreResult<bool> {
        let cell = self.cell(job_type)?;
        Ok(cell.state.lock().expect("broker mutex poisoned").paused)
    }

    /// Ids currently parked in failed sets, without moving anything. Lets the
    /// coordinator commit the durable `failed -> waiting` writes first.
    pub fn failed_snapshot(&self, job_type: Option<&str>) -> CoreResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        match job_type {
            Some(t) => {
                let cell = self.cell(t)?;
                let state = cell.state.lock().expect("broker mutex poisoned");
                ids.extend(state.failed.iter().map(|key| key.id));
            }
            None => {
                for cell in self.queues.values() {
                    let state = cell.state.lock().expect("broker mutex poisoned");
                    ids.extend(state.failed.iter().map(|key| key.id));
                }
            }
        }
        Ok(ids)
    }

    /// Move failed items back to `ready` (priority retained). With no type,
    /// sweeps every queue. Returns the moved job ids.
    pub fn retry_all_failed(&self, job_type: Option<&str>) -> CoreResult<Vec<Uuid>> {
        let mut moved = Vec::new();
        match job_type {
            Some(t) => {
                self.cell(t)?;
                self.retry_failed_for(t, &mut moved);
            }
            None => {
                let names: Vec<String> = self.queues.keys().cloned().collect();
                for name in names {
                    self.retry_failed_for(&name, &mut moved);
                }
            }
        }
        Ok(moved)
    }

    fn retry_failed_for(&self, job_type: &str, moved: &mut Vec<Uuid>) {
        let Some(cell) = self.queues.get(job_type) else {
            return;
        };
        let mut state = cell.state.lock().expect("broker mutex poisoned");
        let keys: Vec<ReadyKey> = state.failed.iter().copied().collect();
        for key in keys {
            state.failed.remove(&key);
            state.ready.insert(key);
            if let Some(slot) = state.slots.get_mut(&key.id) {
                slot.membership = Membership::Ready(key);
            }
            moved.push(key.id);
        }
        let wake = !moved.is_empty() && !state.paused;
        drop(state);
        if wake {
            cell.notify.notify_waiters();
        }
    }

    pub fn stats(&self, job_type: &str) -> CoreResult<QueueStats> {
        let cell = self.cell(job_type)?;
        let state = cell.state.lock().expect("broker mutex poisoned");
        Ok(state.counts())
    }

    pub fn stats_all(&self) -> HashMap<String, QueueStats> {
        self.queues
            .iter()
            .map(|(name, cell)| {
                let state = cell.state.lock().expect("broker mutex poisoned");
                (name.clone(), state.counts())
            })
            .collect()
    }

    /// Wait until this queue signals that something may be claimable.
    /// Callers should re-check with `claim` and keep their own timeout.
    pub async fn ready_signal(&self, job_type: &str) {
        if let Some(cell) = self.queues.get(job_type) {
            cell.notify.notified().await;
        }
    }
}
