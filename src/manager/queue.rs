//! Priority-ordered wait list for downloads the concurrency gate has not
//! admitted yet.

use serde::{Deserialize, Serialize};

/// Persisted shape of the queue. `active` is derived at runtime and never
/// stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub max_concurrent: usize,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub waiting: Vec<WaitingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub hash: String,
    pub priority: u8,
}

/// One waiting download as reported by `Manager::queue_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePosition {
    pub hash: String,
    pub priority: u8,
    pub position: usize,
}

#[derive(Debug, Clone)]
struct QueuedEntry {
    hash: String,
    priority: u8,
}

/// The waiting list proper: ordered by priority descending, FIFO within a
/// priority. `max_concurrent == 0` disables the gate entirely.
#[derive(Debug)]
pub(crate) struct Queue {
    max_concurrent: usize,
    paused: bool,
    waiting: Vec<QueuedEntry>,
}

impl Queue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            paused: false,
            waiting: Vec::new(),
        }
    }

    pub fn from_state(state: &QueueState, max_concurrent: usize) -> Self {
        let mut queue = Self::new(max_concurrent);
        queue.paused = state.paused;
        for entry in &state.waiting {
            queue.enqueue(entry.hash.clone(), entry.priority);
        }
        queue
    }

    pub fn to_state(&self) -> QueueState {
        QueueState {
            max_concurrent: self.max_concurrent,
            paused: self.paused,
            waiting: self
                .waiting
                .iter()
                .map(|e| WaitingEntry {
                    hash: e.hash.clone(),
                    priority: e.priority,
                })
                .collect(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// `true` when `active_count` leaves no room for another admission.
    pub fn at_capacity(&self, active_count: usize) -> bool {
        self.max_concurrent != 0 && active_count >= self.max_concurrent
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.waiting.iter().any(|e| e.hash == hash)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Inserts keeping the priority-desc / FIFO order: behind every entry of
    /// the same or higher priority, ahead of all lower ones.
    pub fn enqueue(&mut self, hash: String, priority: u8) {
        let idx = self
            .waiting
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(idx, QueuedEntry { hash, priority });
    }

    /// Re-queues at the front of its priority class; used when an active
    /// download is pushed back to waiting.
    pub fn enqueue_front(&mut self, hash: String, priority: u8) {
        let idx = self
            .waiting
            .iter()
            .position(|e| e.priority <= priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(idx, QueuedEntry { hash, priority });
    }

    /// Pops the highest-priority, oldest entry.
    #[cfg(test)]
    pub fn dequeue_next(&mut self) -> Option<(String, u8)> {
        if self.waiting.is_empty() {
            return None;
        }
        let entry = self.waiting.remove(0);
        Some((entry.hash, entry.priority))
    }

    /// Pops the first entry (in queue order) accepted by `ready`; entries
    /// that are not ready stay where they are.
    pub fn dequeue_where(&mut self, ready: impl Fn(&str) -> bool) -> Option<(String, u8)> {
        let idx = self.waiting.iter().position(|e| ready(&e.hash))?;
        let entry = self.waiting.remove(idx);
        Some((entry.hash, entry.priority))
    }

    pub fn remove(&mut self, hash: &str) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|e| e.hash != hash);
        self.waiting.len() != before
    }

    /// Moves an entry to an explicit position in the visible waiting list.
    /// This is a user override; priority ordering is only enforced at
    /// insertion time.
    pub fn move_to(&mut self, hash: &str, new_position: usize) -> bool {
        let Some(idx) = self.waiting.iter().position(|e| e.hash == hash) else {
            return false;
        };
        let entry = self.waiting.remove(idx);
        let target = new_position.min(self.waiting.len());
        self.waiting.insert(target, entry);
        true
    }

    pub fn positions(&self) -> Vec<QueuePosition> {
        self.waiting
            .iter()
            .enumerate()
            .map(|(position, e)| QueuePosition {
                hash: e.hash.clone(),
                priority: e.priority,
                position,
            })
            .collect()
    }

    /// Drops waiting entries whose item no longer exists.
    pub fn retain_known(&mut self, known: impl Fn(&str) -> bool) {
        self.waiting.retain(|e| known(&e.hash));
    }
}
