//! Priority-ordered load scheduling.
//!
//! Pending requests sit in a max-heap keyed by score. Re-scoring pushes a
//! fresh heap entry and leaves the old one behind; stale entries are
//! recognised on pop by comparing against the authoritative `queued` map.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::dataset::NodeKey;
use crate::worker::LoadTicket;

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    priority: f64,
    seq: u64,
    key: NodeKey,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; on ties the earlier insertion wins.
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    priority: f64,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ticket: LoadTicket,
    discard: bool,
}

/// Outcome of [`LoadScheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// The request was queued and has been removed.
    Dequeued,
    /// The load is in flight; its result will be dropped.
    Discarding,
    /// Nothing was pending for the node.
    NotPending,
}

/// Outcome of [`LoadScheduler::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completed {
    /// The result may be used.
    Accept,
    /// The load was cancelled while in flight.
    Discard,
    /// The ticket does not match an in-flight load.
    Unknown,
}

/// Max-priority queue of load requests with a cap on loads in flight.
#[derive(Debug, Default)]
pub struct LoadScheduler {
    heap: BinaryHeap<QueueEntry>,
    queued: HashMap<NodeKey, Queued>,
    loading: HashMap<NodeKey, InFlight>,
    next_seq: u64,
}

impl LoadScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request or update its priority.
    ///
    /// Returns false if the node is already loading. A load that was
    /// cancelled while in flight is wanted again and will not be discarded.
    pub fn enqueue(&mut self, key: NodeKey, priority: f64) -> bool {
        if let Some(in_flight) = self.loading.get_mut(&key) {
            in_flight.discard = false;
            return false;
        }

        let seq = match self.queued.get_mut(&key) {
            Some(entry) if entry.priority.to_bits() == priority.to_bits() => return true,
            Some(entry) => {
                entry.priority = priority;
                entry.seq
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.queued.insert(key, Queued { priority, seq });
                seq
            }
        };

        self.heap.push(QueueEntry { priority, seq, key });
        self.compact();
        true
    }

    /// Pop the highest-priority requests into the free concurrency slots.
    ///
    /// `dispatch` is offered each request in priority order. It returns the
    /// ticket of the started load, or `None` if the request cannot start yet
    /// (for example because the node's parent is not resident); such
    /// requests stay queued. Returns the dispatched keys and priorities.
    pub fn drain<F>(&mut self, max_concurrent: usize, mut dispatch: F) -> Vec<(NodeKey, f64)>
    where
        F: FnMut(NodeKey, f64) -> Option<LoadTicket>,
    {
        let slots = max_concurrent.saturating_sub(self.loading.len());
        let mut started = Vec::new();
        let mut deferred = Vec::new();

        while started.len() < slots {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            let Some(current) = self.queued.get(&entry.key) else {
                continue;
            };
            if current.seq != entry.seq || current.priority.to_bits() != entry.priority.to_bits() {
                continue;
            }

            match dispatch(entry.key, entry.priority) {
                Some(ticket) => {
                    self.queued.remove(&entry.key);
                    self.loading.insert(
                        entry.key,
                        InFlight {
                            ticket,
                            discard: false,
                        },
                    );
                    started.push((entry.key, entry.priority));
                }
                None => deferred.push(entry),
            }
        }

        self.heap.extend(deferred);
        started
    }

    /// Cancel the request for `key`.
    pub fn cancel(&mut self, key: NodeKey) -> Cancelled {
        if self.queued.remove(&key).is_some() {
            return Cancelled::Dequeued;
        }
        if let Some(in_flight) = self.loading.get_mut(&key) {
            in_flight.discard = true;
            return Cancelled::Discarding;
        }
        Cancelled::NotPending
    }

    /// Record that the load identified by `ticket` finished.
    pub fn complete(&mut self, key: NodeKey, ticket: LoadTicket) -> Completed {
        match self.loading.get(&key) {
            Some(in_flight) if in_flight.ticket == ticket => {
                let discard = in_flight.discard;
                self.loading.remove(&key);
                if discard {
                    Completed::Discard
                } else {
                    Completed::Accept
                }
            }
            _ => Completed::Unknown,
        }
    }

    /// Drop every queued request for which `keep` returns false.
    pub fn retain_queued<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(NodeKey) -> bool,
    {
        let before = self.queued.len();
        self.queued.retain(|key, _| keep(*key));
        self.compact();
        before - self.queued.len()
    }

    /// Keys of loads currently in flight, cancelled ones included.
    pub fn loading_keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.loading.keys().copied()
    }

    /// Whether a request for `key` is waiting.
    #[must_use]
    pub fn is_queued(&self, key: NodeKey) -> bool {
        self.queued.contains_key(&key)
    }

    /// Whether a load for `key` is in flight.
    #[must_use]
    pub fn is_loading(&self, key: NodeKey) -> bool {
        self.loading.contains_key(&key)
    }

    /// Whether the in-flight load for `key` will be discarded.
    #[must_use]
    pub fn is_discarding(&self, key: NodeKey) -> bool {
        self.loading.get(&key).is_some_and(|l| l.discard)
    }

    /// Priority of a queued request.
    #[must_use]
    pub fn priority(&self, key: NodeKey) -> Option<f64> {
        self.queued.get(&key).map(|q| q.priority)
    }

    /// Number of waiting requests.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Number of loads in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.loading.len()
    }

    /// Rebuild the heap once stale entries dominate it.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.queued.len() + 64 {
            return;
        }
        self.heap = self
            .queued
            .iter()
            .map(|(key, q)| QueueEntry {
                priority: q.priority,
                seq: q.seq,
                key: *key,
            })
            .collect();
    }
}
