//! Least-recently-used residency cache.
//!
//! Resident nodes live in a slab and are threaded onto an intrusive doubly
//! linked list ordered by last touch, most recent at the head. A hash map
//! finds a node's slot, so touch, insert and remove are all O(1).
//!
//! The cache enforces level-order residency: a node may only be inserted
//! while its parent is resident, and a node with resident children is never
//! evicted or removed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use pointstream_decode::DecodedBuffers;

use crate::dataset::NodeKey;
use crate::error::{Error, Result};

/// Decoded buffers owned by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidentGeometry {
    buffers: DecodedBuffers,
    version: u64,
    point_count: u64,
}

impl ResidentGeometry {
    /// The decoded buffers.
    #[must_use]
    pub fn buffers(&self) -> &DecodedBuffers {
        &self.buffers
    }

    /// Version of the buffers. Every insert gets a larger version than any
    /// before it, so a renderer can tell reloaded data apart.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of points in the buffers.
    #[must_use]
    pub fn point_count(&self) -> u64 {
        self.point_count
    }
}

/// Outcome of [`ResidencyCache::evict_until`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Evicted nodes, least recently used first.
    pub evicted: Vec<NodeKey>,
    /// Points released by the evictions.
    pub freed_points: u64,
    /// Still over budget because nothing else was evictable.
    pub over_budget: bool,
}

#[derive(Debug)]
struct Slot {
    key: NodeKey,
    parent: Option<NodeKey>,
    geometry: ResidentGeometry,
    resident_children: u32,
    touched_frame: u64,
    // Grows towards the head, so older slots have smaller stamps.
    stamp: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Resident geometry for every loaded node, in least-recently-used order.
#[derive(Debug, Default)]
pub struct ResidencyCache {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<NodeKey, usize>,
    // Most recently used.
    head: Option<usize>,
    // Least recently used.
    tail: Option<usize>,
    resident_points: u64,
    next_version: u64,
    next_stamp: u64,
}

impl ResidencyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert decoded buffers for `key` at the most recently used end.
    ///
    /// The node counts as touched in `frame`. Returns the buffer version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResident`] if the node is already resident and
    /// [`Error::ParentNotResident`] if `parent` is not.
    pub fn insert(
        &mut self,
        key: NodeKey,
        parent: Option<NodeKey>,
        buffers: DecodedBuffers,
        frame: u64,
    ) -> Result<u64> {
        if self.index.contains_key(&key) {
            return Err(Error::AlreadyResident(key));
        }
        if let Some(parent) = parent {
            let Some(&parent_slot) = self.index.get(&parent) else {
                return Err(Error::ParentNotResident(key));
            };
            self.slot_mut(parent_slot).resident_children += 1;
        }

        self.next_version += 1;
        let point_count = buffers.point_count() as u64;
        let slot = Slot {
            key,
            parent,
            geometry: ResidentGeometry {
                buffers,
                version: self.next_version,
                point_count,
            },
            resident_children: 0,
            touched_frame: frame,
            stamp: 0,
            prev: None,
            next: None,
        };

        let at = match self.free.pop() {
            Some(at) => {
                self.slots[at] = Some(slot);
                at
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, at);
        self.push_front(at);
        self.resident_points += point_count;
        Ok(self.next_version)
    }

    /// Mark `key` as used in `frame` and move it to the most recently used
    /// end. Returns false if the node is not resident.
    pub fn touch(&mut self, key: NodeKey, frame: u64) -> bool {
        let Some(&at) = self.index.get(&key) else {
            return false;
        };
        self.slot_mut(at).touched_frame = frame;
        if self.head != Some(at) {
            self.unlink(at);
            self.push_front(at);
        }
        true
    }

    /// Evict least recently used nodes until at most `budget` points are
    /// resident.
    ///
    /// Nodes touched in `frame` and nodes with resident children are
    /// skipped. Running out of evictable nodes is reported, not an error.
    pub fn evict_until(&mut self, budget: u64, frame: u64) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut cursor = self.tail;
        // Parents the cursor already passed that lost their last resident
        // child. All of them are older than the cursor, oldest first.
        let mut released = BinaryHeap::new();

        while self.resident_points > budget {
            let at = if let Some(Reverse((_, at))) = released.pop() {
                at
            } else {
                let Some(at) = cursor else {
                    report.over_budget = true;
                    break;
                };
                let slot = self.slot(at);
                cursor = slot.prev;
                if slot.resident_children > 0 || slot.touched_frame == frame {
                    continue;
                }
                at
            };

            let slot = self.slot(at);
            let key = slot.key;
            let parent = slot.parent.and_then(|p| self.index.get(&p).copied());
            let geometry = self.detach(at);
            report.freed_points += geometry.point_count;
            report.evicted.push(key);

            if let Some(parent) = parent {
                let slot = self.slot(parent);
                let passed = cursor.is_none_or(|c| slot.stamp < self.slot(c).stamp);
                if passed && slot.resident_children == 0 && slot.touched_frame != frame {
                    released.push(Reverse((slot.stamp, parent)));
                }
            }
        }

        if !report.evicted.is_empty() {
            tracing::debug!(
                evicted = report.evicted.len(),
                freed_points = report.freed_points,
                resident_points = self.resident_points,
                budget,
                "evicted nodes"
            );
        }
        report
    }

    /// Remove `key` explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownNode`] if the node is not resident and
    /// [`Error::ResidentChildren`] if any of its children are.
    pub fn remove(&mut self, key: NodeKey) -> Result<ResidentGeometry> {
        let Some(&at) = self.index.get(&key) else {
            return Err(Error::UnknownNode(key));
        };
        if self.slot(at).resident_children > 0 {
            return Err(Error::ResidentChildren(key));
        }
        Ok(self.detach(at))
    }

    /// Resident geometry of `key`.
    #[must_use]
    pub fn get(&self, key: NodeKey) -> Option<&ResidentGeometry> {
        self.index.get(&key).map(|&at| &self.slot(at).geometry)
    }

    /// Whether `key` is resident.
    #[must_use]
    pub fn contains(&self, key: NodeKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Number of resident children of `key`.
    #[must_use]
    pub fn resident_children(&self, key: NodeKey) -> u32 {
        self.index
            .get(&key)
            .map_or(0, |&at| self.slot(at).resident_children)
    }

    /// Total points across all resident nodes.
    #[must_use]
    pub fn resident_points(&self) -> u64 {
        self.resident_points
    }

    /// Number of resident nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Resident keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = NodeKey> + '_ {
        std::iter::successors(self.head, |&at| self.slot(at).next).map(|at| self.slot(at).key)
    }

    fn slot(&self, at: usize) -> &Slot {
        self.slots[at].as_ref().unwrap_or_else(|| unreachable!("linked slot {at} is vacant"))
    }

    fn slot_mut(&mut self, at: usize) -> &mut Slot {
        self.slots[at].as_mut().unwrap_or_else(|| unreachable!("linked slot {at} is vacant"))
    }

    fn push_front(&mut self, at: usize) {
        let old_head = self.head;
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        {
            let slot = self.slot_mut(at);
            slot.prev = None;
            slot.next = old_head;
            slot.stamp = stamp;
        }
        match old_head {
            Some(h) => self.slot_mut(h).prev = Some(at),
            None => self.tail = Some(at),
        }
        self.head = Some(at);
    }

    fn unlink(&mut self, at: usize) {
        let (prev, next) = {
            let slot = self.slot(at);
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Unlink and free a slot, updating the parent and the point total.
    fn detach(&mut self, at: usize) -> ResidentGeometry {
        self.unlink(at);
        let Some(slot) = self.slots[at].take() else {
            unreachable!("linked slot {at} is vacant");
        };
        self.free.push(at);
        self.index.remove(&slot.key);
        if let Some(&parent) = slot.parent.as_ref().and_then(|p| self.index.get(p)) {
            let parent = self.slot_mut(parent);
            parent.resident_children = parent.resident_children.saturating_sub(1);
        }
        self.resident_points -= slot.geometry.point_count;
        slot.geometry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::test_support::{buffers, key};
    use proptest::prelude::*;

    #[test]
    fn test_insert_and_accounting() {
        let mut cache = ResidencyCache::new();
        let v1 = cache.insert(key(0), None, buffers(10), 1).unwrap();
        let v2 = cache.insert(key(1), Some(key(0)), buffers(5), 1).unwrap();

        assert!(v2 > v1);
        assert_eq!(cache.resident_points(), 15);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.resident_children(key(0)), 1);
        assert_eq!(cache.get(key(1)).unwrap().point_count(), 5);
    }

    #[test]
    fn test_insert_rejects_double_and_orphan() {
        let mut cache = ResidencyCache::new();
        cache.insert(key(0), None, buffers(1), 1).unwrap();

        assert!(matches!(
            cache.insert(key(0), None, buffers(1), 1),
            Err(Error::AlreadyResident(_))
        ));
        assert!(matches!(
            cache.insert(key(2), Some(key(1)), buffers(1), 1),
            Err(Error::ParentNotResident(_))
        ));
        assert_eq!(cache.resident_points(), 1);
    }

    #[test]
    fn test_touch_moves_to_front() {
        let mut cache = ResidencyCache::new();
        for n in 0..3 {
            cache.insert(key(n), None, buffers(1), 1).unwrap();
        }
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec![key(2), key(1), key(0)]);

        assert!(cache.touch(key(0), 2));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec![key(0), key(2), key(1)]);

        // Touching the most recent node keeps the order.
        assert!(cache.touch(key(0), 2));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec![key(0), key(2), key(1)]);

        assert!(!cache.touch(key(9), 2));
    }

    #[test]
    fn test_evict_least_recent_first() {
        let mut cache = ResidencyCache::new();
        for n in 0..4 {
            cache.insert(key(n), None, buffers(10), 1).unwrap();
        }
        cache.touch(key(0), 2);

        let report = cache.evict_until(20, 3);
        assert_eq!(report.evicted, vec![key(1), key(2)]);
        assert_eq!(report.freed_points, 20);
        assert!(!report.over_budget);
        assert_eq!(cache.resident_points(), 20);
        assert!(cache.contains(key(0)));
        assert!(cache.contains(key(3)));
    }

    #[test]
    fn test_evict_skips_nodes_touched_this_frame() {
        let mut cache = ResidencyCache::new();
        cache.insert(key(0), None, buffers(10), 1).unwrap();
        cache.insert(key(1), None, buffers(10), 1).unwrap();
        cache.touch(key(0), 5);
        cache.touch(key(1), 5);

        let report = cache.evict_until(0, 5);
        assert!(report.evicted.is_empty());
        assert!(report.over_budget);
        assert_eq!(cache.resident_points(), 20);

        let report = cache.evict_until(0, 6);
        assert_eq!(report.evicted.len(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_children_before_parents() {
        let mut cache = ResidencyCache::new();
        cache.insert(key(0), None, buffers(10), 1).unwrap();
        cache.insert(key(1), Some(key(0)), buffers(10), 1).unwrap();
        cache.insert(key(2), Some(key(1)), buffers(10), 1).unwrap();
        // The root is now the most recent, the leaf the least.
        cache.touch(key(1), 2);
        cache.touch(key(0), 2);

        let report = cache.evict_until(0, 3);
        assert_eq!(report.evicted, vec![key(2), key(1), key(0)]);
        assert!(cache.is_empty());
        assert_eq!(cache.resident_points(), 0);
    }

    #[test]
    fn test_released_parents_follow_their_children() {
        let mut cache = ResidencyCache::new();
        let (root, a, b) = (key(0), key(1), key(2));
        cache.insert(root, None, buffers(1), 1).unwrap();
        cache.insert(a, Some(root), buffers(1), 1).unwrap();
        cache.insert(b, Some(root), buffers(1), 1).unwrap();
        for (n, parent) in [(3, a), (4, a), (5, b), (6, b)] {
            cache.insert(key(n), Some(parent), buffers(1), 1).unwrap();
        }
        // Parents are touched before their children, leaving them nearest
        // the tail.
        for n in 0..7 {
            cache.touch(key(n), 2);
        }

        let report = cache.evict_until(0, 3);
        assert_eq!(report.evicted, vec![key(3), key(4), a, key(5), key(6), b, root]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_wide_tree() {
        let mut cache = ResidencyCache::new();
        // Node n has parent (n - 1) / 8.
        let count = 1 + 8 + 64 + 512 + 4096;
        for n in 0..count {
            let parent = (n > 0).then(|| key((n - 1) / 8));
            cache.insert(key(n), parent, buffers(1), 1).unwrap();
        }
        for n in 0..count {
            cache.touch(key(n), 2);
        }

        let report = cache.evict_until(100, 3);
        assert_eq!(cache.resident_points(), 100);
        assert_eq!(report.evicted.len(), usize::try_from(count).unwrap() - 100);
        let evicted: HashSet<NodeKey> = report.evicted.iter().copied().collect();
        for n in 1..count {
            if evicted.contains(&key(n)) {
                continue;
            }
            assert!(!evicted.contains(&key((n - 1) / 8)), "parent of {n} evicted");
        }
    }

    #[test]
    fn test_remove() {
        let mut cache = ResidencyCache::new();
        cache.insert(key(0), None, buffers(3), 1).unwrap();
        cache.insert(key(1), Some(key(0)), buffers(4), 1).unwrap();

        assert!(matches!(cache.remove(key(0)), Err(Error::ResidentChildren(_))));
        assert_eq!(cache.remove(key(1)).unwrap().point_count(), 4);
        assert_eq!(cache.resident_children(key(0)), 0);
        assert!(cache.remove(key(0)).is_ok());
        assert!(matches!(cache.remove(key(0)), Err(Error::UnknownNode(_))));
        assert_eq!(cache.resident_points(), 0);
    }

    #[test]
    fn test_slots_are_reused() {
        let mut cache = ResidencyCache::new();
        cache.insert(key(0), None, buffers(1), 1).unwrap();
        cache.remove(key(0)).unwrap();
        cache.insert(key(1), None, buffers(1), 1).unwrap();
        assert_eq!(cache.slots.len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u32, u8),
        Touch(u32),
        Remove(u32),
        Evict(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..15u32, 1..20u8).prop_map(|(n, p)| Op::Insert(n, p)),
            (0..15u32).prop_map(Op::Touch),
            (0..15u32).prop_map(Op::Remove),
            (0..100u64).prop_map(Op::Evict),
        ]
    }

    proptest! {
        #[test]
        fn test_accounting_and_parent_invariant(ops in prop::collection::vec(op(), 1..80)) {
            let mut cache = ResidencyCache::new();
            // Node n has parent (n - 1) / 2, a binary tree rooted at 0.
            let parent = |n: u32| (n > 0).then(|| key((n - 1) / 2));

            for (frame, op) in ops.into_iter().enumerate() {
                let frame = frame as u64;
                match op {
                    Op::Insert(n, points) => {
                        let geometry = buffers(usize::from(points));
                        let _ = cache.insert(key(n), parent(n), geometry, frame);
                    }
                    Op::Touch(n) => {
                        cache.touch(key(n), frame);
                    }
                    Op::Remove(n) => {
                        let _ = cache.remove(key(n));
                    }
                    Op::Evict(budget) => {
                        let report = cache.evict_until(budget, frame);
                        prop_assert!(report.over_budget || cache.resident_points() <= budget);
                    }
                }

                let total: u64 = cache.keys().map(|k| cache.get(k).unwrap().point_count()).sum();
                prop_assert_eq!(total, cache.resident_points());
                prop_assert_eq!(cache.keys().count(), cache.len());
                for k in cache.keys() {
                    let n = k.node.index() as u32;
                    if let Some(p) = parent(n) {
                        prop_assert!(cache.contains(p));
                    }
                }
            }
        }
    }
}
