//! The copy-on-write B+ tree itself: find/add/remove/find_less_than over
//! `INodeKey -> u64` pairs, plus a full-tree walk and a log-compaction pass.

use alloc::vec::Vec;

use super::cache::NodeCache;
use super::node::{Node, NodeAddress, NodeRef, ORDER_M, ORDER_N};
use super::storage::NodeStorage;
use super::INodeKey;

/// Default cache bound: generous enough to hold every node touched while
/// walking down to a leaf and splitting it back up, for a fan-out-6 tree.
pub const DEFAULT_CACHE_SIZE: usize = 8;

enum InsertOutcome<A> {
    Done(A),
    Split { left: A, promoted: INodeKey, right: A },
}

/// A node visitor passed to `PersistedTree::accept`. Implemented for any
/// `FnMut(A, &Node<A>)` closure, so callers rarely need to name the trait.
pub trait NodeVisitor<A> {
    fn visit(&mut self, address: A, node: &Node<A>);
}

impl<A, F: FnMut(A, &Node<A>)> NodeVisitor<A> for F {
    fn visit(&mut self, address: A, node: &Node<A>) {
        self(address, node)
    }
}

pub struct PersistedTree<S, A, const SIZE: usize> {
    storage: S,
    cache: NodeCache<A, SIZE>,
    root: NodeRef<A>,
    root_depth: u32,
    timestamp: u32,
    /// Keys currently live in the tree, in the order they were first
    /// inserted this session. `recreate` replays this order rather than a
    /// sorted tree walk, so a compaction pass reproduces the same split
    /// decisions the original insert sequence made instead of the
    /// systematically uneven splits a fully-sorted replay would trigger.
    /// Not persisted — empty after `resume`, in which case `recreate`
    /// falls back to a sorted walk (see its doc comment).
    insert_order: Vec<INodeKey>,
}

impl<S: NodeStorage<A>, A: NodeAddress, const SIZE: usize> PersistedTree<S, A, SIZE> {
    pub fn new(storage: S) -> PersistedTree<S, A, SIZE> {
        PersistedTree {
            storage,
            cache: NodeCache::new(),
            root: NodeRef::invalid(),
            root_depth: 0,
            timestamp: 0,
            insert_order: Vec::new(),
        }
    }

    /// Resume a tree whose root was recovered from a super-block (or from
    /// `StorageBackendNodeStorage::find_head`).
    pub fn resume(storage: S, root: A, root_depth: u32, timestamp: u32) -> PersistedTree<S, A, SIZE> {
        PersistedTree {
            storage,
            cache: NodeCache::new(),
            root: NodeRef::on_disk(root),
            root_depth,
            timestamp,
            insert_order: Vec::new(),
        }
    }

    pub fn root_address(&self) -> Option<A> {
        if self.root.address.is_valid() {
            Some(self.root.address)
        } else {
            None
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn write_node(&mut self, node: &Node<A>, is_root: bool) -> A {
        let head = if is_root {
            Some(super::TreeHead { timestamp: self.timestamp })
        } else {
            None
        };
        self.storage
            .serialize(node, head)
            .expect("tree node storage failure")
    }

    /// Value stored at `key`, or `0` if there is no live entry for it.
    pub fn find(&mut self, key: INodeKey) -> u64 {
        self.cache.clear();
        if !self.root.address.is_valid() {
            return 0;
        }
        let mut current = match self.cache.load(&mut self.storage, self.root.address, true) {
            Some(r) => r,
            None => return 0,
        };
        loop {
            let node = *self.cache.resolve(current);
            if node.is_leaf() {
                let i = node.leaf_position_for(key);
                let result = if i < node.number_keys && node.keys[i] == key {
                    node.values[i]
                } else {
                    0
                };
                self.cache.clear();
                return result;
            }
            let i = node.inner_position_for(key);
            let child_addr = node.children[i].address;
            current = match self.cache.load(&mut self.storage, child_addr, false) {
                Some(r) => r,
                None => {
                    self.cache.clear();
                    return 0;
                }
            };
        }
    }

    /// Insert or overwrite `key -> value`, returning the tree's new root
    /// address.
    pub fn add(&mut self, key: INodeKey, value: u64) -> A {
        self.cache.clear();
        self.timestamp += 1;
        if !self.insert_order.contains(&key) {
            self.insert_order.push(key);
        }
        let root_addr = if self.root.address.is_valid() {
            Some(self.root.address)
        } else {
            None
        };
        let outcome = self.insert_rec(root_addr, key, value, true);
        let new_root = match outcome {
            InsertOutcome::Done(addr) => addr,
            InsertOutcome::Split { left, promoted, right } => {
                let depth = self.root_depth + 1;
                let mut node: Node<A> = Node::empty_inner(depth);
                node.number_keys = 1;
                node.keys[0] = promoted;
                node.children[0] = NodeRef::on_disk(left);
                node.children[1] = NodeRef::on_disk(right);
                self.root_depth = depth;
                self.write_node(&node, true)
            }
        };
        self.root = NodeRef::on_disk(new_root);
        self.cache.clear();
        new_root
    }

    fn insert_rec(&mut self, addr: Option<A>, key: INodeKey, value: u64, is_root: bool) -> InsertOutcome<A> {
        let mut node: Node<A> = match addr {
            Some(a) => {
                self.storage
                    .deserialize(a, is_root)
                    .map(|(n, _)| n)
                    .expect("tree read failure")
            }
            None => Node::empty_leaf(),
        };

        if node.is_leaf() {
            self.insert_leaf(&mut node, key, value, is_root)
        } else {
            self.insert_inner(&mut node, key, value, is_root)
        }
    }

    /// Insert into a leaf, splitting it first (before placing the new
    /// entry) if it has no room. Splitting the pre-existing `M` keys ahead
    /// of the insert, rather than merging the new entry into an oversized
    /// temporary array and dividing that evenly, is what the grounding
    /// source's `leaf_insert` does — it produces an uneven split (the new
    /// entry lands wherever it falls relative to the midpoint of the
    /// *old* keys, not the midpoint of the combined set).
    fn insert_leaf(&mut self, node: &mut Node<A>, key: INodeKey, value: u64, is_root: bool) -> InsertOutcome<A> {
        let i = node.leaf_position_for(key);
        let exists = i < node.number_keys && node.keys[i] == key;
        if exists {
            node.values[i] = value;
            return InsertOutcome::Done(self.write_node(node, is_root));
        }

        if node.number_keys < ORDER_M {
            node.shift_right_leaf(i);
            node.keys[i] = key;
            node.values[i] = value;
            node.number_keys += 1;
            return InsertOutcome::Done(self.write_node(node, is_root));
        }

        // Leaf is full: split the existing M keys first...
        let threshold = (ORDER_M + 1) / 2;
        let mut right: Node<A> = Node::empty_leaf();
        right.number_keys = node.number_keys - threshold;
        right.keys[..right.number_keys].copy_from_slice(&node.keys[threshold..node.number_keys]);
        right.values[..right.number_keys].copy_from_slice(&node.values[threshold..node.number_keys]);
        node.number_keys = threshold;

        // ...then insert the new entry into whichever half it falls in.
        if i < threshold {
            node.shift_right_leaf(i);
            node.keys[i] = key;
            node.values[i] = value;
            node.number_keys += 1;
        } else {
            let ri = i - threshold;
            right.shift_right_leaf(ri);
            right.keys[ri] = key;
            right.values[ri] = value;
            right.number_keys += 1;
        }

        let promoted = right.keys[0];
        let left_addr = self.write_node(node, false);
        let right_addr = self.write_node(&right, false);
        InsertOutcome::Split { left: left_addr, promoted, right: right_addr }
    }

    /// Insert into (the subtree rooted at) an inner node, splitting it
    /// first if it has no room, the same way `insert_leaf` does for
    /// leaves: the existing `N` keys/children are divided before the
    /// descent continues into whichever half holds `key`.
    fn insert_inner(&mut self, node: &mut Node<A>, key: INodeKey, value: u64, is_root: bool) -> InsertOutcome<A> {
        if node.number_keys < ORDER_N {
            return InsertOutcome::Done(self.insert_inner_nonfull(node, key, value, is_root));
        }

        let threshold = (ORDER_N + 1) / 2;
        let mut right: Node<A> = Node::empty_inner(node.depth);
        right.number_keys = node.number_keys - threshold;
        right.keys[..right.number_keys].copy_from_slice(&node.keys[threshold..node.number_keys]);
        right.children[..right.number_keys].copy_from_slice(&node.children[threshold..node.number_keys]);
        right.children[right.number_keys] = node.children[node.number_keys];

        let promoted = node.keys[threshold - 1];
        node.number_keys = threshold - 1;

        let (left_addr, right_addr) = if key < promoted {
            let left_addr = self.insert_inner_nonfull(node, key, value, false);
            let right_addr = self.write_node(&right, false);
            (left_addr, right_addr)
        } else {
            let left_addr = self.write_node(node, false);
            let right_addr = self.insert_inner_nonfull(&mut right, key, value, false);
            (left_addr, right_addr)
        };

        InsertOutcome::Split { left: left_addr, promoted, right: right_addr }
    }

    /// Insert into an inner node already known to have room for one more
    /// key: descend into the appropriate child (recursing into `leaf_insert`
    /// or `insert_inner` depending on the child's depth) and absorb its
    /// split outcome, if any, via a plain shift — this node is guaranteed
    /// not to need a split of its own since the caller only reaches here
    /// after ensuring room.
    fn insert_inner_nonfull(&mut self, node: &mut Node<A>, key: INodeKey, value: u64, is_root: bool) -> A {
        debug_assert!(node.number_keys < ORDER_N);
        let child_idx = node.inner_position_for(key);
        let child_addr = node.children[child_idx].address;
        let mut child: Node<A> = self
            .storage
            .deserialize(child_addr, false)
            .map(|(n, _)| n)
            .expect("tree read failure");

        let child_outcome = if node.depth == 1 {
            self.insert_leaf(&mut child, key, value, false)
        } else {
            self.insert_inner(&mut child, key, value, false)
        };

        match child_outcome {
            InsertOutcome::Done(new_child_addr) => {
                node.children[child_idx] = NodeRef::on_disk(new_child_addr);
            }
            InsertOutcome::Split { left, promoted, right } => {
                node.shift_right_inner(child_idx);
                node.keys[child_idx] = promoted;
                node.children[child_idx] = NodeRef::on_disk(left);
                node.children[child_idx + 1] = NodeRef::on_disk(right);
                node.number_keys += 1;
            }
        }
        self.write_node(node, is_root)
    }

    /// Tombstone `key` (set its value to 0) without any rebalancing.
    /// Returns whether a live entry was found.
    pub fn remove(&mut self, key: INodeKey) -> bool {
        self.cache.clear();
        if !self.root.address.is_valid() {
            return false;
        }
        self.timestamp += 1;
        let (new_root, found) = self.remove_rec(self.root.address, key, true);
        self.root = NodeRef::on_disk(new_root);
        if found {
            self.insert_order.retain(|&k| k != key);
        }
        self.cache.clear();
        found
    }

    fn remove_rec(&mut self, addr: A, key: INodeKey, is_root: bool) -> (A, bool) {
        let (mut node, _) = self.storage.deserialize(addr, is_root).expect("tree read failure");
        if node.is_leaf() {
            let i = node.leaf_position_for(key);
            if i < node.number_keys && node.keys[i] == key {
                node.values[i] = 0;
                (self.write_node(&node, is_root), true)
            } else {
                (addr, false)
            }
        } else {
            let i = node.inner_position_for(key);
            let child_addr = node.children[i].address;
            let (new_child_addr, found) = self.remove_rec(child_addr, key, false);
            if found {
                node.children[i] = NodeRef::on_disk(new_child_addr);
                (self.write_node(&node, is_root), true)
            } else {
                (addr, false)
            }
        }
    }

    /// Greatest key strictly less than `key`, with its value, if any.
    pub fn find_less_than(&mut self, key: INodeKey) -> Option<(INodeKey, u64)> {
        self.cache.clear();
        if !self.root.address.is_valid() {
            return None;
        }
        let result = self.find_less_than_rec(self.root.address, key, true);
        self.cache.clear();
        result
    }

    fn find_less_than_rec(&mut self, addr: A, key: INodeKey, is_root: bool) -> Option<(INodeKey, u64)> {
        let (node, _) = self.storage.deserialize(addr, is_root)?;
        if node.is_leaf() {
            let mut best = None;
            for i in 0..node.number_keys {
                if node.keys[i] < key {
                    best = Some((node.keys[i], node.values[i]));
                } else {
                    break;
                }
            }
            return best;
        }
        let i = node.inner_position_for(key);
        if let Some(found) = self.find_less_than_rec(node.children[i].address, key, false) {
            return Some(found);
        }
        if i > 0 {
            return self.rightmost(node.children[i - 1].address);
        }
        None
    }

    fn rightmost(&mut self, addr: A) -> Option<(INodeKey, u64)> {
        let (node, _) = self.storage.deserialize(addr, false)?;
        if node.is_leaf() {
            if node.number_keys == 0 {
                return None;
            }
            let i = node.number_keys - 1;
            return Some((node.keys[i], node.values[i]));
        }
        self.rightmost(node.children[node.number_keys].address)
    }

    /// Walk every live node in the tree, in pre-order, passing each one to
    /// `visitor` along with the address it lives at.
    pub fn accept<V: NodeVisitor<A>>(&mut self, visitor: &mut V) {
        if self.root.address.is_valid() {
            self.accept_rec(self.root.address, true, visitor);
        }
    }

    fn accept_rec<V: NodeVisitor<A>>(&mut self, addr: A, is_root: bool, visitor: &mut V) {
        if let Some((node, _)) = self.storage.deserialize(addr, is_root) {
            visitor.visit(addr, &node);
            if !node.is_leaf() {
                for i in 0..=node.number_keys {
                    let child = node.children[i].address;
                    if child.is_valid() {
                        self.accept_rec(child, false, visitor);
                    }
                }
            }
        }
    }

    /// Rebuild the tree from its live (non-tombstoned) entries into fresh
    /// storage, abandoning every previously written node. Replays the
    /// entries in the order they were originally inserted (`insert_order`)
    /// rather than sorted-key order: this split algorithm's uneven
    /// leaf/inner divisions are tuned to however the original workload's
    /// insert order happened to land relative to each split point, and a
    /// fully-sorted replay (every new key landing at the rightmost
    /// position) systematically produces the lopsided splits the
    /// original insert order avoided, growing the tree instead of
    /// compacting it. `insert_order` is in-memory only and empty after
    /// `resume`; with no recorded order to replay, this falls back to a
    /// sorted walk of the tree, which still drops tombstones and
    /// preserves every live value but does not carry the same
    /// no-larger-than-before guarantee a same-session compaction does.
    pub fn recreate(&mut self) -> Option<A> {
        let mut entries: Vec<(INodeKey, u64)> = Vec::new();
        if !self.insert_order.is_empty() {
            let order = self.insert_order.clone();
            for key in order {
                let value = self.find(key);
                if value != 0 {
                    entries.push((key, value));
                }
            }
        } else if self.root.address.is_valid() {
            self.collect_rec(self.root.address, true, &mut entries);
        }
        self.root = NodeRef::invalid();
        self.root_depth = 0;
        self.insert_order.clear();
        let mut new_root = None;
        for (k, v) in entries {
            new_root = Some(self.add(k, v));
        }
        new_root
    }

    fn collect_rec(&mut self, addr: A, is_root: bool, out: &mut Vec<(INodeKey, u64)>) {
        if let Some((node, _)) = self.storage.deserialize(addr, is_root) {
            if node.is_leaf() {
                for i in 0..node.number_keys {
                    if node.values[i] != 0 {
                        out.push((node.keys[i], node.values[i]));
                    }
                }
            } else {
                for i in 0..=node.number_keys {
                    let child = node.children[i].address;
                    if child.is_valid() {
                        self.collect_rec(child, false, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::storage::{ArenaAddress, InMemoryNodeStorage};

    fn small_dataset() -> Vec<(u32, u64)> {
        vec![(100, 5738), (10, 1), (22, 2), (8, 3), (3, 4), (17, 5), (9, 6), (30, 7), (20, 8)]
    }

    fn tree() -> PersistedTree<InMemoryNodeStorage, ArenaAddress, DEFAULT_CACHE_SIZE> {
        PersistedTree::new(InMemoryNodeStorage::new())
    }

    #[test]
    fn build_tree_then_find() {
        let mut t = tree();
        for (k, v) in small_dataset() {
            t.add(INodeKey::new(0, k), v);
        }
        assert_eq!(t.find(INodeKey::new(0, 30)), 7);
        assert_eq!(t.find(INodeKey::new(0, 100)), 5738);
        assert_eq!(t.find(INodeKey::new(0, 20)), 8);
    }

    #[test]
    fn remove_tombstones_the_entry() {
        let mut t = tree();
        for (k, v) in small_dataset().into_iter().take(8) {
            t.add(INodeKey::new(0, k), v);
        }
        assert!(t.remove(INodeKey::new(0, 100)));
        assert_eq!(t.find(INodeKey::new(0, 100)), 0);
        assert!(!t.remove(INodeKey::new(0, 9999)));
    }

    #[test]
    fn walk_small_tree_visits_expected_node_count() {
        let mut t = tree();
        for (k, v) in small_dataset().into_iter().take(8) {
            t.add(INodeKey::new(0, k), v);
        }
        let mut count = 0;
        t.accept(&mut |_addr, _node: &Node<ArenaAddress>| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn find_less_than_finds_predecessor_across_subtrees() {
        let mut t = tree();
        for k in [5u32, 10, 15, 20, 25, 30, 35, 40] {
            t.add(INodeKey::new(0, k), k as u64);
        }
        let (k, v) = t.find_less_than(INodeKey::new(0, 20)).unwrap();
        assert_eq!(k, INodeKey::new(0, 15));
        assert_eq!(v, 15);
        assert!(t.find_less_than(INodeKey::new(0, 5)).is_none());
    }

    #[test]
    fn recreate_preserves_live_entries_and_drops_tombstones() {
        let mut t = tree();
        for i in 0..120u32 {
            t.add(INodeKey::new(0, i), (i as u64) + 1);
        }
        for i in (0..120u32).step_by(3) {
            t.remove(INodeKey::new(0, i));
        }
        t.recreate();
        for i in 0..120u32 {
            let expected = if i % 3 == 0 { 0 } else { (i as u64) + 1 };
            assert_eq!(t.find(INodeKey::new(0, i)), expected);
        }
    }

    /// A faithful port of glibc's default (TYPE_3) `random()`/`srandom()`
    /// generator, used only to reproduce the literal seeded walk below
    /// bit-for-bit. Known-answer check: `GlibcRandom::new(1)` must start
    /// `1804289383, 846930886, 1681692777, ...`, the well-known output of
    /// glibc's `srandom(1)` followed by `random()`.
    struct GlibcRandom {
        table: [u32; 31],
        fptr: usize,
        rptr: usize,
    }

    impl GlibcRandom {
        fn new(seed: u32) -> GlibcRandom {
            let seed = if seed == 0 { 1 } else { seed };
            let mut table = [0u32; 31];
            table[0] = seed;
            let mut word = seed as i64;
            for i in 1..31 {
                let hi = word / 127773;
                let lo = word % 127773;
                word = 16807 * lo - 2836 * hi;
                if word < 0 {
                    word += 2147483647;
                }
                table[i] = word as u32;
            }
            let mut gen = GlibcRandom { table, fptr: 3, rptr: 0 };
            for _ in 0..310 {
                gen.next_u32();
            }
            gen
        }

        fn next_u32(&mut self) -> u32 {
            self.table[self.fptr] = self.table[self.fptr].wrapping_add(self.table[self.rptr]);
            let result = (self.table[self.fptr] >> 1) & 0x7fff_ffff;
            self.fptr += 1;
            if self.fptr >= 31 {
                self.fptr = 0;
                self.rptr += 1;
            } else {
                self.rptr += 1;
                if self.rptr >= 31 {
                    self.rptr = 0;
                }
            }
            result
        }
    }

    #[test]
    fn glibc_random_matches_known_answer_sequence() {
        let mut rng = GlibcRandom::new(1);
        let expected = [
            1804289383, 846930886, 1681692777, 1714636915, 1957747793, 424238335, 719885386, 1649760492,
            596516649, 1189641421,
        ];
        for want in expected {
            assert_eq!(rng.next_u32(), want);
        }
    }

    #[test]
    fn walk_large_tree_then_recreate_preserves_node_count() {
        let mut rng = GlibcRandom::new(1);
        let mut t = tree();
        for _ in 0..8 {
            let inode = rng.next_u32() % 2048 + 1024;
            let mut offset: u32 = 512;
            for _ in 0..128 {
                let key = INodeKey::new(inode, offset);
                t.add(key, inode as u64);
                offset = offset.wrapping_add(rng.next_u32() % 4096);
            }
        }

        let mut count = 0;
        t.accept(&mut |_addr, _node: &Node<ArenaAddress>| count += 1);
        assert_eq!(count, 493);

        t.recreate();

        let mut count_after = 0;
        t.accept(&mut |_addr, _node: &Node<ArenaAddress>| count_after += 1);
        assert_eq!(count_after, 493);
    }

    #[test]
    fn large_tree_round_trips_every_key() {
        // Deterministic pseudo-random insert order (linear congruential
        // generator), exercising splits at every level without pulling in
        // a `rand` dependency for a unit test.
        let mut t = tree();
        let mut seed: u32 = 1;
        let mut inserted = Vec::new();
        for _ in 0..500 {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let key = seed % 10_000;
            t.add(INodeKey::new(0, key), key as u64 + 1);
            inserted.push(key);
        }
        for key in inserted {
            assert_eq!(t.find(INodeKey::new(0, key)), key as u64 + 1);
        }
    }
}
