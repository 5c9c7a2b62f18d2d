//! Filepath: src/node.rs
//!
//! The 256-byte, log-free downtree node.
//!
//! A node is one allocation in the pool: the packed [`StateCell`], the
//! leftmost-child offset (null for leaves), two shadow sibling records and
//! thirteen unsorted record slots. Sorted order exists only in the state
//! word's slot array; occupancy exists only in its count. Slots beyond
//! `count` hold garbage that consumers must never interpret.
//!
//! # Split protocol
//!
//! A split writes the complete right node (born latched, records appended
//! physically in logical order) and flushes it, then stages the new
//! sibling record in the left node's shadow slot, fences, and publishes a
//! single state word that simultaneously drops the moved records and flips
//! the sibling version. A reader observes either the pre-split node or
//! both halves, never an intermediate.

use std::sync::atomic::{AtomicI64, AtomicU64};

use crate::flush::{persist_obj, sfence};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pool::{Pool, PoolOffset};
use crate::record::{Key, Record, MAX_KEY};
use crate::state::{StateCell, StateGuard, StateWord, CARDINALITY};

// ============================================================================
//  SlotRecord
// ============================================================================

/// One 16-byte record slot, readable while a writer is active.
#[derive(Debug)]
#[repr(C)]
pub struct SlotRecord {
    key: AtomicI64,
    val: AtomicU64,
}

impl SlotRecord {
    #[inline]
    pub fn load(&self) -> Record {
        Record::new(self.key.load(RELAXED), self.val.load(RELAXED))
    }

    #[inline]
    pub fn store(&self, rec: Record) {
        self.key.store(rec.key, RELAXED);
        self.val.store(rec.val, WRITE_ORD);
    }

    /// The value cell itself; sibling records expose it as a root slot.
    #[inline]
    pub(crate) fn val_cell(&self) -> &AtomicU64 {
        &self.val
    }
}

// ============================================================================
//  Node
// ============================================================================

/// A downtree node. Exactly 256 bytes, cache-line aligned.
#[repr(C, align(256))]
pub struct Node {
    state: StateCell,
    leftmost: AtomicU64,
    siblings: [SlotRecord; 2],
    recs: [SlotRecord; CARDINALITY],
}

const _: () = assert!(std::mem::size_of::<Node>() == 256);

impl Node {
    /// Allocate and initialize an empty leaf node in the pool.
    ///
    /// Record slots are left as-is; the zero count makes them dead.
    pub fn create(pool: &Pool) -> PoolOffset {
        let off: PoolOffset = pool.alloc(std::mem::size_of::<Self>());
        let node: &Self = pool.resolve(off);

        node.state.store_unpublished(StateWord::empty());
        node.leftmost.store(0, RELAXED);
        node.siblings[0].store(Record::new(MAX_KEY, 0));
        node.siblings[1].store(Record::new(MAX_KEY, 0));
        persist_obj(node);

        off
    }

    #[inline]
    pub fn state(&self) -> &StateCell {
        &self.state
    }

    /// Null for leaves.
    #[inline]
    pub fn leftmost(&self) -> PoolOffset {
        PoolOffset::from_raw(self.leftmost.load(READ_ORD))
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leftmost().is_null()
    }

    fn set_leftmost(&self, off: PoolOffset) {
        self.leftmost.store(off.raw(), WRITE_ORD);
    }

    /// The currently active sibling: its split key and its value cell
    /// (the persistent slot holding the right neighbor's offset).
    #[inline]
    pub fn sibling_cell(&self) -> (Key, &AtomicU64) {
        let w: StateWord = self.state.load();
        let slot: &SlotRecord = &self.siblings[w.sibling_version()];
        (slot.load().key, slot.val_cell())
    }

    fn active_sibling(&self, w: StateWord) -> Record {
        self.siblings[w.sibling_version()].load()
    }

    /// Seqlock validation: the sampled version is even and unchanged.
    #[inline]
    fn read_stable(&self, sampled: StateWord) -> bool {
        sampled.version() % 2 == 0 && self.state.load().version() == sampled.version()
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    /// Optimistic child/value lookup.
    ///
    /// Leaf: the payload stored under `k`, or 0 when absent. Inner: the
    /// raw offset of the child covering `k`. Forwards along the sibling
    /// chain when `k` is at or past the split key.
    pub fn get_child(&self, pool: &Pool, k: Key) -> u64 {
        loop {
            let w: StateWord = self.state.load();

            let sibling: Record = self.active_sibling(w);
            if k >= sibling.key {
                if !self.read_stable(w) {
                    continue;
                }
                let next: &Self = pool.resolve(PoolOffset::from_raw(sibling.val));
                return next.get_child(pool, k);
            }

            let leftmost: u64 = self.leftmost.load(READ_ORD);

            let found: u64 = if leftmost == 0 {
                let mut val: u64 = 0;
                for i in 0..w.count() {
                    let rec: Record = self.recs[w.read(i)].load();
                    if rec.key >= k {
                        if rec.key == k {
                            val = rec.val;
                        }
                        break;
                    }
                }
                val
            } else {
                let mut pos: usize = w.count();
                for i in 0..w.count() {
                    if self.recs[w.read(i)].load().key > k {
                        pos = i;
                        break;
                    }
                }
                if pos == 0 {
                    leftmost
                } else {
                    self.recs[w.read(pos - 1)].load().val
                }
            };

            if self.read_stable(w) {
                return found;
            }
        }
    }

    /// Optimistically locate the left and right neighbors of the child
    /// covering `k` (inner nodes only). Either side may be null.
    pub fn neighbors_of(&self, k: Key) -> (PoolOffset, PoolOffset) {
        loop {
            let w: StateWord = self.state.load();

            let mut pos: usize = w.count();
            for i in 0..w.count() {
                if self.recs[w.read(i)].load().key > k {
                    pos = i;
                    break;
                }
            }

            let left: u64 = match pos {
                0 => 0,
                1 => self.leftmost.load(READ_ORD),
                _ => self.recs[w.read(pos - 2)].load().val,
            };
            let right: u64 = if pos == w.count() {
                0
            } else {
                self.recs[w.read(pos)].load().val
            };

            if self.read_stable(w) {
                return (PoolOffset::from_raw(left), PoolOffset::from_raw(right));
            }
        }
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert under the node latch; splits when full.
    ///
    /// Returns the split record `(split_key, right_offset)` when this node
    /// split, which the caller must install in the parent.
    pub fn store(&self, pool: &Pool, k: Key, v: u64) -> Option<(Key, PoolOffset)> {
        let guard: StateGuard<'_> = self.state.lock(true);

        let w: StateWord = self.state.load();
        let sibling: Record = self.active_sibling(w);
        if k >= sibling.key {
            drop(guard);
            let next: &Self = pool.resolve(PoolOffset::from_raw(sibling.val));
            return next.store(pool, k, v);
        }

        if w.count() < CARDINALITY {
            self.insert_one(k, v);
            drop(guard);
            return None;
        }

        let (split_key, right_off) = self.split(pool, w, sibling);

        // The triggering key goes to whichever half now covers it, under
        // the latches already held.
        let right: &Self = pool.resolve(right_off);
        if k < split_key {
            self.insert_one(k, v);
        } else {
            right.insert_one(k, v);
        }
        right.state.unlock_adopted();

        drop(guard);
        Some((split_key, right_off))
    }

    /// Split a full node: returns (split key, offset of the right half).
    ///
    /// On return the right half is still latched when the caller must
    /// insert into it; `store` releases it.
    fn split(&self, pool: &Pool, w: StateWord, sibling: Record) -> (Key, PoolOffset) {
        let m: usize = w.count() / 2;
        let split_key: Key = self.recs[w.read(m)].load().key;

        let right_off: PoolOffset = Self::create(pool);
        let right: &Self = pool.resolve(right_off);

        // The right half is born latched with an odd version; a reader
        // arriving between the left flip and the pending-key insert spins
        // instead of seeing a half-built node.
        let mut rword: StateWord = StateWord::empty().with_latch(true).with_version_bumped();
        let mut moved: usize = 0;
        let new_count: usize;

        if self.is_leaf() {
            for i in m..w.count() {
                right.recs[moved].store(self.recs[w.read(i)].load());
                rword = rword.append(moved, moved);
                moved += 1;
            }
            new_count = w.count() - moved;
        } else {
            right.set_leftmost(PoolOffset::from_raw(self.recs[w.read(m)].load().val));
            for i in (m + 1)..w.count() {
                right.recs[moved].store(self.recs[w.read(i)].load());
                rword = rword.append(moved, moved);
                moved += 1;
            }
            new_count = w.count() - moved - 1;
        }

        // The right half inherits the left's current sibling; its shadow
        // slot stays at the MAX_KEY terminator.
        right.siblings[0].store(sibling);
        rword = rword.with_count(moved);
        right.state.store_unpublished(rword);

        persist_obj(right);
        sfence();

        // Stage the new sibling in the left's shadow slot, then publish
        // count shrink and sibling flip in one word.
        self.siblings[1 - w.sibling_version()].store(Record::new(split_key, right_off.raw()));
        persist_obj(&self.siblings);
        sfence();

        self.state
            .publish(w.with_count(new_count).with_sibling_flipped());

        tracing::trace!(split_key, right = right_off.raw(), "node split");
        (split_key, right_off)
    }

    /// Insert into a node with a free slot. The latch must be held.
    pub(crate) fn insert_one(&self, k: Key, v: u64) {
        let w: StateWord = self.state.load();
        debug_assert!(w.count() < CARDINALITY);

        let mut pos: usize = w.count();
        for i in 0..w.count() {
            if k < self.recs[w.read(i)].load().key {
                pos = i;
                break;
            }
        }

        let slot: usize = w.alloc();
        self.recs[slot].store(Record::new(k, v));
        persist_obj(&self.recs[slot]);
        sfence();

        self.state.publish(w.add(pos, slot));
    }

    /// Append a record into `slot` at logical position `pos` while the
    /// node is still unpublished; count is not changed.
    pub(crate) fn append_unpublished(&self, rec: Record, slot: usize, pos: usize) {
        self.recs[slot].store(rec);
        let w: StateWord = self.state.load();
        self.state.store_unpublished(w.append(pos, slot));
    }

    /// Make a fresh node an inner root over `left` with one separator.
    pub(crate) fn init_root(&self, left: PoolOffset, split_key: Key, right: PoolOffset) {
        self.set_leftmost(left);
        self.append_unpublished(Record::new(split_key, right.raw()), 0, 0);
        let w: StateWord = self.state.load();
        self.state.store_unpublished(w.with_count(1));

        persist_obj(self);
        sfence();
    }

    // ========================================================================
    //  Update
    // ========================================================================

    /// Overwrite the payload under `k` in place.
    ///
    /// Takes the latch without a version bump: the 8-byte value store is
    /// atomic on its own, so optimistic readers need no retry.
    pub fn update(&self, pool: &Pool, k: Key, v: u64) -> bool {
        let guard: StateGuard<'_> = self.state.lock(false);

        let w: StateWord = self.state.load();
        let sibling: Record = self.active_sibling(w);
        if k >= sibling.key {
            drop(guard);
            let next: &Self = pool.resolve(PoolOffset::from_raw(sibling.val));
            return next.update(pool, k, v);
        }

        for i in 0..w.count() {
            let slot: usize = w.read(i);
            let rec: Record = self.recs[slot].load();
            if rec.key >= k {
                if rec.key == k {
                    self.recs[slot].store(Record::new(k, v));
                    persist_obj(&self.recs[slot]);
                    return true;
                }
                break;
            }
        }

        false
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    /// Remove `k` from a leaf, or the separator preceding the child
    /// covering `k` from an inner node.
    pub fn remove(&self, pool: &Pool, k: Key) -> bool {
        let guard: StateGuard<'_> = self.state.lock(true);

        let w: StateWord = self.state.load();
        let sibling: Record = self.active_sibling(w);
        if k >= sibling.key {
            drop(guard);
            let next: &Self = pool.resolve(PoolOffset::from_raw(sibling.val));
            return next.remove(pool, k);
        }

        if self.is_leaf() {
            for i in 0..w.count() {
                let rec: Record = self.recs[w.read(i)].load();
                if rec.key >= k {
                    if rec.key == k {
                        self.state.publish(w.remove(i));
                        return true;
                    }
                    break;
                }
            }
            false
        } else {
            let mut pos: usize = w.count();
            for i in 0..w.count() {
                if self.recs[w.read(i)].load().key > k {
                    pos = i;
                    break;
                }
            }
            // The leftmost child is never removed, so a separator always
            // precedes the targeted child.
            debug_assert!(pos > 0, "separator removal aimed at the leftmost child");
            self.state.publish(w.remove(pos - 1));
            true
        }
    }

    // ========================================================================
    //  Merge
    // ========================================================================

    /// Fold `right` into `left` and splice it out of the sibling chain.
    ///
    /// Both latches are taken in address order and both are released
    /// before return. The combined occupancy must fit one node.
    pub fn merge(pool: &Pool, left_off: PoolOffset, right_off: PoolOffset) {
        let left: &Self = pool.resolve(left_off);
        let right: &Self = pool.resolve(right_off);

        let (_g1, _g2) = if left_off.raw() < right_off.raw() {
            let gl = left.state.lock(true);
            let gr = right.state.lock(true);
            (gl, gr)
        } else {
            let gr = right.state.lock(true);
            let gl = left.state.lock(true);
            (gr, gl)
        };

        let lw: StateWord = left.state.load();
        let rw: StateWord = right.state.load();
        let separator: Record = left.active_sibling(lw);

        let mut w: StateWord = lw;

        if !left.leftmost().is_null() {
            // The right node's leftmost child re-enters under the split
            // key that used to separate the two nodes.
            let slot: usize = w.alloc();
            left.recs[slot].store(Record::new(separator.key, right.leftmost().raw()));
            w = w.add(w.count(), slot);
        }

        for i in 0..rw.count() {
            let slot: usize = w.alloc();
            left.recs[slot].store(right.recs[rw.read(i)].load());
            w = w.add(w.count(), slot);
        }
        debug_assert!(w.count() <= CARDINALITY);

        // Adopt the right node's sibling, then publish occupancy and flip
        // together.
        left.siblings[1 - lw.sibling_version()].store(right.active_sibling(rw));
        persist_obj(left);
        sfence();

        left.state.publish(w.with_sibling_flipped());

        drop((_g1, _g2));
        // Arena storage is not reused, so a late reader chasing a stale
        // separator still sees the (empty of duties) right node.
        pool.free(right_off);
    }
}

impl StateCell {
    /// Release a latch adopted at node construction (split right halves).
    fn unlock_adopted(&self) {
        // Reconstructing a guard keeps every unlock paired with either a
        // lock or an explicit adoption.
        drop(StateGuard::adopt(self, true));
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = Pool::create(dir.path().join("node.pool"), 16 * 1024 * 1024).expect("create");
        (dir, pool)
    }

    #[test]
    fn node_is_one_allocation_unit() {
        assert_eq!(std::mem::size_of::<Node>(), 256);
        assert_eq!(std::mem::align_of::<Node>(), 256);
    }

    #[test]
    fn insert_and_lookup_within_one_leaf() {
        let (_dir, pool) = temp_pool();
        let off = Node::create(&pool);
        let node: &Node = pool.resolve(off);

        assert!(node.store(&pool, 10, 100).is_none());
        assert!(node.store(&pool, 5, 50).is_none());
        assert!(node.store(&pool, 20, 200).is_none());

        assert_eq!(node.get_child(&pool, 10), 100);
        assert_eq!(node.get_child(&pool, 5), 50);
        assert_eq!(node.get_child(&pool, 20), 200);
        assert_eq!(node.get_child(&pool, 15), 0);
        assert!(!node.state().load().is_latched());
    }

    #[test]
    fn thirteen_fit_without_split() {
        let (_dir, pool) = temp_pool();
        let off = Node::create(&pool);
        let node: &Node = pool.resolve(off);

        for k in 1..=13i64 {
            assert!(node.store(&pool, k, (k * 10) as u64).is_none(), "key {k}");
        }
        assert_eq!(node.state().load().count(), 13);
    }

    #[test]
    fn fourteenth_key_splits_and_chains() {
        let (_dir, pool) = temp_pool();
        let off = Node::create(&pool);
        let node: &Node = pool.resolve(off);

        for k in 1..=13i64 {
            assert!(node.store(&pool, k, (k * 10) as u64).is_none());
        }

        let split = node.store(&pool, 14, 140).expect("split expected");
        let (split_key, right_off) = split;

        // Both halves answer through the left entry point (sibling chain).
        for k in 1..=14i64 {
            assert_eq!(node.get_child(&pool, k), (k * 10) as u64, "key {k}");
        }

        let (chain_key, cell) = node.sibling_cell();
        assert_eq!(chain_key, split_key);
        assert_eq!(cell.load(std::sync::atomic::Ordering::Acquire), right_off.raw());

        let right: &Node = pool.resolve(right_off);
        assert!(!right.state().load().is_latched());
        assert!(!node.state().load().is_latched());
        assert_eq!(
            node.state().load().count() + right.state().load().count(),
            14
        );
    }

    #[test]
    fn update_overwrites_in_place() {
        let (_dir, pool) = temp_pool();
        let off = Node::create(&pool);
        let node: &Node = pool.resolve(off);

        assert!(node.store(&pool, 7, 70).is_none());
        let version_before = node.state().load().version();

        assert!(node.update(&pool, 7, 77));
        assert!(!node.update(&pool, 8, 88));

        assert_eq!(node.get_child(&pool, 7), 77);
        // Pure overwrites do not disturb optimistic readers.
        assert_eq!(node.state().load().version(), version_before);
    }

    #[test]
    fn remove_drops_only_the_target() {
        let (_dir, pool) = temp_pool();
        let off = Node::create(&pool);
        let node: &Node = pool.resolve(off);

        for k in [3i64, 1, 2] {
            assert!(node.store(&pool, k, k as u64).is_none());
        }

        assert!(node.remove(&pool, 2));
        assert!(!node.remove(&pool, 9));

        assert_eq!(node.get_child(&pool, 2), 0);
        assert_eq!(node.get_child(&pool, 1), 1);
        assert_eq!(node.get_child(&pool, 3), 3);
        assert_eq!(node.state().load().count(), 2);
        assert!(!node.state().load().is_latched());
    }

    #[test]
    fn merge_absorbs_right_and_relinks() {
        let (_dir, pool) = temp_pool();
        let off = Node::create(&pool);
        let node: &Node = pool.resolve(off);

        for k in 1..=13i64 {
            assert!(node.store(&pool, k, k as u64).is_none());
        }
        let (_split_key, right_off) = node.store(&pool, 14, 14).expect("split");

        // Shrink both halves under the merge threshold, then fold.
        for k in 1..=4i64 {
            assert!(node.remove(&pool, k));
        }
        let right: &Node = pool.resolve(right_off);
        for k in 8..=12i64 {
            assert!(right.remove(&pool, k));
        }

        Node::merge(&pool, off, right_off);

        for k in [5i64, 6, 7, 13, 14] {
            assert_eq!(node.get_child(&pool, k), k as u64, "key {k}");
        }
        let (chain_key, _) = node.sibling_cell();
        assert_eq!(chain_key, MAX_KEY);
        assert!(!node.state().load().is_latched());
        assert!(!right.state().load().is_latched());
    }
}
