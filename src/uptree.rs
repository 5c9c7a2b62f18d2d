//! Filepath: src/uptree.rs
//!
//! The search-optimized upper layer: a linearized fixed-fanout tree
//! routing keys to downtree sub-roots.
//!
//! Both levels are flat pool arrays of 256-byte nodes. Inner nodes are
//! bare key blocks; leaves pair keys with sub-root offsets and are built
//! only [`LEAF_REBUILD_CARD`] full so a few later promotions fit into the
//! `MAX_KEY` gaps. The structure is never reshaped in place: it absorbs
//! single-slot gap writes and is otherwise replaced wholesale by a
//! rebuild.
//!
//! Gap writes follow a strict key-after-value order with a fence between
//! the two stores, preserving "key < MAX_KEY implies the value is valid"
//! for readers and for crash recovery alike.

use std::sync::atomic::{AtomicI64, AtomicU64};

use crate::downtree::RootSlot;
use crate::flush::{persist, persist_obj, persist_store, sfence};
use crate::ordering::{READ_ORD, RELAXED};
use crate::pool::{Pool, PoolOffset};
use crate::record::{Key, Record, MAX_KEY};

/// Fanout of an inner node (256-byte key block).
pub const INNER_CARD: usize = 32;

/// Capacity of a leaf node.
pub const LEAF_CARD: usize = 16;

/// Leaf fill at build time; the remaining slots are insertion gaps.
pub const LEAF_REBUILD_CARD: usize = 12;

/// Upper bound on the tree height.
pub const MAX_HEIGHT: usize = 10;

// ============================================================================
//  Pool-resident layout
// ============================================================================

#[repr(C, align(256))]
struct InnerNode {
    keys: [AtomicI64; INNER_CARD],
}

#[repr(C, align(256))]
struct LeafNode {
    keys: [AtomicI64; LEAF_CARD],
    vals: [AtomicU64; LEAF_CARD],
}

const _: () = assert!(std::mem::size_of::<InnerNode>() == 256);
const _: () = assert!(std::mem::size_of::<LeafNode>() == 256);

/// The uptree's persistent entrance record.
#[repr(C)]
pub struct Entrance {
    leaf_buff: AtomicU64,
    inner_buff: AtomicU64,
    height: AtomicU64,
    leaf_cnt: AtomicU64,
}

// ============================================================================
//  UpTree handle
// ============================================================================

/// A volatile handle on one built uptree.
///
/// Cheap to copy: routing state is the two buffer offsets plus the level
/// geometry recomputed from the height. Replacing the uptree swaps the
/// handle; the arrays themselves never move.
#[derive(Clone, Copy, Debug)]
pub struct UpTree {
    entrance: PoolOffset,
    inner: PoolOffset,
    leaves: PoolOffset,
    height: u32,
    leaf_cnt: u32,
    level_offset: [u32; MAX_HEIGHT + 1],
}

impl UpTree {
    /// Rebuild the volatile handle from a persisted entrance.
    pub fn from_entrance(pool: &Pool, entrance: PoolOffset) -> Self {
        let ent: &Entrance = pool.resolve(entrance);
        let height: u32 = ent.height.load(READ_ORD) as u32;

        Self {
            entrance,
            inner: PoolOffset::from_raw(ent.inner_buff.load(READ_ORD)),
            leaves: PoolOffset::from_raw(ent.leaf_buff.load(READ_ORD)),
            height,
            leaf_cnt: ent.leaf_cnt.load(READ_ORD) as u32,
            level_offset: Self::level_offsets(height),
        }
    }

    /// Level `l` starts at `sum(INNER_CARD^i for i < l)` in the inner
    /// array; entry `height` is one past the last inner level and doubles
    /// as the base of the virtual leaf level.
    fn level_offsets(height: u32) -> [u32; MAX_HEIGHT + 1] {
        debug_assert!((height as usize) < MAX_HEIGHT);

        let mut offsets = [0u32; MAX_HEIGHT + 1];
        let mut acc: u32 = 0;
        for slot in offsets.iter_mut().take(height as usize + 1) {
            *slot = acc;
            acc = acc * INNER_CARD as u32 + 1;
        }
        offsets
    }

    // ========================================================================
    //  Bulk build
    // ========================================================================

    /// Build a fresh uptree over sorted `records` and persist it together
    /// with a new entrance.
    pub fn build(pool: &Pool, records: &[Record]) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].key <= w[1].key));
        debug_assert!(!records.is_empty());

        let lfnode_cnt: usize = records.len().div_ceil(LEAF_REBUILD_CARD).max(1);

        // Smallest height whose leaf-parent level covers every leaf.
        let mut height: usize = 1;
        let mut coverage: usize = INNER_CARD;
        while coverage < lfnode_cnt {
            height += 1;
            coverage *= INNER_CARD;
        }
        debug_assert!(height < MAX_HEIGHT);

        // A complete INNER_CARD-ary inner forest of `height` levels.
        let innode_cnt: usize = (coverage - 1) / (INNER_CARD - 1);

        let leaves_off: PoolOffset =
            pool.alloc((lfnode_cnt * std::mem::size_of::<LeafNode>()).max(4096));
        let inner_off: PoolOffset =
            pool.alloc((innode_cnt * std::mem::size_of::<InnerNode>()).max(4096));

        let tree = Self {
            entrance: PoolOffset::NULL,
            inner: inner_off,
            leaves: leaves_off,
            height: height as u32,
            leaf_cnt: lfnode_cnt as u32,
            level_offset: Self::level_offsets(height as u32),
        };

        // Leaves: LEAF_REBUILD_CARD records each, MAX_KEY padding beyond.
        for i in 0..lfnode_cnt {
            let leaf: &LeafNode = tree.leaf(pool, i);
            for j in 0..LEAF_CARD {
                let idx: usize = i * LEAF_REBUILD_CARD + j;
                if j < LEAF_REBUILD_CARD && idx < records.len() {
                    leaf.keys[j].store(records[idx].key, RELAXED);
                    leaf.vals[j].store(records[idx].val, RELAXED);
                } else {
                    leaf.keys[j].store(MAX_KEY, RELAXED);
                    leaf.vals[j].store(0, RELAXED);
                }
            }
            persist_obj(leaf);
        }

        // Deepest inner level: the first key of every leaf, then a
        // MAX_KEY end marker when the level is partially filled.
        let mut level_cnt: usize = lfnode_cnt;
        let mut base: usize = tree.level_offset[height - 1] as usize;
        for i in 0..level_cnt {
            let first: Key = tree.leaf(pool, i).keys[0].load(RELAXED);
            tree.inner(pool, base + i / INNER_CARD).keys[i % INNER_CARD].store(first, RELAXED);
        }
        if level_cnt % INNER_CARD != 0 {
            tree.inner(pool, base + level_cnt / INNER_CARD).keys[level_cnt % INNER_CARD]
                .store(MAX_KEY, RELAXED);
        }

        // Remaining levels, bottom up, first keys again.
        for l in (0..height.saturating_sub(1)).rev() {
            let child_base: usize = base;
            level_cnt = level_cnt.div_ceil(INNER_CARD);
            base = tree.level_offset[l] as usize;

            for i in 0..level_cnt {
                let first: Key = tree.inner(pool, child_base + i).keys[0].load(RELAXED);
                tree.inner(pool, base + i / INNER_CARD).keys[i % INNER_CARD].store(first, RELAXED);
            }
            if level_cnt % INNER_CARD != 0 {
                tree.inner(pool, base + level_cnt / INNER_CARD).keys[level_cnt % INNER_CARD]
                    .store(MAX_KEY, RELAXED);
            }
        }

        persist(
            pool.raw_at(inner_off).cast_const(),
            innode_cnt * std::mem::size_of::<InnerNode>(),
        );
        sfence();

        // Publish the entrance last.
        let entrance_off: PoolOffset = pool.alloc(4096);
        let ent: &Entrance = pool.resolve(entrance_off);
        persist_store(&ent.leaf_buff, leaves_off.raw());
        persist_store(&ent.inner_buff, inner_off.raw());
        persist_store(&ent.height, height as u64);
        persist_store(&ent.leaf_cnt, lfnode_cnt as u64);
        sfence();

        tracing::debug!(records = records.len(), lfnode_cnt, height, "built uptree");

        Self {
            entrance: entrance_off,
            ..tree
        }
    }

    /// Free both arrays and the entrance. The caller is responsible for
    /// making the tree unreachable first.
    pub fn destroy(&self, pool: &Pool) {
        pool.free(self.inner);
        pool.free(self.leaves);
        pool.free(self.entrance);
    }

    #[inline]
    #[must_use]
    pub fn entrance(&self) -> PoolOffset {
        self.entrance
    }

    // ========================================================================
    //  Search
    // ========================================================================

    fn inner<'p>(&self, pool: &'p Pool, idx: usize) -> &'p InnerNode {
        pool.resolve(PoolOffset::from_raw(
            self.inner.raw() + (idx * std::mem::size_of::<InnerNode>()) as u64,
        ))
    }

    fn leaf<'p>(&self, pool: &'p Pool, idx: usize) -> &'p LeafNode {
        pool.resolve(PoolOffset::from_raw(
            self.leaves.raw() + (idx * std::mem::size_of::<LeafNode>()) as u64,
        ))
    }

    /// Index of the child covering `k`: the greatest `i` with
    /// `keys[i] <= k`. The seeded `MIN_KEY` first record keeps the scan
    /// from underflowing in practice; a clamp covers the degenerate case.
    fn inner_search(&self, pool: &Pool, node_idx: usize, k: Key) -> usize {
        let node: &InnerNode = self.inner(pool, node_idx);
        for i in 0..INNER_CARD {
            if node.keys[i].load(READ_ORD) > k {
                return i.saturating_sub(1);
            }
        }
        INNER_CARD - 1
    }

    fn leaf_index_for(&self, pool: &Pool, k: Key) -> usize {
        let mut cur: usize = self.level_offset[0] as usize;
        for l in 0..self.height as usize {
            cur = self.level_offset[l + 1] as usize
                + (cur - self.level_offset[l] as usize) * INNER_CARD
                + self.inner_search(pool, cur, k);
        }
        cur - self.level_offset[self.height as usize] as usize
    }

    /// Slot holding the greatest non-padding key `<= k` in `leaf`.
    fn leaf_search(leaf: &LeafNode, k: Key) -> usize {
        let mut best_key: Key = leaf.keys[0].load(READ_ORD);
        let mut best: usize = 0;
        for i in 1..LEAF_CARD {
            let key: Key = leaf.keys[i].load(READ_ORD);
            if key <= k && key > best_key {
                best_key = key;
                best = i;
            }
        }
        best
    }

    /// The routing slot for `k`: a root slot whose sub-index covers `k`.
    pub fn find_lower<'p>(&self, pool: &'p Pool, k: Key) -> RootSlot<'p> {
        let leaf_idx: usize = self.leaf_index_for(pool, k);
        let leaf: &LeafNode = self.leaf(pool, leaf_idx);
        let slot: usize = Self::leaf_search(leaf, k);
        RootSlot::new(&leaf.vals[slot])
    }

    /// The very first routing slot, the head of the sibling chain.
    pub fn find_first<'p>(&self, pool: &'p Pool) -> RootSlot<'p> {
        RootSlot::new(&self.leaf(pool, 0).vals[0])
    }

    // ========================================================================
    //  Gap mutation
    // ========================================================================

    /// Install a promoted sub-root into a leaf gap.
    ///
    /// False when the covering leaf has no free slot; the caller keeps
    /// the promotion in its delta buffer instead.
    pub fn insert(&self, pool: &Pool, k: Key, v: u64) -> bool {
        let leaf_idx: usize = self.leaf_index_for(pool, k);
        let leaf: &LeafNode = self.leaf(pool, leaf_idx);

        for i in 0..LEAF_CARD {
            if leaf.keys[i].load(READ_ORD) == MAX_KEY {
                // Value first, then the key that makes it visible.
                persist_store(&leaf.vals[i], v);
                sfence();
                persist_store(leaf.keys[i].as_u64_cell(), k as u64);
                sfence();
                return true;
            }
        }

        false
    }

    /// Retire the routing entry with the greatest key `<= k`.
    ///
    /// Refuses to remove a leaf's minimum while other keys remain (the
    /// minimum is the leaf's routing key); removing the only key empties
    /// the leaf.
    pub fn try_remove(&self, pool: &Pool, k: Key) -> bool {
        let leaf_idx: usize = self.leaf_index_for(pool, k);
        let leaf: &LeafNode = self.leaf(pool, leaf_idx);

        let mut live: usize = 0;
        let mut best: Option<(usize, Key)> = None;
        for i in 0..LEAF_CARD {
            let key: Key = leaf.keys[i].load(READ_ORD);
            if key == MAX_KEY {
                continue;
            }
            live += 1;
            if key <= k && best.map_or(true, |(_, bk)| key > bk) {
                best = Some((i, key));
            }
        }

        let Some((slot, _)) = best else {
            return false;
        };

        if slot == 0 && live > 1 {
            return false;
        }

        persist_store(leaf.keys[slot].as_u64_cell(), MAX_KEY as u64);
        true
    }

    // ========================================================================
    //  Merge with a sorted delta
    // ========================================================================

    /// Emit the union of the current routing entries and a sorted delta
    /// into `out`, in key order. On equal keys the delta wins (it carries
    /// the newer promotion).
    pub fn merge(&self, pool: &Pool, delta: &[Record], out: &mut Vec<Record>) {
        debug_assert!(delta.windows(2).all(|w| w[0].key <= w[1].key));

        let mut live: Vec<Record> = Vec::with_capacity(self.leaf_cnt as usize * LEAF_CARD);
        for i in 0..self.leaf_cnt as usize {
            let leaf: &LeafNode = self.leaf(pool, i);
            let mut batch: Vec<Record> = (0..LEAF_CARD)
                .map(|j| Record::new(leaf.keys[j].load(READ_ORD), leaf.vals[j].load(READ_ORD)))
                .filter(|r| r.key != MAX_KEY)
                .collect();
            batch.sort();
            live.extend(batch);
        }

        out.reserve(live.len() + delta.len());

        let mut li: usize = 0;
        let mut di: usize = 0;
        while li < live.len() && di < delta.len() {
            match live[li].key.cmp(&delta[di].key) {
                std::cmp::Ordering::Less => {
                    out.push(live[li]);
                    li += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(delta[di]);
                    di += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(delta[di]);
                    li += 1;
                    di += 1;
                }
            }
        }
        out.extend_from_slice(&live[li..]);
        out.extend_from_slice(&delta[di..]);
    }
}

// ============================================================================
//  Atomic key cell helper
// ============================================================================

trait AsU64Cell {
    fn as_u64_cell(&self) -> &AtomicU64;
}

impl AsU64Cell for AtomicI64 {
    /// View an `AtomicI64` key cell as the `AtomicU64` the persistence
    /// primitives operate on; both are 8-byte atomics with identical
    /// layout.
    fn as_u64_cell(&self) -> &AtomicU64 {
        // SAFETY: AtomicI64 and AtomicU64 have the same size, alignment
        // and representation; only the value interpretation differs.
        unsafe { &*std::ptr::from_ref(self).cast::<AtomicU64>() }
    }
}

// ============================================================================
//  Tests
// ============================================================================
