//! Filepath: src/downtree.rs
//!
//! Node-granular recursion over one sub-index: descent, insertion with
//! level-bounded promotion, and removal with merge rebalancing.
//!
//! A sub-index is addressed through a [`RootSlot`]: any persistent
//! 8-byte cell holding the offset of its root node (an uptree leaf value
//! or a sibling record). Growing or collapsing the sub-index rewrites
//! that one cell.

use std::sync::atomic::AtomicU64;

use crate::flush::persist_obj;
use crate::node::Node;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::pool::{Pool, PoolOffset};
use crate::record::{Key, Record, SplitEntry};
use crate::state::{CARDINALITY, UNDERFLOW_CARD};

// ============================================================================
//  RootSlot
// ============================================================================

/// A persistent cell holding the offset of a sub-index root.
#[derive(Clone, Copy, Debug)]
pub struct RootSlot<'a> {
    cell: &'a AtomicU64,
}

impl<'a> RootSlot<'a> {
    #[inline]
    #[must_use]
    pub fn new(cell: &'a AtomicU64) -> Self {
        Self { cell }
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> PoolOffset {
        PoolOffset::from_raw(self.cell.load(READ_ORD))
    }

    /// Persistently repoint the slot at a new root.
    #[inline]
    pub fn persist_set(&self, off: PoolOffset) {
        self.cell.store(off.raw(), WRITE_ORD);
        persist_obj(self.cell);
    }
}

// ============================================================================
//  Lookup / update descent
// ============================================================================

/// Find the payload stored under `k` in the sub-index at `root`.
pub fn find(pool: &Pool, root: RootSlot<'_>, k: Key) -> Option<u64> {
    let mut cur: &Node = pool.resolve(root.load());
    while !cur.is_leaf() {
        let child: u64 = cur.get_child(pool, k);
        cur = pool.resolve(PoolOffset::from_raw(child));
    }

    let val: u64 = cur.get_child(pool, k);
    (val != 0).then_some(val)
}

/// Overwrite the payload under `k`; false when absent.
pub fn update(pool: &Pool, root: RootSlot<'_>, k: Key, v: u64) -> bool {
    let mut cur: &Node = pool.resolve(root.load());
    while !cur.is_leaf() {
        let child: u64 = cur.get_child(pool, k);
        cur = pool.resolve(PoolOffset::from_raw(child));
    }

    cur.update(pool, k, v)
}

// ============================================================================
//  Insert
// ============================================================================

fn insert_recursive(
    pool: &Pool,
    node: &Node,
    k: Key,
    v: u64,
    level: &mut u8,
) -> Option<(Key, PoolOffset)> {
    if node.is_leaf() {
        return node.store(pool, k, v);
    }

    *level += 1;
    let child: &Node = pool.resolve(PoolOffset::from_raw(node.get_child(pool, k)));

    let split: Option<(Key, PoolOffset)> = insert_recursive(pool, child, k, v, level);
    match split {
        Some((split_key, split_node)) => node.store(pool, split_key, split_node.raw()),
        None => None,
    }
}

/// Insert `(k, v)` into the sub-index at `root`.
///
/// A root split below `threshold` levels grows the sub-index in place: a
/// fresh inner root adopts the old root as leftmost child and the slot is
/// persist-assigned to it. At or above `threshold` the split surfaces as
/// a [`SplitEntry`] the caller owns promoting.
pub fn insert(
    pool: &Pool,
    root: RootSlot<'_>,
    k: Key,
    v: u64,
    threshold: u8,
) -> Option<SplitEntry> {
    let root_off: PoolOffset = root.load();
    let root_node: &Node = pool.resolve(root_off);

    let mut level: u8 = 1;
    let (split_key, split_node) = insert_recursive(pool, root_node, k, v, &mut level)?;

    if level < threshold {
        let new_root_off: PoolOffset = Node::create(pool);
        let new_root: &Node = pool.resolve(new_root_off);
        new_root.init_root(root_off, split_key, split_node);
        root.persist_set(new_root_off);
        return None;
    }

    Some(SplitEntry {
        key: split_key,
        node: split_node,
    })
}

// ============================================================================
//  Remove
// ============================================================================

/// Merge an underflowed child with a neighbor under the same parent,
/// preferring the left one, when their combined occupancy fits.
fn rebalance(pool: &Pool, parent: &Node, child_off: PoolOffset, k: Key) {
    let child: &Node = pool.resolve(child_off);
    let (left_off, right_off) = parent.neighbors_of(k);
    let child_count: usize = child.state().load().count();

    if !left_off.is_null() {
        let left: &Node = pool.resolve(left_off);
        if child_count + left.state().load().count() < CARDINALITY {
            // The separator preceding the child goes first, then the
            // child folds into its left neighbor.
            parent.remove(pool, k);
            Node::merge(pool, left_off, child_off);
            return;
        }
    }

    if !right_off.is_null() {
        let right: &Node = pool.resolve(right_off);
        if child_count + right.state().load().count() < CARDINALITY {
            // The child's split key is the right neighbor's separator.
            let (separator, _) = child.sibling_cell();
            parent.remove(pool, separator);
            Node::merge(pool, child_off, right_off);
        }
    }
}

/// What a removal did to the sub-index.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoveOutcome {
    /// The key existed and is gone.
    pub found: bool,

    /// The sub-index is now completely empty; its router entry can be
    /// retired.
    pub emptied: bool,
}

fn remove_recursive(pool: &Pool, node: &Node, k: Key) -> (bool, bool) {
    if node.is_leaf() {
        let found: bool = node.remove(pool, k);
        return (found, node.state().load().count() < UNDERFLOW_CARD);
    }

    let child_off: PoolOffset = PoolOffset::from_raw(node.get_child(pool, k));
    let child: &Node = pool.resolve(child_off);

    let (found, underflow) = remove_recursive(pool, child, k);
    if underflow {
        rebalance(pool, node, child_off, k);
        return (found, node.state().load().count() < UNDERFLOW_CARD);
    }

    (found, false)
}

/// Remove `k` from the sub-index at `root`.
///
/// An inner root emptied by merging collapses into its leftmost child
/// and the old root is freed.
pub fn remove(pool: &Pool, root: RootSlot<'_>, k: Key) -> RemoveOutcome {
    let root_off: PoolOffset = root.load();
    let root_node: &Node = pool.resolve(root_off);

    if root_node.is_leaf() {
        let found: bool = root_node.remove(pool, k);
        return RemoveOutcome {
            found,
            emptied: root_node.state().load().count() == 0,
        };
    }

    let child_off: PoolOffset = PoolOffset::from_raw(root_node.get_child(pool, k));
    let child: &Node = pool.resolve(child_off);

    let (found, underflow) = remove_recursive(pool, child, k);
    if underflow {
        rebalance(pool, root_node, child_off, k);

        if root_node.state().load().count() == 0 {
            root.persist_set(root_node.leftmost());
            pool.free(root_off);
        }
    }

    RemoveOutcome {
        found,
        emptied: false,
    }
}

// ============================================================================
//  Diagnostics
// ============================================================================

/// Number of records in the bottom leaf chain starting at `root`'s
/// leftmost leaf. Crosses sub-index boundaries: leaves inherit their
/// chain links from every split, so the walk covers the whole lower
/// layer when started from the first sub-root.
pub fn chain_record_count(pool: &Pool, root: RootSlot<'_>) -> u64 {
    let mut cur: &Node = pool.resolve(root.load());
    while !cur.is_leaf() {
        cur = pool.resolve(cur.leftmost());
    }

    let mut total: u64 = 0;
    loop {
        total += cur.state().load().count() as u64;
        let (_, cell) = cur.sibling_cell();
        let next: u64 = cell.load(READ_ORD);
        if next == 0 {
            return total;
        }
        cur = pool.resolve(PoolOffset::from_raw(next));
    }
}

/// Collect the sibling chain of sub-roots starting at `first`, as
/// `(split_key, sub_root_offset)` records keyed by each predecessor's
/// split key. The recovery rebuild and the chain diagnostics share this.
pub fn collect_subroots(pool: &Pool, first: RootSlot<'_>, first_key: Key) -> Vec<Record> {
    let mut out: Vec<Record> = Vec::new();

    let mut key: Key = first_key;
    let mut cur_off: PoolOffset = first.load();

    while !cur_off.is_null() {
        out.push(Record::new(key, cur_off.raw()));

        let node: &Node = pool.resolve(cur_off);
        let (split_key, cell) = node.sibling_cell();
        key = split_key;
        cur_off = PoolOffset::from_raw(cell.load(READ_ORD));
    }

    out
}

// ============================================================================
//  Tests
// ============================================================================
