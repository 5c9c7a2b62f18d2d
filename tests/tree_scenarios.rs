//! End-to-end scenarios over a single tree instance.

mod common;

use common::{eager_options, inline_options, pool_path};
use tlbtree::TlbTree;

#[test]
fn three_inserts_and_a_miss() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    tree.insert(10, 100);
    tree.insert(20, 200);
    tree.insert(5, 50);

    assert_eq!(tree.find(10), Some(100));
    assert_eq!(tree.find(5), Some(50));
    assert_eq!(tree.find(15), None);
}

#[test]
fn hundred_shuffled_inserts_then_half_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    let mut keys: Vec<i64> = (1..=100).collect();
    common::shuffle(&mut keys);

    for &k in &keys {
        tree.insert(k, (k * 10) as u64);
    }
    for k in 1..=100i64 {
        assert_eq!(tree.find(k), Some((k * 10) as u64), "key {k}");
    }

    for k in 1..=50i64 {
        assert!(tree.remove(k), "key {k} must be present");
    }
    for k in 1..=50i64 {
        assert_eq!(tree.find(k), None, "key {k} must be gone");
        assert!(!tree.remove(k), "double remove of {k}");
    }
    for k in 51..=100i64 {
        assert_eq!(tree.find(k), Some((k * 10) as u64), "key {k}");
    }
}

#[test]
fn thirteen_fill_one_node_fourteen_split_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    for k in 1..=13i64 {
        tree.insert(k, k as u64);
    }
    assert_eq!(tree.record_count(), 13, "one leaf, no split yet");
    assert_eq!(tree.subroot_count(), 1);

    tree.insert(14, 14);
    assert_eq!(tree.record_count(), 14, "both halves on the leaf chain");
    assert_eq!(tree.find(14), Some(14), "key 14 reachable through the chain");
}

#[test]
fn update_changes_only_its_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    for k in 1..=60i64 {
        tree.insert(k, k as u64);
    }

    assert!(tree.update(30, 9999));
    assert!(!tree.update(61, 1), "update of an absent key fails");

    assert_eq!(tree.find(30), Some(9999));
    assert_eq!(tree.find(29), Some(29));
    assert_eq!(tree.find(31), Some(31));
}

#[test]
fn insert_remove_find_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    tree.insert(77, 770);
    assert!(tree.remove(77));
    assert_eq!(tree.find(77), None);
}

#[test]
fn duplicate_insert_yields_one_of_the_values() {
    // Duplicates are intentionally unchecked; both records coexist in the
    // leaf and lookups resolve to one of them. Every other test uses
    // unique keys.
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    tree.insert(5, 1);
    tree.insert(5, 2);

    let got = tree.find(5).expect("key must be found");
    assert!(got == 1 || got == 2, "unexpected value {got}");
}

#[test]
fn negative_and_extreme_keys_route_correctly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, inline_options()).expect("create");

    let keys = [i64::MIN + 1, -1_000_000, -1, 0, 1, i64::MAX - 1];
    for (i, &k) in keys.iter().enumerate() {
        tree.insert(k, (i + 1) as u64);
    }
    for (i, &k) in keys.iter().enumerate() {
        assert_eq!(tree.find(k), Some((i + 1) as u64), "key {k}");
    }
    assert_eq!(tree.find(i64::MIN + 2), None);
}

#[test]
fn promotions_overflow_router_and_rebuild_catches_up() {
    // Every leaf split surfaces to the coordinator and any chain walk
    // triggers an inline rebuild: the router is constantly stale and
    // constantly repaired.
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, eager_options()).expect("create");

    for k in 1..=2000i64 {
        tree.insert(k, (k * 3) as u64);
    }

    assert!(tree.subroot_count() > 16, "sequential fill must promote many sub-roots");
    assert_eq!(tree.record_count(), 2000);
    for k in 1..=2000i64 {
        assert_eq!(tree.find(k), Some((k * 3) as u64), "key {k}");
    }
    assert!(!tree.rebuild_in_progress());
}

#[test]
fn chain_stays_sorted_and_terminated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tree = TlbTree::with_options(pool_path(&dir), false, eager_options()).expect("create");

    let mut keys: Vec<i64> = (1..=1500).collect();
    common::shuffle(&mut keys);
    for &k in &keys {
        tree.insert(k, k as u64);
    }

    // All records reachable via the authoritative chain.
    assert_eq!(tree.record_count(), 1500);
    for k in (1..=1500i64).step_by(97) {
        assert_eq!(tree.find(k), Some(k as u64));
    }
}
