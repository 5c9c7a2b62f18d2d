//! Shutdown, restart and crash-recovery behavior.

mod common;

use common::{eager_options, inline_options, pool_path};
use tlbtree::TlbTree;

#[test]
fn clean_close_and_reopen_twice() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = pool_path(&dir);

    let tree = TlbTree::with_options(&path, false, inline_options()).expect("create");
    for k in 1..=200i64 {
        tree.insert(k, (k * 2) as u64);
    }
    tree.close();

    let tree = TlbTree::with_options(&path, true, inline_options()).expect("first reopen");
    assert!(!tree.needs_recovery_rebuild(), "shutdown was clean");
    for k in 1..=200i64 {
        assert_eq!(tree.find(k), Some((k * 2) as u64), "key {k} after reopen");
    }
    tree.insert(201, 402);
    tree.close();

    let tree = TlbTree::with_options(&path, true, inline_options()).expect("second reopen");
    for k in 1..=201i64 {
        assert_eq!(tree.find(k), Some((k * 2) as u64), "key {k} after second reopen");
    }
}

#[test]
fn open_missing_pool_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(TlbTree::with_options(pool_path(&dir), true, inline_options()).is_err());
}

#[test]
fn create_over_existing_pool_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = pool_path(&dir);

    TlbTree::with_options(&path, false, inline_options())
        .expect("create")
        .close();
    assert!(TlbTree::with_options(&path, false, inline_options()).is_err());
}

#[test]
fn saved_delta_survives_clean_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = pool_path(&dir);

    // Eager promotion fills the router gaps quickly; later promotions
    // wait in the delta, which a clean shutdown must persist.
    let tree = TlbTree::with_options(&path, false, eager_options()).expect("create");
    for k in 1..=800i64 {
        tree.insert(k, k as u64);
    }
    tree.close();

    let tree = TlbTree::with_options(&path, true, eager_options()).expect("reopen");
    assert!(!tree.needs_recovery_rebuild());
    for k in 1..=800i64 {
        assert_eq!(tree.find(k), Some(k as u64), "key {k}");
    }

    // The restored delta folds into the next rebuild without losing keys.
    for k in 801..=1200i64 {
        tree.insert(k, k as u64);
    }
    for k in 1..=1200i64 {
        assert_eq!(tree.find(k), Some(k as u64), "key {k} after more inserts");
    }
}

#[test]
fn crash_forces_recovery_rebuild() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = pool_path(&dir);

    let tree = TlbTree::with_options(&path, false, eager_options()).expect("create");
    for k in 1..=1000i64 {
        tree.insert(k, (k * 5) as u64);
    }
    // Crash: the destructor never runs, is_clean stays false and the
    // volatile delta dies with the process state.
    std::mem::forget(tree);

    let tree = TlbTree::with_options(&path, true, eager_options()).expect("reopen after crash");
    assert!(
        tree.needs_recovery_rebuild(),
        "unclean shutdown must schedule a recovery rebuild"
    );

    // Every committed key is still reachable through the sibling chain.
    for k in 1..=1000i64 {
        assert_eq!(tree.find(k), Some((k * 5) as u64), "key {k} after crash");
    }

    // Keep writing: sequential splits exhaust the hot router leaf, the
    // resulting chain walk runs the recovery rebuild inline.
    let mut recovered = false;
    for k in 1001..=1400i64 {
        tree.insert(k, (k * 5) as u64);
        if !tree.needs_recovery_rebuild() {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "recovery rebuild never ran");

    let total = tree.record_count();
    assert!(total >= 1000, "chain lost records: {total}");
    for k in 1..=1000i64 {
        assert_eq!(tree.find(k), Some((k * 5) as u64), "key {k} after recovery");
    }
}

#[test]
fn crash_then_clean_cycle_restores_fast_rebuilds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = pool_path(&dir);

    let tree = TlbTree::with_options(&path, false, eager_options()).expect("create");
    for k in 1..=600i64 {
        tree.insert(k, k as u64);
    }
    std::mem::forget(tree);

    // First reopen: recovery mode; run until the recovery rebuild clears.
    let tree = TlbTree::with_options(&path, true, eager_options()).expect("reopen");
    assert!(tree.needs_recovery_rebuild());
    for k in 601..=1000i64 {
        tree.insert(k, k as u64);
        if !tree.needs_recovery_rebuild() {
            break;
        }
    }
    assert!(!tree.needs_recovery_rebuild(), "recovery must complete");
    tree.close();

    // Second reopen is clean again.
    let tree = TlbTree::with_options(&path, true, eager_options()).expect("clean reopen");
    assert!(!tree.needs_recovery_rebuild());
    for k in (1..=600i64).step_by(41) {
        assert_eq!(tree.find(k), Some(k as u64));
    }
}
