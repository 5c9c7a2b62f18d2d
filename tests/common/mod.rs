//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;

use tlbtree::Options;

/// 256 MiB is plenty for every scenario and keeps test pools sparse.
pub const TEST_POOL_SIZE: u64 = 256 * 1024 * 1024;

pub fn pool_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("tree.pool")
}

/// Deterministic options: rebuilds run inline on the triggering thread.
pub fn inline_options() -> Options {
    Options {
        background_rebuild: false,
        pool_size: TEST_POOL_SIZE,
        ..Options::default()
    }
}

/// Aggressive promotion and rebuild settings: every sub-root split
/// surfaces immediately and any chain walk triggers a rebuild.
pub fn eager_options() -> Options {
    Options {
        downlevel: 1,
        rebuild_threshold: 0,
        background_rebuild: false,
        pool_size: TEST_POOL_SIZE,
    }
}

/// Deterministic in-place shuffle (no RNG dependency needed).
pub fn shuffle<T>(items: &mut [T]) {
    let n = items.len();
    for i in 0..n {
        items.swap(i, (i * 31 + 17) % n);
    }
}
