//! Shared value types for both tree layers.

/// Key type stored by the index. `MAX_KEY` is reserved as a sentinel.
pub type Key = i64;

/// Sentinel key: strict upper bound of every user key, padding value in
/// uptree leaves, and terminator of the sibling chain.
pub const MAX_KEY: Key = i64::MAX;

/// Smallest routing key; seeds the first sub-root so every user key
/// routes at or after it.
pub const MIN_KEY: Key = i64::MIN;

/// A key paired with an 8-byte payload.
///
/// The payload is either a user value (downtree leaves) or a raw
/// [`PoolOffset`](crate::pool::PoolOffset) (inner records, uptree leaves,
/// sibling records, the mutable delta).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Record {
    pub key: Key,
    pub val: u64,
}

impl Record {
    #[inline]
    #[must_use]
    pub const fn new(key: Key, val: u64) -> Self {
        Self { key, val }
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// A sub-root promotion surfaced by the downtree to the coordinator:
/// the split key and the offset of the new sub-index root.
#[derive(Clone, Copy, Debug)]
pub struct SplitEntry {
    pub key: Key,
    pub node: crate::pool::PoolOffset,
}
