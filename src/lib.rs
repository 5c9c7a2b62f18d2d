//! # tlbtree
//!
//! A two-layer B-tree index for byte-addressable persistent memory.
//!
//! The lower layer is a forest of write-optimized sub-indices built from
//! 256-byte log-free nodes: ordering lives in a packed state word that is
//! republished with a single 8-byte store, splits go through a shadow
//! sibling slot, and readers validate with a seqlock-style version.
//! The upper layer is a linearized, search-optimized fixed-fanout tree
//! that routes keys to sub-roots; it absorbs a few insertions in leaf
//! gaps and is rebuilt wholesale when the sibling chain grows too long.
//!
//! ## Concurrency
//!
//! - Lookups are optimistic: no locks, retry on version change.
//! - Writers take one per-node spin latch at a time.
//! - Replaced routing structures are reclaimed through `seize` epochs.
//!
//! ## Durability
//!
//! The whole index lives in one pool file mapped by [`pool::Pool`]; all
//! persisted links are pool offsets. Each mutation is published by an
//! atomic 8-byte store followed by a cache-line writeback, ordered so a
//! crash at any point leaves a readable tree: recovery walks the sibling
//! chain, which is never stale.
//!
//! ```no_run
//! use tlbtree::TlbTree;
//!
//! # fn main() -> eyre::Result<()> {
//! let tree = TlbTree::open("/mnt/pmem/index.pool", false, 1 << 30)?;
//! tree.insert(10, 100);
//! assert_eq!(tree.find(10), Some(100));
//! tree.close();
//! # Ok(())
//! # }
//! ```

pub mod downtree;
pub mod flush;
pub mod node;
pub mod ordering;
pub mod pool;
pub mod record;
pub mod state;
pub mod tree;
pub mod uptree;

pub use pool::{Pool, PoolOffset};
pub use record::{Key, Record, MAX_KEY, MIN_KEY};
pub use tree::{Options, TlbTree};
