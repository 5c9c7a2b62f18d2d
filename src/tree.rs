//! Filepath: src/tree.rs
//!
//! The two-layer coordinator: routes every operation through the uptree,
//! walks the sibling chain of sub-roots, installs promotions, and
//! replaces a stale uptree with a freshly built one.
//!
//! # Ground truth
//!
//! The sibling chain is authoritative; the uptree is a best-effort
//! routing cache. A promoted sub-root that does not fit a router gap
//! stays reachable through the chain and waits in the mutable delta for
//! the next rebuild. Long chain walks trigger that rebuild.
//!
//! # Reclamation
//!
//! Every public operation holds a `seize` guard. A replaced uptree is
//! retired through the collector and its pool buffers are freed only
//! after all guards that could have observed it have left, the explicit
//! grace period that a fixed sleep cannot provide.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};
use seize::{Collector, Guard as _, LocalGuard};

use crate::downtree::{self, RootSlot};
use crate::flush::{persist, persist_store, sfence};
use crate::node::Node;
use crate::pool::{Pool, PoolOffset, DEFAULT_POOL_SIZE};
use crate::record::{Key, Record, SplitEntry, MAX_KEY, MIN_KEY};
use crate::uptree::UpTree;

// ============================================================================
//  Options
// ============================================================================

/// Tuning knobs of a tree instance. The defaults mirror the intended
/// deployment; tests shrink them to force rare paths.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Levels a sub-index may grow in place before a root split surfaces
    /// to the coordinator as a promotion.
    pub downlevel: u8,

    /// Sibling-chain walk length beyond which a rebuild is triggered.
    pub rebuild_threshold: u8,

    /// Run rebuilds on a detached worker thread instead of inline.
    pub background_rebuild: bool,

    /// Pool size when creating a fresh pool file.
    pub pool_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            downlevel: 2,
            rebuild_threshold: 2,
            background_rebuild: true,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

// ============================================================================
//  Persistent entrance
// ============================================================================

/// The tree's persistent metadata in the pool root region. Every field
/// is an independently persisted 8-byte word.
#[repr(C)]
struct Entrance {
    /// Offset of the current uptree entrance; null only before the very
    /// first build.
    upent: AtomicU64,

    /// Saved mutable delta from the last clean shutdown.
    restore: AtomicU64,
    restore_size: AtomicU64,

    /// Cleared on open, set on clean shutdown.
    is_clean: AtomicU64,

    /// The next rebuild must regather sub-roots from the sibling chain.
    use_rebuild_recover: AtomicU64,
}

// ============================================================================
//  TlbTree
// ============================================================================

struct TreeInner {
    // Declared before `pool` so pending retirements run while the pool
    // is still mapped.
    collector: Collector,
    pool: Arc<Pool>,
    entrance: PoolOffset,
    uptree: RwLock<UpTree>,
    mutable: Mutex<Vec<Record>>,
    is_rebuilding: AtomicBool,
    rebuild_lock: AtomicBool,
    downlevel: u8,
    rebuild_threshold: u8,
    background_rebuild: bool,
}

/// A two-layer B-tree over one persistent memory pool.
///
/// Values 0 and keys equal to `i64::MAX` are reserved sentinels.
pub struct TlbTree {
    inner: Arc<TreeInner>,
}

impl TlbTree {
    /// Open (`recover = true`) or create (`recover = false`) a tree in
    /// the pool file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, recover: bool, pool_size: u64) -> Result<Self> {
        Self::with_options(
            path,
            recover,
            Options {
                pool_size,
                ..Options::default()
            },
        )
    }

    /// As [`open`](Self::open) with explicit [`Options`].
    pub fn with_options<P: AsRef<Path>>(path: P, recover: bool, opts: Options) -> Result<Self> {
        let pool = Arc::new(Pool::open_or_create(path, recover, opts.pool_size)?);
        let entrance_off: PoolOffset = pool.get_root(std::mem::size_of::<Entrance>());
        let ent: &Entrance = pool.resolve(entrance_off);

        let mut mutable: Vec<Record> = Vec::new();
        let uptree: UpTree;

        if recover {
            ensure!(
                ent.upent.load(Ordering::Acquire) != 0,
                "pool holds no index (empty entrance)"
            );

            if ent.is_clean.load(Ordering::Acquire) == 0 {
                // Crash: the in-memory delta is lost, the chain is the
                // only authority until a recovery rebuild runs.
                tracing::warn!("unclean shutdown detected; scheduling recovery rebuild");
                persist_store(&ent.use_rebuild_recover, 1);
            } else if ent.restore.load(Ordering::Acquire) != 0 {
                let buf = PoolOffset::from_raw(ent.restore.load(Ordering::Acquire));
                let n = ent.restore_size.load(Ordering::Acquire) as usize;

                let recs: *const Record = pool.raw_at(buf).cast_const().cast();
                for i in 0..n {
                    // SAFETY: the buffer was fully persisted before the
                    // clean-shutdown flag and nothing mutates it now.
                    mutable.push(unsafe { recs.add(i).read() });
                }

                persist_store(&ent.restore, 0);
                persist_store(&ent.restore_size, 0);
                pool.free(buf);
                tracing::debug!(entries = n, "restored saved delta");
            }

            uptree = UpTree::from_entrance(&pool, PoolOffset::from_raw(ent.upent.load(Ordering::Acquire)));
        } else {
            persist_store(&ent.upent, 0);
            persist_store(&ent.restore, 0);
            persist_store(&ent.restore_size, 0);
            persist_store(&ent.is_clean, 0);
            persist_store(&ent.use_rebuild_recover, 1);

            // A single empty leaf seeded under MIN_KEY, routed by a
            // one-entry uptree.
            let first: PoolOffset = Node::create(&pool);
            sfence();
            uptree = UpTree::build(&pool, &[Record::new(MIN_KEY, first.raw())]);

            persist_store(&ent.upent, uptree.entrance().raw());
            persist_store(&ent.use_rebuild_recover, 0);
        }

        persist_store(&ent.is_clean, 0);
        sfence();

        Ok(Self {
            inner: Arc::new(TreeInner {
                collector: Collector::new(),
                pool,
                entrance: entrance_off,
                uptree: RwLock::new(uptree),
                mutable: Mutex::new(mutable),
                is_rebuilding: AtomicBool::new(false),
                rebuild_lock: AtomicBool::new(false),
                downlevel: opts.downlevel,
                rebuild_threshold: opts.rebuild_threshold,
                background_rebuild: opts.background_rebuild,
            }),
        })
    }

    // ========================================================================
    //  Public operations
    // ========================================================================

    /// Insert `(k, v)`. Duplicate keys are not checked for.
    pub fn insert(&self, k: Key, v: u64) {
        debug_assert!(k < MAX_KEY, "MAX_KEY is reserved");
        debug_assert!(v != 0, "value 0 is reserved");

        let inner: &TreeInner = &self.inner;
        let _guard: LocalGuard<'_> = inner.collector.enter();
        let pool: &Pool = &inner.pool;

        let (slot, steps) = inner.route(pool, k, false);
        let promoted: Option<SplitEntry> = downtree::insert(pool, slot, k, v, inner.downlevel);

        if steps > u32::from(inner.rebuild_threshold) && inner.try_begin_rebuild() {
            tracing::debug!(steps, "sibling chain too long; rebuilding");
            self.inner.launch_rebuild();
        }

        if let Some(entry) = promoted {
            inner.promote(entry);
        }
    }

    /// Look up the payload stored under `k`.
    #[must_use]
    pub fn find(&self, k: Key) -> Option<u64> {
        let inner: &TreeInner = &self.inner;
        let _guard: LocalGuard<'_> = inner.collector.enter();
        let pool: &Pool = &inner.pool;

        let (slot, _) = inner.route(pool, k, true);
        downtree::find(pool, slot, k)
    }

    /// Overwrite the payload under `k`; false when absent.
    pub fn update(&self, k: Key, v: u64) -> bool {
        debug_assert!(k < MAX_KEY && v != 0);

        let inner: &TreeInner = &self.inner;
        let _guard: LocalGuard<'_> = inner.collector.enter();
        let pool: &Pool = &inner.pool;

        let (slot, _) = inner.route(pool, k, false);
        downtree::update(pool, slot, k, v)
    }

    /// Remove `k`; false when absent.
    pub fn remove(&self, k: Key) -> bool {
        let inner: &TreeInner = &self.inner;
        let _guard: LocalGuard<'_> = inner.collector.enter();
        let pool: &Pool = &inner.pool;

        let (slot, _) = inner.route(pool, k, false);
        let outcome = downtree::remove(pool, slot, k);

        if outcome.emptied {
            // All uptree mutation is serialized by the delta mutex; an
            // in-flight rebuild regathers the routing anyway, so the
            // stale entry may simply wait for it.
            let _delta = inner.mutable.lock();
            if !inner.is_rebuilding.load(Ordering::Acquire) {
                let uptree: UpTree = *inner.uptree.read();
                uptree.try_remove(pool, k);
            }
        }

        outcome.found
    }

    /// Close the tree: persist the pending delta and mark the shutdown
    /// clean. Equivalent to dropping the handle.
    pub fn close(self) {
        drop(self);
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Total records in the bottom leaf chain.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        let inner: &TreeInner = &self.inner;
        let _guard: LocalGuard<'_> = inner.collector.enter();
        let uptree: UpTree = *inner.uptree.read();
        downtree::chain_record_count(&inner.pool, uptree.find_first(&inner.pool))
    }

    /// Number of sub-roots on the sibling chain.
    #[must_use]
    pub fn subroot_count(&self) -> usize {
        let inner: &TreeInner = &self.inner;
        let _guard: LocalGuard<'_> = inner.collector.enter();
        let uptree: UpTree = *inner.uptree.read();
        downtree::collect_subroots(&inner.pool, uptree.find_first(&inner.pool), MIN_KEY).len()
    }

    /// Whether the next rebuild must recover from the sibling chain.
    #[must_use]
    pub fn needs_recovery_rebuild(&self) -> bool {
        self.inner.entrance().use_rebuild_recover.load(Ordering::Acquire) != 0
    }

    /// Whether a rebuild is currently in flight.
    #[must_use]
    pub fn rebuild_in_progress(&self) -> bool {
        self.inner.rebuild_lock.load(Ordering::Acquire)
    }
}

impl Drop for TlbTree {
    fn drop(&mut self) {
        let inner: &TreeInner = &self.inner;

        // Wait out an in-flight rebuild, then hold the lock so none can
        // start while we tear down.
        while inner
            .rebuild_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::thread::yield_now();
        }

        let ent: &Entrance = inner.entrance();

        if ent.use_rebuild_recover.load(Ordering::Acquire) == 0 {
            // The next start may rebuild fast, so the delta must survive.
            let delta = inner.mutable.lock();
            if delta.is_empty() {
                persist_store(&ent.restore, 0);
                persist_store(&ent.restore_size, 0);
            } else {
                let bytes: usize = delta.len() * std::mem::size_of::<Record>();
                let buf: PoolOffset = inner.pool.alloc(bytes.max(4096));

                let recs: *mut Record = inner.pool.raw_at(buf).cast();
                for (i, rec) in delta.iter().enumerate() {
                    // SAFETY: the buffer was just allocated and is not
                    // published until the entrance fields below.
                    unsafe { recs.add(i).write(*rec) };
                }
                persist(inner.pool.raw_at(buf).cast_const(), bytes);
                sfence();

                persist_store(&ent.restore, buf.raw());
                persist_store(&ent.restore_size, delta.len() as u64);
                tracing::debug!(entries = delta.len(), "saved delta for fast restart");
            }
        }

        persist_store(&ent.is_clean, 1);
        sfence();
        let _ = inner.pool.sync();
        tracing::info!("clean shutdown");
    }
}

// ============================================================================
//  Routing and rebuilds
// ============================================================================

impl TreeInner {
    fn entrance(&self) -> &Entrance {
        self.pool.resolve(self.entrance)
    }

    /// Route `k` through the uptree, then forward along the sibling
    /// chain: writers stop at the sub-index whose split key covers `k`
    /// (`<`), lookups skip past equal split keys too (`<=`).
    fn route<'p>(&self, pool: &'p Pool, k: Key, for_lookup: bool) -> (RootSlot<'p>, u32) {
        let uptree: UpTree = *self.uptree.read();
        let mut slot: RootSlot<'p> = uptree.find_lower(pool, k);

        let mut steps: u32 = 0;
        loop {
            let node: &Node = pool.resolve(slot.load());
            let (split_key, cell) = node.sibling_cell();

            let past: bool = if for_lookup {
                split_key <= k
            } else {
                split_key < k
            };
            if !past {
                return (slot, steps);
            }

            slot = RootSlot::new(cell);
            steps += 1;
        }
    }

    /// Install a promotion: into a router gap when possible, otherwise
    /// into the mutable delta. Holding the delta mutex across the gap
    /// write keeps the uptree single-writer and makes the rebuilding
    /// flag and the delta agree.
    fn promote(&self, entry: SplitEntry) {
        let rec = Record::new(entry.key, entry.node.raw());
        let mut delta = self.mutable.lock();

        if self.is_rebuilding.load(Ordering::Acquire) {
            delta.push(rec);
            return;
        }

        let uptree: UpTree = *self.uptree.read();
        if !uptree.insert(&self.pool, rec.key, rec.val) {
            tracing::debug!(key = rec.key, "router leaf full; promotion deferred");
            delta.push(rec);
        }
    }

    fn try_begin_rebuild(&self) -> bool {
        self.rebuild_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Start the rebuild the entrance asks for. The rebuild lock must
    /// already be held; it is released when the rebuild finishes.
    fn launch_rebuild(self: &Arc<Self>) {
        let recover: bool = self.entrance().use_rebuild_recover.load(Ordering::Acquire) != 0;

        if self.background_rebuild {
            let inner: Arc<Self> = Arc::clone(self);
            std::thread::spawn(move || {
                if recover {
                    inner.rebuild_recover();
                } else {
                    inner.rebuild_fast();
                }
            });
        } else if recover {
            self.rebuild_recover();
        } else {
            self.rebuild_fast();
        }
    }

    /// Fast rebuild: fold the sorted delta into the current routing set.
    fn rebuild_fast(&self) {
        tracing::info!("fast rebuild started");

        let mut immutable: Vec<Record> = {
            let mut delta = self.mutable.lock();
            // Raised before the swap, under the same mutex as every
            // promotion: nothing can land in the old uptree afterwards.
            self.is_rebuilding.store(true, Ordering::Release);
            std::mem::take(&mut *delta)
        };
        immutable.sort();

        let old: UpTree = *self.uptree.read();
        let mut subroots: Vec<Record> = Vec::new();
        old.merge(&self.pool, &immutable, &mut subroots);

        let count: usize = subroots.len();
        self.install(old, UpTree::build(&self.pool, &subroots));

        tracing::info!(subroots = count, "fast rebuild finished");
    }

    /// Recovery rebuild: the delta died with the crashed process, so the
    /// sibling chain is walked instead.
    fn rebuild_recover(&self) {
        tracing::info!("recovery rebuild started");

        {
            let _delta = self.mutable.lock();
            self.is_rebuilding.store(true, Ordering::Release);
        }

        let old: UpTree = *self.uptree.read();
        let subroots: Vec<Record> =
            downtree::collect_subroots(&self.pool, old.find_first(&self.pool), MIN_KEY);

        let count: usize = subroots.len();
        self.install(old, UpTree::build(&self.pool, &subroots));

        persist_store(&self.entrance().use_rebuild_recover, 0);
        tracing::info!(subroots = count, "recovery rebuild finished");
    }

    /// Publish the new uptree and retire the old one behind the grace
    /// period. Releases the rebuild lock last.
    fn install(&self, old: UpTree, new: UpTree) {
        persist_store(&self.entrance().upent, new.entrance().raw());
        sfence();
        *self.uptree.write() = new;

        self.retire_uptree(old);

        self.is_rebuilding.store(false, Ordering::Release);
        self.rebuild_lock.store(false, Ordering::Release);
    }

    fn retire_uptree(&self, old: UpTree) {
        let retired: *mut RetiredUpTree = Box::into_raw(Box::new(RetiredUpTree {
            pool: Arc::clone(&self.pool),
            tree: old,
        }));

        let guard: LocalGuard<'_> = self.collector.enter();
        // SAFETY: `retired` came from Box::into_raw above and the old
        // uptree is unreachable for operations entering after the swap;
        // seize runs the reclaimer once every older guard has left.
        unsafe { guard.defer_retire(retired, reclaim_retired_uptree) };
    }
}

/// A replaced uptree awaiting its grace period.
struct RetiredUpTree {
    pool: Arc<Pool>,
    tree: UpTree,
}

impl Drop for RetiredUpTree {
    fn drop(&mut self) {
        self.tree.destroy(&self.pool);
    }
}

/// Reclaim callback for a retired uptree descriptor.
///
/// # Safety
/// `ptr` must come from `Box::into_raw` and be retired exactly once.
unsafe fn reclaim_retired_uptree(ptr: *mut RetiredUpTree, _collector: &Collector) {
    // SAFETY: guaranteed by the retire site.
    unsafe { drop(Box::from_raw(ptr)) };
}
