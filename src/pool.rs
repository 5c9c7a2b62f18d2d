//! Filepath: src/pool.rs
//!
//! Persistent memory pool: a file mapped into the address space, carved
//! into a slab arena for small allocations and a reclaimable region for
//! large ones.
//!
//! # Address discipline
//!
//! Persisted structures never store virtual addresses. Every link is a
//! [`PoolOffset`], the distance from the start of the mapping, because
//! the file may be mapped at a different base on every open. [`Pool`]
//! translates in both directions: `resolve(offset)` and `offset_of(&T)`.
//!
//! # Allocation
//!
//! - Allocations smaller than [`LARGE_MIN`] come from a bump arena
//!   partitioned into [`PIECE_CNT`] pieces of 256-byte blocks. The cursor
//!   is a persistent 8-byte word advanced by CAS; `free` is a no-op for
//!   arena offsets, so concurrently traversed nodes are never reused.
//! - Larger allocations carry a one-block size header and are tracked on
//!   a volatile first-fit free list for reuse within a session.
//!
//! Pool exhaustion is fatal (the arena capacity is fixed at creation).

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::flush::{persist, persist_store, sfence};

/// Pool file magic, bumped on layout changes.
const POOL_MAGIC: u64 = 0x544c_4254_0000_0001;

/// Allocation granularity and alignment.
pub const ALIGN_SIZE: usize = 256;

/// Number of pieces the slab arena is partitioned into.
pub const PIECE_CNT: usize = 64;

/// Allocations at or above this size are individually reclaimable.
pub const LARGE_MIN: usize = 4096;

/// Size of the fixed header page at offset 0.
const HEADER_SIZE: usize = 4096;

/// Offset and capacity of the root region inside the header page.
const ROOT_OFFSET: usize = 1024;
const ROOT_CAPACITY: usize = 512;

// Header field offsets (all 8-byte words).
const HDR_MAGIC: usize = 0x00;
const HDR_POOL_SIZE: usize = 0x08;
const HDR_ARENA_BASE: usize = 0x10;
const HDR_PIECE_BLKS: usize = 0x18;
const HDR_ARENA_CUR: usize = 0x20;
const HDR_LARGE_BASE: usize = 0x28;
const HDR_LARGE_CUR: usize = 0x30;

/// Default pool size when the caller does not specify one: 4 GiB.
pub const DEFAULT_POOL_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Smallest pool that still yields a usable piece geometry.
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

// ============================================================================
//  PoolOffset
// ============================================================================

/// An address inside the pool, stable across re-mappings.
///
/// Offset 0 points into the pool header and is never handed out by the
/// allocator, so it doubles as the null sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PoolOffset(u64);

impl PoolOffset {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ============================================================================
//  Pool
// ============================================================================

/// A mapped pool file plus its volatile allocation state.
pub struct Pool {
    mmap: MmapMut,
    base: *mut u8,
    pool_size: u64,
    arena_base: u64,
    piece_blks: u64,
    large_base: u64,
    /// First-fit free list of reclaimed large blocks: (header offset, total bytes).
    large_free: Mutex<Vec<(u64, u64)>>,
}

// SAFETY: all mutation of mapped memory goes through atomic cells or
// through raw writes to freshly allocated, not-yet-published blocks; the
// base pointer itself is never changed after construction.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Create a fresh pool file of `pool_size` bytes.
    ///
    /// Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P, pool_size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            !path.exists(),
            "pool file '{}' already exists; open it with recover=true or remove it",
            path.display()
        );
        ensure!(
            pool_size >= MIN_POOL_SIZE,
            "pool size {pool_size} is below the {MIN_POOL_SIZE}-byte minimum"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create pool file '{}'", path.display()))?;

        file.set_len(pool_size)
            .wrap_err_with(|| format!("failed to size pool file to {pool_size} bytes"))?;

        // SAFETY: the file was created with exclusive access and sized
        // above; the mapping's lifetime is tied to the returned Pool and
        // all access is bounds-checked against pool_size.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let base: *mut u8 = mmap.as_mut_ptr();

        // Partition: half of the usable space for the slab arena (rounded
        // to whole pieces of 256-byte blocks), the rest for large blocks.
        let usable: u64 = pool_size - HEADER_SIZE as u64;
        let piece_blks: u64 = (usable / 2) / (PIECE_CNT * ALIGN_SIZE) as u64;
        let arena_base: u64 = HEADER_SIZE as u64;
        let large_base: u64 = arena_base + piece_blks * (PIECE_CNT * ALIGN_SIZE) as u64;

        let pool = Self {
            mmap,
            base,
            pool_size,
            arena_base,
            piece_blks,
            large_base,
            large_free: Mutex::new(Vec::new()),
        };

        pool.header_word(HDR_POOL_SIZE).store(pool_size, Ordering::Relaxed);
        pool.header_word(HDR_ARENA_BASE).store(arena_base, Ordering::Relaxed);
        pool.header_word(HDR_PIECE_BLKS).store(piece_blks, Ordering::Relaxed);
        pool.header_word(HDR_ARENA_CUR).store(0, Ordering::Relaxed);
        pool.header_word(HDR_LARGE_BASE).store(large_base, Ordering::Relaxed);
        pool.header_word(HDR_LARGE_CUR).store(large_base, Ordering::Relaxed);
        persist(pool.base.cast_const(), HEADER_SIZE);
        sfence();

        // The magic is published last: a header without it is garbage.
        persist_store(pool.header_word(HDR_MAGIC), POOL_MAGIC);
        sfence();

        tracing::info!(path = %path.display(), pool_size, "created pool");
        Ok(pool)
    }

    /// Map an existing pool file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            path.exists(),
            "pool file '{}' does not exist; create it with recover=false",
            path.display()
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open pool file '{}'", path.display()))?;

        let file_size: u64 = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > HEADER_SIZE as u64,
            "pool file '{}' is truncated ({file_size} bytes)",
            path.display()
        );

        // SAFETY: same contract as in `create`; the file is not shared
        // with other writers while the pool is open.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let base: *mut u8 = mmap.as_mut_ptr();

        let header = |off: usize| -> u64 {
            // SAFETY: off is a constant well inside the header page.
            unsafe { (*base.add(off).cast::<AtomicU64>()).load(Ordering::Acquire) }
        };

        ensure!(
            header(HDR_MAGIC) == POOL_MAGIC,
            "'{}' is not a pool file (bad magic)",
            path.display()
        );

        let pool_size: u64 = header(HDR_POOL_SIZE);
        ensure!(
            pool_size == file_size,
            "pool file '{}' size mismatch: header says {pool_size}, file is {file_size}",
            path.display()
        );

        let pool = Self {
            mmap,
            base,
            pool_size,
            arena_base: header(HDR_ARENA_BASE),
            piece_blks: header(HDR_PIECE_BLKS),
            large_base: header(HDR_LARGE_BASE),
            large_free: Mutex::new(Vec::new()),
        };

        tracing::info!(path = %path.display(), pool_size, "opened pool");
        Ok(pool)
    }

    /// Map or create a pool depending on `recover`. Recovering from a
    /// missing file or creating over an existing one is a startup fault.
    pub fn open_or_create<P: AsRef<Path>>(path: P, recover: bool, pool_size: u64) -> Result<Self> {
        if recover {
            Self::open(path)
        } else {
            Self::create(path, pool_size)
        }
    }

    /// Flush the whole mapping to the backing file.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync pool mapping")
    }

    // ========================================================================
    //  Address translation
    // ========================================================================

    /// Resolve an offset to a shared reference.
    ///
    /// # Panics
    /// Debug-panics on null, out-of-bounds or misaligned offsets.
    #[inline]
    #[must_use]
    pub fn resolve<T>(&self, off: PoolOffset) -> &T {
        debug_assert!(!off.is_null(), "resolve: null offset");
        debug_assert!(
            off.raw() + std::mem::size_of::<T>() as u64 <= self.pool_size,
            "resolve: offset {} out of bounds",
            off.raw()
        );
        debug_assert_eq!(
            off.raw() as usize % std::mem::align_of::<T>(),
            0,
            "resolve: misaligned offset for type"
        );

        // SAFETY: the offset lies inside the mapping (checked above) and
        // every shared structure in the pool uses atomic cells for any
        // field mutated after publication.
        unsafe { &*self.base.add(off.raw() as usize).cast::<T>() }
    }

    /// Translate a reference obtained from `resolve` back to its offset.
    #[inline]
    #[must_use]
    pub fn offset_of<T>(&self, value: &T) -> PoolOffset {
        let addr: usize = std::ptr::from_ref(value) as usize;
        let base: usize = self.base as usize;
        debug_assert!(
            addr >= base && addr < base + self.pool_size as usize,
            "offset_of: reference outside the pool"
        );
        PoolOffset::from_raw((addr - base) as u64)
    }

    /// Raw pointer to an offset, for initializing freshly allocated and
    /// not-yet-published blocks.
    #[inline]
    pub(crate) fn raw_at(&self, off: PoolOffset) -> *mut u8 {
        debug_assert!(!off.is_null() && off.raw() < self.pool_size);
        // SAFETY: bounds checked above.
        unsafe { self.base.add(off.raw() as usize) }
    }

    #[inline]
    fn header_word(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off + 8 <= ROOT_OFFSET);
        // SAFETY: header words live at fixed 8-byte-aligned offsets
        // inside the header page.
        unsafe { &*self.base.add(off).cast::<AtomicU64>() }
    }

    // ========================================================================
    //  Root region
    // ========================================================================

    /// The fixed root region where the index keeps its entrance record.
    ///
    /// # Panics
    /// If `size` exceeds the root region capacity.
    #[must_use]
    pub fn get_root(&self, size: usize) -> PoolOffset {
        assert!(
            size <= ROOT_CAPACITY,
            "root object of {size} bytes exceeds the {ROOT_CAPACITY}-byte root region"
        );
        PoolOffset::from_raw(ROOT_OFFSET as u64)
    }

    // ========================================================================
    //  Allocation
    // ========================================================================

    /// Allocate `size` bytes aligned to 256.
    ///
    /// # Panics
    /// When the pool is exhausted; a fixed-capacity pool running dry is
    /// not a recoverable condition for the index built on top of it.
    #[must_use]
    pub fn alloc(&self, size: usize) -> PoolOffset {
        if size >= LARGE_MIN {
            return self.alloc_large(size);
        }

        let cursor: &AtomicU64 = self.header_word(HDR_ARENA_CUR);
        let demand: u64 = size.div_ceil(ALIGN_SIZE) as u64;
        let max_blk: u64 = self.piece_blks * PIECE_CNT as u64;

        loop {
            let cur: u64 = cursor.load(Ordering::Acquire);

            assert!(
                cur + demand <= max_blk,
                "pool arena exhausted ({max_blk} blocks)"
            );

            // An allocation never straddles a piece boundary; skip the
            // tail of the current piece when it cannot fit.
            let next: u64 = if cur % self.piece_blks + demand > self.piece_blks {
                (cur / self.piece_blks + 1) * self.piece_blks + demand
            } else {
                cur + demand
            };

            assert!(next <= max_blk, "pool arena exhausted ({max_blk} blocks)");

            if cursor
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                crate::flush::persist_obj(cursor);
                let blk: u64 = next - demand;
                return PoolOffset::from_raw(self.arena_base + blk * ALIGN_SIZE as u64);
            }
        }
    }

    fn alloc_large(&self, size: usize) -> PoolOffset {
        // One leading block holds the total length so `free` can recycle
        // the allocation without any external bookkeeping.
        let total: u64 = (size.div_ceil(ALIGN_SIZE) as u64 + 1) * ALIGN_SIZE as u64;

        let mut free_list = self.large_free.lock();
        if let Some(pos) = free_list.iter().position(|&(_, sz)| sz >= total) {
            let (header_off, _) = free_list.swap_remove(pos);
            return PoolOffset::from_raw(header_off + ALIGN_SIZE as u64);
        }

        let cursor: &AtomicU64 = self.header_word(HDR_LARGE_CUR);
        let cur: u64 = cursor.load(Ordering::Acquire);
        assert!(
            cur + total <= self.pool_size,
            "pool large region exhausted ({} bytes)",
            self.pool_size - self.large_base
        );
        // Bump under the free-list lock; no CAS needed.
        persist_store(cursor, cur + total);

        // SAFETY: the block was just carved out and is unpublished.
        unsafe {
            (*self.raw_at(PoolOffset::from_raw(cur)).cast::<AtomicU64>())
                .store(total, Ordering::Relaxed);
        }
        persist(self.raw_at(PoolOffset::from_raw(cur)).cast_const(), 8);

        PoolOffset::from_raw(cur + ALIGN_SIZE as u64)
    }

    /// Return an allocation to the pool.
    ///
    /// Arena offsets are retained forever (the slab is not reclaimable
    /// per-object); large blocks become reusable within this session.
    pub fn free(&self, off: PoolOffset) {
        if off.is_null() {
            return;
        }

        if off.raw() < self.large_base {
            // Slab arena: per-object reclamation is not supported.
            return;
        }

        let header_off: u64 = off.raw() - ALIGN_SIZE as u64;
        // SAFETY: large allocations always carry their size header one
        // block before the returned offset.
        let total: u64 = unsafe {
            (*self.raw_at(PoolOffset::from_raw(header_off)).cast::<AtomicU64>())
                .load(Ordering::Relaxed)
        };

        self.large_free.lock().push((header_off, total));
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pool_size", &self.pool_size)
            .field("arena_base", &self.arena_base)
            .field("piece_blks", &self.piece_blks)
            .field("large_base", &self.large_base)
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
