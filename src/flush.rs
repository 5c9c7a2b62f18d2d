//! Persistence primitives: cache-line writeback and store fencing.
//!
//! Every durable publish in the crate funnels through these helpers, so
//! the flush instruction is a single pool-global choice made at build
//! time (`clwb` / `clflushopt` cargo features, `clflush` otherwise).
//! Non-x86_64 builds degrade to plain fences; ordering is preserved,
//! durability is not, which is sufficient for tests on any host.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line granularity assumed by the flush loop.
pub const CACHE_LINE_SIZE: usize = 64;

/// Store fence: orders preceding flushes before subsequent stores.
#[inline]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `_mm_sfence` has no preconditions.
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(Ordering::SeqCst);
}

#[cfg(all(target_arch = "x86_64", feature = "clwb"))]
#[inline]
unsafe fn flush_line(line: *const u8) {
    // SAFETY: caller passes a mapped address; clwb has no alignment trap.
    unsafe {
        std::arch::asm!("clwb [{0}]", in(reg) line, options(nostack, preserves_flags));
    }
}

#[cfg(all(target_arch = "x86_64", feature = "clflushopt", not(feature = "clwb")))]
#[inline]
unsafe fn flush_line(line: *const u8) {
    // SAFETY: caller passes a mapped address; clflushopt has no alignment trap.
    unsafe {
        std::arch::asm!("clflushopt [{0}]", in(reg) line, options(nostack, preserves_flags));
    }
}

#[cfg(all(target_arch = "x86_64", not(any(feature = "clwb", feature = "clflushopt"))))]
#[inline]
unsafe fn flush_line(line: *const u8) {
    // SAFETY: caller passes a mapped address.
    unsafe {
        std::arch::x86_64::_mm_clflush(line);
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
unsafe fn flush_line(_line: *const u8) {}

/// Write back every cache line covering `[ptr, ptr + len)`.
#[inline]
pub fn persist(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    let start: usize = ptr as usize & !(CACHE_LINE_SIZE - 1);
    let end: usize = ptr as usize + len;

    let mut line: usize = start;
    while line < end {
        // SAFETY: every line in the loop lies within the mapped range the
        // caller handed us (rounded down to its containing cache line).
        unsafe { flush_line(line as *const u8) };
        line += CACHE_LINE_SIZE;
    }
}

/// Write back the cache lines covering a value.
#[inline]
pub fn persist_obj<T>(value: &T) {
    persist(std::ptr::from_ref(value).cast::<u8>(), std::mem::size_of::<T>());
}

/// Atomic persistent store of an 8-byte word: release store, then flush.
///
/// This is the only primitive used to publish state words, pointer cells
/// and entrance fields; readers observe either the old or the new value,
/// never a torn one.
#[inline]
pub fn persist_store(cell: &AtomicU64, value: u64) {
    cell.store(value, Ordering::Release);
    persist_obj(cell);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_store_is_visible() {
        let cell = AtomicU64::new(0);
        persist_store(&cell, 0xdead_beef);
        assert_eq!(cell.load(Ordering::Acquire), 0xdead_beef);
    }

    #[test]
    fn persist_handles_unaligned_ranges() {
        let buf = [0u8; 256];
        // Spans three cache lines starting mid-line; must not panic.
        persist(buf[7..].as_ptr(), 130);
        persist(buf.as_ptr(), 0);
    }
}
