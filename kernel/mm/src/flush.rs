//! Coalescing cache-line flusher for entry writes.
//!
//! Paging-structure walks on platforms with a non-coherent walker need every
//! entry store written back to memory before the matching TLB invalidation.
//! Batch operations touch many adjacent entries, so the flusher tracks at
//! most one dirty cache line and only writes a line back when the mutation
//! moves to a different one (or on drop).
//!
//! The actual writeback instruction sequence is a registered primitive, like
//! the TLB driver: kernels install [`writeback_line`]-compatible code at
//! boot, while host tests run against the no-op default.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::entry::PtEntry;

/// Cache-line size used to coalesce flushes, settable once at boot from
/// CPUID. The power-of-two default matches every shipping x86-64 part.
static CACHELINE_BYTES: AtomicU64 = AtomicU64::new(64);

/// Returns the cache-line size the flusher coalesces on.
#[inline]
pub fn cacheline_bytes() -> u64 {
    CACHELINE_BYTES.load(Ordering::Relaxed)
}

/// Records the CPUID-derived cache-line size. `bytes` must be a power of two.
pub fn set_cacheline_bytes(bytes: u64) {
    assert!(bytes.is_power_of_two());
    CACHELINE_BYTES.store(bytes, Ordering::Relaxed);
}

/// The signature of the registered writeback primitive: store-fence the
/// pending entry writes, then write back the cache line containing `line`.
pub type WritebackFn = fn(usize);

fn nop_writeback(_line: usize) {}

static WRITEBACK_FN: AtomicPtr<()> = AtomicPtr::new(nop_writeback as *mut ());

/// Registers the architecture writeback primitive (e.g. `sfence; clwb`).
///
/// Before registration, writebacks are no-ops, which is correct wherever the
/// page walker is cache-coherent -- including host tests.
///
/// # Safety
///
/// The function must be safe to call with any address previously passed to
/// [`CacheLineFlusher::flush_entry`], i.e. any live paging-structure entry.
pub unsafe fn register_writeback(f: WritebackFn) {
    WRITEBACK_FN.store(f as *mut (), Ordering::Release);
}

/// Writes back one cache line through the registered primitive.
#[inline]
pub fn writeback_line(line: usize) {
    let ptr = WRITEBACK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `WritebackFn` pointers (or the initial no-op) are
    // ever stored into WRITEBACK_FN.
    let f: WritebackFn = unsafe { core::mem::transmute(ptr) };
    f(line);
}

/// Fence-then-writeback primitive for x86-64: orders all prior entry stores,
/// then evicts the line so a non-coherent walker rereads it from memory.
/// Kernels pass this to [`register_writeback`] during boot.
#[cfg(target_arch = "x86_64")]
pub fn clflush_writeback(line: usize) {
    // SAFETY: Callers hand in the address of a live paging-structure entry;
    // clflush and mfence are unprivileged and valid on any mapped address.
    unsafe {
        core::arch::asm!(
            "clflush [{line}]",
            "mfence",
            line = in(reg) line,
            options(nostack, preserves_flags),
        );
    }
}

/// Scoped accumulator that coalesces cache-line flushes of modified entries.
///
/// Construct one per mutation region; drop forces the final flush, so the
/// writeback happens on every exit path. When constructed with
/// `perform_flushes == false` (a coherent walker), all operations are no-ops.
pub struct CacheLineFlusher {
    /// The cache-aligned address currently dirty. Zero means no dirty line.
    dirty_line: usize,
    line_mask: usize,
    perform_flushes: bool,
}

impl CacheLineFlusher {
    /// Creates a flusher. `perform_flushes` comes from the paging scheme's
    /// `needs_cache_flushes` hook.
    pub fn new(perform_flushes: bool) -> Self {
        Self {
            dirty_line: 0,
            line_mask: !(cacheline_bytes() as usize - 1),
            perform_flushes,
        }
    }

    /// Notes that `entry` was written. If the entry sits on a different cache
    /// line than the pending one, the pending line is written back first.
    pub fn flush_entry(&mut self, entry: *const PtEntry) {
        if !self.perform_flushes {
            return;
        }
        let entry_line = entry as usize & self.line_mask;
        if entry_line != self.dirty_line {
            self.force();
            self.dirty_line = entry_line;
        }
    }

    /// Writes back any pending dirty line immediately.
    ///
    /// Must be called before a TLB invalidation that depends on the entry
    /// store being visible to the walker.
    pub fn force(&mut self) {
        if self.dirty_line != 0 && self.perform_flushes {
            writeback_line(self.dirty_line);
            self.dirty_line = 0;
        }
    }
}

impl Drop for CacheLineFlusher {
    fn drop(&mut self) {
        self.force();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static WRITEBACKS: AtomicUsize = AtomicUsize::new(0);

    fn counting_writeback(_line: usize) {
        WRITEBACKS.fetch_add(1, Ordering::SeqCst);
    }

    // The registered primitive is process-global, so the tests that observe
    // it run under one lock and restore the no-op default afterwards.
    static HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_counting_writeback(f: impl FnOnce()) -> usize {
        let _guard = HOOK_LOCK.lock().unwrap();
        // SAFETY: counting_writeback is safe for any address.
        unsafe { register_writeback(counting_writeback) };
        let before = WRITEBACKS.load(Ordering::SeqCst);
        f();
        let after = WRITEBACKS.load(Ordering::SeqCst);
        unsafe { register_writeback(nop_writeback) };
        after - before
    }

    #[test]
    fn same_line_writes_coalesce() {
        // Two entries on one cache line: a single writeback at drop.
        #[repr(align(64))]
        struct Aligned([PtEntry; 8]);
        let entries = Aligned([PtEntry::empty(); 8]);
        let count = with_counting_writeback(|| {
            let mut flusher = CacheLineFlusher::new(true);
            flusher.flush_entry(&entries.0[0]);
            flusher.flush_entry(&entries.0[1]);
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn crossing_lines_forces_flush() {
        // 64-byte aligned buffer: entries 0 and 8 are on different lines.
        #[repr(align(64))]
        struct Aligned([PtEntry; 16]);
        let entries = Aligned([PtEntry::empty(); 16]);
        let count = with_counting_writeback(|| {
            let mut flusher = CacheLineFlusher::new(true);
            flusher.flush_entry(&entries.0[0]);
            flusher.flush_entry(&entries.0[8]);
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn force_is_idempotent() {
        let entry = PtEntry::empty();
        let count = with_counting_writeback(|| {
            let mut flusher = CacheLineFlusher::new(true);
            flusher.flush_entry(&entry);
            flusher.force();
            flusher.force();
        });
        assert_eq!(count, 1);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn clflush_primitive_runs_on_ordinary_memory() {
        let entry = PtEntry::empty();
        clflush_writeback(&entry as *const PtEntry as usize);
    }

    #[test]
    fn disabled_flusher_is_a_no_op() {
        let entry = PtEntry::empty();
        let count = with_counting_writeback(|| {
            let mut flusher = CacheLineFlusher::new(false);
            flusher.flush_entry(&entry);
            flusher.force();
        });
        assert_eq!(count, 0);
    }
}
