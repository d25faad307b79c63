//! Registered TLB shootdown driver.
//!
//! Cross-CPU invalidation belongs to platform code; the engine only promises
//! that the entry store has reached memory (see
//! [`flush`](crate::flush)) before the driver is called. Boot code registers
//! the real driver; until then invalidations are dropped, which is correct
//! before secondary CPUs are online and in host tests.

use core::sync::atomic::{AtomicPtr, Ordering};

use tachyon_core::addr::VirtAddr;

use crate::level::PageTableLevel;

/// The signature of the shootdown driver.
///
/// Arguments: the level of the modified entry, the virtual address it
/// translates, whether the mapping is global, and whether the modified entry
/// was terminal. Non-terminal invalidations cover the freeing of a whole
/// sub-table; drivers decide per-architecture how wide to invalidate.
pub type InvalidatePageFn = fn(PageTableLevel, VirtAddr, bool, bool);

fn nop_invalidate(_level: PageTableLevel, _vaddr: VirtAddr, _global: bool, _terminal: bool) {}

static INVALIDATE_FN: AtomicPtr<()> = AtomicPtr::new(nop_invalidate as *mut ());

/// Registers the cross-CPU shootdown driver.
///
/// # Safety
///
/// The function must be safe to call from any context that mutates paging
/// structures, including with per-instance locks held, and must not call
/// back into the translation-table engine.
pub unsafe fn register_invalidate(f: InvalidatePageFn) {
    INVALIDATE_FN.store(f as *mut (), Ordering::Release);
}

/// Invalidates the translation for `vaddr` at `level` through the registered
/// driver.
#[inline]
pub fn invalidate_page(level: PageTableLevel, vaddr: VirtAddr, is_global: bool, was_terminal: bool) {
    let ptr = INVALIDATE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `InvalidatePageFn` pointers (or the initial no-op)
    // are ever stored into INVALIDATE_FN.
    let f: InvalidatePageFn = unsafe { core::mem::transmute(ptr) };
    f(level, vaddr, is_global, was_terminal);
}
