//! x86-64 translation-table engine.
//!
//! Owns the hierarchical radix tree of hardware paging structures
//! (PML4 -> PDPT -> PD -> PT) and exposes batch mapping, unmapping,
//! permission changes, and translation queries over it. The same recursive
//! engine serves both host paging and nested (EPT) paging; the differences
//! are captured by the [`scheme::PagingScheme`] policy hooks.
//!
//! The engine keeps hardware-visible state coherent with a non-coherent page
//! walker by coalescing cache-line writebacks ([`flush::CacheLineFlusher`])
//! and invalidating the TLB through the registered shootdown driver
//! ([`tlb`]) whenever a previously-present entry is modified.

#![cfg_attr(not(test), no_std)]

use tachyon_core::paging::{PageSize, PhysFrame};

pub mod cursor;
pub mod entry;
pub mod flush;
pub mod level;
pub mod physmap;
pub mod scheme;
pub mod table;
pub mod tlb;

pub use table::PageTable;

/// Size of the smallest page and of every paging-structure frame.
pub const PAGE_SIZE: u64 = 4096;

/// Error returned by the translation-table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtError {
    /// Bad virtual address, physical address, or flag set. Raised before any
    /// mutation.
    InvalidArgs,
    /// A map operation ran into an existing terminal entry. The completed
    /// prefix has been undone.
    AlreadyExists,
    /// A paging-structure frame could not be allocated. For map operations
    /// the completed prefix has been undone.
    NoMemory,
    /// No present terminal entry translates the queried address.
    NotFound,
}

bitflags::bitflags! {
    /// Architecture-independent mapping permissions and caching flags.
    ///
    /// These are the flags callers speak; each [`scheme::PagingScheme`]
    /// translates them to and from hardware entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmuFlags: u32 {
        /// Mapping is readable. Required for every mapping.
        const READ          = 1 << 0;
        /// Mapping is writable.
        const WRITE         = 1 << 1;
        /// Mapping is executable.
        const EXECUTE       = 1 << 2;
        /// Mapping is accessible from user mode.
        const USER          = 1 << 3;
        /// Global mapping (survives address-space switches).
        const GLOBAL        = 1 << 4;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 5;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 6;
    }
}

impl MmuFlags {
    /// The common read-write data mapping.
    pub const RW: MmuFlags = MmuFlags::READ.union(MmuFlags::WRITE);
    /// A read-only mapping.
    pub const RO: MmuFlags = MmuFlags::READ;
}

/// Allocator for paging-structure frames.
///
/// # Safety
///
/// Implementations must return frames that are unaliased, backed by real
/// memory reachable through the instance's [`physmap::Physmap`], and owned by
/// the caller until deallocated.
pub unsafe trait FrameAllocator<S: PageSize> {
    /// Allocates a single frame, or `None` when memory is exhausted.
    fn allocate_frame(&mut self) -> Option<PhysFrame<S>>;
}

/// Deallocator for paging-structure frames.
///
/// # Safety
///
/// Implementations must accept only frames previously handed out by the
/// paired [`FrameAllocator`].
pub unsafe trait FrameDeallocator<S: PageSize> {
    /// Returns a frame to the allocator.
    ///
    /// # Safety
    ///
    /// The frame must have been allocated by the paired allocator and must no
    /// longer be referenced by any paging structure.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<S>);
}
