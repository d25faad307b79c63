//! Hardware table-entry encoding.
//!
//! A [`PtEntry`] is the raw 64-bit value the page walker reads. The physical
//! frame field depends on the level: 4 KiB-aligned at PT, 2 MiB-aligned for a
//! PD large page, 1 GiB-aligned for a PDPT huge page. Everything outside the
//! frame field is an opaque flag word owned by the active
//! [`PagingScheme`](crate::scheme::PagingScheme).

use tachyon_core::addr::PhysAddr;

use crate::level::PageTableLevel;

/// Frame mask for 4 KiB entries and for sub-table references: bits 12..51.
pub const ADDR_MASK_4K: u64 = 0x000F_FFFF_FFFF_F000;

/// Frame mask for 2 MiB large entries: bits 21..51.
pub const ADDR_MASK_2M: u64 = 0x000F_FFFF_FFE0_0000;

/// Frame mask for 1 GiB huge entries: bits 30..51.
pub const ADDR_MASK_1G: u64 = 0x000F_FFFF_C000_0000;

/// Flag mask of a large (PS) entry: the low 13 bits plus the NX bit.
///
/// Bit 12 is the PAT bit in the large-entry format; in the 4 KiB format it
/// belongs to the frame field.
const LARGE_FLAGS_MASK: u64 = 0x8000_0000_0000_1FFF;

bitflags::bitflags! {
    /// Hardware entry flag bits.
    ///
    /// The engine only ever inspects `PRESENT` and `HUGE_PAGE`; the rest are
    /// produced and consumed by the paging scheme. Under EPT the low bits
    /// carry different meanings (bit 0 is the read permission), which is why
    /// the engine treats the word as opaque.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtFlags: u64 {
        /// Entry is present (EPT: readable).
        const PRESENT       = 1 << 0;
        /// Page is writable (EPT: writable).
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (EPT: executable).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the walker on access.
        const ACCESSED      = 1 << 5;
        /// Set by the walker on write.
        const DIRTY         = 1 << 6;
        /// PS bit: terminal 2 MiB entry in a PD, 1 GiB entry in a PDPT.
        const HUGE_PAGE     = 1 << 7;
        /// Global page, kept across address-space switches.
        const GLOBAL        = 1 << 8;
        /// PAT bit in the large-entry format (bit 7 in the 4 KiB format).
        const PAT_LARGE     = 1 << 12;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single hardware table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(u64);

impl PtEntry {
    /// An empty (not present) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Encodes `paddr | flags`. The frame field accepts any 4 KiB-aligned
    /// address; large-page encodings are a strict subset.
    #[inline]
    pub const fn new(paddr: PhysAddr, flags: PtFlags) -> Self {
        Self((paddr.as_u64() & ADDR_MASK_4K) | flags.bits())
    }

    /// Returns the raw 64-bit value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether the present bit is set.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PtFlags::PRESENT.bits() != 0
    }

    /// Whether the PS bit is set (2 MiB / 1 GiB terminal entry).
    #[inline]
    pub const fn is_large(self) -> bool {
        self.0 & PtFlags::HUGE_PAGE.bits() != 0
    }

    /// Whether this entry maps a page when read at `level`.
    ///
    /// Every present PT entry is terminal; above PT only PS entries are.
    #[inline]
    pub fn is_terminal(self, level: PageTableLevel) -> bool {
        self.is_present() && (level == PageTableLevel::Pt || self.is_large())
    }

    /// The physical frame mapped by a terminal entry at `level`.
    #[inline]
    pub fn frame(self, level: PageTableLevel) -> PhysAddr {
        debug_assert!(self.is_present());
        let mask = match level {
            PageTableLevel::Pt => ADDR_MASK_4K,
            PageTableLevel::Pd => ADDR_MASK_2M,
            PageTableLevel::Pdpt => ADDR_MASK_1G,
            PageTableLevel::Pml4 => panic!("PtEntry::frame: no terminal entries at PML4"),
        };
        // SAFETY: The masked value fits in 52 bits by construction.
        unsafe { PhysAddr::new_unchecked(self.0 & mask) }
    }

    /// The physical address of the sub-table referenced by a present,
    /// non-large entry.
    #[inline]
    pub fn table_addr(self) -> PhysAddr {
        debug_assert!(self.is_present() && !self.is_large());
        // SAFETY: The masked value fits in 52 bits by construction.
        unsafe { PhysAddr::new_unchecked(self.0 & ADDR_MASK_4K) }
    }

    /// The flag bits of a 4 KiB or intermediate entry (frame field stripped).
    #[inline]
    pub fn flags(self) -> PtFlags {
        PtFlags::from_bits_truncate(self.0 & !ADDR_MASK_4K)
    }

    /// The flag bits of a large (PS) entry, including the large-format PAT
    /// bit, with the frame field stripped.
    #[inline]
    pub fn large_flags(self) -> PtFlags {
        PtFlags::from_bits_truncate(self.0 & LARGE_FLAGS_MASK)
    }
}
