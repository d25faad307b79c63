//! Paging-policy hooks.
//!
//! One recursive engine serves both the host paging structures the CPU walks
//! through CR3 and the nested (EPT) structures a hypervisor points VMCS at.
//! Everything that differs between the two -- flag encodings, address
//! validity, large-page support, invalidation semantics -- is funnelled
//! through [`PagingScheme`], implemented by [`HostPaging`] and
//! [`ExtendedPaging`].

use tachyon_core::addr::{PhysAddr, VirtAddr};

use crate::entry::{PtEntry, PtFlags};
use crate::level::PageTableLevel;
use crate::{tlb, MmuFlags};

/// Highest physical address bit the architecture can report.
const MAX_PADDR: u64 = 1 << 52;

/// Per-instance policy consulted by the recursive engine.
pub trait PagingScheme {
    /// The level of the root table.
    fn top_level(&self) -> PageTableLevel;

    /// Whether `vaddr` may be mapped by this instance.
    fn check_vaddr(&self, vaddr: VirtAddr) -> bool;

    /// Whether `paddr` may back a mapping in this instance.
    fn check_paddr(&self, paddr: PhysAddr) -> bool;

    /// Whether the caller-supplied flag set is accepted.
    fn allowed_flags(&self, flags: MmuFlags) -> bool;

    /// Whether `vaddr` belongs to the kernel half of the split; forwarded to
    /// the shootdown driver as the global hint.
    fn is_kernel_address(&self, vaddr: VirtAddr) -> bool;

    /// Whether entry stores must be written back for a non-coherent walker.
    fn needs_cache_flushes(&self) -> bool;

    /// Whether terminal entries may be installed at `level`.
    fn supports_page_size(&self, level: PageTableLevel) -> bool;

    /// Entry bits for a reference to a sub-table.
    fn intermediate_flags(&self) -> PtFlags;

    /// Entry bits realising `flags` for a terminal entry at `level`. Includes
    /// the PS bit at PD/PDPT.
    fn terminal_flags(&self, level: PageTableLevel, flags: MmuFlags) -> PtFlags;

    /// Entry bits for the 512 children created when the large entry at
    /// `level` (with flag word `flags`) is split one level down.
    fn split_flags(&self, level: PageTableLevel, flags: PtFlags) -> PtFlags;

    /// Decodes a terminal entry at `level` back into abstract flags.
    fn pt_flags_to_mmu_flags(&self, entry: PtEntry, level: PageTableLevel) -> MmuFlags;

    /// Invalidates the translation of `vaddr` at `level` after an entry that
    /// was previously present has been modified. The entry store is
    /// guaranteed to have reached memory first.
    fn tlb_invalidate_page(
        &self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        is_global: bool,
        was_terminal: bool,
    );
}

// ---------------------------------------------------------------------------
// Host paging
// ---------------------------------------------------------------------------

/// Default kernel-split predicate: the canonical upper half.
fn upper_half(vaddr: VirtAddr) -> bool {
    vaddr.as_u64() >= 0xFFFF_8000_0000_0000
}

/// Policy for the host paging structures loaded into CR3.
///
/// The fields cover the per-instance configuration: top level, kernel split,
/// accepted flags, 1 GiB-page capability (CPUID-derived), walker coherency,
/// and whether the global bit is in use (CR4.PGE).
#[derive(Debug, Clone, Copy)]
pub struct HostPaging {
    /// Root level; `Pml4` for 4-level paging.
    pub top: PageTableLevel,
    /// Caller-supplied kernel-split predicate.
    pub kernel_split: fn(VirtAddr) -> bool,
    /// Mask of accepted [`MmuFlags`].
    pub allowed: MmuFlags,
    /// Whether 1 GiB terminal entries may be installed (CPUID leaf
    /// 0x8000_0001 EDX bit 26).
    pub supports_1g: bool,
    /// Whether the hardware walker snoops the cache hierarchy.
    pub needs_cache_flush: bool,
    /// Whether global mappings are enabled (CR4.PGE).
    pub global_enabled: bool,
}

impl Default for HostPaging {
    fn default() -> Self {
        Self {
            top: PageTableLevel::Pml4,
            kernel_split: upper_half,
            allowed: MmuFlags::all(),
            supports_1g: true,
            // The x86 walker participates in cache coherency; only tables
            // shared with non-coherent remapping hardware need flushes.
            needs_cache_flush: false,
            global_enabled: true,
        }
    }
}

impl PagingScheme for HostPaging {
    fn top_level(&self) -> PageTableLevel {
        self.top
    }

    fn check_vaddr(&self, vaddr: VirtAddr) -> bool {
        match self.top {
            // Canonical form is enforced by the VirtAddr type.
            PageTableLevel::Pml4 => true,
            level => vaddr.as_u64() < level.page_size() * 512,
        }
    }

    fn check_paddr(&self, paddr: PhysAddr) -> bool {
        paddr.as_u64() < MAX_PADDR
    }

    fn allowed_flags(&self, flags: MmuFlags) -> bool {
        flags.contains(MmuFlags::READ) && self.allowed.contains(flags)
    }

    fn is_kernel_address(&self, vaddr: VirtAddr) -> bool {
        (self.kernel_split)(vaddr)
    }

    fn needs_cache_flushes(&self) -> bool {
        self.needs_cache_flush
    }

    fn supports_page_size(&self, level: PageTableLevel) -> bool {
        match level {
            PageTableLevel::Pt | PageTableLevel::Pd => true,
            PageTableLevel::Pdpt => self.supports_1g,
            PageTableLevel::Pml4 => false,
        }
    }

    fn intermediate_flags(&self) -> PtFlags {
        // USER on intermediates; the terminal entry decides the actual
        // privilege of each page.
        PtFlags::PRESENT | PtFlags::WRITABLE | PtFlags::USER
    }

    fn terminal_flags(&self, level: PageTableLevel, flags: MmuFlags) -> PtFlags {
        let mut out = PtFlags::PRESENT;
        if flags.contains(MmuFlags::WRITE) {
            out |= PtFlags::WRITABLE;
        }
        if !flags.contains(MmuFlags::EXECUTE) {
            out |= PtFlags::NO_EXECUTE;
        }
        if flags.contains(MmuFlags::USER) {
            out |= PtFlags::USER;
        }
        if flags.contains(MmuFlags::GLOBAL) && self.global_enabled {
            out |= PtFlags::GLOBAL;
        }
        if flags.contains(MmuFlags::WRITE_THROUGH) {
            out |= PtFlags::WRITE_THROUGH;
        }
        if flags.contains(MmuFlags::CACHE_DISABLE) {
            out |= PtFlags::CACHE_DISABLE;
        }
        if level != PageTableLevel::Pt {
            out |= PtFlags::HUGE_PAGE;
        }
        out
    }

    fn split_flags(&self, level: PageTableLevel, flags: PtFlags) -> PtFlags {
        debug_assert!(level == PageTableLevel::Pd || level == PageTableLevel::Pdpt);
        debug_assert!(flags.contains(PtFlags::HUGE_PAGE));
        let mut out = flags;
        if level == PageTableLevel::Pd {
            // 2 MiB -> 4 KiB children: clear PS, and relocate the PAT bit
            // from the large-format position (bit 12) to bit 7, which the
            // 4 KiB format reuses for PAT.
            out.remove(PtFlags::HUGE_PAGE);
            if out.contains(PtFlags::PAT_LARGE) {
                out.remove(PtFlags::PAT_LARGE);
                out.insert(PtFlags::HUGE_PAGE);
            }
        }
        // 1 GiB -> 2 MiB children keep PS (and the bit-12 PAT position).
        out
    }

    fn pt_flags_to_mmu_flags(&self, entry: PtEntry, _level: PageTableLevel) -> MmuFlags {
        let bits = entry.flags();
        let mut out = MmuFlags::READ;
        if bits.contains(PtFlags::WRITABLE) {
            out |= MmuFlags::WRITE;
        }
        if !bits.contains(PtFlags::NO_EXECUTE) {
            out |= MmuFlags::EXECUTE;
        }
        if bits.contains(PtFlags::USER) {
            out |= MmuFlags::USER;
        }
        if bits.contains(PtFlags::GLOBAL) {
            out |= MmuFlags::GLOBAL;
        }
        if bits.contains(PtFlags::WRITE_THROUGH) {
            out |= MmuFlags::WRITE_THROUGH;
        }
        if bits.contains(PtFlags::CACHE_DISABLE) {
            out |= MmuFlags::CACHE_DISABLE;
        }
        out
    }

    fn tlb_invalidate_page(
        &self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        is_global: bool,
        was_terminal: bool,
    ) {
        tlb::invalidate_page(level, vaddr, is_global, was_terminal);
    }
}

// ---------------------------------------------------------------------------
// Extended (nested) paging
// ---------------------------------------------------------------------------

/// EPT permission and memory-type bits. The positions overlap the host bit
/// names in [`PtFlags`] but carry different meanings, so they get their own
/// constants.
mod ept {
    use crate::entry::PtFlags;

    pub const READ: PtFlags = PtFlags::from_bits_retain(1 << 0);
    pub const WRITE: PtFlags = PtFlags::from_bits_retain(1 << 1);
    pub const EXECUTE: PtFlags = PtFlags::from_bits_retain(1 << 2);
    /// Write-back memory type in bits 5:3 of a terminal entry.
    pub const MEMTYPE_WB: PtFlags = PtFlags::from_bits_retain(6 << 3);
}

/// Policy for nested (EPT) paging structures.
///
/// Virtual addresses are guest-physical here; there is no kernel split, no
/// user/supervisor distinction, and no global bit. The read-permission bit
/// doubles as the present bit.
#[derive(Debug, Clone, Copy)]
pub struct ExtendedPaging {
    /// Whether 1 GiB terminal entries may be installed (VMX capability MSR).
    pub supports_1g: bool,
}

impl Default for ExtendedPaging {
    fn default() -> Self {
        Self { supports_1g: true }
    }
}

impl PagingScheme for ExtendedPaging {
    fn top_level(&self) -> PageTableLevel {
        PageTableLevel::Pml4
    }

    fn check_vaddr(&self, vaddr: VirtAddr) -> bool {
        // Guest-physical addresses: low half only (the canonical type cannot
        // carry bit 47 without sign-extension).
        vaddr.as_u64() >> 47 == 0
    }

    fn check_paddr(&self, paddr: PhysAddr) -> bool {
        paddr.as_u64() < MAX_PADDR
    }

    fn allowed_flags(&self, flags: MmuFlags) -> bool {
        flags.contains(MmuFlags::READ)
    }

    fn is_kernel_address(&self, _vaddr: VirtAddr) -> bool {
        false
    }

    fn needs_cache_flushes(&self) -> bool {
        false
    }

    fn supports_page_size(&self, level: PageTableLevel) -> bool {
        match level {
            PageTableLevel::Pt | PageTableLevel::Pd => true,
            PageTableLevel::Pdpt => self.supports_1g,
            PageTableLevel::Pml4 => false,
        }
    }

    fn intermediate_flags(&self) -> PtFlags {
        ept::READ | ept::WRITE | ept::EXECUTE
    }

    fn terminal_flags(&self, level: PageTableLevel, flags: MmuFlags) -> PtFlags {
        let mut out = ept::READ | ept::MEMTYPE_WB;
        if flags.contains(MmuFlags::WRITE) {
            out |= ept::WRITE;
        }
        if flags.contains(MmuFlags::EXECUTE) {
            out |= ept::EXECUTE;
        }
        if level != PageTableLevel::Pt {
            out |= PtFlags::HUGE_PAGE;
        }
        out
    }

    fn split_flags(&self, level: PageTableLevel, flags: PtFlags) -> PtFlags {
        debug_assert!(level == PageTableLevel::Pd || level == PageTableLevel::Pdpt);
        let mut out = flags;
        if level == PageTableLevel::Pd {
            out.remove(PtFlags::HUGE_PAGE);
        }
        out
    }

    fn pt_flags_to_mmu_flags(&self, entry: PtEntry, _level: PageTableLevel) -> MmuFlags {
        let bits = entry.flags();
        let mut out = MmuFlags::empty();
        if bits.contains(ept::READ) {
            out |= MmuFlags::READ;
        }
        if bits.contains(ept::WRITE) {
            out |= MmuFlags::WRITE;
        }
        if bits.contains(ept::EXECUTE) {
            out |= MmuFlags::EXECUTE;
        }
        out
    }

    fn tlb_invalidate_page(
        &self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        is_global: bool,
        was_terminal: bool,
    ) {
        // The driver distinguishes EPT contexts (INVEPT) from host ones.
        tlb::invalidate_page(level, vaddr, is_global, was_terminal);
    }
}
