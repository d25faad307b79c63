//! The translation-table instance and its recursive engine.
//!
//! A [`PageTable`] owns a tree of paging-structure frames rooted at a
//! top-level table. The engine walks it one hardware entry at a time behind a
//! [`MappingCursor`], allocating intermediate tables on the way down, pruning
//! empty ones on the way back up, and splitting large pages when a sub-range
//! mutation needs finer granularity.
//!
//! Failure semantics are all-or-nothing for the map operations: the cursor
//! records exactly how much work completed, and the facade unmaps that prefix
//! before surfacing the error.

use tachyon_core::addr::{PhysAddr, VirtAddr};
use tachyon_core::paging::{PhysFrame, Size4KiB};
use tachyon_core::sync::SpinLock;
use tachyon_core::{kdebug, ktrace};

use crate::cursor::MappingCursor;
use crate::entry::{PtEntry, PtFlags};
use crate::flush::CacheLineFlusher;
use crate::level::{PageTableLevel, ENTRY_COUNT};
use crate::physmap::Physmap;
use crate::scheme::PagingScheme;
use crate::{FrameAllocator, FrameDeallocator, MmuFlags, PtError, PAGE_SIZE};

/// First top-level slot of the kernel half shared into user tables.
const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// Mutable table state guarded by the per-instance lock.
struct Inner {
    /// Physical address of the top-level table frame.
    root: PhysAddr,
    /// Paging-structure frames held by this instance (root + intermediates).
    pages: usize,
}

/// Frame source and accounting threaded through the recursive engine.
struct Frames<'a, A> {
    alloc: &'a mut A,
    pages: &'a mut usize,
}

/// A hierarchical translation table (host or nested paging).
///
/// Every public operation takes the instance lock for its whole duration, so
/// concurrent callers observe each batch as a unit.
pub struct PageTable<P: PagingScheme> {
    inner: SpinLock<Inner>,
    scheme: P,
    physmap: Physmap,
}

impl<P: PagingScheme> PageTable<P> {
    /// Allocates and zeroes the root frame of a new, empty table.
    pub fn new(
        scheme: P,
        physmap: Physmap,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<Self, PtError> {
        let frame = alloc.allocate_frame().ok_or(PtError::NoMemory)?;
        let root = frame.start_address();
        let this = Self {
            inner: SpinLock::new(Inner { root, pages: 1 }),
            scheme,
            physmap,
        };
        this.zero_table(root);
        Ok(this)
    }

    /// Creates a user table whose upper 256 top-level slots are copied from
    /// `kernel_root`, sharing the kernel half between address spaces. The
    /// lower half starts empty.
    ///
    /// # Safety
    ///
    /// `kernel_root` must be the live root of a kernel table built over the
    /// same physmap, and must outlive this instance.
    pub unsafe fn new_user(
        scheme: P,
        physmap: Physmap,
        kernel_root: PhysAddr,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<Self, PtError> {
        let this = Self::new(scheme, physmap, alloc)?;
        debug_assert!(this.scheme.top_level() == PageTableLevel::Pml4);
        {
            let inner = this.inner.lock();
            let dst = this.table_ptr(inner.root);
            let src = this.table_ptr(kernel_root);
            for i in KERNEL_HALF_FIRST_SLOT..ENTRY_COUNT {
                // SAFETY: Both tables are live 512-entry frames reachable
                // through the physmap; i < 512.
                unsafe { dst.add(i).write_volatile(src.add(i).read_volatile()) };
            }
        }
        Ok(this)
    }

    /// Physical address of the root table (what CR3 or the nested-paging
    /// pointer is loaded with).
    pub fn root_phys(&self) -> PhysAddr {
        self.inner.lock().root
    }

    /// Number of paging-structure frames currently held (root included).
    pub fn pages(&self) -> usize {
        self.inner.lock().pages
    }

    /// Maps `phys.len()` non-contiguous 4 KiB frames starting at `vaddr`.
    ///
    /// Returns the number of pages mapped. On any failure the already-mapped
    /// prefix is unmapped again before the error is returned.
    pub fn map_pages<A>(
        &self,
        vaddr: VirtAddr,
        phys: &[PhysAddr],
        flags: MmuFlags,
        alloc: &mut A,
    ) -> Result<usize, PtError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        ktrace!("map_pages: vaddr {vaddr} count {} flags {flags:?}", phys.len());
        if !vaddr.is_aligned(PAGE_SIZE) || !self.scheme.check_vaddr(vaddr) {
            return Err(PtError::InvalidArgs);
        }
        for pa in phys {
            if !pa.is_aligned(PAGE_SIZE) || !self.scheme.check_paddr(*pa) {
                return Err(PtError::InvalidArgs);
            }
        }
        if phys.is_empty() {
            return Ok(0);
        }
        if !self.scheme.allowed_flags(flags) {
            return Err(PtError::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        let Inner { root, pages } = &mut *inner;
        let table = self.table_ptr(*root);
        let top = self.scheme.top_level();
        let mut frames = Frames { alloc, pages };

        for (idx, pa) in phys.iter().enumerate() {
            let page_vaddr = vaddr + idx as u64 * PAGE_SIZE;
            let mut cursor = MappingCursor::new(page_vaddr, *pa, PAGE_SIZE);
            if let Err(err) = self.add_mapping(table, top, &mut cursor, flags, &mut frames) {
                kdebug!("map_pages: failed at {page_vaddr} ({err:?}); undoing {idx} pages");
                if idx > 0 {
                    let mut undo =
                        MappingCursor::new(vaddr, PhysAddr::zero(), idx as u64 * PAGE_SIZE);
                    self.remove_mapping(table, top, &mut undo, &mut frames);
                    debug_assert_eq!(undo.size(), 0);
                }
                return Err(err);
            }
            debug_assert_eq!(cursor.size(), 0);
        }
        Ok(phys.len())
    }

    /// Maps `count` pages of physically contiguous memory starting at
    /// `vaddr` / `paddr`. Large pages are used whenever alignment and length
    /// allow.
    ///
    /// Returns the number of pages mapped. On any failure the already-mapped
    /// prefix is unmapped again before the error is returned.
    pub fn map_pages_contiguous<A>(
        &self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        flags: MmuFlags,
        alloc: &mut A,
    ) -> Result<usize, PtError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        ktrace!("map_pages_contiguous: vaddr {vaddr} paddr {paddr} count {count} flags {flags:?}");
        if !vaddr.is_aligned(PAGE_SIZE) || !self.scheme.check_vaddr(vaddr) {
            return Err(PtError::InvalidArgs);
        }
        if !paddr.is_aligned(PAGE_SIZE) || !self.scheme.check_paddr(paddr) {
            return Err(PtError::InvalidArgs);
        }
        if count == 0 {
            return Ok(0);
        }
        if !self.scheme.allowed_flags(flags) {
            return Err(PtError::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        let Inner { root, pages } = &mut *inner;
        let table = self.table_ptr(*root);
        let top = self.scheme.top_level();
        let mut frames = Frames { alloc, pages };

        let size = count as u64 * PAGE_SIZE;
        let mut cursor = MappingCursor::new(vaddr, paddr, size);
        match self.add_mapping(table, top, &mut cursor, flags, &mut frames) {
            Ok(()) => {
                debug_assert_eq!(cursor.size(), 0);
                Ok(count)
            }
            Err(err) => {
                let mapped = size - cursor.size();
                kdebug!("map_pages_contiguous: failed ({err:?}); undoing {mapped:#x} bytes");
                if mapped > 0 {
                    let mut undo = MappingCursor::new(vaddr, PhysAddr::zero(), mapped);
                    self.remove_mapping(table, top, &mut undo, &mut frames);
                    debug_assert_eq!(undo.size(), 0);
                }
                Err(err)
            }
        }
    }

    /// Unmaps `count` pages starting at `vaddr`, freeing intermediate tables
    /// that become empty. Holes in the range are skipped silently.
    ///
    /// Returns the number of pages covered.
    pub fn unmap_pages<A>(
        &self,
        vaddr: VirtAddr,
        count: usize,
        alloc: &mut A,
    ) -> Result<usize, PtError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        ktrace!("unmap_pages: vaddr {vaddr} count {count}");
        if !vaddr.is_aligned(PAGE_SIZE) || !self.scheme.check_vaddr(vaddr) {
            return Err(PtError::InvalidArgs);
        }
        if count == 0 {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        let Inner { root, pages } = &mut *inner;
        let table = self.table_ptr(*root);
        let top = self.scheme.top_level();
        let mut frames = Frames { alloc, pages };

        let mut cursor = MappingCursor::new(vaddr, PhysAddr::zero(), count as u64 * PAGE_SIZE);
        self.remove_mapping(table, top, &mut cursor, &mut frames);
        debug_assert_eq!(cursor.size(), 0);
        Ok(count)
    }

    /// Rewrites the permissions/caching of every present mapping in the
    /// range. Holes are skipped; physical backing never changes. Large pages
    /// partially covered by the range are split first.
    pub fn protect_pages<A>(
        &self,
        vaddr: VirtAddr,
        count: usize,
        flags: MmuFlags,
        alloc: &mut A,
    ) -> Result<(), PtError>
    where
        A: FrameAllocator<Size4KiB>,
    {
        ktrace!("protect_pages: vaddr {vaddr} count {count} flags {flags:?}");
        if !vaddr.is_aligned(PAGE_SIZE) || !self.scheme.check_vaddr(vaddr) {
            return Err(PtError::InvalidArgs);
        }
        if count == 0 {
            return Ok(());
        }
        if !self.scheme.allowed_flags(flags) {
            return Err(PtError::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        let Inner { root, pages } = &mut *inner;
        let table = self.table_ptr(*root);
        let top = self.scheme.top_level();
        let mut frames = Frames { alloc, pages };

        let mut cursor = MappingCursor::new(vaddr, PhysAddr::zero(), count as u64 * PAGE_SIZE);
        self.update_mapping(table, top, &mut cursor, flags, &mut frames)?;
        debug_assert_eq!(cursor.size(), 0);
        Ok(())
    }

    /// Translates `vaddr`, returning the physical address (page frame plus
    /// in-page offset) and the abstract flags of the mapping.
    pub fn query(&self, vaddr: VirtAddr) -> Result<(PhysAddr, MmuFlags), PtError> {
        if !self.scheme.check_vaddr(vaddr) {
            return Err(PtError::InvalidArgs);
        }
        let inner = self.inner.lock();
        let mut level = self.scheme.top_level();
        let mut table = self.table_ptr(inner.root);
        loop {
            // SAFETY: `table` is a live 512-entry frame; the index is 9 bits.
            let pt_val = unsafe { table.add(level.index(vaddr)).read_volatile() };
            if !pt_val.is_present() {
                return Err(PtError::NotFound);
            }
            if pt_val.is_terminal(level) {
                let offset = vaddr.as_u64() & (level.page_size() - 1);
                let paddr = PhysAddr::new(pt_val.frame(level).as_u64() | offset);
                let flags = self.scheme.pt_flags_to_mmu_flags(pt_val, level);
                return Ok((paddr, flags));
            }
            table = self.table_ptr(pt_val.table_addr());
            level = level.next_down();
        }
    }

    /// Releases the root frame, consuming the table.
    ///
    /// The caller must already have unmapped everything it owns in
    /// `[base, base + size)`; debug builds verify that every top-level slot
    /// fully inside the window is empty. The first slot is skipped when
    /// `base` is not top-level aligned, since a partial slot may be shared
    /// with another instance.
    pub fn destroy(self, base: VirtAddr, size: u64, alloc: &mut impl FrameDeallocator<Size4KiB>) {
        let Self {
            inner,
            scheme,
            physmap,
        } = self;
        let inner = inner.into_inner();

        if cfg!(debug_assertions) && size > 0 {
            let top = scheme.top_level();
            let table = physmap.phys_to_virt(inner.root).as_mut_ptr::<PtEntry>();
            let mut start = top.index(base);
            let mut end = top.index(VirtAddr::new_truncate(
                base.as_u64().wrapping_add(size) - 1,
            ));
            if !top.is_aligned(base.as_u64()) {
                start += 1;
            }
            if top.is_aligned(base.as_u64().wrapping_add(size)) {
                end += 1;
            }
            for i in start..end {
                // SAFETY: The root is a live 512-entry frame; i < 512.
                let pt_val = unsafe { table.add(i).read_volatile() };
                debug_assert!(
                    !pt_val.is_present(),
                    "destroy: top-level slot {i} still mapped"
                );
            }
        }

        // SAFETY: The root frame came from the paired allocator and no
        // mapping operation can run again on this consumed instance.
        unsafe { alloc.deallocate_frame(PhysFrame::containing_address(inner.root)) };
    }

    // -----------------------------------------------------------------------
    // Entry mutation primitives
    // -----------------------------------------------------------------------

    /// Kernel-virtual alias of a paging-structure frame.
    fn table_ptr(&self, phys: PhysAddr) -> *mut PtEntry {
        self.physmap.phys_to_virt(phys).as_mut_ptr()
    }

    /// Zeroes a freshly allocated paging-structure frame.
    fn zero_table(&self, phys: PhysAddr) {
        let virt = self.physmap.phys_to_virt(phys);
        // SAFETY: The frame was just handed out by the allocator and is
        // reachable through the physmap.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };
    }

    /// Points `pte` at `paddr | flags | PRESENT`.
    ///
    /// When the entry was already present, the dirty line is written back and
    /// the TLB invalidated before returning, so the walker cannot keep using
    /// the old translation past this call.
    fn update_entry(
        &self,
        flusher: &mut CacheLineFlusher,
        level: PageTableLevel,
        vaddr: VirtAddr,
        pte: *mut PtEntry,
        paddr: PhysAddr,
        flags: PtFlags,
        was_terminal: bool,
    ) {
        debug_assert!(paddr.is_aligned(PAGE_SIZE));
        // SAFETY: `pte` points into a live table frame owned by this
        // instance; the lock serialises all access.
        let old = unsafe { pte.read_volatile() };
        unsafe { pte.write_volatile(PtEntry::new(paddr, flags | PtFlags::PRESENT)) };
        flusher.flush_entry(pte);

        if old.is_present() {
            // The writeback must land before the shootdown, or a
            // non-coherent walker could re-fetch the stale entry afterwards.
            flusher.force();
            self.scheme.tlb_invalidate_page(
                level,
                vaddr,
                self.scheme.is_kernel_address(vaddr),
                was_terminal,
            );
        }
    }

    /// Clears `pte`, with the same writeback-then-invalidate ordering as
    /// [`update_entry`](Self::update_entry). Does not free sub-tables.
    fn unmap_entry(
        &self,
        flusher: &mut CacheLineFlusher,
        level: PageTableLevel,
        vaddr: VirtAddr,
        pte: *mut PtEntry,
        was_terminal: bool,
    ) {
        // SAFETY: As in update_entry.
        let old = unsafe { pte.read_volatile() };
        unsafe { pte.write_volatile(PtEntry::empty()) };
        flusher.flush_entry(pte);

        if old.is_present() {
            flusher.force();
            self.scheme.tlb_invalidate_page(
                level,
                vaddr,
                self.scheme.is_kernel_address(vaddr),
                was_terminal,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Recursive engine
    // -----------------------------------------------------------------------

    /// Installs mappings for the cursor's range at `level` and below.
    ///
    /// On error the cursor reflects exactly the completed prefix; the facade
    /// uses it to undo.
    fn add_mapping<A: FrameAllocator<Size4KiB>>(
        &self,
        table: *mut PtEntry,
        level: PageTableLevel,
        cursor: &mut MappingCursor,
        mmu_flags: MmuFlags,
        frames: &mut Frames<'_, A>,
    ) -> Result<(), PtError> {
        debug_assert!(self.scheme.check_vaddr(cursor.vaddr()));
        debug_assert!(self.scheme.check_paddr(cursor.paddr()));
        if level == PageTableLevel::Pt {
            return self.add_mapping_leaf(table, cursor, mmu_flags);
        }

        let interm_flags = self.scheme.intermediate_flags();
        let term_flags = self.scheme.terminal_flags(level, mmu_flags);
        let supports_large = self.scheme.supports_page_size(level);
        let ps = level.page_size();

        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let mut index = level.index(cursor.vaddr());
        while index < ENTRY_COUNT && cursor.size() != 0 {
            // SAFETY: `table` is a live 512-entry frame; index < 512.
            let pte = unsafe { table.add(index) };
            let mut pt_val = unsafe { pte.read_volatile() };

            // An existing terminal entry anywhere in the range is a conflict.
            if pt_val.is_terminal(level) {
                return Err(PtError::AlreadyExists);
            }

            let can_promote = supports_large
                && !pt_val.is_present()
                && level.is_aligned(cursor.vaddr().as_u64())
                && level.is_aligned(cursor.paddr().as_u64())
                && cursor.size() >= ps;
            if can_promote {
                self.update_entry(
                    &mut flusher,
                    level,
                    cursor.vaddr(),
                    pte,
                    cursor.paddr(),
                    term_flags,
                    false,
                );
                cursor.consume(ps);
            } else {
                if !pt_val.is_present() {
                    let frame = frames.alloc.allocate_frame().ok_or(PtError::NoMemory)?;
                    let sub_phys = frame.start_address();
                    self.zero_table(sub_phys);
                    self.update_entry(
                        &mut flusher,
                        level,
                        cursor.vaddr(),
                        pte,
                        sub_phys,
                        interm_flags,
                        false,
                    );
                    *frames.pages += 1;
                    pt_val = unsafe { pte.read_volatile() };
                }
                let sub_table = self.table_ptr(pt_val.table_addr());
                self.add_mapping(sub_table, level.next_down(), cursor, mmu_flags, frames)?;
            }
            index += 1;
        }
        Ok(())
    }

    /// PT base case of [`add_mapping`](Self::add_mapping): one 4 KiB
    /// terminal entry per page.
    fn add_mapping_leaf(
        &self,
        table: *mut PtEntry,
        cursor: &mut MappingCursor,
        mmu_flags: MmuFlags,
    ) -> Result<(), PtError> {
        let term_flags = self.scheme.terminal_flags(PageTableLevel::Pt, mmu_flags);

        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let mut index = PageTableLevel::Pt.index(cursor.vaddr());
        while index < ENTRY_COUNT && cursor.size() != 0 {
            // SAFETY: `table` is a live 512-entry frame; index < 512.
            let pte = unsafe { table.add(index) };
            if unsafe { pte.read_volatile() }.is_present() {
                return Err(PtError::AlreadyExists);
            }
            self.update_entry(
                &mut flusher,
                PageTableLevel::Pt,
                cursor.vaddr(),
                pte,
                cursor.paddr(),
                term_flags,
                false,
            );
            cursor.consume(PAGE_SIZE);
            index += 1;
        }
        Ok(())
    }

    /// Removes mappings for the cursor's range at `level` and below, freeing
    /// sub-tables that become empty.
    ///
    /// Returns whether anything was unmapped at or below this level.
    fn remove_mapping<A>(
        &self,
        table: *mut PtEntry,
        level: PageTableLevel,
        cursor: &mut MappingCursor,
        frames: &mut Frames<'_, A>,
    ) -> bool
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        if level == PageTableLevel::Pt {
            return self.remove_mapping_leaf(table, cursor);
        }

        let ps = level.page_size();
        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let mut unmapped = false;
        let mut index = level.index(cursor.vaddr());
        while index < ENTRY_COUNT && cursor.size() != 0 {
            // SAFETY: `table` is a live 512-entry frame; index < 512.
            let pte = unsafe { table.add(index) };
            let mut pt_val = unsafe { pte.read_volatile() };

            if !pt_val.is_present() {
                cursor.skip_entry(level);
                index += 1;
                continue;
            }

            if pt_val.is_large() {
                // Whole large page inside the range: clear it outright.
                if level.is_aligned(cursor.vaddr().as_u64()) && cursor.size() >= ps {
                    self.unmap_entry(&mut flusher, level, cursor.vaddr(), pte, true);
                    unmapped = true;
                    cursor.consume(ps);
                    index += 1;
                    continue;
                }
                // Partial coverage needs a split first.
                let slot_base = cursor.vaddr().align_down(ps);
                if self.split_large_page(level, slot_base, pte, frames).is_err() {
                    // Out of memory mid-unmap: drop the whole large page and
                    // let a later fault rebuild the surviving part.
                    self.unmap_entry(&mut flusher, level, cursor.vaddr(), pte, true);
                    unmapped = true;
                    cursor.skip_entry(level);
                    index += 1;
                    continue;
                }
                pt_val = unsafe { pte.read_volatile() };
            }

            let sub_phys = pt_val.table_addr();
            let sub_table = self.table_ptr(sub_phys);
            let entry_vaddr = cursor.vaddr();
            // Full coverage at entry means the recursion empties the
            // sub-table by construction; otherwise a linear scan decides.
            let covers_slot = level.is_aligned(entry_vaddr.as_u64()) && cursor.size() >= ps;
            let lower_unmapped =
                self.remove_mapping(sub_table, level.next_down(), cursor, frames);

            let free_sub_table =
                covers_slot || (lower_unmapped && Self::table_is_empty(sub_table));
            if free_sub_table {
                self.unmap_entry(&mut flusher, level, entry_vaddr, pte, false);
                // SAFETY: The entry referencing the sub-table has been
                // cleared and invalidated; nothing reaches the frame anymore.
                unsafe {
                    frames
                        .alloc
                        .deallocate_frame(PhysFrame::containing_address(sub_phys));
                }
                *frames.pages -= 1;
                unmapped = true;
            }
            index += 1;
        }
        unmapped
    }

    /// PT base case of [`remove_mapping`](Self::remove_mapping).
    fn remove_mapping_leaf(&self, table: *mut PtEntry, cursor: &mut MappingCursor) -> bool {
        debug_assert!(cursor.size() % PAGE_SIZE == 0);

        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let mut unmapped = false;
        let mut index = PageTableLevel::Pt.index(cursor.vaddr());
        while index < ENTRY_COUNT && cursor.size() != 0 {
            // SAFETY: `table` is a live 512-entry frame; index < 512.
            let pte = unsafe { table.add(index) };
            if unsafe { pte.read_volatile() }.is_present() {
                self.unmap_entry(&mut flusher, PageTableLevel::Pt, cursor.vaddr(), pte, true);
                unmapped = true;
            }
            cursor.consume(PAGE_SIZE);
            index += 1;
        }
        unmapped
    }

    /// Rewrites flags of present mappings in the cursor's range at `level`
    /// and below. Holes are skipped; partially covered large pages are split
    /// (or dropped when the split cannot be allocated).
    fn update_mapping<A: FrameAllocator<Size4KiB>>(
        &self,
        table: *mut PtEntry,
        level: PageTableLevel,
        cursor: &mut MappingCursor,
        mmu_flags: MmuFlags,
        frames: &mut Frames<'_, A>,
    ) -> Result<(), PtError> {
        debug_assert!(self.scheme.check_vaddr(cursor.vaddr()));
        if level == PageTableLevel::Pt {
            return self.update_mapping_leaf(table, cursor, mmu_flags);
        }

        let term_flags = self.scheme.terminal_flags(level, mmu_flags);
        let ps = level.page_size();
        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let mut index = level.index(cursor.vaddr());
        while index < ENTRY_COUNT && cursor.size() != 0 {
            // SAFETY: `table` is a live 512-entry frame; index < 512.
            let pte = unsafe { table.add(index) };
            let mut pt_val = unsafe { pte.read_volatile() };

            // Holes are normal under demand paging; skip them.
            if !pt_val.is_present() {
                cursor.skip_entry(level);
                index += 1;
                continue;
            }

            if pt_val.is_large() {
                // Whole large page inside the range: rewrite in place,
                // keeping the physical frame.
                if level.is_aligned(cursor.vaddr().as_u64()) && cursor.size() >= ps {
                    let frame = pt_val.frame(level);
                    self.update_entry(
                        &mut flusher,
                        level,
                        cursor.vaddr(),
                        pte,
                        frame,
                        term_flags,
                        true,
                    );
                    cursor.consume(ps);
                    index += 1;
                    continue;
                }
                let slot_base = cursor.vaddr().align_down(ps);
                if self.split_large_page(level, slot_base, pte, frames).is_err() {
                    // Out of memory: drop the slot instead of changing
                    // permissions on more than was asked; a later fault
                    // rebuilds it.
                    self.unmap_entry(&mut flusher, level, cursor.vaddr(), pte, true);
                    cursor.skip_entry(level);
                    index += 1;
                    continue;
                }
                pt_val = unsafe { pte.read_volatile() };
            }

            let sub_table = self.table_ptr(pt_val.table_addr());
            self.update_mapping(sub_table, level.next_down(), cursor, mmu_flags, frames)?;
            index += 1;
        }
        Ok(())
    }

    /// PT base case of [`update_mapping`](Self::update_mapping).
    fn update_mapping_leaf(
        &self,
        table: *mut PtEntry,
        cursor: &mut MappingCursor,
        mmu_flags: MmuFlags,
    ) -> Result<(), PtError> {
        debug_assert!(cursor.size() % PAGE_SIZE == 0);
        let term_flags = self.scheme.terminal_flags(PageTableLevel::Pt, mmu_flags);

        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let mut index = PageTableLevel::Pt.index(cursor.vaddr());
        while index < ENTRY_COUNT && cursor.size() != 0 {
            // SAFETY: `table` is a live 512-entry frame; index < 512.
            let pte = unsafe { table.add(index) };
            let pt_val = unsafe { pte.read_volatile() };
            if pt_val.is_present() {
                let frame = pt_val.frame(PageTableLevel::Pt);
                self.update_entry(
                    &mut flusher,
                    PageTableLevel::Pt,
                    cursor.vaddr(),
                    pte,
                    frame,
                    term_flags,
                    true,
                );
            }
            cursor.consume(PAGE_SIZE);
            index += 1;
        }
        Ok(())
    }

    /// Splits the large entry at `pte` (slot base `vaddr`) into a fresh
    /// lower-level table of 512 terminal entries covering the same range.
    ///
    /// At PDPT the children keep the PS bit and stay 2 MiB entries; at PD
    /// they become 4 KiB entries.
    fn split_large_page<A: FrameAllocator<Size4KiB>>(
        &self,
        level: PageTableLevel,
        vaddr: VirtAddr,
        pte: *mut PtEntry,
        frames: &mut Frames<'_, A>,
    ) -> Result<(), PtError> {
        debug_assert!(level != PageTableLevel::Pt, "split at PT");
        debug_assert!(level.is_aligned(vaddr.as_u64()));
        // SAFETY: `pte` points into a live table frame owned by this
        // instance.
        let pt_val = unsafe { pte.read_volatile() };
        debug_assert!(pt_val.is_present() && pt_val.is_large());

        let frame = frames.alloc.allocate_frame().ok_or(PtError::NoMemory)?;
        let sub_phys = frame.start_address();
        self.zero_table(sub_phys);

        let paddr_base = pt_val.frame(level);
        let child_flags = self.scheme.split_flags(level, pt_val.large_flags());
        let lower = level.next_down();
        let child_ps = lower.page_size();

        let mut flusher = CacheLineFlusher::new(self.scheme.needs_cache_flushes());
        let sub_table = self.table_ptr(sub_phys);
        for i in 0..ENTRY_COUNT {
            // SAFETY: `sub_table` is the freshly zeroed frame; i < 512.
            let child = unsafe { sub_table.add(i) };
            self.update_entry(
                &mut flusher,
                lower,
                vaddr + i as u64 * child_ps,
                child,
                paddr_base + i as u64 * child_ps,
                child_flags,
                false,
            );
        }

        // Swap the large entry for a reference to the new table. This is the
        // moment the old terminal translation dies, hence was_terminal.
        self.update_entry(
            &mut flusher,
            level,
            vaddr,
            pte,
            sub_phys,
            self.scheme.intermediate_flags(),
            true,
        );
        *frames.pages += 1;
        Ok(())
    }

    /// Linear scan for any present entry.
    fn table_is_empty(table: *const PtEntry) -> bool {
        for i in 0..ENTRY_COUNT {
            // SAFETY: `table` is a live 512-entry frame; i < 512.
            if unsafe { table.add(i).read_volatile() }.is_present() {
                return false;
            }
        }
        true
    }
}
