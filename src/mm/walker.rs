//! AArch64 Translation Table Walker
//!
//! [`Mmu`] implementation for the ARM64 VMSA with a 4KB granule and four
//! levels. Table pages come from the frame allocator and are reached
//! through the kernel direct map.
//!
//! # Design
//! - Intermediate tables are created on demand and recorded in the
//!   [`TranslationRoot`] that owns them
//! - Empty intermediate tables are kept until the root is released
//! - The kernel half lives in TTBR1, so a user root never needs a copy of it

use alloc::sync::Arc;

use log::warn;

use super::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::error::{UsageError, VmError};
use super::frame::{FrameAllocator, PhysPage};
use super::layout::KernelLayout;
use super::paging::{MapFlags, Mmu, PageFlags, PageTable, PageTableEntry, TranslationRoot};

/// Invalidate the TLB entry for `virt` on all cores in the inner shareable domain.
#[inline]
fn invalidate_tlb(virt: VirtAddr) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: TLB maintenance only affects cached translations.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {addr}",
            "dsb ish",
            "isb",
            addr = in(reg) (virt.as_usize() >> 12) & 0xFFF_FFFF_FFFF,
        );
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = virt;
}

/// Software walker for ARM64 4-level translation tables.
pub struct TableWalker {
    frames: Arc<FrameAllocator>,
    layout: KernelLayout,
}

impl TableWalker {
    pub fn new(frames: Arc<FrameAllocator>, layout: KernelLayout) -> Self {
        Self { frames, layout }
    }

    /// Direct-map pointer to the table page at `phys`.
    fn table_ptr(&self, phys: PhysAddr) -> Result<*mut PageTable, VmError> {
        if !self.layout.is_direct_phys(phys, PAGE_SIZE) {
            return Err(UsageError::OutsideDirectMap.into());
        }
        // SAFETY: the direct map covers `phys`; the pointer is only
        // dereferenced while the owning root is held exclusively.
        Ok(unsafe { self.layout.phys_to_direct(phys).as_mut_ptr() })
    }

    /// Allocate and zero one table page.
    fn alloc_table(&self) -> Result<PhysPage, VmError> {
        let page = self.frames.allocate(0)?;
        match self.table_ptr(page.addr()) {
            Ok(table) => {
                // SAFETY: the page was just allocated, nothing else refers to it.
                unsafe { table.write(PageTable::new()) };
                Ok(page)
            }
            Err(err) => {
                self.frames.free(page)?;
                Err(err)
            }
        }
    }

    /// L3 entry for `virt`, creating missing intermediate tables.
    fn leaf_or_create(
        &self,
        root: &mut TranslationRoot,
        virt: VirtAddr,
    ) -> Result<*mut PageTableEntry, VmError> {
        let (l0, l1, l2, l3) = virt.page_table_indices();
        let mut table = self.table_ptr(root.root_phys())?;
        for index in [l0, l1, l2] {
            // SAFETY: `table` is a live table page owned by `root`, and
            // `&mut root` excludes every other walker of this hierarchy.
            let entry = unsafe { &mut (&mut *table)[index] };
            if !entry.is_valid() {
                let page = self.alloc_table()?;
                *entry = PageTableEntry::table(page.addr());
                root.adopt_table(page);
            }
            table = self.table_ptr(entry.addr())?;
        }
        // SAFETY: as above.
        Ok(unsafe { &mut (&mut *table)[l3] as *mut PageTableEntry })
    }

    /// L3 entry for `virt` if every intermediate table exists.
    fn leaf(&self, root: &TranslationRoot, virt: VirtAddr) -> Option<*mut PageTableEntry> {
        let (l0, l1, l2, l3) = virt.page_table_indices();
        let mut table = self.table_ptr(root.root_phys()).ok()?;
        for index in [l0, l1, l2] {
            // SAFETY: `table` is a live table page owned by `root`.
            let entry = unsafe { (&*table)[index] };
            if !entry.is_table() {
                return None;
            }
            table = self.table_ptr(entry.addr()).ok()?;
        }
        // SAFETY: as above.
        Some(unsafe { &mut (&mut *table)[l3] as *mut PageTableEntry })
    }
}

impl Mmu for TableWalker {
    fn new_root(&self) -> Result<TranslationRoot, VmError> {
        Ok(TranslationRoot::new(self.alloc_table()?))
    }

    fn install_kernel_mappings(&self, _root: &mut TranslationRoot) -> Result<(), VmError> {
        // Kernel translations are reached through TTBR1
        Ok(())
    }

    fn map_pages(
        &self,
        root: &mut TranslationRoot,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: MapFlags,
    ) -> Result<(), VmError> {
        if !virt.is_aligned() || !phys.is_aligned() {
            return Err(VmError::InvalidArgument);
        }
        let attrs = PageFlags::for_leaf(flags);
        for n in 0..count {
            let va = virt.add(n * PAGE_SIZE);
            let leaf = self.leaf_or_create(root, va)?;
            // SAFETY: `leaf` points into a table owned by `root`.
            unsafe { *leaf = PageTableEntry::page(phys.add(n * PAGE_SIZE), attrs) };
            invalidate_tlb(va);
        }
        Ok(())
    }

    fn unmap_pages(&self, root: &mut TranslationRoot, virt: VirtAddr, count: usize) {
        for n in 0..count {
            let va = virt.add(n * PAGE_SIZE);
            if let Some(leaf) = self.leaf(root, va) {
                // SAFETY: `leaf` points into a table owned by `root`.
                unsafe { (&mut *leaf).clear() };
                invalidate_tlb(va);
            }
        }
    }

    fn translate(&self, root: &TranslationRoot, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)> {
        let leaf = self.leaf(root, virt.align_down())?;
        // SAFETY: `leaf` points into a table owned by `root`.
        let entry = unsafe { *leaf };
        if !entry.is_valid() {
            return None;
        }
        Some((entry.addr(), entry.flags().to_map_flags()))
    }

    fn release_root(&self, root: &mut TranslationRoot) {
        for page in root.take_tables() {
            if let Err(err) = self.frames.free(page) {
                warn!(target: "mm::frame", "releasing table {:?}: {}", page, err);
            }
        }
    }
}
