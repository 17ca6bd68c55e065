//! Kernel Address Mapper
//!
//! Gives the kernel CPU-addressable views of physical memory.
//!
//! # Design
//! - Physical ranges inside the direct map translate by a fixed offset and
//!   need no bookkeeping
//! - Everything else is placed first-fit in the dynamic window and recorded
//!   in a table sorted by virtual address
//! - Dynamic mappings are removed only by an exact `(virt, length)` match
//!
//! # Security Properties
//! - Re-mapping an identical physical range is refused, so one range never
//!   has two dynamic aliases
//! - [`KernelWindow`] unmaps on drop; a mapping cannot outlive its user

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use log::{debug, trace, warn};
use spin::Mutex;

use super::address::{pages_for, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use super::error::{UsageError, VmError};
use super::layout::KernelLayout;
use super::paging::{MapFlags, Mmu, TranslationRoot};

/// One dynamic kernel mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelMapping {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub pages: usize,
    pub flags: MapFlags,
}

impl KernelMapping {
    #[inline]
    fn end(&self) -> VirtAddr {
        self.virt.add(self.pages << PAGE_SHIFT)
    }

    #[inline]
    fn contains(&self, virt: VirtAddr) -> bool {
        self.virt <= virt && virt < self.end()
    }
}

/// Maps physical memory into the kernel half.
pub struct KernelMapper {
    layout: KernelLayout,
    mmu: Arc<dyn Mmu>,
    /// Sorted by virtual address. Lock order: `mappings`, then `root`.
    mappings: Mutex<Vec<KernelMapping>>,
    root: Mutex<TranslationRoot>,
}

impl KernelMapper {
    /// Create the mapper together with the kernel translation root.
    pub fn new(layout: KernelLayout, mmu: Arc<dyn Mmu>) -> Result<Self, VmError> {
        let root = mmu.new_root()?;
        Ok(Self {
            layout,
            mmu,
            mappings: Mutex::new(Vec::new()),
            root: Mutex::new(root),
        })
    }

    #[inline]
    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// Physical address of the kernel translation root (TTBR1).
    pub fn root_phys(&self) -> PhysAddr {
        self.root.lock().root_phys()
    }

    /// Map `length` bytes at `phys` into the kernel.
    ///
    /// # Arguments
    /// * `phys` - Start of the physical range, need not be page-aligned
    /// * `length` - Bytes to map
    /// * `flags` - Permissions of the new translations
    ///
    /// # Returns
    /// Kernel virtual address of `phys`, keeping its offset in the page.
    ///
    /// # Errors
    /// - `InvalidArgument` for a zero length or one that overflows the address space
    /// - `OutOfMemory` if the dynamic window or the record table is full
    /// - `Usage(AlreadyMapped)` if exactly this range already has a dynamic mapping
    pub fn map(&self, phys: PhysAddr, length: usize, flags: MapFlags) -> Result<VirtAddr, VmError> {
        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let pa = phys.align_down();
        let pages = length
            .checked_add(phys.page_offset())
            .map(pages_for)
            .ok_or(VmError::InvalidArgument)?;
        let size = pages.checked_mul(PAGE_SIZE).ok_or(VmError::InvalidArgument)?;

        if self.layout.is_direct_phys(pa, size) {
            let va = self.layout.phys_to_direct(pa);
            self.mmu.map_pages(&mut self.root.lock(), va, pa, pages, flags)?;
            return Ok(va.add(phys.page_offset()));
        }

        let mut mappings = self.mappings.lock();
        if mappings.iter().any(|m| m.phys == pa && m.pages == pages) {
            warn!(target: "mm::kmap", "{} ({} pages) is already mapped", pa, pages);
            return Err(UsageError::AlreadyMapped.into());
        }
        if mappings.len() >= self.layout.max_dynamic_mappings {
            warn!(target: "mm::kmap", "out of mapping records");
            return Err(VmError::OutOfMemory);
        }

        // First fit, packing each candidate right behind the previous mapping
        let mut va = self.layout.dynamic_virt_start;
        let mut slot = mappings.len();
        for (n, mapping) in mappings.iter().enumerate() {
            if va.as_usize().saturating_add(size) <= mapping.virt.as_usize() {
                slot = n;
                break;
            }
            va = mapping.end();
        }
        if va.as_usize().saturating_add(size) > self.layout.dynamic_virt_end.as_usize() {
            warn!(target: "mm::kmap", "no {} page window left for {}", pages, pa);
            return Err(VmError::OutOfMemory);
        }

        self.mmu.map_pages(&mut self.root.lock(), va, pa, pages, flags)?;
        mappings.insert(
            slot,
            KernelMapping {
                virt: va,
                phys: pa,
                pages,
                flags,
            },
        );
        debug!(target: "mm::kmap", "mapped {} -> {} ({} pages)", pa, va, pages);
        Ok(va.add(phys.page_offset()))
    }

    /// Remove a mapping made by [`Self::map`].
    ///
    /// # Errors
    /// - `InvalidArgument` if `length` overflows the address space
    /// - `Usage(UnmapMismatch)` if a dynamic address does not match a
    ///   recorded mapping in both start and length
    pub fn unmap(&self, virt: VirtAddr, length: usize) -> Result<(), VmError> {
        let va = virt.align_down();
        let pages = length
            .checked_add(virt.page_offset())
            .map(pages_for)
            .ok_or(VmError::InvalidArgument)?;

        if self.layout.is_direct_virt(va) {
            self.mmu.unmap_pages(&mut self.root.lock(), va, pages);
            return Ok(());
        }

        let mut mappings = self.mappings.lock();
        let Some(n) = mappings
            .iter()
            .position(|m| m.virt == va && m.pages == pages)
        else {
            warn!(target: "mm::kmap", "unmap of {} ({} pages) matches nothing", va, pages);
            return Err(UsageError::UnmapMismatch.into());
        };
        mappings.remove(n);
        self.mmu.unmap_pages(&mut self.root.lock(), va, pages);
        debug!(target: "mm::kmap", "unmapped {} ({} pages)", va, pages);
        Ok(())
    }

    /// Physical address behind a kernel virtual address.
    ///
    /// # Errors
    /// `Usage(NotMapped)` if `virt` is neither direct-mapped nor inside a
    /// dynamic mapping.
    pub fn translate_to_physical(&self, virt: VirtAddr) -> Result<PhysAddr, VmError> {
        if let Some(phys) = self.layout.direct_to_phys(virt) {
            return Ok(phys);
        }
        self.mappings
            .lock()
            .iter()
            .find(|m| m.contains(virt))
            .map(|m| m.phys.add(virt.offset_from(m.virt)))
            .ok_or(VmError::Usage(UsageError::NotMapped))
    }

    /// Snapshot of the dynamic mappings, sorted by virtual address.
    pub fn mappings(&self) -> Vec<KernelMapping> {
        self.mappings.lock().clone()
    }

    /// Map `pages` pages at `phys` read/write for the lifetime of the guard.
    pub fn window(&self, phys: PhysAddr, pages: usize) -> Result<KernelWindow<'_>, VmError> {
        debug_assert!(phys.is_aligned());
        let len = pages << PAGE_SHIFT;
        let virt = self.map(phys, len, MapFlags::KERNEL_DATA)?;
        trace!(target: "mm::kmap", "window {} at {}", phys, virt);
        Ok(KernelWindow {
            mapper: self,
            virt,
            len,
        })
    }

    /// Fill one page with zeroes.
    pub fn zero_page(&self, phys: PhysAddr) -> Result<(), VmError> {
        self.window(phys, 1)?.fill(0);
        Ok(())
    }

    /// Copy the first `len` bytes of page `src` into page `dst` and zero
    /// the rest of `dst`.
    pub fn copy_page(&self, src: PhysAddr, dst: PhysAddr, len: usize) -> Result<(), VmError> {
        if src == dst || len > PAGE_SIZE {
            return Err(VmError::InvalidArgument);
        }
        let from = self.window(src, 1)?;
        let mut to = self.window(dst, 1)?;
        to[..len].copy_from_slice(&from[..len]);
        to[len..].fill(0);
        Ok(())
    }
}

/// A temporary read/write kernel view of physical pages.
pub struct KernelWindow<'a> {
    mapper: &'a KernelMapper,
    virt: VirtAddr,
    len: usize,
}

impl KernelWindow<'_> {
    #[inline]
    pub fn virt(&self) -> VirtAddr {
        self.virt
    }
}

impl Deref for KernelWindow<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `virt..virt+len` stays mapped until the window drops, and
        // callers never hold two windows on the same frame.
        unsafe { core::slice::from_raw_parts(self.virt.as_mut_ptr::<u8>(), self.len) }
    }
}

impl DerefMut for KernelWindow<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `deref`, and `&mut self` makes this the only view.
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_mut_ptr::<u8>(), self.len) }
    }
}

impl Drop for KernelWindow<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mapper.unmap(self.virt, self.len) {
            warn!(target: "mm::kmap", "closing window at {}: {}", self.virt, err);
        }
    }
}
