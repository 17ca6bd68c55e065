//! Kernel virtual layout
//!
//! Describes the two kernel windows the mapper works with: the direct map,
//! where a physical address translates by a fixed offset, and the dynamic
//! window, where mappings are tracked individually.

use super::address::{
    PhysAddr, VirtAddr, DIRECT_MAP_SIZE, KERNEL_DYNAMIC_BASE, KERNEL_DYNAMIC_SIZE,
    KERNEL_VIRT_BASE, PAGE_SIZE, PHYS_MEM_BASE,
};

/// Kernel address layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    /// First physical address reachable through the direct map
    pub direct_phys_start: PhysAddr,
    /// End (exclusive) of the direct-mapped physical range
    pub direct_phys_end: PhysAddr,
    /// Virtual address of `direct_phys_start`
    pub direct_virt_base: VirtAddr,
    /// Start of the dynamic window
    pub dynamic_virt_start: VirtAddr,
    /// End (exclusive) of the dynamic window
    pub dynamic_virt_end: VirtAddr,
    /// Capacity of the dynamic mapping table
    pub max_dynamic_mappings: usize,
}

impl KernelLayout {
    /// QEMU virt layout: RAM at 1 GiB mapped at the base of TTBR1.
    pub const DEFAULT: KernelLayout = KernelLayout {
        direct_phys_start: PhysAddr::new(PHYS_MEM_BASE),
        direct_phys_end: PhysAddr::new(PHYS_MEM_BASE + DIRECT_MAP_SIZE),
        direct_virt_base: VirtAddr::new(KERNEL_VIRT_BASE),
        dynamic_virt_start: VirtAddr::new(KERNEL_DYNAMIC_BASE),
        dynamic_virt_end: VirtAddr::new(KERNEL_DYNAMIC_BASE + KERNEL_DYNAMIC_SIZE),
        max_dynamic_mappings: PAGE_SIZE / 32,
    };

    #[inline]
    fn direct_len(&self) -> usize {
        self.direct_phys_end.as_usize() - self.direct_phys_start.as_usize()
    }

    /// True if `[phys, phys + len)` lies entirely inside the direct map.
    pub fn is_direct_phys(&self, phys: PhysAddr, len: usize) -> bool {
        phys >= self.direct_phys_start
            && phys
                .as_usize()
                .checked_add(len)
                .is_some_and(|end| end <= self.direct_phys_end.as_usize())
    }

    /// True if `virt` falls inside the direct map.
    pub fn is_direct_virt(&self, virt: VirtAddr) -> bool {
        virt >= self.direct_virt_base
            && virt.as_usize() - self.direct_virt_base.as_usize() < self.direct_len()
    }

    /// Direct-map address of `phys`. The caller checks [`Self::is_direct_phys`].
    #[inline]
    pub fn phys_to_direct(&self, phys: PhysAddr) -> VirtAddr {
        debug_assert!(self.is_direct_phys(phys, 0));
        self.direct_virt_base
            .add(phys.as_usize() - self.direct_phys_start.as_usize())
    }

    /// Inverse of [`Self::phys_to_direct`]; `None` outside the direct map.
    pub fn direct_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        if !self.is_direct_virt(virt) {
            return None;
        }
        Some(
            self.direct_phys_start
                .add(virt.as_usize() - self.direct_virt_base.as_usize()),
        )
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
