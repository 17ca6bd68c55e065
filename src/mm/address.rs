//! Physical and Virtual Address Types
//!
//! Newtypes for physical and virtual addresses plus the page-aligned
//! [`VirtRange`] used by the address-space interval map.
//!
//! # Security Properties
//! - Physical addresses cannot be dereferenced; they must first go through
//!   the kernel mapper
//! - Ranges are always page-aligned and non-empty, so region bookkeeping
//!   never has to deal with partial pages

use core::fmt;

use super::error::VmError;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table (512 for 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of buddy orders. The largest block is `PAGE_SIZE << (MAX_ORDER - 1)` (4 MiB).
pub const MAX_ORDER: usize = 11;

/// Kernel virtual address base (higher-half, TTBR1)
pub const KERNEL_VIRT_BASE: usize = 0xFFFF_0000_0000_0000;

/// Physical memory base for QEMU virt machine
pub const PHYS_MEM_BASE: usize = 0x4000_0000;

/// Size of the physical window reachable through the direct map
pub const DIRECT_MAP_SIZE: usize = 0x1_0000_0000;

/// Start of the kernel window used for tracked (non-direct) mappings
pub const KERNEL_DYNAMIC_BASE: usize = 0xFFFF_8000_0000_0000;

/// Size of the tracked kernel mapping window
pub const KERNEL_DYNAMIC_SIZE: usize = 0x4000_0000;

/// First address handed out to anonymous user mappings
pub const USER_MAPPING_BASE: usize = 0x0000_0010_0000_0000;

/// End (exclusive) of the user half of the address space
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Round a byte count up to whole pages.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    (bytes >> PAGE_SHIFT) + (bytes & PAGE_MASK != 0) as usize
}

/// A physical memory address.
///
/// Never dereferenced directly; the kernel mapper turns it into a
/// [`VirtAddr`] first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    ///
    /// # Panics
    /// Panics in debug mode if the address uses more than 48 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        debug_assert!(addr <= 0x0000_FFFF_FFFF_FFFF);
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Raw value for page table descriptors.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A virtual memory address.
///
/// Canonical addresses have bits 63..48 all clear (user half, TTBR0) or
/// all set (kernel half, TTBR1). The value is kept exactly as given.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// True if `addr` selects one of the two translation halves.
    #[inline]
    pub const fn is_canonical(addr: usize) -> bool {
        let top = addr >> 48;
        top == 0 || top == 0xFFFF
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn align_down(self) -> Self {
        Self::new(self.0 & !PAGE_MASK)
    }

    #[inline]
    pub const fn align_up(self) -> Self {
        Self::new(self.0.wrapping_add(PAGE_MASK) & !PAGE_MASK)
    }

    /// Page table indices for this address.
    ///
    /// Returns (L0, L1, L2, L3) indices for 4-level paging.
    #[inline]
    pub const fn page_table_indices(self) -> (usize, usize, usize, usize) {
        let addr = self.0;
        (
            (addr >> 39) & 0x1FF,
            (addr >> 30) & 0x1FF,
            (addr >> 21) & 0x1FF,
            (addr >> 12) & 0x1FF,
        )
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self::new(self.0.wrapping_add(offset))
    }

    /// Distance in bytes from `base` up to this address.
    ///
    /// # Panics
    /// Panics in debug mode if `base` lies above `self`.
    #[inline]
    pub const fn offset_from(self, base: VirtAddr) -> usize {
        debug_assert!(base.0 <= self.0);
        self.0 - base.0
    }

    /// Check if this is a kernel address (higher-half).
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VIRT_BASE
    }

    /// Convert to a mutable raw pointer.
    ///
    /// # Safety
    /// The caller must ensure the address is mapped for the lifetime of
    /// every access made through the pointer.
    #[inline]
    pub const unsafe fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A page-aligned, non-empty, half-open virtual interval `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtRange {
    start: VirtAddr,
    end: VirtAddr,
}

impl VirtRange {
    /// Build a range of `len` bytes starting at `start`.
    ///
    /// # Errors
    /// `InvalidArgument` if `start` or `len` is not page-aligned, `len` is
    /// zero, or the range would wrap around the address space or leave the
    /// half `start` lies in.
    pub fn new(start: VirtAddr, len: usize) -> Result<Self, VmError> {
        if !start.is_aligned() || len == 0 || len & PAGE_MASK != 0 {
            return Err(VmError::InvalidArgument);
        }
        let end = start
            .as_usize()
            .checked_add(len)
            .ok_or(VmError::InvalidArgument)?;
        let last = end - 1;
        if !VirtAddr::is_canonical(start.as_usize()) || last >> 48 != start.as_usize() >> 48 {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self {
            start,
            end: VirtAddr::new(end),
        })
    }

    /// Build a range from its bounds.
    pub fn from_bounds(start: VirtAddr, end: VirtAddr) -> Result<Self, VmError> {
        if end <= start {
            return Err(VmError::InvalidArgument);
        }
        Self::new(start, end.as_usize() - start.as_usize())
    }

    #[inline]
    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    #[inline]
    pub const fn end(&self) -> VirtAddr {
        self.end
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    /// Always false; ranges are non-empty by construction.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub const fn page_count(&self) -> usize {
        self.len() >> PAGE_SHIFT
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True if `other` lies entirely within this range.
    #[inline]
    pub fn covers(&self, other: &VirtRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[inline]
    pub fn overlaps(&self, other: &VirtRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Iterate over the page addresses in the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        let start = self.start;
        (0..self.page_count()).map(move |n| start.add(n << PAGE_SHIFT))
    }
}

impl fmt::Debug for VirtRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start.as_usize(), self.end.as_usize())
    }
}
