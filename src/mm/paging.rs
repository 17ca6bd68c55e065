//! ARM64 Page Table Types and the Mapping Primitive
//!
//! Descriptor encodings for the ARM64 VMSA plus the [`Mmu`] trait the rest
//! of the memory subsystem uses to publish translations.
//!
//! # Page Table Structure (4KB granule)
//! - L0: 512 entries, each covers 512GB
//! - L1: 512 entries, each covers 1GB
//! - L2: 512 entries, each covers 2MB
//! - L3: 512 entries, each covers 4KB
//!
//! # Security Properties
//! - Descriptors are only built from [`MapFlags`], never from raw bits
//! - User pages are always privileged-execute-never and not global
//! - Kernel pages are always user-execute-never

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysAddr, VirtAddr, ENTRIES_PER_TABLE};
use super::error::VmError;
use super::frame::PhysPage;

bitflags! {
    /// Architecture-neutral permissions for one translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Accessible from EL0
        const USER = 1 << 3;
        /// Device-nGnRE memory instead of normal cacheable memory
        const DEVICE = 1 << 4;
    }
}

impl MapFlags {
    /// Kernel read/write data.
    pub const KERNEL_DATA: MapFlags = MapFlags::READ.union(MapFlags::WRITE);
}

/// ARM64 stage 1 descriptor attribute bits.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageFlags(u64);

impl PageFlags {
    /// Table descriptor (L0-L2), page descriptor (L3).
    pub const TABLE: Self = Self(0b11);
    pub const PAGE: Self = Self(0b11);

    /// AttrIndx [4:2], selects the MAIR entry.
    pub const ATTR_NORMAL: Self = Self(0 << 2);
    pub const ATTR_DEVICE: Self = Self(1 << 2);
    const ATTR_MASK: u64 = 0b111 << 2;

    /// AP[2:1] [7:6]
    pub const AP_RW_EL1: Self = Self(0b00 << 6);
    pub const AP_RW_ALL: Self = Self(0b01 << 6);
    pub const AP_RO_EL1: Self = Self(0b10 << 6);
    pub const AP_RO_ALL: Self = Self(0b11 << 6);
    const AP_EL0: u64 = 0b01 << 6;
    const AP_RO: u64 = 0b10 << 6;

    /// Inner shareable [9:8]
    pub const SH_INNER: Self = Self(0b11 << 8);

    /// Access flag [10]; set up front so the first access does not trap.
    pub const AF: Self = Self(1 << 10);

    /// Not global [11], tagged with the ASID.
    pub const NG: Self = Self(1 << 11);

    /// Privileged execute-never [53]
    pub const PXN: Self = Self(1 << 53);

    /// Unprivileged execute-never [54]
    pub const UXN: Self = Self(1 << 54);

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Leaf attributes for a translation with `flags`.
    pub fn for_leaf(flags: MapFlags) -> Self {
        let user = flags.contains(MapFlags::USER);
        let write = flags.contains(MapFlags::WRITE);
        let exec = flags.contains(MapFlags::EXECUTE);

        let mut bits = Self::PAGE.0 | Self::AF.0;
        if flags.contains(MapFlags::DEVICE) {
            bits |= Self::ATTR_DEVICE.0;
        } else {
            bits |= Self::ATTR_NORMAL.0 | Self::SH_INNER.0;
        }
        bits |= match (user, write) {
            (true, true) => Self::AP_RW_ALL.0,
            (true, false) => Self::AP_RO_ALL.0,
            (false, true) => Self::AP_RW_EL1.0,
            (false, false) => Self::AP_RO_EL1.0,
        };
        if user {
            bits |= Self::NG.0 | Self::PXN.0;
            if !exec {
                bits |= Self::UXN.0;
            }
        } else {
            bits |= Self::UXN.0;
            if !exec {
                bits |= Self::PXN.0;
            }
        }
        Self(bits)
    }

    /// Decode leaf attributes back into [`MapFlags`].
    pub fn to_map_flags(self) -> MapFlags {
        let mut flags = MapFlags::READ;
        let user = self.0 & Self::AP_EL0 != 0;
        if user {
            flags |= MapFlags::USER;
        }
        if self.0 & Self::AP_RO == 0 {
            flags |= MapFlags::WRITE;
        }
        let xn = if user { Self::UXN } else { Self::PXN };
        if !self.contains(xn) {
            flags |= MapFlags::EXECUTE;
        }
        if self.0 & Self::ATTR_MASK == Self::ATTR_DEVICE.0 {
            flags |= MapFlags::DEVICE;
        }
        flags
    }
}

impl core::fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageFlags({:#018x})", self.0)
    }
}

/// A single page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Output address bits [47:12].
    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Entry pointing to the next level table.
    #[inline]
    pub const fn table(next_table_phys: PhysAddr) -> Self {
        debug_assert!(next_table_phys.is_aligned());
        Self((next_table_phys.as_u64() & Self::ADDR_MASK) | PageFlags::TABLE.bits())
    }

    /// L3 entry mapping one page.
    #[inline]
    pub const fn page(phys: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(phys.is_aligned());
        Self((phys.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// True for a table descriptor at L0-L2.
    #[inline]
    pub const fn is_table(self) -> bool {
        self.0 & 0b11 == 0b11
    }

    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new((self.0 & Self::ADDR_MASK) as usize)
    }

    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags(self.0 & !Self::ADDR_MASK)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "PTE(addr={}, flags={:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// One level of the 4-level hierarchy: 512 entries, 4KB aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Root of one translation hierarchy and the table pages it owns.
#[derive(Debug)]
pub struct TranslationRoot {
    root: PhysAddr,
    tables: Vec<PhysPage>,
}

impl TranslationRoot {
    /// Wrap a freshly allocated, zeroed root table page.
    pub fn new(root: PhysPage) -> Self {
        let mut tables = Vec::new();
        tables.push(root);
        Self {
            root: root.addr(),
            tables,
        }
    }

    /// Physical address to load into TTBR0/TTBR1.
    #[inline]
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// Every page table page owned by this root, root first.
    #[inline]
    pub fn table_pages(&self) -> &[PhysPage] {
        &self.tables
    }

    /// Record a table page allocated while mapping.
    pub fn adopt_table(&mut self, page: PhysPage) {
        self.tables.push(page);
    }

    /// Hand over every owned table page; the root is unusable afterwards.
    pub fn take_tables(&mut self) -> Vec<PhysPage> {
        core::mem::take(&mut self.tables)
    }
}

/// Architecture mapping primitive.
///
/// Callers serialize access to one [`TranslationRoot`] through `&mut`;
/// implementations only need to be safe across distinct roots.
pub trait Mmu: Send + Sync {
    /// Allocate an empty translation root.
    fn new_root(&self) -> Result<TranslationRoot, VmError>;

    /// Make the kernel's own mappings visible through `root`.
    fn install_kernel_mappings(&self, root: &mut TranslationRoot) -> Result<(), VmError>;

    /// Map `count` pages starting at `virt` to `phys`, replacing any
    /// existing leaf translations.
    fn map_pages(
        &self,
        root: &mut TranslationRoot,
        virt: VirtAddr,
        phys: PhysAddr,
        count: usize,
        flags: MapFlags,
    ) -> Result<(), VmError>;

    /// Remove `count` translations starting at `virt`. Holes are skipped.
    fn unmap_pages(&self, root: &mut TranslationRoot, virt: VirtAddr, count: usize);

    /// Look up the translation for the page containing `virt`.
    fn translate(&self, root: &TranslationRoot, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)>;

    /// Free every table page owned by `root`.
    fn release_root(&self, root: &mut TranslationRoot);
}
