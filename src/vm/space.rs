//! Address Spaces
//!
//! An [`AddressSpace`] is an ordered set of non-overlapping
//! [`MappedRegion`]s plus the translation root that realises them.
//!
//! # Design
//! - One lock per address space guards the region map and the root
//! - Regions are keyed by start address; a lookup is a predecessor search
//! - Freeing part of a region splits it, carrying resident pages along
//! - Lock order: address space, then page cache, then page
//!
//! # Example
//! ```ignore
//! let space = AddressSpace::new(ctx)?;
//! let heap = space.map_anonymous(16 * PAGE_SIZE, AreaFlags::READ | AreaFlags::WRITE | AreaFlags::USER)?;
//! space.handle_fault(heap.start(), AccessFlags::WRITE)?;
//! ```

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{max, min};

use log::{debug, trace};
use spin::{Mutex, MutexGuard};

use super::backing::BackingObject;
use super::fault::translation_flags;
use super::flags::AreaFlags;
use super::page::{PageState, ResidentPage};
use super::region::{Backing, MappedRegion, RegionId};
use crate::mm::address::{
    PhysAddr, VirtAddr, VirtRange, PAGE_SHIFT, PAGE_SIZE, USER_MAPPING_BASE, USER_SPACE_END,
};
use crate::mm::error::VmError;
use crate::mm::paging::{MapFlags, TranslationRoot};
use crate::mm::MemoryContext;

/// Snapshot of one region, as reported by [`AddressSpace::regions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub range: VirtRange,
    pub flags: AreaFlags,
    pub resident_pages: usize,
    /// `(offset, length)` of the backing window, for object mappings
    pub backing: Option<(u64, u64)>,
}

impl RegionInfo {
    fn of(region: &MappedRegion) -> Self {
        Self {
            id: region.id(),
            range: region.range(),
            flags: region.flags(),
            resident_pages: region.resident_count(),
            backing: region.backing().map(|b| (b.offset, b.length)),
        }
    }
}

pub(super) struct SpaceInner {
    pub(super) regions: BTreeMap<VirtAddr, MappedRegion>,
    pub(super) root: TranslationRoot,
    next_mapping: VirtAddr,
    base: VirtAddr,
}

/// The region containing `addr`.
pub(super) fn region_at_mut(
    regions: &mut BTreeMap<VirtAddr, MappedRegion>,
    addr: VirtAddr,
) -> Option<&mut MappedRegion> {
    regions
        .range_mut(..=addr)
        .next_back()
        .map(|(_, region)| region)
        .filter(|region| region.range().contains(addr))
}

impl SpaceInner {
    fn region_at(&self, addr: VirtAddr) -> Option<&MappedRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.range().contains(addr))
    }

    /// Start keys of every region overlapping `range`.
    fn overlapping(&self, range: &VirtRange) -> Vec<VirtAddr> {
        self.regions
            .range(..range.end())
            .rev()
            .take_while(|(_, region)| region.range().end() > range.start())
            .map(|(key, _)| *key)
            .collect()
    }

    fn insert(&mut self, region: MappedRegion) {
        debug_assert!(self.overlapping(&region.range()).is_empty());
        self.regions.insert(region.range().start(), region);
    }

    /// Remove the region starting at `key` together with its translations.
    fn remove(&mut self, ctx: &MemoryContext, key: VirtAddr) -> Option<MappedRegion> {
        let region = self.regions.remove(&key)?;
        let range = region.range();
        ctx.mmu
            .unmap_pages(&mut self.root, range.start(), range.page_count());
        Some(region)
    }

    /// Unmap `range`, dropping whole regions and splitting partial ones.
    fn free_range(&mut self, ctx: &MemoryContext, range: VirtRange) {
        for key in self.overlapping(&range) {
            let Some(mut region) = self.regions.remove(&key) else {
                continue;
            };
            let whole = region.range();
            let cut_start = max(whole.start(), range.start());
            let cut_end = min(whole.end(), range.end());
            ctx.mmu.unmap_pages(
                &mut self.root,
                cut_start,
                cut_end.offset_from(cut_start) >> PAGE_SHIFT,
            );

            if whole.start() < range.start() {
                if let Ok(head) = VirtRange::from_bounds(whole.start(), range.start()) {
                    let head = region.carve(head);
                    self.insert(head);
                }
            }
            if range.end() < whole.end() {
                if let Ok(tail) = VirtRange::from_bounds(range.end(), whole.end()) {
                    let tail = region.carve(tail);
                    self.insert(tail);
                }
            }
            trace!(target: "vm::space", "freed {:?} of region {:?}", range, region.id());
        }
    }

    /// First gap of `len` bytes at or above `from`.
    fn find_gap(&self, from: VirtAddr, len: usize) -> Result<VirtAddr, VmError> {
        let mut start = from.as_usize();
        for region in self.regions.values().map(MappedRegion::range) {
            if region.end().as_usize() <= start {
                continue;
            }
            if start.checked_add(len).ok_or(VmError::OutOfMemory)? <= region.start().as_usize() {
                break;
            }
            start = region.end().as_usize();
        }
        match start.checked_add(len) {
            Some(end) if end <= USER_SPACE_END => Ok(VirtAddr::new(start)),
            _ => Err(VmError::OutOfMemory),
        }
    }

    fn highest_end(&self) -> VirtAddr {
        self.regions
            .values()
            .next_back()
            .map_or(self.base, |region| region.range().end())
    }
}

/// A process virtual address space.
pub struct AddressSpace {
    pub(super) ctx: MemoryContext,
    pub(super) inner: Mutex<SpaceInner>,
}

impl AddressSpace {
    /// Create an empty address space with anonymous mappings placed from
    /// [`USER_MAPPING_BASE`].
    pub fn new(ctx: MemoryContext) -> Result<Self, VmError> {
        Self::with_mapping_base(ctx, VirtAddr::new(USER_MAPPING_BASE))
    }

    /// Create an empty address space placing anonymous mappings from `base`.
    pub fn with_mapping_base(ctx: MemoryContext, base: VirtAddr) -> Result<Self, VmError> {
        let base = base.align_up();
        let mut root = ctx.mmu.new_root()?;
        if let Err(err) = ctx.mmu.install_kernel_mappings(&mut root) {
            ctx.mmu.release_root(&mut root);
            return Err(err);
        }
        debug!(target: "vm::space", "new address space, root {}", root.root_phys());
        Ok(Self {
            ctx,
            inner: Mutex::new(SpaceInner {
                regions: BTreeMap::new(),
                root,
                next_mapping: base,
                base,
            }),
        })
    }

    #[inline]
    pub fn context(&self) -> &MemoryContext {
        &self.ctx
    }

    /// Physical address of the top-level translation table.
    pub fn root_phys(&self) -> PhysAddr {
        self.inner.lock().root.root_phys()
    }

    /// Where the next anonymous mapping search starts.
    pub fn next_mapping(&self) -> VirtAddr {
        self.inner.lock().next_mapping
    }

    /// Map `range` with `flags`, replacing whatever was mapped there.
    ///
    /// With `phys`, the range is translated immediately to the physical
    /// run starting there using `map_flags`. Without it, the region is empty
    /// and its pages are supplied by the fault handler if `flags` has `FAULT`.
    pub fn map(
        &self,
        range: VirtRange,
        phys: Option<PhysAddr>,
        flags: AreaFlags,
        map_flags: MapFlags,
    ) -> Result<RegionId, VmError> {
        let mut inner = self.inner.lock();
        self.map_locked(&mut inner, range, phys, flags, map_flags, None)
    }

    fn map_locked(
        &self,
        inner: &mut SpaceInner,
        range: VirtRange,
        phys: Option<PhysAddr>,
        flags: AreaFlags,
        map_flags: MapFlags,
        backing: Option<Backing>,
    ) -> Result<RegionId, VmError> {
        if phys.is_some_and(|phys| !phys.is_aligned()) {
            return Err(VmError::InvalidArgument);
        }
        inner.free_range(&self.ctx, range);

        let region = MappedRegion::new(range, flags, backing);
        let id = region.id();
        if let Some(phys) = phys {
            let mapped = self.ctx.mmu.map_pages(
                &mut inner.root,
                range.start(),
                phys,
                range.page_count(),
                map_flags,
            );
            if let Err(err) = mapped {
                self.ctx
                    .mmu
                    .unmap_pages(&mut inner.root, range.start(), range.page_count());
                return Err(err);
            }
        }
        trace!(
            target: "vm::space",
            "map {:?} {} as {:?}",
            range,
            flags.letters(),
            id
        );
        inner.insert(region);
        Ok(id)
    }

    /// Map `length` bytes of `object` from `offset` at `range`.
    ///
    /// The range is trimmed to the part of the object that exists, rounded
    /// up to a page. Pages are read on first access.
    ///
    /// # Errors
    /// `InvalidArgument` if `offset` is not page-aligned or lies at or
    /// beyond the end of the object.
    pub fn map_to_object(
        &self,
        range: VirtRange,
        object: Arc<dyn BackingObject>,
        offset: u64,
        length: u64,
        flags: AreaFlags,
    ) -> Result<RegionId, VmError> {
        let size = object.length();
        if offset % PAGE_SIZE as u64 != 0 || offset >= size {
            return Err(VmError::InvalidArgument);
        }
        let available = size - offset;
        let rounded = available.saturating_add(PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let len = min(range.len() as u64, rounded) as usize;
        let range = VirtRange::new(range.start(), len)?;
        let backing = Backing {
            object,
            offset,
            length: min(length, available),
        };

        let mut inner = self.inner.lock();
        self.map_locked(
            &mut inner,
            range,
            None,
            flags | AreaFlags::FAULT,
            MapFlags::empty(),
            Some(backing),
        )
    }

    /// Map `len` bytes of zero-filled memory in the first free gap at or
    /// above the mapping cursor, and advance the cursor past it.
    pub fn map_anonymous(&self, len: usize, flags: AreaFlags) -> Result<VirtRange, VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = len
            .checked_add(PAGE_SIZE - 1)
            .ok_or(VmError::InvalidArgument)?
            & !(PAGE_SIZE - 1);

        let mut inner = self.inner.lock();
        let start = inner.find_gap(inner.next_mapping, len)?;
        let range = VirtRange::new(start, len)?;
        self.map_locked(
            &mut inner,
            range,
            None,
            flags | AreaFlags::FAULT,
            MapFlags::empty(),
            None,
        )?;
        inner.next_mapping = range.end();
        Ok(range)
    }

    /// Unmap every page of `range`.
    ///
    /// Regions entirely inside are released; regions straddling a bound
    /// keep their outer parts as new regions.
    pub fn free_range(&self, range: VirtRange) {
        self.inner.lock().free_range(&self.ctx, range);
    }

    /// Release the region `id`.
    ///
    /// # Errors
    /// `InvalidArgument` if no region of this space has that id.
    pub fn free_area(&self, id: RegionId) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let key = inner
            .regions
            .iter()
            .find(|(_, region)| region.id() == id)
            .map(|(key, _)| *key)
            .ok_or(VmError::InvalidArgument)?;
        let region = inner.remove(&self.ctx, key);
        trace!(target: "vm::space", "free area {:?}", region);
        Ok(())
    }

    /// Replace the contents of `dest` with a copy of this space.
    ///
    /// Regions marked `NO_CLONE` are neither copied nor removed from
    /// `dest`. Cached object pages are shared; private pages are copied so
    /// the two spaces never observe each other's writes.
    pub fn clone_into(&self, dest: &AddressSpace) -> Result<(), VmError> {
        if core::ptr::eq(self, dest) {
            return Err(VmError::InvalidArgument);
        }
        let (src, mut dst) = lock_pair(self, dest);

        let doomed: Vec<VirtAddr> = dst
            .regions
            .iter()
            .filter(|(_, region)| !region.flags().contains(AreaFlags::NO_CLONE))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            dst.remove(&dest.ctx, key);
        }

        for region in src.regions.values() {
            if region.flags().contains(AreaFlags::NO_CLONE) {
                continue;
            }
            dst.free_range(&dest.ctx, region.range());
            let key = region.range().start();
            dst.insert(region.duplicate());

            let SpaceInner { regions, root, .. } = &mut *dst;
            let Some(copy) = regions.get_mut(&key) else {
                continue;
            };
            for (index, page) in region.resident() {
                let (page, owned) = self.clone_page(page, copy.id())?;
                let (phys, readonly) = {
                    let locked = page.lock();
                    (locked.phys(), locked.is_readonly())
                };
                let phys = phys.ok_or(VmError::InvalidArgument)?;
                dest.ctx.mmu.map_pages(
                    root,
                    copy.slot_addr(index),
                    phys,
                    1,
                    translation_flags(copy.flags(), owned, readonly),
                )?;
                copy.install(index, page);
            }
        }
        dst.next_mapping = dst.highest_end();
        debug!(
            target: "vm::space",
            "cloned {} regions into {}",
            dst.regions.len(),
            dst.root.root_phys()
        );
        Ok(())
    }

    /// The page that stands in for `page` in a cloned region `owner`.
    fn clone_page(
        &self,
        page: &ResidentPage,
        owner: RegionId,
    ) -> Result<(ResidentPage, bool), VmError> {
        let mut locked = page.lock();
        if locked.is_shared() {
            return Ok((locked.share(), false));
        }
        let src = locked.phys().ok_or(VmError::InvalidArgument)?;
        let state = locked.state() & (PageState::READONLY | PageState::PROMOTED);
        drop(locked);

        let frame = self.ctx.frames.allocate_frame(0)?;
        self.ctx.kmap.copy_page(src, frame.addr(), PAGE_SIZE)?;
        Ok((ResidentPage::new_private(frame, owner, state), true))
    }

    /// Drop every region not marked `MD`, ahead of loading a new image.
    pub fn prepare_for_execute(&self) {
        let mut inner = self.inner.lock();
        let doomed: Vec<VirtAddr> = inner
            .regions
            .iter()
            .filter(|(_, region)| !region.flags().contains(AreaFlags::MD))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            inner.remove(&self.ctx, key);
        }
    }

    /// Tear the address space down, returning every frame it holds.
    pub fn destroy(self) {
        drop(self);
    }

    /// Translation of `virt`, offset included.
    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)> {
        let inner = self.inner.lock();
        self.ctx
            .mmu
            .translate(&inner.root, virt)
            .map(|(phys, flags)| (phys.add(virt.page_offset()), flags))
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.inner.lock().regions.values().map(RegionInfo::of).collect()
    }

    /// The region containing `addr`.
    pub fn region_at(&self, addr: VirtAddr) -> Option<RegionInfo> {
        self.inner.lock().region_at(addr).map(RegionInfo::of)
    }

    /// Reference count of the page resident at `addr`.
    pub fn page_refcount(&self, addr: VirtAddr) -> Option<usize> {
        let inner = self.inner.lock();
        let region = inner.region_at(addr)?;
        let locked = region.lookup_resident_page_and_lock(addr)?;
        Some(locked.refcount())
    }

    /// State of the page resident at `addr`.
    pub fn page_state(&self, addr: VirtAddr) -> Option<PageState> {
        let inner = self.inner.lock();
        let region = inner.region_at(addr)?;
        let locked = region.lookup_resident_page_and_lock(addr)?;
        Some(locked.state())
    }

    /// Log every region and resident page.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        debug!(
            target: "vm::space",
            "address space {}: {} regions, next mapping {}",
            inner.root.root_phys(),
            inner.regions.len(),
            inner.next_mapping
        );
        for region in inner.regions.values() {
            debug!(
                target: "vm::space",
                "  {:?} {} {:?} resident {} {:?}",
                region.range(),
                region.flags().letters(),
                region.id(),
                region.resident_count(),
                region.backing()
            );
            for (index, page) in region.resident() {
                let locked = page.lock();
                trace!(
                    target: "vm::space",
                    "    {} -> {:?} refs {} {:?}",
                    region.slot_addr(index),
                    locked.phys(),
                    locked.refcount(),
                    locked.state()
                );
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let regions = core::mem::take(&mut inner.regions);
        let count = regions.len();
        drop(regions);
        self.ctx.mmu.release_root(&mut inner.root);
        debug!(target: "vm::space", "destroyed address space with {} regions", count);
    }
}

/// Lock two distinct spaces in address order.
fn lock_pair<'a>(
    first: &'a AddressSpace,
    second: &'a AddressSpace,
) -> (MutexGuard<'a, SpaceInner>, MutexGuard<'a, SpaceInner>) {
    if (first as *const AddressSpace) < (second as *const AddressSpace) {
        let a = first.inner.lock();
        let b = second.inner.lock();
        (a, b)
    } else {
        let b = second.inner.lock();
        let a = first.inner.lock();
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{user_read, user_write, Machine, MemObject};
    use crate::vm::flags::AccessFlags;

    const RW: AreaFlags = AreaFlags::READ
        .union(AreaFlags::WRITE)
        .union(AreaFlags::USER)
        .union(AreaFlags::PRIVATE);

    fn page(n: usize) -> VirtAddr {
        VirtAddr::new(USER_MAPPING_BASE + n * PAGE_SIZE)
    }

    fn pages(first: usize, count: usize) -> VirtRange {
        VirtRange::new(page(first), count * PAGE_SIZE).unwrap()
    }

    fn assert_disjoint(space: &AddressSpace) {
        let regions = space.regions();
        for pair in regions.windows(2) {
            assert!(pair[0].range.end() <= pair[1].range.start());
        }
    }

    #[test]
    fn test_map_replaces_overlap() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();

        let first = space.map(pages(0, 8), None, RW | AreaFlags::FAULT, MapFlags::empty()).unwrap();
        let second = space.map(pages(2, 2), None, RW | AreaFlags::FAULT, MapFlags::empty()).unwrap();
        assert_ne!(first, second);

        let regions = space.regions();
        let ranges: Vec<VirtRange> = regions.iter().map(|r| r.range).collect();
        assert_eq!(ranges, [pages(0, 2), pages(2, 2), pages(4, 4)]);
        assert_eq!(regions[1].id, second);
        // Both leftovers got fresh ids
        assert_ne!(regions[0].id, first);
        assert_ne!(regions[2].id, first);
        assert_disjoint(&space);
    }

    #[test]
    fn test_free_range_splits_and_keeps_pages() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        space.map(pages(0, 4), None, RW | AreaFlags::FAULT, MapFlags::empty()).unwrap();
        for n in 0..4 {
            user_write(&space, page(n), n as u8 + 1).unwrap();
        }

        space.free_range(pages(1, 2));
        let regions = space.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].range, pages(0, 1));
        assert_eq!(regions[1].range, pages(3, 1));
        assert_eq!(regions[0].resident_pages, 1);
        assert_eq!(regions[1].resident_pages, 1);

        assert_eq!(user_read(&space, page(0)).unwrap(), 1);
        assert_eq!(user_read(&space, page(3)).unwrap(), 4);
        assert!(space.translate(page(1)).is_none());
        assert_eq!(
            space.handle_fault(page(2), AccessFlags::READ),
            Err(VmError::AccessViolation)
        );
    }

    #[test]
    fn test_free_range_across_regions() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        space.map(pages(0, 2), None, RW, MapFlags::empty()).unwrap();
        space.map(pages(2, 2), None, RW, MapFlags::empty()).unwrap();
        space.map(pages(6, 2), None, RW, MapFlags::empty()).unwrap();

        space.free_range(pages(1, 6));
        let ranges: Vec<VirtRange> = space.regions().iter().map(|r| r.range).collect();
        assert_eq!(ranges, [pages(0, 1), pages(7, 1)]);
    }

    #[test]
    fn test_map_with_physical_run() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        let block = machine.frames.allocate(1).unwrap();
        let flags = MapFlags::READ | MapFlags::USER | MapFlags::DEVICE;

        space
            .map(pages(0, 2), Some(block.addr()), AreaFlags::READ | AreaFlags::USER, flags)
            .unwrap();
        assert_eq!(
            space.translate(page(1).add(8)),
            Some((block.addr().add(PAGE_SIZE + 8), flags))
        );
        assert_eq!(
            space.map(pages(4, 1), Some(block.addr().add(1)), AreaFlags::READ, flags),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn test_free_area() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        let id = space.map(pages(0, 2), None, RW | AreaFlags::FAULT, MapFlags::empty()).unwrap();
        user_write(&space, page(0), 9).unwrap();

        space.free_area(id).unwrap();
        assert!(space.regions().is_empty());
        assert!(space.translate(page(0)).is_none());
        assert_eq!(space.free_area(id), Err(VmError::InvalidArgument));
    }

    #[test]
    fn test_map_anonymous_fills_gaps_forward() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        space.map(pages(1, 1), None, RW, MapFlags::empty()).unwrap();

        let a = space.map_anonymous(PAGE_SIZE, RW).unwrap();
        assert_eq!(a, pages(0, 1));
        assert!(space.region_at(a.start()).unwrap().flags.contains(AreaFlags::FAULT));

        let b = space.map_anonymous(PAGE_SIZE + 1, RW).unwrap();
        assert_eq!(b, pages(2, 2));
        assert_eq!(space.next_mapping(), page(4));

        // The cursor never moves back into freed space
        space.free_range(a);
        assert_eq!(space.map_anonymous(PAGE_SIZE, RW).unwrap(), pages(4, 1));
        assert_eq!(space.map_anonymous(0, RW), Err(VmError::InvalidArgument));
        assert_disjoint(&space);
    }

    #[test]
    fn test_map_anonymous_at_top_of_user_half() {
        let machine = Machine::new(64);
        let top = VirtAddr::new(USER_SPACE_END - PAGE_SIZE);
        let space = AddressSpace::with_mapping_base(machine.ctx.clone(), top).unwrap();

        let stack = space.map_anonymous(PAGE_SIZE, RW).unwrap();
        assert_eq!(stack.start(), top);
        assert_eq!(stack.end().as_usize(), USER_SPACE_END);
        assert_eq!(stack.page_count(), 1);
        user_write(&space, top.add(PAGE_SIZE - 1), 0x77).unwrap();
        assert_eq!(user_read(&space, top.add(PAGE_SIZE - 1)).unwrap(), 0x77);
        assert_eq!(space.regions()[0].resident_pages, 1);

        assert_eq!(space.map_anonymous(PAGE_SIZE, RW), Err(VmError::OutOfMemory));
    }

    #[test]
    fn test_map_to_object_trims_to_object() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        let object: Arc<dyn BackingObject> = MemObject::with_len(2 * PAGE_SIZE + 10);

        let id = space
            .map_to_object(pages(0, 8), Arc::clone(&object), PAGE_SIZE as u64, u64::MAX, RW)
            .unwrap();
        let info = space.region_at(page(0)).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.range, pages(0, 2));
        assert_eq!(info.backing, Some((PAGE_SIZE as u64, PAGE_SIZE as u64 + 10)));
        assert!(info.flags.contains(AreaFlags::FAULT));

        assert_eq!(
            space.map_to_object(pages(8, 1), Arc::clone(&object), 3 * PAGE_SIZE as u64, 1, RW),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.map_to_object(pages(8, 1), object, 100, 1, RW),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn test_clone_isolates_private_pages() {
        let machine = Machine::new(64);
        let parent = AddressSpace::new(machine.ctx.clone()).unwrap();
        let child = AddressSpace::new(machine.ctx.clone()).unwrap();
        let heap = parent.map_anonymous(2 * PAGE_SIZE, RW).unwrap();
        user_write(&parent, heap.start(), 0xAA).unwrap();

        parent.clone_into(&child).unwrap();
        assert_eq!(child.regions().len(), 1);
        assert_eq!(child.next_mapping(), heap.end());
        assert_eq!(user_read(&child, heap.start()).unwrap(), 0xAA);
        assert_ne!(parent.translate(heap.start()), child.translate(heap.start()));

        user_write(&child, heap.start(), 0xBB).unwrap();
        user_write(&parent, heap.start(), 0xCC).unwrap();
        assert_eq!(user_read(&parent, heap.start()).unwrap(), 0xCC);
        assert_eq!(user_read(&child, heap.start()).unwrap(), 0xBB);

        // Untouched pages stay untouched in the copy
        assert_eq!(child.page_refcount(heap.start().add(PAGE_SIZE)), None);
    }

    #[test]
    fn test_clone_shares_cached_pages() {
        let machine = Machine::new(64);
        let object: Arc<dyn BackingObject> = MemObject::with_len(PAGE_SIZE);
        let parent = AddressSpace::new(machine.ctx.clone()).unwrap();
        let child = AddressSpace::new(machine.ctx.clone()).unwrap();
        let flags = AreaFlags::READ | AreaFlags::USER;
        parent
            .map_to_object(pages(0, 1), Arc::clone(&object), 0, PAGE_SIZE as u64, flags)
            .unwrap();
        user_read(&parent, page(0)).unwrap();

        parent.clone_into(&child).unwrap();
        assert_eq!(
            parent.translate(page(0)).map(|t| t.0),
            child.translate(page(0)).map(|t| t.0)
        );
        // Two mappings plus the cache
        assert_eq!(child.page_refcount(page(0)), Some(3));
    }

    #[test]
    fn test_clone_skips_no_clone_regions() {
        let machine = Machine::new(64);
        let parent = AddressSpace::new(machine.ctx.clone()).unwrap();
        let child = AddressSpace::new(machine.ctx.clone()).unwrap();
        parent.map(pages(0, 1), None, RW | AreaFlags::NO_CLONE, MapFlags::empty()).unwrap();
        parent.map(pages(1, 1), None, RW, MapFlags::empty()).unwrap();
        let kept = child.map(pages(8, 1), None, RW | AreaFlags::NO_CLONE, MapFlags::empty()).unwrap();
        child.map(pages(9, 1), None, RW, MapFlags::empty()).unwrap();

        parent.clone_into(&child).unwrap();
        let regions = child.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].range, pages(1, 1));
        assert_eq!(regions[1].id, kept);
        assert_eq!(parent.clone_into(&parent), Err(VmError::InvalidArgument));
    }

    #[test]
    fn test_prepare_for_execute_keeps_md() {
        let machine = Machine::new(64);
        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        space.map(pages(0, 1), None, RW | AreaFlags::MD, MapFlags::empty()).unwrap();
        space.map_anonymous(PAGE_SIZE, RW).unwrap();
        space.map_anonymous(PAGE_SIZE, RW).unwrap();

        space.prepare_for_execute();
        let regions = space.regions();
        assert_eq!(regions.len(), 1);
        assert!(regions[0].flags.contains(AreaFlags::MD));
    }

    #[test]
    fn test_destroy_returns_every_frame() {
        let machine = Machine::new(64);
        let before = machine.frames.stats().available_pages;
        let object: Arc<dyn BackingObject> = MemObject::with_len(2 * PAGE_SIZE);

        let space = AddressSpace::new(machine.ctx.clone()).unwrap();
        let heap = space.map_anonymous(4 * PAGE_SIZE, RW).unwrap();
        for va in heap.pages() {
            user_write(&space, va, 1).unwrap();
        }
        space
            .map_to_object(pages(64, 2), Arc::clone(&object), 0, 2 * PAGE_SIZE as u64, RW)
            .unwrap();
        user_read(&space, page(64)).unwrap();
        user_write(&space, page(65), 2).unwrap();
        space.dump();

        space.destroy();
        object.page_cache().purge();
        assert_eq!(machine.frames.stats().available_pages, before);
    }
}
