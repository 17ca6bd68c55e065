//! Mapped Regions

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::backing::BackingObject;
use super::flags::AreaFlags;
use super::page::{LockedPage, ResidentPage};
use crate::mm::address::{VirtAddr, VirtRange, PAGE_SHIFT};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle naming one region; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(u64);

impl RegionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The part of a backing object a region maps.
#[derive(Clone)]
pub struct Backing {
    pub object: Arc<dyn BackingObject>,
    /// Page-aligned object offset of the region's first page
    pub offset: u64,
    /// Bytes of the object visible through the region
    pub length: u64,
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backing({:p} @ {:#x}+{:#x})",
            Arc::as_ptr(&self.object),
            self.offset,
            self.length
        )
    }
}

/// A contiguous virtual range of one address space.
///
/// Holds one slot per page; an empty slot is faulted in on first access.
pub struct MappedRegion {
    id: RegionId,
    range: VirtRange,
    flags: AreaFlags,
    pages: Vec<Option<ResidentPage>>,
    backing: Option<Backing>,
}

impl MappedRegion {
    pub(crate) fn new(range: VirtRange, flags: AreaFlags, backing: Option<Backing>) -> Self {
        Self {
            id: RegionId::next(),
            range,
            flags,
            pages: (0..range.page_count()).map(|_| None).collect(),
            backing,
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    pub fn range(&self) -> VirtRange {
        self.range
    }

    #[inline]
    pub fn flags(&self) -> AreaFlags {
        self.flags
    }

    #[inline]
    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    /// Number of slots holding a page.
    pub fn resident_count(&self) -> usize {
        self.pages.iter().filter(|slot| slot.is_some()).count()
    }

    /// Slot index of `vaddr`, if it lies in the region.
    #[inline]
    pub fn slot_of(&self, vaddr: VirtAddr) -> Option<usize> {
        self.range
            .contains(vaddr)
            .then(|| vaddr.offset_from(self.range.start()) >> PAGE_SHIFT)
    }

    /// Virtual address of slot `index`.
    #[inline]
    pub fn slot_addr(&self, index: usize) -> VirtAddr {
        self.range.start().add(index << PAGE_SHIFT)
    }

    /// Lock and return the page backing `vaddr`, if one is resident.
    pub fn lookup_resident_page_and_lock(&self, vaddr: VirtAddr) -> Option<LockedPage<'_>> {
        let index = self.slot_of(vaddr)?;
        self.pages[index].as_ref().map(ResidentPage::lock)
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&ResidentPage> {
        self.pages.get(index).and_then(Option::as_ref)
    }

    /// Put `page` in slot `index`, returning the page it replaces.
    pub(crate) fn install(&mut self, index: usize, page: ResidentPage) -> Option<ResidentPage> {
        self.pages[index].replace(page)
    }

    /// Resident slots with their indices.
    pub(crate) fn resident(&self) -> impl Iterator<Item = (usize, &ResidentPage)> {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(n, slot)| slot.as_ref().map(|page| (n, page)))
    }

    /// Same range, flags and backing under a fresh id, with no pages.
    pub(crate) fn duplicate(&self) -> MappedRegion {
        MappedRegion::new(self.range, self.flags, self.backing.clone())
    }

    /// Move the part of this region that lies in `part` into a new region.
    ///
    /// Pages in `part` migrate along with the ownership of the private ones,
    /// and the backing window is shifted to match.
    pub(crate) fn carve(&mut self, part: VirtRange) -> MappedRegion {
        debug_assert!(self.range.covers(&part));
        let delta = part.start().offset_from(self.range.start());
        let first = delta >> PAGE_SHIFT;

        let backing = self.backing.as_ref().and_then(|b| {
            let length = b.length.saturating_sub(delta as u64).min(part.len() as u64);
            (length > 0).then(|| Backing {
                object: Arc::clone(&b.object),
                offset: b.offset + delta as u64,
                length,
            })
        });

        let mut carved = MappedRegion::new(part, self.flags, backing);
        for n in 0..part.page_count() {
            if let Some(page) = self.pages[first + n].take() {
                {
                    let mut locked = page.lock();
                    if locked.is_owned_by(self.id) {
                        locked.set_owner(Some(carved.id));
                    }
                }
                carved.pages[n] = Some(page);
            }
        }
        carved
    }
}

/// Drop `page` out of region `owner`, detaching it if `owner` owned it.
pub(crate) fn release_page(page: ResidentPage, owner: RegionId) {
    {
        let mut locked = page.lock();
        if locked.is_owned_by(owner) {
            locked.set_owner(None);
        }
    }
    drop(page);
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let id = self.id;
        for page in self.pages.drain(..).flatten() {
            release_page(page, id);
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("flags", &self.flags)
            .field("resident", &self.resident_count())
            .field("backing", &self.backing)
            .finish()
    }
}
