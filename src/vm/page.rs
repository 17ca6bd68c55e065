//! Resident Pages
//!
//! A [`ResidentPage`] is one counted reference to a physical page holding
//! process data. The page is either private to one region or shared
//! through a backing object's page cache.
//!
//! # Design
//! - Every handle is one reference; there is no `Clone`. New references
//!   come from [`LockedPage::share`], so the count only changes under the
//!   page lock
//! - Flags, ownership and the frame are reachable only through
//!   [`LockedPage`]
//! - The frame is released when the last handle drops

use alloc::sync::{Arc, Weak};
use core::fmt;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::backing::BackingObject;
use super::region::RegionId;
use crate::mm::address::PhysAddr;
use crate::mm::frame::Frame;

bitflags! {
    /// State bits of a resident page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageState: u8 {
        /// Owned by a single region
        const PRIVATE = 1 << 0;
        /// Never mapped writable
        const READONLY = 1 << 1;
        /// Contents are still being read from the backing object
        const PENDING = 1 << 2;
        /// Private copy made by a copy-on-write fault
        const PROMOTED = 1 << 3;
    }
}

enum Identity {
    Private {
        owner: Option<RegionId>,
    },
    Shared {
        object: Weak<dyn BackingObject>,
        offset: u64,
    },
}

struct Inner {
    refs: usize,
    state: PageState,
    frame: Option<Frame>,
    identity: Identity,
}

/// A counted reference to a resident page.
pub struct ResidentPage {
    cell: Arc<Mutex<Inner>>,
}

impl ResidentPage {
    /// Wrap a filled frame as a page private to `owner`.
    pub fn new_private(frame: Frame, owner: RegionId, state: PageState) -> Self {
        Self::from_inner(Inner {
            refs: 1,
            state: (state | PageState::PRIVATE) - PageState::PENDING,
            frame: Some(frame),
            identity: Identity::Private { owner: Some(owner) },
        })
    }

    /// A pending page for `offset` of `object`, not yet backed by a frame.
    pub(crate) fn new_shared(object: Weak<dyn BackingObject>, offset: u64) -> Self {
        Self::from_inner(Inner {
            refs: 1,
            state: PageState::PENDING,
            frame: None,
            identity: Identity::Shared { object, offset },
        })
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            cell: Arc::new(Mutex::new(inner)),
        }
    }

    /// Lock the page.
    pub fn lock(&self) -> LockedPage<'_> {
        let inner = self.cell.lock();
        debug_assert!(inner.refs > 0, "locking an unreferenced page");
        LockedPage {
            cell: &self.cell,
            inner,
        }
    }

    /// True if both handles refer to the same page.
    #[inline]
    pub fn same_page(&self, other: &ResidentPage) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Drop for ResidentPage {
    fn drop(&mut self) {
        let frame = {
            let mut inner = self.cell.lock();
            debug_assert!(inner.refs > 0);
            inner.refs -= 1;
            if inner.refs == 0 {
                inner.frame.take()
            } else {
                None
            }
        };
        // Frees the block, outside the page lock
        drop(frame);
    }
}

impl fmt::Debug for ResidentPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResidentPage({:p})", Arc::as_ptr(&self.cell))
    }
}

/// A resident page with its lock held.
pub struct LockedPage<'a> {
    cell: &'a Arc<Mutex<Inner>>,
    inner: MutexGuard<'a, Inner>,
}

impl LockedPage<'_> {
    #[inline]
    pub fn refcount(&self) -> usize {
        self.inner.refs
    }

    #[inline]
    pub fn state(&self) -> PageState {
        self.inner.state
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.inner.state.contains(PageState::PENDING)
    }

    #[inline]
    pub fn is_promoted(&self) -> bool {
        self.inner.state.contains(PageState::PROMOTED)
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.inner.state.contains(PageState::READONLY)
    }

    /// True for a page that lives in a backing object's cache.
    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self.inner.identity, Identity::Shared { .. })
    }

    /// Owning region of a private page.
    pub fn owner(&self) -> Option<RegionId> {
        match self.inner.identity {
            Identity::Private { owner } => owner,
            Identity::Shared { .. } => None,
        }
    }

    #[inline]
    pub fn is_owned_by(&self, region: RegionId) -> bool {
        self.owner() == Some(region)
    }

    /// Object offset of a shared page.
    pub fn cache_offset(&self) -> Option<u64> {
        match self.inner.identity {
            Identity::Shared { offset, .. } => Some(offset),
            Identity::Private { .. } => None,
        }
    }

    /// Backing object of a shared page, if it is still alive.
    pub fn backing_object(&self) -> Option<Arc<dyn BackingObject>> {
        match &self.inner.identity {
            Identity::Shared { object, .. } => object.upgrade(),
            Identity::Private { .. } => None,
        }
    }

    /// Physical address of the page; `None` while it is pending.
    pub fn phys(&self) -> Option<PhysAddr> {
        self.inner.frame.as_ref().map(Frame::addr)
    }

    /// Move a private page to another region, or detach it.
    pub(crate) fn set_owner(&mut self, region: Option<RegionId>) {
        if let Identity::Private { owner } = &mut self.inner.identity {
            *owner = region;
        }
    }

    /// Attach the frame that now holds the page's data and clear `PENDING`.
    pub(crate) fn complete(&mut self, frame: Frame) {
        debug_assert!(self.is_pending());
        self.inner.frame = Some(frame);
        self.inner.state.remove(PageState::PENDING);
    }

    pub(crate) fn mark_promoted(&mut self) {
        self.inner.state.insert(PageState::PROMOTED);
    }

    /// Take another reference to this page.
    pub fn share(&mut self) -> ResidentPage {
        self.inner.refs += 1;
        ResidentPage {
            cell: Arc::clone(self.cell),
        }
    }
}
