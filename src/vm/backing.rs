//! Backing Objects and the Shared Page Cache
//!
//! A backing object is anything file-like that can be demand-paged into a
//! region. Each object carries a [`PageCache`] mapping page-aligned offsets
//! to the shared [`ResidentPage`] holding that part of the object.
//!
//! # Lock Order
//! The cache lock is taken before any page lock, so two faults on the same
//! `(object, offset)` always agree on a single cached page.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use log::trace;
use spin::Mutex;

use super::page::ResidentPage;
use crate::mm::address::PAGE_SIZE;
use crate::mm::error::IoError;

/// File-like provider of page contents.
pub trait BackingObject: Send + Sync {
    /// Current length of the object in bytes.
    fn length(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// `offset` is always page-aligned. Returns the number of bytes read,
    /// which is short only at the end of the object.
    ///
    /// Called from the fault handler with the address space lock and the
    /// page lock held. Both are spin locks, so the read must not block or
    /// sleep; an object whose data is not in memory reports an error and
    /// the page stays pending for the next fault.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// The object's shared page cache.
    fn page_cache(&self) -> &PageCache;
}

/// Shared pages of one backing object, keyed by object offset.
///
/// Each cached page holds one reference of its own, so a page survives
/// being unmapped from every address space until [`PageCache::purge`].
pub struct PageCache {
    pages: Mutex<BTreeMap<u64, ResidentPage>>,
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Drop every cached page that no mapping references any more.
    ///
    /// # Returns
    /// Number of pages released.
    pub fn purge(&self) -> usize {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|_, page| page.lock().refcount() > 1);
        before - pages.len()
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Find or create the cached page for `offset` of `object`.
///
/// A newly created page is `PENDING` and has no frame yet; the caller
/// fills it. Returns a fresh reference to the page.
pub fn cached_page(object: &Arc<dyn BackingObject>, offset: u64) -> ResidentPage {
    debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
    let mut pages = object.page_cache().pages.lock();
    let page = pages.entry(offset).or_insert_with(|| {
        trace!(target: "vm::fault", "new cache page at offset {:#x}", offset);
        ResidentPage::new_shared(Arc::downgrade(object), offset)
    });
    let mut locked = page.lock();
    locked.share()
}
