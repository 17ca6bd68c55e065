//! Page Fault Resolution
//!
//! Resolves one fault against an [`AddressSpace`]: copy-on-write promotion
//! of a resident page, demand paging from a backing object, or a fresh
//! zero-filled page.
//!
//! # Design
//! - The whole resolution runs under the address space lock
//! - A page is mapped before it is installed in its slot, so a failed
//!   mapping leaves the slot empty
//! - A failed read leaves the cached page pending for the next fault
//! - Backing objects are read with the space and page locks held

use alloc::sync::Arc;
use core::cmp::min;

use log::{trace, warn};

use super::backing::{cached_page, BackingObject};
use super::flags::{AccessFlags, AreaFlags};
use super::page::{LockedPage, PageState, ResidentPage};
use super::region::{release_page, MappedRegion};
use super::space::{region_at_mut, AddressSpace, SpaceInner};
use crate::mm::address::{VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::mm::error::{IoError, VmError};
use crate::mm::paging::{MapFlags, TranslationRoot};
use crate::mm::MemoryContext;

/// Permissions for a page of a region with `flags`.
///
/// A page never maps writable if it is read-only itself, or if the region
/// is private or copy-on-write and the page is not the region's own.
pub(super) fn translation_flags(flags: AreaFlags, owned: bool, readonly: bool) -> MapFlags {
    let mut map = flags.map_flags();
    let copies = flags.intersects(AreaFlags::PRIVATE.union(AreaFlags::COW));
    if readonly || (copies && !owned) {
        map.remove(MapFlags::WRITE);
    }
    map
}

impl AddressSpace {
    /// Resolve a fault at `addr` caused by an `access`.
    ///
    /// # Errors
    /// - `AccessViolation` if no fault-enabled region covers `addr`, the
    ///   region forbids `access`, or the page is already resident and the
    ///   fault is not a copy-on-write promotion
    /// - `OutOfMemory` if no frame or kernel window is available
    /// - `Io` if the backing object could not supply the page
    pub fn handle_fault(&self, addr: VirtAddr, access: AccessFlags) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let SpaceInner { regions, root, .. } = &mut *inner;

        let Some(region) = region_at_mut(regions, addr) else {
            trace!(target: "vm::fault", "{} {:?}: no region", addr, access);
            return Err(VmError::AccessViolation);
        };
        let flags = region.flags();
        if !flags.contains(AreaFlags::FAULT) || !flags.permits(access) {
            trace!(
                target: "vm::fault",
                "{} {:?}: refused by {}",
                addr,
                access,
                flags.letters()
            );
            return Err(VmError::AccessViolation);
        }

        let va = addr.align_down();
        let index = region.slot_of(va).ok_or(VmError::AccessViolation)?;
        if region.slot(index).is_some() {
            if access.contains(AccessFlags::WRITE) && flags.contains(AreaFlags::COW) {
                return promote(&self.ctx, root, region, index);
            }
            trace!(target: "vm::fault", "{} {:?}: page already resident", addr, access);
            return Err(VmError::AccessViolation);
        }

        let area_offset = (index << PAGE_SHIFT) as u64;
        let backed = region
            .backing()
            .filter(|backing| area_offset < backing.length)
            .cloned();
        let (page, owned) = match backed {
            Some(backing) => page_from_object(
                &self.ctx,
                region,
                &backing.object,
                backing.offset + area_offset,
                backing.length - area_offset,
            )?,
            None => (zeroed_page(&self.ctx, region)?, true),
        };

        let (phys, readonly) = {
            let locked = page.lock();
            (locked.phys(), locked.is_readonly())
        };
        let phys = phys.ok_or(VmError::InvalidArgument)?;
        self.ctx
            .mmu
            .map_pages(root, va, phys, 1, translation_flags(flags, owned, readonly))?;
        trace!(target: "vm::fault", "{} {:?}: resident at {}", va, access, phys);
        region.install(index, page);
        Ok(())
    }
}

/// Give the region its own writable copy of the page in slot `index`.
fn promote(
    ctx: &MemoryContext,
    root: &mut TranslationRoot,
    region: &mut MappedRegion,
    index: usize,
) -> Result<(), VmError> {
    let flags = region.flags();
    let va = region.slot_addr(index);
    let page = region.slot(index).ok_or(VmError::AccessViolation)?;

    let mut locked = page.lock();
    if locked.is_promoted() {
        trace!(target: "vm::fault", "{}: already promoted", va);
        return Err(VmError::AccessViolation);
    }
    let src = locked.phys().ok_or(VmError::InvalidArgument)?;

    if locked.is_owned_by(region.id()) && !locked.is_readonly() {
        locked.mark_promoted();
        drop(locked);
        ctx.mmu
            .map_pages(root, va, src, 1, translation_flags(flags, true, false))?;
        trace!(target: "vm::fault", "{}: promoted in place", va);
        return Ok(());
    }

    let frame = ctx.frames.allocate_frame(0)?;
    ctx.kmap.copy_page(src, frame.addr(), PAGE_SIZE)?;
    drop(locked);

    let phys = frame.addr();
    let copy = ResidentPage::new_private(frame, region.id(), PageState::PROMOTED);
    ctx.mmu
        .map_pages(root, va, phys, 1, translation_flags(flags, true, false))?;
    if let Some(old) = region.install(index, copy) {
        release_page(old, region.id());
    }
    trace!(target: "vm::fault", "{}: promoted to {}", va, phys);
    Ok(())
}

/// The page for `offset` of `object`, and whether it is private to `region`.
///
/// `visible` is how much of the object the region shows from `offset` on.
fn page_from_object(
    ctx: &MemoryContext,
    region: &MappedRegion,
    object: &Arc<dyn BackingObject>,
    offset: u64,
    visible: u64,
) -> Result<(ResidentPage, bool), VmError> {
    let shared = cached_page(object, offset);
    let mut locked = shared.lock();
    if locked.is_pending() {
        fill_from_object(ctx, object.as_ref(), offset, &mut locked)?;
    }

    let flags = region.flags();
    let whole = visible >= PAGE_SIZE as u64;
    let may_share = !flags.contains(AreaFlags::WRITE)
        || !flags.contains(AreaFlags::PRIVATE)
        || flags.contains(AreaFlags::COW);
    if whole && may_share {
        drop(locked);
        return Ok((shared, false));
    }

    let src = locked.phys().ok_or(VmError::InvalidArgument)?;
    let frame = ctx.frames.allocate_frame(0)?;
    ctx.kmap
        .copy_page(src, frame.addr(), min(visible, PAGE_SIZE as u64) as usize)?;
    drop(locked);

    let state = if flags.contains(AreaFlags::WRITE) {
        PageState::empty()
    } else {
        PageState::READONLY
    };
    Ok((ResidentPage::new_private(frame, region.id(), state), true))
}

/// Read the page at `offset` of `object` into a fresh frame.
///
/// Bytes past the end of the object read as zero.
fn fill_from_object(
    ctx: &MemoryContext,
    object: &dyn BackingObject,
    offset: u64,
    page: &mut LockedPage<'_>,
) -> Result<(), VmError> {
    let frame = ctx.frames.allocate_frame(0)?;
    let want = min(object.length().saturating_sub(offset), PAGE_SIZE as u64) as usize;
    {
        let mut window = ctx.kmap.window(frame.addr(), 1)?;
        window[want..].fill(0);
        if want > 0 {
            let read = object.read_at(offset, &mut window[..want]).map_err(|err| {
                warn!(target: "vm::fault", "reading offset {:#x}: {}", offset, err);
                VmError::Io(err)
            })?;
            if read < want {
                warn!(
                    target: "vm::fault",
                    "short read at offset {:#x}: {} of {} bytes",
                    offset,
                    read,
                    want
                );
                return Err(IoError::ShortRead {
                    expected: want,
                    read,
                }
                .into());
            }
        }
    }
    page.complete(frame);
    Ok(())
}

/// A zero-filled page private to `region`.
fn zeroed_page(ctx: &MemoryContext, region: &MappedRegion) -> Result<ResidentPage, VmError> {
    let frame = ctx.frames.allocate_frame(0)?;
    ctx.kmap.zero_page(frame.addr())?;
    Ok(ResidentPage::new_private(
        frame,
        region.id(),
        PageState::empty(),
    ))
}
