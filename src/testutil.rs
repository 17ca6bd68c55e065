//! Host-side test machine
//!
//! Tests run on the build host with "physical" memory carved out of the
//! host heap. The test layout direct-maps physical addresses at virtual
//! address zero, so a physical address is also a usable host pointer.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::alloc::{alloc_zeroed, Layout};

use spin::Mutex;

use crate::mm::address::{
    PhysAddr, VirtAddr, KERNEL_DYNAMIC_BASE, KERNEL_DYNAMIC_SIZE, PAGE_SIZE,
};
use crate::mm::error::{IoError, VmError};
use crate::mm::frame::FrameAllocator;
use crate::mm::kmap::KernelMapper;
use crate::mm::layout::KernelLayout;
use crate::mm::paging::{MapFlags, Mmu};
use crate::mm::walker::TableWalker;
use crate::mm::MemoryContext;
use crate::vm::backing::{BackingObject, PageCache};
use crate::vm::flags::AccessFlags;
use crate::vm::space::AddressSpace;

/// Identity direct map over the host's user half.
pub fn test_layout() -> KernelLayout {
    KernelLayout {
        direct_phys_start: PhysAddr::new(0),
        direct_phys_end: PhysAddr::new(0x0000_8000_0000_0000),
        direct_virt_base: VirtAddr::new(0),
        dynamic_virt_start: VirtAddr::new(KERNEL_DYNAMIC_BASE),
        dynamic_virt_end: VirtAddr::new(KERNEL_DYNAMIC_BASE + KERNEL_DYNAMIC_SIZE),
        max_dynamic_mappings: 16,
    }
}

/// Page-aligned, zeroed host memory standing in for RAM. Never freed.
pub struct HostArena {
    base: usize,
    len: usize,
}

impl HostArena {
    pub fn new(pages: usize) -> Self {
        let len = pages * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
        // SAFETY: `layout` has a non-zero size for every caller.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "host arena allocation failed");
        Self {
            base: ptr as usize,
            len,
        }
    }

    pub fn base(&self) -> PhysAddr {
        PhysAddr::new(self.base)
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// A frame allocator, walker and kernel mapper over one arena.
pub struct Machine {
    pub frames: Arc<FrameAllocator>,
    pub ctx: MemoryContext,
}

impl Machine {
    pub fn new(pages: usize) -> Self {
        let arena = HostArena::new(pages);
        let frames = Arc::new(FrameAllocator::new());
        frames.register_zone(arena.base(), arena.len()).unwrap();
        let mmu: Arc<dyn Mmu> = Arc::new(TableWalker::new(Arc::clone(&frames), test_layout()));
        let kmap = Arc::new(KernelMapper::new(test_layout(), Arc::clone(&mmu)).unwrap());
        // Build the kernel tables over the arena now, so frame counts taken
        // by tests only move with the memory under test
        let virt = kmap.map(arena.base(), arena.len(), MapFlags::KERNEL_DATA).unwrap();
        kmap.unmap(virt, arena.len()).unwrap();
        let ctx = MemoryContext {
            frames: Arc::clone(&frames),
            kmap,
            mmu,
        };
        Self { frames, ctx }
    }
}

/// In-memory backing object with injectable read failures.
pub struct MemObject {
    data: Mutex<Vec<u8>>,
    cache: PageCache,
    failing: AtomicBool,
    read_limit: AtomicUsize,
}

impl MemObject {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            cache: PageCache::new(),
            failing: AtomicBool::new(false),
            read_limit: AtomicUsize::new(usize::MAX),
        })
    }

    /// `len` bytes of a pattern that contains no zero byte.
    pub fn with_len(len: usize) -> Arc<Self> {
        Self::new((0..len).map(|n| (n % 251) as u8 + 1).collect())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Make every read fail with a device error.
    pub fn fail_reads(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Return at most `limit` bytes from each read.
    pub fn truncate_reads(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::SeqCst);
    }
}

impl BackingObject for MemObject {
    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IoError::Device);
        }
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let count = buf
            .len()
            .min(data.len() - start)
            .min(self.read_limit.load(Ordering::SeqCst));
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn page_cache(&self) -> &PageCache {
        &self.cache
    }
}

fn host_ptr(phys: PhysAddr) -> *mut u8 {
    // SAFETY: the test layout direct-maps every arena at its own address.
    unsafe { test_layout().phys_to_direct(phys).as_mut_ptr::<u8>() }
}

/// Load a byte as user code would, faulting if there is no translation.
pub fn user_read(space: &AddressSpace, va: VirtAddr) -> Result<u8, VmError> {
    let phys = match space.translate(va) {
        Some((phys, _)) => phys,
        None => {
            space.handle_fault(va, AccessFlags::READ)?;
            space.translate(va).ok_or(VmError::AccessViolation)?.0
        }
    };
    // SAFETY: `phys` lies in a live arena frame held by `space`.
    Ok(unsafe { host_ptr(phys).read() })
}

/// Store a byte as user code would, faulting on a missing or read-only
/// translation.
pub fn user_write(space: &AddressSpace, va: VirtAddr, byte: u8) -> Result<(), VmError> {
    let phys = match space.translate(va) {
        Some((phys, flags)) if flags.contains(MapFlags::WRITE) => phys,
        _ => {
            space.handle_fault(va, AccessFlags::WRITE)?;
            match space.translate(va) {
                Some((phys, flags)) if flags.contains(MapFlags::WRITE) => phys,
                _ => return Err(VmError::AccessViolation),
            }
        }
    };
    // SAFETY: as for `user_read`.
    unsafe { host_ptr(phys).write(byte) };
    Ok(())
}
