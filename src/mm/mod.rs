//! Memory management for PantherOS
//!
//! Provides:
//! - Physical page management (buddy allocator over registered zones)
//! - ARM64 translation tables behind the [`Mmu`](paging::Mmu) seam
//! - Kernel mappings of arbitrary physical memory
//!
//! # Security Principles
//! - Misuse (double free, foreign frames, bad unmaps) is reported, never ignored
//! - Page tables are only reached through the direct map
//! - Unsafe code is minimal and audited

use alloc::sync::Arc;

pub mod address;
pub mod error;
pub mod frame;
pub mod kmap;
pub mod layout;
pub mod paging;
pub mod walker;

use frame::FrameAllocator;
use kmap::KernelMapper;
use paging::Mmu;

/// The machine-wide services an address space draws on.
#[derive(Clone)]
pub struct MemoryContext {
    pub frames: Arc<FrameAllocator>,
    pub kmap: Arc<KernelMapper>,
    pub mmu: Arc<dyn Mmu>,
}
