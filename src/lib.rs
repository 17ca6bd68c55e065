//! PantherOS Memory Subsystem
//!
//! Physical and virtual memory management for the PantherOS ARM64
//! microkernel.
//!
//! # Layers
//! - `mm::frame`: buddy allocator over registered physical zones
//! - `mm::walker`: ARM64 4-level translation tables behind `mm::paging::Mmu`
//! - `mm::kmap`: kernel mappings of arbitrary physical memory
//! - `vm`: process address spaces, shared page caches and fault resolution
//!
//! # Security Features
//! - Misuse of the allocator or mapper is reported as a fatal error kind
//! - Private pages are never mapped writable into another region
//! - Copy-on-write keeps forked address spaces isolated
//!
//! # Architecture
//! - Target: AArch64 (ARM64), 4KB granule, 48-bit virtual addresses
//! - Host builds run the same code against heap-backed "physical" memory

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod mm;
pub mod vm;

#[cfg(test)]
mod testutil;
