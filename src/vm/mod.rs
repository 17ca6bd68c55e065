//! Virtual memory for PantherOS processes
//!
//! Address spaces built from mapped regions, resident pages shared through
//! backing-object caches, and the fault handler that populates them.

pub mod abort;
pub mod backing;
pub mod fault;
pub mod flags;
pub mod page;
pub mod region;
pub mod space;

pub use flags::{AccessFlags, AreaFlags};
pub use space::{AddressSpace, RegionInfo};
