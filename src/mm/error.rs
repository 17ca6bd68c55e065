//! Error types for the memory subsystem
//!
//! Every fallible operation returns [`VmError`]. Conditions that the
//! process layer must treat as corrupted kernel state are grouped under
//! [`UsageError`] and reported by [`VmError::is_fatal`].

use core::fmt;

/// Failure reported by a backing-object read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The backing store rejected the read
    Device,
    /// Fewer bytes arrived than the object length promised
    ShortRead { expected: usize, read: usize },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Device => write!(f, "backing store read failed"),
            IoError::ShortRead { expected, read } => {
                write!(f, "short read: expected {} bytes, got {}", expected, read)
            }
        }
    }
}

/// Misuse of the memory interfaces. Always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// Block was freed twice, or freed at the wrong order
    DoubleFree,
    /// Block does not belong to any registered zone
    ForeignFrame,
    /// Exact physical range already has a dynamic kernel mapping
    AlreadyMapped,
    /// Unmap did not match a recorded mapping exactly
    UnmapMismatch,
    /// Address is not mapped by the kernel mapper
    NotMapped,
    /// Page table page is not reachable through the direct map
    OutsideDirectMap,
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageError::DoubleFree => write!(f, "page freed twice"),
            UsageError::ForeignFrame => write!(f, "page does not belong to any zone"),
            UsageError::AlreadyMapped => write!(f, "physical range already mapped"),
            UsageError::UnmapMismatch => write!(f, "unmap does not match any mapping"),
            UsageError::NotMapped => write!(f, "address not mapped"),
            UsageError::OutsideDirectMap => write!(f, "page outside the direct map"),
        }
    }
}

/// Errors returned by the allocator, the kernel mapper and address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical block of the needed order, or no kernel virtual window
    OutOfMemory,
    /// Fault not covered by a region, or not permitted by it
    AccessViolation,
    /// Zero-length, unaligned or out-of-object request
    InvalidArgument,
    /// Demand-paging read failed
    Io(IoError),
    /// Interface misuse
    Usage(UsageError),
}

impl VmError {
    /// Whether the process layer must treat this as unrecoverable kernel state.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, VmError::Usage(_))
    }
}

impl From<IoError> for VmError {
    fn from(err: IoError) -> Self {
        VmError::Io(err)
    }
}

impl From<UsageError> for VmError {
    fn from(err: UsageError) -> Self {
        VmError::Usage(err)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::AccessViolation => write!(f, "access violation"),
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::Io(err) => write!(f, "I/O failure: {}", err),
            VmError::Usage(err) => write!(f, "usage error: {}", err),
        }
    }
}
