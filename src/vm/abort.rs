//! ARM64 Abort Decoding
//!
//! Turns the syndrome of a synchronous exception into a fault request for
//! [`AddressSpace::handle_fault`].
//!
//! # Exception Classes
//! - Instruction aborts become `EXECUTE` faults
//! - Data aborts become `READ` or `WRITE` faults by the WnR bit
//! - Anything else is not a memory fault

use log::trace;

use super::flags::AccessFlags;
use super::space::AddressSpace;
use crate::mm::address::VirtAddr;
use crate::mm::error::VmError;

/// Exception class extracted from ESR_EL1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionClass {
    Unknown = 0x00,
    SvcAarch64 = 0x15,
    InstructionAbortLowerEl = 0x20,
    InstructionAbortSameEl = 0x21,
    DataAbortLowerEl = 0x24,
    DataAbortSameEl = 0x25,
    Other = 0xFF,
}

impl From<u64> for ExceptionClass {
    fn from(esr: u64) -> Self {
        match (esr >> ESR_EC_SHIFT) & 0x3F {
            0x00 => ExceptionClass::Unknown,
            0x15 => ExceptionClass::SvcAarch64,
            0x20 => ExceptionClass::InstructionAbortLowerEl,
            0x21 => ExceptionClass::InstructionAbortSameEl,
            0x24 => ExceptionClass::DataAbortLowerEl,
            0x25 => ExceptionClass::DataAbortSameEl,
            _ => ExceptionClass::Other,
        }
    }
}

const ESR_EC_SHIFT: u64 = 26;
/// Write-not-Read, data aborts only
const ISS_WNR: u64 = 1 << 6;
/// Cache maintenance; reported as a write but only needs read access
const ISS_CM: u64 = 1 << 8;

/// A decoded memory abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortInfo {
    pub addr: VirtAddr,
    pub access: AccessFlags,
    /// Taken from EL0
    pub from_user: bool,
}

/// Decode ESR_EL1/FAR_EL1 of a synchronous exception.
///
/// Returns `None` for exceptions that are not memory aborts.
pub fn decode_abort(esr: u64, far: u64) -> Option<AbortInfo> {
    let class = ExceptionClass::from(esr);
    let access = match class {
        ExceptionClass::InstructionAbortLowerEl | ExceptionClass::InstructionAbortSameEl => {
            AccessFlags::EXECUTE
        }
        ExceptionClass::DataAbortLowerEl | ExceptionClass::DataAbortSameEl => {
            if esr & ISS_WNR != 0 && esr & ISS_CM == 0 {
                AccessFlags::WRITE
            } else {
                AccessFlags::READ
            }
        }
        _ => return None,
    };
    Some(AbortInfo {
        addr: VirtAddr::new(far as usize),
        access,
        from_user: matches!(
            class,
            ExceptionClass::InstructionAbortLowerEl | ExceptionClass::DataAbortLowerEl
        ),
    })
}

/// Resolve the abort described by `esr` and `far` in `space`.
///
/// # Errors
/// `InvalidArgument` if the exception is not a memory abort, otherwise
/// whatever [`AddressSpace::handle_fault`] reports.
pub fn resolve_abort(space: &AddressSpace, esr: u64, far: u64) -> Result<(), VmError> {
    let Some(abort) = decode_abort(esr, far) else {
        trace!(target: "vm::fault", "ESR {:#x} is not an abort", esr);
        return Err(VmError::InvalidArgument);
    };
    trace!(
        target: "vm::fault",
        "{:?} abort at {} ({})",
        abort.access,
        abort.addr,
        if abort.from_user { "EL0" } else { "EL1" }
    );
    space.handle_fault(abort.addr, abort.access)
}
