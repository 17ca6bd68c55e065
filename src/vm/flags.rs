//! Region and access flags

use core::fmt;

use bitflags::bitflags;

use crate::mm::paging::MapFlags;

bitflags! {
    /// Permission and sharing attributes of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Kernel-only region
        const KERNEL = 1 << 3;
        /// Accessible from user mode
        const USER = 1 << 4;
        /// Writes stay within this mapping
        const PRIVATE = 1 << 5;
        /// Shared pages are copied on the first write
        const COW = 1 << 6;
        /// Pages are brought in by the fault handler
        const FAULT = 1 << 7;
        /// Machine-dependent; survives `prepare_for_execute`
        const MD = 1 << 8;
        /// Skipped by `clone_into`
        const NO_CLONE = 1 << 9;
    }
}

bitflags! {
    /// The access that caused a fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl AreaFlags {
    /// Translation permissions implied by these flags.
    pub fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::empty();
        if self.contains(AreaFlags::READ) {
            flags |= MapFlags::READ;
        }
        if self.contains(AreaFlags::WRITE) {
            flags |= MapFlags::WRITE;
        }
        if self.contains(AreaFlags::EXECUTE) {
            flags |= MapFlags::EXECUTE;
        }
        if self.contains(AreaFlags::USER) {
            flags |= MapFlags::USER;
        }
        flags
    }

    /// Whether an access of kind `access` is allowed at all.
    pub fn permits(self, access: AccessFlags) -> bool {
        (!access.contains(AccessFlags::WRITE) || self.contains(AreaFlags::WRITE))
            && (!access.contains(AccessFlags::EXECUTE) || self.contains(AreaFlags::EXECUTE))
    }

    /// Compact `rwxkupcfmn` rendering, `-` for clear bits.
    pub fn letters(self) -> FlagLetters {
        FlagLetters(self)
    }
}

/// Display adapter returned by [`AreaFlags::letters`].
pub struct FlagLetters(AreaFlags);

impl fmt::Display for FlagLetters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [(AreaFlags, char); 10] = [
            (AreaFlags::READ, 'r'),
            (AreaFlags::WRITE, 'w'),
            (AreaFlags::EXECUTE, 'x'),
            (AreaFlags::KERNEL, 'k'),
            (AreaFlags::USER, 'u'),
            (AreaFlags::PRIVATE, 'p'),
            (AreaFlags::COW, 'c'),
            (AreaFlags::FAULT, 'f'),
            (AreaFlags::MD, 'm'),
            (AreaFlags::NO_CLONE, 'n'),
        ];
        for (flag, letter) in LETTERS {
            let c = if self.0.contains(flag) { letter } else { '-' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}
