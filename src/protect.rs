//! Page-protection queries and the scoped protection guard.
//!
//! Every protection mutation in this crate goes through [`ScopedProtect`];
//! the guard's lifetime must enclose all reads and writes it authorises.
//! OS failures collapse to [`Protection::NONE`], which callers observe
//! through [`ScopedProtect::valid`].

use bitflags::bitflags;

use crate::address::Address;

bitflags! {
    /// A page-protection kind.
    ///
    /// `NONE` marks an unknown or failed query; `NO_ACCESS` is a real,
    /// mapped-but-inaccessible state. The conversion to OS constants is
    /// injective on Windows and lossy elsewhere (several native values can
    /// collapse onto one kind).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        /// Unknown protection; the result of a failed query or change.
        const NONE = 1 << 0;
        /// Mapped but inaccessible.
        const NO_ACCESS = 1 << 1;
        /// Readable.
        const READ = 1 << 2;
        /// Writeable.
        const WRITE = 1 << 3;
        /// Executable.
        const EXECUTE = 1 << 4;
        /// Readable and writeable.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Readable and executable.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Readable, writeable and executable.
        const READ_WRITE_EXECUTE =
            Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use core::ffi::c_void;

    use windows_sys::Win32::System::Memory::{
        VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE,
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    /// Maps a native page-protection constant onto a [`Protection`] kind.
    #[must_use]
    pub fn to_protection_kind(native: u32) -> Protection {
        match native {
            PAGE_NOACCESS => Protection::NO_ACCESS,
            PAGE_READONLY => Protection::READ,
            PAGE_READWRITE => Protection::READ_WRITE,
            PAGE_EXECUTE => Protection::EXECUTE,
            PAGE_EXECUTE_READ => Protection::READ_EXECUTE,
            PAGE_EXECUTE_READWRITE => Protection::READ_WRITE_EXECUTE,
            _ => Protection::NONE,
        }
    }

    /// Maps a [`Protection`] kind onto its native page-protection constant.
    #[must_use]
    pub fn from_protection_kind(protect: Protection) -> u32 {
        if protect == Protection::NO_ACCESS {
            PAGE_NOACCESS
        } else if protect == Protection::READ {
            PAGE_READONLY
        } else if protect == Protection::READ_WRITE {
            PAGE_READWRITE
        } else if protect == Protection::EXECUTE {
            PAGE_EXECUTE
        } else if protect == Protection::READ_EXECUTE {
            PAGE_EXECUTE_READ
        } else if protect == Protection::READ_WRITE_EXECUTE {
            PAGE_EXECUTE_READWRITE
        } else {
            0
        }
    }

    /// Protection of the page containing `address`, `NONE` on failure.
    pub fn get_protect(address: Address) -> Protection {
        let mut mbi: MEMORY_BASIC_INFORMATION =
            unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
        let written = unsafe {
            VirtualQuery(
                address.as_ptr::<c_void>(),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Protection::NONE;
        }
        to_protection_kind(mbi.Protect)
    }

    /// Changes the protection of the pages covering `[address, address +
    /// size)`, returning the prior kind or `NONE` on failure.
    pub fn set_protect(address: Address, new_protect: Protection, size: usize) -> Protection {
        let mut old_protection = 0u32;
        let ok = unsafe {
            VirtualProtect(
                address.as_ptr::<c_void>(),
                size,
                from_protection_kind(new_protect),
                &mut old_protection,
            )
        };
        if ok == 0 {
            return Protection::NONE;
        }
        to_protection_kind(old_protection)
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use core::ffi::c_void;

    use crate::memmap;

    /// Maps native `PROT_*` bits onto a [`Protection`] kind.
    #[must_use]
    pub fn to_protection_kind(native: i32) -> Protection {
        if native == libc::PROT_NONE {
            return Protection::NO_ACCESS;
        }

        let mut protect = Protection::empty();
        if native & libc::PROT_READ != 0 {
            protect |= Protection::READ;
        }
        if native & libc::PROT_WRITE != 0 {
            protect |= Protection::WRITE;
        }
        if native & libc::PROT_EXEC != 0 {
            protect |= Protection::EXECUTE;
        }
        protect
    }

    /// Maps a [`Protection`] kind onto native `PROT_*` bits.
    ///
    /// Both `NONE` and `NO_ACCESS` collapse onto `PROT_NONE`.
    #[must_use]
    pub fn from_protection_kind(protect: Protection) -> i32 {
        let mut native = libc::PROT_NONE;
        if protect.contains(Protection::READ) {
            native |= libc::PROT_READ;
        }
        if protect.contains(Protection::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if protect.contains(Protection::EXECUTE) {
            native |= libc::PROT_EXEC;
        }
        native
    }

    /// Protection of the region containing `address`, `NONE` on failure.
    pub fn get_protect(address: Address) -> Protection {
        memmap::region_at(address).map_or(Protection::NONE, |region| region.protect)
    }

    /// Changes the protection of the pages covering `[address, address +
    /// size)`, returning the prior kind or `NONE` on failure.
    pub fn set_protect(address: Address, new_protect: Protection, size: usize) -> Protection {
        let prior = get_protect(address);
        if prior == Protection::NONE {
            return Protection::NONE;
        }

        // mprotect insists on page alignment; widen the range to page bounds.
        let page = memmap::allocation_granularity();
        let begin = address.value() - address.value() % page;
        let end = address.value() + size;
        let len = (end - begin + page - 1) / page * page;

        let ret = unsafe {
            libc::mprotect(
                begin as *mut c_void,
                len,
                from_protection_kind(new_protect),
            )
        };
        if ret != 0 {
            return Protection::NONE;
        }
        prior
    }
}

pub use imp::{from_protection_kind, get_protect, set_protect, to_protection_kind};

/// Whether the page containing `address` is readable.
#[must_use]
pub fn is_readable(address: Address) -> bool {
    get_protect(address).contains(Protection::READ)
}

/// Whether the page containing `address` is writeable.
#[must_use]
pub fn is_writeable(address: Address) -> bool {
    get_protect(address).contains(Protection::WRITE)
}

/// Whether the page containing `address` is executable.
#[must_use]
pub fn is_executable(address: Address) -> bool {
    get_protect(address).contains(Protection::EXECUTE)
}

/// A scoped page-protection change.
///
/// While alive and [`valid`](Self::valid), the range holds the requested
/// protection; dropping the guard restores the prior kind iff the initial
/// change succeeded.
#[derive(Debug)]
pub struct ScopedProtect {
    address: Address,
    size: usize,
    prior: Protection,
}

impl ScopedProtect {
    /// Changes the protection of `[address, address + size)` to `protect`.
    ///
    /// Check [`valid`](Self::valid) before relying on the new protection.
    #[must_use]
    pub fn new(address: Address, protect: Protection, size: usize) -> Self {
        let prior = if address.valid() {
            set_protect(address, protect, size)
        } else {
            Protection::NONE
        };
        Self {
            address,
            size,
            prior,
        }
    }

    /// Whether the initial protection change succeeded.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.address.valid() && self.prior != Protection::NONE
    }

    /// The prior protection kind, `NONE` when the change failed.
    #[must_use]
    pub fn prior(&self) -> Protection {
        self.prior
    }
}

impl Drop for ScopedProtect {
    fn drop(&mut self) {
        if self.valid() {
            set_protect(self.address, self.prior, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ScopedMemoryBlock;

    #[test]
    fn conversion_round_trips() {
        for kind in [
            Protection::NO_ACCESS,
            Protection::READ,
            Protection::READ_WRITE,
            Protection::READ_EXECUTE,
            Protection::READ_WRITE_EXECUTE,
        ] {
            assert_eq!(to_protection_kind(from_protection_kind(kind)), kind);
        }
    }

    #[cfg(windows)]
    #[test]
    fn conversion_round_trips_execute_alone() {
        assert_eq!(
            to_protection_kind(from_protection_kind(Protection::EXECUTE)),
            Protection::EXECUTE
        );
    }

    #[test]
    fn scoped_protect_restores_prior_kind() {
        let block = ScopedMemoryBlock::new(0x1000);
        assert!(block.allocated());
        assert_eq!(get_protect(block.get()), Protection::READ_WRITE_EXECUTE);

        {
            let guard = ScopedProtect::new(block.get(), Protection::READ, block.size());
            assert!(guard.valid());
            assert_eq!(guard.prior(), Protection::READ_WRITE_EXECUTE);
            assert!(get_protect(block.get()).contains(Protection::READ));
            assert!(!is_writeable(block.get()));
        }

        assert_eq!(get_protect(block.get()), Protection::READ_WRITE_EXECUTE);
        assert!(is_writeable(block.get()));
        assert!(is_executable(block.get()));
    }

    #[test]
    fn invalid_address_yields_invalid_guard() {
        let guard = ScopedProtect::new(Address::NULL, Protection::READ_WRITE, 16);
        assert!(!guard.valid());
        assert_eq!(guard.prior(), Protection::NONE);
    }

    #[test]
    fn own_code_is_executable() {
        let probe = conversion_round_trips as *const ();
        assert!(is_executable(Address::from_ptr(probe)));
        assert!(is_readable(Address::from_ptr(probe)));
    }
}
