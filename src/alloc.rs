//! Executable memory allocation.
//!
//! Pages come back readable, writeable and executable; `allocate_at` honors
//! a base address discovered through [`crate::memmap::find_free_page`] so
//! that codecaves can land within `rel32` reach of their target.

use crate::address::Address;

#[cfg(windows)]
mod imp {
    use super::*;
    use core::ffi::c_void;

    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    /// Reserves and commits `size` RWX bytes anywhere in the address
    /// space, or reports the OS error code.
    pub fn allocate(size: usize) -> Result<Address, u32> {
        let block = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if block.is_null() {
            return Err(unsafe { GetLastError() });
        }
        Ok(Address::from_mut_ptr(block))
    }

    /// Reserves and commits `size` RWX bytes at `address`, which must be
    /// a free, granularity-aligned base.
    pub fn allocate_at(address: Address, size: usize) -> Result<Address, u32> {
        let block = unsafe {
            VirtualAlloc(
                address.as_ptr::<c_void>(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if block.is_null() {
            return Err(unsafe { GetLastError() });
        }
        Ok(Address::from_mut_ptr(block))
    }

    /// Releases an allocation made by [`allocate`] or [`allocate_at`].
    pub fn deallocate(address: Address, _size: usize) -> bool {
        unsafe { VirtualFree(address.as_mut_ptr::<c_void>(), 0, MEM_RELEASE) != 0 }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use core::ffi::c_void;

    fn errno() -> u32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32
    }

    fn rwx_map(address: *mut c_void, size: usize, flags: i32) -> *mut c_void {
        unsafe {
            libc::mmap(
                address,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                flags,
                -1,
                0,
            )
        }
    }

    /// Maps `size` RWX bytes anywhere in the address space, or reports
    /// `errno`.
    pub fn allocate(size: usize) -> Result<Address, u32> {
        let block = rwx_map(
            std::ptr::null_mut(),
            size,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        );
        if block == libc::MAP_FAILED {
            return Err(errno());
        }
        Ok(Address::from_mut_ptr(block))
    }

    /// Maps `size` RWX bytes at `address`, which must be a free,
    /// page-aligned base.
    pub fn allocate_at(address: Address, size: usize) -> Result<Address, u32> {
        let mut block = rwx_map(
            address.as_mut_ptr(),
            size,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
        );
        // Older kernels reject MAP_FIXED_NOREPLACE; retry with a hint only.
        if block == libc::MAP_FAILED && errno() == libc::EOPNOTSUPP as u32 {
            block = rwx_map(
                address.as_mut_ptr(),
                size,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            );
        }
        if block == libc::MAP_FAILED {
            return Err(errno());
        }
        Ok(Address::from_mut_ptr(block))
    }

    /// Unmaps an allocation made by [`allocate`] or [`allocate_at`].
    pub fn deallocate(address: Address, size: usize) -> bool {
        unsafe { libc::munmap(address.as_mut_ptr::<c_void>(), size) == 0 }
    }
}

pub use imp::{allocate, allocate_at, deallocate};

/// An owning guard over an executable allocation.
///
/// Allocates on construction, releases on drop. A failed allocation leaves
/// the guard in a disarmed state reporting the OS error code.
#[derive(Debug)]
pub struct ScopedMemoryBlock {
    block: Address,
    size: usize,
    allocated: bool,
    errcode: u32,
}

impl ScopedMemoryBlock {
    /// Allocates `size` executable bytes anywhere in the address space.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::finish(allocate(size), size)
    }

    /// Allocates `size` executable bytes at the given free base address.
    #[must_use]
    pub fn at(address: Address, size: usize) -> Self {
        Self::finish(allocate_at(address, size), size)
    }

    fn finish(result: Result<Address, u32>, size: usize) -> Self {
        match result {
            Ok(block) => Self {
                block,
                size,
                allocated: true,
                errcode: 0,
            },
            Err(errcode) => Self {
                block: Address::NULL,
                size,
                allocated: false,
                errcode,
            },
        }
    }

    /// The base address of the allocation, zero when allocation failed.
    #[must_use]
    pub fn get(&self) -> Address {
        self.block
    }

    /// The requested allocation size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the allocation succeeded and is still owned.
    #[must_use]
    pub fn allocated(&self) -> bool {
        self.allocated
    }

    /// The OS error code of a failed allocation, zero on success.
    #[must_use]
    pub fn error(&self) -> u32 {
        self.errcode
    }

    /// Releases the allocation now, reporting whether the OS accepted it.
    pub fn free(mut self) -> bool {
        if !self.allocated {
            return false;
        }
        self.allocated = false;
        deallocate(self.block, self.size)
    }

    /// Gives up ownership without releasing the pages.
    ///
    /// Used when emitted code must stay alive past the guard, e.g. a
    /// transparent codecave that an outer hook chain still runs through.
    pub fn leak(mut self) -> Address {
        self.allocated = false;
        self.block
    }
}

impl Drop for ScopedMemoryBlock {
    fn drop(&mut self) {
        if self.allocated {
            deallocate(self.block, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmap;

    #[test]
    fn allocates_writable_executable_memory() {
        let block = ScopedMemoryBlock::new(0x1000);
        assert!(block.allocated());
        assert!(block.get().valid());
        assert_eq!(block.error(), 0);
        assert_eq!(block.size(), 0x1000);

        unsafe {
            // A stub that just returns: C3.
            *block.get().as_mut_ptr::<u8>() = 0xc3;
            let stub: extern "C" fn() = std::mem::transmute(block.get().value());
            stub();
        }
    }

    #[test]
    fn allocate_at_honors_the_hint() {
        let anchor = [0u8; 16];
        let hint = memmap::find_free_page(Address::from_ptr(anchor.as_ptr()), 0x4000_0000);
        assert!(hint.valid());

        let block = ScopedMemoryBlock::at(hint, 0x1000);
        assert!(block.allocated(), "error code {}", block.error());
        assert!(block
            .get()
            .value()
            .abs_diff(anchor.as_ptr() as usize)
            < 0x8000_0000);
    }

    #[test]
    fn failed_allocation_reports_an_error() {
        // The region holding this function's code is already occupied.
        let taken = Address::from_ptr(failed_allocation_reports_an_error as *const ());
        let block = ScopedMemoryBlock::at(taken, 0x1000);
        assert!(!block.allocated());
        assert!(!block.get().valid());
        assert_ne!(block.error(), 0);
    }

    #[test]
    fn explicit_free_releases_the_pages() {
        let block = ScopedMemoryBlock::new(0x1000);
        let base = block.get();
        assert!(block.free());
        assert!(memmap::is_memory_page_free(base));
    }
}
