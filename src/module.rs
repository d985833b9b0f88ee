//! Loaded-module queries: handles, allocation bases and PE image sizes.

use core::ffi::c_void;
use std::ffi::CString;
use std::mem::MaybeUninit;

use windows_sys::Win32::System::LibraryLoader::GetModuleHandleA;
use windows_sys::Win32::System::Memory::{VirtualQuery, MEMORY_BASIC_INFORMATION};
use windows_sys::Win32::System::SystemServices::{IMAGE_DOS_HEADER, IMAGE_NT_SIGNATURE};

use crate::address::Address;

#[cfg(target_pointer_width = "32")]
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS32 as IMAGE_NT_HEADERS;
#[cfg(target_pointer_width = "64")]
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS64 as IMAGE_NT_HEADERS;

/// Handle of the executable module itself.
#[must_use]
pub fn executable_module_handle() -> Address {
    Address::new(unsafe { GetModuleHandleA(std::ptr::null()) } as usize)
}

/// Handle of a loaded module by name, zero when it is not loaded.
#[must_use]
pub fn module_handle(name: &str) -> Address {
    let Ok(name) = CString::new(name) else {
        return Address::NULL;
    };
    Address::new(unsafe { GetModuleHandleA(name.as_ptr().cast()) } as usize)
}

/// Allocation base of the region containing `handle`.
#[must_use]
pub fn module_allocation_base(handle: Address) -> Address {
    let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { MaybeUninit::zeroed().assume_init() };
    let written = unsafe {
        VirtualQuery(
            handle.as_ptr::<c_void>(),
            &mut mbi,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written != std::mem::size_of::<MEMORY_BASIC_INFORMATION>() {
        return Address::NULL;
    }
    Address::new(mbi.AllocationBase as usize)
}

/// Size of the PE image mapped at `allocation_base`, zero when the headers
/// do not check out.
///
/// # Safety
///
/// `allocation_base` must be the base of a mapped PE image.
#[must_use]
pub unsafe fn module_image_size(allocation_base: Address) -> usize {
    let dos = &*allocation_base.as_ptr::<IMAGE_DOS_HEADER>();
    let headers =
        &*((allocation_base + dos.e_lfanew as usize).as_ptr::<IMAGE_NT_HEADERS>());

    if headers.Signature != IMAGE_NT_SIGNATURE {
        return 0;
    }

    headers.OptionalHeader.SizeOfImage as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_module_is_resolvable() {
        let handle = executable_module_handle();
        assert!(handle.valid());
        assert_eq!(module_allocation_base(handle), handle);
        assert!(unsafe { module_image_size(handle) } > 0x1000);
    }

    #[test]
    fn missing_module_yields_null() {
        assert!(!module_handle("definitely-not-loaded.dll").valid());
    }
}
