//! Low-level memory operations.
//!
//! Typed reads and writes, byte-range copy/fill/compare. Each mutating
//! operation optionally wraps a scoped RWX protection change and always
//! flushes the instruction cache afterwards, so patched code is what the
//! CPU fetches next.

use std::cmp::Ordering;

use crate::address::Address;
use crate::err::MemError;
use crate::protect::{self, Protection, ScopedProtect};

/// Flushes the instruction cache for `[address, address + size)`.
///
/// A no-op outside Windows; x86 keeps code and data caches coherent and the
/// kernel handles cross-core shootdown on mprotect.
pub fn flush(address: Address, size: usize) -> bool {
    #[cfg(windows)]
    {
        use core::ffi::c_void;
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        unsafe {
            FlushInstructionCache(GetCurrentProcess(), address.as_ptr::<c_void>(), size) != 0
        }
    }
    #[cfg(not(windows))]
    {
        let _ = (address, size);
        true
    }
}

fn unprotect_for(address: Address, size: usize) -> Result<ScopedProtect, MemError> {
    let guard = ScopedProtect::new(address, Protection::READ_WRITE_EXECUTE, size);
    if !guard.valid() {
        return Err(MemError::InvalidProtectChange);
    }
    Ok(guard)
}

/// Reads a `T` from `address`.
///
/// With `unprotect` set, the page range is temporarily made RWX; otherwise
/// the current protection must already allow reading.
///
/// # Safety
///
/// `address` must point to at least `size_of::<T>()` bytes holding a valid
/// bit pattern for `T`.
pub unsafe fn read<T: Copy>(address: Address, unprotect: bool) -> Result<T, MemError> {
    if !address.valid() {
        return Err(MemError::InvalidAddress);
    }

    if !unprotect && !protect::is_readable(address) {
        return Err(MemError::UnreadableMemory);
    }

    let _guard = if unprotect {
        Some(unprotect_for(address, std::mem::size_of::<T>())?)
    } else {
        None
    };

    Ok(std::ptr::read_unaligned(address.as_ptr::<T>()))
}

/// Writes `value` to `address` and flushes the instruction cache.
///
/// # Safety
///
/// `address` must point to at least `size_of::<T>()` writable (or
/// unprotectable) bytes not concurrently accessed by other threads.
pub unsafe fn write<T: Copy>(address: Address, value: T, unprotect: bool) -> Result<(), MemError> {
    if !address.valid() {
        return Err(MemError::InvalidAddress);
    }

    if !unprotect && !protect::is_writeable(address) {
        return Err(MemError::UnwriteableMemory);
    }

    let _guard = if unprotect {
        Some(unprotect_for(address, std::mem::size_of::<T>())?)
    } else {
        None
    };

    std::ptr::write_unaligned(address.as_mut_ptr::<T>(), value);
    flush(address, std::mem::size_of::<T>());

    Ok(())
}

/// Copies `size` bytes from `src` to `dest` and flushes the instruction
/// cache for the destination.
///
/// # Safety
///
/// Both ranges must be valid for `size` bytes; the destination must be
/// writable or unprotectable and not concurrently accessed.
pub unsafe fn copy(
    dest: Address,
    src: Address,
    size: usize,
    unprotect: bool,
) -> Result<(), MemError> {
    if size == 0 {
        return Err(MemError::NullSize);
    }

    if !dest.valid() {
        return Err(MemError::InvalidDestination);
    }

    if !src.valid() {
        return Err(MemError::InvalidSource);
    }

    if !unprotect && !protect::is_writeable(dest) {
        return Err(MemError::UnwriteableMemory);
    }

    let _guard = if unprotect {
        Some(unprotect_for(dest, size)?)
    } else {
        None
    };

    std::ptr::copy(src.as_ptr::<u8>(), dest.as_mut_ptr::<u8>(), size);
    flush(dest, size);

    Ok(())
}

/// Fills `size` bytes at `dest` with `value` and flushes the instruction
/// cache.
///
/// # Safety
///
/// The destination range must be valid for `size` bytes, writable or
/// unprotectable, and not concurrently accessed.
pub unsafe fn fill(
    dest: Address,
    value: u8,
    size: usize,
    unprotect: bool,
) -> Result<(), MemError> {
    if size == 0 {
        return Err(MemError::NullSize);
    }

    if !dest.valid() {
        return Err(MemError::InvalidAddress);
    }

    if !unprotect && !protect::is_writeable(dest) {
        return Err(MemError::UnwriteableMemory);
    }

    let _guard = if unprotect {
        Some(unprotect_for(dest, size)?)
    } else {
        None
    };

    std::ptr::write_bytes(dest.as_mut_ptr::<u8>(), value, size);
    flush(dest, size);

    Ok(())
}

/// Compares `size` bytes at `buf0` and `buf1`.
///
/// Returns the sign of the first differing byte pair, zero when the ranges
/// are equal.
///
/// # Safety
///
/// Both ranges must be valid and readable for `size` bytes.
pub unsafe fn compare(buf0: Address, buf1: Address, size: usize) -> Result<i32, MemError> {
    if size == 0 {
        return Err(MemError::NullSize);
    }

    if !buf0.valid() || !buf1.valid() {
        return Err(MemError::InvalidAddress);
    }

    let lhs = std::slice::from_raw_parts(buf0.as_ptr::<u8>(), size);
    let rhs = std::slice::from_raw_parts(buf1.as_ptr::<u8>(), size);

    Ok(match lhs.cmp(rhs) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}
