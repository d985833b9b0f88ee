//! Grouped in-place byte patches with saved originals.
//!
//! A [`ScopedPatch`] owns a sequence of byte overwrites; installing snapshots
//! what it replaces (unless the builder supplied explicit original bytes) and
//! removal, or dropping the patch, writes the originals back.

use crate::address::Address;
use crate::ops;
use crate::protect::{Protection, ScopedProtect};

/// One byte-overwrite unit of a patch.
#[derive(Debug, Default)]
struct PatchUnit {
    address: Address,
    replacement: Vec<u8>,
    original: Vec<u8>,
}

impl PatchUnit {
    unsafe fn install(&mut self) -> bool {
        if !self.address.valid() || self.replacement.is_empty() {
            return false;
        }

        let guard = ScopedProtect::new(
            self.address,
            Protection::READ_WRITE_EXECUTE,
            self.replacement.len(),
        );
        if !guard.valid() {
            return false;
        }

        if self.original.is_empty() {
            let mut snapshot = vec![0u8; self.replacement.len()];
            if ops::copy(
                Address::from_mut_ptr(snapshot.as_mut_ptr()),
                self.address,
                snapshot.len(),
                false,
            )
            .is_err()
            {
                return false;
            }
            self.original = snapshot;
        }

        ops::copy(
            self.address,
            Address::from_ptr(self.replacement.as_ptr()),
            self.replacement.len(),
            false,
        )
        .is_ok()
    }

    unsafe fn remove(&self) -> bool {
        if !self.address.valid() || self.original.is_empty() {
            return false;
        }

        ops::copy(
            self.address,
            Address::from_ptr(self.original.as_ptr()),
            self.original.len(),
            true,
        )
        .is_ok()
    }
}

/// A group of installed byte patches, reverted on removal or drop.
#[derive(Debug, Default)]
pub struct ScopedPatch {
    units: Vec<PatchUnit>,
    installed: bool,
}

impl ScopedPatch {
    /// Applies every unit in order. Stops at the first failure.
    ///
    /// # Safety
    ///
    /// Every unit's target range must be valid process memory that no other
    /// thread concurrently executes or mutates.
    pub unsafe fn install(&mut self) -> bool {
        for unit in &mut self.units {
            if !unit.install() {
                return false;
            }
        }
        self.installed = true;
        true
    }

    /// Writes the original bytes of every unit back.
    ///
    /// # Safety
    ///
    /// Same contract as [`install`](Self::install).
    pub unsafe fn remove(&mut self) -> bool {
        let mut done = true;
        for unit in &self.units {
            done &= unit.remove();
        }
        self.installed = false;
        done
    }

    /// Number of units in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the group contains no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether the group is currently applied.
    #[must_use]
    pub fn installed(&self) -> bool {
        self.installed
    }
}

impl Drop for ScopedPatch {
    fn drop(&mut self) {
        if self.installed {
            unsafe { self.remove() };
        }
    }
}

/// Fluent construction of a [`ScopedPatch`].
///
/// Configure one unit at a time (`target` / `replace_with` /
/// `with_original_bytes`), seal it with [`add`](Self::add), then
/// [`build`](Self::build) the group. An unsealed unit is added implicitly.
#[derive(Debug, Default)]
pub struct PatchBuilder {
    patch: ScopedPatch,
    unit: PatchUnit,
}

impl PatchBuilder {
    /// Starts a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or offsets the current unit's target address.
    #[must_use]
    pub fn target(mut self, address: Address) -> Self {
        if self.unit.address.valid() {
            self.unit.address = self.unit.address + address;
        } else {
            self.unit.address = address;
        }
        self
    }

    /// Rebases the current unit onto a loaded module.
    #[cfg(windows)]
    #[must_use]
    pub fn offset_in_module(mut self, name: &str) -> Self {
        let handle = crate::module::module_handle(name);
        if handle.valid() {
            self.unit.address = self.unit.address + handle;
        }
        self
    }

    /// Sets the replacement bytes from a typed value.
    #[must_use]
    pub fn replace_with<T: Copy>(self, value: T) -> Self {
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(value).cast::<u8>(),
                std::mem::size_of::<T>(),
            )
        }
        .to_vec();
        self.replace_with_bytes(bytes)
    }

    /// Sets the replacement bytes.
    #[must_use]
    pub fn replace_with_bytes(mut self, replacement: Vec<u8>) -> Self {
        self.unit.replacement = replacement;
        self
    }

    /// Overrides the bytes that removal restores.
    #[must_use]
    pub fn with_original_bytes(mut self, original: Vec<u8>) -> Self {
        self.unit.original = original;
        self
    }

    /// Seals the current unit and starts the next one.
    #[must_use]
    pub fn add(mut self) -> Self {
        self.patch.units.push(std::mem::take(&mut self.unit));
        self
    }

    /// Finishes the group.
    #[must_use]
    pub fn build(mut self) -> ScopedPatch {
        if self.unit.address.valid() {
            self = self.add();
        }
        self.patch
    }
}
