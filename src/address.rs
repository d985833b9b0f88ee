use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitOr, Rem, Sub, SubAssign};

/// A machine-word-sized address value.
///
/// Wraps a process address as an integer so that the rest of the crate can
/// take one parameter type instead of overloading over `*const T`,
/// `*mut T` and `usize`. The stored value is either zero or a bit-exact
/// reinterpretation of a pointer into the process address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The zero (invalid) address.
    pub const NULL: Address = Address(0);

    /// Creates an address from a raw integer value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Creates an address from a raw pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Creates an address from a mutable raw pointer.
    #[must_use]
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Projects the address to a typed constant pointer.
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Projects the address to a typed mutable pointer.
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Whether the address is non-zero.
    #[must_use]
    pub const fn valid(self) -> bool {
        self.0 != 0
    }

    /// Wrapping addition of a signed offset.
    #[must_use]
    pub fn offset(self, delta: isize) -> Self {
        Self(self.0.wrapping_add(delta as usize))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl<T> From<*const T> for Address {
    fn from(ptr: *const T) -> Self {
        Self::from_ptr(ptr)
    }
}

impl<T> From<*mut T> for Address {
    fn from(ptr: *mut T) -> Self {
        Self::from_mut_ptr(ptr)
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Add<Address> for Address {
    type Output = Address;

    fn add(self, rhs: Address) -> Address {
        Address(self.0.wrapping_add(rhs.0))
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    fn sub(self, rhs: usize) -> Address {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Address> for Address {
    type Output = Address;

    fn sub(self, rhs: Address) -> Address {
        Address(self.0.wrapping_sub(rhs.0))
    }
}

impl AddAssign<usize> for Address {
    fn add_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl SubAssign<usize> for Address {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl BitAnd<usize> for Address {
    type Output = Address;

    fn bitand(self, rhs: usize) -> Address {
        Address(self.0 & rhs)
    }
}

impl BitOr<usize> for Address {
    type Output = Address;

    fn bitor(self, rhs: usize) -> Address {
        Address(self.0 | rhs)
    }
}

impl Rem<usize> for Address {
    type Output = usize;

    fn rem(self, rhs: usize) -> usize {
        self.0 % rhs
    }
}
