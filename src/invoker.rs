//! Type-safe invocation of code at an arbitrary address.

use crate::address::Address;
use crate::fun::Function;

/// Calls the code at `fun` as a function of type `F`, forwarding `args`.
///
/// The calling convention is taken from `F`; on x86-64 every hookable
/// signature uses the Win64 convention.
///
/// # Safety
///
/// `fun` must be the address of executable code honoring exactly the
/// signature and convention of `F`.
pub unsafe fn invoke<F: Function>(fun: Address, args: F::Arguments) -> F::Output {
    F::invoke(fun, args)
}

#[cfg(test)]
#[cfg(target_arch = "x86_64")]
mod tests {
    use super::*;

    extern "win64" fn scale(value: f64, by: f64) -> f64 {
        value * by
    }

    #[test]
    fn invokes_through_a_raw_address() {
        type ScaleFn = extern "win64" fn(f64, f64) -> f64;
        let addr = Address::from_ptr((scale as ScaleFn).to_ptr());
        let result = unsafe { invoke::<ScaleFn>(addr, (21.0, 2.0)) };
        assert!((result - 42.0).abs() < f64::EPSILON);
    }
}
