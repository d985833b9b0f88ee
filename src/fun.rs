//! Compile-time classification of hookable function types.
//!
//! [`Function`] is implemented for safe and unsafe `extern` fn pointer
//! types of arity 0..=8. It carries everything the hook engine needs to
//! know about a signature at codecave-generation time: the calling
//! convention, the arity, whether the return value travels through a hidden
//! caller-allocated slot, how to call an arbitrary address with that
//! signature, and the per-signature relay thunk.
//!
//! On 32-bit x86 the four Microsoft conventions are distinct; on x86-64 the
//! lattice collapses to the single Win64 convention.

use crate::address::Address;
use crate::hook::HookState;

/// A calling convention of a hookable function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Caller-cleans stack convention.
    Cdecl,
    /// Callee-cleans stack convention.
    Stdcall,
    /// `this` in ECX, callee cleans.
    Thiscall,
    /// First two register-sized arguments in ECX/EDX, callee cleans.
    Fastcall,
    /// The sole 64-bit Windows convention.
    Win64,
}

/// Whether the Microsoft ABI returns a value of `size` bytes through a
/// hidden caller-allocated slot whose pointer is passed as the leading
/// argument.
#[must_use]
pub const fn returns_via_hidden_ptr(size: usize) -> bool {
    if cfg!(target_arch = "x86_64") {
        !matches!(size, 0 | 1 | 2 | 4 | 8)
    } else {
        size > 8
    }
}

/// A function pointer type that can be hooked and invoked by address.
///
/// Implemented by this crate for extern fn pointers; not meant to be
/// implemented downstream.
///
/// # Safety
///
/// Implementations must describe the machine-level signature exactly:
/// `invoke` transmutes the given address to `Self` and the hook engine
/// generates code from `CONVENTION`, `ARITY` and `RETURN_VIA_HIDDEN_PTR`.
pub unsafe trait Function: Sized + Copy + 'static {
    /// The argument types as a tuple.
    type Arguments;

    /// The return type.
    type Output;

    /// The calling convention.
    const CONVENTION: Convention;

    /// The number of declared arguments.
    const ARITY: usize;

    /// Whether the return value is passed through a hidden pointer.
    const RETURN_VIA_HIDDEN_PTR: bool;

    /// Reconstructs the function pointer from an untyped pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be the address of a function of this exact signature.
    unsafe fn from_ptr(ptr: *const ()) -> Self;

    /// The untyped address of this function.
    fn to_ptr(self) -> *const ();

    /// Calls the code at `fun` as a function of this signature.
    ///
    /// # Safety
    ///
    /// `fun` must be the address of executable code honoring this exact
    /// signature and convention.
    unsafe fn invoke(fun: Address, args: Self::Arguments) -> Self::Output;

    /// The relay thunk for this signature: same convention, one leading
    /// hook-state pointer argument, dispatching to the hook's callback or
    /// straight to its trampoline.
    fn relay() -> *const ();

    /// Whether the argument at `index` is passed in an XMM register slot
    /// (`f32`/`f64`). Out-of-range indices are not float.
    fn argument_is_float(index: usize) -> bool;
}

fn is_float_type<T: 'static>() -> bool {
    use std::any::TypeId;

    TypeId::of::<T>() == TypeId::of::<f32>() || TypeId::of::<T>() == TypeId::of::<f64>()
}

macro_rules! count_args {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count_args!($($tail)*) };
}

macro_rules! impl_function {
    ($fn_abi:literal, $relay_abi:literal, $conv:expr, ($($arg:ident),*)) => {
        impl_function!(@impl () $fn_abi, $relay_abi, $conv, ($($arg),*));
        impl_function!(@impl (unsafe) $fn_abi, $relay_abi, $conv, ($($arg),*));
    };

    (@impl ($($unsafety:tt)?) $fn_abi:literal, $relay_abi:literal, $conv:expr, ($($arg:ident),*)) => {
        unsafe impl<Ret: 'static, $($arg: 'static),*> Function
            for $($unsafety)? extern $fn_abi fn($($arg),*) -> Ret
        {
            type Arguments = ($($arg,)*);
            type Output = Ret;

            const CONVENTION: Convention = $conv;
            const ARITY: usize = count_args!($($arg)*);
            const RETURN_VIA_HIDDEN_PTR: bool =
                returns_via_hidden_ptr(std::mem::size_of::<Ret>());

            unsafe fn from_ptr(ptr: *const ()) -> Self {
                std::mem::transmute(ptr)
            }

            fn to_ptr(self) -> *const () {
                self as *const ()
            }

            #[allow(non_snake_case)]
            unsafe fn invoke(fun: Address, args: Self::Arguments) -> Ret {
                let target: Self = std::mem::transmute(fun.value());
                let ($($arg,)*) = args;
                target($($arg),*)
            }

            fn relay() -> *const () {
                #[allow(non_snake_case)]
                unsafe extern $relay_abi fn relay<Ret: 'static, $($arg: 'static),*>(
                    hook: *const HookState<$($unsafety)? extern $fn_abi fn($($arg),*) -> Ret>,
                    $($arg: $arg),*
                ) -> Ret {
                    let hook = &*hook;
                    match hook.callback() {
                        Some(callback) => callback(hook, ($($arg,)*)),
                        None => hook.call(($($arg,)*)),
                    }
                }

                relay::<Ret, $($arg),*> as *const ()
            }

            fn argument_is_float(index: usize) -> bool {
                let classes: [bool; count_args!($($arg)*)] = [$(is_float_type::<$arg>()),*];
                classes.get(index).copied().unwrap_or(false)
            }
        }
    };
}

macro_rules! impl_function_arities {
    ($fn_abi:literal, $relay_abi:literal, $conv:expr) => {
        impl_function!($fn_abi, $relay_abi, $conv, ());
        impl_function!($fn_abi, $relay_abi, $conv, (A1));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2, A3));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2, A3, A4));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2, A3, A4, A5));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2, A3, A4, A5, A6));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2, A3, A4, A5, A6, A7));
        impl_function!($fn_abi, $relay_abi, $conv, (A1, A2, A3, A4, A5, A6, A7, A8));
    };
}

#[cfg(target_arch = "x86_64")]
mod impls {
    use super::*;

    impl_function_arities!("win64", "win64", Convention::Win64);

    #[cfg(windows)]
    mod native {
        use super::*;

        impl_function_arities!("C", "win64", Convention::Win64);
        impl_function_arities!("system", "win64", Convention::Win64);
    }
}

#[cfg(target_arch = "x86")]
mod impls {
    use super::*;

    impl_function_arities!("cdecl", "cdecl", Convention::Cdecl);
    impl_function_arities!("stdcall", "stdcall", Convention::Stdcall);
    // The thiscall relay is stdcall: the preamble moves `this` from ECX onto
    // the stack behind the hook pointer and the callee cleans.
    impl_function_arities!("thiscall", "stdcall", Convention::Thiscall);
    impl_function_arities!("fastcall", "fastcall", Convention::Fastcall);
}
