/*!
This crate is an in-process memory-manipulation toolkit for `x86` and
`x86_64` processes: typed reads and writes anywhere in the address space,
scoped page-protection changes, executable-memory allocation, byte-pattern
scanning, grouped byte patches, and typed *detour hooks* that route a
function through a user callback which can still reach the original
through a trampoline.

# Installation

This crate works with Cargo. Add it to your `Cargo.toml` like so:

```toml
[dependencies]
memweave = "0.1"
```

# Hooking

A [`Hook`] is typed by the target's function-pointer type, so the callback
receives the real argument tuple and returns the real return type. The
callback's extra leading parameter is the hook state, through which
[`call`](hook::HookState::call) re-enters the original:

```no_run
use memweave::Hook;

# #[cfg(target_arch = "x86_64")]
extern "win64" fn sum(lhs: i32, rhs: i32) -> i32 {
    lhs + rhs
}

# #[cfg(target_arch = "x86_64")]
# fn main() {
type SumFn = extern "win64" fn(i32, i32) -> i32;

let mut hook: Hook<SumFn> = Hook::with_target(sum as SumFn);
hook.redirect(|hook, (lhs, rhs)| unsafe { hook.call((lhs, rhs)) } * 2);

unsafe { hook.install() }.unwrap();
assert_eq!(sum(2, 2), 8);

unsafe { hook.remove() }.unwrap();
assert_eq!(sum(2, 2), 4);
# }
# #[cfg(not(target_arch = "x86_64"))]
# fn main() {}
```

Several hooks may target the same function; the most recently installed
runs first, and removal works in any order. On 32-bit x86 the `cdecl`,
`stdcall`, `thiscall` and `fastcall` conventions are supported; on x86-64
everything uses the single Win64 convention (`extern "win64"`, available on
every x86-64 target).

# Patching

```no_run
use memweave::{Address, PatchBuilder};

let mut value = 2u32;
let mut patch = PatchBuilder::new()
    .target(Address::from_mut_ptr(&mut value))
    .replace_with(4u32)
    .build();

unsafe { patch.install() };
assert_eq!(value, 4);
drop(patch);
assert_eq!(value, 2);
```

# Notes

Installing and removing hooks is not thread-safe: the caller must make sure
no other thread executes the target while its prologue is being rewritten.
Once installed, the hooked path itself is reentrant. As Rust runs tests in
parallel, hooking tests should serialize or run with `--test-threads=1`.
*/

#![warn(missing_docs)]

mod address;
mod err;
mod fun;

pub mod alloc;
pub mod disasm;
pub mod hook;
pub mod invoker;
pub mod memmap;
#[cfg(windows)]
pub mod module;
pub mod ops;
pub mod patch;
pub mod protect;
pub mod scanner;

pub use address::Address;
pub use err::{HookError, MemError};
pub use fun::{returns_via_hidden_ptr, Convention, Function};
pub use hook::{Callback, Context, Hook, HookState};

pub use alloc::ScopedMemoryBlock;
pub use patch::{PatchBuilder, ScopedPatch};
pub use protect::{Protection, ScopedProtect};
pub use scanner::{Scanner, Signature};
