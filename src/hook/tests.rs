#![cfg(target_arch = "x86_64")]

use std::cell::Cell;
use std::hint::black_box;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};

use super::*;
use crate::disasm::Disassembler;

// Installation rewrites protection of shared code pages; two tests doing
// that at once would interleave their guards.
static HOOK_LOCK: Mutex<()> = Mutex::new(());

fn serialized() -> MutexGuard<'static, ()> {
    HOOK_LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

unsafe fn read_bytes(addr: Address, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(addr.as_ptr::<u8>(), len).to_vec()
}

type SumFn = extern "win64" fn(i32, i32) -> i32;

#[inline(never)]
extern "win64" fn sum_round_trip(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn install_and_remove_round_trip() {
    let _guard = serialized();
    let target = Address::from_ptr((sum_round_trip as SumFn).to_ptr());
    let before = unsafe { read_bytes(target, 16) };
    let prologue = unsafe { disasm::min_instruction_span(target, JMP_SIZE) };
    assert!(prologue >= JMP_SIZE);

    let mut hook: Hook<SumFn> = Hook::new();
    hook.target(sum_round_trip);
    hook.redirect(|hook: &HookState<SumFn>, (lhs, rhs)| unsafe { hook.call((lhs, rhs)) } * 2);

    unsafe { hook.install() }.unwrap();
    assert!(hook.installed());
    assert_eq!(sum_round_trip(2, 2), 8);

    // The patched prologue is a near jump into the codecave, padded with
    // NOPs up to the measured prologue length.
    let patched = unsafe { read_bytes(target, 16) };
    assert_eq!(patched[0], 0xe9);
    assert!(patched[JMP_SIZE..prologue.min(16)]
        .iter()
        .all(|&byte| byte == NOP_OPCODE));
    let insn = unsafe { Disassembler::new().disassemble(target) };
    let entry = insn.abs(target, 0);
    assert_eq!(entry + JMP_SIZE, hook.trampoline());
    assert!(crate::protect::is_executable(hook.trampoline()));

    let span = unsafe { disasm::min_instruction_span(target, JMP_SIZE) };
    assert_eq!(span, JMP_SIZE);

    unsafe { hook.remove() }.unwrap();
    assert!(!hook.installed());
    assert_eq!(sum_round_trip(2, 2), 4);
    assert_eq!(unsafe { read_bytes(target, 16) }, before);
}

#[inline(never)]
extern "win64" fn sum_passthrough(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn hook_without_callback_is_a_passthrough() {
    let _guard = serialized();

    let mut hook: Hook<SumFn> = Hook::with_target(sum_passthrough as SumFn);
    unsafe { hook.install() }.unwrap();
    assert_eq!(sum_passthrough(20, 22), 42);
    unsafe { hook.remove() }.unwrap();
    assert_eq!(sum_passthrough(20, 22), 42);
}

#[inline(never)]
extern "win64" fn sum_chain(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn chained_hooks_removed_outer_first() {
    let _guard = serialized();
    let target = Address::from_ptr((sum_chain as SumFn).to_ptr());
    let before = unsafe { read_bytes(target, 16) };

    let calls = Rc::new(Cell::new(0));

    let mut inner: Hook<SumFn> = Hook::with_target(sum_chain as SumFn);
    let seen = calls.clone();
    inner.redirect(move |hook: &HookState<SumFn>, args| {
        seen.set(seen.get() + 1);
        (unsafe { hook.call(args) }) * 2
    });

    let mut outer: Hook<SumFn> = Hook::with_target(sum_chain as SumFn);
    let seen = calls.clone();
    outer.redirect(move |hook: &HookState<SumFn>, args| {
        seen.set(seen.get() + 2);
        (unsafe { hook.call(args) }) * 2
    });

    unsafe { inner.install() }.unwrap();
    assert_eq!(sum_chain(2, 2), 8);
    assert_eq!(calls.get(), 1);

    unsafe { outer.install() }.unwrap();
    assert_eq!(sum_chain(2, 2), 16);
    assert_eq!(calls.get(), 4);

    unsafe { outer.remove() }.unwrap();
    assert_eq!(sum_chain(2, 2), 8);
    assert_eq!(calls.get(), 5);

    unsafe { inner.remove() }.unwrap();
    assert_eq!(sum_chain(2, 2), 4);
    assert_eq!(calls.get(), 5);
    assert_eq!(unsafe { read_bytes(target, 16) }, before);
}

#[inline(never)]
extern "win64" fn sum_soft(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn inner_hook_removed_first_turns_transparent() {
    let _guard = serialized();

    let mut first: Hook<SumFn> = Hook::with_target(sum_soft as SumFn);
    first.redirect(|hook: &HookState<SumFn>, args| (unsafe { hook.call(args) }) * 2);

    let mut second: Hook<SumFn> = Hook::with_target(sum_soft as SumFn);
    second.redirect(|hook: &HookState<SumFn>, args| (unsafe { hook.call(args) }) * 2);

    unsafe { first.install() }.unwrap();
    unsafe { second.install() }.unwrap();
    assert_eq!(sum_soft(2, 2), 16);

    // The first hook is now the inner chain link; removing it must not
    // unpatch the target, only bypass its relay.
    unsafe { first.remove() }.unwrap();
    assert!(!first.installed());
    assert!(second.installed());
    assert_eq!(sum_soft(2, 2), 8);

    unsafe { second.remove() }.unwrap();
    assert_eq!(sum_soft(2, 2), 4);
}

#[inline(never)]
extern "win64" fn sum_reinstall(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn reinstall_after_soft_removal() {
    let _guard = serialized();
    let target = Address::from_ptr((sum_reinstall as SumFn).to_ptr());
    let before = unsafe { read_bytes(target, 16) };

    let mut first: Hook<SumFn> = Hook::with_target(sum_reinstall as SumFn);
    first.redirect(|hook: &HookState<SumFn>, args| (unsafe { hook.call(args) }) * 2);

    let mut second: Hook<SumFn> = Hook::with_target(sum_reinstall as SumFn);
    second.redirect(|hook: &HookState<SumFn>, args| (unsafe { hook.call(args) }) * 2);

    unsafe { first.install() }.unwrap();
    unsafe { second.install() }.unwrap();

    unsafe { first.remove() }.unwrap();
    assert_eq!(sum_reinstall(2, 2), 8);

    unsafe { first.install() }.unwrap();
    assert_eq!(sum_reinstall(2, 2), 16);

    unsafe { second.remove() }.unwrap();
    assert_eq!(sum_reinstall(2, 2), 8);

    unsafe { first.remove() }.unwrap();
    assert_eq!(sum_reinstall(2, 2), 4);
    assert_eq!(unsafe { read_bytes(target, 16) }, before);
}

#[inline(never)]
extern "win64" fn sum_errors(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn lifecycle_errors() {
    let _guard = serialized();

    let mut unconfigured: Hook<SumFn> = Hook::new();
    assert!(matches!(
        unsafe { unconfigured.install() },
        Err(HookError::InvalidAddress)
    ));
    assert!(matches!(
        unsafe { unconfigured.remove() },
        Err(HookError::AlreadyRemoved)
    ));

    let mut hook: Hook<SumFn> = Hook::with_target(sum_errors as SumFn);
    unsafe { hook.install() }.unwrap();
    assert!(matches!(
        unsafe { hook.install() },
        Err(HookError::AlreadyInstalled)
    ));
    unsafe { hook.remove() }.unwrap();
    assert!(matches!(
        unsafe { hook.remove() },
        Err(HookError::AlreadyRemoved)
    ));
}

#[inline(never)]
extern "win64" fn sum_drop(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn dropping_an_installed_hook_removes_it() {
    let _guard = serialized();

    {
        let mut hook: Hook<SumFn> = Hook::with_target(sum_drop as SumFn);
        hook.redirect(|hook: &HookState<SumFn>, args| (unsafe { hook.call(args) }) * 2);
        unsafe { hook.install() }.unwrap();
        assert_eq!(sum_drop(2, 2), 8);
    }

    assert_eq!(sum_drop(2, 2), 4);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Triple {
    p0: i32,
    p1: i32,
    p2: i32,
}

type TripleFn = extern "win64" fn(i32, i32, i32) -> Triple;

#[inline(never)]
extern "win64" fn make_triple(p0: i32, p1: i32, p2: i32) -> Triple {
    Triple {
        p0: black_box(p0),
        p1: black_box(p1),
        p2: black_box(p2),
    }
}

#[test]
fn hidden_return_pointer_is_forwarded() {
    let _guard = serialized();

    let mut hook: Hook<TripleFn> = Hook::with_target(make_triple as TripleFn);
    hook.redirect(|_: &HookState<TripleFn>, _| Triple { p0: 0, p1: 0, p2: 0 });

    unsafe { hook.install() }.unwrap();
    assert_eq!(make_triple(1, 2, 3), Triple { p0: 0, p1: 0, p2: 0 });

    unsafe { hook.remove() }.unwrap();
    assert_eq!(make_triple(1, 2, 3), Triple { p0: 1, p1: 2, p2: 3 });
}

#[test]
fn hidden_return_callback_can_reach_the_original() {
    let _guard = serialized();

    let mut hook: Hook<TripleFn> = Hook::with_target(make_triple as TripleFn);
    hook.redirect(|hook: &HookState<TripleFn>, (p0, p1, p2)| {
        let original = unsafe { hook.call((p0, p1, p2)) };
        Triple {
            p0: original.p0 * 10,
            p1: original.p1 * 10,
            p2: original.p2 * 10,
        }
    });

    unsafe { hook.install() }.unwrap();
    assert_eq!(
        make_triple(1, 2, 3),
        Triple {
            p0: 10,
            p1: 20,
            p2: 30
        }
    );
    unsafe { hook.remove() }.unwrap();
}

type Sum5Fn = extern "win64" fn(u64, u64, u64, u64, u64) -> u64;

#[inline(never)]
extern "win64" fn sum_five(a: u64, b: u64, c: u64, d: u64, e: u64) -> u64 {
    black_box(a) + b * 10 + c * 100 + d * 1000 + e * 10000
}

#[test]
fn stack_arguments_survive_the_slot_shift() {
    let _guard = serialized();

    let mut hook: Hook<Sum5Fn> = Hook::with_target(sum_five as Sum5Fn);
    hook.redirect(|hook: &HookState<Sum5Fn>, args| unsafe { hook.call(args) } + 1);

    unsafe { hook.install() }.unwrap();
    assert_eq!(sum_five(1, 2, 3, 4, 5), 54322);

    unsafe { hook.remove() }.unwrap();
    assert_eq!(sum_five(1, 2, 3, 4, 5), 54321);
}

type ScaleFn = extern "win64" fn(f64, f64) -> f64;

#[inline(never)]
extern "win64" fn scale(value: f64, by: f64) -> f64 {
    black_box(value) * black_box(by)
}

#[test]
fn float_arguments_ride_the_xmm_shift() {
    let _guard = serialized();

    let mut hook: Hook<ScaleFn> = Hook::with_target(scale as ScaleFn);
    hook.redirect(|hook: &HookState<ScaleFn>, (value, by)| unsafe { hook.call((value, by)) } + 0.5);

    unsafe { hook.install() }.unwrap();
    assert!((scale(21.0, 2.0) - 42.5).abs() < f64::EPSILON);

    unsafe { hook.remove() }.unwrap();
    assert!((scale(21.0, 2.0) - 42.0).abs() < f64::EPSILON);
}

type Blend4Fn = extern "win64" fn(f64, f64, f64, f64) -> f64;

#[inline(never)]
extern "win64" fn blend_four(a: f64, b: f64, c: f64, d: f64) -> f64 {
    black_box(a) + b * 2.0 + c * 4.0 + d * 8.0
}

#[test]
fn displaced_float_argument_reaches_the_stack_slot() {
    let _guard = serialized();

    let mut hook: Hook<Blend4Fn> = Hook::with_target(blend_four as Blend4Fn);
    hook.redirect(|hook: &HookState<Blend4Fn>, args| unsafe { hook.call(args) } * 10.0);

    unsafe { hook.install() }.unwrap();
    // 1 + 4 + 12 + 32 = 49, times the callback's factor.
    assert!((blend_four(1.0, 2.0, 3.0, 4.0) - 490.0).abs() < 1e-9);

    unsafe { hook.remove() }.unwrap();
    assert!((blend_four(1.0, 2.0, 3.0, 4.0) - 49.0).abs() < 1e-9);
}

#[inline(never)]
extern "win64" fn sum_context(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn context_snapshots_the_entry_registers() {
    let _guard = serialized();

    let seen_rcx = Rc::new(Cell::new(0u64));
    let seen = seen_rcx.clone();

    let mut hook: Hook<SumFn> = Hook::with_target(sum_context as SumFn);
    hook.redirect(move |hook: &HookState<SumFn>, args| {
        seen.set(hook.context().rcx);
        unsafe { hook.call(args) }
    });

    unsafe { hook.install() }.unwrap();
    assert_eq!(sum_context(7, 3), 10);
    assert_eq!(seen_rcx.get() as u32, 7);

    let return_address = hook.context().return_address;
    assert!(crate::protect::is_executable(Address::new(
        return_address as usize
    )));

    unsafe { hook.remove() }.unwrap();
}
