#![cfg(target_arch = "x86")]

use std::hint::black_box;
use std::sync::{Mutex, MutexGuard};

use super::*;

static HOOK_LOCK: Mutex<()> = Mutex::new(());

fn serialized() -> MutexGuard<'static, ()> {
    HOOK_LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

type CdeclSumFn = extern "cdecl" fn(i32, i32) -> i32;

#[inline(never)]
extern "cdecl" fn sum_cdecl(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn cdecl_hook_round_trip() {
    let _guard = serialized();

    let mut hook: Hook<CdeclSumFn> = Hook::with_target(sum_cdecl as CdeclSumFn);
    hook.redirect(|hook: &HookState<CdeclSumFn>, (lhs, rhs)| {
        unsafe { hook.call((lhs, rhs)) } * 2
    });

    unsafe { hook.install() }.unwrap();
    assert_eq!(sum_cdecl(2, 2), 8);

    unsafe { hook.remove() }.unwrap();
    assert_eq!(sum_cdecl(2, 2), 4);
}

type StdcallSumFn = extern "stdcall" fn(i32, i32) -> i32;

#[inline(never)]
extern "stdcall" fn sum_stdcall(lhs: i32, rhs: i32) -> i32 {
    black_box(lhs) + black_box(rhs)
}

#[test]
fn stdcall_hook_round_trip() {
    let _guard = serialized();

    let mut hook: Hook<StdcallSumFn> = Hook::with_target(sum_stdcall as StdcallSumFn);
    hook.redirect(|hook: &HookState<StdcallSumFn>, args| unsafe { hook.call(args) } * 2);

    unsafe { hook.install() }.unwrap();
    assert_eq!(sum_stdcall(2, 2), 8);

    unsafe { hook.remove() }.unwrap();
    assert_eq!(sum_stdcall(2, 2), 4);
}

#[repr(C)]
struct Accumulator {
    base: i32,
}

type AccAddFn = extern "thiscall" fn(*const Accumulator, i32, i32) -> i32;

#[inline(never)]
extern "thiscall" fn accumulator_add(this: *const Accumulator, lhs: i32, rhs: i32) -> i32 {
    (unsafe { (*black_box(this)).base }) + lhs + rhs
}

#[test]
fn thiscall_hook_forwards_the_receiver() {
    let _guard = serialized();

    let mut hook: Hook<AccAddFn> = Hook::with_target(accumulator_add as AccAddFn);
    hook.redirect(|hook: &HookState<AccAddFn>, (this, lhs, rhs)| {
        unsafe { hook.call((this, lhs, rhs)) } * 2
    });

    unsafe { hook.install() }.unwrap();
    let acc = Accumulator { base: 0 };
    assert_eq!(accumulator_add(&acc, 2, 2), 8);

    unsafe { hook.remove() }.unwrap();
    assert_eq!(accumulator_add(&acc, 2, 2), 4);
}

type FastcallSumFn = extern "fastcall" fn(i32, i32, i32) -> i32;

#[inline(never)]
extern "fastcall" fn sum_fastcall(lhs: i32, mid: i32, rhs: i32) -> i32 {
    black_box(lhs) + mid * 10 + rhs * 100
}

#[test]
fn fastcall_register_arguments_are_forwarded() {
    let _guard = serialized();

    let mut hook: Hook<FastcallSumFn> = Hook::with_target(sum_fastcall as FastcallSumFn);
    hook.redirect(|hook: &HookState<FastcallSumFn>, args| unsafe { hook.call(args) } + 1);

    unsafe { hook.install() }.unwrap();
    assert_eq!(sum_fastcall(1, 2, 3), 322);

    unsafe { hook.remove() }.unwrap();
    assert_eq!(sum_fastcall(1, 2, 3), 321);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Triple {
    p0: i32,
    p1: i32,
    p2: i32,
}

type TripleFn = extern "stdcall" fn(i32, i32, i32) -> Triple;

#[inline(never)]
extern "stdcall" fn make_triple(p0: i32, p1: i32, p2: i32) -> Triple {
    Triple {
        p0: black_box(p0),
        p1: black_box(p1),
        p2: black_box(p2),
    }
}

#[test]
fn stdcall_hidden_return_pointer_is_preserved() {
    let _guard = serialized();

    let mut hook: Hook<TripleFn> = Hook::with_target(make_triple as TripleFn);
    hook.redirect(|_: &HookState<TripleFn>, _| Triple { p0: 0, p1: 0, p2: 0 });

    unsafe { hook.install() }.unwrap();
    assert_eq!(make_triple(1, 2, 3), Triple { p0: 0, p1: 0, p2: 0 });

    unsafe { hook.remove() }.unwrap();
    assert_eq!(make_triple(1, 2, 3), Triple { p0: 1, p1: 2, p2: 3 });
}
