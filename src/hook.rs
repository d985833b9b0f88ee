//! The detour hook engine.
//!
//! A [`Hook`] patches the prologue of a typed target function with a near
//! jump into a per-hook *codecave*: an executable page holding a jump over
//! the trampoline, the trampoline (a relocated copy of the overwritten
//! prologue plus a jump back), and a relay preamble that saves the register
//! context and transfers control to a generated relay of the target's own
//! calling convention with one extra leading hook-state argument.
//!
//! The user callback, if any, receives the hook state and the natural
//! argument tuple, and may re-enter the original through
//! [`HookState::call`]. Several hooks on one target chain through their
//! codecaves; removal works in any order (the innermost links turn
//! transparent instead of unpatching the target).
//!
//! Installation and removal assume the caller holds exclusive control of
//! the target (no other thread executing it); the installed hot path is
//! reentrant.

use std::ops::Deref;

use crate::address::Address;
use crate::alloc::ScopedMemoryBlock;
use crate::disasm::{self, Disassembler};
use crate::err::HookError;
use crate::fun::Function;
use crate::ops;
use crate::protect::{self, Protection, ScopedProtect};

mod codecave;
#[cfg(test)]
mod tests;
#[cfg(test)]
mod tests_x86;

/// Size of the near-jump patch written over the target prologue.
pub(crate) const JMP_SIZE: usize = 5;
/// NOP, used to pad the patched prologue and blank codecave entries.
pub(crate) const NOP_OPCODE: u8 = 0x90;
/// Near CALL with a rel32 operand.
pub(crate) const CALL_OPCODE: u8 = 0xe8;
/// Near JMP with a rel32 operand.
pub(crate) const JMP_OPCODE: u8 = 0xe9;
/// Mask grouping the near/short JMP opcodes (`E9`/`EB`) the trampoline can
/// rewrite.
pub(crate) const JMP_FAMILY_MASK: u8 = 0xfd;

const CODECAVE_SIZE: usize = 0x1000;

/// General-purpose register snapshot taken by the relay preamble on every
/// entry, plus the caller's return address.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    /// Return address popped off the stack on entry.
    pub return_address: u64,
    /// Saved RAX.
    pub rax: u64,
    /// Saved RBX.
    pub rbx: u64,
    /// Saved RCX.
    pub rcx: u64,
    /// Saved RDX.
    pub rdx: u64,
    /// Saved RSI.
    pub rsi: u64,
    /// Saved RDI.
    pub rdi: u64,
    /// Saved RBP.
    pub rbp: u64,
    /// Saved RSP as of codecave entry.
    pub rsp: u64,
    /// Saved R8.
    pub r8: u64,
    /// Saved R9.
    pub r9: u64,
    /// Saved R10.
    pub r10: u64,
    /// Saved R11.
    pub r11: u64,
    /// Saved R12.
    pub r12: u64,
    /// Saved R13.
    pub r13: u64,
    /// Saved R14.
    pub r14: u64,
    /// Saved R15.
    pub r15: u64,
}

/// General-purpose register snapshot taken by the relay preamble on every
/// entry, plus the caller's return address.
#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    /// Return address popped off the stack on entry.
    pub return_address: u32,
    /// Saved EAX.
    pub eax: u32,
    /// Saved ECX.
    pub ecx: u32,
    /// Saved EDX.
    pub edx: u32,
    /// Saved EBX.
    pub ebx: u32,
    /// Saved ESI.
    pub esi: u32,
    /// Saved EDI.
    pub edi: u32,
    /// Saved ESP as of codecave entry.
    pub esp: u32,
    /// Saved EBP.
    pub ebp: u32,
}

/// The user callback: the hook state plus the target's natural argument
/// tuple, returning the target's return type.
pub type Callback<F> =
    Box<dyn Fn(&HookState<F>, <F as Function>::Arguments) -> <F as Function>::Output>;

/// Computes the `rel32` operand reaching `destination` from the
/// `inst_len`-byte instruction at `source`.
pub(crate) fn relative_offset(destination: Address, source: Address, inst_len: usize) -> u32 {
    destination
        .value()
        .wrapping_sub(source.value().wrapping_add(inst_len)) as u32
}

/// Absolute destination of a `rel32` operand of the `inst_len`-byte
/// instruction at `base`.
pub(crate) fn absolute_target(relative: u32, base: Address, inst_len: usize) -> Address {
    base + inst_len + (relative as i32 as isize as usize)
}

/// The heap-pinned hot state of a hook.
///
/// The codecave bakes the absolute addresses of this struct and its
/// [`Context`] into generated code, so it lives behind a `Box` and never
/// moves while the owning [`Hook`] is alive. Callbacks receive it by
/// reference.
pub struct HookState<F: Function> {
    target: Address,
    size: usize,
    callback: Option<Callback<F>>,
    installed: bool,
    trampoline: Address,
    original_bytes: Option<Vec<u8>>,
    usercode_jump: Option<Vec<u8>>,
    codecave: Option<ScopedMemoryBlock>,
    context: Context,
}

impl<F: Function> HookState<F> {
    /// The user callback, when one was set.
    #[must_use]
    pub fn callback(&self) -> Option<&Callback<F>> {
        self.callback.as_ref()
    }

    /// The register snapshot of the most recent entry through the codecave.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Whether the hook is currently installed.
    #[must_use]
    pub fn installed(&self) -> bool {
        self.installed
    }

    /// The trampoline entry, zero before the first installation.
    #[must_use]
    pub fn trampoline(&self) -> Address {
        self.trampoline
    }

    /// Calls the original function through the trampoline.
    ///
    /// # Safety
    ///
    /// The hook must have been installed at least once (the trampoline must
    /// exist), and `F` must describe the target's true signature.
    pub unsafe fn call(&self, args: F::Arguments) -> F::Output {
        F::invoke(self.trampoline, args)
    }

    fn codecave_entry(&self) -> Address {
        self.codecave
            .as_ref()
            .map_or(Address::NULL, ScopedMemoryBlock::get)
    }
}

/// A typed detour hook on one target function.
///
/// Configure with [`target`](Self::target) and [`redirect`](Self::redirect),
/// then [`install`](Self::install). Dropping an installed hook removes it.
pub struct Hook<F: Function> {
    state: Box<HookState<F>>,
}

impl<F: Function> Hook<F> {
    /// Creates an unconfigured hook.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Box::new(HookState {
                target: Address::NULL,
                size: 0,
                callback: None,
                installed: false,
                trampoline: Address::NULL,
                original_bytes: None,
                usercode_jump: None,
                codecave: None,
                context: Context::default(),
            }),
        }
    }

    /// Creates a hook targeting `target`.
    #[must_use]
    pub fn with_target(target: F) -> Self {
        let mut hook = Self::new();
        hook.target(target);
        hook
    }

    /// Sets the target function and measures its patchable prologue.
    pub fn target(&mut self, target: F) {
        // A live function pointer is readable code.
        unsafe { self.target_raw(Address::from_ptr(target.to_ptr())) }
    }

    /// Sets the target by raw address.
    ///
    /// # Safety
    ///
    /// `target` must point to readable code of a function with signature
    /// `F`.
    pub unsafe fn target_raw(&mut self, target: Address) {
        self.state.target = target;
        self.state.size = disasm::min_instruction_span(target, JMP_SIZE);
    }

    /// Sets the target as an offset into a loaded module.
    ///
    /// # Safety
    ///
    /// `offset` must locate a function with signature `F` inside the
    /// module image.
    #[cfg(windows)]
    pub unsafe fn target_in_module(&mut self, module: &str, offset: Address) {
        let handle = crate::module::module_handle(module);
        if handle.valid() {
            self.target_raw(handle + offset);
        }
    }

    /// Sets or replaces the user callback.
    ///
    /// Without a callback an installed hook is a pass-through: the relay
    /// forwards straight to the trampoline.
    pub fn redirect<C>(&mut self, callback: C)
    where
        C: Fn(&HookState<F>, F::Arguments) -> F::Output + 'static,
    {
        self.state.callback = Some(Box::new(callback));
    }

    /// Installs the hook.
    ///
    /// On the first installation this allocates and emits the codecave,
    /// snapshots the original prologue and patches the target. After a soft
    /// removal it only restores the codecave entry jump.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive control of the target: no other
    /// thread may execute it during installation, and `F` must describe its
    /// true signature and convention.
    pub unsafe fn install(&mut self) -> Result<(), HookError> {
        let hook_ptr = std::ptr::addr_of!(*self.state) as usize;
        let state = &mut *self.state;

        if state.installed {
            return Err(HookError::AlreadyInstalled);
        }

        if !state.target.valid() {
            return Err(HookError::InvalidAddress);
        }

        if !protect::is_executable(state.target) {
            return Err(HookError::NotExecutable);
        }

        if state.size < JMP_SIZE {
            return Err(HookError::NotEnoughSpace);
        }

        let guard = ScopedProtect::new(state.target, Protection::READ_WRITE_EXECUTE, state.size);
        if !guard.valid() {
            return Err(HookError::ProtectViolation);
        }

        if let Some(cave) = &state.codecave {
            // Re-install after a soft removal: bring back the entry jump
            // that was NOPped out.
            let jump = state.usercode_jump.as_ref().ok_or(HookError::ReinstallHook)?;
            ops::copy(cave.get(), Address::from_ptr(jump.as_ptr()), jump.len(), false)
                .map_err(|_| HookError::ReinstallHook)?;

            state.installed = true;
            return Ok(());
        }

        let cave = allocate_codecave(state.target)?;

        let code = codecave::emit(&codecave::Layout {
            target: state.target,
            prologue_size: state.size,
            base: cave.get(),
            context: std::ptr::addr_of!(state.context),
            hook: hook_ptr,
            relay: F::relay() as usize,
            convention: F::CONVENTION,
            arity: F::ARITY,
            hidden_return: F::RETURN_VIA_HIDDEN_PTR,
            displaced_is_float: F::argument_is_float(if F::RETURN_VIA_HIDDEN_PTR { 2 } else { 3 }),
        })?;
        ops::copy(
            cave.get(),
            Address::from_ptr(code.as_ptr()),
            code.len(),
            false,
        )
        .map_err(|_| HookError::WriteMemory)?;

        if state.original_bytes.is_none() {
            let mut snapshot = vec![0u8; state.size];
            ops::copy(
                Address::from_mut_ptr(snapshot.as_mut_ptr()),
                state.target,
                state.size,
                false,
            )
            .map_err(|_| HookError::BackupCreating)?;
            state.original_bytes = Some(snapshot);
        }

        let first = ops::read::<u8>(state.target, false).map_err(|_| HookError::BackupCreating)?;
        if first == CALL_OPCODE {
            // The target already begins with a near call; its destination is
            // the trampoline of whoever patched it. Keep the opcode and only
            // retarget the operand so the chain now runs through this hook
            // first.
            let relative =
                ops::read::<u32>(state.target + 1, false).map_err(|_| HookError::BackupCreating)?;
            state.trampoline = absolute_target(relative, state.target, JMP_SIZE);
        } else {
            state.trampoline = cave.get() + JMP_SIZE;

            if ops::write::<u8>(state.target, JMP_OPCODE, false).is_err() {
                restore_prologue(state);
                return Err(HookError::WriteMemory);
            }
        }

        let relative = relative_offset(cave.get(), state.target, JMP_SIZE);
        if ops::write::<u32>(state.target + 1, relative, false).is_err() {
            restore_prologue(state);
            return Err(HookError::WriteMemory);
        }

        if state.size > JMP_SIZE {
            if ops::fill(
                state.target + JMP_SIZE,
                NOP_OPCODE,
                state.size - JMP_SIZE,
                false,
            )
            .is_err()
            {
                restore_prologue(state);
                return Err(HookError::WriteMemory);
            }
        }

        state.codecave = Some(cave);
        state.installed = true;
        Ok(())
    }

    /// Removes the hook.
    ///
    /// Decodes the live target to decide between a *hard* removal (this
    /// hook is the outermost: restore the original prologue, free the
    /// codecave) and a *soft* removal (an outer hook chains through this
    /// one: NOP the codecave entry so it turns transparent).
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive control of the target: no other
    /// thread may execute it during removal.
    pub unsafe fn remove(&mut self) -> Result<(), HookError> {
        let state = &mut *self.state;

        if !state.installed {
            return Err(HookError::AlreadyRemoved);
        }

        if !state.target.valid() {
            return Err(HookError::InvalidAddress);
        }

        let guard = ScopedProtect::new(state.target, Protection::READ_WRITE_EXECUTE, state.size);
        if !guard.valid() {
            return Err(HookError::ProtectViolation);
        }

        let insn = Disassembler::new().disassemble(state.target);
        for operand in 0..insn.operand_count() {
            if !insn.is_relative_operand(operand) {
                continue;
            }

            let destination = insn.abs(state.target, operand);
            if destination == state.codecave_entry() || destination == state.trampoline {
                return unload(state);
            }

            return patch_out(state);
        }

        unload(state)
    }
}

/// Restores the snapshotted prologue bytes, best effort.
unsafe fn restore_prologue<F: Function>(state: &HookState<F>) {
    if let Some(original) = &state.original_bytes {
        let _ = ops::copy(
            state.target,
            Address::from_ptr(original.as_ptr()),
            original.len(),
            false,
        );
    }
}

/// Hard removal: original prologue back in place, codecave released.
unsafe fn unload<F: Function>(state: &mut HookState<F>) -> Result<(), HookError> {
    let original = state
        .original_bytes
        .as_ref()
        .ok_or(HookError::BackupRestoring)?;
    ops::copy(
        state.target,
        Address::from_ptr(original.as_ptr()),
        original.len(),
        false,
    )
    .map_err(|_| HookError::BackupRestoring)?;

    let cave = state.codecave.take().ok_or(HookError::DeallocateCodecave)?;

    state.original_bytes = None;
    state.usercode_jump = None;
    state.installed = false;

    if !cave.free() {
        return Err(HookError::DeallocateCodecave);
    }

    Ok(())
}

/// Soft removal: the codecave entry jump is snapshotted and NOPped out, so
/// control arriving from an outer hook falls through into the trampoline
/// and this hook's relay is skipped.
unsafe fn patch_out<F: Function>(state: &mut HookState<F>) -> Result<(), HookError> {
    let cave = state.codecave_entry();

    let mut jump = vec![0u8; JMP_SIZE];
    ops::copy(Address::from_mut_ptr(jump.as_mut_ptr()), cave, JMP_SIZE, false)
        .map_err(|_| HookError::BackupCreating)?;

    ops::fill(cave, NOP_OPCODE, JMP_SIZE, false).map_err(|_| HookError::UsercodeJumpRemove)?;

    state.usercode_jump = Some(jump);
    state.installed = false;

    Ok(())
}

fn allocate_codecave(target: Address) -> Result<ScopedMemoryBlock, HookError> {
    #[cfg(target_arch = "x86_64")]
    {
        use crate::memmap;

        // Every rel32 between the target and the codecave must stay in
        // range, so the cave has to land within +/- 2 GiB.
        let hint = memmap::find_free_page(target, 1 << 31);
        if !hint.valid() {
            return Err(HookError::AllocateCodecave);
        }

        let block = ScopedMemoryBlock::at(hint, CODECAVE_SIZE);
        if !block.allocated() {
            return Err(HookError::AllocateCodecave);
        }
        if block.get().value().abs_diff(target.value()) >= 0x7fff_0000 {
            return Err(HookError::AllocateCodecave);
        }
        Ok(block)
    }

    #[cfg(target_arch = "x86")]
    {
        let block = ScopedMemoryBlock::new(CODECAVE_SIZE);
        if !block.allocated() {
            return Err(HookError::AllocateCodecave);
        }
        Ok(block)
    }
}

impl<F: Function> Default for Hook<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Function> Deref for Hook<F> {
    type Target = HookState<F>;

    fn deref(&self) -> &HookState<F> {
        &self.state
    }
}

impl<F: Function> Drop for Hook<F> {
    fn drop(&mut self) {
        if self.state.installed {
            let _ = unsafe { self.remove() };
        }

        // Whatever codecave survives at this point is still on some chain's
        // path (soft-removed, or removal failed); keep its pages alive.
        if let Some(cave) = self.state.codecave.take() {
            cave.leak();
        }
    }
}
