//! Codecave emission.
//!
//! Layout, from the entry address:
//!
//! 1. `E9 rel32` over the trampoline to the relay preamble. NOPping these
//!    five bytes is what turns a soft-removed hook transparent.
//! 2. The trampoline: a relocated copy of the target's first *L* bytes,
//!    terminated by `E9 rel32` back to `target + L`.
//! 3. The relay preamble: context save, return-address pop, argument
//!    staging for the relay's extra leading hook-state pointer, transfer to
//!    the relay.
//!
//! Relocation policy: near CALL (`E8`) and the near/short JMP family
//! (`opcode & 0xFD == 0xE9`; `EB` widens to `E9 rel32`) are rewritten to
//! keep their absolute destination; any other instruction with a relative
//! operand, any RIP-relative memory operand on x86-64, and any rel32 that
//! would overflow after the move refuses installation instead of emitting
//! a silently broken trampoline.

use std::io::{Cursor, Seek, SeekFrom, Write};

use super::{Context, CALL_OPCODE, JMP_FAMILY_MASK, JMP_OPCODE, JMP_SIZE};
use crate::address::Address;
use crate::disasm::{Disassembler, Instruction};
use crate::err::HookError;
use crate::fun::Convention;

/// Everything the emitter needs to know about one hook.
pub(super) struct Layout {
    pub target: Address,
    pub prologue_size: usize,
    /// Address the emitted bytes will run at.
    pub base: Address,
    pub context: *const Context,
    /// Address of the hook state handed to the relay.
    pub hook: usize,
    /// Address of the relay thunk.
    pub relay: usize,
    pub convention: Convention,
    pub arity: usize,
    pub hidden_return: bool,
    /// Whether the argument slot displaced onto the stack by the relay's
    /// extra parameter is an XMM slot (64-bit only).
    pub displaced_is_float: bool,
}

type Buf<'a> = Cursor<&'a mut Vec<u8>>;

/// Emits the complete codecave for `layout`.
///
/// # Safety
///
/// `layout.target` must point to at least `prologue_size` bytes of readable
/// code and `layout.context` must point to the hook's live context.
pub(super) unsafe fn emit(layout: &Layout) -> Result<Vec<u8>, HookError> {
    let mut code = Vec::with_capacity(256);
    let mut buf = Cursor::new(&mut code);

    // jmp _after_trampoline
    buf.write(&[JMP_OPCODE, 0, 0, 0, 0])?;

    write_trampoline(&mut buf, layout)?;

    let after_trampoline = buf.stream_position()?;
    buf.seek(SeekFrom::Start(1))?;
    buf.write(&((after_trampoline - JMP_SIZE as u64) as u32).to_le_bytes())?;
    buf.seek(SeekFrom::Start(after_trampoline))?;

    write_relay_preamble(&mut buf, layout)?;

    drop(buf);
    Ok(code)
}

fn branch_offset(destination: Address, source: Address, inst_len: usize) -> Option<i32> {
    if cfg!(target_arch = "x86") {
        // rel32 covers the whole 32-bit address space, wrapping.
        Some(
            destination
                .value()
                .wrapping_sub(source.value().wrapping_add(inst_len)) as i32,
        )
    } else {
        let delta = destination.value() as i64 - (source.value() as i64 + inst_len as i64);
        i32::try_from(delta).ok()
    }
}

fn has_relative_operand(insn: &Instruction) -> bool {
    (0..insn.operand_count()).any(|operand| insn.is_relative_operand(operand))
}

unsafe fn write_trampoline(buf: &mut Buf<'_>, layout: &Layout) -> Result<(), HookError> {
    let disasm = Disassembler::new();
    let mut address = layout.target;
    let mut emitted = 0usize;

    while emitted < layout.prologue_size {
        let insn = disasm.disassemble(address);
        let length = insn.length();
        if length == 0 {
            return Err(HookError::NotEnoughSpace);
        }

        let position = layout.base + buf.stream_position()? as usize;
        let opcode = insn.opcode();

        if opcode == CALL_OPCODE {
            let destination = insn.abs(address, 0);
            let relative = branch_offset(destination, position, JMP_SIZE)
                .ok_or(HookError::NotEnoughSpace)?;
            buf.write(&[CALL_OPCODE])?;
            buf.write(&relative.to_le_bytes())?;
            emitted += JMP_SIZE;
        } else if opcode & JMP_FAMILY_MASK == JMP_OPCODE {
            let destination = insn.abs(address, 0);
            let relative = branch_offset(destination, position, JMP_SIZE)
                .ok_or(HookError::NotEnoughSpace)?;
            buf.write(&[JMP_OPCODE])?;
            buf.write(&relative.to_le_bytes())?;
            emitted += JMP_SIZE;
        } else if has_relative_operand(&insn) || (cfg!(target_arch = "x86_64") && insn.is_ip_relative())
        {
            // A conditional/loop branch or RIP-relative access would decode
            // to the wrong place after the move.
            return Err(HookError::NotEnoughSpace);
        } else {
            let bytes = std::slice::from_raw_parts(address.as_ptr::<u8>(), length);
            buf.write(bytes)?;
            emitted += length;
        }

        address += length;
    }

    // jmp target+L, resuming behind the patch
    let position = layout.base + buf.stream_position()? as usize;
    let resume = layout.target + layout.prologue_size;
    let relative =
        branch_offset(resume, position, JMP_SIZE).ok_or(HookError::NotEnoughSpace)?;
    buf.write(&[JMP_OPCODE])?;
    buf.write(&relative.to_le_bytes())?;

    Ok(())
}

#[cfg(target_arch = "x86_64")]
unsafe fn write_relay_preamble(buf: &mut Buf<'_>, layout: &Layout) -> Result<(), HookError> {
    debug_assert_eq!(layout.convention, Convention::Win64);

    let ctx = layout.context;

    // mov [context.rax], rax
    buf.write(&[0x48, 0xa3])?;
    buf.write(&(std::ptr::addr_of!((*ctx).rax) as u64).to_le_bytes())?;

    // The remaining registers go through RAX as the store pointer:
    // mov rax, &field / mov [rax], reg
    let stores: [(u64, [u8; 3]); 15] = [
        (std::ptr::addr_of!((*ctx).rbx) as u64, [0x48, 0x89, 0x18]),
        (std::ptr::addr_of!((*ctx).rcx) as u64, [0x48, 0x89, 0x08]),
        (std::ptr::addr_of!((*ctx).rdx) as u64, [0x48, 0x89, 0x10]),
        (std::ptr::addr_of!((*ctx).rsi) as u64, [0x48, 0x89, 0x30]),
        (std::ptr::addr_of!((*ctx).rdi) as u64, [0x48, 0x89, 0x38]),
        (std::ptr::addr_of!((*ctx).rbp) as u64, [0x48, 0x89, 0x28]),
        (std::ptr::addr_of!((*ctx).rsp) as u64, [0x48, 0x89, 0x20]),
        (std::ptr::addr_of!((*ctx).r8) as u64, [0x4c, 0x89, 0x00]),
        (std::ptr::addr_of!((*ctx).r9) as u64, [0x4c, 0x89, 0x08]),
        (std::ptr::addr_of!((*ctx).r10) as u64, [0x4c, 0x89, 0x10]),
        (std::ptr::addr_of!((*ctx).r11) as u64, [0x4c, 0x89, 0x18]),
        (std::ptr::addr_of!((*ctx).r12) as u64, [0x4c, 0x89, 0x20]),
        (std::ptr::addr_of!((*ctx).r13) as u64, [0x4c, 0x89, 0x28]),
        (std::ptr::addr_of!((*ctx).r14) as u64, [0x4c, 0x89, 0x30]),
        (std::ptr::addr_of!((*ctx).r15) as u64, [0x4c, 0x89, 0x38]),
    ];
    for (field, store) in stores {
        // mov rax, imm64
        buf.write(&[0x48, 0xb8])?;
        buf.write(&field.to_le_bytes())?;
        buf.write(&store)?;
    }

    // pop rax
    // mov [context.return_address], rax
    buf.write(&[0x58])?;
    buf.write(&[0x48, 0xa3])?;
    buf.write(&(std::ptr::addr_of!((*ctx).return_address) as u64).to_le_bytes())?;

    // Slide the argument slots up by one to make room for the hook pointer.
    // With a hidden return slot, RCX stays put and the hook rides in RDX.
    let displaced = if layout.hidden_return { 2 } else { 3 };
    let stack_args = layout.arity.saturating_sub(displaced);
    let mut pushed = 0usize;

    if stack_args % 2 == 1 {
        // keep RSP 16-byte aligned at the call below
        // sub rsp, 8
        buf.write(&[0x48, 0x83, 0xec, 0x08])?;
        pushed += 8;
    }

    // Re-push the displaced stack arguments, deepest first. The original
    // ones sit above the caller's 32-byte shadow area.
    for slot in (1..stack_args).rev() {
        let disp = (0x20 + (slot - 1) * 8 + pushed) as u32;
        // push qword ptr [rsp + disp]
        buf.write(&[0xff, 0xb4, 0x24])?;
        buf.write(&disp.to_le_bytes())?;
        pushed += 8;
    }
    if stack_args > 0 {
        // The register argument that fell off the end: slot 3 rides in R9
        // for integers and in XMM3 for floats.
        if layout.displaced_is_float {
            // sub rsp, 8
            // movsd [rsp], xmm3
            buf.write(&[0x48, 0x83, 0xec, 0x08])?;
            buf.write(&[0xf2, 0x0f, 0x11, 0x1c, 0x24])?;
        } else {
            // push r9
            buf.write(&[0x41, 0x51])?;
        }
        pushed += 8;
    }

    // sub rsp, 0x20, shadow space for the relay
    buf.write(&[0x48, 0x83, 0xec, 0x20])?;

    if layout.hidden_return {
        if layout.arity >= 2 {
            // movaps xmm3, xmm2
            buf.write(&[0x0f, 0x28, 0xda])?;
        }
        if layout.arity >= 1 {
            // movaps xmm2, xmm1
            buf.write(&[0x0f, 0x28, 0xd1])?;
        }
        if layout.arity >= 2 {
            // mov r9, r8
            buf.write(&[0x4d, 0x89, 0xc1])?;
        }
        if layout.arity >= 1 {
            // mov r8, rdx
            buf.write(&[0x49, 0x89, 0xd0])?;
        }
        // mov rdx, hook
        buf.write(&[0x48, 0xba])?;
        buf.write(&(layout.hook as u64).to_le_bytes())?;
    } else {
        if layout.arity >= 3 {
            // movaps xmm3, xmm2
            buf.write(&[0x0f, 0x28, 0xda])?;
        }
        if layout.arity >= 2 {
            // movaps xmm2, xmm1
            buf.write(&[0x0f, 0x28, 0xd1])?;
        }
        if layout.arity >= 1 {
            // movaps xmm1, xmm0
            buf.write(&[0x0f, 0x28, 0xc8])?;
        }
        if layout.arity >= 3 {
            // mov r9, r8
            buf.write(&[0x4d, 0x89, 0xc1])?;
        }
        if layout.arity >= 2 {
            // mov r8, rdx
            buf.write(&[0x49, 0x89, 0xd0])?;
        }
        if layout.arity >= 1 {
            // mov rdx, rcx
            buf.write(&[0x48, 0x89, 0xca])?;
        }
        // mov rcx, hook
        buf.write(&[0x48, 0xb9])?;
        buf.write(&(layout.hook as u64).to_le_bytes())?;
    }

    // mov rax, relay
    // call rax
    buf.write(&[0x48, 0xb8])?;
    buf.write(&(layout.relay as u64).to_le_bytes())?;
    buf.write(&[0xff, 0xd0])?;

    // add rsp, shadow + staged arguments
    buf.write(&[0x48, 0x83, 0xc4, (0x20 + pushed) as u8])?;

    // mov r10, &context.return_address
    // jmp qword ptr [r10]
    buf.write(&[0x49, 0xba])?;
    buf.write(&(std::ptr::addr_of!((*ctx).return_address) as u64).to_le_bytes())?;
    buf.write(&[0x41, 0xff, 0x22])?;

    Ok(())
}

#[cfg(target_arch = "x86")]
unsafe fn write_relay_preamble(buf: &mut Buf<'_>, layout: &Layout) -> Result<(), HookError> {
    let ctx = layout.context;
    let return_address = std::ptr::addr_of!((*ctx).return_address) as u32;

    // mov [context.eax], eax
    buf.write(&[0xa3])?;
    buf.write(&(std::ptr::addr_of!((*ctx).eax) as u32).to_le_bytes())?;

    // mov [&field], reg for the rest
    let stores: [(u32, [u8; 2]); 7] = [
        (std::ptr::addr_of!((*ctx).ecx) as u32, [0x89, 0x0d]),
        (std::ptr::addr_of!((*ctx).edx) as u32, [0x89, 0x15]),
        (std::ptr::addr_of!((*ctx).ebx) as u32, [0x89, 0x1d]),
        (std::ptr::addr_of!((*ctx).esi) as u32, [0x89, 0x35]),
        (std::ptr::addr_of!((*ctx).edi) as u32, [0x89, 0x3d]),
        (std::ptr::addr_of!((*ctx).esp) as u32, [0x89, 0x25]),
        (std::ptr::addr_of!((*ctx).ebp) as u32, [0x89, 0x2d]),
    ];
    for (field, store) in stores {
        buf.write(&store)?;
        buf.write(&field.to_le_bytes())?;
    }

    // pop eax
    // mov [context.return_address], eax
    buf.write(&[0x58])?;
    buf.write(&[0xa3])?;
    buf.write(&return_address.to_le_bytes())?;

    match layout.convention {
        Convention::Cdecl | Convention::Stdcall | Convention::Thiscall => {
            if layout.hidden_return {
                // pop edx, the hidden return-slot pointer
                buf.write(&[0x5a])?;
            }
            if layout.convention == Convention::Thiscall {
                // push ecx, the original `this`
                buf.write(&[0x51])?;
            }
            // push hook
            buf.write(&[0x68])?;
            buf.write(&(layout.hook as u32).to_le_bytes())?;
            if layout.hidden_return {
                // push edx, hidden pointer back on top
                buf.write(&[0x52])?;
            }
        }
        Convention::Fastcall => {
            // The relay takes the hook pointer in ECX, so the register
            // arguments shift: ECX moves to EDX and EDX spills to the
            // stack.
            if layout.hidden_return {
                // pop eax, the hidden return-slot pointer
                buf.write(&[0x58])?;
            }
            if layout.arity >= 2 {
                // push edx
                buf.write(&[0x52])?;
            }
            if layout.hidden_return {
                // push eax
                buf.write(&[0x50])?;
            }
            if layout.arity >= 1 {
                // mov edx, ecx
                buf.write(&[0x89, 0xca])?;
            }
            // mov ecx, hook
            buf.write(&[0xb9])?;
            buf.write(&(layout.hook as u32).to_le_bytes())?;
        }
        Convention::Win64 => return Err(HookError::NotEnoughSpace),
    }

    let position = layout.base + buf.stream_position()? as usize;
    match layout.convention {
        Convention::Cdecl => {
            // call relay
            // add esp, 4, dropping the hook argument (caller cleanup)
            // jmp [context.return_address]
            let relative = branch_offset(Address::new(layout.relay), position, JMP_SIZE)
                .ok_or(HookError::NotEnoughSpace)?;
            buf.write(&[CALL_OPCODE])?;
            buf.write(&relative.to_le_bytes())?;
            buf.write(&[0x83, 0xc4, 0x04])?;
            buf.write(&[0xff, 0x25])?;
            buf.write(&return_address.to_le_bytes())?;
        }
        _ => {
            // push [context.return_address]
            // jmp relay, which returns straight to the caller and cleans
            buf.write(&[0xff, 0x35])?;
            buf.write(&return_address.to_le_bytes())?;

            let position = layout.base + buf.stream_position()? as usize;
            let relative = branch_offset(Address::new(layout.relay), position, JMP_SIZE)
                .ok_or(HookError::NotEnoughSpace)?;
            buf.write(&[JMP_OPCODE])?;
            buf.write(&relative.to_le_bytes())?;
        }
    }

    Ok(())
}
