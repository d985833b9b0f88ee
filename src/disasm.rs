//! Single-instruction decoding.
//!
//! A thin wrapper around the `iced_x86` decoder exposing exactly what the
//! patching machinery needs: instruction length, primary opcode byte,
//! operand classification, immediates and absolute targets of relative
//! branches. A failed decode reports length zero, which hooking treats as
//! fatal.

use iced_x86::{Decoder, DecoderOptions, OpKind};

use crate::address::Address;

/// The longest encodable x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    inner: iced_x86::Instruction,
    ip: u64,
}

impl Instruction {
    /// The primary opcode byte.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        (self.inner.op_code().op_code() & 0xff) as u8
    }

    /// Total instruction length in bytes, zero when decoding failed.
    #[must_use]
    pub fn length(&self) -> usize {
        if self.inner.is_invalid() {
            0
        } else {
            self.inner.len()
        }
    }

    /// Number of operands.
    #[must_use]
    pub fn operand_count(&self) -> usize {
        self.inner.op_count() as usize
    }

    fn kind(&self, operand: usize) -> OpKind {
        self.inner.op_kind(operand as u32)
    }

    /// Whether the operand is an immediate, including relative branch
    /// displacements.
    #[must_use]
    pub fn is_immediate_operand(&self, operand: usize) -> bool {
        self.is_relative_operand(operand)
            || matches!(
                self.kind(operand),
                OpKind::Immediate8
                    | OpKind::Immediate8_2nd
                    | OpKind::Immediate16
                    | OpKind::Immediate32
                    | OpKind::Immediate64
                    | OpKind::Immediate8to16
                    | OpKind::Immediate8to32
                    | OpKind::Immediate8to64
                    | OpKind::Immediate32to64
            )
    }

    /// Whether the operand is a relative branch displacement.
    #[must_use]
    pub fn is_relative_operand(&self, operand: usize) -> bool {
        matches!(
            self.kind(operand),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        )
    }

    /// Whether the operand is a register.
    #[must_use]
    pub fn is_register_operand(&self, operand: usize) -> bool {
        self.kind(operand) == OpKind::Register
    }

    /// Whether the operand is a memory reference.
    #[must_use]
    pub fn is_memory_operand(&self, operand: usize) -> bool {
        self.kind(operand) == OpKind::Memory
    }

    /// Whether any memory operand is RIP-relative.
    #[must_use]
    pub fn is_ip_relative(&self) -> bool {
        self.inner.is_ip_rel_memory_operand()
    }

    fn raw_immediate(&self, operand: usize) -> u64 {
        if self.is_relative_operand(operand) {
            // Report the branch displacement, as an immediate-with-relative
            // flag would.
            self.inner
                .near_branch_target()
                .wrapping_sub(self.ip.wrapping_add(self.inner.len() as u64))
        } else if self.is_immediate_operand(operand) {
            self.inner.immediate(operand as u32)
        } else {
            0
        }
    }

    /// The operand's immediate value as `u8`.
    #[must_use]
    pub fn imm8(&self, operand: usize) -> u8 {
        self.raw_immediate(operand) as u8
    }

    /// The operand's immediate value as `u16`.
    #[must_use]
    pub fn imm16(&self, operand: usize) -> u16 {
        self.raw_immediate(operand) as u16
    }

    /// The operand's immediate value as `u32`.
    #[must_use]
    pub fn imm32(&self, operand: usize) -> u32 {
        self.raw_immediate(operand) as u32
    }

    /// The operand's immediate value as `u64`.
    #[must_use]
    pub fn imm64(&self, operand: usize) -> u64 {
        self.raw_immediate(operand)
    }

    /// Absolute target of a relative branch operand, assuming the
    /// instruction executes at `runtime_address`. Zero for non-relative
    /// operands.
    #[must_use]
    pub fn abs(&self, runtime_address: Address, operand: usize) -> Address {
        if !self.is_relative_operand(operand) {
            return Address::NULL;
        }
        let next = runtime_address.value() as u64 + self.inner.len() as u64;
        let displacement = self.raw_immediate(operand);
        Address::new(next.wrapping_add(displacement) as usize)
    }
}

/// Decodes single instructions in the host machine mode.
#[derive(Debug, Clone)]
pub struct Disassembler {
    bitness: u32,
}

impl Disassembler {
    /// Creates a decoder for the host machine mode (32 or 64 bit).
    #[must_use]
    pub fn new() -> Self {
        Self {
            bitness: if cfg!(target_arch = "x86_64") { 64 } else { 32 },
        }
    }

    /// Decodes the instruction at `code`.
    ///
    /// # Safety
    ///
    /// At least [`MAX_INSTRUCTION_LEN`] bytes starting at `code` must be
    /// readable.
    #[must_use]
    pub unsafe fn disassemble(&self, code: Address) -> Instruction {
        let bytes = std::slice::from_raw_parts(code.as_ptr::<u8>(), MAX_INSTRUCTION_LEN);
        let mut decoder =
            Decoder::with_ip(self.bitness, bytes, code.value() as u64, DecoderOptions::NONE);
        Instruction {
            inner: decoder.decode(),
            ip: code.value() as u64,
        }
    }
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks whole instructions from `code` until at least `minimal` bytes are
/// covered, returning the covered length.
///
/// This is the prologue length used by the hook engine. Returns zero when
/// an instruction fails to decode, which install() reports as
/// `NotEnoughSpace`.
///
/// # Safety
///
/// The range `[code, code + result + MAX_INSTRUCTION_LEN)` must be readable.
#[must_use]
pub unsafe fn min_instruction_span(code: Address, minimal: usize) -> usize {
    let disasm = Disassembler::new();
    let mut size = 0usize;

    while size < minimal {
        let length = disasm.disassemble(code + size).length();
        if length == 0 {
            return 0;
        }
        size += length;
    }

    size
}
