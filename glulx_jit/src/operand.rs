//! Operand decoding.
//!
//! An instruction is `opcode, mode nibbles, operand data`. The opcode takes
//! one, two or four bytes depending on its top bits. Each operand's addressing
//! mode is a nibble, two per byte (low nibble first), and the operand data
//! follows in operand order:
//!
//! | mode | load                      | store              |
//! |------|---------------------------|--------------------|
//! | 0    | constant zero             | discard            |
//! | 1-3  | signed constant, 1/2/4 B  | illegal            |
//! | 5-7  | memory at address, 1/2/4 B| memory at address  |
//! | 8    | pop                       | push               |
//! | 9-B  | local at offset, 1/2/4 B  | local at offset    |
//! | D-F  | memory at RAMSTART + off  | memory at RAMSTART + off |
//!
//! Modes 4 and C are illegal. RAM-relative addresses are folded into
//! absolute ones at decode time.

use glulx_core::MemorySpace;
use smallvec::SmallVec;

use crate::compiler::CompileAbort;

/// Whether an operand is read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Load,
    Store,
}

/// Where a loaded value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Src {
    Const(u32),
    Addr(u32),
    /// Byte offset into the current frame's locals.
    Local(u32),
    Stack,
}

/// Where a stored value goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dst {
    Discard,
    Addr(u32),
    Local(u32),
    Stack,
}

/// Access width of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Short,
    Word,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Short => 2,
            Width::Word => 4,
        }
    }

    /// Truncate `value` to this width.
    #[inline]
    pub const fn mask(self, value: u32) -> u32 {
        match self {
            Width::Byte => value & 0xFF,
            Width::Short => value & 0xFFFF,
            Width::Word => value,
        }
    }
}

/// Destination kinds written into call stubs for value-producing calls.
pub mod dest {
    pub const DISCARD: u32 = 0;
    pub const MEMORY: u32 = 1;
    pub const LOCAL: u32 = 2;
    pub const STACK: u32 = 3;
}

impl Dst {
    /// Encode as the `(kind, addr)` pair of a call stub.
    #[inline]
    pub const fn to_stub(self) -> (u32, u32) {
        match self {
            Dst::Discard => (dest::DISCARD, 0),
            Dst::Addr(addr) => (dest::MEMORY, addr),
            Dst::Local(offset) => (dest::LOCAL, offset),
            Dst::Stack => (dest::STACK, 0),
        }
    }

    /// Decode a stub's `(kind, addr)` pair; `None` for the string-resume kinds.
    #[inline]
    pub const fn from_stub(kind: u32, addr: u32) -> Option<Dst> {
        match kind {
            dest::DISCARD => Some(Dst::Discard),
            dest::MEMORY => Some(Dst::Addr(addr)),
            dest::LOCAL => Some(Dst::Local(addr)),
            dest::STACK => Some(Dst::Stack),
            _ => None,
        }
    }
}

/// One decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Load(Src),
    Store(Dst),
}

impl Operand {
    #[inline]
    pub fn src(self) -> Src {
        match self {
            Operand::Load(src) => src,
            Operand::Store(_) => Src::Const(0),
        }
    }

    #[inline]
    pub fn dst(self) -> Dst {
        match self {
            Operand::Store(dst) => dst,
            Operand::Load(_) => Dst::Discard,
        }
    }
}

pub type Operands = SmallVec<[Operand; 8]>;

/// Reads opcodes and operands out of memory.
#[derive(Debug, Clone, Copy)]
pub struct OperandCodec<'m> {
    mem: &'m MemorySpace,
}

impl<'m> OperandCodec<'m> {
    pub fn new(mem: &'m MemorySpace) -> Self {
        OperandCodec { mem }
    }

    #[inline]
    fn byte(&self, pc: u32) -> Result<u32, CompileAbort> {
        self.mem
            .read8(pc)
            .map(u32::from)
            .map_err(|_| CompileAbort::Unreadable { pc })
    }

    #[inline]
    fn short(&self, pc: u32) -> Result<u32, CompileAbort> {
        self.mem
            .read16(pc)
            .map(u32::from)
            .map_err(|_| CompileAbort::Unreadable { pc })
    }

    #[inline]
    fn word(&self, pc: u32) -> Result<u32, CompileAbort> {
        self.mem
            .read32(pc)
            .map_err(|_| CompileAbort::Unreadable { pc })
    }

    /// Decode the opcode at `pc`; returns `(opcode, pc after it)`.
    pub(crate) fn opcode(&self, pc: u32) -> Result<(u32, u32), CompileAbort> {
        let first = self.byte(pc)?;
        Ok(match first {
            0x00..=0x7F => (first, pc + 1),
            0x80..=0xBF => (self.short(pc)? & 0x7FFF, pc + 2),
            _ => (self.word(pc)? & 0x0FFF_FFFF, pc + 4),
        })
    }

    /// Decode operands of the given kinds starting at `pc`.
    ///
    /// Returns the operands and the address of the next instruction.
    pub(crate) fn operands(
        &self,
        opcode: u32,
        op_pc: u32,
        pc: u32,
        kinds: &[OperandKind],
    ) -> Result<(Operands, u32), CompileAbort> {
        let mut cursor = pc + (kinds.len() as u32 + 1) / 2;
        let mut out = Operands::new();
        let illegal = CompileAbort::BadOpcode { pc: op_pc, opcode };

        for (index, &kind) in kinds.iter().enumerate() {
            let modes = self.byte(pc + index as u32 / 2)?;
            let mode = if index & 1 == 0 { modes & 0xF } else { modes >> 4 };

            let (data, len) = match mode {
                0x0 | 0x8 => (0, 0),
                0x1 | 0x5 | 0x9 | 0xD => (self.byte(cursor)?, 1),
                0x2 | 0x6 | 0xA | 0xE => (self.short(cursor)?, 2),
                0x3 | 0x7 | 0xB | 0xF => (self.word(cursor)?, 4),
                _ => return Err(illegal),
            };
            cursor += len;

            let ram = self.mem.ram_start();
            let operand = match (kind, mode) {
                (OperandKind::Load, 0x0) => Operand::Load(Src::Const(0)),
                (OperandKind::Load, 0x1) => Operand::Load(Src::Const(data as u8 as i8 as i32 as u32)),
                (OperandKind::Load, 0x2) => Operand::Load(Src::Const(data as u16 as i16 as i32 as u32)),
                (OperandKind::Load, 0x3) => Operand::Load(Src::Const(data)),
                (OperandKind::Load, 0x5..=0x7) => Operand::Load(Src::Addr(data)),
                (OperandKind::Load, 0x8) => Operand::Load(Src::Stack),
                (OperandKind::Load, 0x9..=0xB) => Operand::Load(Src::Local(data)),
                (OperandKind::Load, _) => Operand::Load(Src::Addr(ram.wrapping_add(data))),

                (OperandKind::Store, 0x0) => Operand::Store(Dst::Discard),
                (OperandKind::Store, 0x1..=0x3) => return Err(illegal),
                (OperandKind::Store, 0x5..=0x7) => Operand::Store(Dst::Addr(data)),
                (OperandKind::Store, 0x8) => Operand::Store(Dst::Stack),
                (OperandKind::Store, 0x9..=0xB) => Operand::Store(Dst::Local(data)),
                (OperandKind::Store, _) => Operand::Store(Dst::Addr(ram.wrapping_add(data))),
            };
            out.push(operand);
        }

        Ok((out, cursor))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use glulx_core::asm::{ImageBuilder, Operand as A};
    use OperandKind::{Load as L, Store as S};

    fn memory_with(build: impl FnOnce(&mut ImageBuilder)) -> (MemorySpace, u32) {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(1);
        let at = asm.pos() as u32;
        build(&mut asm);
        let image = asm.build(main);
        (MemorySpace::new(&image.bytes).unwrap(), at)
    }

    #[test]
    fn test_decodes_one_two_and_four_byte_opcodes() {
        let (mem, at) = memory_with(|asm| {
            asm.op(0x10, &[]).op(0x104, &[]).op(0x1234_5678 & 0x0FFF_FFFF, &[]);
        });
        let codec = OperandCodec::new(&mem);
        assert_eq!(codec.opcode(at).unwrap(), (0x10, at + 1));
        assert_eq!(codec.opcode(at + 1).unwrap(), (0x104, at + 3));
        assert_eq!(codec.opcode(at + 3).unwrap(), (0x0234_5678, at + 7));
    }

    #[test]
    fn test_decodes_all_load_modes() {
        let (mem, at) = memory_with(|asm| {
            asm.op(
                0x10,
                &[A::Imm(-2), A::Imm(-300), A::Imm(70000), A::Stack, A::Local(4), A::Mem(0x24)],
            );
        });
        let codec = OperandCodec::new(&mem);
        let (opcode, pc) = codec.opcode(at).unwrap();
        let (ops, next) = codec.operands(opcode, at, pc, &[L, L, L, L, L, L]).unwrap();
        assert_eq!(
            ops.as_slice(),
            &[
                Operand::Load(Src::Const(-2i32 as u32)),
                Operand::Load(Src::Const(-300i32 as u32)),
                Operand::Load(Src::Const(70000)),
                Operand::Load(Src::Stack),
                Operand::Load(Src::Local(4)),
                Operand::Load(Src::Addr(0x24)),
            ]
        );
        // 3 mode bytes + 1 + 2 + 4 + 0 + 4 + 4
        assert_eq!(next, pc + 3 + 15);
    }

    #[test]
    fn test_ram_relative_is_folded() {
        let (mem, at) = memory_with(|asm| {
            asm.op(0x40, &[A::Ram(8), A::Ram(12)]);
        });
        let codec = OperandCodec::new(&mem);
        let ram = mem.ram_start();
        let (ops, _) = codec.operands(0x40, at, at + 1, &[L, S]).unwrap();
        assert_eq!(ops[0], Operand::Load(Src::Addr(ram + 8)));
        assert_eq!(ops[1], Operand::Store(Dst::Addr(ram + 12)));
    }

    #[test]
    fn test_constant_store_is_illegal() {
        let (mem, at) = memory_with(|asm| {
            asm.op(0x40, &[A::Imm(1), A::Imm(5)]);
        });
        let codec = OperandCodec::new(&mem);
        assert_eq!(
            codec.operands(0x40, at, at + 1, &[L, S]),
            Err(CompileAbort::BadOpcode { pc: at, opcode: 0x40 })
        );
    }

    #[test]
    fn test_stub_destinations_round_trip() {
        for dst in [Dst::Discard, Dst::Addr(0x40), Dst::Local(8), Dst::Stack] {
            let (kind, addr) = dst.to_stub();
            assert_eq!(Dst::from_stub(kind, addr), Some(dst));
        }
        assert_eq!(Dst::from_stub(0x10, 0), None);
    }

    #[test]
    fn test_width_mask() {
        assert_eq!(Width::Byte.mask(0x1234), 0x34);
        assert_eq!(Width::Short.mask(0x12345678), 0x5678);
        assert_eq!(Width::Word.bytes(), 4);
    }
}
