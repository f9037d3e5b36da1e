//! The micro-op instruction set.
//!
//! Every bytecode instruction compiles to a short sequence of ops over a
//! small register file: operand loads into `L0..L6`, a computation that
//! leaves its results in `S0`/`S1`, then stores out of `S0`/`S1`. Registers
//! never stay live across instructions.
//!
//! Ops that can hand control to other code (calls, output, saves) carry the
//! address of the following instruction so the continuation stub they push
//! knows where to resume.

use crate::operand::{Dst, Src, Width};

/// Load-register count.
pub const LOAD_REGS: usize = 7;

/// Store-register count.
pub const STORE_REGS: usize = 2;

/// Destination of a branch or jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Branch offsets 0 and 1: return that value from the current function.
    Return(u32),
    /// Bytecode address, looked up in the cache at run time.
    Abs(u32),
    /// Op offset inside the same unit, relative to the branching op.
    Rel(i16),
}

impl Target {
    /// Resolve a branch offset operand against the following instruction.
    #[inline]
    pub fn from_offset(offset: u32, next_pc: u32) -> Target {
        match offset {
            0 | 1 => Target::Return(offset),
            _ => Target::Abs(next_pc.wrapping_add(offset).wrapping_sub(2)),
        }
    }
}

/// Branch conditions. Operands are read from `L0..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Jz,
    Jnz,
    Jeq,
    Jne,
    Jlt,
    Jge,
    Jgt,
    Jle,
    Jltu,
    Jgeu,
    Jgtu,
    Jleu,
    Jfeq,
    Jfne,
    Jflt,
    Jfle,
    Jfgt,
    Jfge,
    Jisnan,
    Jisinf,
}

impl Cond {
    /// Number of value operands before the branch offset.
    #[inline]
    pub const fn arity(self) -> usize {
        match self {
            Cond::Jz | Cond::Jnz | Cond::Jisnan | Cond::Jisinf => 1,
            Cond::Jfeq | Cond::Jfne => 3,
            _ => 2,
        }
    }
}

/// Register-to-register computations. Results land in `S0` (and `S1` for
/// `FMod`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Calc {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    ShiftL,
    SShiftR,
    UShiftR,
    Copy,
    Sexs,
    Sexb,
    Aload,
    Aloads,
    Aloadb,
    Aloadbit,
    NumToF,
    FtoNumZ,
    FtoNumN,
    Ceil,
    Floor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMod,
    Sqrt,
    Exp,
    Log,
    Pow,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
}

/// One micro-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Operand staging
    Load { reg: u8, src: Src, width: Width },
    /// `L0 = a; L1 = b` from constants.
    LoadConst2(u32, u32),
    /// `L0, L1` from two locals.
    LoadLocal2(u32, u32),
    Store { reg: u8, dst: Dst, width: Width },

    // Computation
    Calc(Calc),
    /// `Calc` then store `S0` to a word destination.
    CalcStore(Calc, Dst),
    /// `S0 = src` (word).
    Fetch(Src),
    /// Word copy from `src` to `dst`.
    Move(Src, Dst),

    // Control
    Branch(Cond, Target),
    /// Branch with the offset in `L[arity]`; carries the next PC.
    BranchVar(Cond, u32),
    Jump(Target),
    /// Jump by the offset in `L0`.
    JumpVar(u32),
    /// Jump to the address in `L0`.
    JumpAbs,

    // Calls. `L0` is the function address.
    /// Arguments on the stack, count in `L1`.
    Call { dst: Dst, next: u32 },
    /// Arguments in `L1..=argc`.
    CallArgs { argc: u8, dst: Dst, next: u32 },
    /// Known address and argument count; arguments on the stack.
    CallKnown { addr: u32, argc: u32, dst: Dst, next: u32 },
    TailCall,
    Return,
    ReturnConst(u32),
    ReturnLocal(u32),
    Catch { dst: Dst, next: u32, target: Target },
    /// Catch with the branch offset in `L0`.
    CatchVar { dst: Dst, next: u32 },
    Throw,

    // Array stores: `L0` base, `L1` index, `L2` value.
    Astore(Width),
    Astorebit,
    AstoreConst(Width, u32),

    // Value stack
    StkCount,
    StkPeek,
    StkSwap,
    StkRoll,
    StkCopy,

    // Output; each carries the PC to resume at after a filter call.
    StreamChar(u32),
    StreamNum(u32),
    StreamStr(u32),
    StreamUniChar(u32),

    // System
    Gestalt,
    DebugTrap,
    GetMemSize,
    SetMemSize,
    Random,
    SetRandom,
    Quit,
    Verify,
    Restart,
    Save { dst: Dst, next: u32 },
    Restore { dst: Dst },
    SaveUndo { dst: Dst, next: u32 },
    RestoreUndo { dst: Dst },
    Protect,
    HasUndo,
    DiscardUndo,
    Glk,
    GetStringTbl,
    SetStringTbl,
    GetIosys,
    SetIosys,
    LinearSearch,
    BinarySearch,
    LinkedSearch,
    MZero,
    MCopy,
    Malloc,
    MFree,
    AccelFunc,
    AccelParam,

    // Trampolines
    /// The cache filled up here; compile a fresh unit at this PC.
    Recompile(u32),
    /// Undecodable instruction; fatal only when executed. `None` when the
    /// opcode itself could not be read.
    Illegal { pc: u32, opcode: Option<u32> },
}

#[inline]
fn src_words(src: Src) -> u32 {
    match src {
        Src::Stack => 0,
        _ => 1,
    }
}

#[inline]
fn dst_words(dst: Dst) -> u32 {
    match dst {
        Dst::Discard | Dst::Stack => 0,
        _ => 1,
    }
}

impl Op {
    /// Cache space this op accounts for, in 4-byte words: one for the op
    /// itself plus one per inline operand.
    pub fn words(&self) -> u32 {
        1 + match *self {
            Op::Load { src, .. } | Op::Fetch(src) => src_words(src),
            Op::Store { dst, .. } | Op::CalcStore(_, dst) => dst_words(dst),
            Op::LoadConst2(..) | Op::LoadLocal2(..) => 2,
            Op::Move(src, dst) => src_words(src) + dst_words(dst),
            Op::Branch(..) | Op::BranchVar(..) | Op::Jump(_) | Op::JumpVar(_) => 1,
            Op::Call { dst, .. } | Op::CallArgs { dst, .. } => 1 + dst_words(dst),
            Op::CallKnown { dst, .. } => 3 + dst_words(dst),
            Op::ReturnConst(_) | Op::ReturnLocal(_) | Op::AstoreConst(..) => 1,
            Op::Catch { dst, .. } => 2 + dst_words(dst),
            Op::CatchVar { dst, .. } => 1 + dst_words(dst),
            Op::StreamChar(_) | Op::StreamNum(_) | Op::StreamStr(_) | Op::StreamUniChar(_) => 1,
            Op::Save { dst, .. } | Op::SaveUndo { dst, .. } => 1 + dst_words(dst),
            Op::Restore { dst } | Op::RestoreUndo { dst } => dst_words(dst),
            Op::Recompile(_) => 1,
            Op::Illegal { .. } => 2,
            _ => 0,
        }
    }

    /// Branch target carried by this op, if any.
    #[inline]
    pub fn target(&self) -> Option<Target> {
        match *self {
            Op::Branch(_, target) | Op::Jump(target) | Op::Catch { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Replace the branch target carried by this op.
    #[inline]
    pub fn set_target(&mut self, new: Target) {
        match self {
            Op::Branch(_, target) | Op::Jump(target) | Op::Catch { target, .. } => *target = new,
            _ => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_offset() {
        assert_eq!(Target::from_offset(0, 0x100), Target::Return(0));
        assert_eq!(Target::from_offset(1, 0x100), Target::Return(1));
        assert_eq!(Target::from_offset(10, 0x100), Target::Abs(0x108));
        assert_eq!(Target::from_offset(-4i32 as u32, 0x100), Target::Abs(0xFA));
    }

    #[test]
    fn test_cond_arity() {
        assert_eq!(Cond::Jz.arity(), 1);
        assert_eq!(Cond::Jltu.arity(), 2);
        assert_eq!(Cond::Jfeq.arity(), 3);
        assert_eq!(Cond::Jisinf.arity(), 1);
    }

    #[test]
    fn test_word_accounting() {
        assert_eq!(Op::Return.words(), 1);
        assert_eq!(Op::Load { reg: 0, src: Src::Stack, width: Width::Word }.words(), 1);
        assert_eq!(Op::Load { reg: 0, src: Src::Const(3), width: Width::Word }.words(), 2);
        assert_eq!(Op::LoadConst2(1, 2).words(), 3);
        assert_eq!(Op::Move(Src::Local(0), Dst::Addr(4)).words(), 3);
    }

    #[test]
    fn test_set_target() {
        let mut op = Op::Branch(Cond::Jz, Target::Abs(0x40));
        op.set_target(Target::Rel(-3));
        assert_eq!(op.target(), Some(Target::Rel(-3)));
        assert_eq!(Op::Return.target(), None);
    }
}
