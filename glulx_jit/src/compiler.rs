//! Bytecode to micro-op translation.
//!
//! [`compile_unit`] decodes instructions from an entry address until one of
//! them transfers control unconditionally (jump, return, tailcall, throw,
//! quit, restart). Each instruction gets a patch node recording its address
//! and op offset. When the unit is complete:
//!
//! 1. constant branch targets that land on an instruction of this unit are
//!    found by binary search over the patch nodes and rewritten from
//!    [`Target::Abs`] to [`Target::Rel`];
//! 2. patch nodes of instructions reachable from outside the unit become
//!    hash nodes; the rest are dropped.
//!
//! Two conditions abort an instruction halfway: the cache running out of
//! space and an undecodable instruction. Both roll the unit back to the last
//! complete instruction and close it with a trampoline op.

use glulx_core::MemorySpace;
use thiserror::Error;
use tracing::trace;

use crate::arena::Id;
use crate::code_cache::{
    CacheNode, CodeCache, PatchNode, NODE_WORDS, RESERVE_WORDS, UNIT_HEADER_WORDS,
};
use crate::opcode::{self, *};
use crate::operand::{Dst, Operand, OperandCodec, Src, Width};
use crate::ops::{Calc, Cond, Op, Target};
use crate::peephole::Peephole;

/// Slack left below the unit limit before an instruction is started.
const UNIT_MARGIN: u32 = 64;

/// Reasons an instruction could not be compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum CompileAbort {
    #[error("code cache is full")]
    CacheFull,
    #[error("illegal opcode {opcode:#x} at {pc:#x}")]
    BadOpcode { pc: u32, opcode: u32 },
    #[error("instruction at {pc:#x} lies outside memory")]
    Unreadable { pc: u32 },
}

/// What one compiled instruction means for the rest of the unit.
#[derive(Debug, Clone, Copy)]
struct Step {
    next: u32,
    ends_unit: bool,
    refs_next: bool,
    fixup: Option<u32>,
}

impl Step {
    fn new(next: u32) -> Self {
        Step {
            next,
            ends_unit: false,
            refs_next: false,
            fixup: None,
        }
    }
}

/// Compile the unit starting at `pc` into `cache`; returns its entry ip.
///
/// Fails with [`CompileAbort::CacheFull`] only if not even the first
/// instruction fits.
pub(crate) fn compile_unit(
    cache: &mut CodeCache,
    mem: &MemorySpace,
    pc: u32,
) -> Result<usize, CompileAbort> {
    trace!(pc = format_args!("{:#x}", pc), "compiling unit");

    let budget = cache
        .free_words()
        .saturating_sub(RESERVE_WORDS + UNIT_HEADER_WORDS);
    let limit = cache.unit_limit();
    let peephole = Peephole::new(cache.peephole_enabled());
    let code_start = cache.code.len();
    let node_start = cache.nodes.next_id();

    let mut unit = UnitCompiler {
        codec: OperandCodec::new(mem),
        peephole,
        code_start,
        node_start,
        words: 0,
        budget,
        cache: &mut *cache,
    };
    let source_end = unit.run(pc, limit)?;
    let words = unit.words;
    unit.resolve_branches();

    cache.commit_unit(mem, pc, source_end, code_start, node_start, words);
    Ok(code_start)
}

struct UnitCompiler<'c, 'm> {
    cache: &'c mut CodeCache,
    codec: OperandCodec<'m>,
    peephole: Peephole,
    code_start: usize,
    node_start: Id<CacheNode>,
    /// Op words emitted so far.
    words: u32,
    /// Words this unit may use for ops and nodes.
    budget: u32,
}

impl UnitCompiler<'_, '_> {
    #[inline]
    fn node_words(&self) -> u32 {
        (self.cache.nodes.len() as u32 - self.node_start.index()) * NODE_WORDS
    }

    #[inline]
    fn offset(&self) -> u32 {
        (self.cache.code.len() - self.code_start) as u32
    }

    fn rollback(&mut self, code_len: usize, node: Id<CacheNode>, words: u32) {
        self.cache.code.truncate(code_len);
        self.cache.nodes.truncate(node);
        self.words = words;
        self.peephole.reset();
    }

    /// Append a trampoline; uses the reserved words, never fails.
    fn emit_closing(&mut self, op: Op) {
        self.peephole.reset();
        self.peephole.emit(&mut self.cache.code, op);
        self.words += op.words();
    }

    /// Compile instructions until the unit ends; returns the source end.
    fn run(&mut self, entry: u32, limit: u32) -> Result<u32, CompileAbort> {
        let mut pc = entry;
        let mut referenced = true;
        let mut compiled = 0u32;

        loop {
            let mark = (self.cache.code.len(), self.cache.nodes.next_id(), self.words);
            self.peephole.reset();

            if self.words + self.node_words() + NODE_WORDS > self.budget {
                return self.abort_full(pc, compiled, mark);
            }
            let node = self.cache.nodes.alloc(CacheNode::Patch(PatchNode {
                pc,
                offset: self.offset(),
                fixup: None,
                referenced,
            }));

            match self.instruction(pc) {
                Ok(step) => {
                    compiled += 1;
                    if let CacheNode::Patch(patch) = &mut self.cache.nodes[node] {
                        patch.fixup = step.fixup;
                    }
                    pc = step.next;
                    if step.ends_unit {
                        return Ok(pc);
                    }
                    referenced = step.refs_next;
                    if self.words + self.node_words() + UNIT_MARGIN >= limit {
                        // Unit too long: continue in a new unit.
                        self.emit_closing(Op::Jump(Target::Abs(pc)));
                        return Ok(pc);
                    }
                }
                Err(CompileAbort::CacheFull) => return self.abort_full(pc, compiled, mark),
                Err(CompileAbort::BadOpcode { pc: at, opcode }) => {
                    self.rollback(mark.0, Id::new(mark.1.index() + 1), mark.2);
                    self.emit_closing(Op::Illegal {
                        pc: at,
                        opcode: Some(opcode),
                    });
                    return Ok(pc);
                }
                Err(CompileAbort::Unreadable { .. }) => {
                    self.rollback(mark.0, Id::new(mark.1.index() + 1), mark.2);
                    self.emit_closing(Op::Illegal { pc, opcode: None });
                    return Ok(pc);
                }
            }
        }
    }

    fn abort_full(
        &mut self,
        pc: u32,
        compiled: u32,
        mark: (usize, Id<CacheNode>, u32),
    ) -> Result<u32, CompileAbort> {
        if compiled == 0 {
            self.rollback(self.code_start, self.node_start, 0);
            return Err(CompileAbort::CacheFull);
        }
        self.rollback(mark.0, mark.1, mark.2);
        self.emit_closing(Op::Recompile(pc));
        Ok(pc)
    }

    /// Rewrite constant branch targets that land inside this unit.
    fn resolve_branches(&mut self) {
        let patches: Vec<PatchNode> = self
            .cache
            .nodes
            .tail_mut(self.node_start)
            .iter()
            .filter_map(|node| match node {
                CacheNode::Patch(patch) => Some(*patch),
                _ => None,
            })
            .collect();

        for patch in &patches {
            let Some(at) = patch.fixup else { continue };
            let ip = self.code_start + at as usize;
            let Some(Target::Abs(dest)) = self.cache.code[ip].target() else {
                continue;
            };
            if let Ok(found) = patches.binary_search_by_key(&dest, |p| p.pc) {
                let delta = patches[found].offset as i32 - at as i32;
                if let Ok(rel) = i16::try_from(delta) {
                    self.cache.code[ip].set_target(Target::Rel(rel));
                }
            }
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit through the peephole optimizer; returns the op's unit offset.
    fn emit(&mut self, op: Op) -> Result<u32, CompileAbort> {
        if self.words + op.words() + self.node_words() > self.budget {
            return Err(CompileAbort::CacheFull);
        }
        let before = self.cache.code.len();
        let prev_words = match self.cache.code.last() {
            Some(prev) if before > self.code_start => prev.words(),
            _ => 0,
        };
        let at = self.peephole.emit(&mut self.cache.code, op);
        if at == before {
            self.words += op.words();
        } else {
            self.words = self.words - prev_words + self.cache.code[at].words();
        }
        Ok((at - self.code_start) as u32)
    }

    fn load(&mut self, reg: usize, src: Src, width: Width) -> Result<(), CompileAbort> {
        self.emit(Op::Load {
            reg: reg as u8,
            src,
            width,
        })
        .map(drop)
    }

    fn store(&mut self, reg: usize, dst: Dst, width: Width) -> Result<(), CompileAbort> {
        self.emit(Op::Store {
            reg: reg as u8,
            dst,
            width,
        })
        .map(drop)
    }

    /// Load every load operand into `L0..` in operand order.
    fn loads(&mut self, args: &[Operand], width: Width) -> Result<(), CompileAbort> {
        let mut reg = 0;
        for arg in args {
            if let Operand::Load(src) = *arg {
                self.load(reg, src, width)?;
                reg += 1;
            }
        }
        Ok(())
    }

    /// Store `S0..` to every store operand in operand order.
    fn stores(&mut self, args: &[Operand], width: Width) -> Result<(), CompileAbort> {
        let mut reg = 0;
        for arg in args {
            if let Operand::Store(dst) = *arg {
                self.store(reg, dst, width)?;
                reg += 1;
            }
        }
        Ok(())
    }

    /// Loads, one op, stores.
    fn simple(&mut self, args: &[Operand], op: Op) -> Result<(), CompileAbort> {
        self.loads(args, Width::Word)?;
        self.emit(op)?;
        self.stores(args, Width::Word)
    }

    /// Emit a branch-like op whose target comes from `offset`.
    fn branch_to(
        &mut self,
        offset: Src,
        next: u32,
        reg: usize,
        fixed: impl FnOnce(Target) -> Op,
        variable: Op,
    ) -> Result<Option<u32>, CompileAbort> {
        match offset {
            Src::Const(offset) => {
                let target = Target::from_offset(offset, next);
                let at = self.emit(fixed(target))?;
                Ok(matches!(target, Target::Abs(_)).then_some(at))
            }
            src => {
                self.load(reg, src, Width::Word)?;
                self.emit(variable)?;
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn instruction(&mut self, pc: u32) -> Result<Step, CompileAbort> {
        let (opcode, after) = self.codec.opcode(pc)?;
        let kinds = opcode::signature(opcode).ok_or(CompileAbort::BadOpcode { pc, opcode })?;
        let (args, next) = self.codec.operands(opcode, pc, after, kinds)?;
        let mut step = Step::new(next);

        if let Some(kind) = calc_for(opcode) {
            let width = match opcode {
                COPYS => Width::Short,
                COPYB => Width::Byte,
                _ => Width::Word,
            };
            self.loads(&args, width)?;
            self.emit(Op::Calc(kind))?;
            self.stores(&args, width)?;
            return Ok(step);
        }

        if let Some(cond) = cond_for(opcode) {
            let arity = cond.arity();
            self.loads(&args[..arity], Width::Word)?;
            step.fixup = self.branch_to(
                args[arity].src(),
                next,
                arity,
                |target| Op::Branch(cond, target),
                Op::BranchVar(cond, next),
            )?;
            return Ok(step);
        }

        match opcode {
            NOP => {}

            JUMP => {
                step.fixup =
                    self.branch_to(args[0].src(), next, 0, Op::Jump, Op::JumpVar(next))?;
                step.ends_unit = true;
            }
            JUMPABS => {
                self.simple(&args, Op::JumpAbs)?;
                step.ends_unit = true;
            }

            CALL => {
                self.loads(&args, Width::Word)?;
                self.emit(Op::Call {
                    dst: args[2].dst(),
                    next,
                })?;
                step.refs_next = true;
            }
            CALLF | CALLFI | CALLFII | CALLFIII => {
                let argc = (opcode - CALLF) as usize;
                self.loads(&args, Width::Word)?;
                self.emit(Op::CallArgs {
                    argc: argc as u8,
                    dst: args[argc + 1].dst(),
                    next,
                })?;
                step.refs_next = true;
            }
            TAILCALL => {
                self.simple(&args, Op::TailCall)?;
                step.ends_unit = true;
            }
            RETURN => {
                self.simple(&args, Op::Return)?;
                step.ends_unit = true;
            }
            CATCH => {
                let dst = args[0].dst();
                step.fixup = self.branch_to(
                    args[1].src(),
                    next,
                    0,
                    |target| Op::Catch { dst, next, target },
                    Op::CatchVar { dst, next },
                )?;
                step.refs_next = true;
            }
            THROW => {
                self.simple(&args, Op::Throw)?;
                step.ends_unit = true;
            }

            ASTORE => self.simple(&args, Op::Astore(Width::Word))?,
            ASTORES => self.simple(&args, Op::Astore(Width::Short))?,
            ASTOREB => self.simple(&args, Op::Astore(Width::Byte))?,
            ASTOREBIT => self.simple(&args, Op::Astorebit)?,

            STKCOUNT => self.simple(&args, Op::StkCount)?,
            STKPEEK => self.simple(&args, Op::StkPeek)?,
            STKSWAP => self.simple(&args, Op::StkSwap)?,
            STKROLL => self.simple(&args, Op::StkRoll)?,
            STKCOPY => self.simple(&args, Op::StkCopy)?,

            STREAMCHAR | STREAMNUM | STREAMSTR | STREAMUNICHAR => {
                let op = match opcode {
                    STREAMCHAR => Op::StreamChar(next),
                    STREAMNUM => Op::StreamNum(next),
                    STREAMSTR => Op::StreamStr(next),
                    _ => Op::StreamUniChar(next),
                };
                self.simple(&args, op)?;
                step.refs_next = true;
            }

            GESTALT => self.simple(&args, Op::Gestalt)?,
            DEBUGTRAP => self.simple(&args, Op::DebugTrap)?,
            GETMEMSIZE => self.simple(&args, Op::GetMemSize)?,
            SETMEMSIZE => self.simple(&args, Op::SetMemSize)?,
            RANDOM => self.simple(&args, Op::Random)?,
            SETRANDOM => self.simple(&args, Op::SetRandom)?,
            QUIT => {
                self.emit(Op::Quit)?;
                step.ends_unit = true;
            }
            VERIFY => self.simple(&args, Op::Verify)?,
            RESTART => {
                self.emit(Op::Restart)?;
                step.ends_unit = true;
            }
            SAVE => {
                self.loads(&args, Width::Word)?;
                self.emit(Op::Save {
                    dst: args[1].dst(),
                    next,
                })?;
                step.refs_next = true;
            }
            RESTORE => {
                self.loads(&args, Width::Word)?;
                self.emit(Op::Restore { dst: args[1].dst() })?;
            }
            SAVEUNDO => {
                self.emit(Op::SaveUndo {
                    dst: args[0].dst(),
                    next,
                })?;
                step.refs_next = true;
            }
            RESTOREUNDO => {
                self.emit(Op::RestoreUndo { dst: args[0].dst() })?;
            }
            PROTECT => self.simple(&args, Op::Protect)?,
            HASUNDO => self.simple(&args, Op::HasUndo)?,
            DISCARDUNDO => self.simple(&args, Op::DiscardUndo)?,

            GLK => self.simple(&args, Op::Glk)?,
            GETSTRINGTBL => self.simple(&args, Op::GetStringTbl)?,
            SETSTRINGTBL => self.simple(&args, Op::SetStringTbl)?,
            GETIOSYS => self.simple(&args, Op::GetIosys)?,
            SETIOSYS => self.simple(&args, Op::SetIosys)?,

            LINEARSEARCH => self.simple(&args, Op::LinearSearch)?,
            BINARYSEARCH => self.simple(&args, Op::BinarySearch)?,
            LINKEDSEARCH => self.simple(&args, Op::LinkedSearch)?,

            MZERO => self.simple(&args, Op::MZero)?,
            MCOPY => self.simple(&args, Op::MCopy)?,
            MALLOC => self.simple(&args, Op::Malloc)?,
            MFREE => self.simple(&args, Op::MFree)?,

            ACCELFUNC => self.simple(&args, Op::AccelFunc)?,
            ACCELPARAM => self.simple(&args, Op::AccelParam)?,

            _ => return Err(CompileAbort::BadOpcode { pc, opcode }),
        }

        Ok(step)
    }
}

fn calc_for(opcode: u32) -> Option<Calc> {
    Some(match opcode {
        ADD => Calc::Add,
        SUB => Calc::Sub,
        MUL => Calc::Mul,
        DIV => Calc::Div,
        MOD => Calc::Mod,
        NEG => Calc::Neg,
        BITAND => Calc::BitAnd,
        BITOR => Calc::BitOr,
        BITXOR => Calc::BitXor,
        BITNOT => Calc::BitNot,
        SHIFTL => Calc::ShiftL,
        SSHIFTR => Calc::SShiftR,
        USHIFTR => Calc::UShiftR,
        COPY | COPYS | COPYB => Calc::Copy,
        SEXS => Calc::Sexs,
        SEXB => Calc::Sexb,
        ALOAD => Calc::Aload,
        ALOADS => Calc::Aloads,
        ALOADB => Calc::Aloadb,
        ALOADBIT => Calc::Aloadbit,
        NUMTOF => Calc::NumToF,
        FTONUMZ => Calc::FtoNumZ,
        FTONUMN => Calc::FtoNumN,
        CEIL => Calc::Ceil,
        FLOOR => Calc::Floor,
        FADD => Calc::FAdd,
        FSUB => Calc::FSub,
        FMUL => Calc::FMul,
        FDIV => Calc::FDiv,
        FMOD => Calc::FMod,
        SQRT => Calc::Sqrt,
        EXP => Calc::Exp,
        LOG => Calc::Log,
        POW => Calc::Pow,
        SIN => Calc::Sin,
        COS => Calc::Cos,
        TAN => Calc::Tan,
        ASIN => Calc::Asin,
        ACOS => Calc::Acos,
        ATAN => Calc::Atan,
        ATAN2 => Calc::Atan2,
        _ => return None,
    })
}

fn cond_for(opcode: u32) -> Option<Cond> {
    Some(match opcode {
        JZ => Cond::Jz,
        JNZ => Cond::Jnz,
        JEQ => Cond::Jeq,
        JNE => Cond::Jne,
        JLT => Cond::Jlt,
        JGE => Cond::Jge,
        JGT => Cond::Jgt,
        JLE => Cond::Jle,
        JLTU => Cond::Jltu,
        JGEU => Cond::Jgeu,
        JGTU => Cond::Jgtu,
        JLEU => Cond::Jleu,
        JFEQ => Cond::Jfeq,
        JFNE => Cond::Jfne,
        JFLT => Cond::Jflt,
        JFLE => Cond::Jfle,
        JFGT => Cond::Jfgt,
        JFGE => Cond::Jfge,
        JISNAN => Cond::Jisnan,
        JISINF => Cond::Jisinf,
        _ => return None,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_cache::{CacheConfig, MIN_CACHE_SIZE};
    use glulx_core::asm::{ImageBuilder, Operand as A};

    fn compile(peephole: bool, build: impl FnOnce(&mut ImageBuilder)) -> (CodeCache, Vec<Op>, u32) {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(2);
        let entry = asm.pos();
        build(&mut asm);
        let image = asm.build(main);
        let mem = MemorySpace::new(&image.bytes).unwrap();
        let mut cache = CodeCache::new(CacheConfig {
            size: MIN_CACHE_SIZE,
            peephole,
        });
        let ip = cache.get_code(&mem, entry).unwrap().ip;
        let len = cache.units[0].code_len as usize;
        let ops = cache.code[ip..ip + len].to_vec();
        (cache, ops, entry)
    }

    #[test]
    fn test_backward_branch_is_resolved_relative() {
        let (_, ops, _) = compile(true, |asm| {
            let top = asm.here();
            asm.op(ADD, &[A::Local(0), A::Imm(1), A::Local(0)]);
            asm.op(JLT, &[A::Local(0), A::Imm(10), A::Branch(top)]);
            asm.op(RETURN, &[A::Local(0)]);
        });
        // Load, Load, CalcStore | Load, Load, Branch | ReturnLocal
        let branch = ops
            .iter()
            .position(|op| matches!(op, Op::Branch(Cond::Jlt, _)))
            .unwrap();
        assert_eq!(ops[branch], Op::Branch(Cond::Jlt, Target::Rel(-(branch as i16))));
        assert_eq!(ops.last(), Some(&Op::ReturnLocal(0)));
    }

    #[test]
    fn test_forward_branch_is_resolved_relative() {
        let (_, ops, _) = compile(false, |asm| {
            let skip = asm.new_label();
            asm.op(JZ, &[A::Local(0), A::Branch(skip)]);
            asm.op(COPY, &[A::Imm(5), A::Local(4)]);
            asm.bind(skip);
            asm.op(RETURN, &[A::Local(4)]);
        });
        // Load, Branch | Load, Calc, Store | Load, Return
        assert_eq!(ops[1], Op::Branch(Cond::Jz, Target::Rel(4)));
        assert_eq!(ops.len(), 7);
    }

    #[test]
    fn test_branch_offsets_zero_and_one_return() {
        let (_, ops, _) = compile(true, |asm| {
            asm.op(JNZ, &[A::Local(0), A::Imm(1)]);
            asm.op(RETURN, &[A::Imm(0)]);
        });
        assert_eq!(ops[1], Op::Branch(Cond::Jnz, Target::Return(1)));
    }

    #[test]
    fn test_branch_out_of_unit_stays_absolute() {
        let (_, ops, entry) = compile(true, |asm| {
            let later = asm.new_label();
            asm.op(JUMP, &[A::Branch(later)]);
            asm.op(NOP, &[]);
            asm.bind(later);
            asm.op(RETURN, &[A::Imm(0)]);
        });
        // The unit ends at the jump; its target is compiled separately.
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0], Op::Jump(Target::Abs(entry + 7)));
    }

    #[test]
    fn test_call_resume_point_is_hashed() {
        let (cache, ops, entry) = compile(true, |asm| {
            asm.op(CALLF, &[A::Imm(0x30), A::Stack]);
            asm.op(RETURN, &[A::Stack]);
        });
        assert!(matches!(ops[0], Op::CallKnown { addr: 0x30, argc: 0, .. }));
        assert!(cache.contains(entry));
        assert!(cache.contains(entry + 4));
    }

    #[test]
    fn test_illegal_opcode_becomes_trampoline() {
        let mut bad = 0;
        let (_, ops, _) = compile(true, |asm| {
            asm.op(COPY, &[A::Imm(1), A::Local(0)]);
            bad = asm.pos();
            asm.op(0x16, &[]);
            asm.op(RETURN, &[A::Imm(0)]);
        });
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops.last(),
            Some(&Op::Illegal {
                pc: bad,
                opcode: Some(0x16)
            })
        );
    }

    #[test]
    fn test_constant_store_operand_is_illegal() {
        let (_, ops, entry) = compile(true, |asm| {
            asm.op(COPY, &[A::Imm(1), A::Imm(2)]);
        });
        assert_eq!(
            ops,
            vec![Op::Illegal {
                pc: entry,
                opcode: Some(COPY)
            }]
        );
    }

    #[test]
    fn test_copys_uses_short_width() {
        let (_, ops, _) = compile(true, |asm| {
            asm.op(COPYS, &[A::Mem(0x20), A::Stack]);
            asm.op(RETURN, &[A::Stack]);
        });
        assert_eq!(
            ops[0],
            Op::Load {
                reg: 0,
                src: Src::Addr(0x20),
                width: Width::Short
            }
        );
        assert_eq!(
            ops[2],
            Op::Store {
                reg: 0,
                dst: Dst::Stack,
                width: Width::Short
            }
        );
    }

    #[test]
    fn test_long_straight_line_code_is_split() {
        let (cache, ops, _) = compile(true, |asm| {
            for _ in 0..400 {
                asm.op(ADD, &[A::Local(0), A::Imm(1), A::Local(0)]);
            }
            asm.op(RETURN, &[A::Local(0)]);
        });
        let unit = cache.units[0];
        assert!(unit.words + unit.node_count * NODE_WORDS <= cache.unit_limit());
        assert!(matches!(ops.last(), Some(Op::Jump(Target::Abs(pc))) if *pc == unit.source_end));
    }
}
