//! Micro-op dispatch.
//!
//! [`execute`] runs one [`Op`] against the machine and reports where control
//! goes next. Handlers that need more than a few lines live in [`crate::ops`]
//! and follow the same shape: take the machine, return a [`ControlFlow`].

use glulx_core::{FatalError, Result};
use glulx_jit::{Op, Target, Width};

use crate::io::IoCapability;
use crate::machine::{Machine, Termination};
use crate::ops::{arithmetic, calls, memory, system};

/// Where execution continues after an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// The next op of the current unit.
    Continue,
    /// An op index in the code cache (same unit).
    Jump(usize),
    /// A bytecode address, looked up in the code cache.
    Transfer(u32),
    /// Stop running.
    Halt(Termination),
}

/// Follow a branch target taken by the op at `ip`.
#[inline]
pub(crate) fn follow<I: IoCapability>(
    m: &mut Machine<I>,
    target: Target,
    ip: usize,
) -> Result<ControlFlow> {
    match target {
        Target::Rel(delta) => Ok(ControlFlow::Jump(ip.wrapping_add_signed(delta as isize))),
        Target::Abs(pc) => Ok(ControlFlow::Transfer(pc)),
        Target::Return(value) => m.return_value(value),
    }
}

/// Execute one op.
#[inline]
pub(crate) fn execute<I: IoCapability>(
    m: &mut Machine<I>,
    op: Op,
    ip: usize,
) -> Result<ControlFlow> {
    match op {
        // Operand staging
        Op::Load { reg, src, width } => {
            m.regs.l[reg as usize] = m.load(src, width)?;
        }
        Op::LoadConst2(a, b) => {
            m.regs.l[0] = a;
            m.regs.l[1] = b;
        }
        Op::LoadLocal2(a, b) => {
            m.regs.l[0] = m.stack.local(a, Width::Word)?;
            m.regs.l[1] = m.stack.local(b, Width::Word)?;
        }
        Op::Store { reg, dst, width } => {
            let value = m.regs.s[reg as usize];
            m.store(dst, value, width)?;
        }

        // Computation
        Op::Calc(kind) => arithmetic::calc(m, kind)?,
        Op::CalcStore(kind, dst) => {
            arithmetic::calc(m, kind)?;
            let value = m.regs.s[0];
            m.store(dst, value, Width::Word)?;
        }
        Op::Fetch(src) => {
            m.regs.s[0] = m.load(src, Width::Word)?;
        }
        Op::Move(src, dst) => {
            let value = m.load(src, Width::Word)?;
            m.store(dst, value, Width::Word)?;
        }

        // Control
        Op::Branch(cond, target) => {
            if arithmetic::test(cond, &m.regs.l) {
                return follow(m, target, ip);
            }
        }
        Op::BranchVar(cond, next) => {
            if arithmetic::test(cond, &m.regs.l) {
                let offset = m.regs.l[cond.arity()];
                return follow(m, Target::from_offset(offset, next), ip);
            }
        }
        Op::Jump(target) => return follow(m, target, ip),
        Op::JumpVar(next) => {
            let target = Target::from_offset(m.regs.l[0], next);
            return follow(m, target, ip);
        }
        Op::JumpAbs => return Ok(ControlFlow::Transfer(m.regs.l[0])),

        // Calls
        Op::Call { dst, next } => return calls::call(m, dst, next),
        Op::CallArgs { argc, dst, next } => return calls::call_args(m, argc, dst, next),
        Op::CallKnown { addr, argc, dst, next } => {
            return calls::call_known(m, addr, argc, dst, next)
        }
        Op::TailCall => return calls::tail_call(m),
        Op::Return => return m.return_value(m.regs.l[0]),
        Op::ReturnConst(value) => return m.return_value(value),
        Op::ReturnLocal(offset) => {
            let value = m.stack.local(offset, Width::Word)?;
            return m.return_value(value);
        }
        Op::Catch { dst, next, target } => {
            calls::catch(m, dst, next)?;
            return follow(m, target, ip);
        }
        Op::CatchVar { dst, next } => {
            let offset = m.regs.l[0];
            calls::catch(m, dst, next)?;
            return follow(m, Target::from_offset(offset, next), ip);
        }
        Op::Throw => return m.throw(m.regs.l[0], m.regs.l[1]),

        // Array stores
        Op::Astore(width) => {
            let value = m.regs.l[2];
            memory::astore(m, width, value)?;
        }
        Op::AstoreConst(width, value) => memory::astore(m, width, value)?,
        Op::Astorebit => memory::astorebit(m)?,

        // Value stack
        Op::StkCount => m.regs.s[0] = m.stack.value_count() as u32,
        Op::StkPeek => m.regs.s[0] = m.stack.peek(m.regs.l[0])?,
        Op::StkSwap => m.stack.swap()?,
        Op::StkRoll => m.stack.roll(m.regs.l[0], m.regs.l[1])?,
        Op::StkCopy => m.stack.copy_top(m.regs.l[0])?,

        // Output
        Op::StreamChar(next) => return m.stream_char(m.regs.l[0] & 0xFF, next),
        Op::StreamUniChar(next) => return m.stream_unichar(m.regs.l[0], next),
        Op::StreamNum(next) => return m.stream_num(m.regs.l[0], next),
        Op::StreamStr(next) => return m.stream_str(m.regs.l[0], next),

        // System
        Op::Gestalt => system::gestalt(m),
        Op::DebugTrap => return Err(FatalError::DebugTrap(m.regs.l[0])),
        Op::GetMemSize => m.regs.s[0] = m.mem.end_mem(),
        Op::SetMemSize => system::set_mem_size(m)?,
        Op::Random => m.regs.s[0] = m.random.range(m.regs.l[0]),
        Op::SetRandom => m.random.reseed(m.regs.l[0]),
        Op::Quit => return Ok(ControlFlow::Halt(Termination::Quit)),
        Op::Verify => system::verify(m),
        Op::Restart => return m.restart().map(ControlFlow::Transfer),
        Op::Save { dst, next } => return system::save(m, dst, next),
        Op::Restore { dst } => return system::restore(m, dst),
        Op::SaveUndo { dst, next } => return system::save_undo(m, dst, next),
        Op::RestoreUndo { dst } => return system::restore_undo(m, dst),
        Op::Protect => system::protect(m),
        Op::HasUndo => m.regs.s[0] = u32::from(m.undo.is_empty()),
        Op::DiscardUndo => m.undo.discard_latest(),
        Op::Glk => system::glk(m)?,
        Op::GetStringTbl => m.regs.s[0] = m.string_table,
        Op::SetStringTbl => m.string_table = m.regs.l[0],
        Op::GetIosys => {
            m.regs.s[0] = m.iosys.mode as u32;
            m.regs.s[1] = m.iosys.rock;
        }
        Op::SetIosys => m.iosys.set(m.regs.l[0], m.regs.l[1]),
        Op::LinearSearch | Op::BinarySearch | Op::LinkedSearch => system::search(m, op)?,
        Op::MZero => memory::mzero(m)?,
        Op::MCopy => memory::mcopy(m)?,
        Op::Malloc => memory::malloc(m)?,
        Op::MFree => memory::mfree(m)?,
        Op::AccelFunc => m.accel.set_func(m.regs.l[0], m.regs.l[1]),
        Op::AccelParam => m.accel.set_param(m.regs.l[0], m.regs.l[1]),

        // Trampolines
        Op::Recompile(pc) => return Ok(ControlFlow::Transfer(pc)),
        Op::Illegal { pc, opcode: Some(opcode) } => {
            return Err(FatalError::IllegalOpcode { pc, opcode })
        }
        Op::Illegal { pc, opcode: None } => return Err(FatalError::oob(pc)),
    }
    Ok(ControlFlow::Continue)
}
