//! Calls, tail calls and `catch`.

use glulx_core::Result;
use glulx_jit::{Dst, Width};

use crate::dispatch::ControlFlow;
use crate::io::IoCapability;
use crate::machine::Machine;

/// `call L0 L1 dst`: `L1` arguments popped off the stack.
pub fn call<I: IoCapability>(m: &mut Machine<I>, dst: Dst, next: u32) -> Result<ControlFlow> {
    let [addr, argc, ..] = m.regs.l;
    call_known(m, addr, argc, dst, next)
}

/// `call` with the address and count known at compile time.
pub fn call_known<I: IoCapability>(
    m: &mut Machine<I>,
    addr: u32,
    argc: u32,
    dst: Dst,
    next: u32,
) -> Result<ControlFlow> {
    let args = m.stack.pop_many(argc)?;
    let stub = m.value_stub(dst, next);
    m.call_function(addr, &args, stub)
}

/// `callf`..`callfiii`: arguments already in `L1..=argc`.
pub fn call_args<I: IoCapability>(
    m: &mut Machine<I>,
    argc: u8,
    dst: Dst,
    next: u32,
) -> Result<ControlFlow> {
    let regs = m.regs.l;
    let stub = m.value_stub(dst, next);
    m.call_function(regs[0], &regs[1..=argc as usize], stub)
}

/// `tailcall L0 L1`: replace the current frame with the callee's.
pub fn tail_call<I: IoCapability>(m: &mut Machine<I>) -> Result<ControlFlow> {
    let [addr, argc, ..] = m.regs.l;
    let args = m.stack.pop_many(argc)?;

    if let Some(index) = m.accel.lookup(addr) {
        let value = m.accel.call(index, &args, &m.mem, &mut m.io)?;
        return m.return_value(value);
    }

    // The stub below the current frame stays and receives the callee's result.
    m.stack.pop_frame();
    let body = m.enter_function(addr, &args)?;
    Ok(ControlFlow::Transfer(body))
}

/// `catch dst`: push a stub resuming at `next` and store the stack depth as
/// the token. The caller then takes the branch.
pub fn catch<I: IoCapability>(m: &mut Machine<I>, dst: Dst, next: u32) -> Result<()> {
    let stub = m.value_stub(dst, next);
    stub.push(&mut m.stack)?;
    let token = m.stack.depth_bytes();
    m.store(dst, token, Width::Word)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::config::VmConfig;
    use crate::io::NullIo;
    use crate::machine::{Machine, Termination};
    use glulx_core::asm::{ImageBuilder, Operand as A};
    use glulx_jit::opcode::*;

    fn run(build: impl FnOnce(&mut ImageBuilder) -> glulx_core::asm::Label) -> Termination {
        let mut asm = ImageBuilder::new();
        let main = build(&mut asm);
        let image = asm.build(main);
        let mut machine = Machine::new(&image.bytes, NullIo, VmConfig::for_testing()).unwrap();
        machine.run().unwrap()
    }

    #[test]
    fn test_stack_args_arrive_in_call_order() {
        let result = run(|asm| {
            let callee = asm.func_locals(2);
            asm.op(SUB, &[A::Local(0), A::Local(4), A::Stack]);
            asm.op(RETURN, &[A::Stack]);

            let main = asm.func_locals(0);
            asm.op(COPY, &[A::Imm(7), A::Stack]);
            asm.op(COPY, &[A::Imm(3), A::Stack]);
            // call pops 3 first, so the callee sees (3, 7).
            asm.op(CALL, &[A::AddrOf(callee), A::Imm(2), A::Stack]);
            asm.op(RETURN, &[A::Stack]);
            main
        });
        assert_eq!(result, Termination::Returned(-4i32 as u32));
    }

    #[test]
    fn test_tail_call_returns_to_original_caller() {
        let result = run(|asm| {
            let second = asm.func_locals(1);
            asm.op(MUL, &[A::Local(0), A::Imm(10), A::Stack]);
            asm.op(RETURN, &[A::Stack]);

            let first = asm.func_locals(1);
            asm.op(COPY, &[A::Local(0), A::Stack]);
            asm.op(TAILCALL, &[A::AddrOf(second), A::Imm(1)]);

            let main = asm.func_locals(1);
            asm.op(CALLFI, &[A::AddrOf(first), A::Imm(5), A::Local(0)]);
            asm.op(ADD, &[A::Local(0), A::Imm(1), A::Stack]);
            asm.op(RETURN, &[A::Stack]);
            main
        });
        assert_eq!(result, Termination::Returned(51));
    }

    #[test]
    fn test_stack_convention_pushes_args_and_count() {
        let result = run(|asm| {
            // Returns argc * 100 + first argument.
            let callee = asm.func_stack(0);
            asm.op(MUL, &[A::Stack, A::Imm(100), A::Stack]);
            asm.op(STKSWAP, &[]);
            asm.op(ADD, &[A::Stack, A::Stack, A::Stack]);
            asm.op(RETURN, &[A::Stack]);

            let main = asm.func_locals(0);
            asm.op(CALLFII, &[A::AddrOf(callee), A::Imm(4), A::Imm(9), A::Stack]);
            asm.op(RETURN, &[A::Stack]);
            main
        });
        assert_eq!(result, Termination::Returned(204));
    }
}
