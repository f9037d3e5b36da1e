//! The dispatcher: runs compiled units and owns all VM state.
//!
//! Execution alternates between two loops. The inner loop walks the ops of
//! one compiled unit by index. The outer step looks up a bytecode address in
//! the code cache whenever control leaves the unit: a call, a return, an
//! out-of-unit branch, or a resume from a continuation stub. Only that
//! lookup may compile, so an op index held by the inner loop is never
//! invalidated.
//!
//! Calls, returns and resumable output all go through continuation stubs on
//! the VM stack (see [`crate::stub`]). That keeps the host stack flat: a
//! deep Glulx call chain or a filter function invoked per printed character
//! never recurses in Rust.

use glulx_core::{FatalError, GameImage, MemorySpace, ProtectRange, Result};
use glulx_jit::{CodeCache, CodeCacheStats, Dst, Src, Width};
use tracing::{debug, error, info, trace, warn};

use crate::accel::Accelerator;
use crate::config::VmConfig;
use crate::dispatch::{self, ControlFlow};
use crate::frame::{FunctionHeader, Stack};
use crate::io::IoCapability;
use crate::output::IoSys;
use crate::persist::UndoChain;
use crate::random::Random;
use crate::stub::{kind, CallStub};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The `quit` opcode.
    Quit,
    /// The start function returned this value.
    Returned(u32),
}

/// Scratch registers of one instruction. `l` holds loaded operands, `s`
/// results waiting to be stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub l: [u32; glulx_jit::ops::LOAD_REGS],
    pub s: [u32; glulx_jit::ops::STORE_REGS],
}

/// A Glulx virtual machine.
pub struct Machine<I: IoCapability> {
    pub(crate) mem: MemorySpace,
    pub(crate) cache: CodeCache,
    pub(crate) stack: Stack,
    pub(crate) io: I,
    pub(crate) regs: Registers,
    pub(crate) iosys: IoSys,
    pub(crate) string_table: u32,
    pub(crate) accel: Accelerator,
    pub(crate) random: Random,
    pub(crate) undo: UndoChain,
    pub(crate) protect: ProtectRange,
    config: VmConfig,
    /// Where the next `run` starts; `None` before the start function ran.
    resume: Option<u32>,
    halted: Option<Termination>,
}

impl<I: IoCapability> Machine<I> {
    /// Load a story (bare image or Blorb).
    pub fn new(story: &[u8], io: I, config: VmConfig) -> Result<Self> {
        let image = GameImage::from_bytes(story)?;
        let mem = MemorySpace::new(image.bytes())?;
        let header = *mem.header();
        if let Err(err) = config.validate() {
            warn!(error = %err, "undo disabled by configuration");
        }

        info!(
            start = format_args!("{:#x}", header.start_func),
            stack = header.stack_size,
            cache = config.cache_size,
            "machine created"
        );

        Ok(Machine {
            cache: CodeCache::new(config.cache_config()),
            stack: Stack::new(header.stack_size),
            io,
            regs: Registers::default(),
            iosys: IoSys::default(),
            string_table: header.string_table,
            accel: Accelerator::new(),
            random: Random::new(config.random_seed),
            undo: UndoChain::new(config.undo_budget, config.max_undo_records),
            protect: ProtectRange::NONE,
            config,
            resume: None,
            halted: None,
            mem,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn memory(&self) -> &MemorySpace {
        &self.mem
    }

    #[inline]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    #[inline]
    pub fn io(&self) -> &I {
        &self.io
    }

    #[inline]
    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    pub fn into_io(self) -> I {
        self.io
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.cache
    }

    #[inline]
    pub fn cache_stats(&self) -> CodeCacheStats {
        self.cache.stats()
    }

    /// Number of undo records held.
    #[inline]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    #[inline]
    pub fn protected_range(&self) -> ProtectRange {
        self.protect
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Run until the program quits or its start function returns.
    pub fn run(&mut self) -> Result<Termination> {
        if let Some(done) = self.halted {
            return Ok(done);
        }
        let pc = match self.resume.take() {
            Some(pc) => pc,
            None => self.enter_start()?,
        };

        match self.execute_from(pc) {
            Ok(done) => {
                info!(?done, "machine halted");
                self.halted = Some(done);
                Ok(done)
            }
            Err(fatal) => {
                error!(error = %fatal, "fatal error");
                Err(fatal)
            }
        }
    }

    fn execute_from(&mut self, pc: u32) -> Result<Termination> {
        let mut ip = self.cache.get_code(&self.mem, pc)?.ip;
        loop {
            let op = self.cache.op(ip);
            match dispatch::execute(self, op, ip)? {
                ControlFlow::Continue => ip += 1,
                ControlFlow::Jump(target) => ip = target,
                ControlFlow::Transfer(pc) => ip = self.cache.get_code(&self.mem, pc)?.ip,
                ControlFlow::Halt(done) => return Ok(done),
            }
        }
    }

    /// Push the start function's frame; returns its first instruction.
    pub(crate) fn enter_start(&mut self) -> Result<u32> {
        let start = self.mem.header().start_func;
        self.stack.clear();
        self.enter_function(start, &[])
    }

    // =========================================================================
    // Operands
    // =========================================================================

    #[inline]
    pub(crate) fn load(&mut self, src: Src, width: Width) -> Result<u32> {
        match src {
            Src::Const(value) => Ok(width.mask(value)),
            Src::Addr(addr) => self.read_mem(addr, width),
            Src::Local(offset) => self.stack.local(offset, width),
            Src::Stack => self.stack.pop().map(|value| width.mask(value)),
        }
    }

    #[inline]
    pub(crate) fn store(&mut self, dst: Dst, value: u32, width: Width) -> Result<()> {
        match dst {
            Dst::Discard => Ok(()),
            Dst::Addr(addr) => self.write_mem(addr, value, width),
            Dst::Local(offset) => self.stack.set_local(offset, value, width),
            Dst::Stack => self.stack.push(width.mask(value)),
        }
    }

    #[inline]
    pub(crate) fn read_mem(&self, addr: u32, width: Width) -> Result<u32> {
        match width {
            Width::Word => self.mem.read32(addr),
            Width::Short => self.mem.read16(addr).map(u32::from),
            Width::Byte => self.mem.read8(addr).map(u32::from),
        }
    }

    /// Write memory and invalidate any compiled code the write covers.
    #[inline]
    pub(crate) fn write_mem(&mut self, addr: u32, value: u32, width: Width) -> Result<()> {
        match width {
            Width::Word => self.mem.write32(addr, value)?,
            Width::Short => self.mem.write16(addr, value as u16)?,
            Width::Byte => self.mem.write8(addr, value as u8)?,
        }
        self.cache.note_write(addr, width.bytes());
        Ok(())
    }

    // =========================================================================
    // Calls and returns
    // =========================================================================

    /// Push a frame for the function at `addr`; returns its first instruction.
    pub(crate) fn enter_function(&mut self, addr: u32, args: &[u32]) -> Result<u32> {
        let header = FunctionHeader::read(&self.mem, addr)?;
        self.stack.push_frame(&header, args)?;
        trace!(
            func = format_args!("{:#x}", addr),
            argc = args.len(),
            depth = self.stack.len(),
            "enter function"
        );
        Ok(header.body)
    }

    /// Call `addr` with `stub` as the continuation.
    pub(crate) fn call_function(
        &mut self,
        addr: u32,
        args: &[u32],
        stub: CallStub,
    ) -> Result<ControlFlow> {
        if let Some(index) = self.accel.lookup(addr) {
            let value = self.accel.call(index, args, &self.mem, &mut self.io)?;
            return self.deliver(stub, value);
        }
        stub.push(&mut self.stack)?;
        let body = self.enter_function(addr, args)?;
        Ok(ControlFlow::Transfer(body))
    }

    /// Stub routing a value to `dst` and resuming at `next` in this frame.
    #[inline]
    pub(crate) fn value_stub(&self, dst: Dst, next: u32) -> CallStub {
        CallStub::value(dst, next, self.stack.frame_ptr())
    }

    /// Leave the current function with `value`.
    pub(crate) fn return_value(&mut self, value: u32) -> Result<ControlFlow> {
        if self.stack.pop_frame() {
            return Ok(ControlFlow::Halt(Termination::Returned(value)));
        }
        let stub = CallStub::pop(&mut self.stack)?;
        self.deliver(stub, value)
    }

    /// Hand `value` to a popped stub and continue wherever it says.
    pub(crate) fn deliver(&mut self, stub: CallStub, value: u32) -> Result<ControlFlow> {
        if let Some(dst) = stub.destination() {
            self.store(dst, value, Width::Word)?;
            return Ok(ControlFlow::Transfer(stub.pc));
        }
        self.resume_output(stub)
    }

    /// `throw`: unwind to a `catch` token and deliver `value` there.
    pub(crate) fn throw(&mut self, value: u32, token: u32) -> Result<ControlFlow> {
        let depth = self.stack.depth_bytes();
        if token % 4 != 0 || (token as usize) < crate::stub::STUB_WORDS * 4 || token > depth {
            return Err(FatalError::BadThrowToken(token));
        }
        debug!(token, depth, "throw");
        self.stack.truncate(token as usize / 4);
        let stub = CallStub::pop(&mut self.stack)?;
        self.deliver(stub, value)
    }

    /// Discard the heap, stack and output state and re-enter the start
    /// function (`restart`).
    pub(crate) fn restart(&mut self) -> Result<u32> {
        info!("restart");
        let ram_start = self.mem.ram_start();
        let old_end = self.mem.end_mem();
        self.mem.reset(self.protect)?;
        self.cache.prune(ram_start, old_end.max(self.mem.end_mem()) - ram_start);
        self.iosys = IoSys::default();
        self.string_table = self.mem.header().string_table;
        self.enter_start()
    }

    /// After RAM was replaced wholesale: forget code compiled from it.
    pub(crate) fn invalidate_ram_code(&mut self, old_end: u32) {
        let ram_start = self.mem.ram_start();
        let end = old_end.max(self.mem.end_mem());
        self.cache.prune(ram_start, end - ram_start);
    }

    /// Pop the stub pushed by a save or undo snapshot and deliver `status`.
    pub(crate) fn resume_after_restore(&mut self, status: u32) -> Result<ControlFlow> {
        let stub = CallStub::pop(&mut self.stack)?;
        if !matches!(stub.kind, kind::DISCARD..=kind::STACK) {
            return Err(FatalError::BadCallStub(stub.kind));
        }
        self.deliver(stub, status)
    }
}

impl<I: IoCapability> std::fmt::Debug for Machine<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("end_mem", &self.mem.end_mem())
            .field("stack_words", &self.stack.len())
            .field("iosys", &self.iosys)
            .field("undo_depth", &self.undo.len())
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}
