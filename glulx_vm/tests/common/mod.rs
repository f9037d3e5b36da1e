//! Shared helpers for the integration suites.
//!
//! Every test assembles its story with [`ImageBuilder`]; no external story
//! files are involved.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use glulx_core::asm::{ImageBuilder, Label};
use glulx_core::{MemorySpace, Result};
use glulx_vm::{CaptureIo, IoCapability, Machine, Termination, VmConfig};

pub use glulx_core::asm::Operand as A;
pub use glulx_jit::opcode::*;

/// Build and run to completion with captured output.
pub fn run(asm: ImageBuilder, main: Label) -> (Machine<CaptureIo>, Termination) {
    run_with(asm, main, VmConfig::for_testing())
}

pub fn run_with(
    asm: ImageBuilder,
    main: Label,
    config: VmConfig,
) -> (Machine<CaptureIo>, Termination) {
    let image = asm.build(main);
    let mut machine = Machine::new(&image.bytes, CaptureIo::new(), config).unwrap();
    let done = machine.run().unwrap();
    (machine, done)
}

/// Switch the current function to direct output.
pub fn direct_output(asm: &mut ImageBuilder) {
    asm.op(SETIOSYS, &[A::Imm(2), A::Imm(0)]);
}

// =============================================================================
// File-backed streams
// =============================================================================

/// Keeps each stream in its own file under a directory.
#[derive(Debug)]
pub struct FileIo {
    dir: PathBuf,
    pub output: String,
}

impl FileIo {
    pub fn new(dir: &Path) -> Self {
        FileIo {
            dir: dir.to_path_buf(),
            output: String::new(),
        }
    }

    pub fn path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("stream-{}.glksave", id))
    }
}

impl IoCapability for FileIo {
    fn put_char(&mut self, ch: u8) {
        self.output.push(ch as char);
    }

    fn put_char_uni(&mut self, ch: u32) {
        self.output.push(char::from_u32(ch).unwrap_or('?'));
    }

    fn dispatch(&mut self, _selector: u32, _args: &[u32], _mem: &mut MemorySpace) -> Result<u32> {
        Ok(0)
    }

    fn write_stream(&mut self, id: u32, bytes: &[u8]) -> bool {
        fs::write(self.path(id), bytes).is_ok()
    }

    fn read_stream(&mut self, id: u32) -> Option<Vec<u8>> {
        fs::read(self.path(id)).ok()
    }
}
