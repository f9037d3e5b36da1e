//! Persistent state: undo snapshots and save files.
//!
//! Both capture the same three things (RAM, the stack and the heap
//! summary) and both are taken with a continuation stub for the triggering
//! instruction on top of the stack. Restoring therefore only has to reload
//! the state and pop that stub to land back on the instruction's store
//! operand.

pub mod savefile;
pub mod undo;

pub use undo::UndoChain;

use glulx_core::{FatalError, HeapAllocator, HeapSummary, MemorySpace, ProtectRange};

use crate::frame::Stack;

/// A complete, self-contained VM state ready to be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Memory size at capture time.
    pub end_mem: u32,
    /// `[RAMSTART, end_mem)`.
    pub ram: Vec<u8>,
    pub stack: Vec<u32>,
    pub heap: HeapSummary,
}

impl Snapshot {
    /// Capture the live state.
    pub fn capture(mem: &MemorySpace, stack: &Stack) -> Self {
        Snapshot {
            end_mem: mem.end_mem(),
            ram: mem.ram().to_vec(),
            stack: stack.words().to_vec(),
            heap: mem.heap_summary(),
        }
    }

    /// Load into memory and stack. Bytes inside `protect` keep their current
    /// values. Fails before changing anything when the snapshot does not fit.
    pub fn apply(
        &self,
        mem: &mut MemorySpace,
        stack: &mut Stack,
        protect: ProtectRange,
    ) -> Result<(), FatalError> {
        let heap = HeapAllocator::from_summary(&self.heap, self.end_mem)?;
        if self.stack.len() * 4 > stack.capacity_bytes() as usize {
            return Err(FatalError::StackOverflow);
        }
        mem.load_ram(self.end_mem, &self.ram, heap, protect)?;
        stack.load(&self.stack)
    }
}
