//! System opcodes: gestalt, memory size, verify, glk, searches and the
//! save/restore/undo family.
//!
//! Save and undo capture the machine with a value stub for the triggering
//! instruction on top of the stack, then pop it again. A later restore
//! reloads that stack, so popping the stub lands on the instruction's store
//! operand with the "just restored" status.

use glulx_core::{FatalError, Header, ProtectRange, Result};
use glulx_jit::{Dst, Op, Width};
use tracing::{info, warn};

use crate::accel::Accelerator;
use crate::dispatch::ControlFlow;
use crate::gestalt::{self, GestaltInfo};
use crate::io::IoCapability;
use crate::machine::Machine;
use crate::persist::{savefile, Snapshot};
use crate::search::{self, ArraySearch};
use crate::stub::CallStub;

/// Status stored through a save or undo stub after a successful restore.
const RESTORED: u32 = 0xFFFF_FFFF;

pub fn gestalt<I: IoCapability>(m: &mut Machine<I>) {
    let info = GestaltInfo {
        heap_start: m.mem.heap().start(),
        accel_supported: Accelerator::supports,
    };
    m.regs.s[0] = gestalt::gestalt(m.regs.l[0], m.regs.l[1], &info);
}

/// `setmemsize L0 S0`: 0 on success, 1 while the heap is active or when the
/// size exceeds the configured limit. A size that is unaligned or below the
/// image's declared size is fatal.
pub fn set_mem_size<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let new_end = m.regs.l[0];
    let old_end = m.mem.end_mem();
    if new_end > m.config().max_memory.max(old_end) {
        warn!(requested = new_end, limit = m.config().max_memory, "setmemsize over limit");
        m.regs.s[0] = 1;
        return Ok(());
    }
    match m.mem.resize(new_end) {
        Ok(()) => {
            if new_end < old_end {
                m.cache.prune(new_end, old_end - new_end);
            }
            m.regs.s[0] = 0;
            Ok(())
        }
        Err(FatalError::ResizeWhileHeapActive) => {
            m.regs.s[0] = 1;
            Ok(())
        }
        Err(fatal) => Err(fatal),
    }
}

/// `verify S0`: 0 when the image checksum matches.
pub fn verify<I: IoCapability>(m: &mut Machine<I>) {
    let header = m.mem.header();
    let sum = Header::compute_checksum(m.mem.original(), header.ext_start);
    m.regs.s[0] = u32::from(sum != header.checksum);
}

/// `protect L0 L1`.
pub fn protect<I: IoCapability>(m: &mut Machine<I>) {
    m.protect = ProtectRange::new(m.regs.l[0], m.regs.l[1]);
}

/// `glk L0 L1 S0`: selector, then `L1` arguments popped from the stack.
pub fn glk<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let [selector, argc, ..] = m.regs.l;
    let args = m.stack.pop_many(argc)?;
    m.regs.s[0] = m.io.dispatch(selector, &args, &mut m.mem)?;
    Ok(())
}

pub fn search<I: IoCapability>(m: &mut Machine<I>, op: Op) -> Result<()> {
    m.regs.s[0] = match op {
        Op::LinearSearch => search::linear(&m.mem, &ArraySearch::from_regs(&m.regs.l))?,
        Op::BinarySearch => search::binary(&m.mem, &ArraySearch::from_regs(&m.regs.l))?,
        _ => search::linked(&m.mem, &m.regs.l)?,
    };
    Ok(())
}

// =============================================================================
// Save and restore
// =============================================================================

/// `save L0 S1`: write the state to stream `L0`; 0 on success, 1 on failure.
pub fn save<I: IoCapability>(m: &mut Machine<I>, dst: Dst, next: u32) -> Result<ControlFlow> {
    let stream = m.regs.l[0];
    m.value_stub(dst, next).push(&mut m.stack)?;
    let snapshot = Snapshot::capture(&m.mem, &m.stack);
    CallStub::pop(&mut m.stack)?;

    let bytes = savefile::write(&m.mem, &snapshot);
    let status = if m.io.write_stream(stream, &bytes) {
        info!(stream, bytes = bytes.len(), "game saved");
        0
    } else {
        warn!(stream, "save stream rejected the write");
        1
    };
    m.store(dst, status, Width::Word)?;
    Ok(ControlFlow::Continue)
}

/// `restore L0 S1`: on success execution continues after the matching
/// `save`; on failure 1 is stored here.
pub fn restore<I: IoCapability>(m: &mut Machine<I>, dst: Dst) -> Result<ControlFlow> {
    let stream = m.regs.l[0];
    let loaded = match m.io.read_stream(stream) {
        Some(bytes) => savefile::read(
            &bytes,
            &m.mem,
            m.stack.capacity_bytes(),
            m.config().max_memory,
        ),
        None => Err(glulx_core::PersistenceError::Stream(stream)),
    };
    let snapshot = match loaded {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(stream, error = %err, "restore failed");
            m.store(dst, 1, Width::Word)?;
            return Ok(ControlFlow::Continue);
        }
    };

    info!(stream, end_mem = snapshot.end_mem, "game restored");
    load_snapshot(m, &snapshot)
}

/// `saveundo S0`: 0 on success, 1 if no record could be kept.
pub fn save_undo<I: IoCapability>(m: &mut Machine<I>, dst: Dst, next: u32) -> Result<ControlFlow> {
    m.value_stub(dst, next).push(&mut m.stack)?;
    let pushed = m.undo.push(&m.mem, &m.stack);
    CallStub::pop(&mut m.stack)?;

    let status = match pushed {
        Ok(()) => 0,
        Err(err) => {
            warn!(error = %err, "saveundo failed");
            1
        }
    };
    m.store(dst, status, Width::Word)?;
    Ok(ControlFlow::Continue)
}

/// `restoreundo S0`: on success execution continues after the matching
/// `saveundo`; on failure 1 is stored here.
pub fn restore_undo<I: IoCapability>(m: &mut Machine<I>, dst: Dst) -> Result<ControlFlow> {
    let snapshot = match m.undo.pop() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(error = %err, "restoreundo failed");
            m.store(dst, 1, Width::Word)?;
            return Ok(ControlFlow::Continue);
        }
    };
    info!(remaining = m.undo.len(), "undo state restored");
    load_snapshot(m, &snapshot)
}

fn load_snapshot<I: IoCapability>(m: &mut Machine<I>, snapshot: &Snapshot) -> Result<ControlFlow> {
    let old_end = m.mem.end_mem();
    snapshot.apply(&mut m.mem, &mut m.stack, m.protect)?;
    m.invalidate_ram_code(old_end);
    m.resume_after_restore(RESTORED)
}

// =============================================================================
// Tests
// =============================================================================
