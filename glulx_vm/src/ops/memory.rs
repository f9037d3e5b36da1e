//! Array stores, block operations and the heap.
//!
//! Every write here reaches memory through the machine so that compiled code
//! covering the written bytes is dropped from the cache.

use glulx_core::Result;
use glulx_jit::Width;
use tracing::trace;

use super::arithmetic::bit_address;
use crate::io::IoCapability;
use crate::machine::Machine;

/// `astore*`: `L0` base, `L1` index scaled by the width.
#[inline]
pub fn astore<I: IoCapability>(m: &mut Machine<I>, width: Width, value: u32) -> Result<()> {
    let [base, index, ..] = m.regs.l;
    let addr = base.wrapping_add(index.wrapping_mul(width.bytes()));
    m.write_mem(addr, value, width)
}

/// `astorebit L0 L1 L2`: set or clear one bit; the bit number is signed.
pub fn astorebit<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let [base, bit, value, ..] = m.regs.l;
    let (addr, bit) = bit_address(base, bit);
    let byte = m.mem.read8(addr)?;
    let byte = if value != 0 {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    };
    m.write_mem(addr, u32::from(byte), Width::Byte)
}

/// `mzero L0 L1`: clear `L0` bytes at `L1`.
pub fn mzero<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let [len, addr, ..] = m.regs.l;
    if len == 0 {
        return Ok(());
    }
    m.mem.zero_fill(addr, len)?;
    m.cache.note_write(addr, len);
    Ok(())
}

/// `mcopy L0 L1 L2`: copy `L0` bytes from `L1` to `L2`; overlap is allowed.
pub fn mcopy<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let [len, src, dst, ..] = m.regs.l;
    if len == 0 {
        return Ok(());
    }
    m.mem.copy_within(src, dst, len)?;
    m.cache.note_write(dst, len);
    Ok(())
}

/// `malloc L0`: address of a new block, or 0.
pub fn malloc<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let len = m.regs.l[0];
    let addr = m.mem.malloc(len)?;
    trace!(len, addr = format_args!("{:#x}", addr), "malloc");
    m.regs.s[0] = addr;
    Ok(())
}

/// `mfree L0`.
pub fn mfree<I: IoCapability>(m: &mut Machine<I>) -> Result<()> {
    let addr = m.regs.l[0];
    let old_end = m.mem.end_mem();
    trace!(addr = format_args!("{:#x}", addr), "mfree");
    m.mem.mfree(addr)?;
    // Freeing the last block shrinks memory back to the heap start.
    let new_end = m.mem.end_mem();
    if new_end < old_end {
        m.cache.prune(new_end, old_end - new_end);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
