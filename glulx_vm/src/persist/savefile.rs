//! The save file format: an IFF `FORM` of type `IFZS`.
//!
//! | chunk  | contents                                                        |
//! |--------|-----------------------------------------------------------------|
//! | `IFhd` | the first 128 bytes of the original image                      |
//! | `CMem` | memory size (4 bytes), then RAM XORed with the original image, run-length coded |
//! | `Stks` | stack words, big-endian                                         |
//! | `MAll` | heap start, block count, then `(addr, len)` pairs; only when the heap is active |
//!
//! In `CMem`, a nonzero byte stands for itself; a zero byte is followed by a
//! count `n` and stands for `n + 1` zero bytes. Trailing zeros are omitted.

use glulx_core::iff::{Form, FormWriter};
use glulx_core::{FatalError, HeapAllocator, HeapSummary, MemorySpace, PersistenceError};

use super::Snapshot;

/// Bytes of the image that identify the game.
pub const IDENTITY_LEN: usize = 128;

const FORM_TYPE: [u8; 4] = *b"IFZS";

/// Encode `snapshot` as a save file for the game loaded in `mem`.
pub fn write(mem: &MemorySpace, snapshot: &Snapshot) -> Vec<u8> {
    let mut form = FormWriter::new(FORM_TYPE);
    form.chunk(*b"IFhd", &mem.original()[..IDENTITY_LEN]);
    form.chunk(*b"CMem", &encode_memory(mem, snapshot));

    let stack: Vec<u8> = snapshot
        .stack
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .collect();
    form.chunk(*b"Stks", &stack);

    if !snapshot.heap.is_empty() {
        let heap = &snapshot.heap;
        let mut chunk = Vec::with_capacity(8 + heap.blocks.len() * 8);
        chunk.extend_from_slice(&heap.start.to_be_bytes());
        chunk.extend_from_slice(&(heap.blocks.len() as u32).to_be_bytes());
        for &(addr, len) in &heap.blocks {
            chunk.extend_from_slice(&addr.to_be_bytes());
            chunk.extend_from_slice(&len.to_be_bytes());
        }
        form.chunk(*b"MAll", &chunk);
    }

    form.finish()
}

/// Decode and validate a save file without touching the machine.
///
/// `stack_limit` is the stack capacity in bytes and `memory_limit` the
/// largest memory size accepted. A snapshot returned from here always
/// applies cleanly.
pub fn read(
    bytes: &[u8],
    mem: &MemorySpace,
    stack_limit: u32,
    memory_limit: u32,
) -> Result<Snapshot, PersistenceError> {
    let form = Form::parse(bytes)?;
    if form.form_type != FORM_TYPE {
        return Err(PersistenceError::BadContainer("not an IFZS save file"));
    }

    let identity = form.require("IFhd")?;
    if identity.data != &mem.original()[..IDENTITY_LEN] {
        return Err(PersistenceError::IdentityMismatch);
    }

    let cmem = form.require("CMem")?;
    let (end_mem, ram) = decode_memory(mem, cmem.data, memory_limit)?;

    let stks = form.require("Stks")?;
    if stks.data.len() % 4 != 0 {
        return Err(PersistenceError::BadContainer("stack chunk is not word aligned"));
    }
    if stks.data.len() > stack_limit as usize {
        return Err(PersistenceError::StackTooLarge);
    }
    let stack = stks
        .data
        .chunks_exact(4)
        .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect();

    let heap = match form.find(b"MAll") {
        Some(chunk) => decode_heap(chunk.data)?,
        None => HeapSummary::default(),
    };
    check_heap(mem, &heap, end_mem)?;

    Ok(Snapshot {
        end_mem,
        ram,
        stack,
        heap,
    })
}

// =============================================================================
// Memory delta
// =============================================================================

fn encode_memory(mem: &MemorySpace, snapshot: &Snapshot) -> Vec<u8> {
    let ram_start = mem.ram_start();
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&snapshot.end_mem.to_be_bytes());

    let mut run = 0usize;
    for (offset, &byte) in snapshot.ram.iter().enumerate() {
        let delta = byte ^ mem.original_byte(ram_start + offset as u32);
        if delta == 0 {
            run += 1;
            continue;
        }
        flush_run(&mut out, run);
        run = 0;
        out.push(delta);
    }
    out
}

fn flush_run(out: &mut Vec<u8>, mut run: usize) {
    while run > 0 {
        let chunk = run.min(256);
        out.push(0);
        out.push((chunk - 1) as u8);
        run -= chunk;
    }
}

fn decode_memory(
    mem: &MemorySpace,
    data: &[u8],
    memory_limit: u32,
) -> Result<(u32, Vec<u8>), PersistenceError> {
    if data.len() < 4 {
        return Err(PersistenceError::CorruptDelta);
    }
    let end_mem = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let ram_start = mem.ram_start();
    if end_mem < mem.orig_end_mem() || end_mem % glulx_core::PAGE_SIZE != 0 {
        return Err(PersistenceError::CorruptDelta);
    }
    if end_mem > memory_limit.max(mem.orig_end_mem()) {
        return Err(PersistenceError::MemoryTooLarge(end_mem));
    }

    let len = (end_mem - ram_start) as usize;
    let mut ram: Vec<u8> = (ram_start..end_mem).map(|addr| mem.original_byte(addr)).collect();

    let mut pos = 0usize;
    let mut input = data[4..].iter();
    while let Some(&byte) = input.next() {
        if byte == 0 {
            let count = *input.next().ok_or(PersistenceError::CorruptDelta)? as usize + 1;
            pos += count;
            if pos > len {
                return Err(PersistenceError::CorruptDelta);
            }
        } else {
            let slot = ram.get_mut(pos).ok_or(PersistenceError::CorruptDelta)?;
            *slot ^= byte;
            pos += 1;
        }
    }
    Ok((end_mem, ram))
}

fn decode_heap(data: &[u8]) -> Result<HeapSummary, PersistenceError> {
    let corrupt = PersistenceError::BadContainer("heap chunk is malformed");
    if data.len() < 8 || data.len() % 8 != 0 {
        return Err(corrupt);
    }
    let word = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let count = word(4) as usize;
    if data.len() != 8 + count * 8 {
        return Err(corrupt);
    }
    Ok(HeapSummary {
        start: word(0),
        blocks: (0..count).map(|i| (word(8 + i * 8), word(12 + i * 8))).collect(),
    })
}

/// The heap must start at or above the image's memory size and its blocks
/// must fit inside the restored memory without overlapping.
fn check_heap(mem: &MemorySpace, heap: &HeapSummary, end_mem: u32) -> Result<(), PersistenceError> {
    if heap.is_empty() {
        return Ok(());
    }
    if heap.start < mem.orig_end_mem() || heap.start > end_mem {
        return Err(PersistenceError::CorruptHeap("heap starts outside memory"));
    }
    match HeapAllocator::from_summary(heap, end_mem) {
        Ok(_) => Ok(()),
        Err(FatalError::HeapCorrupt(reason)) => Err(PersistenceError::CorruptHeap(reason)),
        Err(other) => Err(PersistenceError::Fatal(other)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Stack;
    use glulx_core::asm::ImageBuilder;
    use glulx_core::ProtectRange;

    const LIMIT: u32 = 1 << 20;

    fn memory() -> MemorySpace {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(0);
        asm.op(0x31, &[]);
        asm.ram_data(&[5; 600]);
        MemorySpace::new(&asm.build(main).bytes).unwrap()
    }

    fn snapshot(mem: &MemorySpace) -> Snapshot {
        Snapshot {
            end_mem: mem.end_mem(),
            ram: mem.ram().to_vec(),
            stack: vec![0x10, 0x0C, 0x0000_0400, 7, 0xDEAD_BEEF],
            heap: mem.heap_summary(),
        }
    }

    #[test]
    fn test_round_trip_with_changes_and_heap() {
        let mut mem = memory();
        let ram_start = mem.ram_start();
        mem.write8(ram_start + 1, 0).unwrap();
        mem.write32(ram_start + 500, 0x0102_0304).unwrap();
        let block = mem.malloc(40).unwrap();
        mem.write32(block, 99).unwrap();

        let saved = snapshot(&mem);
        let bytes = write(&mem, &saved);
        let loaded = read(&bytes, &mem, 4096, LIMIT).unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.heap.blocks, vec![(block, 40)]);
    }

    #[test]
    fn test_unchanged_memory_encodes_to_size_only() {
        let mem = memory();
        let bytes = write(&mem, &snapshot(&mem));
        let form = Form::parse(&bytes).unwrap();
        assert_eq!(form.require("CMem").unwrap().data.len(), 4);
        assert!(form.find(b"MAll").is_none());
    }

    #[test]
    fn test_long_zero_runs_split() {
        let mut out = Vec::new();
        flush_run(&mut out, 600);
        assert_eq!(out, vec![0, 255, 0, 255, 0, 87]);
    }

    #[test]
    fn test_foreign_save_is_rejected() {
        let mem = memory();
        let mut bytes = write(&mem, &snapshot(&mem));
        // IFhd payload starts after FORM header (12) and chunk header (8).
        bytes[20 + 36] ^= 0xFF;
        assert_eq!(read(&bytes, &mem, 4096, LIMIT), Err(PersistenceError::IdentityMismatch));
    }

    #[test]
    fn test_missing_chunks_and_corrupt_delta() {
        let mem = memory();
        let mut form = FormWriter::new(FORM_TYPE);
        form.chunk(*b"IFhd", &mem.original()[..IDENTITY_LEN]);
        let bytes = form.finish();
        assert_eq!(read(&bytes, &mem, 4096, LIMIT), Err(PersistenceError::MissingChunk("CMem")));

        let mut form = FormWriter::new(FORM_TYPE);
        form.chunk(*b"IFhd", &mem.original()[..IDENTITY_LEN]);
        let mut cmem = mem.end_mem().to_be_bytes().to_vec();
        cmem.push(0);
        form.chunk(*b"CMem", &cmem);
        form.chunk(*b"Stks", &[]);
        assert_eq!(read(&form.finish(), &mem, 4096, LIMIT), Err(PersistenceError::CorruptDelta));
    }

    #[test]
    fn test_oversized_stack_is_rejected() {
        let mem = memory();
        let bytes = write(&mem, &snapshot(&mem));
        assert_eq!(read(&bytes, &mem, 8, LIMIT), Err(PersistenceError::StackTooLarge));
    }

    #[test]
    fn test_memory_size_over_limit_is_refused() {
        let mem = memory();
        let mut form = FormWriter::new(FORM_TYPE);
        form.chunk(*b"IFhd", &mem.original()[..IDENTITY_LEN]);
        let mut cmem = 0x1000_0000u32.to_be_bytes().to_vec();
        cmem.push(1);
        form.chunk(*b"CMem", &cmem);
        form.chunk(*b"Stks", &[]);
        assert_eq!(
            read(&form.finish(), &mem, 4096, LIMIT),
            Err(PersistenceError::MemoryTooLarge(0x1000_0000))
        );
    }

    #[test]
    fn test_overlapping_heap_is_refused_and_leaves_memory_alone() {
        let mut mem = memory();
        let ram_start = mem.ram_start();
        let start = mem.malloc(64).unwrap();
        let end_mem = mem.end_mem();

        let mut saved = snapshot(&mem);
        saved.ram[0] = 0x99;
        saved.heap = HeapSummary {
            start,
            blocks: vec![(start, 32), (start + 16, 32)],
        };
        let bytes = write(&mem, &saved);
        assert!(matches!(
            read(&bytes, &mem, 4096, LIMIT),
            Err(PersistenceError::CorruptHeap(_))
        ));

        let mut stack = Stack::new(4096);
        assert!(matches!(
            saved.apply(&mut mem, &mut stack, ProtectRange::NONE),
            Err(FatalError::HeapCorrupt(_))
        ));
        assert_eq!(mem.read8(ram_start).unwrap(), 5);
        assert_eq!(mem.end_mem(), end_mem);
        assert_eq!(mem.heap_summary().blocks, vec![(start, 64)]);
    }

    #[test]
    fn test_heap_below_image_memory_is_refused() {
        let mem = memory();
        let mut saved = snapshot(&mem);
        saved.heap = HeapSummary {
            start: mem.ram_start(),
            blocks: vec![(mem.ram_start(), 16)],
        };
        let bytes = write(&mem, &saved);
        assert!(matches!(
            read(&bytes, &mem, 4096, LIMIT),
            Err(PersistenceError::CorruptHeap(_))
        ));
    }
}
