//! `linearsearch`, `binarysearch` and `linkedsearch`.
//!
//! Keys are compared as big-endian byte strings. With `KEY_INDIRECT` the key
//! operand is the address of the key; otherwise the key is the low
//! `key_size` bytes of the operand itself, which limits direct keys to 1, 2
//! or 4 bytes.

use glulx_core::{FatalError, MemorySpace, Result};
use smallvec::SmallVec;
use std::cmp::Ordering;

/// Search option flags.
pub mod options {
    pub const KEY_INDIRECT: u32 = 0x01;
    pub const ZERO_KEY_TERMINATES: u32 = 0x02;
    pub const RETURN_INDEX: u32 = 0x04;
}

use options::*;

type Key = SmallVec<[u8; 16]>;

fn fetch_key(mem: &MemorySpace, key: u32, key_size: u32, opts: u32) -> Result<Key> {
    if opts & KEY_INDIRECT != 0 {
        return Ok(Key::from_slice(mem.slice(key, key_size)?));
    }
    match key_size {
        1 | 2 | 4 => Ok(Key::from_slice(&key.to_be_bytes()[4 - key_size as usize..])),
        _ => Err(FatalError::UnsupportedFeature("direct search key wider than 4 bytes")),
    }
}

#[inline]
fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

/// Parameters shared by the array searches.
#[derive(Debug, Clone, Copy)]
pub struct ArraySearch {
    pub key: u32,
    pub key_size: u32,
    pub start: u32,
    pub struct_size: u32,
    pub num_structs: u32,
    pub key_offset: u32,
    pub options: u32,
}

impl ArraySearch {
    /// Build from the seven loaded operands.
    pub fn from_regs(regs: &[u32]) -> Self {
        ArraySearch {
            key: regs[0],
            key_size: regs[1],
            start: regs[2],
            struct_size: regs[3],
            num_structs: regs[4],
            key_offset: regs[5],
            options: regs[6],
        }
    }

    #[inline]
    fn found(&self, index: u32, addr: u32) -> u32 {
        if self.options & RETURN_INDEX != 0 {
            index
        } else {
            addr
        }
    }

    #[inline]
    fn not_found(&self) -> u32 {
        if self.options & RETURN_INDEX != 0 {
            u32::MAX
        } else {
            0
        }
    }
}

/// `linearsearch`. A struct count of -1 means unbounded.
pub fn linear(mem: &MemorySpace, search: &ArraySearch) -> Result<u32> {
    let key = fetch_key(mem, search.key, search.key_size, search.options)?;
    let zero_stops = search.options & ZERO_KEY_TERMINATES != 0;

    let mut index = 0u32;
    while search.num_structs == u32::MAX || index < search.num_structs {
        let addr = search
            .start
            .wrapping_add(index.wrapping_mul(search.struct_size));
        let candidate = mem.slice(addr.wrapping_add(search.key_offset), search.key_size)?;
        if candidate == key.as_slice() {
            return Ok(search.found(index, addr));
        }
        if zero_stops && is_zero(candidate) {
            break;
        }
        index += 1;
    }
    Ok(search.not_found())
}

/// `binarysearch` over structs sorted by key.
pub fn binary(mem: &MemorySpace, search: &ArraySearch) -> Result<u32> {
    let key = fetch_key(mem, search.key, search.key_size, search.options)?;

    let (mut low, mut high) = (0u32, search.num_structs);
    while low < high {
        let mid = low + (high - low) / 2;
        let addr = search.start.wrapping_add(mid.wrapping_mul(search.struct_size));
        let candidate = mem.slice(addr.wrapping_add(search.key_offset), search.key_size)?;
        match candidate.cmp(key.as_slice()) {
            Ordering::Equal => return Ok(search.found(mid, addr)),
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
        }
    }
    Ok(search.not_found())
}

/// `linkedsearch`: follow `next_offset` links from `start` until 0.
pub fn linked(mem: &MemorySpace, regs: &[u32]) -> Result<u32> {
    let (key, key_size, start, key_offset, next_offset, opts) =
        (regs[0], regs[1], regs[2], regs[3], regs[4], regs[5]);
    let key = fetch_key(mem, key, key_size, opts)?;
    let zero_stops = opts & ZERO_KEY_TERMINATES != 0;

    let mut addr = start;
    while addr != 0 {
        let candidate = mem.slice(addr.wrapping_add(key_offset), key_size)?;
        if candidate == key.as_slice() {
            return Ok(addr);
        }
        if zero_stops && is_zero(candidate) {
            break;
        }
        addr = mem.read32(addr.wrapping_add(next_offset))?;
    }
    Ok(0)
}

// =============================================================================
// Tests
// =============================================================================
