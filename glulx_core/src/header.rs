//! Glulx image header.
//!
//! ```text
//! offset  field
//!   0     magic "Glul"
//!   4     version
//!   8     RAMSTART
//!  12     EXTSTART (length of the image proper)
//!  16     ENDMEM
//!  20     stack size
//!  24     start function
//!  28     decoding table
//!  32     checksum
//! ```

use crate::error::{FatalError, Result};
use crate::PAGE_SIZE;

/// Magic tag at offset 0 of every Glulx image.
pub const GLULX_MAGIC: [u8; 4] = *b"Glul";

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: u32 = 36;

/// Offset of the checksum word inside the header.
pub const CHECKSUM_OFFSET: usize = 32;

/// Oldest accepted version (2.0.0).
pub const MIN_VERSION: u32 = 0x0002_0000;

/// Newest accepted version (3.1.x).
pub const MAX_VERSION: u32 = 0x0003_01FF;

/// Parsed and validated image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub ram_start: u32,
    pub ext_start: u32,
    pub end_mem: u32,
    pub stack_size: u32,
    pub start_func: u32,
    pub string_table: u32,
    pub checksum: u32,
}

#[inline]
fn word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl Header {
    /// Parse and validate the header at the start of `image`.
    pub fn parse(image: &[u8]) -> Result<Self> {
        if image.len() < HEADER_SIZE as usize {
            return Err(FatalError::BadHeader("image shorter than the header"));
        }
        if image[0..4] != GLULX_MAGIC {
            return Err(FatalError::BadHeader("missing Glul magic tag"));
        }

        let header = Header {
            version: word(image, 4),
            ram_start: word(image, 8),
            ext_start: word(image, 12),
            end_mem: word(image, 16),
            stack_size: word(image, 20),
            start_func: word(image, 24),
            string_table: word(image, 28),
            checksum: word(image, 32),
        };

        if !(MIN_VERSION..=MAX_VERSION).contains(&header.version) {
            return Err(FatalError::UnsupportedVersion(header.version));
        }
        header.validate_bounds()?;

        if (image.len() as u64) < header.ext_start as u64 {
            return Err(FatalError::BadHeader("image shorter than EXTSTART"));
        }

        Ok(header)
    }

    fn validate_bounds(&self) -> Result<()> {
        for bound in [self.ram_start, self.ext_start, self.end_mem] {
            if bound % PAGE_SIZE != 0 {
                return Err(FatalError::BadHeader("memory bound is not 256-byte aligned"));
            }
        }
        if self.ram_start < HEADER_SIZE {
            return Err(FatalError::BadHeader("RAMSTART overlaps the header"));
        }
        if self.ram_start > self.ext_start || self.ext_start > self.end_mem {
            return Err(FatalError::BadHeader("memory bounds out of order"));
        }
        if self.stack_size == 0 || self.stack_size % PAGE_SIZE != 0 {
            return Err(FatalError::BadHeader("stack size is not a multiple of 256"));
        }
        Ok(())
    }

    /// Compute the checksum of an image as `verify` defines it: the wrapping sum
    /// of every big-endian word up to EXTSTART with the checksum field read as 0.
    pub fn compute_checksum(image: &[u8], ext_start: u32) -> u32 {
        let len = (ext_start as usize).min(image.len()) & !3;
        image[..len]
            .chunks_exact(4)
            .enumerate()
            .filter(|(index, _)| index * 4 != CHECKSUM_OFFSET)
            .fold(0u32, |sum, (_, chunk)| {
                sum.wrapping_add(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
