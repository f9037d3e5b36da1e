//! VM memory image.
//!
//! Layout, all bounds multiples of 256:
//!
//! ```text
//! 0 ........ RAMSTART ........ EXTSTART ........ ENDMEM
//! |   ROM    |        RAM (from image)  |  RAM (zeroed) |
//! ```
//!
//! Reads are allowed anywhere below ENDMEM; writes only in `[RAMSTART, ENDMEM)`.
//! ENDMEM may grow through `setmemsize` or the heap, but never drops below
//! the size the image declared at load time.

use tracing::debug;

use crate::error::{FatalError, Result};
use crate::header::Header;
use crate::heap::{HeapAllocator, HeapSummary};
use crate::PAGE_SIZE;

/// Byte range excluded from restart, restore and undo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectRange {
    pub start: u32,
    pub len: u32,
}

impl ProtectRange {
    /// No protection.
    pub const NONE: ProtectRange = ProtectRange { start: 0, len: 0 };

    #[inline]
    pub fn new(start: u32, len: u32) -> Self {
        ProtectRange { start, len }
    }

    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && (addr - self.start) < self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bounds-checked memory with the read-only/writable split of a Glulx image.
#[derive(Debug, Clone)]
pub struct MemorySpace {
    header: Header,
    /// Image bytes below EXTSTART, as loaded.
    original: Box<[u8]>,
    bytes: Vec<u8>,
    heap: HeapAllocator,
}

impl MemorySpace {
    /// Validate the header and build memory from `image`.
    pub fn new(image: &[u8]) -> Result<Self> {
        let header = Header::parse(image)?;
        let ext = header.ext_start as usize;
        let original: Box<[u8]> = image[..ext].into();

        let mut bytes = vec![0u8; header.end_mem as usize];
        bytes[..ext].copy_from_slice(&original);

        debug!(
            version = format_args!("{:#x}", header.version),
            ram_start = header.ram_start,
            end_mem = header.end_mem,
            "memory image loaded"
        );

        Ok(MemorySpace {
            header,
            original,
            bytes,
            heap: HeapAllocator::new(),
        })
    }

    // =========================================================================
    // Bounds
    // =========================================================================

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn ram_start(&self) -> u32 {
        self.header.ram_start
    }

    #[inline]
    pub fn ext_start(&self) -> u32 {
        self.header.ext_start
    }

    /// Current memory size.
    #[inline]
    pub fn end_mem(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Memory size declared by the image.
    #[inline]
    pub fn orig_end_mem(&self) -> u32 {
        self.header.end_mem
    }

    /// Whole memory, read-only view.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Image bytes below EXTSTART as they were loaded.
    #[inline]
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Byte at `addr` in the pristine image (zero beyond EXTSTART).
    #[inline]
    pub fn original_byte(&self, addr: u32) -> u8 {
        self.original.get(addr as usize).copied().unwrap_or(0)
    }

    /// The writable region `[RAMSTART, ENDMEM)`.
    #[inline]
    pub fn ram(&self) -> &[u8] {
        &self.bytes[self.header.ram_start as usize..]
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[inline]
    fn check_read(&self, addr: u32, len: u32) -> Result<usize> {
        let end = addr as u64 + len as u64;
        if end > self.bytes.len() as u64 {
            return Err(FatalError::oob(addr));
        }
        Ok(addr as usize)
    }

    /// Borrow `len` bytes starting at `addr`.
    pub fn slice(&self, addr: u32, len: u32) -> Result<&[u8]> {
        let start = self.check_read(addr, len)?;
        Ok(&self.bytes[start..start + len as usize])
    }

    #[inline]
    pub fn read8(&self, addr: u32) -> Result<u8> {
        let at = self.check_read(addr, 1)?;
        Ok(self.bytes[at])
    }

    #[inline]
    pub fn read16(&self, addr: u32) -> Result<u16> {
        let at = self.check_read(addr, 2)?;
        Ok(u16::from_be_bytes([self.bytes[at], self.bytes[at + 1]]))
    }

    #[inline]
    pub fn read32(&self, addr: u32) -> Result<u32> {
        let at = self.check_read(addr, 4)?;
        Ok(u32::from_be_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[inline]
    fn check_write(&self, addr: u32, len: u32) -> Result<usize> {
        let end = addr as u64 + len as u64;
        if addr < self.header.ram_start || end > self.bytes.len() as u64 {
            return Err(FatalError::WriteProtectViolation { addr });
        }
        Ok(addr as usize)
    }

    #[inline]
    pub fn write8(&mut self, addr: u32, value: u8) -> Result<()> {
        let at = self.check_write(addr, 1)?;
        self.bytes[at] = value;
        Ok(())
    }

    #[inline]
    pub fn write16(&mut self, addr: u32, value: u16) -> Result<()> {
        let at = self.check_write(addr, 2)?;
        self.bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    #[inline]
    pub fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        let at = self.check_write(addr, 4)?;
        self.bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Zero `len` bytes at `addr` (`mzero`).
    pub fn zero_fill(&mut self, addr: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let at = self.check_write(addr, len)?;
        self.bytes[at..at + len as usize].fill(0);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`; the ranges may overlap (`mcopy`).
    pub fn copy_within(&mut self, src: u32, dst: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let from = self.check_read(src, len)?;
        let to = self.check_write(dst, len)?;
        self.bytes.copy_within(from..from + len as usize, to);
        Ok(())
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    /// Change the memory size (`setmemsize`).
    ///
    /// The new size must be page aligned and not below the size declared by
    /// the image. Growth zero-fills.
    pub fn resize(&mut self, new_end: u32) -> Result<()> {
        if self.heap.is_active() {
            return Err(FatalError::ResizeWhileHeapActive);
        }
        self.resize_unchecked(new_end)
    }

    fn resize_unchecked(&mut self, new_end: u32) -> Result<()> {
        if new_end % PAGE_SIZE != 0 || new_end < self.header.end_mem {
            return Err(FatalError::InvalidResize(new_end));
        }
        if new_end as usize != self.bytes.len() {
            debug!(from = self.end_mem(), to = new_end, "memory resized");
            self.bytes.resize(new_end as usize, 0);
        }
        Ok(())
    }

    // =========================================================================
    // Heap
    // =========================================================================

    #[inline]
    pub fn heap(&self) -> &HeapAllocator {
        &self.heap
    }

    /// Allocate a heap block; returns 0 when the request cannot be met.
    pub fn malloc(&mut self, len: u32) -> Result<u32> {
        let end_mem = self.end_mem();
        let Some(allocation) = self.heap.alloc(len, end_mem) else {
            return Ok(0);
        };
        if let Some(new_end) = allocation.grow_to {
            self.resize_unchecked(new_end)?;
        }
        Ok(allocation.addr)
    }

    /// Free a heap block, shrinking memory when the heap empties.
    pub fn mfree(&mut self, addr: u32) -> Result<()> {
        if let Some(start) = self.heap.free(addr)? {
            self.resize_unchecked(start)?;
        }
        Ok(())
    }

    pub fn heap_summary(&self) -> HeapSummary {
        self.heap.summary()
    }

    // =========================================================================
    // Wholesale state changes
    // =========================================================================

    /// Restore RAM to its loaded contents (`restart`), keeping `protect`.
    pub fn reset(&mut self, protect: ProtectRange) -> Result<()> {
        self.heap.clear();
        self.resize_unchecked(self.header.end_mem)?;
        let ram_start = self.header.ram_start;
        for addr in ram_start..self.header.end_mem {
            if !protect.contains(addr) {
                self.bytes[addr as usize] = self.original_byte(addr);
            }
        }
        Ok(())
    }

    /// Replace RAM with `ram` (which covers `[RAMSTART, new_end)`) and the
    /// heap with `heap`, keeping `protect`. Used by restore and undo.
    ///
    /// Every check runs before anything changes, so an error leaves memory
    /// as it was.
    pub fn load_ram(
        &mut self,
        new_end: u32,
        ram: &[u8],
        heap: HeapAllocator,
        protect: ProtectRange,
    ) -> Result<()> {
        let ram_start = self.header.ram_start;
        if new_end % PAGE_SIZE != 0
            || new_end < self.header.end_mem
            || ram.len() != (new_end - ram_start) as usize
        {
            return Err(FatalError::InvalidResize(new_end));
        }
        self.resize_unchecked(new_end)?;
        self.heap = heap;
        if protect.is_empty() {
            self.bytes[ram_start as usize..].copy_from_slice(ram);
            return Ok(());
        }
        for (offset, &byte) in ram.iter().enumerate() {
            let addr = ram_start + offset as u32;
            if !protect.contains(addr) {
                self.bytes[addr as usize] = byte;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
