//! Heap allocator for `malloc` / `mfree`.
//!
//! The heap lives above the memory size the program had when the first block
//! was allocated. It is a sorted list of blocks covering `[start, end_mem)`
//! exactly; allocation is first-fit and adjacent free blocks are coalesced.
//! When the last used block is freed the heap deactivates and memory shrinks
//! back to `start`.
//!
//! This module only does bookkeeping: it tells [`MemorySpace`](crate::MemorySpace)
//! how large memory must become, and the memory space performs the resize.

use crate::error::{FatalError, Result};
use crate::page_align;

/// One contiguous heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    addr: u32,
    len: u32,
    used: bool,
}

/// The part of heap state that undo records and save files persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapSummary {
    /// Heap start address, or 0 when the heap is inactive.
    pub start: u32,
    /// Allocated blocks as `(addr, len)`, sorted by address.
    pub blocks: Vec<(u32, u32)>,
}

impl HeapSummary {
    /// True when the summary describes an inactive heap.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == 0
    }
}

/// Outcome of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: u32,
    /// New memory size the caller must resize to, when the heap had to grow.
    pub grow_to: Option<u32>,
}

/// First-fit heap allocator.
#[derive(Debug, Clone, Default)]
pub struct HeapAllocator {
    start: u32,
    blocks: Vec<Block>,
}

impl HeapAllocator {
    /// Create an inactive heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while at least one block is allocated.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.start != 0
    }

    /// Heap start address (0 when inactive).
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of allocated blocks.
    pub fn used_blocks(&self) -> usize {
        self.blocks.iter().filter(|block| block.used).count()
    }

    /// Reserve `len` bytes. `end_mem` is the current memory size.
    ///
    /// Returns `None` when the request cannot be satisfied.
    pub fn alloc(&mut self, len: u32, end_mem: u32) -> Option<Allocation> {
        if len == 0 || len > 0x7FFF_FFFF {
            return None;
        }
        if !self.is_active() {
            self.start = end_mem;
            self.blocks.clear();
        }

        if let Some(index) = self.blocks.iter().position(|b| !b.used && b.len >= len) {
            let addr = self.take(index, len);
            return Some(Allocation { addr, grow_to: None });
        }

        // Grow memory, extending a trailing free block if there is one.
        let tail_free = match self.blocks.last() {
            Some(block) if !block.used => block.len,
            _ => 0,
        };
        let needed = (len - tail_free) as u64;
        let new_end = end_mem as u64 + needed;
        if new_end > u32::MAX as u64 - 0xFF {
            if self.blocks.is_empty() {
                self.start = 0;
            }
            return None;
        }
        let new_end = page_align(new_end as u32);
        let extra = new_end - end_mem;
        match self.blocks.last_mut() {
            Some(block) if !block.used => block.len += extra,
            _ => self.blocks.push(Block {
                addr: end_mem,
                len: extra,
                used: false,
            }),
        }
        let index = self.blocks.len() - 1;
        let addr = self.take(index, len);
        Some(Allocation {
            addr,
            grow_to: Some(new_end),
        })
    }

    fn take(&mut self, index: usize, len: u32) -> u32 {
        let block = self.blocks[index];
        if block.len > len {
            self.blocks.insert(
                index + 1,
                Block {
                    addr: block.addr + len,
                    len: block.len - len,
                    used: false,
                },
            );
        }
        self.blocks[index] = Block {
            addr: block.addr,
            len,
            used: true,
        };
        block.addr
    }

    /// Release the block at `addr`.
    ///
    /// Returns `Some(start)` when this was the last block: the heap is now
    /// inactive and memory should shrink back to `start`.
    pub fn free(&mut self, addr: u32) -> Result<Option<u32>> {
        let index = self
            .blocks
            .iter()
            .position(|block| block.used && block.addr == addr)
            .ok_or(FatalError::HeapCorrupt("mfree of an address that was not allocated"))?;
        self.blocks[index].used = false;

        if index + 1 < self.blocks.len() && !self.blocks[index + 1].used {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].len += next.len;
        }
        if index > 0 && !self.blocks[index - 1].used {
            let cur = self.blocks.remove(index);
            self.blocks[index - 1].len += cur.len;
        }

        if self.blocks.iter().all(|block| !block.used) {
            let start = self.start;
            self.clear();
            return Ok(Some(start));
        }
        Ok(None)
    }

    /// Deactivate the heap, forgetting every block.
    pub fn clear(&mut self) {
        self.start = 0;
        self.blocks.clear();
    }

    /// Snapshot for persistence.
    pub fn summary(&self) -> HeapSummary {
        HeapSummary {
            start: self.start,
            blocks: self
                .blocks
                .iter()
                .filter(|block| block.used)
                .map(|block| (block.addr, block.len))
                .collect(),
        }
    }

    /// Rebuild from a snapshot; `end_mem` is the restored memory size.
    pub fn from_summary(summary: &HeapSummary, end_mem: u32) -> Result<Self> {
        if summary.is_empty() || summary.blocks.is_empty() {
            return Ok(Self::new());
        }

        let mut used: Vec<(u32, u32)> = summary.blocks.clone();
        used.sort_unstable();

        let mut blocks = Vec::with_capacity(used.len() * 2 + 1);
        let mut cursor = summary.start;
        for (addr, len) in used {
            let end = addr
                .checked_add(len)
                .ok_or(FatalError::HeapCorrupt("heap block wraps the address space"))?;
            if addr < cursor || end > end_mem || len == 0 {
                return Err(FatalError::HeapCorrupt("heap blocks overlap or exceed memory"));
            }
            if addr > cursor {
                blocks.push(Block {
                    addr: cursor,
                    len: addr - cursor,
                    used: false,
                });
            }
            blocks.push(Block { addr, len, used: true });
            cursor = end;
        }
        if cursor < end_mem {
            blocks.push(Block {
                addr: cursor,
                len: end_mem - cursor,
                used: false,
            });
        }

        Ok(HeapAllocator {
            start: summary.start,
            blocks,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_alloc_activates_and_grows() {
        let mut heap = HeapAllocator::new();
        let a = heap.alloc(10, 0x1000).unwrap();
        assert_eq!(a.addr, 0x1000);
        assert_eq!(a.grow_to, Some(0x1100));
        assert!(heap.is_active());
        assert_eq!(heap.start(), 0x1000);
    }

    #[test]
    fn test_second_alloc_uses_free_tail() {
        let mut heap = HeapAllocator::new();
        heap.alloc(10, 0x1000).unwrap();
        let b = heap.alloc(20, 0x1100).unwrap();
        assert_eq!(b.addr, 0x100A);
        assert_eq!(b.grow_to, None);
    }

    #[test]
    fn test_free_coalesces_and_deactivates() {
        let mut heap = HeapAllocator::new();
        let a = heap.alloc(10, 0x1000).unwrap().addr;
        let b = heap.alloc(10, 0x1100).unwrap().addr;
        assert_eq!(heap.free(a).unwrap(), None);
        assert_eq!(heap.used_blocks(), 1);
        assert_eq!(heap.free(b).unwrap(), Some(0x1000));
        assert!(!heap.is_active());
    }

    #[test]
    fn test_freed_space_is_reused() {
        let mut heap = HeapAllocator::new();
        let a = heap.alloc(16, 0x1000).unwrap().addr;
        let _b = heap.alloc(16, 0x1100).unwrap().addr;
        heap.free(a).unwrap();
        let c = heap.alloc(8, 0x1100).unwrap();
        assert_eq!(c.addr, a);
        assert_eq!(c.grow_to, None);
    }

    #[test]
    fn test_free_unknown_address_is_fatal() {
        let mut heap = HeapAllocator::new();
        heap.alloc(16, 0x1000).unwrap();
        assert!(matches!(heap.free(0x2000), Err(FatalError::HeapCorrupt(_))));
    }

    #[test]
    fn test_zero_length_alloc_fails() {
        let mut heap = HeapAllocator::new();
        assert!(heap.alloc(0, 0x1000).is_none());
        assert!(!heap.is_active());
    }

    #[test]
    fn test_summary_round_trip() {
        let mut heap = HeapAllocator::new();
        let a = heap.alloc(16, 0x1000).unwrap().addr;
        heap.alloc(32, 0x1100).unwrap();
        heap.free(a).unwrap();

        let summary = heap.summary();
        assert_eq!(summary.start, 0x1000);
        assert_eq!(summary.blocks, vec![(0x1010, 32)]);

        let mut rebuilt = HeapAllocator::from_summary(&summary, 0x1100).unwrap();
        assert_eq!(rebuilt.summary(), summary);
        // The gap before the surviving block is allocatable again.
        assert_eq!(rebuilt.alloc(16, 0x1100).unwrap().addr, 0x1000);
    }

    #[test]
    fn test_from_summary_rejects_overlap() {
        let summary = HeapSummary {
            start: 0x1000,
            blocks: vec![(0x1000, 32), (0x1010, 32)],
        };
        assert!(HeapAllocator::from_summary(&summary, 0x1100).is_err());
    }
}
