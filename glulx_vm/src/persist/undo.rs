//! The undo chain.
//!
//! Each record stores RAM as a list of 256-byte pages. A page equal to the
//! same page of the previous record (or of the original image, for the first
//! record) is shared through an `Rc` instead of copied, so a record costs
//! roughly the pages the program touched since the last `saveundo` plus a
//! copy of the stack.
//!
//! Memory only grows between records except when the heap empties. Pages
//! are compared up to the smaller of the two sizes; pages past the previous
//! record's end are always copied.

use std::collections::VecDeque;
use std::rc::Rc;

use glulx_core::{HeapSummary, MemorySpace, PersistenceError, PAGE_SIZE};
use tracing::debug;

use super::Snapshot;
use crate::frame::Stack;

type Page = Rc<[u8]>;

/// Bookkeeping bytes charged per record on top of its data.
const RECORD_OVERHEAD: usize = 64;

#[derive(Debug, Clone)]
struct UndoRecord {
    end_mem: u32,
    pages: Vec<Page>,
    stack: Vec<u32>,
    heap: HeapSummary,
    /// Estimated bytes this record added when it was taken.
    size: usize,
}

/// Chronological undo records, newest at the back.
#[derive(Debug, Clone)]
pub struct UndoChain {
    records: VecDeque<UndoRecord>,
    /// Pages of the original image's RAM, built on first use.
    baseline: Vec<Page>,
    budget: usize,
    max_records: usize,
    total: usize,
}

impl UndoChain {
    pub fn new(budget: usize, max_records: usize) -> Self {
        UndoChain {
            records: VecDeque::new(),
            baseline: Vec::new(),
            budget,
            max_records,
            total: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Estimated size of all records.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Record the current state, evicting the oldest records to stay within
    /// budget.
    pub fn push(&mut self, mem: &MemorySpace, stack: &Stack) -> Result<(), PersistenceError> {
        if self.max_records == 0 {
            return Err(PersistenceError::UndoTooLarge);
        }
        if self.records.is_empty() && self.baseline.is_empty() {
            self.baseline = original_pages(mem);
        }

        let previous = match self.records.back() {
            Some(record) => record.pages.as_slice(),
            None => self.baseline.as_slice(),
        };

        let mut copied = 0usize;
        let pages: Vec<Page> = mem
            .ram()
            .chunks(PAGE_SIZE as usize)
            .enumerate()
            .map(|(index, page)| match previous.get(index) {
                Some(prev) if prev.as_ref() == page => Rc::clone(prev),
                _ => {
                    copied += 1;
                    Rc::from(page)
                }
            })
            .collect();

        let size = record_size(copied, pages.len(), stack.len());
        if size > self.budget {
            return Err(PersistenceError::UndoTooLarge);
        }

        self.records.push_back(UndoRecord {
            end_mem: mem.end_mem(),
            pages,
            stack: stack.words().to_vec(),
            heap: mem.heap_summary(),
            size,
        });
        self.total += size;
        debug!(
            records = self.records.len(),
            copied_pages = copied,
            size,
            total = self.total,
            "undo state saved"
        );

        self.evict();
        Ok(())
    }

    fn evict(&mut self) {
        while self.records.len() > self.max_records
            || (self.total > self.budget && self.records.len() > 1)
        {
            let Some(oldest) = self.records.pop_front() else {
                break;
            };
            self.total -= oldest.size;

            // Pages the evicted record copied stay alive through its
            // successor, which now owns everything not shared with the image.
            if let Some(next) = self.records.front_mut() {
                let owned = next
                    .pages
                    .iter()
                    .enumerate()
                    .filter(|&(index, page)| {
                        !self.baseline.get(index).is_some_and(|base| Rc::ptr_eq(base, page))
                    })
                    .count();
                let size = record_size(owned, next.pages.len(), next.stack.len());
                self.total = self.total - next.size + size;
                next.size = size;
            }
            debug!(size = oldest.size, total = self.total, "oldest undo state evicted");
        }
    }

    /// Take the newest record as a loadable snapshot.
    pub fn pop(&mut self) -> Result<Snapshot, PersistenceError> {
        let record = self
            .records
            .pop_back()
            .ok_or(PersistenceError::NoUndoAvailable)?;
        self.total -= record.size;

        let mut ram = Vec::with_capacity(record.pages.len() * PAGE_SIZE as usize);
        for page in &record.pages {
            ram.extend_from_slice(page);
        }
        Ok(Snapshot {
            end_mem: record.end_mem,
            ram,
            stack: record.stack,
            heap: record.heap,
        })
    }

    /// Drop the newest record (`discardundo`).
    pub fn discard_latest(&mut self) {
        if let Some(record) = self.records.pop_back() {
            self.total -= record.size;
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.total = 0;
    }
}

/// Estimated bytes held by a record that owns `owned` page copies.
fn record_size(owned: usize, pages: usize, stack_words: usize) -> usize {
    RECORD_OVERHEAD
        + owned * PAGE_SIZE as usize
        + pages * std::mem::size_of::<Page>()
        + stack_words * 4
}

/// RAM pages of the image as loaded.
fn original_pages(mem: &MemorySpace) -> Vec<Page> {
    let start = mem.ram_start();
    (start..mem.orig_end_mem())
        .step_by(PAGE_SIZE as usize)
        .map(|page| {
            (page..page + PAGE_SIZE)
                .map(|addr| mem.original_byte(addr))
                .collect::<Vec<u8>>()
                .into()
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CallConvention, FunctionHeader};
    use glulx_core::asm::ImageBuilder;
    use smallvec::SmallVec;

    fn memory(ram_pages: u32) -> MemorySpace {
        let mut asm = ImageBuilder::new();
        let main = asm.func_locals(0);
        asm.op(0x31, &[]);
        asm.ram_zeroed((ram_pages * PAGE_SIZE) as usize);
        MemorySpace::new(&asm.build(main).bytes).unwrap()
    }

    fn stack_with(values: &[u32]) -> Stack {
        let mut stack = Stack::new(1024);
        let header = FunctionHeader {
            convention: CallConvention::LocalArgs,
            format: SmallVec::from_slice(&[0, 0]),
            locals: 0,
            body: 0,
        };
        stack.push_frame(&header, &[]).unwrap();
        for &value in values {
            stack.push(value).unwrap();
        }
        stack
    }

    #[test]
    fn test_unchanged_pages_are_shared() {
        let mut mem = memory(8);
        let stack = stack_with(&[]);
        let mut chain = UndoChain::new(1 << 20, 8);

        chain.push(&mem, &stack).unwrap();
        let ram_start = mem.ram_start();
        mem.write8(ram_start + 3 * PAGE_SIZE, 9).unwrap();
        chain.push(&mem, &stack).unwrap();

        let [first, second] = [&chain.records[0], &chain.records[1]];
        assert!(Rc::ptr_eq(&first.pages[0], &second.pages[0]));
        assert!(!Rc::ptr_eq(&first.pages[3], &second.pages[3]));
        // The first record shares every page with the original image.
        assert!(Rc::ptr_eq(&first.pages[0], &chain.baseline[0]));
        assert!(second.size < first.size + 2 * PAGE_SIZE as usize);
    }

    #[test]
    fn test_pop_restores_latest_state() {
        let mut mem = memory(2);
        let ram_start = mem.ram_start();
        let mut chain = UndoChain::new(1 << 20, 8);

        mem.write32(ram_start, 0xAAAA_AAAA).unwrap();
        chain.push(&mem, &stack_with(&[1])).unwrap();
        mem.write32(ram_start, 0xBBBB_BBBB).unwrap();
        chain.push(&mem, &stack_with(&[1, 2])).unwrap();

        let snapshot = chain.pop().unwrap();
        assert_eq!(&snapshot.ram[..4], &[0xBB; 4]);
        assert_eq!(snapshot.stack.len(), stack_with(&[1, 2]).len());
        let snapshot = chain.pop().unwrap();
        assert_eq!(&snapshot.ram[..4], &[0xAA; 4]);
        assert_eq!(chain.pop(), Err(PersistenceError::NoUndoAvailable));
        assert_eq!(chain.total_size(), 0);
    }

    #[test]
    fn test_growth_between_records_copies_new_pages() {
        let mut mem = memory(1);
        let stack = stack_with(&[]);
        let mut chain = UndoChain::new(1 << 20, 8);

        chain.push(&mem, &stack).unwrap();
        let grown = mem.end_mem() + 2 * PAGE_SIZE;
        mem.resize(grown).unwrap();
        chain.push(&mem, &stack).unwrap();

        let snapshot = chain.pop().unwrap();
        assert_eq!(snapshot.end_mem, grown);
        assert_eq!(snapshot.ram.len(), (grown - mem.ram_start()) as usize);
    }

    #[test]
    fn test_budget_evicts_oldest() {
        let mut mem = memory(4);
        let stack = stack_with(&[]);
        let ram_start = mem.ram_start();
        let mut chain = UndoChain::new(2048, 8);

        for round in 0..6u32 {
            for page in 0..4 {
                mem.write8(ram_start + page * PAGE_SIZE, round as u8 + 1).unwrap();
            }
            chain.push(&mem, &stack).unwrap();
            assert!(chain.total_size() <= 2048 || chain.len() == 1);
        }
        assert!(chain.len() < 6);
        let latest = chain.pop().unwrap();
        assert_eq!(latest.ram[0], 6);
    }

    #[test]
    fn test_eviction_charges_successor_for_inherited_pages() {
        let mut mem = memory(8);
        let stack = stack_with(&[]);
        let ram_start = mem.ram_start();
        let mut chain = UndoChain::new(1 << 20, 1);

        for page in 0..4 {
            mem.write8(ram_start + page * PAGE_SIZE, 7).unwrap();
        }
        chain.push(&mem, &stack).unwrap();
        let first = chain.records[0].size;
        // Nothing changed, so this record only shares pages.
        chain.push(&mem, &stack).unwrap();

        assert_eq!(chain.len(), 1);
        let kept = &chain.records[0];
        assert_eq!(kept.size, first);
        assert_eq!(kept.size, record_size(4, kept.pages.len(), stack.len()));
        assert_eq!(chain.total_size(), kept.size);
        assert!(chain.total_size() >= 4 * PAGE_SIZE as usize);
    }

    #[test]
    fn test_record_cap_and_oversized_records() {
        let mem = memory(4);
        let stack = stack_with(&[]);

        let mut capped = UndoChain::new(1 << 20, 2);
        for _ in 0..5 {
            capped.push(&mem, &stack).unwrap();
        }
        assert_eq!(capped.len(), 2);

        let mut tiny = UndoChain::new(16, 8);
        assert_eq!(tiny.push(&mem, &stack), Err(PersistenceError::UndoTooLarge));
        assert!(tiny.is_empty());
    }

    #[test]
    fn test_discard_latest() {
        let mem = memory(1);
        let mut chain = UndoChain::new(1 << 20, 8);
        chain.push(&mem, &stack_with(&[])).unwrap();
        chain.discard_latest();
        assert!(chain.is_empty());
        chain.discard_latest();
    }
}
