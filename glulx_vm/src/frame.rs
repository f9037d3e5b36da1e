//! Call frames on the VM stack.
//!
//! The stack is a vector of 32-bit words. A call frame is laid out the way a
//! Glulx save file stores it:
//!
//! ```text
//! fp ->  frame length (bytes, header + locals)
//!        locals position (bytes from fp)
//!        locals format: (type, count) byte pairs, a (0, 0) terminator,
//!                       padded to a word boundary
//!        locals (one word each)
//!        value stack ...
//! ```
//!
//! Continuation stubs (see [`crate::stub`]) sit directly below each frame
//! except the outermost. Only 4-byte locals are supported.

use glulx_core::{FatalError, MemorySpace, Result};
use glulx_jit::Width;
use smallvec::SmallVec;

/// How a function receives its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// `0xC0`: arguments pushed on the value stack, last first, then the count.
    StackArgs,
    /// `0xC1`: arguments copied into the locals.
    LocalArgs,
}

/// A decoded function header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHeader {
    pub convention: CallConvention,
    /// Raw locals-format bytes including the terminator, unpadded.
    pub format: SmallVec<[u8; 8]>,
    pub locals: u32,
    /// Address of the first instruction.
    pub body: u32,
}

impl FunctionHeader {
    /// Parse the header of the function at `addr`.
    pub fn read(mem: &MemorySpace, addr: u32) -> Result<Self> {
        let malformed = |reason| FatalError::MalformedFunctionHeader { addr, reason };

        let convention = match mem.read8(addr)? {
            0xC0 => CallConvention::StackArgs,
            0xC1 => CallConvention::LocalArgs,
            _ => return Err(malformed("not a function")),
        };

        let mut format = SmallVec::new();
        let mut locals = 0u32;
        let mut cursor = addr + 1;
        loop {
            let kind = mem.read8(cursor)?;
            let count = mem.read8(cursor + 1)?;
            cursor += 2;
            format.push(kind);
            format.push(count);
            match (kind, count) {
                (0, 0) => break,
                (0, _) => return Err(malformed("locals format terminator has a count")),
                (4, _) => locals += u32::from(count),
                (1 | 2, _) => return Err(FatalError::UnsupportedFeature("locals narrower than 4 bytes")),
                _ => return Err(malformed("bad local width")),
            }
        }

        Ok(FunctionHeader {
            convention,
            format,
            locals,
            body: cursor,
        })
    }

    /// Words taken by the frame header and locals.
    #[inline]
    pub fn frame_words(&self) -> usize {
        2 + (self.format.len() + 3) / 4 + self.locals as usize
    }
}

// =============================================================================
// Stack
// =============================================================================

/// The VM stack: frames, stubs and values.
#[derive(Debug, Clone)]
pub struct Stack {
    words: Vec<u32>,
    /// Capacity in words.
    limit: usize,
    /// Word index of the current frame.
    fp: usize,
    /// Word index of the first local.
    locals: usize,
    /// Word index of the first value above the locals.
    values: usize,
}

impl Stack {
    /// Create an empty stack of `size` bytes.
    pub fn new(size: u32) -> Self {
        let limit = size as usize / 4;
        Stack {
            words: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            fp: 0,
            locals: 0,
            values: 0,
        }
    }

    /// Words in use.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn capacity_bytes(&self) -> u32 {
        (self.limit * 4) as u32
    }

    /// Stack depth in bytes; what `catch` hands out as a token.
    #[inline]
    pub fn depth_bytes(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    /// Current frame pointer in bytes.
    #[inline]
    pub fn frame_ptr(&self) -> u32 {
        (self.fp * 4) as u32
    }

    /// The raw words, bottom first.
    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.words.clear();
        self.fp = 0;
        self.locals = 0;
        self.values = 0;
    }

    /// Replace the contents with `words`.
    ///
    /// Saved stacks end in a continuation stub; the caller pops it to find
    /// the frame to resume in.
    pub fn load(&mut self, words: &[u32]) -> Result<()> {
        if words.len() > self.limit {
            return Err(FatalError::StackOverflow);
        }
        self.words.clear();
        self.words.extend_from_slice(words);
        self.fp = 0;
        self.locals = 0;
        self.values = 0;
        Ok(())
    }

    /// Cut the stack down to `len` words without touching frame bookkeeping.
    #[inline]
    pub(crate) fn truncate(&mut self, len: usize) {
        self.words.truncate(len);
    }

    /// Make the frame at byte offset `fp` current, re-reading its header.
    pub fn set_frame(&mut self, fp: u32) -> Result<()> {
        let fp = fp as usize / 4;
        if self.words.is_empty() && fp == 0 {
            self.fp = 0;
            self.locals = 0;
            self.values = 0;
            return Ok(());
        }
        if fp + 2 > self.words.len() {
            return Err(FatalError::StackUnderflow);
        }
        let frame_len = self.words[fp] as usize / 4;
        let locals_pos = self.words[fp + 1] as usize / 4;
        if locals_pos < 2 || locals_pos > frame_len || fp + frame_len > self.words.len() {
            return Err(FatalError::StackUnderflow);
        }
        self.fp = fp;
        self.locals = fp + locals_pos;
        self.values = fp + frame_len;
        Ok(())
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Push a frame for `header` and hand it the call arguments.
    pub fn push_frame(&mut self, header: &FunctionHeader, args: &[u32]) -> Result<()> {
        let frame_words = header.frame_words();
        let arg_words = match header.convention {
            CallConvention::StackArgs => args.len() + 1,
            CallConvention::LocalArgs => 0,
        };
        if self.words.len() + frame_words + arg_words > self.limit {
            return Err(FatalError::StackOverflow);
        }

        let fp = self.words.len();
        let format_words = (header.format.len() + 3) / 4;
        let locals_pos = 2 + format_words;
        self.words.push((frame_words * 4) as u32);
        self.words.push((locals_pos * 4) as u32);
        for chunk in header.format.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.words.push(u32::from_be_bytes(word));
        }
        self.words.resize(fp + frame_words, 0);

        self.fp = fp;
        self.locals = fp + locals_pos;
        self.values = fp + frame_words;

        match header.convention {
            CallConvention::StackArgs => {
                self.words.extend(args.iter().rev());
                self.words.push(args.len() as u32);
            }
            CallConvention::LocalArgs => {
                let count = args.len().min(header.locals as usize);
                self.words[self.locals..self.locals + count].copy_from_slice(&args[..count]);
            }
        }
        Ok(())
    }

    /// Discard the current frame. Returns true when nothing is left below it.
    pub fn pop_frame(&mut self) -> bool {
        self.words.truncate(self.fp);
        self.words.is_empty()
    }

    // =========================================================================
    // Locals
    // =========================================================================

    #[inline]
    fn local_slot(&self, offset: u32, width: Width) -> Result<(usize, u32)> {
        let bytes = width.bytes();
        let limit = ((self.values - self.locals) * 4) as u64;
        if offset % bytes != 0 || offset as u64 + bytes as u64 > limit {
            return Err(FatalError::InvalidLocal { offset });
        }
        Ok((self.locals + offset as usize / 4, offset % 4))
    }

    /// Read a local. Narrow widths read the big-endian bytes of the word.
    #[inline]
    pub fn local(&self, offset: u32, width: Width) -> Result<u32> {
        let (slot, byte) = self.local_slot(offset, width)?;
        let word = self.words[slot];
        Ok(match width {
            Width::Word => word,
            Width::Short => (word >> (16 - 8 * byte)) & 0xFFFF,
            Width::Byte => (word >> (24 - 8 * byte)) & 0xFF,
        })
    }

    #[inline]
    pub fn set_local(&mut self, offset: u32, value: u32, width: Width) -> Result<()> {
        let (slot, byte) = self.local_slot(offset, width)?;
        let word = &mut self.words[slot];
        match width {
            Width::Word => *word = value,
            Width::Short => {
                let shift = 16 - 8 * byte;
                *word = (*word & !(0xFFFF << shift)) | ((value & 0xFFFF) << shift);
            }
            Width::Byte => {
                let shift = 24 - 8 * byte;
                *word = (*word & !(0xFF << shift)) | ((value & 0xFF) << shift);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Values pushed in the current frame.
    #[inline]
    pub fn value_count(&self) -> usize {
        self.words.len() - self.values
    }

    #[inline]
    pub fn push(&mut self, value: u32) -> Result<()> {
        if self.words.len() >= self.limit {
            return Err(FatalError::StackOverflow);
        }
        self.words.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<u32> {
        if self.words.len() <= self.values {
            return Err(FatalError::StackUnderflow);
        }
        self.words.pop().ok_or(FatalError::StackUnderflow)
    }

    /// Pop `count` values; the first popped comes first.
    pub fn pop_many(&mut self, count: u32) -> Result<SmallVec<[u32; 8]>> {
        if count as usize > self.value_count() {
            return Err(FatalError::StackUnderflow);
        }
        let start = self.words.len() - count as usize;
        let values = self.words[start..].iter().rev().copied().collect();
        self.words.truncate(start);
        Ok(values)
    }

    /// Value `depth` entries below the top (`stkpeek`).
    pub fn peek(&self, depth: u32) -> Result<u32> {
        if depth as usize >= self.value_count() {
            return Err(FatalError::StackUnderflow);
        }
        Ok(self.words[self.words.len() - 1 - depth as usize])
    }

    pub fn swap(&mut self) -> Result<()> {
        if self.value_count() < 2 {
            return Err(FatalError::StackUnderflow);
        }
        let len = self.words.len();
        self.words.swap(len - 1, len - 2);
        Ok(())
    }

    /// Rotate the top `count` values up by `shift` places (`stkroll`).
    pub fn roll(&mut self, count: u32, shift: u32) -> Result<()> {
        let count = count as i32;
        if count < 0 || count as usize > self.value_count() {
            return Err(FatalError::StackUnderflow);
        }
        if count == 0 {
            return Ok(());
        }
        let by = (shift as i32).rem_euclid(count) as usize;
        let start = self.words.len() - count as usize;
        self.words[start..].rotate_right(by);
        Ok(())
    }

    /// Duplicate the top `count` values (`stkcopy`).
    pub fn copy_top(&mut self, count: u32) -> Result<()> {
        if count as usize > self.value_count() {
            return Err(FatalError::StackUnderflow);
        }
        if self.words.len() + count as usize > self.limit {
            return Err(FatalError::StackOverflow);
        }
        let start = self.words.len() - count as usize;
        self.words.extend_from_within(start..);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use glulx_core::asm::ImageBuilder;

    fn header(convention: CallConvention, locals: u8) -> FunctionHeader {
        FunctionHeader {
            convention,
            format: SmallVec::from_slice(&[4, locals, 0, 0]),
            locals: locals as u32,
            body: 0,
        }
    }

    #[test]
    fn test_read_function_header() {
        let mut asm = ImageBuilder::new();
        let main = asm.func_stack(300);
        asm.op(0x31, &[]);
        let image = asm.build(main);
        let mem = MemorySpace::new(&image.bytes).unwrap();

        let func = FunctionHeader::read(&mem, image.addr(main)).unwrap();
        assert_eq!(func.convention, CallConvention::StackArgs);
        assert_eq!(func.locals, 300);
        assert_eq!(func.format.as_slice(), &[4, 255, 4, 45, 0, 0]);
        assert_eq!(func.body, image.addr(main) + 7);
        assert_eq!(func.frame_words(), 2 + 2 + 300);
    }

    #[test]
    fn test_narrow_locals_are_unsupported() {
        let mut asm = ImageBuilder::new();
        let main = asm.here();
        asm.bytes(&[0xC1, 2, 1, 0, 0]);
        let image = asm.build(main);
        let mem = MemorySpace::new(&image.bytes).unwrap();
        assert!(matches!(
            FunctionHeader::read(&mem, image.addr(main)),
            Err(FatalError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_non_function_is_malformed() {
        let mut asm = ImageBuilder::new();
        let main = asm.here();
        asm.bytes(&[0x00, 0, 0]);
        let image = asm.build(main);
        let mem = MemorySpace::new(&image.bytes).unwrap();
        assert!(matches!(
            FunctionHeader::read(&mem, image.addr(main)),
            Err(FatalError::MalformedFunctionHeader { .. })
        ));
    }

    #[test]
    fn test_local_args_fill_and_truncate() {
        let mut stack = Stack::new(1024);
        stack.push_frame(&header(CallConvention::LocalArgs, 2), &[7, 8, 9]).unwrap();
        assert_eq!(stack.local(0, Width::Word).unwrap(), 7);
        assert_eq!(stack.local(4, Width::Word).unwrap(), 8);
        assert!(stack.local(8, Width::Word).is_err());
        assert_eq!(stack.value_count(), 0);
        // header 2 + format 1 + locals 2
        assert_eq!(stack.len(), 5);
    }

    #[test]
    fn test_stack_args_push_last_first_then_count() {
        let mut stack = Stack::new(1024);
        stack.push_frame(&header(CallConvention::StackArgs, 0), &[1, 2, 3]).unwrap();
        assert_eq!(stack.pop().unwrap(), 3);
        assert_eq!(stack.pop().unwrap(), 1);
        assert_eq!(stack.pop().unwrap(), 2);
        assert_eq!(stack.pop().unwrap(), 3);
        assert_eq!(stack.pop(), Err(FatalError::StackUnderflow));
    }

    #[test]
    fn test_narrow_local_access_is_big_endian() {
        let mut stack = Stack::new(1024);
        stack.push_frame(&header(CallConvention::LocalArgs, 1), &[0x1122_3344]).unwrap();
        assert_eq!(stack.local(0, Width::Short).unwrap(), 0x1122);
        assert_eq!(stack.local(2, Width::Short).unwrap(), 0x3344);
        assert_eq!(stack.local(3, Width::Byte).unwrap(), 0x44);
        stack.set_local(1, 0xAB, Width::Byte).unwrap();
        assert_eq!(stack.local(0, Width::Word).unwrap(), 0x11AB_3344);
        assert!(stack.local(1, Width::Short).is_err());
    }

    #[test]
    fn test_roll_peek_copy_swap() {
        let mut stack = Stack::new(1024);
        stack.push_frame(&header(CallConvention::LocalArgs, 0), &[]).unwrap();
        for value in [8, 7, 6, 5, 4, 3, 2, 1, 0] {
            stack.push(value).unwrap();
        }
        stack.roll(5, 1).unwrap();
        let top: Vec<u32> = (0..5).map(|depth| stack.peek(depth).unwrap()).collect();
        assert_eq!(top, vec![1, 2, 3, 4, 0]);
        stack.roll(5, -1i32 as u32).unwrap();
        assert_eq!(stack.peek(0).unwrap(), 0);

        stack.copy_top(2).unwrap();
        assert_eq!(stack.value_count(), 11);
        assert_eq!(stack.peek(0).unwrap(), 0);
        assert_eq!(stack.peek(1).unwrap(), 1);
        stack.swap().unwrap();
        assert_eq!(stack.peek(0).unwrap(), 1);
        assert!(stack.roll(12, 1).is_err());
    }

    #[test]
    fn test_overflow() {
        let mut stack = Stack::new(32);
        stack.push_frame(&header(CallConvention::LocalArgs, 2), &[]).unwrap();
        for _ in 0..3 {
            stack.push(0).unwrap();
        }
        assert_eq!(stack.push(0), Err(FatalError::StackOverflow));
        assert_eq!(
            stack.push_frame(&header(CallConvention::LocalArgs, 0), &[]),
            Err(FatalError::StackOverflow)
        );
    }

    #[test]
    fn test_set_frame_rereads_header() {
        let mut stack = Stack::new(1024);
        stack.push_frame(&header(CallConvention::LocalArgs, 1), &[5]).unwrap();
        let outer = stack.frame_ptr();
        stack.push(99).unwrap();
        stack.push_frame(&header(CallConvention::LocalArgs, 1), &[6]).unwrap();
        assert_eq!(stack.local(0, Width::Word).unwrap(), 6);
        assert!(!stack.pop_frame());
        stack.set_frame(outer).unwrap();
        assert_eq!(stack.local(0, Width::Word).unwrap(), 5);
        assert_eq!(stack.pop().unwrap(), 99);
    }
}
