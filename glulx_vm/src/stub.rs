//! Continuation stubs.
//!
//! A stub is four words pushed below every new frame (and by `catch`, save
//! and undo): where the produced value goes, the PC to resume at, and the
//! frame pointer to return to.
//!
//! | kind   | meaning                                  | `addr`         | `pc`                 |
//! |--------|------------------------------------------|----------------|----------------------|
//! | 0      | discard the value                        | unused         | resume PC            |
//! | 1      | store in memory                          | address        | resume PC            |
//! | 2      | store in a local                         | byte offset    | resume PC            |
//! | 3      | push on the stack                        | unused         | resume PC            |
//! | `0x10` | continue a compressed string             | bit number     | byte address         |
//! | `0x11` | string finished, continue executing code | unused         | resume PC            |
//! | `0x12` | continue printing a number               | digit position | the number           |
//! | `0x13` | continue a C string                      | unused         | next char address    |
//! | `0x14` | continue a Unicode string                | unused         | next char address    |

use glulx_core::{FatalError, Result};
use glulx_jit::Dst;

use crate::frame::Stack;

/// Stub kinds.
pub mod kind {
    pub use glulx_jit::operand::dest::{DISCARD, LOCAL, MEMORY, STACK};

    pub const RESUME_COMPRESSED: u32 = 0x10;
    pub const RESUME_CODE: u32 = 0x11;
    pub const RESUME_NUMBER: u32 = 0x12;
    pub const RESUME_CSTRING: u32 = 0x13;
    pub const RESUME_UNICODE: u32 = 0x14;
}

/// Words per stub.
pub const STUB_WORDS: usize = 4;

/// One continuation stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStub {
    pub kind: u32,
    pub addr: u32,
    pub pc: u32,
    /// Frame pointer (bytes) of the frame to return into.
    pub fp: u32,
}

impl CallStub {
    /// A stub that routes a value to `dst` and resumes at `pc`.
    #[inline]
    pub fn value(dst: Dst, pc: u32, fp: u32) -> Self {
        let (kind, addr) = dst.to_stub();
        CallStub { kind, addr, pc, fp }
    }

    /// Where the value goes, for value-routing stubs.
    #[inline]
    pub fn destination(&self) -> Option<Dst> {
        Dst::from_stub(self.kind, self.addr)
    }

    pub fn push(self, stack: &mut Stack) -> Result<()> {
        stack.push(self.kind)?;
        stack.push(self.addr)?;
        stack.push(self.pc)?;
        stack.push(self.fp)
    }

    /// Pop the topmost stub and make its frame current.
    ///
    /// The stub is read from the raw stack, so this works after the frame
    /// above it has been discarded.
    pub fn pop(stack: &mut Stack) -> Result<Self> {
        let len = stack.len();
        if len < STUB_WORDS {
            return Err(FatalError::StackUnderflow);
        }
        let words = &stack.words()[len - STUB_WORDS..];
        let stub = CallStub {
            kind: words[0],
            addr: words[1],
            pc: words[2],
            fp: words[3],
        };
        stack.truncate(len - STUB_WORDS);
        stack.set_frame(stub.fp)?;
        Ok(stub)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CallConvention, FunctionHeader};
    use smallvec::SmallVec;

    #[test]
    fn test_push_pop_restores_frame() {
        let header = FunctionHeader {
            convention: CallConvention::LocalArgs,
            format: SmallVec::from_slice(&[4, 1, 0, 0]),
            locals: 1,
            body: 0,
        };
        let mut stack = Stack::new(1024);
        stack.push_frame(&header, &[11]).unwrap();
        let fp = stack.frame_ptr();

        CallStub::value(Dst::Local(0), 0x120, fp).push(&mut stack).unwrap();
        stack.push_frame(&header, &[22]).unwrap();
        assert!(!stack.pop_frame());

        let stub = CallStub::pop(&mut stack).unwrap();
        assert_eq!(stub.destination(), Some(Dst::Local(0)));
        assert_eq!(stub.pc, 0x120);
        assert_eq!(stack.local(0, glulx_jit::Width::Word).unwrap(), 11);
    }

    #[test]
    fn test_string_kinds_have_no_destination() {
        let stub = CallStub {
            kind: kind::RESUME_CSTRING,
            addr: 0,
            pc: 0x300,
            fp: 0,
        };
        assert_eq!(stub.destination(), None);
    }

    #[test]
    fn test_pop_empty_underflows() {
        let mut stack = Stack::new(64);
        assert_eq!(CallStub::pop(&mut stack), Err(FatalError::StackUnderflow));
    }
}
