//! The output engine: `streamchar`, `streamunichar`, `streamnum` and
//! `streamstr` under the three I/O systems.
//!
//! Output is a loop over a [`Cursor`]. In filter mode every character is
//! handed to a VM function, so the loop must be able to stop after any
//! character and pick up again when the filter returns. It does that by
//! pushing the cursor as a continuation stub (kinds `0x10`, `0x12`, `0x13`,
//! `0x14`) before entering the filter; the filter's return pops the stub
//! and lands back in [`Machine::resume_output`].
//!
//! Strings nest: a compressed string can embed other strings and function
//! calls. Entering a nested string pushes the outer cursor the same way, and
//! the first time output leaves the opcode it pushes a `0x11` stub that
//! resumes the code after the opcode once the outermost string is done.

use glulx_core::{FatalError, Result};
use glulx_jit::Dst;

use crate::dispatch::ControlFlow;
use crate::io::IoCapability;
use crate::machine::Machine;
use crate::stub::{kind, CallStub};

/// The three I/O systems of `setiosys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IoMode {
    /// Output is discarded.
    #[default]
    Null = 0,
    /// Every character is passed to the function in the rock.
    Filter = 1,
    /// Output goes straight to the I/O capability.
    Direct = 2,
}

/// Current I/O system and its rock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoSys {
    pub mode: IoMode,
    pub rock: u32,
}

impl IoSys {
    /// `setiosys`. Unknown systems select the null system.
    pub fn set(&mut self, mode: u32, rock: u32) {
        self.mode = match mode {
            1 => IoMode::Filter,
            2 => IoMode::Direct,
            _ => IoMode::Null,
        };
        self.rock = rock;
    }
}

/// Position inside one piece of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Huffman bitstream at byte `addr`, bit `bit` (LSB first).
    Compressed { addr: u32, bit: u32 },
    Latin1(u32),
    Unicode(u32),
    /// Decimal digits of `value`, next at `pos`.
    Number { value: u32, pos: u32 },
}

impl Cursor {
    fn to_stub(self, fp: u32) -> CallStub {
        let (kind, addr, pc) = match self {
            Cursor::Compressed { addr, bit } => (kind::RESUME_COMPRESSED, bit, addr),
            Cursor::Latin1(addr) => (kind::RESUME_CSTRING, 0, addr),
            Cursor::Unicode(addr) => (kind::RESUME_UNICODE, 0, addr),
            Cursor::Number { value, pos } => (kind::RESUME_NUMBER, pos, value),
        };
        CallStub { kind, addr, pc, fp }
    }

    fn from_stub(stub: CallStub) -> Result<Self> {
        Ok(match stub.kind {
            kind::RESUME_COMPRESSED => Cursor::Compressed {
                addr: stub.pc,
                bit: stub.addr,
            },
            kind::RESUME_CSTRING => Cursor::Latin1(stub.pc),
            kind::RESUME_UNICODE => Cursor::Unicode(stub.pc),
            kind::RESUME_NUMBER => Cursor::Number {
                value: stub.pc,
                pos: stub.addr,
            },
            other => return Err(FatalError::BadCallStub(other)),
        })
    }
}

/// What the cursor produced.
enum Event {
    Char(u32),
    /// A character that must go out as Unicode in direct mode.
    UniChar(u32),
    /// Start printing the string at this address.
    Nested(u32),
    /// Start printing an inline string that has no type byte.
    Inline(Cursor),
    /// Call the function at `addr` with arguments stored at `args`.
    Call { addr: u32, argc: u32, args: u32 },
    End,
}

/// Decimal digits of `value` read as signed.
fn digits(value: u32) -> smallvec::SmallVec<[u8; 12]> {
    let mut out = smallvec::SmallVec::new();
    let negative = (value as i32) < 0;
    let mut magnitude = (value as i32).unsigned_abs();
    loop {
        out.push(b'0' + (magnitude % 10) as u8);
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if negative {
        out.push(b'-');
    }
    out.reverse();
    out
}

impl<I: IoCapability> Machine<I> {
    // =========================================================================
    // Opcodes
    // =========================================================================

    pub(crate) fn stream_char(&mut self, ch: u32, next: u32) -> Result<ControlFlow> {
        match self.iosys.mode {
            IoMode::Null => Ok(ControlFlow::Continue),
            IoMode::Direct => {
                self.io.put_char(ch as u8);
                Ok(ControlFlow::Continue)
            }
            IoMode::Filter => self.filter_single(ch, next),
        }
    }

    pub(crate) fn stream_unichar(&mut self, ch: u32, next: u32) -> Result<ControlFlow> {
        match self.iosys.mode {
            IoMode::Null => Ok(ControlFlow::Continue),
            IoMode::Direct => {
                self.io.put_char_uni(ch);
                Ok(ControlFlow::Continue)
            }
            IoMode::Filter => self.filter_single(ch, next),
        }
    }

    pub(crate) fn stream_num(&mut self, value: u32, next: u32) -> Result<ControlFlow> {
        match self.iosys.mode {
            IoMode::Null => Ok(ControlFlow::Continue),
            IoMode::Direct => {
                for digit in digits(value) {
                    self.io.put_char(digit);
                }
                Ok(ControlFlow::Continue)
            }
            IoMode::Filter => self.print(Cursor::Number { value, pos: 0 }, Some(next)),
        }
    }

    pub(crate) fn stream_str(&mut self, addr: u32, next: u32) -> Result<ControlFlow> {
        let cursor = self.string_cursor(addr)?;
        self.print(cursor, Some(next))
    }

    /// A popped output stub: continue the output it describes.
    pub(crate) fn resume_output(&mut self, stub: CallStub) -> Result<ControlFlow> {
        let cursor = Cursor::from_stub(stub)?;
        self.print(cursor, None)
    }

    /// One character through the filter; the filter returns to `next`.
    fn filter_single(&mut self, ch: u32, next: u32) -> Result<ControlFlow> {
        let filter = self.iosys.rock;
        let stub = self.value_stub(Dst::Discard, next);
        self.call_function(filter, &[ch], stub)
    }

    // =========================================================================
    // The print loop
    // =========================================================================

    /// Cursor at the start of the string object at `addr`.
    fn string_cursor(&self, addr: u32) -> Result<Cursor> {
        match self.mem.read8(addr)? {
            0xE0 => Ok(Cursor::Latin1(addr + 1)),
            0xE1 => Ok(Cursor::Compressed { addr: addr + 1, bit: 0 }),
            0xE2 => Ok(Cursor::Unicode(addr + 4)),
            _ => Err(FatalError::BadString {
                addr,
                reason: "not a string",
            }),
        }
    }

    /// Push the `0x11` stub if output has not left the opcode yet.
    ///
    /// `pending` holds the PC after the opcode until the stub is pushed.
    fn leave_opcode(&mut self, pending: &mut Option<u32>) -> Result<()> {
        if let Some(next) = pending.take() {
            let fp = self.stack.frame_ptr();
            CallStub {
                kind: kind::RESUME_CODE,
                addr: 0,
                pc: next,
                fp,
            }
            .push(&mut self.stack)?;
        }
        Ok(())
    }

    /// Run output from `cursor` until it finishes or control moves into VM
    /// code. `pending` is `Some(next)` while still inside the opcode.
    fn print(&mut self, mut cursor: Cursor, mut pending: Option<u32>) -> Result<ControlFlow> {
        let mode = self.iosys.mode;
        loop {
            match self.advance(&mut cursor)? {
                Event::Char(ch) | Event::UniChar(ch) if mode == IoMode::Filter => {
                    let filter = self.iosys.rock;
                    if let Some(index) = self.accel.lookup(filter) {
                        self.accel.call(index, &[ch], &self.mem, &mut self.io)?;
                        continue;
                    }
                    self.leave_opcode(&mut pending)?;
                    cursor.to_stub(self.stack.frame_ptr()).push(&mut self.stack)?;
                    let body = self.enter_function(filter, &[ch])?;
                    return Ok(ControlFlow::Transfer(body));
                }
                Event::Char(ch) => {
                    if mode == IoMode::Direct {
                        self.io.put_char(ch as u8);
                    }
                }
                Event::UniChar(ch) => {
                    if mode == IoMode::Direct {
                        self.io.put_char_uni(ch);
                    }
                }
                Event::Nested(addr) => {
                    let inner = self.string_cursor(addr)?;
                    self.nest(&mut cursor, inner, &mut pending)?;
                }
                Event::Inline(inner) => self.nest(&mut cursor, inner, &mut pending)?,
                Event::Call { addr, argc, args } => {
                    let mut values = smallvec::SmallVec::<[u32; 8]>::new();
                    for i in 0..argc {
                        values.push(self.mem.read32(args.wrapping_add(4 * i))?);
                    }
                    if let Some(index) = self.accel.lookup(addr) {
                        self.accel.call(index, &values, &self.mem, &mut self.io)?;
                        continue;
                    }
                    self.leave_opcode(&mut pending)?;
                    cursor.to_stub(self.stack.frame_ptr()).push(&mut self.stack)?;
                    let body = self.enter_function(addr, &values)?;
                    return Ok(ControlFlow::Transfer(body));
                }
                Event::End => {
                    if pending.is_some() {
                        // Never left the opcode: nothing is stacked.
                        return Ok(ControlFlow::Continue);
                    }
                    let parent = CallStub::pop(&mut self.stack)?;
                    if parent.kind == kind::RESUME_CODE {
                        return Ok(ControlFlow::Transfer(parent.pc));
                    }
                    cursor = Cursor::from_stub(parent)?;
                }
            }
        }
    }

    /// Suspend `cursor` on the stack and continue with `inner`.
    fn nest(&mut self, cursor: &mut Cursor, inner: Cursor, pending: &mut Option<u32>) -> Result<()> {
        self.leave_opcode(pending)?;
        cursor.to_stub(self.stack.frame_ptr()).push(&mut self.stack)?;
        *cursor = inner;
        Ok(())
    }

    /// Produce the next event and move the cursor past it.
    fn advance(&self, cursor: &mut Cursor) -> Result<Event> {
        match cursor {
            Cursor::Latin1(addr) => {
                let ch = self.mem.read8(*addr)?;
                if ch == 0 {
                    return Ok(Event::End);
                }
                *addr += 1;
                Ok(Event::Char(u32::from(ch)))
            }
            Cursor::Unicode(addr) => {
                let ch = self.mem.read32(*addr)?;
                if ch == 0 {
                    return Ok(Event::End);
                }
                *addr += 4;
                Ok(Event::UniChar(ch))
            }
            Cursor::Number { value, pos } => {
                let text = digits(*value);
                match text.get(*pos as usize) {
                    Some(&digit) => {
                        *pos += 1;
                        Ok(Event::Char(u32::from(digit)))
                    }
                    None => Ok(Event::End),
                }
            }
            Cursor::Compressed { addr, bit } => self.decode(addr, bit),
        }
    }

    /// Walk the decoding tree from the root to the next leaf.
    fn decode(&self, addr: &mut u32, bit: &mut u32) -> Result<Event> {
        let table = self.string_table;
        if table == 0 {
            return Err(FatalError::BadString {
                addr: *addr,
                reason: "no decoding table",
            });
        }
        let mut node = self.mem.read32(table + 8)?;
        let mut node_type = self.mem.read8(node)?;
        while node_type == 0x00 {
            let byte = self.mem.read8(*addr)?;
            let branch = (byte >> *bit) & 1;
            *bit += 1;
            if *bit == 8 {
                *bit = 0;
                *addr += 1;
            }
            node = self.mem.read32(node + 1 + 4 * u32::from(branch))?;
            node_type = self.mem.read8(node)?;
        }

        let event = match node_type {
            0x01 => Event::End,
            0x02 => Event::Char(u32::from(self.mem.read8(node + 1)?)),
            0x03 => Event::Inline(Cursor::Latin1(node + 1)),
            0x04 => Event::UniChar(self.mem.read32(node + 1)?),
            0x05 => Event::Inline(Cursor::Unicode(node + 1)),
            0x08..=0x0B => {
                let mut target = self.mem.read32(node + 1)?;
                if node_type & 1 == 1 {
                    target = self.mem.read32(target)?;
                }
                let (argc, args) = if node_type >= 0x0A {
                    (self.mem.read32(node + 5)?, node + 9)
                } else {
                    (0, 0)
                };
                match self.mem.read8(target)? {
                    0xE0..=0xFF => Event::Nested(target),
                    0xC0..=0xDF => Event::Call {
                        addr: target,
                        argc,
                        args,
                    },
                    _ => {
                        return Err(FatalError::BadString {
                            addr: target,
                            reason: "indirect reference to a non-string, non-function",
                        })
                    }
                }
            }
            _ => {
                return Err(FatalError::BadString {
                    addr: node,
                    reason: "unknown decoding-table node",
                })
            }
        };
        Ok(event)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits() {
        assert_eq!(digits(0).as_slice(), b"0");
        assert_eq!(digits(1234).as_slice(), b"1234");
        assert_eq!(digits(-56i32 as u32).as_slice(), b"-56");
        assert_eq!(digits(i32::MIN as u32).as_slice(), b"-2147483648");
    }

    #[test]
    fn test_setiosys_unknown_mode_is_null() {
        let mut iosys = IoSys::default();
        iosys.set(2, 0);
        assert_eq!(iosys.mode, IoMode::Direct);
        iosys.set(1, 0x400);
        assert_eq!((iosys.mode, iosys.rock), (IoMode::Filter, 0x400));
        iosys.set(20, 5);
        assert_eq!(iosys.mode, IoMode::Null);
    }

    #[test]
    fn test_cursor_stub_round_trip() {
        for cursor in [
            Cursor::Compressed { addr: 0x300, bit: 5 },
            Cursor::Latin1(0x410),
            Cursor::Unicode(0x520),
            Cursor::Number { value: -7i32 as u32, pos: 1 },
        ] {
            assert_eq!(Cursor::from_stub(cursor.to_stub(0x40)).unwrap(), cursor);
        }
        let code = CallStub {
            kind: kind::RESUME_CODE,
            addr: 0,
            pc: 0,
            fp: 0,
        };
        assert!(Cursor::from_stub(code).is_err());
    }
}
