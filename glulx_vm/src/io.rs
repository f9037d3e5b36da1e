//! The I/O capability the machine talks to.
//!
//! The machine does not own windows, files or streams. Everything that
//! leaves the VM goes through an [`IoCapability`]: character output in
//! direct mode, the `glk` opcode's generic dispatch, and the byte streams
//! that save files are written to and read from.

use glulx_core::{MemorySpace, Result};
use rustc_hash::FxHashMap;

/// Host services used by the machine.
pub trait IoCapability {
    /// Emit one Latin-1 character.
    fn put_char(&mut self, ch: u8);

    /// Emit one Unicode code point.
    fn put_char_uni(&mut self, ch: u32);

    /// Emit a whole string.
    fn put_str(&mut self, text: &str) {
        for ch in text.chars() {
            self.put_char_uni(ch as u32);
        }
    }

    /// The `glk` opcode. `args` are in call order; the implementation may
    /// read and write VM memory.
    fn dispatch(&mut self, selector: u32, args: &[u32], mem: &mut MemorySpace) -> Result<u32>;

    /// Replace the contents of stream `id`. Returns false on failure.
    fn write_stream(&mut self, id: u32, bytes: &[u8]) -> bool;

    /// The whole contents of stream `id`, or `None` if it cannot be read.
    fn read_stream(&mut self, id: u32) -> Option<Vec<u8>>;

    /// Current position of stream `id`.
    fn stream_position(&self, id: u32) -> u32 {
        let _ = id;
        0
    }
}

// =============================================================================
// Null I/O
// =============================================================================

/// Discards output and fails every stream operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIo;

impl IoCapability for NullIo {
    fn put_char(&mut self, _ch: u8) {}

    fn put_char_uni(&mut self, _ch: u32) {}

    fn dispatch(&mut self, _selector: u32, _args: &[u32], _mem: &mut MemorySpace) -> Result<u32> {
        Ok(0)
    }

    fn write_stream(&mut self, _id: u32, _bytes: &[u8]) -> bool {
        false
    }

    fn read_stream(&mut self, _id: u32) -> Option<Vec<u8>> {
        None
    }
}

// =============================================================================
// Capture I/O
// =============================================================================

/// Records output in a string and keeps streams in memory.
///
/// `glk` calls are logged as `(selector, args)` and answer 0.
#[derive(Debug, Clone, Default)]
pub struct CaptureIo {
    pub output: String,
    pub glk_calls: Vec<(u32, Vec<u32>)>,
    streams: FxHashMap<u32, Vec<u8>>,
}

impl CaptureIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the output collected so far.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub fn stream(&self, id: u32) -> Option<&[u8]> {
        self.streams.get(&id).map(Vec::as_slice)
    }

    /// Preload stream `id`, e.g. with a save file written elsewhere.
    pub fn set_stream(&mut self, id: u32, bytes: Vec<u8>) {
        self.streams.insert(id, bytes);
    }
}

impl IoCapability for CaptureIo {
    fn put_char(&mut self, ch: u8) {
        self.output.push(ch as char);
    }

    fn put_char_uni(&mut self, ch: u32) {
        self.output.push(char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER));
    }

    fn put_str(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn dispatch(&mut self, selector: u32, args: &[u32], _mem: &mut MemorySpace) -> Result<u32> {
        self.glk_calls.push((selector, args.to_vec()));
        Ok(0)
    }

    fn write_stream(&mut self, id: u32, bytes: &[u8]) -> bool {
        self.streams.insert(id, bytes.to_vec());
        true
    }

    fn read_stream(&mut self, id: u32) -> Option<Vec<u8>> {
        self.streams.get(&id).cloned()
    }

    fn stream_position(&self, id: u32) -> u32 {
        self.streams.get(&id).map_or(0, |bytes| bytes.len() as u32)
    }
}

// =============================================================================
// Tests
// =============================================================================
