//! Error families shared across the VM.
//!
//! There are two kinds of failure:
//!
//! - [`FatalError`] ends the run. The dispatcher has no recovery path for
//!   these; they surface as the `Err` of `Machine::run`.
//! - [`PersistenceError`] comes out of save, restore and undo. The opcodes
//!   that trigger them turn the error into a status value for the game, so
//!   the program keeps running.

use thiserror::Error;

/// Result alias for operations that can only fail fatally.
pub type Result<T> = std::result::Result<T, FatalError>;

/// Unrecoverable VM failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("bad image header: {0}")]
    BadHeader(&'static str),

    #[error("unsupported Glulx version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("memory access out of range at {addr:#x}")]
    OutOfBoundsAccess { addr: u32 },

    #[error("write to read-only memory at {addr:#x}")]
    WriteProtectViolation { addr: u32 },

    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("illegal opcode {opcode:#x} at {pc:#x}")]
    IllegalOpcode { pc: u32, opcode: u32 },

    #[error("malformed function header at {addr:#x}: {reason}")]
    MalformedFunctionHeader { addr: u32, reason: &'static str },

    #[error("memory cannot be resized while the heap is active")]
    ResizeWhileHeapActive,

    #[error("invalid memory size {0:#x}")]
    InvalidResize(u32),

    #[error("local variable offset {offset:#x} is outside the frame")]
    InvalidLocal { offset: u32 },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("cannot print string at {addr:#x}: {reason}")]
    BadString { addr: u32, reason: &'static str },

    #[error("invalid catch token {0:#x}")]
    BadThrowToken(u32),

    #[error("unknown call stub type {0:#x}")]
    BadCallStub(u32),

    #[error("heap corrupt: {0}")]
    HeapCorrupt(&'static str),

    #[error("code cache cannot hold the instruction at {pc:#x}")]
    CacheExhausted { pc: u32 },

    #[error("debugtrap executed with argument {0:#x}")]
    DebugTrap(u32),

    #[error("I/O system failure: {0}")]
    Io(String),
}

/// Recoverable failure while saving, restoring or undoing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("save file is missing required chunk `{0}`")]
    MissingChunk(&'static str),

    #[error("save file belongs to a different game")]
    IdentityMismatch,

    #[error("memory delta is corrupt")]
    CorruptDelta,

    #[error("no undo state available")]
    NoUndoAvailable,

    #[error("not a valid IFF container: {0}")]
    BadContainer(&'static str),

    #[error("saved stack does not fit in the stack")]
    StackTooLarge,

    #[error("saved memory size {0:#x} exceeds the memory limit")]
    MemoryTooLarge(u32),

    #[error("saved heap does not fit the saved memory: {0}")]
    CorruptHeap(&'static str),

    #[error("undo snapshot exceeds the undo budget")]
    UndoTooLarge,

    #[error("stream {0} could not be read or written")]
    Stream(u32),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl FatalError {
    /// Convenience constructor for out-of-range reads.
    #[inline]
    pub fn oob(addr: u32) -> Self {
        FatalError::OutOfBoundsAccess { addr }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_messages_carry_addresses() {
        let err = FatalError::WriteProtectViolation { addr: 0x40 };
        assert_eq!(err.to_string(), "write to read-only memory at 0x40");

        let err = FatalError::IllegalOpcode {
            pc: 0x100,
            opcode: 0x1ff,
        };
        assert!(err.to_string().contains("0x1ff"));
        assert!(err.to_string().contains("0x100"));
    }

    #[test]
    fn test_persistence_error_wraps_fatal() {
        let err: PersistenceError = FatalError::StackOverflow.into();
        assert_eq!(err, PersistenceError::Fatal(FatalError::StackOverflow));
        assert_eq!(err.to_string(), "stack overflow");
    }
}
