//! The `gestalt` opcode.

/// Glulx format version implemented.
pub const IMPLEMENTED_VERSION: u32 = 0x0003_0102;

/// Interpreter version, packed the same way as the format version.
pub const INTERPRETER_VERSION: u32 = 0x0000_0100;

/// Gestalt selectors.
pub mod selector {
    pub const GLULX_VERSION: u32 = 0;
    pub const TERP_VERSION: u32 = 1;
    pub const RESIZE_MEM: u32 = 2;
    pub const UNDO: u32 = 3;
    pub const IO_SYSTEM: u32 = 4;
    pub const UNICODE: u32 = 5;
    pub const MEM_COPY: u32 = 6;
    pub const MALLOC: u32 = 7;
    pub const MALLOC_HEAP: u32 = 8;
    pub const ACCELERATION: u32 = 9;
    pub const ACCEL_FUNC: u32 = 10;
    pub const FLOAT: u32 = 11;
    pub const EXT_UNDO: u32 = 12;
    pub const DOUBLE: u32 = 13;
}

/// Machine facts that `gestalt` reports.
#[derive(Debug, Clone, Copy)]
pub struct GestaltInfo {
    /// Heap start address, or 0 without a heap.
    pub heap_start: u32,
    /// Whether accelerated function `n` exists.
    pub accel_supported: fn(u32) -> bool,
}

/// Answer `gestalt selector arg`. Unknown selectors answer 0.
pub fn gestalt(sel: u32, arg: u32, info: &GestaltInfo) -> u32 {
    use selector::*;

    match sel {
        GLULX_VERSION => IMPLEMENTED_VERSION,
        TERP_VERSION => INTERPRETER_VERSION,
        RESIZE_MEM | UNDO | UNICODE | MEM_COPY | MALLOC | ACCELERATION | FLOAT | EXT_UNDO => 1,
        IO_SYSTEM => u32::from(arg <= 2),
        MALLOC_HEAP => info.heap_start,
        ACCEL_FUNC => u32::from((info.accel_supported)(arg)),
        // Includes DOUBLE: double-precision opcodes are not implemented.
        _ => 0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> GestaltInfo {
        GestaltInfo {
            heap_start: 0x2000,
            accel_supported: |n| (1..=13).contains(&n),
        }
    }

    #[test]
    fn test_versions_and_features() {
        assert_eq!(gestalt(selector::GLULX_VERSION, 0, &info()), 0x0003_0102);
        assert_eq!(gestalt(selector::UNDO, 0, &info()), 1);
        assert_eq!(gestalt(selector::MALLOC_HEAP, 0, &info()), 0x2000);
        assert_eq!(gestalt(selector::DOUBLE, 0, &info()), 0);
        assert_eq!(gestalt(0x1234, 0, &info()), 0);
    }

    #[test]
    fn test_io_systems_and_accel_functions() {
        assert_eq!(gestalt(selector::IO_SYSTEM, 1, &info()), 1);
        assert_eq!(gestalt(selector::IO_SYSTEM, 20, &info()), 0);
        assert_eq!(gestalt(selector::ACCEL_FUNC, 13, &info()), 1);
        assert_eq!(gestalt(selector::ACCEL_FUNC, 14, &info()), 0);
    }
}
