//! Core data model for the Glulx virtual machine.
//!
//! This crate owns everything below the execution engine:
//!
//! - **Image header**: validation of the 36-byte Glulx header
//! - **MemorySpace**: the bounds-checked, write-protected memory image
//! - **Heap**: the `malloc`/`mfree` allocator that lives at the top of memory
//! - **Containers**: IFF chunk reading/writing and Blorb unwrapping
//! - **Errors**: the fatal and persistence error families shared by all crates
//!
//! The compiler (`glulx_jit`) and the dispatcher (`glulx_vm`) both operate on a
//! [`MemorySpace`]; nothing in this crate knows about instructions.

#![warn(clippy::all)]

pub mod asm;
pub mod blorb;
pub mod error;
pub mod header;
pub mod heap;
pub mod iff;
pub mod memory;

pub use blorb::GameImage;
pub use error::{FatalError, PersistenceError, Result};
pub use header::Header;
pub use heap::{HeapAllocator, HeapSummary};
pub use memory::{MemorySpace, ProtectRange};

/// Granularity of every memory boundary, in bytes.
pub const PAGE_SIZE: u32 = 256;

/// Round `value` up to the next multiple of [`PAGE_SIZE`].
#[inline]
pub const fn page_align(value: u32) -> u32 {
    (value + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), 256);
        assert_eq!(page_align(256), 256);
        assert_eq!(page_align(257), 512);
    }
}
