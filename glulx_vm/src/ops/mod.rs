//! Op handlers too large to sit inline in the dispatch match.
//!
//! Handlers read their operands from the load registers and leave results
//! in the store registers; the surrounding `Store` ops write them out.

pub mod arithmetic;
pub mod calls;
pub mod memory;
pub mod system;
