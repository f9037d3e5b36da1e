//! Dynamic compiler for Glulx bytecode.
//!
//! Bytecode is translated one *unit* at a time: a straight run of
//! instructions starting at some address and ending at the first
//! unconditional control transfer. Each unit becomes a sequence of
//! [`Op`]s held in the [`CodeCache`].
//!
//! - **OperandCodec**: addressing-mode decoding ([`operand`])
//! - **Micro-ops**: the register-level instruction set ([`ops`])
//! - **PeepholeOptimizer**: one-op lookback fusion ([`peephole`])
//! - **Compiler**: bytecode to micro-ops with branch resolution ([`compiler`])
//! - **CodeCache**: address lookup, run counters, compression, pruning ([`code_cache`])

#![warn(clippy::all)]

pub mod arena;
pub mod code_cache;
pub mod compiler;
pub mod opcode;
pub mod operand;
pub mod ops;
pub mod peephole;

pub use code_cache::{CacheConfig, CodeCache, CodeCacheStats, CodeRef};
pub use operand::{Dst, Src, Width};
pub use ops::{Calc, Cond, Op, Target};
