//! Glulx execution engine.
//!
//! A [`Machine`] loads a story, compiles bytecode on demand through the
//! `glulx_jit` code cache and runs the resulting micro-ops.
//!
//! - **Dispatcher**: the unit loop and per-op handlers ([`machine`], [`dispatch`], [`ops`])
//! - **Frames and stubs**: call frames and continuation stubs on the VM stack ([`frame`], [`stub`])
//! - **Output**: the three I/O systems and string decoding ([`output`])
//! - **Persistence**: undo chain and IFZS save files ([`persist`])
//! - **Library support**: acceleration, array searches, gestalt, PRNG
//!
//! All host interaction (text output, `glk`, save streams) goes through an
//! [`IoCapability`] supplied by the embedder.

#![warn(clippy::all)]

pub mod accel;
pub mod config;
pub mod dispatch;
pub mod frame;
pub mod gestalt;
pub mod io;
pub mod machine;
pub mod ops;
pub mod output;
pub mod persist;
pub mod random;
pub mod search;
pub mod stub;

pub use config::{ConfigError, VmConfig};
pub use dispatch::ControlFlow;
pub use io::{CaptureIo, IoCapability, NullIo};
pub use machine::{Machine, Termination};
pub use output::{IoMode, IoSys};
