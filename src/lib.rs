//! xe-codegen - GPU kernel backend fragment.
//!
//! Takes a kernel graph through an analysis-aware pass pipeline, lowers every
//! kernel into a machine instruction model, validates and encodes each
//! instruction field by field through a status-checked setter protocol, and
//! packages the result into an ELF kernel container.
//!
//! # Primary Usage
//!
//! ```no_run
//! use xe_codegen::ir::parse_module;
//! use xe_codegen::{compile, CompileOptions};
//!
//! let module = parse_module("unit", "kernel @k() {\nentry:\n  ret\n}")?;
//! let output = compile(module, CompileOptions::new().apply_env())?;
//! std::fs::write("unit.zebin", &output.container)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Owned kernel graph and its textual `.kir` form
//! - [`analysis`] - Dominance, loops and divergence with a per-function cache
//! - [`passes`] - Pass trait, registry and the built-in transformation passes
//! - [`metadata`] - Typed annotation side table and kernel ABI metadata
//! - [`encoder`] - Instruction model, lowering, encoding protocol and decoder
//! - [`dump`] - Dump/override hooks and the kernel container
//! - [`driver`] - Per-unit compilation and parallel batches
//! - [`core`] - Errors, options and the compilation session

pub mod analysis;
pub mod core;
pub mod driver;
pub mod dump;
pub mod encoder;
pub mod ir;
pub mod metadata;
pub mod passes;

pub use crate::core::{CompilationSession, CompileError, CompileOptions, CompileResult, SessionStats};
pub use driver::{compile, compile_batch, CompileOutput, Driver, KernelFailure};
pub use encoder::{EncodeError, Encoder, Instruction, Platform};
