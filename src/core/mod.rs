// This module serves as the hub for the compiler's shared infrastructure: the crate-wide
// error type, the explicit compile options record threaded through the pipeline, and the
// arena-backed per-unit compilation session with its statistics. Every other layer (passes,
// lowering, encoder, dump, driver) depends on these three pieces and on nothing else here.

//! Core infrastructure shared by every compiler layer.
//!
//! - [`error`]: [`CompileError`] and the [`CompileResult`] alias
//! - [`options`]: [`CompileOptions`], passed by `&mut` through the pass pipeline
//! - [`session`]: arena-based [`CompilationSession`] and [`SessionStats`]

pub mod error;
pub mod options;
pub mod session;

pub use error::{CompileError, CompileResult};
pub use options::CompileOptions;
pub use session::{CompilationSession, SessionStats};
