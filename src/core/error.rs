// This module defines the crate-wide error type using the thiserror crate. CompileError
// covers every way a compilation unit or a single kernel can fail: encoding failures
// (wrapping the encoder's EncodeError with its field/status context), pass guard failures
// such as a missing data layout, ABI metadata failures (unknown stack usage, missing kernel
// metadata, register pressure), pass registry misuse, textual parse errors with a line
// number, and I/O, object-writer or object-reader errors from the dump and container layers. Errors that
// only poison one kernel are classified by is_per_kernel() so the driver can record them
// and keep compiling the remaining kernels of the module.

//! Error types for the kernel compiler.

use crate::encoder::EncodeError;
use thiserror::Error;

/// Main error type for kernel compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("pass '{pass}' requires a module data layout")]
    MissingDataLayout { pass: &'static str },

    #[error("contract violation: {reason}")]
    Contract { reason: String },

    #[error("stack usage of kernel '{kernel}' is unknown")]
    UnknownStackUsage { kernel: String },

    #[error("kernel '{kernel}' has no internal metadata")]
    MissingKernelMetadata { kernel: String },

    #[error("function '{name}' not found")]
    FunctionNotFound { name: String },

    #[error("unsupported instruction '{opcode}' in '{function}'")]
    UnsupportedInstruction { opcode: &'static str, function: String },

    #[error("kernel '{kernel}' needs {needed} GRFs, only 128 are available")]
    RegisterPressure { kernel: String, needed: u32 },

    #[error("pass '{name}' is already registered")]
    DuplicatePass { name: String },

    #[error("unknown pass '{name}'")]
    UnknownPass { name: String },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object writer error: {0}")]
    Object(#[from] object::write::Error),

    #[error("malformed kernel container: {0}")]
    Container(#[from] object::read::Error),
}

impl CompileError {
    /// Errors that poison a single kernel rather than the whole unit.
    pub fn is_per_kernel(&self) -> bool {
        matches!(
            self,
            CompileError::UnknownStackUsage { .. }
                | CompileError::MissingKernelMetadata { .. }
                | CompileError::RegisterPressure { .. }
                | CompileError::UnsupportedInstruction { .. }
        )
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ged::GedStatus;

    #[test]
    fn encode_errors_convert_and_are_fatal() {
        let err: CompileError =
            EncodeError::Field { field: "Dst.RegNum", status: GedStatus::InvalidValue, line: 7 }.into();
        assert!(!err.is_per_kernel());
        let text = err.to_string();
        assert!(text.contains("Dst.RegNum"), "{text}");
    }

    #[test]
    fn metadata_errors_are_per_kernel() {
        assert!(CompileError::UnknownStackUsage { kernel: "k".into() }.is_per_kernel());
        assert!(!CompileError::MissingDataLayout { pass: "fold" }.is_per_kernel());
    }
}
