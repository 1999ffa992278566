// This module is the machine side of the compiler: it turns lowered kernels into bit-exact
// instruction streams. The pieces, leaf first: `ged` is the status-checked field encoding
// protocol, `timer` the optional wall-clock instrumentation, `instruction` the machine
// instruction model and its validation, `encode` the kernel encoder (block layout,
// compaction with native fallback, jump patching, relocations), `decode` the inverse used
// for disassembly and round-trip checks, and `lower` the translation from kernel graph
// functions into machine kernels. Every protocol status that is not success becomes an
// EncodeError through encode_field, which records the field name and the caller's line.

//! Machine instruction encoding.

pub mod decode;
pub mod encode;
pub mod ged;
pub mod instruction;
pub mod lower;
pub mod timer;

pub use decode::{decode_kernel, disassemble};
pub use encode::Encoder;
pub use ged::{GedStatus, Platform};
pub use instruction::{Instruction, Op};
pub use lower::lower_kernel;

use ged::{Field, GedInst};
use thiserror::Error;
use timer::{EncoderTimers, TimingReport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoder line {line}: unsupported GED setter {field} ({status})")]
    Field { field: &'static str, status: GedStatus, line: u32 },

    #[error("unable to start a '{op}' instruction: {status}")]
    Template { op: &'static str, status: GedStatus },

    #[error("GED unable to encode instruction {index} ({op}): {status}")]
    Instruction { index: usize, op: &'static str, status: GedStatus },

    #[error("GED unable to compact instruction {index} ({op})")]
    CompactMiss { index: usize, op: &'static str },

    #[error("invalid operand on '{op}': {reason}")]
    InvalidOperand { op: &'static str, reason: String },

    #[error("decoded {field} value {value} at offset {offset:#x} has no counterpart in the instruction model")]
    ModelMismatch { offset: usize, field: &'static str, value: u64 },

    #[error("instruction {index} jumps to unresolved label {label}")]
    UnresolvedLabel { index: usize, label: String },

    #[error("unable to decode instruction at offset {offset:#x}: {status}")]
    Decode { offset: usize, status: GedStatus },
}

/// Set one field, turning any non-success status into an error that names the field and
/// the calling line. The instruction being built is abandoned by the caller's `?`.
#[track_caller]
pub fn encode_field(
    ged: &mut GedInst,
    field: Field,
    value: u64,
    timers: &mut EncoderTimers,
) -> Result<(), EncodeError> {
    let line = std::panic::Location::caller().line();
    let started = timers.start_setter();
    let result = ged.set_field(field, value);
    timers.stop_setter(started);
    result.map_err(|status| {
        log::error!("encoder line {}: unsupported GED setter {} ({})", line, field.name(), status);
        EncodeError::Field { field: field.name(), status, line }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOpts {
    /// Try the compact form for every instruction not marked no-compact.
    pub auto_compact: bool,
    /// A required compaction that fails only warns instead of failing the kernel.
    pub explicit_compact_miss_is_warning: bool,
    pub enable_timing: bool,
}

impl Default for EncoderOpts {
    fn default() -> Self {
        Self { auto_compact: true, explicit_compact_miss_is_warning: false, enable_timing: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineBlock {
    pub label: String,
    pub insts: Vec<Instruction>,
}

impl MachineBlock {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string(), insts: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineKernel {
    pub name: String,
    pub simd: u32,
    pub blocks: Vec<MachineBlock>,
}

impl MachineKernel {
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }
}

impl std::fmt::Display for MachineKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "// kernel {} simd{}", self.name, self.simd)?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, ".L{}: // {}", i, block.label)?;
            for inst in &block.insts {
                writeln!(f, "    {}", inst)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// 32-bit byte offset from the call instruction to the symbol.
    CallPcRel32,
    /// 64-bit absolute address in a `mov` immediate.
    Abs64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the patched bits within the kernel's code.
    pub offset: u64,
    pub symbol: String,
    pub kind: RelocKind,
}

/// Output of encoding one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedKernel {
    pub name: String,
    pub bits: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub block_offsets: Vec<u32>,
    pub instruction_count: usize,
    pub compacted_count: usize,
    pub timings: Option<TimingReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ged::{GedOpcode, Platform};

    #[test]
    fn encode_field_reports_field_and_line() {
        let mut ged = GedInst::init_empty(Platform::XeHpc, GedOpcode::Send).unwrap();
        let mut timers = EncoderTimers::new(false);
        let expected_line = line!() + 1;
        let err = encode_field(&mut ged, Field::Src0Width, 1, &mut timers).unwrap_err();
        assert_eq!(
            err,
            EncodeError::Field { field: "Src0.Width", status: GedStatus::InvalidField, line: expected_line }
        );
        assert!(err.to_string().starts_with(&format!("encoder line {expected_line}")));
    }
}
