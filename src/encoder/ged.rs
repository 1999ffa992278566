// This module implements the field-level encoding protocol the encoder talks to. An
// instruction is started from an empty template for a (platform, opcode) pair, filled in
// one field at a time through set_field, and finally written out in its 128-bit native
// form or its 64-bit compact form. Every call returns a status; nothing is ever silently
// truncated or dropped. Fields live at fixed bit ranges that depend on the instruction's
// format (basic, ternary, dpas, send, branch, nop). Some ranges are shared by two fields
// with different meanings (an immediate occupies the bits of the second source's region,
// an indirect address immediate occupies those of a register number); once one of them is
// set, setting the other is an interpreter conflict. Compaction is attempted by building
// the compact word and expanding it back: the instruction is compactable exactly when the
// expansion reproduces the native bits.

//! Status-checked instruction field encoding.

use std::fmt;
use std::str::FromStr;

/// Result of every encoding-protocol call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GedStatus {
    Success,
    CyclicDependency,
    NullPointer,
    OpcodeNotSupported,
    NoCompactForm,
    InvalidField,
    InvalidValue,
    InvalidInterpreter,
    FileOpenFailed,
    FileReadFailed,
    InvalidOperand,
    BadCompactEncoding,
    InvalidModel,
    BufferTooShort,
}

impl GedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GedStatus::Success => "success",
            GedStatus::CyclicDependency => "cyclic dependency",
            GedStatus::NullPointer => "null pointer",
            GedStatus::OpcodeNotSupported => "unsupported opcode",
            GedStatus::NoCompactForm => "no compact form",
            GedStatus::InvalidField => "invalid field",
            GedStatus::InvalidValue => "invalid value",
            GedStatus::InvalidInterpreter => "invalid interpreter",
            GedStatus::FileOpenFailed => "file open failed",
            GedStatus::FileReadFailed => "file read failed",
            GedStatus::InvalidOperand => "invalid operand",
            GedStatus::BadCompactEncoding => "bad compact encoding",
            GedStatus::InvalidModel => "invalid model",
            GedStatus::BufferTooShort => "buffer too short",
        }
    }

    pub fn is_success(self) -> bool {
        self == GedStatus::Success
    }
}

impl fmt::Display for GedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware generations with (or without) an encoding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    /// Recognized but not modelled; every template request fails.
    Gen8,
    Gen9,
    Gen11,
    XeLp,
    XeHpc,
}

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Platform::Gen8 => "gen8",
            Platform::Gen9 => "gen9",
            Platform::Gen11 => "gen11",
            Platform::XeLp => "xelp",
            Platform::XeHpc => "xehpc",
        }
    }

    pub fn has_model(self) -> bool {
        self != Platform::Gen8
    }

    pub fn supports(self, op: GedOpcode) -> bool {
        match op {
            GedOpcode::Dpas => self >= Platform::XeHpc,
            _ => self.has_model(),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "gen8" => Platform::Gen8,
            "gen9" => Platform::Gen9,
            "gen11" => Platform::Gen11,
            "xelp" | "gen12lp" => Platform::XeLp,
            "xehpc" | "pvc" => Platform::XeHpc,
            other => return Err(format!("unknown platform '{other}'")),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit-layout family of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Basic,
    Ternary,
    Dpas,
    Send,
    Branch,
    Nop,
}

/// Opcodes known to the encoding model, with their hardware encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GedOpcode {
    Illegal,
    Mov,
    Sel,
    And,
    Or,
    Xor,
    Shr,
    Shl,
    Cmp,
    Jmpi,
    Call,
    Ret,
    Send,
    Add,
    Mul,
    Dpas,
    Mad,
    Nop,
}

impl GedOpcode {
    const ALL: [GedOpcode; 18] = [
        GedOpcode::Illegal,
        GedOpcode::Mov,
        GedOpcode::Sel,
        GedOpcode::And,
        GedOpcode::Or,
        GedOpcode::Xor,
        GedOpcode::Shr,
        GedOpcode::Shl,
        GedOpcode::Cmp,
        GedOpcode::Jmpi,
        GedOpcode::Call,
        GedOpcode::Ret,
        GedOpcode::Send,
        GedOpcode::Add,
        GedOpcode::Mul,
        GedOpcode::Dpas,
        GedOpcode::Mad,
        GedOpcode::Nop,
    ];

    pub const fn code(self) -> u8 {
        match self {
            GedOpcode::Illegal => 0x00,
            GedOpcode::Mov => 0x01,
            GedOpcode::Sel => 0x02,
            GedOpcode::And => 0x05,
            GedOpcode::Or => 0x06,
            GedOpcode::Xor => 0x07,
            GedOpcode::Shr => 0x08,
            GedOpcode::Shl => 0x09,
            GedOpcode::Cmp => 0x10,
            GedOpcode::Jmpi => 0x20,
            GedOpcode::Call => 0x2c,
            GedOpcode::Ret => 0x2d,
            GedOpcode::Send => 0x31,
            GedOpcode::Add => 0x40,
            GedOpcode::Mul => 0x41,
            GedOpcode::Dpas => 0x59,
            GedOpcode::Mad => 0x5b,
            GedOpcode::Nop => 0x7e,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    pub const fn format(self) -> Format {
        match self {
            GedOpcode::Mov
            | GedOpcode::Sel
            | GedOpcode::And
            | GedOpcode::Or
            | GedOpcode::Xor
            | GedOpcode::Shr
            | GedOpcode::Shl
            | GedOpcode::Cmp
            | GedOpcode::Add
            | GedOpcode::Mul => Format::Basic,
            GedOpcode::Mad => Format::Ternary,
            GedOpcode::Dpas => Format::Dpas,
            GedOpcode::Send => Format::Send,
            GedOpcode::Jmpi | GedOpcode::Call | GedOpcode::Ret => Format::Branch,
            GedOpcode::Illegal | GedOpcode::Nop => Format::Nop,
        }
    }

    /// Register sources of a basic-format opcode.
    pub const fn basic_sources(self) -> u32 {
        match self {
            GedOpcode::Mov => 1,
            _ => 2,
        }
    }
}

/// Named instruction fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Opcode,
    AccessMode,
    MaskCtrl,
    ChannelOffset,
    PredCtrl,
    PredInv,
    ExecSize,
    DebugCtrl,
    FlagSubRegNum,
    FlagRegNum,
    CondModifier,
    AccWrCtrl,
    Sfid,
    Eot,

    DstRegFile,
    DstDataType,
    DstSubRegNum,
    DstRegNum,
    DstHorzStride,
    DstAddrMode,
    DstAddrSubReg,
    DstAddrImm,

    Src0RegFile,
    Src0DataType,
    Src0SubRegNum,
    Src0RegNum,
    Src0SrcMod,
    Src0AddrMode,
    Src0HorzStride,
    Src0Width,
    Src0VertStride,
    Src0AddrSubReg,
    Src0AddrImm,

    Src1RegFile,
    Src1DataType,
    Src1SubRegNum,
    Src1RegNum,
    Src1SrcMod,
    Src1AddrMode,
    Src1HorzStride,
    Src1Width,
    Src1VertStride,
    Src1AddrSubReg,
    Src1AddrImm,

    Src2RegFile,
    Src2DataType,
    Src2SubRegNum,
    Src2RegNum,
    Src2SrcMod,

    Imm,
    Imm64,
    MsgDesc,
    Jip,
    SystolicDepth,
    RepeatCount,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Opcode => "Opcode",
            Field::AccessMode => "AccessMode",
            Field::MaskCtrl => "MaskCtrl",
            Field::ChannelOffset => "ChannelOffset",
            Field::PredCtrl => "PredCtrl",
            Field::PredInv => "PredInv",
            Field::ExecSize => "ExecSize",
            Field::DebugCtrl => "DebugCtrl",
            Field::FlagSubRegNum => "FlagSubRegNum",
            Field::FlagRegNum => "FlagRegNum",
            Field::CondModifier => "CondModifier",
            Field::AccWrCtrl => "AccWrCtrl",
            Field::Sfid => "SFID",
            Field::Eot => "EOT",
            Field::DstRegFile => "Dst.RegFile",
            Field::DstDataType => "Dst.DataType",
            Field::DstSubRegNum => "Dst.SubRegNum",
            Field::DstRegNum => "Dst.RegNum",
            Field::DstHorzStride => "Dst.HorzStride",
            Field::DstAddrMode => "Dst.AddrMode",
            Field::DstAddrSubReg => "Dst.AddrSubRegNum",
            Field::DstAddrImm => "Dst.AddrImm",
            Field::Src0RegFile => "Src0.RegFile",
            Field::Src0DataType => "Src0.DataType",
            Field::Src0SubRegNum => "Src0.SubRegNum",
            Field::Src0RegNum => "Src0.RegNum",
            Field::Src0SrcMod => "Src0.SrcMod",
            Field::Src0AddrMode => "Src0.AddrMode",
            Field::Src0HorzStride => "Src0.HorzStride",
            Field::Src0Width => "Src0.Width",
            Field::Src0VertStride => "Src0.VertStride",
            Field::Src0AddrSubReg => "Src0.AddrSubRegNum",
            Field::Src0AddrImm => "Src0.AddrImm",
            Field::Src1RegFile => "Src1.RegFile",
            Field::Src1DataType => "Src1.DataType",
            Field::Src1SubRegNum => "Src1.SubRegNum",
            Field::Src1RegNum => "Src1.RegNum",
            Field::Src1SrcMod => "Src1.SrcMod",
            Field::Src1AddrMode => "Src1.AddrMode",
            Field::Src1HorzStride => "Src1.HorzStride",
            Field::Src1Width => "Src1.Width",
            Field::Src1VertStride => "Src1.VertStride",
            Field::Src1AddrSubReg => "Src1.AddrSubRegNum",
            Field::Src1AddrImm => "Src1.AddrImm",
            Field::Src2RegFile => "Src2.RegFile",
            Field::Src2DataType => "Src2.DataType",
            Field::Src2SubRegNum => "Src2.SubRegNum",
            Field::Src2RegNum => "Src2.RegNum",
            Field::Src2SrcMod => "Src2.SrcMod",
            Field::Imm => "Imm",
            Field::Imm64 => "Imm64",
            Field::MsgDesc => "MsgDesc",
            Field::Jip => "JIP",
            Field::SystolicDepth => "SystolicDepth",
            Field::RepeatCount => "RepeatCount",
        }
    }

    /// Largest legal value when the field has an enumerated domain narrower than its width.
    fn domain_max(self) -> Option<u64> {
        match self {
            Field::ExecSize => Some(5),
            Field::DstDataType | Field::Src0DataType | Field::Src1DataType | Field::Src2DataType => Some(10),
            Field::Src0VertStride | Field::Src1VertStride => Some(6),
            Field::Src0Width | Field::Src1Width => Some(4),
            Field::PredCtrl => Some(7),
            _ => None,
        }
    }

    fn domain_ok(self, value: u64) -> bool {
        let reg_file = matches!(
            self,
            Field::DstRegFile | Field::Src0RegFile | Field::Src1RegFile | Field::Src2RegFile
        );
        // Register file encoding 2 is reserved.
        if reg_file && value == 2 {
            return false;
        }
        !matches!(self.domain_max(), Some(max) if value > max)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit range `[lo, lo + width)` of a field in the native form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub lo: u32,
    pub width: u32,
}

impl FieldSpec {
    const fn new(lo: u32, hi: u32) -> Self {
        Self { lo, width: hi - lo }
    }

    pub fn mask(self) -> u128 {
        (((1u128) << self.width) - 1) << self.lo
    }

    fn overlaps(self, other: FieldSpec) -> bool {
        self.mask() & other.mask() != 0
    }
}

const fn b(lo: u32, hi: u32) -> Option<FieldSpec> {
    Some(FieldSpec::new(lo, hi))
}

fn header_spec(field: Field) -> Option<FieldSpec> {
    match field {
        Field::Opcode => b(0, 7),
        Field::AccessMode => b(8, 9),
        Field::MaskCtrl => b(9, 10),
        Field::ChannelOffset => b(12, 15),
        Field::PredCtrl => b(16, 20),
        Field::PredInv => b(20, 21),
        Field::ExecSize => b(21, 24),
        Field::DebugCtrl => b(30, 31),
        Field::FlagSubRegNum => b(33, 34),
        Field::FlagRegNum => b(34, 35),
        _ => None,
    }
}

fn alu_spec(field: Field) -> Option<FieldSpec> {
    match field {
        Field::CondModifier => b(24, 28),
        Field::AccWrCtrl => b(28, 29),
        _ => None,
    }
}

fn dst_src01_type_spec(field: Field) -> Option<FieldSpec> {
    match field {
        Field::DstRegFile => b(35, 37),
        Field::DstDataType => b(37, 41),
        Field::Src0RegFile => b(41, 43),
        Field::Src0DataType => b(43, 47),
        Field::DstSubRegNum => b(48, 53),
        Field::DstRegNum => b(53, 61),
        Field::Src0SubRegNum => b(64, 69),
        Field::Src0RegNum => b(69, 77),
        Field::Src0SrcMod => b(77, 79),
        Field::Src1RegFile => b(89, 91),
        Field::Src1DataType => b(91, 95),
        Field::Src1SubRegNum => b(96, 101),
        Field::Src1RegNum => b(101, 109),
        Field::Src1SrcMod => b(109, 111),
        _ => None,
    }
}

fn basic_spec(field: Field) -> Option<FieldSpec> {
    match field {
        Field::DstHorzStride => b(61, 63),
        Field::DstAddrMode => b(63, 64),
        Field::DstAddrSubReg => b(48, 52),
        Field::DstAddrImm => b(52, 61),
        Field::Src0AddrMode => b(79, 80),
        Field::Src0HorzStride => b(80, 82),
        Field::Src0Width => b(82, 85),
        Field::Src0VertStride => b(85, 89),
        Field::Src0AddrSubReg => b(64, 68),
        Field::Src0AddrImm => b(68, 77),
        Field::Src1AddrMode => b(111, 112),
        Field::Src1HorzStride => b(112, 114),
        Field::Src1Width => b(114, 117),
        Field::Src1VertStride => b(117, 121),
        Field::Src1AddrSubReg => b(96, 100),
        Field::Src1AddrImm => b(100, 109),
        Field::Imm => b(96, 128),
        Field::Imm64 => b(64, 128),
        _ => dst_src01_type_spec(field),
    }
}

fn ternary_spec(field: Field) -> Option<FieldSpec> {
    match field {
        Field::Src2DataType => b(80, 84),
        Field::Src2RegFile => b(84, 86),
        Field::Src2SrcMod => b(86, 88),
        Field::Src2SubRegNum => b(114, 119),
        Field::Src2RegNum => b(120, 128),
        _ => dst_src01_type_spec(field),
    }
}

/// Bit range of `field` in the given format, or `None` when the format lacks it.
pub fn field_spec(format: Format, field: Field) -> Option<FieldSpec> {
    if let Some(spec) = header_spec(field) {
        return Some(spec);
    }
    match format {
        Format::Basic => alu_spec(field).or_else(|| basic_spec(field)),
        Format::Ternary => alu_spec(field).or_else(|| ternary_spec(field)),
        Format::Dpas => match field {
            Field::SystolicDepth => b(61, 63),
            Field::RepeatCount => b(111, 114),
            _ => alu_spec(field).or_else(|| ternary_spec(field)),
        },
        Format::Send => match field {
            Field::Sfid => b(24, 28),
            Field::Eot => b(31, 32),
            Field::DstRegFile => b(35, 37),
            Field::DstDataType => b(37, 41),
            Field::Src0RegFile => b(41, 43),
            Field::Src0DataType => b(43, 47),
            Field::DstRegNum => b(53, 61),
            Field::Src0RegNum => b(69, 77),
            Field::Src1RegNum => b(80, 88),
            Field::Src1RegFile => b(89, 91),
            Field::Src1DataType => b(91, 95),
            Field::MsgDesc => b(96, 128),
            _ => None,
        },
        Format::Branch => match field {
            Field::DstRegFile => b(35, 37),
            Field::DstDataType => b(37, 41),
            Field::Src0RegFile => b(41, 43),
            Field::Src0DataType => b(43, 47),
            Field::DstSubRegNum => b(48, 53),
            Field::DstRegNum => b(53, 61),
            Field::Src0SubRegNum => b(64, 69),
            Field::Src0RegNum => b(69, 77),
            Field::Jip => b(96, 128),
            _ => None,
        },
        Format::Nop => None,
    }
}

/// Bit 29 selects the compact form in both encodings.
pub const COMPACT_CTRL_BIT: u32 = 29;
pub const NATIVE_SIZE: usize = 16;
pub const COMPACT_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeKind {
    Native,
    Compact,
}

impl EncodeKind {
    pub fn size(self) -> usize {
        match self {
            EncodeKind::Native => NATIVE_SIZE,
            EncodeKind::Compact => COMPACT_SIZE,
        }
    }
}

/// Data-type triples (dst, src0, src1) representable in the compact form.
pub const COMPACT_TYPE_TABLE: [(u8, u8, u8); 16] = [
    (0, 0, 0),
    (1, 1, 1),
    (7, 7, 7),
    (2, 2, 2),
    (3, 3, 3),
    (10, 10, 10),
    (6, 6, 6),
    (8, 8, 8),
    (9, 9, 9),
    (1, 3, 3),
    (0, 2, 2),
    (7, 10, 10),
    (1, 1, 3),
    (0, 0, 2),
    (7, 7, 10),
    (4, 4, 4),
];

// Compact word layout.
const C_OPCODE: FieldSpec = FieldSpec::new(0, 7);
const C_MASK_CTRL: FieldSpec = FieldSpec::new(7, 8);
const C_TYPE_INDEX: FieldSpec = FieldSpec::new(8, 13);
const C_COND_MODIFIER: FieldSpec = FieldSpec::new(13, 17);
const C_FLAG_SUBREG: FieldSpec = FieldSpec::new(17, 18);
const C_FLAG_REG: FieldSpec = FieldSpec::new(18, 19);
const C_ACC_WR: FieldSpec = FieldSpec::new(19, 20);
const C_DEBUG: FieldSpec = FieldSpec::new(20, 21);
const C_EXEC_SIZE: FieldSpec = FieldSpec::new(21, 24);
const C_CHANNEL_OFFSET: FieldSpec = FieldSpec::new(24, 27);
const C_DST_REG: FieldSpec = FieldSpec::new(30, 38);
const C_SRC0_REG: FieldSpec = FieldSpec::new(38, 46);
const C_SRC1_REG: FieldSpec = FieldSpec::new(46, 54);

fn get_bits(word: u128, spec: FieldSpec) -> u64 {
    ((word & spec.mask()) >> spec.lo) as u64
}

fn put_bits(word: &mut u128, spec: FieldSpec, value: u64) {
    *word = (*word & !spec.mask()) | (((value as u128) << spec.lo) & spec.mask());
}

/// Natural region encoding (vstride, width, hstride) for an execution size code.
pub fn natural_region_codes(exec_code: u64) -> (u64, u64, u64) {
    if exec_code == 0 {
        (0, 0, 0)
    } else {
        // w = min(exec, 8); vstride and width codes for 2, 4 and 8 line up.
        let w_code = exec_code.min(3);
        (w_code + 1, w_code, 1)
    }
}

/// One instruction under construction or decoded from bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GedInst {
    platform: Platform,
    opcode: GedOpcode,
    bits: u128,
    set_fields: Vec<(Field, FieldSpec)>,
    from_compact: bool,
}

impl GedInst {
    /// Start an empty instruction from the platform's template for `op`.
    pub fn init_empty(platform: Platform, op: GedOpcode) -> Result<Self, GedStatus> {
        if !platform.has_model() {
            return Err(GedStatus::InvalidModel);
        }
        if !platform.supports(op) {
            return Err(GedStatus::OpcodeNotSupported);
        }
        let mut bits = 0u128;
        put_bits(&mut bits, FieldSpec::new(0, 7), op.code() as u64);
        Ok(Self { platform, opcode: op, bits, set_fields: Vec::new(), from_compact: false })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn opcode(&self) -> GedOpcode {
        self.opcode
    }

    pub fn format(&self) -> Format {
        self.opcode.format()
    }

    /// Whether the instruction was decoded from the compact form.
    pub fn was_compact(&self) -> bool {
        self.from_compact
    }

    pub fn native_bits(&self) -> u128 {
        self.bits
    }

    pub fn set_field(&mut self, field: Field, value: u64) -> Result<(), GedStatus> {
        let spec = field_spec(self.format(), field).ok_or(GedStatus::InvalidField)?;
        if spec.width < 64 && value >> spec.width != 0 {
            return Err(GedStatus::InvalidValue);
        }
        if !field.domain_ok(value) {
            return Err(GedStatus::InvalidValue);
        }
        if field == Field::Opcode && value != self.opcode.code() as u64 {
            return Err(GedStatus::InvalidValue);
        }
        if self.set_fields.iter().any(|(f, s)| *f != field && s.overlaps(spec)) {
            return Err(GedStatus::InvalidInterpreter);
        }
        put_bits(&mut self.bits, spec, value);
        if !self.set_fields.iter().any(|(f, _)| *f == field) {
            self.set_fields.push((field, spec));
        }
        Ok(())
    }

    pub fn get_field(&self, field: Field) -> Result<u64, GedStatus> {
        let spec = field_spec(self.format(), field).ok_or(GedStatus::InvalidField)?;
        Ok(get_bits(self.bits, spec))
    }

    /// Sign-extended read of a signed field such as a jump offset or address immediate.
    pub fn get_signed_field(&self, field: Field) -> Result<i64, GedStatus> {
        let spec = field_spec(self.format(), field).ok_or(GedStatus::InvalidField)?;
        let raw = get_bits(self.bits, spec);
        let shift = 64 - spec.width;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Write the instruction into `buffer`; returns the number of bytes written.
    pub fn encode(&self, kind: EncodeKind, buffer: &mut [u8]) -> Result<usize, GedStatus> {
        if buffer.is_empty() {
            return Err(GedStatus::NullPointer);
        }
        if buffer.len() < kind.size() {
            return Err(GedStatus::BufferTooShort);
        }
        match kind {
            EncodeKind::Native => {
                let mut bits = self.bits;
                bits &= !(1u128 << COMPACT_CTRL_BIT);
                buffer[..NATIVE_SIZE].copy_from_slice(&bits.to_le_bytes());
            }
            EncodeKind::Compact => {
                let word = self.compact_word().ok_or(GedStatus::NoCompactForm)?;
                buffer[..COMPACT_SIZE].copy_from_slice(&word.to_le_bytes());
            }
        }
        Ok(kind.size())
    }

    fn compact_word(&self) -> Option<u64> {
        if self.format() != Format::Basic {
            return None;
        }
        let field = |f: Field| get_bits(self.bits, field_spec(Format::Basic, f).unwrap_or(FieldSpec::new(0, 0)));
        let types = (field(Field::DstDataType) as u8, field(Field::Src0DataType) as u8, {
            if self.opcode.basic_sources() == 2 {
                field(Field::Src1DataType) as u8
            } else {
                field(Field::Src0DataType) as u8
            }
        });
        let type_index = COMPACT_TYPE_TABLE.iter().position(|t| *t == types)?;

        let mut word = 0u128;
        put_bits(&mut word, C_OPCODE, self.opcode.code() as u64);
        put_bits(&mut word, C_MASK_CTRL, field(Field::MaskCtrl));
        put_bits(&mut word, C_TYPE_INDEX, type_index as u64);
        put_bits(&mut word, C_COND_MODIFIER, field(Field::CondModifier));
        put_bits(&mut word, C_FLAG_SUBREG, field(Field::FlagSubRegNum));
        put_bits(&mut word, C_FLAG_REG, field(Field::FlagRegNum));
        put_bits(&mut word, C_ACC_WR, field(Field::AccWrCtrl));
        put_bits(&mut word, C_DEBUG, field(Field::DebugCtrl));
        put_bits(&mut word, C_EXEC_SIZE, field(Field::ExecSize));
        put_bits(&mut word, C_CHANNEL_OFFSET, field(Field::ChannelOffset));
        put_bits(&mut word, C_DST_REG, field(Field::DstRegNum));
        put_bits(&mut word, C_SRC0_REG, field(Field::Src0RegNum));
        if self.opcode.basic_sources() == 2 {
            put_bits(&mut word, C_SRC1_REG, field(Field::Src1RegNum));
        }
        let word = word as u64 | (1u64 << COMPACT_CTRL_BIT);

        // Only compactable when expansion reproduces this instruction bit for bit.
        let expanded = Self::expand_compact(self.platform, word).ok()?;
        (expanded.bits == self.bits & !(1u128 << COMPACT_CTRL_BIT)).then_some(word)
    }

    fn expand_compact(platform: Platform, word: u64) -> Result<Self, GedStatus> {
        let word = word as u128;
        let opcode =
            GedOpcode::from_code(get_bits(word, C_OPCODE) as u8).ok_or(GedStatus::OpcodeNotSupported)?;
        if opcode.format() != Format::Basic {
            return Err(GedStatus::BadCompactEncoding);
        }
        let (dst_ty, src0_ty, src1_ty) = *COMPACT_TYPE_TABLE
            .get(get_bits(word, C_TYPE_INDEX) as usize)
            .ok_or(GedStatus::BadCompactEncoding)?;
        let exec = get_bits(word, C_EXEC_SIZE);
        let (vs, w, hs) = natural_region_codes(exec);

        let mut inst = Self::init_empty(platform, opcode)?;
        inst.set_field(Field::MaskCtrl, get_bits(word, C_MASK_CTRL))?;
        inst.set_field(Field::CondModifier, get_bits(word, C_COND_MODIFIER))?;
        inst.set_field(Field::FlagSubRegNum, get_bits(word, C_FLAG_SUBREG))?;
        inst.set_field(Field::FlagRegNum, get_bits(word, C_FLAG_REG))?;
        inst.set_field(Field::AccWrCtrl, get_bits(word, C_ACC_WR))?;
        inst.set_field(Field::DebugCtrl, get_bits(word, C_DEBUG))?;
        inst.set_field(Field::ExecSize, exec)?;
        inst.set_field(Field::ChannelOffset, get_bits(word, C_CHANNEL_OFFSET))?;

        inst.set_field(Field::DstRegFile, 1)?;
        inst.set_field(Field::DstDataType, dst_ty as u64)?;
        inst.set_field(Field::DstRegNum, get_bits(word, C_DST_REG))?;
        inst.set_field(Field::DstHorzStride, 1)?;

        inst.set_field(Field::Src0RegFile, 1)?;
        inst.set_field(Field::Src0DataType, src0_ty as u64)?;
        inst.set_field(Field::Src0RegNum, get_bits(word, C_SRC0_REG))?;
        inst.set_field(Field::Src0VertStride, vs)?;
        inst.set_field(Field::Src0Width, w)?;
        inst.set_field(Field::Src0HorzStride, hs)?;

        if opcode.basic_sources() == 2 {
            inst.set_field(Field::Src1RegFile, 1)?;
            inst.set_field(Field::Src1DataType, src1_ty as u64)?;
            inst.set_field(Field::Src1RegNum, get_bits(word, C_SRC1_REG))?;
            inst.set_field(Field::Src1VertStride, vs)?;
            inst.set_field(Field::Src1Width, w)?;
            inst.set_field(Field::Src1HorzStride, hs)?;
        }
        inst.from_compact = true;
        Ok(inst)
    }

    /// Decode one instruction from the start of `bytes`, in either form.
    pub fn decode(platform: Platform, bytes: &[u8]) -> Result<Self, GedStatus> {
        if bytes.is_empty() {
            return Err(GedStatus::NullPointer);
        }
        if bytes.len() < COMPACT_SIZE {
            return Err(GedStatus::BufferTooShort);
        }
        let mut low = [0u8; COMPACT_SIZE];
        low.copy_from_slice(&bytes[..COMPACT_SIZE]);
        let word = u64::from_le_bytes(low);
        if word & (1 << COMPACT_CTRL_BIT) != 0 {
            return Self::expand_compact(platform, word);
        }

        if bytes.len() < NATIVE_SIZE {
            return Err(GedStatus::BufferTooShort);
        }
        let mut raw = [0u8; NATIVE_SIZE];
        raw.copy_from_slice(&bytes[..NATIVE_SIZE]);
        let bits = u128::from_le_bytes(raw);
        let opcode = GedOpcode::from_code(get_bits(bits, FieldSpec::new(0, 7)) as u8)
            .ok_or(GedStatus::OpcodeNotSupported)?;
        if !platform.has_model() {
            return Err(GedStatus::InvalidModel);
        }
        if !platform.supports(opcode) {
            return Err(GedStatus::OpcodeNotSupported);
        }
        Ok(Self { platform, opcode, bits, set_fields: Vec::new(), from_compact: false })
    }

    /// Size in bytes of the instruction starting at `bytes`.
    pub fn encoded_size(bytes: &[u8]) -> Result<usize, GedStatus> {
        let first = *bytes.get(COMPACT_CTRL_BIT as usize / 8).ok_or(GedStatus::BufferTooShort)?;
        Ok(if first & (1 << (COMPACT_CTRL_BIT % 8)) != 0 { COMPACT_SIZE } else { NATIVE_SIZE })
    }
}
