// This module defines the machine instruction model consumed by the encoder and produced
// by the lowering step and the decoder. An Instruction carries its opcode, execution size,
// optional execution mask, predicate and flag modifier, a destination, sources that are
// register-direct, register-indirect or immediate, and the opcode-specific payloads (send
// descriptor, dpas geometry, branch target). The static OpSpec table gives the shape of
// every opcode: how many sources, whether it writes a destination, whether it may be
// predicated or carry a flag modifier, and which encoding format it uses. validate() checks
// that an instruction is complete and well-formed for its opcode before a single field is
// encoded; Display renders the assembly syntax used in dumps and disassembly.

//! Machine instruction model and field validation.

use super::ged::{Format, GedOpcode};
use super::EncodeError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Illegal,
    Nop,
    Mov,
    Sel,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Add,
    Mul,
    Cmp,
    Mad,
    Dpas,
    Send,
    Jmpi,
    Call,
    Ret,
}

/// Static shape of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    pub mnemonic: &'static str,
    pub num_srcs: usize,
    pub has_dst: bool,
    pub predication: bool,
    pub flag_modifier: bool,
    pub ged: GedOpcode,
}

impl OpSpec {
    pub fn format(&self) -> Format {
        self.ged.format()
    }
}

const fn spec(
    mnemonic: &'static str,
    num_srcs: usize,
    has_dst: bool,
    predication: bool,
    flag_modifier: bool,
    ged: GedOpcode,
) -> OpSpec {
    OpSpec { mnemonic, num_srcs, has_dst, predication, flag_modifier, ged }
}

impl Op {
    pub const fn spec(self) -> OpSpec {
        match self {
            Op::Illegal => spec("illegal", 0, false, false, false, GedOpcode::Illegal),
            Op::Nop => spec("nop", 0, false, false, false, GedOpcode::Nop),
            Op::Mov => spec("mov", 1, true, true, true, GedOpcode::Mov),
            Op::Sel => spec("sel", 2, true, true, true, GedOpcode::Sel),
            Op::And => spec("and", 2, true, true, true, GedOpcode::And),
            Op::Or => spec("or", 2, true, true, true, GedOpcode::Or),
            Op::Xor => spec("xor", 2, true, true, true, GedOpcode::Xor),
            Op::Shl => spec("shl", 2, true, true, true, GedOpcode::Shl),
            Op::Shr => spec("shr", 2, true, true, true, GedOpcode::Shr),
            Op::Add => spec("add", 2, true, true, true, GedOpcode::Add),
            Op::Mul => spec("mul", 2, true, true, true, GedOpcode::Mul),
            Op::Cmp => spec("cmp", 2, true, true, true, GedOpcode::Cmp),
            Op::Mad => spec("mad", 3, true, true, true, GedOpcode::Mad),
            Op::Dpas => spec("dpas", 3, true, false, false, GedOpcode::Dpas),
            Op::Send => spec("send", 2, true, true, false, GedOpcode::Send),
            Op::Jmpi => spec("jmpi", 0, false, true, false, GedOpcode::Jmpi),
            Op::Call => spec("call", 0, true, false, false, GedOpcode::Call),
            Op::Ret => spec("ret", 1, false, false, false, GedOpcode::Ret),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        self.spec().mnemonic
    }

    pub fn from_ged(op: GedOpcode) -> Self {
        match op {
            GedOpcode::Illegal => Op::Illegal,
            GedOpcode::Nop => Op::Nop,
            GedOpcode::Mov => Op::Mov,
            GedOpcode::Sel => Op::Sel,
            GedOpcode::And => Op::And,
            GedOpcode::Or => Op::Or,
            GedOpcode::Xor => Op::Xor,
            GedOpcode::Shl => Op::Shl,
            GedOpcode::Shr => Op::Shr,
            GedOpcode::Add => Op::Add,
            GedOpcode::Mul => Op::Mul,
            GedOpcode::Cmp => Op::Cmp,
            GedOpcode::Mad => Op::Mad,
            GedOpcode::Dpas => Op::Dpas,
            GedOpcode::Send => Op::Send,
            GedOpcode::Jmpi => Op::Jmpi,
            GedOpcode::Call => Op::Call,
            GedOpcode::Ret => Op::Ret,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Op::Jmpi | Op::Call | Op::Ret)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecSize {
    Simd1,
    Simd2,
    Simd4,
    Simd8,
    Simd16,
    Simd32,
}

impl ExecSize {
    pub fn lanes(self) -> u32 {
        1 << self.code()
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => ExecSize::Simd1,
            1 => ExecSize::Simd2,
            2 => ExecSize::Simd4,
            3 => ExecSize::Simd8,
            4 => ExecSize::Simd16,
            5 => ExecSize::Simd32,
            _ => return None,
        })
    }

    pub fn from_lanes(lanes: u32) -> Option<Self> {
        lanes.is_power_of_two().then(|| Self::from_code(lanes.trailing_zeros() as u64)).flatten()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MaskCtrl {
    #[default]
    Normal,
    NoMask,
}

/// Channel-enable selection: which group of lanes the instruction covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExecMask {
    /// Channel offset in groups of four lanes (M0, M4, ... M28).
    pub offset: u8,
    pub ctrl: MaskCtrl,
}

impl ExecMask {
    pub const NO_MASK: ExecMask = ExecMask { offset: 0, ctrl: MaskCtrl::NoMask };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlagReg {
    pub reg: u8,
    pub sub: u8,
}

impl FlagReg {
    pub const F0_0: FlagReg = FlagReg { reg: 0, sub: 0 };
}

impl fmt::Display for FlagReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}.{}", self.reg, self.sub)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredCtrl {
    Normal,
    Any,
    All,
}

impl PredCtrl {
    pub fn code(self) -> u64 {
        match self {
            PredCtrl::Normal => 1,
            PredCtrl::Any => 2,
            PredCtrl::All => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => PredCtrl::Normal,
            2 => PredCtrl::Any,
            3 => PredCtrl::All,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub ctrl: PredCtrl,
    pub inverse: bool,
    pub flag: FlagReg,
}

impl Predicate {
    pub fn normal(flag: FlagReg) -> Self {
        Self { ctrl: PredCtrl::Normal, inverse: false, flag }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inv = if self.inverse { "~" } else { "" };
        let ctrl = match self.ctrl {
            PredCtrl::Normal => "",
            PredCtrl::Any => ".any",
            PredCtrl::All => ".all",
        };
        write!(f, "({inv}{}{ctrl})", self.flag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondMod {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Ov,
}

impl CondMod {
    pub fn code(self) -> u64 {
        match self {
            CondMod::Eq => 1,
            CondMod::Ne => 2,
            CondMod::Gt => 3,
            CondMod::Ge => 4,
            CondMod::Lt => 5,
            CondMod::Le => 6,
            CondMod::Ov => 7,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => CondMod::Eq,
            2 => CondMod::Ne,
            3 => CondMod::Gt,
            4 => CondMod::Ge,
            5 => CondMod::Lt,
            6 => CondMod::Le,
            7 => CondMod::Ov,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            CondMod::Eq => "eq",
            CondMod::Ne => "ne",
            CondMod::Gt => "gt",
            CondMod::Ge => "ge",
            CondMod::Lt => "lt",
            CondMod::Le => "le",
            CondMod::Ov => "ov",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagModifier {
    pub cond: CondMod,
    pub flag: FlagReg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Ud,
    D,
    Uw,
    W,
    Ub,
    B,
    Df,
    F,
    Uq,
    Q,
    Hf,
}

impl DataType {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => DataType::Ud,
            1 => DataType::D,
            2 => DataType::Uw,
            3 => DataType::W,
            4 => DataType::Ub,
            5 => DataType::B,
            6 => DataType::Df,
            7 => DataType::F,
            8 => DataType::Uq,
            9 => DataType::Q,
            10 => DataType::Hf,
            _ => return None,
        })
    }

    pub fn size_bytes(self) -> u32 {
        match self {
            DataType::Ub | DataType::B => 1,
            DataType::Uw | DataType::W | DataType::Hf => 2,
            DataType::Ud | DataType::D | DataType::F => 4,
            DataType::Uq | DataType::Q | DataType::Df => 8,
        }
    }

    pub fn is_64bit(self) -> bool {
        self.size_bytes() == 8
    }

    pub fn suffix(self) -> &'static str {
        match self {
            DataType::Ud => "ud",
            DataType::D => "d",
            DataType::Uw => "uw",
            DataType::W => "w",
            DataType::Ub => "ub",
            DataType::B => "b",
            DataType::Df => "df",
            DataType::F => "f",
            DataType::Uq => "uq",
            DataType::Q => "q",
            DataType::Hf => "hf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegFile {
    /// Architecture registers; register 0 is the null register.
    Arf,
    Grf,
    Imm,
}

impl RegFile {
    pub fn code(self) -> u64 {
        match self {
            RegFile::Arf => 0,
            RegFile::Grf => 1,
            RegFile::Imm => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => RegFile::Arf,
            1 => RegFile::Grf,
            3 => RegFile::Imm,
            _ => return None,
        })
    }
}

/// Number of general registers.
pub const GRF_COUNT: u32 = 128;
/// Bytes per general register.
pub const GRF_BYTES: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegRef {
    pub file: RegFile,
    pub num: u8,
    /// Sub-register in elements of the operand type.
    pub sub: u8,
}

impl RegRef {
    pub const NULL: RegRef = RegRef { file: RegFile::Arf, num: 0, sub: 0 };

    pub fn grf(num: u8, sub: u8) -> Self {
        Self { file: RegFile::Grf, num, sub }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

/// Source region `<vstride;width,hstride>` in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub vstride: u8,
    pub width: u8,
    pub hstride: u8,
}

impl Default for Region {
    fn default() -> Self {
        Region { vstride: 8, width: 8, hstride: 1 }
    }
}

impl Region {
    pub const SCALAR: Region = Region { vstride: 0, width: 1, hstride: 0 };

    /// Contiguous region for `lanes` channels.
    pub fn natural(lanes: u32) -> Self {
        if lanes == 1 {
            Self::SCALAR
        } else {
            let w = lanes.min(8) as u8;
            Region { vstride: w, width: w, hstride: 1 }
        }
    }

    pub fn with_hstride(self, hstride: u8) -> Self {
        Region { hstride, ..self }
    }

    pub fn vstride_code(v: u8) -> Option<u64> {
        Some(match v {
            0 => 0,
            1 => 1,
            2 => 2,
            4 => 3,
            8 => 4,
            16 => 5,
            32 => 6,
            _ => return None,
        })
    }

    pub fn width_code(w: u8) -> Option<u64> {
        Some(match w {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            16 => 4,
            _ => return None,
        })
    }

    pub fn hstride_code(h: u8) -> Option<u64> {
        Some(match h {
            0 => 0,
            1 => 1,
            2 => 2,
            4 => 3,
            _ => return None,
        })
    }

    pub fn vstride_from_code(code: u64) -> u8 {
        if code == 0 {
            0
        } else {
            1 << (code - 1)
        }
    }

    pub fn width_from_code(code: u64) -> u8 {
        1 << code
    }

    pub fn hstride_from_code(code: u64) -> u8 {
        if code == 0 {
            0
        } else {
            1 << (code - 1)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SrcMod {
    #[default]
    None,
    Neg,
    Abs,
    NegAbs,
}

impl SrcMod {
    pub fn code(self) -> u64 {
        match self {
            SrcMod::None => 0,
            SrcMod::Abs => 1,
            SrcMod::Neg => 2,
            SrcMod::NegAbs => 3,
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            1 => SrcMod::Abs,
            2 => SrcMod::Neg,
            3 => SrcMod::NegAbs,
            _ => SrcMod::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Direct,
    Indirect,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrMode {
    Direct,
    Indirect,
}

impl AddrMode {
    pub fn code(self) -> u64 {
        match self {
            AddrMode::Direct => 0,
            AddrMode::Indirect => 1,
        }
    }
}

/// Addressing mode encoded for an operand kind. Immediates use the direct encoding.
pub fn addr_mode(kind: OperandKind) -> AddrMode {
    match kind {
        OperandKind::Indirect => AddrMode::Indirect,
        OperandKind::Direct | OperandKind::Immediate => AddrMode::Direct,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandValue {
    Reg(RegRef),
    /// `r[a0.sub, offset]`: register address taken from an address sub-register plus a byte offset.
    Indirect { addr_sub: u8, offset: i16 },
    Imm(u64),
}

/// One source or destination operand. Destinations use only `region.hstride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub value: OperandValue,
    pub ty: DataType,
    pub region: Region,
    pub modifier: SrcMod,
}

impl Operand {
    pub fn reg(reg: RegRef, ty: DataType) -> Self {
        Self { value: OperandValue::Reg(reg), ty, region: Region::default(), modifier: SrcMod::None }
    }

    pub fn grf(num: u8, ty: DataType) -> Self {
        Self::reg(RegRef::grf(num, 0), ty)
    }

    pub fn null(ty: DataType) -> Self {
        Self::reg(RegRef::NULL, ty)
    }

    pub fn imm(value: u64, ty: DataType) -> Self {
        Self { value: OperandValue::Imm(value), ty, region: Region::default(), modifier: SrcMod::None }
    }

    pub fn indirect(addr_sub: u8, offset: i16, ty: DataType) -> Self {
        Self {
            value: OperandValue::Indirect { addr_sub, offset },
            ty,
            region: Region::default(),
            modifier: SrcMod::None,
        }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn with_modifier(mut self, modifier: SrcMod) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn kind(&self) -> OperandKind {
        match self.value {
            OperandValue::Reg(_) => OperandKind::Direct,
            OperandValue::Indirect { .. } => OperandKind::Indirect,
            OperandValue::Imm(_) => OperandKind::Immediate,
        }
    }

    pub fn is_imm(&self) -> bool {
        self.kind() == OperandKind::Immediate
    }

    pub fn reg_ref(&self) -> Option<RegRef> {
        match self.value {
            OperandValue::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// Branch or call target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    /// Index of a block in the kernel being encoded.
    Block(usize),
    /// External symbol resolved through a relocation.
    Symbol(String),
    /// Byte offset relative to the instruction.
    Relative(i32),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Block(b) => write!(f, ".L{b}"),
            Label::Symbol(s) => f.write_str(s),
            Label::Relative(off) => write!(f, "{off:+}"),
        }
    }
}

/// Shared function unit a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sfid {
    Gateway,
    ThreadSpawner,
    Slm,
    Ugm,
}

impl Sfid {
    pub fn code(self) -> u64 {
        match self {
            Sfid::Gateway => 0x3,
            Sfid::ThreadSpawner => 0x7,
            Sfid::Slm => 0xd,
            Sfid::Ugm => 0xe,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0x3 => Sfid::Gateway,
            0x7 => Sfid::ThreadSpawner,
            0xd => Sfid::Slm,
            0xe => Sfid::Ugm,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Sfid::Gateway => "gtwy",
            Sfid::ThreadSpawner => "ts",
            Sfid::Slm => "slm",
            Sfid::Ugm => "ugm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendDesc {
    pub sfid: Sfid,
    pub desc: u32,
    pub eot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DpasInfo {
    pub systolic_depth: u8,
    pub repeat_count: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InstOpts {
    /// Must be emitted compacted.
    pub compacted: bool,
    /// Must not be compacted even when auto-compaction is on.
    pub no_compact: bool,
    pub acc_wr_en: bool,
    pub breakpoint: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub exec_size: Option<ExecSize>,
    pub exec_mask: Option<ExecMask>,
    pub predicate: Option<Predicate>,
    pub flag_modifier: Option<FlagModifier>,
    pub dst: Option<Operand>,
    pub srcs: Vec<Operand>,
    pub send: Option<SendDesc>,
    pub dpas: Option<DpasInfo>,
    pub target: Option<Label>,
    /// The immediate source holds the address of this symbol, patched at load time.
    pub imm_symbol: Option<String>,
    pub opts: InstOpts,
}

impl Instruction {
    pub fn new(op: Op, exec_size: ExecSize) -> Self {
        Self {
            op,
            exec_size: Some(exec_size),
            exec_mask: None,
            predicate: None,
            flag_modifier: None,
            dst: None,
            srcs: Vec::new(),
            send: None,
            dpas: None,
            target: None,
            imm_symbol: None,
            opts: InstOpts::default(),
        }
    }

    pub fn with_dst(mut self, dst: Operand) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn with_src(mut self, src: Operand) -> Self {
        self.srcs.push(src);
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self.exec_mask.get_or_insert_with(ExecMask::default);
        self
    }

    pub fn with_flag_modifier(mut self, cond: CondMod, flag: FlagReg) -> Self {
        self.flag_modifier = Some(FlagModifier { cond, flag });
        self
    }

    pub fn with_exec_mask(mut self, mask: ExecMask) -> Self {
        self.exec_mask = Some(mask);
        self
    }

    pub fn with_target(mut self, target: Label) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_send(mut self, send: SendDesc) -> Self {
        self.send = Some(send);
        self
    }

    pub fn with_dpas(mut self, systolic_depth: u8, repeat_count: u8) -> Self {
        self.dpas = Some(DpasInfo { systolic_depth, repeat_count });
        self
    }

    pub fn spec(&self) -> OpSpec {
        self.op.spec()
    }

    fn invalid(&self, reason: impl Into<String>) -> EncodeError {
        EncodeError::InvalidOperand { op: self.op.mnemonic(), reason: reason.into() }
    }

    /// Check that every mandatory field for the opcode is present and every value fits.
    pub fn validate(&self) -> Result<(), EncodeError> {
        let spec = self.spec();
        if self.exec_size.is_none() {
            return Err(self.invalid("missing execution size"));
        }
        if let Some(pred) = &self.predicate {
            if !spec.predication {
                return Err(self.invalid("opcode cannot be predicated"));
            }
            if self.exec_mask.is_none() {
                return Err(self.invalid("predicated instruction has no execution mask"));
            }
            if let Some(fm) = &self.flag_modifier {
                if fm.flag != pred.flag {
                    return Err(self.invalid("predicate and flag modifier use different flags"));
                }
            }
        }
        if let Some(mask) = &self.exec_mask {
            if mask.offset > 7 {
                return Err(self.invalid(format!("channel offset M{} out of range", mask.offset as u32 * 4)));
            }
        }
        match (&self.flag_modifier, spec.flag_modifier) {
            (Some(_), false) => return Err(self.invalid("opcode takes no flag modifier")),
            (None, true) if self.op == Op::Cmp => return Err(self.invalid("cmp needs a flag modifier")),
            _ => {}
        }
        for flag in self.predicate.map(|p| p.flag).into_iter().chain(self.flag_modifier.map(|f| f.flag)) {
            if flag.reg > 1 || flag.sub > 1 {
                return Err(self.invalid(format!("flag register {flag} out of range")));
            }
        }

        match (&self.dst, spec.has_dst) {
            (None, true) => return Err(self.invalid("missing destination")),
            (Some(_), false) => return Err(self.invalid("opcode writes no destination")),
            (Some(dst), true) => {
                if dst.is_imm() {
                    return Err(self.invalid("destination cannot be an immediate"));
                }
                if dst.modifier != SrcMod::None {
                    return Err(self.invalid("destination cannot carry a source modifier"));
                }
                self.validate_operand(dst, "destination")?;
                if spec.format() == Format::Basic && !matches!(dst.region.hstride, 1 | 2 | 4) {
                    return Err(self.invalid("destination stride must be 1, 2 or 4"));
                }
            }
            (None, false) => {}
        }

        if self.srcs.len() != spec.num_srcs {
            return Err(self.invalid(format!("expected {} sources, found {}", spec.num_srcs, self.srcs.len())));
        }
        let ternary = matches!(spec.format(), Format::Ternary | Format::Dpas);
        for (i, src) in self.srcs.iter().enumerate() {
            let what = format!("source {i}");
            if src.is_imm() {
                if ternary || spec.format() != Format::Basic {
                    return Err(self.invalid(format!("{what}: immediates are not allowed here")));
                }
                if i + 1 != self.srcs.len() {
                    return Err(self.invalid(format!("{what}: only the last source may be immediate")));
                }
                if src.ty.is_64bit() && self.op != Op::Mov {
                    return Err(self.invalid(format!("{what}: 64-bit immediates are only allowed on mov")));
                }
                if src.modifier != SrcMod::None {
                    return Err(self.invalid(format!("{what}: immediates take no modifier")));
                }
                if src.region != Region::default() {
                    return Err(self.invalid(format!("{what}: immediates take no region")));
                }
            }
            if ternary && src.kind() == OperandKind::Indirect {
                return Err(self.invalid(format!("{what}: indirect operands are not allowed here")));
            }
            self.validate_operand(src, &what)?;
            if spec.format() == Format::Basic && !src.is_imm() {
                let r = src.region;
                if Region::vstride_code(r.vstride).is_none()
                    || Region::width_code(r.width).is_none()
                    || Region::hstride_code(r.hstride).is_none()
                {
                    return Err(self.invalid(format!(
                        "{what}: bad region <{};{},{}>",
                        r.vstride, r.width, r.hstride
                    )));
                }
            }
        }
        if ternary {
            if let Some(dst) = &self.dst {
                if dst.kind() == OperandKind::Indirect {
                    return Err(self.invalid("destination cannot be indirect here"));
                }
            }
        }
        // Only the basic format has region fields; the others read and write whole rows.
        if spec.format() == Format::Basic {
            if let Some(dst) = &self.dst {
                if dst.region.with_hstride(1) != Region::default() {
                    return Err(self.invalid("destination region takes only a horizontal stride"));
                }
            }
        } else {
            for operand in self.dst.iter().chain(&self.srcs) {
                let r = operand.region;
                if r != Region::default() {
                    return Err(self.invalid(format!(
                        "region <{};{},{}> is not encodable in this format",
                        r.vstride, r.width, r.hstride
                    )));
                }
            }
        }

        match self.op {
            Op::Send => {
                if self.send.is_none() {
                    return Err(self.invalid("send needs a message descriptor"));
                }
                for src in &self.srcs {
                    if !matches!(src.value, OperandValue::Reg(_)) {
                        return Err(self.invalid("send payloads must be registers"));
                    }
                }
                for operand in self.dst.iter().chain(&self.srcs) {
                    if operand.reg_ref().is_some_and(|reg| reg.sub != 0) {
                        return Err(self.invalid("send operands start on a register boundary"));
                    }
                }
            }
            Op::Jmpi | Op::Call => {
                if self.target.is_none() {
                    return Err(self.invalid("branch needs a target"));
                }
            }
            Op::Dpas => {
                let info = self.dpas.ok_or_else(|| self.invalid("dpas needs systolic depth and repeat count"))?;
                if !matches!(info.systolic_depth, 1 | 2 | 4 | 8) {
                    return Err(self.invalid(format!("systolic depth {} not in {{1,2,4,8}}", info.systolic_depth)));
                }
                if !(1..=8).contains(&info.repeat_count) {
                    return Err(self.invalid(format!("repeat count {} not in 1..=8", info.repeat_count)));
                }
            }
            _ => {}
        }
        if self.op.is_branch() || self.op == Op::Send {
            if let Some(dst) = &self.dst {
                if dst.kind() != OperandKind::Direct {
                    return Err(self.invalid("destination must be a register"));
                }
            }
            for src in &self.srcs {
                if src.kind() != OperandKind::Direct {
                    return Err(self.invalid("sources must be registers"));
                }
            }
        }
        Ok(())
    }

    fn validate_operand(&self, operand: &Operand, what: &str) -> Result<(), EncodeError> {
        match operand.value {
            OperandValue::Reg(reg) => {
                if reg.file == RegFile::Imm {
                    return Err(self.invalid(format!("{what}: register in the immediate file")));
                }
                if reg.file == RegFile::Grf && reg.num as u32 >= GRF_COUNT {
                    return Err(self.invalid(format!("{what}: register r{} out of range", reg.num)));
                }
                if reg.file == RegFile::Arf && !reg.is_null() {
                    return Err(self.invalid(format!("{what}: only the null architecture register is supported")));
                }
                if reg.sub as u32 * operand.ty.size_bytes() >= GRF_BYTES {
                    return Err(self.invalid(format!("{what}: sub-register {} out of range", reg.sub)));
                }
            }
            OperandValue::Indirect { addr_sub, offset } => {
                if addr_sub > 15 {
                    return Err(self.invalid(format!("{what}: address sub-register a0.{addr_sub} out of range")));
                }
                if !(-256..=255).contains(&offset) {
                    return Err(self.invalid(format!("{what}: indirect offset {offset} does not fit 9 bits")));
                }
            }
            OperandValue::Imm(value) => {
                let bits = operand.ty.size_bytes() * 8;
                if bits < 64 && value >> bits != 0 {
                    return Err(self.invalid(format!("{what}: immediate {value:#x} does not fit :{}", operand.ty.suffix())));
                }
            }
        }
        Ok(())
    }
}

struct OperandDisplay<'a> {
    operand: &'a Operand,
    is_dst: bool,
}

impl fmt::Display for OperandDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.operand;
        let suffix = op.ty.suffix();
        let pre = match op.modifier {
            SrcMod::None => "",
            SrcMod::Neg => "-",
            SrcMod::Abs => "(abs)",
            SrcMod::NegAbs => "-(abs)",
        };
        f.write_str(pre)?;
        match op.value {
            OperandValue::Imm(v) => return write!(f, "{v:#x}:{suffix}"),
            OperandValue::Reg(r) if r.is_null() => f.write_str("null")?,
            OperandValue::Reg(r) => write!(f, "r{}.{}", r.num, r.sub)?,
            OperandValue::Indirect { addr_sub, offset } => write!(f, "r[a0.{addr_sub},{offset}]")?,
        }
        if self.is_dst {
            write!(f, "<{}>", op.region.hstride)?;
        } else {
            let r = op.region;
            write!(f, "<{};{},{}>", r.vstride, r.width, r.hstride)?;
        }
        write!(f, ":{suffix}")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pred) = &self.predicate {
            write!(f, "{pred} ")?;
        }
        f.write_str(self.op.mnemonic())?;
        if let Some(send) = &self.send {
            write!(f, ".{}", send.sfid.name())?;
        }
        if let Some(info) = &self.dpas {
            write!(f, ".{}x{}", info.systolic_depth, info.repeat_count)?;
        }
        match self.exec_size {
            Some(es) => {
                let offset = self.exec_mask.map_or(0, |m| m.offset as u32 * 4);
                write!(f, " ({}|M{})", es.lanes(), offset)?;
            }
            None => f.write_str(" (?)")?,
        }
        if let Some(fm) = &self.flag_modifier {
            write!(f, " ({}){}", fm.cond.name(), fm.flag)?;
        }
        if let Some(dst) = &self.dst {
            write!(f, " {}", OperandDisplay { operand: dst, is_dst: true })?;
        }
        for src in &self.srcs {
            write!(f, " {}", OperandDisplay { operand: src, is_dst: false })?;
        }
        if let Some(send) = &self.send {
            write!(f, " {:#x}", send.desc)?;
        }
        if let Some(target) = &self.target {
            write!(f, " {target}")?;
        }
        if let Some(sym) = &self.imm_symbol {
            write!(f, " @{sym}")?;
        }

        let mut opts = Vec::new();
        if self.exec_mask.is_some_and(|m| m.ctrl == MaskCtrl::NoMask) {
            opts.push("NoMask");
        }
        if self.opts.acc_wr_en {
            opts.push("AccWrEn");
        }
        if self.opts.breakpoint {
            opts.push("Breakpoint");
        }
        if self.opts.compacted {
            opts.push("Compacted");
        }
        if self.send.is_some_and(|s| s.eot) {
            opts.push("EOT");
        }
        if !opts.is_empty() {
            write!(f, " {{{}}}", opts.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add16() -> Instruction {
        Instruction::new(Op::Add, ExecSize::Simd16)
            .with_dst(Operand::grf(10, DataType::D))
            .with_src(Operand::grf(11, DataType::D))
            .with_src(Operand::imm(5, DataType::D))
    }

    #[test]
    fn well_formed_instruction_validates() {
        add16().validate().unwrap();
    }

    #[test]
    fn predicated_instruction_needs_exec_mask() {
        let mut inst = add16().with_predicate(Predicate::normal(FlagReg::F0_0));
        inst.validate().unwrap();
        inst.exec_mask = None;
        let err = inst.validate().unwrap_err();
        assert!(err.to_string().contains("execution mask"), "{err}");
    }

    #[test]
    fn immediate_only_in_last_source() {
        let inst = Instruction::new(Op::Add, ExecSize::Simd8)
            .with_dst(Operand::grf(10, DataType::D))
            .with_src(Operand::imm(1, DataType::D))
            .with_src(Operand::grf(11, DataType::D));
        assert!(inst.validate().is_err());
    }

    #[test]
    fn mad_rejects_immediates_and_dpas_checks_geometry() {
        let mad = Instruction::new(Op::Mad, ExecSize::Simd8)
            .with_dst(Operand::grf(10, DataType::F))
            .with_src(Operand::grf(11, DataType::F))
            .with_src(Operand::grf(12, DataType::F))
            .with_src(Operand::imm(0x3f80_0000, DataType::F));
        assert!(mad.validate().is_err());

        let dpas = Instruction::new(Op::Dpas, ExecSize::Simd8)
            .with_dst(Operand::grf(20, DataType::F))
            .with_src(Operand::grf(20, DataType::F))
            .with_src(Operand::grf(30, DataType::Hf))
            .with_src(Operand::grf(40, DataType::Hf));
        assert!(dpas.clone().validate().is_err());
        assert!(dpas.clone().with_dpas(3, 8).validate().is_err());
        assert!(dpas.clone().with_dpas(8, 9).validate().is_err());
        dpas.with_dpas(8, 8).validate().unwrap();
    }

    #[test]
    fn register_and_indirect_limits() {
        let inst = Instruction::new(Op::Mov, ExecSize::Simd1)
            .with_dst(Operand::grf(128, DataType::D))
            .with_src(Operand::grf(1, DataType::D).with_region(Region::SCALAR));
        assert!(inst.validate().is_err());

        let inst = Instruction::new(Op::Mov, ExecSize::Simd1)
            .with_dst(Operand::grf(2, DataType::D))
            .with_src(Operand::indirect(0, 300, DataType::D).with_region(Region::SCALAR));
        assert!(inst.validate().is_err());
    }

    #[test]
    fn cmp_needs_flag_modifier_and_branches_need_targets() {
        let cmp = Instruction::new(Op::Cmp, ExecSize::Simd16)
            .with_dst(Operand::null(DataType::D))
            .with_src(Operand::grf(3, DataType::D))
            .with_src(Operand::imm(0, DataType::D));
        assert!(cmp.clone().validate().is_err());
        cmp.with_flag_modifier(CondMod::Ne, FlagReg::F0_0).validate().unwrap();

        assert!(Instruction::new(Op::Jmpi, ExecSize::Simd1).validate().is_err());
        Instruction::new(Op::Jmpi, ExecSize::Simd1).with_target(Label::Relative(16)).validate().unwrap();
    }

    #[test]
    fn addressing_mode_is_a_function_of_kind() {
        assert_eq!(addr_mode(OperandKind::Direct), AddrMode::Direct);
        assert_eq!(addr_mode(OperandKind::Indirect), AddrMode::Indirect);
        assert_eq!(addr_mode(OperandKind::Immediate), AddrMode::Direct);
    }

    #[test]
    fn disassembly_text() {
        let inst = add16().with_predicate(Predicate::normal(FlagReg::F0_0));
        assert_eq!(inst.to_string(), "(f0.0) add (16|M0) r10.0<1>:d r11.0<8;8,1>:d 0x5:d");
    }
}
