// This module implements the kernel encoder. encode_kernel lays out blocks in order,
// validates and encodes every instruction field by field through the status-checked
// protocol, and writes each one compacted when that is requested or when auto-compaction
// is on and a compact form exists, falling back to the native form otherwise. A required
// compaction that fails is an error, or a warning when the options say so. Branches to
// blocks cannot be finished until every block offset is known, so their partially encoded
// protocol instructions are kept aside and patched with the final jump offset once the
// whole kernel has been laid out. Calls to symbols and immediates holding symbol addresses
// produce relocation records instead.

//! Kernel encoder: blocks, compaction, jump patching and relocations.

use super::ged::{field_spec, EncodeKind, Field, Format, GedInst, GedStatus, Platform, NATIVE_SIZE};
use super::instruction::{
    addr_mode, Instruction, Label, MaskCtrl, Op, Operand, OperandValue, RegFile, RegRef, Region,
};
use super::timer::EncoderTimers;
use super::{encode_field, EncodeError, EncodedKernel, EncoderOpts, MachineKernel, RelocKind, Relocation};
use log::{debug, trace, warn};

/// Fields of one register source in the basic format.
struct SrcFields {
    reg_file: Field,
    data_type: Field,
    sub_reg: Field,
    reg_num: Field,
    src_mod: Field,
    addr_mode: Field,
    horz_stride: Field,
    width: Field,
    vert_stride: Field,
    addr_sub_reg: Field,
    addr_imm: Field,
}

const SRC0: SrcFields = SrcFields {
    reg_file: Field::Src0RegFile,
    data_type: Field::Src0DataType,
    sub_reg: Field::Src0SubRegNum,
    reg_num: Field::Src0RegNum,
    src_mod: Field::Src0SrcMod,
    addr_mode: Field::Src0AddrMode,
    horz_stride: Field::Src0HorzStride,
    width: Field::Src0Width,
    vert_stride: Field::Src0VertStride,
    addr_sub_reg: Field::Src0AddrSubReg,
    addr_imm: Field::Src0AddrImm,
};

const SRC1: SrcFields = SrcFields {
    reg_file: Field::Src1RegFile,
    data_type: Field::Src1DataType,
    sub_reg: Field::Src1SubRegNum,
    reg_num: Field::Src1RegNum,
    src_mod: Field::Src1SrcMod,
    addr_mode: Field::Src1AddrMode,
    horz_stride: Field::Src1HorzStride,
    width: Field::Src1Width,
    vert_stride: Field::Src1VertStride,
    addr_sub_reg: Field::Src1AddrSubReg,
    addr_imm: Field::Src1AddrImm,
};

/// Fields of one source in the ternary and dpas formats.
const TERNARY_SRCS: [(Field, Field, Field, Field, Field); 3] = [
    (Field::Src0RegFile, Field::Src0DataType, Field::Src0SubRegNum, Field::Src0RegNum, Field::Src0SrcMod),
    (Field::Src1RegFile, Field::Src1DataType, Field::Src1SubRegNum, Field::Src1RegNum, Field::Src1SrcMod),
    (Field::Src2RegFile, Field::Src2DataType, Field::Src2SubRegNum, Field::Src2RegNum, Field::Src2SrcMod),
];

/// Payload fields of a send; payloads always start on a register boundary.
const SEND_SRCS: [(Field, Field, Field); 2] = [
    (Field::Src0RegFile, Field::Src0DataType, Field::Src0RegNum),
    (Field::Src1RegFile, Field::Src1DataType, Field::Src1RegNum),
];

/// A block branch waiting for its target offset.
struct JumpPatch {
    ged: GedInst,
    index: usize,
    pc: usize,
    target: usize,
}

pub struct Encoder {
    platform: Platform,
    opts: EncoderOpts,
    bits: Vec<u8>,
    block_offsets: Vec<Option<usize>>,
    patches: Vec<JumpPatch>,
    relocations: Vec<Relocation>,
    instruction_count: usize,
    compacted_count: usize,
}

impl Encoder {
    pub fn new(platform: Platform, opts: EncoderOpts) -> Self {
        Self {
            platform,
            opts,
            bits: Vec::new(),
            block_offsets: Vec::new(),
            patches: Vec::new(),
            relocations: Vec::new(),
            instruction_count: 0,
            compacted_count: 0,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn reset(&mut self, blocks: usize) {
        self.bits.clear();
        self.block_offsets = vec![None; blocks];
        self.patches.clear();
        self.relocations.clear();
        self.instruction_count = 0;
        self.compacted_count = 0;
    }

    fn current_pc(&self) -> usize {
        self.bits.len()
    }

    /// Encode a whole kernel. Any failure abandons the kernel.
    pub fn encode_kernel(&mut self, kernel: &MachineKernel) -> Result<EncodedKernel, EncodeError> {
        self.reset(kernel.blocks.len());
        debug!("encoding kernel '{}' for {}", kernel.name, self.platform);

        let mut timers = EncoderTimers::new(self.opts.enable_timing);
        timers.time_phase("kernel", |t| {
            self.encode_blocks(kernel, t)?;
            self.patch_jump_offsets(t)
        })?;

        debug!(
            "kernel '{}': {} instructions ({} compacted), {} bytes",
            kernel.name,
            self.instruction_count,
            self.compacted_count,
            self.bits.len()
        );
        Ok(EncodedKernel {
            name: kernel.name.clone(),
            bits: std::mem::take(&mut self.bits),
            relocations: std::mem::take(&mut self.relocations),
            block_offsets: self.block_offsets.iter().map(|o| o.unwrap_or(0) as u32).collect(),
            instruction_count: self.instruction_count,
            compacted_count: self.compacted_count,
            timings: timers.report(),
        })
    }

    fn encode_blocks(&mut self, kernel: &MachineKernel, timers: &mut EncoderTimers) -> Result<(), EncodeError> {
        let mut index = 0;
        for (b, block) in kernel.blocks.iter().enumerate() {
            self.block_offsets[b] = Some(self.current_pc());
            trace!("block {} ({}) at {:#x}", b, block.label, self.current_pc());
            timers.time_phase("encode_block", |t| {
                for inst in &block.insts {
                    self.encode_one(inst, index, t)?;
                    index += 1;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn encode_one(&mut self, inst: &Instruction, index: usize, timers: &mut EncoderTimers) -> Result<(), EncodeError> {
        inst.validate()?;
        let ged = self.encode_instruction(inst, timers)?;
        let pc = self.current_pc();
        let op = inst.op.mnemonic();

        let must_compact = inst.opts.compacted;
        self.bits.resize(pc + NATIVE_SIZE, 0);

        let mut len = None;
        if must_compact || (!inst.opts.no_compact && self.opts.auto_compact) {
            match ged.encode(EncodeKind::Compact, &mut self.bits[pc..]) {
                Ok(n) => len = Some(n),
                Err(GedStatus::NoCompactForm) => {
                    if must_compact {
                        if self.opts.explicit_compact_miss_is_warning {
                            warn!("GED unable to compact instruction {} ({})", index, op);
                        } else {
                            return Err(EncodeError::CompactMiss { index, op });
                        }
                    }
                }
                Err(status) => return Err(EncodeError::Instruction { index, op, status }),
            }
        }
        let len = match len {
            Some(n) => n,
            None => ged
                .encode(EncodeKind::Native, &mut self.bits[pc..])
                .map_err(|status| EncodeError::Instruction { index, op, status })?,
        };
        self.bits.truncate(pc + len);
        self.instruction_count += 1;
        if len < NATIVE_SIZE {
            self.compacted_count += 1;
        }

        match &inst.target {
            Some(Label::Block(target)) => {
                self.patches.push(JumpPatch { ged, index, pc, target: *target });
            }
            Some(Label::Symbol(symbol)) => self.relocations.push(Relocation {
                offset: (pc + field_byte(Format::Branch, Field::Jip)) as u64,
                symbol: symbol.clone(),
                kind: RelocKind::CallPcRel32,
            }),
            _ => {}
        }
        if let Some(symbol) = &inst.imm_symbol {
            self.relocations.push(Relocation {
                offset: (pc + field_byte(Format::Basic, Field::Imm64)) as u64,
                symbol: symbol.clone(),
                kind: RelocKind::Abs64,
            });
        }
        Ok(())
    }

    /// Build the protocol instruction for `inst`, field by field.
    pub fn encode_instruction(&self, inst: &Instruction, t: &mut EncoderTimers) -> Result<GedInst, EncodeError> {
        let spec = inst.spec();
        let mut ged = GedInst::init_empty(self.platform, spec.ged)
            .map_err(|status| EncodeError::Template { op: spec.mnemonic, status })?;

        if let Some(es) = inst.exec_size {
            encode_field(&mut ged, Field::ExecSize, es.code(), t)?;
        }
        if let Some(mask) = inst.exec_mask {
            encode_field(&mut ged, Field::ChannelOffset, mask.offset as u64, t)?;
            encode_field(&mut ged, Field::MaskCtrl, (mask.ctrl == MaskCtrl::NoMask) as u64, t)?;
        }
        if let Some(pred) = inst.predicate {
            encode_field(&mut ged, Field::PredCtrl, pred.ctrl.code(), t)?;
            encode_field(&mut ged, Field::PredInv, pred.inverse as u64, t)?;
            encode_field(&mut ged, Field::FlagRegNum, pred.flag.reg as u64, t)?;
            encode_field(&mut ged, Field::FlagSubRegNum, pred.flag.sub as u64, t)?;
        }
        if let Some(fm) = inst.flag_modifier {
            encode_field(&mut ged, Field::CondModifier, fm.cond.code(), t)?;
            encode_field(&mut ged, Field::FlagRegNum, fm.flag.reg as u64, t)?;
            encode_field(&mut ged, Field::FlagSubRegNum, fm.flag.sub as u64, t)?;
        }
        if inst.opts.acc_wr_en {
            encode_field(&mut ged, Field::AccWrCtrl, 1, t)?;
        }
        if inst.opts.breakpoint {
            encode_field(&mut ged, Field::DebugCtrl, 1, t)?;
        }

        match spec.format() {
            Format::Basic => {
                if let Some(dst) = &inst.dst {
                    encode_basic_dst(&mut ged, dst, t)?;
                }
                for (src, fields) in inst.srcs.iter().zip([&SRC0, &SRC1]) {
                    encode_basic_src(&mut ged, src, fields, inst.op, t)?;
                }
            }
            Format::Ternary | Format::Dpas => {
                if let Some(dst) = &inst.dst {
                    let fields = (Field::DstRegFile, Field::DstDataType, Field::DstSubRegNum, Field::DstRegNum);
                    encode_reg(&mut ged, dst, fields, t)?;
                }
                for (src, (rf, ty, sub, num, modifier)) in inst.srcs.iter().zip(TERNARY_SRCS) {
                    encode_reg(&mut ged, src, (rf, ty, sub, num), t)?;
                    encode_field(&mut ged, modifier, src.modifier.code(), t)?;
                }
                if let Some(info) = inst.dpas {
                    encode_field(&mut ged, Field::SystolicDepth, info.systolic_depth.trailing_zeros() as u64, t)?;
                    encode_field(&mut ged, Field::RepeatCount, info.repeat_count as u64 - 1, t)?;
                }
            }
            Format::Send => {
                if let Some(send) = inst.send {
                    encode_field(&mut ged, Field::Sfid, send.sfid.code(), t)?;
                    encode_field(&mut ged, Field::Eot, send.eot as u64, t)?;
                    encode_field(&mut ged, Field::MsgDesc, send.desc as u64, t)?;
                }
                if let Some(dst) = &inst.dst {
                    encode_reg_num(&mut ged, dst, (Field::DstRegFile, Field::DstDataType, Field::DstRegNum), t)?;
                }
                for (src, fields) in inst.srcs.iter().zip(SEND_SRCS) {
                    encode_reg_num(&mut ged, src, fields, t)?;
                }
            }
            Format::Branch => {
                if let Some(dst) = &inst.dst {
                    let fields = (Field::DstRegFile, Field::DstDataType, Field::DstSubRegNum, Field::DstRegNum);
                    encode_reg(&mut ged, dst, fields, t)?;
                }
                if let Some(src) = inst.srcs.first() {
                    let (rf, ty, sub, num, _) = TERNARY_SRCS[0];
                    encode_reg(&mut ged, src, (rf, ty, sub, num), t)?;
                }
                match &inst.target {
                    Some(Label::Relative(off)) => encode_field(&mut ged, Field::Jip, *off as u32 as u64, t)?,
                    // Patched once the block layout or the symbol address is known.
                    Some(_) => encode_field(&mut ged, Field::Jip, 0, t)?,
                    None => {}
                }
            }
            Format::Nop => {}
        }
        Ok(ged)
    }

    /// Fill in the jump offsets of block branches and re-encode them in place.
    fn patch_jump_offsets(&mut self, timers: &mut EncoderTimers) -> Result<(), EncodeError> {
        timers.time_phase("patch_jumps", |t| {
            for JumpPatch { mut ged, index, pc, target } in std::mem::take(&mut self.patches) {
                let target_pc = self
                    .block_offsets
                    .get(target)
                    .copied()
                    .flatten()
                    .ok_or_else(|| EncodeError::UnresolvedLabel { index, label: format!(".L{target}") })?;
                let jip = target_pc as i64 - pc as i64;
                encode_field(&mut ged, Field::Jip, jip as i32 as u32 as u64, t)?;
                let op = Op::from_ged(ged.opcode()).mnemonic();
                ged.encode(EncodeKind::Native, &mut self.bits[pc..])
                    .map_err(|status| EncodeError::Instruction { index, op, status })?;
                trace!("patched jump at {:#x} to {:#x} (jip {})", pc, target_pc, jip);
            }
            Ok(())
        })
    }
}

/// Byte offset of a field within the native form.
fn field_byte(format: Format, field: Field) -> usize {
    field_spec(format, field).map_or(0, |s| s.lo as usize / 8)
}

fn encode_basic_dst(ged: &mut GedInst, dst: &Operand, t: &mut EncoderTimers) -> Result<(), EncodeError> {
    encode_field(ged, Field::DstDataType, dst.ty.code(), t)?;
    encode_field(ged, Field::DstAddrMode, addr_mode(dst.kind()).code(), t)?;
    match dst.value {
        OperandValue::Reg(reg) => {
            encode_field(ged, Field::DstRegFile, reg.file.code(), t)?;
            encode_field(ged, Field::DstSubRegNum, (reg.sub as u32 * dst.ty.size_bytes()) as u64, t)?;
            encode_field(ged, Field::DstRegNum, reg.num as u64, t)?;
        }
        OperandValue::Indirect { addr_sub, offset } => {
            encode_field(ged, Field::DstRegFile, RegFile::Grf.code(), t)?;
            encode_field(ged, Field::DstAddrSubReg, addr_sub as u64, t)?;
            encode_field(ged, Field::DstAddrImm, offset as u64 & 0x1ff, t)?;
        }
        OperandValue::Imm(_) => {}
    }
    let hs = Region::hstride_code(dst.region.hstride).unwrap_or(1);
    encode_field(ged, Field::DstHorzStride, hs, t)
}

fn encode_basic_src(
    ged: &mut GedInst,
    src: &Operand,
    fields: &SrcFields,
    op: Op,
    t: &mut EncoderTimers,
) -> Result<(), EncodeError> {
    encode_field(ged, fields.data_type, src.ty.code(), t)?;
    match src.value {
        OperandValue::Imm(value) => {
            encode_field(ged, fields.reg_file, RegFile::Imm.code(), t)?;
            if src.ty.is_64bit() && op == Op::Mov {
                encode_field(ged, Field::Imm64, value, t)
            } else {
                encode_field(ged, Field::Imm, value & 0xffff_ffff, t)
            }
        }
        OperandValue::Reg(reg) => {
            encode_field(ged, fields.reg_file, reg.file.code(), t)?;
            encode_field(ged, fields.addr_mode, addr_mode(src.kind()).code(), t)?;
            encode_field(ged, fields.sub_reg, (reg.sub as u32 * src.ty.size_bytes()) as u64, t)?;
            encode_field(ged, fields.reg_num, reg.num as u64, t)?;
            encode_field(ged, fields.src_mod, src.modifier.code(), t)?;
            encode_region(ged, src.region, fields, t)
        }
        OperandValue::Indirect { addr_sub, offset } => {
            encode_field(ged, fields.reg_file, RegFile::Grf.code(), t)?;
            encode_field(ged, fields.addr_mode, addr_mode(src.kind()).code(), t)?;
            encode_field(ged, fields.addr_sub_reg, addr_sub as u64, t)?;
            encode_field(ged, fields.addr_imm, offset as u64 & 0x1ff, t)?;
            encode_field(ged, fields.src_mod, src.modifier.code(), t)?;
            encode_region(ged, src.region, fields, t)
        }
    }
}

fn encode_region(ged: &mut GedInst, region: Region, fields: &SrcFields, t: &mut EncoderTimers) -> Result<(), EncodeError> {
    // Regions were checked by validate().
    encode_field(ged, fields.vert_stride, Region::vstride_code(region.vstride).unwrap_or(0), t)?;
    encode_field(ged, fields.width, Region::width_code(region.width).unwrap_or(0), t)?;
    encode_field(ged, fields.horz_stride, Region::hstride_code(region.hstride).unwrap_or(0), t)
}

fn encode_reg(
    ged: &mut GedInst,
    operand: &Operand,
    (rf, ty, sub, num): (Field, Field, Field, Field),
    t: &mut EncoderTimers,
) -> Result<(), EncodeError> {
    let reg = operand.reg_ref().unwrap_or(RegRef::NULL);
    encode_field(ged, rf, reg.file.code(), t)?;
    encode_field(ged, ty, operand.ty.code(), t)?;
    encode_field(ged, sub, (reg.sub as u32 * operand.ty.size_bytes()) as u64, t)?;
    encode_field(ged, num, reg.num as u64, t)
}

fn encode_reg_num(
    ged: &mut GedInst,
    operand: &Operand,
    (rf, ty, num): (Field, Field, Field),
    t: &mut EncoderTimers,
) -> Result<(), EncodeError> {
    let reg = operand.reg_ref().unwrap_or(RegRef::NULL);
    encode_field(ged, rf, reg.file.code(), t)?;
    encode_field(ged, ty, operand.ty.code(), t)?;
    encode_field(ged, num, reg.num as u64, t)
}

#[cfg(test)]
mod tests {
    use super::super::instruction::*;
    use super::super::{MachineBlock, MachineKernel};
    use super::*;

    fn mov(dst: u8, src: u8) -> Instruction {
        Instruction::new(Op::Mov, ExecSize::Simd8)
            .with_dst(Operand::grf(dst, DataType::D))
            .with_src(Operand::grf(src, DataType::D))
    }

    fn kernel(blocks: Vec<Vec<Instruction>>) -> MachineKernel {
        MachineKernel {
            name: "k".into(),
            simd: 8,
            blocks: blocks
                .into_iter()
                .enumerate()
                .map(|(i, insts)| MachineBlock { label: format!("b{i}"), insts })
                .collect(),
        }
    }

    #[test]
    fn auto_compaction_and_native_fallback() {
        let imm_add = Instruction::new(Op::Add, ExecSize::Simd8)
            .with_dst(Operand::grf(4, DataType::D))
            .with_src(Operand::grf(5, DataType::D))
            .with_src(Operand::imm(1, DataType::D));
        let k = kernel(vec![vec![mov(2, 3), imm_add]]);
        let mut enc = Encoder::new(Platform::XeHpc, EncoderOpts::default());
        let out = enc.encode_kernel(&k).unwrap();
        assert_eq!(out.bits.len(), 8 + 16);
        assert_eq!(out.compacted_count, 1);
        assert_eq!(out.instruction_count, 2);

        let mut enc = Encoder::new(Platform::XeHpc, EncoderOpts { auto_compact: false, ..Default::default() });
        assert_eq!(enc.encode_kernel(&k).unwrap().bits.len(), 32);
    }

    #[test]
    fn explicit_compaction_miss() {
        let mut inst = Instruction::new(Op::Add, ExecSize::Simd8)
            .with_dst(Operand::grf(4, DataType::D))
            .with_src(Operand::grf(5, DataType::D))
            .with_src(Operand::imm(1, DataType::D));
        inst.opts.compacted = true;
        let k = kernel(vec![vec![inst]]);

        let mut enc = Encoder::new(Platform::XeHpc, EncoderOpts { auto_compact: false, ..Default::default() });
        assert_eq!(enc.encode_kernel(&k), Err(EncodeError::CompactMiss { index: 0, op: "add" }));

        let opts = EncoderOpts { auto_compact: false, explicit_compact_miss_is_warning: true, enable_timing: false };
        let mut enc = Encoder::new(Platform::XeHpc, opts);
        assert_eq!(enc.encode_kernel(&k).unwrap().bits.len(), 16);
    }

    #[test]
    fn forward_and_backward_jumps_are_patched() {
        let jmp = |b| Instruction::new(Op::Jmpi, ExecSize::Simd1).with_target(Label::Block(b));
        let k = kernel(vec![vec![jmp(1)], vec![mov(2, 3), jmp(0)]]);
        let mut enc = Encoder::new(Platform::XeHpc, EncoderOpts::default());
        let out = enc.encode_kernel(&k).unwrap();
        assert_eq!(out.block_offsets, vec![0, 16]);

        let first = GedInst::decode(Platform::XeHpc, &out.bits[0..]).unwrap();
        assert_eq!(first.get_signed_field(Field::Jip), Ok(16));
        // jmpi in block 1 sits after the 8-byte compacted mov.
        let back = GedInst::decode(Platform::XeHpc, &out.bits[24..]).unwrap();
        assert_eq!(back.get_signed_field(Field::Jip), Ok(-24));
    }

    #[test]
    fn unresolved_block_label_fails() {
        let k = kernel(vec![vec![Instruction::new(Op::Jmpi, ExecSize::Simd1).with_target(Label::Block(5))]]);
        let mut enc = Encoder::new(Platform::XeHpc, EncoderOpts::default());
        assert!(matches!(enc.encode_kernel(&k), Err(EncodeError::UnresolvedLabel { index: 0, .. })));
    }

    #[test]
    fn unsupported_opcode_aborts_with_template_error() {
        let dpas = Instruction::new(Op::Dpas, ExecSize::Simd8)
            .with_dst(Operand::grf(20, DataType::F))
            .with_src(Operand::grf(20, DataType::F))
            .with_src(Operand::grf(30, DataType::Hf))
            .with_src(Operand::grf(40, DataType::Hf))
            .with_dpas(8, 8);
        let k = kernel(vec![vec![dpas]]);
        let mut enc = Encoder::new(Platform::XeLp, EncoderOpts::default());
        assert_eq!(
            enc.encode_kernel(&k),
            Err(EncodeError::Template { op: "dpas", status: GedStatus::OpcodeNotSupported })
        );
    }

    #[test]
    fn branch_sub_registers_and_send_payload_types_are_encoded() {
        let enc = Encoder::new(Platform::XeHpc, EncoderOpts::default());
        let mut t = EncoderTimers::new(false);
        let call = Instruction::new(Op::Call, ExecSize::Simd1)
            .with_dst(Operand::reg(RegRef::grf(120, 3), DataType::Ud))
            .with_target(Label::Relative(32));
        let ged = enc.encode_instruction(&call, &mut t).unwrap();
        assert_eq!(ged.get_field(Field::DstSubRegNum), Ok(12));
        assert_eq!(ged.get_field(Field::DstRegNum), Ok(120));

        let send = Instruction::new(Op::Send, ExecSize::Simd8)
            .with_dst(Operand::grf(40, DataType::F))
            .with_src(Operand::null(DataType::Uq))
            .with_src(Operand::grf(41, DataType::F))
            .with_send(SendDesc { sfid: Sfid::Ugm, desc: 0x40, eot: false });
        let ged = enc.encode_instruction(&send, &mut t).unwrap();
        assert_eq!(ged.get_field(Field::DstDataType), Ok(DataType::F.code()));
        assert_eq!(ged.get_field(Field::Src0RegFile), Ok(RegFile::Arf.code()));
        assert_eq!(ged.get_field(Field::Src0DataType), Ok(DataType::Uq.code()));
        assert_eq!(ged.get_field(Field::Src1DataType), Ok(DataType::F.code()));
    }

    #[test]
    fn symbols_produce_relocations() {
        let call = Instruction::new(Op::Call, ExecSize::Simd1)
            .with_dst(Operand::grf(120, DataType::D))
            .with_target(Label::Symbol("helper".into()));
        let mut addr = Instruction::new(Op::Mov, ExecSize::Simd1)
            .with_exec_mask(ExecMask::NO_MASK)
            .with_dst(Operand::grf(9, DataType::Uq))
            .with_src(Operand::imm(0, DataType::Uq));
        addr.imm_symbol = Some("lut".into());
        let k = kernel(vec![vec![call, addr]]);
        let mut enc = Encoder::new(Platform::XeHpc, EncoderOpts { enable_timing: true, ..Default::default() });
        let out = enc.encode_kernel(&k).unwrap();
        assert_eq!(
            out.relocations,
            vec![
                Relocation { offset: 12, symbol: "helper".into(), kind: RelocKind::CallPcRel32 },
                Relocation { offset: 24, symbol: "lut".into(), kind: RelocKind::Abs64 },
            ]
        );
        let timings = out.timings.unwrap();
        assert!(timings.setter_calls > 0);
        assert!(timings.phases.iter().any(|(p, _)| *p == "kernel"));
    }
}
