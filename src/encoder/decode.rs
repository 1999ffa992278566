// This module is the inverse of the encoder. It walks a byte stream instruction by
// instruction, using the compact-control bit to find each instruction's size, decodes it
// through the protocol and rebuilds the machine-level Instruction from the fields of its
// format. Branch targets come back as relative byte offsets, since block labels do not
// survive encoding. Any field value with no counterpart in the instruction model is
// reported as a ModelMismatch rather than guessed at.

//! Decoding and disassembly of encoded kernels.

use super::ged::{Field, Format, GedInst, Platform};
use super::instruction::{
    CondMod, DataType, DpasInfo, ExecMask, ExecSize, FlagReg, InstOpts, Instruction, Label, MaskCtrl, Op,
    Operand, PredCtrl, Predicate, RegFile, RegRef, Region, SendDesc, Sfid, SrcMod,
};
use super::EncodeError;
use std::fmt::Write;

struct Reader<'a> {
    ged: &'a GedInst,
    offset: usize,
}

impl Reader<'_> {
    fn get(&self, field: Field) -> Result<u64, EncodeError> {
        self.ged
            .get_field(field)
            .map_err(|status| EncodeError::Decode { offset: self.offset, status })
    }

    fn mismatch(&self, field: Field, value: u64) -> EncodeError {
        EncodeError::ModelMismatch { offset: self.offset, field: field.name(), value }
    }

    fn data_type(&self, field: Field) -> Result<DataType, EncodeError> {
        let v = self.get(field)?;
        DataType::from_code(v).ok_or_else(|| self.mismatch(field, v))
    }

    fn reg_file(&self, field: Field) -> Result<RegFile, EncodeError> {
        let v = self.get(field)?;
        RegFile::from_code(v).ok_or_else(|| self.mismatch(field, v))
    }

    fn reg(&self, file: Field, num: Field, sub_bytes: Option<(Field, DataType)>) -> Result<RegRef, EncodeError> {
        let file = self.reg_file(file)?;
        let num = self.get(num)? as u8;
        let sub = match sub_bytes {
            Some((field, ty)) => (self.get(field)? as u32 / ty.size_bytes()) as u8,
            None => 0,
        };
        Ok(RegRef { file, num, sub })
    }
}

/// Decode a single instruction at the start of `bytes`.
pub fn decode_instruction(platform: Platform, bytes: &[u8], offset: usize) -> Result<Instruction, EncodeError> {
    let ged = GedInst::decode(platform, bytes).map_err(|status| EncodeError::Decode { offset, status })?;
    let r = Reader { ged: &ged, offset };
    let op = Op::from_ged(ged.opcode());
    let format = ged.format();

    let exec_code = r.get(Field::ExecSize)?;
    let exec_size = ExecSize::from_code(exec_code).ok_or_else(|| r.mismatch(Field::ExecSize, exec_code))?;
    let mut inst = Instruction::new(op, exec_size);
    inst.opts = InstOpts { compacted: ged.was_compact(), ..InstOpts::default() };

    let mask = ExecMask {
        offset: r.get(Field::ChannelOffset)? as u8,
        ctrl: if r.get(Field::MaskCtrl)? != 0 { MaskCtrl::NoMask } else { MaskCtrl::Normal },
    };
    let flag = FlagReg { reg: r.get(Field::FlagRegNum)? as u8, sub: r.get(Field::FlagSubRegNum)? as u8 };
    let pred_code = r.get(Field::PredCtrl)?;
    if pred_code != 0 {
        let ctrl = PredCtrl::from_code(pred_code).ok_or_else(|| r.mismatch(Field::PredCtrl, pred_code))?;
        inst.predicate = Some(Predicate { ctrl, inverse: r.get(Field::PredInv)? != 0, flag });
    }
    if inst.predicate.is_some() || mask != ExecMask::default() {
        inst.exec_mask = Some(mask);
    }
    inst.opts.breakpoint = r.get(Field::DebugCtrl)? != 0;

    if matches!(format, Format::Basic | Format::Ternary | Format::Dpas) {
        let cond = r.get(Field::CondModifier)?;
        if cond != 0 {
            let cond = CondMod::from_code(cond).ok_or_else(|| r.mismatch(Field::CondModifier, cond))?;
            inst = inst.with_flag_modifier(cond, flag);
        }
        inst.opts.acc_wr_en = r.get(Field::AccWrCtrl)? != 0;
    }

    match format {
        Format::Basic => decode_basic(&r, &mut inst)?,
        Format::Ternary | Format::Dpas => decode_ternary(&r, &mut inst)?,
        Format::Send => {
            let sfid_code = r.get(Field::Sfid)?;
            let sfid = Sfid::from_code(sfid_code).ok_or_else(|| r.mismatch(Field::Sfid, sfid_code))?;
            inst.send = Some(SendDesc { sfid, desc: r.get(Field::MsgDesc)? as u32, eot: r.get(Field::Eot)? != 0 });
            for (rf, ty, num) in [
                (Field::DstRegFile, Field::DstDataType, Field::DstRegNum),
                (Field::Src0RegFile, Field::Src0DataType, Field::Src0RegNum),
                (Field::Src1RegFile, Field::Src1DataType, Field::Src1RegNum),
            ] {
                let ty = r.data_type(ty)?;
                let operand = Operand::reg(r.reg(rf, num, None)?, ty);
                if inst.dst.is_none() {
                    inst.dst = Some(operand);
                } else {
                    inst.srcs.push(operand);
                }
            }
        }
        Format::Branch => {
            let spec = op.spec();
            if spec.has_dst {
                let ty = r.data_type(Field::DstDataType)?;
                let reg = r.reg(Field::DstRegFile, Field::DstRegNum, Some((Field::DstSubRegNum, ty)))?;
                inst.dst = Some(Operand::reg(reg, ty));
            }
            if spec.num_srcs == 1 {
                let ty = r.data_type(Field::Src0DataType)?;
                let reg = r.reg(Field::Src0RegFile, Field::Src0RegNum, Some((Field::Src0SubRegNum, ty)))?;
                inst.srcs.push(Operand::reg(reg, ty));
            }
            if matches!(op, Op::Jmpi | Op::Call) {
                let jip = ged
                    .get_signed_field(Field::Jip)
                    .map_err(|status| EncodeError::Decode { offset, status })?;
                inst.target = Some(Label::Relative(jip as i32));
            }
        }
        Format::Nop => {}
    }
    Ok(inst)
}

fn decode_basic(r: &Reader<'_>, inst: &mut Instruction) -> Result<(), EncodeError> {
    let dst_ty = r.data_type(Field::DstDataType)?;
    let hs = r.get(Field::DstHorzStride)?;
    let dst_region = Region::default().with_hstride(Region::hstride_from_code(hs));
    let dst = if r.get(Field::DstAddrMode)? != 0 {
        let offset = sign_extend_9(r.get(Field::DstAddrImm)?);
        Operand::indirect(r.get(Field::DstAddrSubReg)? as u8, offset, dst_ty)
    } else {
        Operand::reg(r.reg(Field::DstRegFile, Field::DstRegNum, Some((Field::DstSubRegNum, dst_ty)))?, dst_ty)
    };
    inst.dst = Some(dst.with_region(dst_region));

    let fields = [
        (
            Field::Src0RegFile,
            Field::Src0DataType,
            Field::Src0SubRegNum,
            Field::Src0RegNum,
            Field::Src0SrcMod,
            Field::Src0AddrMode,
            (Field::Src0VertStride, Field::Src0Width, Field::Src0HorzStride),
            (Field::Src0AddrSubReg, Field::Src0AddrImm),
        ),
        (
            Field::Src1RegFile,
            Field::Src1DataType,
            Field::Src1SubRegNum,
            Field::Src1RegNum,
            Field::Src1SrcMod,
            Field::Src1AddrMode,
            (Field::Src1VertStride, Field::Src1Width, Field::Src1HorzStride),
            (Field::Src1AddrSubReg, Field::Src1AddrImm),
        ),
    ];
    let num_srcs = inst.op.spec().num_srcs;
    for (rf, ty, sub, num, modifier, mode, (vs, w, hs), (addr_sub, addr_imm)) in fields.into_iter().take(num_srcs) {
        let ty = r.data_type(ty)?;
        let file = r.reg_file(rf)?;
        if file == RegFile::Imm {
            let value = if ty.is_64bit() { r.get(Field::Imm64)? } else { r.get(Field::Imm)? };
            inst.srcs.push(Operand::imm(value, ty));
            continue;
        }
        let region = Region {
            vstride: Region::vstride_from_code(r.get(vs)?),
            width: Region::width_from_code(r.get(w)?),
            hstride: Region::hstride_from_code(r.get(hs)?),
        };
        let src = if r.get(mode)? != 0 {
            Operand::indirect(r.get(addr_sub)? as u8, sign_extend_9(r.get(addr_imm)?), ty)
        } else {
            Operand::reg(r.reg(rf, num, Some((sub, ty)))?, ty)
        };
        inst.srcs.push(src.with_region(region).with_modifier(SrcMod::from_code(r.get(modifier)?)));
    }
    Ok(())
}

fn decode_ternary(r: &Reader<'_>, inst: &mut Instruction) -> Result<(), EncodeError> {
    let dst_ty = r.data_type(Field::DstDataType)?;
    let dst = r.reg(Field::DstRegFile, Field::DstRegNum, Some((Field::DstSubRegNum, dst_ty)))?;
    inst.dst = Some(Operand::reg(dst, dst_ty));
    for (rf, ty, sub, num, modifier) in [
        (Field::Src0RegFile, Field::Src0DataType, Field::Src0SubRegNum, Field::Src0RegNum, Field::Src0SrcMod),
        (Field::Src1RegFile, Field::Src1DataType, Field::Src1SubRegNum, Field::Src1RegNum, Field::Src1SrcMod),
        (Field::Src2RegFile, Field::Src2DataType, Field::Src2SubRegNum, Field::Src2RegNum, Field::Src2SrcMod),
    ] {
        let ty = r.data_type(ty)?;
        let reg = r.reg(rf, num, Some((sub, ty)))?;
        inst.srcs.push(Operand::reg(reg, ty).with_modifier(SrcMod::from_code(r.get(modifier)?)));
    }
    if inst.op == Op::Dpas {
        inst.dpas = Some(DpasInfo {
            systolic_depth: 1 << r.get(Field::SystolicDepth)?,
            repeat_count: r.get(Field::RepeatCount)? as u8 + 1,
        });
    }
    Ok(())
}

fn sign_extend_9(raw: u64) -> i16 {
    (((raw as u16) << 7) as i16) >> 7
}

/// Decode every instruction in `bytes`, paired with its byte offset.
pub fn decode_kernel(platform: Platform, bytes: &[u8]) -> Result<Vec<(usize, Instruction)>, EncodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let size = GedInst::encoded_size(rest).map_err(|status| EncodeError::Decode { offset, status })?;
        out.push((offset, decode_instruction(platform, rest, offset)?));
        offset += size;
    }
    Ok(out)
}

/// Render `bytes` as assembly text, one instruction per line with its offset.
pub fn disassemble(platform: Platform, bytes: &[u8]) -> Result<String, EncodeError> {
    let mut text = String::new();
    for (offset, inst) in decode_kernel(platform, bytes)? {
        let _ = writeln!(text, "/* {offset:04x} */ {inst}");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::super::instruction::*;
    use super::super::{EncoderOpts, MachineBlock, MachineKernel};
    use super::*;
    use crate::encoder::Encoder;

    fn encode(insts: Vec<Instruction>) -> Vec<u8> {
        let kernel = MachineKernel { name: "t".into(), simd: 16, blocks: vec![MachineBlock { label: "entry".into(), insts }] };
        Encoder::new(Platform::XeHpc, EncoderOpts::default()).encode_kernel(&kernel).unwrap().bits
    }

    #[test]
    fn native_and_compact_instructions_decode_back() {
        let add = Instruction::new(Op::Add, ExecSize::Simd16)
            .with_predicate(Predicate::normal(FlagReg::F0_0))
            .with_dst(Operand::grf(10, DataType::D))
            .with_src(Operand::grf(11, DataType::D))
            .with_src(Operand::imm(5, DataType::D));
        let mov = Instruction::new(Op::Mov, ExecSize::Simd8)
            .with_dst(Operand::grf(2, DataType::F))
            .with_src(Operand::grf(3, DataType::F));
        let bits = encode(vec![add.clone(), mov.clone()]);
        assert_eq!(bits.len(), 24);

        let decoded = decode_kernel(Platform::XeHpc, &bits).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], (0, add));
        let (offset, mov_back) = &decoded[1];
        assert_eq!(*offset, 16);
        assert!(mov_back.opts.compacted);
        let mut mov_back = mov_back.clone();
        mov_back.opts.compacted = false;
        assert_eq!(mov_back, mov);
    }

    #[test]
    fn sends_and_branches_decode() {
        let send = Instruction::new(Op::Send, ExecSize::Simd8)
            .with_exec_mask(ExecMask::NO_MASK)
            .with_dst(Operand::null(DataType::Ud))
            .with_src(Operand::grf(127, DataType::Ud))
            .with_src(Operand::null(DataType::Ud))
            .with_send(SendDesc { sfid: Sfid::ThreadSpawner, desc: 0x0200_0010, eot: true });
        let jmp = Instruction::new(Op::Jmpi, ExecSize::Simd1).with_target(Label::Relative(-16));
        let bits = encode(vec![send.clone(), jmp.clone()]);
        let decoded = decode_kernel(Platform::XeHpc, &bits).unwrap();
        assert_eq!(decoded[0].1, send);
        assert_eq!(decoded[1].1, jmp);

        let text = disassemble(Platform::XeHpc, &bits).unwrap();
        assert!(text.contains("send.ts (8|M0) null<1>:ud r127.0<8;8,1>:ud null<8;8,1>:ud 0x2000010 {NoMask, EOT}"), "{text}");
        assert!(text.contains("/* 0010 */ jmpi (1|M0) -16"), "{text}");
    }

    #[test]
    fn unknown_bits_are_model_mismatches() {
        let mut bits = encode(vec![Instruction::new(Op::Mov, ExecSize::Simd8)
            .with_dst(Operand::grf(2, DataType::D))
            .with_src(Operand::imm(1, DataType::D))]);
        // Force the destination data type to an undefined code.
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&bits[..16]);
        let mut word = u128::from_le_bytes(raw);
        word |= 0xf << 37;
        bits[..16].copy_from_slice(&word.to_le_bytes());
        assert!(matches!(
            decode_kernel(Platform::XeHpc, &bits),
            Err(EncodeError::ModelMismatch { field: "Dst.DataType", value: 15, .. })
        ));
    }

    #[test]
    fn truncated_stream_fails() {
        assert!(matches!(
            decode_kernel(Platform::XeHpc, &[0x40, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(EncodeError::Decode { offset: 0, .. })
        ));
    }
}
