// This test suite checks that the bits the encoder produces describe the instructions the
// lowering produced. Each kernel is taken through the default pass pipeline by the driver,
// lowered again from the resulting module and annotations, encoded with and without
// compaction, and decoded instruction by instruction. The decoded stream must equal the
// machine listing in every field the bits carry: opcode, execution size and mask,
// predicate, flag modifier, every operand with its region and modifier, send messages and
// systolic geometry. Only block labels, symbols and encoding options are left out; branch
// and call offsets are checked separately against the recorded block offsets and
// relocations. A hand-built stream covers the operand forms lowering never emits.

//! Encode/decode agreement for lowered kernels.

use xe_codegen::encoder::decode::decode_kernel;
use xe_codegen::encoder::instruction::{
    CondMod, DataType, ExecMask, ExecSize, FlagReg, InstOpts, Label, MaskCtrl, Operand, PredCtrl, Predicate, RegRef,
    Region, SendDesc, Sfid, SrcMod,
};
use xe_codegen::encoder::{
    lower_kernel, EncodeError, EncodedKernel, Encoder, EncoderOpts, MachineBlock, MachineKernel, Op, RelocKind,
};
use xe_codegen::ir::{parse_module, DataLayout};
use xe_codegen::metadata::{Annotation, AnnotationTable, EntityId, KernelInternal};
use xe_codegen::{compile, CompileOptions, Instruction, Platform};

const BRANCHY: &str = "
    kernel @k(%out: ptr1, %n: i32, %s: f32) simd16 {
    entry:
      %lid = lane_id : i32
      br ^head
    head:
      %i = phi [i32 0, ^entry], [%i2, ^head] : i32
      %i2 = add %i, i32 1 : i32
      %c = cmp.lt %i2, %n : i1
      condbr %c, ^head, ^tail
    tail:
      %x = add %lid, %i2 : i32
      %y = mul %x, i32 3 : i32
      %f = add %s, f32 1.5 : f32
      store %y, %out
      store %f, %out
      ret
    }";

const CALLER: &str = "
    declare @ext(%x: i32) -> i32
    kernel @k(%a: i32) simd8 {
    entry:
      %r = call @ext(%a) : i32
      %s = add %r, i32 7 : i32
      ret
    }";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run the pipeline on `src` and lower kernel `k` of the result.
fn lowered(src: &str, options: &CompileOptions) -> MachineKernel {
    let module = parse_module("t", src).unwrap();
    let out = compile(module, options.clone()).unwrap();
    assert!(out.is_complete(), "{:?}", out.failures);
    let id = out.module.function_by_name("k").unwrap();
    lower_kernel(&out.module, id, &out.annotations, &out.options).unwrap()
}

fn encode(kernel: &MachineKernel, platform: Platform, compact: bool) -> EncodedKernel {
    let opts = EncoderOpts { auto_compact: compact, explicit_compact_miss_is_warning: false, enable_timing: false };
    Encoder::new(platform, opts).encode_kernel(kernel).unwrap()
}

/// The instruction as its bits describe it: labels and symbols become offsets filled in
/// later, and encoding options are not instruction fields.
fn encodable(inst: &Instruction) -> Instruction {
    Instruction { target: None, imm_symbol: None, opts: InstOpts::default(), ..inst.clone() }
}

fn assert_agrees(expected: &Instruction, actual: &Instruction) {
    assert_eq!(encodable(actual), encodable(expected), "{expected}");
    match &expected.target {
        Some(Label::Relative(jip)) => assert_eq!(actual.target, Some(Label::Relative(*jip)), "{expected}"),
        Some(_) => assert!(matches!(actual.target, Some(Label::Relative(_))), "{expected}"),
        None => assert_eq!(actual.target, None, "{expected}"),
    }
}

/// Lower kernel `k` of `src` with hand-made annotations and an empty frame. Kernels that
/// call external functions have no stack amount after the pipeline, so they cannot go
/// through the driver.
fn lowered_standalone(src: &str, options: &CompileOptions) -> MachineKernel {
    let module = parse_module("t", src).unwrap();
    let k = module.function_by_name("k").unwrap();
    let mut table = AnnotationTable::new();
    let md = KernelInternal::build(k, module.func(k), &DataLayout::default());
    table.insert(EntityId::Function(k), Annotation::KernelInternal(md));
    table.insert(EntityId::Function(k), Annotation::StackAmount(0));
    lower_kernel(&module, k, &table, options).unwrap()
}

fn check_roundtrip(kernel: &MachineKernel, options: &CompileOptions) {
    let expected: Vec<&Instruction> = kernel.instructions().collect();
    for compact in [false, true] {
        let encoded = encode(kernel, options.platform, compact);
        let decoded = decode_kernel(options.platform, &encoded.bits).unwrap();
        assert_eq!(decoded.len(), expected.len());
        assert_eq!(encoded.instruction_count, expected.len());
        if !compact {
            assert_eq!(encoded.compacted_count, 0);
            assert_eq!(encoded.bits.len(), 16 * expected.len());
        }
        for ((_, actual), expected) in decoded.iter().zip(&expected) {
            assert_agrees(expected, actual);
            assert_eq!(actual.opts.compacted, compact && actual.opts.compacted);
        }
    }
}

#[test]
fn branchy_kernel_round_trips() {
    init();
    let options = CompileOptions::new();
    check_roundtrip(&lowered(BRANCHY, &options), &options);
}

#[test]
fn round_trip_holds_on_every_platform() {
    init();
    for platform in [Platform::Gen9, Platform::Gen11, Platform::XeLp, Platform::XeHpc] {
        let options = CompileOptions::new().with_platform(platform);
        check_roundtrip(&lowered(BRANCHY, &options), &options);
    }
}

#[test]
fn uniform_mad_sources_are_broadcast_before_use() {
    init();
    let options = CompileOptions::new();
    let kernel = lowered(
        "kernel @k(%a: f32, %b: f32, %c: f32, %out: ptr1) simd16 {
        entry:
          %m = mad %a, %b, %c : f32
          store %m, %out
          ret
        }",
        &options,
    );
    let insts: Vec<&Instruction> = kernel.instructions().collect();
    let mad = insts.iter().position(|i| i.op == Op::Mad).unwrap();
    assert!(insts[mad].srcs.iter().all(|src| src.region == Region::default()));
    for src in &insts[mad].srcs {
        let copy = insts[..mad]
            .iter()
            .find(|i| i.op == Op::Mov && i.dst.and_then(|d| d.reg_ref()) == src.reg_ref())
            .unwrap();
        assert_eq!(copy.exec_size, Some(ExecSize::Simd16));
        assert_eq!(copy.srcs[0].region, Region::SCALAR);
    }
    check_roundtrip(&kernel, &options);
}

fn single_block(simd: u32, insts: Vec<Instruction>) -> MachineKernel {
    MachineKernel { name: "k".into(), simd, blocks: vec![MachineBlock { label: "entry".into(), insts }] }
}

/// One instruction of every format, with the operand forms lowering does not produce.
fn hand_built() -> Vec<Instruction> {
    let f1_1 = FlagReg { reg: 1, sub: 1 };
    vec![
        Instruction::new(Op::Add, ExecSize::Simd8)
            .with_dst(Operand::indirect(3, -32, DataType::D).with_region(Region::default().with_hstride(2)))
            .with_src(Operand::indirect(1, -256, DataType::D).with_region(Region { vstride: 4, width: 4, hstride: 1 }))
            .with_src(Operand::imm(0x8000_0001, DataType::D)),
        Instruction::new(Op::Mov, ExecSize::Simd1)
            .with_exec_mask(ExecMask::NO_MASK)
            .with_dst(Operand::reg(RegRef::grf(6, 1), DataType::Q))
            .with_src(Operand::imm(0x0123_4567_89ab_cdef, DataType::Q)),
        Instruction::new(Op::Cmp, ExecSize::Simd16)
            .with_dst(Operand::null(DataType::F))
            .with_src(
                Operand::reg(RegRef::grf(9, 3), DataType::F).with_region(Region::SCALAR).with_modifier(SrcMod::Abs),
            )
            .with_src(Operand::grf(10, DataType::F).with_region(Region { vstride: 16, width: 8, hstride: 2 }))
            .with_flag_modifier(CondMod::Ge, f1_1),
        Instruction::new(Op::Sel, ExecSize::Simd8)
            .with_predicate(Predicate { ctrl: PredCtrl::Normal, inverse: true, flag: f1_1 })
            .with_exec_mask(ExecMask { offset: 2, ctrl: MaskCtrl::Normal })
            .with_dst(Operand::reg(RegRef::grf(12, 4), DataType::W))
            .with_src(Operand::grf(13, DataType::W).with_modifier(SrcMod::Neg))
            .with_src(Operand::grf(14, DataType::W)),
        Instruction::new(Op::Mad, ExecSize::Simd16)
            .with_dst(Operand::reg(RegRef::grf(20, 0), DataType::F))
            .with_src(Operand::reg(RegRef::grf(21, 0), DataType::F).with_modifier(SrcMod::NegAbs))
            .with_src(Operand::reg(RegRef::grf(23, 4), DataType::F))
            .with_src(Operand::reg(RegRef::grf(25, 0), DataType::F).with_modifier(SrcMod::Neg))
            .with_flag_modifier(CondMod::Lt, FlagReg::F0_0),
        Instruction::new(Op::Dpas, ExecSize::Simd8)
            .with_dst(Operand::grf(30, DataType::F))
            .with_src(Operand::grf(30, DataType::F))
            .with_src(Operand::grf(40, DataType::Hf))
            .with_src(Operand::grf(50, DataType::Hf))
            .with_dpas(4, 2),
        Instruction::new(Op::Send, ExecSize::Simd16)
            .with_dst(Operand::grf(60, DataType::D))
            .with_src(Operand::grf(62, DataType::Uq))
            .with_src(Operand::null(DataType::Ud))
            .with_send(SendDesc { sfid: Sfid::Ugm, desc: 0x0220_0580, eot: false }),
        Instruction::new(Op::Jmpi, ExecSize::Simd1)
            .with_predicate(Predicate { ctrl: PredCtrl::Any, inverse: true, flag: FlagReg::F0_0 })
            .with_target(Label::Relative(-48)),
        Instruction::new(Op::Call, ExecSize::Simd1)
            .with_exec_mask(ExecMask::NO_MASK)
            .with_dst(Operand::reg(RegRef::grf(120, 3), DataType::Ud))
            .with_target(Label::Relative(64)),
        Instruction::new(Op::Ret, ExecSize::Simd1).with_src(Operand::reg(RegRef::grf(120, 3), DataType::Ud)),
    ]
}

#[test]
fn hand_built_instructions_round_trip_exactly() {
    init();
    let expected = hand_built();
    let kernel = single_block(16, expected.clone());
    for compact in [false, true] {
        let encoded = encode(&kernel, Platform::XeHpc, compact);
        let decoded = decode_kernel(Platform::XeHpc, &encoded.bits).unwrap();
        assert_eq!(decoded.len(), expected.len());
        for ((_, actual), expected) in decoded.iter().zip(&expected) {
            assert_agrees(expected, actual);
        }
    }
}

#[test]
fn fields_without_encoding_are_rejected() {
    init();
    let opts = EncoderOpts::default();
    let scalar_mad = Instruction::new(Op::Mad, ExecSize::Simd8)
        .with_dst(Operand::grf(20, DataType::F))
        .with_src(Operand::grf(21, DataType::F).with_region(Region::SCALAR))
        .with_src(Operand::grf(22, DataType::F))
        .with_src(Operand::grf(23, DataType::F));
    let offset_send = Instruction::new(Op::Send, ExecSize::Simd8)
        .with_dst(Operand::reg(RegRef::grf(60, 2), DataType::Ud))
        .with_src(Operand::grf(61, DataType::Ud))
        .with_src(Operand::null(DataType::Ud))
        .with_send(SendDesc { sfid: Sfid::Ugm, desc: 0, eot: false });
    let strided_dst = Instruction::new(Op::Mov, ExecSize::Simd8)
        .with_dst(Operand::grf(2, DataType::D).with_region(Region::SCALAR))
        .with_src(Operand::grf(3, DataType::D));
    for inst in [scalar_mad, offset_send, strided_dst] {
        let err = Encoder::new(Platform::XeHpc, opts).encode_kernel(&single_block(8, vec![inst])).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidOperand { .. }), "{err}");
    }
}

#[test]
fn compaction_shrinks_the_kernel() {
    init();
    let options = CompileOptions::new();
    let kernel = lowered(BRANCHY, &options);
    let native = encode(&kernel, options.platform, false);
    let compacted = encode(&kernel, options.platform, true);
    assert_eq!(compacted.bits.len(), native.bits.len() - 8 * compacted.compacted_count);
    let decoded = decode_kernel(options.platform, &compacted.bits).unwrap();
    assert_eq!(decoded.iter().filter(|(_, i)| i.opts.compacted).count(), compacted.compacted_count);
}

#[test]
fn branch_offsets_land_on_block_starts() {
    init();
    let options = CompileOptions::new();
    let kernel = lowered(BRANCHY, &options);
    let encoded = encode(&kernel, options.platform, true);
    let decoded = decode_kernel(options.platform, &encoded.bits).unwrap();
    assert_eq!(encoded.block_offsets.len(), kernel.blocks.len());

    let mut jumps = 0;
    for (offset, inst) in &decoded {
        if let Some(Label::Relative(jip)) = inst.target {
            let landing = (*offset as i64 + jip as i64) as u32;
            assert!(encoded.block_offsets.contains(&landing), "jump at {offset} lands at {landing}");
            jumps += 1;
        }
    }
    assert!(jumps >= 2);
}

#[test]
fn calls_to_external_functions_are_relocated() {
    init();
    let options = CompileOptions::new();
    let kernel = lowered_standalone(CALLER, &options);
    check_roundtrip(&kernel, &options);

    let encoded = encode(&kernel, options.platform, true);
    let call = encoded.relocations.iter().find(|r| r.symbol == "ext").unwrap();
    assert_eq!(call.kind, RelocKind::CallPcRel32);
    let decoded = decode_kernel(options.platform, &encoded.bits).unwrap();
    let call_offset = decoded.iter().find(|(_, i)| i.op == Op::Call).map(|(o, _)| *o as u64).unwrap();
    assert!(call.offset >= call_offset && call.offset < call_offset + 16);
}
