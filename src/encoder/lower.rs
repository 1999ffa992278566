// This module lowers a kernel graph kernel into a machine kernel. Registers are assigned
// from the kernel's ABI metadata: r0 is the thread header, the explicit argument payload
// starts at r1 with every argument read as a scalar region at its linearized byte offset,
// and the per-lane ids follow at the implicit-argument offset. Every other value gets fresh
// registers from a bump allocator, one full SIMD-wide block per vector component; r127 is
// kept for the end-of-thread message. Constants become immediates where the instruction
// model allows them and are materialized with mov elsewhere. Ternary instructions have no
// region fields, so their uniform sources are broadcast with mov first. Branch conditions
// and selects go through a cmp that sets flag f0.0. A branch is a scalar jmpi, so a
// condition that differs between lanes fails the kernel instead of sending every lane down
// one edge. Phi copies are placed at the end of predecessors; when the predecessor ends in
// a conditional branch the copies move to an edge block appended after the graph's blocks,
// so they run only on that edge. Loads and stores become UGM sends whose data size honors
// the block-type override. The entry block starts with a prologue that sets up the private
// frame when the kernel needs stack, and materializes the address of every global the
// kernel references; `ret` ends the thread with an EOT send. Calls may only reach
// declarations, since no other function body is emitted. Missing kernel metadata or stack
// amount fails the kernel.

//! Translation of kernel graph kernels into machine kernels.

use super::instruction::{
    CondMod, DataType, ExecMask, ExecSize, FlagReg, Instruction, Label, Op, Operand, Predicate, RegRef, Region,
    SendDesc, Sfid, SrcMod, GRF_BYTES, GRF_COUNT,
};
use super::{MachineBlock, MachineKernel};
use crate::analysis::{DivergenceInfo, PostDomTree};
use crate::core::{CompileError, CompileOptions, CompileResult};
use crate::ir::{
    BlockId, CmpPred, Constant, DataLayout, FuncId, Function, GlobalId, Inst, InstId, Module, Opcode, ScalarType,
    Type, Value,
};
use crate::metadata::{AnnotationTable, BlockType, KernelInternal};
use crate::passes::stack_usage::FrameLayout;
use hashbrown::HashMap;
use log::{debug, trace};

/// Register holding the copy of the thread header sent with the end-of-thread message.
pub const EOT_REG: u8 = (GRF_COUNT - 1) as u8;

/// End-of-thread message descriptor for the thread spawner.
pub const EOT_DESC: u32 = 0x0200_0010;

const UGM_LOAD: u32 = 0x00;
const UGM_STORE: u32 = 0x04;

/// Vector values wider than this cannot be laid out in the fixed-width register path.
const MAX_VECTOR_COMPONENTS: u32 = 16;

/// UGM message descriptor.
fn ugm_desc(opcode: u32, addr64: bool, block: BlockType, response_regs: u32, payload_regs: u32) -> u32 {
    let addr_size = if addr64 { 3 } else { 2 };
    opcode | addr_size << 7 | block.code() << 9 | response_regs << 20 | payload_regs << 25
}

fn scalar_data_type(s: ScalarType) -> DataType {
    match s {
        ScalarType::I1 | ScalarType::I16 => DataType::W,
        ScalarType::I8 => DataType::B,
        ScalarType::I32 => DataType::D,
        ScalarType::I64 => DataType::Q,
        ScalarType::F16 => DataType::Hf,
        ScalarType::F32 => DataType::F,
        ScalarType::F64 => DataType::Df,
    }
}

/// Type of an argument as laid out in the payload; booleans occupy one byte there.
fn payload_data_type(s: ScalarType) -> DataType {
    match s {
        ScalarType::I1 => DataType::Ub,
        other => scalar_data_type(other),
    }
}

fn cond_mod(pred: CmpPred) -> CondMod {
    match pred {
        CmpPred::Eq => CondMod::Eq,
        CmpPred::Ne => CondMod::Ne,
        CmpPred::Lt => CondMod::Lt,
        CmpPred::Le => CondMod::Le,
        CmpPred::Gt => CondMod::Gt,
        CmpPred::Ge => CondMod::Ge,
    }
}

fn machine_op(op: Opcode) -> Option<Op> {
    Some(match op {
        Opcode::Add | Opcode::Sub => Op::Add,
        Opcode::Mul => Op::Mul,
        Opcode::And => Op::And,
        Opcode::Or => Op::Or,
        Opcode::Xor => Op::Xor,
        Opcode::Shl => Op::Shl,
        Opcode::Shr => Op::Shr,
        _ => return None,
    })
}

/// Where one component of a value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Loc {
    reg: RegRef,
    ty: DataType,
    /// One value for all lanes, read with a scalar region.
    uniform: bool,
}

impl Loc {
    fn src(self) -> Operand {
        let region = if self.uniform { Region::SCALAR } else { Region::default() };
        Operand::reg(self.reg, self.ty).with_region(region)
    }

    fn dst(self) -> Operand {
        Operand::reg(self.reg, self.ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Src {
    Loc(Loc),
    Imm(u64, DataType),
}

impl Src {
    fn operand(self) -> Operand {
        match self {
            Src::Loc(loc) => loc.src(),
            Src::Imm(value, ty) => Operand::imm(value, ty),
        }
    }

    fn ty(self) -> DataType {
        match self {
            Src::Loc(loc) => loc.ty,
            Src::Imm(_, ty) => ty,
        }
    }
}

/// Immediate for a scalar constant. Booleans use all-ones for true, as cmp writes them.
fn immediate(s: ScalarType, bits: u64) -> Src {
    let value = match s {
        ScalarType::I1 if bits & 1 != 0 => 0xffff,
        ScalarType::I1 => 0,
        _ => bits & s.mask(),
    };
    Src::Imm(value, scalar_data_type(s))
}

fn negate_immediate(value: u64, ty: DataType) -> u64 {
    let bits = ty.size_bytes() * 8;
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    match ty {
        DataType::F | DataType::Df | DataType::Hf => value ^ (1u64 << (bits - 1)),
        _ => value.wrapping_neg() & mask,
    }
}

struct FunctionLowering<'a> {
    module: &'a Module,
    func: &'a Function,
    md: &'a KernelInternal,
    dl: DataLayout,
    annotations: &'a AnnotationTable,
    func_id: FuncId,
    divergence: DivergenceInfo,
    exec: ExecSize,
    lanes: u32,
    next_reg: u32,
    /// GRF being filled with uniform scalars, and the bytes already used in it.
    scalar_slot: Option<(u32, u32)>,
    values: HashMap<InstId, Vec<Loc>>,
    call_blocks: HashMap<InstId, u8>,
    globals: HashMap<GlobalId, Loc>,
    frame: FrameLayout,
    fp: Option<Loc>,
    insts: Vec<Instruction>,
    edges: Vec<MachineBlock>,
}

impl<'a> FunctionLowering<'a> {
    fn contract(&self, reason: impl Into<String>) -> CompileError {
        CompileError::Contract { reason: format!("{}: {}", self.func.name, reason.into()) }
    }

    fn unsupported(&self, op: Opcode) -> CompileError {
        CompileError::UnsupportedInstruction { opcode: op.mnemonic(), function: self.func.name.clone() }
    }

    fn ptr_type(&self) -> DataType {
        if self.dl.pointer_bits == 32 {
            DataType::Ud
        } else {
            DataType::Uq
        }
    }

    fn components(&self, ty: &Type) -> CompileResult<Vec<DataType>> {
        match ty {
            Type::Void => Ok(Vec::new()),
            Type::Scalar(s) => Ok(vec![scalar_data_type(*s)]),
            Type::Ptr(_) => Ok(vec![self.ptr_type()]),
            Type::Vector(s, n) if *n <= MAX_VECTOR_COMPONENTS => Ok(vec![scalar_data_type(*s); *n as usize]),
            Type::Vector(..) => Err(self.contract(format!("vector type {ty} is too wide for the register path"))),
            Type::Array(..) => Err(self.contract(format!("aggregate type {ty} cannot live in registers"))),
        }
    }

    // ------------------------------------------------------------ registers

    fn regs_for(&self, ty: DataType) -> u32 {
        (self.lanes * ty.size_bytes()).div_ceil(GRF_BYTES)
    }

    fn alloc_regs(&mut self, count: u32) -> CompileResult<u8> {
        let base = self.next_reg;
        let end = base + count.max(1);
        if end > EOT_REG as u32 {
            return Err(CompileError::RegisterPressure { kernel: self.func.name.clone(), needed: end + 1 });
        }
        self.next_reg = end;
        Ok(base as u8)
    }

    fn alloc_value(&mut self, ty: DataType) -> CompileResult<Loc> {
        let reg = self.alloc_regs(self.regs_for(ty))?;
        Ok(Loc { reg: RegRef::grf(reg, 0), ty, uniform: false })
    }

    fn alloc_scalar(&mut self, ty: DataType) -> CompileResult<Loc> {
        let size = ty.size_bytes();
        let (reg, start) = match self.scalar_slot {
            Some((reg, used)) if used.div_ceil(size) * size + size <= GRF_BYTES => (reg, used.div_ceil(size) * size),
            _ => (self.alloc_regs(1)? as u32, 0),
        };
        self.scalar_slot = Some((reg, start + size));
        Ok(Loc { reg: RegRef::grf(reg as u8, (start / size) as u8), ty, uniform: true })
    }

    /// Consecutive full-width locations starting at `base`.
    fn block_locs(&self, base: u8, types: &[DataType]) -> Vec<Loc> {
        let mut reg = base as u32;
        types
            .iter()
            .map(|ty| {
                let loc = Loc { reg: RegRef::grf(reg as u8, 0), ty: *ty, uniform: false };
                reg += self.regs_for(*ty);
                loc
            })
            .collect()
    }

    fn arg_locs(&self, arg: u32) -> CompileResult<Vec<Loc>> {
        let mut slots = self.md.slots_of(arg);
        let slot = slots.next().ok_or_else(|| self.contract(format!("argument {arg} has no payload slot")))?;
        if slots.next().is_some() {
            return Err(self.contract(format!("aggregate argument {arg} used as a value")));
        }
        let (count, ty) = match &slot.ty {
            Type::Scalar(s) => (1, payload_data_type(*s)),
            Type::Ptr(_) => (1, self.ptr_type()),
            Type::Vector(s, n) => (*n, payload_data_type(*s)),
            other => return Err(self.contract(format!("argument {arg} of type {other} used as a value"))),
        };
        Ok((0..count)
            .map(|k| {
                let byte = slot.offset + k * ty.size_bytes();
                let reg = RegRef::grf((1 + byte / GRF_BYTES) as u8, ((byte % GRF_BYTES) / ty.size_bytes()) as u8);
                Loc { reg, ty, uniform: true }
            })
            .collect())
    }

    fn lane_ids(&self) -> Loc {
        let reg = 1 + self.md.implicit_arg_offset / GRF_BYTES;
        Loc { reg: RegRef::grf(reg as u8, 0), ty: DataType::Uw, uniform: false }
    }

    /// Give every value-producing instruction its registers before any use is lowered.
    fn assign_registers(&mut self) -> CompileResult<()> {
        let func = self.func;
        for (_, id) in func.live_insts() {
            let inst = func.inst(id);
            match inst.op {
                Opcode::Alloca => {
                    let loc = self.alloc_scalar(self.ptr_type())?;
                    self.values.insert(id, vec![loc]);
                }
                Opcode::Call => {
                    let mut arg_regs = 0;
                    for v in &inst.operands {
                        for ty in self.components(&func.value_type(self.module, v))? {
                            arg_regs += self.regs_for(ty);
                        }
                    }
                    let ret = self.components(&inst.ty)?;
                    let ret_regs: u32 = ret.iter().map(|ty| self.regs_for(*ty)).sum();
                    let base = self.alloc_regs(arg_regs.max(ret_regs))?;
                    self.call_blocks.insert(id, base);
                    let locs = self.block_locs(base, &ret);
                    self.values.insert(id, locs);
                }
                _ if !inst.ty.is_void() => {
                    let locs = self
                        .components(&inst.ty)?
                        .into_iter()
                        .map(|ty| self.alloc_value(ty))
                        .collect::<CompileResult<Vec<_>>>()?;
                    self.values.insert(id, locs);
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ operands

    fn sources(&self, value: &Value) -> CompileResult<Vec<Src>> {
        let locs = match value {
            Value::Inst(id) => {
                self.values.get(id).cloned().ok_or_else(|| self.contract(format!("{id} produces no value")))?
            }
            Value::Arg(arg) => self.arg_locs(*arg)?,
            Value::Global(g) => vec![*self
                .globals
                .get(g)
                .ok_or_else(|| self.contract(format!("address of {g} was not materialized")))?],
            Value::Const(c) => return self.const_sources(c),
        };
        Ok(locs.into_iter().map(Src::Loc).collect())
    }

    fn const_sources(&self, c: &Constant) -> CompileResult<Vec<Src>> {
        match c {
            Constant::Scalar { ty, bits } => Ok(vec![immediate(*ty, *bits)]),
            Constant::Vector { elem, lanes } => Ok(lanes.iter().map(|lane| immediate(*elem, *lane)).collect()),
            Constant::Zero(ty) | Constant::Undef(ty) => {
                Ok(self.components(ty)?.into_iter().map(|ty| Src::Imm(0, ty)).collect())
            }
            Constant::Array { .. } => Err(self.contract("array constants cannot be instruction operands")),
        }
    }

    fn operand_sources(&self, inst: &Inst, index: usize) -> CompileResult<Vec<Src>> {
        let value = inst
            .operands
            .get(index)
            .ok_or_else(|| self.contract(format!("'{}' is missing operand {index}", inst.op.mnemonic())))?;
        self.sources(value)
    }

    /// Component `k` of a value, broadcasting scalars over vectors.
    fn component(sources: &[Src], k: usize) -> Src {
        sources.get(k).or_else(|| sources.first()).copied().unwrap_or(Src::Imm(0, DataType::D))
    }

    fn in_register(&mut self, src: Src) -> CompileResult<Loc> {
        match src {
            Src::Loc(loc) => Ok(loc),
            Src::Imm(_, ty) => {
                let tmp = self.alloc_value(ty)?;
                self.copy(tmp, src);
                Ok(tmp)
            }
        }
    }

    /// A per-lane copy of `src`. Ternary instructions have no region fields, so uniform values
    /// are broadcast before they can be read there.
    fn full_width(&mut self, src: Src) -> CompileResult<Loc> {
        match src {
            Src::Loc(loc) if !loc.uniform => Ok(loc),
            other => {
                let tmp = self.alloc_value(other.ty())?;
                self.copy(tmp, other);
                Ok(tmp)
            }
        }
    }

    /// A source usable in the last slot of `op`: 64-bit immediates only stay on mov.
    fn last_source(&mut self, src: Src, op: Op) -> CompileResult<Src> {
        match src {
            Src::Imm(_, ty) if ty.is_64bit() && op != Op::Mov => Ok(Src::Loc(self.in_register(src)?)),
            other => Ok(other),
        }
    }

    // ------------------------------------------------------------ emission

    fn emit(&mut self, inst: Instruction) {
        trace!("  {}", inst);
        self.insts.push(inst);
    }

    fn exec_for(&self, dst: Loc) -> (ExecSize, Option<ExecMask>) {
        if dst.uniform {
            (ExecSize::Simd1, Some(ExecMask::NO_MASK))
        } else {
            (self.exec, None)
        }
    }

    fn copy(&mut self, dst: Loc, src: Src) {
        let (exec, mask) = self.exec_for(dst);
        let mut mov = Instruction::new(Op::Mov, exec).with_dst(dst.dst()).with_src(src.operand());
        mov.exec_mask = mask;
        self.emit(mov);
    }

    fn jump(&mut self, target: usize) {
        self.emit(Instruction::new(Op::Jmpi, ExecSize::Simd1).with_exec_mask(ExecMask::NO_MASK).with_target(Label::Block(target)));
    }

    /// `cmp.ne f0.0 null value 0`: sets the flag for lanes where `value` is true.
    fn flag_from(&mut self, value: Loc) {
        self.emit(
            Instruction::new(Op::Cmp, self.exec)
                .with_dst(Operand::null(DataType::W))
                .with_src(value.src())
                .with_src(Operand::imm(0, value.ty))
                .with_flag_modifier(CondMod::Ne, FlagReg::F0_0),
        );
    }

    fn prologue(&mut self, stack_amount: u64) -> CompileResult<()> {
        if stack_amount > 0 {
            let fp = self.alloc_scalar(DataType::Uq)?;
            let sp = self.alloc_scalar(DataType::Uq)?;
            // Private memory base from the thread header.
            let header = Loc { reg: RegRef::grf(0, 1), ty: DataType::Uq, uniform: true };
            self.copy(fp, Src::Loc(header));
            let own = u32::try_from(self.frame.size)
                .map_err(|_| self.contract(format!("frame of {} bytes does not fit an immediate", self.frame.size)))?;
            self.emit(
                Instruction::new(Op::Add, ExecSize::Simd1)
                    .with_exec_mask(ExecMask::NO_MASK)
                    .with_dst(sp.dst())
                    .with_src(fp.src())
                    .with_src(Operand::imm(own as u64, DataType::D)),
            );
            self.fp = Some(fp);
        }

        let func = self.func;
        let mut referenced: Vec<GlobalId> = Vec::new();
        for (_, id) in func.live_insts() {
            for v in &func.inst(id).operands {
                if let Value::Global(g) = v {
                    if !referenced.contains(g) {
                        referenced.push(*g);
                    }
                }
            }
        }
        for g in referenced {
            let loc = self.alloc_scalar(self.ptr_type())?;
            let mut mov = Instruction::new(Op::Mov, ExecSize::Simd1)
                .with_exec_mask(ExecMask::NO_MASK)
                .with_dst(loc.dst())
                .with_src(Operand::imm(0, DataType::Uq));
            mov.imm_symbol = Some(self.module.global(g).name.clone());
            self.emit(mov);
            self.globals.insert(g, loc);
        }
        Ok(())
    }

    fn phi_copies(&mut self, pred: BlockId, succ: BlockId) -> CompileResult<()> {
        let func = self.func;
        let mut copies: Vec<(Loc, Src)> = Vec::new();
        for &id in &func.block(succ).insts {
            let inst = func.inst(id);
            if inst.op != Opcode::Phi {
                continue;
            }
            let slot = inst.blocks.iter().position(|b| *b == pred).ok_or_else(|| {
                self.contract(format!("phi {id} has no incoming value from {}", func.block(pred).name))
            })?;
            let dsts = self.values.get(&id).cloned().unwrap_or_default();
            let srcs = self.sources(&inst.operands[slot])?;
            copies.extend(dsts.into_iter().enumerate().map(|(k, dst)| (dst, Self::component(&srcs, k))));
        }
        if copies.len() > 1 {
            // Every phi reads its incoming value before any phi register is written.
            let mut staged = Vec::with_capacity(copies.len());
            for (dst, src) in copies {
                let tmp = self.alloc_value(dst.ty)?;
                self.copy(tmp, src);
                staged.push((dst, tmp));
            }
            for (dst, tmp) in staged {
                self.copy(dst, Src::Loc(tmp));
            }
        } else {
            for (dst, src) in copies {
                self.copy(dst, src);
            }
        }
        Ok(())
    }

    fn has_phis(&self, block: BlockId) -> bool {
        self.func.block(block).insts.iter().any(|id| self.func.inst(*id).op == Opcode::Phi)
    }

    /// Machine block to jump to for the edge `pred -> succ`.
    fn edge_target(&mut self, pred: BlockId, succ: BlockId) -> CompileResult<usize> {
        if !self.has_phis(succ) {
            return Ok(succ.index());
        }
        let outer = std::mem::take(&mut self.insts);
        let copies = self.phi_copies(pred, succ);
        self.jump(succ.index());
        let body = std::mem::replace(&mut self.insts, outer);
        copies?;
        let index = self.func.blocks.len() + self.edges.len();
        let label = format!("{}.{}", self.func.block(pred).name, self.func.block(succ).name);
        self.edges.push(MachineBlock { label, insts: body });
        Ok(index)
    }

    // ------------------------------------------------------------ instructions

    fn lower_inst(&mut self, block: BlockId, id: InstId) -> CompileResult<()> {
        let func = self.func;
        let inst = func.inst(id);
        let dsts = self.values.get(&id).cloned().unwrap_or_default();
        match inst.op {
            op if op.is_binary() => self.lower_binary(inst, &dsts),
            Opcode::Cmp(pred) => {
                let a = self.operand_sources(inst, 0)?;
                let b = self.operand_sources(inst, 1)?;
                for (k, dst) in dsts.iter().enumerate() {
                    let lhs = self.in_register(Self::component(&a, k))?;
                    let rhs = self.last_source(Self::component(&b, k), Op::Cmp)?;
                    self.emit(
                        Instruction::new(Op::Cmp, self.exec)
                            .with_dst(dst.dst())
                            .with_src(lhs.src())
                            .with_src(rhs.operand())
                            .with_flag_modifier(cond_mod(pred), FlagReg::F0_0),
                    );
                }
                Ok(())
            }
            Opcode::Select => {
                let cond = self.operand_sources(inst, 0)?;
                let on_true = self.operand_sources(inst, 1)?;
                let on_false = self.operand_sources(inst, 2)?;
                for (k, dst) in dsts.iter().enumerate() {
                    let (t, f) = (Self::component(&on_true, k), Self::component(&on_false, k));
                    match Self::component(&cond, k) {
                        Src::Imm(c, _) => self.copy(*dst, if c != 0 { t } else { f }),
                        Src::Loc(c) => {
                            self.flag_from(c);
                            let t = self.in_register(t)?;
                            let f = self.last_source(f, Op::Sel)?;
                            self.emit(
                                Instruction::new(Op::Sel, self.exec)
                                    .with_predicate(Predicate::normal(FlagReg::F0_0))
                                    .with_dst(dst.dst())
                                    .with_src(t.src())
                                    .with_src(f.operand()),
                            );
                        }
                    }
                }
                Ok(())
            }
            Opcode::Mad => {
                let srcs = [self.operand_sources(inst, 0)?, self.operand_sources(inst, 1)?, self.operand_sources(inst, 2)?];
                for (k, dst) in dsts.iter().enumerate() {
                    // mad computes src0 + src1 * src2.
                    let addend = self.full_width(Self::component(&srcs[2], k))?;
                    let a = self.full_width(Self::component(&srcs[0], k))?;
                    let b = self.full_width(Self::component(&srcs[1], k))?;
                    self.emit(
                        Instruction::new(Op::Mad, self.exec)
                            .with_dst(dst.dst())
                            .with_src(addend.src())
                            .with_src(a.src())
                            .with_src(b.src()),
                    );
                }
                Ok(())
            }
            Opcode::Dpas => {
                let dst = *dsts.first().ok_or_else(|| self.contract("dpas without a result"))?;
                let mut regs = Vec::with_capacity(3);
                for index in [2, 0, 1] {
                    let sources = self.operand_sources(inst, index)?;
                    let mut first = None;
                    for src in sources {
                        let loc = self.in_register(src)?;
                        first.get_or_insert(loc);
                    }
                    regs.push(first.ok_or_else(|| self.contract("dpas operand without components"))?);
                }
                self.emit(
                    Instruction::new(Op::Dpas, ExecSize::Simd8)
                        .with_dst(dst.dst())
                        .with_src(regs[0].dst())
                        .with_src(regs[1].dst())
                        .with_src(regs[2].dst())
                        .with_dpas(8, 8),
                );
                Ok(())
            }
            Opcode::LaneId => {
                let ids = self.lane_ids();
                for dst in &dsts {
                    self.copy(*dst, Src::Loc(ids));
                }
                Ok(())
            }
            Opcode::GroupId => {
                let group = Loc { reg: RegRef::grf(0, 1), ty: DataType::Ud, uniform: true };
                for dst in &dsts {
                    self.copy(*dst, Src::Loc(group));
                }
                Ok(())
            }
            Opcode::Load => self.lower_load(id, inst, &dsts),
            Opcode::Store => self.lower_store(id, inst),
            Opcode::PtrAdd => {
                let dst = *dsts.first().ok_or_else(|| self.contract("ptradd without a result"))?;
                let base = self.operand_sources(inst, 0)?;
                let base = self.in_register(Self::component(&base, 0))?;
                let offset = match Self::component(&self.operand_sources(inst, 1)?, 0) {
                    Src::Imm(value, ty) => {
                        let shift = 64 - ty.size_bytes() * 8;
                        let signed = ((value << shift) as i64) >> shift;
                        match i32::try_from(signed) {
                            Ok(v) => Src::Imm(v as u32 as u64, DataType::D),
                            Err(_) => Src::Loc(self.in_register(Src::Imm(value, ty))?),
                        }
                    }
                    other => other,
                };
                let (exec, mask) = self.exec_for(dst);
                let mut add = Instruction::new(Op::Add, exec).with_dst(dst.dst()).with_src(base.src()).with_src(offset.operand());
                add.exec_mask = mask;
                self.emit(add);
                Ok(())
            }
            Opcode::Alloca => {
                let dst = *dsts.first().ok_or_else(|| self.contract("alloca without a result"))?;
                let fp = self.fp.ok_or_else(|| self.contract("alloca in a kernel without private stack"))?;
                let offset = self.frame.offsets.get(&id).copied().unwrap_or(0);
                self.emit(
                    Instruction::new(Op::Add, ExecSize::Simd1)
                        .with_exec_mask(ExecMask::NO_MASK)
                        .with_dst(dst.dst())
                        .with_src(fp.src())
                        .with_src(Operand::imm(offset & 0xffff_ffff, DataType::D)),
                );
                Ok(())
            }
            Opcode::Call => self.lower_call(id, inst),
            // Phis are materialized by their predecessors.
            Opcode::Phi => Ok(()),
            Opcode::Br => {
                let target = inst.blocks[0];
                self.phi_copies(block, target)?;
                if target.index() != block.index() + 1 {
                    self.jump(target.index());
                }
                Ok(())
            }
            Opcode::CondBr => {
                let (on_true, on_false) = (inst.blocks[0], inst.blocks[1]);
                let cond = Self::component(&self.operand_sources(inst, 0)?, 0);
                let cond = match cond {
                    Src::Imm(c, _) => {
                        let target = if c != 0 { on_true } else { on_false };
                        self.phi_copies(block, target)?;
                        if target.index() != block.index() + 1 {
                            self.jump(target.index());
                        }
                        return Ok(());
                    }
                    Src::Loc(_) if self.divergence.is_divergent(&inst.operands[0]) => {
                        // jmpi follows one channel's flag; lanes that disagree would take its edge.
                        let name = &self.func.block(block).name;
                        debug!("'{}': branch in '{}' depends on the lane", self.func.name, name);
                        return Err(self.unsupported(inst.op));
                    }
                    Src::Loc(loc) => loc,
                };
                let t = self.edge_target(block, on_true)?;
                let f = self.edge_target(block, on_false)?;
                self.flag_from(cond);
                self.emit(
                    Instruction::new(Op::Jmpi, ExecSize::Simd1)
                        .with_predicate(Predicate::normal(FlagReg::F0_0))
                        .with_target(Label::Block(t)),
                );
                if f != block.index() + 1 {
                    self.jump(f);
                }
                Ok(())
            }
            Opcode::Ret => {
                let header = Loc { reg: RegRef::grf(EOT_REG, 0), ty: DataType::Ud, uniform: false };
                self.emit(
                    Instruction::new(Op::Mov, ExecSize::Simd8)
                        .with_exec_mask(ExecMask::NO_MASK)
                        .with_dst(header.dst())
                        .with_src(Operand::grf(0, DataType::Ud)),
                );
                self.emit(
                    Instruction::new(Op::Send, ExecSize::Simd8)
                        .with_exec_mask(ExecMask::NO_MASK)
                        .with_dst(Operand::null(DataType::Ud))
                        .with_src(Operand::grf(EOT_REG, DataType::Ud))
                        .with_src(Operand::null(DataType::Ud))
                        .with_send(SendDesc { sfid: Sfid::ThreadSpawner, desc: EOT_DESC, eot: true }),
                );
                Ok(())
            }
            other => Err(self.unsupported(other)),
        }
    }

    fn lower_binary(&mut self, inst: &Inst, dsts: &[Loc]) -> CompileResult<()> {
        let op = machine_op(inst.op).ok_or_else(|| self.unsupported(inst.op))?;
        let a = self.operand_sources(inst, 0)?;
        let b = self.operand_sources(inst, 1)?;
        for (k, dst) in dsts.iter().enumerate() {
            let (mut lhs, mut rhs) = (Self::component(&a, k), Self::component(&b, k));
            if matches!(lhs, Src::Imm(..)) && matches!(rhs, Src::Loc(_)) && inst.op.is_commutative() {
                std::mem::swap(&mut lhs, &mut rhs);
            }
            let lhs = self.in_register(lhs)?;
            let mut rhs_operand = match self.last_source(rhs, op)? {
                Src::Imm(value, ty) if inst.op == Opcode::Sub => Operand::imm(negate_immediate(value, ty), ty),
                other => other.operand(),
            };
            if inst.op == Opcode::Sub && !rhs_operand.is_imm() {
                rhs_operand = rhs_operand.with_modifier(SrcMod::Neg);
            }
            self.emit(Instruction::new(op, self.exec).with_dst(dst.dst()).with_src(lhs.src()).with_src(rhs_operand));
        }
        Ok(())
    }

    fn block_type_for(&self, id: InstId, elem: &Type) -> BlockType {
        self.annotations
            .block_type(self.func_id, id)
            .or_else(|| BlockType::from_bytes(self.dl.store_size(elem)))
            .unwrap_or(BlockType::D32)
    }

    fn element_type(ty: &Type) -> Type {
        match ty {
            Type::Vector(s, _) => Type::Scalar(*s),
            other => other.clone(),
        }
    }

    /// Per-lane address of component `k` of an access through `ptr`.
    fn component_address(&mut self, ptr: Src, k: usize, elem_bytes: u64) -> CompileResult<Loc> {
        let addr = self.alloc_value(self.ptr_type())?;
        if k == 0 {
            self.copy(addr, ptr);
        } else {
            let base = self.in_register(ptr)?;
            let offset = (k as u64 * elem_bytes) & 0xffff_ffff;
            self.emit(
                Instruction::new(Op::Add, self.exec)
                    .with_dst(addr.dst())
                    .with_src(base.src())
                    .with_src(Operand::imm(offset, DataType::D)),
            );
        }
        Ok(addr)
    }

    fn lower_load(&mut self, id: InstId, inst: &Inst, dsts: &[Loc]) -> CompileResult<()> {
        let ptr = Self::component(&self.operand_sources(inst, 0)?, 0);
        let elem = Self::element_type(&inst.ty);
        let block = self.block_type_for(id, &elem);
        let elem_bytes = self.dl.store_size(&elem);
        for (k, dst) in dsts.iter().enumerate() {
            let addr = self.component_address(ptr, k, elem_bytes)?;
            let desc = ugm_desc(UGM_LOAD, self.dl.pointer_bits == 64, block, self.regs_for(dst.ty), self.regs_for(addr.ty));
            self.emit(
                Instruction::new(Op::Send, self.exec)
                    .with_dst(dst.dst())
                    .with_src(addr.dst())
                    .with_src(Operand::null(DataType::Ud))
                    .with_send(SendDesc { sfid: Sfid::Ugm, desc, eot: false }),
            );
        }
        Ok(())
    }

    fn lower_store(&mut self, id: InstId, inst: &Inst) -> CompileResult<()> {
        let data = self.operand_sources(inst, 0)?;
        let ptr = Self::component(&self.operand_sources(inst, 1)?, 0);
        let value_ty = self.func.value_type(self.module, &inst.operands[0]);
        let elem = Self::element_type(&value_ty);
        let block = self.block_type_for(id, &elem);
        let elem_bytes = self.dl.store_size(&elem);
        for (k, src) in data.into_iter().enumerate() {
            let addr = self.component_address(ptr, k, elem_bytes)?;
            let payload = self.alloc_value(src.ty())?;
            self.copy(payload, src);
            let desc = ugm_desc(UGM_STORE, self.dl.pointer_bits == 64, block, 0, self.regs_for(addr.ty));
            self.emit(
                Instruction::new(Op::Send, self.exec)
                    .with_dst(Operand::null(DataType::Ud))
                    .with_src(addr.dst())
                    .with_src(payload.dst())
                    .with_send(SendDesc { sfid: Sfid::Ugm, desc, eot: false }),
            );
        }
        Ok(())
    }

    fn lower_call(&mut self, id: InstId, inst: &Inst) -> CompileResult<()> {
        let callee = inst.callee.ok_or_else(|| self.unsupported(inst.op))?;
        // Callee bodies are not emitted into the container.
        if !self.module.func(callee).is_declaration() {
            debug!("'{}' calls '{}', which is defined in the unit", self.func.name, self.module.func(callee).name);
            return Err(self.unsupported(inst.op));
        }
        let base = *self.call_blocks.get(&id).ok_or_else(|| self.contract(format!("call {id} has no argument block")))?;
        let mut sources = Vec::new();
        for index in 0..inst.operands.len() {
            sources.extend(self.operand_sources(inst, index)?);
        }
        let types: Vec<DataType> = sources.iter().map(|s| s.ty()).collect();
        let slots = self.block_locs(base, &types);
        for (dst, src) in slots.into_iter().zip(sources) {
            self.copy(dst, src);
        }
        let return_ip = self.alloc_scalar(DataType::Ud)?;
        self.emit(
            Instruction::new(Op::Call, ExecSize::Simd1)
                .with_exec_mask(ExecMask::NO_MASK)
                .with_dst(return_ip.dst())
                .with_target(Label::Symbol(self.module.func(callee).name.clone())),
        );
        Ok(())
    }
}

/// Lower kernel `func` into a machine kernel.
pub fn lower_kernel(
    module: &Module,
    func: FuncId,
    annotations: &AnnotationTable,
    options: &CompileOptions,
) -> CompileResult<MachineKernel> {
    let function = module.func(func);
    let md = annotations
        .kernel_internal(func)
        .ok_or_else(|| CompileError::MissingKernelMetadata { kernel: function.name.clone() })?;
    let stack_amount = annotations
        .stack_amount(func)
        .ok_or_else(|| CompileError::UnknownStackUsage { kernel: function.name.clone() })?;
    let lanes = function.simd.unwrap_or(options.default_simd);
    let exec = match lanes {
        8 | 16 | 32 => ExecSize::from_lanes(lanes),
        _ => None,
    }
    .ok_or_else(|| CompileError::Contract { reason: format!("{}: unsupported SIMD width {lanes}", function.name) })?;

    let dl = module.data_layout.unwrap_or_default();
    let payload_end = md.implicit_arg_offset + lanes * DataType::Uw.size_bytes();
    let first_free = 1 + payload_end.div_ceil(GRF_BYTES);
    if first_free >= EOT_REG as u32 {
        return Err(CompileError::RegisterPressure { kernel: function.name.clone(), needed: first_free + 1 });
    }

    let mut lowering = FunctionLowering {
        module,
        func: function,
        md,
        dl,
        annotations,
        func_id: func,
        divergence: DivergenceInfo::compute(function, &PostDomTree::compute(function)),
        exec,
        lanes,
        next_reg: first_free,
        scalar_slot: None,
        values: HashMap::new(),
        call_blocks: HashMap::new(),
        globals: HashMap::new(),
        frame: FrameLayout::compute(function, &dl),
        fp: None,
        insts: Vec::new(),
        edges: Vec::new(),
    };
    lowering.assign_registers()?;

    let mut blocks = Vec::with_capacity(function.blocks.len());
    for block in function.block_ids() {
        if block.index() == 0 {
            lowering.prologue(stack_amount)?;
        }
        for &id in &function.block(block).insts {
            lowering.lower_inst(block, id)?;
        }
        blocks.push(MachineBlock { label: function.block(block).name.clone(), insts: std::mem::take(&mut lowering.insts) });
    }
    blocks.append(&mut lowering.edges);

    let kernel = MachineKernel { name: function.name.clone(), simd: lanes, blocks };
    debug!(
        "lowered '{}': {} instruction(s), {} GRF(s) used",
        kernel.name,
        kernel.instructions().count(),
        lowering.next_reg
    );
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use crate::metadata::{Annotation, EntityId};

    fn prepare(src: &str, stack: Option<u64>) -> (Module, AnnotationTable) {
        let module = parse_module("t", src).unwrap();
        let mut table = AnnotationTable::new();
        for k in module.kernels() {
            let md = KernelInternal::build(k, module.func(k), &DataLayout::default());
            table.insert(EntityId::Function(k), Annotation::KernelInternal(md));
            if let Some(amount) = stack {
                table.insert(EntityId::Function(k), Annotation::StackAmount(amount));
            }
        }
        (module, table)
    }

    fn lower(src: &str, stack: Option<u64>) -> CompileResult<MachineKernel> {
        let (module, table) = prepare(src, stack);
        lower_kernel(&module, FuncId(0), &table, &CompileOptions::new())
    }

    #[test]
    fn arguments_and_constants_map_to_registers_and_immediates() {
        let kernel = lower(
            "kernel @k(%a: i32, %b: i32) simd8 {
            entry:
              %x = add %a, i32 5 : i32
              %y = sub %b, %x : i32
              %z = sub %y, i32 2 : i32
              ret
            }",
            Some(0),
        )
        .unwrap();
        let insts: Vec<&Instruction> = kernel.instructions().collect();
        let text: Vec<String> = insts.iter().map(|i| i.to_string()).collect();

        // Payload: r1 holds both arguments, lane ids live in r2, values start at r3.
        assert_eq!(insts[0].op, Op::Add);
        assert_eq!(insts[0].srcs[0].reg_ref(), Some(RegRef::grf(1, 0)));
        assert_eq!(insts[0].srcs[0].region, Region::SCALAR);
        assert_eq!(insts[0].srcs[1], Operand::imm(5, DataType::D));
        assert_eq!(insts[0].dst.unwrap().reg_ref(), Some(RegRef::grf(3, 0)));

        assert_eq!(insts[1].srcs[0].reg_ref(), Some(RegRef::grf(1, 1)));
        assert_eq!(insts[1].srcs[1].modifier, SrcMod::Neg);
        assert_eq!(insts[2].srcs[1], Operand::imm(0xffff_fffe, DataType::D));

        // Thread end.
        assert_eq!(insts[3].op, Op::Mov);
        assert_eq!(insts[4].send.map(|s| s.eot), Some(true));
        assert_eq!(insts.len(), 5, "{text:?}");
        for inst in insts {
            inst.validate().unwrap();
        }
    }

    #[test]
    fn missing_annotations_fail_the_kernel() {
        let src = "kernel @k() {
            entry:
              ret
            }";
        assert!(matches!(lower(src, None), Err(CompileError::UnknownStackUsage { .. })));

        let module = parse_module("t", src).unwrap();
        let err = lower_kernel(&module, FuncId(0), &AnnotationTable::new(), &CompileOptions::new());
        assert!(matches!(err, Err(CompileError::MissingKernelMetadata { .. })));
    }

    #[test]
    fn conditional_branches_split_edges_with_phi_copies() {
        let kernel = lower(
            "kernel @k(%n: i32) {
            entry:
              br ^head
            head:
              %i = phi [i32 0, ^entry], [%i2, ^head] : i32
              %i2 = add %i, i32 1 : i32
              %c = cmp.lt %i2, %n : i1
              condbr %c, ^head, ^exit
            exit:
              ret
            }",
            Some(0),
        )
        .unwrap();
        assert_eq!(kernel.blocks.len(), 4);
        assert_eq!(kernel.blocks[3].label, "head.head");

        let head = &kernel.blocks[1].insts;
        let jmp = head.iter().find(|i| i.op == Op::Jmpi).unwrap();
        assert_eq!(jmp.target, Some(Label::Block(3)));
        assert!(jmp.predicate.is_some());
        let cmp = head.iter().find(|i| i.flag_modifier.is_some() && i.dst.map(|d| d.reg_ref()) != Some(Some(RegRef::NULL)));
        assert_eq!(cmp.and_then(|c| c.flag_modifier).map(|f| f.cond), Some(CondMod::Lt));

        let edge = &kernel.blocks[3].insts;
        assert_eq!(edge.last().and_then(|i| i.target.clone()), Some(Label::Block(1)));
        assert_eq!(edge[0].op, Op::Mov);
        // The entry falls through into the header after its phi copy.
        assert!(kernel.blocks[0].insts.iter().all(|i| i.op == Op::Mov));
    }

    #[test]
    fn memory_accesses_use_block_type_overrides() {
        let (module, mut table) = prepare(
            "kernel @k(%p: ptr1) {
            entry:
              %v = load %p : i8
              store %v, %p
              ret
            }",
            Some(0),
        );
        table.insert(EntityId::Inst(FuncId(0), InstId(0)), Annotation::BlockType(BlockType::D32));
        let kernel = lower_kernel(&module, FuncId(0), &table, &CompileOptions::new()).unwrap();
        let sends: Vec<SendDesc> =
            kernel.instructions().filter_map(|i| i.send).filter(|s| s.sfid == Sfid::Ugm).collect();
        assert_eq!(sends.len(), 2);
        assert_eq!((sends[0].desc >> 9) & 0x7, BlockType::D32.code());
        assert_eq!((sends[1].desc >> 9) & 0x7, BlockType::D8.code());
        assert_eq!(sends[1].desc & 0x7f, UGM_STORE);
    }

    #[test]
    fn stack_prologue_and_allocas() {
        let kernel = lower(
            "kernel @k() {
            entry:
              %buf = alloca [4 x i32]
              ret
            }",
            Some(16),
        )
        .unwrap();
        let entry = &kernel.blocks[0].insts;
        assert_eq!(entry[0].srcs[0].reg_ref(), Some(RegRef::grf(0, 1)));
        assert_eq!(entry[1].op, Op::Add);
        assert_eq!(entry[1].srcs[1], Operand::imm(16, DataType::D));
        assert_eq!(entry[2].op, Op::Add);
        assert_eq!(entry[2].srcs[1], Operand::imm(0, DataType::D));
    }

    #[test]
    fn calls_pass_arguments_in_a_block_and_reference_the_callee() {
        let (module, table) = prepare(
            "declare @ext(%x: i32) -> i32
            kernel @k(%a: i32) {
            entry:
              %r = call @ext(%a) : i32
              ret
            }",
            Some(0),
        );
        let k = module.function_by_name("k").unwrap();
        let kernel = lower_kernel(&module, k, &table, &CompileOptions::new()).unwrap();
        let call = kernel.instructions().find(|i| i.op == Op::Call).unwrap();
        assert_eq!(call.target, Some(Label::Symbol("ext".into())));
        call.validate().unwrap();
    }

    #[test]
    fn lane_dependent_branches_are_unsupported() {
        let src = "kernel @k(%n: i32) {
            entry:
              %lid = lane_id : i32
              %c = cmp.lt %lid, %n : i1
              condbr %c, ^then, ^exit
            then:
              br ^exit
            exit:
              ret
            }";
        let err = lower(src, Some(0)).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedInstruction { opcode: "condbr", .. }), "{err}");
        assert!(err.is_per_kernel());

        let uniform = src.replace("cmp.lt %lid, %n", "cmp.lt %n, i32 8");
        let kernel = lower(&uniform, Some(0)).unwrap();
        let jmp = kernel.instructions().find(|i| i.predicate.is_some() && i.op == Op::Jmpi).unwrap();
        assert_eq!(jmp.exec_size, Some(ExecSize::Simd1));
    }

    #[test]
    fn calls_to_bodies_in_the_module_are_unsupported() {
        let err = lower(
            "kernel @k(%a: i32) {
            entry:
              %r = call @helper(%a) : i32
              ret
            }
            func @helper(%x: i32) -> i32 {
            entry:
              ret %x
            }",
            Some(0),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedInstruction { opcode: "call", .. }), "{err}");
    }

    #[test]
    fn uniform_mad_sources_are_broadcast() {
        let kernel = lower(
            "kernel @k(%a: f32, %b: f32, %c: f32) simd16 {
            entry:
              %m = mad %a, %b, %c : f32
              ret
            }",
            Some(0),
        )
        .unwrap();
        let insts: Vec<&Instruction> = kernel.instructions().collect();
        let mad = insts.iter().position(|i| i.op == Op::Mad).unwrap();
        assert_eq!(mad, 3);
        for (copy, src) in insts[..mad].iter().zip(&insts[mad].srcs) {
            assert_eq!(copy.op, Op::Mov);
            assert_eq!(copy.srcs[0].region, Region::SCALAR);
            assert_eq!(copy.dst.and_then(|d| d.reg_ref()), src.reg_ref());
            assert_eq!(src.region, Region::default());
        }
        for inst in insts {
            inst.validate().unwrap();
        }
    }

    #[test]
    fn register_pressure_is_reported() {
        let mut body = String::new();
        for i in 0..80 {
            body.push_str(&format!("  %v{i} = add %a, i32 {i} : i32\n"));
        }
        let src = format!("kernel @k(%a: i32) simd32 {{\nentry:\n{body}  ret\n}}");
        assert!(matches!(lower(&src, Some(0)), Err(CompileError::RegisterPressure { .. })));
    }
}
