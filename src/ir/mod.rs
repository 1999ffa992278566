// This module defines the kernel graph that every pass and the lowering step operate on.
// A Module owns globals, functions and an optional target data layout. A Function owns its
// blocks and an instruction arena; blocks list instruction ids in program order and end in a
// terminator whose targets are the block's successors. Values are instruction results,
// function arguments, constants or global addresses, so use-def queries are operand scans
// over the arena. Instructions removed from a block stay in the arena but are no longer
// reachable through any block. Loop metadata is attached to latch terminators, and call
// sites carry their own inlining markers. The textual `.kir` form is parsed by `parser`
// and produced by the Display implementation in `printer`.

//! Kernel graph: module, functions, blocks, instructions and values.
//!
//! ```text
//! target little ptr64
//! global @lut : [4 x i32] constant internal = [i32 1, i32 2, i32 3, i32 4]
//!
//! kernel @k(%out: ptr1) simd16 {
//! entry:
//!   %v = load @lut : i32
//!   store %v, %out
//!   ret
//! }
//! ```

pub mod parser;
pub mod printer;
pub mod types;

pub use parser::parse_module;
pub use types::{addrspace, DataLayout, Endian, ScalarType, Type};

use std::fmt;

macro_rules! entity_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(FuncId, "fn");
entity_id!(BlockId, "bb");
entity_id!(InstId, "inst");
entity_id!(GlobalId, "g");

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpPred {
    pub fn name(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Lt => "lt",
            CmpPred::Le => "le",
            CmpPred::Gt => "gt",
            CmpPred::Ge => "ge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => CmpPred::Eq,
            "ne" => CmpPred::Ne,
            "lt" => CmpPred::Lt,
            "le" => CmpPred::Le,
            "gt" => CmpPred::Gt,
            "ge" => CmpPred::Ge,
            _ => return None,
        })
    }
}

/// Instruction opcodes of the kernel graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Mad,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Cmp(CmpPred),
    Select,
    /// Dot-product-accumulate-systolic; issues on both halves of a fused EU pair.
    Dpas,
    LaneId,
    GroupId,
    Load,
    Store,
    PtrAdd,
    Alloca,
    Call,
    Phi,
    Br,
    CondBr,
    Ret,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Mad => "mad",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Cmp(_) => "cmp",
            Opcode::Select => "select",
            Opcode::Dpas => "dpas",
            Opcode::LaneId => "lane_id",
            Opcode::GroupId => "group_id",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::PtrAdd => "ptradd",
            Opcode::Alloca => "alloca",
            Opcode::Call => "call",
            Opcode::Phi => "phi",
            Opcode::Br => "br",
            Opcode::CondBr => "condbr",
            Opcode::Ret => "ret",
        }
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Br | Opcode::CondBr | Opcode::Ret)
    }

    /// Instructions whose issue is split across a fused EU pair.
    pub fn is_fused_dual_issue(self) -> bool {
        matches!(self, Opcode::Dpas)
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, Opcode::Add | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor)
    }
}

/// Constant values. Scalars keep their raw bit pattern in the low bits of `bits`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Scalar { ty: ScalarType, bits: u64 },
    Vector { elem: ScalarType, lanes: Vec<u64> },
    Array { elem: Type, elems: Vec<Constant> },
    Zero(Type),
    Undef(Type),
}

impl Constant {
    pub fn int(ty: ScalarType, value: i64) -> Self {
        Constant::Scalar { ty, bits: value as u64 & ty.mask() }
    }

    pub fn f32(value: f32) -> Self {
        Constant::Scalar { ty: ScalarType::F32, bits: value.to_bits() as u64 }
    }

    pub fn ty(&self) -> Type {
        match self {
            Constant::Scalar { ty, .. } => Type::Scalar(*ty),
            Constant::Vector { elem, lanes } => Type::Vector(*elem, lanes.len() as u32),
            Constant::Array { elem, elems } => Type::Array(Box::new(elem.clone()), elems.len() as u64),
            Constant::Zero(ty) | Constant::Undef(ty) => ty.clone(),
        }
    }

    /// Serialize the constant into `out` following the data layout.
    pub fn write_bytes(&self, dl: &DataLayout, out: &mut Vec<u8>) {
        match self {
            Constant::Scalar { ty, bits } => dl.write_uint(*bits, ty.store_bytes() as usize, out),
            Constant::Vector { elem, lanes } => {
                for lane in lanes {
                    dl.write_uint(*lane, elem.store_bytes() as usize, out);
                }
            }
            Constant::Array { elem, elems } => {
                let stride = dl.alloc_size(elem) as usize;
                for e in elems {
                    let start = out.len();
                    e.write_bytes(dl, out);
                    out.resize(start + stride, 0);
                }
            }
            Constant::Zero(ty) | Constant::Undef(ty) => {
                out.resize(out.len() + dl.store_size(ty) as usize, 0);
            }
        }
    }
}

/// Operand of an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Inst(InstId),
    Arg(u32),
    Const(Constant),
    Global(GlobalId),
}

impl Value {
    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Value::Const(c) => Some(c),
            _ => None,
        }
    }
}

/// Hints carried by a loop's metadata node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopHint {
    UnrollEnable,
    UnrollFull,
    UnrollCount(u32),
    UnrollDisable,
    MustProgress,
}

impl LoopHint {
    /// Whether the hint explicitly requests unrolling.
    pub fn requests_unroll(self) -> bool {
        matches!(self, LoopHint::UnrollEnable | LoopHint::UnrollFull | LoopHint::UnrollCount(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoopMetadata {
    pub hints: Vec<LoopHint>,
}

impl LoopMetadata {
    pub fn has(&self, hint: LoopHint) -> bool {
        self.hints.contains(&hint)
    }
}

/// Inlining markers shared by functions and call sites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InlineAttrs {
    pub no_inline: bool,
    pub always_inline: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub name: Option<String>,
    pub op: Opcode,
    pub ty: Type,
    pub operands: Vec<Value>,
    /// Successor blocks for terminators, incoming blocks for phis.
    pub blocks: Vec<BlockId>,
    pub callee: Option<FuncId>,
    pub call_attrs: InlineAttrs,
    pub loop_md: Option<LoopMetadata>,
}

impl Inst {
    pub fn new(op: Opcode, ty: Type, operands: Vec<Value>) -> Self {
        Self {
            name: None,
            op,
            ty,
            operands,
            blocks: Vec::new(),
            callee: None,
            call_attrs: InlineAttrs::default(),
            loop_md: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_blocks(mut self, blocks: Vec<BlockId>) -> Self {
        self.blocks = blocks;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Kernel,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Param>,
    pub ret_ty: Type,
    pub attrs: InlineAttrs,
    /// Requested SIMD width for kernels.
    pub simd: Option<u32>,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
}

impl Function {
    pub fn new(name: &str, kind: FunctionKind, params: Vec<Param>, ret_ty: Type) -> Self {
        Self {
            name: name.to_string(),
            kind,
            params,
            ret_ty,
            attrs: InlineAttrs::default(),
            simd: None,
            blocks: Vec::new(),
            insts: Vec::new(),
        }
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == FunctionKind::Kernel
    }

    /// A function without blocks is a declaration.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop the body, leaving a declaration behind.
    pub fn delete_body(&mut self) {
        self.blocks.clear();
        self.insts.clear();
    }

    pub fn add_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { name: name.to_string(), insts: Vec::new() });
        id
    }

    /// Append an instruction at the end of `block`.
    pub fn push_inst(&mut self, block: BlockId, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        self.blocks[block.index()].insts.push(id);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Instructions still attached to a block, in program order.
    pub fn live_insts(&self) -> impl Iterator<Item = (BlockId, InstId)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(b, block)| block.insts.iter().map(move |i| (BlockId(b as u32), *i)))
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.block(block).insts.last()?;
        self.inst(last).op.is_terminator().then_some(last)
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.terminator(block) {
            Some(term) => self.inst(term).blocks.clone(),
            None => Vec::new(),
        }
    }

    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for b in self.block_ids() {
            for s in self.successors(b) {
                if !preds[s.index()].contains(&b) {
                    preds[s.index()].push(b);
                }
            }
        }
        preds
    }

    pub fn block_of(&self, inst: InstId) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.insts.contains(&inst))
            .map(|b| BlockId(b as u32))
    }

    /// Live instructions that use `value` as an operand.
    pub fn users(&self, value: &Value) -> Vec<InstId> {
        self.live_insts()
            .filter(|(_, id)| self.inst(*id).operands.contains(value))
            .map(|(_, id)| id)
            .collect()
    }

    /// Replace every operand equal to `from` with `to`. Returns the number of rewrites.
    pub fn replace_all_uses(&mut self, from: &Value, to: &Value) -> usize {
        let mut count = 0;
        for inst in &mut self.insts {
            for op in &mut inst.operands {
                if op == from {
                    *op = to.clone();
                    count += 1;
                }
            }
        }
        count
    }

    /// Detach an instruction from its block.
    pub fn erase_inst(&mut self, inst: InstId) -> bool {
        for block in &mut self.blocks {
            if let Some(pos) = block.insts.iter().position(|i| *i == inst) {
                block.insts.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn value_type(&self, module: &Module, value: &Value) -> Type {
        match value {
            Value::Inst(id) => self.inst(*id).ty.clone(),
            Value::Arg(i) => self.params[*i as usize].ty.clone(),
            Value::Const(c) => c.ty(),
            Value::Global(g) => Type::Ptr(module.global(*g).address_space),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    Internal,
    /// May be replaced at link time.
    Weak,
}

impl Linkage {
    pub fn is_interposable(self) -> bool {
        matches!(self, Linkage::Weak)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    pub name: String,
    pub ty: Type,
    pub address_space: u32,
    pub is_constant: bool,
    pub linkage: Linkage,
    pub initializer: Option<Constant>,
}

impl GlobalVar {
    /// The initializer is the one every reader observes.
    pub fn has_unique_initializer(&self) -> bool {
        self.initializer.is_some() && !self.linkage.is_interposable()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub name: String,
    pub data_layout: Option<DataLayout>,
    pub globals: Vec<GlobalVar>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVar {
        &self.globals[id.index()]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn kernels(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.func_ids().filter(|f| self.func(*f).is_kernel())
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name).map(|i| FuncId(i as u32))
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals.iter().position(|g| g.name == name).map(|i| GlobalId(i as u32))
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        self.functions.push(func);
        FuncId(self.functions.len() as u32 - 1)
    }

    pub fn add_global(&mut self, global: GlobalVar) -> GlobalId {
        self.globals.push(global);
        GlobalId(self.globals.len() as u32 - 1)
    }

    /// Clone `id` under a new name. Call sites keep pointing at the original.
    pub fn clone_function(&mut self, id: FuncId, new_name: &str) -> FuncId {
        let mut copy = self.func(id).clone();
        copy.name = new_name.to_string();
        self.add_function(copy)
    }

    /// Point every call of `from` at `to`.
    pub fn redirect_calls(&mut self, from: FuncId, to: FuncId) -> usize {
        let mut count = 0;
        for func in &mut self.functions {
            for inst in &mut func.insts {
                if inst.op == Opcode::Call && inst.callee == Some(from) {
                    inst.callee = Some(to);
                    count += 1;
                }
            }
        }
        count
    }
}
