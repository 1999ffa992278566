// This module holds the side-channel annotations that passes attach to kernel graph
// entities and later stages consume. Annotations live in a typed side table keyed by
// (entity, annotation kind): an entity is a function, an instruction of a function or a
// global, and each kind can be attached, read, removed and invalidated independently of
// the others. Three kinds exist. KernelInternal is the ABI description of a kernel's
// arguments (argument index table, linearization table, implicit-argument offset, binding
// table indices), built once per kernel. StackAmount is the private stack a function needs,
// written by the stack-usage stage and absent when it cannot be represented. BlockType is a
// memory block-size override on an individual load or store. When a function is cloned to
// replace another, rebind_function moves kernel metadata over to the clone and changes
// nothing but its function reference.

//! Typed annotation side table and kernel ABI metadata.

use crate::ir::{addrspace, DataLayout, FuncId, Function, GlobalId, InstId, Type};
use hashbrown::HashMap;
use log::debug;

/// Entity an annotation is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Function(FuncId),
    Inst(FuncId, InstId),
    Global(GlobalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationKind {
    KernelInternal,
    StackAmount,
    BlockType,
}

/// Bytes per general register; kernel payload sections are register aligned.
pub const PAYLOAD_ALIGN: u32 = 32;

/// One physical argument slot after linearization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgSlot {
    /// Index of the source argument.
    pub arg: u32,
    /// Byte offset in the explicit argument payload.
    pub offset: u32,
    pub size: u32,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingEntry {
    pub arg: u32,
    pub bti: u32,
}

/// ABI description of a kernel's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelInternal {
    pub function: FuncId,
    /// Byte offset of the implicit arguments (lane ids) in the payload.
    pub implicit_arg_offset: u32,
    /// Source argument index of every slot, in slot order.
    pub arg_indices: Vec<u32>,
    pub linearization: Vec<ArgSlot>,
    pub bti: Vec<BindingEntry>,
}

impl KernelInternal {
    /// Lay out the arguments of `func`: arrays split into one slot per element, every slot
    /// naturally aligned, implicit arguments after the explicit payload rounded to a register,
    /// global pointers numbered in argument order.
    pub fn build(id: FuncId, func: &Function, dl: &DataLayout) -> Self {
        let mut linearization = Vec::new();
        let mut cursor = 0u64;
        for (index, param) in func.params.iter().enumerate() {
            let mut leaves = Vec::new();
            linearize(&param.ty, &mut leaves);
            for ty in leaves {
                let align = dl.abi_align(&ty);
                cursor = cursor.div_ceil(align) * align;
                let size = dl.store_size(&ty);
                linearization.push(ArgSlot { arg: index as u32, offset: cursor as u32, size: size as u32, ty });
                cursor += size;
            }
        }
        let implicit_arg_offset = (cursor as u32).div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN;

        let bti = func
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ty.address_space() == Some(addrspace::GLOBAL))
            .enumerate()
            .map(|(bti, (arg, _))| BindingEntry { arg: arg as u32, bti: bti as u32 })
            .collect();

        Self {
            function: id,
            implicit_arg_offset,
            arg_indices: linearization.iter().map(|s| s.arg).collect(),
            linearization,
            bti,
        }
    }

    /// Slots of source argument `arg`.
    pub fn slots_of(&self, arg: u32) -> impl Iterator<Item = &ArgSlot> {
        self.linearization.iter().filter(move |s| s.arg == arg)
    }

    pub fn bti_of(&self, arg: u32) -> Option<u32> {
        self.bti.iter().find(|b| b.arg == arg).map(|b| b.bti)
    }
}

fn linearize(ty: &Type, out: &mut Vec<Type>) {
    match ty {
        Type::Array(elem, n) => {
            for _ in 0..*n {
                linearize(elem, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Memory access granularity used by a load or store message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    D8,
    D16,
    D32,
    D64,
}

impl BlockType {
    pub fn bytes(self) -> u32 {
        match self {
            BlockType::D8 => 1,
            BlockType::D16 => 2,
            BlockType::D32 => 4,
            BlockType::D64 => 8,
        }
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        Some(match bytes {
            1 => BlockType::D8,
            2 => BlockType::D16,
            4 => BlockType::D32,
            8 => BlockType::D64,
            _ => return None,
        })
    }

    /// Data size code in a memory message descriptor.
    pub fn code(self) -> u32 {
        self.bytes().trailing_zeros()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    KernelInternal(KernelInternal),
    StackAmount(u64),
    BlockType(BlockType),
}

impl Annotation {
    pub fn kind(&self) -> AnnotationKind {
        match self {
            Annotation::KernelInternal(_) => AnnotationKind::KernelInternal,
            Annotation::StackAmount(_) => AnnotationKind::StackAmount,
            Annotation::BlockType(_) => AnnotationKind::BlockType,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationTable {
    entries: HashMap<(EntityId, AnnotationKind), Annotation>,
}

impl AnnotationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach `annotation`, returning the one it replaced.
    pub fn insert(&mut self, entity: EntityId, annotation: Annotation) -> Option<Annotation> {
        self.entries.insert((entity, annotation.kind()), annotation)
    }

    pub fn get(&self, entity: EntityId, kind: AnnotationKind) -> Option<&Annotation> {
        self.entries.get(&(entity, kind))
    }

    pub fn contains(&self, entity: EntityId, kind: AnnotationKind) -> bool {
        self.entries.contains_key(&(entity, kind))
    }

    pub fn remove(&mut self, entity: EntityId, kind: AnnotationKind) -> Option<Annotation> {
        self.entries.remove(&(entity, kind))
    }

    /// Drop every annotation of `kind`. Returns how many were removed.
    pub fn invalidate_kind(&mut self, kind: AnnotationKind) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(_, k), _| *k != kind);
        before - self.entries.len()
    }

    pub fn kernel_internal(&self, func: FuncId) -> Option<&KernelInternal> {
        match self.get(EntityId::Function(func), AnnotationKind::KernelInternal)? {
            Annotation::KernelInternal(md) => Some(md),
            _ => None,
        }
    }

    pub fn stack_amount(&self, func: FuncId) -> Option<u64> {
        match self.get(EntityId::Function(func), AnnotationKind::StackAmount)? {
            Annotation::StackAmount(amount) => Some(*amount),
            _ => None,
        }
    }

    pub fn block_type(&self, func: FuncId, inst: InstId) -> Option<BlockType> {
        match self.get(EntityId::Inst(func, inst), AnnotationKind::BlockType)? {
            Annotation::BlockType(bt) => Some(*bt),
            _ => None,
        }
    }

    /// Point kernel metadata recorded for `old` at `new`. Every other field is kept as is.
    /// Returns the number of metadata nodes rebound.
    pub fn rebind_function(&mut self, old: FuncId, new: FuncId) -> usize {
        let mut rebound = 0;
        for annotation in self.entries.values_mut() {
            if let Annotation::KernelInternal(md) = annotation {
                if md.function == old {
                    md.function = new;
                    rebound += 1;
                }
            }
        }
        let key = (EntityId::Function(old), AnnotationKind::KernelInternal);
        if let Some(md) = self.entries.remove(&key) {
            self.entries.insert((EntityId::Function(new), AnnotationKind::KernelInternal), md);
        }
        debug!("rebound {} kernel metadata node(s) from {} to {}", rebound, old, new);
        rebound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionKind, Param, ScalarType};

    fn kernel(params: Vec<Type>) -> Function {
        let params = params
            .into_iter()
            .enumerate()
            .map(|(i, ty)| Param { name: format!("a{i}"), ty })
            .collect();
        Function::new("k", FunctionKind::Kernel, params, Type::Void)
    }

    #[test]
    fn arguments_are_linearized_and_aligned() {
        let f = kernel(vec![
            Type::I8,
            Type::Ptr(addrspace::GLOBAL),
            Type::Array(Box::new(Type::I32), 3),
            Type::Ptr(addrspace::LOCAL),
            Type::Ptr(addrspace::GLOBAL),
        ]);
        let md = KernelInternal::build(FuncId(0), &f, &DataLayout::default());
        let offsets: Vec<_> = md.linearization.iter().map(|s| (s.arg, s.offset, s.size)).collect();
        assert_eq!(
            offsets,
            vec![(0, 0, 1), (1, 8, 8), (2, 16, 4), (2, 20, 4), (2, 24, 4), (3, 32, 8), (4, 40, 8)]
        );
        assert_eq!(md.arg_indices, vec![0, 1, 2, 2, 2, 3, 4]);
        assert_eq!(md.implicit_arg_offset, 64);
        assert_eq!(md.bti, vec![BindingEntry { arg: 1, bti: 0 }, BindingEntry { arg: 4, bti: 1 }]);
        assert_eq!(md.slots_of(2).count(), 3);
        assert_eq!(md.bti_of(4), Some(1));
        assert_eq!(md.bti_of(3), None);
    }

    #[test]
    fn empty_argument_list_has_zero_implicit_offset() {
        let md = KernelInternal::build(FuncId(3), &kernel(vec![]), &DataLayout::default());
        assert_eq!(md.implicit_arg_offset, 0);
        assert!(md.linearization.is_empty());
    }

    #[test]
    fn kinds_are_independent() {
        let mut table = AnnotationTable::new();
        let f = EntityId::Function(FuncId(0));
        table.insert(f, Annotation::StackAmount(64));
        table.insert(EntityId::Inst(FuncId(0), InstId(2)), Annotation::BlockType(BlockType::D32));
        assert_eq!(table.stack_amount(FuncId(0)), Some(64));
        assert!(table.kernel_internal(FuncId(0)).is_none());
        assert_eq!(table.block_type(FuncId(0), InstId(2)), Some(BlockType::D32));

        assert_eq!(table.invalidate_kind(AnnotationKind::StackAmount), 1);
        assert_eq!(table.stack_amount(FuncId(0)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rebinding_changes_only_the_function() {
        let f = kernel(vec![Type::Ptr(addrspace::GLOBAL), Type::Scalar(ScalarType::I32)]);
        let md = KernelInternal::build(FuncId(0), &f, &DataLayout::default());
        let mut table = AnnotationTable::new();
        table.insert(EntityId::Function(FuncId(0)), Annotation::KernelInternal(md.clone()));

        assert_eq!(table.rebind_function(FuncId(0), FuncId(1)), 1);
        let rebound = table.kernel_internal(FuncId(1)).unwrap();
        assert_eq!(rebound.function, FuncId(1));
        assert_eq!(KernelInternal { function: FuncId(0), ..rebound.clone() }, md);
        assert!(table.kernel_internal(FuncId(0)).is_none());
    }
}
