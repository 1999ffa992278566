// This module implements the pass that widens the memory block type of sub-dword
// accesses. Loads and stores of 8- or 16-bit scalars are annotated with a dword block-type
// override; send lowering reads the override and encodes a D32 data size in the message
// descriptor. The annotation lives in the side table, so the instructions themselves do
// not change and every analysis is preserved.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::ALL_ANALYSES;
use crate::core::CompileResult;
use crate::ir::{Module, Opcode, Type};
use crate::metadata::{Annotation, BlockType, EntityId};
use log::trace;

pub const NAME: &str = "subdword-block-type";

pub struct SubdwordBlockType;

fn is_subdword(ty: &Type) -> bool {
    ty.as_scalar().is_some_and(|s| matches!(s.bits(), 8 | 16))
}

impl Pass for SubdwordBlockType {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor { name: NAME, scope: PassScope::Function, requires: &[], preserves: ALL_ANALYSES }
    }

    fn run(&mut self, unit: PassUnit, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let PassUnit::Function(id) = unit else {
            return Ok(PassResult::Unchanged);
        };
        let func = module.func(id);
        let mut changed = false;
        for (_, inst_id) in func.live_insts() {
            let inst = func.inst(inst_id);
            let accessed = match inst.op {
                Opcode::Load => inst.ty.clone(),
                Opcode::Store => func.value_type(module, &inst.operands[0]),
                _ => continue,
            };
            if !is_subdword(&accessed) {
                continue;
            }
            let entity = EntityId::Inst(id, inst_id);
            let override_ = Annotation::BlockType(BlockType::D32);
            if ctx.annotations.insert(entity, override_.clone()) != Some(override_) {
                trace!("'{}': {} {} uses a dword block", func.name, inst.op.mnemonic(), inst_id);
                changed = true;
            }
        }
        Ok(PassResult::from_changed(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileOptions;
    use crate::ir::{parse_module, FuncId, InstId};
    use crate::metadata::AnnotationTable;
    use crate::passes::with_test_context;

    #[test]
    fn subdword_accesses_get_dword_blocks() {
        let mut module = parse_module(
            "t",
            "kernel @k(%p: ptr1, %v: i16) {
            entry:
              %a = load %p : i8
              %b = load %p : i32
              store %v, %p
              ret
            }",
        )
        .unwrap();
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        let results: Vec<PassResult> = with_test_context(&mut options, &mut annotations, |ctx| {
            (0..2).map(|_| SubdwordBlockType.run(PassUnit::Function(FuncId(0)), &mut module, ctx).unwrap()).collect()
        });
        assert_eq!(results, vec![PassResult::Changed, PassResult::Unchanged]);
        assert_eq!(annotations.block_type(FuncId(0), InstId(0)), Some(BlockType::D32));
        assert_eq!(annotations.block_type(FuncId(0), InstId(1)), None);
        assert_eq!(annotations.block_type(FuncId(0), InstId(2)), Some(BlockType::D32));
    }
}
