// This module implements the pass that creates the internal ABI metadata of every kernel.
// The metadata is built once: a kernel that already has a KernelInternal annotation keeps
// it, so running the pass again, or after a clone was rebound, changes nothing. Argument
// layout follows the module data layout, or the default little-endian 64-bit layout when
// the module has none.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::ALL_ANALYSES;
use crate::core::CompileResult;
use crate::ir::Module;
use crate::metadata::{Annotation, AnnotationKind, EntityId, KernelInternal};
use log::debug;

pub const NAME: &str = "kernel-internal-metadata";

pub struct KernelInternalMetadata;

impl Pass for KernelInternalMetadata {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor { name: NAME, scope: PassScope::Module, requires: &[], preserves: ALL_ANALYSES }
    }

    fn run(&mut self, _unit: PassUnit, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let dl = module.data_layout.unwrap_or_default();
        let mut created = 0;
        for id in module.kernels() {
            let func = module.func(id);
            let entity = EntityId::Function(id);
            if func.is_declaration() || ctx.annotations.contains(entity, AnnotationKind::KernelInternal) {
                continue;
            }
            let md = KernelInternal::build(id, func, &dl);
            debug!(
                "'{}': {} argument slot(s), implicit args at {}, {} binding(s)",
                func.name,
                md.linearization.len(),
                md.implicit_arg_offset,
                md.bti.len()
            );
            ctx.annotations.insert(entity, Annotation::KernelInternal(md));
            created += 1;
        }
        Ok(PassResult::from_changed(created > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileOptions;
    use crate::ir::{parse_module, FuncId};
    use crate::metadata::AnnotationTable;
    use crate::passes::with_test_context;

    #[test]
    fn metadata_is_created_once_per_kernel() {
        let mut module = parse_module(
            "t",
            "kernel @k(%buf: ptr1, %n: i32) {
            entry:
              ret
            }
            func @helper() {
            entry:
              ret
            }",
        )
        .unwrap();
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        let results: Vec<PassResult> = with_test_context(&mut options, &mut annotations, |ctx| {
            (0..2).map(|_| KernelInternalMetadata.run(PassUnit::Module, &mut module, ctx).unwrap()).collect()
        });
        assert_eq!(results, vec![PassResult::Changed, PassResult::Unchanged]);
        let md = annotations.kernel_internal(FuncId(0)).unwrap();
        assert_eq!(md.function, FuncId(0));
        assert_eq!(md.bti_of(0), Some(0));
        assert_eq!(md.implicit_arg_offset, 32);
        assert!(annotations.kernel_internal(FuncId(1)).is_none());
    }
}
