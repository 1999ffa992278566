// This module implements the disable-inlining pass. Every function definition that is not
// already marked noinline loses its alwaysinline marker and gains noinline, and so does
// every call site inside it. Definitions that already carry noinline are skipped, which
// makes a second run a no-op. Declarations have no call sites and are never touched.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::ALL_ANALYSES;
use crate::core::CompileResult;
use crate::ir::{Module, Opcode};
use log::trace;

pub const NAME: &str = "disable-inlining";

pub struct DisableInlining;

impl Pass for DisableInlining {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor { name: NAME, scope: PassScope::Module, requires: &[], preserves: ALL_ANALYSES }
    }

    fn run(&mut self, _unit: PassUnit, module: &mut Module, _ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let mut changed = false;
        for func in &mut module.functions {
            if func.is_declaration() || func.attrs.no_inline {
                continue;
            }
            func.attrs.always_inline = false;
            func.attrs.no_inline = true;
            let mut call_sites = 0;
            for (_, id) in func.live_insts().collect::<Vec<_>>() {
                let inst = func.inst_mut(id);
                if inst.op == Opcode::Call {
                    inst.call_attrs.always_inline = false;
                    inst.call_attrs.no_inline = true;
                    call_sites += 1;
                }
            }
            trace!("'{}' and {} call site(s) marked noinline", func.name, call_sites);
            changed = true;
        }
        Ok(PassResult::from_changed(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileOptions;
    use crate::ir::{parse_module, FuncId};
    use crate::metadata::AnnotationTable;
    use crate::passes::with_test_context;

    fn run(module: &mut Module) -> PassResult {
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        with_test_context(&mut options, &mut annotations, |ctx| {
            DisableInlining.run(PassUnit::Module, module, ctx).unwrap()
        })
    }

    #[test]
    fn definitions_and_call_sites_become_noinline() {
        let mut module = parse_module(
            "t",
            "declare @ext(%x: i32) -> i32
            func @helper(%x: i32) -> i32 alwaysinline {
            entry:
              %y = call @ext(%x) alwaysinline : i32
              ret %y
            }
            kernel @k(%x: i32) {
            entry:
              %z = call @helper(%x) : i32
              ret
            }",
        )
        .unwrap();
        assert_eq!(run(&mut module), PassResult::Changed);

        for id in [FuncId(1), FuncId(2)] {
            let f = module.func(id);
            assert!(f.attrs.no_inline && !f.attrs.always_inline, "{}", f.name);
            for (_, inst) in f.live_insts() {
                let inst = f.inst(inst);
                if inst.op == Opcode::Call {
                    assert!(inst.call_attrs.no_inline);
                    assert!(!inst.call_attrs.always_inline);
                }
            }
        }
        assert!(!module.func(FuncId(0)).attrs.no_inline);
        assert_eq!(run(&mut module), PassResult::Unchanged);
    }
}
