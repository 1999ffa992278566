// This module implements the pass that keeps a compilation retry from unrolling loops
// again. Every loop whose metadata carries no explicit unroll request (enable, full or a
// count) and no unroll-disable yet is marked unroll-disable. Loop metadata lives on the
// terminators of the loop's latches; all of them are updated so they stay in agreement.
// Only metadata changes, so every analysis is preserved, and a second run finds every
// loop already marked and reports no change.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::{AnalysisKind, ALL_ANALYSES};
use crate::core::{CompileError, CompileResult};
use crate::ir::{LoopHint, LoopMetadata, Module};
use log::trace;

pub const NAME: &str = "disable-loop-unroll-on-retry";

pub struct DisableLoopUnrollOnRetry;

impl Pass for DisableLoopUnrollOnRetry {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor {
            name: NAME,
            scope: PassScope::Function,
            requires: &[AnalysisKind::Loops],
            preserves: ALL_ANALYSES,
        }
    }

    fn run(&mut self, unit: PassUnit, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let PassUnit::Function(id) = unit else {
            return Ok(PassResult::Unchanged);
        };
        let func = module.func_mut(id);
        let loops = ctx.analyses.loops(id).ok_or_else(|| CompileError::Contract {
            reason: format!("{NAME} ran on '{}' without loop analysis", func.name),
        })?;

        let mut changed = false;
        for lp in &loops.loops {
            let terminators: Vec<_> = lp.latches.iter().filter_map(|b| func.terminator(*b)).collect();
            let hints: Vec<LoopHint> = terminators
                .iter()
                .filter_map(|t| func.inst(*t).loop_md.as_ref())
                .flat_map(|md| md.hints.iter().copied())
                .collect();
            if hints.iter().any(|h| h.requests_unroll() || *h == LoopHint::UnrollDisable) {
                continue;
            }
            for term in terminators {
                let md = func.inst_mut(term).loop_md.get_or_insert_with(LoopMetadata::default);
                md.hints.push(LoopHint::UnrollDisable);
            }
            trace!("'{}': loop at {} marked unroll.disable", func.name, func.block(lp.header).name);
            changed = true;
        }
        Ok(PassResult::from_changed(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileOptions;
    use crate::ir::{parse_module, BlockId, FuncId};
    use crate::metadata::AnnotationTable;
    use crate::passes::with_test_context;

    const LOOPS: &str = "
        func @f(%n: i32) {
        entry:
          br ^a
        a:
          %i = phi [i32 0, ^entry], [%i2, ^a] : i32
          %i2 = add %i, i32 1 : i32
          %c = cmp.lt %i2, %n : i1
          condbr %c, ^a, ^b !loop(mustprogress)
        b:
          %j = phi [i32 0, ^a], [%j2, ^b] : i32
          %j2 = add %j, i32 1 : i32
          %d = cmp.lt %j2, %n : i1
          condbr %d, ^b, ^exit !loop(unroll.count=4)
        exit:
          ret
        }";

    fn run(module: &mut Module) -> PassResult {
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        with_test_context(&mut options, &mut annotations, |ctx| {
            ctx.analyses.ensure(module, FuncId(0), AnalysisKind::Loops);
            DisableLoopUnrollOnRetry.run(PassUnit::Function(FuncId(0)), module, ctx).unwrap()
        })
    }

    #[test]
    fn loops_without_requests_are_disabled_once() {
        let mut module = parse_module("t", LOOPS).unwrap();
        assert_eq!(run(&mut module), PassResult::Changed);

        let f = module.func(FuncId(0));
        let first = f.inst(f.terminator(BlockId(1)).unwrap()).loop_md.clone().unwrap();
        assert_eq!(first.hints, vec![LoopHint::MustProgress, LoopHint::UnrollDisable]);
        let second = f.inst(f.terminator(BlockId(2)).unwrap()).loop_md.clone().unwrap();
        assert!(!second.has(LoopHint::UnrollDisable));

        assert_eq!(run(&mut module), PassResult::Unchanged);
    }

    #[test]
    fn loop_without_metadata_gets_a_node() {
        let src = LOOPS.replace(" !loop(mustprogress)", "");
        let mut module = parse_module("t", &src).unwrap();
        assert_eq!(run(&mut module), PassResult::Changed);
        let f = module.func(FuncId(0));
        let md = f.inst(f.terminator(BlockId(1)).unwrap()).loop_md.as_ref().unwrap();
        assert!(md.has(LoopHint::UnrollDisable));
    }
}
