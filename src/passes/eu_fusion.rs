// This module implements the pass that disables EU fusion when a fused dual-issue
// instruction can execute under divergent control flow. Fused EU pairs split such an
// instruction across both halves, which is unsafe when the halves disagree on the lane mask.
// The pass scans one function top to bottom and stops at the first dual-issue instruction
// inside divergent control flow, setting the module-wide option. The option is a single
// boolean, so once it is set the pass returns immediately without scanning. The pipeline
// invokes the pass once per function definition, so every function of the module is covered
// until the first hit.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::{AnalysisKind, ALL_ANALYSES};
use crate::core::{CompileError, CompileResult};
use crate::ir::Module;
use log::debug;

pub const NAME: &str = "disable-eu-fusion-on-divergence";

pub struct DisableEuFusionOnDivergence;

impl Pass for DisableEuFusionOnDivergence {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor {
            name: NAME,
            scope: PassScope::Function,
            requires: &[AnalysisKind::Divergence, AnalysisKind::CompileOptions],
            preserves: ALL_ANALYSES,
        }
    }

    fn run(&mut self, unit: PassUnit, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        if ctx.options.disable_eu_fusion {
            return Ok(PassResult::Unchanged);
        }
        let PassUnit::Function(id) = unit else {
            return Ok(PassResult::Unchanged);
        };
        let func = module.func(id);
        let divergence = ctx.analyses.divergence(id).ok_or_else(|| CompileError::Contract {
            reason: format!("{NAME} ran on '{}' without divergence analysis", func.name),
        })?;

        let hit = func
            .live_insts()
            .map(|(_, inst)| inst)
            .find(|inst| func.inst(*inst).op.is_fused_dual_issue() && divergence.inside_divergent_cf(*inst));
        match hit {
            Some(inst) => {
                debug!(
                    "'{}': {} {} is under divergent control flow, disabling EU fusion",
                    func.name,
                    func.inst(inst).op.mnemonic(),
                    inst
                );
                ctx.options.disable_eu_fusion = true;
                Ok(PassResult::Changed)
            }
            None => Ok(PassResult::Unchanged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileOptions;
    use crate::ir::{parse_module, FuncId};
    use crate::metadata::AnnotationTable;
    use crate::passes::with_test_context;

    const DIVERGENT_DPAS: &str = "
        kernel @k(%a: <8 x f32>, %b: <8 x f32>) {
        entry:
          %lid = lane_id : i32
          %c = cmp.lt %lid, i32 4 : i1
          condbr %c, ^then, ^join
        then:
          %d = dpas %a, %a, %b : <8 x f32>
          br ^join
        join:
          ret
        }";

    fn run_once(module: &mut Module, options: &mut CompileOptions) -> PassResult {
        let mut annotations = AnnotationTable::new();
        with_test_context(options, &mut annotations, |ctx| {
            ctx.analyses.ensure(module, FuncId(0), AnalysisKind::Divergence);
            DisableEuFusionOnDivergence.run(PassUnit::Function(FuncId(0)), module, ctx).unwrap()
        })
    }

    #[test]
    fn divergent_dpas_disables_fusion_once() {
        let mut module = parse_module("t", DIVERGENT_DPAS).unwrap();
        let mut options = CompileOptions::new();
        assert_eq!(run_once(&mut module, &mut options), PassResult::Changed);
        assert!(options.disable_eu_fusion);
        assert_eq!(run_once(&mut module, &mut options), PassResult::Unchanged);
        assert!(options.disable_eu_fusion);
    }

    #[test]
    fn uniform_dpas_keeps_fusion() {
        let src = DIVERGENT_DPAS.replace("cmp.lt %lid, i32 4", "cmp.lt i32 3, i32 4");
        let mut module = parse_module("t", &src).unwrap();
        let mut options = CompileOptions::new();
        assert_eq!(run_once(&mut module, &mut options), PassResult::Unchanged);
        assert!(!options.disable_eu_fusion);
    }

    #[test]
    fn missing_analysis_is_a_contract_error() {
        let mut module = parse_module("t", DIVERGENT_DPAS).unwrap();
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        let result = with_test_context(&mut options, &mut annotations, |ctx| {
            DisableEuFusionOnDivergence.run(PassUnit::Function(FuncId(0)), &mut module, ctx)
        });
        assert!(matches!(result, Err(CompileError::Contract { .. })));
    }
}
