// This module defines the pass framework and hosts the kernel-graph transformation passes.
// A pass implements the Pass trait: a descriptor naming it, its scope (whole module or one
// function at a time), the analyses it requires and the analyses it preserves, plus a run
// method that reports Changed or Unchanged. PassRegistry maps unique names to constructors
// and rejects duplicates. PassPipeline runs passes strictly in order over one module: for a
// function-scoped pass it visits every function definition, ensures the required analyses
// for that function first, and after a Changed result drops every cached analysis the pass
// did not preserve, either for that function or, for module passes, for all of them. The
// pass context carries the explicit options record, the annotation side table, the
// analysis cache and the compilation session; no pass reaches for global state.

//! Pass trait, registry, pipeline and the built-in passes.

pub mod block_type;
pub mod const_fold;
pub mod devicelib;
pub mod eu_fusion;
pub mod inlining;
pub mod kernel_md;
pub mod loop_unroll;
pub mod stack_usage;

pub use block_type::SubdwordBlockType;
pub use const_fold::FoldPredefinedConstants;
pub use devicelib::PruneDevicelibAssert;
pub use eu_fusion::DisableEuFusionOnDivergence;
pub use inlining::DisableInlining;
pub use kernel_md::KernelInternalMetadata;
pub use loop_unroll::DisableLoopUnrollOnRetry;
pub use stack_usage::ComputeStackUsage;

use crate::analysis::{AnalysisCache, AnalysisKind};
use crate::core::{CompilationSession, CompileError, CompileOptions, CompileResult};
use crate::ir::{FuncId, Module};
use crate::metadata::AnnotationTable;
use hashbrown::HashMap;
use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassScope {
    Module,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassDescriptor {
    pub name: &'static str,
    pub scope: PassScope,
    pub requires: &'static [AnalysisKind],
    pub preserves: &'static [AnalysisKind],
}

/// The unit a pass invocation operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassUnit {
    Module,
    Function(FuncId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Changed,
    Unchanged,
}

impl PassResult {
    pub fn changed(self) -> bool {
        self == PassResult::Changed
    }

    pub fn from_changed(changed: bool) -> Self {
        if changed {
            PassResult::Changed
        } else {
            PassResult::Unchanged
        }
    }
}

impl fmt::Display for PassResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.changed() { "changed" } else { "unchanged" })
    }
}

/// State shared by every pass of one pipeline run.
pub struct PassContext<'a, 'arena> {
    pub options: &'a mut CompileOptions,
    pub annotations: &'a mut AnnotationTable,
    pub analyses: &'a mut AnalysisCache,
    pub session: &'a CompilationSession<'arena>,
}

pub trait Pass {
    fn descriptor(&self) -> PassDescriptor;

    fn run(&mut self, unit: PassUnit, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult>;
}

pub type PassConstructor = fn() -> Box<dyn Pass>;

#[derive(Default)]
pub struct PassRegistry {
    constructors: HashMap<&'static str, PassConstructor>,
    order: Vec<&'static str>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in pass.
    pub fn with_builtin_passes() -> Self {
        let mut registry = Self::new();
        let builtins: [(&'static str, PassConstructor); 8] = [
            (kernel_md::NAME, || Box::new(KernelInternalMetadata)),
            (devicelib::NAME, || Box::new(PruneDevicelibAssert)),
            (inlining::NAME, || Box::new(DisableInlining)),
            (const_fold::NAME, || Box::new(FoldPredefinedConstants)),
            (loop_unroll::NAME, || Box::new(DisableLoopUnrollOnRetry)),
            (block_type::NAME, || Box::new(SubdwordBlockType)),
            (stack_usage::NAME, || Box::new(ComputeStackUsage)),
            (eu_fusion::NAME, || Box::new(DisableEuFusionOnDivergence)),
        ];
        for (name, ctor) in builtins {
            registry.constructors.insert(name, ctor);
            registry.order.push(name);
        }
        registry
    }

    pub fn register(&mut self, name: &'static str, ctor: PassConstructor) -> CompileResult<()> {
        if self.constructors.contains_key(name) {
            return Err(CompileError::DuplicatePass { name: name.to_string() });
        }
        self.constructors.insert(name, ctor);
        self.order.push(name);
        Ok(())
    }

    pub fn create(&self, name: &str) -> CompileResult<Box<dyn Pass>> {
        self.constructors
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| CompileError::UnknownPass { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[&'static str] {
        &self.order
    }
}

#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn from_names(registry: &PassRegistry, names: &[&str]) -> CompileResult<Self> {
        let passes = names.iter().map(|name| registry.create(name)).collect::<CompileResult<_>>()?;
        Ok(Self { passes })
    }

    /// The standard pipeline for `options`.
    pub fn default_pipeline(registry: &PassRegistry, options: &CompileOptions) -> CompileResult<Self> {
        let mut names = vec![kernel_md::NAME, devicelib::NAME];
        if options.disable_inlining {
            names.push(inlining::NAME);
        }
        names.push(const_fold::NAME);
        if options.retry {
            names.push(loop_unroll::NAME);
        }
        names.extend([block_type::NAME, stack_usage::NAME, eu_fusion::NAME]);
        Self::from_names(registry, &names)
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.descriptor().name).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run every pass in order. Returns whether any pass changed the module.
    pub fn run(&mut self, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<bool> {
        let mut any_changed = false;
        for pass in &mut self.passes {
            let desc = pass.descriptor();
            let units: Vec<PassUnit> = match desc.scope {
                PassScope::Module => vec![PassUnit::Module],
                PassScope::Function => module
                    .func_ids()
                    .filter(|f| !module.func(*f).is_declaration())
                    .map(PassUnit::Function)
                    .collect(),
            };

            for unit in units {
                let targets: Vec<FuncId> = match unit {
                    PassUnit::Module => {
                        module.func_ids().filter(|f| !module.func(*f).is_declaration()).collect()
                    }
                    PassUnit::Function(f) => vec![f],
                };
                for f in targets {
                    for kind in desc.requires {
                        ctx.analyses.ensure(module, f, *kind);
                    }
                }

                let result = pass.run(unit, module, ctx)?;
                ctx.session.record_pass_run(desc.name, result.changed());
                match unit {
                    PassUnit::Module => debug!("{}: {}", desc.name, result),
                    PassUnit::Function(f) => debug!("{} on '{}': {}", desc.name, module.func(f).name, result),
                }
                if result.changed() {
                    any_changed = true;
                    let scope = match unit {
                        PassUnit::Module => None,
                        PassUnit::Function(f) => Some(f),
                    };
                    ctx.analyses.invalidate(scope, desc.preserves);
                }
            }
        }
        Ok(any_changed)
    }
}

/// Runs `f` against a fresh context; used by the pass unit tests.
#[cfg(test)]
pub(crate) fn with_test_context<R>(
    options: &mut CompileOptions,
    annotations: &mut AnnotationTable,
    f: impl FnOnce(&mut PassContext<'_, '_>) -> R,
) -> R {
    let arena = bumpalo::Bump::new();
    let session = CompilationSession::new(&arena);
    let mut analyses = AnalysisCache::new();
    let mut ctx = PassContext { options, annotations, analyses: &mut analyses, session: &session };
    f(&mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ALL_ANALYSES;
    use crate::ir::parse_module;

    struct CountingPass {
        preserves: &'static [AnalysisKind],
    }

    impl Pass for CountingPass {
        fn descriptor(&self) -> PassDescriptor {
            PassDescriptor {
                name: "counting",
                scope: PassScope::Function,
                requires: &[AnalysisKind::Divergence],
                preserves: self.preserves,
            }
        }

        fn run(&mut self, unit: PassUnit, _: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
            let PassUnit::Function(f) = unit else {
                return Ok(PassResult::Unchanged);
            };
            assert!(ctx.analyses.divergence(f).is_some());
            Ok(PassResult::Changed)
        }
    }

    const SRC: &str = "
        kernel @k() {
        entry:
          ret
        }
        declare @ext()
        func @g() {
        entry:
          ret
        }";

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = PassRegistry::with_builtin_passes();
        let err = registry.register(eu_fusion::NAME, || Box::new(DisableEuFusionOnDivergence));
        assert!(matches!(err, Err(CompileError::DuplicatePass { .. })));
        registry.register("counting", || Box::new(CountingPass { preserves: &[] })).unwrap();
        assert!(registry.contains("counting"));
        assert!(matches!(
            PassPipeline::from_names(&registry, &["nope"]),
            Err(CompileError::UnknownPass { .. })
        ));
    }

    #[test]
    fn default_pipeline_follows_options() {
        let registry = PassRegistry::with_builtin_passes();
        let plain = PassPipeline::default_pipeline(&registry, &CompileOptions::new()).unwrap();
        assert!(!plain.pass_names().contains(&loop_unroll::NAME));
        assert!(!plain.pass_names().contains(&inlining::NAME));
        assert_eq!(plain.pass_names().first(), Some(&kernel_md::NAME));

        let retry = CompileOptions::new().with_retry(true).with_disable_inlining(true);
        let names = PassPipeline::default_pipeline(&registry, &retry).unwrap().pass_names();
        assert_eq!(names.len(), 8);
        let unroll = names.iter().position(|n| *n == loop_unroll::NAME).unwrap();
        let fold = names.iter().position(|n| *n == const_fold::NAME).unwrap();
        assert!(fold < unroll);
    }

    #[test]
    fn function_passes_visit_definitions_and_invalidate() {
        let mut module = parse_module("t", SRC).unwrap();
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        let arena = bumpalo::Bump::new();
        let session = CompilationSession::new(&arena);
        let mut analyses = AnalysisCache::new();
        let mut ctx = PassContext {
            options: &mut options,
            annotations: &mut annotations,
            analyses: &mut analyses,
            session: &session,
        };

        let mut pipeline = PassPipeline::new();
        pipeline.push(Box::new(CountingPass { preserves: &[] }));
        assert!(pipeline.run(&mut module, &mut ctx).unwrap());
        assert_eq!(session.stats().passes_run, 2);
        assert!(!ctx.analyses.is_cached(FuncId(0), AnalysisKind::Divergence));
        assert!(!ctx.analyses.is_cached(FuncId(2), AnalysisKind::PostDominators));

        let mut preserving = PassPipeline::new();
        preserving.push(Box::new(CountingPass { preserves: ALL_ANALYSES }));
        preserving.run(&mut module, &mut ctx).unwrap();
        assert!(ctx.analyses.is_cached(FuncId(0), AnalysisKind::Divergence));
        assert!(!ctx.analyses.is_cached(FuncId(1), AnalysisKind::Divergence));
    }
}
