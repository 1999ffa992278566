// This module hosts the analyses passes may require and the per-pipeline cache that holds
// their results. Each analysis is identified by an AnalysisKind and computed per function.
// The pipeline ensures every analysis a pass requires before the pass runs (dependencies
// first: loops need dominators, divergence needs post-dominators) and, when the pass reports
// a change, drops every cached result the pass did not declare preserved. A result that was
// dropped is recomputed on the next request, so no pass ever reads stale dominance or
// divergence information. The compile-options "analysis" is the options record in the pass
// context itself; it is always available and never cached.

//! Analyses over the kernel graph and their per-pipeline cache.

pub mod cfg;
pub mod divergence;

pub use cfg::{block_order, DomTree, Loop, LoopInfo, PostDomTree};
pub use divergence::DivergenceInfo;

use crate::ir::{FuncId, Module};
use hashbrown::HashMap;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisKind {
    Dominators,
    PostDominators,
    Loops,
    Divergence,
    /// The module-wide compile options record.
    CompileOptions,
}

impl AnalysisKind {
    pub fn name(self) -> &'static str {
        match self {
            AnalysisKind::Dominators => "dominators",
            AnalysisKind::PostDominators => "post-dominators",
            AnalysisKind::Loops => "loops",
            AnalysisKind::Divergence => "divergence",
            AnalysisKind::CompileOptions => "compile-options",
        }
    }

    /// Analyses that must be available before this one is computed.
    pub fn dependencies(self) -> &'static [AnalysisKind] {
        match self {
            AnalysisKind::Loops => &[AnalysisKind::Dominators],
            AnalysisKind::Divergence => &[AnalysisKind::PostDominators],
            _ => &[],
        }
    }
}

pub const ALL_ANALYSES: &[AnalysisKind] = &[
    AnalysisKind::Dominators,
    AnalysisKind::PostDominators,
    AnalysisKind::Loops,
    AnalysisKind::Divergence,
    AnalysisKind::CompileOptions,
];

/// Analyses that depend only on block structure.
pub const CFG_ANALYSES: &[AnalysisKind] =
    &[AnalysisKind::Dominators, AnalysisKind::PostDominators, AnalysisKind::Loops, AnalysisKind::CompileOptions];

#[derive(Debug, Clone)]
enum AnalysisResult {
    Dominators(DomTree),
    PostDominators(PostDomTree),
    Loops(LoopInfo),
    Divergence(DivergenceInfo),
}

#[derive(Debug, Default)]
pub struct AnalysisCache {
    results: HashMap<(FuncId, AnalysisKind), AnalysisResult>,
    computations: usize,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `kind` available for `func`, computing it and its dependencies if needed.
    pub fn ensure(&mut self, module: &Module, func: FuncId, kind: AnalysisKind) {
        if kind == AnalysisKind::CompileOptions || self.results.contains_key(&(func, kind)) {
            return;
        }
        for dep in kind.dependencies() {
            self.ensure(module, func, *dep);
        }

        let function = module.func(func);
        let result = match kind {
            AnalysisKind::Dominators => AnalysisResult::Dominators(DomTree::compute(function)),
            AnalysisKind::PostDominators => AnalysisResult::PostDominators(PostDomTree::compute(function)),
            AnalysisKind::Loops => match self.dominators(func) {
                Some(dom) => AnalysisResult::Loops(LoopInfo::compute(function, dom)),
                None => return,
            },
            AnalysisKind::Divergence => match self.post_dominators(func) {
                Some(pdom) => AnalysisResult::Divergence(DivergenceInfo::compute(function, pdom)),
                None => return,
            },
            AnalysisKind::CompileOptions => return,
        };
        trace!("computed {} for '{}'", kind.name(), function.name);
        self.computations += 1;
        self.results.insert((func, kind), result);
    }

    pub fn is_cached(&self, func: FuncId, kind: AnalysisKind) -> bool {
        self.results.contains_key(&(func, kind))
    }

    pub fn dominators(&self, func: FuncId) -> Option<&DomTree> {
        match self.results.get(&(func, AnalysisKind::Dominators))? {
            AnalysisResult::Dominators(dom) => Some(dom),
            _ => None,
        }
    }

    pub fn post_dominators(&self, func: FuncId) -> Option<&PostDomTree> {
        match self.results.get(&(func, AnalysisKind::PostDominators))? {
            AnalysisResult::PostDominators(pdom) => Some(pdom),
            _ => None,
        }
    }

    pub fn loops(&self, func: FuncId) -> Option<&LoopInfo> {
        match self.results.get(&(func, AnalysisKind::Loops))? {
            AnalysisResult::Loops(loops) => Some(loops),
            _ => None,
        }
    }

    pub fn divergence(&self, func: FuncId) -> Option<&DivergenceInfo> {
        match self.results.get(&(func, AnalysisKind::Divergence))? {
            AnalysisResult::Divergence(info) => Some(info),
            _ => None,
        }
    }

    /// Drop cached results not in `preserved`, for one function or for all of them.
    pub fn invalidate(&mut self, func: Option<FuncId>, preserved: &[AnalysisKind]) -> usize {
        let before = self.results.len();
        self.results
            .retain(|(f, kind), _| preserved.contains(kind) || func.is_some_and(|target| target != *f));
        before - self.results.len()
    }

    /// Drop everything, e.g. after functions were added or removed.
    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Number of analysis computations performed so far.
    pub fn computations(&self) -> usize {
        self.computations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    const SRC: &str = "
        kernel @k(%n: i32) {
        entry:
          br ^head
        head:
          %i = phi [i32 0, ^entry], [%i2, ^head] : i32
          %i2 = add %i, i32 1 : i32
          %c = cmp.lt %i2, %n : i1
          condbr %c, ^head, ^exit
        exit:
          ret
        }
        func @g() {
        entry:
          ret
        }";

    #[test]
    fn dependencies_are_computed_once() {
        let module = parse_module("t", SRC).unwrap();
        let mut cache = AnalysisCache::new();
        cache.ensure(&module, FuncId(0), AnalysisKind::Loops);
        assert!(cache.is_cached(FuncId(0), AnalysisKind::Dominators));
        assert_eq!(cache.loops(FuncId(0)).map(|l| l.len()), Some(1));
        assert_eq!(cache.computations(), 2);

        cache.ensure(&module, FuncId(0), AnalysisKind::Loops);
        cache.ensure(&module, FuncId(0), AnalysisKind::CompileOptions);
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn invalidation_respects_preserved_set_and_function() {
        let module = parse_module("t", SRC).unwrap();
        let mut cache = AnalysisCache::new();
        for f in [FuncId(0), FuncId(1)] {
            cache.ensure(&module, f, AnalysisKind::Loops);
            cache.ensure(&module, f, AnalysisKind::Divergence);
        }

        assert_eq!(cache.invalidate(Some(FuncId(0)), CFG_ANALYSES), 1);
        assert!(cache.divergence(FuncId(0)).is_none());
        assert!(cache.divergence(FuncId(1)).is_some());
        assert!(cache.dominators(FuncId(0)).is_some());

        cache.invalidate(None, &[]);
        assert!(cache.dominators(FuncId(1)).is_none());

        let before = cache.computations();
        cache.ensure(&module, FuncId(0), AnalysisKind::Divergence);
        assert_eq!(cache.computations(), before + 2);
    }
}
