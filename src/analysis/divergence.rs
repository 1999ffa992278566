// This module implements the divergence analysis. The lane index is the only source of
// divergence; kernel arguments, constants, globals and group ids are uniform. Divergence
// flows forward through data dependences, and a conditional branch on a divergent value
// makes control flow divergent: every block reachable from the branch before its immediate
// post-dominator (the reconvergence point) executes under a partial lane mask, and phis at
// the reconvergence point, or inside the divergent region, merge values from lanes that took
// different paths and are divergent themselves. The two rules feed each other, so the
// analysis iterates to a fixed point.

//! Divergence analysis.

use super::cfg::PostDomTree;
use crate::ir::{BlockId, Function, InstId, Opcode, Value};
use hashbrown::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DivergenceInfo {
    divergent_values: HashSet<InstId>,
    divergent_blocks: HashSet<BlockId>,
    divergent_cf_insts: HashSet<InstId>,
}

impl DivergenceInfo {
    pub fn compute(func: &Function, pdom: &PostDomTree) -> Self {
        let mut info = DivergenceInfo::default();
        let mut handled_branches: HashSet<InstId> = HashSet::new();
        let mut join_blocks: HashSet<BlockId> = HashSet::new();

        let mut changed = true;
        while changed {
            changed = false;
            for (block, id) in func.live_insts() {
                let inst = func.inst(id);
                if !info.divergent_values.contains(&id) && !inst.ty.is_void() {
                    let divergent = match inst.op {
                        Opcode::LaneId => true,
                        Opcode::Phi => {
                            join_blocks.contains(&block)
                                || info.divergent_blocks.contains(&block)
                                || inst.operands.iter().any(|v| info.is_divergent(v))
                        }
                        _ => inst.operands.iter().any(|v| info.is_divergent(v)),
                    };
                    if divergent {
                        info.divergent_values.insert(id);
                        changed = true;
                    }
                }

                if inst.op == Opcode::CondBr
                    && !handled_branches.contains(&id)
                    && inst.operands.first().is_some_and(|c| info.is_divergent(c))
                {
                    handled_branches.insert(id);
                    let join = pdom.ipdom(block);
                    if let Some(join) = join {
                        join_blocks.insert(join);
                    }
                    for b in influence_region(func, block, join) {
                        info.divergent_blocks.insert(b);
                    }
                    changed = true;
                }
            }
        }

        for (block, id) in func.live_insts() {
            if info.divergent_blocks.contains(&block) {
                info.divergent_cf_insts.insert(id);
            }
        }
        info
    }

    pub fn is_divergent(&self, value: &Value) -> bool {
        match value {
            Value::Inst(id) => self.divergent_values.contains(id),
            Value::Arg(_) | Value::Const(_) | Value::Global(_) => false,
        }
    }

    /// The instruction executes under a partial lane mask.
    pub fn inside_divergent_cf(&self, inst: InstId) -> bool {
        self.divergent_cf_insts.contains(&inst)
    }

    pub fn is_divergent_block(&self, block: BlockId) -> bool {
        self.divergent_blocks.contains(&block)
    }

    pub fn divergent_value_count(&self) -> usize {
        self.divergent_values.len()
    }
}

/// Blocks reachable from the successors of `branch` without passing through `join`.
fn influence_region(func: &Function, branch: BlockId, join: Option<BlockId>) -> Vec<BlockId> {
    let mut seen = vec![false; func.blocks.len()];
    let mut region = Vec::new();
    let mut worklist = func.successors(branch);
    while let Some(b) = worklist.pop() {
        if Some(b) == join || seen[b.index()] {
            continue;
        }
        seen[b.index()] = true;
        region.push(b);
        worklist.extend(func.successors(b));
    }
    region
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    fn analyze(src: &str) -> (Function, DivergenceInfo) {
        let f = parse_module("t", src).unwrap().functions.remove(0);
        let info = DivergenceInfo::compute(&f, &PostDomTree::compute(&f));
        (f, info)
    }

    fn inst_named(f: &Function, name: &str) -> InstId {
        f.live_insts()
            .map(|(_, id)| id)
            .find(|id| f.inst(*id).name.as_deref() == Some(name))
            .unwrap()
    }

    #[test]
    fn lane_dependent_branch_makes_region_divergent() {
        let (f, info) = analyze(
            "kernel @k(%n: i32) {
            entry:
              %lid = lane_id : i32
              %c = cmp.lt %lid, %n : i1
              condbr %c, ^then, ^join
            then:
              %x = add %n, i32 1 : i32
              br ^join
            join:
              %p = phi [%x, ^then], [i32 0, ^entry] : i32
              ret
            }",
        );
        assert!(info.is_divergent(&Value::Inst(inst_named(&f, "c"))));
        assert!(info.inside_divergent_cf(inst_named(&f, "x")));
        assert!(!info.is_divergent(&Value::Inst(inst_named(&f, "x"))));
        assert!(info.is_divergent(&Value::Inst(inst_named(&f, "p"))));
        assert!(!info.inside_divergent_cf(inst_named(&f, "p")));
        assert!(!info.is_divergent_block(BlockId(2)));
    }

    #[test]
    fn uniform_branch_is_not_divergent() {
        let (f, info) = analyze(
            "kernel @k(%n: i32) {
            entry:
              %c = cmp.lt %n, i32 8 : i1
              condbr %c, ^then, ^join
            then:
              %x = add %n, i32 1 : i32
              br ^join
            join:
              ret
            }",
        );
        assert!(!info.inside_divergent_cf(inst_named(&f, "x")));
        assert_eq!(info.divergent_value_count(), 0);
    }
}
