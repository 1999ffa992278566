// This module implements the control-flow analyses: block ordering, dominators,
// post-dominators and natural loops. Blocks are ordered in reverse post-order with an
// explicit-stack depth-first walk from the entry. Immediate dominators come from the
// iterative two-finger intersection over that order; post-dominators run the same
// algorithm on the reversed graph, rooted at a virtual exit that every returning block
// flows into, so functions with several returns still have a single root. Blocks that
// cannot reach an exit (infinite loops) have no immediate post-dominator. Loops are found
// from back edges, that is edges whose target dominates their source; all back edges to
// the same header form one loop, and its body is collected by walking predecessors from
// each latch up to the header.

//! Dominator, post-dominator and loop analyses over kernel graph functions.

use crate::ir::{BlockId, Function};

/// Reverse post-order of the nodes reachable from `root` in `succs`.
fn reverse_post_order(root: usize, succs: &[Vec<usize>]) -> Vec<usize> {
    let mut visited = vec![false; succs.len()];
    let mut post = Vec::with_capacity(succs.len());
    // (node, index of the next successor to visit)
    let mut stack = vec![(root, 0usize)];
    visited[root] = true;
    while let Some((node, next)) = stack.last_mut() {
        let node = *node;
        if let Some(&succ) = succs[node].get(*next) {
            *next += 1;
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(node);
            stack.pop();
        }
    }
    post.reverse();
    post
}

/// Immediate dominators of the graph `succs` rooted at `root`. The root maps to itself;
/// unreachable nodes map to `None`.
fn immediate_dominators(root: usize, succs: &[Vec<usize>]) -> Vec<Option<usize>> {
    let n = succs.len();
    let rpo = reverse_post_order(root, succs);
    let mut order = vec![usize::MAX; n];
    for (i, node) in rpo.iter().enumerate() {
        order[*node] = i;
    }
    let mut preds = vec![Vec::new(); n];
    for (node, targets) in succs.iter().enumerate() {
        for t in targets {
            preds[*t].push(node);
        }
    }

    let mut idom: Vec<Option<usize>> = vec![None; n];
    idom[root] = Some(root);
    let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| {
        while a != b {
            while order[a] > order[b] {
                a = idom[a].unwrap_or(root);
            }
            while order[b] > order[a] {
                b = idom[b].unwrap_or(root);
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &node in rpo.iter().skip(1) {
            let mut new_idom = None;
            for &p in &preds[node] {
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, p, cur),
                });
            }
            if new_idom.is_some() && idom[node] != new_idom {
                idom[node] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn successor_lists(func: &Function) -> Vec<Vec<usize>> {
    func.block_ids().map(|b| func.successors(b).iter().map(|s| s.index()).collect()).collect()
}

/// Blocks reachable from the entry, in reverse post-order.
pub fn block_order(func: &Function) -> Vec<BlockId> {
    if func.blocks.is_empty() {
        return Vec::new();
    }
    reverse_post_order(0, &successor_lists(func)).into_iter().map(|b| BlockId(b as u32)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomTree {
    idom: Vec<Option<usize>>,
}

impl DomTree {
    pub fn compute(func: &Function) -> Self {
        if func.blocks.is_empty() {
            return Self { idom: Vec::new() };
        }
        Self { idom: immediate_dominators(0, &successor_lists(func)) }
    }

    /// Immediate dominator; `None` for the entry and for unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let b = block.index();
        match self.idom.get(b).copied().flatten() {
            Some(d) if d != b => Some(BlockId(d as u32)),
            _ => None,
        }
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        matches!(self.idom.get(block.index()), Some(Some(_)))
    }

    /// `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDomTree {
    /// Indexed by block; the last entry is the virtual exit.
    ipdom: Vec<Option<usize>>,
}

impl PostDomTree {
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let exit = n;
        let mut reversed = vec![Vec::new(); n + 1];
        for b in func.block_ids() {
            let succs = func.successors(b);
            if succs.is_empty() {
                reversed[exit].push(b.index());
            }
            for s in succs {
                reversed[s.index()].push(b.index());
            }
        }
        Self { ipdom: immediate_dominators(exit, &reversed) }
    }

    fn exit(&self) -> usize {
        self.ipdom.len() - 1
    }

    /// Immediate post-dominator; `None` when only the virtual exit post-dominates `block`
    /// or when `block` cannot reach an exit.
    pub fn ipdom(&self, block: BlockId) -> Option<BlockId> {
        match self.ipdom.get(block.index()).copied().flatten() {
            Some(p) if p != self.exit() => Some(BlockId(p as u32)),
            _ => None,
        }
    }

    /// `a` post-dominates `b` (reflexive).
    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b.index();
        loop {
            if cur == a.index() {
                return true;
            }
            match self.ipdom.get(cur).copied().flatten() {
                Some(p) if p != cur => cur = p,
                _ => return false,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub header: BlockId,
    /// Sources of the back edges; each carries the loop's metadata on its terminator.
    pub latches: Vec<BlockId>,
    pub blocks: Vec<BlockId>,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopInfo {
    pub loops: Vec<Loop>,
}

impl LoopInfo {
    pub fn compute(func: &Function, dom: &DomTree) -> Self {
        let preds = func.predecessors();
        let mut loops: Vec<Loop> = Vec::new();
        for header in block_order(func) {
            let latches: Vec<BlockId> =
                preds[header.index()].iter().copied().filter(|p| dom.dominates(header, *p)).collect();
            if latches.is_empty() {
                continue;
            }
            let mut blocks = vec![header];
            let mut worklist = latches.clone();
            while let Some(b) = worklist.pop() {
                if blocks.contains(&b) || !dom.is_reachable(b) {
                    continue;
                }
                blocks.push(b);
                worklist.extend(preds[b.index()].iter().copied());
            }
            blocks.sort();
            loops.push(Loop { header, latches, blocks });
        }
        Self { loops }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    fn function(src: &str) -> Function {
        parse_module("t", src).unwrap().functions.remove(0)
    }

    const DIAMOND_LOOP: &str = "
        func @f(%n: i32) {
        entry:
          %c = cmp.lt %n, i32 4 : i1
          condbr %c, ^then, ^else
        then:
          br ^join
        else:
          br ^join
        join:
          %i = phi [i32 0, ^then], [i32 1, ^else], [%i2, ^join] : i32
          %i2 = add %i, i32 1 : i32
          %d = cmp.lt %i2, %n : i1
          condbr %d, ^join, ^exit
        exit:
          ret
        }";

    #[test]
    fn dominators_of_diamond() {
        let f = function(DIAMOND_LOOP);
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(BlockId(0)), None);
        assert_eq!(dom.idom(BlockId(1)), Some(BlockId(0)));
        assert_eq!(dom.idom(BlockId(3)), Some(BlockId(0)));
        assert!(dom.dominates(BlockId(0), BlockId(4)));
        assert!(!dom.dominates(BlockId(1), BlockId(3)));
    }

    #[test]
    fn post_dominators_of_diamond() {
        let f = function(DIAMOND_LOOP);
        let pdom = PostDomTree::compute(&f);
        assert_eq!(pdom.ipdom(BlockId(0)), Some(BlockId(3)));
        assert_eq!(pdom.ipdom(BlockId(1)), Some(BlockId(3)));
        assert_eq!(pdom.ipdom(BlockId(3)), Some(BlockId(4)));
        assert_eq!(pdom.ipdom(BlockId(4)), None);
        assert!(pdom.post_dominates(BlockId(4), BlockId(0)));
        assert!(!pdom.post_dominates(BlockId(1), BlockId(0)));
    }

    #[test]
    fn self_loop_is_found() {
        let f = function(DIAMOND_LOOP);
        let loops = LoopInfo::compute(&f, &DomTree::compute(&f));
        assert_eq!(loops.len(), 1);
        assert_eq!(loops.loops[0].header, BlockId(3));
        assert_eq!(loops.loops[0].latches, vec![BlockId(3)]);
        assert_eq!(loops.loops[0].blocks, vec![BlockId(3)]);
    }

    #[test]
    fn infinite_loop_has_no_post_dominator() {
        let f = function(
            "func @f() {
            entry:
              br ^spin
            spin:
              br ^spin
            }",
        );
        let pdom = PostDomTree::compute(&f);
        assert_eq!(pdom.ipdom(BlockId(0)), None);
        assert_eq!(block_order(&f), vec![BlockId(0), BlockId(1)]);
    }
}
