//! Loop structure recognition.
//!
//! Implements Havlak's nesting algorithm (Havlak, "Nesting of Reducible and
//! Irreducible Loops", Rice University), itself derived from Tarjan. Tree
//! balancing is avoided in favour of plain path compression, and the
//! variable naming follows the paper: `w` is the candidate header, `P` the
//! loop body under construction, back-edges come from DFS descendants.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{EntityRef, PrimaryMap};
use log::debug;
use std::collections::VecDeque;

use crate::cfg::ControlFlowGraph;
use crate::fx::FxHashSet;
use crate::ir::{Bb, Func, LoopId, Unit};

/// Nodes with more non-back-predecessors than this mark a degenerate input;
/// loop finding is abandoned for the whole function.
const MAX_NON_BACK_PREDS: usize = 32 * 1024;

/// One loop: a header, the back-edge bottom, member blocks, and the links
/// of the loop forest. Blocks of nested loops live in the child, not here.
pub struct SimpleLoop {
    pub header: PackedOption<Bb>,
    pub bottom: PackedOption<Bb>,
    pub nodes: Vec<Bb>,
    pub children: Vec<LoopId>,
    pub parent: PackedOption<LoopId>,
    pub is_root: bool,
    pub is_reducible: bool,
    /// 0 for innermost loops; the artificial root is one above the deepest
    /// top-level loop.
    pub nesting_level: u32,
}

impl SimpleLoop {
    fn new(is_root: bool) -> Self {
        Self {
            header: None.into(),
            bottom: None.into(),
            nodes: Vec::new(),
            children: Vec::new(),
            parent: None.into(),
            is_root,
            is_reducible: true,
            nesting_level: 0,
        }
    }
}

/// The loop forest of one function. All loops hang off an artificial root.
pub struct LoopStructureGraph {
    loops: PrimaryMap<LoopId, SimpleLoop>,
    root: LoopId,
}

impl LoopStructureGraph {
    pub fn new() -> Self {
        let mut loops = PrimaryMap::new();
        let root = loops.push(SimpleLoop::new(true));
        Self { loops, root }
    }

    /// The artificial root loop.
    pub fn root(&self) -> LoopId {
        self.root
    }

    /// Number of real loops, the root excluded.
    pub fn num_loops(&self) -> usize {
        self.loops.len() - 1
    }

    /// The data of `id`.
    pub fn get(&self, id: LoopId) -> &SimpleLoop {
        &self.loops[id]
    }

    /// Iterate all loops including the root.
    pub fn loops(&self) -> impl Iterator<Item = LoopId> + '_ {
        self.loops.keys()
    }

    fn create_loop(&mut self) -> LoopId {
        self.loops.push(SimpleLoop::new(false))
    }

    /// Throw the whole forest away; used when the input degenerates.
    pub fn kill_all(&mut self) {
        self.loops.clear();
        self.root = self.loops.push(SimpleLoop::new(true));
    }

    /// Attach parentless loops to the root, populate the child lists, and
    /// assign nesting levels: innermost loops get 0, every other loop one
    /// more than its deepest child.
    pub fn calculate_nesting_level(&mut self) {
        let root = self.root;
        let ids: Vec<LoopId> = self.loops.keys().collect();
        for &id in &ids {
            self.loops[id].children.clear();
        }
        for &id in &ids {
            if id != root && self.loops[id].parent.is_none() {
                self.loops[id].parent = root.into();
            }
        }
        for &id in &ids {
            if let Some(parent) = self.loops[id].parent.expand() {
                self.loops[parent].children.push(id);
            }
        }

        // Post-order walk from the root computing levels bottom-up.
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                let level = self.loops[id]
                    .children
                    .iter()
                    .map(|&c| self.loops[c].nesting_level + 1)
                    .max()
                    .unwrap_or(0);
                self.loops[id].nesting_level = level;
            } else {
                stack.push((id, true));
                for i in 0..self.loops[id].children.len() {
                    stack.push((self.loops[id].children[i], false));
                }
            }
        }
    }

    /// Log the forest in text form.
    pub fn dump(&self, cfg: &ControlFlowGraph) {
        for id in self.loops() {
            let l = &self.loops[id];
            if l.is_root {
                debug!("lsg: root, level {}, {} loops", l.nesting_level, self.num_loops());
                continue;
            }
            debug!(
                "lsg: loop {} header {} bottom {} level {}, {} nodes{}",
                id,
                l.header.expand().map_or("?".to_string(), |bb| cfg.block(bb).label.to_string()),
                l.bottom.expand().map_or("?".to_string(), |bb| cfg.block(bb).label.to_string()),
                l.nesting_level,
                l.nodes.len(),
                if l.is_reducible { "" } else { " (irreducible)" },
            );
        }
    }

    /// The cached loop forest for `func`, computing it (and the CFG it
    /// needs) on first use.
    pub fn get_or_build(unit: &mut Unit, func: Func, conservative: bool) -> &LoopStructureGraph {
        if unit.funcs[func].lsg.is_none() {
            ControlFlowGraph::get_or_build(unit, func, conservative);
            let cfg = unit.funcs[func].cfg.as_ref().unwrap();
            let mut lsg = LoopStructureGraph::new();
            find_loops(cfg, &mut lsg);
            unit.funcs[func].lsg = Some(lsg);
        }
        unit.funcs[func].lsg.as_ref().unwrap()
    }
}

impl Default for LoopStructureGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification of a node during the main pass.
#[derive(Copy, Clone, PartialEq, Eq)]
enum BbClass {
    NonHeader,
    Reducible,
    SelfLoop,
    Irreducible,
    Dead,
}

const UNVISITED: u32 = u32::MAX;

/// Find all loops of `cfg` and build the forest in `lsg`.
pub fn find_loops(cfg: &ControlFlowGraph, lsg: &mut LoopStructureGraph) {
    let size = cfg.num_blocks();
    if size == 0 {
        return;
    }

    // Step a: depth-first numbering from the source. `last[w]` is the
    // highest DFS number in w's subtree, making ancestorship a range check.
    let mut number = vec![UNVISITED; size];
    let mut nodes: Vec<PackedOption<Bb>> = vec![None.into(); size];
    let mut last = vec![0u32; size];
    dfs(cfg, &mut number, &mut nodes, &mut last);

    let is_ancestor = |w: u32, v: u32, last: &[u32]| w <= v && v <= last[w as usize];

    // Step b: split each node's predecessors into back-edges (from DFS
    // descendants) and the rest.
    let mut back_preds: Vec<Vec<u32>> = vec![Vec::new(); size];
    let mut non_back_preds: Vec<FxHashSet<u32>> = vec![FxHashSet::default(); size];
    let mut class = vec![BbClass::NonHeader; size];
    for w in 0..size as u32 {
        let node_w = match nodes[w as usize].expand() {
            Some(bb) => bb,
            None => {
                class[w as usize] = BbClass::Dead;
                continue;
            }
        };
        for v_bb in cfg.preds(node_w) {
            let v = number[v_bb.index()];
            if v == UNVISITED {
                continue; // dead predecessor
            }
            if is_ancestor(w, v, &last) {
                back_preds[w as usize].push(v);
            } else {
                non_back_preds[w as usize].insert(v);
            }
        }
    }

    // Union-find over DFS numbers, path compression only.
    let mut parent: Vec<u32> = (0..size as u32).collect();
    fn find_set(parent: &mut [u32], n: u32) -> u32 {
        let mut compress = Vec::new();
        let mut node = n;
        while node != parent[node as usize] {
            if parent[node as usize] != parent[parent[node as usize] as usize] {
                compress.push(node);
            }
            node = parent[node as usize];
        }
        for c in compress {
            parent[c as usize] = node;
        }
        node
    }

    let mut loop_of: Vec<Option<LoopId>> = vec![None; size];

    // Step c: walk nodes in reverse DFS order so inner loop headers are
    // processed before enclosing ones. For each header candidate `w`, chase
    // upward from the sources of its back-edges, collecting the body `P`.
    for w in (0..size as u32).rev() {
        let node_w = match nodes[w as usize].expand() {
            Some(bb) => bb,
            None => continue,
        };

        // Step d.
        let mut p: Vec<u32> = Vec::new();
        for &v in &back_preds[w as usize] {
            if v != w {
                let rep = find_set(&mut parent, v);
                if !p.contains(&rep) {
                    p.push(rep);
                }
            } else {
                class[w as usize] = BbClass::SelfLoop;
            }
        }

        let mut worklist: VecDeque<u32> = p.iter().copied().collect();
        if !p.is_empty() {
            class[w as usize] = BbClass::Reducible;
        }

        // Step e: a chase that reaches a non-descendant of `w` means the
        // loop has a second entry, making it irreducible.
        while let Some(x) = worklist.pop_front() {
            if non_back_preds[x as usize].len() > MAX_NON_BACK_PREDS {
                lsg.kill_all();
                return;
            }
            let preds_of_x: Vec<u32> = non_back_preds[x as usize].iter().copied().collect();
            for y in preds_of_x {
                let ydash = find_set(&mut parent, y);
                if !is_ancestor(w, ydash, &last) {
                    class[w as usize] = BbClass::Irreducible;
                    non_back_preds[w as usize].insert(ydash);
                } else if ydash != w && !p.contains(&ydash) {
                    worklist.push_back(ydash);
                    p.push(ydash);
                }
            }
        }

        // Collapse the SCC into `w` and record the loop.
        if !p.is_empty() || class[w as usize] == BbClass::SelfLoop {
            let id = lsg.create_loop();
            lsg.loops[id].header = node_w.into();
            lsg.loops[id].bottom = nodes[back_preds[w as usize][0] as usize];
            lsg.loops[id].is_reducible = class[w as usize] != BbClass::Irreducible;
            lsg.loops[id].nodes.push(node_w);
            loop_of[w as usize] = Some(id);

            for &node in &p {
                parent[node as usize] = w;
                // Nested loops are linked, not merged.
                match loop_of[node as usize] {
                    Some(inner) => lsg.loops[inner].parent = id.into(),
                    None => lsg.loops[id].nodes.push(nodes[node as usize].unwrap()),
                }
            }
        }
    }

    lsg.calculate_nesting_level();
}

/// Iterative preorder DFS along out-edges.
fn dfs(
    cfg: &ControlFlowGraph,
    number: &mut [u32],
    nodes: &mut [PackedOption<Bb>],
    last: &mut [u32],
) {
    let mut current = 0u32;
    let source = cfg.source();
    number[source.index()] = current;
    nodes[current as usize] = source.into();
    current += 1;

    let mut stack: Vec<(Bb, usize)> = vec![(source, 0)];
    while !stack.is_empty() {
        let (bb, edge_ix) = {
            let top = stack.last_mut().unwrap();
            let frame = *top;
            top.1 += 1;
            frame
        };
        let out = &cfg.block(bb).out_edges;
        if edge_ix < out.len() {
            let target = cfg.edge(out[edge_ix]).dest;
            if number[target.index()] == UNVISITED {
                number[target.index()] = current;
                nodes[current as usize] = target.into();
                current += 1;
                stack.push((target, 0));
            }
        } else {
            last[number[bb.index()] as usize] = current - 1;
            stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{branch, build_func, rr, E};
    use crate::x86::{Insn, Op};

    fn label_of(cfg: &ControlFlowGraph, bb: Bb) -> String {
        cfg.block(bb).label.to_string()
    }

    fn build_lsg(program: Vec<E>) -> (ControlFlowGraph, LoopStructureGraph) {
        let mut f = build_func(program);
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let mut lsg = LoopStructureGraph::new();
        find_loops(&cfg, &mut lsg);
        (cfg, lsg)
    }

    #[test]
    fn straight_line_has_no_loops() {
        let (_cfg, lsg) = build_lsg(vec![
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(Insn::new(Op::Ret)),
        ]);
        assert_eq!(lsg.num_loops(), 0);
        assert_eq!(lsg.get(lsg.root()).nesting_level, 0);
    }

    #[test]
    fn diamond_with_backedge() {
        // entry -> A -> {B, C}, B -> A back-edge, B -> C fallthrough.
        let (cfg, lsg) = build_lsg(vec![
            E::L(".LA"),
            E::I(rr(Op::Cmp, "eax", "ebx")),
            E::I(branch(Op::Je, ".LC")),
            E::I(rr(Op::Add, "ecx", "edx")),
            E::I(branch(Op::Jne, ".LA")),
            E::L(".LC"),
            E::I(Insn::new(Op::Ret)),
        ]);
        assert_eq!(lsg.num_loops(), 1);
        let id = lsg.loops().find(|&l| l != lsg.root()).unwrap();
        let l = lsg.get(id);
        assert_eq!(label_of(&cfg, l.header.unwrap()), ".LA");
        // The bottom is the source of the back-edge: the fallthrough block
        // holding the jne.
        let bottom = l.bottom.unwrap();
        assert!(cfg.succs(bottom).any(|s| s == l.header.unwrap()));
        assert!(l.is_reducible);
        assert_eq!(l.nesting_level, 0);
        let mut members: Vec<String> = l.nodes.iter().map(|&bb| label_of(&cfg, bb)).collect();
        members.sort();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], ".LA");
        assert_eq!(lsg.get(lsg.root()).nesting_level, 1);
    }

    #[test]
    fn self_edge_only_loop() {
        let (cfg, lsg) = build_lsg(vec![E::L(".L1"), E::I(branch(Op::Jmp, ".L1"))]);
        assert_eq!(lsg.num_loops(), 1);
        let id = lsg.loops().find(|&l| l != lsg.root()).unwrap();
        let l = lsg.get(id);
        assert_eq!(l.header, l.bottom);
        assert_eq!(label_of(&cfg, l.header.unwrap()), ".L1");
        assert!(l.is_reducible);
        assert_eq!(l.nodes.len(), 1);
    }

    #[test]
    fn nested_loops_nesting_levels() {
        let (cfg, lsg) = build_lsg(vec![
            E::L(".LO"),
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::L(".LI"),
            E::I(rr(Op::Add, "ecx", "edx")),
            E::I(branch(Op::Jne, ".LI")),
            E::I(branch(Op::Jne, ".LO")),
            E::I(Insn::new(Op::Ret)),
        ]);
        assert_eq!(lsg.num_loops(), 2);
        let inner = lsg
            .loops()
            .find(|&l| {
                l != lsg.root() && label_of(&cfg, lsg.get(l).header.unwrap()) == ".LI"
            })
            .unwrap();
        let outer = lsg
            .loops()
            .find(|&l| {
                l != lsg.root() && label_of(&cfg, lsg.get(l).header.unwrap()) == ".LO"
            })
            .unwrap();
        assert_eq!(lsg.get(inner).parent.expand(), Some(outer));
        assert_eq!(lsg.get(inner).nesting_level, 0);
        assert_eq!(lsg.get(outer).nesting_level, 1);
        assert_eq!(lsg.get(lsg.root()).nesting_level, 2);
        assert!(lsg.get(outer).children.contains(&inner));
    }

    #[test]
    fn irreducible_region_detected() {
        // A branches into the middle of a cycle B <-> C: the C-headed loop
        // has a second entry and is irreducible.
        let (_cfg, lsg) = build_lsg(vec![
            E::I(rr(Op::Cmp, "eax", "ebx")),
            E::I(branch(Op::Je, ".LC")),
            E::L(".LB"),
            E::I(rr(Op::Add, "ecx", "edx")),
            E::L(".LC"),
            E::I(rr(Op::Sub, "esi", "edi")),
            E::I(branch(Op::Jne, ".LB")),
            E::I(Insn::new(Op::Ret)),
        ]);
        assert_eq!(lsg.num_loops(), 1);
        let id = lsg.loops().find(|&l| l != lsg.root()).unwrap();
        assert!(!lsg.get(id).is_reducible);
    }

    #[test]
    fn kill_all_resets_forest() {
        let (_cfg, mut lsg) = build_lsg(vec![E::L(".L1"), E::I(branch(Op::Jmp, ".L1"))]);
        assert_eq!(lsg.num_loops(), 1);
        lsg.kill_all();
        assert_eq!(lsg.num_loops(), 0);
    }

    #[test]
    fn cached_on_function() {
        let mut f = build_func(vec![E::L(".L1"), E::I(branch(Op::Jmp, ".L1"))]);
        let lsg = LoopStructureGraph::get_or_build(&mut f.unit, f.func, false);
        assert_eq!(lsg.num_loops(), 1);
        assert!(f.unit.funcs[f.func].lsg().is_some());
        assert!(f.unit.funcs[f.func].cfg().is_some());
        f.unit.funcs[f.func].invalidate_cfg();
        assert!(f.unit.funcs[f.func].lsg().is_none());
    }
}
