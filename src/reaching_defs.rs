//! Reaching definitions: a forward may-problem over (block, register)
//! pairs.
//!
//! Every pair of a block and a register it defines gets one bit; a block's
//! definition of a register kills that register's definitions everywhere
//! else. Queries narrow the solved per-block sets down to the defining
//! instructions by walking the block in question backward.

use log::warn;

use crate::bitstring::BitString;
use crate::cfg::ControlFlowGraph;
use crate::dataflow::{self, DataflowProblem, DataflowSolution, Direction};
use crate::fx::FxHashMap;
use crate::ir::{Bb, Entry, EntryData, Unit};
use crate::x86::{self, REG_UNIVERSE_BITS};

/// One reaching definition: the defining instruction, its block, and the
/// register (as a bit in the register universe).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Definition {
    pub insn: Entry,
    pub block: Bb,
    pub reg: u32,
}

/// Registers `insn` defines, with unknown side effects demoted to "defines
/// nothing": an unmodelled instruction never supplies a definition site.
fn def_mask(insn: &x86::Insn) -> BitString {
    let defs = x86::register_def_mask(insn);
    if defs.is_undef() {
        BitString::new(REG_UNIVERSE_BITS)
    } else {
        defs
    }
}

/// All registers defined anywhere in `bb`.
fn block_defs(unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString {
    let mut defined = BitString::new(REG_UNIVERSE_BITS);
    for e in cfg.bb_entries(unit, bb) {
        if let EntryData::Insn(i) = &unit[e].data {
            defined = &defined | &def_mask(&i.insn);
        }
    }
    defined
}

struct ReachingDefsProblem<'a> {
    num_bits: u32,
    index_map: &'a FxHashMap<(Bb, u32), u32>,
    defs_map: &'a [BitString],
}

impl<'a> DataflowProblem for ReachingDefsProblem<'a> {
    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// One bit per (bb, reg) this block defines.
    fn gen_set(&self, unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString {
        let mut current = BitString::new(self.num_bits);
        for reg in block_defs(unit, cfg, bb).iter() {
            current.set(self.index_map[&(bb, reg)]);
        }
        current
    }

    /// Each definition kills the same register's definitions in every
    /// other block.
    fn kill_set(&self, unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString {
        let mut current = BitString::new(self.num_bits);
        for reg in block_defs(unit, cfg, bb).iter() {
            let own = self.index_map[&(bb, reg)];
            let mut others = self.defs_map[reg as usize].clone();
            debug_assert!(others.get(own));
            others.clear(own);
            current = &current | &others;
        }
        current
    }
}

/// A solved reaching-definitions analysis over one CFG.
pub struct ReachingDefs {
    solution: DataflowSolution,
    num_bits: u32,
    index_map: FxHashMap<(Bb, u32), u32>,
    rev_index_map: Vec<(Bb, u32)>,
    /// Per register, the bits of all its definitions in the function.
    defs_map: Vec<BitString>,
}

impl ReachingDefs {
    /// Build the (block, register) index and solve.
    pub fn solve(unit: &Unit, cfg: &ControlFlowGraph) -> ReachingDefs {
        let mut index_map = FxHashMap::default();
        let mut rev_index_map = Vec::new();
        for bb in cfg.blocks() {
            for reg in block_defs(unit, cfg, bb).iter() {
                index_map.insert((bb, reg), rev_index_map.len() as u32);
                rev_index_map.push((bb, reg));
            }
        }
        let num_bits = rev_index_map.len() as u32;

        let mut defs_map = vec![BitString::new(num_bits); REG_UNIVERSE_BITS as usize];
        for (&(_, reg), &ix) in &index_map {
            defs_map[reg as usize].set(ix);
        }

        let problem = ReachingDefsProblem {
            num_bits,
            index_map: &index_map,
            defs_map: &defs_map,
        };
        let solution = dataflow::solve(&problem, unit, cfg);
        ReachingDefs {
            solution,
            num_bits,
            index_map,
            rev_index_map,
            defs_map,
        }
    }

    /// The definitions reaching the start of `bb`.
    pub fn in_set(&self, bb: Bb) -> &BitString {
        self.solution.entry_state(bb)
    }

    /// All definitions of `reg` anywhere in the function.
    pub fn all_defs_of(&self, reg: u32) -> &BitString {
        &self.defs_map[reg as usize]
    }

    /// The exact reaching set at `insn`, produced by re-running the
    /// transfer within the block up to (but excluding) `insn`.
    pub fn reaching_defs_at(
        &self,
        unit: &Unit,
        cfg: &ControlFlowGraph,
        bb: Bb,
        insn: Entry,
    ) -> BitString {
        if self.num_bits == 0 {
            return BitString::new(0);
        }
        let mut current = self.in_set(bb).clone();
        for e in cfg.bb_entries(unit, bb) {
            if e == insn {
                break;
            }
            if let EntryData::Insn(i) = &unit[e].data {
                for reg in def_mask(&i.insn).iter() {
                    // This definition supersedes the register's definitions
                    // from all other blocks.
                    let own = self.index_map[&(bb, reg)];
                    let mut others = self.defs_map[reg as usize].clone();
                    others.clear(own);
                    current = &current - &others;
                    current.set(own);
                }
            }
        }
        current
    }

    /// Every definition reaching `insn`, as (instruction, block, register)
    /// triples.
    pub fn all_reaching_defs(
        &self,
        unit: &Unit,
        cfg: &ControlFlowGraph,
        bb: Bb,
        insn: Entry,
    ) -> Vec<Definition> {
        let current = self.reaching_defs_at(unit, cfg, bb, insn);
        let mut defs = Vec::new();
        for ix in current.iter() {
            let (def_bb, reg) = self.rev_index_map[ix as usize];
            let last = cfg.block(def_bb).last_entry();
            match self.defining_insn(unit, cfg, def_bb, reg, last) {
                Some(def) => defs.push(Definition {
                    insn: def,
                    block: def_bb,
                    reg,
                }),
                None => warn!("unable to find defining instruction"),
            }
        }
        defs
    }

    /// The definitions of `reg` reaching `insn`. When a definition comes
    /// from the query block itself, the search starts above `insn`.
    pub fn reaching_defs(
        &self,
        unit: &Unit,
        cfg: &ControlFlowGraph,
        bb: Bb,
        insn: Entry,
        reg: u32,
    ) -> Vec<Definition> {
        let current = self.reaching_defs_at(unit, cfg, bb, insn);
        let narrowed = &current & &self.defs_map[reg as usize];
        let mut defs = Vec::new();
        for ix in narrowed.iter() {
            let (def_bb, def_reg) = self.rev_index_map[ix as usize];
            let start = if def_bb == bb {
                unit.prev(insn)
            } else {
                cfg.block(def_bb).last_entry()
            };
            match self.defining_insn(unit, cfg, def_bb, def_reg, start) {
                Some(def) => defs.push(Definition {
                    insn: def,
                    block: def_bb,
                    reg: def_reg,
                }),
                None => warn!("unable to find defining instruction"),
            }
        }
        defs
    }

    /// Walk `bb` backward from `start` looking for an instruction that
    /// defines `reg`.
    fn defining_insn(
        &self,
        unit: &Unit,
        cfg: &ControlFlowGraph,
        bb: Bb,
        reg: u32,
        start: Option<Entry>,
    ) -> Option<Entry> {
        let first = cfg.block(bb).first_entry();
        for e in unit.entry_range(first, start).rev() {
            if let EntryData::Insn(i) = &unit[e].data {
                if def_mask(&i.insn).get(reg) {
                    return Some(e);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{branch, build_func, reg, rr, E};
    use crate::x86::{Insn, Op};

    /// mov defines %ebx in two blocks; both reach the join point.
    #[test]
    fn defs_from_both_paths_reach_join() {
        let mut f = build_func(vec![
            E::L(".L1"),
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(branch(Op::Je, ".L3")),
            E::I(rr(Op::Mov, "esi", "ebx")),
            E::L(".L3"),
            E::I(rr(Op::Add, "ebx", "edx")),
            E::I(Insn::new(Op::Ret)),
        ]);
        let mov1 = f.entries[1];
        let mov2 = f.entries[3];
        let add = f.entries[5];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let rd = ReachingDefs::solve(&f.unit, &cfg);

        let l3 = cfg.find_block(".L3").unwrap();
        let ebx = reg("ebx").bit();
        let mut defs = rd.reaching_defs(&f.unit, &cfg, l3, add, ebx);
        defs.sort_by_key(|d| d.insn);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].insn, mov1);
        assert_eq!(defs[1].insn, mov2);
        assert!(defs.iter().all(|d| d.reg == ebx));
    }

    #[test]
    fn same_block_definition_found_above_query() {
        let mut f = build_func(vec![
            E::L(".L1"),
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(rr(Op::Mov, "ebx", "ecx")),
            E::I(Insn::new(Op::Ret)),
        ]);
        let mov1 = f.entries[1];
        let mov2 = f.entries[2];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let rd = ReachingDefs::solve(&f.unit, &cfg);
        let l1 = cfg.find_block(".L1").unwrap();
        let defs = rd.reaching_defs(&f.unit, &cfg, l1, mov2, reg("ebx").bit());
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].insn, mov1);
        assert_eq!(defs[0].block, l1);
    }

    #[test]
    fn redefinition_kills_other_blocks() {
        // %ebx is redefined on the fallthrough path; at the join only the
        // latest definition on each path reaches.
        let mut f = build_func(vec![
            E::L(".L1"),
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(branch(Op::Je, ".L3")),
            E::I(rr(Op::Mov, "esi", "ebx")),
            E::I(rr(Op::Mov, "edi", "ebx")),
            E::L(".L3"),
            E::I(Insn::new(Op::Ret)),
        ]);
        let mov3 = f.entries[4];
        let ret = f.entries[6];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let rd = ReachingDefs::solve(&f.unit, &cfg);
        let l3 = cfg.find_block(".L3").unwrap();
        let defs = rd.reaching_defs(&f.unit, &cfg, l3, ret, reg("ebx").bit());
        // Two block-level definitions reach; the fallthrough block's
        // representative instruction is the later mov.
        assert_eq!(defs.len(), 2);
        assert!(defs.iter().any(|d| d.insn == mov3));
        assert!(!defs.iter().any(|d| d.insn == f.entries[3]));
    }

    #[test]
    fn reaching_set_at_instruction_is_exact() {
        let mut f = build_func(vec![
            E::L(".L1"),
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(rr(Op::Mov, "esi", "ebx")),
            E::I(Insn::new(Op::Ret)),
        ]);
        let mov2 = f.entries[2];
        let ret = f.entries[3];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let rd = ReachingDefs::solve(&f.unit, &cfg);
        let l1 = cfg.find_block(".L1").unwrap();
        let ebx = reg("ebx").bit();
        // Between the two movs, the first def reaches; after the second,
        // the block's (single) ebx bit is still set but the defining
        // instruction resolves to the closer mov.
        let at_mov2 = rd.reaching_defs_at(&f.unit, &cfg, l1, mov2);
        assert!(at_mov2.get(rd.index_map[&(l1, ebx)]));
        let defs = rd.reaching_defs(&f.unit, &cfg, l1, ret, ebx);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].insn, mov2);
    }
}
