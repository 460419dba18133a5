//! Register liveness: a backward may-problem over the register universe.

use crate::bitstring::BitString;
use crate::cfg::ControlFlowGraph;
use crate::dataflow::{self, DataflowProblem, DataflowSolution, Direction};
use crate::ir::{Bb, Entry, EntryData, Unit};
use crate::x86::{self, REG_UNIVERSE_BITS};

/// Register masks for dataflow purposes. An instruction with unmodelled
/// side effects conservatively reads everything and is not credited with
/// any definition, which keeps all registers live across it.
fn flow_masks(insn: &x86::Insn) -> (BitString, BitString) {
    let uses = x86::register_use_mask(insn);
    let defs = x86::register_def_mask(insn);
    let uses = if uses.is_undef() {
        let mut all = BitString::new(REG_UNIVERSE_BITS);
        for bit in 0..REG_UNIVERSE_BITS {
            all.set(bit);
        }
        all
    } else {
        uses
    };
    let defs = if defs.is_undef() {
        BitString::new(REG_UNIVERSE_BITS)
    } else {
        defs
    };
    (uses, defs)
}

struct LivenessProblem;

impl DataflowProblem for LivenessProblem {
    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn num_bits(&self) -> u32 {
        REG_UNIVERSE_BITS
    }

    /// Registers used in the block before any assignment, found by walking
    /// backward: defs drop out, uses come back in.
    fn gen_set(&self, unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString {
        let mut current = BitString::new(REG_UNIVERSE_BITS);
        for e in cfg.bb_entries(unit, bb).rev() {
            if let EntryData::Insn(i) = &unit[e].data {
                let (uses, defs) = flow_masks(&i.insn);
                current = dataflow::transfer(&current, &uses, &defs);
            }
        }
        current
    }

    /// Registers assigned in the block before any use.
    fn kill_set(&self, unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString {
        let mut current = BitString::new(REG_UNIVERSE_BITS);
        for e in cfg.bb_entries(unit, bb).rev() {
            if let EntryData::Insn(i) = &unit[e].data {
                let (uses, defs) = flow_masks(&i.insn);
                current = dataflow::transfer(&current, &defs, &uses);
            }
        }
        current
    }
}

/// A solved liveness analysis over one CFG.
pub struct Liveness {
    solution: DataflowSolution,
}

impl Liveness {
    /// Solve liveness for `cfg`.
    pub fn solve(unit: &Unit, cfg: &ControlFlowGraph) -> Liveness {
        Liveness {
            solution: dataflow::solve(&LivenessProblem, unit, cfg),
        }
    }

    /// Registers live at the end of `bb`.
    pub fn out_set(&self, bb: Bb) -> &BitString {
        self.solution.entry_state(bb)
    }

    /// Registers live immediately after `insn`, recomputed by walking
    /// backward from the block's out-set.
    pub fn live_after(
        &self,
        unit: &Unit,
        cfg: &ControlFlowGraph,
        bb: Bb,
        insn: Entry,
    ) -> BitString {
        let mut current = self.out_set(bb).clone();
        for e in cfg.bb_entries(unit, bb).rev() {
            if e == insn {
                break;
            }
            if let EntryData::Insn(i) = &unit[e].data {
                let (uses, defs) = flow_masks(&i.insn);
                current = dataflow::transfer(&current, &uses, &defs);
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{branch, build_func, jmp_star, reg, rr, E};
    use crate::x86::{Insn, Op};

    #[test]
    fn live_sets_within_a_block() {
        // mov %eax, %ebx ; add %ebx, %ecx ; ret
        let mut f = build_func(vec![
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(rr(Op::Add, "ebx", "ecx")),
            E::I(Insn::new(Op::Ret)),
        ]);
        let mov = f.entries[0];
        let add = f.entries[1];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let bb = cfg
            .blocks()
            .find(|&bb| bb != cfg.source() && bb != cfg.sink())
            .unwrap();
        let live = Liveness::solve(&f.unit, &cfg);

        // Live before the add (= live after the mov): both add inputs.
        let before_add = live.live_after(&f.unit, &cfg, bb, mov);
        assert!(before_add.get(reg("ebx").bit()));
        assert!(before_add.get(reg("ecx").bit()));

        let after_add = live.live_after(&f.unit, &cfg, bb, add);
        assert!(!after_add.get(reg("ebx").bit()));
    }

    #[test]
    fn liveness_flows_across_blocks() {
        let mut f = build_func(vec![
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(branch(Op::Jmp, ".L2")),
            E::L(".L2"),
            E::I(rr(Op::Add, "ebx", "ecx")),
            E::I(Insn::new(Op::Ret)),
        ]);
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let live = Liveness::solve(&f.unit, &cfg);
        // The first block must keep %ebx live at its end: the successor
        // uses it.
        let first = cfg
            .blocks()
            .find(|&bb| cfg.block(bb).label.starts_with("<bb-"))
            .unwrap();
        assert!(live.out_set(first).get(reg("ebx").bit()));
        assert!(!live.out_set(first).get(reg("edx").bit()));
    }

    #[test]
    fn solving_twice_is_deterministic() {
        let mut f = build_func(vec![
            E::L(".L1"),
            E::I(rr(Op::Cmp, "eax", "ebx")),
            E::I(branch(Op::Je, ".L1")),
            E::I(Insn::new(Op::Ret)),
        ]);
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let a = Liveness::solve(&f.unit, &cfg);
        let b = Liveness::solve(&f.unit, &cfg);
        for bb in cfg.blocks() {
            assert_eq!(a.out_set(bb), b.out_set(bb));
        }
    }

    #[test]
    fn unknown_side_effects_keep_registers_live() {
        let mut f = build_func(vec![
            E::I(rr(Op::Mov, "eax", "ebx")),
            E::I(Insn::new(Op::Cpuid)),
            E::I(Insn::new(Op::Ret)),
        ]);
        let mov = f.entries[0];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let bb = cfg
            .blocks()
            .find(|&bb| bb != cfg.source() && bb != cfg.sink())
            .unwrap();
        let live = Liveness::solve(&f.unit, &cfg);
        // cpuid's effects are unknown, so everything is live before it.
        let after_mov = live.live_after(&f.unit, &cfg, bb, mov);
        assert!(after_mov.get(reg("r15").bit()));
    }

    #[test]
    fn indirect_jump_register_is_live() {
        let mut f = build_func(vec![
            E::I(rr(Op::Mov, "rdi", "rax")),
            E::I(jmp_star("rax")),
        ]);
        let mov = f.entries[0];
        let cfg = ControlFlowGraph::build(&mut f.unit, f.func, false);
        let bb = cfg
            .blocks()
            .find(|&bb| bb != cfg.source() && bb != cfg.sink())
            .unwrap();
        let live = Liveness::solve(&f.unit, &cfg);
        assert!(live.live_after(&f.unit, &cfg, bb, mov).get(reg("rax").bit()));
    }
}
