//! Generic iterative bit-vector dataflow.
//!
//! The solver is parameterised by direction, per-block gen/kill sets, and a
//! meet operator. To keep the naming direction-neutral, the state flowing
//! *into* a block's transfer function is its entry state: the in-set for
//! forward problems, the out-set for backward problems. The solution stores
//! entry states per block.

use crate::bitstring::BitString;
use crate::cfg::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::{Bb, Unit};

/// Iteration cap; exceeding it means the transfer functions are not
/// monotone, which is a bug.
pub const MAX_ITERATIONS: u32 = 10_000;

/// Direction of propagation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Direction {
    Forward,
    Backward,
}

/// A dataflow problem instance.
pub trait DataflowProblem {
    fn direction(&self) -> Direction;

    /// Width of the bit vectors. A zero-width problem solves trivially.
    fn num_bits(&self) -> u32;

    /// Initial entry state for every block.
    fn initial_entry_state(&self) -> BitString {
        BitString::new(self.num_bits())
    }

    fn gen_set(&self, unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString;

    fn kill_set(&self, unit: &Unit, cfg: &ControlFlowGraph, bb: Bb) -> BitString;

    /// The meet operator: union for may-problems, intersection for
    /// must-problems.
    fn confluence(&self, sets: &[&BitString]) -> BitString {
        union_of(sets)
    }
}

/// `out = gen | (in - kill)`.
pub fn transfer(entry: &BitString, gen: &BitString, kill: &BitString) -> BitString {
    gen | &(entry - kill)
}

/// Union of a non-empty set of states.
pub fn union_of(sets: &[&BitString]) -> BitString {
    assert!(!sets.is_empty(), "confluence of an empty set");
    let mut out = sets[0].clone();
    for s in &sets[1..] {
        out = &out | s;
    }
    out
}

/// Intersection of a non-empty set of states.
pub fn intersect_of(sets: &[&BitString]) -> BitString {
    assert!(!sets.is_empty(), "confluence of an empty set");
    let mut out = sets[0].clone();
    for s in &sets[1..] {
        out = &out & s;
    }
    out
}

/// The fixed point of a solved problem: one entry state per block.
pub struct DataflowSolution {
    entry: FxHashMap<Bb, BitString>,
}

impl DataflowSolution {
    /// The entry state of `bb`: the in-set for forward problems, the
    /// out-set for backward ones.
    pub fn entry_state(&self, bb: Bb) -> &BitString {
        self.entry
            .get(&bb)
            .expect("block has no dataflow state; was the problem solved?")
    }

    /// Is the solution empty (zero-width problem)?
    pub fn is_empty(&self) -> bool {
        self.entry.is_empty()
    }
}

/// Iterate the problem to its fixed point over `cfg`.
pub fn solve<P: DataflowProblem>(
    problem: &P,
    unit: &Unit,
    cfg: &ControlFlowGraph,
) -> DataflowSolution {
    let mut entry_map: FxHashMap<Bb, BitString> = FxHashMap::default();
    let mut exit_map: FxHashMap<Bb, BitString> = FxHashMap::default();
    let mut gen_map: FxHashMap<Bb, BitString> = FxHashMap::default();
    let mut kill_map: FxHashMap<Bb, BitString> = FxHashMap::default();

    if problem.num_bits() > 0 {
        for bb in cfg.blocks() {
            let entry = problem.initial_entry_state();
            let gen = problem.gen_set(unit, cfg, bb);
            let kill = problem.kill_set(unit, cfg, bb);
            exit_map.insert(bb, transfer(&entry, &gen, &kill));
            entry_map.insert(bb, entry);
            gen_map.insert(bb, gen);
            kill_map.insert(bb, kill);
        }

        let mut iterations = 0;
        loop {
            let mut dirty = false;
            for bb in cfg.blocks() {
                let entry_new = {
                    let confluence: Vec<&BitString> = match problem.direction() {
                        Direction::Backward => {
                            cfg.succs(bb).map(|s| &exit_map[&s]).collect()
                        }
                        Direction::Forward => {
                            cfg.preds(bb).map(|p| &exit_map[&p]).collect()
                        }
                    };
                    if confluence.is_empty() {
                        continue;
                    }
                    problem.confluence(&confluence)
                };
                if entry_new != entry_map[&bb] {
                    let exit_new = transfer(&entry_new, &gen_map[&bb], &kill_map[&bb]);
                    entry_map.insert(bb, entry_new);
                    exit_map.insert(bb, exit_new);
                    dirty = true;
                }
            }
            iterations += 1;
            assert!(iterations <= MAX_ITERATIONS, "dataflow failed to converge");
            if !dirty {
                break;
            }
        }
        log::debug!("dataflow converged after {} iterations", iterations);
    }

    DataflowSolution { entry: entry_map }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_is_gen_union_in_minus_kill() {
        let mut entry = BitString::new(8);
        entry.set(0);
        entry.set(1);
        let mut gen = BitString::new(8);
        gen.set(2);
        let mut kill = BitString::new(8);
        kill.set(1);
        let out: Vec<u32> = transfer(&entry, &gen, &kill).iter().collect();
        assert_eq!(out, [0, 2]);
    }

    #[test]
    fn union_and_intersection() {
        let mut a = BitString::new(8);
        a.set(1);
        a.set(2);
        let mut b = BitString::new(8);
        b.set(2);
        b.set(3);
        let u: Vec<u32> = union_of(&[&a, &b]).iter().collect();
        assert_eq!(u, [1, 2, 3]);
        let i: Vec<u32> = intersect_of(&[&a, &b]).iter().collect();
        assert_eq!(i, [2]);
    }
}
