//! End-to-end scenarios driven through the public API: a unit is built the
//! way a parser would build one, then analysed.

use asmflow::cfg::ControlFlowGraph;
use asmflow::ir::{Entry, Func, Section, SubSec, Unit};
use asmflow::liveness::Liveness;
use asmflow::loops::LoopStructureGraph;
use asmflow::passes::{PassManager, PassRegistry};
use asmflow::relax::Relaxer;
use asmflow::x86::{reg_from_name, ExecMode, Insn, Op, Operand};

struct Builder {
    unit: Unit,
    section: Section,
    ss: SubSec,
    entries: Vec<Entry>,
}

impl Builder {
    fn new() -> Builder {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut unit = Unit::new();
        let section = unit.create_section(".text");
        let ss = unit.create_subsection(section);
        Builder {
            unit,
            section,
            ss,
            entries: Vec::new(),
        }
    }

    fn insn(&mut self, insn: Insn) -> Entry {
        let e = self.unit.create_insn(insn, ExecMode::Code64);
        self.unit.append(self.ss, e);
        self.entries.push(e);
        e
    }

    fn label(&mut self, name: &str) -> Entry {
        let e = self.unit.new_label(name, true);
        self.unit.append(self.ss, e);
        self.entries.push(e);
        e
    }

    fn func(&mut self, name: &str) -> Func {
        self.unit
            .define_function(name, self.entries[0], *self.entries.last().unwrap())
    }
}

fn rr(op: Op, src: &str, dst: &str) -> Insn {
    Insn::with_operands(
        op,
        &[
            Operand::Reg(reg_from_name(src).unwrap()),
            Operand::Reg(reg_from_name(dst).unwrap()),
        ],
    )
}

#[test]
fn direct_branch_cfg_scenario() {
    // .L1: mov %eax, %ebx ; jmp .L2 ; .L2: ret
    let mut b = Builder::new();
    b.label(".L1");
    b.insn(rr(Op::Mov, "eax", "ebx"));
    b.insn(Insn::direct_branch(Op::Jmp, ".L2"));
    b.label(".L2");
    b.insn(Insn::new(Op::Ret));
    let func = b.func("main");

    let cfg = ControlFlowGraph::build(&mut b.unit, func, false);
    let l1 = cfg.find_block(".L1").expect("block .L1");
    let l2 = cfg.find_block(".L2").expect("block .L2");

    // source -> .L1, .L1 -> .L2 (not a fallthrough), .L2 -> sink.
    assert_eq!(cfg.succs(cfg.source()).collect::<Vec<_>>(), vec![l1]);
    let l1_out = &cfg.block(l1).out_edges;
    assert_eq!(l1_out.len(), 1);
    assert_eq!(cfg.edge(l1_out[0]).dest, l2);
    assert!(!cfg.edge(l1_out[0]).fallthrough);
    assert_eq!(cfg.succs(l2).collect::<Vec<_>>(), vec![cfg.sink()]);

    // Block contents: [label, mov, jmp] and [label, ret].
    assert_eq!(cfg.bb_entries(&b.unit, l1).count(), 3);
    assert_eq!(cfg.bb_entries(&b.unit, l2).count(), 2);
    assert!(cfg.is_well_formed(&b.unit));
}

#[test]
fn short_and_near_jump_relaxation() {
    for (nop_count, expected) in [(120usize, 2u32), (300, 5)] {
        let mut b = Builder::new();
        let jmp = b.insn(Insn::direct_branch(Op::Jmp, ".L"));
        for _ in 0..nop_count {
            b.insn(Insn::new(Op::Nop));
        }
        b.label(".L");
        b.insn(Insn::new(Op::Ret));
        b.func("f");

        let sizes = Relaxer::sizes(&mut b.unit, b.section);
        assert_eq!(sizes[&jmp], expected, "{} nops", nop_count);
    }
}

#[test]
fn liveness_scenario() {
    let mut b = Builder::new();
    let mov = b.insn(rr(Op::Mov, "eax", "ebx"));
    b.insn(rr(Op::Add, "ebx", "ecx"));
    b.insn(Insn::new(Op::Ret));
    let func = b.func("f");

    let cfg = ControlFlowGraph::build(&mut b.unit, func, false);
    let bb = cfg
        .blocks()
        .find(|&bb| bb != cfg.source() && bb != cfg.sink())
        .unwrap();
    let live = Liveness::solve(&b.unit, &cfg);

    // Live before the add: both of its inputs. (That is the set live
    // after the mov.)
    let before_add = live.live_after(&b.unit, &cfg, bb, mov);
    assert!(before_add.get(reg_from_name("ebx").unwrap().bit()));
    assert!(before_add.get(reg_from_name("ecx").unwrap().bit()));
}

#[test]
fn pass_pipeline_over_a_loop() {
    let mut b = Builder::new();
    b.label(".Lhead");
    b.insn(rr(Op::Cmp, "eax", "ebx"));
    b.insn(Insn::direct_branch(Op::Jne, ".Lhead"));
    b.insn(Insn::new(Op::Ret));
    let func = b.func("looper");

    let registry = PassRegistry::with_builtins();
    let mut manager = PassManager::new(&registry);
    manager.enqueue_spec("CFG=collect_stats").unwrap();
    manager.enqueue_spec("LFIND").unwrap();
    manager.enqueue_spec("RELAX").unwrap();
    manager.run(&mut b.unit);

    assert!(b.unit.funcs[func].cfg().is_some());
    let lsg = b.unit.funcs[func].lsg().unwrap();
    assert_eq!(lsg.num_loops(), 1);
    assert!(b.unit.sections[b.section].has_size_map());
}

#[test]
fn mutation_invalidation_roundtrip() {
    let mut b = Builder::new();
    b.label(".L1");
    for _ in 0..10 {
        b.insn(Insn::new(Op::Nop));
    }
    let ret = b.insn(Insn::new(Op::Ret));
    let func = b.func("f");

    let offsets = Relaxer::offsets(&mut b.unit, b.section).clone();
    let old = offsets[&ret];

    // Inserting a .p2align 4 may push later entries by at most 15 bytes.
    b.unit.align_to(b.entries[5], 4, None, 0);
    ControlFlowGraph::invalidate(&mut b.unit, func);
    Relaxer::invalidate(&mut b.unit, b.section);

    let offsets = Relaxer::offsets(&mut b.unit, b.section).clone();
    assert!(offsets[&ret] >= old);
    assert!(offsets[&ret] - old <= 15);

    // The rebuilt CFG matches the old shape: one real block, same edges.
    let cfg = ControlFlowGraph::build(&mut b.unit, func, false);
    assert_eq!(cfg.num_blocks(), 3);
    assert!(cfg.is_well_formed(&b.unit));
}

#[test]
fn loop_forest_via_cache() {
    let mut b = Builder::new();
    b.label(".L");
    b.insn(rr(Op::Add, "ecx", "edx"));
    b.insn(Insn::direct_branch(Op::Jne, ".L"));
    b.insn(Insn::new(Op::Ret));
    let func = b.func("f");

    let lsg = LoopStructureGraph::get_or_build(&mut b.unit, func, false);
    assert_eq!(lsg.num_loops(), 1);
    let id = lsg.loops().find(|&l| l != lsg.root()).unwrap();
    let l = lsg.get(id);
    assert!(l.is_reducible);
    assert_eq!(l.nesting_level, 0);
}
