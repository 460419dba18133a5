//! Shared helpers for in-module tests: build small units without a parser.
#![cfg(test)]

use crate::ir::{DirOperand, DirectiveOp, Entry, Func, Section, SubSec, Unit};
use crate::x86::{self, Insn, Mem, Op, Operand, Reg};

/// One entry of a test program.
pub enum E {
    /// An instruction.
    I(Insn),
    /// A source label.
    L(&'static str),
    /// A directive.
    D(DirectiveOp, Vec<DirOperand>),
}

/// A built single-function unit.
pub struct Fixture {
    pub unit: Unit,
    pub section: Section,
    pub ss: SubSec,
    pub func: Func,
    pub entries: Vec<Entry>,
}

/// Build a `.text` section holding one function over all of `program`.
pub fn build_func(program: Vec<E>) -> Fixture {
    let mut unit = Unit::new();
    let section = unit.create_section(".text");
    let ss = unit.create_subsection(section);
    let entries = append_all(&mut unit, ss, program);
    let func = unit.define_function("test", entries[0], *entries.last().unwrap());
    Fixture {
        unit,
        section,
        ss,
        func,
        entries,
    }
}

/// Append `program` to the end of `ss`, creating entries as needed.
pub fn append_all(unit: &mut Unit, ss: SubSec, program: Vec<E>) -> Vec<Entry> {
    program
        .into_iter()
        .map(|item| {
            let e = match item {
                E::I(insn) => unit.create_insn(insn, x86::ExecMode::Code64),
                E::L(name) => unit.new_label(name, true),
                E::D(op, operands) => unit.create_directive(op, &operands),
            };
            unit.append(ss, e);
            e
        })
        .collect()
}

pub fn reg(name: &str) -> Reg {
    x86::reg_from_name(name).unwrap()
}

/// `op %src, %dst`
pub fn rr(op: Op, src: &str, dst: &str) -> Insn {
    Insn::with_operands(op, &[Operand::Reg(reg(src)), Operand::Reg(reg(dst))])
}

/// A direct branch to `target`.
pub fn branch(op: Op, target: &str) -> Insn {
    Insn::direct_branch(op, target)
}

/// `jmp *%reg`
pub fn jmp_star(r: &str) -> Insn {
    Insn::with_operands(Op::Jmp, &[Operand::Reg(reg(r))])
}

/// A memory operand.
pub fn mem(base: Option<&str>, index: Option<&str>, scale: u8, disp: Option<crate::ir::Expr>) -> Operand {
    Operand::Mem(Mem {
        base: base.map(reg),
        index: index.map(reg),
        scale,
        disp,
    })
}
