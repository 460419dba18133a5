//! The register and opcode encyclopedia.
//!
//! Instruction entries carry an opaque, fully decoded machine-instruction
//! record; this module is the oracle that answers predicates over it. The
//! modelled subset covers the mnemonics the analyses pattern-match on; an
//! instruction outside the modelled set still flows through the framework
//! but reports unknown register side-effects (the undef mask).

pub mod regs;

use core::fmt;
use smallvec::SmallVec;

use crate::bitstring::BitString;
use crate::ir::entry::Expr;
pub use regs::{
    calling_convention_def_mask, caller_saved_mask, mask_for_register, mask_with_parents,
    parent_regs, reg_from_name, Reg, REG_UNIVERSE_BITS, RFLAGS, RIP, RBP, RSP,
};

/// Execution mode of an instruction, tracked per entry because `.code16` /
/// `.code32` / `.code64` directives can switch it mid-stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Code16,
    Code32,
    Code64,
}

/// Opcode tags for the modelled mnemonics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    // Data movement.
    Mov,
    Movabs,
    Movslq,
    Movsbl,
    Movswl,
    Movzbl,
    Movzwl,
    Movaps,
    Lea,
    Push,
    Pop,
    // Integer arithmetic and logic.
    Add,
    Sub,
    Adc,
    Sbb,
    Inc,
    Dec,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sal,
    Sar,
    Rol,
    Ror,
    Imul,
    Cmp,
    Test,
    // Control transfer.
    Jmp,
    Ljmp,
    Jo,
    Jno,
    Jb,
    Jc,
    Jnae,
    Jnb,
    Jnc,
    Jae,
    Je,
    Jz,
    Jne,
    Jnz,
    Jbe,
    Jna,
    Jnbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jpe,
    Jnp,
    Jpo,
    Jl,
    Jnge,
    Jnl,
    Jge,
    Jle,
    Jng,
    Jnle,
    Jg,
    Jcxz,
    Jecxz,
    Jrcxz,
    Loop,
    Loopz,
    Loope,
    Loopnz,
    Loopne,
    Call,
    Lcall,
    Syscall,
    Ret,
    Lret,
    Iret,
    Sysret,
    Leave,
    // Misc.
    Nop,
    Hlt,
    Ud2,
    // Modelled as unknown side-effects.
    Cpuid,
    Rdtsc,
}

impl Op {
    /// The AT&T mnemonic.
    pub fn name(self) -> &'static str {
        use Op::*;
        match self {
            Mov => "mov",
            Movabs => "movabs",
            Movslq => "movslq",
            Movsbl => "movsbl",
            Movswl => "movswl",
            Movzbl => "movzbl",
            Movzwl => "movzwl",
            Movaps => "movaps",
            Lea => "lea",
            Push => "push",
            Pop => "pop",
            Add => "add",
            Sub => "sub",
            Adc => "adc",
            Sbb => "sbb",
            Inc => "inc",
            Dec => "dec",
            Neg => "neg",
            Not => "not",
            And => "and",
            Or => "or",
            Xor => "xor",
            Shl => "shl",
            Shr => "shr",
            Sal => "sal",
            Sar => "sar",
            Rol => "rol",
            Ror => "ror",
            Imul => "imul",
            Cmp => "cmp",
            Test => "test",
            Jmp => "jmp",
            Ljmp => "ljmp",
            Jo => "jo",
            Jno => "jno",
            Jb => "jb",
            Jc => "jc",
            Jnae => "jnae",
            Jnb => "jnb",
            Jnc => "jnc",
            Jae => "jae",
            Je => "je",
            Jz => "jz",
            Jne => "jne",
            Jnz => "jnz",
            Jbe => "jbe",
            Jna => "jna",
            Jnbe => "jnbe",
            Ja => "ja",
            Js => "js",
            Jns => "jns",
            Jp => "jp",
            Jpe => "jpe",
            Jnp => "jnp",
            Jpo => "jpo",
            Jl => "jl",
            Jnge => "jnge",
            Jnl => "jnl",
            Jge => "jge",
            Jle => "jle",
            Jng => "jng",
            Jnle => "jnle",
            Jg => "jg",
            Jcxz => "jcxz",
            Jecxz => "jecxz",
            Jrcxz => "jrcxz",
            Loop => "loop",
            Loopz => "loopz",
            Loope => "loope",
            Loopnz => "loopnz",
            Loopne => "loopne",
            Call => "call",
            Lcall => "lcall",
            Syscall => "syscall",
            Ret => "ret",
            Lret => "lret",
            Iret => "iret",
            Sysret => "sysret",
            Leave => "leave",
            Nop => "nop",
            Hlt => "hlt",
            Ud2 => "ud2",
            Cpuid => "cpuid",
            Rdtsc => "rdtsc",
        }
    }

    fn is_cond_jump(self) -> bool {
        use Op::*;
        matches!(
            self,
            Jo | Jno
                | Jb
                | Jc
                | Jnae
                | Jnb
                | Jnc
                | Jae
                | Je
                | Jz
                | Jne
                | Jnz
                | Jbe
                | Jna
                | Jnbe
                | Ja
                | Js
                | Jns
                | Jp
                | Jpe
                | Jnp
                | Jpo
                | Jl
                | Jnge
                | Jnl
                | Jge
                | Jle
                | Jng
                | Jnle
                | Jg
                | Jcxz
                | Jecxz
                | Jrcxz
                | Loop
                | Loopz
                | Loope
                | Loopnz
                | Loopne
        )
    }

    fn is_call(self) -> bool {
        matches!(self, Op::Call | Op::Lcall | Op::Syscall)
    }

    fn is_return(self) -> bool {
        matches!(self, Op::Ret | Op::Lret | Op::Iret | Op::Sysret)
    }

    fn is_jump(self) -> bool {
        matches!(self, Op::Jmp | Op::Ljmp)
    }
}

/// A memory operand in base/index/scale/displacement form.
#[derive(Clone, Debug, PartialEq)]
pub struct Mem {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: Option<Expr>,
}

impl Mem {
    /// A bare symbolic reference, e.g. the operand of `jmp .L2`.
    pub fn symbolic(name: &str) -> Mem {
        Mem {
            base: None,
            index: None,
            scale: 0,
            disp: Some(Expr::sym(name)),
        }
    }
}

/// One instruction operand, in AT&T order (destination last).
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(Mem),
}

/// The opaque machine-instruction record, copied by value from the parser.
#[derive(Clone, Debug)]
pub struct Insn {
    pub op: Op,
    pub operands: SmallVec<[Operand; 2]>,
}

impl Insn {
    /// An instruction without operands.
    pub fn new(op: Op) -> Insn {
        Insn {
            op,
            operands: SmallVec::new(),
        }
    }

    /// An instruction with the given operands, destination last.
    pub fn with_operands(op: Op, operands: &[Operand]) -> Insn {
        Insn {
            op,
            operands: operands.iter().cloned().collect(),
        }
    }

    /// A direct branch to a label.
    pub fn direct_branch(op: Op, target: &str) -> Insn {
        Insn::with_operands(op, &[Operand::Mem(Mem::symbolic(target))])
    }

    /// The opcode tag.
    pub fn op(&self) -> Op {
        self.op
    }

    /// Number of operands.
    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// Is operand `i` a register?
    pub fn is_register_operand(&self, i: usize) -> bool {
        matches!(self.operands.get(i), Some(Operand::Reg(_)))
    }

    /// Is operand `i` a memory operand?
    pub fn is_memory_operand(&self, i: usize) -> bool {
        matches!(self.operands.get(i), Some(Operand::Mem(_)))
    }

    /// Is operand `i` an immediate?
    pub fn is_immediate_operand(&self, i: usize) -> bool {
        matches!(self.operands.get(i), Some(Operand::Imm(_)))
    }

    /// Register operand `i`; panics when it is not a register.
    pub fn register_operand(&self, i: usize) -> Reg {
        match &self.operands[i] {
            Operand::Reg(r) => *r,
            other => panic!("operand {} is not a register: {:?}", i, other),
        }
    }

    /// Base register of memory operand `i`, if any.
    pub fn base_register(&self, i: usize) -> Option<Reg> {
        match &self.operands[i] {
            Operand::Mem(m) => m.base,
            _ => None,
        }
    }

    /// Index register of memory operand `i`, if any.
    pub fn index_register(&self, i: usize) -> Option<Reg> {
        match &self.operands[i] {
            Operand::Mem(m) => m.index,
            _ => None,
        }
    }

    /// Does memory operand `i` carry a displacement?
    pub fn has_displacement(&self, i: usize) -> bool {
        matches!(self.operands.get(i), Some(Operand::Mem(m)) if m.disp.is_some())
    }

    /// The displacement expression of memory operand `i`; panics if absent.
    pub fn displacement(&self, i: usize) -> &Expr {
        match &self.operands[i] {
            Operand::Mem(m) => m.disp.as_ref().expect("memory operand has no displacement"),
            other => panic!("operand {} is not a memory operand: {:?}", i, other),
        }
    }

    /// Is this `jmp`/`ljmp`?
    pub fn is_jump(&self) -> bool {
        self.op.is_jump()
    }

    /// Is this a conditional jump (including `jcxz` and the `loop` family)?
    pub fn is_cond_jump(&self) -> bool {
        self.op.is_cond_jump()
    }

    /// Is this a call? `syscall` counts.
    pub fn is_call(&self) -> bool {
        self.op.is_call()
    }

    /// Is this a return?
    pub fn is_return(&self) -> bool {
        self.op.is_return()
    }

    /// An indirect jump goes through a register or a base/index memory
    /// operand.
    pub fn is_indirect_jump(&self) -> bool {
        debug_assert!(!self.is_jump() || self.num_operands() == 1);
        self.is_jump()
            && match &self.operands[0] {
                Operand::Reg(_) => true,
                Operand::Mem(m) => m.base.is_some() || m.index.is_some(),
                Operand::Imm(_) => false,
            }
    }

    /// Does this instruction name a branch target?
    pub fn has_target(&self) -> bool {
        self.is_jump() || self.is_cond_jump()
    }

    /// Any instruction that transfers control: branches, calls, returns.
    pub fn is_control_transfer(&self) -> bool {
        self.has_target() || self.is_call() || self.is_return()
    }

    /// Execution can continue at the next entry. Returns never fall through;
    /// calls and conditional jumps always do.
    pub fn has_fallthrough(&self) -> bool {
        if self.is_return() {
            return false;
        }
        if !self.has_target() {
            return true;
        }
        if self.is_call() {
            return true;
        }
        self.is_cond_jump()
    }

    /// The symbol a direct branch targets: the displacement of a plain
    /// symbolic memory operand.
    pub fn target(&self) -> Option<&str> {
        for operand in &self.operands {
            if let Operand::Mem(m) = operand {
                if let Some(Expr::Symbol(name)) = &m.disp {
                    return Some(name);
                }
            }
        }
        None
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\t{}", self.op.name())?;
        let indirect = (self.is_jump() || self.op.is_call()) && self.is_star_operand();
        for (i, operand) in self.operands.iter().enumerate() {
            write!(f, "{}", if i == 0 { "\t" } else { ", " })?;
            if indirect && i == 0 {
                write!(f, "*")?;
            }
            match operand {
                Operand::Reg(r) => write!(f, "{}", r)?,
                Operand::Imm(v) => write!(f, "${}", v)?,
                Operand::Mem(m) => {
                    if let Some(d) = &m.disp {
                        write!(f, "{}", d)?;
                    }
                    if m.base.is_some() || m.index.is_some() {
                        write!(f, "(")?;
                        if let Some(b) = m.base {
                            write!(f, "{}", b)?;
                        }
                        if let Some(ix) = m.index {
                            write!(f, ",{},{}", ix, m.scale)?;
                        }
                        write!(f, ")")?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Insn {
    fn is_star_operand(&self) -> bool {
        match self.operands.first() {
            Some(Operand::Reg(_)) => true,
            Some(Operand::Mem(m)) => m.base.is_some() || m.index.is_some(),
            _ => false,
        }
    }
}

fn add_reg(bs: &mut BitString, reg: Reg) {
    *bs = &*bs | &mask_with_parents(reg);
}

fn add_family(bs: &mut BitString, name: &str) {
    add_reg(bs, reg_from_name(name).unwrap());
}

fn mem_use_mask(bs: &mut BitString, m: &Mem) {
    if let Some(b) = m.base {
        add_reg(bs, b);
    }
    if let Some(ix) = m.index {
        add_reg(bs, ix);
    }
}

fn operand_use(bs: &mut BitString, operand: &Operand) {
    match operand {
        Operand::Reg(r) => add_reg(bs, *r),
        Operand::Mem(m) => mem_use_mask(bs, m),
        Operand::Imm(_) => {}
    }
}

/// Register effect category of an opcode, driving the def/use computation.
enum Effect {
    /// Destination is written, sources are read (`mov`, `lea`, ...).
    Move,
    /// Destination is read and written, sources read, flags written.
    ReadModifyWrite,
    /// Everything is read, flags written (`cmp`, `test`).
    CompareOnly,
    /// Implicit effects handled per opcode.
    Special,
    /// Outside the modelled set.
    Unknown,
}

fn effect(op: Op) -> Effect {
    use Op::*;
    match op {
        Mov | Movabs | Movslq | Movsbl | Movswl | Movzbl | Movzwl | Movaps | Lea => Effect::Move,
        Add | Sub | Adc | Sbb | Inc | Dec | Neg | Not | And | Or | Xor | Shl | Shr | Sal | Sar
        | Rol | Ror | Imul => Effect::ReadModifyWrite,
        Cmp | Test => Effect::CompareOnly,
        Cpuid | Rdtsc => Effect::Unknown,
        _ => Effect::Special,
    }
}

/// The registers `insn` writes, as a mask over the register universe.
/// Writing a sub-register also marks the enclosing registers. Instructions
/// with unmodelled side effects return the undef sentinel.
pub fn register_def_mask(insn: &Insn) -> BitString {
    let mut bs = BitString::new(REG_UNIVERSE_BITS);
    match effect(insn.op) {
        Effect::Move => {
            if let Some(Operand::Reg(r)) = insn.operands.last() {
                add_reg(&mut bs, *r);
            }
        }
        Effect::ReadModifyWrite => {
            if let Some(Operand::Reg(r)) = insn.operands.last() {
                add_reg(&mut bs, *r);
            }
            if insn.op != Op::Not {
                bs.set(RFLAGS.bit());
            }
        }
        Effect::CompareOnly => {
            bs.set(RFLAGS.bit());
        }
        Effect::Unknown => return BitString::undef(REG_UNIVERSE_BITS),
        Effect::Special => {
            use Op::*;
            match insn.op {
                Push => add_reg(&mut bs, RSP),
                Pop => {
                    add_reg(&mut bs, RSP);
                    if let Some(Operand::Reg(r)) = insn.operands.first() {
                        add_reg(&mut bs, *r);
                    }
                }
                Call | Lcall | Syscall => {
                    bs = caller_saved_mask();
                    add_reg(&mut bs, RSP);
                }
                Ret | Lret | Iret | Sysret => add_reg(&mut bs, RSP),
                Leave => {
                    add_reg(&mut bs, RSP);
                    add_reg(&mut bs, RBP);
                }
                Loop | Loopz | Loope | Loopnz | Loopne => add_family(&mut bs, "rcx"),
                _ => {}
            }
        }
    }
    bs
}

/// The registers `insn` reads. Same conventions as [register_def_mask].
pub fn register_use_mask(insn: &Insn) -> BitString {
    let mut bs = BitString::new(REG_UNIVERSE_BITS);
    match effect(insn.op) {
        Effect::Move => {
            let n = insn.operands.len();
            for (i, operand) in insn.operands.iter().enumerate() {
                if i + 1 == n {
                    // A memory destination still reads its address registers.
                    if let Operand::Mem(m) = operand {
                        mem_use_mask(&mut bs, m);
                    }
                } else {
                    operand_use(&mut bs, operand);
                }
            }
        }
        Effect::ReadModifyWrite => {
            for operand in &insn.operands {
                operand_use(&mut bs, operand);
            }
            if matches!(insn.op, Op::Adc | Op::Sbb) {
                bs.set(RFLAGS.bit());
            }
        }
        Effect::CompareOnly => {
            for operand in &insn.operands {
                operand_use(&mut bs, operand);
            }
        }
        Effect::Unknown => return BitString::undef(REG_UNIVERSE_BITS),
        Effect::Special => {
            use Op::*;
            match insn.op {
                Push => {
                    add_reg(&mut bs, RSP);
                    if let Some(operand) = insn.operands.first() {
                        operand_use(&mut bs, operand);
                    }
                }
                Pop => add_reg(&mut bs, RSP),
                Call | Lcall | Syscall => {
                    bs = calling_convention_def_mask();
                    add_reg(&mut bs, RSP);
                    if let Some(operand) = insn.operands.first() {
                        operand_use(&mut bs, operand);
                    }
                }
                Ret | Lret | Iret | Sysret => {
                    add_reg(&mut bs, RSP);
                    add_family(&mut bs, "rax");
                }
                Leave => add_reg(&mut bs, RBP),
                Jmp | Ljmp => {
                    if let Some(operand) = insn.operands.first() {
                        operand_use(&mut bs, operand);
                    }
                }
                Jcxz | Jecxz | Jrcxz => {
                    add_family(&mut bs, "rcx");
                    bs.set(RFLAGS.bit());
                }
                Loop | Loopz | Loope | Loopnz | Loopne => {
                    add_family(&mut bs, "rcx");
                    bs.set(RFLAGS.bit());
                }
                op if op.is_cond_jump() => bs.set(RFLAGS.bit()),
                _ => {}
            }
        }
    }
    bs
}

fn reg_needs_rex(r: Reg) -> bool {
    let bit = r.bit();
    // 64-bit GPR views, the REX-only byte registers, and r8..r15.
    (r.parent().is_none() && bit < RIP.bit()) || (36..68).contains(&bit) || r.name().ends_with("l") && bit >= 20 && bit < 36
}

fn operand_enc_size(operand: &Operand) -> u32 {
    match operand {
        Operand::Reg(_) => 0,
        Operand::Imm(v) => {
            if (-128..=127).contains(v) {
                1
            } else {
                4
            }
        }
        Operand::Mem(m) => {
            let mut size = 0;
            if m.index.is_some() || m.base == Some(RSP) {
                size += 1; // SIB
            }
            size += match &m.disp {
                None => 0,
                Some(Expr::Constant(0)) if m.base.is_some() => 0,
                Some(Expr::Constant(c)) if (-128..=127).contains(c) => 1,
                Some(_) => 4,
            };
            size
        }
    }
}

/// Estimate the encoded byte size of `insn`.
///
/// The second component is true when the instruction is a relaxable jump:
/// the returned size is then the short form and the relaxer owns the final
/// answer. The estimate does not model every prefix the assembler can emit,
/// but it is deterministic and within a byte or two of reality, which is all
/// the relaxation framework requires of non-relaxable instructions.
pub fn insn_size(insn: &Insn) -> (u32, bool) {
    use Op::*;

    // Direct jumps assemble to the two-byte short form and may grow.
    if insn.has_target() && !insn.is_indirect_jump() && insn.target().is_some() {
        return (2, true);
    }

    match insn.op {
        Ret | Leave | Nop | Hlt => return (1, false),
        Syscall | Ud2 | Cpuid | Rdtsc | Sysret => return (2, false),
        Lret | Iret => return (1, false),
        Call if insn.target().is_some() => return (5, false),
        Push | Pop => {
            let rex = match insn.operands.first() {
                Some(Operand::Reg(r)) if reg_needs_rex(*r) => 1,
                _ => 0,
            };
            let extra = match insn.operands.first() {
                Some(Operand::Imm(_)) | Some(Operand::Mem(_)) => {
                    insn.operands.first().map_or(0, operand_enc_size) + 1
                }
                _ => 0,
            };
            return (1 + rex + extra, false);
        }
        _ => {}
    }

    let two_byte_opcode = matches!(
        insn.op,
        Movslq | Movsbl | Movswl | Movzbl | Movzwl | Movaps | Imul
    );
    let mut size = if two_byte_opcode { 2 } else { 1 };
    let needs_modrm = insn
        .operands
        .iter()
        .any(|operand| !matches!(operand, Operand::Imm(_)));
    if needs_modrm {
        size += 1;
    }
    if insn.operands.iter().any(|operand| match operand {
        Operand::Reg(r) => reg_needs_rex(*r),
        Operand::Mem(m) => {
            m.base.map_or(false, reg_needs_rex) || m.index.map_or(false, reg_needs_rex)
        }
        Operand::Imm(_) => false,
    }) {
        size += 1;
    }
    for operand in &insn.operands {
        size += operand_enc_size(operand);
    }
    (size, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(name: &str) -> Reg {
        reg_from_name(name).unwrap()
    }

    #[test]
    fn predicates() {
        let jmp = Insn::direct_branch(Op::Jmp, ".L1");
        assert!(jmp.is_jump() && !jmp.is_cond_jump() && !jmp.is_indirect_jump());
        assert!(jmp.is_control_transfer() && !jmp.has_fallthrough());
        assert_eq!(jmp.target(), Some(".L1"));

        let je = Insn::direct_branch(Op::Je, ".L2");
        assert!(je.is_cond_jump() && je.has_fallthrough() && je.has_target());

        let ret = Insn::new(Op::Ret);
        assert!(ret.is_return() && !ret.has_fallthrough() && ret.is_control_transfer());

        let call = Insn::direct_branch(Op::Call, "printf");
        assert!(call.is_call() && call.has_fallthrough());

        let star = Insn::with_operands(Op::Jmp, &[Operand::Reg(reg("rax"))]);
        assert!(star.is_indirect_jump());
        assert_eq!(star.target(), None);

        let table = Insn::with_operands(
            Op::Jmp,
            &[Operand::Mem(Mem {
                base: None,
                index: Some(reg("rax")),
                scale: 8,
                disp: Some(Expr::sym(".LT")),
            })],
        );
        assert!(table.is_indirect_jump());

        let add = Insn::with_operands(
            Op::Add,
            &[Operand::Reg(reg("ebx")), Operand::Reg(reg("ecx"))],
        );
        assert!(!add.is_control_transfer() && add.has_fallthrough());
    }

    #[test]
    fn def_use_masks() {
        let mov = Insn::with_operands(
            Op::Mov,
            &[Operand::Reg(reg("eax")), Operand::Reg(reg("ebx"))],
        );
        let defs = register_def_mask(&mov);
        let uses = register_use_mask(&mov);
        assert!(defs.get(reg("ebx").bit()) && defs.get(reg("rbx").bit()));
        assert!(!defs.get(reg("eax").bit()));
        assert!(uses.get(reg("eax").bit()) && !uses.get(reg("ebx").bit()));

        let add = Insn::with_operands(
            Op::Add,
            &[Operand::Reg(reg("ebx")), Operand::Reg(reg("ecx"))],
        );
        let defs = register_def_mask(&add);
        let uses = register_use_mask(&add);
        assert!(defs.get(reg("ecx").bit()) && defs.get(RFLAGS.bit()));
        assert!(uses.get(reg("ebx").bit()) && uses.get(reg("ecx").bit()));

        let store = Insn::with_operands(
            Op::Mov,
            &[
                Operand::Reg(reg("eax")),
                Operand::Mem(Mem {
                    base: Some(reg("rbp")),
                    index: None,
                    scale: 0,
                    disp: Some(Expr::Constant(-8)),
                }),
            ],
        );
        assert!(register_def_mask(&store).is_null());
        assert!(register_use_mask(&store).get(reg("rbp").bit()));

        assert!(register_def_mask(&Insn::new(Op::Cpuid)).is_undef());

        let call = Insn::direct_branch(Op::Call, "f");
        let defs = register_def_mask(&call);
        assert!(defs.get(reg("rax").bit()) && defs.get(reg("r11").bit()));
        assert!(!defs.get(reg("rbx").bit()));
    }

    #[test]
    fn size_estimates() {
        let (size, relax) = insn_size(&Insn::direct_branch(Op::Jmp, ".L"));
        assert_eq!((size, relax), (2, true));
        let (size, relax) = insn_size(&Insn::direct_branch(Op::Je, ".L"));
        assert_eq!((size, relax), (2, true));
        assert_eq!(insn_size(&Insn::new(Op::Nop)), (1, false));
        assert_eq!(insn_size(&Insn::new(Op::Ret)), (1, false));
        let call = Insn::direct_branch(Op::Call, "f");
        assert_eq!(insn_size(&call), (5, false));
        let star = Insn::with_operands(Op::Jmp, &[Operand::Reg(reg("rax"))]);
        let (size, relax) = insn_size(&star);
        assert!(!relax && size >= 2);
    }

    #[test]
    fn display() {
        let mov = Insn::with_operands(
            Op::Mov,
            &[Operand::Reg(reg("eax")), Operand::Reg(reg("ebx"))],
        );
        assert_eq!(mov.to_string(), "\tmov\t%eax, %ebx");
        let star = Insn::with_operands(Op::Jmp, &[Operand::Reg(reg("rax"))]);
        assert_eq!(star.to_string(), "\tjmp\t*%rax");
        let table = Insn::with_operands(
            Op::Jmp,
            &[Operand::Mem(Mem {
                base: None,
                index: Some(reg("rax")),
                scale: 8,
                disp: Some(Expr::sym(".LT")),
            })],
        );
        assert_eq!(table.to_string(), "\tjmp\t*.LT(,%rax,8)");
    }
}
