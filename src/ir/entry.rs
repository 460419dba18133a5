//! Entry payloads.
//!
//! One element of the IR stream is an instruction, a label, or a directive.
//! The three variants form a closed sum; the chain links and ownership
//! back-pointers live in the [Unit](crate::ir::Unit) arena, not here.

use core::fmt;
use smallvec::SmallVec;

use crate::x86;

/// A small assembler expression, as found in directive operands and memory
/// displacements. This covers what jump tables, LEB128 and space directives
/// need; anything richer is not representable and parses as unknown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// A plain integer.
    Constant(i64),
    /// A symbol reference.
    Symbol(Box<str>),
    /// Symbol plus constant addend.
    SymbolPlus(Box<str>, i64),
    /// Difference of two symbols plus constant addend (PIC jump tables).
    Diff(Box<str>, Box<str>, i64),
}

impl Expr {
    /// Shorthand for a symbol reference.
    pub fn sym(name: &str) -> Expr {
        Expr::Symbol(name.into())
    }

    /// The primary symbol of this expression, if it has one.
    ///
    /// For a difference the minuend is the interesting symbol: a PIC jump
    /// table entry `.long .L42-.LT` targets `.L42`.
    pub fn symbol_name(&self) -> Option<&str> {
        match self {
            Expr::Constant(_) => None,
            Expr::Symbol(s) | Expr::SymbolPlus(s, _) | Expr::Diff(s, _, _) => Some(s),
        }
    }

    /// Is this a plain constant?
    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant(_))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Constant(v) => write!(f, "{}", v),
            Expr::Symbol(s) => write!(f, "{}", s),
            Expr::SymbolPlus(s, a) if *a >= 0 => write!(f, "{}+{}", s, a),
            Expr::SymbolPlus(s, a) => write!(f, "{}{}", s, a),
            Expr::Diff(a, b, 0) => write!(f, "{}-{}", a, b),
            Expr::Diff(a, b, c) => write!(f, "{}-{}+{}", a, b, c),
        }
    }
}

/// Relocation attached to an expression operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    Plt32,
    GotPcRel,
    Tpoff,
    Dtpoff,
}

/// One operand of a directive.
#[derive(Clone, Debug, PartialEq)]
pub enum DirOperand {
    Empty,
    Int(i64),
    Str(Box<str>),
    Sym(Box<str>),
    Expr(Expr),
    ExprReloc(Expr, RelocKind),
}

impl DirOperand {
    /// The integer payload; panics on other variants.
    pub fn int(&self) -> i64 {
        match self {
            DirOperand::Int(v) => *v,
            other => panic!("directive operand is not an integer: {:?}", other),
        }
    }

    /// The expression payload; panics on other variants.
    pub fn expr(&self) -> &Expr {
        match self {
            DirOperand::Expr(e) | DirOperand::ExprReloc(e, _) => e,
            other => panic!("directive operand is not an expression: {:?}", other),
        }
    }

    /// The string payload; panics on other variants.
    pub fn str(&self) -> &str {
        match self {
            DirOperand::Str(s) => s,
            other => panic!("directive operand is not a string: {:?}", other),
        }
    }
}

impl fmt::Display for DirOperand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirOperand::Empty => Ok(()),
            DirOperand::Int(v) => write!(f, "{}", v),
            DirOperand::Str(s) => write!(f, "{}", s),
            DirOperand::Sym(s) => write!(f, "{}", s),
            DirOperand::Expr(e) => write!(f, "{}", e),
            DirOperand::ExprReloc(e, r) => write!(f, "{}@{:?}", e, r),
        }
    }
}

/// The closed set of directive kinds the framework understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DirectiveOp {
    P2Align,
    P2AlignW,
    P2AlignL,
    Sleb128,
    Uleb128,
    Byte,
    Word,
    Rva,
    Long,
    Quad,
    Ascii,
    String8,
    String16,
    String32,
    String64,
    Space,
    DsB,
    DsW,
    DsL,
    DsD,
    DsX,
    Comm,
    Ident,
    Set,
    File,
    Section,
    Global,
    Local,
    Weak,
    Type,
    Size,
    Equiv,
    Weakref,
    Arch,
    Linefile,
    Loc,
    AllowIndexReg,
    DisallowIndexReg,
    Org,
    Code16,
    Code16Gcc,
    Code32,
    Code64,
    DcD,
    DcS,
    DcX,
    Hidden,
    Fill,
    Struct,
    Incbin,
    Symver,
    LocMarkLabels,
    CfiStartproc,
    CfiEndproc,
    CfiDefCfa,
    CfiDefCfaRegister,
    CfiDefCfaOffset,
    CfiAdjustCfaOffset,
    CfiOffset,
    CfiRelOffset,
    CfiRegister,
    CfiReturnColumn,
    CfiRestore,
    CfiUndefined,
    CfiSameValue,
    CfiRememberState,
    CfiRestoreState,
    CfiWindowSave,
    CfiEscape,
    CfiSignalFrame,
    CfiPersonality,
    CfiLsda,
    CfiValEncodedAddr,
}

impl DirectiveOp {
    /// The assembler spelling, with the leading dot.
    pub fn name(self) -> &'static str {
        use DirectiveOp::*;
        match self {
            P2Align => ".p2align",
            P2AlignW => ".p2alignw",
            P2AlignL => ".p2alignl",
            Sleb128 => ".sleb128",
            Uleb128 => ".uleb128",
            Byte => ".byte",
            Word => ".word",
            Rva => ".rva",
            Long => ".long",
            Quad => ".quad",
            Ascii => ".ascii",
            String8 => ".string8",
            String16 => ".string16",
            String32 => ".string32",
            String64 => ".string64",
            Space => ".space",
            DsB => ".ds.b",
            DsW => ".ds.w",
            DsL => ".ds.l",
            DsD => ".ds.d",
            DsX => ".ds.x",
            Comm => ".comm",
            Ident => ".ident",
            Set => ".set",
            File => ".file",
            Section => ".section",
            Global => ".global",
            Local => ".local",
            Weak => ".weak",
            Type => ".type",
            Size => ".size",
            Equiv => ".equiv",
            Weakref => ".weakref",
            Arch => ".arch",
            Linefile => ".linefile",
            Loc => ".loc",
            AllowIndexReg => ".allow_index_reg",
            DisallowIndexReg => ".disallow_index_reg",
            Org => ".org",
            Code16 => ".code16",
            Code16Gcc => ".code16gcc",
            Code32 => ".code32",
            Code64 => ".code64",
            DcD => ".dc.d",
            DcS => ".dc.s",
            DcX => ".dc.x",
            Hidden => ".hidden",
            Fill => ".fill",
            Struct => ".struct",
            Incbin => ".incbin",
            Symver => ".symver",
            LocMarkLabels => ".loc_mark_labels",
            CfiStartproc => ".cfi_startproc",
            CfiEndproc => ".cfi_endproc",
            CfiDefCfa => ".cfi_def_cfa",
            CfiDefCfaRegister => ".cfi_def_cfa_register",
            CfiDefCfaOffset => ".cfi_def_cfa_offset",
            CfiAdjustCfaOffset => ".cfi_adjust_cfa_offset",
            CfiOffset => ".cfi_offset",
            CfiRelOffset => ".cfi_rel_offset",
            CfiRegister => ".cfi_register",
            CfiReturnColumn => ".cfi_return_column",
            CfiRestore => ".cfi_restore",
            CfiUndefined => ".cfi_undefined",
            CfiSameValue => ".cfi_same_value",
            CfiRememberState => ".cfi_remember_state",
            CfiRestoreState => ".cfi_restore_state",
            CfiWindowSave => ".cfi_window_save",
            CfiEscape => ".cfi_escape",
            CfiSignalFrame => ".cfi_signal_frame",
            CfiPersonality => ".cfi_personality",
            CfiLsda => ".cfi_lsda",
            CfiValEncodedAddr => ".cfi_val_encoded_addr",
        }
    }

    /// Does this directive emit data bytes?
    pub fn is_data_directive(self) -> bool {
        use DirectiveOp::*;
        matches!(
            self,
            Byte | Word
                | Rva
                | Long
                | Quad
                | Ascii
                | String8
                | String16
                | String32
                | String64
                | Sleb128
                | Uleb128
                | Space
                | DsB
                | DsW
                | DsL
                | DsD
                | DsX
                | DcD
                | DcS
                | DcX
                | Fill
        )
    }

    /// Debug-information directives that must be preserved verbatim.
    pub fn is_debug_directive(self) -> bool {
        use DirectiveOp::*;
        matches!(self, Linefile | File | Loc)
    }
}

/// A directive entry: an opcode tag plus operands.
#[derive(Clone, Debug)]
pub struct DirectiveEntry {
    pub op: DirectiveOp,
    pub operands: SmallVec<[DirOperand; 3]>,
}

impl DirectiveEntry {
    /// Create a directive from an operand slice.
    pub fn new(op: DirectiveOp, operands: &[DirOperand]) -> Self {
        Self {
            op,
            operands: operands.iter().cloned().collect(),
        }
    }

    /// Number of operands.
    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// Operand `i`; panics if absent.
    pub fn operand(&self, i: usize) -> &DirOperand {
        &self.operands[i]
    }

    /// Could this directive be one slot of a jump table?
    pub fn is_jump_table_entry(&self) -> bool {
        matches!(self.op, DirectiveOp::Long | DirectiveOp::Quad)
    }

    /// The label a jump-table slot transfers to, or `None` when the operand
    /// does not name a symbol. For PIC tables the entry is a difference and
    /// the minuend is the target.
    pub fn jump_table_target(&self) -> Option<&str> {
        debug_assert!(self.is_jump_table_entry());
        if self.num_operands() != 1 {
            return None;
        }
        match self.operand(0) {
            DirOperand::Str(s) => Some(s),
            DirOperand::Sym(s) => Some(s),
            DirOperand::Expr(e) => e.symbol_name(),
            _ => None,
        }
    }
}

impl fmt::Display for DirectiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\t{}", self.op.name())?;
        for (i, operand) in self.operands.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { "\t" } else { ", " }, operand)?;
        }
        Ok(())
    }
}

/// A label entry.
#[derive(Clone, Debug)]
pub struct LabelEntry {
    pub name: Box<str>,
    /// True when the label came from the assembly source; false for labels
    /// synthesised by the framework.
    pub from_assembly: bool,
}

impl fmt::Display for LabelEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.name)
    }
}

/// An instruction entry: the opaque machine-instruction record plus the
/// pre-decoded mode flag and an optional execution-count annotation from
/// profile feedback.
#[derive(Clone, Debug)]
pub struct InsnEntry {
    pub insn: x86::Insn,
    pub mode: x86::ExecMode,
    pub exec_count: Option<u64>,
}

impl InsnEntry {
    /// The pre-decoded opcode tag.
    pub fn op(&self) -> x86::Op {
        self.insn.op
    }
}

impl fmt::Display for InsnEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.insn)
    }
}

/// The payload of one entry: a closed sum of the three variants.
#[derive(Clone, Debug)]
pub enum EntryData {
    Insn(InsnEntry),
    Label(LabelEntry),
    Directive(DirectiveEntry),
}

impl EntryData {
    pub fn is_insn(&self) -> bool {
        matches!(self, EntryData::Insn(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(self, EntryData::Label(_))
    }

    pub fn is_directive(&self) -> bool {
        matches!(self, EntryData::Directive(_))
    }

    /// Downcast to the instruction payload; panics on other variants.
    pub fn as_insn(&self) -> &InsnEntry {
        match self {
            EntryData::Insn(i) => i,
            other => panic!("entry is not an instruction: {}", other),
        }
    }

    /// Downcast to the label payload; panics on other variants.
    pub fn as_label(&self) -> &LabelEntry {
        match self {
            EntryData::Label(l) => l,
            other => panic!("entry is not a label: {}", other),
        }
    }

    /// Downcast to the directive payload; panics on other variants.
    pub fn as_directive(&self) -> &DirectiveEntry {
        match self {
            EntryData::Directive(d) => d,
            other => panic!("entry is not a directive: {}", other),
        }
    }
}

impl fmt::Display for EntryData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryData::Insn(i) => write!(f, "{}", i),
            EntryData::Label(l) => write!(f, "{}", l),
            EntryData::Directive(d) => write!(f, "{}", d),
        }
    }
}
