//! Relaxation: per-entry sizes and offsets for a section.
//!
//! The relaxer mirrors the assembler's fragment model. A section becomes a
//! linear list of fragments, each with a fixed byte count and, on fragments
//! that end with an encoding-variable construct, a variable tail: a
//! short-or-near jump, an alignment directive, a LEB128 with a non-constant
//! argument, or a space/fill with a non-constant repeat. Fixed-point
//! iteration assigns fragment addresses and grows jump encodings until
//! nothing moves. Jump growth is monotone (short to near, never back), so
//! the iteration terminates.
//!
//! Results are cached on the section; passes that mutate entries must call
//! [Relaxer::invalidate] before reading sizes or offsets again.

use cranelift_entity::packed_option::PackedOption;
use log::debug;

use crate::fx::FxHashMap;
use crate::ir::{
    DirectiveEntry, DirectiveOp, Entry, EntryData, EntrySizeMap, Expr, Func, Section, Unit,
};
use crate::x86::{self, ExecMode};

/// Safety cap on relaxation passes; exceeding it means the fragment sizes
/// never stabilised, which signals a bug.
const MAX_RELAX_PASSES: u32 = 1000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum JumpSize {
    Short,
    Near,
}

enum FragVar {
    /// Terminal fragment, no variable part.
    None,
    /// A direct jump that is short now and may grow.
    Jump {
        cond: bool,
        code16: bool,
        target: Box<str>,
        state: JumpSize,
    },
    /// `.p2align` family. `max_skip` of zero means unbounded.
    Align { log2: u32, max_skip: u32 },
    /// `.sleb128`/`.uleb128` with a non-constant argument.
    Leb128 { expr: Expr, signed: bool },
    /// `.space`/`.ds.*`/`.fill` with a non-constant repeat; the byte count
    /// is `mult * value`.
    Space { expr: Expr, mult: u32 },
}

struct Frag {
    fix: u32,
    var: FragVar,
    var_size: u32,
    address: u32,
    /// The entry whose size owns the variable part.
    entry: PackedOption<Entry>,
}

/// Computes and caches size/offset maps per section.
pub struct Relaxer;

impl Relaxer {
    /// The size map for `section`, relaxing on first use.
    pub fn sizes(unit: &mut Unit, section: Section) -> &EntrySizeMap {
        Self::cache(unit, section);
        unit.sections[section].sizes().unwrap()
    }

    /// The offset map for `section`, relaxing on first use.
    pub fn offsets(unit: &mut Unit, section: Section) -> &EntrySizeMap {
        Self::cache(unit, section);
        unit.sections[section].offsets().unwrap()
    }

    /// Has `section` been relaxed since the last invalidation?
    pub fn has_size_map(unit: &Unit, section: Section) -> bool {
        unit.sections[section].has_size_map()
    }

    /// Discard both maps; the next query reruns relaxation. Every pass that
    /// mutates a section's entries owes this call.
    pub fn invalidate(unit: &mut Unit, section: Section) {
        unit.sections[section].invalidate_sizes();
    }

    fn cache(unit: &mut Unit, section: Section) {
        if !unit.sections[section].has_size_map() {
            let (sizes, offsets) = Self::relax(unit, section);
            unit.sections[section].set_maps(sizes, offsets);
        }
    }

    /// Run relaxation over `section` and return fresh size and offset maps.
    pub fn relax(unit: &Unit, section: Section) -> (EntrySizeMap, EntrySizeMap) {
        let mut builder = FragBuilder::new();
        for e in unit.section_entries(section) {
            builder.entry(unit, e);
        }
        let (mut frags, mut sizes, bindings) = builder.finish();

        let passes = relax_frags(&mut frags, &bindings);
        debug!(
            "relax: section {} stabilised after {} passes",
            unit.sections[section].name, passes
        );

        for frag in &frags {
            if let Some(e) = frag.entry.expand() {
                *sizes.get_mut(&e).unwrap() += frag.var_size;
            }
        }

        let mut offsets = EntrySizeMap::default();
        let mut offset = 0;
        for e in unit.section_entries(section) {
            offsets.insert(e, offset);
            offset += sizes[&e];
        }
        (sizes, offsets)
    }

    /// Total byte size of a size map.
    pub fn section_size(sizes: &EntrySizeMap) -> u32 {
        sizes.values().sum()
    }

    /// Byte size of one function: the sum over its non-label entries.
    pub fn function_size(unit: &Unit, func: Func, sizes: &EntrySizeMap) -> u32 {
        unit.function_entries(func)
            .filter(|&e| !unit[e].data.is_label())
            .map(|e| *sizes.get(&e).expect("entry missing from size map"))
            .sum()
    }
}

/// Accumulates fragments while walking a section's entries.
struct FragBuilder {
    frags: Vec<Frag>,
    fix: u32,
    sizes: EntrySizeMap,
    /// Symbol name to (fragment index, offset of the binding inside the
    /// fragment's fixed part).
    bindings: FxHashMap<Box<str>, (usize, u32)>,
}

impl FragBuilder {
    fn new() -> Self {
        Self {
            frags: Vec::new(),
            fix: 0,
            sizes: EntrySizeMap::default(),
            bindings: FxHashMap::default(),
        }
    }

    fn end_frag(&mut self, var: FragVar, entry: Option<Entry>) {
        self.frags.push(Frag {
            fix: self.fix,
            var,
            var_size: 0,
            address: 0,
            entry: entry.into(),
        });
        self.fix = 0;
    }

    fn finish(mut self) -> (Vec<Frag>, EntrySizeMap, FxHashMap<Box<str>, (usize, u32)>) {
        self.end_frag(FragVar::None, None);
        (self.frags, self.sizes, self.bindings)
    }

    fn entry(&mut self, unit: &Unit, e: Entry) {
        match &unit[e].data {
            EntryData::Insn(i) => {
                let (size, relaxable) = x86::insn_size(&i.insn);
                self.sizes.insert(e, size);
                self.fix += size;
                if relaxable {
                    let target = i.insn.target().unwrap();
                    self.end_frag(
                        FragVar::Jump {
                            cond: i.insn.is_cond_jump(),
                            code16: i.mode == ExecMode::Code16,
                            target: target.into(),
                            state: JumpSize::Short,
                        },
                        Some(e),
                    );
                }
            }
            EntryData::Label(l) => {
                self.sizes.insert(e, 0);
                let binding = (self.frags.len(), self.fix);
                self.bindings.insert(l.name.clone(), binding);
                for alias in unit.aliases_of(&l.name) {
                    self.bindings.insert(alias.clone(), binding);
                }
            }
            EntryData::Directive(d) => self.directive(e, d),
        }
    }

    fn fixed(&mut self, e: Entry, size: u32) {
        self.sizes.insert(e, size);
        self.fix += size;
    }

    fn directive(&mut self, e: Entry, d: &DirectiveEntry) {
        use DirectiveOp::*;
        match d.op {
            P2Align | P2AlignW | P2AlignL => {
                assert_eq!(d.num_operands(), 3, "malformed {}", d.op.name());
                let log2 = d.operand(0).int() as u32;
                let max_skip = d.operand(2).int() as u32;
                self.sizes.insert(e, 0);
                self.end_frag(FragVar::Align { log2, max_skip }, Some(e));
            }
            Sleb128 | Uleb128 => {
                let signed = d.op == Sleb128;
                assert_eq!(d.num_operands(), 1, "malformed {}", d.op.name());
                match d.operand(0).expr() {
                    Expr::Constant(v) => {
                        let size = sizeof_leb128(*v, signed);
                        self.fixed(e, size);
                    }
                    expr => {
                        self.sizes.insert(e, 0);
                        self.end_frag(
                            FragVar::Leb128 {
                                expr: expr.clone(),
                                signed,
                            },
                            Some(e),
                        );
                    }
                }
            }
            Byte => self.fixed(e, 1),
            Word => self.fixed(e, 2),
            Rva | Long => self.fixed(e, 4),
            Quad => self.fixed(e, 8),
            Ascii => self.string(e, d, 1, false),
            String8 => self.string(e, d, 1, true),
            String16 => self.string(e, d, 2, true),
            String32 => self.string(e, d, 4, true),
            String64 => self.string(e, d, 8, true),
            Space => self.space(e, d, 0),
            DsB => self.space(e, d, 1),
            DsW => self.space(e, d, 2),
            DsL => self.space(e, d, 4),
            DsD => self.space(e, d, 8),
            DsX => self.space(e, d, 12),
            Fill => self.fill(e, d),
            DcD | DcS | DcX => {
                let size = size_of_float(d);
                self.fixed(e, size);
            }
            Org => panic!(".org directive unsupported in relaxer"),
            Struct => panic!(".struct directive unsupported in relaxer"),
            Incbin => panic!(".incbin directive unsupported in relaxer"),
            // Everything else emits no bytes.
            Comm | Ident | Set | File | Section | Global | Local | Weak | Type | Size | Equiv
            | Weakref | Arch | Linefile | Loc | AllowIndexReg | DisallowIndexReg | Code16
            | Code16Gcc | Code32 | Code64 | Hidden | Symver | LocMarkLabels | CfiStartproc
            | CfiEndproc | CfiDefCfa | CfiDefCfaRegister | CfiDefCfaOffset | CfiAdjustCfaOffset
            | CfiOffset | CfiRelOffset | CfiRegister | CfiReturnColumn | CfiRestore
            | CfiUndefined | CfiSameValue | CfiRememberState | CfiRestoreState | CfiWindowSave
            | CfiEscape | CfiSignalFrame | CfiPersonality | CfiLsda | CfiValEncodedAddr => {
                self.sizes.insert(e, 0);
            }
        }
    }

    fn string(&mut self, e: Entry, d: &DirectiveEntry, mult: u32, null_terminate: bool) {
        assert_eq!(d.num_operands(), 1, "malformed {}", d.op.name());
        // The operand keeps its quotes; subtract them, add the terminator
        // if the directive has one, scale by the character size.
        let len = d.operand(0).str().len() as u32;
        let size = mult * (len - 2 + if null_terminate { 1 } else { 0 });
        self.fixed(e, size);
    }

    fn space(&mut self, e: Entry, d: &DirectiveEntry, mult: u32) {
        assert_eq!(d.num_operands(), 2, "malformed {}", d.op.name());
        match d.operand(0).expr() {
            Expr::Constant(v) => {
                let increment = *v as u32 * if mult == 0 { 1 } else { mult };
                assert!(increment > 0, "{} of zero bytes", d.op.name());
                self.fixed(e, increment);
            }
            expr => {
                assert!(mult <= 1, "non-constant {} repeat", d.op.name());
                self.sizes.insert(e, 0);
                self.end_frag(
                    FragVar::Space {
                        expr: expr.clone(),
                        mult: 1,
                    },
                    Some(e),
                );
            }
        }
    }

    fn fill(&mut self, e: Entry, d: &DirectiveEntry) {
        assert_eq!(d.num_operands(), 3, "malformed .fill");
        let size = d.operand(1).int() as u32;
        assert!(size >= 1, ".fill with zero size");
        match d.operand(0).expr() {
            Expr::Constant(repeat) => {
                self.fixed(e, size * *repeat as u32);
            }
            expr => {
                self.sizes.insert(e, 0);
                self.end_frag(
                    FragVar::Space {
                        expr: expr.clone(),
                        mult: size,
                    },
                    Some(e),
                );
            }
        }
    }
}

fn size_of_float(d: &DirectiveEntry) -> u32 {
    assert_eq!(d.num_operands(), 1, "malformed {}", d.op.name());
    let text = d.operand(0).str();
    // Hexadecimal floats always have a fixed size; decimal forms are
    // converted through 2-byte littlenums.
    if text.starts_with("0x:") {
        match d.op {
            DirectiveOp::DcD => 8,
            DirectiveOp::DcS => 4,
            DirectiveOp::DcX => 12,
            _ => unreachable!(),
        }
    } else {
        const LITTLENUM_BYTES: u32 = 2;
        match d.op {
            DirectiveOp::DcD => 4 * LITTLENUM_BYTES,
            DirectiveOp::DcS => 2 * LITTLENUM_BYTES,
            DirectiveOp::DcX => 5 * LITTLENUM_BYTES,
            _ => unreachable!(),
        }
    }
}

/// Byte size of `value` in LEB128.
fn sizeof_leb128(value: i64, signed: bool) -> u32 {
    let mut size = 0;
    if signed {
        let mut v = value;
        loop {
            size += 1;
            let byte = (v & 0x3f) as u8;
            v >>= 7;
            if (v == 0 && byte & 0x20 == 0) || (v == -1 && byte & 0x20 != 0) {
                break;
            }
        }
    } else {
        let mut v = value as u64;
        loop {
            size += 1;
            v >>= 7;
            if v == 0 {
                break;
            }
        }
    }
    size
}

fn jump_var_size(cond: bool, code16: bool, state: JumpSize) -> u32 {
    match state {
        JumpSize::Short => 0,
        // Near form: rel32 (rel16 in 16-bit code), plus the two-byte 0F
        // opcode for conditional jumps.
        JumpSize::Near => match (cond, code16) {
            (false, false) => 3,
            (true, false) => 4,
            (false, true) => 1,
            (true, true) => 2,
        },
    }
}

/// Iterate to the fixed point; returns the number of passes.
fn relax_frags(frags: &mut [Frag], bindings: &FxHashMap<Box<str>, (usize, u32)>) -> u32 {
    let sym_addr = |frags: &[Frag], name: &str| -> Option<i64> {
        bindings
            .get(name)
            .map(|&(frag_ix, value)| frags[frag_ix].address as i64 + value as i64)
    };
    let eval = |frags: &[Frag], expr: &Expr| -> Option<i64> {
        match expr {
            Expr::Constant(v) => Some(*v),
            Expr::Symbol(s) => sym_addr(frags, s),
            Expr::SymbolPlus(s, add) => sym_addr(frags, s).map(|a| a + add),
            Expr::Diff(a, b, add) => {
                Some(sym_addr(frags, a)? - sym_addr(frags, b)? + add)
            }
        }
    };

    let mut passes = 0;
    loop {
        passes += 1;
        assert!(
            passes <= MAX_RELAX_PASSES,
            "relaxation failed to reach a fixed point"
        );
        let mut changed = false;
        let mut addr = 0u32;
        for i in 0..frags.len() {
            if frags[i].address != addr {
                frags[i].address = addr;
                changed = true;
            }
            let fix_end = addr + frags[i].fix;
            let mut grown_jump = None;
            let var = match &frags[i].var {
                FragVar::None => 0,
                FragVar::Jump {
                    cond,
                    code16,
                    target,
                    state,
                } => {
                    let mut state = *state;
                    if state == JumpSize::Short {
                        // An unknown symbol is external: assume near.
                        let fits = match sym_addr(frags, target) {
                            Some(t) => {
                                let disp = t - fix_end as i64;
                                (-128..=127).contains(&disp)
                            }
                            None => false,
                        };
                        if !fits {
                            state = JumpSize::Near;
                            grown_jump = Some(state);
                        }
                    }
                    jump_var_size(*cond, *code16, state)
                }
                FragVar::Align { log2, max_skip } => {
                    let alignment = 1u32 << log2;
                    let skip = fix_end.next_multiple_of(alignment) - fix_end;
                    if *max_skip > 0 && skip > *max_skip {
                        0
                    } else {
                        skip
                    }
                }
                FragVar::Leb128 { expr, signed } => {
                    let value = eval(frags, expr)
                        .unwrap_or_else(|| panic!("undefined symbol in {}", expr));
                    sizeof_leb128(value, *signed)
                }
                FragVar::Space { expr, mult } => {
                    let value = eval(frags, expr)
                        .unwrap_or_else(|| panic!("undefined symbol in {}", expr));
                    mult * value.max(0) as u32
                }
            };
            if let Some(new_state) = grown_jump {
                if let FragVar::Jump { state, .. } = &mut frags[i].var {
                    *state = new_state;
                }
            }
            if frags[i].var_size != var {
                frags[i].var_size = var;
                changed = true;
            }
            addr = fix_end + var;
        }
        if !changed {
            return passes;
        }
    }
}
