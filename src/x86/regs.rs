//! The register universe.
//!
//! Registers are numbered into a fixed 256-bit universe; each architectural
//! view (`%rax`, `%eax`, `%ax`, `%al`, `%ah`) gets its own bit so analyses
//! can distinguish partial writes. The excess bits beyond the last named
//! register are never set by a defined mask; an unknown-side-effect
//! instruction yields the undef sentinel instead.

use crate::bitstring::BitString;

/// Width of register bit masks. Larger than the number of named registers.
pub const REG_UNIVERSE_BITS: u32 = 256;

/// A machine register, identified by its bit number in the universe.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Reg(u8);

struct RegDesc {
    name: &'static str,
    /// Bit number of the next-wider view of the same register, or -1.
    parent: i16,
}

const fn r(name: &'static str, parent: i16) -> RegDesc {
    RegDesc { name, parent }
}

// Table order fixes the bit numbering; appending is fine, reordering is not.
#[rustfmt::skip]
static REG_TABLE: [RegDesc; 86] = [
    r("rax", -1), r("eax", 0),  r("ax", 1),   r("al", 2),   r("ah", 2),
    r("rcx", -1), r("ecx", 5),  r("cx", 6),   r("cl", 7),   r("ch", 7),
    r("rdx", -1), r("edx", 10), r("dx", 11),  r("dl", 12),  r("dh", 12),
    r("rbx", -1), r("ebx", 15), r("bx", 16),  r("bl", 17),  r("bh", 17),
    r("rsp", -1), r("esp", 20), r("sp", 21),  r("spl", 22),
    r("rbp", -1), r("ebp", 24), r("bp", 25),  r("bpl", 26),
    r("rsi", -1), r("esi", 28), r("si", 29),  r("sil", 30),
    r("rdi", -1), r("edi", 32), r("di", 33),  r("dil", 34),
    r("r8", -1),  r("r8d", 36), r("r8w", 37), r("r8b", 38),
    r("r9", -1),  r("r9d", 40), r("r9w", 41), r("r9b", 42),
    r("r10", -1), r("r10d", 44), r("r10w", 45), r("r10b", 46),
    r("r11", -1), r("r11d", 48), r("r11w", 49), r("r11b", 50),
    r("r12", -1), r("r12d", 52), r("r12w", 53), r("r12b", 54),
    r("r13", -1), r("r13d", 56), r("r13w", 57), r("r13b", 58),
    r("r14", -1), r("r14d", 60), r("r14w", 61), r("r14b", 62),
    r("r15", -1), r("r15d", 64), r("r15w", 65), r("r15b", 66),
    r("rip", -1),
    r("rflags", -1),
    r("xmm0", -1),  r("xmm1", -1),  r("xmm2", -1),  r("xmm3", -1),
    r("xmm4", -1),  r("xmm5", -1),  r("xmm6", -1),  r("xmm7", -1),
    r("xmm8", -1),  r("xmm9", -1),  r("xmm10", -1), r("xmm11", -1),
    r("xmm12", -1), r("xmm13", -1), r("xmm14", -1), r("xmm15", -1),
];

/// Registers named in pattern matching and implicit-effect tables.
pub const RSP: Reg = Reg(20);
pub const RBP: Reg = Reg(24);
pub const RIP: Reg = Reg(68);
pub const RFLAGS: Reg = Reg(69);
const XMM0_BIT: u32 = 70;

impl Reg {
    /// Bit number of this register in the universe.
    pub fn bit(self) -> u32 {
        self.0 as u32
    }

    /// AT&T name without the `%` sigil.
    pub fn name(self) -> &'static str {
        REG_TABLE[self.0 as usize].name
    }

    /// The next-wider view of the same register, if any.
    pub fn parent(self) -> Option<Reg> {
        let p = REG_TABLE[self.0 as usize].parent;
        if p < 0 { None } else { Some(Reg(p as u8)) }
    }

    /// Is this one of the `%xmm` registers?
    pub fn is_xmm(self) -> bool {
        self.bit() >= XMM0_BIT
    }
}

impl core::fmt::Display for Reg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "%{}", self.name())
    }
}

/// Look up a register by its AT&T name, with or without the `%` sigil.
pub fn reg_from_name(name: &str) -> Option<Reg> {
    let name = name.strip_prefix('%').unwrap_or(name);
    REG_TABLE
        .iter()
        .position(|d| d.name == name)
        .map(|ix| Reg(ix as u8))
}

/// Mask with only `reg`'s own bit set.
pub fn mask_for_register(reg: Reg) -> BitString {
    let mut bs = BitString::new(REG_UNIVERSE_BITS);
    bs.set(reg.bit());
    bs
}

/// Mask of all enclosing wider views of `reg` (e.g. `%rax` for `%eax`).
pub fn parent_regs(reg: Reg) -> BitString {
    let mut bs = BitString::new(REG_UNIVERSE_BITS);
    let mut cur = reg.parent();
    while let Some(p) = cur {
        bs.set(p.bit());
        cur = p.parent();
    }
    bs
}

/// `reg` together with all of its wider views. Writing or reading a
/// sub-register touches the enclosing register as well.
pub fn mask_with_parents(reg: Reg) -> BitString {
    let mut bs = parent_regs(reg);
    bs.set(reg.bit());
    bs
}

/// All views of the register family rooted at the 64-bit register `name`.
fn family_mask(bs: &mut BitString, name: &str) {
    let top_bit = reg_from_name(name).expect("unknown register family").bit();
    for ix in 0..REG_TABLE.len() {
        let mut root = ix as i16;
        // Chase to the family root.
        while REG_TABLE[root as usize].parent >= 0 {
            root = REG_TABLE[root as usize].parent;
        }
        if root as u32 == top_bit {
            bs.set(ix as u32);
        }
    }
}

/// The SysV AMD64 argument registers: `%rdi %rsi %rdx %rcx %r8 %r9` and
/// their sub-registers.
pub fn calling_convention_def_mask() -> BitString {
    let mut bs = BitString::new(REG_UNIVERSE_BITS);
    for name in ["rdi", "rsi", "rdx", "rcx", "r8", "r9"] {
        family_mask(&mut bs, name);
    }
    bs
}

/// Registers clobbered by a call under the SysV ABI (caller-saved set).
pub fn caller_saved_mask() -> BitString {
    let mut bs = calling_convention_def_mask();
    for name in ["rax", "r10", "r11"] {
        family_mask(&mut bs, name);
    }
    for i in 0..16 {
        bs.set(XMM0_BIT + i);
    }
    bs.set(RFLAGS.bit());
    bs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_names() {
        let eax = reg_from_name("%eax").unwrap();
        assert_eq!(eax.name(), "eax");
        assert_eq!(reg_from_name("r11d").unwrap().name(), "r11d");
        assert!(reg_from_name("zmm0").is_none());
        assert_eq!(RSP.name(), "rsp");
        assert_eq!(RBP.name(), "rbp");
        assert_eq!(RIP.name(), "rip");
    }

    #[test]
    fn parents() {
        let al = reg_from_name("al").unwrap();
        let parents: Vec<u32> = parent_regs(al).iter().collect();
        let ax = reg_from_name("ax").unwrap();
        let eax = reg_from_name("eax").unwrap();
        let rax = reg_from_name("rax").unwrap();
        assert_eq!(parents, vec![rax.bit(), eax.bit(), ax.bit()]);
        assert!(parent_regs(rax).is_null());
    }

    #[test]
    fn table_is_consistent() {
        // Every parent must be a wider view declared earlier in the table.
        for ix in 0..REG_TABLE.len() {
            let reg = Reg(ix as u8);
            assert_eq!(reg_from_name(reg.name()).unwrap(), reg);
            if let Some(p) = reg.parent() {
                assert!(p.bit() < reg.bit());
            }
        }
    }

    #[test]
    fn abi_masks() {
        let cc = calling_convention_def_mask();
        assert!(cc.get(reg_from_name("rdi").unwrap().bit()));
        assert!(cc.get(reg_from_name("edi").unwrap().bit()));
        assert!(cc.get(reg_from_name("r9b").unwrap().bit()));
        assert!(!cc.get(reg_from_name("rax").unwrap().bit()));
        let clobbers = caller_saved_mask();
        assert!(clobbers.get(reg_from_name("rax").unwrap().bit()));
        assert!(clobbers.get(reg_from_name("xmm7").unwrap().bit()));
        assert!(!clobbers.get(reg_from_name("rbx").unwrap().bit()));
    }
}
