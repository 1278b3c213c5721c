// This module defines the operand model used by the instruction encoder: the
// sixteen general-purpose registers with their 3-bit encodings and REX
// extension bits, the 8-bit register alias view (AL/CL/DL/BL are reachable
// without a REX prefix, the rest require one), memory operands expressed as
// base + index*scale + displacement with the architecture's addressing-mode
// rules enforced at construction (RSP can never be an index register,
// base-less forms always carry a 32-bit displacement), immediates that the
// encoder narrows to their smallest representation, and the condition-code
// enumeration with negation and argument-swap tables. It also carries the
// small register-set bitmask the allocator works with.

//! Registers, memory operands, immediates and condition codes.

/// General-purpose 64-bit registers, numbered by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    pub fn from_index(i: u8) -> Reg {
        Reg::ALL[i as usize]
    }

    /// Low three bits for ModRM/SIB fields.
    pub fn low3(self) -> u8 {
        self as u8 & 7
    }

    /// Whether the register needs a REX extension bit.
    pub fn is_extended(self) -> bool {
        self as u8 >= 8
    }

    /// The 8-bit alias of this register. AL/CL/DL/BL encode without a REX
    /// prefix; every other alias forces one.
    pub fn low8(self) -> Reg8 {
        Reg8(self)
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self as usize]
    }
}

/// 8-bit register alias view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg8(pub Reg);

impl Reg8 {
    pub fn low3(self) -> u8 {
        self.0.low3()
    }

    pub fn is_extended(self) -> bool {
        self.0.is_extended()
    }

    /// SPL/BPL/SIL/DIL (and the extended registers) are only addressable
    /// with a REX prefix present.
    pub fn needs_rex(self) -> bool {
        self.0 as u8 >= 4
    }
}

/// Index scale for SIB addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    S1 = 0,
    S2 = 1,
    S4 = 2,
    S8 = 3,
}

impl Scale {
    /// Scale for a power-of-two item size, if the size has one.
    pub fn for_size(size: i32) -> Option<Scale> {
        match size {
            1 => Some(Scale::S1),
            2 => Some(Scale::S2),
            4 => Some(Scale::S4),
            8 => Some(Scale::S8),
            _ => None,
        }
    }
}

/// A memory operand: base + index*scale + displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Option<Reg>,
    pub index: Option<(Reg, Scale)>,
    pub disp: i32,
}

impl Mem {
    /// Plain base + displacement.
    pub fn base(base: Reg, disp: i32) -> Mem {
        Mem {
            base: Some(base),
            index: None,
            disp,
        }
    }

    /// Absolute 32-bit displacement, no registers.
    pub fn absolute(disp: i32) -> Mem {
        Mem {
            base: None,
            index: None,
            disp,
        }
    }

    /// Full base+index*scale+disp form. The stack pointer cannot serve as
    /// an index register.
    pub fn sib(base: Option<Reg>, index: Reg, scale: Scale, disp: i32) -> Mem {
        debug_assert!(index != Reg::Rsp, "rsp cannot be an index register");
        Mem {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

/// A concrete instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Mem(Mem),
    Imm(i64),
}

impl Operand {
    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg(_))
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }
}

/// Condition codes, numbered by their encoding in Jcc/SETcc/CMOVcc opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    pub fn from_index(i: u8) -> Cond {
        const ALL: [Cond; 16] = [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Ae,
            Cond::E,
            Cond::Ne,
            Cond::Be,
            Cond::A,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
        ];
        ALL[i as usize]
    }

    /// The opposite condition; encodings pair up so this is a bit flip.
    pub fn negate(self) -> Cond {
        Cond::from_index(self as u8 ^ 1)
    }

    /// The condition that holds when the two compared operands are swapped.
    pub fn swap_args(self) -> Cond {
        match self {
            Cond::L => Cond::G,
            Cond::G => Cond::L,
            Cond::Le => Cond::Ge,
            Cond::Ge => Cond::Le,
            Cond::B => Cond::A,
            Cond::A => Cond::B,
            Cond::Be => Cond::Ae,
            Cond::Ae => Cond::Be,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
        ];
        NAMES[self as usize]
    }
}

/// Bitmask over the sixteen general registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegSet(pub u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    /// Every register the allocator may hand out: all sixteen minus the
    /// stack and frame pointers.
    pub const ALLOCATABLE: RegSet = RegSet(0xFFFF & !(1 << 4) & !(1 << 5));

    pub fn contains(self, r: Reg) -> bool {
        self.0 & (1 << r as u8) != 0
    }

    pub fn insert(&mut self, r: Reg) {
        self.0 |= 1 << r as u8;
    }

    pub fn remove(&mut self, r: Reg) {
        self.0 &= !(1 << r as u8);
    }

    pub fn union(self, other: RegSet) -> RegSet {
        RegSet(self.0 | other.0)
    }

    pub fn minus(self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn first(self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            Some(Reg::from_index(self.0.trailing_zeros() as u8))
        }
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::ALL.into_iter().filter(move |r| self.contains(*r))
    }

    pub fn of(regs: &[Reg]) -> RegSet {
        let mut s = RegSet::EMPTY;
        for &r in regs {
            s.insert(r);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_negate_pairs() {
        assert_eq!(Cond::E.negate(), Cond::Ne);
        assert_eq!(Cond::Ne.negate(), Cond::E);
        assert_eq!(Cond::L.negate(), Cond::Ge);
        assert_eq!(Cond::B.negate(), Cond::Ae);
        for i in 0..16 {
            let c = Cond::from_index(i);
            assert_eq!(c.negate().negate(), c);
        }
    }

    #[test]
    fn test_cond_swap_args() {
        assert_eq!(Cond::L.swap_args(), Cond::G);
        assert_eq!(Cond::Ge.swap_args(), Cond::Le);
        assert_eq!(Cond::A.swap_args(), Cond::B);
        assert_eq!(Cond::E.swap_args(), Cond::E);
        assert_eq!(Cond::Ne.swap_args(), Cond::Ne);
    }

    #[test]
    fn test_regset_allocatable_excludes_pointers() {
        assert!(!RegSet::ALLOCATABLE.contains(Reg::Rsp));
        assert!(!RegSet::ALLOCATABLE.contains(Reg::Rbp));
        assert_eq!(RegSet::ALLOCATABLE.len(), 14);
    }

    #[test]
    fn test_regset_first_and_iter() {
        let mut s = RegSet::EMPTY;
        s.insert(Reg::Rdx);
        s.insert(Reg::R9);
        assert_eq!(s.first(), Some(Reg::Rdx));
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![Reg::Rdx, Reg::R9]);
        s.remove(Reg::Rdx);
        assert_eq!(s.first(), Some(Reg::R9));
    }

    #[test]
    fn test_reg8_rex_rules() {
        assert!(!Reg::Rax.low8().needs_rex());
        assert!(!Reg::Rbx.low8().needs_rex());
        assert!(Reg::Rsi.low8().needs_rex());
        assert!(Reg::R8.low8().needs_rex());
    }
}
