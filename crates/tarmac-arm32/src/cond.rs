//! Condition codes and the icmp lowering tables.

use tarmac_ir::IcmpCond;

/// ARM condition codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    /// Mnemonic suffix; empty for AL.
    pub fn suffix(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Cs => "cs",
            Cond::Cc => "cc",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "",
        }
    }

    /// The opposite condition. AL has none.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => panic!("AL has no opposite condition"),
        }
    }
}

/// How to lower a 64-bit icmp: operand order, compare flavor, and the two
/// conditional moves that materialize the boolean.
#[derive(Clone, Copy, Debug)]
pub struct Icmp64Entry {
    pub is_signed: bool,
    pub swapped: bool,
    pub c1: Cond,
    pub c2: Cond,
}

struct IcmpRow {
    cond32: Cond,
    entry64: Icmp64Entry,
}

const fn row(cond32: Cond, is_signed: bool, swapped: bool, c1: Cond, c2: Cond) -> IcmpRow {
    IcmpRow {
        cond32,
        entry64: Icmp64Entry {
            is_signed,
            swapped,
            c1,
            c2,
        },
    }
}

/// Indexed by `IcmpCond` declaration order.
const ICMP_TABLE: [IcmpRow; 10] = [
    row(Cond::Eq, false, false, Cond::Eq, Cond::Ne), // Eq
    row(Cond::Ne, false, false, Cond::Ne, Cond::Eq), // Ne
    row(Cond::Hi, false, false, Cond::Hi, Cond::Ls), // Ugt
    row(Cond::Cs, false, false, Cond::Cs, Cond::Cc), // Uge
    row(Cond::Cc, false, false, Cond::Cc, Cond::Cs), // Ult
    row(Cond::Ls, false, false, Cond::Ls, Cond::Hi), // Ule
    row(Cond::Gt, true, true, Cond::Lt, Cond::Ge),   // Sgt
    row(Cond::Ge, true, false, Cond::Ge, Cond::Lt),  // Sge
    row(Cond::Lt, true, false, Cond::Lt, Cond::Ge),  // Slt
    row(Cond::Le, true, true, Cond::Ge, Cond::Lt),   // Sle
];

fn index(cond: IcmpCond) -> usize {
    match cond {
        IcmpCond::Eq => 0,
        IcmpCond::Ne => 1,
        IcmpCond::Ugt => 2,
        IcmpCond::Uge => 3,
        IcmpCond::Ult => 4,
        IcmpCond::Ule => 5,
        IcmpCond::Sgt => 6,
        IcmpCond::Sge => 7,
        IcmpCond::Slt => 8,
        IcmpCond::Sle => 9,
    }
}

/// Condition for a 32-bit-or-narrower icmp after the operand-shift trick.
pub fn icmp32_cond(cond: IcmpCond) -> Cond {
    ICMP_TABLE[index(cond)].cond32
}

/// Lowering recipe for a 64-bit icmp.
pub fn icmp64_entry(cond: IcmpCond) -> Icmp64Entry {
    ICMP_TABLE[index(cond)].entry64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invert_involution() {
        let all = [
            Cond::Eq,
            Cond::Ne,
            Cond::Cs,
            Cond::Cc,
            Cond::Mi,
            Cond::Pl,
            Cond::Vs,
            Cond::Vc,
            Cond::Hi,
            Cond::Ls,
            Cond::Ge,
            Cond::Lt,
            Cond::Gt,
            Cond::Le,
        ];
        for c in all {
            assert_eq!(c.invert().invert(), c);
        }
    }

    #[test]
    fn test_icmp32_mapping() {
        assert_eq!(icmp32_cond(IcmpCond::Eq), Cond::Eq);
        assert_eq!(icmp32_cond(IcmpCond::Ult), Cond::Cc);
        assert_eq!(icmp32_cond(IcmpCond::Uge), Cond::Cs);
        assert_eq!(icmp32_cond(IcmpCond::Sgt), Cond::Gt);
        assert_eq!(icmp32_cond(IcmpCond::Sle), Cond::Le);
    }

    #[test]
    fn test_icmp64_rows() {
        // Unsigned compares are never swapped and keep their 32-bit cond.
        for cond in [IcmpCond::Ugt, IcmpCond::Uge, IcmpCond::Ult, IcmpCond::Ule] {
            let e = icmp64_entry(cond);
            assert!(!e.is_signed);
            assert!(!e.swapped);
            assert_eq!(e.c1, icmp32_cond(cond));
            assert_eq!(e.c2, icmp32_cond(cond).invert());
        }
        // Sgt/Sle swap operands: a > b computes b < a.
        let sgt = icmp64_entry(IcmpCond::Sgt);
        assert!(sgt.is_signed && sgt.swapped);
        assert_eq!(sgt.c1, Cond::Lt);
        assert_eq!(sgt.c2, Cond::Ge);
        let sle = icmp64_entry(IcmpCond::Sle);
        assert!(sle.swapped);
        assert_eq!(sle.c1, Cond::Ge);
        // C1 and C2 are complementary in every row.
        for cond in [
            IcmpCond::Eq,
            IcmpCond::Ne,
            IcmpCond::Ugt,
            IcmpCond::Uge,
            IcmpCond::Ult,
            IcmpCond::Ule,
            IcmpCond::Sgt,
            IcmpCond::Sge,
            IcmpCond::Slt,
            IcmpCond::Sle,
        ] {
            let e = icmp64_entry(cond);
            assert_eq!(e.c1.invert(), e.c2);
        }
    }
}
