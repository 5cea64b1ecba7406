//! Compile-time descriptions of where runtime values live.
//!
//! An operand tracks a value through immediates, registers, the machine
//! stack and the CPU condition flags.  At most one operand may be in the
//! flags at any moment; the coder materializes it before anything that
//! could clobber them.

use std::fmt;

use crate::codegen::regalloc::Reg;
use crate::types::ValueType;

/// CPU comparison result.  The plain orderings come from integer
/// compares; the `OrderedAnd*` / `UnorderedOr*` variants come from float
/// compares, where an unordered result (NaN) must force the condition
/// false or true respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    GeS,
    GtS,
    GeU,
    GtU,
    LeS,
    LtS,
    LeU,
    LtU,
    OrderedAndEq,
    OrderedAndNe,
    OrderedAndGe,
    OrderedAndGt,
    OrderedAndLe,
    OrderedAndLt,
    UnorderedOrEq,
    UnorderedOrNe,
    UnorderedOrGe,
    UnorderedOrGt,
    UnorderedOrLe,
    UnorderedOrLt,
}

impl Condition {
    /// The condition that holds exactly when `self` does not.
    pub fn invert(self) -> Condition {
        use Condition::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            GeS => LtS,
            GtS => LeS,
            GeU => LtU,
            GtU => LeU,
            LeS => GtS,
            LtS => GeS,
            LeU => GtU,
            LtU => GeU,
            OrderedAndEq => UnorderedOrNe,
            OrderedAndNe => UnorderedOrEq,
            OrderedAndGe => UnorderedOrLt,
            OrderedAndGt => UnorderedOrLe,
            OrderedAndLe => UnorderedOrGt,
            OrderedAndLt => UnorderedOrGe,
            UnorderedOrEq => OrderedAndNe,
            UnorderedOrNe => OrderedAndEq,
            UnorderedOrGe => OrderedAndLt,
            UnorderedOrGt => OrderedAndLe,
            UnorderedOrLe => OrderedAndGt,
            UnorderedOrLt => OrderedAndGe,
        }
    }

    /// False whenever the comparison was unordered.
    pub fn is_ordered_and(self) -> bool {
        use Condition::*;
        matches!(
            self,
            OrderedAndEq | OrderedAndNe | OrderedAndGe | OrderedAndGt | OrderedAndLe | OrderedAndLt
        )
    }

    /// True whenever the comparison was unordered.
    pub fn is_unordered_or(self) -> bool {
        use Condition::*;
        matches!(
            self,
            UnorderedOrEq
                | UnorderedOrNe
                | UnorderedOrGe
                | UnorderedOrGt
                | UnorderedOrLe
                | UnorderedOrLt
        )
    }
}

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// No value; only legal for Void expressions.
    Nowhere,
    /// Literal bit pattern, interpreted per type.
    Imm(u64),
    /// Immutable constant at an offset in the read-only data region.
    RoData(i32),
    /// Abstract reference to local/parameter N; resolved through the var
    /// cache before use.
    VarRef(usize),
    /// Variable N is cached in `reg`.
    VarReg {
        index: usize,
        reg: Reg,
        zero_ext: bool,
    },
    /// Variable N lives only in its stack slot.
    VarMem { index: usize, offset: i32 },
    /// Transient result owned by whoever holds the operand.
    TempReg { reg: Reg, zero_ext: bool },
    /// Value has been pushed onto the machine stack (LIFO).
    Stack,
    /// Value is the CPU comparison result.
    Flags(Condition),
}

impl Operand {
    pub fn imm(t: ValueType, value: i64) -> Operand {
        let bits = match t.size() {
            4 => value as i32 as u32 as u64,
            8 => value as u64,
            _ => unreachable!(),
        };
        Operand::Imm(bits)
    }

    pub fn temp_reg(reg: Reg, zero_ext: bool) -> Operand {
        Operand::TempReg { reg, zero_ext }
    }

    pub fn var_reg(index: usize, reg: Reg, zero_ext: bool) -> Operand {
        Operand::VarReg {
            index,
            reg,
            zero_ext,
        }
    }

    /// Pure operands need not be saved across arbitrary evaluation.
    pub fn is_pure(self) -> bool {
        matches!(
            self,
            Operand::Nowhere | Operand::Imm(_) | Operand::RoData(_) | Operand::Stack
        )
    }

    /// Immediate value sign-extended per type; panics on other storages.
    pub fn imm_value(self, t: ValueType) -> i64 {
        self.check_imm_value(t)
            .unwrap_or_else(|| panic!("internal: operand is not an immediate: {self}"))
    }

    pub fn check_imm_value(self, t: ValueType) -> Option<i64> {
        match self {
            Operand::Imm(bits) => Some(match t.size() {
                4 => bits as u32 as i32 as i64,
                8 => bits as i64,
                _ => unreachable!(),
            }),
            _ => None,
        }
    }

    /// The register of a register-resident operand; panics otherwise.
    pub fn reg(self) -> Reg {
        self.check_any_reg()
            .unwrap_or_else(|| panic!("internal: operand is not in a register: {self}"))
    }

    pub fn check_any_reg(self) -> Option<Reg> {
        match self {
            Operand::VarReg { reg, .. } | Operand::TempReg { reg, .. } => Some(reg),
            _ => None,
        }
    }

    pub fn check_temp_reg(self) -> Option<(Reg, bool)> {
        match self {
            Operand::TempReg { reg, zero_ext } => Some((reg, zero_ext)),
            _ => None,
        }
    }

    pub fn check_var_reg(self) -> Option<(usize, Reg, bool)> {
        match self {
            Operand::VarReg {
                index,
                reg,
                zero_ext,
            } => Some((index, reg, zero_ext)),
            _ => None,
        }
    }

    pub fn check_var(self) -> Option<usize> {
        match self {
            Operand::VarRef(index) => Some(index),
            _ => None,
        }
    }

    pub fn condition(self) -> Condition {
        match self {
            Operand::Flags(cond) => cond,
            _ => panic!("internal: operand is not in the condition flags: {self}"),
        }
    }

    /// Whether the upper half of a 64-bit register is known zero.
    pub fn reg_zero_ext(self) -> bool {
        match self {
            Operand::VarReg { zero_ext, .. } | Operand::TempReg { zero_ext, .. } => zero_ext,
            _ => false,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Nowhere => write!(f, "nowhere"),
            Operand::Imm(bits) => write!(f, "immediate data 0x{bits:x}"),
            Operand::RoData(offset) => write!(f, "in read-only data at offset 0x{offset:x}"),
            Operand::VarRef(index) => write!(f, "reference to variable #{index}"),
            Operand::VarReg { index, reg, .. } => {
                write!(f, "variable #{index} cached in register #{}", reg.0)
            }
            Operand::VarMem { index, offset } => {
                write!(f, "variable #{index} on stack at offset 0x{offset:x}")
            }
            Operand::TempReg { reg, .. } => write!(f, "temporarily in register #{}", reg.0),
            Operand::Stack => write!(f, "pushed on stack"),
            Operand::Flags(cond) => write!(f, "in CPU condition flags ({cond:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imm_sign_extension() {
        let x = Operand::imm(ValueType::I32, -1);
        assert_eq!(x, Operand::Imm(0xffff_ffff));
        assert_eq!(x.imm_value(ValueType::I32), -1);
        assert_eq!(x.imm_value(ValueType::I64), 0xffff_ffff);
    }

    #[test]
    fn test_invert_round_trips() {
        use Condition::*;
        for cond in [
            Eq,
            Ne,
            GeS,
            GtS,
            GeU,
            GtU,
            LeS,
            LtS,
            LeU,
            LtU,
            OrderedAndEq,
            OrderedAndNe,
            OrderedAndGe,
            OrderedAndGt,
            OrderedAndLe,
            OrderedAndLt,
            UnorderedOrEq,
            UnorderedOrNe,
            UnorderedOrGe,
            UnorderedOrGt,
            UnorderedOrLe,
            UnorderedOrLt,
        ] {
            assert_eq!(cond.invert().invert(), cond);
        }
    }

    #[test]
    fn test_invert_crosses_orderedness() {
        assert_eq!(
            Condition::OrderedAndLt.invert(),
            Condition::UnorderedOrGe
        );
        assert!(Condition::OrderedAndLt.is_ordered_and());
        assert!(Condition::UnorderedOrGe.is_unordered_or());
    }

    #[test]
    fn test_purity() {
        assert!(Operand::Nowhere.is_pure());
        assert!(Operand::Imm(7).is_pure());
        assert!(!Operand::TempReg {
            reg: Reg(3),
            zero_ext: false
        }
        .is_pure());
        assert!(!Operand::Flags(Condition::Eq).is_pure());
    }
}
