//! Native instruction representation.
//!
//! Instructions produced by the translator and consumed by the pattern engine share one model:
//! an [`Instruction`] holds its byte offset within the method body, the [`Code`] and a typed
//! [`Operand`]. Branch operands are stored as absolute offsets rather than encoded deltas so that
//! the translator can remap them without re-encoding.

use std::fmt;

use crate::{assembly::opcodes::Code, metadata::token::Token};

/// Encoded operand types of native instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate or short branch delta
    Int8,
    /// Unsigned 8-bit local or argument index
    UInt8,
    /// Unsigned 16-bit local or argument index
    UInt16,
    /// Signed 32-bit immediate or long branch delta
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Metadata token
    Token,
    /// Jump table (count followed by deltas)
    Switch,
}

impl OperandType {
    /// Size in bytes of the encoded operand, `None` for variable sized switch tables.
    #[must_use]
    pub const fn size(&self) -> Option<u32> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::UInt16 => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Token => Some(4),
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// Control-flow behaviour of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Branches or falls through depending on the stack
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls another method and continues
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally or fault block
    EndFinally,
    /// Ends a filter block, consuming the filter verdict
    EndFilter,
    /// Leaves a protected region
    Leave,
}

/// Decoded operand of a native instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// 32-bit integer immediate
    Int32(i32),
    /// 64-bit integer immediate
    Int64(i64),
    /// 32-bit float immediate
    Float32(f32),
    /// 64-bit float immediate
    Float64(f64),
    /// Metadata token (type, field, method or user string)
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Argument index
    Argument(u16),
    /// Absolute branch target offset
    Target(u32),
    /// Absolute switch target offsets
    Switch(Vec<u32>),
}

/// A native instruction.
#[derive(Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the instruction within its method body
    pub offset: u32,
    /// The instruction
    pub code: Code,
    /// The inline operand
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction at offset zero; offsets are assigned once a body is complete.
    #[must_use]
    pub fn new(code: Code, operand: Operand) -> Self {
        Instruction {
            offset: 0,
            code,
            operand,
        }
    }

    /// Creates an operand-less instruction.
    #[must_use]
    pub fn simple(code: Code) -> Self {
        Self::new(code, Operand::None)
    }

    /// Creates an instruction carrying a metadata token.
    #[must_use]
    pub fn with_token(code: Code, token: Token) -> Self {
        Self::new(code, Operand::Token(token))
    }

    /// Encoded size in bytes, opcode included.
    #[must_use]
    pub fn size(&self) -> u32 {
        let operand = match (&self.operand, self.code.operand_type().size()) {
            (Operand::Switch(targets), _) => 4 + 4 * targets.len() as u32,
            (_, Some(size)) => size,
            (_, None) => 4,
        };
        self.code.opcode_size() + operand
    }

    /// Returns the metadata token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Returns the constant pushed by a load-constant instruction.
    ///
    /// Covers every `ldc.i4` form as well as `ldc.i8`.
    #[must_use]
    pub fn ldc_value(&self) -> Option<i64> {
        let value = match self.code {
            Code::LdcI4M1 => -1,
            Code::LdcI40 => 0,
            Code::LdcI41 => 1,
            Code::LdcI42 => 2,
            Code::LdcI43 => 3,
            Code::LdcI44 => 4,
            Code::LdcI45 => 5,
            Code::LdcI46 => 6,
            Code::LdcI47 => 7,
            Code::LdcI48 => 8,
            Code::LdcI4S | Code::LdcI4 | Code::LdcI8 => match self.operand {
                Operand::Int32(value) => i64::from(value),
                Operand::Int64(value) => value,
                _ => return None,
            },
            _ => return None,
        };
        Some(value)
    }

    /// Returns the local index accessed by a load-local or store-local instruction.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match self.code {
            Code::Ldloc0 | Code::Stloc0 => Some(0),
            Code::Ldloc1 | Code::Stloc1 => Some(1),
            Code::Ldloc2 | Code::Stloc2 => Some(2),
            Code::Ldloc3 | Code::Stloc3 => Some(3),
            _ => match self.operand {
                Operand::Local(index) => Some(index),
                _ => None,
            },
        }
    }

    /// Returns the argument index accessed by a load-argument or store-argument instruction.
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        match self.code {
            Code::Ldarg0 => Some(0),
            Code::Ldarg1 => Some(1),
            Code::Ldarg2 => Some(2),
            Code::Ldarg3 => Some(3),
            _ => match self.operand {
                Operand::Argument(index) => Some(index),
                _ => None,
            },
        }
    }

    /// Returns all absolute branch targets of this instruction.
    #[must_use]
    pub fn branch_targets(&self) -> Vec<u32> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Returns `true` if control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.code.flow(),
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::EndFilter
                | FlowType::Leave
        )
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.code.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int32(value) => write!(f, " {value}"),
            Operand::Int64(value) => write!(f, " {value}"),
            Operand::Float32(value) => write!(f, " {value}"),
            Operand::Float64(value) => write!(f, " {value}"),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Local(index) => write!(f, " V_{index}"),
            Operand::Argument(index) => write!(f, " A_{index}"),
            Operand::Target(target) => write!(f, " IL_{target:04x}"),
            Operand::Switch(targets) => {
                let labels: Vec<String> = targets.iter().map(|t| format!("IL_{t:04x}")).collect();
                write!(f, " ({})", labels.join(", "))
            }
        }
    }
}

/// Assigns sequential offsets to `instructions` from their encoded sizes and returns the total
/// body size.
pub fn assign_offsets(instructions: &mut [Instruction]) -> u32 {
    let mut offset = 0;
    for instruction in instructions {
        instruction.offset = offset;
        offset += instruction.size();
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Instruction::simple(Code::Add).size(), 1);
        assert_eq!(Instruction::new(Code::LdcI4, Operand::Int32(7)).size(), 5);
        assert_eq!(Instruction::new(Code::LdcI8, Operand::Int64(7)).size(), 9);
        assert_eq!(Instruction::new(Code::Ldloc, Operand::Local(4)).size(), 4);
        assert_eq!(Instruction::new(Code::Switch, Operand::Switch(vec![1, 2, 3])).size(), 17);
        assert_eq!(Instruction::with_token(Code::Call, Token(0x0600_0001)).size(), 5);
    }

    #[test]
    fn offsets_are_sequential() {
        let mut body = vec![
            Instruction::new(Code::LdcI4, Operand::Int32(1)),
            Instruction::simple(Code::Ceq),
            Instruction::simple(Code::Ret),
        ];
        let total = assign_offsets(&mut body);
        assert_eq!(body[0].offset, 0);
        assert_eq!(body[1].offset, 5);
        assert_eq!(body[2].offset, 7);
        assert_eq!(total, 8);
    }

    #[test]
    fn constant_values() {
        assert_eq!(Instruction::simple(Code::LdcI4M1).ldc_value(), Some(-1));
        assert_eq!(Instruction::simple(Code::LdcI47).ldc_value(), Some(7));
        assert_eq!(
            Instruction::new(Code::LdcI4S, Operand::Int32(-3)).ldc_value(),
            Some(-3)
        );
        assert_eq!(
            Instruction::new(Code::LdcI8, Operand::Int64(1 << 40)).ldc_value(),
            Some(1 << 40)
        );
        assert_eq!(Instruction::simple(Code::Add).ldc_value(), None);
    }

    #[test]
    fn indices_and_targets() {
        assert_eq!(Instruction::simple(Code::Stloc2).local_index(), Some(2));
        assert_eq!(
            Instruction::new(Code::LdlocS, Operand::Local(9)).local_index(),
            Some(9)
        );
        assert_eq!(Instruction::simple(Code::Ldarg1).argument_index(), Some(1));
        assert_eq!(
            Instruction::new(Code::Switch, Operand::Switch(vec![4, 8])).branch_targets(),
            vec![4, 8]
        );
        assert!(Instruction::new(Code::Br, Operand::Target(0)).is_terminal());
        assert!(!Instruction::new(Code::Brtrue, Operand::Target(0)).is_terminal());
    }

    #[test]
    fn debug_format() {
        let mut instr = Instruction::new(Code::Br, Operand::Target(0x10));
        instr.offset = 4;
        assert_eq!(format!("{instr:?}"), "IL_0004: br IL_0010");
    }
}
