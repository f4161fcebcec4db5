//! Native CIL instructions.
//!
//! The pattern engine matches on [`Code`] sequences of host methods, and the translator emits
//! [`Instruction`]s with absolute branch targets.

mod instruction;
mod opcodes;

pub use instruction::{assign_offsets, FlowType, Instruction, Operand, OperandType};
pub use opcodes::{Code, Family};
