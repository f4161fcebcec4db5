//! Binary record decoder for VM resources.
//!
//! Everything the protector serializes into its resources is read through [`VmReader`] over a
//! decrypting [`crate::crypto::CipherStream`], with a [`LayoutConfig`] describing the
//! build-specific details:
//!
//! - [`InlineOperand`] / [`OperandData`] - operands of instructions and records
//! - [`VirtualMethodEntry`] - method record, exception handlers and code location of one method
//! - [`VmOperand`] - operands of virtual instructions
//!
//! [`VmWriter`] produces the same encodings.

mod instruction;
mod layout;
mod operand;
mod reader;
mod record;
mod registry;
mod writer;

pub use instruction::{read_opcode, write_opcode, VmOperand, VmOperandKind};
pub use layout::{BindingFlags, LayoutConfig, MethodField, OperandTag, ScrambledField};
pub use operand::{EazCallData, FieldData, InlineOperand, MethodData, OperandData, TypeData};
pub use reader::VmReader;
pub use record::{
    VirtualExceptionHandler, VirtualMethodEntry, VirtualMethodRecord, VirtualParameter,
};
pub use registry::{BuildFingerprint, LayoutRegistry};
pub use writer::VmWriter;
