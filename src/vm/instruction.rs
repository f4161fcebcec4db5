//! Virtual instruction encoding.
//!
//! A virtual instruction is a 16-bit private opcode followed by an operand whose shape is declared
//! per opcode when the VM builds its dispatch table. The operand shapes are the VM's own, not the
//! native ones; the translator maps them onto native operands.

use strum::{EnumCount, EnumIter};

use crate::{
    crypto::CipherStream,
    vm::{
        layout::{LayoutConfig, ScrambledField},
        operand::InlineOperand,
        reader::VmReader,
        writer::VmWriter,
    },
    Error, Result,
};

/// Operand shape of a private opcode, as declared in the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
#[repr(u8)]
pub enum VmOperandKind {
    /// No operand
    None = 0,
    /// Unsigned byte
    Byte = 1,
    /// 32-bit integer in the layout's `Int32` byte order
    Int32 = 2,
    /// 64-bit integer
    Int64 = 3,
    /// 32-bit float
    Single = 4,
    /// 64-bit float
    Double = 5,
    /// Virtual branch target
    Target = 6,
    /// Virtual jump table
    Switch = 7,
    /// Local variable index
    Local = 8,
    /// Argument index
    Argument = 9,
    /// Inline operand referencing a member, type or string
    Member = 10,
    /// Length of an opaque homomorphic payload that follows
    Region = 11,
}

impl VmOperandKind {
    /// Maps the declared kind value back to its variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTag`] for unknown values.
    pub fn from_value(value: i64) -> Result<Self> {
        let kind = match value {
            0 => VmOperandKind::None,
            1 => VmOperandKind::Byte,
            2 => VmOperandKind::Int32,
            3 => VmOperandKind::Int64,
            4 => VmOperandKind::Single,
            5 => VmOperandKind::Double,
            6 => VmOperandKind::Target,
            7 => VmOperandKind::Switch,
            8 => VmOperandKind::Local,
            9 => VmOperandKind::Argument,
            10 => VmOperandKind::Member,
            11 => VmOperandKind::Region,
            _ => {
                return Err(Error::UnsupportedTag {
                    context: "operand kind",
                    value: value as u32,
                })
            }
        };
        Ok(kind)
    }
}

/// A decoded virtual operand.
#[derive(Debug, Clone, PartialEq)]
pub enum VmOperand {
    /// No operand
    None,
    /// Unsigned byte
    Byte(u8),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// 32-bit float
    Single(f32),
    /// 64-bit float
    Double(f64),
    /// Virtual branch target
    Target(u32),
    /// Virtual jump table
    Switch(Vec<u32>),
    /// Local variable index
    Local(u16),
    /// Argument index
    Argument(u16),
    /// Member reference
    Member(InlineOperand),
    /// Opaque payload length
    Region(u32),
}

impl VmOperand {
    /// Reads an operand of `kind`; member operands follow positions into `bytecode`.
    ///
    /// # Errors
    ///
    /// Fails on truncated data or undecodable member operands.
    pub fn read(
        reader: &mut VmReader<'_>,
        kind: VmOperandKind,
        bytecode: &CipherStream,
        layout: &LayoutConfig,
    ) -> Result<Self> {
        let operand = match kind {
            VmOperandKind::None => VmOperand::None,
            VmOperandKind::Byte => VmOperand::Byte(reader.read_le()?),
            VmOperandKind::Int32 => {
                VmOperand::Int32(reader.read_ordered(layout.byte_order(ScrambledField::Int32))?)
            }
            VmOperandKind::Int64 => VmOperand::Int64(reader.read_le()?),
            VmOperandKind::Single => VmOperand::Single(reader.read_le()?),
            VmOperandKind::Double => VmOperand::Double(reader.read_le()?),
            VmOperandKind::Target => VmOperand::Target(reader.read_le()?),
            VmOperandKind::Switch => {
                let count = reader.read_le::<u32>()? as usize;
                let remaining = reader.stream().len().saturating_sub(reader.pos());
                if count.saturating_mul(4) > remaining {
                    return Err(malformed_error!(
                        "switch with {} targets at offset {} exceeds the stream",
                        count,
                        reader.pos()
                    ));
                }
                VmOperand::Switch(
                    (0..count)
                        .map(|_| reader.read_le::<u32>())
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            VmOperandKind::Local => VmOperand::Local(reader.read_le()?),
            VmOperandKind::Argument => VmOperand::Argument(reader.read_le()?),
            VmOperandKind::Member => {
                VmOperand::Member(InlineOperand::read(reader, bytecode, layout)?)
            }
            VmOperandKind::Region => VmOperand::Region(reader.read_le()?),
        };
        Ok(operand)
    }

    /// Writes the operand in the encoding [`VmOperand::read`] expects.
    pub fn write(&self, writer: &mut VmWriter, layout: &LayoutConfig) {
        match self {
            VmOperand::None => {}
            VmOperand::Byte(value) => writer.write_le(*value),
            VmOperand::Int32(value) => {
                writer.write_ordered(*value, layout.byte_order(ScrambledField::Int32));
            }
            VmOperand::Int64(value) => writer.write_le(*value),
            VmOperand::Single(value) => writer.write_le(*value),
            VmOperand::Double(value) => writer.write_le(*value),
            VmOperand::Target(value) | VmOperand::Region(value) => writer.write_le(*value),
            VmOperand::Switch(targets) => {
                writer.write_le(targets.len() as u32);
                for target in targets {
                    writer.write_le(*target);
                }
            }
            VmOperand::Local(index) | VmOperand::Argument(index) => writer.write_le(*index),
            VmOperand::Member(operand) => operand.write(writer),
        }
    }
}

/// Reads a private opcode in the layout's byte order.
///
/// # Errors
///
/// Returns [`Error::OutOfBounds`] at the end of the stream.
pub fn read_opcode(reader: &mut VmReader<'_>, layout: &LayoutConfig) -> Result<u16> {
    reader.read_ordered(layout.byte_order(ScrambledField::Opcode))
}

/// Writes a private opcode in the layout's byte order.
pub fn write_opcode(writer: &mut VmWriter, opcode: u16, layout: &LayoutConfig) {
    writer.write_ordered(opcode, layout.byte_order(ScrambledField::Opcode));
}
