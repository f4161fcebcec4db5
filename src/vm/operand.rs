//! Inline operands of virtual instructions and method records.
//!
//! An operand is either a raw token of the host module or a position in the bytecode stream where
//! structured [`OperandData`] describes the referenced entity by name. The data kinds form a closed
//! set, so every consumer matches them exhaustively.

use crate::{
    crypto::CipherStream,
    metadata::token::Token,
    vm::{
        layout::{BindingFlags, LayoutConfig, OperandTag},
        reader::VmReader,
        writer::VmWriter,
    },
    Result,
};

/// Nesting limit for position operands that refer to further position operands.
const MAX_OPERAND_DEPTH: usize = 32;

/// Minimum encoded size of an inline operand (kind byte plus value).
pub(crate) const INLINE_OPERAND_SIZE: usize = 5;

/// An inline operand.
///
/// A `Token` operand never carries data and a `Position` operand always does; the enum shape
/// makes any other combination unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineOperand {
    /// Direct reference into the host module
    Token(Token),
    /// Structured data stored at `position` in the bytecode stream
    Position {
        /// Position of the data in the bytecode stream
        position: u32,
        /// The decoded data
        data: Box<OperandData>,
    },
}

/// Type operand data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeData {
    /// Full type name, optionally assembly qualified
    pub name: String,
    /// Generic type arguments
    pub generic_args: Vec<InlineOperand>,
}

/// Field operand data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldData {
    /// Owning type
    pub declaring_type: InlineOperand,
    /// Field name
    pub name: String,
    /// Static field
    pub is_static: bool,
}

/// Method operand data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodData {
    /// Owning type
    pub declaring_type: InlineOperand,
    /// Raw binding flags byte, see [`MethodData::binding_flags`]
    pub flags: u8,
    /// Method name
    pub name: String,
    /// Return type, a `System.Void` type operand for void methods
    pub return_type: InlineOperand,
    /// Parameter types
    pub parameters: Vec<InlineOperand>,
    /// Method generic arguments
    pub generic_args: Vec<InlineOperand>,
}

impl MethodData {
    /// Decodes the raw flags with the layout's bit assignment.
    #[must_use]
    pub fn binding_flags(&self, layout: &LayoutConfig) -> BindingFlags {
        layout.binding_flags(self.flags)
    }
}

/// Call into another virtualized method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EazCallData {
    /// Raw call flags
    pub flags: u8,
    /// Numeric key of the callee, i.e. its position in the resolution stream
    pub method_key: u32,
}

/// Structured operand data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandData {
    /// A type
    Type(TypeData),
    /// A field
    Field(FieldData),
    /// A method
    Method(MethodData),
    /// A string literal
    UserString(String),
    /// A virtualized callee
    EazCall(EazCallData),
}

impl OperandData {
    /// The tag kind of this data.
    #[must_use]
    pub fn tag(&self) -> OperandTag {
        match self {
            OperandData::Type(_) => OperandTag::Type,
            OperandData::Field(_) => OperandTag::Field,
            OperandData::Method(_) => OperandTag::Method,
            OperandData::UserString(_) => OperandTag::UserString,
            OperandData::EazCall(_) => OperandTag::EazCall,
        }
    }

    /// Decodes the data stored at `position` in `stream`.
    ///
    /// # Errors
    ///
    /// Fails on truncated data, unknown tags or excessive nesting.
    pub fn read_at(stream: &CipherStream, position: u32, layout: &LayoutConfig) -> Result<Self> {
        let mut reader = VmReader::at(stream, position as usize)?;
        Self::read(&mut reader, layout, 0)
    }

    fn read(reader: &mut VmReader<'_>, layout: &LayoutConfig, depth: usize) -> Result<Self> {
        let tag = layout.operand_tag(reader.read_le::<u8>()?)?;
        let data = match tag {
            OperandTag::Type => OperandData::Type(TypeData {
                name: reader.read_string()?,
                generic_args: read_operand_list(reader, layout, depth)?,
            }),
            OperandTag::Field => OperandData::Field(FieldData {
                declaring_type: InlineOperand::read_nested(reader, layout, depth)?,
                name: reader.read_string()?,
                is_static: reader.read_bool()?,
            }),
            OperandTag::Method => OperandData::Method(MethodData {
                declaring_type: InlineOperand::read_nested(reader, layout, depth)?,
                flags: reader.read_le::<u8>()?,
                name: reader.read_string()?,
                return_type: InlineOperand::read_nested(reader, layout, depth)?,
                parameters: read_operand_list(reader, layout, depth)?,
                generic_args: read_operand_list(reader, layout, depth)?,
            }),
            OperandTag::UserString => OperandData::UserString(reader.read_string()?),
            OperandTag::EazCall => OperandData::EazCall(EazCallData {
                flags: reader.read_le::<u8>()?,
                method_key: reader.read_le::<u32>()?,
            }),
        };
        Ok(data)
    }

    /// Serializes this data with its tag byte; nested operands are written by reference only.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Layout`] if the layout assigns no tag byte to this kind.
    pub fn write(&self, writer: &mut VmWriter, layout: &LayoutConfig) -> Result<()> {
        writer.write_le(layout.tag_byte(self.tag())?);
        match self {
            OperandData::Type(ty) => {
                writer.write_string(&ty.name);
                write_operand_list(writer, &ty.generic_args);
            }
            OperandData::Field(field) => {
                field.declaring_type.write(writer);
                writer.write_string(&field.name);
                writer.write_bool(field.is_static);
            }
            OperandData::Method(method) => {
                method.declaring_type.write(writer);
                writer.write_le(method.flags);
                writer.write_string(&method.name);
                method.return_type.write(writer);
                write_operand_list(writer, &method.parameters);
                write_operand_list(writer, &method.generic_args);
            }
            OperandData::UserString(value) => writer.write_string(value),
            OperandData::EazCall(call) => {
                writer.write_le(call.flags);
                writer.write_le(call.method_key);
            }
        }
        Ok(())
    }
}

fn read_operand_list(
    reader: &mut VmReader<'_>,
    layout: &LayoutConfig,
    depth: usize,
) -> Result<Vec<InlineOperand>> {
    let count = reader.read_count(INLINE_OPERAND_SIZE)?;
    (0..count)
        .map(|_| InlineOperand::read_nested(reader, layout, depth))
        .collect()
}

fn write_operand_list(writer: &mut VmWriter, operands: &[InlineOperand]) {
    writer.write_7bit_encoded_int(operands.len() as u32);
    for operand in operands {
        operand.write(writer);
    }
}

impl InlineOperand {
    /// Reads an operand from `reader`, following position operands into `data`.
    ///
    /// `data` is the bytecode stream; it may be the stream `reader` walks or a different one, as
    /// with method records in the resolution stream.
    ///
    /// # Errors
    ///
    /// Fails on truncated data, unknown tags or excessive nesting.
    pub fn read(
        reader: &mut VmReader<'_>,
        data: &CipherStream,
        layout: &LayoutConfig,
    ) -> Result<Self> {
        let is_token = reader.read_bool()?;
        let value = reader.read_le::<u32>()?;
        if is_token {
            return Ok(InlineOperand::Token(Token::new(value)));
        }
        let mut data_reader = VmReader::at(data, value as usize)?;
        let data = OperandData::read(&mut data_reader, layout, 1)?;
        Ok(InlineOperand::Position {
            position: value,
            data: Box::new(data),
        })
    }

    fn read_nested(reader: &mut VmReader<'_>, layout: &LayoutConfig, depth: usize) -> Result<Self> {
        if depth >= MAX_OPERAND_DEPTH {
            return Err(malformed_error!(
                "operand nesting exceeds {} levels at offset {}",
                MAX_OPERAND_DEPTH,
                reader.pos()
            ));
        }
        let is_token = reader.read_bool()?;
        let value = reader.read_le::<u32>()?;
        if is_token {
            return Ok(InlineOperand::Token(Token::new(value)));
        }
        let mut data_reader = VmReader::at(reader.stream(), value as usize)?;
        let data = OperandData::read(&mut data_reader, layout, depth + 1)?;
        Ok(InlineOperand::Position {
            position: value,
            data: Box::new(data),
        })
    }

    /// Writes the operand reference (kind byte and token or position).
    pub fn write(&self, writer: &mut VmWriter) {
        match self {
            InlineOperand::Token(token) => {
                writer.write_bool(true);
                writer.write_le(token.value());
            }
            InlineOperand::Position { position, .. } => {
                writer.write_bool(false);
                writer.write_le(*position);
            }
        }
    }

    /// The structured data, if this is a position operand.
    #[must_use]
    pub fn data(&self) -> Option<&OperandData> {
        match self {
            InlineOperand::Token(_) => None,
            InlineOperand::Position { data, .. } => Some(data),
        }
    }

    /// The direct token, if this is a token operand.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self {
            InlineOperand::Token(token) => Some(*token),
            InlineOperand::Position { .. } => None,
        }
    }
}
