//! Virtual method records of the resolution stream.
//!
//! The numeric key of a virtualized method is the position of its entry in the resolution stream.
//! An entry holds the method record (fields in layout order), the exception handlers with virtual
//! offsets, and the location of the method's code in the bytecode stream.

use crate::{
    crypto::CipherStream,
    metadata::{exceptions::ExceptionHandlerFlags, token::Token},
    vm::{
        layout::{BindingFlags, LayoutConfig, MethodField},
        operand::{InlineOperand, INLINE_OPERAND_SIZE},
        reader::VmReader,
        writer::VmWriter,
    },
    Result,
};

/// Encoded size of one exception handler.
const HANDLER_SIZE: usize = 21;

/// A parameter of a virtual method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualParameter {
    /// Parameter type
    pub param_type: InlineOperand,
    /// Passed by reference
    pub by_ref: bool,
}

/// Metadata of a virtualized method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMethodRecord {
    /// Owning type
    pub declaring_type: InlineOperand,
    /// Method name
    pub name: String,
    /// Raw binding flags byte
    pub binding_flags: u8,
    /// Return type
    pub return_type: InlineOperand,
    /// Local variable types
    pub locals: Vec<InlineOperand>,
    /// Parameters
    pub parameters: Vec<VirtualParameter>,
}

impl VirtualMethodRecord {
    /// Reads a record with fields in the layout's order.
    ///
    /// # Errors
    ///
    /// Fails on truncated data, unknown tags, or a layout that omits a field.
    pub fn read(
        reader: &mut VmReader<'_>,
        bytecode: &CipherStream,
        layout: &LayoutConfig,
    ) -> Result<Self> {
        let mut declaring_type = None;
        let mut name = None;
        let mut binding_flags = None;
        let mut return_type = None;
        let mut locals = None;
        let mut parameters = None;

        for field in &layout.method_field_order {
            match field {
                MethodField::DeclaringType => {
                    declaring_type = Some(InlineOperand::read(reader, bytecode, layout)?);
                }
                MethodField::Name => name = Some(reader.read_string()?),
                MethodField::BindingFlags => binding_flags = Some(reader.read_le::<u8>()?),
                MethodField::ReturnType => {
                    return_type = Some(InlineOperand::read(reader, bytecode, layout)?);
                }
                MethodField::Locals => {
                    let count = reader.read_count(INLINE_OPERAND_SIZE)?;
                    locals = Some(
                        (0..count)
                            .map(|_| InlineOperand::read(reader, bytecode, layout))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                MethodField::Parameters => {
                    let count = reader.read_count(INLINE_OPERAND_SIZE + 1)?;
                    let mut list = Vec::with_capacity(count);
                    for _ in 0..count {
                        list.push(VirtualParameter {
                            param_type: InlineOperand::read(reader, bytecode, layout)?,
                            by_ref: reader.read_bool()?,
                        });
                    }
                    parameters = Some(list);
                }
            }
        }

        let missing = |field: MethodField| malformed_error!("layout never reads {:?}", field);
        Ok(VirtualMethodRecord {
            declaring_type: declaring_type.ok_or_else(|| missing(MethodField::DeclaringType))?,
            name: name.ok_or_else(|| missing(MethodField::Name))?,
            binding_flags: binding_flags.ok_or_else(|| missing(MethodField::BindingFlags))?,
            return_type: return_type.ok_or_else(|| missing(MethodField::ReturnType))?,
            locals: locals.ok_or_else(|| missing(MethodField::Locals))?,
            parameters: parameters.ok_or_else(|| missing(MethodField::Parameters))?,
        })
    }

    /// Writes the record with fields in the layout's order.
    pub fn write(&self, writer: &mut VmWriter, layout: &LayoutConfig) {
        for field in &layout.method_field_order {
            match field {
                MethodField::DeclaringType => self.declaring_type.write(writer),
                MethodField::Name => writer.write_string(&self.name),
                MethodField::BindingFlags => writer.write_le(self.binding_flags),
                MethodField::ReturnType => self.return_type.write(writer),
                MethodField::Locals => {
                    writer.write_7bit_encoded_int(self.locals.len() as u32);
                    for local in &self.locals {
                        local.write(writer);
                    }
                }
                MethodField::Parameters => {
                    writer.write_7bit_encoded_int(self.parameters.len() as u32);
                    for parameter in &self.parameters {
                        parameter.param_type.write(writer);
                        writer.write_bool(parameter.by_ref);
                    }
                }
            }
        }
    }

    /// Decodes the raw binding flags with the layout's bit assignment.
    #[must_use]
    pub fn flags(&self, layout: &LayoutConfig) -> BindingFlags {
        layout.binding_flags(self.binding_flags)
    }
}

/// An exception handler with virtual offsets.
///
/// The VM does not store handler lengths; the translator infers the end of each handler block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualExceptionHandler {
    /// Clause kind
    pub kind: ExceptionHandlerFlags,
    /// Caught exception type for typed clauses, null otherwise
    pub catch_type: Token,
    /// Virtual start of the protected region
    pub try_start: u32,
    /// Virtual length of the protected region
    pub try_length: u32,
    /// Virtual start of the handler block
    pub handler_start: u32,
    /// Virtual start of the filter block for filter clauses
    pub filter_start: u32,
}

impl VirtualExceptionHandler {
    /// Reads one handler.
    ///
    /// # Errors
    ///
    /// Fails on truncated data or an unknown kind byte.
    pub fn read(reader: &mut VmReader<'_>, layout: &LayoutConfig) -> Result<Self> {
        Ok(VirtualExceptionHandler {
            kind: layout.handler_kind(reader.read_le::<u8>()?)?,
            catch_type: Token::new(reader.read_le::<u32>()?),
            try_start: reader.read_le::<u32>()?,
            try_length: reader.read_le::<u32>()?,
            handler_start: reader.read_le::<u32>()?,
            filter_start: reader.read_le::<u32>()?,
        })
    }

    /// Writes one handler.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Layout`] if the layout has no byte for this kind.
    pub fn write(&self, writer: &mut VmWriter, layout: &LayoutConfig) -> Result<()> {
        writer.write_le(layout.handler_kind_byte(self.kind)?);
        writer.write_le(self.catch_type.value());
        writer.write_le(self.try_start);
        writer.write_le(self.try_length);
        writer.write_le(self.handler_start);
        writer.write_le(self.filter_start);
        Ok(())
    }

    /// Virtual offset just past the protected region.
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_start.saturating_add(self.try_length)
    }
}

/// Complete entry of a virtualized method in the resolution stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMethodEntry {
    /// The method record
    pub record: VirtualMethodRecord,
    /// Exception handlers with virtual offsets
    pub handlers: Vec<VirtualExceptionHandler>,
    /// Start of the method's code in the bytecode stream
    pub code_position: u32,
    /// Length of the method's code in bytes
    pub code_length: u32,
}

impl VirtualMethodEntry {
    /// Decodes the entry stored at `key` in the resolution stream.
    ///
    /// # Errors
    ///
    /// Fails if `key` lies outside the stream, on truncated data, or if the code range does not
    /// fit the bytecode stream.
    pub fn read_at(
        resolution: &CipherStream,
        key: u32,
        bytecode: &CipherStream,
        layout: &LayoutConfig,
    ) -> Result<Self> {
        let mut reader = VmReader::at(resolution, key as usize)?;
        let record = VirtualMethodRecord::read(&mut reader, bytecode, layout)?;
        let count = reader.read_count(HANDLER_SIZE)?;
        let handlers = (0..count)
            .map(|_| VirtualExceptionHandler::read(&mut reader, layout))
            .collect::<Result<Vec<_>>>()?;
        let code_position = reader.read_le::<u32>()?;
        let code_length = reader.read_le::<u32>()?;

        let end = u64::from(code_position) + u64::from(code_length);
        if end > bytecode.len() as u64 {
            return Err(malformed_error!(
                "code of method key {:#x} spans {:#x}..{:#x} past the bytecode stream",
                key,
                code_position,
                end
            ));
        }

        Ok(VirtualMethodEntry {
            record,
            handlers,
            code_position,
            code_length,
        })
    }

    /// Writes the entry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Layout`] if a handler kind has no byte in the layout.
    pub fn write(&self, writer: &mut VmWriter, layout: &LayoutConfig) -> Result<()> {
        self.record.write(writer, layout);
        writer.write_7bit_encoded_int(self.handlers.len() as u32);
        for handler in &self.handlers {
            handler.write(writer, layout)?;
        }
        writer.write_le(self.code_position);
        writer.write_le(self.code_length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{crypt, RollingXor};

    fn encrypt(plain: Vec<u8>, key: i32) -> CipherStream {
        let mut bytes = plain;
        crypt(&RollingXor, &mut bytes, key, 0);
        CipherStream::new(bytes, key)
    }

    fn sample_entry() -> VirtualMethodEntry {
        VirtualMethodEntry {
            record: VirtualMethodRecord {
                declaring_type: InlineOperand::Token(Token(0x0200_0002)),
                name: "Compute".into(),
                binding_flags: 0x05,
                return_type: InlineOperand::Token(Token(0x0100_0001)),
                locals: vec![InlineOperand::Token(Token(0x0100_0001))],
                parameters: vec![VirtualParameter {
                    param_type: InlineOperand::Token(Token(0x0100_0001)),
                    by_ref: true,
                }],
            },
            handlers: vec![VirtualExceptionHandler {
                kind: ExceptionHandlerFlags::FINALLY,
                catch_type: Token::default(),
                try_start: 0,
                try_length: 6,
                handler_start: 6,
                filter_start: 0,
            }],
            code_position: 0,
            code_length: 8,
        }
    }

    #[test]
    fn entry_roundtrip_with_custom_order() {
        let layout = LayoutConfig::default().with_method_field_order(&[
            MethodField::Parameters,
            MethodField::Name,
            MethodField::ReturnType,
            MethodField::BindingFlags,
            MethodField::Locals,
            MethodField::DeclaringType,
        ]);
        let entry = sample_entry();

        let mut writer = VmWriter::new();
        writer.write_bytes(&[0xEE; 3]);
        entry.write(&mut writer, &layout).unwrap();
        let plain = writer.into_inner();

        let resolution = encrypt(plain.clone(), 11);
        let bytecode = encrypt(vec![0; 8], 12);
        let decoded = VirtualMethodEntry::read_at(&resolution, 3, &bytecode, &layout).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(
            decoded.record.flags(&layout),
            BindingFlags::PUBLIC | BindingFlags::STATIC
        );

        let mut again = VmWriter::new();
        decoded.write(&mut again, &layout).unwrap();
        assert_eq!(again.as_bytes(), &plain[3..]);
    }

    #[test]
    fn wrong_order_misreads() {
        let entry = sample_entry();
        let mut writer = VmWriter::new();
        entry.write(&mut writer, &LayoutConfig::default()).unwrap();
        let resolution = encrypt(writer.into_inner(), 1);
        let bytecode = encrypt(vec![0; 8], 2);

        let swapped = LayoutConfig::default().with_method_field_order(&[
            MethodField::Name,
            MethodField::DeclaringType,
            MethodField::BindingFlags,
            MethodField::ReturnType,
            MethodField::Locals,
            MethodField::Parameters,
        ]);
        let decoded = VirtualMethodEntry::read_at(&resolution, 0, &bytecode, &swapped);
        assert!(decoded.map_or(true, |d| d != entry));
    }

    #[test]
    fn key_outside_stream() {
        let resolution = encrypt(vec![0; 4], 1);
        let bytecode = encrypt(vec![0; 4], 2);
        assert!(
            VirtualMethodEntry::read_at(&resolution, 0x100, &bytecode, &LayoutConfig::default())
                .is_err()
        );
    }

    #[test]
    fn code_range_is_checked() {
        let mut entry = sample_entry();
        entry.code_length = 64;
        let mut writer = VmWriter::new();
        entry.write(&mut writer, &LayoutConfig::default()).unwrap();
        let resolution = encrypt(writer.into_inner(), 1);
        let bytecode = encrypt(vec![0; 8], 2);
        assert!(
            VirtualMethodEntry::read_at(&resolution, 0, &bytecode, &LayoutConfig::default())
                .is_err()
        );
    }
}
