//! Per-build layout of VM records.
//!
//! Different builds of the protector shuffle tag values, the order in which method record fields
//! are serialized, the meaning of binding flag bits and the byte order of some integers. All of
//! that is captured in one [`LayoutConfig`] that the decoder receives as a parameter.

use std::collections::BTreeMap;

use bitflags::bitflags;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{file::io::ByteOrder, metadata::exceptions::ExceptionHandlerFlags, Error, Result};

/// Kinds of structured operand data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum OperandTag {
    /// A type, by name with optional generic arguments
    Type,
    /// A field, by declaring type and name
    Field,
    /// A method, by declaring type, name and signature
    Method,
    /// A string literal
    UserString,
    /// A call into another virtualized method
    EazCall,
}

/// Fields of a serialized method record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum MethodField {
    /// Declaring type operand
    DeclaringType,
    /// Method name
    Name,
    /// Binding flags byte
    BindingFlags,
    /// Return type operand
    ReturnType,
    /// Local variable type operands
    Locals,
    /// Parameter descriptors
    Parameters,
}

/// Integers whose byte order varies between builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum ScrambledField {
    /// The 16-bit private opcode of every virtual instruction
    Opcode,
    /// 32-bit immediate operands
    Int32,
}

impl ScrambledField {
    /// Width in bytes of values of this field.
    #[must_use]
    pub const fn width(self) -> u8 {
        match self {
            ScrambledField::Opcode => 2,
            ScrambledField::Int32 => 4,
        }
    }
}

bitflags! {
    /// Semantic binding flags of a virtual method, independent of their raw encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindingFlags: u8 {
        /// Instance member
        const INSTANCE = 0x01;
        /// Static member
        const STATIC = 0x02;
        /// Public member
        const PUBLIC = 0x04;
        /// Non-public member
        const NON_PUBLIC = 0x08;
    }
}

/// Layout configuration of one protector build.
///
/// # Examples
///
/// ```rust
/// use dotdevirt::vm::{LayoutConfig, MethodField, OperandTag};
///
/// let layout = LayoutConfig::default()
///     .with_operand_tags(&[
///         (4, OperandTag::Type),
///         (3, OperandTag::Field),
///         (2, OperandTag::Method),
///         (1, OperandTag::UserString),
///         (0, OperandTag::EazCall),
///     ])
///     .with_method_field_order(&[
///         MethodField::Name,
///         MethodField::DeclaringType,
///         MethodField::BindingFlags,
///         MethodField::ReturnType,
///         MethodField::Parameters,
///         MethodField::Locals,
///     ]);
/// assert!(layout.validate().is_ok());
/// assert_eq!(layout.operand_tag(2)?, OperandTag::Method);
/// # Ok::<(), dotdevirt::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutConfig {
    /// Tag byte to operand data kind
    pub operand_tags: Vec<(u8, OperandTag)>,
    /// Serialization order of method record fields
    pub method_field_order: Vec<MethodField>,
    /// Raw bit mask to semantic binding flag
    pub binding_flag_bits: Vec<(u8, BindingFlags)>,
    /// Handler kind byte to exception clause kind
    pub handler_kinds: Vec<(u8, ExceptionHandlerFlags)>,
    /// Byte order of scrambled integers; absent fields are little-endian
    pub endianness: BTreeMap<ScrambledField, ByteOrder>,
    /// Recover the opcode byte order from the host reader before translating
    pub infer_endianness: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            operand_tags: OperandTag::iter()
                .enumerate()
                .map(|(i, tag)| (i as u8, tag))
                .collect(),
            method_field_order: MethodField::iter().collect(),
            binding_flag_bits: vec![
                (0x01, BindingFlags::PUBLIC),
                (0x02, BindingFlags::NON_PUBLIC),
                (0x04, BindingFlags::STATIC),
                (0x08, BindingFlags::INSTANCE),
            ],
            handler_kinds: vec![
                (0, ExceptionHandlerFlags::EXCEPTION),
                (1, ExceptionHandlerFlags::FINALLY),
                (2, ExceptionHandlerFlags::FILTER),
            ],
            endianness: BTreeMap::new(),
            infer_endianness: false,
        }
    }
}

impl LayoutConfig {
    /// Replaces the operand tag assignment.
    #[must_use]
    pub fn with_operand_tags(mut self, tags: &[(u8, OperandTag)]) -> Self {
        self.operand_tags = tags.to_vec();
        self
    }

    /// Replaces the method record field order.
    #[must_use]
    pub fn with_method_field_order(mut self, order: &[MethodField]) -> Self {
        self.method_field_order = order.to_vec();
        self
    }

    /// Replaces the binding flag bit assignment.
    #[must_use]
    pub fn with_binding_flag_bits(mut self, bits: &[(u8, BindingFlags)]) -> Self {
        self.binding_flag_bits = bits.to_vec();
        self
    }

    /// Replaces the handler kind assignment.
    #[must_use]
    pub fn with_handler_kinds(mut self, kinds: &[(u8, ExceptionHandlerFlags)]) -> Self {
        self.handler_kinds = kinds.to_vec();
        self
    }

    /// Sets the byte order of one scrambled field.
    #[must_use]
    pub fn with_byte_order(mut self, field: ScrambledField, order: ByteOrder) -> Self {
        self.endianness.insert(field, order);
        self
    }

    /// Enables or disables byte order inference.
    #[must_use]
    pub fn with_endianness_inference(mut self, enabled: bool) -> Self {
        self.infer_endianness = enabled;
        self
    }

    /// Maps a tag byte to its operand data kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTag`] for unassigned tags.
    pub fn operand_tag(&self, value: u8) -> Result<OperandTag> {
        self.operand_tags
            .iter()
            .find(|(byte, _)| *byte == value)
            .map(|(_, tag)| *tag)
            .ok_or(Error::UnsupportedTag {
                context: "operand data",
                value: u32::from(value),
            })
    }

    /// Maps an operand data kind to its tag byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Layout`] if the kind has no tag in this layout.
    pub fn tag_byte(&self, tag: OperandTag) -> Result<u8> {
        self.operand_tags
            .iter()
            .find(|(_, t)| *t == tag)
            .map(|(byte, _)| *byte)
            .ok_or_else(|| Error::Layout(format!("no tag byte assigned to {tag:?}")))
    }

    /// Decodes a raw binding flags byte. Unassigned bits are ignored.
    #[must_use]
    pub fn binding_flags(&self, raw: u8) -> BindingFlags {
        self.binding_flag_bits
            .iter()
            .filter(|(mask, _)| raw & mask != 0)
            .fold(BindingFlags::empty(), |flags, (_, flag)| flags | *flag)
    }

    /// Encodes semantic binding flags into their raw byte.
    #[must_use]
    pub fn binding_flags_byte(&self, flags: BindingFlags) -> u8 {
        self.binding_flag_bits
            .iter()
            .filter(|(_, flag)| flags.contains(*flag))
            .fold(0, |raw, (mask, _)| raw | mask)
    }

    /// Maps a handler kind byte to its clause kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTag`] for unassigned kinds.
    pub fn handler_kind(&self, value: u8) -> Result<ExceptionHandlerFlags> {
        self.handler_kinds
            .iter()
            .find(|(byte, _)| *byte == value)
            .map(|(_, kind)| *kind)
            .ok_or(Error::UnsupportedTag {
                context: "exception handler kind",
                value: u32::from(value),
            })
    }

    /// Maps a clause kind to its handler kind byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Layout`] if the kind has no byte in this layout.
    pub fn handler_kind_byte(&self, kind: ExceptionHandlerFlags) -> Result<u8> {
        self.handler_kinds
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(byte, _)| *byte)
            .ok_or_else(|| Error::Layout(format!("no kind byte assigned to {kind:?}")))
    }

    /// Byte order of `field`, little-endian unless configured.
    #[must_use]
    pub fn byte_order(&self, field: ScrambledField) -> ByteOrder {
        self.endianness
            .get(&field)
            .copied()
            .unwrap_or(ByteOrder::little(field.width()))
    }

    /// Checks that every mapping is a bijection and every byte order has the right width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Layout`] describing the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        for tag in OperandTag::iter() {
            let count = self.operand_tags.iter().filter(|(_, t)| *t == tag).count();
            if count != 1 {
                return Err(Error::Layout(format!("{tag:?} has {count} tag bytes")));
            }
        }
        if self.operand_tags.len() != OperandTag::COUNT {
            return Err(Error::Layout("operand tag bytes are not unique".into()));
        }
        let mut bytes: Vec<u8> = self.operand_tags.iter().map(|(byte, _)| *byte).collect();
        bytes.sort_unstable();
        bytes.dedup();
        if bytes.len() != OperandTag::COUNT {
            return Err(Error::Layout("operand tag bytes are not unique".into()));
        }

        for field in MethodField::iter() {
            let count = self.method_field_order.iter().filter(|f| **f == field).count();
            if count != 1 {
                return Err(Error::Layout(format!(
                    "{field:?} appears {count} times in the method field order"
                )));
            }
        }

        let mut seen = 0u8;
        for (mask, _) in &self.binding_flag_bits {
            if *mask == 0 || seen & mask != 0 {
                return Err(Error::Layout(format!(
                    "binding flag mask {mask:#04x} is empty or overlaps"
                )));
            }
            seen |= mask;
        }

        let mut kinds: Vec<u8> = self.handler_kinds.iter().map(|(byte, _)| *byte).collect();
        kinds.sort_unstable();
        kinds.dedup();
        if kinds.len() != self.handler_kinds.len() {
            return Err(Error::Layout("handler kind bytes are not unique".into()));
        }

        for (field, order) in &self.endianness {
            if order.width() != usize::from(field.width()) {
                return Err(Error::Layout(format!(
                    "{field:?} needs a {}-byte order, got {}",
                    field.width(),
                    order.width()
                )));
            }
        }
        Ok(())
    }
}
