//! Metadata tokens of the host module.
//!
//! A token packs a table identifier into its high byte and a 1-based row index into the low
//! 24 bits. Virtual instruction operands carry either such a token directly or a position into the
//! VM bytecode stream, see [`crate::vm::InlineOperand`].

use std::fmt;

use strum::{EnumCount, EnumIter};

/// Metadata tables that tokens of the host module can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
#[repr(u8)]
pub enum TableId {
    /// `TypeRef` table
    TypeRef = 0x01,
    /// `TypeDef` table
    TypeDef = 0x02,
    /// `Field` table
    Field = 0x04,
    /// `MethodDef` table
    MethodDef = 0x06,
    /// `MemberRef` table
    MemberRef = 0x0A,
    /// `TypeSpec` table
    TypeSpec = 0x1B,
    /// `MethodSpec` table
    MethodSpec = 0x2B,
    /// The user string heap
    UserString = 0x70,
}

impl TableId {
    /// Maps the high byte of a token back to its table, if known.
    #[must_use]
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(TableId::TypeRef),
            0x02 => Some(TableId::TypeDef),
            0x04 => Some(TableId::Field),
            0x06 => Some(TableId::MethodDef),
            0x0A => Some(TableId::MemberRef),
            0x1B => Some(TableId::TypeSpec),
            0x2B => Some(TableId::MethodSpec),
            0x70 => Some(TableId::UserString),
            _ => None,
        }
    }

    /// Returns `true` for tables whose rows describe a type.
    #[must_use]
    pub fn is_type(self) -> bool {
        matches!(self, TableId::TypeRef | TableId::TypeDef | TableId::TypeSpec)
    }
}

/// A metadata token.
///
/// # Examples
///
/// ```rust
/// use dotdevirt::metadata::token::{TableId, Token};
///
/// let token = Token::from_parts(TableId::MethodDef, 3);
/// assert_eq!(token.value(), 0x0600_0003);
/// assert_eq!(token.table_id(), Some(TableId::MethodDef));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Builds a token from a table and a 1-based row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the table this token belongs to, if it is one the host model knows.
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_byte(self.table())
    }

    /// Returns the 1-based row index.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns `true` if this is the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if this token refers to a type (definition, reference or spec).
    #[must_use]
    pub fn is_type(&self) -> bool {
        self.table_id().is_some_and(TableId::is_type)
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
