//! The recovered private opcode table.

use std::collections::BTreeMap;

use crate::{
    assembly::Code,
    metadata::token::Token,
    vm::VmOperandKind,
    Error, Result,
};

/// VM-internal actions without a single native equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialAction {
    /// Call into another virtualized method
    EazCall,
    /// Start of an opaque homomorphic region
    StartHomomorphic,
    /// End of an opaque homomorphic region
    EndHomomorphic,
    /// A handler whose body is a bare `ret`
    NoBody,
}

/// What a private opcode stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeKind {
    /// A native instruction
    Native(Code),
    /// A VM-internal action
    Special(SpecialAction),
}

/// One entry of the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeTableEntry {
    /// Private opcode value
    pub value: u16,
    /// Operand shape declared at registration
    pub operand_kind: VmOperandKind,
    /// Recovered meaning
    pub kind: OpcodeKind,
    /// Handler method the meaning was recovered from
    pub handler: Token,
}

impl OpcodeTableEntry {
    /// Returns `true` for VM-internal actions.
    #[must_use]
    pub fn is_special(&self) -> bool {
        matches!(self.kind, OpcodeKind::Special(_))
    }
}

/// Private opcode value to meaning.
///
/// Opcodes whose handler matched no template are kept apart in [`OpcodeTable::unknown`]; looking
/// one of them up fails with [`Error::UnknownOpcode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpcodeTable {
    entries: BTreeMap<u16, OpcodeTableEntry>,
    unknown: BTreeMap<u16, Token>,
}

impl OpcodeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a classified opcode, replacing any earlier entry or unknown mark for its value.
    pub fn insert(&mut self, entry: OpcodeTableEntry) {
        self.unknown.remove(&entry.value);
        self.entries.insert(entry.value, entry);
    }

    /// Marks `value` as unclassifiable, replacing any earlier entry.
    pub fn mark_unknown(&mut self, value: u16, handler: Token) {
        self.entries.remove(&value);
        self.unknown.insert(value, handler);
    }

    /// Looks up a private opcode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOpcode`] for values without a classified handler.
    pub fn get(&self, value: u16) -> Result<&OpcodeTableEntry> {
        self.entries.get(&value).ok_or(Error::UnknownOpcode(value))
    }

    /// Number of classified opcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was classified.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classified entries in opcode order.
    pub fn iter(&self) -> impl Iterator<Item = &OpcodeTableEntry> {
        self.entries.values()
    }

    /// Unclassified opcode values with their handlers.
    pub fn unknown(&self) -> impl Iterator<Item = (u16, Token)> + '_ {
        self.unknown.iter().map(|(value, handler)| (*value, *handler))
    }

    /// Classified opcode for native instruction `code`, if any.
    #[must_use]
    pub fn find_native(&self, code: Code) -> Option<&OpcodeTableEntry> {
        self.iter().find(|e| e.kind == OpcodeKind::Native(code))
    }

    /// Classified opcode for `action`, if any.
    #[must_use]
    pub fn find_special(&self, action: SpecialAction) -> Option<&OpcodeTableEntry> {
        self.iter().find(|e| e.kind == OpcodeKind::Special(action))
    }
}
