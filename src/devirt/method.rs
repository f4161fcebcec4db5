//! Per-method translation state.

use std::collections::BTreeMap;

use crate::{
    assembly::Instruction,
    metadata::{exceptions::ExceptionHandler, token::Token},
    vm::VirtualMethodEntry,
    Error, Result,
};

/// Progress of one virtualized method through the translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodState {
    /// Found at a call stub, nothing decoded yet
    Located,
    /// Record and exception handlers decoded
    MetadataDecoded,
    /// Virtual instructions decoded into native ones, offsets still virtual
    BodyDecoded,
    /// Branches and handlers remapped to native offsets
    Translated,
    /// Translation failed with the given reason
    Failed(String),
}

impl MethodState {
    /// Short name for logs and reports.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MethodState::Located => "located",
            MethodState::MetadataDecoded => "metadata-decoded",
            MethodState::BodyDecoded => "body-decoded",
            MethodState::Translated => "translated",
            MethodState::Failed(_) => "failed",
        }
    }
}

/// Virtual offset to native offset of the instruction emitted for it.
///
/// Offsets are relative to the start of the method's code in both spaces. The map also holds the
/// end of the method so that ranges reaching the last instruction can be remapped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    map: BTreeMap<u32, u32>,
}

impl OffsetMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `virtual_offset` starts at `native_offset`.
    pub fn insert(&mut self, virtual_offset: u32, native_offset: u32) {
        self.map.insert(virtual_offset, native_offset);
    }

    /// Native offset of `virtual_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OffsetMapMiss`] if no instruction started at `virtual_offset`.
    pub fn get(&self, virtual_offset: u32) -> Result<u32> {
        self.map
            .get(&virtual_offset)
            .copied()
            .ok_or(Error::OffsetMapMiss(virtual_offset))
    }

    /// Number of mapped offsets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Pairs in virtual offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.map.iter().map(|(v, n)| (*v, *n))
    }

    /// Returns `true` if native offsets never decrease as virtual offsets increase.
    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        self.map
            .values()
            .zip(self.map.values().skip(1))
            .all(|(a, b)| a <= b)
    }
}

/// A virtualized method and everything recovered for it.
#[derive(Debug, Clone)]
pub struct VirtualizedMethod {
    /// Call stub whose body invokes the VM
    pub stub: Token,
    /// Method key string found in the stub
    pub encrypted_key: String,
    /// Decoded position of the method's entry in the resolution stream
    pub key: u32,
    /// Translation progress
    pub state: MethodState,
    /// Decoded resolution stream entry
    pub entry: Option<VirtualMethodEntry>,
    /// Reconstructed native instructions
    pub instructions: Vec<Instruction>,
    /// Resolved local variable types
    pub locals: Vec<Token>,
    /// Remapped exception handlers
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Virtual to native offsets
    pub offset_map: OffsetMap,
    /// Set once the method reaches [`MethodState::Translated`]
    pub successfully_translated: bool,
    /// Set when the body contains an opaque homomorphic region
    pub has_homomorphic_encryption: bool,
}

impl VirtualizedMethod {
    /// Creates a method found at `stub`.
    #[must_use]
    pub fn new(stub: Token, encrypted_key: String, key: u32) -> Self {
        VirtualizedMethod {
            stub,
            encrypted_key,
            key,
            state: MethodState::Located,
            entry: None,
            instructions: Vec::new(),
            locals: Vec::new(),
            exception_handlers: Vec::new(),
            offset_map: OffsetMap::new(),
            successfully_translated: false,
            has_homomorphic_encryption: false,
        }
    }

    /// Name from the decoded record, if decoded.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.entry.as_ref().map(|e| e.record.name.as_str())
    }

    /// Marks the method failed and drops partial output.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = MethodState::Failed(reason.into());
        self.successfully_translated = false;
        self.instructions.clear();
        self.exception_handlers.clear();
    }

    /// Failure reason, if failed.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            MethodState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns `true` if translation failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, MethodState::Failed(_))
    }
}
