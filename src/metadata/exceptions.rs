//! Exception handling clauses of native method bodies.

use bitflags::bitflags;

use crate::metadata::token::Token;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause; `catch_type` names the caught exception.
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause.
        const FILTER = 0x0001;
        /// A finally clause.
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// Exception handler of a native method body.
///
/// All offsets are byte offsets into the native instruction stream of the owning body.
///
/// ```text
/// try {
///     // try_offset -> try_offset + try_length
/// }
/// catch (catch_type) {
///     // handler_offset -> handler_offset + handler_length
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Kind of clause
    pub flags: ExceptionHandlerFlags,
    /// Start of the protected region
    pub try_offset: u32,
    /// Length of the protected region
    pub try_length: u32,
    /// Start of the handler block
    pub handler_offset: u32,
    /// Length of the handler block
    pub handler_length: u32,
    /// Caught exception type for typed clauses
    pub catch_type: Option<Token>,
    /// Start of the filter block for filter clauses
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// Returns `true` if `offset` lies inside the protected region.
    #[must_use]
    pub fn protects(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_offset + self.try_length
    }

    /// Returns `true` if `offset` lies inside the handler block.
    #[must_use]
    pub fn handles(&self, offset: u32) -> bool {
        offset >= self.handler_offset && offset < self.handler_offset + self.handler_length
    }
}
