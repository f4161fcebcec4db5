use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into two groups that the pipeline treats differently:
///
/// ## Module-wide errors
/// - [`Error::PatternNotFound`] - an anchor expected in every protected module was absent. During the
///   opcode table and method discovery stages this aborts the whole run, since nothing decoded
///   afterwards could be trusted.
/// - [`Error::Layout`] - the selected layout configuration is inconsistent.
///
/// ## Method-scoped errors
/// - [`Error::UnsupportedTag`] - a tag byte with no mapping in the active layout
/// - [`Error::UnknownOpcode`] - a private opcode whose handler matched no template
/// - [`Error::UnsupportedInstructionInSlice`] - endianness replay met a disallowed instruction
/// - [`Error::OffsetMapMiss`] - a branch or handler boundary with no native counterpart
/// - [`Error::RecursiveResolutionCycle`] - a callee could not be identified while it was in progress
/// - [`Error::UnresolvedMember`] - an operand did not resolve against the host module
///
/// Method-scoped errors are caught by the translator, recorded on the failing method and never stop
/// the remaining methods from being processed. Whether an error aborts the run is decided by the
/// stage that raised it, not by its kind: the optional endianness stage swallows even a
/// [`Error::Layout`].
#[derive(Error, Debug)]
pub enum Error {
    /// The data is damaged and could not be decoded.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading a stream.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The requested feature is not supported.
    #[error("This feature is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// An expected anchor shape was not present in the module.
    ///
    /// Usually means the module was protected by a build whose layout differs from the
    /// registered anchors.
    #[error("Anchor pattern not found - {0}")]
    PatternNotFound(String),

    /// A tag or discriminator byte had no mapping in the active layout.
    #[error("Unsupported {context} tag - {value:#x}")]
    UnsupportedTag {
        /// What was being decoded when the tag was read
        context: &'static str,
        /// The raw tag value
        value: u32,
    },

    /// A private opcode with no entry in the recovered opcode table.
    #[error("Unknown private opcode - {0:#06x}")]
    UnknownOpcode(u16),

    /// Endianness inference reached an instruction outside the replay allow-list.
    #[error("Unsupported instruction in replay slice - {mnemonic} at IL_{offset:04x}")]
    UnsupportedInstructionInSlice {
        /// Offset of the offending instruction within the host method
        offset: u32,
        /// Mnemonic of the offending instruction
        mnemonic: &'static str,
    },

    /// A virtual offset referenced by a branch or exception region has no native counterpart.
    #[error("Virtual offset {0:#x} has no native mapping")]
    OffsetMapMiss(u32),

    /// A virtualized callee was referenced while its own resolution was still in progress and
    /// its identity was not yet known.
    #[error("Recursive resolution of virtual method key {0:#x}")]
    RecursiveResolutionCycle(u32),

    /// A homomorphic end marker without a matching start marker.
    #[error("Unbalanced homomorphic region at virtual offset {0:#x}")]
    UnbalancedHomomorphicRegion(u32),

    /// An operand could not be resolved against the host module.
    #[error("Unresolved member - {0}")]
    UnresolvedMember(String),

    /// A token did not refer to an existing row of the host module.
    #[error("Token not found - {0}")]
    TokenNotFound(Token),

    /// The layout configuration is inconsistent.
    #[error("Invalid layout - {0}")]
    Layout(String),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
