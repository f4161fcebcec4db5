//! # dotdevirt Prelude
//!
//! The types needed to run the devirtualizer and inspect its result, in one import.
//!
//! ```rust,no_run
//! use dotdevirt::prelude::*;
//!
//! let config = DevirtConfig::new()
//!     .with_layout(LayoutConfig::default().with_endianness_inference(true))
//!     .with_save_anyway(true);
//! let output = Devirtualizer::new(config).run(Module::new("Protected.dll"));
//! assert!(output.result.stage(Stage::OpcodeTable) != &StageStatus::Skipped);
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotdevirt operations
pub use crate::Error;

/// The result type used throughout dotdevirt
pub use crate::Result;

// ================================================================================================
// Pipeline
// ================================================================================================

/// Pipeline entry point and configuration
pub use crate::devirt::{DevirtConfig, Devirtualizer};

/// Run results and diagnostics
pub use crate::devirt::{
    DevirtOutput, DevirtResult, Event, EventKind, EventLog, MethodOutcome, Stage, StageStatus,
};

/// Replaceable structural patterns
pub use crate::devirt::{Anchor, AnchorRegistry, HandlerTemplate, TemplateLibrary, TemplateOutcome};

/// Opcode table
pub use crate::devirt::{OpcodeKind, OpcodeTable, SpecialAction};

// ================================================================================================
// Host Module
// ================================================================================================

/// Module model and tokens
pub use crate::metadata::{
    exceptions::{ExceptionHandler, ExceptionHandlerFlags},
    method::{MethodAttributes, MethodBody, MethodDef, MethodSig},
    module::Module,
    token::Token,
};

/// CIL instructions
pub use crate::assembly::{Code, Instruction, Operand};

// ================================================================================================
// VM Formats and Crypto
// ================================================================================================

/// Build-specific layout selection
pub use crate::vm::{
    BuildFingerprint, LayoutConfig, LayoutRegistry, MethodField, OperandTag, ScrambledField,
};

/// Byte orders of scrambled integers
pub use crate::file::io::ByteOrder;

/// Stream ciphers and key codecs
pub use crate::crypto::{ByteTransform, CipherKind, CipherStream, HexXorCodec, KeyCodec};

/// Instruction patterns
pub use crate::pattern::{Pattern, PatternFlags, Slot};
