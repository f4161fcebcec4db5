//! Devirtualization of protected methods.
//!
//! A virtualized method no longer carries its own CIL. Its body is replaced by a call stub that
//! passes an encrypted method key and the boxed arguments to the VM's dispatcher entry, and the
//! original code lives as private bytecode inside an encrypted manifest resource. This module
//! recovers that code and writes native bodies back into the stubs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Input: Module                                                   │
//! │      │                                                           │
//! │      ▼                                                           │
//! │  Opcode table    dispatch initializer + handler templates        │
//! │      │           layout selection, bytecode stream               │
//! │      ▼                                                           │
//! │  Endianness      replay of scrambled integer readers (optional)  │
//! │      │                                                           │
//! │      ▼                                                           │
//! │  Discovery       call stubs, method keys, resolution stream      │
//! │      │                                                           │
//! │      ▼                                                           │
//! │  Translation     virtual code -> native instructions, per method │
//! │      │                                                           │
//! │      ▼                                                           │
//! │  Output          stub bodies replaced according to save policy   │
//! │      │                                                           │
//! │      ▼                                                           │
//! │  DevirtOutput { module, result }                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fatal failures (no dispatch initializer, no stubs, an unusable layout) end the run. Anything
//! that goes wrong inside a single method only fails that method, and the reason is kept in
//! the [`DevirtResult`].
//!
//! # Key Components
//!
//! - [`Devirtualizer`] runs the stages with a [`DevirtConfig`]
//! - [`AnchorRegistry`] and [`TemplateLibrary`] hold the structural patterns; both can be
//!   replaced to follow a different protector build
//! - [`OpcodeTable`] maps private opcodes to native codes or [`SpecialAction`]s
//! - [`VirtualizedMethod`] tracks one method through [`MethodState`]s
//! - [`EventLog`] records what every stage found
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotdevirt::prelude::*;
//!
//! # fn load() -> Module { Module::new("Protected.dll") }
//! let module = load();
//! let output = Devirtualizer::new(DevirtConfig::default().with_save_anyway(true)).run(module);
//!
//! println!("{}", output.result.summary());
//! if let Some(module) = output.module {
//!     println!("{} methods", module.methods().count());
//! }
//! ```

mod anchors;
mod builder;
mod context;
mod discovery;
mod events;
mod method;
mod opcodes;
mod pipeline;
mod resolver;
mod result;
mod templates;
mod translator;

pub use anchors::{Anchor, AnchorRegistry};
pub use builder::{build_opcode_table, locate_dispatch, DispatchEntry, DispatchTable};
pub use context::Context;
pub use discovery::{discover, open_resource_stream, Discovery};
pub use events::{Event, EventBuilder, EventKind, EventLog};
pub use method::{MethodState, OffsetMap, VirtualizedMethod};
pub use opcodes::{OpcodeKind, OpcodeTable, OpcodeTableEntry, SpecialAction};
pub use pipeline::{DevirtConfig, Devirtualizer};
pub use result::{DevirtOutput, DevirtResult, MethodOutcome, Stage, StageStatus};
pub use templates::{HandlerTemplate, TemplateLibrary, TemplateOutcome};
pub use translator::{translate_all, translate_method};
