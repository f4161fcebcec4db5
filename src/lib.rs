// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # dotdevirt
//!
//! Recovery of .NET methods protected by Eazfuscator-style code virtualization.
//!
//! A virtualizing protector removes the CIL of selected methods, compiles it to the private
//! instruction set of an embedded virtual machine and leaves behind a call stub that hands an
//! encrypted method key to the VM. `dotdevirt` reverses that: it rebuilds the VM's opcode table
//! from the structure of its handler methods, decrypts the VM resources, decodes every method
//! record and its bytecode, and writes native instruction streams back into the stubs.
//!
//! ## Features
//!
//! - **Structural matching** - dispatch tables, streams, stubs and handlers are recognised by
//!   instruction shape rather than names, so renamed builds work unchanged
//! - **Per-build layouts** - operand tags, record field order, binding flag bits and scrambled byte
//!   orders are configuration, selected by a fingerprint of the handler set
//! - **Endianness inference** - scrambled integer readers are replayed on synthetic input to
//!   recover their byte permutation
//! - **Failure containment** - a method that cannot be translated is reported and skipped; the
//!   rest of the module is still recovered
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dotdevirt::prelude::*;
//!
//! # fn load() -> Module { Module::new("Protected.dll") }
//! let module = load();
//! let output = Devirtualizer::default().run(module);
//!
//! for method in &output.result.methods {
//!     println!("{}: {:?}", method.stub, method.failure);
//! }
//! if let Some(module) = output.module {
//!     println!("{} methods", module.methods().count());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`devirt`] - the pipeline and its stages
//! - [`vm`] - the VM's private binary formats and layout configuration
//! - [`crypto`] - resource stream ciphers and method key codecs
//! - [`pattern`] - the instruction pattern engine
//! - [`emulation`] - dependency slicing and replay of integer readers
//! - [`metadata`] and [`assembly`] - the host module model and CIL instructions
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade: stage transitions at `info`, per-method failures at
//! `warn`, stream and table details at `debug`. The same findings are also kept as structured
//! [`devirt::Event`]s in the [`devirt::DevirtResult`].

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

pub mod prelude;

pub mod assembly;
pub mod crypto;
pub mod devirt;
pub mod emulation;
pub mod file;
pub mod metadata;
pub mod pattern;
pub mod vm;

/// `dotdevirt` Result type.
///
/// A type alias for `std::result::Result<T, Error>` used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// `dotdevirt` Error type.
///
/// Module-wide variants abort a run; method-scoped ones only fail a single method.
pub use error::Error;

pub use devirt::{DevirtConfig, DevirtOutput, DevirtResult, Devirtualizer};
pub use metadata::module::Module;
