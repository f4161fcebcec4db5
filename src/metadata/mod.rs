//! Host module metadata.
//!
//! The devirtualizer only needs a small slice of a managed module: tokens, the types and members
//! they resolve to, method bodies with their locals and exception clauses, and the manifest
//! resources holding the VM streams. [`module::Module`] models exactly that.

pub mod exceptions;
pub mod method;
pub mod module;
pub mod token;
