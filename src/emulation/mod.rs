//! Symbolic replay of host code.
//!
//! A deliberately small emulation capability: it slices a straight-line method body down to the
//! instructions its returned value depends on and replays only those over an evaluation stack,
//! with field and element loads intercepted by [`ReplayHooks`]. The endianness helper in
//! [`endianness`] uses it to recover scrambled integer layouts of a protected build.

pub mod endianness;
mod replay;
mod value;

pub use endianness::infer_byte_order;
pub use replay::{dependency_slice, replay, ReplayHooks, Slice};
pub use value::EmValue;
