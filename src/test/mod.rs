//! Synthetic protected modules for unit tests.
//!
//! [`VmModuleBuilder`] assembles a module the way the protector leaves it: a VM type whose
//! initializer registers one handler per private opcode, encrypted bytecode and resolution
//! streams opened from static constructors, a key decoder, and one call stub per virtualized
//! method. Virtual code is described with [`VInstr`] using instruction indices for branch targets
//! and callees; the encoder turns them into virtual offsets and method keys.
//!
//! [`ScrambledReaderBuilder`] produces stand-alone integer reader methods for the endianness
//! inference tests.

mod handlers;
mod readers;

pub use code::{VInstr, VirtualHandler, VirtualMethodSpec};
pub use handlers::HandlerShape;
pub use module::{VmFixture, VmModuleBuilder};
pub use readers::ScrambledReaderBuilder;
