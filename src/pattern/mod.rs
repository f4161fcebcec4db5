//! Instruction pattern matching over host method bodies.
//!
//! Every structural element the devirtualizer relies on (the dispatch initializer, the stream
//! set-up, virtual call stubs, handler bodies) is recognised by a [`Pattern`]: a sequence of
//! [`Slot`]s, optional interchange and anchoring [`PatternFlags`] and an optional verifier that
//! inspects operands of a candidate [`MatchWindow`].
//!
//! # Examples
//!
//! ```rust
//! use dotdevirt::assembly::{Code, Instruction};
//! use dotdevirt::metadata::{method::{MethodAttributes, MethodBody, MethodSig}, module::Module};
//! use dotdevirt::pattern::Pattern;
//!
//! let mut module = Module::new("Sample.dll");
//! let ty = module.add_type("", "Handlers");
//! let body = MethodBody::new(vec![Instruction::simple(Code::Ret)]);
//! let method = module.add_method(ty, "Nop", MethodAttributes::STATIC, MethodSig::default(), Some(body));
//!
//! let hit = Pattern::from_codes("Empty", &[Code::Ret]).find_first(&module).unwrap();
//! assert_eq!(hit.method, method);
//! ```

#[allow(clippy::module_inception)]
mod pattern;
mod scanner;

pub use pattern::{MatchWindow, Pattern, PatternFlags, Slot, Verifier};
pub use scanner::PatternMatch;
