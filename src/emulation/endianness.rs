//! Recovery of per-build scrambled integer byte orders.
//!
//! The host reassembles scrambled integers from a byte buffer with a handful of shifts and ors.
//! Replaying that arithmetic over a synthetic buffer whose byte `k` holds `k + 1` yields a value
//! whose `i`-th least significant byte names (plus one) the buffer index that lands there, which is
//! exactly the [`ByteOrder`] permutation.

use std::sync::Arc;

use crate::{
    emulation::{
        replay::{dependency_slice, replay, ReplayHooks},
        value::EmValue,
    },
    file::io::ByteOrder,
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// Replay hooks substituting the synthetic buffer for array fields and a counter for every other
/// field read.
///
/// The counter starts at zero and advances by one on each read, which models a cursor that is
/// post-incremented once per consumed byte.
#[derive(Debug)]
pub struct ProbeHooks {
    buffer: Arc<[u8]>,
    counter: i32,
    element_loads: usize,
}

impl ProbeHooks {
    /// Creates hooks over a synthetic buffer of `width` bytes.
    #[must_use]
    pub fn new(width: usize) -> Self {
        ProbeHooks {
            buffer: synthetic_buffer(width),
            counter: 0,
            element_loads: 0,
        }
    }

    /// Number of buffer elements read so far.
    #[must_use]
    pub fn element_loads(&self) -> usize {
        self.element_loads
    }
}

impl ReplayHooks for ProbeHooks {
    fn load_field(&mut self, module: &Module, field: Token) -> Option<EmValue> {
        let field_type = module.field(field).map(|f| f.field_type)?;
        let is_array = module
            .type_name(field_type)
            .is_some_and(|name| name.ends_with("[]"));
        if is_array {
            return Some(EmValue::Bytes(self.buffer.clone()));
        }
        let value = self.counter;
        self.counter += 1;
        Some(EmValue::I32(value))
    }

    fn load_element(&mut self, array: &EmValue, index: i64) -> Option<EmValue> {
        let EmValue::Bytes(bytes) = array else {
            return None;
        };
        let byte = usize::try_from(index).ok().and_then(|i| bytes.get(i))?;
        self.element_loads += 1;
        Some(EmValue::I32(i32::from(*byte)))
    }
}

/// Synthetic input buffer: byte `k` holds `k + 1`.
#[must_use]
pub fn synthetic_buffer(width: usize) -> Arc<[u8]> {
    (1..=width).map(|k| k as u8).collect::<Vec<_>>().into()
}

/// Converts the value computed over [`synthetic_buffer`] into a byte order.
///
/// # Errors
///
/// Returns [`Error::Layout`] if the value does not encode a permutation of `0..width`.
pub fn permutation_from_value(value: u64, width: usize) -> Result<ByteOrder> {
    let significance: Vec<u8> = (0..width)
        .map(|i| (((value >> (8 * i)) & 0xFF) as u8).wrapping_sub(1))
        .collect();
    ByteOrder::from_permutation(&significance)
}

/// Infers the byte order implemented by the scrambled-integer reader `method`.
///
/// Only the backward slice of the returned value is replayed. Array-typed field loads read the
/// synthetic buffer, every other field load reads a counter.
///
/// # Errors
///
/// - [`Error::TokenNotFound`] if `method` has no body
/// - [`Error::UnsupportedInstructionInSlice`] if the slice contains an instruction outside the replay
///   allow-list
/// - [`Error::Layout`] if the reader consumes a different number of bytes than `width` or the
///   result is not a permutation
pub fn infer_byte_order(module: &Module, method: Token, width: usize) -> Result<ByteOrder> {
    let instructions = module
        .method(method)
        .and_then(|m| m.body.as_ref())
        .map(|body| body.instructions.as_slice())
        .ok_or(Error::TokenNotFound(method))?;

    let slice = dependency_slice(module, instructions)?;
    let mut hooks = ProbeHooks::new(width);
    let value = replay(module, instructions, &slice, &[EmValue::Object], &mut hooks)?;

    if hooks.element_loads() != width {
        return Err(Error::Layout(format!(
            "reader consumed {} bytes, expected {width}",
            hooks.element_loads()
        )));
    }
    let value = value.as_u64().ok_or_else(|| {
        Error::Layout(format!("reader produced a {} value", value.type_name()))
    })?;

    let order = permutation_from_value(value, width)?;
    log::debug!(
        "inferred byte order {:?} from {}",
        order.permutation(),
        module.member_name(method).unwrap_or_default()
    );
    Ok(order)
}
