//! Encoder for VM streams.
//!
//! The protector only ever reads these formats at runtime; the writer exists so that decoded
//! records can be serialized again with the same layout, which is how format fidelity is checked,
//! and so that synthetic VM resources can be produced for testing.

use crate::file::io::{ByteOrder, VmIO};

/// Growable plaintext VM stream.
#[derive(Debug, Clone, Default)]
pub struct VmWriter {
    data: Vec<u8>,
}

impl VmWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length, which is also the position of the next write.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.data.len()
    }

    /// Returns the written bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// The written bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends a little-endian `T`.
    pub fn write_le<T: VmIO>(&mut self, value: T) {
        self.write_ordered(value, ByteOrder::little(T::SIZE as u8));
    }

    /// Appends `value` in `order`; the order width must match `T`.
    pub fn write_ordered<T: VmIO>(&mut self, value: T, order: ByteOrder) {
        debug_assert_eq!(order.width(), T::SIZE);
        let bytes = order.disassemble(value.to_bits());
        self.data.extend_from_slice(&bytes);
    }

    /// Overwrites a little-endian `u32` at `position`, for back-patching lengths and offsets.
    pub fn patch_u32(&mut self, position: usize, value: u32) {
        if let Some(slot) = self.data.get_mut(position..position + 4) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Appends a one-byte boolean.
    pub fn write_bool(&mut self, value: bool) {
        self.data.push(u8::from(value));
    }

    /// Appends a 7-bit encoded unsigned integer.
    pub fn write_7bit_encoded_int(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.data.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.data.push(value as u8);
    }

    /// Appends a 7-bit length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_7bit_encoded_int(value.len() as u32);
        self.data.extend_from_slice(value.as_bytes());
    }
}
