//! Cursor over a decrypted VM stream.

use crate::{
    crypto::CipherStream,
    file::io::{ByteOrder, VmIO},
    Error, Result,
};

/// Sequential reader of VM primitives on top of a [`CipherStream`].
///
/// The reader keeps its own cursor, so several readers may walk the same stream at once; this is
/// how position-kind operands are followed without disturbing the instruction cursor.
#[derive(Debug, Clone)]
pub struct VmReader<'a> {
    stream: &'a CipherStream,
    position: usize,
}

impl<'a> VmReader<'a> {
    /// Creates a reader at the start of `stream`.
    #[must_use]
    pub fn new(stream: &'a CipherStream) -> Self {
        VmReader {
            stream,
            position: 0,
        }
    }

    /// Creates a reader positioned at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `position` lies past the end of the stream.
    pub fn at(stream: &'a CipherStream, position: usize) -> Result<Self> {
        let mut reader = Self::new(stream);
        reader.seek(position)?;
        Ok(reader)
    }

    /// The underlying stream.
    #[must_use]
    pub fn stream(&self) -> &'a CipherStream {
        self.stream
    }

    /// Current position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Moves the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `position` lies past the end of the stream.
    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.stream.len() {
            return Err(Error::OutOfBounds);
        }
        self.position = position;
        Ok(())
    }

    /// Skips `count` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if that moves past the end of the stream.
    pub fn advance_by(&mut self, count: usize) -> Result<()> {
        let target = self.position.checked_add(count).ok_or(Error::OutOfBounds)?;
        self.seek(target)
    }

    /// Decrypts the next `count` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer bytes remain.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let bytes = self.stream.read(self.position, count)?;
        self.position += count;
        Ok(bytes)
    }

    /// Reads a little-endian `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer bytes remain.
    pub fn read_le<T: VmIO>(&mut self) -> Result<T> {
        self.read_ordered(ByteOrder::little(T::SIZE as u8))
    }

    /// Reads a `T` stored in `order`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if fewer bytes remain, or [`Error::Layout`] if `order` has
    /// the wrong width for `T`.
    pub fn read_ordered<T: VmIO>(&mut self, order: ByteOrder) -> Result<T> {
        if order.width() != T::SIZE {
            return Err(Error::Layout(format!(
                "byte order of width {} used for a {}-byte value",
                order.width(),
                T::SIZE
            )));
        }
        let bytes = self.read_bytes(T::SIZE)?;
        Ok(T::from_bits(order.assemble(&bytes)))
    }

    /// Reads a one-byte boolean; any non-zero value is `true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] at the end of the stream.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_le::<u8>()? != 0)
    }

    /// Reads a 7-bit encoded unsigned integer, as written by `BinaryWriter.Write7BitEncodedInt`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the encoding exceeds 32 bits.
    pub fn read_7bit_encoded_int(&mut self) -> Result<u32> {
        let mut value = 0u32;
        let mut shift = 0;

        loop {
            let byte = self.read_le::<u8>()?;
            value |= u32::from(byte & 0x7F) << shift;
            shift += 7;

            if (byte & 0x80) == 0 {
                break;
            }

            if shift >= 32 {
                return Err(malformed_error!(
                    "7-bit encoded integer overflow at offset {}",
                    self.position
                ));
            }
        }

        Ok(value)
    }

    /// Reads a 7-bit encoded element count and checks it against the remaining data, assuming
    /// every element takes at least `min_element_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the count cannot possibly fit in the stream.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_7bit_encoded_int()? as usize;
        let remaining = self.stream.len().saturating_sub(self.position);
        if count.saturating_mul(min_element_size) > remaining {
            return Err(malformed_error!(
                "element count {} exceeds remaining {} bytes at offset {}",
                count,
                remaining,
                self.position
            ));
        }
        Ok(count)
    }

    /// Reads a 7-bit length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] for invalid UTF-8 and [`Error::OutOfBounds`] if the string is
    /// truncated.
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_7bit_encoded_int()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(length)?;
        String::from_utf8(bytes).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                start + length,
                e.utf8_error()
            )
        })
    }
}
