//! Primitive value codecs for VM streams.
//!
//! Numeric fields in VM resources are fixed-width, but their byte order is a per-build property.
//! [`VmIO`] converts primitives to and from their raw bit patterns, and [`ByteOrder`] describes
//! which stored byte carries which significance, so that plain little-endian, big-endian and
//! scrambled layouts all go through the same code path.

use crate::{Error, Result};

/// Primitive types that can be stored in a VM stream.
pub trait VmIO: Sized + Copy {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Builds a value from the low `SIZE * 8` bits of `bits`.
    fn from_bits(bits: u64) -> Self;

    /// Returns the raw bit pattern, zero-extended to 64 bits.
    fn to_bits(self) -> u64;
}

macro_rules! impl_vm_io_int {
    ($($ty:ty => $unsigned:ty),* $(,)?) => {
        $(
            impl VmIO for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                fn from_bits(bits: u64) -> Self {
                    bits as $unsigned as $ty
                }

                #[allow(clippy::cast_sign_loss)]
                fn to_bits(self) -> u64 {
                    u64::from(self as $unsigned)
                }
            }
        )*
    };
}

impl_vm_io_int! {
    u8 => u8,
    i8 => u8,
    u16 => u16,
    i16 => u16,
    u32 => u32,
    i32 => u32,
    u64 => u64,
    i64 => u64,
}

impl VmIO for f32 {
    const SIZE: usize = 4;

    #[allow(clippy::cast_possible_truncation)]
    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }

    fn to_bits(self) -> u64 {
        u64::from(f32::to_bits(self))
    }
}

impl VmIO for f64 {
    const SIZE: usize = 8;

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }
}

/// Byte significance layout of a fixed-width integer.
///
/// `significance[i]` is the index, within the stored bytes, of the value's i-th least significant
/// byte. Little-endian is the identity permutation, big-endian its reverse; per-build scrambled
/// layouts are any other permutation.
///
/// # Examples
///
/// ```rust
/// use dotdevirt::file::io::ByteOrder;
///
/// let order = ByteOrder::from_permutation(&[2, 3, 0, 1])?;
/// assert_eq!(order.assemble(&[0xCC, 0xDD, 0xAA, 0xBB]), 0xDDCC_BBAA);
/// assert_eq!(order.disassemble(0xDDCC_BBAA), vec![0xCC, 0xDD, 0xAA, 0xBB]);
/// # Ok::<(), dotdevirt::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteOrder {
    width: u8,
    significance: [u8; 8],
}

impl ByteOrder {
    /// Little-endian layout of `width` bytes.
    #[must_use]
    pub const fn little(width: u8) -> Self {
        let mut significance = [0u8; 8];
        let mut i = 0;
        while i < 8 {
            significance[i] = i as u8;
            i += 1;
        }
        ByteOrder {
            width,
            significance,
        }
    }

    /// Big-endian layout of `width` bytes.
    #[must_use]
    pub const fn big(width: u8) -> Self {
        let mut significance = [0u8; 8];
        let mut i = 0;
        while i < width as usize && i < 8 {
            significance[i] = width - 1 - i as u8;
            i += 1;
        }
        ByteOrder {
            width,
            significance,
        }
    }

    /// Builds a layout from an explicit significance permutation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Layout`] if the width is not 1, 2, 4 or 8 or the slice is not a
    /// permutation of `0..width`.
    pub fn from_permutation(significance: &[u8]) -> Result<Self> {
        let width = significance.len();
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(Error::Layout(format!("unsupported integer width {width}")));
        }
        let mut seen = [false; 8];
        for &index in significance {
            let index = usize::from(index);
            if index >= width || seen[index] {
                return Err(Error::Layout(format!(
                    "{significance:?} is not a byte permutation"
                )));
            }
            seen[index] = true;
        }
        let mut order = ByteOrder::little(width as u8);
        order.significance[..width].copy_from_slice(significance);
        Ok(order)
    }

    /// Number of stored bytes.
    #[must_use]
    pub fn width(&self) -> usize {
        usize::from(self.width)
    }

    /// The significance permutation.
    #[must_use]
    pub fn permutation(&self) -> &[u8] {
        &self.significance[..self.width()]
    }

    /// Returns `true` for the identity permutation.
    #[must_use]
    pub fn is_little(&self) -> bool {
        self.permutation()
            .iter()
            .enumerate()
            .all(|(i, &index)| usize::from(index) == i)
    }

    /// Combines stored bytes into a value. `bytes` must hold at least `width` bytes.
    #[must_use]
    pub fn assemble(&self, bytes: &[u8]) -> u64 {
        self.permutation()
            .iter()
            .enumerate()
            .fold(0u64, |value, (i, &index)| {
                value | (u64::from(bytes[usize::from(index)]) << (8 * i))
            })
    }

    /// Splits a value into its stored bytes.
    #[must_use]
    pub fn disassemble(&self, value: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; self.width()];
        for (i, &index) in self.permutation().iter().enumerate() {
            bytes[usize::from(index)] = (value >> (8 * i)) as u8;
        }
        bytes
    }
}

/// Reads a `T` stored in `order` from `data` at `offset`, advancing `offset`.
///
/// # Errors
///
/// Returns [`Error::OutOfBounds`] if not enough data is available, or [`Error::Layout`] if the
/// order width does not match `T`.
pub fn read_at<T: VmIO>(data: &[u8], offset: &mut usize, order: ByteOrder) -> Result<T> {
    if order.width() != T::SIZE {
        return Err(Error::Layout(format!(
            "byte order of width {} used for a {}-byte value",
            order.width(),
            T::SIZE
        )));
    }
    let end = offset.checked_add(T::SIZE).ok_or(Error::OutOfBounds)?;
    let bytes = data.get(*offset..end).ok_or(Error::OutOfBounds)?;
    *offset = end;
    Ok(T::from_bits(order.assemble(bytes)))
}

/// Reads a little-endian `T` from `data` at `offset`, advancing `offset`.
///
/// # Errors
///
/// Returns [`Error::OutOfBounds`] if not enough data is available.
pub fn read_le_at<T: VmIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    read_at(data, offset, ByteOrder::little(T::SIZE as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_and_big() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut offset = 0;
        assert_eq!(read_le_at::<u32>(&data, &mut offset).ok(), Some(0x0403_0201));
        assert_eq!(offset, 4);

        let mut offset = 0;
        let value: u32 = read_at(&data, &mut offset, ByteOrder::big(4)).unwrap();
        assert_eq!(value, 0x0102_0304);
    }

    #[test]
    fn signed_and_float() {
        let data = [0xFF, 0xFF];
        let mut offset = 0;
        assert_eq!(read_le_at::<i16>(&data, &mut offset).ok(), Some(-1));

        let bytes = 1.5f32.to_le_bytes();
        let mut offset = 0;
        assert_eq!(read_le_at::<f32>(&bytes, &mut offset).ok(), Some(1.5));
        assert_eq!((-2i8).to_bits(), 0xFE);
    }

    #[test]
    fn out_of_bounds() {
        let data = [0x01, 0x02];
        let mut offset = 1;
        assert!(matches!(
            read_le_at::<u32>(&data, &mut offset),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(offset, 1);
    }

    #[test]
    fn width_mismatch() {
        let data = [0u8; 8];
        let mut offset = 0;
        assert!(matches!(
            read_at::<u32>(&data, &mut offset, ByteOrder::little(2)),
            Err(Error::Layout(_))
        ));
    }

    #[test]
    fn permutations() {
        assert!(ByteOrder::from_permutation(&[0, 0]).is_err());
        assert!(ByteOrder::from_permutation(&[0, 1, 2]).is_err());
        assert!(ByteOrder::from_permutation(&[1, 0]).is_ok());
        assert_eq!(ByteOrder::big(2).permutation(), &[1, 0]);
        assert!(ByteOrder::little(4).is_little());
        assert!(!ByteOrder::big(4).is_little());

        let order = ByteOrder::from_permutation(&[3, 1, 0, 2]).unwrap();
        let value = 0x1122_3344;
        assert_eq!(order.assemble(&order.disassemble(value)), value);
    }
}
