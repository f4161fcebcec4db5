//! Position-keyed cipher stream over a VM resource blob.
//!
//! Every byte is transformed with a subkey derived only from its absolute position and the stream
//! key. There is no chaining, so reads at arbitrary offsets are independent of each other and the
//! same operation both encrypts and decrypts.

use std::{fmt, sync::Arc};

use crate::{Error, Result};

/// Reversible per-byte substitution parameterized by absolute position and key.
///
/// Implementations must be involutions: `apply(apply(b, p, k), p, k) == b`.
pub trait ByteTransform: Send + Sync + fmt::Debug {
    /// Transforms `byte` found at absolute `position` of a stream keyed with `key`.
    fn apply(&self, byte: u8, position: u64, key: i32) -> u8;
}

/// Default keystream: golden-ratio hash of the position mixed with the key, rotated per byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingXor;

impl ByteTransform for RollingXor {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn apply(&self, byte: u8, position: u64, key: i32) -> u8 {
        let rolling = (key as u32) ^ (position as u32).wrapping_mul(0x9E37_79B1);
        byte ^ rolling.rotate_right((position % 8) as u32) as u8
    }
}

/// Plain repeating-key XOR with the four key bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyXor;

impl ByteTransform for KeyXor {
    #[allow(clippy::cast_possible_truncation)]
    fn apply(&self, byte: u8, position: u64, key: i32) -> u8 {
        byte ^ key.to_le_bytes()[(position % 4) as usize]
    }
}

/// Selects one of the built-in keystream strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    /// [`RollingXor`]
    #[default]
    RollingXor,
    /// [`KeyXor`]
    KeyXor,
}

impl CipherKind {
    /// Instantiates the strategy.
    #[must_use]
    pub fn transform(self) -> Arc<dyn ByteTransform> {
        match self {
            CipherKind::RollingXor => Arc::new(RollingXor),
            CipherKind::KeyXor => Arc::new(KeyXor),
        }
    }
}

/// Applies `transform` in place to `bytes` that start at absolute stream offset `offset`.
///
/// Because the transforms are involutions this both encrypts and decrypts.
pub fn crypt(transform: &dyn ByteTransform, bytes: &mut [u8], key: i32, offset: u64) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = transform.apply(*byte, offset + i as u64, key);
    }
}

/// A decrypting view over one encrypted VM resource.
///
/// # Examples
///
/// ```rust
/// use dotdevirt::crypto::{crypt, CipherStream, RollingXor};
///
/// let mut blob = b"virtual bytecode".to_vec();
/// crypt(&RollingXor, &mut blob, 0x1234, 0);
///
/// let stream = CipherStream::new(blob, 0x1234);
/// assert_eq!(stream.read(8, 4)?, b"byte");
/// # Ok::<(), dotdevirt::Error>(())
/// ```
#[derive(Clone)]
pub struct CipherStream {
    data: Arc<[u8]>,
    key: i32,
    transform: Arc<dyn ByteTransform>,
    position: usize,
}

impl CipherStream {
    /// Opens a stream over `data` with the default [`RollingXor`] transform.
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>, key: i32) -> Self {
        Self::with_transform(data, key, Arc::new(RollingXor))
    }

    /// Opens a stream over `data` with an explicit transform.
    #[must_use]
    pub fn with_transform(
        data: impl Into<Arc<[u8]>>,
        key: i32,
        transform: Arc<dyn ByteTransform>,
    ) -> Self {
        CipherStream {
            data: data.into(),
            key,
            transform,
            position: 0,
        }
    }

    /// Length of the underlying blob.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for an empty blob.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The stream key.
    #[must_use]
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Current cursor position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor; positions equal to the length are allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for positions past the end.
    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.data.len() {
            return Err(Error::OutOfBounds);
        }
        self.position = position;
        Ok(())
    }

    /// Decrypts `length` bytes at absolute `offset` without touching the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range exceeds the blob.
    pub fn read(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(length).ok_or(Error::OutOfBounds)?;
        let mut bytes = self.data.get(offset..end).ok_or(Error::OutOfBounds)?.to_vec();
        crypt(self.transform.as_ref(), &mut bytes, self.key, offset as u64);
        Ok(bytes)
    }

    /// Decrypts `length` bytes at the cursor and advances it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if the range exceeds the blob; the cursor is left unchanged.
    pub fn read_next(&mut self, length: usize) -> Result<Vec<u8>> {
        let bytes = self.read(self.position, length)?;
        self.position += length;
        Ok(bytes)
    }
}

impl fmt::Debug for CipherStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherStream")
            .field("len", &self.data.len())
            .field("key", &format_args!("{:#010x}", self.key))
            .field("transform", &self.transform)
            .field("position", &self.position)
            .finish()
    }
}
