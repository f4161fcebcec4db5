//! Method key decoding.
//!
//! Call stubs identify their virtualized body with an encrypted key string. The dispatcher turns it
//! into a position inside the method resolution stream by parsing the string and mixing it with a
//! constant embedded in its own decryption routine.

use std::fmt;

use crate::Result;

/// Converts encrypted method keys to resolution stream positions and back.
pub trait KeyCodec: Send + Sync + fmt::Debug {
    /// Decodes `encrypted` with the module's method-crypto key constant.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid key for this codec.
    fn decode(&self, encrypted: &str, crypto_key: i64) -> Result<u32>;

    /// Encodes `position` so that [`KeyCodec::decode`] returns it.
    fn encode(&self, position: u32, crypto_key: i64) -> String;
}

/// Hexadecimal key string XORed with the crypto key constant.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexXorCodec;

impl KeyCodec for HexXorCodec {
    #[allow(clippy::cast_sign_loss)]
    fn decode(&self, encrypted: &str, crypto_key: i64) -> Result<u32> {
        let value = u64::from_str_radix(encrypted.trim(), 16)
            .map_err(|e| malformed_error!("method key {:?} - {}", encrypted, e))?;
        let position = value ^ crypto_key as u64;
        u32::try_from(position)
            .map_err(|_| malformed_error!("method key {:?} decodes past 4GiB", encrypted))
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode(&self, position: u32, crypto_key: i64) -> String {
        format!("{:X}", u64::from(position) ^ crypto_key as u64)
    }
}
