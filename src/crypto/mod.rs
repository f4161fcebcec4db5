//! Keyed cipher streams and method key decoding.

mod key;
mod stream;

pub use key::{HexXorCodec, KeyCodec};
pub use stream::{crypt, ByteTransform, CipherKind, CipherStream, KeyXor, RollingXor};
