//! The canonical, deterministic binary codec for all consensus-critical data.
//!
//! Thin wrappers around `parity-scale-codec` (SCALE). Everything that is
//! signed, fingerprinted, persisted or put on the wire goes through these two
//! functions so that every component agrees on one binary representation.

use parity_scale_codec::{Decode, DecodeAll, Encode};

/// Encodes a value into its canonical byte representation.
pub fn to_bytes_canonical<T: Encode>(v: &T) -> Vec<u8> {
    v.encode()
}

/// Decodes a value from its canonical byte representation.
///
/// Fails on any malformed input, including trailing bytes; a message that
/// does not decode exactly is never processed further.
pub fn from_bytes_canonical<T: Decode>(b: &[u8]) -> Result<T, String> {
    T::decode_all(&mut &*b).map_err(|e| format!("canonical decode failed: {}", e))
}
