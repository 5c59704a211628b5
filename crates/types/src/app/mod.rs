//! Application-level data structures: transactions, validator sets, consensus
//! values and ledger headers.

/// Consensus-facing records: validator sets, consensus values, upgrades.
pub mod consensus;
/// Ledger headers and fee configuration.
pub mod ledger;
/// Transactions and operations.
pub mod transaction;

pub use consensus::*;
pub use ledger::*;
pub use transaction::*;

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-size, 32-byte cryptographic digest.
pub type Hash32 = [u8; 32];

/// The all-zero digest, standing for "no digest" in optional digest fields.
pub const ZERO_HASH: Hash32 = [0u8; 32];

/// Hex of the first four bytes, the form digests take in log lines.
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(bytes.get(..4).unwrap_or(bytes))
}

/// The textual encoding of a public key; every validator and every
/// transaction source is identified by one.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Encode, Decode, Serialize,
    Deserialize,
)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

/// A detached signature: the raw public key of the signer plus the signature
/// bytes over the canonical encoding of the signed record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct Signature {
    pub public_key: Vec<u8>,
    pub sign_data: Vec<u8>,
}
