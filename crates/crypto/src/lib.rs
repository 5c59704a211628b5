#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]
//! Cryptographic primitives for the umbra node: the two digest suites the
//! chain can run on, ed25519 node keys, and the address codec.

pub mod error;
pub mod hash;
pub mod sign;

pub use error::CryptoError;
pub use hash::{digest, Hasher};
pub use sign::{address_of_public, verify, NodeKeypair};
