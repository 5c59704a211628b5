//! Node signing keys and the address codec.
//!
//! Addresses are base58 of a tagged, truncated SHA-256 digest of the ed25519
//! public key plus a 4-byte checksum. The address codec is fixed-function:
//! it does not vary with the chain's consensus digest suite, so keys address
//! identically on SHA-256 and SM3 chains.

use crate::error::CryptoError;
use digest::Digest;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::Sha256;
use umbra_types::app::{Address, Signature};

/// Version tag prefixed to the address payload before encoding.
const ADDRESS_PREFIX: [u8; 2] = [0x01, 0x5b];

/// Derives the textual address of a raw ed25519 public key.
pub fn address_of_public(public_key: &[u8]) -> Address {
    let key_digest: [u8; 32] = Sha256::digest(public_key).into();
    let mut payload = Vec::with_capacity(26);
    payload.extend_from_slice(&ADDRESS_PREFIX);
    payload.extend_from_slice(key_digest.get(..20).unwrap_or_default());
    let check: [u8; 32] = Sha256::digest(Sha256::digest(&payload)).into();
    payload.extend_from_slice(check.get(..4).unwrap_or_default());
    Address(bs58::encode(payload).into_string())
}

/// Verifies `sign_data` over `message` against a raw ed25519 public key.
/// Malformed keys or signatures simply fail verification.
pub fn verify(public_key: &[u8], message: &[u8], sign_data: &[u8]) -> bool {
    let key_bytes: [u8; 32] = match public_key.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let vk = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let sig = match ed25519_dalek::Signature::from_slice(sign_data) {
        Ok(s) => s,
        Err(_) => return false,
    };
    vk.verify(message, &sig).is_ok()
}

/// The node's signing identity.
#[derive(Clone)]
pub struct NodeKeypair {
    signing: SigningKey,
    address: Address,
}

impl NodeKeypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self::from_seed(rand::random())
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let address = address_of_public(signing.verifying_key().as_bytes());
        NodeKeypair { signing, address }
    }

    /// Reconstruct a keypair from raw private key bytes.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("bad length {}", bytes.len())))?;
        Ok(Self::from_seed(seed))
    }

    /// The raw 32-byte public key.
    pub fn public_key(&self) -> Vec<u8> {
        self.signing.verifying_key().as_bytes().to_vec()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Sign `data`, returning the detached signature record carried on the
    /// wire.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let sig = self.signing.sign(data);
        Signature {
            public_key: self.public_key(),
            sign_data: sig.to_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = NodeKeypair::from_seed([3u8; 32]);
        let sig = kp.sign(b"payload");
        assert!(verify(&sig.public_key, b"payload", &sig.sign_data));
        assert!(!verify(&sig.public_key, b"payloax", &sig.sign_data));

        let other = NodeKeypair::from_seed([4u8; 32]);
        assert!(!verify(&other.public_key(), b"payload", &sig.sign_data));
    }

    #[test]
    fn address_is_deterministic_and_distinct() {
        let a = NodeKeypair::from_seed([1u8; 32]);
        let b = NodeKeypair::from_seed([2u8; 32]);
        assert_eq!(a.address(), NodeKeypair::from_seed([1u8; 32]).address());
        assert_ne!(a.address(), b.address());
        assert_eq!(address_of_public(&a.public_key()), *a.address());
    }

    #[test]
    fn malformed_inputs_fail_closed() {
        assert!(!verify(b"short", b"m", &[0u8; 64]));
        let kp = NodeKeypair::from_seed([9u8; 32]);
        assert!(!verify(&kp.public_key(), b"m", b"not-a-signature"));
        assert!(NodeKeypair::from_private_bytes(&[1, 2, 3]).is_err());
    }
}
