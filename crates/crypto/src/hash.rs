//! Digest suites. The chain's suite is a boot-time constant recorded in the
//! genesis block; every consensus digest goes through [`digest`] or an
//! incremental [`Hasher`] carrying that constant.

use digest::Digest;
use sha2::Sha256;
use sm3::Sm3;
use umbra_types::app::Hash32;
use umbra_types::config::HashType;

/// One-shot digest of `data` under the given suite.
pub fn digest(kind: HashType, data: &[u8]) -> Hash32 {
    match kind {
        HashType::Sha256 => Sha256::digest(data).into(),
        HashType::Sm3 => Sm3::digest(data).into(),
    }
}

/// Incremental hasher over the configured suite.
pub enum Hasher {
    Sha256(Sha256),
    Sm3(Sm3),
}

impl Hasher {
    pub fn new(kind: HashType) -> Self {
        match kind {
            HashType::Sha256 => Hasher::Sha256(Sha256::new()),
            HashType::Sm3 => Hasher::Sm3(Sm3::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sm3(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Hash32 {
        match self {
            Hasher::Sha256(h) => h.finalize().into(),
            Hasher::Sm3(h) => h.finalize().into(),
        }
    }
}
