//! Validator sets, consensus values and the ledger-upgrade records.

use super::{Address, Hash32, Signature, TransactionSet, ZERO_HASH};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One member of the validator set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pledge_amount: i64,
}

/// The ordered validator set; a validator's position is its replica id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub validators: Vec<Validator>,
}

/// Address to replica id, derived from a [`ValidatorSet`].
pub type ValidatorMap = BTreeMap<Address, i64>;

impl ValidatorSet {
    pub fn from_addresses<I, A>(addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        ValidatorSet {
            validators: addresses
                .into_iter()
                .map(|a| Validator {
                    address: a.into(),
                    pledge_amount: 0,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The replica id of `address`, if it is a member.
    pub fn index_of(&self, address: &Address) -> Option<i64> {
        self.validators
            .iter()
            .position(|v| &v.address == address)
            .map(|i| i as i64)
    }

    pub fn to_map(&self) -> ValidatorMap {
        self.validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address.clone(), i as i64))
            .collect()
    }

    /// Whether both sets hold the same addresses in the same order.
    pub fn same_order(&self, other: &ValidatorSet) -> bool {
        self.validators.len() == other.validators.len()
            && self
                .validators
                .iter()
                .zip(other.validators.iter())
                .all(|(a, b)| a.address == b.address)
    }
}

/// A quorum-agreed protocol version bump, optionally carrying a replacement
/// validator list for planned hard forks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Encode, Decode, Serialize,
         Deserialize)]
pub struct LedgerUpgrade {
    pub new_ledger_version: u64,
    /// Only permitted in a block whose consensus-value hash is a configured
    /// hard-fork point.
    pub new_validators: Vec<Address>,
}

impl LedgerUpgrade {
    pub fn is_empty(&self) -> bool {
        self.new_ledger_version == 0 && self.new_validators.is_empty()
    }
}

/// The signed gossip payload of the ledger-upgrade sub-protocol. The
/// signature covers `encode(upgrade) || nonce-as-decimal`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct LedgerUpgradeNotify {
    pub upgrade: LedgerUpgrade,
    /// Sender-local send timestamp, bound into the signature as replay salt.
    pub nonce: i64,
    pub signature: Signature,
}

/// Validation annotations the proposer attaches after pre-executing the
/// transaction set: indices of expired and erroneous transactions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct ConsensusValueValidation {
    pub expired_tx_ids: Vec<u32>,
    pub error_tx_ids: Vec<u32>,
}

impl ConsensusValueValidation {
    pub fn is_empty(&self) -> bool {
        self.expired_tx_ids.is_empty() && self.error_tx_ids.is_empty()
    }
}

/// The structured record a round of consensus agrees on.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ConsensusValue {
    /// Exactly `lcl.seq + 1`.
    pub ledger_seq: i64,
    /// Hash of the last closed ledger header.
    pub previous_ledger_hash: Hash32,
    /// Commit certificate of the previous value; canonical proof bytes,
    /// empty only for the second ledger.
    pub previous_proof: Vec<u8>,
    /// Microseconds since epoch; bounded below by the close interval and
    /// above by proposal time plus one second.
    pub close_time: i64,
    pub tx_set: TransactionSet,
    pub ledger_upgrade: Option<LedgerUpgrade>,
    pub validation: Option<ConsensusValueValidation>,
}

impl Default for ConsensusValue {
    fn default() -> Self {
        ConsensusValue {
            ledger_seq: 0,
            previous_ledger_hash: ZERO_HASH,
            previous_proof: Vec::new(),
            close_time: 0,
            tx_set: TransactionSet::default(),
            ledger_upgrade: None,
            validation: None,
        }
    }
}

impl ConsensusValue {
    pub fn byte_size(&self) -> usize {
        self.encoded_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_set_ordering() {
        let a = ValidatorSet::from_addresses(["v0", "v1", "v2"]);
        let b = ValidatorSet::from_addresses(["v0", "v2", "v1"]);
        assert_eq!(a.index_of(&"v1".into()), Some(1));
        assert_eq!(a.index_of(&"v9".into()), None);
        assert!(a.same_order(&a.clone()));
        assert!(!a.same_order(&b));

        let map = a.to_map();
        assert_eq!(map.get(&"v2".into()), Some(&2));
    }

    #[test]
    fn upgrade_emptiness() {
        assert!(LedgerUpgrade::default().is_empty());
        let up = LedgerUpgrade {
            new_ledger_version: 1001,
            new_validators: vec![],
        };
        assert!(!up.is_empty());
    }
}
