//! Signed transactions and the operations they carry.

use super::{Address, Signature};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A single state-changing operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum Operation {
    /// Transfer `amount` base units to `dest`.
    Payment { dest: Address, amount: i64 },
    /// Create `dest` with an initial balance.
    CreateAccount { dest: Address, init_balance: i64 },
    /// Set a metadata entry under the source account.
    SetMetadata { key: String, value: Vec<u8> },
}

/// The signed payload of a transaction. The canonical encoding of this record
/// is what the source signs and what the content hash is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct Transaction {
    pub source: Address,
    /// Must be strictly greater than the source's last applied nonce.
    pub nonce: u64,
    pub gas_price: i64,
    pub fee_limit: i64,
    pub operations: Vec<Operation>,
    pub metadata: Vec<u8>,
}

impl Default for Operation {
    fn default() -> Self {
        Operation::SetMetadata {
            key: String::new(),
            value: Vec::new(),
        }
    }
}

/// A transaction together with the signatures authorizing it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct TransactionEnv {
    pub transaction: Transaction,
    pub signatures: Vec<Signature>,
}

impl TransactionEnv {
    /// Canonical byte size of the envelope, the unit the set and value size
    /// limits are expressed in.
    pub fn byte_size(&self) -> usize {
        self.encoded_size()
    }
}

/// An ordered batch of transaction envelopes, bounded by
/// [`crate::general::TXSET_LIMIT_SIZE`] canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct TransactionSet {
    pub txs: Vec<TransactionEnv>,
}

impl TransactionSet {
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.encoded_size()
    }
}
