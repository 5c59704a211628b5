//! Ledger headers and fee configuration.

use super::{Hash32, ZERO_HASH};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The header of a closed ledger. The consensus core only ever holds read
/// snapshots of this; the ledger module owns it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub seq: i64,
    pub hash: Hash32,
    pub previous_hash: Hash32,
    /// Microseconds since epoch.
    pub close_time: i64,
    pub tx_count: i64,
    pub version: u64,
    /// Digest of the consensus value this ledger was closed from.
    pub consensus_value_hash: Hash32,
    pub fees_hash: Hash32,
    pub account_tree_hash: Hash32,
}

impl Default for LedgerHeader {
    fn default() -> Self {
        LedgerHeader {
            seq: 0,
            hash: ZERO_HASH,
            previous_hash: ZERO_HASH,
            close_time: 0,
            tx_count: 0,
            version: 0,
            consensus_value_hash: ZERO_HASH,
            fees_hash: ZERO_HASH,
            account_tree_hash: ZERO_HASH,
        }
    }
}

/// The fee schedule in force, read from the ledger module when admitting
/// transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Minimum gas price a transaction must bid.
    pub gas_price: i64,
    /// Minimum balance an account must retain.
    pub base_reserve: i64,
}
