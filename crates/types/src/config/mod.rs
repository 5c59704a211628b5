//! Node configuration structures.
//!
//! These deserialize from the node's TOML/JSON configuration. Interval fields
//! are expressed in seconds in the file; the `_us` accessors convert to the
//! microsecond timestamps used internally.

use crate::app::{Address, FeeConfig};
use crate::general::MICRO_UNITS_PER_SEC;
use serde::{Deserialize, Serialize};

/// Which consensus engine drives the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    /// Single-node bootstrap: every proposed value commits immediately.
    OneNode,
    /// Byzantine agreement across the validator set.
    Pbft,
}

/// Which digest suite the chain runs on, fixed at genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum HashType {
    Sha256,
    Sm3,
}

impl TryFrom<u32> for HashType {
    type Error = String;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(HashType::Sha256),
            1 => Ok(HashType::Sm3),
            other => Err(format!("unknown hash type {}", other)),
        }
    }
}

impl From<HashType> for u32 {
    fn from(v: HashType) -> u32 {
        match v {
            HashType::Sha256 => 0,
            HashType::Sm3 => 1,
        }
    }
}

/// Ledger and consensus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub validation_type: ValidationType,
    /// Seconds between ledger closes.
    pub close_interval: i64,
    /// Digest suite recorded in the genesis block.
    pub hash_type: HashType,
    pub max_trans_per_ledger: u32,
    /// Total transaction pool capacity.
    pub queue_limit: u32,
    /// Queued transactions allowed per source account.
    pub queue_per_account_txs_limit: u32,
    /// Seconds a pool entry may wait before timeout eviction.
    pub tx_timeout: i64,
    /// Seconds before an uncommitted instance triggers view change.
    pub instance_timeout: i64,
    /// Seconds between Commit retransmissions of a prepared instance.
    pub commit_send_interval: i64,
    /// Seconds between NewView retransmissions by the new primary.
    pub new_view_send_interval: i64,
    /// Minimum seconds between retransmissions of an unanswered ViewChange.
    pub view_change_timeout: i64,
    /// Checkpoint window length in sequences.
    pub ckp_interval: i64,
    /// Hex-encoded consensus-value hashes whose proof checking is bypassed.
    pub hardfork_points: Vec<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            validation_type: ValidationType::Pbft,
            close_interval: 10,
            hash_type: HashType::Sha256,
            max_trans_per_ledger: 2000,
            queue_limit: 10240,
            queue_per_account_txs_limit: 64,
            tx_timeout: 600,
            instance_timeout: 30,
            commit_send_interval: 15,
            new_view_send_interval: 15,
            view_change_timeout: 60,
            ckp_interval: 10,
            hardfork_points: Vec::new(),
        }
    }
}

impl LedgerConfig {
    pub fn close_interval_us(&self) -> i64 {
        self.close_interval * MICRO_UNITS_PER_SEC
    }

    pub fn tx_timeout_us(&self) -> i64 {
        self.tx_timeout * MICRO_UNITS_PER_SEC
    }

    pub fn instance_timeout_us(&self) -> i64 {
        self.instance_timeout * MICRO_UNITS_PER_SEC
    }

    pub fn commit_send_interval_us(&self) -> i64 {
        self.commit_send_interval * MICRO_UNITS_PER_SEC
    }

    pub fn new_view_send_interval_us(&self) -> i64 {
        self.new_view_send_interval * MICRO_UNITS_PER_SEC
    }

    pub fn view_change_timeout_us(&self) -> i64 {
        self.view_change_timeout * MICRO_UNITS_PER_SEC
    }
}

/// The genesis block parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub account: Address,
    /// The initial validator set, in replica-id order.
    pub validators: Vec<Address>,
    pub fees: FeeConfig,
    pub slogan: String,
}

/// Top-level node configuration consumed by the consensus core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ledger: LedgerConfig,
    pub genesis: GenesisConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = LedgerConfig::default();
        assert_eq!(c.close_interval, 10);
        assert_eq!(c.max_trans_per_ledger, 2000);
        assert_eq!(c.queue_limit, 10240);
        assert_eq!(c.queue_per_account_txs_limit, 64);
        assert_eq!(c.instance_timeout, 30);
        assert_eq!(c.ckp_interval, 10);
        assert_eq!(c.close_interval_us(), 10_000_000);
    }

    #[test]
    fn deserializes_from_toml_with_defaults() {
        let raw = r#"
            [ledger]
            validation_type = "pbft"
            close_interval = 5
            hash_type = 1

            [genesis]
            validators = ["uxAAA", "uxBBB"]
        "#;
        let cfg: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.ledger.close_interval, 5);
        assert_eq!(cfg.ledger.hash_type, HashType::Sm3);
        assert_eq!(cfg.ledger.queue_limit, 10240);
        assert_eq!(cfg.genesis.validators.len(), 2);
    }
}
