//! The ledger-applier contract: the boundary to block execution and the
//! account/state store.

use umbra_types::app::{Address, ConsensusValue, FeeConfig, LedgerHeader, ValidatorSet};
use umbra_types::error::ApplyError;

/// Applies committed values and answers ledger queries. Implemented by the
/// ledger module; the core holds only read snapshots of its state.
pub trait LedgerApplier: Send + Sync {
    /// Execute the committed value and close a new ledger. `proof` is the
    /// canonical commit certificate driving the commit. Failures here are
    /// fatal to the commit path.
    fn apply_block(&self, value: &ConsensusValue, proof: &[u8]) -> Result<LedgerHeader, ApplyError>;

    /// The most recently closed ledger header.
    fn last_closed_ledger(&self) -> LedgerHeader;

    /// The validator set in force at ledger `seq`.
    fn get_validators(&self, seq: i64) -> Option<ValidatorSet>;

    /// The fee schedule in force.
    fn get_fee_config(&self) -> FeeConfig;

    /// The last applied nonce of `address` (0 for unknown accounts).
    fn account_nonce(&self, address: &Address) -> u64;

    /// The consensus value a past ledger was closed from, if still stored.
    fn consensus_value_from_db(&self, seq: i64) -> Option<ConsensusValue>;
}
