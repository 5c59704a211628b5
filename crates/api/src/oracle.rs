//! The pre-execution oracle contract.

use std::collections::BTreeSet;
use umbra_types::app::{ConsensusValue, ConsensusValueValidation};
use umbra_types::error::OracleError;

/// Outcome of speculatively executing a proposed value.
#[derive(Debug, Clone, Default)]
pub struct PreExecResult {
    /// The per-call budget was exceeded; the proposer retries with a
    /// reduced transaction set.
    pub timeout: bool,
    /// Indices into the value's transaction set that must be dropped.
    pub dropped_tx_indices: BTreeSet<usize>,
    /// Annotations the proposer attaches to the value.
    pub validation: ConsensusValueValidation,
}

/// Blocking, budget-bounded speculative execution of a consensus value.
/// `propose` distinguishes the proposer's own composition pass from the
/// validation re-run on received values.
pub trait PreExecOracle: Send + Sync {
    fn pre_process(&self, value: &ConsensusValue, propose: bool)
        -> Result<PreExecResult, OracleError>;
}
