//! Core error types for the umbra node.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors raised while validating or processing consensus messages. These are
/// message-level: the offending message is logged and dropped, the engine
/// never faults.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The message or value is structurally malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A signature did not verify over the canonical bytes.
    #[error("invalid signature")]
    InvalidSignature,
    /// The signer is not a member of the current validator set.
    #[error("signer {0} is not a validator")]
    NotValidator(String),
    /// The replica id embedded in the message does not match the signer's
    /// index in the validator set.
    #[error("replica id mismatch: message carries {got}, signer is {expected}")]
    WrongReplica { expected: i64, got: i64 },
    /// The sequence is outside the active water-mark window.
    #[error("sequence {seq} outside water mark [{low}, {high}]")]
    OutOfWatermark { seq: i64, low: i64, high: i64 },
    /// The message was already processed.
    #[error("duplicate message")]
    DuplicateMessage,
    /// The message targets a view other than the current one.
    #[error("view mismatch: current {current}, got {got}")]
    ViewMismatch { current: i64, got: i64 },
    /// The node is not the leader for the current view.
    #[error("not the leader of view {0}")]
    NotLeader(i64),
    /// The current view is not active.
    #[error("view {0} is not active")]
    ViewInactive(i64),
    /// Canonical decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
    /// A storage operation failed underneath the engine.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for ConsensusError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "CONS_INVALID_PARAMETER",
            Self::InvalidSignature => "CONS_INVALID_SIGNATURE",
            Self::NotValidator(_) => "CONS_NOT_VALIDATOR",
            Self::WrongReplica { .. } => "CONS_WRONG_REPLICA",
            Self::OutOfWatermark { .. } => "CONS_OUT_OF_WATERMARK",
            Self::DuplicateMessage => "CONS_DUPLICATE_MESSAGE",
            Self::ViewMismatch { .. } => "CONS_VIEW_MISMATCH",
            Self::NotLeader(_) => "CONS_NOT_LEADER",
            Self::ViewInactive(_) => "CONS_VIEW_INACTIVE",
            Self::Decode(_) => "CONS_DECODE_ERROR",
            Self::Storage(_) => "CONS_STORAGE_ERROR",
        }
    }
}

/// Errors reported to the submitter when a transaction is refused admission.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The bid gas price is below the fee schedule.
    #[error("gas price {got} below required {required}")]
    FeeNotEnough { required: i64, got: i64 },
    /// The nonce is not above the source's last applied nonce.
    #[error("nonce {got} not above last applied {last_applied}")]
    NonceTooLow { last_applied: u64, got: u64 },
    /// A replacement for the same (source, nonce) did not raise the gas
    /// price by the required fraction.
    #[error("replacement gas price {new} under-prices existing {old}")]
    UnderpricedReplacement { old: i64, new: i64 },
    /// The pool is at capacity and the transaction ranked last.
    #[error("transaction pool is full")]
    PoolFull,
    /// The source already has the maximum number of queued transactions.
    #[error("per-account queue limit ({0}) reached")]
    PerAccountCap(usize),
    /// The exact transaction is already queued.
    #[error("duplicate transaction")]
    DuplicateTransaction,
    /// The source signature did not verify.
    #[error("invalid transaction signature")]
    InvalidSignature,
    /// The canonical encoding exceeds the per-transaction size limit.
    #[error("transaction size {size} exceeds limit {limit}")]
    Oversize { size: usize, limit: usize },
}

impl ErrorCode for PoolError {
    fn code(&self) -> &'static str {
        match self {
            Self::FeeNotEnough { .. } => "TX_FEE_NOT_ENOUGH",
            Self::NonceTooLow { .. } => "TX_NONCE_TOO_LOW",
            Self::UnderpricedReplacement { .. } => "TX_UNDERPRICED_REPLACEMENT",
            Self::PoolFull => "TX_POOL_FULL",
            Self::PerAccountCap(_) => "TX_PER_ACCOUNT_CAP",
            Self::DuplicateTransaction => "TX_DUPLICATE",
            Self::InvalidSignature => "TX_INVALID_SIGNATURE",
            Self::Oversize { .. } => "TX_OVERSIZE",
        }
    }
}

/// Errors from the key-value storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored value decode error: {0}")]
    Decode(String),
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "STORAGE_BACKEND_ERROR",
            Self::Decode(_) => "STORAGE_DECODE_ERROR",
        }
    }
}

/// Errors from the ledger applier. Failures in the commit path are fatal and
/// surface to the caller.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("block apply failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for ApplyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Failed(_) => "APPLY_FAILED",
            Self::Storage(_) => "APPLY_STORAGE_ERROR",
        }
    }
}

/// Errors from the pre-execution oracle. `Timeout` is retryable with a
/// reduced transaction set.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("pre-execution timed out")]
    Timeout,
    #[error("pre-execution failed: {0}")]
    Failed(String),
}

impl ErrorCode for OracleError {
    fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "ORACLE_TIMEOUT",
            Self::Failed(_) => "ORACLE_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ConsensusError::WrongReplica { expected: 1, got: 2 }.code(),
            "CONS_WRONG_REPLICA"
        );
        assert_eq!(
            PoolError::UnderpricedReplacement { old: 100, new: 105 }.code(),
            "TX_UNDERPRICED_REPLACEMENT"
        );
        assert_eq!(OracleError::Timeout.code(), "ORACLE_TIMEOUT");
    }
}
