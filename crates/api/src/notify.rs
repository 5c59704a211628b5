//! The callback interface the consensus engine drives, implemented by the
//! glue layer.

/// Tri-state outcome of validating a proposed consensus value.
///
/// `MayValid` marks a value this node cannot currently confirm (stale view of
/// the ledger, unverifiable proof): the node tracks the instance but never
/// votes Commit for it. `Invalid` values are rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckValueResult {
    Valid,
    MayValid,
    Invalid,
}

/// Consumed by the engine to reach the rest of the node. `send_message` and
/// `reset_close_timer` may be invoked while the engine lock is held and must
/// not call back into the engine synchronously; commit and view-change
/// notifications are delivered after the engine releases its lock.
pub trait ConsensusNotify: Send + Sync {
    /// A value reached Committed at `seq`; `proof` is the canonical commit
    /// certificate assembled from the driving Commit envelopes.
    fn on_value_committed(&self, seq: i64, value: &[u8], proof: &[u8]);

    /// A view change completed. `last_value` carries the highest prepared
    /// value to re-propose, or is empty.
    fn on_view_changed(&self, last_value: &[u8]);

    /// Validate an opaque proposed value.
    fn check_value(&self, value: &[u8]) -> CheckValueResult;

    /// Broadcast a consensus envelope and self-deliver it.
    fn send_message(&self, message: &[u8]);

    /// Re-arm the ledger-close watchdog.
    fn reset_close_timer(&self);

    /// Human-readable one-line description of a value, for logs.
    fn describe_value(&self, value: &[u8]) -> String;
}
