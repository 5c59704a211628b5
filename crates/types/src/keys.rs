//! Canonical key names for the consensus namespaces of the key-value store.
//!
//! Every value stored under these keys is the canonical byte encoding of its
//! typed record (see [`crate::codec`]).

/// Whether the current view is active (`u8`, 0 or 1).
pub const CONSENSUS_VIEW_ACTIVE: &str = "consensus/view_active";
/// The current view number (`i64`).
pub const CONSENSUS_VIEW_NUMBER: &str = "consensus/view_number";
/// Snapshot of all live view-change instances.
pub const CONSENSUS_VIEW_CHANGE: &str = "consensus/view_change";
/// The current validator set.
pub const CONSENSUS_VALIDATORS: &str = "consensus/validators";
/// The highest executed consensus sequence (`i64`).
pub const CONSENSUS_LAST_EXE_SEQ: &str = "consensus/last_exe_seq";
/// Known peer table, owned by the overlay.
pub const PEERS_TABLE: &str = "peers/table";
/// Commit certificate of the last closed ledger, written by the ledger
/// applier and read when composing the next consensus value.
pub const LAST_PROOF: &str = "last_proof";
/// Content hashes of the most recently applied transactions.
pub const LAST_TX_HASHES: &str = "last_tx_hashes";
