//! Compiled-in protocol constants.

/// Microseconds per second; all timestamps in the node are microseconds
/// since the unix epoch.
pub const MICRO_UNITS_PER_SEC: i64 = 1_000_000;

/// Bytes per mebibyte.
pub const BYTES_PER_MEGA: usize = 1024 * 1024;

/// Upper bound on the canonical byte size of a proposed transaction set.
pub const TXSET_LIMIT_SIZE: usize = 16 * BYTES_PER_MEGA;

/// Upper bound on the canonical byte size of a single transaction envelope.
pub const TX_LIMIT_SIZE: usize = BYTES_PER_MEGA;

/// The highest ledger version this build can execute. A ledger upgrade may
/// never target a version above this.
pub const LEDGER_VERSION: u64 = 1001;
