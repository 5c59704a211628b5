#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented,
        clippy::indexing_slicing
    )
)]
//! Interfaces between the consensus core and its external collaborators.
//!
//! The core is constructed with trait-object handles for everything beyond
//! its own boundary: the gossip transport, the key-value store, the ledger
//! applier, the pre-execution oracle. None of these traits suspend; slow
//! implementations enqueue work internally and complete out of band.

pub mod ledger;
pub mod notify;
pub mod oracle;
pub mod storage;
pub mod transport;

pub use ledger::LedgerApplier;
pub use notify::{CheckValueResult, ConsensusNotify};
pub use oracle::{PreExecOracle, PreExecResult};
pub use storage::{KvStore, WriteOp};
pub use transport::{GossipTransport, PeerId, Topic};
