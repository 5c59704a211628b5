//! The gossip transport contract consumed by the core.
//!
//! The transport deduplicates first-seen payloads by hash within its own
//! window and calls back into the core on delivery. Delivery order across
//! peers is not assumed anywhere in the core.

use bytes::Bytes;

/// Opaque identifier of a connected peer.
pub type PeerId = u64;

/// Stable topic identifiers multiplexed over the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Topic {
    /// Signed transaction envelope.
    Transaction = 1,
    /// Consensus envelope.
    Pbft = 2,
    /// Signed ledger-upgrade proposal.
    LedgerUpgradeNotify = 3,
    /// Block-sync request/response.
    Ledgers = 4,
}

/// Send-side contract of the overlay network. Implementations must not block
/// the caller; messages are enqueued and flushed by the transport's own
/// workers.
pub trait GossipTransport: Send + Sync {
    /// Broadcast `payload` to every active peer.
    fn broadcast(&self, topic: Topic, payload: Bytes);

    /// Send `payload` to a single peer.
    fn send(&self, peer: PeerId, topic: Topic, payload: Bytes);

    /// The peers currently considered active.
    fn active_peer_ids(&self) -> Vec<PeerId>;
}
