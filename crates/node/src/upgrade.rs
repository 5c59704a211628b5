//! The ledger-upgrade sub-protocol: validators agree out of band on a
//! protocol version bump, which the round driver then folds into a block.
//!
//! Every 30 s a validator with a configured target version signs and
//! rebroadcasts its proposal; proposals from others are tracked per sender
//! and pruned after five minutes. Once enough validators propose the same
//! upgrade, [`LedgerUpgradeTracker::get_valid`] hands it to the proposer.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, error, info};
use umbra_types::app::{Address, LedgerUpgrade, LedgerUpgradeNotify, Signature, ValidatorSet};
use umbra_types::codec;
use umbra_types::general::MICRO_UNITS_PER_SEC;

/// Rebroadcast period for the local proposal.
const UPGRADE_SEND_INTERVAL_US: i64 = 30 * MICRO_UNITS_PER_SEC;

/// Proposals unheard of for this long are dropped.
const UPGRADE_STATE_TTL_US: i64 = 300 * MICRO_UNITS_PER_SEC;

/// A proposal received from one validator.
#[derive(Debug, Clone)]
struct UpgradeState {
    address: Address,
    recv_time: i64,
    msg: LedgerUpgradeNotify,
}

#[derive(Default)]
struct TrackerInner {
    local_state: LedgerUpgrade,
    current_states: BTreeMap<Address, UpgradeState>,
    last_send_time: i64,
}

/// Shared between the slow timer (gossip) and the round driver (embedding).
#[derive(Default)]
pub struct LedgerUpgradeTracker {
    inner: Mutex<TrackerInner>,
}

/// The signed payload is the canonical upgrade bytes followed by the nonce
/// rendered in decimal.
fn signing_payload(upgrade: &LedgerUpgrade, nonce: i64) -> Vec<u8> {
    let mut raw = codec::to_bytes_canonical(upgrade);
    raw.extend_from_slice(nonce.to_string().as_bytes());
    raw
}

impl LedgerUpgradeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-configure the version this node wants to reach.
    pub fn conf_new_version(&self, new_version: u64) {
        let mut inner = self.inner.lock();
        inner.local_state.new_ledger_version = new_version;
        info!(target: "upgrade", "pre-configured new ledger version({})", new_version);
    }

    pub fn local_state(&self) -> LedgerUpgrade {
        self.inner.lock().local_state.clone()
    }

    /// The ledger reached the proposed version: forget everything.
    pub fn ledger_has_upgrade(&self) {
        let mut inner = self.inner.lock();
        inner.local_state = LedgerUpgrade::default();
        inner.current_states.clear();
    }

    /// Prune stale proposals and, when due, produce the signed notify to
    /// broadcast (and self-deliver). `sign` signs with the node key.
    pub fn on_timer(
        &self,
        now: i64,
        is_validator: bool,
        sign: impl Fn(&[u8]) -> Signature,
    ) -> Option<LedgerUpgradeNotify> {
        let mut inner = self.inner.lock();
        inner
            .current_states
            .retain(|_, state| state.recv_time + UPGRADE_STATE_TTL_US >= now);

        if !is_validator {
            return None;
        }
        if now - inner.last_send_time <= UPGRADE_SEND_INTERVAL_US
            || inner.local_state.new_ledger_version == 0
        {
            return None;
        }

        let upgrade = inner.local_state.clone();
        let signature = sign(&signing_payload(&upgrade, now));
        inner.last_send_time = now;
        Some(LedgerUpgradeNotify {
            upgrade,
            nonce: now,
            signature,
        })
    }

    /// Track a proposal from the wire (or our own self-delivery).
    pub fn recv(&self, msg: &LedgerUpgradeNotify, now: i64) {
        let payload = signing_payload(&msg.upgrade, msg.nonce);
        if !umbra_crypto::verify(
            &msg.signature.public_key,
            &payload,
            &msg.signature.sign_data,
        ) {
            error!(target: "upgrade", "ledger upgrade message failed verification");
            return;
        }

        let address = umbra_crypto::address_of_public(&msg.signature.public_key);
        debug!(
            target: "upgrade",
            "upgrade proposal from {}: version({})",
            address,
            msg.upgrade.new_ledger_version
        );
        let mut inner = self.inner.lock();
        inner.current_states.insert(
            address.clone(),
            UpgradeState {
                address,
                recv_time: now,
                msg: msg.clone(),
            },
        );
    }

    /// The upgrade supported by at least `quorum` members of `validators`,
    /// if any.
    pub fn get_valid(&self, validators: &ValidatorSet, quorum: usize) -> Option<LedgerUpgrade> {
        let inner = self.inner.lock();
        if inner.current_states.is_empty() {
            return None;
        }

        let member_map = validators.to_map();
        let mut support: BTreeMap<LedgerUpgrade, usize> = BTreeMap::new();
        for state in inner.current_states.values() {
            let entry = support.entry(state.msg.upgrade.clone()).or_insert(0);
            if member_map.contains_key(&state.address) {
                *entry += 1;
            }
        }

        support
            .into_iter()
            .find(|(_, count)| *count >= quorum)
            .map(|(upgrade, _)| upgrade)
    }

    pub fn module_status(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let states: Vec<serde_json::Value> = inner
            .current_states
            .values()
            .map(|state| {
                serde_json::json!({
                    "address": state.address.to_string(),
                    "recv_time": state.recv_time,
                    "new_ledger_version": state.msg.upgrade.new_ledger_version,
                })
            })
            .collect();
        serde_json::json!({
            "local_state": inner.local_state,
            "current_states": states,
        })
    }
}
