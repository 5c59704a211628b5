//! The consensus wire model: the signed PBFT envelope and the derived
//! message value object.
//!
//! Every envelope signs the canonical bytes of its inner [`Pbft`] record
//! (round number included, so retries re-sign); the envelope fingerprint is
//! the digest of the whole envelope including the signature and is the
//! deduplication key throughout the node.

use parity_scale_codec::{Decode, Encode};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::error;
use umbra_types::app::{short_hex, Address, Hash32, Signature, ValidatorMap, ZERO_HASH};
use umbra_types::codec;
use umbra_types::config::HashType;
use umbra_types::error::ConsensusError;

use crate::proof::quorum_size;

/// Leader's proposal of a value for `(view_number, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct PbftPrePrepare {
    pub view_number: i64,
    pub sequence: i64,
    pub replica_id: i64,
    /// The opaque consensus value.
    pub value: Vec<u8>,
    /// Digest of `value` under the chain's digest suite.
    pub value_digest: Hash32,
}

/// A replica's echo of a pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct PbftPrepare {
    pub view_number: i64,
    pub sequence: i64,
    pub replica_id: i64,
    pub value_digest: Hash32,
}

/// A replica's vote to commit a prepared value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct PbftCommit {
    pub view_number: i64,
    pub sequence: i64,
    pub replica_id: i64,
    pub value_digest: Hash32,
}

/// A vote to move to `view_number`, carrying the digest of the highest value
/// the sender saw prepared (or the zero digest).
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct PbftViewChange {
    pub view_number: i64,
    /// The sender's last executed sequence.
    pub sequence: i64,
    pub replica_id: i64,
    pub prepared_value_digest: Hash32,
}

/// Evidence that a value was prepared: its pre-prepare plus matching
/// prepares from at least a prepare quorum of distinct replicas.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PbftPreparedSet {
    pub pre_prepare: Box<PbftEnv>,
    pub prepares: Vec<PbftEnv>,
}

/// A view-change vote bundled with the raw prepared value so the new primary
/// can re-propose it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PbftViewChangeRaw {
    /// The signed inner [`PbftViewChange`] envelope.
    pub view_change_env: Box<PbftEnv>,
    pub prepared_set: Option<PbftPreparedSet>,
}

/// The new primary's announcement of view `view_number`, bundling the
/// view-change envelopes that justify it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PbftNewView {
    pub view_number: i64,
    pub sequence: i64,
    pub replica_id: i64,
    /// The collected inner view-change envelopes.
    pub view_changes: Vec<PbftEnv>,
    /// The pre-prepare of the highest prepared set seen, if any.
    pub pre_prepare: Option<Box<PbftEnv>>,
}

/// The tagged union of consensus messages.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PbftMessage {
    PrePrepare(PbftPrePrepare),
    Prepare(PbftPrepare),
    Commit(PbftCommit),
    ViewChange(PbftViewChange),
    ViewChangeWithRawValue(PbftViewChangeRaw),
    NewView(PbftNewView),
}

/// The signed payload: message plus retransmission round. Round counters are
/// not part of any value digest; they only let receivers tell retries apart.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Pbft {
    pub round_number: u32,
    pub message: PbftMessage,
}

/// A consensus envelope: payload plus detached signature over the payload's
/// canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PbftEnv {
    pub pbft: Pbft,
    pub signature: Signature,
}

impl PbftEnv {
    pub fn message_type_name(&self) -> &'static str {
        match self.pbft.message {
            PbftMessage::PrePrepare(_) => "pbft-pre-prepare",
            PbftMessage::Prepare(_) => "pbft-prepare",
            PbftMessage::Commit(_) => "pbft-commit",
            PbftMessage::ViewChange(_) => "pbft-view-change",
            PbftMessage::ViewChangeWithRawValue(_) => "pbft-view-change-raw",
            PbftMessage::NewView(_) => "pbft-new-view",
        }
    }

    /// The sequence the message speaks about; 0 where none is carried
    /// directly.
    pub fn sequence(&self) -> i64 {
        match &self.pbft.message {
            PbftMessage::PrePrepare(m) => m.sequence,
            PbftMessage::Prepare(m) => m.sequence,
            PbftMessage::Commit(m) => m.sequence,
            PbftMessage::ViewChange(m) => m.sequence,
            PbftMessage::NewView(m) => m.sequence,
            PbftMessage::ViewChangeWithRawValue(_) => 0,
        }
    }

    /// The replica id the sender embedded in the message. For the bundled
    /// view-change form this is the inner vote's replica id.
    pub fn replica_id(&self) -> i64 {
        match &self.pbft.message {
            PbftMessage::PrePrepare(m) => m.replica_id,
            PbftMessage::Prepare(m) => m.replica_id,
            PbftMessage::Commit(m) => m.replica_id,
            PbftMessage::ViewChange(m) => m.replica_id,
            PbftMessage::NewView(m) => m.replica_id,
            PbftMessage::ViewChangeWithRawValue(raw) => raw.view_change_env.replica_id(),
        }
    }

    /// The consensus values embedded in the message: one for a pre-prepare,
    /// at most one for the bundled view-change and new-view forms.
    pub fn values(&self) -> Vec<Vec<u8>> {
        match &self.pbft.message {
            PbftMessage::PrePrepare(m) => vec![m.value.clone()],
            PbftMessage::ViewChangeWithRawValue(raw) => raw
                .prepared_set
                .as_ref()
                .and_then(|set| match &set.pre_prepare.pbft.message {
                    PbftMessage::PrePrepare(pp) => Some(vec![pp.value.clone()]),
                    _ => None,
                })
                .unwrap_or_default(),
            PbftMessage::NewView(nv) => nv
                .pre_prepare
                .as_ref()
                .and_then(|env| match &env.pbft.message {
                    PbftMessage::PrePrepare(pp) => Some(vec![pp.value.clone()]),
                    _ => None,
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Canonical bytes of the signed payload.
    pub fn signed_bytes(&self) -> Vec<u8> {
        codec::to_bytes_canonical(&self.pbft)
    }

    /// Fingerprint of the whole envelope, signature included.
    pub fn fingerprint(&self, hash_kind: HashType) -> Hash32 {
        umbra_crypto::digest(hash_kind, &codec::to_bytes_canonical(self))
    }

    /// One-line log form.
    pub fn describe(&self) -> String {
        match &self.pbft.message {
            PbftMessage::PrePrepare(m) => format!(
                "type:pre-prepare|vn:{} seq:{} replica:{}|digest:{}",
                m.view_number,
                m.sequence,
                m.replica_id,
                short_hex(&m.value_digest)
            ),
            PbftMessage::Prepare(m) => format!(
                "type:prepare|vn:{} seq:{} replica:{}|digest:{}",
                m.view_number,
                m.sequence,
                m.replica_id,
                short_hex(&m.value_digest)
            ),
            PbftMessage::Commit(m) => format!(
                "type:commit|vn:{} seq:{} replica:{}|digest:{}",
                m.view_number,
                m.sequence,
                m.replica_id,
                short_hex(&m.value_digest)
            ),
            PbftMessage::ViewChange(m) => format!(
                "type:view-change|vn:{} seq:{} replica:{}|prepared:{}",
                m.view_number,
                m.sequence,
                m.replica_id,
                short_hex(&m.prepared_value_digest)
            ),
            PbftMessage::ViewChangeWithRawValue(raw) => format!(
                "type:view-change-raw|inner:[{}]|prepared_set:{}",
                raw.view_change_env.describe(),
                raw.prepared_set.is_some()
            ),
            PbftMessage::NewView(m) => format!(
                "type:new-view|vn:{} replica:{}|vcs:{}|pre_prepare:{}",
                m.view_number,
                m.replica_id,
                m.view_changes.len(),
                m.pre_prepare.is_some()
            ),
        }
    }
}

/// The §4.A value object: an envelope plus its derived, stable properties.
/// Ordered and deduplicated by fingerprint.
#[derive(Debug, Clone)]
pub struct ConsensusMsg {
    env: PbftEnv,
    sequence: i64,
    values: Vec<Vec<u8>>,
    node_address: Address,
    fingerprint: Hash32,
}

impl ConsensusMsg {
    pub fn new(env: PbftEnv, hash_kind: HashType) -> Self {
        let sequence = env.sequence();
        let values = env.values();
        let node_address = umbra_crypto::address_of_public(&env.signature.public_key);
        let fingerprint = env.fingerprint(hash_kind);
        ConsensusMsg {
            env,
            sequence,
            values,
            node_address,
            fingerprint,
        }
    }

    /// Decode an envelope off the wire and derive its properties.
    pub fn from_bytes(bytes: &[u8], hash_kind: HashType) -> Result<Self, ConsensusError> {
        let env: PbftEnv = codec::from_bytes_canonical(bytes).map_err(ConsensusError::Decode)?;
        Ok(Self::new(env, hash_kind))
    }

    pub fn env(&self) -> &PbftEnv {
        &self.env
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn node_address(&self) -> &Address {
        &self.node_address
    }

    pub fn fingerprint(&self) -> &Hash32 {
        &self.fingerprint
    }

    pub fn byte_size(&self) -> usize {
        self.env.encoded_size()
    }

    /// Message-level validation per §4.A against the current validator set.
    pub fn check(&self, validators: &ValidatorMap, hash_kind: HashType) -> Result<(), ConsensusError> {
        check_message_item(&self.env, validators, hash_kind)
    }
}

impl PartialEq for ConsensusMsg {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for ConsensusMsg {}

impl PartialOrd for ConsensusMsg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConsensusMsg {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fingerprint.cmp(&other.fingerprint)
    }
}

/// Validates an envelope against a validator set: the signer must be a
/// member, the embedded replica id must match the signer's index, and the
/// signature must verify over the canonical payload bytes. The bundled
/// view-change form additionally proves its prepared set self-consistent.
pub fn check_message_item(
    env: &PbftEnv,
    validators: &ValidatorMap,
    hash_kind: HashType,
) -> Result<(), ConsensusError> {
    let signer = umbra_crypto::address_of_public(&env.signature.public_key);
    let should_replica_id = match validators.get(&signer) {
        Some(id) => *id,
        None => {
            error!(target: "consensus", "signer {} not in validator list", signer);
            return Err(ConsensusError::NotValidator(signer.0));
        }
    };

    if let PbftMessage::ViewChangeWithRawValue(raw) = &env.pbft.message {
        check_view_change_raw(raw, validators, hash_kind)?;
    }

    let replica_id = env.replica_id();
    if replica_id != should_replica_id {
        error!(
            target: "consensus",
            "message replica id {} does not match signer index {}, desc({})",
            replica_id,
            should_replica_id,
            env.describe()
        );
        return Err(ConsensusError::WrongReplica {
            expected: should_replica_id,
            got: replica_id,
        });
    }

    if !umbra_crypto::verify(
        &env.signature.public_key,
        &env.signed_bytes(),
        &env.signature.sign_data,
    ) {
        error!(target: "consensus", "message signature check failed, desc({})", env.describe());
        return Err(ConsensusError::InvalidSignature);
    }
    Ok(())
}

/// Self-consistency of a bundled view change: the inner envelope must be a
/// well-signed view change, and the prepared set (if present) must carry
/// matching prepares from at least a prepare quorum of distinct replicas,
/// with the vote's prepared digest equal to the set's pre-prepare digest.
fn check_view_change_raw(
    raw: &PbftViewChangeRaw,
    validators: &ValidatorMap,
    hash_kind: HashType,
) -> Result<(), ConsensusError> {
    let inner = raw.view_change_env.as_ref();
    let vote = match &inner.pbft.message {
        PbftMessage::ViewChange(vc) => vc,
        _ => {
            return Err(ConsensusError::InvalidParameter(
                "view-change-raw does not wrap a view change".into(),
            ))
        }
    };
    check_message_item(inner, validators, hash_kind)?;

    let mut set_digest = ZERO_HASH;
    if let Some(set) = &raw.prepared_set {
        let pre_prepare = match &set.pre_prepare.pbft.message {
            PbftMessage::PrePrepare(pp) => pp,
            _ => {
                return Err(ConsensusError::InvalidParameter(
                    "prepared set does not start with a pre-prepare".into(),
                ))
            }
        };
        check_message_item(&set.pre_prepare, validators, hash_kind)?;
        set_digest = pre_prepare.value_digest;

        let mut replica_ids = BTreeSet::new();
        for prepare_env in &set.prepares {
            check_message_item(prepare_env, validators, hash_kind)?;
            let prepare = match &prepare_env.pbft.message {
                PbftMessage::Prepare(p) => p,
                _ => {
                    return Err(ConsensusError::InvalidParameter(
                        "prepared set carries a non-prepare".into(),
                    ))
                }
            };
            if prepare.view_number != pre_prepare.view_number
                || prepare.sequence != pre_prepare.sequence
                || prepare.value_digest != pre_prepare.value_digest
            {
                return Err(ConsensusError::InvalidParameter(
                    "prepared set prepare does not match its pre-prepare".into(),
                ));
            }
            replica_ids.insert(prepare.replica_id);
        }

        let need = quorum_size(validators.len());
        if replica_ids.len() < need {
            error!(
                target: "consensus",
                "prepared set carries {} distinct replicas, quorum is {}",
                replica_ids.len(),
                need
            );
            return Err(ConsensusError::InvalidParameter(
                "prepared set below quorum".into(),
            ));
        }
    }

    if vote.prepared_value_digest != set_digest {
        return Err(ConsensusError::InvalidParameter(
            "view-change digest differs from prepared set digest".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_crypto::NodeKeypair;

    fn signed_commit(kp: &NodeKeypair, replica_id: i64) -> PbftEnv {
        let pbft = Pbft {
            round_number: 1,
            message: PbftMessage::Commit(PbftCommit {
                view_number: 0,
                sequence: 2,
                replica_id,
                value_digest: [9u8; 32],
            }),
        };
        let signature = kp.sign(&codec::to_bytes_canonical(&pbft));
        PbftEnv { pbft, signature }
    }

    fn two_validators() -> (NodeKeypair, NodeKeypair, ValidatorMap) {
        let kp0 = NodeKeypair::from_seed([1u8; 32]);
        let kp1 = NodeKeypair::from_seed([2u8; 32]);
        let mut map = ValidatorMap::new();
        map.insert(kp0.address().clone(), 0);
        map.insert(kp1.address().clone(), 1);
        (kp0, kp1, map)
    }

    #[test]
    fn fingerprint_survives_encode_decode() {
        let kp = NodeKeypair::from_seed([7u8; 32]);
        let env = signed_commit(&kp, 0);
        let msg = ConsensusMsg::new(env.clone(), HashType::Sha256);
        let bytes = codec::to_bytes_canonical(&env);
        let decoded = ConsensusMsg::from_bytes(&bytes, HashType::Sha256).unwrap();
        assert_eq!(msg.fingerprint(), decoded.fingerprint());
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_bump_changes_fingerprint_not_digest() {
        let kp = NodeKeypair::from_seed([7u8; 32]);
        let env = signed_commit(&kp, 0);
        let mut retry = env.clone();
        retry.pbft.round_number = 2;
        retry.signature = kp.sign(&retry.signed_bytes());
        assert_ne!(
            env.fingerprint(HashType::Sha256),
            retry.fingerprint(HashType::Sha256)
        );
    }

    #[test]
    fn check_rejects_foreign_signer() {
        let (kp0, _kp1, map) = two_validators();
        let outsider = NodeKeypair::from_seed([9u8; 32]);
        let env = signed_commit(&outsider, 0);
        let msg = ConsensusMsg::new(env, HashType::Sha256);
        assert!(matches!(
            msg.check(&map, HashType::Sha256),
            Err(ConsensusError::NotValidator(_))
        ));

        let good = ConsensusMsg::new(signed_commit(&kp0, 0), HashType::Sha256);
        assert!(good.check(&map, HashType::Sha256).is_ok());
    }

    #[test]
    fn check_rejects_wrong_replica_id() {
        let (kp0, _kp1, map) = two_validators();
        let env = signed_commit(&kp0, 1);
        let msg = ConsensusMsg::new(env, HashType::Sha256);
        assert!(matches!(
            msg.check(&map, HashType::Sha256),
            Err(ConsensusError::WrongReplica { expected: 0, got: 1 })
        ));
    }

    #[test]
    fn check_rejects_tampered_payload() {
        let (kp0, _kp1, map) = two_validators();
        let mut env = signed_commit(&kp0, 0);
        if let PbftMessage::Commit(c) = &mut env.pbft.message {
            c.sequence = 3;
        }
        let msg = ConsensusMsg::new(env, HashType::Sha256);
        assert!(matches!(
            msg.check(&map, HashType::Sha256),
            Err(ConsensusError::InvalidSignature)
        ));
    }
}
