//! Quorum arithmetic and commit-certificate checking.

use parity_scale_codec::{Decode, Encode};
use tracing::error;
use umbra_types::app::{Hash32, ValidatorMap, ValidatorSet};
use umbra_types::codec;
use umbra_types::config::HashType;

use crate::message::{check_message_item, PbftEnv, PbftMessage};

/// Worst-case byzantine validator count the set tolerates.
pub fn fault_count(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// The prepare quorum. Prepared requires this many distinct prepares;
/// Committed and commit certificates require one more.
///
/// ```text
/// n        1   2   3   4   5   6   7   8   9
/// quorum   0   1   1   2   3   3   4   5   5
/// q + 1    1   2   2   3   4   4   5   6   6
/// ```
pub fn quorum_size(n: usize) -> usize {
    match n {
        0 | 1 => 0,
        2 | 3 => 1,
        _ => {
            let f = fault_count(n);
            if n == 3 * f + 1 {
                2 * f
            } else {
                2 * f + 1
            }
        }
    }
}

/// A commit certificate: the commit envelopes that drove an instance to
/// Committed, one per distinct signer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct PbftProof {
    pub commits: Vec<PbftEnv>,
}

/// Validates a commit certificate against a validator set: every entry must
/// be a well-signed Commit from a distinct member carrying
/// `value_digest == previous_value_hash`, and the distinct-signer count must
/// reach the commit quorum over that set.
pub fn check_proof(
    validators: &ValidatorSet,
    previous_value_hash: &Hash32,
    proof: &[u8],
    hash_kind: HashType,
) -> bool {
    let member_map: ValidatorMap = validators.to_map();
    let mut remaining = member_map.clone();
    let total = remaining.len();
    let need = quorum_size(total) + 1;

    let evidence: PbftProof = match codec::from_bytes_canonical(proof) {
        Ok(p) => p,
        Err(e) => {
            error!(target: "consensus", "proof decode failed: {}", e);
            return false;
        }
    };

    for env in &evidence.commits {
        if check_message_item(env, &member_map, hash_kind).is_err() {
            error!(
                target: "consensus",
                "proof entry failed message check, hash({}), desc({})",
                hex::encode(previous_value_hash),
                env.describe()
            );
            return false;
        }

        let commit = match &env.pbft.message {
            PbftMessage::Commit(c) => c,
            _ => {
                error!(
                    target: "consensus",
                    "proof entry is not a commit: {}",
                    env.message_type_name()
                );
                return false;
            }
        };

        if &commit.value_digest != previous_value_hash {
            error!(
                target: "consensus",
                "proof commit digest {} does not match previous value hash {}",
                hex::encode(commit.value_digest),
                hex::encode(previous_value_hash)
            );
            return false;
        }

        let address = umbra_crypto::address_of_public(&env.signature.public_key);
        if remaining.remove(&address).is_none() {
            error!(
                target: "consensus",
                "proof signer {} unknown or duplicated",
                address
            );
            return false;
        }
    }

    let distinct = total - remaining.len();
    if distinct >= need {
        true
    } else {
        error!(
            target: "consensus",
            "proof carries {} distinct commits, commit quorum is {}",
            distinct,
            need
        );
        false
    }
}
