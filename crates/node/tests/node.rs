//! Node-level scenarios: single-node rounds, value checking, admission and
//! proof validation at the glue boundary.

use std::sync::Arc;
use std::time::Duration;
use umbra_api::{CheckValueResult, ConsensusNotify, KvStore, LedgerApplier};
use umbra_consensus::message::{Pbft as PbftPayload, PbftCommit, PbftEnv, PbftMessage};
use umbra_consensus::PbftProof;
use umbra_crypto::NodeKeypair;
use umbra_node::testing::{signed_tx, MemoryKv, MockLedger, RecordingTransport, ScriptedOracle};
use umbra_node::Core;
use umbra_types::app::{
    ConsensusValue, Hash32, LedgerUpgrade, TransactionSet, ValidatorSet,
};
use umbra_types::codec;
use umbra_types::config::{HashType, NodeConfig, ValidationType};
use umbra_types::error::PoolError;
use umbra_types::general::MICRO_UNITS_PER_SEC;

struct Fixture {
    core: Arc<Core>,
    ledger: Arc<MockLedger>,
    transport: Arc<RecordingTransport>,
    keypairs: Vec<NodeKeypair>,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fixture(validation: ValidationType, n: usize, hardfork_points: Vec<String>) -> Fixture {
    init_logging();
    let keypairs: Vec<NodeKeypair> = (0..n)
        .map(|i| NodeKeypair::from_seed([70 + i as u8; 32]))
        .collect();
    let validators = ValidatorSet::from_addresses(keypairs.iter().map(|kp| kp.address().as_str()));

    let mut config = NodeConfig::default();
    config.ledger.validation_type = validation;
    config.ledger.hardfork_points = hardfork_points;
    config.genesis.validators = keypairs.iter().map(|kp| kp.address().clone()).collect();

    let store: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
    let transport = Arc::new(RecordingTransport::default());
    let ledger = Arc::new(MockLedger::new(
        validators,
        store.clone(),
        HashType::Sha256,
    ));
    let oracle = Arc::new(ScriptedOracle::default());

    let core = Core::new(
        config,
        keypairs[0].clone(),
        transport.clone(),
        store,
        ledger.clone(),
        oracle,
    );
    Fixture {
        core,
        ledger,
        transport,
        keypairs,
    }
}

fn base_value(ledger: &MockLedger, close_interval_us: i64) -> ConsensusValue {
    let lcl = ledger.last_closed_ledger();
    ConsensusValue {
        ledger_seq: lcl.seq + 1,
        previous_ledger_hash: lcl.hash,
        previous_proof: Vec::new(),
        close_time: lcl.close_time + close_interval_us,
        tx_set: TransactionSet::default(),
        ledger_upgrade: None,
        validation: None,
    }
}

fn commit_env(kp: &NodeKeypair, replica_id: i64, sequence: i64, value_digest: Hash32) -> PbftEnv {
    let payload = PbftPayload {
        round_number: 1,
        message: PbftMessage::Commit(PbftCommit {
            view_number: 0,
            sequence,
            replica_id,
            value_digest,
        }),
    };
    let signature = kp.sign(&codec::to_bytes_canonical(&payload));
    PbftEnv {
        pbft: payload,
        signature,
    }
}

#[tokio::test(start_paused = true)]
async fn one_node_closes_ledgers_and_applies_the_upgrade() {
    let f = fixture(ValidationType::OneNode, 1, vec![]);
    f.core.start().await.unwrap();
    f.core
        .submit_transaction(signed_tx(&f.keypairs[0], 1, 100))
        .unwrap();

    for _ in 0..200 {
        if f.ledger.last_closed_ledger().seq >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let lcl = f.ledger.last_closed_ledger();
    assert!(lcl.seq >= 3, "no ledgers closed, lcl seq {}", lcl.seq);
    assert_eq!(lcl.version, 1001);
    assert_eq!(f.core.pool.size(), 0);

    let applied = f.ledger.applied();
    let (first_seq, first_value) = &applied[0];
    assert_eq!(*first_seq, 2);
    assert_eq!(first_value.tx_set.len(), 1);
    assert_eq!(
        first_value.ledger_upgrade,
        Some(LedgerUpgrade {
            new_ledger_version: 1001,
            new_validators: vec![]
        })
    );
    // Once applied, later proposals stop carrying the upgrade.
    let (_, second_value) = &applied[1];
    assert_eq!(second_value.ledger_upgrade, None);

    // The upgrade gossip actually went out.
    assert!(!f
        .transport
        .take(umbra_api::Topic::LedgerUpgradeNotify)
        .is_empty());

    f.core.shutdown();
}

#[tokio::test]
async fn oracle_timeout_halves_the_proposal() {
    let keypair = NodeKeypair::from_seed([90; 32]);
    let mut config = NodeConfig::default();
    config.ledger.validation_type = ValidationType::OneNode;
    config.genesis.validators = vec![keypair.address().clone()];

    let store: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
    let transport = Arc::new(RecordingTransport::default());
    let ledger = Arc::new(MockLedger::new(
        ValidatorSet::from_addresses([keypair.address().as_str()]),
        store.clone(),
        HashType::Sha256,
    ));
    let oracle = Arc::new(ScriptedOracle::with_timeouts(1));
    let core = Core::new(
        config,
        keypair.clone(),
        transport,
        store,
        ledger.clone(),
        oracle,
    );

    for nonce in 1..=4 {
        core.submit_transaction(signed_tx(&keypair, nonce, 100))
            .unwrap();
    }
    assert!(core.glue.start_consensus(&[]));

    let applied = f_applied_first(&ledger);
    assert_eq!(applied.tx_set.len(), 2, "timeout did not halve the set");
}

#[tokio::test]
async fn oracle_drop_list_prunes_value_and_pool() {
    let keypair = NodeKeypair::from_seed([91; 32]);
    let mut config = NodeConfig::default();
    config.ledger.validation_type = ValidationType::OneNode;
    config.genesis.validators = vec![keypair.address().clone()];

    let store: Arc<dyn KvStore> = Arc::new(MemoryKv::default());
    let ledger = Arc::new(MockLedger::new(
        ValidatorSet::from_addresses([keypair.address().as_str()]),
        store.clone(),
        HashType::Sha256,
    ));
    let oracle = Arc::new(ScriptedOracle::default());
    oracle.drop_indices_once([0]);
    let core = Core::new(
        config,
        keypair.clone(),
        Arc::new(RecordingTransport::default()),
        store,
        ledger.clone(),
        oracle,
    );

    for nonce in 1..=3 {
        core.submit_transaction(signed_tx(&keypair, nonce, 100))
            .unwrap();
    }
    assert!(core.glue.start_consensus(&[]));

    let applied = f_applied_first(&ledger);
    let nonces: Vec<u64> = applied
        .tx_set
        .txs
        .iter()
        .map(|env| env.transaction.nonce)
        .collect();
    assert_eq!(nonces, vec![2, 3]);
    assert_eq!(core.pool.size(), 0);
}

#[tokio::test]
async fn preserved_value_is_reproposed_verbatim() {
    let f = fixture(ValidationType::OneNode, 1, vec![]);
    let value = base_value(&f.ledger, 10 * MICRO_UNITS_PER_SEC);
    let bytes = codec::to_bytes_canonical(&value);

    assert!(f.core.glue.start_consensus(&bytes));
    let applied = f.ledger.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1, value);
}

fn f_applied_first(ledger: &MockLedger) -> ConsensusValue {
    let applied = ledger.applied();
    assert!(!applied.is_empty(), "nothing applied");
    applied[0].1.clone()
}

#[test]
fn check_value_matrix() {
    let f = fixture(ValidationType::Pbft, 4, vec![]);
    let interval = 10 * MICRO_UNITS_PER_SEC;

    let good = base_value(&f.ledger, interval);
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&good)),
        CheckValueResult::Valid
    );

    let mut wrong_seq = good.clone();
    wrong_seq.ledger_seq += 1;
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&wrong_seq)),
        CheckValueResult::MayValid
    );

    let mut wrong_hash = good.clone();
    wrong_hash.previous_ledger_hash = [9u8; 32];
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&wrong_hash)),
        CheckValueResult::MayValid
    );

    let mut too_soon = good.clone();
    too_soon.close_time = interval - 1;
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&too_soon)),
        CheckValueResult::MayValid
    );

    let mut in_future = good.clone();
    in_future.close_time = umbra_consensus::now_us() + 5 * MICRO_UNITS_PER_SEC;
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&in_future)),
        CheckValueResult::MayValid
    );

    // Second ledger must not carry a predecessor certificate.
    let mut with_proof = good.clone();
    with_proof.previous_proof = vec![1, 2, 3];
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&with_proof)),
        CheckValueResult::MayValid
    );

    // Upgrade sanity.
    let mut down_upgrade = good.clone();
    down_upgrade.ledger_upgrade = Some(LedgerUpgrade {
        new_ledger_version: 1000,
        new_validators: vec![],
    });
    assert_eq!(
        f.core
            .glue
            .check_value(&codec::to_bytes_canonical(&down_upgrade)),
        CheckValueResult::MayValid
    );

    let mut over_upgrade = good.clone();
    over_upgrade.ledger_upgrade = Some(LedgerUpgrade {
        new_ledger_version: 2000,
        new_validators: vec![],
    });
    assert_eq!(
        f.core
            .glue
            .check_value(&codec::to_bytes_canonical(&over_upgrade)),
        CheckValueResult::MayValid
    );

    let mut good_upgrade = good.clone();
    good_upgrade.ledger_upgrade = Some(LedgerUpgrade {
        new_ledger_version: 1001,
        new_validators: vec![],
    });
    assert_eq!(
        f.core
            .glue
            .check_value(&codec::to_bytes_canonical(&good_upgrade)),
        CheckValueResult::Valid
    );

    // Validator replacement outside a hard-fork point is refused.
    let mut validator_swap = good.clone();
    validator_swap.ledger_upgrade = Some(LedgerUpgrade {
        new_ledger_version: 1001,
        new_validators: vec!["uxNew".into()],
    });
    assert_eq!(
        f.core
            .glue
            .check_value(&codec::to_bytes_canonical(&validator_swap)),
        CheckValueResult::MayValid
    );
}

#[test]
fn previous_proof_is_verified_with_hardfork_bypass() {
    let f = fixture(ValidationType::Pbft, 4, vec![]);
    let interval = 10 * MICRO_UNITS_PER_SEC;

    // Close ledger 2 out of band.
    let value2 = base_value(&f.ledger, interval);
    let value2_digest = umbra_crypto::digest(
        HashType::Sha256,
        &codec::to_bytes_canonical(&value2),
    );
    f.ledger.apply_block(&value2, b"seed-proof").unwrap();
    let lcl = f.ledger.last_closed_ledger();
    assert_eq!(lcl.seq, 2);
    assert_eq!(lcl.consensus_value_hash, value2_digest);

    // A certificate with the commit quorum of distinct signers passes.
    let full_proof = PbftProof {
        commits: (0..3i64)
            .map(|i| commit_env(&f.keypairs[i as usize], i, 2, value2_digest))
            .collect(),
    };
    let mut value3 = base_value(&f.ledger, interval);
    value3.previous_proof = codec::to_bytes_canonical(&full_proof);
    assert_eq!(
        f.core.glue.check_value(&codec::to_bytes_canonical(&value3)),
        CheckValueResult::Valid
    );

    // One short of the commit quorum fails.
    let short_proof = PbftProof {
        commits: (0..2i64)
            .map(|i| commit_env(&f.keypairs[i as usize], i, 2, value2_digest))
            .collect(),
    };
    let mut value3_short = base_value(&f.ledger, interval);
    value3_short.previous_proof = codec::to_bytes_canonical(&short_proof);
    assert_eq!(
        f.core
            .glue
            .check_value(&codec::to_bytes_canonical(&value3_short)),
        CheckValueResult::MayValid
    );

    // At a configured hard-fork point the proof is trusted unconditionally.
    let forked = fixture_with_state(&f, hex::encode(value2_digest));
    assert_eq!(
        forked
            .core
            .glue
            .check_value(&codec::to_bytes_canonical(&value3_short)),
        CheckValueResult::Valid
    );
}

#[test]
fn check_value_and_proof_for_block_replay() {
    let f = fixture(ValidationType::Pbft, 4, vec![]);
    let interval = 10 * MICRO_UNITS_PER_SEC;

    let value2 = base_value(&f.ledger, interval);
    let value2_digest =
        umbra_crypto::digest(HashType::Sha256, &codec::to_bytes_canonical(&value2));
    f.ledger.apply_block(&value2, b"seed-proof").unwrap();

    let mut value3 = base_value(&f.ledger, interval);
    value3.previous_proof = codec::to_bytes_canonical(&PbftProof {
        commits: (0..3i64)
            .map(|i| commit_env(&f.keypairs[i as usize], i, 2, value2_digest))
            .collect(),
    });
    let value3_bytes = codec::to_bytes_canonical(&value3);
    let value3_digest = umbra_crypto::digest(HashType::Sha256, &value3_bytes);

    // The replay path verifies the certificate of the value itself.
    let own_proof = codec::to_bytes_canonical(&PbftProof {
        commits: (0..3i64)
            .map(|i| commit_env(&f.keypairs[i as usize], i, 3, value3_digest))
            .collect(),
    });
    assert!(f.core.glue.check_value_and_proof(&value3_bytes, &own_proof));

    let thin_proof = codec::to_bytes_canonical(&PbftProof {
        commits: (0..2i64)
            .map(|i| commit_env(&f.keypairs[i as usize], i, 3, value3_digest))
            .collect(),
    });
    assert!(!f.core.glue.check_value_and_proof(&value3_bytes, &thin_proof));
}

/// A second core over the same ledger state, with a hard-fork point set.
fn fixture_with_state(f: &Fixture, hardfork_point: String) -> Fixture {
    let mut config = NodeConfig::default();
    config.ledger.validation_type = ValidationType::Pbft;
    config.ledger.hardfork_points = vec![hardfork_point];
    config.genesis.validators = f.keypairs.iter().map(|kp| kp.address().clone()).collect();

    let store: Arc<MemoryKv> = Arc::new(MemoryKv::default());
    let transport = Arc::new(RecordingTransport::default());
    let core = Core::new(
        config,
        f.keypairs[0].clone(),
        transport.clone(),
        store,
        f.ledger.clone(),
        Arc::new(ScriptedOracle::default()),
    );
    Fixture {
        core,
        ledger: f.ledger.clone(),
        transport,
        keypairs: f.keypairs.clone(),
    }
}

#[test]
fn transaction_admission_rules() {
    let f = fixture(ValidationType::Pbft, 4, vec![]);
    let kp = &f.keypairs[0];

    // Well-formed transaction is admitted; resubmission is a silent no-op.
    let env = signed_tx(kp, 1, 100);
    f.core.submit_transaction(env.clone()).unwrap();
    f.core.submit_transaction(env).unwrap();
    assert_eq!(f.core.pool.size(), 1);

    // Unsigned source.
    let mut unsigned = signed_tx(kp, 2, 100);
    unsigned.signatures.clear();
    assert!(matches!(
        f.core.submit_transaction(unsigned),
        Err(PoolError::InvalidSignature)
    ));

    // Signed by somebody other than the source.
    let other = NodeKeypair::from_seed([99; 32]);
    let mut foreign = signed_tx(kp, 2, 100);
    foreign.signatures =
        vec![other.sign(&codec::to_bytes_canonical(&foreign.transaction))];
    assert!(matches!(
        f.core.submit_transaction(foreign),
        Err(PoolError::InvalidSignature)
    ));

    // Below the fee schedule.
    assert!(matches!(
        f.core.submit_transaction(signed_tx(kp, 2, 0)),
        Err(PoolError::FeeNotEnough { .. })
    ));

    // Nonce at or below the applied one.
    f.ledger.set_account_nonce(kp.address(), 5);
    assert!(matches!(
        f.core.submit_transaction(signed_tx(kp, 5, 100)),
        Err(PoolError::NonceTooLow { last_applied: 5, got: 5 })
    ));

    // Oversize payload.
    let mut oversize = signed_tx(kp, 6, 100);
    oversize.transaction.metadata = vec![0u8; 1024 * 1024];
    oversize.signatures =
        vec![kp.sign(&codec::to_bytes_canonical(&oversize.transaction))];
    assert!(matches!(
        f.core.submit_transaction(oversize),
        Err(PoolError::Oversize { .. })
    ));
}
