//! In-process implementations of the collaborator traits, for tests and
//! local single-node runs.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use umbra_api::{
    GossipTransport, KvStore, LedgerApplier, PeerId, PreExecOracle, PreExecResult, Topic, WriteOp,
};
use umbra_crypto::NodeKeypair;
use umbra_types::app::{
    Address, ConsensusValue, ConsensusValueValidation, FeeConfig, LedgerHeader, Operation,
    Transaction, TransactionEnv, ValidatorSet,
};
use umbra_types::codec;
use umbra_types::config::HashType;
use umbra_types::error::{ApplyError, OracleError, StorageError};
use umbra_types::keys;

/// A plain in-memory key-value store.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map.lock().insert(key.into(), value.into());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut map = self.map.lock();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Records everything broadcast; delivery is the test's business.
#[derive(Default)]
pub struct RecordingTransport {
    pub broadcasts: Mutex<Vec<(Topic, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn take(&self, topic: Topic) -> Vec<Vec<u8>> {
        let mut broadcasts = self.broadcasts.lock();
        let (matching, rest): (Vec<_>, Vec<_>) =
            broadcasts.drain(..).partition(|(t, _)| *t == topic);
        *broadcasts = rest;
        matching.into_iter().map(|(_, bytes)| bytes).collect()
    }
}

impl GossipTransport for RecordingTransport {
    fn broadcast(&self, topic: Topic, payload: bytes::Bytes) {
        self.broadcasts.lock().push((topic, payload.to_vec()));
    }

    fn send(&self, _peer: PeerId, topic: Topic, payload: bytes::Bytes) {
        self.broadcasts.lock().push((topic, payload.to_vec()));
    }

    fn active_peer_ids(&self) -> Vec<PeerId> {
        Vec::new()
    }
}

struct MockLedgerState {
    header: LedgerHeader,
    nonces: HashMap<Address, u64>,
    applied: BTreeMap<i64, (ConsensusValue, Vec<u8>)>,
}

/// A ledger applier that closes ledgers in memory, tracks account nonces and
/// persists the last commit certificate like the real ledger module does.
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
    validators: Mutex<ValidatorSet>,
    fees: FeeConfig,
    store: Arc<dyn KvStore>,
    hash_kind: HashType,
}

impl MockLedger {
    pub fn new(validators: ValidatorSet, store: Arc<dyn KvStore>, hash_kind: HashType) -> Self {
        let genesis = LedgerHeader {
            seq: 1,
            hash: umbra_crypto::digest(hash_kind, b"genesis"),
            version: 1000,
            ..LedgerHeader::default()
        };
        MockLedger {
            state: Mutex::new(MockLedgerState {
                header: genesis,
                nonces: HashMap::new(),
                applied: BTreeMap::new(),
            }),
            validators: Mutex::new(validators),
            fees: FeeConfig {
                gas_price: 1,
                base_reserve: 0,
            },
            store,
            hash_kind,
        }
    }

    pub fn applied(&self) -> Vec<(i64, ConsensusValue)> {
        self.state
            .lock()
            .applied
            .iter()
            .map(|(seq, (value, _))| (*seq, value.clone()))
            .collect()
    }

    pub fn set_account_nonce(&self, address: &Address, nonce: u64) {
        self.state.lock().nonces.insert(address.clone(), nonce);
    }
}

impl LedgerApplier for MockLedger {
    fn apply_block(&self, value: &ConsensusValue, proof: &[u8]) -> Result<LedgerHeader, ApplyError> {
        let mut state = self.state.lock();
        if value.ledger_seq != state.header.seq + 1 {
            return Err(ApplyError::Failed(format!(
                "expected seq {}, got {}",
                state.header.seq + 1,
                value.ledger_seq
            )));
        }

        let value_bytes = codec::to_bytes_canonical(value);
        let consensus_value_hash = umbra_crypto::digest(self.hash_kind, &value_bytes);
        let mut header_preimage = consensus_value_hash.to_vec();
        header_preimage.extend_from_slice(&value.ledger_seq.to_le_bytes());

        let previous = state.header.clone();
        let header = LedgerHeader {
            seq: value.ledger_seq,
            hash: umbra_crypto::digest(self.hash_kind, &header_preimage),
            previous_hash: previous.hash,
            close_time: value.close_time,
            tx_count: previous.tx_count + value.tx_set.len() as i64,
            version: value
                .ledger_upgrade
                .as_ref()
                .map(|up| up.new_ledger_version)
                .unwrap_or(previous.version),
            consensus_value_hash,
            fees_hash: previous.fees_hash,
            account_tree_hash: umbra_crypto::digest(
                self.hash_kind,
                &value.ledger_seq.to_le_bytes(),
            ),
        };

        for env in &value.tx_set.txs {
            let entry = state
                .nonces
                .entry(env.transaction.source.clone())
                .or_insert(0);
            if *entry < env.transaction.nonce {
                *entry = env.transaction.nonce;
            }
        }

        if let Some(upgrade) = &value.ledger_upgrade {
            if !upgrade.new_validators.is_empty() {
                *self.validators.lock() = ValidatorSet::from_addresses(
                    upgrade.new_validators.iter().map(|a| a.as_str()),
                );
            }
        }

        state.header = header.clone();
        state
            .applied
            .insert(value.ledger_seq, (value.clone(), proof.to_vec()));
        self.store.put(keys::LAST_PROOF, proof)?;
        Ok(header)
    }

    fn last_closed_ledger(&self) -> LedgerHeader {
        self.state.lock().header.clone()
    }

    fn get_validators(&self, _seq: i64) -> Option<ValidatorSet> {
        Some(self.validators.lock().clone())
    }

    fn get_fee_config(&self) -> FeeConfig {
        self.fees
    }

    fn account_nonce(&self, address: &Address) -> u64 {
        self.state.lock().nonces.get(address).copied().unwrap_or(0)
    }

    fn consensus_value_from_db(&self, seq: i64) -> Option<ConsensusValue> {
        self.state
            .lock()
            .applied
            .get(&seq)
            .map(|(value, _)| value.clone())
    }
}

/// A scriptable pre-execution oracle: report `timeout` for the first
/// `timeouts` calls, drop the given indices once, then pass everything.
#[derive(Default)]
pub struct ScriptedOracle {
    timeouts: Mutex<u32>,
    drop_once: Mutex<BTreeSet<usize>>,
    validation: Mutex<ConsensusValueValidation>,
}

impl ScriptedOracle {
    pub fn with_timeouts(timeouts: u32) -> Self {
        ScriptedOracle {
            timeouts: Mutex::new(timeouts),
            ..ScriptedOracle::default()
        }
    }

    pub fn drop_indices_once(&self, indices: impl IntoIterator<Item = usize>) {
        *self.drop_once.lock() = indices.into_iter().collect();
    }

    pub fn annotate(&self, validation: ConsensusValueValidation) {
        *self.validation.lock() = validation;
    }
}

impl PreExecOracle for ScriptedOracle {
    fn pre_process(
        &self,
        _value: &ConsensusValue,
        propose: bool,
    ) -> Result<PreExecResult, OracleError> {
        let mut timeouts = self.timeouts.lock();
        if *timeouts > 0 {
            *timeouts -= 1;
            return Ok(PreExecResult {
                timeout: true,
                ..PreExecResult::default()
            });
        }

        let dropped_tx_indices = if propose {
            std::mem::take(&mut *self.drop_once.lock())
        } else {
            BTreeSet::new()
        };

        Ok(PreExecResult {
            timeout: false,
            dropped_tx_indices,
            validation: self.validation.lock().clone(),
        })
    }
}

/// A transaction signed by its source key.
pub fn signed_tx(keypair: &NodeKeypair, nonce: u64, gas_price: i64) -> TransactionEnv {
    let transaction = Transaction {
        source: keypair.address().clone(),
        nonce,
        gas_price,
        fee_limit: 1_000_000,
        operations: vec![Operation::Payment {
            dest: "uxdest".into(),
            amount: 1,
        }],
        metadata: Vec::new(),
    };
    let signature = keypair.sign(&codec::to_bytes_canonical(&transaction));
    TransactionEnv {
        transaction,
        signatures: vec![signature],
    }
}
