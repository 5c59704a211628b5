#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]
//! Byzantine agreement for the umbra node.
//!
//! The [`Consensus`] value wraps one of two engines chosen at boot: the
//! trivial [`OneNode`] bootstrap engine, or the PBFT engine of
//! [`pbft::PbftEngine`]. All engine state sits behind a single mutex; side
//! effects the engine wants are collected as [`ConsensusEvent`]s and
//! dispatched to the [`ConsensusNotify`] implementation after the lock is
//! released.

pub mod instance;
pub mod message;
pub mod pbft;
pub mod persist;
pub mod proof;

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use umbra_api::{CheckValueResult, ConsensusNotify, KvStore};
use umbra_crypto::NodeKeypair;
use umbra_types::app::{Address, Hash32, Signature, ValidatorMap, ValidatorSet};
use umbra_types::config::{HashType, LedgerConfig, ValidationType};
use umbra_types::error::ConsensusError;
use umbra_types::keys;

use message::{ConsensusMsg, PbftMessage};
use pbft::PbftEngine;
use persist::ValueSaver;

pub use proof::{check_proof, fault_count, quorum_size, PbftProof};

/// Microseconds since the unix epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// A side effect the engine requests; dispatched to the notify interface
/// once the engine lock is released.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Broadcast an encoded consensus envelope (and self-deliver it).
    SendMessage(Vec<u8>),
    /// A value committed at `seq` with its commit certificate.
    ValueCommitted {
        seq: i64,
        value: Vec<u8>,
        proof: Vec<u8>,
    },
    /// A view change completed; `last_value` is the prepared value to
    /// re-propose, or empty.
    ViewChanged { last_value: Vec<u8> },
    /// Re-arm the ledger-close watchdog.
    ResetCloseTimer,
}

/// State shared by every engine variant: the node identity and the current
/// validator set.
pub struct ConsensusBase {
    pub keypair: NodeKeypair,
    pub validators: ValidatorSet,
    pub validator_map: ValidatorMap,
    pub replica_id: i64,
    pub is_validator: bool,
    pub hash_kind: HashType,
    pub store: Arc<dyn KvStore>,
}

impl ConsensusBase {
    pub fn new(keypair: NodeKeypair, hash_kind: HashType, store: Arc<dyn KvStore>) -> Self {
        ConsensusBase {
            keypair,
            validators: ValidatorSet::default(),
            validator_map: ValidatorMap::new(),
            replica_id: -1,
            is_validator: false,
            hash_kind,
            store,
        }
    }

    /// Install a validator set and relearn our own replica id from it.
    pub fn update_validators(&mut self, validators: &ValidatorSet) {
        self.validators = validators.clone();
        self.validator_map = validators.to_map();
        match validators.index_of(self.keypair.address()) {
            Some(index) => {
                self.replica_id = index;
                self.is_validator = true;
            }
            None => {
                self.replica_id = -1;
                self.is_validator = false;
            }
        }
    }

    pub fn node_address(&self) -> &Address {
        self.keypair.address()
    }

    pub fn sign_data(&self, data: &[u8]) -> Signature {
        self.keypair.sign(data)
    }
}

/// Single-node bootstrap engine: every requested value commits immediately.
pub struct OneNode {
    base: ConsensusBase,
    events: Vec<ConsensusEvent>,
}

impl OneNode {
    pub fn new(base: ConsensusBase) -> Self {
        OneNode {
            base,
            events: Vec::new(),
        }
    }

    fn request(&mut self, value: &[u8]) -> bool {
        self.events.push(ConsensusEvent::ValueCommitted {
            seq: 0,
            value: value.to_vec(),
            proof: Vec::new(),
        });
        true
    }

    fn update_validators(&mut self, validators: &ValidatorSet) -> bool {
        self.base.update_validators(validators);
        let mut saver = ValueSaver::new(self.base.store.clone());
        saver.save_value(keys::CONSENSUS_VALIDATORS, validators);
        if let Err(e) = saver.commit() {
            warn!(target: "consensus", "persisting validators failed: {}", e);
        }
        true
    }

    fn take_events(&mut self) -> Vec<ConsensusEvent> {
        std::mem::take(&mut self.events)
    }
}

enum Engine {
    OneNode(OneNode),
    Pbft(PbftEngine),
}

/// The boot-time-dispatched consensus handle the rest of the node talks to.
pub struct Consensus {
    engine: Mutex<Engine>,
    notify: RwLock<Option<Weak<dyn ConsensusNotify>>>,
    hash_kind: HashType,
}

impl Consensus {
    pub fn new(cfg: &LedgerConfig, keypair: NodeKeypair, store: Arc<dyn KvStore>) -> Self {
        let hash_kind = cfg.hash_type;
        let base = ConsensusBase::new(keypair, hash_kind, store);
        let engine = match cfg.validation_type {
            ValidationType::OneNode => {
                info!(target: "consensus", "one-node consensus selected");
                Engine::OneNode(OneNode::new(base))
            }
            ValidationType::Pbft => Engine::Pbft(PbftEngine::new(base, cfg)),
        };
        Consensus {
            engine: Mutex::new(engine),
            notify: RwLock::new(None),
            hash_kind,
        }
    }

    /// Wire the notify sink. Must be called once before the engine is
    /// driven.
    pub fn set_notify(&self, notify: &Arc<dyn ConsensusNotify>) {
        *self.notify.write() = Some(Arc::downgrade(notify));
    }

    fn notify_handle(&self) -> Option<Arc<dyn ConsensusNotify>> {
        self.notify.read().as_ref().and_then(Weak::upgrade)
    }

    fn dispatch(&self, events: Vec<ConsensusEvent>) {
        if events.is_empty() {
            return;
        }
        let notify = match self.notify_handle() {
            Some(n) => n,
            None => {
                warn!(target: "consensus", "consensus events dropped: notify not wired");
                return;
            }
        };
        for event in events {
            match event {
                ConsensusEvent::SendMessage(bytes) => notify.send_message(&bytes),
                ConsensusEvent::ValueCommitted { seq, value, proof } => {
                    notify.on_value_committed(seq, &value, &proof)
                }
                ConsensusEvent::ViewChanged { last_value } => {
                    notify.on_view_changed(&last_value)
                }
                ConsensusEvent::ResetCloseTimer => notify.reset_close_timer(),
            }
        }
    }

    /// Resume persisted engine state.
    pub fn initialize(&self) -> Result<(), ConsensusError> {
        match &mut *self.engine.lock() {
            Engine::OneNode(_) => Ok(()),
            Engine::Pbft(engine) => engine.initialize(),
        }
    }

    pub fn hash_kind(&self) -> HashType {
        self.hash_kind
    }

    /// Propose a value (leader only on the PBFT path).
    pub fn request(&self, value: &[u8]) -> bool {
        let now = now_us();
        let (ret, events) = {
            let mut engine = self.engine.lock();
            let ret = match &mut *engine {
                Engine::OneNode(e) => e.request(value),
                Engine::Pbft(e) => e.request(value, now),
            };
            (ret, Self::drain(&mut engine))
        };
        self.dispatch(events);
        ret
    }

    /// Deliver a consensus message from the wire (or from ourselves).
    pub fn on_receive(&self, msg: &ConsensusMsg) -> bool {
        // The value check consults the ledger and must run before the
        // engine lock is taken.
        let check = if matches!(msg.env().pbft.message, PbftMessage::PrePrepare(_)) {
            match (self.notify_handle(), msg.values().first()) {
                (Some(notify), Some(value)) => notify.check_value(value),
                _ => CheckValueResult::MayValid,
            }
        } else {
            CheckValueResult::Valid
        };

        let now = now_us();
        let (ret, events) = {
            let mut engine = self.engine.lock();
            let ret = match &mut *engine {
                Engine::OneNode(_) => false,
                Engine::Pbft(e) => e.on_receive(msg, check, now),
            };
            (ret, Self::drain(&mut engine))
        };
        self.dispatch(events);
        ret
    }

    pub fn on_timer(&self, now: i64) {
        let events = {
            let mut engine = self.engine.lock();
            if let Engine::Pbft(e) = &mut *engine {
                e.on_timer(now);
            }
            Self::drain(&mut engine)
        };
        self.dispatch(events);
    }

    /// The close-timer watchdog fired: demand a view change.
    pub fn on_tx_timeout(&self) {
        let now = now_us();
        let events = {
            let mut engine = self.engine.lock();
            if let Engine::Pbft(e) = &mut *engine {
                e.on_tx_timeout(now);
            }
            Self::drain(&mut engine)
        };
        self.dispatch(events);
    }

    /// Adopt the validator set of a committed block.
    pub fn update_validators(&self, validators: &ValidatorSet, proof: &[u8]) -> bool {
        let (ret, events) = {
            let mut engine = self.engine.lock();
            let ret = match &mut *engine {
                Engine::OneNode(e) => e.update_validators(validators),
                Engine::Pbft(e) => e.update_validators(validators, proof),
            };
            (ret, Self::drain(&mut engine))
        };
        self.dispatch(events);
        ret
    }

    /// Validate a commit certificate against an arbitrary validator set.
    pub fn check_proof(
        &self,
        validators: &ValidatorSet,
        previous_value_hash: &Hash32,
        proof: &[u8],
    ) -> bool {
        match &*self.engine.lock() {
            Engine::OneNode(_) => true,
            Engine::Pbft(e) => e.check_proof(validators, previous_value_hash, proof),
        }
    }

    pub fn is_leader(&self) -> bool {
        match &*self.engine.lock() {
            Engine::OneNode(_) => true,
            Engine::Pbft(e) => e.is_leader(),
        }
    }

    pub fn is_validator(&self) -> bool {
        match &*self.engine.lock() {
            Engine::OneNode(e) => e.base.is_validator,
            Engine::Pbft(e) => e.base.is_validator,
        }
    }

    pub fn quorum_size(&self) -> usize {
        match &*self.engine.lock() {
            Engine::OneNode(_) => 0,
            Engine::Pbft(e) => e.quorum_size(),
        }
    }

    /// The current validator set together with the prepare quorum size.
    pub fn validation(&self) -> (ValidatorSet, usize) {
        match &*self.engine.lock() {
            Engine::OneNode(e) => (e.base.validators.clone(), 0),
            Engine::Pbft(e) => (e.base.validators.clone(), e.quorum_size()),
        }
    }

    pub fn node_address(&self) -> Address {
        match &*self.engine.lock() {
            Engine::OneNode(e) => e.base.node_address().clone(),
            Engine::Pbft(e) => e.base.node_address().clone(),
        }
    }

    /// Sign arbitrary data with the node key (used by the ledger-upgrade
    /// gossip).
    pub fn sign_data(&self, data: &[u8]) -> Signature {
        match &*self.engine.lock() {
            Engine::OneNode(e) => e.base.sign_data(data),
            Engine::Pbft(e) => e.base.sign_data(data),
        }
    }

    pub fn last_exe_seq(&self) -> i64 {
        match &*self.engine.lock() {
            Engine::OneNode(_) => 0,
            Engine::Pbft(e) => e.last_exe_seq(),
        }
    }

    pub fn view_number(&self) -> i64 {
        match &*self.engine.lock() {
            Engine::OneNode(_) => 0,
            Engine::Pbft(e) => e.view_number(),
        }
    }

    pub fn module_status(&self) -> serde_json::Value {
        match &*self.engine.lock() {
            Engine::OneNode(_) => serde_json::json!({ "type": "one_node" }),
            Engine::Pbft(e) => e.module_status(),
        }
    }

    fn drain(engine: &mut Engine) -> Vec<ConsensusEvent> {
        match engine {
            Engine::OneNode(e) => e.take_events(),
            Engine::Pbft(e) => e.take_events(),
        }
    }
}
