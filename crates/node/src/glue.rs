//! The round driver: composes consensus values from the pool, drives the
//! engine, applies committed blocks and keeps the close timers armed. This
//! is the [`ConsensusNotify`] implementation the engine calls back into.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use umbra_api::{
    CheckValueResult, ConsensusNotify, GossipTransport, KvStore, LedgerApplier, PreExecOracle,
    Topic,
};
use umbra_consensus::message::ConsensusMsg;
use umbra_consensus::{now_us, Consensus};
use umbra_pool::TxPool;
use umbra_types::app::{
    short_hex, ConsensusValue, Hash32, LedgerUpgradeNotify, TransactionEnv, TransactionSet,
};
use umbra_types::codec;
use umbra_types::config::LedgerConfig;
use umbra_types::error::PoolError;
use umbra_types::general::{BYTES_PER_MEGA, LEDGER_VERSION, MICRO_UNITS_PER_SEC, TXSET_LIMIT_SIZE,
                           TX_LIMIT_SIZE};
use umbra_types::keys;

use crate::upgrade::LedgerUpgradeTracker;

/// Hard ceiling on how long a ledger may stay open before the watchdog
/// forces a view change, plus its grace.
const MAX_LEDGER_TIMESPAN_US: i64 = 20 * MICRO_UNITS_PER_SEC;
const CLOSE_TIMER_GRACE_US: i64 = 10 * MICRO_UNITS_PER_SEC;

/// Delay before the very first round after boot.
const BOOT_ROUND_DELAY_US: i64 = 3 * MICRO_UNITS_PER_SEC;

/// Work posted to the main execution context.
#[derive(Debug)]
pub enum MainEvent {
    /// Begin a round, optionally re-proposing a preserved value.
    StartRound { preserved: Vec<u8> },
    /// A consensus envelope, from the wire or self-delivered.
    ConsensusMessage(Vec<u8>),
    /// A transaction from the RPC boundary or the gossip transport.
    Transaction {
        env: TransactionEnv,
        from_gossip: bool,
    },
    /// The ledger-close watchdog fired.
    CloseTimeout,
}

#[derive(Default)]
struct Timers {
    close_timer: Option<JoinHandle<()>>,
    start_round: Option<JoinHandle<()>>,
}

pub struct GlueManager {
    config: LedgerConfig,
    pool: Arc<TxPool>,
    consensus: Arc<Consensus>,
    upgrade: LedgerUpgradeTracker,
    hardfork_points: HashSet<Hash32>,
    ledger: Arc<dyn LedgerApplier>,
    oracle: Arc<dyn PreExecOracle>,
    transport: Arc<dyn GossipTransport>,
    store: Arc<dyn KvStore>,
    main_tx: UnboundedSender<MainEvent>,
    timers: Mutex<Timers>,
}

impl GlueManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LedgerConfig,
        pool: Arc<TxPool>,
        consensus: Arc<Consensus>,
        ledger: Arc<dyn LedgerApplier>,
        oracle: Arc<dyn PreExecOracle>,
        transport: Arc<dyn GossipTransport>,
        store: Arc<dyn KvStore>,
        main_tx: UnboundedSender<MainEvent>,
    ) -> Self {
        let mut hardfork_points = HashSet::new();
        for point in &config.hardfork_points {
            match hex::decode(point)
                .ok()
                .and_then(|bytes| <Hash32>::try_from(bytes.as_slice()).ok())
            {
                Some(hash) => {
                    hardfork_points.insert(hash);
                }
                None => error!(target: "glue", "unparsable hardfork point: {}", point),
            }
        }

        GlueManager {
            config,
            pool,
            consensus,
            upgrade: LedgerUpgradeTracker::new(),
            hardfork_points,
            ledger,
            oracle,
            transport,
            store,
            main_tx,
            timers: Mutex::new(Timers::default()),
        }
    }

    /// Arm the boot timers and, if the ledger is behind this build's
    /// version, pre-configure the upgrade proposal. Must run on the runtime.
    pub fn initialize(&self) {
        let lcl = self.ledger.last_closed_ledger();
        if lcl.version < LEDGER_VERSION {
            self.upgrade.conf_new_version(LEDGER_VERSION);
        }
        self.schedule_start_round(BOOT_ROUND_DELAY_US, Vec::new());
        self.start_ledger_close_timer();
    }

    pub fn upgrade_tracker(&self) -> &LedgerUpgradeTracker {
        &self.upgrade
    }

    fn start_ledger_close_timer(&self) {
        let main_tx = self.main_tx.clone();
        let mut timers = self.timers.lock();
        if let Some(old) = timers.close_timer.take() {
            old.abort();
        }
        timers.close_timer = Some(tokio::spawn(async move {
            let delay = (MAX_LEDGER_TIMESPAN_US + CLOSE_TIMER_GRACE_US) as u64;
            tokio::time::sleep(Duration::from_micros(delay)).await;
            info!(target: "glue", "ledger close timed out, demanding view change");
            let _ = main_tx.send(MainEvent::CloseTimeout);
        }));
    }

    fn schedule_start_round(&self, delay_us: i64, preserved: Vec<u8>) {
        let main_tx = self.main_tx.clone();
        let delay = delay_us.max(1) as u64;
        let mut timers = self.timers.lock();
        if let Some(old) = timers.start_round.take() {
            old.abort();
        }
        timers.start_round = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(delay)).await;
            let _ = main_tx.send(MainEvent::StartRound { preserved });
        }));
    }

    /// One pass of "compose and propose". Followers return immediately;
    /// they are driven by the leader's pre-prepare.
    pub fn start_consensus(&self, preserved: &[u8]) -> bool {
        if !self.consensus.is_leader() {
            info!(target: "glue", "round started, not the leader, waiting");
            return true;
        }
        info!(target: "glue", "round started as leader");

        let lcl = self.ledger.last_closed_ledger();

        if !preserved.is_empty() {
            // A view change handed us an already-prepared value; re-propose
            // it untouched if it still checks out.
            if self.check_value_bytes(preserved) == CheckValueResult::Valid {
                info!(
                    target: "glue",
                    "re-proposing preserved value: {}",
                    self.describe_value(preserved)
                );
                return self.consensus.request(preserved);
            }
            info!(target: "glue", "preserved value no longer valid, composing fresh");
        }

        let txs = self.pool.top(self.config.max_trans_per_ledger as usize);
        let now = now_us();
        let close_time = now.max(lcl.close_time + self.config.close_interval_us());
        let previous_proof = self
            .store
            .get(keys::LAST_PROOF)
            .ok()
            .flatten()
            .unwrap_or_default();

        let mut value = ConsensusValue {
            ledger_seq: lcl.seq + 1,
            previous_ledger_hash: lcl.hash,
            previous_proof,
            close_time,
            tx_set: TransactionSet { txs },
            ledger_upgrade: None,
            validation: None,
        };

        // Fold in a quorum-agreed ledger upgrade, if one is pending and
        // sensible.
        let (validator_set, quorum) = self.consensus.validation();
        if let Some(up) = self.upgrade.get_valid(&validator_set, quorum + 1) {
            if lcl.version < up.new_ledger_version && up.new_ledger_version <= LEDGER_VERSION {
                info!(
                    target: "glue",
                    "embedding ledger upgrade to version({})",
                    up.new_ledger_version
                );
                value.ledger_upgrade = Some(up);
            } else {
                error!(
                    target: "glue",
                    "agreed upgrade to version({}) is not proposable at lcl version({})",
                    up.new_ledger_version,
                    lcl.version
                );
            }
        }

        // Speculatively execute; on budget overrun halve the set and retry,
        // drop whatever the oracle rejects.
        loop {
            match self.oracle.pre_process(&value, true) {
                Err(e) => {
                    error!(target: "glue", "pre-execution failed, abandoning round: {}", e);
                    return false;
                }
                Ok(result) => {
                    if result.timeout {
                        let len = value.tx_set.txs.len();
                        if len == 0 {
                            error!(
                                target: "glue",
                                "pre-execution timed out on an empty set, abandoning round"
                            );
                            return false;
                        }
                        info!(
                            target: "glue",
                            "pre-execution timed out, halving the set from {} tx(s)",
                            len
                        );
                        value.tx_set.txs.truncate(len / 2);
                        continue;
                    }

                    if !result.dropped_tx_indices.is_empty() {
                        let mut kept = Vec::new();
                        let mut dropped = Vec::new();
                        for (i, env) in value.tx_set.txs.drain(..).enumerate() {
                            if result.dropped_tx_indices.contains(&i) {
                                dropped.push(env);
                            } else {
                                kept.push(env);
                            }
                        }
                        info!(
                            target: "glue",
                            "pre-execution dropped {} tx(s)",
                            dropped.len()
                        );
                        value.tx_set.txs = kept;
                        self.pool.remove_batch(dropped.iter(), false);
                    }

                    if !result.validation.is_empty() {
                        value.validation = Some(result.validation);
                    }
                    break;
                }
            }
        }

        info!(
            target: "glue",
            "proposing {} tx(s), lcl hash({})",
            value.tx_set.len(),
            short_hex(&lcl.hash)
        );
        self.consensus.request(&codec::to_bytes_canonical(&value))
    }

    /// Structural checks of a consensus value against the current lcl;
    /// `now < 0` skips the close-time window (for the applier-facing path).
    fn check_value_helper(&self, value: &ConsensusValue, now: i64) -> CheckValueResult {
        if value.byte_size() >= TXSET_LIMIT_SIZE + 2 * BYTES_PER_MEGA {
            error!(
                target: "glue",
                "consensus value byte size({}) exceeds the limit",
                value.byte_size()
            );
            return CheckValueResult::MayValid;
        }

        let lcl = self.ledger.last_closed_ledger();

        if value.ledger_seq != lcl.seq + 1 {
            error!(
                target: "glue",
                "value ledger seq({}) != lcl seq({}) + 1",
                value.ledger_seq,
                lcl.seq
            );
            return CheckValueResult::MayValid;
        }

        if value.previous_ledger_hash != lcl.hash {
            error!(
                target: "glue",
                "value previous hash({}) != lcl hash({})",
                short_hex(&value.previous_ledger_hash),
                short_hex(&lcl.hash)
            );
            return CheckValueResult::MayValid;
        }

        // The close time sits in (lcl.close_time + interval, now + 1s].
        if now >= 0
            && !(now > value.close_time - MICRO_UNITS_PER_SEC
                && value.close_time >= lcl.close_time + self.config.close_interval_us())
        {
            warn!(
                target: "glue",
                "close time({}) outside [lcl({}) + interval, now({}) + 1s]",
                value.close_time,
                lcl.close_time,
                now
            );
            return CheckValueResult::MayValid;
        }

        if let Some(upgrade) = &value.ledger_upgrade {
            if upgrade.new_ledger_version != 0 {
                if lcl.version >= upgrade.new_ledger_version {
                    error!(
                        target: "glue",
                        "upgrade version({}) not above lcl version({})",
                        upgrade.new_ledger_version,
                        lcl.version
                    );
                    return CheckValueResult::MayValid;
                }
                if upgrade.new_ledger_version > LEDGER_VERSION {
                    error!(
                        target: "glue",
                        "upgrade version({}) above this build({})",
                        upgrade.new_ledger_version,
                        LEDGER_VERSION
                    );
                    return CheckValueResult::MayValid;
                }
            }

            // A validator replacement may only ride a hard-fork block.
            if !upgrade.new_validators.is_empty() {
                let value_hash =
                    umbra_crypto::digest(self.config.hash_type, &codec::to_bytes_canonical(value));
                if !self.hardfork_points.contains(&value_hash) {
                    error!(
                        target: "glue",
                        "validator change outside a hard-fork point refused"
                    );
                    return CheckValueResult::MayValid;
                }
            }
        }

        // The second ledger has no predecessor certificate.
        if lcl.seq == 1 && !value.previous_proof.is_empty() {
            error!(
                target: "glue",
                "second consensus value must carry an empty previous proof"
            );
            return CheckValueResult::MayValid;
        }

        if lcl.seq > 1 {
            let validators = match self.ledger.get_validators(value.ledger_seq - 2) {
                Some(set) => set,
                None => {
                    error!(
                        target: "glue",
                        "no validator set for ledger seq({})",
                        value.ledger_seq - 2
                    );
                    return CheckValueResult::MayValid;
                }
            };
            let forked = self.hardfork_points.contains(&lcl.consensus_value_hash);
            if !forked
                && !self.consensus.check_proof(
                    &validators,
                    &lcl.consensus_value_hash,
                    &value.previous_proof,
                )
            {
                error!(target: "glue", "previous proof check failed");
                return CheckValueResult::MayValid;
            }
        }

        CheckValueResult::Valid
    }

    fn check_value_bytes(&self, value: &[u8]) -> CheckValueResult {
        let decoded: ConsensusValue = match codec::from_bytes_canonical(value) {
            Ok(v) => v,
            Err(e) => {
                error!(target: "glue", "consensus value decode failed: {}", e);
                return CheckValueResult::MayValid;
            }
        };

        let helper = self.check_value_helper(&decoded, now_us());
        if helper != CheckValueResult::Valid {
            return helper;
        }

        if self.oracle.pre_process(&decoded, false).is_err() {
            error!(target: "glue", "pre-execution of received value failed");
            return CheckValueResult::MayValid;
        }

        CheckValueResult::Valid
    }

    /// Applier-facing validation of a value plus its certificate, used when
    /// replaying blocks from peers.
    pub fn check_value_and_proof(&self, value_bytes: &[u8], proof: &[u8]) -> bool {
        let value: ConsensusValue = match codec::from_bytes_canonical(value_bytes) {
            Ok(v) => v,
            Err(e) => {
                error!(target: "glue", "consensus value decode failed: {}", e);
                return false;
            }
        };

        let validators = match self.ledger.get_validators(value.ledger_seq - 1) {
            Some(set) => set,
            None => {
                error!(
                    target: "glue",
                    "no validator set for ledger seq({})",
                    value.ledger_seq - 1
                );
                return false;
            }
        };

        let value_hash = umbra_crypto::digest(self.config.hash_type, value_bytes);
        let forked = self.hardfork_points.contains(&value_hash);
        self.check_value_helper(&value, -1) == CheckValueResult::Valid
            && (forked || self.consensus.check_proof(&validators, &value_hash, proof))
    }

    /// Admit a transaction from the RPC boundary or the gossip transport.
    /// Gossiped transactions are not re-broadcast here; relaying is the
    /// transport's business on the way in.
    pub fn on_transaction(&self, env: TransactionEnv, from_gossip: bool) -> Result<(), PoolError> {
        let hash = self.pool.content_hash(&env);
        if self.pool.contains(&hash) {
            debug!(
                target: "glue",
                "duplicate transaction, source({}) hash({})",
                env.transaction.source,
                short_hex(&hash)
            );
            return Ok(());
        }

        let size = env.byte_size();
        if size >= TX_LIMIT_SIZE {
            return Err(PoolError::Oversize {
                size,
                limit: TX_LIMIT_SIZE,
            });
        }

        let tx_bytes = codec::to_bytes_canonical(&env.transaction);
        let signed_by_source = env.signatures.iter().any(|sig| {
            umbra_crypto::address_of_public(&sig.public_key) == env.transaction.source
                && umbra_crypto::verify(&sig.public_key, &tx_bytes, &sig.sign_data)
        });
        if !signed_by_source {
            return Err(PoolError::InvalidSignature);
        }

        let fee = self.ledger.get_fee_config();
        if env.transaction.gas_price < fee.gas_price {
            return Err(PoolError::FeeNotEnough {
                required: fee.gas_price,
                got: env.transaction.gas_price,
            });
        }

        let applied = self.ledger.account_nonce(&env.transaction.source);
        if env.transaction.nonce <= applied {
            return Err(PoolError::NonceTooLow {
                last_applied: applied,
                got: env.transaction.nonce,
            });
        }

        trace!(
            target: "glue",
            "admitting transaction source({}) nonce({}) gossip({})",
            env.transaction.source,
            env.transaction.nonce,
            from_gossip
        );
        self.pool.import(env, applied, now_us())
    }

    /// Deliver a consensus envelope (wire or self) to the engine.
    pub fn on_consensus_message(&self, bytes: &[u8]) {
        match ConsensusMsg::from_bytes(bytes, self.config.hash_type) {
            Ok(msg) => {
                self.consensus.on_receive(&msg);
            }
            Err(e) => debug!(target: "glue", "undecodable consensus message: {}", e),
        }
    }

    pub fn on_ledger_upgrade_msg(&self, bytes: &[u8]) {
        match codec::from_bytes_canonical::<LedgerUpgradeNotify>(bytes) {
            Ok(msg) => self.upgrade.recv(&msg, now_us()),
            Err(e) => debug!(target: "glue", "undecodable upgrade notify: {}", e),
        }
    }

    /// Slow-path housekeeping: pool timeouts and upgrade gossip.
    pub fn slow_timer(&self, now: i64) {
        let expired = self.pool.check_timeout(now);
        for tx in &expired {
            info!(
                target: "glue",
                "transaction timed out in the pool, source({}) hash({})",
                tx.source,
                short_hex(&tx.content_hash)
            );
        }

        let is_validator = self.consensus.is_validator();
        let consensus = self.consensus.clone();
        if let Some(notify) =
            self.upgrade
                .on_timer(now, is_validator, move |data| consensus.sign_data(data))
        {
            let bytes = codec::to_bytes_canonical(&notify);
            self.transport
                .broadcast(Topic::LedgerUpgradeNotify, Bytes::from(bytes));
            self.upgrade.recv(&notify, now);
        }
    }

    pub fn module_status(&self) -> serde_json::Value {
        serde_json::json!({
            "name": "glue",
            "transaction_size": self.pool.size(),
            "ledger_upgrade": self.upgrade.module_status(),
        })
    }
}

impl ConsensusNotify for GlueManager {
    fn on_value_committed(&self, seq: i64, value_bytes: &[u8], proof: &[u8]) {
        let value: ConsensusValue = match codec::from_bytes_canonical(value_bytes) {
            Ok(v) => v,
            Err(e) => {
                error!(target: "glue", "committed value does not decode: {}", e);
                return;
            }
        };

        let time_start = now_us();
        if let Err(e) = self.ledger.apply_block(&value, proof) {
            // Fatal for the commit path; the instance will be retried from
            // the certificate by block sync.
            error!(
                target: "glue",
                "applying ledger({}) failed: {}",
                value.ledger_seq,
                e
            );
            return;
        }

        self.pool.remove_batch(value.tx_set.txs.iter(), true);

        let lcl = self.ledger.last_closed_ledger();
        let validators = self
            .ledger
            .get_validators(lcl.seq)
            .unwrap_or_else(|| self.consensus.validation().0);
        self.consensus.update_validators(&validators, proof);

        if value.ledger_upgrade.is_some() {
            self.upgrade.ledger_has_upgrade();
        }

        let time_use = now_us() - time_start;
        let next_timestamp = value.close_time + self.config.close_interval_us();
        let waiting = (next_timestamp - now_us()).max(1);
        if self.consensus.is_leader() {
            self.schedule_start_round(waiting, Vec::new());
            info!(
                target: "glue",
                "closed ledger({}) req seq({}) in {}ms, next round in {}ms",
                lcl.seq,
                seq,
                time_use / 1_000,
                waiting / 1_000
            );
        } else {
            info!(
                target: "glue",
                "closed ledger({}) req seq({}) in {}ms, awaiting the next round",
                lcl.seq,
                seq,
                time_use / 1_000
            );
        }

        self.start_ledger_close_timer();
    }

    fn on_view_changed(&self, last_value: &[u8]) {
        info!(target: "glue", "view changed, restarting the round");
        self.start_consensus(last_value);
        self.start_ledger_close_timer();
    }

    fn check_value(&self, value: &[u8]) -> CheckValueResult {
        self.check_value_bytes(value)
    }

    fn send_message(&self, message: &[u8]) {
        self.transport
            .broadcast(Topic::Pbft, Bytes::copy_from_slice(message));
        // Self-delivery goes through the main context so the engine is
        // never re-entered from under its own lock.
        if self
            .main_tx
            .send(MainEvent::ConsensusMessage(message.to_vec()))
            .is_err()
        {
            warn!(target: "glue", "main context gone, self-delivery dropped");
        }
    }

    fn reset_close_timer(&self) {
        self.start_ledger_close_timer();
    }

    fn describe_value(&self, value: &[u8]) -> String {
        match codec::from_bytes_canonical::<ConsensusValue>(value) {
            Ok(v) => format!(
                "value hash({}) | close time({}) | lcl hash({}) | ledger seq({})",
                short_hex(&umbra_crypto::digest(self.config.hash_type, value)),
                v.close_time,
                short_hex(&v.previous_ledger_hash),
                v.ledger_seq
            ),
            Err(_) => "value(undecodable)".to_string(),
        }
    }
}
