//! Assembly of the consensus core: one [`Core`] owns the engine, the pool
//! and the glue, and receives its collaborators as trait objects.
//!
//! A single main-context task serializes the round timer, consensus message
//! handling and block application; a 500 ms tick drives engine
//! retransmissions and a 1 s slow tick drives pool timeouts and upgrade
//! gossip.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use umbra_api::{ConsensusNotify, GossipTransport, KvStore, LedgerApplier, PreExecOracle, Topic};
use umbra_consensus::{now_us, Consensus};
use umbra_crypto::NodeKeypair;
use umbra_pool::TxPool;
use umbra_types::app::{TransactionEnv, ValidatorSet};
use umbra_types::codec;
use umbra_types::config::NodeConfig;
use umbra_types::error::PoolError;
use umbra_types::keys;

use crate::glue::{GlueManager, MainEvent};

const ENGINE_TICK: Duration = Duration::from_millis(500);
const SLOW_TICK: Duration = Duration::from_secs(1);

pub struct Core {
    pub config: NodeConfig,
    pub pool: Arc<TxPool>,
    pub consensus: Arc<Consensus>,
    pub glue: Arc<GlueManager>,
    ledger: Arc<dyn LedgerApplier>,
    store: Arc<dyn KvStore>,
    main_tx: mpsc::UnboundedSender<MainEvent>,
    main_rx: Mutex<Option<UnboundedReceiver<MainEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // The glue must outlive the engine's weak notify handle.
    _notify: Arc<dyn ConsensusNotify>,
}

impl Core {
    pub fn new(
        config: NodeConfig,
        keypair: NodeKeypair,
        transport: Arc<dyn GossipTransport>,
        store: Arc<dyn KvStore>,
        ledger: Arc<dyn LedgerApplier>,
        oracle: Arc<dyn PreExecOracle>,
    ) -> Arc<Core> {
        let (main_tx, main_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(TxPool::new(
            config.ledger.queue_limit as usize,
            config.ledger.queue_per_account_txs_limit as usize,
            config.ledger.tx_timeout_us(),
            config.ledger.hash_type,
        ));
        let consensus = Arc::new(Consensus::new(&config.ledger, keypair, store.clone()));
        let glue = Arc::new(GlueManager::new(
            config.ledger.clone(),
            pool.clone(),
            consensus.clone(),
            ledger.clone(),
            oracle,
            transport,
            store.clone(),
            main_tx.clone(),
        ));

        let notify: Arc<dyn ConsensusNotify> = glue.clone();
        consensus.set_notify(&notify);

        Arc::new(Core {
            config,
            pool,
            consensus,
            glue,
            ledger,
            store,
            main_tx,
            main_rx: Mutex::new(Some(main_rx)),
            tasks: Mutex::new(Vec::new()),
            _notify: notify,
        })
    }

    /// Resume persisted state, adopt the boot validator set and start the
    /// main context.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.consensus
            .initialize()
            .map_err(|e| anyhow::anyhow!("consensus initialize failed: {e}"))?;

        let lcl = self.ledger.last_closed_ledger();
        let validators = self
            .ledger
            .get_validators(lcl.seq)
            .unwrap_or_else(|| {
                ValidatorSet::from_addresses(
                    self.config.genesis.validators.iter().map(|a| a.as_str()),
                )
            });
        anyhow::ensure!(!validators.is_empty(), "no validators configured");

        let proof = self
            .store
            .get(keys::LAST_PROOF)
            .map_err(|e| anyhow::anyhow!("reading last proof failed: {e}"))?
            .unwrap_or_default();
        self.consensus.update_validators(&validators, &proof);

        self.glue.initialize();

        let rx = self
            .main_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("core already started"))?;
        let core = self.clone();
        let main_loop = tokio::spawn(async move { core.run_main_loop(rx).await });
        self.tasks.lock().push(main_loop);

        info!(
            target: "glue",
            "core started, lcl seq({}) validators({})",
            lcl.seq,
            validators.len()
        );
        Ok(())
    }

    async fn run_main_loop(self: Arc<Self>, mut rx: UnboundedReceiver<MainEvent>) {
        let mut engine_tick = tokio::time::interval(ENGINE_TICK);
        engine_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut slow_tick = tokio::time::interval(SLOW_TICK);
        slow_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = engine_tick.tick() => self.consensus.on_timer(now_us()),
                _ = slow_tick.tick() => self.glue.slow_timer(now_us()),
            }
        }
        debug!(target: "glue", "main context drained");
    }

    fn handle_event(&self, event: MainEvent) {
        match event {
            MainEvent::StartRound { preserved } => {
                self.glue.start_consensus(&preserved);
            }
            MainEvent::ConsensusMessage(bytes) => self.glue.on_consensus_message(&bytes),
            MainEvent::Transaction { env, from_gossip } => {
                if let Err(e) = self.glue.on_transaction(env, from_gossip) {
                    debug!(target: "glue", "transaction refused: {}", e);
                }
            }
            MainEvent::CloseTimeout => self.consensus.on_tx_timeout(),
        }
    }

    /// Entry point for the gossip transport's delivery callback.
    pub fn deliver(&self, topic: Topic, payload: &[u8]) {
        match topic {
            Topic::Transaction => match codec::from_bytes_canonical::<TransactionEnv>(payload) {
                Ok(env) => {
                    let _ = self.main_tx.send(MainEvent::Transaction {
                        env,
                        from_gossip: true,
                    });
                }
                Err(e) => debug!(target: "glue", "undecodable gossiped transaction: {}", e),
            },
            Topic::Pbft => {
                let _ = self
                    .main_tx
                    .send(MainEvent::ConsensusMessage(payload.to_vec()));
            }
            Topic::LedgerUpgradeNotify => self.glue.on_ledger_upgrade_msg(payload),
            Topic::Ledgers => {
                // Block sync is answered by the ledger module.
                trace!(target: "glue", "ledger sync payload ignored by the core");
            }
        }
    }

    /// Entry point for the RPC boundary.
    pub fn submit_transaction(&self, env: TransactionEnv) -> Result<(), PoolError> {
        self.glue.on_transaction(env, false)
    }

    pub fn module_status(&self) -> serde_json::Value {
        serde_json::json!({
            "consensus": self.consensus.module_status(),
            "pool": self.pool.module_status(),
            "glue": self.glue.module_status(),
        })
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
