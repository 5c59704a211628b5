//! The PBFT agreement engine: ordered agreement on an opaque value per
//! sequence number, with view change.
//!
//! The engine owns all instance state and is driven from outside by
//! `request`, `on_receive`, `on_timer` and `update_validators`. It never
//! calls back into the node directly; side effects are queued as
//! [`ConsensusEvent`]s the wrapper dispatches once the engine lock is
//! released.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, trace, warn};
use umbra_api::CheckValueResult;
use umbra_types::app::{short_hex, ValidatorSet, ZERO_HASH};
use umbra_types::codec;
use umbra_types::config::LedgerConfig;
use umbra_types::error::ConsensusError;
use umbra_types::general::MICRO_UNITS_PER_SEC;
use umbra_types::keys;

use crate::instance::{
    message_slot, InstanceIndex, NewViewWait, PbftInstance, PbftPhase, PbftVcInstance,
};
use crate::message::{
    ConsensusMsg, Pbft as PbftPayload, PbftCommit, PbftEnv, PbftMessage, PbftNewView,
    PbftPrePrepare, PbftPrepare, PbftPreparedSet, PbftViewChange, PbftViewChangeRaw,
};
use crate::persist::{load_value, ValueSaver, VcInstanceRecord};
use crate::proof::{check_proof, fault_count, quorum_size, PbftProof};
use crate::{ConsensusBase, ConsensusEvent};

/// How long a non-primary waits for a NewView after seeing a view-change
/// quorum before escalating to the next view.
pub const NEW_VIEW_RESPOND_TIMEOUT_US: i64 = 30 * MICRO_UNITS_PER_SEC;

/// View-change instances older than this many views behind are purged.
const VC_INSTANCE_KEEP_VIEWS: i64 = 5;

pub struct PbftEngine {
    pub(crate) base: ConsensusBase,
    view_number: i64,
    last_exe_seq: i64,
    ckp_interval: i64,
    fault_number: usize,
    view_active: bool,
    instances: BTreeMap<InstanceIndex, PbftInstance>,
    vc_instances: BTreeMap<i64, PbftVcInstance>,
    /// Out-of-band commit tracking for sequences beyond the water mark,
    /// keyed like normal instances; only used to detect having fallen a full
    /// checkpoint behind.
    out_instances: BTreeMap<InstanceIndex, PbftInstance>,
    new_view_wait: Option<NewViewWait>,
    instance_timeout: i64,
    commit_send_interval: i64,
    new_view_send_interval: i64,
    view_change_timeout: i64,
    events: Vec<ConsensusEvent>,
}

impl PbftEngine {
    pub fn new(base: ConsensusBase, cfg: &LedgerConfig) -> Self {
        PbftEngine {
            base,
            view_number: 0,
            last_exe_seq: 1,
            ckp_interval: cfg.ckp_interval,
            fault_number: 0,
            view_active: true,
            instances: BTreeMap::new(),
            vc_instances: BTreeMap::new(),
            out_instances: BTreeMap::new(),
            new_view_wait: None,
            instance_timeout: cfg.instance_timeout_us(),
            commit_send_interval: cfg.commit_send_interval_us(),
            new_view_send_interval: cfg.new_view_send_interval_us(),
            view_change_timeout: cfg.view_change_timeout_us(),
            events: Vec::new(),
        }
    }

    /// Resume persisted view state from the store.
    pub fn initialize(&mut self) -> Result<(), ConsensusError> {
        let store = self.base.store.clone();
        if let Some(active) = load_value::<u8>(store.as_ref(), keys::CONSENSUS_VIEW_ACTIVE)? {
            self.view_active = active > 0;
        }
        if let Some(view) = load_value::<i64>(store.as_ref(), keys::CONSENSUS_VIEW_NUMBER)? {
            self.view_number = view;
        }
        if let Some(seq) = load_value::<i64>(store.as_ref(), keys::CONSENSUS_LAST_EXE_SEQ)? {
            self.last_exe_seq = seq;
        }
        if let Some(set) = load_value::<ValidatorSet>(store.as_ref(), keys::CONSENSUS_VALIDATORS)? {
            self.base.update_validators(&set);
            self.fault_number = fault_count(set.len());
        }
        match load_value::<Vec<VcInstanceRecord>>(store.as_ref(), keys::CONSENSUS_VIEW_CHANGE)? {
            None => info!(target: "consensus", "no persisted view-change instances"),
            Some(records) => {
                for record in records {
                    let instance = record.into_instance();
                    self.vc_instances.insert(instance.view_number, instance);
                }
            }
        }
        info!(
            target: "consensus",
            "pbft resumed: view({}) active({}) last_exe_seq({}) vc_instances({})",
            self.view_number,
            self.view_active,
            self.last_exe_seq,
            self.vc_instances.len()
        );
        Ok(())
    }

    pub fn view_number(&self) -> i64 {
        self.view_number
    }

    pub fn last_exe_seq(&self) -> i64 {
        self.last_exe_seq
    }

    pub fn quorum_size(&self) -> usize {
        quorum_size(self.base.validators.len())
    }

    pub fn is_leader(&self) -> bool {
        let n = self.base.validators.len() as i64;
        self.base.is_validator && n > 0 && self.view_number % n == self.base.replica_id
    }

    pub fn take_events(&mut self) -> Vec<ConsensusEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, event: ConsensusEvent) {
        self.events.push(event);
    }

    fn in_water_mark(&self, seq: i64) -> bool {
        seq >= self.last_exe_seq && seq <= self.last_exe_seq + self.ckp_interval
    }

    fn validator_count(&self) -> i64 {
        self.base.validators.len() as i64
    }

    // --- envelope builders -------------------------------------------------

    fn sign_env(&self, payload: PbftPayload) -> PbftEnv {
        let signature = self.base.keypair.sign(&codec::to_bytes_canonical(&payload));
        PbftEnv {
            pbft: payload,
            signature,
        }
    }

    fn new_pre_prepare(&self, value: &[u8], sequence: i64) -> PbftEnv {
        self.sign_env(PbftPayload {
            round_number: 1,
            message: PbftMessage::PrePrepare(PbftPrePrepare {
                view_number: self.view_number,
                sequence,
                replica_id: self.base.replica_id,
                value: value.to_vec(),
                value_digest: umbra_crypto::digest(self.base.hash_kind, value),
            }),
        })
    }

    fn new_prepare(&self, pre_prepare: &PbftPrePrepare, round_number: u32) -> PbftEnv {
        self.sign_env(PbftPayload {
            round_number,
            message: PbftMessage::Prepare(PbftPrepare {
                view_number: pre_prepare.view_number,
                sequence: pre_prepare.sequence,
                replica_id: self.base.replica_id,
                value_digest: pre_prepare.value_digest,
            }),
        })
    }

    fn new_commit(&self, prepare: &PbftPrepare, round_number: u32) -> PbftEnv {
        self.sign_env(PbftPayload {
            round_number,
            message: PbftMessage::Commit(PbftCommit {
                view_number: prepare.view_number,
                sequence: prepare.sequence,
                replica_id: self.base.replica_id,
                value_digest: prepare.value_digest,
            }),
        })
    }

    /// Build our bundled view change for `view_number`, carrying either the
    /// supplied prepared set or the highest-sequence one we prepared locally.
    fn new_view_change_raw(
        &self,
        view_number: i64,
        prepared_set: Option<PbftPreparedSet>,
    ) -> PbftEnv {
        let prepared_set = prepared_set.or_else(|| {
            self.instances
                .iter()
                .rev()
                .find(|(index, instance)| {
                    index.sequence > self.last_exe_seq && instance.phase == PbftPhase::Prepared
                })
                .and_then(|(_, instance)| instance.prepared_set())
        });

        let prepared_value_digest = prepared_set
            .as_ref()
            .map(|set| match &set.pre_prepare.pbft.message {
                PbftMessage::PrePrepare(pp) => pp.value_digest,
                _ => ZERO_HASH,
            })
            .unwrap_or(ZERO_HASH);

        let inner = self.sign_env(PbftPayload {
            round_number: 0,
            message: PbftMessage::ViewChange(PbftViewChange {
                view_number,
                sequence: self.last_exe_seq,
                replica_id: self.base.replica_id,
                prepared_value_digest,
            }),
        });

        self.sign_env(PbftPayload {
            round_number: 0,
            message: PbftMessage::ViewChangeWithRawValue(PbftViewChangeRaw {
                view_change_env: Box::new(inner),
                prepared_set,
            }),
        })
    }

    fn new_new_view(&self, vc_instance: &PbftVcInstance) -> PbftEnv {
        let view_changes = vc_instance
            .msg_buf
            .iter()
            .filter_map(|env| match &env.pbft.message {
                PbftMessage::ViewChangeWithRawValue(raw) => {
                    Some(raw.view_change_env.as_ref().clone())
                }
                _ => None,
            })
            .collect();
        let pre_prepare = vc_instance
            .prepared_set
            .as_ref()
            .map(|set| set.pre_prepare.clone());

        self.sign_env(PbftPayload {
            round_number: 0,
            message: PbftMessage::NewView(PbftNewView {
                view_number: vc_instance.view_number,
                sequence: vc_instance.sequence,
                replica_id: self.base.replica_id,
                view_changes,
                pre_prepare,
            }),
        })
    }

    /// Re-sign a message with a bumped retransmission round.
    fn inc_message_round(&self, message: &PbftEnv, round_number: u32) -> PbftEnv {
        let mut payload = message.pbft.clone();
        payload.round_number = round_number;
        self.sign_env(payload)
    }

    fn send_env(&mut self, env: &PbftEnv) {
        if !self.base.is_validator {
            return;
        }
        self.emit(ConsensusEvent::SendMessage(codec::to_bytes_canonical(env)));
    }

    // --- leader request ----------------------------------------------------

    /// Leader-only: propose `value` for the next sequence.
    pub fn request(&mut self, value: &[u8], now: i64) -> bool {
        let n = self.validator_count();
        if n == 0 || self.view_number % n != self.base.replica_id {
            return false;
        }

        if !self.view_active {
            info!(
                target: "consensus",
                "view({}) is not active, request refused",
                self.view_number
            );
            return false;
        }

        // Delete the leftover uncommitted logs before proposing.
        let last_exe_seq = self.last_exe_seq;
        self.instances.retain(|index, instance| {
            let drop = index.sequence > last_exe_seq && instance.phase < PbftPhase::Committed;
            if drop {
                info!(
                    target: "consensus",
                    "before request, erasing uncommitted instance seq({})",
                    index.sequence
                );
            }
            !drop
        });

        let sequence = self.last_exe_seq + 1;
        let env = self.new_pre_prepare(value, sequence);
        let index = InstanceIndex::new(self.view_number, sequence);

        let mut instance = PbftInstance::new(now);
        instance.phase = PbftPhase::PrePrepared;
        if let PbftMessage::PrePrepare(pp) = &env.pbft.message {
            instance.pre_prepare = pp.clone();
        }
        instance.pre_prepare_msg = Some(env.clone());
        if let Some(slot) = instance.msg_buf.get_mut(0) {
            slot.push(env.clone());
        }
        self.instances.insert(index, instance);

        info!(
            target: "consensus",
            "sending pre-prepare, view({}) seq({}) digest({})",
            self.view_number,
            sequence,
            short_hex(&umbra_crypto::digest(self.base.hash_kind, value))
        );
        self.send_env(&env);
        true
    }

    // --- receive path ------------------------------------------------------

    /// Handle a validated consensus message. `check_value` is the glue's
    /// verdict on the embedded value, `Valid` for message types that carry
    /// none.
    pub fn on_receive(
        &mut self,
        msg: &ConsensusMsg,
        check_value: CheckValueResult,
        now: i64,
    ) -> bool {
        if let Err(e) = msg.check(&self.base.validator_map, self.base.hash_kind) {
            debug!(
                target: "consensus",
                "dropping consensus message from {}: {}",
                msg.node_address(),
                e
            );
            return false;
        }

        match &msg.env().pbft.message {
            PbftMessage::PrePrepare(_) | PbftMessage::Prepare(_) | PbftMessage::Commit(_) => {
                match self.create_instance_if_not_exist(msg.env(), now) {
                    Some(index) => self.instance_go(index, msg.env().clone(), check_value, now),
                    None => false,
                }
            }
            PbftMessage::ViewChangeWithRawValue(_) => self.on_view_change_raw(msg.env(), now),
            PbftMessage::NewView(_) => self.on_new_view(msg.env(), now),
            PbftMessage::ViewChange(_) => {
                trace!(target: "consensus", "bare view-change message ignored");
                false
            }
        }
    }

    /// Advance an instance: out-of-phase duplicates are re-processed
    /// directly, everything else drains the buffer slot of the current phase
    /// so that messages delivered early are consumed as soon as the phase
    /// catches up.
    fn instance_go(
        &mut self,
        index: InstanceIndex,
        env: PbftEnv,
        check_value: CheckValueResult,
        now: i64,
    ) -> bool {
        let phase = match self.instances.get(&index) {
            Some(instance) => instance.phase,
            None => return false,
        };

        let arrived_slot = message_slot(&env.pbft.message);
        let current_slot = phase.buffer_slot();
        if let (Some(arrived), Some(current)) = (arrived_slot, current_slot) {
            if arrived < current {
                // Received again, behind the current phase.
                return self.dispatch_phase_message(index, &env, check_value, now);
            }
        } else if arrived_slot.is_some() && current_slot.is_none() {
            // Committed already; late duplicates still update counters.
            return self.dispatch_phase_message(index, &env, check_value, now);
        }

        let mut doret = false;
        loop {
            let next = {
                let instance = match self.instances.get_mut(&index) {
                    Some(instance) => instance,
                    None => break,
                };
                let slot = match instance.phase.buffer_slot() {
                    Some(slot) => slot,
                    None => break,
                };
                let buffered = instance.msg_buf.get(slot).map(|b| b.len()).unwrap_or(0);
                if buffered <= instance.phase_item {
                    break;
                }
                let item = instance
                    .msg_buf
                    .get(slot)
                    .and_then(|b| b.get(instance.phase_item))
                    .cloned();
                instance.phase_item += 1;
                item
            };
            match next {
                Some(buffered_env) => {
                    doret = self.dispatch_phase_message(index, &buffered_env, check_value, now);
                }
                None => break,
            }
        }
        doret
    }

    fn dispatch_phase_message(
        &mut self,
        index: InstanceIndex,
        env: &PbftEnv,
        check_value: CheckValueResult,
        now: i64,
    ) -> bool {
        let round_number = env.pbft.round_number;
        match &env.pbft.message {
            PbftMessage::PrePrepare(pp) => {
                self.on_pre_prepare(index, pp.clone(), round_number, check_value, now)
            }
            PbftMessage::Prepare(p) => self.on_prepare(index, p.clone(), round_number, now),
            PbftMessage::Commit(c) => self.on_commit(index, c.clone(), round_number, now),
            _ => false,
        }
    }

    fn on_pre_prepare(
        &mut self,
        index: InstanceIndex,
        pre_prepare: PbftPrePrepare,
        round_number: u32,
        check_value: CheckValueResult,
        _now: i64,
    ) -> bool {
        // The leader drives its own instance through `request`; with a
        // single node it still processes its own broadcast.
        let n = self.validator_count();
        if n > 1 && self.view_number % n == self.base.replica_id {
            return false;
        }

        let digest = umbra_crypto::digest(self.base.hash_kind, &pre_prepare.value);
        if pre_prepare.value_digest != digest {
            error!(
                target: "consensus",
                "pre-prepare digest({}) does not hash the value({}), seq({})",
                short_hex(&pre_prepare.value_digest),
                short_hex(&digest),
                pre_prepare.sequence
            );
            return false;
        }

        if check_value == CheckValueResult::Invalid {
            error!(
                target: "consensus",
                "pre-prepare value rejected, view({}) seq({})",
                pre_prepare.view_number,
                pre_prepare.sequence
            );
            return false;
        }

        let instance = match self.instances.get_mut(&index) {
            Some(instance) => instance,
            None => return false,
        };

        if instance.phase != PbftPhase::None {
            // Duplicate pre-prepare: answer with a fresh prepare but do not
            // change state.
            if instance.pre_prepare.value != pre_prepare.value {
                error!(
                    target: "consensus",
                    "duplicate pre-prepare carries a different value, view({}) seq({})",
                    pre_prepare.view_number,
                    pre_prepare.sequence
                );
                return false;
            }
            info!(
                target: "consensus",
                "duplicate pre-prepare, view({}) seq({}) round({})",
                pre_prepare.view_number,
                pre_prepare.sequence,
                round_number
            );
            if instance.check_value_result != CheckValueResult::Valid {
                return true;
            }
            let prepare = self.new_prepare(&pre_prepare, round_number);
            self.send_env(&prepare);
            return true;
        }

        info!(
            target: "consensus",
            "received pre-prepare from replica({}), view({}) seq({}) round({})",
            pre_prepare.replica_id,
            pre_prepare.view_number,
            pre_prepare.sequence,
            round_number
        );

        instance.phase = PbftPhase::PrePrepared;
        instance.phase_item = 0;
        instance.pre_prepare = pre_prepare.clone();
        instance.check_value_result = check_value;

        if check_value != CheckValueResult::Valid {
            info!(
                target: "consensus",
                "not sending prepare, view({}) seq({}): value not confirmed valid",
                pre_prepare.view_number,
                pre_prepare.sequence
            );
            return true;
        }

        let prepare = self.new_prepare(&pre_prepare, 1);
        info!(
            target: "consensus",
            "sending prepare, view({}) seq({}) replica({})",
            pre_prepare.view_number,
            pre_prepare.sequence,
            self.base.replica_id
        );
        self.send_env(&prepare);
        true
    }

    fn on_prepare(
        &mut self,
        index: InstanceIndex,
        prepare: PbftPrepare,
        round_number: u32,
        now: i64,
    ) -> bool {
        let quorum = self.quorum_size();
        let instance = match self.instances.get_mut(&index) {
            Some(instance) => instance,
            None => return false,
        };

        if instance.pre_prepare.value_digest != prepare.value_digest {
            error!(
                target: "consensus",
                "prepare digest({}) != pre-prepare digest({}), view({}) seq({})",
                short_hex(&prepare.value_digest),
                short_hex(&instance.pre_prepare.value_digest),
                prepare.view_number,
                prepare.sequence
            );
            return false;
        }

        let exist = instance.prepares.contains_key(&prepare.replica_id);
        if exist {
            info!(
                target: "consensus",
                "duplicate prepare from replica({}), view({}) seq({})",
                prepare.replica_id,
                prepare.view_number,
                prepare.sequence
            );
        } else {
            info!(
                target: "consensus",
                "received prepare from replica({}), view({}) seq({}) round({})",
                prepare.replica_id,
                prepare.view_number,
                prepare.sequence,
                round_number
            );
        }
        instance.prepares.insert(prepare.replica_id, prepare.clone());

        if instance.prepares.len() >= quorum {
            if instance.phase < PbftPhase::Prepared {
                instance.phase = PbftPhase::Prepared;
                instance.phase_item = 0;
            }

            if instance.check_value_result == CheckValueResult::Valid {
                instance.set_last_commit_send_time(now);
                info!(
                    target: "consensus",
                    "sending commit{}, view({}) seq({}) round({})",
                    if exist { " again" } else { "" },
                    prepare.view_number,
                    prepare.sequence,
                    round_number
                );
                let commit = self.new_commit(&prepare, round_number);
                self.send_env(&commit);
            } else {
                info!(
                    target: "consensus",
                    "prepared but not committing, view({}) seq({}): value not confirmed valid",
                    prepare.view_number,
                    prepare.sequence
                );
            }
        }
        true
    }

    fn on_commit(
        &mut self,
        index: InstanceIndex,
        commit: PbftCommit,
        round_number: u32,
        now: i64,
    ) -> bool {
        let commit_quorum = self.quorum_size() + 1;
        let instance = match self.instances.get_mut(&index) {
            Some(instance) => instance,
            None => return false,
        };

        if instance.pre_prepare.value_digest != commit.value_digest {
            error!(
                target: "consensus",
                "commit digest({}) != pre-prepare digest({}), view({}) seq({})",
                short_hex(&commit.value_digest),
                short_hex(&instance.pre_prepare.value_digest),
                commit.view_number,
                commit.sequence
            );
            return false;
        }

        if instance.commits.contains_key(&commit.replica_id) {
            info!(
                target: "consensus",
                "duplicate commit from replica({}), view({}) seq({})",
                commit.replica_id,
                commit.view_number,
                commit.sequence
            );
            return true;
        }

        info!(
            target: "consensus",
            "received commit from replica({}), view({}) seq({}) round({})",
            commit.replica_id,
            commit.view_number,
            commit.sequence,
            round_number
        );
        instance.commits.insert(commit.replica_id, commit.clone());

        if instance.commits.len() >= commit_quorum && instance.phase < PbftPhase::Committed {
            instance.phase = PbftPhase::Committed;
            instance.phase_item = 0;
            instance.end_time = now;
            info!(
                target: "consensus",
                "request committed, view({}) seq({}), executing",
                commit.view_number,
                commit.sequence
            );
            return self.try_execute_value();
        }
        true
    }

    /// Execute committed instances strictly in sequence order, packing the
    /// commit certificate from the buffered commit envelopes (one per
    /// distinct signer).
    fn try_execute_value(&mut self) -> bool {
        loop {
            let target = self.last_exe_seq + 1;
            let found = self
                .instances
                .iter()
                .find(|(index, instance)| {
                    index.sequence == target && instance.phase >= PbftPhase::Committed
                })
                .map(|(index, instance)| {
                    (
                        *index,
                        instance.pre_prepare.value.clone(),
                        instance
                            .msg_buf
                            .get(2)
                            .cloned()
                            .unwrap_or_default(),
                    )
                });

            let (index, value, commit_envs) = match found {
                Some(hit) => hit,
                None => break,
            };

            self.last_exe_seq = target;

            let mut proof = PbftProof::default();
            let mut commit_signers = BTreeSet::new();
            for env in commit_envs {
                if commit_signers.insert(env.signature.public_key.clone()) {
                    proof.commits.push(env);
                }
            }

            self.emit(ConsensusEvent::ValueCommitted {
                seq: index.sequence,
                value,
                proof: codec::to_bytes_canonical(&proof),
            });

            // Drop instances behind the checkpoint midpoint.
            let keep_after = index.sequence - self.ckp_interval / 2;
            self.instances
                .retain(|idx, _| idx.sequence > keep_after);
        }
        true
    }

    fn create_instance_if_not_exist(
        &mut self,
        env: &PbftEnv,
        now: i64,
    ) -> Option<InstanceIndex> {
        let (view_number, sequence) = match &env.pbft.message {
            PbftMessage::PrePrepare(m) => (m.view_number, m.sequence),
            PbftMessage::Prepare(m) => (m.view_number, m.sequence),
            PbftMessage::Commit(m) => (m.view_number, m.sequence),
            _ => return None,
        };

        let in_water = self.in_water_mark(sequence);
        let same_view = view_number == self.view_number;
        if !in_water || !same_view {
            if !in_water {
                trace!(
                    target: "consensus",
                    "message({}) seq({}) outside water mark [{}, {}]",
                    env.message_type_name(),
                    sequence,
                    self.last_exe_seq,
                    self.last_exe_seq + self.ckp_interval
                );
            }
            if !same_view {
                trace!(
                    target: "consensus",
                    "message({}) view({}) != current view({})",
                    env.message_type_name(),
                    view_number,
                    self.view_number
                );
            }
            if sequence > self.last_exe_seq {
                if let PbftMessage::Commit(_) = env.pbft.message {
                    self.trace_out_commit(env, now);
                }
            }
            return None;
        }

        if !self.view_active {
            info!(
                target: "consensus",
                "message({}) seq({}) not processed, view({}) inactive",
                env.message_type_name(),
                sequence,
                self.view_number
            );
            return None;
        }

        if sequence <= self.last_exe_seq {
            trace!(
                target: "consensus",
                "sequence({}) <= last executed({}), instance not created",
                sequence,
                self.last_exe_seq
            );
            return None;
        }

        let index = InstanceIndex::new(view_number, sequence);
        if !self.instances.contains_key(&index) {
            info!(
                target: "consensus",
                "creating pbft instance view({}) seq({})",
                view_number,
                sequence
            );
            self.instances.insert(index, PbftInstance::new(now));

            // Drop the same sequence left over from older views.
            self.instances.retain(|idx, _| {
                !(idx.view_number < view_number && idx.sequence == sequence)
            });
        }

        if let Some(instance) = self.instances.get_mut(&index) {
            if let Some(slot) = message_slot(&env.pbft.message) {
                if let Some(buffer) = instance.msg_buf.get_mut(slot) {
                    buffer.push(env.clone());
                }
            }
        }
        Some(index)
    }

    // --- catch-up ----------------------------------------------------------

    fn trace_out_commit(&mut self, env: &PbftEnv, now: i64) -> bool {
        let commit = match &env.pbft.message {
            PbftMessage::Commit(c) => c.clone(),
            _ => return false,
        };
        let index = InstanceIndex::new(commit.view_number, commit.sequence);

        if self.instances.contains_key(&index) {
            info!(
                target: "consensus",
                "trace-out commit hits a live instance, replica({}) view({}) seq({})",
                commit.replica_id,
                commit.view_number,
                commit.sequence
            );
            return self.on_commit(index, commit, env.pbft.round_number, now);
        }

        let instance = self
            .out_instances
            .entry(index)
            .or_insert_with(|| {
                let mut fresh = PbftInstance::new(now);
                fresh.pre_prepare.value_digest = commit.value_digest;
                fresh
            });

        if instance.pre_prepare.value_digest != commit.value_digest {
            error!(
                target: "consensus",
                "trace-out commit digest mismatch, view({}) seq({})",
                commit.view_number,
                commit.sequence
            );
            return false;
        }

        info!(
            target: "consensus",
            "trace-out commit from replica({}), view({}) seq({}) round({})",
            commit.replica_id,
            commit.view_number,
            commit.sequence,
            env.pbft.round_number
        );
        instance.commits.insert(commit.replica_id, commit);
        self.try_do_trace_out(index);
        true
    }

    /// A full checkpoint of matching out-of-band commits means the network
    /// moved on without us: jump the water mark and resume at the reported
    /// view.
    fn try_do_trace_out(&mut self, index: InstanceIndex) {
        let commit_count = match self.out_instances.get(&index) {
            Some(instance) => instance.commits.len(),
            None => return,
        };
        if commit_count < self.quorum_size() + 1 {
            return;
        }

        info!(
            target: "consensus",
            "trace-out committed, view({}) seq({})",
            index.view_number,
            index.sequence
        );
        if index.sequence - self.last_exe_seq < self.ckp_interval {
            return;
        }

        info!(
            target: "consensus",
            "trace-out seq({}) a full checkpoint past last executed({}), moving water mark",
            index.sequence,
            self.last_exe_seq
        );
        self.view_active = true;
        self.view_number = index.view_number;
        self.last_exe_seq = index.sequence;

        let mut saver = ValueSaver::new(self.base.store.clone());
        saver.save_value(keys::CONSENSUS_VIEW_ACTIVE, &1u8);
        saver.save_value(keys::CONSENSUS_VIEW_NUMBER, &self.view_number);
        saver.save_value(keys::CONSENSUS_LAST_EXE_SEQ, &self.last_exe_seq);

        // Clear view-change instances that still carry our pending vote.
        self.vc_instances
            .retain(|_, instance| instance.view_change_msg.is_none());
        self.save_view_change(&mut saver);

        let last_exe_seq = self.last_exe_seq;
        self.instances.retain(|idx, _| idx.sequence > last_exe_seq);
        self.out_instances.clear();

        if let Err(e) = saver.commit() {
            error!(target: "consensus", "persisting trace-out jump failed: {}", e);
        }
        self.emit(ConsensusEvent::ResetCloseTimer);
    }

    // --- view change -------------------------------------------------------

    fn on_view_change_raw(&mut self, env: &PbftEnv, now: i64) -> bool {
        let raw = match &env.pbft.message {
            PbftMessage::ViewChangeWithRawValue(raw) => raw.clone(),
            _ => return false,
        };
        let vote = match &raw.view_change_env.pbft.message {
            PbftMessage::ViewChange(vc) => vc.clone(),
            _ => return false,
        };

        info!(
            target: "consensus",
            "received view change from replica({}), target view({}) round({})",
            vote.replica_id,
            vote.view_number,
            env.pbft.round_number
        );
        if vote.view_number == self.view_number {
            info!(
                target: "consensus",
                "target view({}) equals the current view, nothing to do",
                vote.view_number
            );
            return true;
        }
        if vote.view_number < self.view_number {
            info!(
                target: "consensus",
                "target view({}) below the current view({}), nothing to do",
                vote.view_number,
                self.view_number
            );
            return true;
        }

        let mut saver = ValueSaver::new(self.base.store.clone());
        let replica_id = self.base.replica_id;
        let last_exe_seq = self.last_exe_seq;
        let fault_number = self.fault_number;

        let quorum_reached = {
            let vc_instance = self
                .vc_instances
                .entry(vote.view_number)
                .or_insert_with(|| {
                    let mut fresh = PbftVcInstance::new(vote.view_number, now);
                    fresh.sequence = vote.sequence;
                    fresh
                });

            // Keep our own vote for retransmission.
            if vote.replica_id == replica_id && vc_instance.view_change_msg.is_none() {
                vc_instance.view_change_msg = Some(env.clone());
            }

            if !vc_instance.viewchanges.contains_key(&vote.replica_id) {
                vc_instance.msg_buf.push(env.clone());
                vc_instance.viewchanges.insert(vote.replica_id, vote.clone());
            }

            if let Some(set) = &raw.prepared_set {
                let msg_seq = match &set.pre_prepare.pbft.message {
                    PbftMessage::PrePrepare(pp) => pp.sequence,
                    _ => 0,
                };
                if msg_seq > vc_instance.prepared_set_sequence() && msg_seq > last_exe_seq {
                    info!(
                        target: "consensus",
                        "replacing view-change prepared set, seq({})",
                        msg_seq
                    );
                    vc_instance.prepared_set = Some(set.clone());
                }
            }

            vc_instance.viewchanges.len() > fault_number && vc_instance.end_time == 0
        };
        if quorum_reached {
            let target_view = vote.view_number;
            let ret = self.process_quorum_view_change(target_view, now);
            self.save_view_change(&mut saver);
            if let Err(e) = saver.commit() {
                error!(target: "consensus", "persisting view change failed: {}", e);
            }
            return ret;
        }
        true
    }

    fn process_quorum_view_change(&mut self, target_view: i64, now: i64) -> bool {
        info!(
            target: "consensus",
            "processing view-change quorum for view({})",
            target_view
        );
        let n = self.validator_count();
        if n == 0 {
            return false;
        }

        if target_view % n != self.base.replica_id {
            // Not the new primary: give it one respond window, then
            // escalate to the next view with the same prepared set.
            let prepared_set = self
                .vc_instances
                .get(&target_view)
                .and_then(|vc| vc.prepared_set.clone());
            self.new_view_wait = Some(NewViewWait {
                view_number: target_view,
                prepared_set,
                deadline: now + NEW_VIEW_RESPOND_TIMEOUT_US,
            });
            info!(
                target: "consensus",
                "not the new primary of view({}), waiting {}s for its new-view",
                target_view,
                NEW_VIEW_RESPOND_TIMEOUT_US / MICRO_UNITS_PER_SEC
            );
            return false;
        }

        let (new_view_env, last_value) = {
            let vc_instance = match self.vc_instances.get(&target_view) {
                Some(vc) => vc,
                None => return false,
            };
            let env = self.new_new_view(vc_instance);
            let last_value = vc_instance
                .prepared_set
                .as_ref()
                .and_then(|set| match &set.pre_prepare.pbft.message {
                    PbftMessage::PrePrepare(pp) => Some(pp.value.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            (env, last_value)
        };

        info!(
            target: "consensus",
            "sending new-view, view({})",
            target_view
        );
        if let Some(vc_instance) = self.vc_instances.get_mut(&target_view) {
            vc_instance.new_view = Some(new_view_env.clone());
            vc_instance.set_last_newview_time(now);
        }
        self.send_env(&new_view_env);

        // Keep committed work and prepared work above the water mark, drop
        // the rest.
        let last_exe_seq = self.last_exe_seq;
        self.instances.retain(|index, instance| {
            instance.phase == PbftPhase::Committed
                || (instance.phase == PbftPhase::Prepared && index.sequence > last_exe_seq)
        });

        let mut saver = ValueSaver::new(self.base.store.clone());
        self.view_number = target_view;
        self.view_active = true;
        saver.save_value(keys::CONSENSUS_VIEW_ACTIVE, &1u8);
        saver.save_value(keys::CONSENSUS_VIEW_NUMBER, &self.view_number);

        info!(
            target: "consensus",
            "primary entered the new view({})",
            self.view_number
        );
        if let Some(vc_instance) = self.vc_instances.get_mut(&target_view) {
            vc_instance.change_complete(now);
        }

        self.clear_view_changes(&mut saver);
        if let Err(e) = saver.commit() {
            error!(target: "consensus", "persisting new view failed: {}", e);
        }

        self.emit(ConsensusEvent::ResetCloseTimer);
        self.emit(ConsensusEvent::ViewChanged {
            last_value,
        });
        true
    }

    fn on_new_view(&mut self, env: &PbftEnv, now: i64) -> bool {
        let new_view = match &env.pbft.message {
            PbftMessage::NewView(nv) => nv.clone(),
            _ => return false,
        };

        info!(
            target: "consensus",
            "received new-view from replica({}), view({}) round({})",
            new_view.replica_id,
            new_view.view_number,
            env.pbft.round_number
        );
        if new_view.view_number == self.view_number {
            info!(
                target: "consensus",
                "new-view({}) equals the current view, nothing to do",
                new_view.view_number
            );
            return true;
        }
        if new_view.view_number < self.view_number {
            info!(
                target: "consensus",
                "new-view({}) below the current view({}), nothing to do",
                new_view.view_number,
                self.view_number
            );
            return true;
        }

        // The answer arrived; stop waiting for it.
        self.new_view_wait = None;

        let n = self.validator_count();
        if n > 0 && new_view.view_number % n == self.base.replica_id {
            info!(
                target: "consensus",
                "this replica({}) is the new primary, new-view message not processed",
                self.base.replica_id
            );
            return true;
        }

        // Validate the bundled view changes: distinct, well signed, all
        // targeting this view.
        let mut replica_set = BTreeSet::new();
        for view_change_env in &new_view.view_changes {
            let vote = match &view_change_env.pbft.message {
                PbftMessage::ViewChange(vc) => vc,
                _ => {
                    error!(target: "consensus", "new-view bundles a non-view-change");
                    return false;
                }
            };
            if crate::message::check_message_item(
                view_change_env,
                &self.base.validator_map,
                self.base.hash_kind,
            )
            .is_err()
            {
                return false;
            }
            if vote.view_number != new_view.view_number {
                error!(
                    target: "consensus",
                    "bundled view-change targets view({}) != new-view({})",
                    vote.view_number,
                    new_view.view_number
                );
                return false;
            }
            replica_set.insert(vote.replica_id);
        }

        if replica_set.len() <= self.fault_number {
            error!(
                target: "consensus",
                "new-view({}) carries {} distinct votes, need more than {}",
                new_view.view_number,
                replica_set.len(),
                self.fault_number
            );
            return false;
        }

        // Keep committed work and prepared work above the water mark.
        let last_exe_seq = self.last_exe_seq;
        self.instances.retain(|index, instance| {
            instance.phase == PbftPhase::Committed
                || (instance.phase == PbftPhase::Prepared && index.sequence > last_exe_seq)
        });

        info!(
            target: "consensus",
            "replica({}) entering the new view({})",
            self.base.replica_id,
            new_view.view_number
        );
        let mut saver = ValueSaver::new(self.base.store.clone());
        self.view_number = new_view.view_number;
        self.view_active = true;
        saver.save_value(keys::CONSENSUS_VIEW_NUMBER, &self.view_number);
        saver.save_value(keys::CONSENSUS_VIEW_ACTIVE, &1u8);

        let entered_view = self.view_number;
        if let Some(vc_instance) = self.vc_instances.get_mut(&entered_view) {
            vc_instance.change_complete(now);
        }

        self.clear_view_changes(&mut saver);
        if let Err(e) = saver.commit() {
            error!(target: "consensus", "persisting new view failed: {}", e);
        }

        self.emit(ConsensusEvent::ViewChanged {
            last_value: Vec::new(),
        });
        true
    }

    /// Drop incomplete view-change instances and those more than a few views
    /// behind, then snapshot the survivors.
    fn clear_view_changes(&mut self, saver: &mut ValueSaver) {
        let current_view = self.view_number;
        self.vc_instances.retain(|_, instance| {
            if instance.end_time == 0 {
                info!(
                    target: "consensus",
                    "deleting incomplete view-change instance view({})",
                    instance.view_number
                );
                return false;
            }
            if instance.view_number < current_view - VC_INSTANCE_KEEP_VIEWS {
                info!(
                    target: "consensus",
                    "deleting stale view-change instance view({})",
                    instance.view_number
                );
                return false;
            }
            true
        });
        self.save_view_change(saver);
    }

    fn save_view_change(&self, saver: &mut ValueSaver) {
        let records: Vec<VcInstanceRecord> = self
            .vc_instances
            .values()
            .map(VcInstanceRecord::from_instance)
            .collect();
        saver.save_value(keys::CONSENSUS_VIEW_CHANGE, &records);
    }

    fn save_validators(&self, saver: &mut ValueSaver) {
        saver.save_value(keys::CONSENSUS_VALIDATORS, &self.base.validators);
    }

    // --- timers ------------------------------------------------------------

    pub fn on_timer(&mut self, now: i64) {
        // Expiry and pre-prepare retransmission.
        let mut expired = Vec::new();
        let mut resend_pre_prepare = Vec::new();
        let mut last_prepared: Option<InstanceIndex> = None;
        for (index, instance) in &self.instances {
            if instance.is_expired(now, self.instance_timeout) && !instance.have_send_viewchange {
                expired.push(*index);
            }
            if instance.need_send_again(now, self.instance_timeout)
                && self.view_active
                && instance.pre_prepare_msg.is_some()
            {
                resend_pre_prepare.push(*index);
            }
            if instance.phase >= PbftPhase::Prepared {
                last_prepared = Some(*index);
            }
        }

        for index in expired {
            info!(
                target: "consensus",
                "pbft instance timed out, view({}) seq({})",
                index.view_number,
                index.sequence
            );
            self.do_tx_timeout(now);
            if let Some(instance) = self.instances.get_mut(&index) {
                instance.have_send_viewchange = true;
            }
        }

        for index in resend_pre_prepare {
            let resend = self.instances.get_mut(&index).and_then(|instance| {
                instance.pre_prepare_round += 1;
                let round = instance.pre_prepare_round;
                instance.set_last_propose_time(now);
                instance
                    .pre_prepare_msg
                    .clone()
                    .map(|env| (env, round))
            });
            if let Some((env, round)) = resend {
                let bumped = self.inc_message_round(&env, round);
                self.send_env(&bumped);
                info!(
                    target: "consensus",
                    "re-sending pre-prepare, view({}) seq({}) round({})",
                    index.view_number,
                    index.sequence,
                    round
                );
            }
        }

        // Commit retransmission for the highest prepared instance.
        if let Some(index) = last_prepared {
            let resend = self.instances.get_mut(&index).and_then(|instance| {
                if instance.check_value_result == CheckValueResult::Valid
                    && instance.need_send_commit_again(now, self.commit_send_interval)
                {
                    instance.commit_round += 1;
                    instance.set_last_commit_send_time(now);
                    instance
                        .prepares
                        .values()
                        .next()
                        .cloned()
                        .map(|prepare| (prepare, instance.commit_round))
                } else {
                    None
                }
            });
            if let Some((prepare, round)) = resend {
                let commit = self.new_commit(&prepare, round);
                self.send_env(&commit);
                info!(
                    target: "consensus",
                    "re-sending commit, view({}) seq({}) round({})",
                    index.view_number,
                    index.sequence,
                    round
                );
            }
        }

        // View-change and new-view retransmission.
        let mut resend_vc = Vec::new();
        let mut last_newview: Option<i64> = None;
        let n = self.validator_count();
        for (view, vc_instance) in &self.vc_instances {
            if vc_instance.need_send_again(now, self.view_change_timeout)
                && vc_instance.view_change_msg.is_some()
            {
                resend_vc.push(*view);
            }
            if vc_instance.need_send_new_view_again(now, self.new_view_send_interval)
                && n > 0
                && vc_instance.view_number % n == self.base.replica_id
            {
                last_newview = Some(*view);
            }
        }

        for view in resend_vc {
            let resend = self.vc_instances.get_mut(&view).and_then(|vc_instance| {
                vc_instance.view_change_round += 1;
                let round = vc_instance.view_change_round;
                vc_instance.set_last_propose_time(now);
                vc_instance.view_change_msg.clone().map(|env| (env, round))
            });
            if let Some((env, round)) = resend {
                let bumped = self.inc_message_round(&env, round);
                self.send_env(&bumped);
                info!(
                    target: "consensus",
                    "re-sending view change, view({}) round({})",
                    view,
                    round
                );
            }
        }

        if let Some(view) = last_newview {
            let resend = self.vc_instances.get_mut(&view).and_then(|vc_instance| {
                vc_instance.new_view_round += 1;
                let round = vc_instance.new_view_round;
                vc_instance.set_last_newview_time(now);
                vc_instance.new_view.clone().map(|env| (env, round))
            });
            if let Some((env, round)) = resend {
                let bumped = self.inc_message_round(&env, round);
                self.send_env(&bumped);
                info!(
                    target: "consensus",
                    "re-sending new-view, view({}) round({})",
                    view,
                    round
                );
            }
        }

        // A non-primary that saw a view-change quorum but no NewView in time
        // escalates to the next view with the same prepared set.
        if let Some(wait) = self.new_view_wait.clone() {
            if now >= wait.deadline {
                self.new_view_wait = None;
                if self.view_active {
                    info!(
                        target: "consensus",
                        "view({}) active again, not escalating past view({})",
                        self.view_number,
                        wait.view_number
                    );
                } else {
                    info!(
                        target: "consensus",
                        "new primary of view({}) did not respond, negotiating view({})",
                        wait.view_number,
                        wait.view_number + 1
                    );
                    let msg = self.new_view_change_raw(wait.view_number + 1, wait.prepared_set);
                    self.send_env(&msg);
                }
            }
        }
    }

    /// The close-timer watchdog or an expired instance demands a view
    /// change: deactivate the view and vote for the next one, carrying our
    /// highest prepared set.
    pub fn on_tx_timeout(&mut self, now: i64) {
        self.do_tx_timeout(now);
    }

    fn do_tx_timeout(&mut self, _now: i64) {
        if !self.base.is_validator {
            return;
        }

        info!(
            target: "consensus",
            "sending view change, target view({})",
            self.view_number + 1
        );
        self.view_active = false;
        let mut saver = ValueSaver::new(self.base.store.clone());
        saver.save_value(keys::CONSENSUS_VIEW_ACTIVE, &0u8);
        if let Err(e) = saver.commit() {
            error!(target: "consensus", "persisting view deactivation failed: {}", e);
        }

        let msg = self.new_view_change_raw(self.view_number + 1, None);
        self.send_env(&msg);
    }

    // --- validator set updates --------------------------------------------

    /// Adopt the validator set of a committed block together with the commit
    /// certificate that closed it.
    pub fn update_validators(&mut self, validators: &ValidatorSet, proof: &[u8]) -> bool {
        let mut new_view_number = -1i64;
        let mut new_seq = -1i64;
        if proof.is_empty() {
            new_view_number = 0;
        } else {
            let pbft_proof: PbftProof = match codec::from_bytes_canonical(proof) {
                Ok(p) => p,
                Err(e) => {
                    error!(target: "consensus", "proof decode failed: {}", e);
                    return false;
                }
            };
            if let Some(env) = pbft_proof.commits.first() {
                if let PbftMessage::Commit(commit) = &env.pbft.message {
                    if commit.view_number >= self.view_number {
                        new_view_number = commit.view_number + 1;
                    }
                    if commit.sequence > self.last_exe_seq {
                        new_seq = commit.sequence;
                    }
                }
            }
        }

        let validator_changed = !validators.same_order(&self.base.validators);

        let mut saver = ValueSaver::new(self.base.store.clone());
        if validator_changed {
            self.base.update_validators(validators);
            if self.base.validators.len() < 4 {
                warn!(
                    target: "consensus",
                    "validator count({}) cannot tolerate a faulty node",
                    self.base.validators.len()
                );
            }
            self.fault_number = fault_count(self.base.validators.len());
            self.save_validators(&mut saver);

            info!(
                target: "consensus",
                "validator count({}) tolerates {} faults, replica({}) {} the leader",
                self.base.validators.len(),
                self.fault_number,
                self.base.replica_id,
                if self.is_leader() { "is" } else { "is not" }
            );

            self.clear_uncommitted_instances();
            self.emit(ConsensusEvent::ResetCloseTimer);
        }

        if new_seq > 0 {
            self.last_exe_seq = new_seq;
            info!(target: "consensus", "set last executed sequence({})", new_seq);
            saver.save_value(keys::CONSENSUS_LAST_EXE_SEQ, &self.last_exe_seq);
        }

        if new_view_number > 0 || new_seq > 0 {
            self.clear_uncommitted_instances();

            if new_view_number > 0 {
                self.view_number = new_view_number;
            }
            self.view_active = true;
            saver.save_value(keys::CONSENSUS_VIEW_ACTIVE, &1u8);
            saver.save_value(keys::CONSENSUS_VIEW_NUMBER, &self.view_number);

            info!(
                target: "consensus",
                "{} entered the new view({})",
                if self.base.replica_id >= 0 {
                    if self.is_leader() {
                        "primary"
                    } else {
                        "replica"
                    }
                } else {
                    "sync node"
                },
                self.view_number
            );

            let current_view = self.view_number;
            self.vc_instances.retain(|_, instance| {
                if instance.end_time == 0 {
                    info!(
                        target: "consensus",
                        "deleting incomplete view-change instance view({})",
                        instance.view_number
                    );
                    return false;
                }
                if instance.view_number < current_view - VC_INSTANCE_KEEP_VIEWS {
                    info!(
                        target: "consensus",
                        "deleting stale view-change instance view({})",
                        instance.view_number
                    );
                    return false;
                }
                true
            });
            self.save_view_change(&mut saver);
            self.emit(ConsensusEvent::ResetCloseTimer);
        }

        if let Err(e) = saver.commit() {
            error!(target: "consensus", "persisting validator update failed: {}", e);
        }
        true
    }

    fn clear_uncommitted_instances(&mut self) {
        self.instances
            .retain(|_, instance| instance.phase >= PbftPhase::Committed);
    }

    pub fn check_proof(
        &self,
        validators: &ValidatorSet,
        previous_value_hash: &umbra_types::app::Hash32,
        proof: &[u8],
    ) -> bool {
        check_proof(validators, previous_value_hash, proof, self.base.hash_kind)
    }

    // --- status ------------------------------------------------------------

    pub fn module_status(&self) -> serde_json::Value {
        let instances: Vec<serde_json::Value> = self
            .instances
            .iter()
            .map(|(index, instance)| {
                serde_json::json!({
                    "vn": index.view_number,
                    "seq": index.sequence,
                    "phase": instance.phase.desc(),
                    "prepares": instance.prepares.len(),
                    "commits": instance.commits.len(),
                    "pre_prepare_round": instance.pre_prepare_round,
                    "have_send_viewchange": instance.have_send_viewchange,
                    "start_time": instance.start_time,
                    "end_time": instance.end_time,
                })
            })
            .collect();
        let viewchanges: Vec<serde_json::Value> = self
            .vc_instances
            .values()
            .map(|vc| {
                serde_json::json!({
                    "view_number": vc.view_number,
                    "viewchanges": vc.viewchanges.len(),
                    "newview_init": vc.new_view.is_some(),
                    "start_time": vc.start_time,
                    "end_time": vc.end_time,
                })
            })
            .collect();
        serde_json::json!({
            "type": "pbft",
            "replica_id": self.base.replica_id,
            "view_number": self.view_number,
            "ckp_interval": self.ckp_interval,
            "last_exe_seq": self.last_exe_seq,
            "fault_number": self.fault_number,
            "view_active": self.view_active,
            "is_leader": self.is_leader(),
            "validator_address": if self.base.replica_id >= 0 {
                self.base.keypair.address().to_string()
            } else {
                "none".to_string()
            },
            "quorum_size": self.quorum_size(),
            "validators": self.base.validators.validators.iter()
                .map(|v| v.address.to_string()).collect::<Vec<_>>(),
            "instances": instances,
            "viewchanges": viewchanges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use umbra_api::{KvStore, WriteOp};
    use umbra_crypto::NodeKeypair;
    use umbra_types::config::HashType;
    use umbra_types::error::StorageError;

    #[derive(Default)]
    struct MemKv {
        map: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl KvStore for MemKv {
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

    fn engine_for(n: usize, me: usize) -> (PbftEngine, Vec<NodeKeypair>) {
        let keypairs: Vec<NodeKeypair> = (0..n)
            .map(|i| NodeKeypair::from_seed([20 + i as u8; 32]))
            .collect();
        let set = ValidatorSet::from_addresses(keypairs.iter().map(|kp| kp.address().as_str()));
        let base = ConsensusBase::new(
            keypairs[me].clone(),
            HashType::Sha256,
            Arc::new(MemKv::default()),
        );
        let mut engine = PbftEngine::new(base, &LedgerConfig::default());
        engine.update_validators(&set, &[]);
        engine.take_events();
        (engine, keypairs)
    }

    fn signed(kp: &NodeKeypair, round_number: u32, message: PbftMessage) -> ConsensusMsg {
        let payload = PbftPayload {
            round_number,
            message,
        };
        let signature = kp.sign(&codec::to_bytes_canonical(&payload));
        ConsensusMsg::new(
            PbftEnv {
                pbft: payload,
                signature,
            },
            HashType::Sha256,
        )
    }

    fn pre_prepare_from(kp: &NodeKeypair, round: u32, seq: i64, value: &[u8]) -> ConsensusMsg {
        signed(
            kp,
            round,
            PbftMessage::PrePrepare(PbftPrePrepare {
                view_number: 0,
                sequence: seq,
                replica_id: 0,
                value: value.to_vec(),
                value_digest: umbra_crypto::digest(HashType::Sha256, value),
            }),
        )
    }

    fn sent(engine: &mut PbftEngine) -> Vec<PbftEnv> {
        engine
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                ConsensusEvent::SendMessage(bytes) => {
                    codec::from_bytes_canonical::<PbftEnv>(&bytes).ok()
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn request_requires_leadership_and_an_active_view() {
        let (mut follower, _) = engine_for(4, 1);
        assert!(!follower.request(b"value", 0));

        let (mut leader, _) = engine_for(4, 0);
        leader.on_tx_timeout(0);
        let _ = leader.take_events();
        assert!(!leader.request(b"value", 0));
    }

    #[test]
    fn follower_echoes_pre_prepare_with_a_prepare() {
        let (mut engine, keypairs) = engine_for(4, 1);
        let msg = pre_prepare_from(&keypairs[0], 1, 2, b"block");
        assert!(engine.on_receive(&msg, CheckValueResult::Valid, 1_000));

        let out = sent(&mut engine);
        assert_eq!(out.len(), 1);
        match &out[0].pbft.message {
            PbftMessage::Prepare(p) => {
                assert_eq!(p.sequence, 2);
                assert_eq!(p.replica_id, 1);
            }
            other => panic!("expected a prepare, got {:?}", other),
        }

        // A retried pre-prepare with a bumped round is answered in kind,
        // without touching the phase.
        let retry = pre_prepare_from(&keypairs[0], 2, 2, b"block");
        assert!(engine.on_receive(&retry, CheckValueResult::Valid, 2_000));
        let out = sent(&mut engine);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pbft.round_number, 2);
        assert!(matches!(out[0].pbft.message, PbftMessage::Prepare(_)));
    }

    #[test]
    fn out_of_watermark_sequences_are_not_tracked() {
        let (mut engine, keypairs) = engine_for(4, 1);
        let far = pre_prepare_from(&keypairs[0], 1, 50, b"far-ahead");
        assert!(!engine.on_receive(&far, CheckValueResult::Valid, 0));
        assert!(sent(&mut engine).is_empty());
        assert_eq!(engine.last_exe_seq(), 1);
    }

    #[test]
    fn may_valid_value_prepares_but_never_votes_commit() {
        let (mut engine, keypairs) = engine_for(4, 3);
        let msg = pre_prepare_from(&keypairs[0], 1, 2, b"unconfirmed");
        assert!(engine.on_receive(&msg, CheckValueResult::MayValid, 0));
        // No prepare goes out for an unconfirmed value.
        assert!(sent(&mut engine).is_empty());

        let digest = umbra_crypto::digest(HashType::Sha256, b"unconfirmed");
        for replica_id in 1..3i64 {
            let prepare = signed(
                &keypairs[replica_id as usize],
                1,
                PbftMessage::Prepare(PbftPrepare {
                    view_number: 0,
                    sequence: 2,
                    replica_id,
                    value_digest: digest,
                }),
            );
            engine.on_receive(&prepare, CheckValueResult::Valid, 0);
        }

        // Prepared was reached, but no commit was broadcast.
        assert!(sent(&mut engine)
            .iter()
            .all(|env| !matches!(env.pbft.message, PbftMessage::Commit(_))));
    }
}
