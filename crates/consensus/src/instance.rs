//! Per-(view, sequence) agreement instances and per-view view-change
//! instances.

use std::collections::BTreeMap;
use umbra_api::CheckValueResult;
use umbra_types::app::Hash32;

use crate::message::{
    PbftCommit, PbftEnv, PbftMessage, PbftPrePrepare, PbftPrepare, PbftPreparedSet,
    PbftViewChange,
};

/// Instance key; ordering is by view, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceIndex {
    pub view_number: i64,
    pub sequence: i64,
}

impl InstanceIndex {
    pub fn new(view_number: i64, sequence: i64) -> Self {
        InstanceIndex {
            view_number,
            sequence,
        }
    }
}

/// Normal-case phase of an instance.
///
/// Phase          None          | PrePrepared | Prepared | Committed
/// processes      pre-prepare   | prepare     | commit   | -
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PbftPhase {
    None,
    PrePrepared,
    Prepared,
    Committed,
}

impl PbftPhase {
    pub fn desc(self) -> &'static str {
        match self {
            PbftPhase::None => "phase-none",
            PbftPhase::PrePrepared => "phase-pre-prepared",
            PbftPhase::Prepared => "phase-prepared",
            PbftPhase::Committed => "phase-committed",
        }
    }

    /// Buffer slot processed while in this phase.
    pub(crate) fn buffer_slot(self) -> Option<usize> {
        match self {
            PbftPhase::None => Some(0),
            PbftPhase::PrePrepared => Some(1),
            PbftPhase::Prepared => Some(2),
            PbftPhase::Committed => None,
        }
    }
}

/// Buffer slot a message lands in, mirroring the phase that consumes it.
pub(crate) fn message_slot(message: &PbftMessage) -> Option<usize> {
    match message {
        PbftMessage::PrePrepare(_) => Some(0),
        PbftMessage::Prepare(_) => Some(1),
        PbftMessage::Commit(_) => Some(2),
        _ => None,
    }
}

/// One agreement instance. Owned exclusively by the engine; purged once its
/// sequence falls half a checkpoint window behind the last executed one.
#[derive(Debug, Clone)]
pub struct PbftInstance {
    pub phase: PbftPhase,
    /// Cursor into the buffer slot the current phase consumes.
    pub phase_item: usize,
    pub pre_prepare: PbftPrePrepare,
    pub prepares: BTreeMap<i64, PbftPrepare>,
    pub commits: BTreeMap<i64, PbftCommit>,
    /// Raw envelopes per slot: pre-prepares, prepares, commits. Doubles as
    /// the source for prepared sets and commit certificates.
    pub msg_buf: [Vec<PbftEnv>; 3],
    /// Our own pre-prepare envelope, kept for retransmission (leader only).
    pub pre_prepare_msg: Option<PbftEnv>,
    pub start_time: i64,
    pub end_time: i64,
    pub last_propose_time: i64,
    pub last_commit_send_time: i64,
    pub have_send_viewchange: bool,
    pub pre_prepare_round: u32,
    pub commit_round: u32,
    pub check_value_result: CheckValueResult,
}

impl PbftInstance {
    pub fn new(now: i64) -> Self {
        PbftInstance {
            phase: PbftPhase::None,
            phase_item: 0,
            pre_prepare: PbftPrePrepare::default(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            msg_buf: [Vec::new(), Vec::new(), Vec::new()],
            pre_prepare_msg: None,
            start_time: now,
            end_time: 0,
            last_propose_time: now,
            last_commit_send_time: 0,
            have_send_viewchange: false,
            pre_prepare_round: 1,
            commit_round: 1,
            check_value_result: CheckValueResult::Valid,
        }
    }

    /// Uncommitted past the instance timeout; fires the view-change path
    /// once.
    pub fn is_expired(&self, now: i64, instance_timeout: i64) -> bool {
        now - self.start_time >= instance_timeout && self.phase < PbftPhase::Committed
    }

    /// Pre-prepare retransmission is due (every quarter timeout).
    pub fn need_send_again(&self, now: i64, instance_timeout: i64) -> bool {
        now - self.last_propose_time >= instance_timeout / 4 && self.phase < PbftPhase::Committed
    }

    /// Commit retransmission is due for a prepared instance that already
    /// sent one.
    pub fn need_send_commit_again(&self, now: i64, commit_send_interval: i64) -> bool {
        self.last_commit_send_time != 0
            && now - self.last_commit_send_time >= commit_send_interval
            && self.phase >= PbftPhase::Prepared
    }

    pub fn set_last_propose_time(&mut self, now: i64) {
        self.last_propose_time = now;
    }

    pub fn set_last_commit_send_time(&mut self, now: i64) {
        self.last_commit_send_time = now;
    }

    /// Assemble the prepared set proving this instance prepared: the first
    /// pre-prepare envelope plus every buffered prepare.
    pub fn prepared_set(&self) -> Option<PbftPreparedSet> {
        let pre_prepare = self.msg_buf.first()?.first()?.clone();
        let prepares = self.msg_buf.get(1)?.clone();
        Some(PbftPreparedSet {
            pre_prepare: Box::new(pre_prepare),
            prepares,
        })
    }
}

/// Deadline state of a non-primary waiting for a NewView after a view-change
/// quorum.
#[derive(Debug, Clone)]
pub struct NewViewWait {
    pub view_number: i64,
    pub prepared_set: Option<PbftPreparedSet>,
    pub deadline: i64,
}

/// Per-target-view record of a view change in progress.
#[derive(Debug, Clone)]
pub struct PbftVcInstance {
    pub view_number: i64,
    /// Last executed sequence the initiating vote reported.
    pub sequence: i64,
    /// Our own bundled view-change envelope, kept for retransmission.
    pub view_change_msg: Option<PbftEnv>,
    pub viewchanges: BTreeMap<i64, PbftViewChange>,
    /// Received bundled view-change envelopes, in arrival order.
    pub msg_buf: Vec<PbftEnv>,
    /// Highest-sequence prepared set seen in any collected vote.
    pub prepared_set: Option<PbftPreparedSet>,
    pub view_change_round: u32,
    pub start_time: i64,
    pub last_propose_time: i64,
    pub end_time: i64,
    pub last_newview_time: i64,
    /// The NewView we sent, if we are the new primary.
    pub new_view: Option<PbftEnv>,
    pub new_view_round: u32,
}

impl PbftVcInstance {
    pub fn new(view_number: i64, now: i64) -> Self {
        PbftVcInstance {
            view_number,
            sequence: 0,
            view_change_msg: None,
            viewchanges: BTreeMap::new(),
            msg_buf: Vec::new(),
            prepared_set: None,
            view_change_round: 0,
            start_time: now,
            last_propose_time: now,
            end_time: 0,
            last_newview_time: 0,
            new_view: None,
            new_view_round: 1,
        }
    }

    /// ViewChange retransmission is due for an incomplete change; the gap is
    /// the (long) view-change timeout.
    pub fn need_send_again(&self, now: i64, view_change_timeout: i64) -> bool {
        now - self.last_propose_time > view_change_timeout && self.end_time == 0
    }

    /// NewView retransmission is due at the new primary of a completed
    /// change.
    pub fn need_send_new_view_again(&self, now: i64, new_view_send_interval: i64) -> bool {
        now - self.last_newview_time > new_view_send_interval
            && self.new_view.is_some()
            && self.end_time > 0
    }

    pub fn set_last_propose_time(&mut self, now: i64) {
        self.last_propose_time = now;
    }

    pub fn set_last_newview_time(&mut self, now: i64) {
        self.last_newview_time = now;
    }

    pub fn change_complete(&mut self, now: i64) {
        self.end_time = now;
    }

    /// Sequence of the prepared set's pre-prepare, or 0.
    pub fn prepared_set_sequence(&self) -> i64 {
        self.prepared_set
            .as_ref()
            .map(|set| match &set.pre_prepare.pbft.message {
                PbftMessage::PrePrepare(pp) => pp.sequence,
                _ => 0,
            })
            .unwrap_or(0)
    }

    /// Digest of the prepared set's pre-prepare, or the zero digest.
    pub fn prepared_set_digest(&self) -> Hash32 {
        self.prepared_set
            .as_ref()
            .map(|set| match &set.pre_prepare.pbft.message {
                PbftMessage::PrePrepare(pp) => pp.value_digest,
                _ => umbra_types::app::ZERO_HASH,
            })
            .unwrap_or(umbra_types::app::ZERO_HASH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_types::general::MICRO_UNITS_PER_SEC;

    const T: i64 = 30 * MICRO_UNITS_PER_SEC;

    #[test]
    fn expiry_and_retransmission_windows() {
        let mut inst = PbftInstance::new(1_000_000);
        assert!(!inst.is_expired(1_000_000 + T - 1, T));
        assert!(inst.is_expired(1_000_000 + T, T));

        assert!(!inst.need_send_again(1_000_000 + T / 4 - 1, T));
        assert!(inst.need_send_again(1_000_000 + T / 4, T));

        inst.phase = PbftPhase::Committed;
        assert!(!inst.is_expired(1_000_000 + 2 * T, T));
        assert!(!inst.need_send_again(1_000_000 + 2 * T, T));
    }

    #[test]
    fn commit_resend_requires_prior_send_and_prepared() {
        let interval = 15 * MICRO_UNITS_PER_SEC;
        let mut inst = PbftInstance::new(0);
        inst.phase = PbftPhase::Prepared;
        assert!(!inst.need_send_commit_again(interval * 2, interval));
        inst.set_last_commit_send_time(1);
        assert!(inst.need_send_commit_again(1 + interval, interval));
        inst.phase = PbftPhase::PrePrepared;
        assert!(!inst.need_send_commit_again(1 + interval, interval));
    }

    #[test]
    fn vc_retransmission_windows() {
        let gap = 60 * MICRO_UNITS_PER_SEC;
        let mut vc = PbftVcInstance::new(1, 0);
        assert!(!vc.need_send_again(gap, gap));
        assert!(vc.need_send_again(gap + 1, gap));
        vc.change_complete(gap);
        assert!(!vc.need_send_again(2 * gap, gap));
    }
}
