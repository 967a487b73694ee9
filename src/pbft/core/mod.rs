//! The replica protocol core.
//!
//! A `Replica` consumes the events posted by its host process and
//! drives the three phase agreement protocol, the checkpoint
//! machinery, and the view synchronization protocol, broadcasting
//! protocol messages and delivering committed requests through its
//! `Stack`. All of its state transitions happen on the thread
//! draining the event queue.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use intmap::IntMap;

use crate::pbft::collections::{self, HashSet, OrderedMap};
use crate::pbft::config::ReplicaConfig;
use crate::pbft::crypto::hash::Digest;
use crate::pbft::error::*;
use crate::pbft::events::Event;
use crate::pbft::executable::Stack;
use crate::pbft::log::Log;
use crate::pbft::message::{
    self, CheckpointMessage, CheckpointProof, ConsensusMessage, ConsensusMessageKind,
    NewViewMessage, NodeId, PqEntry, RequestMessage, SystemMessage, ViewChangeMessage,
};
use crate::pbft::ordering::{Orderable, SeqNo};
use crate::pbft::sync::{Synchronizer, SystemParams, ViewInfo};
use crate::pbft::timeouts::{TimeoutKind, TimeoutsHandle};

// a committed slot awaiting execution; the null request carries no
// payload and executes as a no-op
struct ExecEntry {
    digest: Digest,
    payload: Option<Vec<u8>>,
}

/// Represents one replica of the BFT system.
pub struct Replica<S: Stack> {
    id: NodeId,
    config: ReplicaConfig,
    active_view: bool,
    // last sequence number assigned by us as the primary
    seq_no: SeqNo,
    last_exec: SeqNo,
    last_state_id: Digest,
    currently_executing: Option<(SeqNo, Digest)>,
    skip_target: Option<(SeqNo, Digest)>,
    view_change_seq_no: SeqNo,
    to_execute: IntMap<ExecEntry>,
    // requests observed but not yet executed, in arrival order
    outstanding: OrderedMap<Digest, RequestMessage>,
    // digests already bound to a slot in the current view
    proposed: HashSet<Digest>,
    proposal_queue: VecDeque<Digest>,
    log: Log,
    sync: Synchronizer,
    timeouts: TimeoutsHandle,
    stack: S,
}

impl<S: Stack> Orderable for Replica<S> {
    /// Returns the sequence number of the view this replica is in.
    fn sequence_number(&self) -> SeqNo {
        self.sync.view().sequence_number()
    }
}

impl<S: Stack> Replica<S> {
    /// Bootstraps a fresh replica with the given identity and
    /// parameters.
    pub fn new(
        id: NodeId,
        config: ReplicaConfig,
        timeouts: TimeoutsHandle,
        stack: S,
    ) -> Result<Self> {
        let params = SystemParams::new(config.n, config.f)?;
        let view = ViewInfo::new(SeqNo::ZERO, params);
        let log = Log::new(config.log_size(), params.weak_quorum());
        let genesis = Self::genesis_state_id();
        let mut replica = Self {
            id,
            config,
            active_view: true,
            seq_no: SeqNo::ZERO,
            last_exec: SeqNo::ZERO,
            last_state_id: genesis,
            currently_executing: None,
            skip_target: None,
            view_change_seq_no: SeqNo::ZERO,
            to_execute: IntMap::new(),
            outstanding: collections::ordered_map(),
            proposed: collections::hash_set(),
            proposal_queue: VecDeque::new(),
            log,
            sync: Synchronizer::new(view),
            timeouts,
            stack,
        };
        replica.log.note_own_checkpoint(SeqNo::ZERO, genesis);
        replica.update_view_change_seq_no();
        replica.arm_null_request_timer();
        Ok(replica)
    }

    /// Rebuilds a replica from the records it persisted before a
    /// crash.
    ///
    /// The low watermark resumes at the highest stored checkpoint,
    /// and the pre-prepared and prepared evidence within the window
    /// is reinstalled, so `pre_prepared()` answers as it did before
    /// the crash.
    pub fn restore(
        id: NodeId,
        config: ReplicaConfig,
        timeouts: TimeoutsHandle,
        stack: S,
    ) -> Result<Self> {
        let mut replica = Self::new(id, config, timeouts, stack)?;

        let records = replica
            .stack
            .read_state_set("chkpt.")
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))?;
        let mut h = SeqNo::ZERO;
        let mut state_id = replica.last_state_id;
        for (key, value) in records {
            let seq = match Self::key_seq(&key) {
                Some(seq) => SeqNo::from(seq),
                None => continue,
            };
            let stored: Digest =
                bincode::deserialize(&value[..]).wrapped(ErrorKind::PersistenceFailure)?;
            replica.log.note_own_checkpoint(seq, stored);
            if seq > h {
                h = seq;
                state_id = stored;
            }
        }
        replica.log.move_watermarks(h);
        replica.last_exec = h;
        replica.seq_no = h;
        replica.last_state_id = state_id;

        let records = replica
            .stack
            .read_state_set("pset.")
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))?;
        for (_, value) in records {
            let entry: PqEntry =
                bincode::deserialize(&value[..]).wrapped(ErrorKind::PersistenceFailure)?;
            replica.log.record_pset(entry);
        }

        let records = replica
            .stack
            .read_state_set("qset.")
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))?;
        for (_, value) in records {
            let entry: PqEntry =
                bincode::deserialize(&value[..]).wrapped(ErrorKind::PersistenceFailure)?;
            replica.log.record_qset(entry);
        }

        replica.update_view_change_seq_no();
        Ok(replica)
    }

    fn genesis_state_id() -> Digest {
        Digest::hash(&[])
    }

    /// The identity of this replica.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The view this replica is in.
    pub fn view(&self) -> SeqNo {
        self.sync.view().sequence_number()
    }

    /// Checks if this replica leads the current view.
    pub fn is_primary(&self) -> bool {
        self.sync.view().leader() == self.id
    }

    /// Whether the current view completed its synchronization and is
    /// accepting requests.
    pub fn is_active_view(&self) -> bool {
        self.active_view
    }

    /// The last sequence number executed by this replica.
    pub fn last_exec(&self) -> SeqNo {
        self.last_exec
    }

    /// The last sequence number this replica assigned as a primary.
    pub fn last_assigned(&self) -> SeqNo {
        self.seq_no
    }

    /// The low watermark of this replica's log.
    pub fn low_watermark(&self) -> SeqNo {
        self.log.low_watermark()
    }

    /// Whether a state transfer is in flight.
    pub fn is_skipping(&self) -> bool {
        self.skip_target.is_some()
    }

    /// Checks whether `digest` reached the pre-prepared state at the
    /// `(view, seq)` slot, surviving restarts within the watermark
    /// window.
    pub fn pre_prepared(&self, digest: Digest, view: SeqNo, seq: SeqNo) -> bool {
        self.log.pre_prepared(digest, view, seq)
    }

    /// A shared reference to the stack this replica drives.
    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// An exclusive reference to the stack this replica drives.
    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    /// Consumes one event, transitioning the protocol state.
    ///
    /// Malformed or malicious traffic is dropped here, logged at
    /// debug level; only failures of the persistence layer escape, as
    /// those are fatal to the replica.
    pub fn process(&mut self, event: Event) -> Result<()> {
        let outcome = match event {
            Event::Message { from, data } => self.recv_blob(from, &data[..]),
            Event::Timeout(kind) => self.timed_out(kind),
            Event::ExecutionDone(state_id) => self.exec_done(state_id),
            Event::SkipDone(seq) => self.skip_done(seq),
        };
        match outcome {
            Err(e) if e.kind() == ErrorKind::PersistenceFailure => Err(e),
            Err(e) => {
                debug!("dropping event: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn recv_blob(&mut self, from: NodeId, data: &[u8]) -> Result<()> {
        let message = message::deserialize_message(data, from)?;
        match message {
            SystemMessage::Request(m) => self.recv_request(m),
            SystemMessage::Consensus(m) => self.recv_consensus(m),
            SystemMessage::Checkpoint(m) => self.recv_checkpoint(m),
            SystemMessage::ViewChange(m) => self.recv_view_change(m),
            SystemMessage::NewView(m) => self.recv_new_view(m),
        }
    }

    fn broadcast(&mut self, message: SystemMessage) -> Result<()> {
        let data = message::serialize_message(&message)?;
        self.stack.broadcast(data);
        Ok(())
    }

    fn unicast(&mut self, message: SystemMessage, dst: NodeId) -> Result<()> {
        let data = message::serialize_message(&message)?;
        self.stack.unicast(data, dst);
        Ok(())
    }

    // ------------------------------------------------------------
    // client requests
    // ------------------------------------------------------------

    fn recv_request(&mut self, request: RequestMessage) -> Result<()> {
        if request.is_null() {
            return Err("Empty request").wrapped(ErrorKind::EmptyMessage);
        }
        self.stack.validate(request.payload())?;
        let digest = request.digest()?;
        let leader = self.sync.view().leader();

        let fresh = !self.outstanding.contains_key(&digest);
        if fresh {
            self.outstanding.insert(digest, request.clone());
            self.log.insert_request(digest, request.clone());
        }

        if self.id == leader {
            if fresh {
                self.proposal_queue.push_back(digest);
            }
            if self.active_view {
                self.propose_pending()?;
            }
        } else {
            if fresh {
                // relay under our own identity; the digest does not
                // cover the sender, so the primary derives the same
                // name for it
                let relayed = RequestMessage::new(
                    request.timestamp(),
                    request.payload().to_vec(),
                    self.id,
                );
                self.unicast(SystemMessage::Request(relayed), leader)?;
            }
            self.timeouts
                .timeout(self.config.request_timeout, TimeoutKind::Request(digest));
        }
        Ok(())
    }

    fn propose_pending(&mut self) -> Result<()> {
        let view = *self.sync.view();
        if self.id != view.leader() || !self.active_view || self.skip_target.is_some() {
            return Ok(());
        }
        // the active window is half the log; outrunning it would let
        // pre-prepares hit the high watermark before commits land
        let window = self.config.log_size() / 2;
        loop {
            let digest = match self.proposal_queue.front() {
                Some(digest) => *digest,
                None => break,
            };
            let next = self.seq_no.next();
            if u64::from(next) > u64::from(self.log.low_watermark()) + window {
                break;
            }
            self.proposal_queue.pop_front();
            if self.proposed.contains(&digest) || !self.outstanding.contains_key(&digest) {
                continue;
            }
            let request = match self.outstanding.get(&digest) {
                Some(request) => request.clone(),
                None => continue,
            };
            self.seq_no = next;
            self.proposed.insert(digest);
            let message = ConsensusMessage::new(
                view.sequence_number(),
                next,
                self.id,
                ConsensusMessageKind::PrePrepare(digest, request),
            );
            self.broadcast(SystemMessage::Consensus(message))?;
            self.arm_null_request_timer();
        }
        Ok(())
    }

    // ------------------------------------------------------------
    // three phase agreement
    // ------------------------------------------------------------

    fn recv_consensus(&mut self, message: ConsensusMessage) -> Result<()> {
        if !self.active_view {
            return Err("View change in progress").wrapped(ErrorKind::WrongView);
        }
        let view = *self.sync.view();
        if message.view() != view.sequence_number() {
            return Err("Consensus message from another view").wrapped(ErrorKind::WrongView);
        }
        let seq = message.sequence_number();
        if !self.log.in_watermarks(seq) {
            return Err("Sequence number outside the watermark window")
                .wrapped(ErrorKind::OutsideWatermarks);
        }
        match message.kind() {
            ConsensusMessageKind::PrePrepare(_, _) => self.recv_pre_prepare(message, view),
            ConsensusMessageKind::Prepare(_) => self.recv_prepare(message, view),
            ConsensusMessageKind::Commit(_) => self.recv_commit(message, view),
        }
    }

    fn recv_pre_prepare(&mut self, message: ConsensusMessage, view: ViewInfo) -> Result<()> {
        if message.from() != view.leader() {
            return Err("Pre-prepare from a backup").wrapped(ErrorKind::InvalidSender);
        }
        let seq = message.sequence_number();
        let (digest, request) = match message.kind() {
            ConsensusMessageKind::PrePrepare(digest, request) => (*digest, request.clone()),
            _ => unreachable!(),
        };
        if request.digest()? != digest {
            // a forged binding; nothing to answer, nothing to relay
            return Err("Digest does not name the carried request")
                .wrapped(ErrorKind::DigestMismatch);
        }
        if !request.is_null() {
            self.stack.validate(request.payload())?;
        }

        // sign of life from the primary
        self.arm_null_request_watchdog();

        {
            let cert = self.log.get_cert(view.sequence_number(), seq)?;
            cert.install_pre_prepare(message, digest, request.clone())?;
        }
        if !request.is_null() {
            if !self.outstanding.contains_key(&digest) {
                self.outstanding.insert(digest, request.clone());
            }
            self.log.insert_request(digest, request);
        }

        let entry = PqEntry::new(seq, digest, view.sequence_number());
        self.log.record_qset(entry);
        self.persist_qset_entry(&entry)?;

        if self.id != view.leader() {
            let prepare = ConsensusMessage::new(
                view.sequence_number(),
                seq,
                self.id,
                ConsensusMessageKind::Prepare(digest),
            );
            self.broadcast(SystemMessage::Consensus(prepare))?;
        }
        self.update_certificate(view, seq)
    }

    fn recv_prepare(&mut self, message: ConsensusMessage, view: ViewInfo) -> Result<()> {
        if message.from() == view.leader() {
            return Err("The primary cannot vote a prepare").wrapped(ErrorKind::InvalidSender);
        }
        let seq = message.sequence_number();
        let digest = *message.proposed_digest();
        let stored = self
            .log
            .get_cert(view.sequence_number(), seq)?
            .add_prepare(message.from(), digest);
        if !stored {
            return Err("Sender voted twice").wrapped(ErrorKind::Core);
        }
        self.update_certificate(view, seq)
    }

    fn recv_commit(&mut self, message: ConsensusMessage, view: ViewInfo) -> Result<()> {
        let seq = message.sequence_number();
        let digest = *message.proposed_digest();
        let stored = self
            .log
            .get_cert(view.sequence_number(), seq)?
            .add_commit(message.from(), digest);
        if !stored {
            return Err("Sender voted twice").wrapped(ErrorKind::Core);
        }
        self.update_certificate(view, seq)
    }

    /// Walks the certificate of `(view, seq)` through the prepared
    /// and committed transitions its votes allow.
    fn update_certificate(&mut self, view: ViewInfo, seq: SeqNo) -> Result<()> {
        let params = *view.params();
        let view_seq = view.sequence_number();

        let (digest, newly_prepared) = {
            let cert = match self.log.cert(view_seq, seq) {
                Some(cert) => cert,
                None => return Ok(()),
            };
            let digest = match cert.digest() {
                Some(digest) => digest,
                None => return Ok(()),
            };
            let newly_prepared = cert.is_pre_prepared()
                && !cert.is_prepared()
                && cert.matching_prepares(digest) >= 2 * params.f();
            (digest, newly_prepared)
        };

        if newly_prepared {
            if let Some(cert) = self.log.cert_mut(view_seq, seq) {
                cert.mark_prepared();
            }
            let entry = PqEntry::new(seq, digest, view_seq);
            self.log.record_pset(entry);
            self.persist_pset_entry(&entry)?;
            let commit = ConsensusMessage::new(
                view_seq,
                seq,
                self.id,
                ConsensusMessageKind::Commit(digest),
            );
            self.broadcast(SystemMessage::Consensus(commit))?;
        }

        let newly_committed = {
            match self.log.cert(view_seq, seq) {
                Some(cert) => {
                    cert.is_prepared()
                        && !cert.is_committed()
                        && cert.matching_commits(digest) >= params.quorum()
                }
                None => false,
            }
        };

        if newly_committed {
            let payload = match self.log.cert_mut(view_seq, seq) {
                Some(cert) => {
                    cert.mark_committed();
                    cert.request().filter(|r| !r.is_null()).map(|r| r.payload().to_vec())
                }
                None => None,
            };
            self.timeouts.cancel(&TimeoutKind::Request(digest));
            // a slot may commit again under a new view after the old
            // one already delivered it; never enqueue those twice
            let in_flight = self.currently_executing.map(|(seq, _)| seq);
            if seq > self.last_exec && Some(seq) != in_flight {
                self.to_execute
                    .insert(u64::from(seq), ExecEntry { digest, payload });
                self.execute_outstanding()?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------
    // execution
    // ------------------------------------------------------------

    /// Feeds the execution engine in strictly increasing sequence
    /// number order; a gap blocks delivery until it commits.
    fn execute_outstanding(&mut self) -> Result<()> {
        if self.skip_target.is_some() {
            return Ok(());
        }
        while self.currently_executing.is_none() {
            let next = self.last_exec.next();
            let entry = match self.to_execute.remove(u64::from(next)) {
                Some(entry) => entry,
                None => break,
            };
            match entry.payload {
                None => {
                    // the null request executes as a no-op
                    self.last_exec = next;
                    self.post_execution(next, entry.digest)?;
                }
                Some(payload) => {
                    self.currently_executing = Some((next, entry.digest));
                    self.stack.execute(next, payload);
                }
            }
        }
        Ok(())
    }

    fn exec_done(&mut self, state_id: Digest) -> Result<()> {
        let (seq, digest) = match self.currently_executing.take() {
            Some(in_flight) => in_flight,
            None => {
                // a completion with nothing in flight is harmless
                debug!("spurious execution completion");
                return Ok(());
            }
        };
        self.last_exec = seq;
        self.last_state_id = state_id;
        self.post_execution(seq, digest)?;
        self.execute_outstanding()
    }

    fn post_execution(&mut self, seq: SeqNo, digest: Digest) -> Result<()> {
        self.outstanding.remove(&digest);
        self.log.remove_request(&digest);
        self.proposed.remove(&digest);
        self.timeouts.cancel(&TimeoutKind::Request(digest));
        if u64::from(seq) % self.config.k == 0 {
            let state_id = self.last_state_id;
            self.log.note_own_checkpoint(seq, state_id);
            self.persist_checkpoint(seq, state_id)?;
            let message = CheckpointMessage::new(seq, state_id, self.id);
            self.broadcast(SystemMessage::Checkpoint(message))?;
        }
        Ok(())
    }

    fn skip_done(&mut self, seq: SeqNo) -> Result<()> {
        let (target, state_id) = match self.skip_target.take() {
            Some(target) => target,
            None => {
                debug!("no state transfer in flight");
                return Ok(());
            }
        };
        if seq < target {
            self.skip_target = Some((target, state_id));
            return Err("State transfer fell short of its target").wrapped(ErrorKind::ExecutionGap);
        }
        info!("state transfer complete at {}", seq);
        self.last_exec = seq;
        self.last_state_id = state_id;
        self.currently_executing = None;
        if self.seq_no < seq {
            self.seq_no = seq;
        }
        self.log.note_own_checkpoint(seq, state_id);
        self.persist_checkpoint(seq, state_id)?;
        let message = CheckpointMessage::new(seq, state_id, self.id);
        self.broadcast(SystemMessage::Checkpoint(message))?;
        self.execute_outstanding()
    }

    // ------------------------------------------------------------
    // checkpoints
    // ------------------------------------------------------------

    fn recv_checkpoint(&mut self, message: CheckpointMessage) -> Result<()> {
        let seq = message.sequence_number();
        let state_id = message.state_id();
        let count = self.log.add_checkpoint(seq, state_id, message.from());
        if count == 0 {
            return Err("Checkpoint at or before the low watermark")
                .wrapped(ErrorKind::OutsideWatermarks);
        }
        let params = *self.sync.view().params();
        if self.log.in_watermarks(seq) {
            if count >= params.quorum() && self.log.own_checkpoint(seq) == Some(state_id) {
                self.mark_stable_checkpoint(seq)?;
            }
        } else if let Some((seq, state_id, peers)) =
            self.log.hi_checkpoint_cert(params.weak_quorum())
        {
            // a weak certificate of checkpoints past our window is
            // proof at least one correct replica moved past us
            self.begin_skip(seq, state_id, peers)?;
        }
        Ok(())
    }

    fn mark_stable_checkpoint(&mut self, seq: SeqNo) -> Result<()> {
        if seq <= self.log.low_watermark() {
            return Ok(());
        }
        info!("checkpoint {} is stable, sliding the log", seq);
        self.gc_persisted(seq)?;
        self.log.move_watermarks(seq);
        // the freed window may unblock the send queue
        self.propose_pending()?;

        if self.config.view_change_period > 0
            && self.active_view
            && seq >= self.view_change_seq_no
        {
            self.update_view_change_seq_no_from(seq);
            info!("periodic primary rotation at {}", seq);
            self.send_view_change()?;
        }
        Ok(())
    }

    fn begin_skip(&mut self, seq: SeqNo, state_id: Digest, peers: Vec<NodeId>) -> Result<()> {
        if self.skip_target.is_some() || seq <= self.log.low_watermark() {
            return Ok(());
        }
        warn!("we fell behind the log window; fetching state at {}", seq);
        self.skip_target = Some((seq, state_id));
        self.gc_persisted(seq)?;
        self.log.move_watermarks(seq);
        self.to_execute.clear();
        self.timeouts.cancel_requests();
        self.stack.skip_to(seq, state_id, &peers[..]);
        Ok(())
    }

    // ------------------------------------------------------------
    // view changes
    // ------------------------------------------------------------

    fn send_view_change(&mut self) -> Result<()> {
        let next = self.sync.view().sequence_number().next();
        self.send_view_change_to(next)
    }

    fn send_view_change_to(&mut self, new_view: SeqNo) -> Result<()> {
        if new_view <= self.sync.view().sequence_number() {
            return Ok(());
        }
        info!("voting to install view {}", new_view);
        self.active_view = false;
        // every protocol timer stops; only the view change timer runs
        self.timeouts.cancel_requests();
        self.timeouts.cancel(&TimeoutKind::NullRequestSend);
        self.timeouts.cancel(&TimeoutKind::NullRequestRecv);

        // snapshot the evidence before abandoning the live certificates
        let pset = self.log.calc_pset();
        let qset = self.log.calc_qset();
        self.log.set_pset(&pset[..]);
        self.log.set_qset(&qset[..]);

        let view = ViewInfo::new(new_view, *self.sync.view().params());
        self.sync.install_view(view);
        self.log.drop_certs_below_view(new_view);
        self.proposed.clear();

        let mut vc = ViewChangeMessage::new(
            new_view,
            self.log.low_watermark(),
            self.log.cset(),
            pset,
            qset,
            self.id,
        );
        let signature = self.stack.sign(&vc.signed_payload()?[..])?;
        vc.set_signature(signature);
        self.broadcast(SystemMessage::ViewChange(vc))?;
        self.timeouts
            .timeout(self.config.view_change_timeout, TimeoutKind::ViewChange);
        Ok(())
    }

    fn recv_view_change(&mut self, vc: ViewChangeMessage) -> Result<()> {
        let payload = vc.signed_payload()?;
        self.stack.verify(vc.from(), vc.signature(), &payload[..])?;

        let current = self.sync.view().sequence_number();
        let voted = vc.sequence_number();
        if voted < current || (voted == current && self.active_view) {
            return Err("Vote for a view already installed").wrapped(ErrorKind::StaleView);
        }
        self.sync.register_view_change(vc, self.config.log_size())?;

        // join a view change a weak certificate of replicas engaged
        // in; a single suspicious replica cannot drag the view along
        let weak = self.sync.view().params().weak_quorum();
        if let Some(join) = self.sync.joinable_view(current, weak) {
            self.send_view_change_to(join)?;
        }
        self.try_send_new_view()
    }

    fn try_send_new_view(&mut self) -> Result<()> {
        if self.active_view {
            return Ok(());
        }
        let view = *self.sync.view();
        if view.leader() != self.id {
            return Ok(());
        }
        let nv = match self.sync.assemble_new_view(self.id, self.config.log_size()) {
            Some(nv) => nv,
            // keep collecting votes
            None => return Ok(()),
        };
        info!("leading view {}; announcing it", view.sequence_number());
        // we install the view when our own announcement loops back
        self.broadcast(SystemMessage::NewView(nv))
    }

    fn recv_new_view(&mut self, nv: NewViewMessage) -> Result<()> {
        let current = self.sync.view().sequence_number();
        let announced = nv.sequence_number();
        if announced < current || (announced == current && self.active_view) {
            return Err("New view already installed").wrapped(ErrorKind::StaleView);
        }
        let view = ViewInfo::new(announced, *self.sync.view().params());
        if nv.from() != view.leader() {
            return Err("New view from a replica which does not lead it")
                .wrapped(ErrorKind::InvalidSender);
        }
        for vc in nv.vset() {
            let payload = vc.signed_payload()?;
            self.stack.verify(vc.from(), vc.signature(), &payload[..])?;
        }
        let (cp, xset) = match self.sync.validate_new_view(&nv, self.config.log_size()) {
            Ok(elected) => elected,
            Err(e) => {
                warn!("refusing new view {}: {}; voting it out", announced, e);
                return self.send_view_change_to(announced.next());
            }
        };
        self.install_new_view(view, cp, xset, &nv)
    }

    fn install_new_view(
        &mut self,
        view: ViewInfo,
        cp: CheckpointProof,
        xset: Vec<(SeqNo, Option<Digest>)>,
        nv: &NewViewMessage,
    ) -> Result<()> {
        let cp_seq = cp.sequence_number();
        info!(
            "installing view {} from checkpoint {}",
            view.sequence_number(),
            cp_seq
        );

        // the low watermark moves to the elected checkpoint, never to
        // the top of the prepared evidence
        if cp_seq > self.log.low_watermark() {
            self.gc_persisted(cp_seq)?;
            self.log.move_watermarks(cp_seq);
        }

        self.sync.install_view(view);
        self.active_view = true;
        self.timeouts.cancel(&TimeoutKind::ViewChange);
        // never assign a slot the system may already have filled
        self.seq_no = self.seq_no.max(cp_seq).max(self.last_exec);
        if let Some((seq, _)) = xset.last() {
            self.seq_no = self.seq_no.max(*seq);
        }

        // a replica behind the elected checkpoint fetches the state
        // from the replicas whose votes certified it
        if cp_seq > self.last_exec && self.skip_target.is_none() {
            let peers: Vec<NodeId> = nv
                .vset()
                .iter()
                .filter(|vc| vc.cset().iter().any(|proof| *proof == cp))
                .map(|vc| vc.from())
                .filter(|id| *id != self.id)
                .collect();
            self.skip_target = Some((cp_seq, cp.state_id()));
            self.to_execute.clear();
            self.stack.skip_to(cp_seq, cp.state_id(), &peers[..]);
        }

        // install the assignments as pre-prepares of the new view
        let leader = view.leader();
        let view_seq = view.sequence_number();
        for (seq, assignment) in &xset {
            if *seq <= self.last_exec {
                continue;
            }
            let (digest, request) = match assignment {
                Some(digest) => (*digest, self.log.request(digest).cloned()),
                None => {
                    let null = RequestMessage::null(leader);
                    (null.digest()?, Some(null))
                }
            };
            let request = match request {
                Some(request) => request,
                None => {
                    // the payload never reached us; the primary
                    // retransmits its pre-prepare below
                    debug!("missing payload for {:x} at {}", digest, seq);
                    continue;
                }
            };
            let message = ConsensusMessage::new(
                view_seq,
                *seq,
                leader,
                ConsensusMessageKind::PrePrepare(digest, request.clone()),
            );
            {
                let cert = self.log.get_cert(view_seq, *seq)?;
                cert.install_pre_prepare(message, digest, request)?;
            }
            let entry = PqEntry::new(*seq, digest, view_seq);
            self.log.record_qset(entry);
            self.persist_qset_entry(&entry)?;
            if self.id != leader {
                let prepare = ConsensusMessage::new(
                    view_seq,
                    *seq,
                    self.id,
                    ConsensusMessageKind::Prepare(digest),
                );
                self.broadcast(SystemMessage::Consensus(prepare))?;
            }
        }

        // the new primary retransmits the assigned pre-prepares with
        // their payloads, so backups missing a request catch up
        if self.id == leader {
            for (seq, assignment) in &xset {
                if *seq <= self.last_exec {
                    continue;
                }
                let digest = match assignment {
                    Some(digest) => *digest,
                    None => continue,
                };
                let request = match self.log.request(&digest) {
                    Some(request) => request.clone(),
                    None => continue,
                };
                let message = ConsensusMessage::new(
                    view_seq,
                    *seq,
                    leader,
                    ConsensusMessageKind::PrePrepare(digest, request),
                );
                self.broadcast(SystemMessage::Consensus(message))?;
            }
        }

        // requeue the requests the old view left unserved
        self.proposed.clear();
        for (_, assignment) in &xset {
            if let Some(digest) = assignment {
                self.proposed.insert(*digest);
            }
        }
        self.proposal_queue.clear();
        let pending: Vec<Digest> = self.outstanding.keys().copied().collect();
        let request_timeout = self.config.request_timeout;
        for digest in pending {
            if !self.proposed.contains(&digest) {
                self.proposal_queue.push_back(digest);
            }
            if self.id != leader {
                self.timeouts
                    .timeout(request_timeout, TimeoutKind::Request(digest));
            }
        }

        self.update_view_change_seq_no();
        self.arm_null_request_timer();
        self.propose_pending()
    }

    // ------------------------------------------------------------
    // timers
    // ------------------------------------------------------------

    fn timed_out(&mut self, kind: TimeoutKind) -> Result<()> {
        match kind {
            TimeoutKind::Request(digest) => {
                if self.active_view && self.outstanding.contains_key(&digest) {
                    info!("request {:x} timed out; suspecting the primary", digest);
                    self.send_view_change()?;
                }
                Ok(())
            }
            TimeoutKind::ViewChange => {
                if self.active_view {
                    return Ok(());
                }
                let current = self.sync.view().sequence_number();
                let weak = self.sync.view().params().weak_quorum();
                // escalate only once a weak certificate of peers also
                // gave up; a lone replica re-arms and waits
                match self.sync.joinable_view(current, weak) {
                    Some(join) => self.send_view_change_to(join),
                    None => {
                        self.timeouts
                            .timeout(self.config.view_change_timeout, TimeoutKind::ViewChange);
                        Ok(())
                    }
                }
            }
            TimeoutKind::NullRequestSend => {
                if self.active_view && self.is_primary() {
                    self.send_null_request()?;
                }
                self.arm_null_request_timer();
                Ok(())
            }
            TimeoutKind::NullRequestRecv => {
                if self.active_view && !self.is_primary() {
                    info!("the primary went quiet; suspecting it");
                    self.send_view_change()?;
                }
                Ok(())
            }
        }
    }

    fn send_null_request(&mut self) -> Result<()> {
        let view = *self.sync.view();
        let window = self.config.log_size() / 2;
        let next = self.seq_no.next();
        if u64::from(next) > u64::from(self.log.low_watermark()) + window {
            return Ok(());
        }
        let request = RequestMessage::null(self.id);
        let digest = request.digest()?;
        self.seq_no = next;
        let message = ConsensusMessage::new(
            view.sequence_number(),
            next,
            self.id,
            ConsensusMessageKind::PrePrepare(digest, request),
        );
        self.broadcast(SystemMessage::Consensus(message))
    }

    fn arm_null_request_timer(&mut self) {
        let dur = self.config.null_request_timeout;
        if dur.is_zero() {
            return;
        }
        if self.is_primary() {
            self.timeouts.timeout(dur, TimeoutKind::NullRequestSend);
        } else {
            self.arm_null_request_watchdog();
        }
    }

    fn arm_null_request_watchdog(&mut self) {
        let dur = self.config.null_request_timeout;
        if dur.is_zero() || self.is_primary() {
            return;
        }
        // twice the send interval, to ride out jitter
        self.timeouts.timeout(dur * 2, TimeoutKind::NullRequestRecv);
    }

    fn update_view_change_seq_no(&mut self) {
        self.update_view_change_seq_no_from(self.last_exec);
    }

    fn update_view_change_seq_no_from(&mut self, base: SeqNo) {
        if self.config.view_change_period == 0 {
            return;
        }
        let base = u64::from(base);
        let k = self.config.k;
        let target = base - base % k + k * self.config.view_change_period;
        self.view_change_seq_no = SeqNo::from(target);
    }

    // ------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------

    fn persist_pset_entry(&mut self, entry: &PqEntry) -> Result<()> {
        let key = format!("pset.{}", entry.sequence_number());
        let value = bincode::serialize(entry).wrapped(ErrorKind::PersistenceFailure)?;
        self.stack
            .store_state(&key, value)
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))
    }

    fn persist_qset_entry(&mut self, entry: &PqEntry) -> Result<()> {
        let key = format!(
            "qset.{}.{}.{:x}",
            entry.view(),
            entry.sequence_number(),
            entry.digest()
        );
        let value = bincode::serialize(entry).wrapped(ErrorKind::PersistenceFailure)?;
        self.stack
            .store_state(&key, value)
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))
    }

    fn persist_checkpoint(&mut self, seq: SeqNo, state_id: Digest) -> Result<()> {
        let key = format!("chkpt.{}", seq);
        let value = bincode::serialize(&state_id).wrapped(ErrorKind::PersistenceFailure)?;
        self.stack
            .store_state(&key, value)
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))
    }

    /// Deletes the records which fell below the low watermark `h`:
    /// evidence at or before it, checkpoints before it.
    fn gc_persisted(&mut self, h: SeqNo) -> Result<()> {
        let h = u64::from(h);
        let mut stale = Vec::new();
        for prefix in ["pset.", "qset."] {
            let records = self
                .stack
                .read_state_set(prefix)
                .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))?;
            for (key, _) in records {
                if Self::key_seq(&key).map(|seq| seq <= h).unwrap_or(false) {
                    stale.push(key);
                }
            }
        }
        let records = self
            .stack
            .read_state_set("chkpt.")
            .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))?;
        for (key, _) in records {
            if Self::key_seq(&key).map(|seq| seq < h).unwrap_or(false) {
                stale.push(key);
            }
        }
        for key in stale {
            self.stack
                .del_state(&key)
                .map_err(|e| e.swap_kind(ErrorKind::PersistenceFailure))?;
        }
        Ok(())
    }

    // parses the sequence number out of `pset.<n>`, `chkpt.<n>` and
    // `qset.<v>.<n>.<d>` keys
    fn key_seq(key: &str) -> Option<u64> {
        let mut parts = key.split('.');
        match parts.next()? {
            "pset" | "chkpt" => parts.next()?.parse().ok(),
            "qset" => {
                let _view = parts.next()?;
                parts.next()?.parse().ok()
            }
            _ => None,
        }
    }
}
