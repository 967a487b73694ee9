//! The view synchronization sub-protocol.
//!
//! This code allows a replica to change its view, where a new
//! primary is elected, without regressing on sequence numbers the
//! old view already agreed on. The new primary justifies the view it
//! installs with a quorum of view change votes; every replica
//! recomputes the initial checkpoint and the per sequence number
//! assignments from those votes, and refuses a new view it cannot
//! reproduce.

use smallvec::SmallVec;

use crate::pbft::collections::{self, HashMap};
use crate::pbft::crypto::hash::Digest;
use crate::pbft::error::*;
use crate::pbft::message::{CheckpointProof, NewViewMessage, NodeId, ViewChangeMessage};
use crate::pbft::ordering::{Orderable, SeqNo};

/// The static parameters of the BFT system.
#[derive(Debug, Copy, Clone)]
pub struct SystemParams {
    n: usize,
    f: usize,
}

impl SystemParams {
    /// Creates a new set of system parameters, checking `n >= 3*f + 1`.
    pub fn new(n: usize, f: usize) -> Result<Self> {
        if n < 3 * f + 1 {
            return Err("Invalid number of replicas").wrapped(ErrorKind::Sync);
        }
        Ok(Self { n, f })
    }

    /// The number of replicas in the system.
    pub fn n(&self) -> usize {
        self.n
    }

    /// The number of replicas allowed to fail.
    pub fn f(&self) -> usize {
        self.f
    }

    /// The size of an intersecting quorum, `2*f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// The size of a weak certificate, `f + 1`, guaranteeing at least
    /// one non-faulty member.
    pub fn weak_quorum(&self) -> usize {
        self.f + 1
    }
}

/// A view of the system.
#[derive(Debug, Copy, Clone)]
pub struct ViewInfo {
    seq: SeqNo,
    params: SystemParams,
}

impl Orderable for ViewInfo {
    /// Returns the sequence number of this view.
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

impl ViewInfo {
    /// Creates a new instance of `ViewInfo`.
    pub fn new(seq: SeqNo, params: SystemParams) -> Self {
        Self { seq, params }
    }

    /// Returns the primary of the current view.
    pub fn leader(&self) -> NodeId {
        NodeId::from((u64::from(self.seq) % self.params.n as u64) as u32)
    }

    /// Returns the parameters of the system this view belongs to.
    pub fn params(&self) -> &SystemParams {
        &self.params
    }

    /// Returns the view following this one.
    pub fn next(&self) -> ViewInfo {
        Self {
            seq: self.seq.next(),
            params: self.params,
        }
    }
}

/// Represents the view change vote store of a replica, together with
/// the algorithms electing the state of a new view.
pub struct Synchronizer {
    view: ViewInfo,
    // indexed by (view, sender)
    view_changes: HashMap<(SeqNo, NodeId), ViewChangeMessage>,
}

impl Orderable for Synchronizer {
    /// Returns the sequence number of the view tracked by this
    /// `Synchronizer`.
    fn sequence_number(&self) -> SeqNo {
        self.view.sequence_number()
    }
}

/// Checks the internal consistency of a view change vote: evidence
/// must come from views before the one being voted on, and must lie
/// inside the log window advertised by the sender.
pub fn correct_view_change(vc: &ViewChangeMessage, log_size: u64) -> bool {
    let view = vc.sequence_number();
    let window_end = vc.h().advanced(log_size);
    let pq_ok = vc.pset().iter().chain(vc.qset().iter()).all(|entry| {
        entry.view() < view
            && entry.sequence_number() > vc.h()
            && entry.sequence_number() <= window_end
    });
    let c_ok = vc
        .cset()
        .iter()
        .all(|proof| proof.sequence_number() >= vc.h() && proof.sequence_number() <= window_end);
    pq_ok && c_ok
}

impl Synchronizer {
    /// Creates a new `Synchronizer`, tracking the given view.
    pub fn new(view: ViewInfo) -> Self {
        Self {
            view,
            view_changes: collections::hash_map(),
        }
    }

    /// Returns the view this replica is in.
    pub fn view(&self) -> &ViewInfo {
        &self.view
    }

    /// Installs a new view, dropping the votes of the views it
    /// supersedes.
    pub fn install_view(&mut self, view: ViewInfo) {
        let current = view.sequence_number();
        self.view = view;
        self.view_changes.retain(|(v, _), _| *v >= current);
    }

    /// Stores a view change vote, after checking its internal
    /// consistency. The first vote of a sender for a view wins.
    pub fn register_view_change(&mut self, vc: ViewChangeMessage, log_size: u64) -> Result<()> {
        if !correct_view_change(&vc, log_size) {
            return Err("Inconsistent evidence in view change vote").wrapped(ErrorKind::Sync);
        }
        let key = (vc.sequence_number(), vc.from());
        self.view_changes.entry(key).or_insert(vc);
        Ok(())
    }

    /// Checks if a vote from `sender` for `view` is stored.
    pub fn has_vote(&self, view: SeqNo, sender: NodeId) -> bool {
        self.view_changes.contains_key(&(view, sender))
    }

    /// The number of votes stored for `view`.
    pub fn vote_count(&self, view: SeqNo) -> usize {
        self.view_changes.keys().filter(|(v, _)| *v == view).count()
    }

    /// The votes stored for `view`, ordered by sender.
    pub fn votes_for(&self, view: SeqNo) -> Vec<&ViewChangeMessage> {
        let mut votes: Vec<_> = self
            .view_changes
            .iter()
            .filter(|((v, _), _)| *v == view)
            .map(|(_, vc)| vc)
            .collect();
        votes.sort_by_key(|vc| vc.from());
        votes
    }

    /// The smallest view past `view` voted for by at least `count`
    /// distinct replicas, if any. Used to join a view change the rest
    /// of the system already engaged in.
    pub fn joinable_view(&self, view: SeqNo, count: usize) -> Option<SeqNo> {
        let mut per_sender: HashMap<NodeId, SeqNo> = collections::hash_map();
        for (v, sender) in self.view_changes.keys() {
            if *v <= view {
                continue;
            }
            match per_sender.get(sender) {
                Some(stored) if *stored <= *v => (),
                _ => {
                    per_sender.insert(*sender, *v);
                }
            }
        }
        if per_sender.len() >= count {
            per_sender.values().min().copied()
        } else {
            None
        }
    }

    /// As the primary of the tracked view, assembles a new view
    /// message from the stored votes.
    ///
    /// Returns `None` while the vote quorum, or the evidence inside
    /// it, is still incomplete.
    pub fn assemble_new_view(&self, id: NodeId, log_size: u64) -> Option<NewViewMessage> {
        let view = self.view.sequence_number();
        let params = self.view.params();
        let votes = self.votes_for(view);
        if votes.len() < params.quorum() || !self.has_vote(view, id) {
            return None;
        }
        let cp = Self::select_initial_checkpoint(&votes[..], params)?;
        let xset =
            Self::assign_sequence_numbers(&votes[..], cp.sequence_number(), log_size, params)?;
        let vset = votes.into_iter().cloned().collect();
        Some(NewViewMessage::new(view, vset, xset, id))
    }

    /// Validates a new view message against its embedded votes,
    /// reproducing the initial checkpoint and the sequence number
    /// assignments the primary claims.
    pub fn validate_new_view(
        &self,
        nv: &NewViewMessage,
        log_size: u64,
    ) -> Result<(CheckpointProof, Vec<(SeqNo, Option<Digest>)>)> {
        let params = self.view.params();
        let view = nv.sequence_number();

        let mut senders = collections::hash_set();
        for vc in nv.vset() {
            if vc.sequence_number() != view {
                return Err("Embedded vote names another view").wrapped(ErrorKind::WrongView);
            }
            if !senders.insert(vc.from()) {
                return Err("Duplicate vote sender").wrapped(ErrorKind::Sync);
            }
            if !correct_view_change(vc, log_size) {
                return Err("Inconsistent evidence in embedded vote").wrapped(ErrorKind::Sync);
            }
        }
        if nv.vset().len() < params.quorum() {
            return Err("New view lacks a vote quorum").wrapped(ErrorKind::Sync);
        }

        let votes: Vec<&ViewChangeMessage> = nv.vset().iter().collect();
        let cp = Self::select_initial_checkpoint(&votes[..], params)
            .ok_or_else(|| Error::wrapped(ErrorKind::Sync, "No certified initial checkpoint"))?;
        let xset =
            Self::assign_sequence_numbers(&votes[..], cp.sequence_number(), log_size, params)
                .ok_or_else(|| {
                    Error::wrapped(ErrorKind::Sync, "Incomplete sequence number evidence")
                })?;
        if xset[..] != *nv.xset() {
            return Err("Assignments disagree with the embedded votes").wrapped(ErrorKind::Sync);
        }
        Ok((cp, xset))
    }

    /// Elects the checkpoint a new view resumes from.
    ///
    /// The winner is the highest checkpoint proven stable by a quorum
    /// of votes and reachable by a weak certificate of them; the
    /// maximum of the prepared evidence plays no part here, on
    /// purpose, as resuming from it would outrun the stable prefix of
    /// the log.
    pub fn select_initial_checkpoint(
        votes: &[&ViewChangeMessage],
        params: &SystemParams,
    ) -> Option<CheckpointProof> {
        let mut best: Option<CheckpointProof> = None;
        for vc in votes {
            for proof in vc.cset() {
                let seq = proof.sequence_number();
                match best {
                    Some(b) if b.sequence_number() >= seq => continue,
                    _ => (),
                }
                let reachable = votes.iter().filter(|m| m.h() <= seq).count();
                if reachable < params.weak_quorum() {
                    continue;
                }
                let certified = votes
                    .iter()
                    .filter(|m| {
                        m.cset()
                            .iter()
                            .any(|p| p.sequence_number() == seq && p.state_id() == proof.state_id())
                    })
                    .count();
                if certified < params.quorum() {
                    continue;
                }
                best = Some(*proof);
            }
        }
        best
    }

    /// Assigns a digest, or the null request, to every sequence
    /// number in the window following the initial checkpoint `cp_seq`.
    ///
    /// A digest wins a slot when a quorum of votes does not
    /// contradict its prepared evidence and a weak certificate
    /// pre-prepared it; a slot no vote prepared is filled with the
    /// null request. Returns `None` when neither case can be proven
    /// yet. Trailing null assignments are pruned.
    pub fn assign_sequence_numbers(
        votes: &[&ViewChangeMessage],
        cp_seq: SeqNo,
        log_size: u64,
        params: &SystemParams,
    ) -> Option<Vec<(SeqNo, Option<Digest>)>> {
        let mut assignments = Vec::new();

        'next_seq: for offset in 1..=log_size {
            let seq = cp_seq.advanced(offset);

            // candidate (digest, view) pairs, tried from the highest
            // view down so every replica breaks ties identically
            let mut candidates: SmallVec<[(SeqNo, Digest); 8]> = SmallVec::new();
            for vc in votes {
                for entry in vc.pset() {
                    if entry.sequence_number() != seq {
                        continue;
                    }
                    let candidate = (entry.view(), entry.digest());
                    if !candidates.contains(&candidate) {
                        candidates.push(candidate);
                    }
                }
            }
            candidates.sort_by(|a, b| b.cmp(a));

            for (view, digest) in candidates {
                let uncontradicted = votes
                    .iter()
                    .filter(|m| {
                        m.h() < seq
                            && m.pset()
                                .iter()
                                .filter(|e| e.sequence_number() == seq)
                                .all(|e| {
                                    e.view() < view
                                        || (e.view() == view && e.digest() == digest)
                                })
                    })
                    .count();
                if uncontradicted < params.quorum() {
                    continue;
                }
                let pre_prepared = votes
                    .iter()
                    .filter(|m| {
                        m.qset().iter().any(|e| {
                            e.sequence_number() == seq
                                && e.digest() == digest
                                && e.view() >= view
                        })
                    })
                    .count();
                if pre_prepared < params.weak_quorum() {
                    continue;
                }
                assignments.push((seq, Some(digest)));
                continue 'next_seq;
            }

            let unprepared = votes
                .iter()
                .filter(|m| {
                    m.h() < seq && m.pset().iter().all(|e| e.sequence_number() != seq)
                })
                .count();
            if unprepared >= params.quorum() {
                assignments.push((seq, None));
                continue 'next_seq;
            }

            // neither a certified digest nor a certified hole; more
            // votes are needed before the view can be installed
            return None;
        }

        while let Some((_, None)) = assignments.last() {
            assignments.pop();
        }
        Some(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbft::message::PqEntry;

    fn params() -> SystemParams {
        SystemParams::new(4, 1).unwrap()
    }

    fn digest_of(b: &[u8]) -> Digest {
        Digest::hash(b)
    }

    fn vote(
        from: u32,
        h: u64,
        cset: Vec<(u64, Digest)>,
        pset: Vec<(u64, Digest, u64)>,
        qset: Vec<(u64, Digest, u64)>,
    ) -> ViewChangeMessage {
        ViewChangeMessage::new(
            SeqNo::from(1),
            SeqNo::from(h),
            cset.into_iter()
                .map(|(n, id)| CheckpointProof::new(SeqNo::from(n), id))
                .collect(),
            pset.into_iter()
                .map(|(n, d, v)| PqEntry::new(SeqNo::from(n), d, SeqNo::from(v)))
                .collect(),
            qset.into_iter()
                .map(|(n, d, v)| PqEntry::new(SeqNo::from(n), d, SeqNo::from(v)))
                .collect(),
            NodeId::from(from),
        )
    }

    #[test]
    fn test_system_params() {
        assert!(SystemParams::new(4, 1).is_ok());
        assert!(SystemParams::new(3, 1).is_err());
        let p = SystemParams::new(7, 2).unwrap();
        assert_eq!(p.n(), 7);
        assert_eq!(p.f(), 2);
        assert_eq!(p.quorum(), 5);
        assert_eq!(p.weak_quorum(), 3);
    }

    #[test]
    fn test_leader_rotates() {
        let params = params();
        assert_eq!(ViewInfo::new(SeqNo::ZERO, params).leader(), NodeId::from(0));
        assert_eq!(ViewInfo::new(SeqNo::ZERO, params).next().leader(), NodeId::from(1));
        assert_eq!(ViewInfo::new(SeqNo::from(5), params).leader(), NodeId::from(1));
    }

    #[test]
    fn test_initial_checkpoint_follows_proof_quorum() {
        let params = params();
        let id2 = digest_of(b"state at two");
        let d3 = digest_of(b"op three");

        // three votes prove a stable checkpoint at 2; a fourth vote
        // carries prepared evidence up to 3, which must not win
        let votes = vec![
            vote(0, 2, vec![(2, id2)], vec![(3, d3, 0)], vec![(3, d3, 0)]),
            vote(1, 2, vec![(2, id2)], vec![(3, d3, 0)], vec![(3, d3, 0)]),
            vote(2, 2, vec![(2, id2)], vec![(3, d3, 0)], vec![(3, d3, 0)]),
            vote(3, 0, vec![], vec![], vec![]),
        ];
        let votes: Vec<&ViewChangeMessage> = votes.iter().collect();

        let cp = Synchronizer::select_initial_checkpoint(&votes[..], &params).unwrap();
        assert_eq!(cp.sequence_number(), SeqNo::from(2));
        assert_eq!(cp.state_id(), id2);
    }

    #[test]
    fn test_initial_checkpoint_needs_proof_quorum() {
        let params = params();
        let id2 = digest_of(b"state at two");
        let id0 = digest_of(b"genesis");

        // only two votes prove the checkpoint at 2, one short of a
        // quorum; the genesis checkpoint certified by all wins instead
        let votes = vec![
            vote(0, 0, vec![(0, id0), (2, id2)], vec![], vec![]),
            vote(1, 0, vec![(0, id0), (2, id2)], vec![], vec![]),
            vote(2, 0, vec![(0, id0)], vec![], vec![]),
            vote(3, 0, vec![(0, id0)], vec![], vec![]),
        ];
        let votes: Vec<&ViewChangeMessage> = votes.iter().collect();

        let cp = Synchronizer::select_initial_checkpoint(&votes[..], &params).unwrap();
        assert_eq!(cp.sequence_number(), SeqNo::ZERO);
        assert_eq!(cp.state_id(), id0);
    }

    #[test]
    fn test_assignments_fill_holes_with_null() {
        let params = params();
        let id2 = digest_of(b"state at two");
        let d4 = digest_of(b"op four");

        // sequence number 3 was never prepared, 4 was prepared by two
        // votes and pre-prepared by a weak certificate
        let votes = vec![
            vote(0, 2, vec![(2, id2)], vec![(4, d4, 0)], vec![(4, d4, 0)]),
            vote(1, 2, vec![(2, id2)], vec![(4, d4, 0)], vec![(4, d4, 0)]),
            vote(2, 2, vec![(2, id2)], vec![], vec![]),
            vote(3, 0, vec![], vec![], vec![]),
        ];
        let votes: Vec<&ViewChangeMessage> = votes.iter().collect();

        let xset =
            Synchronizer::assign_sequence_numbers(&votes[..], SeqNo::from(2), 6, &params).unwrap();
        assert_eq!(
            xset,
            vec![(SeqNo::from(3), None), (SeqNo::from(4), Some(d4))]
        );
    }

    #[test]
    fn test_assignments_tie_break_on_higher_view() {
        let params = params();
        let d_old = digest_of(b"old");
        let d_new = digest_of(b"new");

        // the same slot prepared under two views; the higher view wins
        let votes = vec![
            vote(0, 0, vec![], vec![(1, d_new, 1)], vec![(1, d_new, 1)]),
            vote(1, 0, vec![], vec![(1, d_new, 1)], vec![(1, d_new, 1)]),
            vote(2, 0, vec![], vec![(1, d_old, 0)], vec![(1, d_old, 0)]),
            vote(3, 0, vec![], vec![], vec![]),
        ];
        let votes: Vec<&ViewChangeMessage> = votes.iter().collect();

        let xset =
            Synchronizer::assign_sequence_numbers(&votes[..], SeqNo::ZERO, 4, &params).unwrap();
        assert_eq!(xset, vec![(SeqNo::from(1), Some(d_new))]);
    }

    #[test]
    fn test_assignments_wait_for_evidence() {
        let params = params();
        let d1 = digest_of(b"op one");

        // two votes prepared slot 1 but no weak certificate
        // pre-prepared it, and two votes say nothing; neither case is
        // certain yet
        let votes = vec![
            vote(0, 0, vec![], vec![(1, d1, 0)], vec![]),
            vote(1, 0, vec![], vec![(1, d1, 0)], vec![]),
            vote(2, 0, vec![], vec![], vec![]),
            vote(3, 0, vec![], vec![], vec![]),
        ];
        let votes: Vec<&ViewChangeMessage> = votes.iter().collect();

        assert!(
            Synchronizer::assign_sequence_numbers(&votes[..], SeqNo::ZERO, 4, &params).is_none()
        );
    }

    #[test]
    fn test_vote_consistency() {
        let d = digest_of(b"op");
        // evidence from the view being voted on is nonsense
        let bad = vote(0, 0, vec![], vec![(1, d, 1)], vec![]);
        assert!(!correct_view_change(&bad, 4));
        // evidence outside the advertised window is nonsense
        let bad = vote(0, 2, vec![], vec![(1, d, 0)], vec![]);
        assert!(!correct_view_change(&bad, 4));
        let good = vote(0, 0, vec![], vec![(1, d, 0)], vec![]);
        assert!(correct_view_change(&good, 4));
    }

    fn vote_at(view: u64, from: u32) -> ViewChangeMessage {
        ViewChangeMessage::new(
            SeqNo::from(view),
            SeqNo::ZERO,
            vec![],
            vec![],
            vec![],
            NodeId::from(from),
        )
    }

    #[test]
    fn test_join_rule() {
        let mut sync = Synchronizer::new(ViewInfo::new(SeqNo::ZERO, params()));

        sync.register_view_change(vote_at(1, 1), 4).unwrap();
        assert_eq!(sync.vote_count(SeqNo::from(1)), 1);
        assert_eq!(sync.joinable_view(SeqNo::ZERO, 2), None);

        sync.register_view_change(vote_at(2, 2), 4).unwrap();
        // two distinct senders past view 0; the smallest such view wins
        assert_eq!(sync.joinable_view(SeqNo::ZERO, 2), Some(SeqNo::from(1)));
    }
}
