//! A module to manage the replica's message log between checkpoints.
//!
//! The log stores one certificate per `(view, seq)` slot inside the
//! watermark window, the request payloads known to this replica, the
//! prepared and pre-prepared evidence sets carried across view
//! changes, and the checkpoint advertisements collected from peers.

use either::{Left, Right};

use crate::pbft::collections::{self, HashMap, HashSet, OrderedMap};
use crate::pbft::crypto::hash::Digest;
use crate::pbft::error::*;
use crate::pbft::message::{CheckpointProof, ConsensusMessage, NodeId, PqEntry, RequestMessage};
use crate::pbft::ordering::{Orderable, SeqNo};

/// A quorum certificate being assembled for a `(view, seq)` slot.
///
/// Holds the pre-prepare binding a digest to the slot, the prepare
/// and commit votes keyed by sender, and the phase flags. For any
/// slot, at most one digest is ever bound.
#[derive(Debug)]
pub struct Certificate {
    digest: Option<Digest>,
    request: Option<RequestMessage>,
    pre_prepare: Option<ConsensusMessage>,
    prepares: HashMap<NodeId, Digest>,
    commits: HashMap<NodeId, Digest>,
    pre_prepared: bool,
    prepared: bool,
    committed: bool,
}

impl Certificate {
    fn new() -> Self {
        Self {
            digest: None,
            request: None,
            pre_prepare: None,
            prepares: collections::hash_map(),
            commits: collections::hash_map(),
            pre_prepared: false,
            prepared: false,
            committed: false,
        }
    }

    /// The digest bound to this slot, if a pre-prepare was accepted.
    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    /// The request bound to this slot, if its payload is known.
    pub fn request(&self) -> Option<&RequestMessage> {
        self.request.as_ref()
    }

    /// The pre-prepare accepted for this slot, if any.
    pub fn pre_prepare(&self) -> Option<&ConsensusMessage> {
        self.pre_prepare.as_ref()
    }

    pub fn is_pre_prepared(&self) -> bool {
        self.pre_prepared
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Binds `digest` and its request to this slot.
    ///
    /// Fails with `ErrorKind::DuplicatePrePrepare` if a different
    /// digest was already bound.
    pub fn install_pre_prepare(
        &mut self,
        message: ConsensusMessage,
        digest: Digest,
        request: RequestMessage,
    ) -> Result<()> {
        match self.digest {
            Some(d) if d != digest => {
                return Err("A different digest is bound to this slot")
                    .wrapped(ErrorKind::DuplicatePrePrepare);
            }
            _ => (),
        }
        self.digest = Some(digest);
        self.request = Some(request);
        self.pre_prepare = Some(message);
        self.pre_prepared = true;
        Ok(())
    }

    /// Stores a prepare vote. The first vote of a sender wins;
    /// reports whether the vote was stored.
    pub fn add_prepare(&mut self, from: NodeId, digest: Digest) -> bool {
        if self.prepares.contains_key(&from) {
            return false;
        }
        self.prepares.insert(from, digest);
        true
    }

    /// Stores a commit vote. The first vote of a sender wins;
    /// reports whether the vote was stored.
    pub fn add_commit(&mut self, from: NodeId, digest: Digest) -> bool {
        if self.commits.contains_key(&from) {
            return false;
        }
        self.commits.insert(from, digest);
        true
    }

    /// Counts the prepare votes matching `digest`.
    pub fn matching_prepares(&self, digest: Digest) -> usize {
        self.prepares.values().filter(|d| **d == digest).count()
    }

    /// Counts the commit votes matching `digest`.
    pub fn matching_commits(&self, digest: Digest) -> usize {
        self.commits.values().filter(|d| **d == digest).count()
    }

    pub fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    pub fn mark_committed(&mut self) {
        self.committed = true;
    }
}

/// Represents the log of messages received by a replica, sliding
/// between its low and high watermarks.
pub struct Log {
    h: SeqNo,
    log_size: u64,
    certs: HashMap<(SeqNo, SeqNo), Certificate>,
    requests: OrderedMap<Digest, RequestMessage>,
    pset: HashMap<SeqNo, PqEntry>,
    qset: HashMap<(SeqNo, Digest), PqEntry>,
    // own checkpoints, including the last stable one
    chkpts: HashMap<SeqNo, Digest>,
    // peer advertisements inside the watermark window
    checkpoints: HashMap<(SeqNo, Digest), HashSet<NodeId>>,
    // advertisements past the high watermark; bounded, evicting the
    // oldest group, so quorum scans stay cheap under hostile traffic
    hi_checkpoints: OrderedMap<(SeqNo, Digest), HashSet<NodeId>>,
    hi_cap: usize,
}

impl Orderable for Log {
    /// Returns the low watermark of this log.
    fn sequence_number(&self) -> SeqNo {
        self.h
    }
}

impl Log {
    /// Creates a new message log holding `log_size` slots, keeping at
    /// most `hi_cap` distinct checkpoint groups past the high
    /// watermark.
    pub fn new(log_size: u64, hi_cap: usize) -> Self {
        Self {
            h: SeqNo::ZERO,
            log_size,
            certs: collections::hash_map(),
            requests: collections::ordered_map(),
            pset: collections::hash_map(),
            qset: collections::hash_map(),
            chkpts: collections::hash_map(),
            checkpoints: collections::hash_map(),
            hi_checkpoints: collections::ordered_map(),
            hi_cap,
        }
    }

    pub fn low_watermark(&self) -> SeqNo {
        self.h
    }

    pub fn high_watermark(&self) -> SeqNo {
        self.h.advanced(self.log_size)
    }

    pub fn log_size(&self) -> u64 {
        self.log_size
    }

    /// Checks if `seq` lies inside the watermark window.
    pub fn in_watermarks(&self, seq: SeqNo) -> bool {
        match seq.index(self.h) {
            Right(offset) => offset as u64 <= self.log_size,
            Left(_) => false,
        }
    }

    /// Returns the certificate of the `(view, seq)` slot, creating it
    /// on demand.
    ///
    /// Fails with `ErrorKind::OutsideWatermarks` when `seq` does not
    /// lie inside the watermark window.
    pub fn get_cert(&mut self, view: SeqNo, seq: SeqNo) -> Result<&mut Certificate> {
        if !self.in_watermarks(seq) {
            return Err("Sequence number outside the watermark window")
                .wrapped(ErrorKind::OutsideWatermarks);
        }
        Ok(self
            .certs
            .entry((view, seq))
            .or_insert_with(Certificate::new))
    }

    /// Returns the certificate of the `(view, seq)` slot, if one was
    /// created.
    pub fn cert(&self, view: SeqNo, seq: SeqNo) -> Option<&Certificate> {
        self.certs.get(&(view, seq))
    }

    /// Same as `cert()`, but exclusive.
    pub fn cert_mut(&mut self, view: SeqNo, seq: SeqNo) -> Option<&mut Certificate> {
        self.certs.get_mut(&(view, seq))
    }

    /// Stores the payload of a request, if it is not known yet.
    pub fn insert_request(&mut self, digest: Digest, request: RequestMessage) {
        if !self.requests.contains_key(&digest) {
            self.requests.insert(digest, request);
        }
    }

    /// Checks if this `Log` has a particular request with the given
    /// `digest`.
    pub fn has_request(&self, digest: &Digest) -> bool {
        self.requests.contains_key(digest)
    }

    pub fn request(&self, digest: &Digest) -> Option<&RequestMessage> {
        self.requests.get(digest)
    }

    pub fn remove_request(&mut self, digest: &Digest) -> Option<RequestMessage> {
        self.requests.remove(digest)
    }

    /// Records prepared evidence, keeping the highest view per
    /// sequence number.
    pub fn record_pset(&mut self, entry: PqEntry) {
        match self.pset.get(&entry.sequence_number()) {
            Some(stored) if stored.view() >= entry.view() => (),
            _ => {
                self.pset.insert(entry.sequence_number(), entry);
            }
        }
    }

    /// Records pre-prepared evidence, keeping the highest view per
    /// `(seq, digest)` pair.
    pub fn record_qset(&mut self, entry: PqEntry) {
        let key = (entry.sequence_number(), entry.digest());
        match self.qset.get(&key) {
            Some(stored) if stored.view() >= entry.view() => (),
            _ => {
                self.qset.insert(key, entry);
            }
        }
    }

    /// Checks whether `digest` was pre-prepared at the `(view, seq)`
    /// slot, either in the live certificates or in the recorded
    /// evidence.
    pub fn pre_prepared(&self, digest: Digest, view: SeqNo, seq: SeqNo) -> bool {
        if let Some(cert) = self.certs.get(&(view, seq)) {
            if cert.is_pre_prepared() && cert.digest() == Some(digest) {
                return true;
            }
        }
        self.qset
            .get(&(seq, digest))
            .map(|e| e.view() == view)
            .unwrap_or(false)
    }

    /// Computes the prepared evidence set advertised in a view
    /// change, merging the live certificates into the recorded
    /// entries.
    pub fn calc_pset(&self) -> Vec<PqEntry> {
        let mut merged: HashMap<SeqNo, PqEntry> = self.pset.clone();
        for ((view, seq), cert) in self.certs.iter() {
            if !cert.is_prepared() {
                continue;
            }
            let digest = match cert.digest() {
                Some(d) => d,
                None => continue,
            };
            match merged.get(seq) {
                Some(stored) if stored.view() >= *view => (),
                _ => {
                    merged.insert(*seq, PqEntry::new(*seq, digest, *view));
                }
            }
        }
        let mut entries: Vec<_> = merged.into_iter().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| (e.sequence_number(), e.view()));
        entries
    }

    /// Computes the pre-prepared evidence set advertised in a view
    /// change, merging the live certificates into the recorded
    /// entries.
    pub fn calc_qset(&self) -> Vec<PqEntry> {
        let mut merged: HashMap<(SeqNo, Digest), PqEntry> = self.qset.clone();
        for ((view, seq), cert) in self.certs.iter() {
            if !cert.is_pre_prepared() {
                continue;
            }
            let digest = match cert.digest() {
                Some(d) => d,
                None => continue,
            };
            let key = (*seq, digest);
            match merged.get(&key) {
                Some(stored) if stored.view() >= *view => (),
                _ => {
                    merged.insert(key, PqEntry::new(*seq, digest, *view));
                }
            }
        }
        let mut entries: Vec<_> = merged.into_iter().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| (e.sequence_number(), e.view(), e.digest()));
        entries
    }

    /// Replaces the recorded prepared evidence, reporting the entries
    /// now stored.
    pub fn set_pset(&mut self, entries: &[PqEntry]) {
        self.pset.clear();
        for entry in entries {
            self.pset.insert(entry.sequence_number(), *entry);
        }
    }

    /// Replaces the recorded pre-prepared evidence.
    pub fn set_qset(&mut self, entries: &[PqEntry]) {
        self.qset.clear();
        for entry in entries {
            self.qset
                .insert((entry.sequence_number(), entry.digest()), *entry);
        }
    }

    /// The checkpoint proofs this replica holds, by increasing
    /// sequence number.
    pub fn cset(&self) -> Vec<CheckpointProof> {
        let mut proofs: Vec<_> = self
            .chkpts
            .iter()
            .map(|(seq, id)| CheckpointProof::new(*seq, *id))
            .collect();
        proofs.sort_by_key(|p| p.sequence_number());
        proofs
    }

    /// Notes a checkpoint produced by this replica.
    pub fn note_own_checkpoint(&mut self, seq: SeqNo, state_id: Digest) {
        self.chkpts.insert(seq, state_id);
    }

    /// The state id of this replica's checkpoint at `seq`, if any.
    pub fn own_checkpoint(&self, seq: SeqNo) -> Option<Digest> {
        self.chkpts.get(&seq).copied()
    }

    /// Stores a checkpoint advertisement, reporting how many distinct
    /// replicas advertised the same `(seq, state_id)`.
    ///
    /// Advertisements past the high watermark land in the bounded
    /// evidence list instead of the window groups.
    pub fn add_checkpoint(&mut self, seq: SeqNo, state_id: Digest, from: NodeId) -> usize {
        if seq <= self.h {
            return 0;
        }
        let key = (seq, state_id);
        if seq <= self.high_watermark() {
            let group = self
                .checkpoints
                .entry(key)
                .or_insert_with(collections::hash_set);
            group.insert(from);
            group.len()
        } else {
            if let Some(group) = self.hi_checkpoints.get_mut(&key) {
                group.insert(from);
                return group.len();
            }
            if self.hi_checkpoints.len() >= self.hi_cap {
                self.hi_checkpoints.pop_front();
            }
            let mut group = collections::hash_set();
            group.insert(from);
            self.hi_checkpoints.insert(key, group);
            1
        }
    }

    /// Scans the beyond-the-window evidence for a checkpoint
    /// advertised by at least `weak_quorum` replicas, reporting its
    /// coordinates and the replicas holding it.
    pub fn hi_checkpoint_cert(&self, weak_quorum: usize) -> Option<(SeqNo, Digest, Vec<NodeId>)> {
        for ((seq, state_id), group) in self.hi_checkpoints.iter() {
            if group.len() >= weak_quorum {
                let mut peers: Vec<_> = group.iter().copied().collect();
                peers.sort();
                return Some((*seq, *state_id, peers));
            }
        }
        None
    }

    /// Slides the watermark window up to `new_h`, garbage collecting
    /// every record at or below it. Checkpoints keep the record at
    /// `new_h` itself, which is the latest stable one.
    pub fn move_watermarks(&mut self, new_h: SeqNo) {
        if new_h <= self.h {
            return;
        }
        self.h = new_h;
        self.certs.retain(|(_, seq), _| *seq > new_h);
        self.pset.retain(|seq, _| *seq > new_h);
        self.qset.retain(|(seq, _), _| *seq > new_h);
        self.chkpts.retain(|seq, _| *seq >= new_h);
        self.checkpoints.retain(|(seq, _), _| *seq > new_h);
        let stale: Vec<_> = self
            .hi_checkpoints
            .keys()
            .filter(|(seq, _)| *seq <= new_h)
            .copied()
            .collect();
        for key in stale {
            self.hi_checkpoints.remove(&key);
        }
    }

    /// Drops the certificates of views before `view`; their prepared
    /// and pre-prepared evidence lives on in the recorded sets.
    pub fn drop_certs_below_view(&mut self, view: SeqNo) {
        self.certs.retain(|(v, _), _| *v >= view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbft::message::ConsensusMessageKind;

    fn digest_of(b: &[u8]) -> Digest {
        Digest::hash(b)
    }

    fn pre_prepare(view: SeqNo, seq: SeqNo, from: NodeId, payload: &[u8]) -> (ConsensusMessage, Digest, RequestMessage) {
        let request = RequestMessage::new(1, payload.to_vec(), from);
        let digest = request.digest().unwrap();
        let message = ConsensusMessage::new(
            view,
            seq,
            from,
            ConsensusMessageKind::PrePrepare(digest, request.clone()),
        );
        (message, digest, request)
    }

    #[test]
    fn test_prepared_committed_counting() {
        let mut log = Log::new(4, 2);
        let view = SeqNo::ZERO;
        let seq = SeqNo::from(1);
        let (message, digest, request) = pre_prepare(view, seq, NodeId::from(0), b"op");

        let cert = log.get_cert(view, seq).unwrap();
        cert.install_pre_prepare(message, digest, request).unwrap();
        assert!(cert.is_pre_prepared());

        // 2f matching prepares, f = 1
        assert!(cert.add_prepare(NodeId::from(1), digest));
        assert!(!cert.add_prepare(NodeId::from(1), digest));
        assert!(cert.add_prepare(NodeId::from(2), digest));
        assert_eq!(cert.matching_prepares(digest), 2);

        for id in 0u32..3 {
            assert!(cert.add_commit(NodeId::from(id), digest));
        }
        assert_eq!(cert.matching_commits(digest), 3);
    }

    #[test]
    fn test_conflicting_pre_prepare_is_refused() {
        let mut log = Log::new(4, 2);
        let view = SeqNo::ZERO;
        let seq = SeqNo::from(1);
        let (m1, d1, r1) = pre_prepare(view, seq, NodeId::from(0), b"op one");
        let (m2, d2, r2) = pre_prepare(view, seq, NodeId::from(0), b"op two");
        assert_ne!(d1, d2);

        let cert = log.get_cert(view, seq).unwrap();
        cert.install_pre_prepare(m1, d1, r1).unwrap();
        let err = cert.install_pre_prepare(m2, d2, r2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicatePrePrepare);
        assert_eq!(cert.digest(), Some(d1));
    }

    #[test]
    fn test_watermark_window() {
        let mut log = Log::new(4, 2);
        assert!(!log.in_watermarks(SeqNo::ZERO));
        assert!(log.in_watermarks(SeqNo::from(1)));
        assert!(log.in_watermarks(SeqNo::from(4)));
        assert!(!log.in_watermarks(SeqNo::from(5)));

        let err = log.get_cert(SeqNo::ZERO, SeqNo::from(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutsideWatermarks);
    }

    #[test]
    fn test_garbage_collection() {
        let mut log = Log::new(4, 2);
        let view = SeqNo::ZERO;
        for n in 1u64..=4 {
            let (m, d, r) = pre_prepare(view, SeqNo::from(n), NodeId::from(0), &n.to_le_bytes());
            log.get_cert(view, SeqNo::from(n))
                .unwrap()
                .install_pre_prepare(m, d, r)
                .unwrap();
            log.record_qset(PqEntry::new(SeqNo::from(n), d, view));
        }
        log.note_own_checkpoint(SeqNo::from(2), digest_of(b"state"));

        log.move_watermarks(SeqNo::from(2));
        assert_eq!(log.low_watermark(), SeqNo::from(2));
        assert_eq!(log.high_watermark(), SeqNo::from(6));
        assert!(log.cert(view, SeqNo::from(1)).is_none());
        assert!(log.cert(view, SeqNo::from(2)).is_none());
        assert!(log.cert(view, SeqNo::from(3)).is_some());
        // the stable checkpoint itself survives
        assert!(log.own_checkpoint(SeqNo::from(2)).is_some());

        // watermarks never regress
        log.move_watermarks(SeqNo::from(1));
        assert_eq!(log.low_watermark(), SeqNo::from(2));
    }

    #[test]
    fn test_hi_checkpoint_eviction() {
        let mut log = Log::new(4, 2);
        // three distinct groups past the high watermark, cap is 2
        log.add_checkpoint(SeqNo::from(10), digest_of(b"a"), NodeId::from(0));
        log.add_checkpoint(SeqNo::from(12), digest_of(b"b"), NodeId::from(1));
        log.add_checkpoint(SeqNo::from(14), digest_of(b"c"), NodeId::from(2));

        // the oldest group was evicted, so a fresh advertisement of it
        // counts from scratch
        assert_eq!(log.add_checkpoint(SeqNo::from(10), digest_of(b"a"), NodeId::from(3)), 1);

        // a weak certificate forms on one of the surviving groups
        assert_eq!(log.add_checkpoint(SeqNo::from(14), digest_of(b"c"), NodeId::from(3)), 2);
        let (seq, state_id, peers) = log.hi_checkpoint_cert(2).unwrap();
        assert_eq!(seq, SeqNo::from(14));
        assert_eq!(state_id, digest_of(b"c"));
        assert_eq!(peers, vec![NodeId::from(2), NodeId::from(3)]);
    }

    #[test]
    fn test_request_store() {
        let mut log = Log::new(4, 2);
        let request = RequestMessage::new(1, b"op".to_vec(), NodeId::from(2));
        let digest = request.digest().unwrap();

        assert!(!log.has_request(&digest));
        log.insert_request(digest, request.clone());
        assert!(log.has_request(&digest));

        // a relayed copy does not clobber the stored one
        log.insert_request(digest, RequestMessage::new(1, b"op".to_vec(), NodeId::from(3)));
        assert_eq!(log.request(&digest).unwrap().from(), NodeId::from(2));

        assert!(log.remove_request(&digest).is_some());
        assert!(!log.has_request(&digest));
    }

    #[test]
    fn test_pre_prepared_from_recorded_evidence() {
        let mut log = Log::new(4, 2);
        let d = digest_of(b"op");
        log.record_qset(PqEntry::new(SeqNo::from(3), d, SeqNo::from(1)));
        assert!(log.pre_prepared(d, SeqNo::from(1), SeqNo::from(3)));
        assert!(!log.pre_prepared(d, SeqNo::from(2), SeqNo::from(3)));
        assert!(!log.pre_prepared(digest_of(b"other"), SeqNo::from(1), SeqNo::from(3)));
    }
}
