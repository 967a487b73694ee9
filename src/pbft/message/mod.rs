//! This module contains types associated with messages traded
//! between the system processes.
//!
//! Messages travel as length prefixed blobs, handed to this module
//! by the transport layer together with the authenticated identity
//! of their sender. A message whose declared sender does not match
//! the transport level one is refused.

use serde::{Deserialize, Serialize};

use crate::pbft::crypto::hash::{Context, Digest};
use crate::pbft::error::*;
use crate::pbft::ordering::{Orderable, SeqNo};

/// A `NodeId` represents the id of a process in the BFT system.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

impl From<NodeId> for u64 {
    #[inline]
    fn from(id: NodeId) -> u64 {
        id.0 as u64
    }
}

/// A `SystemMessage` corresponds to a message regarding one of the
/// replication sub-protocols.
///
/// This can be either a `Request` from a client, a `Consensus` message,
/// a `Checkpoint` advertisement, or one of the view synchronization
/// messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SystemMessage {
    Request(RequestMessage),
    Consensus(ConsensusMessage),
    Checkpoint(CheckpointMessage),
    ViewChange(ViewChangeMessage),
    NewView(NewViewMessage),
}

impl SystemMessage {
    /// Reports the declared sender of this message.
    pub fn from(&self) -> NodeId {
        match self {
            SystemMessage::Request(m) => m.from(),
            SystemMessage::Consensus(m) => m.from(),
            SystemMessage::Checkpoint(m) => m.from(),
            SystemMessage::ViewChange(m) => m.from(),
            SystemMessage::NewView(m) => m.from(),
        }
    }
}

/// Represents a request from a client.
///
/// The payload is an opaque operation to be performed over the
/// replicated state; its validation is the responsibility of the
/// process hosting the replica. Requests are content addressed, with
/// the timestamp disambiguating identical payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMessage {
    timestamp: u64,
    payload: Vec<u8>,
    from: NodeId,
}

impl RequestMessage {
    /// Creates a new `RequestMessage`.
    pub fn new(timestamp: u64, payload: Vec<u8>, from: NodeId) -> Self {
        Self {
            timestamp,
            payload,
            from,
        }
    }

    /// Creates the null request, proposed by the primary `from`
    /// when client traffic is idle.
    pub fn null(from: NodeId) -> Self {
        Self {
            timestamp: 0,
            payload: Vec::new(),
            from,
        }
    }

    /// Checks if this is the null request.
    pub fn is_null(&self) -> bool {
        self.timestamp == 0 && self.payload.is_empty()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..]
    }

    pub fn from(&self) -> NodeId {
        self.from
    }

    /// Returns the payload stored within this request.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Computes the content address of this request.
    ///
    /// The digest spans the wire encoding of the timestamp and the
    /// payload, so replicas derive the same name for a request no
    /// matter which of them relayed it.
    pub fn digest(&self) -> Result<Digest> {
        let encoded = bincode::serialize(&(self.timestamp, &self.payload))
            .wrapped(ErrorKind::Message)?;
        let mut ctx = Context::new();
        ctx.update(&encoded[..]);
        Ok(ctx.finish())
    }
}

/// Represents a message from the consensus sub-protocol.
///
/// Different types of consensus messages are represented in the
/// `ConsensusMessageKind` type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusMessage {
    view: SeqNo,
    seq: SeqNo,
    from: NodeId,
    kind: ConsensusMessageKind,
}

/// Represents one of many different consensus stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ConsensusMessageKind {
    /// Pre-prepare a request, according to the BFT protocol.
    ///
    /// The `Digest` is the content address of the carried request,
    /// and is verifiable against it.
    PrePrepare(Digest, RequestMessage),
    /// Prepare the request with the given content address.
    Prepare(Digest),
    /// Commit the request with the given content address, signaling
    /// the system is almost ready to execute it.
    Commit(Digest),
}

impl ConsensusMessage {
    /// Creates a new `ConsensusMessage` pertaining to the slot
    /// `(view, seq)`, of the kind `kind`.
    pub fn new(view: SeqNo, seq: SeqNo, from: NodeId, kind: ConsensusMessageKind) -> Self {
        Self {
            view,
            seq,
            from,
            kind,
        }
    }

    /// Returns the view this consensus message belongs to.
    pub fn view(&self) -> SeqNo {
        self.view
    }

    pub fn from(&self) -> NodeId {
        self.from
    }

    /// Returns a reference to the consensus message kind.
    pub fn kind(&self) -> &ConsensusMessageKind {
        &self.kind
    }

    /// Returns the consensus message kind, consuming this message.
    pub fn into_kind(self) -> ConsensusMessageKind {
        self.kind
    }

    /// Returns the content address this message votes for.
    pub fn proposed_digest(&self) -> &Digest {
        match &self.kind {
            ConsensusMessageKind::PrePrepare(d, _) => d,
            ConsensusMessageKind::Prepare(d) => d,
            ConsensusMessageKind::Commit(d) => d,
        }
    }
}

impl Orderable for ConsensusMessage {
    /// Returns the sequence number of this consensus message.
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// Advertises that the sender executed through a sequence number
/// which is a multiple of the checkpoint period, with `state_id`
/// naming the application state reached.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMessage {
    seq: SeqNo,
    state_id: Digest,
    from: NodeId,
}

impl CheckpointMessage {
    pub fn new(seq: SeqNo, state_id: Digest, from: NodeId) -> Self {
        Self {
            seq,
            state_id,
            from,
        }
    }

    pub fn state_id(&self) -> Digest {
        self.state_id
    }

    pub fn from(&self) -> NodeId {
        self.from
    }
}

impl Orderable for CheckpointMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// Evidence that the sender reached the prepared or pre-prepared
/// state for a sequence number, in the given view. Exchanged during
/// view changes and persisted across them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PqEntry {
    seq: SeqNo,
    digest: Digest,
    view: SeqNo,
}

impl PqEntry {
    pub fn new(seq: SeqNo, digest: Digest, view: SeqNo) -> Self {
        Self { seq, digest, view }
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn view(&self) -> SeqNo {
        self.view
    }
}

impl Orderable for PqEntry {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// Proof held by a replica that a checkpoint reached stability.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CheckpointProof {
    seq: SeqNo,
    state_id: Digest,
}

impl CheckpointProof {
    pub fn new(seq: SeqNo, state_id: Digest) -> Self {
        Self { seq, state_id }
    }

    pub fn state_id(&self) -> Digest {
        self.state_id
    }
}

impl Orderable for CheckpointProof {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// Vote to replace the primary, moving the system into `view`.
///
/// Carries the sender's low watermark, its checkpoint proofs, and its
/// prepared and pre-prepared evidence, from which the new primary
/// synchronizes the view it leads. The message is individually signed
/// so it can be embedded in a `NewView` and verified by third parties.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewChangeMessage {
    view: SeqNo,
    h: SeqNo,
    cset: Vec<CheckpointProof>,
    pset: Vec<PqEntry>,
    qset: Vec<PqEntry>,
    from: NodeId,
    signature: Vec<u8>,
}

impl ViewChangeMessage {
    pub fn new(
        view: SeqNo,
        h: SeqNo,
        cset: Vec<CheckpointProof>,
        pset: Vec<PqEntry>,
        qset: Vec<PqEntry>,
        from: NodeId,
    ) -> Self {
        Self {
            view,
            h,
            cset,
            pset,
            qset,
            from,
            signature: Vec::new(),
        }
    }

    /// Returns the low watermark advertised by the sender.
    pub fn h(&self) -> SeqNo {
        self.h
    }

    pub fn cset(&self) -> &[CheckpointProof] {
        &self.cset[..]
    }

    pub fn pset(&self) -> &[PqEntry] {
        &self.pset[..]
    }

    pub fn qset(&self) -> &[PqEntry] {
        &self.qset[..]
    }

    pub fn from(&self) -> NodeId {
        self.from
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature[..]
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }

    /// Returns the bytes covered by this message's signature.
    pub fn signed_payload(&self) -> Result<Vec<u8>> {
        bincode::serialize(&(
            self.view,
            self.h,
            &self.cset,
            &self.pset,
            &self.qset,
            self.from,
        ))
        .wrapped(ErrorKind::Message)
    }
}

impl Orderable for ViewChangeMessage {
    /// Returns the sequence number of the view being voted on.
    fn sequence_number(&self) -> SeqNo {
        self.view
    }
}

/// Broadcast by the primary of `view` once it holds a quorum of
/// view change votes, synchronizing all replicas to the new view.
///
/// `vset` justifies the transition, while `xset` lists the per
/// sequence number assignments recomputed by every replica; a `None`
/// assignment stands for the null request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewViewMessage {
    view: SeqNo,
    vset: Vec<ViewChangeMessage>,
    xset: Vec<(SeqNo, Option<Digest>)>,
    from: NodeId,
}

impl NewViewMessage {
    pub fn new(
        view: SeqNo,
        vset: Vec<ViewChangeMessage>,
        xset: Vec<(SeqNo, Option<Digest>)>,
        from: NodeId,
    ) -> Self {
        Self {
            view,
            vset,
            xset,
            from,
        }
    }

    pub fn vset(&self) -> &[ViewChangeMessage] {
        &self.vset[..]
    }

    pub fn xset(&self) -> &[(SeqNo, Option<Digest>)] {
        &self.xset[..]
    }

    pub fn from(&self) -> NodeId {
        self.from
    }
}

impl Orderable for NewViewMessage {
    /// Returns the sequence number of the view being installed.
    fn sequence_number(&self) -> SeqNo {
        self.view
    }
}

/// The number of bytes prefixing a wire message, holding the length
/// of its body.
pub const WIRE_PREFIX_LENGTH: usize = 4;

/// Serializes a `SystemMessage` into a length prefixed wire blob.
pub fn serialize_message(message: &SystemMessage) -> Result<Vec<u8>> {
    let body = bincode::serialize(message).wrapped(ErrorKind::Message)?;
    let mut buf = Vec::with_capacity(WIRE_PREFIX_LENGTH + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body[..]);
    Ok(buf)
}

/// Deserializes a wire blob received from the transport level sender
/// `from`.
///
/// Fails with `ErrorKind::EmptyMessage` on zero valued blobs, and
/// with `ErrorKind::InvalidSender` when the declared sender id does
/// not match the authenticated one.
pub fn deserialize_message(buf: &[u8], from: NodeId) -> Result<SystemMessage> {
    if buf.len() < WIRE_PREFIX_LENGTH {
        return Err("Blob is too short to carry a message").wrapped(ErrorKind::EmptyMessage);
    }
    let mut prefix = [0; WIRE_PREFIX_LENGTH];
    prefix.copy_from_slice(&buf[..WIRE_PREFIX_LENGTH]);
    let length = u32::from_le_bytes(prefix) as usize;
    if length == 0 {
        return Err("Empty message").wrapped(ErrorKind::EmptyMessage);
    }
    if buf.len() < WIRE_PREFIX_LENGTH + length {
        return Err("Truncated message").wrapped(ErrorKind::Message);
    }
    let message: SystemMessage =
        bincode::deserialize(&buf[WIRE_PREFIX_LENGTH..WIRE_PREFIX_LENGTH + length])
            .wrapped(ErrorKind::Message)?;
    if message.from() != from {
        return Err("Declared sender does not match the authenticated one")
            .wrapped(ErrorKind::InvalidSender);
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbft::error::ErrorKind;
    use crate::pbft::ordering::{Orderable, SeqNo};

    #[test]
    fn test_wire_roundtrip() {
        let from = NodeId::from(2);
        let request = RequestMessage::new(1, b"I am a cool payload!".to_vec(), from);
        let digest = request.digest().unwrap();
        let message = SystemMessage::Consensus(ConsensusMessage::new(
            SeqNo::ZERO,
            SeqNo::from(1),
            from,
            ConsensusMessageKind::PrePrepare(digest, request),
        ));
        let blob = serialize_message(&message).expect("Serialize failed");
        let message = deserialize_message(&blob[..], from).expect("Deserialize failed");
        match message {
            SystemMessage::Consensus(m) => {
                assert_eq!(m.sequence_number(), SeqNo::from(1));
                assert_eq!(*m.proposed_digest(), digest);
            }
            _ => panic!("Wrong message kind"),
        }
    }

    #[test]
    fn test_wrong_sender_is_refused() {
        let message = SystemMessage::Request(RequestMessage::new(1, b"op".to_vec(), NodeId::from(1)));
        let blob = serialize_message(&message).unwrap();
        let err = deserialize_message(&blob[..], NodeId::from(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSender);
        assert!(deserialize_message(&blob[..], NodeId::from(1)).is_ok());
    }

    #[test]
    fn test_empty_blob_is_refused() {
        let err = deserialize_message(&[][..], NodeId::from(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyMessage);
        let err = deserialize_message(&0u32.to_le_bytes()[..], NodeId::from(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyMessage);
    }

    #[test]
    fn test_request_digest_ignores_sender() {
        let a = RequestMessage::new(7, b"op".to_vec(), NodeId::from(0));
        let b = RequestMessage::new(7, b"op".to_vec(), NodeId::from(3));
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        let c = RequestMessage::new(8, b"op".to_vec(), NodeId::from(0));
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }

    #[test]
    fn test_null_request() {
        let null = RequestMessage::null(NodeId::from(0));
        assert!(null.is_null());
        assert!(!RequestMessage::new(1, Vec::new(), NodeId::from(0)).is_null());
        assert_ne!(
            null.digest().unwrap(),
            RequestMessage::new(1, b"op".to_vec(), NodeId::from(0))
                .digest()
                .unwrap()
        );
    }
}
