//! Interfaces binding a replica core to the process hosting it.

use crate::pbft::crypto::hash::Digest;
use crate::pbft::error::*;
use crate::pbft::message::NodeId;
use crate::pbft::ordering::SeqNo;

/// The services a replica core requires from its host process.
///
/// The replica invokes these from inside its event loop, so an
/// implementation must never call back into the loop synchronously;
/// completions are delivered by posting events instead. In
/// particular, `execute()` and `skip_to()` are acknowledged later
/// through `Event::ExecutionDone` and `Event::SkipDone`.
pub trait Stack {
    /// Deliver the payload committed at `seq` to the application.
    ///
    /// Calls arrive in strictly increasing sequence number order,
    /// with no gaps, and at most one execution is in flight at a
    /// time. The host acknowledges with `Event::ExecutionDone`,
    /// carrying the digest of the application state reached.
    fn execute(&mut self, seq: SeqNo, payload: Vec<u8>);

    /// Fetch the application state named `state_id`, reached at
    /// `seq`, from some of the `peers`. The host acknowledges with
    /// `Event::SkipDone`.
    fn skip_to(&mut self, seq: SeqNo, state_id: Digest, peers: &[NodeId]);

    /// Checks a client payload before it is ordered.
    fn validate(&self, payload: &[u8]) -> Result<()>;

    /// Signs `data` with this replica's key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verifies a signature produced by the replica `from` over `data`.
    fn verify(&self, from: NodeId, signature: &[u8], data: &[u8]) -> Result<()>;

    /// Delivers a wire blob to every replica, including this one.
    fn broadcast(&mut self, data: Vec<u8>);

    /// Delivers a wire blob to the replica `dst`.
    fn unicast(&mut self, data: Vec<u8>, dst: NodeId);

    /// Durably stores `value` under `key`.
    fn store_state(&mut self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deletes the record stored under `key`.
    fn del_state(&mut self, key: &str) -> Result<()>;

    /// Reads the record stored under `key`.
    fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads every `(key, value)` record whose key starts with
    /// `prefix`.
    fn read_state_set(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}
