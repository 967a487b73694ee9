//! The event manager gluing a replica core to its host process.
//!
//! A replica consumes a single bounded queue of events: parsed wire
//! blobs, timer fires, and completions reported by the execution
//! engine. Every state transition happens on the thread draining the
//! queue, so the protocol modules need no internal locking.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use crate::pbft::core::Replica;
use crate::pbft::crypto::hash::Digest;
use crate::pbft::error::*;
use crate::pbft::executable::Stack;
use crate::pbft::message::NodeId;
use crate::pbft::ordering::SeqNo;
use crate::pbft::timeouts::TimeoutKind;

// max no. of events allowed in the queue
pub const CHAN_BOUND: usize = 128;

/// The events consumed by a replica's event loop.
#[derive(Debug)]
pub enum Event {
    /// A wire blob received from the (authenticated) replica `from`,
    /// possibly ourselves.
    Message { from: NodeId, data: Vec<u8> },
    /// A timer armed by the replica fired.
    Timeout(TimeoutKind),
    /// The execution engine finished the in flight request; carries
    /// the digest of the application state reached.
    ExecutionDone(Digest),
    /// The execution engine finished a state transfer, landing on the
    /// given sequence number.
    SkipDone(SeqNo),
}

/// Creates the bounded channel feeding a replica's event loop.
pub fn new_event_channel(bound: usize) -> (SyncSender<Event>, Receiver<Event>) {
    mpsc::sync_channel(bound)
}

/// Single threaded loop serializing every state transition of a
/// replica.
pub struct EventLoop<S: Stack> {
    replica: Replica<S>,
    rx: Receiver<Event>,
}

impl<S: Stack> EventLoop<S> {
    pub fn new(replica: Replica<S>, rx: Receiver<Event>) -> Self {
        Self { replica, rx }
    }

    /// Drains events until every sender is dropped, yielding the
    /// replica back.
    ///
    /// Protocol level refusals are logged and swallowed inside
    /// `Replica::process`; an `Err` out of it is fatal (e.g. the
    /// persistence layer failed), and halts the loop rather than risk
    /// diverging after a restart.
    pub fn run(mut self) -> Result<Replica<S>> {
        while let Ok(event) = self.rx.recv() {
            self.replica.process(event)?;
        }
        Ok(self.replica)
    }
}

impl<S> EventLoop<S>
where
    S: Stack + Send + 'static,
{
    /// Runs the loop on its own thread.
    pub fn spawn(self) -> JoinHandle<Result<Replica<S>>> {
        thread::Builder::new()
            .name("abraxas-event-loop".into())
            .spawn(move || self.run())
            .expect("Failed to spawn the event loop thread")
    }
}
