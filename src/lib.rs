//! `abraxas` is a Practical Byzantine Fault Tolerance (PBFT)
//! replication core.
//!
//! A [`pbft::core::Replica`] orders client requests identically
//! across every non-faulty replica of a system of `n >= 3*f + 1`
//! processes, of which up to `f` may behave arbitrarily. The crate
//! implements the three phase agreement protocol, checkpointing and
//! log garbage collection, view changes with primary rotation, the
//! liveness timers, and crash recovery from a durable store.
//!
//! Networking, cryptographic identities, the durable store, and the
//! execution engine itself are left to the process hosting a
//! replica, which provides them through [`pbft::executable::Stack`]
//! and drives the replica with [`pbft::events::Event`]s.

pub mod pbft;

pub use crate::pbft::config::{Config, ReplicaConfig};
pub use crate::pbft::core::Replica;
pub use crate::pbft::crypto::hash::Digest;
pub use crate::pbft::error::{Error, ErrorKind, Result};
pub use crate::pbft::events::{new_event_channel, Event, EventLoop};
pub use crate::pbft::executable::Stack;
pub use crate::pbft::message::NodeId;
pub use crate::pbft::ordering::SeqNo;
pub use crate::pbft::timeouts::TimeoutsHandle;
