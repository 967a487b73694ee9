//! Timer management for the replica's liveness mechanisms.
//!
//! Timers never invoke protocol handlers directly; a worker thread
//! posts `Event::Timeout` into the replica's event queue when a
//! deadline passes. Arming an already armed timer resets its
//! deadline, and canceled timers are guarded by a generation counter,
//! so a fire that raced with its cancelation is suppressed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::pbft::collections::{self, HashMap};
use crate::pbft::crypto::hash::Digest;
use crate::pbft::events::Event;

/// The timers recognized by the replica core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// A pending request, named by its digest, did not commit in
    /// time.
    Request(Digest),
    /// The view change protocol stalled.
    ViewChange,
    /// The primary side null request send interval elapsed.
    NullRequestSend,
    /// The backup side null request watchdog elapsed with no sign of
    /// life from the primary.
    NullRequestRecv,
}

struct TimerEntry {
    deadline: Instant,
    generation: u64,
    kind: TimeoutKind,
}

// order by earliest deadline first; generations are unique, so the
// ordering is total
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

struct State {
    heap: BinaryHeap<TimerEntry>,
    // generation of the live deadline per armed timer; entries in the
    // heap with a stale generation are skipped on expiry
    live: HashMap<TimeoutKind, u64>,
    next_generation: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Handle used by the replica core to arm and disarm its timers.
pub struct TimeoutsHandle {
    shared: Arc<Shared>,
}

impl Clone for TimeoutsHandle {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl TimeoutsHandle {
    /// Spawns the timer worker, delivering fires into `tx`.
    pub fn new(tx: SyncSender<Event>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                live: collections::hash_map(),
                next_generation: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        thread::spawn(move || Self::run(worker, tx));
        Self { shared }
    }

    /// Arms the timer `kind` to fire after `dur`, resetting its
    /// deadline if it was already armed.
    pub fn timeout(&self, dur: Duration, kind: TimeoutKind) {
        let mut state = self.shared.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.live.insert(kind.clone(), generation);
        state.heap.push(TimerEntry {
            deadline: Instant::now() + dur,
            generation,
            kind,
        });
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Disarms the timer `kind`. Disarming a timer which is not
    /// armed is a no-op.
    pub fn cancel(&self, kind: &TimeoutKind) {
        let mut state = self.shared.state.lock();
        state.live.remove(kind);
    }

    /// Disarms every pending request timer.
    pub fn cancel_requests(&self) {
        let mut state = self.shared.state.lock();
        state
            .live
            .retain(|kind, _| !matches!(*kind, TimeoutKind::Request(_)));
    }

    /// Stops the timer worker. Armed timers will never fire.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        drop(state);
        self.shared.cond.notify_one();
    }

    fn run(shared: Arc<Shared>, tx: SyncSender<Event>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.heap.peek() {
                None => {
                    shared.cond.wait(&mut state);
                }
                Some(entry) if entry.deadline > now => {
                    let deadline = entry.deadline;
                    let _ = shared.cond.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    let entry = state.heap.pop().unwrap();
                    let fire = state
                        .live
                        .get(&entry.kind)
                        .map(|generation| *generation == entry.generation)
                        .unwrap_or(false);
                    if fire {
                        state.live.remove(&entry.kind);
                        drop(state);
                        if tx.send(Event::Timeout(entry.kind)).is_err() {
                            // the event loop is gone
                            return;
                        }
                        state = shared.state.lock();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_timer_fires() {
        let (tx, rx) = mpsc::sync_channel(16);
        let timeouts = TimeoutsHandle::new(tx);
        timeouts.timeout(Duration::from_millis(10), TimeoutKind::ViewChange);
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Timeout(TimeoutKind::ViewChange) => (),
            ev => panic!("Unexpected event: {:?}", ev),
        }
        timeouts.shutdown();
    }

    #[test]
    fn test_canceled_timer_does_not_fire() {
        let (tx, rx) = mpsc::sync_channel(16);
        let timeouts = TimeoutsHandle::new(tx);
        timeouts.timeout(Duration::from_millis(50), TimeoutKind::NullRequestSend);
        timeouts.cancel(&TimeoutKind::NullRequestSend);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timeouts.shutdown();
    }

    #[test]
    fn test_rearming_resets_the_deadline() {
        let (tx, rx) = mpsc::sync_channel(16);
        let timeouts = TimeoutsHandle::new(tx);
        let digest = Digest::hash(b"op");
        timeouts.timeout(Duration::from_millis(20), TimeoutKind::Request(digest));
        timeouts.timeout(Duration::from_secs(60), TimeoutKind::Request(digest));
        // the first deadline lapses without a fire, since the timer
        // was re-armed further into the future
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timeouts.shutdown();
    }
}
