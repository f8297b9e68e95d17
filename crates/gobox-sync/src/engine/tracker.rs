//! # Per-Path Work Tracker
//!
//! Decides when a unit of engine work may start. Work on unrelated paths
//! runs concurrently; work touching the same path (or a path inside it)
//! runs one at a time in arrival order.
//!
//! ## Scheduling
//! ```text
//! submit(["docs/a.txt"])        ──► starts            (nothing busy)
//! submit(["docs"])              ──► waits             ("docs" contains a running key)
//! submit(["music/b.mp3"])       ──► starts            (unrelated)
//! submit(["docs/c.txt"])        ──► waits             (an earlier waiting item holds "docs")
//! complete(docs/a.txt)          ──► starts ["docs"]   (c.txt still waits behind it)
//! complete(docs)                ──► starts ["docs/c.txt"]
//! ```
//!
//! Waiting items are never reordered, merged or dropped: an item can only
//! overtake earlier waiting items it shares no key with.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

/// Per-path state as seen by observers and status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Idle,
    /// A local change is being committed remotely.
    LocalChangePending,
    /// A remote change is being applied locally.
    RemoteApplyInFlight,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathState::Idle => write!(f, "idle"),
            PathState::LocalChangePending => write!(f, "local_change_pending"),
            PathState::RemoteApplyInFlight => write!(f, "remote_apply_in_flight"),
        }
    }
}

/// Identifies one submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

struct Running {
    ticket: Ticket,
    keys: Vec<PathBuf>,
    state: PathState,
}

struct Waiting<T> {
    ticket: Ticket,
    keys: Vec<PathBuf>,
    state: PathState,
    item: T,
}

/// Two keys conflict when equal or when one lies inside the other.
/// The empty key is the sync root and conflicts with everything.
fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn any_overlap(keys: &[PathBuf], others: &[PathBuf]) -> bool {
    keys.iter()
        .any(|key| others.iter().any(|other| overlaps(key, other)))
}

pub struct PathTracker<T> {
    next_ticket: u64,
    running: Vec<Running>,
    waiting: VecDeque<Waiting<T>>,
}

impl<T> Default for PathTracker<T> {
    fn default() -> Self {
        PathTracker {
            next_ticket: 0,
            running: Vec::new(),
            waiting: VecDeque::new(),
        }
    }
}

impl<T> PathTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits an item. Returns it back if it may start now.
    pub fn submit(&mut self, keys: Vec<PathBuf>, state: PathState, item: T) -> Option<(Ticket, T)> {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let blocked = self.conflicts_running(&keys)
            || self
                .waiting
                .iter()
                .any(|waiting| any_overlap(&keys, &waiting.keys));

        if blocked {
            self.waiting.push_back(Waiting {
                ticket,
                keys,
                state,
                item,
            });
            None
        } else {
            self.running.push(Running {
                ticket,
                keys,
                state,
            });
            Some((ticket, item))
        }
    }

    /// Marks an item finished and returns the waiting items that may now
    /// start, in arrival order.
    pub fn complete(&mut self, ticket: Ticket) -> Vec<(Ticket, T)> {
        self.running.retain(|running| running.ticket != ticket);

        let mut started = Vec::new();
        let mut still_waiting = VecDeque::with_capacity(self.waiting.len());
        let mut blocked_keys: Vec<PathBuf> = Vec::new();

        while let Some(waiting) = self.waiting.pop_front() {
            if self.conflicts_running(&waiting.keys) || any_overlap(&waiting.keys, &blocked_keys) {
                blocked_keys.extend(waiting.keys.iter().cloned());
                still_waiting.push_back(waiting);
            } else {
                self.running.push(Running {
                    ticket: waiting.ticket,
                    keys: waiting.keys,
                    state: waiting.state,
                });
                started.push((waiting.ticket, waiting.item));
            }
        }

        self.waiting = still_waiting;
        started
    }

    /// State of a path: that of the running item holding it, else Idle.
    pub fn state(&self, key: &Path) -> PathState {
        self.running
            .iter()
            .find(|running| running.keys.iter().any(|k| k == key))
            .or_else(|| {
                self.running
                    .iter()
                    .find(|running| running.keys.iter().any(|k| overlaps(k, key)))
            })
            .map(|running| running.state)
            .unwrap_or(PathState::Idle)
    }

    /// Running plus waiting items.
    pub fn pending(&self) -> usize {
        self.running.len() + self.waiting.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Removes and returns every waiting item (used on shutdown).
    pub fn drain_waiting(&mut self) -> Vec<T> {
        self.waiting.drain(..).map(|waiting| waiting.item).collect()
    }

    fn conflicts_running(&self, keys: &[PathBuf]) -> bool {
        self.running
            .iter()
            .any(|running| any_overlap(keys, &running.keys))
    }
}
