//! Core consensus state: the term/vote/log triple every peer persists, the
//! volatile replication bookkeeping, and the container that couples state
//! mutation to durable storage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::Storage;

pub type PeerId = u64;

/// Raft node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// A single replicated log entry. The command is an opaque payload owned by
/// the upstream state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        Self { term, command }
    }

    /// The anchor occupying physical slot 0 of a fresh log.
    fn sentinel() -> Self {
        Self {
            term: 0,
            command: Vec::new(),
        }
    }
}

/// Per-peer consensus state.
///
/// `current_term`, `voted_for`, `log` and `last_compacted_index` are the
/// persisted portion; everything else is rebuilt after a restart. The
/// in-memory log always starts with an anchor entry at logical index
/// `last_compacted_index` carrying the term of the last compacted entry
/// (term 0 while nothing is compacted), so `log` is never empty and every
/// retained index has a term on hand for the log-matching probe.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
    pub log: Vec<LogEntry>,
    pub last_compacted_index: u64,
    /// Opaque state-machine snapshot covering indices up to the watermark.
    pub snapshot: Vec<u8>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_hint: Option<PeerId>,
    pub role: Role,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<PeerId, u64>,
    pub match_index: HashMap<PeerId, u64>,
}

/// Serde mirror of the persisted portion of [`RaftState`].
#[derive(Serialize, Deserialize)]
struct PersistedState {
    current_term: u64,
    voted_for: Option<PeerId>,
    log: Vec<LogEntry>,
    last_compacted_index: u64,
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    current_term: u64,
    voted_for: Option<PeerId>,
    log: &'a [LogEntry],
    last_compacted_index: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 1,
            voted_for: None,
            log: vec![LogEntry::sentinel()],
            last_compacted_index: 0,
            snapshot: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            leader_hint: None,
            role: Role::Follower,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Rebuilds state from a persisted blob. The compacted prefix is by
    /// contract committed and applied (the snapshot covers it), so the
    /// volatile counters resume from the watermark.
    pub fn restore(state_bytes: &[u8], snapshot: Vec<u8>) -> Result<Self> {
        let persisted: PersistedState = serde_json::from_slice(state_bytes)?;
        let mut state = Self::new();
        state.current_term = persisted.current_term;
        state.voted_for = persisted.voted_for;
        state.log = persisted.log;
        state.last_compacted_index = persisted.last_compacted_index;
        state.commit_index = persisted.last_compacted_index;
        state.last_applied = persisted.last_compacted_index;
        state.snapshot = snapshot;
        Ok(state)
    }

    /// Encodes the persisted portion as a self-describing blob.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let persisted = PersistedStateRef {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: &self.log,
            last_compacted_index: self.last_compacted_index,
        };
        Ok(serde_json::to_vec(&persisted)?)
    }

    /// Index of the last entry in the log (the anchor when the tail is empty).
    pub fn last_log_index(&self) -> u64 {
        self.last_compacted_index + self.log.len() as u64 - 1
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    /// Physical slot of a retained logical index.
    fn physical(&self, index: u64) -> usize {
        debug_assert!(
            index >= self.last_compacted_index && index <= self.last_log_index(),
            "index {index} outside retained log [{}, {}]",
            self.last_compacted_index,
            self.last_log_index()
        );
        (index - self.last_compacted_index) as usize
    }

    /// Term of the retained entry at `index`.
    pub fn term_at(&self, index: u64) -> u64 {
        self.log[self.physical(index)].term
    }

    /// The retained entry at `index`.
    pub fn entry_at(&self, index: u64) -> &LogEntry {
        &self.log[self.physical(index)]
    }

    /// Clones the log tail starting at `index` (empty when past the end).
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index > self.last_log_index() {
            return Vec::new();
        }
        self.log[self.physical(index)..].to_vec()
    }

    /// Drops all entries with logical index >= `index`.
    pub fn truncate_suffix_from(&mut self, index: u64) {
        let at = self.physical(index);
        self.log.truncate(at);
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    /// Whether a candidate's log is at least as up-to-date as ours: higher
    /// last term wins, ties break on length.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }

    /// Term bump: adopt the higher term, clear the vote, demote.
    pub fn become_follower(&mut self, term: u64) {
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
    }

    /// Same-term demotion (candidate deferring to an elected leader). The
    /// vote stands.
    pub fn step_down(&mut self) {
        self.role = Role::Follower;
    }

    pub fn become_candidate(&mut self, me: PeerId) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(me);
        self.leader_hint = None;
    }

    pub fn become_leader(&mut self, me: PeerId, peers: &[PeerId]) {
        self.role = Role::Leader;
        self.leader_hint = Some(me);
        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer in peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
    }

    /// Discards entries up to and including `up_to`, leaving an anchor that
    /// carries the term of the last compacted entry, and installs the
    /// snapshot covering the dropped prefix.
    pub fn compact_through(&mut self, up_to: u64, snapshot: Vec<u8>) {
        debug_assert!(up_to >= self.last_compacted_index && up_to <= self.last_log_index());
        let anchor = LogEntry {
            term: self.term_at(up_to),
            command: Vec::new(),
        };
        let mut tail = self.log.split_off(self.physical(up_to) + 1);
        self.log.clear();
        self.log.push(anchor);
        self.log.append(&mut tail);
        self.last_compacted_index = up_to;
        self.snapshot = snapshot;
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

/// The core-data container: consensus state coupled to its stable storage.
///
/// Every mutation of the persisted portion must go through a holder of
/// `&mut RaftCore` and call [`persist`](Self::persist) before the enclosing
/// lock is released or any reply that depends on the change is produced.
pub struct RaftCore {
    pub state: RaftState,
    storage: Box<dyn Storage>,
}

impl RaftCore {
    /// Restores from storage, or starts fresh if nothing was ever saved.
    pub fn new(storage: Box<dyn Storage>) -> Result<Self> {
        let state = match storage.load()? {
            Some((state_bytes, snapshot)) => RaftState::restore(&state_bytes, snapshot)?,
            None => RaftState::new(),
        };
        Ok(Self { state, storage })
    }

    /// Writes term, vote, log and watermark (plus the snapshot blob) to
    /// stable storage. Storage failure is unrecoverable.
    pub fn persist(&mut self) {
        let blob = match self.state.encode() {
            Ok(blob) => blob,
            Err(e) => panic!("failed to encode raft state: {e}"),
        };
        if let Err(e) = self.storage.save(&blob, &self.state.snapshot) {
            panic!("failed to persist raft state: {e}");
        }
    }
}
