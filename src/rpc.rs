//! Wire messages and the server-side RPC handlers.
//!
//! Each handler is a single-critical-section transition over the core-data
//! container: the caller holds the write lock, the handler mutates state,
//! persists anything durable, and only then hands back the reply.

use serde::{Deserialize, Serialize};

use crate::state::{LogEntry, PeerId, RaftCore, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Reply shared by both RPCs.
///
/// `conflicting_term` and `first_log_index` are set by a follower rejecting
/// an AppendEntries probe, letting the leader rewind a whole term per round
/// trip instead of bisecting. `next_index` and `appended_new_entries` are
/// stamped by the leader's own sender task at send time, for stale-reply
/// rejection and match-index arithmetic when the reply comes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReply {
    pub term: u64,
    pub success: bool,
    pub peer: PeerId,
    pub conflicting_term: Option<u64>,
    pub first_log_index: Option<u64>,
    pub next_index: Option<u64>,
    pub appended_new_entries: Option<u64>,
}

impl RequestReply {
    fn reject(term: u64, peer: PeerId) -> Self {
        Self {
            term,
            success: false,
            peer,
            conflicting_term: None,
            first_log_index: None,
            next_index: None,
            appended_new_entries: None,
        }
    }
}

/// Handle a RequestVote RPC.
pub fn handle_request_vote(core: &mut RaftCore, args: &RequestVoteArgs, me: PeerId) -> RequestReply {
    let mut dirty = false;
    if args.term > core.state.current_term {
        core.state.become_follower(args.term);
        dirty = true;
    }

    let mut reply = RequestReply::reject(core.state.current_term, me);

    if args.term < core.state.current_term
        || matches!(core.state.voted_for, Some(v) if v != args.candidate_id)
        || !core.state.is_log_up_to_date(args.last_log_index, args.last_log_term)
    {
        if dirty {
            core.persist();
        }
        tracing::debug!(
            node_id = me,
            candidate = args.candidate_id,
            term = args.term,
            "rejected vote request"
        );
        return reply;
    }

    core.state.voted_for = Some(args.candidate_id);
    core.persist();
    reply.success = true;
    tracing::debug!(
        node_id = me,
        candidate = args.candidate_id,
        term = core.state.current_term,
        "granted vote"
    );
    reply
}

/// Handle an AppendEntries RPC (replication or heartbeat).
pub fn handle_append_entries(
    core: &mut RaftCore,
    args: &AppendEntriesArgs,
    me: PeerId,
) -> RequestReply {
    let mut dirty = false;
    if args.term > core.state.current_term {
        core.state.become_follower(args.term);
        dirty = true;
    }

    let mut reply = RequestReply::reject(core.state.current_term, me);

    if args.term < core.state.current_term {
        tracing::trace!(
            node_id = me,
            leader = args.leader_id,
            term = args.term,
            "rejected append from stale leader"
        );
        return reply;
    }

    // Same-term candidates (and any leader remnant that survived a
    // partition) defer to the sender.
    if core.state.role != Role::Follower {
        core.state.step_down();
    }
    core.state.leader_hint = Some(args.leader_id);

    // A probe below the compaction watermark covers entries that are already
    // committed and applied here; skip the part the snapshot covers. The
    // probe point moves to the anchor, so the expected term becomes the
    // leader's term for that index, taken from the last skipped entry.
    let mut prev_log_index = args.prev_log_index;
    let mut prev_log_term = args.prev_log_term;
    let mut entries: &[LogEntry] = &args.entries;
    if prev_log_index < core.state.last_compacted_index {
        let skip = (core.state.last_compacted_index - prev_log_index) as usize;
        if skip >= entries.len() {
            reply.success = true;
            if dirty {
                core.persist();
            }
            return reply;
        }
        prev_log_term = entries[skip - 1].term;
        entries = &entries[skip..];
        prev_log_index = core.state.last_compacted_index;
    }

    // Log-matching probe.
    if prev_log_index > core.state.last_log_index() {
        reply.first_log_index = Some(core.state.last_log_index() + 1);
        if dirty {
            core.persist();
        }
        return reply;
    }
    let local_prev_term = core.state.term_at(prev_log_index);
    if local_prev_term != prev_log_term {
        // Report the first retained index of the conflicting term so the
        // leader can skip the whole term in one round trip.
        let mut first = prev_log_index;
        while first > core.state.last_compacted_index + 1
            && core.state.term_at(first - 1) == local_prev_term
        {
            first -= 1;
        }
        reply.conflicting_term = Some(local_prev_term);
        reply.first_log_index = Some(first);
        if dirty {
            core.persist();
        }
        tracing::debug!(
            node_id = me,
            prev_log_index,
            conflicting_term = local_prev_term,
            first_log_index = first,
            "log-matching probe failed"
        );
        return reply;
    }

    // Merge: advance while terms agree, truncate-and-append from the first
    // disagreement. A batch that matches an existing prefix in full leaves
    // the log untouched; the request may be a stale retransmission.
    let mut matched = 0usize;
    while matched < entries.len()
        && prev_log_index + matched as u64 + 1 <= core.state.last_log_index()
        && core.state.term_at(prev_log_index + matched as u64 + 1) == entries[matched].term
    {
        matched += 1;
    }
    if matched < entries.len() {
        let from = prev_log_index + matched as u64 + 1;
        if from <= core.state.last_log_index() {
            core.state.truncate_suffix_from(from);
        }
        for entry in &entries[matched..] {
            core.state.append(entry.clone());
        }
        dirty = true;
        tracing::debug!(
            node_id = me,
            appended = entries.len() - matched,
            last_log_index = core.state.last_log_index(),
            "appended entries from leader"
        );
    }

    reply.success = true;
    if args.leader_commit > core.state.commit_index {
        core.state.commit_index = args.leader_commit.min(core.state.last_log_index());
    }
    if dirty {
        core.persist();
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LogEntry, RaftState};
    use crate::storage::{MemStorage, Storage};

    fn core_with_terms(terms: &[u64]) -> RaftCore {
        let mut core = RaftCore::new(Box::new(MemStorage::new())).unwrap();
        for &term in terms {
            core.state.append(LogEntry::new(term, vec![]));
        }
        core
    }

    fn vote_args(term: u64, candidate: PeerId, last_index: u64, last_term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: candidate,
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    fn heartbeat(term: u64, leader: PeerId, prev_index: u64, prev_term: u64) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id: leader,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: vec![],
            leader_commit: 0,
        }
    }

    #[test]
    fn test_request_vote_grants_on_empty_log() {
        let mut core = core_with_terms(&[]);

        let reply = handle_request_vote(&mut core, &vote_args(2, 2, 0, 0), 1);

        assert!(reply.success);
        assert_eq!(reply.term, 2);
        assert_eq!(core.state.voted_for, Some(2));
    }

    #[test]
    fn test_request_vote_rejects_stale_term() {
        let mut core = core_with_terms(&[]);
        core.state.current_term = 5;

        let reply = handle_request_vote(&mut core, &vote_args(3, 2, 0, 0), 1);

        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        assert_eq!(core.state.voted_for, None);
    }

    #[test]
    fn test_request_vote_rejects_second_candidate_same_term() {
        let mut core = core_with_terms(&[]);

        let first = handle_request_vote(&mut core, &vote_args(2, 2, 0, 0), 1);
        assert!(first.success);

        let second = handle_request_vote(&mut core, &vote_args(2, 3, 0, 0), 1);
        assert!(!second.success);
        assert_eq!(core.state.voted_for, Some(2));
    }

    #[test]
    fn test_request_vote_is_idempotent_for_same_candidate() {
        let mut core = core_with_terms(&[]);

        assert!(handle_request_vote(&mut core, &vote_args(2, 2, 0, 0), 1).success);
        assert!(handle_request_vote(&mut core, &vote_args(2, 2, 0, 0), 1).success);
    }

    #[test]
    fn test_request_vote_rejects_outdated_log() {
        let mut core = core_with_terms(&[1, 2]);
        core.state.current_term = 2;

        // Candidate's last term is lower.
        let reply = handle_request_vote(&mut core, &vote_args(3, 2, 5, 1), 1);
        assert!(!reply.success);

        // Same last term but shorter log.
        let reply = handle_request_vote(&mut core, &vote_args(4, 2, 1, 2), 1);
        assert!(!reply.success);

        // Term was still adopted from the rejected candidates.
        assert_eq!(core.state.current_term, 4);
        assert_eq!(core.state.voted_for, None);
    }

    #[test]
    fn test_request_vote_higher_term_demotes_leader() {
        let mut core = core_with_terms(&[]);
        core.state.become_candidate(1);
        core.state.become_leader(1, &[2, 3]);

        let reply = handle_request_vote(&mut core, &vote_args(9, 2, 0, 0), 1);

        assert!(reply.success);
        assert_eq!(core.state.role, Role::Follower);
        assert_eq!(core.state.current_term, 9);
    }

    #[test]
    fn test_granted_vote_is_persisted_before_reply() {
        let storage = MemStorage::new();
        let mut core = RaftCore::new(Box::new(storage.clone())).unwrap();

        let reply = handle_request_vote(&mut core, &vote_args(2, 2, 0, 0), 1);
        assert!(reply.success);

        let (blob, _) = storage.load().unwrap().unwrap();
        let persisted = RaftState::restore(&blob, vec![]).unwrap();
        assert_eq!(persisted.current_term, 2);
        assert_eq!(persisted.voted_for, Some(2));
    }

    #[test]
    fn test_append_entries_heartbeat_succeeds() {
        let mut core = core_with_terms(&[]);

        let reply = handle_append_entries(&mut core, &heartbeat(1, 2, 0, 0), 1);

        assert!(reply.success);
        assert_eq!(reply.term, 1);
        assert_eq!(core.state.leader_hint, Some(2));
    }

    #[test]
    fn test_append_entries_rejects_stale_leader() {
        let mut core = core_with_terms(&[]);
        core.state.current_term = 5;

        let reply = handle_append_entries(&mut core, &heartbeat(3, 2, 0, 0), 1);

        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        assert_eq!(core.state.leader_hint, None);
    }

    #[test]
    fn test_append_entries_demotes_same_term_candidate() {
        let mut core = core_with_terms(&[]);
        core.state.become_candidate(1); // now candidate at term 2

        let reply = handle_append_entries(&mut core, &heartbeat(2, 3, 0, 0), 1);

        assert!(reply.success);
        assert_eq!(core.state.role, Role::Follower);
        assert_eq!(core.state.current_term, 2);
        // The same-term vote stands.
        assert_eq!(core.state.voted_for, Some(1));
    }

    #[test]
    fn test_append_entries_appends_new_entries() {
        let mut core = core_with_terms(&[]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, b"a".to_vec()),
                LogEntry::new(1, b"b".to_vec()),
            ],
            leader_commit: 0,
        };
        let reply = handle_append_entries(&mut core, &args, 1);

        assert!(reply.success);
        assert_eq!(core.state.last_log_index(), 2);
        assert_eq!(core.state.entry_at(1).command, b"a");
        assert_eq!(core.state.entry_at(2).command, b"b");
    }

    #[test]
    fn test_append_entries_probe_past_end_reports_next_index() {
        let mut core = core_with_terms(&[1]);

        let reply = handle_append_entries(&mut core, &heartbeat(1, 2, 5, 1), 1);

        assert!(!reply.success);
        assert_eq!(reply.conflicting_term, None);
        assert_eq!(reply.first_log_index, Some(2));
        // Probe failure never truncates.
        assert_eq!(core.state.last_log_index(), 1);
    }

    #[test]
    fn test_append_entries_reports_conflicting_term_run() {
        // Local log: [t1, t2, t2, t2]; leader probes index 4 expecting t3.
        let mut core = core_with_terms(&[1, 2, 2, 2]);
        core.state.current_term = 3;

        let reply = handle_append_entries(&mut core, &heartbeat(3, 2, 4, 3), 1);

        assert!(!reply.success);
        assert_eq!(reply.conflicting_term, Some(2));
        // First index of the run of term-2 entries.
        assert_eq!(reply.first_log_index, Some(2));
        assert_eq!(core.state.last_log_index(), 4);
    }

    #[test]
    fn test_append_entries_truncates_conflicting_suffix() {
        // Local log: [t1, t1, t1]; leader replaces from index 2 with t2.
        let mut core = core_with_terms(&[1, 1, 1]);

        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![
                LogEntry::new(2, b"x".to_vec()),
                LogEntry::new(2, b"y".to_vec()),
            ],
            leader_commit: 0,
        };
        let reply = handle_append_entries(&mut core, &args, 1);

        assert!(reply.success);
        assert_eq!(core.state.last_log_index(), 3);
        assert_eq!(core.state.term_at(2), 2);
        assert_eq!(core.state.term_at(3), 2);
        assert_eq!(core.state.entry_at(2).command, b"x");
    }

    #[test]
    fn test_append_entries_stale_matching_batch_does_not_truncate() {
        // Local log has 3 entries; a reordered RPC carries only the first
        // one again. The longer matching log must survive.
        let mut core = core_with_terms(&[1, 1, 1]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, vec![])],
            leader_commit: 0,
        };
        let reply = handle_append_entries(&mut core, &args, 1);

        assert!(reply.success);
        assert_eq!(core.state.last_log_index(), 3);
    }

    #[test]
    fn test_append_entries_replay_is_idempotent() {
        let mut core = core_with_terms(&[]);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, b"a".to_vec()), LogEntry::new(1, b"b".to_vec())],
            leader_commit: 0,
        };

        assert!(handle_append_entries(&mut core, &args, 1).success);
        let log_before = core.state.log.clone();

        assert!(handle_append_entries(&mut core, &args, 1).success);
        assert_eq!(core.state.log, log_before);
    }

    #[test]
    fn test_append_entries_advances_commit_index() {
        let mut core = core_with_terms(&[1]);

        let mut args = heartbeat(1, 2, 1, 1);
        args.leader_commit = 5; // beyond our log; clamp to last index
        let reply = handle_append_entries(&mut core, &args, 1);

        assert!(reply.success);
        assert_eq!(core.state.commit_index, 1);
    }

    #[test]
    fn test_append_entries_commit_index_never_regresses() {
        let mut core = core_with_terms(&[1, 1]);
        core.state.commit_index = 2;

        let reply = handle_append_entries(&mut core, &heartbeat(1, 2, 2, 1), 1);

        assert!(reply.success);
        assert_eq!(core.state.commit_index, 2);
    }

    #[test]
    fn test_append_entries_skips_compacted_prefix() {
        // Log [t1 x4], compacted through 3. A slow leader resends 1..=4.
        let mut core = core_with_terms(&[1, 1, 1, 1]);
        core.state.commit_index = 4;
        core.state.last_applied = 4;
        core.state.compact_through(3, b"snap".to_vec());

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, vec![]),
                LogEntry::new(1, vec![]),
                LogEntry::new(1, vec![]),
                LogEntry::new(1, vec![]),
            ],
            leader_commit: 4,
        };
        let reply = handle_append_entries(&mut core, &args, 1);

        assert!(reply.success);
        assert_eq!(core.state.last_compacted_index, 3);
        assert_eq!(core.state.last_log_index(), 4);
    }

    #[test]
    fn test_append_entries_all_entries_already_compacted() {
        let mut core = core_with_terms(&[1, 1, 1]);
        core.state.commit_index = 3;
        core.state.last_applied = 3;
        core.state.compact_through(3, vec![]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::new(1, vec![])],
            leader_commit: 3,
        };
        let reply = handle_append_entries(&mut core, &args, 1);

        assert!(reply.success);
        assert_eq!(core.state.last_log_index(), 3);
    }

    #[test]
    fn test_appended_entries_are_persisted_before_reply() {
        let storage = MemStorage::new();
        let mut core = RaftCore::new(Box::new(storage.clone())).unwrap();

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, b"durable".to_vec())],
            leader_commit: 0,
        };
        assert!(handle_append_entries(&mut core, &args, 1).success);

        let (blob, _) = storage.load().unwrap().unwrap();
        let persisted = RaftState::restore(&blob, vec![]).unwrap();
        assert_eq!(persisted.last_log_index(), 1);
        assert_eq!(persisted.entry_at(1).command, b"durable");
    }
}
