//! The role driver: a single task that runs the Follower, Candidate and
//! Leader routines to completion, one at a time, re-reading the role after
//! each returns.
//!
//! Handlers running on other tasks may demote the node at any moment; they
//! signal through the edge-triggered notify channel and the routines
//! re-check the role on every wake. No routine ever holds the core lock
//! across a transport call: arguments are snapshotted under the lock, the
//! lock is dropped, and replies re-acquire it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::NodeShared;
use crate::rpc::{AppendEntriesArgs, RequestReply, RequestVoteArgs};
use crate::state::{PeerId, RaftState, Role};
use crate::timer::{heartbeat_interval, random_election_timeout};

pub(crate) async fn run_driver(shared: Arc<NodeShared>, mut notify_rx: mpsc::Receiver<()>) {
    loop {
        if shared.shutdown.is_cancelled() {
            return;
        }
        let role = shared.core.read().await.state.role;
        match role {
            Role::Follower => run_follower(&shared, &mut notify_rx).await,
            Role::Candidate => run_candidate(&shared, &mut notify_rx).await,
            Role::Leader => run_leader(&shared, &mut notify_rx).await,
        }
    }
}

/// Waits out election timeouts. Every heartbeat, granted vote or term bump
/// arrives as a notification and redraws the randomized timer; silence for a
/// full timeout promotes to candidate.
async fn run_follower(shared: &Arc<NodeShared>, notify_rx: &mut mpsc::Receiver<()>) {
    loop {
        let timeout = random_election_timeout(&shared.config);
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(timeout) => {
                let mut core = shared.core.write().await;
                if core.state.role == Role::Follower {
                    tracing::info!(
                        node_id = shared.me,
                        term = core.state.current_term,
                        "election timeout, becoming candidate"
                    );
                    core.state.role = Role::Candidate;
                }
                return;
            }
            wake = notify_rx.recv() => {
                if wake.is_none() {
                    return;
                }
                if shared.core.read().await.state.role != Role::Follower {
                    return;
                }
            }
        }
    }
}

/// Runs one election: bumps the term, votes for itself, fans RequestVote out
/// to every peer and counts replies until majority, demotion or timeout.
async fn run_candidate(shared: &Arc<NodeShared>, notify_rx: &mut mpsc::Receiver<()>) {
    let (args, term) = {
        let mut core = shared.core.write().await;
        if core.state.role != Role::Candidate {
            return;
        }
        core.state.become_candidate(shared.me);
        core.persist();
        let term = core.state.current_term;
        tracing::info!(node_id = shared.me, term, "starting election");
        (
            RequestVoteArgs {
                term,
                candidate_id: shared.me,
                last_log_index: core.state.last_log_index(),
                last_log_term: core.state.last_log_term(),
            },
            term,
        )
    };

    // One transient sender per peer; the bounded channel has a slot for
    // every possible reply, so try_send never loses one.
    let (reply_tx, mut reply_rx) = mpsc::channel(shared.peers.len().max(1));
    for &peer in &shared.peers {
        let transport = shared.transport.clone();
        let args = args.clone();
        let reply_tx = reply_tx.clone();
        let shutdown = shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                reply = transport.request_vote(peer, args) => {
                    if let Some(reply) = reply {
                        let _ = reply_tx.try_send(reply);
                    }
                }
            }
        });
    }
    drop(reply_tx);

    let mut votes = 1usize; // self-vote
    let mut replies_open = true;
    let deadline = tokio::time::sleep(random_election_timeout(&shared.config));
    tokio::pin!(deadline);

    while 2 * votes <= shared.cluster_size {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = &mut deadline => {
                tracing::debug!(node_id = shared.me, term, votes, "election timed out");
                // Still candidate: the driver dispatches a fresh election.
                return;
            }
            wake = notify_rx.recv() => {
                if wake.is_none() {
                    return;
                }
                if shared.core.read().await.state.role != Role::Candidate {
                    return;
                }
            }
            reply = reply_rx.recv(), if replies_open => {
                match reply {
                    // Every sender finished without a majority; wait out the
                    // timeout so elections stay paced.
                    None => replies_open = false,
                    Some(reply) => {
                        if shared.step_down_to_term(reply.term).await {
                            tracing::info!(
                                node_id = shared.me,
                                term = reply.term,
                                "observed higher term during election, stepping down"
                            );
                            return;
                        }
                        if reply.success {
                            votes += 1;
                            tracing::debug!(
                                node_id = shared.me,
                                peer_id = reply.peer,
                                term,
                                votes,
                                "received vote"
                            );
                        }
                    }
                }
            }
        }
    }

    let mut core = shared.core.write().await;
    if core.state.role == Role::Candidate && core.state.current_term == term {
        core.state.become_leader(shared.me, &shared.peers);
        tracing::info!(node_id = shared.me, term, votes, "won election, becoming leader");
    }
}

/// Replicates the log: one long-lived sender per peer feeding replies into a
/// bounded channel; this routine is the sole consumer and the sole writer of
/// `next_index` / `match_index`.
async fn run_leader(shared: &Arc<NodeShared>, notify_rx: &mut mpsc::Receiver<()>) {
    let term = {
        let core = shared.core.read().await;
        if core.state.role != Role::Leader {
            return;
        }
        core.state.current_term
    };

    let (reply_tx, mut reply_rx) = mpsc::channel(64);
    let senders: Vec<JoinHandle<()>> = shared
        .peers
        .iter()
        .map(|&peer| tokio::spawn(replicate_to_peer(shared.clone(), peer, term, reply_tx.clone())))
        .collect();
    drop(reply_tx);

    // The tick doubles as the commit path for a single-node cluster, where
    // no replication replies ever arrive.
    let mut tick = tokio::time::interval(heartbeat_interval(&shared.config));
    let mut replies_open = true;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tick.tick() => {
                let mut core = shared.core.write().await;
                if core.state.role != Role::Leader || core.state.current_term != term {
                    break;
                }
                if advance_commit_index(&mut core.state, shared.cluster_size) {
                    drop(core);
                    shared.wake_applier();
                }
            }
            wake = notify_rx.recv() => {
                if wake.is_none() {
                    break;
                }
                let core = shared.core.read().await;
                if core.state.role != Role::Leader || core.state.current_term != term {
                    break;
                }
            }
            reply = reply_rx.recv(), if replies_open => {
                match reply {
                    None => replies_open = false,
                    Some(reply) => {
                        if !process_reply(shared, term, &reply).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    for sender in senders {
        sender.abort();
    }
    tracing::debug!(node_id = shared.me, term, "leaving leader routine");
}

/// Per-peer replication loop: snapshot args under the lock, send without it,
/// annotate the reply for the leader loop, re-arm after a heartbeat
/// interval. Exits when the node stops being leader at `term`.
async fn replicate_to_peer(
    shared: Arc<NodeShared>,
    peer: PeerId,
    term: u64,
    reply_tx: mpsc::Sender<RequestReply>,
) {
    loop {
        let args = {
            let core = shared.core.read().await;
            if core.state.role != Role::Leader || core.state.current_term != term {
                return;
            }
            // With no snapshot-install RPC, a peer behind the watermark is
            // brought forward from the anchor.
            let next = core
                .state
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(core.state.last_log_index() + 1)
                .max(core.state.last_compacted_index + 1);
            let prev_log_index = next - 1;
            AppendEntriesArgs {
                term,
                leader_id: shared.me,
                prev_log_index,
                prev_log_term: core.state.term_at(prev_log_index),
                entries: core.state.entries_from(next),
                leader_commit: core.state.commit_index,
            }
        };
        let sent_next = args.prev_log_index + 1;
        let num_entries = args.entries.len() as u64;

        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            reply = shared.transport.append_entries(peer, args) => {
                match reply {
                    Some(mut reply) => {
                        reply.peer = peer;
                        reply.next_index = Some(sent_next);
                        reply.appended_new_entries = Some(num_entries);
                        if reply_tx.send(reply).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        tracing::trace!(node_id = shared.me, peer_id = peer, "append entries dropped");
                    }
                }
            }
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(heartbeat_interval(&shared.config)) => {}
        }
    }
}

/// Digests one replication reply. Returns false when the node must leave the
/// leader routine.
async fn process_reply(shared: &Arc<NodeShared>, term: u64, reply: &RequestReply) -> bool {
    if reply.term > term {
        if shared.step_down_to_term(reply.term).await {
            tracing::info!(
                node_id = shared.me,
                term = reply.term,
                "observed higher term, stepping down"
            );
        }
        return false;
    }

    let mut core = shared.core.write().await;
    if core.state.role != Role::Leader || core.state.current_term != term {
        return false;
    }

    let peer = reply.peer;
    let sent_next = match reply.next_index {
        Some(n) => n,
        None => return true,
    };
    // Replies may be reordered; anything sent against an outdated
    // next_index is noise.
    if core.state.next_index.get(&peer).copied() != Some(sent_next) {
        tracing::trace!(node_id = shared.me, peer_id = peer, "discarding stale replication reply");
        return true;
    }

    if reply.success {
        let appended = reply.appended_new_entries.unwrap_or(0);
        if appended == 0 {
            return true; // heartbeat ack
        }
        let new_match = sent_next + appended - 1;
        if new_match <= core.state.match_index.get(&peer).copied().unwrap_or(0) {
            return true;
        }
        core.state.match_index.insert(peer, new_match);
        core.state.next_index.insert(peer, new_match + 1);
        tracing::debug!(
            node_id = shared.me,
            peer_id = peer,
            match_index = new_match,
            "replication progress"
        );

        if advance_commit_index(&mut core.state, shared.cluster_size) {
            tracing::debug!(
                node_id = shared.me,
                commit_index = core.state.commit_index,
                "commit index advanced"
            );
            drop(core);
            shared.wake_applier();
        }
    } else {
        let rewound = rewind_next_index(&core.state, sent_next, reply);
        core.state.next_index.insert(peer, rewound);
        tracing::debug!(
            node_id = shared.me,
            peer_id = peer,
            next_index = rewound,
            "log mismatch, rewinding"
        );
    }
    true
}

/// Finds the largest index replicated on a majority whose entry is from the
/// current term, and advances `commit_index` to it. Earlier entries commit
/// transitively.
fn advance_commit_index(state: &mut RaftState, cluster_size: usize) -> bool {
    let mut n = state.last_log_index();
    while n > state.commit_index {
        if state.term_at(n) == state.current_term {
            let replicas = 1 + state.match_index.values().filter(|&&m| m >= n).count();
            if 2 * replicas > cluster_size {
                state.commit_index = n;
                return true;
            }
        }
        n -= 1;
    }
    false
}

/// Conflict-skip rewind: with no conflicting term the follower's log was
/// short, so resume at its end; otherwise jump past the last leader entry of
/// the conflicting term, or to the follower's first index of that term if
/// the leader never had it. One term per round trip instead of one entry.
fn rewind_next_index(state: &RaftState, sent_next: u64, reply: &RequestReply) -> u64 {
    let fallback = reply
        .first_log_index
        .unwrap_or_else(|| sent_next.saturating_sub(1).max(1));
    let target = match reply.conflicting_term {
        None => fallback,
        Some(conflicting_term) => {
            let mut index = (sent_next - 1).min(state.last_log_index());
            let mut found = None;
            while index > state.last_compacted_index {
                let term = state.term_at(index);
                if term == conflicting_term {
                    found = Some(index + 1);
                    break;
                }
                if term < conflicting_term {
                    break; // terms only decrease walking backward
                }
                index -= 1;
            }
            found.unwrap_or(fallback)
        }
    };
    target.clamp(state.last_compacted_index + 1, state.last_log_index() + 1)
}
