//! The public handle of a Raft peer.
//!
//! [`RaftNode::new`] restores (or freshly initializes) the persisted state,
//! spawns the role driver and the applier, and returns promptly. The handle
//! is a cheap clone; the RPC collaborator wires the inbound handlers to the
//! network, the embedding application calls `start`/`get_state`/`compact`,
//! and `kill` tears everything down.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::apply::{self, ApplyMsg};
use crate::config::RaftConfig;
use crate::driver;
use crate::error::Result;
use crate::rpc::{self, AppendEntriesArgs, RequestReply, RequestVoteArgs};
use crate::state::{LogEntry, PeerId, RaftCore, Role};
use crate::storage::Storage;
use crate::transport::Transport;

/// State shared between the handle and the background workers.
pub(crate) struct NodeShared {
    pub(crate) me: PeerId,
    /// All other peers in the cluster.
    pub(crate) peers: Vec<PeerId>,
    pub(crate) cluster_size: usize,
    pub(crate) config: RaftConfig,
    pub(crate) core: RwLock<RaftCore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) notify_tx: mpsc::Sender<()>,
    pub(crate) apply_wake_tx: mpsc::Sender<()>,
    pub(crate) shutdown: CancellationToken,
}

impl NodeShared {
    /// Edge-trigger for the role driver; a full channel means a wake is
    /// already pending, so dropping the send is fine.
    pub(crate) fn wake_driver(&self) {
        let _ = self.notify_tx.try_send(());
    }

    pub(crate) fn wake_applier(&self) {
        let _ = self.apply_wake_tx.try_send(());
    }

    /// Adopts a higher term observed on a reply, demoting to follower.
    /// Returns whether the term actually advanced.
    pub(crate) async fn step_down_to_term(&self, term: u64) -> bool {
        let mut core = self.core.write().await;
        if term > core.state.current_term {
            core.state.become_follower(term);
            core.persist();
            true
        } else {
            false
        }
    }
}

/// Point-in-time view of a node's bookkeeping, for operators and tests.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub term: u64,
    pub role: Role,
    pub leader_hint: Option<PeerId>,
    pub last_log_index: u64,
    pub last_compacted_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Handle to a running Raft peer.
#[derive(Clone)]
pub struct RaftNode {
    shared: Arc<NodeShared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RaftNode {
    /// Starts a Raft peer.
    ///
    /// `peers` lists every cluster member (including `me`; it is filtered
    /// out of the outbound set). Committed commands are delivered on
    /// `delivery` in strict index order.
    pub fn new(
        config: RaftConfig,
        peers: Vec<PeerId>,
        me: PeerId,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        delivery: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        let core = RaftCore::new(storage)?;
        tracing::info!(
            node_id = me,
            term = core.state.current_term,
            last_log_index = core.state.last_log_index(),
            "raft node starting"
        );

        let others: Vec<PeerId> = peers.iter().copied().filter(|&p| p != me).collect();
        let cluster_size = others.len() + 1;
        let (notify_tx, notify_rx) = mpsc::channel(10);
        let (apply_wake_tx, apply_wake_rx) = mpsc::channel(10);

        let shared = Arc::new(NodeShared {
            me,
            peers: others,
            cluster_size,
            config,
            core: RwLock::new(core),
            transport,
            notify_tx,
            apply_wake_tx,
            shutdown: CancellationToken::new(),
        });

        let driver = tokio::spawn(driver::run_driver(shared.clone(), notify_rx));
        let applier = tokio::spawn(apply::run_applier(shared.clone(), apply_wake_rx, delivery));

        Ok(Self {
            shared,
            workers: Arc::new(Mutex::new(vec![driver, applier])),
        })
    }

    /// Proposes a command. On a leader, appends it locally and returns its
    /// prospective `(index, term, true)` without waiting for commitment; on
    /// anyone else returns `(0, term, false)` and appends nothing. The role
    /// check and the append share one critical section, so a command is
    /// never appended by a peer that was not leader at the instant of the
    /// call.
    pub async fn start(&self, command: Vec<u8>) -> (u64, u64, bool) {
        let mut core = self.shared.core.write().await;
        if core.state.role != Role::Leader {
            return (0, core.state.current_term, false);
        }

        let term = core.state.current_term;
        core.state.append(LogEntry::new(term, command));
        core.persist();
        let index = core.state.last_log_index();
        tracing::debug!(node_id = self.shared.me, index, term, "accepted command");
        (index, term, true)
    }

    /// Current term and whether this peer believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let core = self.shared.core.read().await;
        (core.state.current_term, core.state.role == Role::Leader)
    }

    pub async fn is_leader(&self) -> bool {
        self.shared.core.read().await.state.role == Role::Leader
    }

    /// Best-known current leader, for client redirection.
    pub async fn leader_hint(&self) -> Option<PeerId> {
        self.shared.core.read().await.state.leader_hint
    }

    pub async fn status(&self) -> NodeStatus {
        let core = self.shared.core.read().await;
        NodeStatus {
            term: core.state.current_term,
            role: core.state.role,
            leader_hint: core.state.leader_hint,
            last_log_index: core.state.last_log_index(),
            last_compacted_index: core.state.last_compacted_index,
            commit_index: core.state.commit_index,
            last_applied: core.state.last_applied,
        }
    }

    /// Installs a state-machine snapshot covering the log through `up_to`
    /// and drops the covered entries. Called by the upstream state machine
    /// after it has durably checkpointed up to that index; requests outside
    /// the `[last_compacted_index, last_applied]` window are ignored.
    pub async fn compact(&self, snapshot: Vec<u8>, up_to: u64) {
        let mut core = self.shared.core.write().await;
        if up_to < core.state.last_compacted_index || up_to > core.state.last_applied {
            tracing::warn!(
                node_id = self.shared.me,
                up_to,
                last_compacted_index = core.state.last_compacted_index,
                last_applied = core.state.last_applied,
                "ignoring out-of-window compaction request"
            );
            return;
        }
        if up_to == core.state.last_compacted_index {
            return;
        }

        core.state.compact_through(up_to, snapshot);
        core.persist();
        tracing::info!(
            node_id = self.shared.me,
            up_to,
            last_log_index = core.state.last_log_index(),
            "compacted log"
        );
    }

    /// Shuts the peer down: cancels all workers and waits for the role
    /// driver and applier to exit. Persisted state stays on disk.
    pub async fn kill(&self) {
        self.shared.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
        tracing::info!(node_id = self.shared.me, "raft node stopped");
    }

    /// Inbound RequestVote, wired to the network by the RPC collaborator.
    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestReply {
        let (reply, term_bumped) = {
            let mut core = self.shared.core.write().await;
            let term_before = core.state.current_term;
            let reply = rpc::handle_request_vote(&mut core, &args, self.shared.me);
            (reply, core.state.current_term > term_before)
        };

        // A granted vote counts as contact from an active election; both it
        // and a term bump reset the follower clock.
        if reply.success || term_bumped {
            self.shared.wake_driver();
        }
        reply
    }

    /// Inbound AppendEntries, wired to the network by the RPC collaborator.
    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> RequestReply {
        let (reply, wake_applier) = {
            let mut core = self.shared.core.write().await;
            let reply = rpc::handle_append_entries(&mut core, &args, self.shared.me);
            let wake_applier = core.state.commit_index > core.state.last_applied;
            (reply, wake_applier)
        };

        // Any non-stale call is contact from the legitimate leader and
        // resets the follower clock, probe failures included.
        if reply.term == args.term {
            self.shared.wake_driver();
        }
        if wake_applier {
            self.shared.wake_applier();
        }
        reply
    }
}
