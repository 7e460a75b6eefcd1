//! The RPC boundary between peers.
//!
//! The consensus core never talks to a socket itself: outbound traffic goes
//! through the [`Transport`] trait, and a transport may lose any request or
//! reply at any time. [`LabNet`] is an in-process implementation with fault
//! injection, used by the integration tests and by embeddings that want a
//! whole cluster inside one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::node::RaftNode;
use crate::rpc::{AppendEntriesArgs, RequestReply, RequestVoteArgs};
use crate::state::PeerId;

/// Outbound RPC surface. `None` means the request or its reply was lost;
/// the caller must treat that as silence, never as an error.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, peer: PeerId, args: RequestVoteArgs) -> Option<RequestReply>;

    async fn append_entries(&self, peer: PeerId, args: AppendEntriesArgs) -> Option<RequestReply>;
}

/// An in-process cluster network.
///
/// Nodes register under their peer id; a directed link can be cut and later
/// healed to simulate partitions, and deregistering a node simulates a
/// crash. A cut on the forward link drops the request, a cut on the reverse
/// link drops the reply after the handler already ran, which is exactly the
/// asymmetry real networks produce.
#[derive(Clone, Default)]
pub struct LabNet {
    inner: Arc<RwLock<LabNetInner>>,
}

#[derive(Default)]
struct LabNetInner {
    nodes: HashMap<PeerId, RaftNode>,
    cut: HashSet<(PeerId, PeerId)>,
}

impl LabNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: PeerId, node: RaftNode) {
        self.inner.write().await.nodes.insert(id, node);
    }

    /// Removes a node from the network; all traffic to it is lost.
    pub async fn deregister(&self, id: PeerId) {
        self.inner.write().await.nodes.remove(&id);
    }

    /// Cuts the link between two peers in both directions.
    pub async fn disconnect(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.write().await;
        inner.cut.insert((a, b));
        inner.cut.insert((b, a));
    }

    /// Restores the link between two peers.
    pub async fn reconnect(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.write().await;
        inner.cut.remove(&(a, b));
        inner.cut.remove(&(b, a));
    }

    /// Cuts all links of a node.
    pub async fn isolate(&self, id: PeerId) {
        let mut inner = self.inner.write().await;
        let others: Vec<PeerId> = inner.nodes.keys().copied().filter(|&p| p != id).collect();
        for other in others {
            inner.cut.insert((id, other));
            inner.cut.insert((other, id));
        }
    }

    /// Heals all links of a node.
    pub async fn heal(&self, id: PeerId) {
        self.inner.write().await.cut.retain(|&(a, b)| a != id && b != id);
    }

    /// A node's view of the network: a [`Transport`] tagged with its id.
    pub fn endpoint(&self, from: PeerId) -> LabEndpoint {
        LabEndpoint {
            net: self.clone(),
            from,
        }
    }

    async fn route(&self, from: PeerId, to: PeerId) -> Option<RaftNode> {
        let inner = self.inner.read().await;
        if inner.cut.contains(&(from, to)) {
            return None;
        }
        inner.nodes.get(&to).cloned()
    }

    async fn reply_lost(&self, from: PeerId, to: PeerId) -> bool {
        self.inner.read().await.cut.contains(&(to, from))
    }
}

pub struct LabEndpoint {
    net: LabNet,
    from: PeerId,
}

#[async_trait]
impl Transport for LabEndpoint {
    async fn request_vote(&self, peer: PeerId, args: RequestVoteArgs) -> Option<RequestReply> {
        let node = self.net.route(self.from, peer).await?;
        let reply = node.handle_request_vote(args).await;
        if self.net.reply_lost(self.from, peer).await {
            return None;
        }
        Some(reply)
    }

    async fn append_entries(&self, peer: PeerId, args: AppendEntriesArgs) -> Option<RequestReply> {
        let node = self.net.route(self.from, peer).await?;
        let reply = node.handle_append_entries(args).await;
        if self.net.reply_lost(self.from, peer).await {
            return None;
        }
        Some(reply)
    }
}
