//! Embeddable Raft consensus.
//!
//! Each server in an odd-sized cluster runs a [`RaftNode`]; the cluster
//! maintains an identical, totally-ordered, fault-tolerant log of opaque
//! commands and delivers committed entries, in log order, to a co-located
//! state machine over an [`ApplyMsg`] channel.
//!
//! The crate is the consensus engine only. Networking lives behind the
//! [`Transport`] trait and durability behind the [`Storage`] trait; the
//! embedding application supplies both, along with the delivery channel it
//! consumes committed commands from.

pub mod apply;
pub mod config;
mod driver;
pub mod error;
pub mod node;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;
pub mod transport;

pub use apply::ApplyMsg;
pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use node::{NodeStatus, RaftNode};
pub use rpc::{AppendEntriesArgs, RequestReply, RequestVoteArgs};
pub use state::{LogEntry, PeerId, Role};
pub use storage::{FileStorage, MemStorage, Storage};
pub use transport::{LabNet, Transport};
