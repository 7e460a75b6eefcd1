//! The applier: forwards newly committed entries to the upstream state
//! machine, strictly in log-index order.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::node::NodeShared;

/// Record delivered to the upstream state machine for each committed entry.
///
/// `valid` is always true today; false is reserved for non-command
/// notifications such as snapshot installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub valid: bool,
    pub command: Vec<u8>,
    pub index: u64,
}

/// Runs until shutdown. Parks on the wake channel; on each wake, drains
/// everything committed but not yet applied. If the upstream channel blocks,
/// the applier blocks with it but stays responsive to shutdown.
pub(crate) async fn run_applier(
    shared: Arc<NodeShared>,
    mut wake_rx: mpsc::Receiver<()>,
    delivery: mpsc::Sender<ApplyMsg>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            wake = wake_rx.recv() => {
                if wake.is_none() {
                    return;
                }
            }
        }

        loop {
            let msg = {
                let core = shared.core.read().await;
                if core.state.last_applied >= core.state.commit_index {
                    break;
                }
                let index = core.state.last_applied + 1;
                ApplyMsg {
                    valid: true,
                    command: core.state.entry_at(index).command.clone(),
                    index,
                }
            };
            let index = msg.index;

            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                sent = delivery.send(msg) => {
                    if sent.is_err() {
                        tracing::warn!(node_id = shared.me, "delivery channel closed, applier exiting");
                        return;
                    }
                }
            }

            // Sole writer of last_applied; advance only after the upstream
            // accepted the entry.
            let mut core = shared.core.write().await;
            core.state.last_applied = index;
            tracing::debug!(node_id = shared.me, index, "applied entry");
        }
    }
}
