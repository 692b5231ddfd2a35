use std::collections::{HashMap, HashSet};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{graph::NodeIndex, Direction, Graph};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// A node handed to the consumer, paired with the callback that marks it
/// finished. Dependents stay blocked until the callback fires.
pub type WalkMessage = (NodeIndex, oneshot::Sender<()>);

/// Streaming walk over a dependency graph. Edges run `node -> dependency`;
/// a node is emitted the instant its last dependency reports completion,
/// which is what keeps wall-clock time bounded by the critical path rather
/// than by phase barriers.
///
/// Nodes that sit on a cycle are never emitted, and neither is anything
/// that depends on them. The caller is expected to warn about cycles ahead
/// of time and treat unvisited nodes as skipped.
pub struct Walker;

/// Handle over a running walk: cancellation plus draining of the per-node
/// tasks once the message stream is exhausted.
pub struct WalkHandle {
    cancel: watch::Sender<bool>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

impl Walker {
    /// Spawn one future per acyclic node and return the stream of ready
    /// nodes. The graph must not be mutated while the walk is live.
    pub fn walk<N, E>(graph: &Graph<N, E>) -> (WalkHandle, mpsc::Receiver<WalkMessage>) {
        let cyclic: HashSet<NodeIndex> =
            crate::cycles(graph).into_iter().flatten().collect();

        let (cancel, cancel_rx) = watch::channel(false);

        // One single-shot broadcast per node; dependents subscribe before any
        // task starts so no completion can be missed.
        let mut finished_txs = HashMap::new();
        let mut finished_rxs = HashMap::new();
        for node in graph.node_indices() {
            let (tx, rx) = broadcast::channel::<()>(1);
            finished_txs.insert(node, tx);
            finished_rxs.insert(node, rx);
        }

        // Capacity covers every node, so emission never blocks.
        let (ready_tx, ready_rx) = mpsc::channel(graph.node_count().max(1));
        let join_handles = FuturesUnordered::new();

        for node in graph.node_indices() {
            let tx = finished_txs
                .remove(&node)
                .expect("every node has a finish sender");
            if cyclic.contains(&node) {
                // Dropping the sender here poisons every subscriber with a
                // Closed error, which cascades the skip through dependents.
                continue;
            }
            let mut deps: Vec<_> = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    finished_rxs
                        .get(&dep)
                        .expect("every node has a finish receiver")
                        .resubscribe()
                })
                .collect();
            let mut cancel_rx = cancel_rx.clone();
            let ready_tx = ready_tx.clone();

            join_handles.push(tokio::spawn(async move {
                let deps_done = join_all(deps.iter_mut().map(|rx| rx.recv()));
                tokio::select! {
                    // When cancellation and readiness race, prefer the cancel.
                    biased;
                    _ = cancel_rx.changed() => {}
                    results = deps_done => {
                        for result in results {
                            match result {
                                Ok(()) => {}
                                // A dependency's sender was dropped without
                                // firing: either a cancel in flight or a
                                // cyclic upstream. Skip this node too.
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    trace!("dependency finished {n} extra times");
                                }
                            }
                        }

                        let (done_tx, done_rx) = oneshot::channel::<()>();
                        if ready_tx.send((node, done_tx)).await.is_err() {
                            trace!("walk consumer dropped before node {node:?} was emitted");
                            return;
                        }
                        if done_rx.await.is_err() {
                            trace!("done callback dropped, assuming node finished");
                        }
                        // No receivers just means nothing depends on this node.
                        tx.send(()).ok();
                    }
                }
            }));
        }

        (
            WalkHandle {
                cancel,
                join_handles,
            },
            ready_rx,
        )
    }
}

impl WalkHandle {
    /// Stop emitting new nodes. Nodes already queued still come through the
    /// channel; running work is the caller's to wind down.
    pub fn cancel(&self) {
        self.cancel.send(true).ok();
    }

    /// Wait for every per-node task to finish. Meaningful after the message
    /// stream ends or after a cancel.
    pub async fn wait(self) {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            if let Err(e) = result {
                trace!("walker node task panicked: {e}");
            }
        }
    }
}
