// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The execute stage. Committed batches arrive in whatever order the
//! instances decide them; a min-heap keyed by global batch index holds
//! them until the next expected index is present, and batches are applied
//! strictly in ascending index order.

use crate::engine::Outbound;
use crate::metrics::ConsensusMetrics;
use crate::state::EngineState;
use crypto::{Hash, NodeId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{
    metered_channel::{Receiver, Sender},
    ClientResponse, ConditionalBroadcastReceiver, ExecuteNotify, Message, Request,
};

#[cfg(test)]
#[path = "tests/executor_tests.rs"]
pub mod executor_tests;

/// The interface to the replicated application. Requests are applied in
/// their batch order; the digest summarizes the state after the last
/// applied request and anchors checkpoints.
#[async_trait::async_trait]
pub trait ExecutionState: Send + Sync + 'static {
    async fn apply(&self, txn_id: u64, request: &Request) -> Vec<u8>;

    async fn state_digest(&self) -> Hash;
}

struct PendingBatch {
    index: u64,
    notify: ExecuteNotify,
}

impl PartialEq for PendingBatch {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for PendingBatch {}

impl Ord for PendingBatch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl PartialOrd for PendingBatch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Executor<State: ExecutionState> {
    node: NodeId,
    state: Arc<EngineState>,
    execution: Arc<State>,

    /// Next global batch index to apply.
    expected: u64,
    heap: BinaryHeap<Reverse<PendingBatch>>,
    queued: HashSet<u64>,

    rx_execute: Receiver<ExecuteNotify>,
    tx_output: Sender<Outbound>,
    tx_checkpoint: Sender<(u64, Hash)>,
    rx_shutdown: ConditionalBroadcastReceiver,
    metrics: Arc<ConsensusMetrics>,
}

impl<State: ExecutionState> Executor<State> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn spawn(
        state: Arc<EngineState>,
        execution: Arc<State>,
        rx_execute: Receiver<ExecuteNotify>,
        tx_output: Sender<Outbound>,
        tx_checkpoint: Sender<(u64, Hash)>,
        rx_shutdown: ConditionalBroadcastReceiver,
        metrics: Arc<ConsensusMetrics>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self {
                node: state.node_id,
                state,
                execution,
                expected: 0,
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                rx_execute,
                tx_output,
                tx_checkpoint,
                rx_shutdown,
                metrics,
            }
            .run()
            .await;
        })
    }

    async fn handle_notify(&mut self, notify: ExecuteNotify) {
        let index = notify.batch_index(self.state.parameters.batch_size);
        if index < self.expected || self.queued.contains(&index) {
            debug!("batch {index} already executed or queued, skipping");
            return;
        }
        self.queued.insert(index);
        self.heap.push(Reverse(PendingBatch { index, notify }));
        self.drain_ready().await;
    }

    /// Applies batches while the heap head is exactly the next expected
    /// index; a gap leaves everything parked until the missing batch
    /// decides.
    async fn drain_ready(&mut self) {
        while self
            .heap
            .peek()
            .map_or(false, |Reverse(head)| head.index == self.expected)
        {
            let Reverse(PendingBatch { index, notify }) = self
                .heap
                .pop()
                .expect("heap head was just checked");
            self.queued.remove(&index);
            self.apply_batch(index, notify).await;
            self.expected += 1;
            self.state.set_last_executed(self.expected);
        }
    }

    async fn apply_batch(&mut self, index: u64, notify: ExecuteNotify) {
        let mut results = Vec::new();
        let base = index * self.state.parameters.batch_size;
        for (offset, request) in notify.batch.requests.iter().enumerate() {
            let result = self.execution.apply(base + offset as u64, request).await;
            results.extend_from_slice(&result);
        }
        let result_digest = Hash::digest(&results);

        if let Some(mut tm) = self.state.txn_table.get_mut(notify.txn_id) {
            tm.executed = true;
        }
        self.metrics.executed_batches.inc();
        debug!(
            "executed batch {index} ({} requests) on node {}",
            notify.batch.requests.len(),
            self.node
        );

        let response = ClientResponse {
            txn_id: notify.txn_id,
            instance: notify.instance,
            view: notify.view,
            node: self.node,
            result_digest,
        };
        if self
            .tx_output
            .send(Outbound::Client {
                dest: notify.batch.client,
                message: Message::ClientResponse(response),
            })
            .await
            .is_err()
        {
            warn!("output channel closed, node is shutting down");
            return;
        }

        let state_digest = self.execution.state_digest().await;
        let _ = self.tx_checkpoint.send((index, state_digest)).await;
    }

    async fn run(mut self) {
        info!("Executor on node {} has started successfully.", self.node);
        loop {
            tokio::select! {
                Some(notify) = self.rx_execute.recv() => {
                    self.handle_notify(notify).await;
                },

                _ = self.rx_shutdown.receiver.recv() => {
                    return;
                }
            }
        }
    }
}
