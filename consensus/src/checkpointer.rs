// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Checkpointing and garbage collection. Every `txn_per_checkpoint`
//! executed batches the replica broadcasts a checkpoint notice; once
//! `2f + 1` replicas agree on the state digest for an index the
//! checkpoint is stable and every transaction manager at or below it is
//! reclaimed. Several checkpoint rounds may be in flight concurrently.

use crate::engine::Outbound;
use crate::metrics::ConsensusMetrics;
use crate::state::EngineState;
use crate::aggregators::CheckpointAggregator;
use crypto::{Hash, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{
    metered_channel::{Receiver, Sender},
    Checkpoint, ConditionalBroadcastReceiver, ConsensusError, Message,
};

#[cfg(test)]
#[path = "tests/checkpointer_tests.rs"]
pub mod checkpointer_tests;

pub struct Checkpointer {
    node: NodeId,
    state: Arc<EngineState>,

    /// One aggregator per in-flight checkpoint index.
    aggregators: BTreeMap<u64, CheckpointAggregator>,

    rx_executed: Receiver<(u64, Hash)>,
    rx_notices: Receiver<(NodeId, Checkpoint)>,
    tx_output: Sender<Outbound>,
    rx_shutdown: ConditionalBroadcastReceiver,
    metrics: Arc<ConsensusMetrics>,
}

impl Checkpointer {
    #[must_use]
    pub fn spawn(
        state: Arc<EngineState>,
        rx_executed: Receiver<(u64, Hash)>,
        rx_notices: Receiver<(NodeId, Checkpoint)>,
        tx_output: Sender<Outbound>,
        rx_shutdown: ConditionalBroadcastReceiver,
        metrics: Arc<ConsensusMetrics>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self {
                node: state.node_id,
                state,
                aggregators: BTreeMap::new(),
                rx_executed,
                rx_notices,
                tx_output,
                rx_shutdown,
                metrics,
            }
            .run()
            .await;
        })
    }

    fn period(&self) -> u64 {
        self.state.parameters.txn_per_checkpoint
    }

    /// A batch finished executing. At every period boundary, broadcast our
    /// checkpoint notice and count it toward stability.
    async fn handle_executed(&mut self, index: u64, state_digest: Hash) {
        if (index + 1) % self.period() != 0 {
            return;
        }
        debug!("checkpoint boundary at batch {index}");
        let notice = Checkpoint {
            index,
            state_digest,
            node: self.node,
        };
        if self
            .tx_output
            .send(Outbound::Broadcast {
                message: Message::Checkpoint(notice.clone()),
            })
            .await
            .is_err()
        {
            warn!("output channel closed, node is shutting down");
            return;
        }
        self.append(self.node, notice);
    }

    fn handle_notice(&mut self, src: NodeId, notice: Checkpoint) {
        if notice.node != src {
            self.metrics
                .dropped_messages
                .with_label_values(&["unknown_sender"])
                .inc();
            return;
        }
        if notice.index <= self.state.last_stable_checkpoint()
            && self.state.last_stable_checkpoint() != 0
        {
            // Already stable, nothing to learn.
            return;
        }
        self.append(src, notice);
    }

    fn append(&mut self, src: NodeId, notice: Checkpoint) {
        let index = notice.index;
        let aggregator = self
            .aggregators
            .entry(index)
            .or_insert_with(|| CheckpointAggregator::new(index));
        match aggregator.append(src, notice.state_digest, &self.state.committee) {
            Ok(true) => self.make_stable(index),
            Ok(false) => (),
            Err(e @ ConsensusError::DuplicateVote { .. }) => debug!("{e}"),
            Err(e) => warn!("checkpoint notice dropped: {e}"),
        }
    }

    /// The checkpoint at `index` gathered a quorum: advance the stability
    /// watermark and reclaim every manager at or below it.
    fn make_stable(&mut self, index: u64) {
        self.state.set_last_stable_checkpoint(index);
        self.metrics.stable_checkpoints.inc();

        let batch_size = self.state.parameters.batch_size;
        let watermark = (index + 1) * batch_size - 1;
        let reclaimed = self.state.txn_table.gc_up_to(watermark);
        self.state.prune_indexes(watermark);
        self.aggregators.retain(|i, _| *i > index);
        self.metrics
            .txn_table_size
            .set(self.state.txn_table.len() as i64);
        info!(
            "checkpoint {index} stable, reclaimed {reclaimed} transaction managers (watermark {watermark})"
        );
    }

    async fn run(mut self) {
        info!(
            "Checkpointer on node {} has started successfully.",
            self.node
        );
        loop {
            tokio::select! {
                Some((index, digest)) = self.rx_executed.recv() => {
                    self.handle_executed(index, digest).await;
                },

                Some((src, notice)) = self.rx_notices.recv() => {
                    self.handle_notice(src, notice);
                },

                _ = self.rx_shutdown.receiver.recv() => {
                    return;
                }
            }
        }
    }
}
