// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Leader-side batch intake. The proposer queues client batches and, for
//! every instance this node currently leads, turns them into proposals:
//! assigns the global index, loops the proposal back to the owning worker
//! (the leader's own share is the first vote) and broadcasts it.

use crate::engine::{Outbound, ProposerCommand};
use crate::metrics::ConsensusMetrics;
use crate::state::EngineState;
use crypto::NodeId;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{
    metered_channel::{Receiver, Sender},
    ClientBatch, ConditionalBroadcastReceiver, Message, Proposal,
};

/// Proposals a leader may pipeline ahead of its last decided slot when
/// the dedicated proposal task is enabled. Without it, one at a time.
const MAX_PIPELINED: u64 = 4;

pub struct Proposer {
    node: NodeId,
    state: Arc<EngineState>,

    /// Batches accepted from clients, waiting for a leadership slot.
    pending: VecDeque<ClientBatch>,
    /// Per-instance view the next proposal will occupy.
    next_send_view: Vec<u64>,
    /// Per-instance proposals in flight (proposed, not decided).
    inflight: Vec<u64>,

    rx_commands: Receiver<ProposerCommand>,
    tx_workers: Vec<Sender<(NodeId, Message)>>,
    tx_output: Sender<Outbound>,
    rx_shutdown: ConditionalBroadcastReceiver,
    metrics: Arc<ConsensusMetrics>,
}

impl Proposer {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn spawn(
        state: Arc<EngineState>,
        rx_commands: Receiver<ProposerCommand>,
        tx_workers: Vec<Sender<(NodeId, Message)>>,
        tx_output: Sender<Outbound>,
        rx_shutdown: ConditionalBroadcastReceiver,
        metrics: Arc<ConsensusMetrics>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let instances = state.instances() as usize;
            Self {
                node: state.node_id,
                state,
                pending: VecDeque::new(),
                next_send_view: vec![0; instances],
                inflight: vec![0; instances],
                rx_commands,
                tx_workers,
                tx_output,
                rx_shutdown,
                metrics,
            }
            .run()
            .await;
        })
    }

    fn max_inflight(&self) -> u64 {
        if self.state.parameters.flags.proposal_thread {
            MAX_PIPELINED
        } else {
            1
        }
    }

    fn pending_bound(&self) -> usize {
        self.state.parameters.channel_capacity
    }

    async fn handle_command(&mut self, command: ProposerCommand) {
        match command {
            ProposerCommand::Batch(batch) => {
                if self.pending.len() >= self.pending_bound() {
                    debug!("client batch queue full, dropping batch");
                    self.metrics
                        .dropped_messages
                        .with_label_values(&["client_queue_full"])
                        .inc();
                } else {
                    self.pending.push_back(batch);
                }
            }
            ProposerCommand::ViewReady { instance, view } => {
                let slot = &mut self.next_send_view[instance as usize];
                *slot = (*slot).max(view);
            }
            ProposerCommand::Decided { instance } => {
                let count = &mut self.inflight[instance as usize];
                *count = count.saturating_sub(1);
            }
            ProposerCommand::Reset {
                instance,
                next_view,
                inflight,
            } => {
                // A view change re-anchored the instance.
                self.next_send_view[instance as usize] = next_view;
                self.inflight[instance as usize] = inflight;
            }
        }
        self.try_propose().await;
    }

    /// Proposes as much pending work as current leadership and the
    /// pipelining bound allow.
    async fn try_propose(&mut self) {
        let instances = self.state.instances();
        let batch_size = self.state.parameters.batch_size;
        let n = self.state.committee.size() as u64;

        for instance in 0..instances {
            loop {
                let view = self.next_send_view[instance as usize];
                if self.state.committee.leader(instance, view) != self.node
                    || self.inflight[instance as usize] >= self.max_inflight()
                    || self.pending.is_empty()
                {
                    break;
                }
                let batch = self
                    .pending
                    .pop_front()
                    .expect("pending queue checked non-empty");

                let index = self.state.assign_index(instance);
                let txn_id = index * batch_size + batch_size - 1;
                let proposal = Proposal {
                    txn_id,
                    instance,
                    view,
                    batch_hash: batch.digest(),
                    justify: self.state.prepared_qc(instance),
                    batch,
                };
                info!(
                    "proposing batch {} (txn {}) on instance {} at view {}",
                    index, txn_id, instance, view
                );
                self.metrics.proposals_made.inc();

                // Loop back first so the worker owns the manager before
                // any remote vote can race in.
                if self
                    .tx_workers[instance as usize]
                    .send((self.node, Message::Proposal(proposal.clone())))
                    .await
                    .is_err()
                {
                    warn!("worker channel closed, node is shutting down");
                    return;
                }
                if self
                    .tx_output
                    .send(Outbound::Broadcast {
                        message: Message::Proposal(proposal),
                    })
                    .await
                    .is_err()
                {
                    return;
                }

                self.next_send_view[instance as usize] = view + n;
                self.inflight[instance as usize] += 1;
            }
        }
    }

    async fn run(mut self) {
        info!("Proposer on node {} has started successfully.", self.node);
        loop {
            tokio::select! {
                Some(command) = self.rx_commands.recv() => {
                    self.handle_command(command).await;
                },

                _ = self.rx_shutdown.receiver.recv() => {
                    return;
                }
            }
        }
    }
}
