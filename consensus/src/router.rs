// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The boundary between the transport and the protocol tasks. The input
//! router drains the transport, authenticates envelopes and routes each
//! message to the queue of the task owning it; the output dispatcher
//! signs outbound messages and hands them to the transport.

use crate::engine::{Outbound, ProposerCommand};
use crate::metrics::ConsensusMetrics;
use crate::state::EngineState;
use crypto::{KeyPair, NodeId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{
    ensure, metered_channel::{Receiver, Sender},
    Checkpoint, ClientResponse, ConditionalBroadcastReceiver, ConsensusError, ConsensusResult,
    Envelope, Message, Transport,
};

pub struct InputRouter {
    node: NodeId,
    state: Arc<EngineState>,
    transport: Arc<dyn Transport>,

    tx_workers: Vec<Sender<(NodeId, Message)>>,
    tx_proposer: Sender<ProposerCommand>,
    tx_checkpointer: Sender<(NodeId, Checkpoint)>,
    /// Present when this node also runs a client driver interested in
    /// responses; replicas drop inbound responses.
    tx_client_responses: Option<tokio::sync::mpsc::Sender<ClientResponse>>,

    rx_shutdown: ConditionalBroadcastReceiver,
    metrics: Arc<ConsensusMetrics>,
}

impl InputRouter {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn spawn(
        state: Arc<EngineState>,
        transport: Arc<dyn Transport>,
        tx_workers: Vec<Sender<(NodeId, Message)>>,
        tx_proposer: Sender<ProposerCommand>,
        tx_checkpointer: Sender<(NodeId, Checkpoint)>,
        tx_client_responses: Option<tokio::sync::mpsc::Sender<ClientResponse>>,
        rx_shutdown: ConditionalBroadcastReceiver,
        metrics: Arc<ConsensusMetrics>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self {
                node: state.node_id,
                state,
                transport,
                tx_workers,
                tx_proposer,
                tx_checkpointer,
                tx_client_responses,
                rx_shutdown,
                metrics,
            }
            .run()
            .await;
        })
    }

    /// Validates the in-flight window for batch-bearing messages: ids
    /// below the garbage-collection watermark are gone, ids too far above
    /// the last stable checkpoint are refused to bound memory.
    fn check_window(&self, txn_id: u64) -> ConsensusResult<()> {
        let last_deleted = self.state.txn_table.last_deleted();
        ensure!(
            txn_id >= last_deleted,
            ConsensusError::TooOld {
                txn_id,
                last_deleted,
            }
        );
        let batch_size = self.state.parameters.batch_size;
        let horizon = self.state.last_stable_checkpoint() + self.state.parameters.in_flight_window();
        ensure!(
            txn_id / batch_size <= horizon,
            ConsensusError::BeyondWindow { txn_id, horizon }
        );
        Ok(())
    }

    async fn route(&mut self, envelope: Envelope) -> ConsensusResult<()> {
        envelope.verify(&self.state.committee)?;
        let src = envelope.src;
        let message = envelope.message;
        self.metrics
            .received_messages
            .with_label_values(&[message.kind()])
            .inc();

        match message {
            Message::KeyExchange { node, .. } | Message::Ready { node } | Message::InitDone { node } => {
                ensure!(node == src, ConsensusError::UnknownSender(src));
                self.state.ready_nodes.insert(node);
                debug!("node {node} completed handshake ({})", self.state.ready_nodes.len());
                Ok(())
            }
            Message::ClientBatch(batch) => self
                .tx_proposer
                .send(ProposerCommand::Batch(batch))
                .await
                .map_err(|_| ConsensusError::ShuttingDown),
            Message::ClientResponse(response) => {
                if let Some(tx) = &self.tx_client_responses {
                    tx.send(response)
                        .await
                        .map_err(|_| ConsensusError::ShuttingDown)
                } else {
                    debug!("replica received a client response, dropping");
                    Ok(())
                }
            }
            Message::Checkpoint(notice) => self
                .tx_checkpointer
                .send((src, notice))
                .await
                .map_err(|_| ConsensusError::ShuttingDown),
            Message::ExecuteNotify(_) => {
                Err(ConsensusError::UnexpectedMessage("execute_notify"))
            }
            message => {
                let instance = message.instance();
                ensure!(
                    instance < self.state.instances(),
                    ConsensusError::WireFormat(format!("instance {instance} out of range"))
                );
                if let Some(txn_id) = message.txn_id() {
                    self.check_window(txn_id)?;
                }
                self.tx_workers[instance as usize]
                    .send((src, message))
                    .await
                    .map_err(|_| ConsensusError::ShuttingDown)
            }
        }
    }

    fn process_result(&self, result: &ConsensusResult<()>) {
        match result {
            Ok(()) => (),
            Err(e) => {
                self.metrics
                    .dropped_messages
                    .with_label_values(&[e.kind()])
                    .inc();
                match e {
                    ConsensusError::ShuttingDown
                    | ConsensusError::TooOld { .. }
                    | ConsensusError::BeyondWindow { .. } => debug!("{e}"),
                    e => warn!("inbound message dropped: {e}"),
                }
            }
        }
    }

    async fn run(mut self) {
        info!(
            "Input router on node {} has started successfully.",
            self.node
        );
        loop {
            tokio::select! {
                frame = self.transport.recv() => {
                    let Some(bytes) = frame else {
                        debug!("transport closed, input router exiting");
                        return;
                    };
                    let result = match Envelope::from_bytes(&bytes) {
                        Ok(envelope) => self.route(envelope).await,
                        Err(e) => Err(e),
                    };
                    self.process_result(&result);
                },

                _ = self.rx_shutdown.receiver.recv() => {
                    return;
                }
            }
        }
    }
}

pub struct OutputDispatcher {
    node: NodeId,
    keypair: Arc<KeyPair>,
    state: Arc<EngineState>,
    transport: Arc<dyn Transport>,

    rx_output: Receiver<Outbound>,
    rx_shutdown: ConditionalBroadcastReceiver,
    metrics: Arc<ConsensusMetrics>,
}

impl OutputDispatcher {
    #[must_use]
    pub fn spawn(
        keypair: Arc<KeyPair>,
        state: Arc<EngineState>,
        transport: Arc<dyn Transport>,
        rx_output: Receiver<Outbound>,
        rx_shutdown: ConditionalBroadcastReceiver,
        metrics: Arc<ConsensusMetrics>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self {
                node: state.node_id,
                keypair,
                state,
                transport,
                rx_output,
                rx_shutdown,
                metrics,
            }
            .run()
            .await;
        })
    }

    async fn send_to(&self, dests: Vec<NodeId>, message: Message) {
        // One signature covers the message body for every destination.
        let signature = match bincode::serialize(&message) {
            Ok(bytes) => self.keypair.sign(&bytes),
            Err(e) => {
                warn!("failed to serialize outbound message: {e}");
                return;
            }
        };
        for dest in dests {
            let envelope = Envelope {
                src: self.node,
                dest,
                message: message.clone(),
                signature,
            };
            let bytes = match envelope.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to serialize envelope: {e}");
                    return;
                }
            };
            if let Err(e) = self.transport.send(dest, bytes).await {
                self.metrics
                    .dropped_messages
                    .with_label_values(&["network_error"])
                    .inc();
                debug!("send to {dest} failed: {e}");
            }
        }
    }

    async fn dispatch(&self, outbound: Outbound) {
        match outbound {
            Outbound::Unicast { dest, message } => self.send_to(vec![dest], message).await,
            Outbound::Client { dest, message } => self.send_to(vec![dest], message).await,
            Outbound::Broadcast { message } => {
                let dests = self.state.committee.others(self.node);
                self.send_to(dests, message).await;
            }
        }
    }

    async fn run(mut self) {
        info!(
            "Output dispatcher on node {} has started successfully.",
            self.node
        );
        loop {
            tokio::select! {
                Some(outbound) = self.rx_output.recv() => {
                    self.dispatch(outbound).await;
                },

                _ = self.rx_shutdown.receiver.recv() => {
                    return;
                }
            }
        }
    }
}
