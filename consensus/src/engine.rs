// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Engine assembly: builds the shared state, wires every queue and spawns
//! the task set (input router, per-instance workers, proposer, executor,
//! checkpointer, output dispatcher).

use crate::checkpointer::Checkpointer;
use crate::executor::{ExecutionState, Executor};
use crate::metrics::ConsensusMetrics;
use crate::proposer::Proposer;
use crate::router::{InputRouter, OutputDispatcher};
use crate::state::EngineState;
use crate::worker::Worker;
use config::{Committee, Parameters};
use crypto::{KeyPair, NodeId};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use types::{
    metered_channel, ClientBatch, ClientResponse, ExecuteNotify, Message,
    PreSubscribedBroadcastSender, Transport,
};

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
pub mod engine_tests;

/// A message on its way out, produced by the protocol tasks and consumed
/// by the output dispatcher.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// To one replica.
    Unicast { dest: NodeId, message: Message },
    /// To every other replica.
    Broadcast { message: Message },
    /// To a client node.
    Client { dest: NodeId, message: Message },
}

/// Control traffic into the proposer.
#[derive(Debug, Clone)]
pub enum ProposerCommand {
    /// A client batch awaits ordering.
    Batch(ClientBatch),
    /// An instance advanced to `view`; propose if we lead it.
    ViewReady { instance: u64, view: u64 },
    /// A proposal of the instance decided; frees one pipelining slot.
    Decided { instance: u64 },
    /// A view change re-anchored the instance's proposal schedule.
    Reset {
        instance: u64,
        next_view: u64,
        inflight: u64,
    },
}

/// Deferred side effects computed by a worker handler while it holds a
/// transaction manager, applied after the manager is released.
pub(crate) enum Effect {
    Send(Outbound),
    Execute(ExecuteNotify),
    Proposer(ProposerCommand),
}

/// High level functions to assemble and spawn the consensus engine.
pub struct ConsensusEngine;

impl ConsensusEngine {
    /// Shutdown receivers: input, output, proposer, executor,
    /// checkpointer, plus one per worker.
    const FIXED_SHUTDOWN_RECEIVERS: u64 = 5;

    /// Spawns every engine task. Returns the task handles, the shutdown
    /// handle (signalling it stops every task) and the shared engine
    /// state for introspection.
    pub fn spawn<State: ExecutionState>(
        node_id: NodeId,
        keypair: KeyPair,
        committee: Committee,
        parameters: Parameters,
        transport: Arc<dyn Transport>,
        execution: Arc<State>,
        tx_client_responses: Option<tokio::sync::mpsc::Sender<ClientResponse>>,
        registry: &Registry,
    ) -> (
        Vec<JoinHandle<()>>,
        PreSubscribedBroadcastSender,
        Arc<EngineState>,
    ) {
        let metrics = Arc::new(ConsensusMetrics::new(registry));
        let keypair = Arc::new(keypair);
        let instances = parameters.instances;
        let capacity = parameters.channel_capacity;
        parameters.tracing();

        let state = Arc::new(EngineState::new(node_id, committee, parameters));
        let mut tx_shutdown =
            PreSubscribedBroadcastSender::new(Self::FIXED_SHUTDOWN_RECEIVERS + instances);

        let depth = |name: &str| metrics.channel_depth.with_label_values(&[name]);

        let (tx_output, rx_output) = metered_channel::channel(capacity, &depth("output"));
        let (tx_proposer, rx_proposer) = metered_channel::channel(capacity, &depth("proposer"));
        let (tx_execute, rx_execute) = metered_channel::channel(capacity, &depth("executor"));
        let (tx_executed, rx_executed) = metered_channel::channel(capacity, &depth("executed"));
        let (tx_checkpointer, rx_checkpointer) =
            metered_channel::channel(capacity, &depth("checkpointer"));

        let mut tx_workers = Vec::new();
        let mut rx_workers = Vec::new();
        for instance in 0..instances {
            let (tx, rx) =
                metered_channel::channel(capacity, &depth(&format!("worker_{instance}")));
            tx_workers.push(tx);
            rx_workers.push((instance, rx));
        }

        let mut handles = Vec::new();

        handles.push(InputRouter::spawn(
            state.clone(),
            transport.clone(),
            tx_workers.clone(),
            tx_proposer.clone(),
            tx_checkpointer.clone(),
            tx_client_responses,
            tx_shutdown.subscribe(),
            metrics.clone(),
        ));

        for (instance, rx_work) in rx_workers {
            handles.push(Worker::spawn(
                instance,
                keypair.clone(),
                state.clone(),
                rx_work,
                tx_output.clone(),
                tx_execute.clone(),
                tx_proposer.clone(),
                tx_shutdown.subscribe(),
                metrics.clone(),
            ));
        }

        handles.push(Proposer::spawn(
            state.clone(),
            rx_proposer,
            tx_workers,
            tx_output.clone(),
            tx_shutdown.subscribe(),
            metrics.clone(),
        ));

        handles.push(Executor::spawn(
            state.clone(),
            execution,
            rx_execute,
            tx_output.clone(),
            tx_executed,
            tx_shutdown.subscribe(),
            metrics.clone(),
        ));

        handles.push(Checkpointer::spawn(
            state.clone(),
            rx_executed,
            rx_checkpointer,
            tx_output.clone(),
            tx_shutdown.subscribe(),
            metrics.clone(),
        ));

        handles.push(OutputDispatcher::spawn(
            keypair.clone(),
            state.clone(),
            transport,
            rx_output,
            tx_shutdown.subscribe(),
            metrics.clone(),
        ));

        // Announce ourselves: key exchange first, then readiness for the
        // startup barrier.
        let _ = tx_output.try_send(Outbound::Broadcast {
            message: Message::KeyExchange {
                node: node_id,
                key: keypair.public(),
            },
        });
        let _ = tx_output.try_send(Outbound::Broadcast {
            message: Message::Ready { node: node_id },
        });

        info!("Consensus engine on node {node_id} assembled");
        (handles, tx_shutdown, state)
    }
}
