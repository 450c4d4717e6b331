// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The client workload driver. Packs requests into batches of
//! `batch_size`, submits each batch to the believed leader and accepts a
//! result once `f + 1` replicas report the same `(txn_id, digest)`, which
//! guarantees at least one honest replica stands behind it. A stalled
//! pipeline rotates the believed leader.

use crate::execution::KvCommand;
use config::{Committee, Parameters};
use crypto::{Hash, KeyPair, NodeId};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::{
    ClientBatch, ClientResponse, ConditionalBroadcastReceiver, Envelope, Message, Request,
    Transport,
};

/// Batches kept in flight before waiting for completions.
const MAX_OUTSTANDING: u64 = 8;
/// Keys in the synthetic workload.
const KEY_SPACE: u64 = 1_000;

pub struct ClientDriver {
    node: NodeId,
    keypair: Arc<KeyPair>,
    committee: Committee,
    parameters: Parameters,
    transport: Arc<dyn Transport>,

    /// Believed current view per instance, bumped on stalls.
    believed_view: Vec<u64>,
    next_instance: u64,
    next_seq: u64,
    sent: u64,
    completed: u64,
    /// Response tally: `(txn_id, digest)` -> distinct replicas.
    tally: HashMap<(u64, Hash), HashSet<NodeId>>,
    accepted: HashSet<u64>,
    rng: StdRng,
}

impl ClientDriver {
    #[must_use]
    pub fn spawn(
        node: NodeId,
        keypair: KeyPair,
        committee: Committee,
        parameters: Parameters,
        transport: Arc<dyn Transport>,
        rx_shutdown: ConditionalBroadcastReceiver,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let instances = parameters.instances as usize;
            Self {
                node,
                keypair: Arc::new(keypair),
                committee,
                parameters,
                transport,
                believed_view: vec![0; instances],
                next_instance: 0,
                next_seq: 0,
                sent: 0,
                completed: 0,
                tally: HashMap::new(),
                accepted: HashSet::new(),
                rng: StdRng::seed_from_u64(node),
            }
            .run(rx_shutdown)
            .await;
        })
    }

    fn make_batch(&mut self) -> ClientBatch {
        let requests = (0..self.parameters.batch_size)
            .map(|_| {
                let seq = self.next_seq;
                self.next_seq += 1;
                let key = self.rng.gen_range(0..KEY_SPACE).to_le_bytes().to_vec();
                let value = (0..64u8).map(|_| self.rng.gen()).collect();
                Request {
                    client: self.node,
                    seq,
                    payload: bincode::serialize(&KvCommand::Set { key, value })
                        .expect("serializing a command cannot fail"),
                }
            })
            .collect();
        ClientBatch {
            client: self.node,
            requests,
        }
    }

    /// The replica currently believed to lead the next instance.
    fn target(&mut self) -> NodeId {
        let instance = self.next_instance;
        self.next_instance = (self.next_instance + 1) % self.parameters.instances;
        self.committee
            .leader(instance, self.believed_view[instance as usize])
    }

    async fn submit_one(&mut self) {
        let batch = self.make_batch();
        let dest = self.target();
        let envelope = match Envelope::new(
            self.node,
            dest,
            Message::ClientBatch(batch),
            &self.keypair,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to build client batch: {e}");
                return;
            }
        };
        let Ok(bytes) = envelope.to_bytes() else {
            return;
        };
        if let Err(e) = self.transport.send(dest, bytes).await {
            debug!("submit to {dest} failed: {e}");
            return;
        }
        self.sent += 1;
        debug!("submitted batch to replica {dest} ({} in flight)", self.sent - self.completed);
    }

    async fn pump(&mut self) {
        while self.sent - self.completed < MAX_OUTSTANDING {
            self.submit_one().await;
        }
    }

    fn handle_response(&mut self, response: ClientResponse) {
        if self.accepted.contains(&response.txn_id) {
            return;
        }
        let voters = self
            .tally
            .entry((response.txn_id, response.result_digest))
            .or_default();
        if !voters.insert(response.node) {
            return;
        }
        if voters.len() as u64 >= self.committee.validity_threshold() {
            self.accepted.insert(response.txn_id);
            self.tally.retain(|(txn_id, _), _| *txn_id != response.txn_id);
            self.completed += 1;
            debug!(
                "batch with txn {} accepted at view {} ({} done)",
                response.txn_id, response.view, self.completed
            );
        }
    }

    /// No completion for a while: assume the believed leaders moved on.
    fn rotate_leaders(&mut self) {
        for view in self.believed_view.iter_mut() {
            *view += 1;
        }
        info!("client {} rotating believed leaders", self.node);
    }

    async fn run(mut self, mut rx_shutdown: ConditionalBroadcastReceiver) {
        info!("Client driver {} has started successfully.", self.node);
        let stall = Duration::from_millis(self.parameters.view_timeout_ms * 2);
        let mut stats_interval = tokio::time::interval(Duration::from_secs(5));
        let mut last_completed = 0u64;

        self.pump().await;
        loop {
            tokio::select! {
                frame = self.transport.recv() => {
                    let Some(bytes) = frame else { return };
                    match Envelope::from_bytes(&bytes) {
                        Ok(envelope) if envelope.verify(&self.committee).is_ok() => {
                            if let Message::ClientResponse(response) = envelope.message {
                                self.handle_response(response);
                                self.pump().await;
                            }
                        }
                        Ok(_) => debug!("unauthenticated frame dropped"),
                        Err(e) => debug!("undecodable frame dropped: {e}"),
                    }
                },

                _ = tokio::time::sleep(stall) => {
                    if self.completed == last_completed && self.sent > self.completed {
                        self.rotate_leaders();
                        self.pump().await;
                    }
                    last_completed = self.completed;
                },

                _ = stats_interval.tick() => {
                    info!(
                        "client {}: {} batches sent, {} accepted",
                        self.node, self.sent, self.completed
                    );
                },

                _ = rx_shutdown.receiver.recv() => {
                    info!(
                        "client {} stopping: {} batches sent, {} accepted",
                        self.node, self.sent, self.completed
                    );
                    return;
                }
            }
        }
    }
}
