// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: an in-process loopback network, a recording execution
//! state and helpers to assemble committees, batches and certificates.

use crate::engine::ConsensusEngine;
use crate::executor::ExecutionState;
use crate::state::EngineState;
use bytes::Bytes;
use config::{Committee, Parameters};
use crypto::{Hash, KeyPair, NodeId};
use parking_lot::Mutex;
use prometheus::{IntGauge, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use types::{
    ClientBatch, Envelope, Message, PreSubscribedBroadcastSender, QcKind, QuorumCertificate,
    Request, Transport,
};

/// A fresh gauge for hand-built metered channels.
pub fn test_gauge(name: &str) -> IntGauge {
    IntGauge::new(name.to_string(), "test gauge").unwrap()
}

pub fn test_parameters(instances: u64, batch_size: u64, view_timeout_ms: u64) -> Parameters {
    let mut parameters = Parameters::default();
    parameters.instances = instances;
    parameters.batch_size = batch_size;
    parameters.view_timeout_ms = view_timeout_ms;
    parameters.txn_per_checkpoint = 100;
    parameters
}

/// In-process transport: every node's sends are delivered straight into
/// the destination's inbox.
pub struct LocalTransport {
    peers: HashMap<NodeId, mpsc::Sender<Bytes>>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, dest: NodeId, payload: Bytes) -> types::ConsensusResult<()> {
        // Unknown or crashed destinations swallow the message, like a
        // network would.
        if let Some(peer) = self.peers.get(&dest) {
            let _ = peer.send(payload).await;
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbox.lock().await.recv().await
    }
}

/// Builds one connected loopback transport per node id.
pub fn local_network(ids: &[NodeId]) -> HashMap<NodeId, Arc<LocalTransport>> {
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for id in ids {
        let (tx, rx) = mpsc::channel(10_000);
        senders.insert(*id, tx);
        receivers.insert(*id, rx);
    }
    ids.iter()
        .map(|id| {
            (
                *id,
                Arc::new(LocalTransport {
                    peers: senders.clone(),
                    inbox: tokio::sync::Mutex::new(
                        receivers.remove(id).expect("one receiver per id"),
                    ),
                }),
            )
        })
        .collect()
}

/// Execution state that records the applied transaction ids in order.
#[derive(Default)]
pub struct RecordingState {
    applied: Mutex<Vec<u64>>,
    digest: Mutex<Hash>,
}

impl RecordingState {
    pub fn applied(&self) -> Vec<u64> {
        self.applied.lock().clone()
    }
}

#[async_trait::async_trait]
impl ExecutionState for RecordingState {
    async fn apply(&self, txn_id: u64, request: &Request) -> Vec<u8> {
        self.applied.lock().push(txn_id);
        let mut digest = self.digest.lock();
        let mut bytes = digest.as_bytes().to_vec();
        bytes.extend_from_slice(&request.payload);
        *digest = Hash::digest(&bytes);
        request.payload.clone()
    }

    async fn state_digest(&self) -> Hash {
        *self.digest.lock()
    }
}

pub fn make_batch(client: NodeId, first_seq: u64, len: u64) -> ClientBatch {
    ClientBatch {
        client,
        requests: (0..len)
            .map(|i| Request {
                client,
                seq: first_seq + i,
                payload: (first_seq + i).to_le_bytes().to_vec(),
            })
            .collect(),
    }
}

/// A certificate actually signed by the first `signers` committee keys.
pub fn certificate(
    kind: QcKind,
    view: u64,
    height: u64,
    batch_hash: Hash,
    keys: &[KeyPair],
    signers: usize,
) -> QuorumCertificate {
    let bytes = QuorumCertificate::signing_bytes(kind, view, &batch_hash);
    QuorumCertificate {
        kind,
        genesis: false,
        view,
        parent_view: 0,
        height,
        batch_hash,
        parent_hash: Hash::default(),
        grand: None,
        shares: keys
            .iter()
            .take(signers)
            .enumerate()
            .map(|(i, kp)| (i as NodeId, kp.share_sign(&bytes)))
            .collect(),
    }
}

/// Delivers a signed envelope from `src` into `dest`'s inbox.
pub async fn inject(
    network: &HashMap<NodeId, Arc<LocalTransport>>,
    keypair: &KeyPair,
    src: NodeId,
    dest: NodeId,
    message: Message,
) {
    let envelope = Envelope::new(src, dest, message, keypair).unwrap();
    let bytes = envelope.to_bytes().unwrap();
    network[&src].send(dest, bytes).await.unwrap();
}

/// Reads the next protocol message out of a transport's inbox.
pub async fn next_message(transport: &Arc<LocalTransport>) -> (NodeId, Message) {
    let bytes = transport.recv().await.expect("transport closed");
    let envelope = Envelope::from_bytes(&bytes).unwrap();
    (envelope.src, envelope.message)
}

pub struct TestNode {
    pub handles: Vec<JoinHandle<()>>,
    pub shutdown: PreSubscribedBroadcastSender,
    pub state: Arc<EngineState>,
    pub store: Arc<RecordingState>,
}

/// Spawns a full engine per replica except those listed in `skip`.
pub fn spawn_engines(
    committee: &Committee,
    keys: &[KeyPair],
    parameters: &Parameters,
    network: &HashMap<NodeId, Arc<LocalTransport>>,
    skip: &[NodeId],
) -> HashMap<NodeId, TestNode> {
    let mut nodes = HashMap::new();
    for (id, key) in keys.iter().enumerate() {
        let id = id as NodeId;
        if skip.contains(&id) {
            continue;
        }
        let store = Arc::new(RecordingState::default());
        let seed = {
            let mut seed = [0u8; 32];
            seed[0] = id as u8;
            seed[1] = 0xa5;
            seed
        };
        assert_eq!(key.public(), KeyPair::from_seed(seed).public());
        let (handles, shutdown, state) = ConsensusEngine::spawn(
            id,
            KeyPair::from_seed(seed),
            committee.clone(),
            parameters.clone(),
            network[&id].clone(),
            store.clone(),
            None,
            &Registry::new(),
        );
        nodes.insert(
            id,
            TestNode {
                handles,
                shutdown,
                state,
                store,
            },
        );
    }
    nodes
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn eventually<F: Fn() -> bool>(timeout_ms: u64, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
