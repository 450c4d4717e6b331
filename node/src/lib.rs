// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node assembly: loads the run configuration, binds the transport and
//! spawns either a replica (the consensus engine over the in-memory
//! key-value store) or a client workload driver.

pub mod client;
pub mod execution;
pub mod transport;

use crate::client::ClientDriver;
use crate::execution::KvStore;
use crate::transport::TcpTransport;
use anyhow::{Context, Result};
use config::{Committee, Export, Import, Parameters};
use consensus::ConsensusEngine;
use crypto::{KeyPair, NodeId};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use types::PreSubscribedBroadcastSender;

/// Everything one node needs for a run: the shared committee, the shared
/// parameters and this node's signing key.
#[derive(Serialize, Deserialize)]
pub struct NodeConfig {
    pub committee: Committee,
    pub parameters: Parameters,
    /// This node's secret key seed (demo deployments only; production
    /// keys live in a key store).
    pub key_seed: [u8; 32],
}

impl Import for NodeConfig {}
impl Export for NodeConfig {}

impl NodeConfig {
    pub fn keypair(&self) -> KeyPair {
        KeyPair::from_seed(self.key_seed)
    }

    /// All peer addresses, replicas and clients alike.
    pub fn addresses(&self) -> HashMap<NodeId, SocketAddr> {
        self.committee
            .authorities
            .iter()
            .map(|(id, a)| (*id, a.address))
            .chain(self.committee.clients.iter().map(|(id, c)| (*id, c.address)))
            .collect()
    }
}

/// High level functions to spawn a replica or a client.
pub struct Node;

impl Node {
    /// Spawns the full consensus engine for `node_id`.
    pub async fn spawn_replica(
        node_id: NodeId,
        config: &NodeConfig,
        registry: &Registry,
    ) -> Result<(Vec<JoinHandle<()>>, PreSubscribedBroadcastSender)> {
        let transport = TcpTransport::bind(node_id, config.addresses())
            .await
            .context("failed to bind the transport")?;
        let store = Arc::new(KvStore::new());
        let (handles, shutdown, _state) = ConsensusEngine::spawn(
            node_id,
            config.keypair(),
            config.committee.clone(),
            config.parameters.clone(),
            transport,
            store,
            None,
            registry,
        );
        info!("replica {node_id} is up");
        Ok((handles, shutdown))
    }

    /// Spawns the workload driver for client `node_id`.
    pub async fn spawn_client(
        node_id: NodeId,
        config: &NodeConfig,
    ) -> Result<(Vec<JoinHandle<()>>, PreSubscribedBroadcastSender)> {
        let transport = TcpTransport::bind(node_id, config.addresses())
            .await
            .context("failed to bind the transport")?;
        let mut shutdown = PreSubscribedBroadcastSender::new(1);
        let handle = ClientDriver::spawn(
            node_id,
            config.keypair(),
            config.committee.clone(),
            config.parameters.clone(),
            transport,
            shutdown.subscribe(),
        );
        info!("client {node_id} is up");
        Ok((vec![handle], shutdown))
    }
}

/// Writes per-node config files for a local deployment; returns the paths.
pub fn generate_localnet(
    replicas: usize,
    clients: usize,
    base_port: u16,
    output_dir: &std::path::Path,
) -> Result<Vec<std::path::PathBuf>> {
    let (committee, replica_keys, client_keys) =
        config::committee_fixture(replicas, clients, base_port);
    let parameters = Parameters::default();

    let mut paths = Vec::new();
    let keys = replica_keys.iter().chain(client_keys.iter());
    for (index, _) in keys.enumerate() {
        let mut seed = [0u8; 32];
        // Mirror the fixture's deterministic seeds.
        if index < replicas {
            seed[0] = index as u8;
            seed[1] = 0xa5;
        } else {
            seed[0] = (index - replicas) as u8;
            seed[1] = 0x5a;
        }
        let node_config = NodeConfig {
            committee: committee.clone(),
            parameters: parameters.clone(),
            key_seed: seed,
        };
        let path = output_dir.join(format!("node-{index}.yaml"));
        node_config
            .export(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localnet_configs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = generate_localnet(4, 1, 18200, dir.path()).unwrap();
        assert_eq!(paths.len(), 5);

        let config = NodeConfig::import(&paths[2]).unwrap();
        assert_eq!(config.committee.size(), 4);
        // The seed reproduces the committee key for that slot.
        assert_eq!(
            config.keypair().public(),
            *config.committee.protocol_key(2).unwrap()
        );
        // Client slots map to client keys.
        let client = NodeConfig::import(&paths[4]).unwrap();
        assert_eq!(
            client.keypair().public(),
            *client.committee.client_key(4).unwrap()
        );
    }
}
