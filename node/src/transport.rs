// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Framed TCP transport. One listener accepts inbound connections whose
//! frames all funnel into a single queue; one lazily-connected writer task
//! per peer drains an outbound queue, reconnecting with backoff. Loss
//! during reconnection is tolerated by the consensus layer.

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use crypto::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use types::{ConsensusError, ConsensusResult, Transport};

const PEER_QUEUE_SIZE: usize = 10_000;
const RECONNECT_DELAY: Duration = Duration::from_millis(200);
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub struct TcpTransport {
    node: NodeId,
    addresses: HashMap<NodeId, SocketAddr>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: DashMap<NodeId, mpsc::Sender<Bytes>>,
}

impl TcpTransport {
    fn codec() -> LengthDelimitedCodec {
        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(MAX_FRAME_LENGTH);
        codec
    }

    /// Binds the local listener and returns the transport handle.
    pub async fn bind(
        node: NodeId,
        addresses: HashMap<NodeId, SocketAddr>,
    ) -> ConsensusResult<Arc<Self>> {
        let address = *addresses
            .get(&node)
            .ok_or(ConsensusError::UnknownSender(node))?;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ConsensusError::NetworkError(e.to_string()))?;
        info!("node {node} listening on {address}");

        let (tx_inbound, rx_inbound) = mpsc::channel(PEER_QUEUE_SIZE);
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    debug!("listener closed");
                    return;
                };
                debug!("accepted connection from {peer}");
                let tx = tx_inbound.clone();
                tokio::spawn(async move {
                    let mut reader = FramedRead::new(socket, Self::codec());
                    while let Some(frame) = reader.next().await {
                        match frame {
                            Ok(bytes) => {
                                if tx.send(bytes.freeze()).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                debug!("connection from {peer} errored: {e}");
                                return;
                            }
                        }
                    }
                });
            }
        });

        Ok(Arc::new(Self {
            node,
            addresses,
            inbound: Mutex::new(rx_inbound),
            outbound: DashMap::new(),
        }))
    }

    /// The writer task feeding one peer, spawned on first send.
    fn spawn_writer(address: SocketAddr, mut rx: mpsc::Receiver<Bytes>) {
        tokio::spawn(async move {
            loop {
                let stream = match TcpStream::connect(address).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("connect to {address} failed: {e}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                let mut writer = FramedWrite::new(stream, Self::codec());
                loop {
                    let Some(payload) = rx.recv().await else {
                        // Transport dropped, nothing more to send.
                        return;
                    };
                    if let Err(e) = writer.send(payload).await {
                        warn!("send to {address} failed, reconnecting: {e}");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, dest: NodeId, payload: Bytes) -> ConsensusResult<()> {
        let sender = match self.outbound.get(&dest) {
            Some(sender) => sender.clone(),
            None => {
                let address = *self
                    .addresses
                    .get(&dest)
                    .ok_or(ConsensusError::UnknownSender(dest))?;
                let entry = self
                    .outbound
                    .entry(dest)
                    .or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(PEER_QUEUE_SIZE);
                        Self::spawn_writer(address, rx);
                        tx
                    });
                entry.value().clone()
            }
        };
        sender
            .try_send(payload)
            .map_err(|_| ConsensusError::NetworkError(format!("peer {dest} queue full")))
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_travel_between_two_transports() {
        let addresses: HashMap<NodeId, SocketAddr> = [
            (0u64, "127.0.0.1:18101".parse().unwrap()),
            (1u64, "127.0.0.1:18102".parse().unwrap()),
        ]
        .into_iter()
        .collect();

        let a = TcpTransport::bind(0, addresses.clone()).await.unwrap();
        let b = TcpTransport::bind(1, addresses).await.unwrap();

        a.send(1, Bytes::from_static(b"hello")).await.unwrap();
        let frame = b.recv().await.unwrap();
        assert_eq!(&frame[..], b"hello");

        // And the reverse direction over a fresh connection.
        b.send(0, Bytes::from_static(b"world")).await.unwrap();
        let frame = a.recv().await.unwrap();
        assert_eq!(&frame[..], b"world");
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let addresses: HashMap<NodeId, SocketAddr> =
            [(0u64, "127.0.0.1:18103".parse().unwrap())].into_iter().collect();
        let t = TcpTransport::bind(0, addresses).await.unwrap();
        assert!(t.send(9, Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn node_without_address_cannot_bind() {
        let addresses: HashMap<NodeId, SocketAddr> =
            [(0u64, "127.0.0.1:18104".parse().unwrap())].into_iter().collect();
        assert!(TcpTransport::bind(5, addresses).await.is_err());
    }
}
