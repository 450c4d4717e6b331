// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConsensusResult;
use bytes::Bytes;
use crypto::NodeId;

/// The wire is a black box to consensus: reliable in-order delivery per
/// connection, loss and reordering across connections handled by quorum
/// redundancy and view changes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues `payload` for delivery to `dest`. Must not block on the
    /// remote end.
    async fn send(&self, dest: NodeId, payload: Bytes) -> ConsensusResult<()>;

    /// The next inbound frame, or `None` once the transport has shut
    /// down.
    async fn recv(&self) -> Option<Bytes>;
}
