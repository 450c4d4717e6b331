// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

#[derive(Clone)]
pub struct ConsensusMetrics {
    /// Proposals this node broadcast as a leader.
    pub proposals_made: IntCounter,
    /// Votes sent, by phase.
    pub votes_sent: IntCounterVec,
    /// Certificates formed locally from collected votes, by phase.
    pub qcs_formed: IntCounterVec,
    /// View changes initiated by this node.
    pub view_changes: IntCounter,
    /// Batches marked committed.
    pub committed_batches: IntCounter,
    /// Batches applied to the execution state.
    pub executed_batches: IntCounter,
    /// Checkpoints that reached stability.
    pub stable_checkpoints: IntCounter,
    /// Messages dropped at validation, by reason.
    pub dropped_messages: IntCounterVec,
    /// Messages accepted from the wire, by kind.
    pub received_messages: IntCounterVec,
    /// Live transaction managers.
    pub txn_table_size: IntGauge,
    /// Depth of every internal queue, by channel name.
    pub channel_depth: IntGaugeVec,
}

impl ConsensusMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            proposals_made: register_int_counter_with_registry!(
                "proposals_made",
                "Proposals this node broadcast as a leader",
                registry
            )
            .unwrap(),
            votes_sent: register_int_counter_vec_with_registry!(
                "votes_sent",
                "Votes sent, by phase",
                &["phase"],
                registry
            )
            .unwrap(),
            qcs_formed: register_int_counter_vec_with_registry!(
                "qcs_formed",
                "Certificates formed from collected votes, by phase",
                &["phase"],
                registry
            )
            .unwrap(),
            view_changes: register_int_counter_with_registry!(
                "view_changes",
                "View changes initiated by this node",
                registry
            )
            .unwrap(),
            committed_batches: register_int_counter_with_registry!(
                "committed_batches",
                "Batches marked committed",
                registry
            )
            .unwrap(),
            executed_batches: register_int_counter_with_registry!(
                "executed_batches",
                "Batches applied to the execution state",
                registry
            )
            .unwrap(),
            stable_checkpoints: register_int_counter_with_registry!(
                "stable_checkpoints",
                "Checkpoints that reached stability",
                registry
            )
            .unwrap(),
            dropped_messages: register_int_counter_vec_with_registry!(
                "dropped_messages",
                "Messages dropped at validation, by reason",
                &["reason"],
                registry
            )
            .unwrap(),
            received_messages: register_int_counter_vec_with_registry!(
                "received_messages",
                "Messages accepted from the wire, by kind",
                &["kind"],
                registry
            )
            .unwrap(),
            txn_table_size: register_int_gauge_with_registry!(
                "txn_table_size",
                "Live transaction managers",
                registry
            )
            .unwrap(),
            channel_depth: register_int_gauge_vec_with_registry!(
                "channel_depth",
                "Depth of every internal queue, by channel name",
                &["channel"],
                registry
            )
            .unwrap(),
        }
    }
}
