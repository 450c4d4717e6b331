// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::test_utils::{
    certificate, eventually, inject, local_network, make_batch, next_message, spawn_engines,
    test_parameters,
};
use config::committee_fixture;
use crypto::{Hash, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use types::{PhaseCertificate, Proposal, QcKind, QuorumCertificate, Vote};

/// Waits until `f + 1` replicas report the same `(txn_id, digest)` on the
/// client's transport, returning the accepted response.
async fn await_acceptance(
    transport: &Arc<crate::test_utils::LocalTransport>,
    validity_threshold: u64,
) -> types::ClientResponse {
    let mut tally: HashMap<(u64, Hash), HashSet<NodeId>> = HashMap::new();
    let deadline = Duration::from_secs(20);
    loop {
        let (_, message) = tokio::time::timeout(deadline, next_message(transport))
            .await
            .expect("no quorum of client responses in time");
        if let Message::ClientResponse(response) = message {
            let voters = tally
                .entry((response.txn_id, response.result_digest))
                .or_default();
            voters.insert(response.node);
            if voters.len() as u64 >= validity_threshold {
                return response;
            }
        }
    }
}

#[tokio::test]
async fn four_replicas_commit_and_answer_the_client() {
    let (committee, keys, client_keys) = committee_fixture(4, 1, 7800);
    let parameters = test_parameters(1, 2, 60_000);
    let network = local_network(&[0, 1, 2, 3, 4]);
    let nodes = spawn_engines(&committee, &keys, &parameters, &network, &[]);

    // The client targets the leader of view 0.
    inject(
        &network,
        &client_keys[0],
        4,
        0,
        Message::ClientBatch(make_batch(4, 0, 2)),
    )
    .await;

    let response = await_acceptance(&network[&4], committee.validity_threshold()).await;
    assert_eq!(response.txn_id, 1);
    assert_eq!(response.view, 0);

    // Every replica executed both transactions in order and advanced to
    // the next slot of the same leader.
    for node in nodes.values() {
        assert!(eventually(5_000, || node.store.applied() == vec![0, 1]).await);
        assert!(eventually(5_000, || node.state.current_view(0) == 4).await);
    }
    for node in nodes.into_values() {
        node.shutdown.send().unwrap();
    }
}

#[tokio::test]
async fn single_replica_orders_alone() {
    // f = 0: one replica is its own quorum.
    let (committee, keys, client_keys) = committee_fixture(1, 1, 7810);
    let parameters = test_parameters(1, 2, 60_000);
    let network = local_network(&[0, 1]);
    let nodes = spawn_engines(&committee, &keys, &parameters, &network, &[]);

    inject(
        &network,
        &client_keys[0],
        1,
        0,
        Message::ClientBatch(make_batch(1, 0, 2)),
    )
    .await;

    let response = await_acceptance(&network[&1], committee.validity_threshold()).await;
    assert_eq!(response.txn_id, 1);
    assert!(eventually(5_000, || nodes[&0].store.applied() == vec![0, 1]).await);
    for node in nodes.into_values() {
        node.shutdown.send().unwrap();
    }
}

#[tokio::test]
async fn parallel_instances_execute_in_global_index_order() {
    let (committee, keys, client_keys) = committee_fixture(4, 1, 7820);
    let parameters = test_parameters(2, 2, 60_000);
    let network = local_network(&[0, 1, 2, 3, 4]);
    let nodes = spawn_engines(&committee, &keys, &parameters, &network, &[]);

    // Two batches race through independent instances: node 0 leads
    // instance 0 and node 1 leads instance 1 at view 0.
    inject(
        &network,
        &client_keys[0],
        4,
        1,
        Message::ClientBatch(make_batch(4, 100, 2)),
    )
    .await;
    inject(
        &network,
        &client_keys[0],
        4,
        0,
        Message::ClientBatch(make_batch(4, 0, 2)),
    )
    .await;

    // However the decides interleave, execution merges by global index:
    // instance 0 owns batch 0 (txns 0-1), instance 1 owns batch 1
    // (txns 2-3).
    for node in nodes.values() {
        assert!(eventually(10_000, || node.store.applied().len() == 4).await);
        assert_eq!(node.store.applied(), vec![0, 1, 2, 3]);
    }
    for node in nodes.into_values() {
        node.shutdown.send().unwrap();
    }
}

#[tokio::test]
async fn crashed_leader_is_replaced_and_its_batch_survives() {
    let (committee, keys, client_keys) = committee_fixture(4, 1, 7830);
    let parameters = test_parameters(1, 2, 500);
    let network = local_network(&[0, 1, 2, 3, 4]);
    // Node 0 crashed after broadcasting its proposal and the prepared
    // certificate: its engine never runs.
    let nodes = spawn_engines(&committee, &keys, &parameters, &network, &[0]);

    let batch = make_batch(4, 0, 2);
    let hash = batch.digest();
    let proposal = Proposal {
        txn_id: 1,
        instance: 0,
        view: 0,
        batch_hash: hash,
        justify: QuorumCertificate::genesis(),
        batch,
    };
    for dest in [1u64, 2, 3] {
        inject(
            &network,
            &keys[0],
            0,
            dest,
            Message::Proposal(proposal.clone()),
        )
        .await;
    }
    // The prepared certificate of view 0 made it out before the crash.
    let prepared = certificate(QcKind::Prepare, 0, 0, hash, &keys, 3);
    for dest in [1u64, 2, 3] {
        inject(
            &network,
            &keys[0],
            0,
            dest,
            Message::PreCommit(PhaseCertificate {
                txn_id: 1,
                instance: 0,
                view: 0,
                qc: prepared.clone(),
            }),
        )
        .await;
    }

    // Timers expire, NewViews gather at node 1 (leader of view 1), the
    // batch is re-proposed and decides under the new view.
    let response = await_acceptance(&network[&4], committee.validity_threshold()).await;
    assert_eq!(response.txn_id, 1);
    assert_eq!(response.view, 1);

    for node in nodes.values() {
        assert!(eventually(5_000, || node.store.applied() == vec![0, 1]).await);
        assert!(node.state.stopped_nodes.contains(&0));
    }
    for node in nodes.into_values() {
        node.shutdown.send().unwrap();
    }
}

#[tokio::test]
async fn stable_checkpoints_reclaim_old_state() {
    let (committee, keys, client_keys) = committee_fixture(4, 1, 7840);
    let mut parameters = test_parameters(1, 1, 60_000);
    parameters.txn_per_checkpoint = 2;
    let network = local_network(&[0, 1, 2, 3, 4]);
    let nodes = spawn_engines(&committee, &keys, &parameters, &network, &[]);

    // Four single-transaction batches; checkpoints land after batches 1
    // and 3.
    for i in 0u64..4 {
        inject(
            &network,
            &client_keys[0],
            4,
            0,
            Message::ClientBatch(make_batch(4, i, 1)),
        )
        .await;
    }

    for node in nodes.values() {
        assert!(eventually(15_000, || node.store.applied().len() == 4).await);
        assert!(
            eventually(10_000, || node.state.last_stable_checkpoint() >= 1).await,
            "checkpoint should stabilize"
        );
        assert!(eventually(10_000, || node.state.txn_table.last_deleted() >= 2).await);
        assert!(!node.state.txn_table.contains(0));
    }

    // A delayed vote for a reclaimed batch bounces off the window check.
    let stale = Vote::new(QcKind::Prepare, 0, 0, 0, Hash::digest(b"gone"), 1, &keys[1]);
    inject(&network, &keys[1], 1, 0, Message::PrepareVote(stale)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!nodes[&0].state.txn_table.contains(0));

    for node in nodes.into_values() {
        node.shutdown.send().unwrap();
    }
}

#[tokio::test]
async fn view_changes_disabled_means_no_rotation() {
    let (committee, keys, client_keys) = committee_fixture(4, 1, 7850);
    let mut parameters = test_parameters(1, 2, 200);
    parameters.flags.view_changes = false;
    let network = local_network(&[0, 1, 2, 3, 4]);
    // The leader is down and nobody may rotate away from it.
    let nodes = spawn_engines(&committee, &keys, &parameters, &network, &[0]);

    let batch = make_batch(4, 0, 2);
    let proposal = Proposal {
        txn_id: 1,
        instance: 0,
        view: 0,
        batch_hash: batch.digest(),
        justify: QuorumCertificate::genesis(),
        batch,
    };
    for dest in [1u64, 2, 3] {
        inject(
            &network,
            &keys[0],
            0,
            dest,
            Message::Proposal(proposal.clone()),
        )
        .await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    for node in nodes.values() {
        assert_eq!(node.state.current_view(0), 0);
        assert!(node.state.stopped_nodes.is_empty());
        assert!(node.store.applied().is_empty());
    }
    for node in nodes.into_values() {
        node.shutdown.send().unwrap();
    }
}
