// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The voting safety rules. `safe_node` is the only gate between a valid
//! proposal and a prepare vote; the freshness rule keeps the prepared and
//! locked certificates monotonic in view.

use types::QuorumCertificate;

/// Whether `candidate` may replace `current` as a replica's prepared or
/// locked certificate: strictly higher view, or anything replaces genesis.
pub fn fresher(candidate: &QuorumCertificate, current: &QuorumCertificate) -> bool {
    if candidate.genesis {
        return false;
    }
    current.genesis || candidate.view > current.view
}

/// The SafeNode predicate. A replica may vote for a proposal justified by
/// `high_qc` iff one of:
/// - liveness rule: `high_qc` is from a strictly higher view than the
///   lock, so a stalled lock can never wedge the instance;
/// - safety rule: `high_qc` confirms the locked batch at the locked view;
/// - there is no lock yet (the lock is still genesis).
pub fn safe_node(high_qc: &QuorumCertificate, locked_qc: &QuorumCertificate) -> bool {
    if locked_qc.genesis {
        return true;
    }
    if high_qc.view > locked_qc.view {
        return true;
    }
    high_qc.view == locked_qc.view && high_qc.batch_hash == locked_qc.batch_hash
}
