// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shutdown fan-out. All receivers are subscribed before any task starts,
//! so a signal sent at any point reaches every task; no task may spin-wait
//! for shutdown.

use tokio::sync::broadcast;

pub struct ConditionalBroadcastReceiver {
    pub receiver: broadcast::Receiver<()>,
}

impl ConditionalBroadcastReceiver {
    /// Completes when the shutdown signal fires (or the sender dropped).
    pub async fn wait(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

/// A broadcast sender whose receivers are all created up front, before the
/// tasks that consume them are spawned.
pub struct PreSubscribedBroadcastSender {
    sender: broadcast::Sender<()>,
    receivers: Vec<ConditionalBroadcastReceiver>,
}

impl PreSubscribedBroadcastSender {
    pub fn new(num_subscribers: u64) -> Self {
        let (sender, _) = broadcast::channel(1);
        let receivers = (0..num_subscribers)
            .map(|_| ConditionalBroadcastReceiver {
                receiver: sender.subscribe(),
            })
            .collect();
        Self { sender, receivers }
    }

    pub fn subscribe(&mut self) -> ConditionalBroadcastReceiver {
        self.receivers
            .pop()
            .expect("shutdown receivers are exhausted")
    }

    pub fn subscribe_n(&mut self, n: u64) -> Vec<ConditionalBroadcastReceiver> {
        (0..n).map(|_| self.subscribe()).collect()
    }

    /// Signals every subscriber. Returns the number of receivers reached.
    pub fn send(&self) -> Result<usize, broadcast::error::SendError<()>> {
        self.sender.send(())
    }
}
