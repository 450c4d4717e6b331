// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded mpsc channels instrumented with a prometheus gauge tracking the
//! number of in-flight items, so queue depth shows up on the dashboard
//! without any polling.

use prometheus::IntGauge;
use tokio::sync::mpsc;
pub use tokio::sync::mpsc::error::{SendError, TrySendError};

#[derive(Debug)]
pub struct Sender<T> {
    inner: mpsc::Sender<T>,
    gauge: IntGauge,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gauge: self.gauge.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.inner.send(value).await.map(|()| self.gauge.inc())
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.inner.try_send(value).map(|()| self.gauge.inc())
    }
}

#[derive(Debug)]
pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
    gauge: IntGauge,
}

impl<T> Receiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.inner.recv().await;
        if item.is_some() {
            self.gauge.dec();
        }
        item
    }

    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.inner.try_recv().ok();
        if item.is_some() {
            self.gauge.dec();
        }
        item
    }
}

pub fn channel<T>(size: usize, gauge: &IntGauge) -> (Sender<T>, Receiver<T>) {
    gauge.set(0);
    let (tx, rx) = mpsc::channel(size);
    (
        Sender {
            inner: tx,
            gauge: gauge.clone(),
        },
        Receiver {
            inner: rx,
            gauge: gauge.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gauge_tracks_in_flight_items() {
        let gauge = IntGauge::new("queue_depth", "items in flight").unwrap();
        let (tx, mut rx) = channel(8, &gauge);

        tx.send(1u64).await.unwrap();
        tx.send(2u64).await.unwrap();
        assert_eq!(gauge.get(), 2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(gauge.get(), 1);
        drop(tx);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
        assert_eq!(gauge.get(), 0);
    }
}
