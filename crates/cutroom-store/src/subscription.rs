//! Live query subscriptions.
//!
//! A subscription is a channel of full snapshots. The producer half
//! ([`SnapshotSink`]) lives in whatever task talks to the store; the consumer
//! half ([`Subscription`]) is owned by the engine. Dropping the consumer
//! detaches the listener: the producer observes the shutdown signal and stops.

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::{Document, Query, StoreError};

/// Number of snapshots that may queue before the producer waits.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// An event pushed by a live query.
#[derive(Debug)]
pub enum SnapshotEvent {
    /// The complete current result set, superseding the previous one.
    Snapshot(Vec<Document>),
    /// The listener hit an error. The subscription stays open.
    Error(StoreError),
}

/// Consumer half of a live query.
#[derive(Debug)]
pub struct Subscription {
    query: Query,
    rx: mpsc::Receiver<SnapshotEvent>,
    shutdown_tx: watch::Sender<bool>,
}

/// Producer half of a live query.
#[derive(Debug, Clone)]
pub struct SnapshotSink {
    tx: mpsc::Sender<SnapshotEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Create a connected sink/subscription pair for `query`.
pub fn channel(query: Query) -> (SnapshotSink, Subscription) {
    let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (
        SnapshotSink { tx, shutdown_rx },
        Subscription {
            query,
            rx,
            shutdown_tx,
        },
    )
}

impl Subscription {
    /// Wait for the next pushed event. `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        self.rx.recv().await
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Detach the listener. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if self.shutdown_tx.send(true).is_err() {
            trace!(collection = %self.query.collection, "listener already gone");
        }
    }
}

impl SnapshotSink {
    /// Push an event. Returns false once the consumer has unsubscribed.
    pub async fn send(&self, event: SnapshotEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_rx.borrow() || self.tx.is_closed()
    }

    /// Resolve once the consumer has unsubscribed.
    pub async fn closed(&mut self) {
        while !*self.shutdown_rx.borrow_and_update() {
            if self.shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A receiver that flips to `true` when the consumer unsubscribes.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_until_unsubscribed() {
        let (sink, mut sub) = channel(Query::collection("chatMessages"));

        assert!(sink.send(SnapshotEvent::Snapshot(vec![])).await);
        assert!(matches!(sub.next().await, Some(SnapshotEvent::Snapshot(docs)) if docs.is_empty()));

        sub.unsubscribe();
        assert!(sink.is_closed());
        assert!(!sink.send(SnapshotEvent::Snapshot(vec![])).await);
    }

    #[tokio::test]
    async fn closed_resolves_on_drop() {
        let (mut sink, sub) = channel(Query::collection("notifications"));
        let waiter = tokio::spawn(async move {
            sink.closed().await;
        });
        drop(sub);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("sink should observe the drop")
            .unwrap();
    }
}
