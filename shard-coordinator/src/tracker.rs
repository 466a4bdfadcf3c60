use std::collections::{BTreeMap, BTreeSet};

use common_kafka::consumer::RebalanceEvent;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::assignments::{HostPort, PartitionAssignments, PartitionId};

/// Messages understood by the partition tracker.
pub enum TrackerMsg {
    /// Subscribe a sink to assignment snapshots. The current snapshot, if
    /// any, is pushed immediately; registering twice is harmless.
    Register(mpsc::Sender<PartitionAssignments>),
    /// Replace the tracked snapshot and fan it out.
    Update(PartitionAssignments),
    GetCurrent(oneshot::Sender<Option<PartitionAssignments>>),
}

#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerMsg>,
}

impl TrackerHandle {
    pub async fn register(&self, subscriber: mpsc::Sender<PartitionAssignments>) {
        let _unused = self.tx.send(TrackerMsg::Register(subscriber)).await;
    }

    pub async fn update(&self, assignments: PartitionAssignments) {
        let _unused = self.tx.send(TrackerMsg::Update(assignments)).await;
    }

    pub async fn current(&self) -> Option<PartitionAssignments> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(TrackerMsg::GetCurrent(tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// The tracker counts as up while its mailbox is open.
    pub fn is_up(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct PartitionTracker {
    current: Option<PartitionAssignments>,
    subscribers: Vec<mpsc::Sender<PartitionAssignments>>,
}

/// Spawn the tracker agent. Assignment snapshots come in via
/// [`TrackerHandle::update`]; every registered subscriber gets each snapshot
/// in arrival order.
pub fn spawn_tracker() -> TrackerHandle {
    let (tx, mut rx) = mpsc::channel(64);
    let mut tracker = PartitionTracker {
        current: None,
        subscribers: Vec::new(),
    };

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            tracker.handle(msg).await;
        }
        debug!("partition tracker mailbox closed, exiting");
    });

    TrackerHandle { tx }
}

impl PartitionTracker {
    async fn handle(&mut self, msg: TrackerMsg) {
        match msg {
            TrackerMsg::Register(subscriber) => {
                let already_known = self
                    .subscribers
                    .iter()
                    .any(|existing| existing.same_channel(&subscriber));
                if !already_known {
                    if let Some(current) = &self.current {
                        let _unused = subscriber.send(current.clone()).await;
                    }
                    self.subscribers.push(subscriber);
                }
            }
            TrackerMsg::Update(assignments) => {
                info!(
                    partitions = assignments.all_partitions().len(),
                    "partition assignments updated"
                );
                self.current = Some(assignments.clone());
                self.subscribers.retain(|s| !s.is_closed());
                for subscriber in &self.subscribers {
                    if subscriber.send(assignments.clone()).await.is_err() {
                        warn!("dropping closed assignment subscriber");
                    }
                }
            }
            TrackerMsg::GetCurrent(reply) => {
                let _unused = reply.send(self.current.clone());
            }
        }
    }
}

/// Bridge the consumer group's rebalance callbacks into tracker snapshots.
///
/// Only this member's assignments are visible locally, so the produced
/// snapshots map a single host. A membership layer that gossips peer
/// assignments can push richer snapshots through the same handle.
pub fn spawn_rebalance_feed(
    mut rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    tracker: TrackerHandle,
    self_address: HostPort,
    topic: String,
) {
    tokio::spawn(async move {
        let mut owned: BTreeSet<PartitionId> = BTreeSet::new();
        while let Some(event) = rebalances.recv().await {
            match event {
                RebalanceEvent::Assigned(pairs) => {
                    for (event_topic, partition) in pairs {
                        if event_topic == topic {
                            owned.insert(PartitionId::new(event_topic, partition));
                        }
                    }
                }
                RebalanceEvent::Revoked(pairs) => {
                    for (event_topic, partition) in pairs {
                        owned.remove(&PartitionId::new(event_topic, partition));
                    }
                }
            }

            let mut by_host = BTreeMap::new();
            by_host.insert(self_address.clone(), owned.clone());
            tracker
                .update(PartitionAssignments::new(by_host))
                .await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(partitions: &[u32]) -> PartitionAssignments {
        let mut by_host = BTreeMap::new();
        by_host.insert(
            HostPort::new("localhost", 3305),
            partitions
                .iter()
                .map(|p| PartitionId::new("aggregate_events", *p))
                .collect(),
        );
        PartitionAssignments::new(by_host)
    }

    #[tokio::test]
    async fn register_receives_current_snapshot() {
        let tracker = spawn_tracker();
        tracker.update(snapshot(&[0, 1])).await;

        let (tx, mut rx) = mpsc::channel(4);
        tracker.register(tx).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, snapshot(&[0, 1]));
    }

    #[tokio::test]
    async fn updates_fan_out_to_subscribers() {
        let tracker = spawn_tracker();
        let (tx, mut rx) = mpsc::channel(4);
        tracker.register(tx).await;

        tracker.update(snapshot(&[0])).await;
        tracker.update(snapshot(&[0, 2])).await;

        assert_eq!(rx.recv().await.unwrap(), snapshot(&[0]));
        assert_eq!(rx.recv().await.unwrap(), snapshot(&[0, 2]));
    }

    #[tokio::test]
    async fn current_snapshot_is_queryable() {
        let tracker = spawn_tracker();
        assert_eq!(tracker.current().await, None);
        tracker.update(snapshot(&[4])).await;
        assert_eq!(tracker.current().await, Some(snapshot(&[4])));
        assert!(tracker.is_up());
    }

    #[tokio::test]
    async fn duplicate_registration_is_harmless() {
        let tracker = spawn_tracker();
        let (tx, mut rx) = mpsc::channel(4);
        tracker.register(tx.clone()).await;
        tracker.register(tx).await;

        tracker.update(snapshot(&[3])).await;
        assert_eq!(rx.recv().await.unwrap(), snapshot(&[3]));
        // A second delivery would mean we registered the channel twice
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rebalance_feed_builds_single_host_snapshots() {
        let tracker = spawn_tracker();
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
        spawn_rebalance_feed(
            rebalance_rx,
            tracker.clone(),
            HostPort::new("localhost", 3305),
            "aggregate_events".to_string(),
        );

        rebalance_tx
            .send(RebalanceEvent::Assigned(vec![
                ("aggregate_events".to_string(), 0),
                ("aggregate_events".to_string(), 1),
                ("unrelated".to_string(), 9),
            ]))
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        tracker.register(tx).await;
        // Either the registration snapshot or the update carries the state
        let received = rx.recv().await.unwrap();
        assert_eq!(received, snapshot(&[0, 1]));

        rebalance_tx
            .send(RebalanceEvent::Revoked(vec![(
                "aggregate_events".to_string(),
                0,
            )]))
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, snapshot(&[1]));
    }
}
