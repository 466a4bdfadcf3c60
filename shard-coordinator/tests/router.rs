mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{FixedPartitioner, MockRegionCreator, RegionEvent};
use health::HealthRegistry;
use shard_coordinator::assignments::{HostPort, PartitionAssignments, PartitionId};
use shard_coordinator::region::{RegionEnvelope, RegionHandle, RemoteSelector, RemoteTransport};
use shard_coordinator::router::{
    spawn_router, DeadLetter, DeadLetterReason, EntityIdExtractor, ExtractError, RouterHandle,
    RouterSettings,
};
use shard_coordinator::tracker::spawn_tracker;
use tokio::sync::mpsc;

const TOPIC: &str = "aggregate_events";

fn local() -> HostPort {
    HostPort::new("localhost", 3305)
}

fn peer() -> HostPort {
    HostPort::new("peer-node", 3305)
}

fn assignments(entries: &[(&HostPort, &[u32])]) -> PartitionAssignments {
    let mut by_host = BTreeMap::new();
    for (host, partitions) in entries {
        by_host.insert(
            (*host).clone(),
            partitions
                .iter()
                .map(|p| PartitionId::new(TOPIC, *p))
                .collect(),
        );
    }
    PartitionAssignments::new(by_host)
}

/// Commands are their own entity id; a leading '!' makes extraction fail.
fn extractor() -> EntityIdExtractor {
    Arc::new(|payload: &[u8]| {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ExtractError("not utf8".to_string()))?;
        if text.starts_with('!') {
            return Err(ExtractError("poisoned command".to_string()));
        }
        Ok(text.to_string())
    })
}

struct RecordingTransport {
    forwarded: mpsc::UnboundedSender<(RemoteSelector, u32)>,
}

impl RemoteTransport for RecordingTransport {
    fn forward(&self, selector: &RemoteSelector, envelope: RegionEnvelope) {
        let _unused = self.forwarded.send((selector.clone(), envelope.partition));
    }
}

struct TestRouter {
    handle: RouterHandle,
    creator: Arc<MockRegionCreator>,
    region_events: mpsc::UnboundedReceiver<RegionEvent>,
    dead_letters: mpsc::Receiver<DeadLetter>,
    forwarded: mpsc::UnboundedReceiver<(RemoteSelector, u32)>,
}

async fn spawn_test_router(dr_standby: bool, partitioner: Arc<FixedPartitioner>) -> TestRouter {
    let (creator, region_events) = MockRegionCreator::new();
    let (dl_tx, dead_letters) = mpsc::channel(64);
    let (fw_tx, forwarded) = mpsc::unbounded_channel();
    let tracker = spawn_tracker();
    let registry = HealthRegistry::new("test");
    let health = registry
        .register("router".to_string(), Duration::from_secs(30))
        .await;

    let handle = spawn_router(
        RouterSettings {
            self_address: local(),
            topic: TOPIC.to_string(),
            dr_standby,
            ask_timeout: Duration::from_secs(5),
        },
        partitioner,
        extractor(),
        creator.clone(),
        Arc::new(RecordingTransport { forwarded: fw_tx }),
        dl_tx,
        tracker,
        health,
    );

    TestRouter {
        handle,
        creator,
        region_events,
        dead_letters,
        forwarded,
    }
}

#[tokio::test]
async fn rebalance_moves_partition_and_routes_locally() {
    let partitioner = FixedPartitioner::new(&[("partition2", 2)], None);
    let mut t = spawn_test_router(false, partitioner).await;

    t.handle
        .update_assignments(assignments(&[(&local(), &[0, 1]), (&peer(), &[2])]))
        .await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0, 1, 2]), (&peer(), &[])]))
        .await;

    let reply = t
        .handle
        .ask(b"partition2".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, b"p2-ack");
    assert!(t.creator.created_partitions().contains(&2));

    let event = t.region_events.recv().await.unwrap();
    match event {
        RegionEvent::Command { partition, payload } => {
            assert_eq!(partition, 2);
            assert_eq!(payload, b"partition2");
        }
        other => panic!("expected a routed command, got {other:?}"),
    }
}

#[tokio::test]
async fn commands_stash_until_first_assignments() {
    let partitioner = FixedPartitioner::new(&[("partition0", 0)], None);
    let t = spawn_test_router(false, partitioner).await;

    let handle = t.handle.clone();
    let ask = tokio::spawn(async move {
        handle
            .ask(b"partition0".to_vec(), Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!ask.is_finished(), "command should wait for assignments");

    t.handle
        .update_assignments(assignments(&[(&local(), &[0, 1]), (&peer(), &[2])]))
        .await;
    let reply = ask.await.unwrap().unwrap();
    assert_eq!(reply, b"p0-ack");
}

#[tokio::test]
async fn extraction_failure_dead_letters_with_original_message() {
    let partitioner = FixedPartitioner::new(&[], Some(0));
    let mut t = spawn_test_router(false, partitioner).await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0])]))
        .await;

    let reply_rx = t.handle.route(b"!garbage".to_vec()).await.unwrap();

    let letter = t.dead_letters.recv().await.unwrap();
    assert_eq!(letter.sender, "shard-router");
    assert_eq!(letter.recipient, "dead-letters");
    assert!(matches!(
        letter.reason,
        DeadLetterReason::ExtractionFailed(_)
    ));
    assert_eq!(letter.command.payload, b"!garbage");

    // The caller gets no synthetic reply, just its own timeout
    let outcome = tokio::time::timeout(Duration::from_millis(200), reply_rx).await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn remote_partitions_forward_through_selector() {
    let partitioner = FixedPartitioner::new(&[("partition2", 2)], None);
    let mut t = spawn_test_router(false, partitioner).await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0]), (&peer(), &[2])]))
        .await;

    let _unused = t.handle.route(b"partition2".to_vec()).await.unwrap();

    let (selector, partition) = t.forwarded.recv().await.unwrap();
    assert_eq!(selector.address, peer());
    assert_eq!(partition, 2);
    assert!(
        !t.creator.created_partitions().contains(&2),
        "no local region for a peer's partition"
    );
}

#[tokio::test]
async fn revoked_partition_stops_its_local_region() {
    let partitioner = FixedPartitioner::new(&[("partition1", 1)], None);
    let mut t = spawn_test_router(false, partitioner).await;

    t.handle
        .update_assignments(assignments(&[(&local(), &[0, 1])]))
        .await;
    // The initial activation pass pre-warms both local regions
    common::eventually(|| t.creator.created_partitions().len() == 2).await;

    t.handle
        .update_assignments(assignments(&[(&local(), &[0]), (&peer(), &[1])]))
        .await;

    let event = t.region_events.recv().await.unwrap();
    match event {
        RegionEvent::Stopped { partition } => assert_eq!(partition, 1),
        other => panic!("expected region stop, got {other:?}"),
    }

    let map = t.handle.region_map().await;
    assert!(map.get(&1).is_none(), "revoked region must leave the map");
}

#[tokio::test]
async fn standby_defers_region_creation_until_first_command() {
    let partitioner = FixedPartitioner::new(&[("partition0", 0)], None);
    let t = spawn_test_router(true, partitioner).await;

    t.handle
        .update_assignments(assignments(&[(&local(), &[0, 1])]))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        t.creator.created_partitions().is_empty(),
        "standby must not pre-create regions"
    );

    let reply = t
        .handle
        .ask(b"partition0".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, b"p0-ack");

    // Activation pre-warms everything this node owns
    common::eventually(|| t.creator.created_partitions().len() == 2).await;
}

#[tokio::test]
async fn region_map_reports_local_and_remote_entries() {
    let partitioner = FixedPartitioner::new(&[("partition0", 0), ("partition1", 1)], None);
    let mut t = spawn_test_router(false, partitioner).await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0]), (&peer(), &[1])]))
        .await;

    let _unused = t.handle.route(b"partition1".to_vec()).await.unwrap();
    let _unused = t.forwarded.recv().await.unwrap();

    let map = t.handle.region_map().await;
    let local_info = map.get(&0).expect("pre-warmed local region");
    assert!(local_info.is_local);
    assert_eq!(local_info.remote_address, None);

    let remote_info = map.get(&1).expect("remote selector");
    assert!(!remote_info.is_local);
    assert_eq!(remote_info.remote_address, Some(peer()));
}

#[tokio::test]
async fn unmapped_entities_are_dropped_not_dead_lettered() {
    // Partitioner knows nothing and has no fallback
    let partitioner = FixedPartitioner::new(&[], None);
    let mut t = spawn_test_router(false, partitioner).await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0])]))
        .await;

    let reply_rx = t.handle.route(b"mystery".to_vec()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(200), reply_rx).await;
    assert!(outcome.is_err() || outcome.unwrap().is_err());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), t.dead_letters.recv())
            .await
            .is_err(),
        "partitioner misses drop with a warning, not a dead letter"
    );
}

#[tokio::test]
async fn unassigned_partition_dead_letters() {
    let partitioner = FixedPartitioner::new(&[("partition7", 7)], None);
    let mut t = spawn_test_router(false, partitioner).await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0])]))
        .await;

    let _unused = t.handle.route(b"partition7".to_vec()).await.unwrap();
    let letter = t.dead_letters.recv().await.unwrap();
    assert_eq!(letter.reason, DeadLetterReason::NoAssignment(7));
    assert_eq!(letter.command.payload, b"partition7");
}

#[tokio::test]
async fn terminated_region_is_recreated_on_next_command() {
    let partitioner = FixedPartitioner::new(&[("partition0", 0)], None);
    let mut t = spawn_test_router(false, partitioner).await;
    t.handle
        .update_assignments(assignments(&[(&local(), &[0])]))
        .await;

    let reply = t
        .handle
        .ask(b"partition0".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, b"p0-ack");
    let _unused = t.region_events.recv().await;

    // Kill the region by revoking and re-assigning, then route again: the
    // router must build a fresh region rather than reuse the dead mailbox
    t.handle
        .update_assignments(assignments(&[(&peer(), &[0])]))
        .await;
    let _unused = t.region_events.recv().await; // Stopped
    t.handle
        .update_assignments(assignments(&[(&local(), &[0])]))
        .await;

    let reply = t
        .handle
        .ask(b"partition0".to_vec(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, b"p0-ack");
    assert!(t.creator.created_partitions().len() >= 2);
}

// Keep RegionHandle in the public surface exercised from tests
#[tokio::test]
async fn local_handles_report_local() {
    let (tx, _rx) = mpsc::channel(1);
    assert!(RegionHandle::Local(tx).is_local());
}
