use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::assignments::HostPort;

/// A domain command addressed to one entity. The payload is opaque to the
/// routing layer; only the reply channel is ours. Never log the payload.
#[derive(Debug)]
pub struct Command {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Vec<u8>>,
}

/// What a region receives from the router.
#[derive(Debug)]
pub enum RegionMsg {
    Command(Command),
    /// The partition moved away; finish what's running and exit.
    Stop,
}

/// A region message tagged with the partition it was routed for.
#[derive(Debug)]
pub struct RegionEnvelope {
    pub partition: u32,
    pub msg: RegionMsg,
}

/// Logical address of a peer node's router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSelector {
    pub address: HostPort,
    pub path: String,
}

impl RemoteSelector {
    pub fn new(address: HostPort, partition: u32) -> Self {
        Self {
            address,
            path: format!("/regions/{partition}"),
        }
    }
}

/// Where commands for a partition go: a local mailbox, or a selector the
/// transport layer resolves to a peer. Constructing a remote handle makes no
/// network call.
#[derive(Debug, Clone)]
pub enum RegionHandle {
    Local(mpsc::Sender<RegionEnvelope>),
    Remote(RemoteSelector),
}

impl RegionHandle {
    pub fn is_local(&self) -> bool {
        matches!(self, RegionHandle::Local(_))
    }
}

/// Registry entry for one partition this router knows how to reach.
#[derive(Debug, Clone)]
pub struct PartitionRegion {
    pub partition: u32,
    pub handle: RegionHandle,
    pub assigned_since: Instant,
    pub is_local: bool,
}

impl PartitionRegion {
    pub fn local(partition: u32, sink: mpsc::Sender<RegionEnvelope>) -> Self {
        Self {
            partition,
            handle: RegionHandle::Local(sink),
            assigned_since: Instant::now(),
            is_local: true,
        }
    }

    pub fn remote(partition: u32, address: HostPort) -> Self {
        Self {
            partition,
            handle: RegionHandle::Remote(RemoteSelector::new(address, partition)),
            assigned_since: Instant::now(),
            is_local: false,
        }
    }

    /// A local region whose mailbox has closed has terminated; it no longer
    /// counts as reachable.
    pub fn is_reachable(&self) -> bool {
        match &self.handle {
            RegionHandle::Local(sink) => !sink.is_closed(),
            RegionHandle::Remote(_) => true,
        }
    }
}

/// Creates the local handler for a partition this node owns. Supplied by the
/// application layer; the router only holds the resulting mailbox.
pub trait RegionCreator: Send + Sync {
    fn create(&self, partition: u32) -> mpsc::Sender<RegionEnvelope>;
}

/// Delivers an envelope to a peer router. The routing layer serializes
/// nothing itself; implementations own the wire format.
pub trait RemoteTransport: Send + Sync {
    fn forward(&self, selector: &RemoteSelector, envelope: RegionEnvelope);
}

/// Serializable view of the region table, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegionInfo {
    pub partition: u32,
    pub is_local: bool,
    pub remote_address: Option<HostPort>,
    pub assigned_for_secs: u64,
}

impl From<&PartitionRegion> for RegionInfo {
    fn from(region: &PartitionRegion) -> Self {
        let remote_address = match &region.handle {
            RegionHandle::Local(_) => None,
            RegionHandle::Remote(selector) => Some(selector.address.clone()),
        };
        Self {
            partition: region.partition,
            is_local: region.is_local,
            remote_address,
            assigned_for_secs: region.assigned_since.elapsed().as_secs(),
        }
    }
}
