use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use common_kafka::partitioner::EntityPartitioner;
use health::HealthHandle;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::assignments::{HostPort, PartitionAssignments, PartitionId};
use crate::metric_consts::{
    ASK_TIMEOUTS, ASSIGNMENT_UPDATES, COMMANDS_ROUTED, COMMANDS_STASHED, DEAD_LETTERS,
    REGIONS_CREATED, REGIONS_DROPPED, STANDBY_ACTIVATIONS, UNROUTABLE_COMMANDS,
};
use crate::region::{
    Command, PartitionRegion, RegionCreator, RegionEnvelope, RegionHandle, RegionInfo, RegionMsg,
    RemoteSelector, RemoteTransport,
};
use crate::tracker::TrackerHandle;

pub const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub const ROUTER_SENDER: &str = "shard-router";
pub const DEAD_LETTER_RECIPIENT: &str = "dead-letters";

/// Pulls the entity id out of an opaque command payload. Failing means the
/// command cannot be routed at all.
pub type EntityIdExtractor = Arc<dyn Fn(&[u8]) -> Result<String, ExtractError> + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("entity id extraction failed: {0}")]
pub struct ExtractError(pub String);

/// An unroutable command, with the original message preserved for
/// inspection.
#[derive(Debug)]
pub struct DeadLetter {
    pub sender: &'static str,
    pub recipient: &'static str,
    pub reason: DeadLetterReason,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    ExtractionFailed(String),
    NoAssignment(u32),
}

/// Default dead-letter sink: log the class of failure and move on. The
/// payload is deliberately absent from the log line.
pub fn spawn_dead_letter_logger(capacity: usize) -> mpsc::Sender<DeadLetter> {
    let (tx, mut rx) = mpsc::channel::<DeadLetter>(capacity);
    tokio::spawn(async move {
        while let Some(letter) = rx.recv().await {
            warn!(
                sender = letter.sender,
                reason = ?letter.reason,
                "command dead-lettered"
            );
        }
    });
    tx
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("router terminated")]
    Terminated,
    #[error("no reply before deadline")]
    AskTimeout,
}

pub enum RouterMsg {
    Route(Command),
    UpdateAssignments(PartitionAssignments),
    GetRegionMap(oneshot::Sender<HashMap<u32, RegionInfo>>),
}

#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterMsg>,
}

impl RouterHandle {
    /// Hand a command to the router. The returned channel resolves with the
    /// region's reply; if the command dead-letters, the channel just closes
    /// and the caller's own deadline decides when to give up.
    pub async fn route(&self, payload: Vec<u8>) -> Result<oneshot::Receiver<Vec<u8>>, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterMsg::Route(Command { payload, reply }))
            .await
            .map_err(|_| RouterError::Terminated)?;
        Ok(rx)
    }

    /// Route and wait for the reply, up to `timeout`.
    pub async fn ask(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, RouterError> {
        let rx = self.route(payload).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => Err(RouterError::AskTimeout),
        }
    }

    pub async fn update_assignments(&self, assignments: PartitionAssignments) {
        let _unused = self
            .tx
            .send(RouterMsg::UpdateAssignments(assignments))
            .await;
    }

    pub async fn region_map(&self) -> HashMap<u32, RegionInfo> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(RouterMsg::GetRegionMap(tx)).await.is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouterPhase {
    /// No assignments seen yet; everything is stashed.
    Uninitialized,
    /// Assignments tracked, no local regions until a command has to route.
    Standby,
    Active,
}

pub struct RouterSettings {
    pub self_address: HostPort,
    pub topic: String,
    pub dr_standby: bool,
    pub ask_timeout: Duration,
}

struct ShardRouter {
    settings: RouterSettings,
    partitioner: Arc<dyn EntityPartitioner>,
    extractor: EntityIdExtractor,
    region_creator: Arc<dyn RegionCreator>,
    transport: Arc<dyn RemoteTransport>,
    dead_letters: mpsc::Sender<DeadLetter>,
    tracker: TrackerHandle,
    health: HealthHandle,
    phase: RouterPhase,
    assignments: PartitionAssignments,
    regions: HashMap<u32, PartitionRegion>,
    stash: VecDeque<Command>,
    warned_unassigned: HashSet<u32>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_router(
    settings: RouterSettings,
    partitioner: Arc<dyn EntityPartitioner>,
    extractor: EntityIdExtractor,
    region_creator: Arc<dyn RegionCreator>,
    transport: Arc<dyn RemoteTransport>,
    dead_letters: mpsc::Sender<DeadLetter>,
    tracker: TrackerHandle,
    health: HealthHandle,
) -> RouterHandle {
    let (tx, rx) = mpsc::channel(1024);
    let router = ShardRouter {
        settings,
        partitioner,
        extractor,
        region_creator,
        transport,
        dead_letters,
        tracker,
        health,
        phase: RouterPhase::Uninitialized,
        assignments: PartitionAssignments::default(),
        regions: HashMap::new(),
        stash: VecDeque::new(),
        warned_unassigned: HashSet::new(),
    };
    tokio::spawn(router.run(rx));
    RouterHandle { tx }
}

impl ShardRouter {
    async fn run(mut self, mut rx: mpsc::Receiver<RouterMsg>) {
        info!(
            address = %self.settings.self_address,
            topic = self.settings.topic,
            dr_standby = self.settings.dr_standby,
            "starting shard router"
        );

        // The subscription is re-sent until the first snapshot lands, to
        // survive tracker restarts
        let (assignments_tx, mut assignments_rx) = mpsc::channel(16);
        let mut register_tick = tokio::time::interval(REGISTER_RETRY_INTERVAL);
        let mut health_tick = tokio::time::interval(HEALTH_REPORT_INTERVAL);

        loop {
            tokio::select! {
                _ = register_tick.tick(), if self.phase == RouterPhase::Uninitialized => {
                    self.tracker.register(assignments_tx.clone()).await;
                }
                Some(assignments) = assignments_rx.recv() => {
                    self.on_assignments(assignments).await;
                }
                _ = health_tick.tick() => {
                    self.report_health().await;
                }
                maybe_msg = rx.recv() => match maybe_msg {
                    Some(RouterMsg::Route(command)) => self.route(command).await,
                    Some(RouterMsg::UpdateAssignments(assignments)) => {
                        self.on_assignments(assignments).await;
                    }
                    Some(RouterMsg::GetRegionMap(reply)) => {
                        let map = self
                            .regions
                            .iter()
                            .map(|(partition, region)| (*partition, RegionInfo::from(region)))
                            .collect();
                        let _unused = reply.send(map);
                    }
                    None => {
                        self.shutdown();
                        return;
                    }
                }
            }
        }
    }

    async fn on_assignments(&mut self, new: PartitionAssignments) {
        counter!(ASSIGNMENT_UPDATES).increment(1);
        let first = self.phase == RouterPhase::Uninitialized;
        let diff = new.diff(&self.assignments);

        for (host, partitions) in &diff.revoked {
            for pid in partitions {
                self.drop_region(pid.partition, host);
            }
        }

        self.assignments = new;

        // Regions must be a subset of the assignments, whatever the feed did
        let assigned: HashSet<u32> = self
            .assignments
            .all_partitions()
            .into_iter()
            .filter(|pid| pid.topic == self.settings.topic)
            .map(|pid| pid.partition)
            .collect();
        let stale: Vec<u32> = self
            .regions
            .keys()
            .filter(|partition| !assigned.contains(partition))
            .copied()
            .collect();
        for partition in stale {
            let host = self.settings.self_address.clone();
            self.drop_region(partition, &host);
        }

        if first {
            self.phase = if self.settings.dr_standby {
                RouterPhase::Standby
            } else {
                RouterPhase::Active
            };
            info!(
                phase = ?self.phase,
                partitions = assigned.len(),
                "first assignments received"
            );
            if self.phase == RouterPhase::Active {
                self.prewarm_local_regions();
            }
            let stashed: Vec<Command> = self.stash.drain(..).collect();
            for command in stashed {
                self.route(command).await;
            }
        }
    }

    fn drop_region(&mut self, partition: u32, host: &HostPort) {
        let Some(region) = self.regions.remove(&partition) else {
            return;
        };
        counter!(REGIONS_DROPPED).increment(1);
        match &region.handle {
            RegionHandle::Local(sink) => {
                let _unused = sink.try_send(RegionEnvelope {
                    partition,
                    msg: RegionMsg::Stop,
                });
                info!(partition, "local region stopped after revocation");
            }
            RegionHandle::Remote(_) => {
                debug!(partition, host = %host, "remote selector dropped");
            }
        }
    }

    /// Create every local region for the current assignments up front. Used
    /// on the initial activation pass to amortize first-command latency;
    /// rebalance additions stay lazy.
    fn prewarm_local_regions(&mut self) {
        let partitions: Vec<u32> = self
            .assignments
            .partitions_for(&self.settings.self_address)
            .into_iter()
            .filter(|pid| pid.topic == self.settings.topic)
            .map(|pid| pid.partition)
            .collect();
        for partition in partitions {
            self.ensure_local_region(partition);
        }
    }

    async fn route(&mut self, command: Command) {
        if self.phase == RouterPhase::Uninitialized {
            counter!(COMMANDS_STASHED).increment(1);
            self.stash.push_back(command);
            return;
        }

        let entity_id = match (self.extractor)(&command.payload) {
            Ok(id) => id,
            Err(e) => {
                counter!(UNROUTABLE_COMMANDS).increment(1);
                counter!(DEAD_LETTERS).increment(1);
                warn!(error = %e, "dead-lettering command with no extractable entity id");
                let _unused = self
                    .dead_letters
                    .send(DeadLetter {
                        sender: ROUTER_SENDER,
                        recipient: DEAD_LETTER_RECIPIENT,
                        reason: DeadLetterReason::ExtractionFailed(e.0),
                        command,
                    })
                    .await;
                return;
            }
        };

        let Some(partition) = self.partitioner.partition_for(&entity_id) else {
            counter!(UNROUTABLE_COMMANDS).increment(1);
            warn!(
                message_class = "Command",
                "dropping command, partitioner returned no partition"
            );
            return;
        };

        if self.phase == RouterPhase::Standby {
            counter!(STANDBY_ACTIVATIONS).increment(1);
            info!("first routable command while in standby, activating");
            self.phase = RouterPhase::Active;
            self.prewarm_local_regions();
        }

        self.deliver(partition, entity_id, command).await;
    }

    async fn deliver(&mut self, partition: u32, entity_id: String, command: Command) {
        let pid = PartitionId::new(self.settings.topic.clone(), partition);
        let owner = self.assignments.owner_of(&pid).cloned();

        match owner {
            None => {
                if self.warned_unassigned.insert(partition) {
                    warn!(partition, "partition has no assignment, dead-lettering");
                }
                counter!(DEAD_LETTERS).increment(1);
                let _unused = self
                    .dead_letters
                    .send(DeadLetter {
                        sender: ROUTER_SENDER,
                        recipient: DEAD_LETTER_RECIPIENT,
                        reason: DeadLetterReason::NoAssignment(partition),
                        command,
                    })
                    .await;
            }
            Some(host) if host == self.settings.self_address => {
                self.warned_unassigned.remove(&partition);
                let sink = self.ensure_local_region(partition);
                let command = self.watch_ask(partition, entity_id, command);
                if let Err(failed) = sink
                    .send(RegionEnvelope {
                        partition,
                        msg: RegionMsg::Command(command),
                    })
                    .await
                {
                    // The region died since we last looked; recreate once
                    warn!(partition, "local region terminated, recreating");
                    self.regions.remove(&partition);
                    counter!(REGIONS_DROPPED).increment(1);
                    let sink = self.ensure_local_region(partition);
                    if sink.send(failed.0).await.is_err() {
                        error!(partition, "redelivery to recreated region failed");
                    }
                }
                counter!(COMMANDS_ROUTED, "target" => "local").increment(1);
            }
            Some(host) => {
                self.warned_unassigned.remove(&partition);
                let selector = self.ensure_remote_selector(partition, host);
                self.transport.forward(
                    &selector,
                    RegionEnvelope {
                        partition,
                        msg: RegionMsg::Command(command),
                    },
                );
                counter!(COMMANDS_ROUTED, "target" => "remote").increment(1);
            }
        }
    }

    fn ensure_local_region(&mut self, partition: u32) -> mpsc::Sender<RegionEnvelope> {
        if let Some(region) = self.regions.get(&partition) {
            if let RegionHandle::Local(sink) = &region.handle {
                if !sink.is_closed() {
                    return sink.clone();
                }
            }
        }
        let sink = self.region_creator.create(partition);
        info!(partition, "local region created");
        counter!(REGIONS_CREATED, "kind" => "local").increment(1);
        self.regions
            .insert(partition, PartitionRegion::local(partition, sink.clone()));
        sink
    }

    fn ensure_remote_selector(&mut self, partition: u32, host: HostPort) -> RemoteSelector {
        if let Some(region) = self.regions.get(&partition) {
            if let RegionHandle::Remote(selector) = &region.handle {
                if selector.address == host {
                    return selector.clone();
                }
            }
        }
        counter!(REGIONS_CREATED, "kind" => "remote").increment(1);
        let region = PartitionRegion::remote(partition, host);
        let RegionHandle::Remote(selector) = region.handle.clone() else {
            unreachable!("remote constructor always yields a remote handle");
        };
        self.regions.insert(partition, region);
        selector
    }

    /// Interpose on the reply channel so a slow region gets logged. No
    /// synthetic reply is manufactured: the caller's channel resolves when
    /// (and only when) the region answers, or closes when it never does.
    fn watch_ask(&self, partition: u32, entity_id: String, command: Command) -> Command {
        let Command { payload, reply } = command;
        let (tx, mut rx) = oneshot::channel();
        let ask_timeout = self.settings.ask_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(ask_timeout, &mut rx).await {
                Ok(Ok(response)) => {
                    let _unused = reply.send(response);
                }
                Ok(Err(_)) => {
                    // Region dropped the reply; the caller's channel closes
                    // with `reply` here
                }
                Err(_) => {
                    counter!(ASK_TIMEOUTS).increment(1);
                    error!(partition, entity_id, "no reply from region within ask timeout");
                    // Keep relaying; a late reply is still a reply
                    if let Ok(response) = rx.await {
                        let _unused = reply.send(response);
                    }
                }
            }
        });
        Command { payload, reply: tx }
    }

    async fn report_health(&mut self) {
        let local_total = self.regions.values().filter(|r| r.is_local).count();
        let dead: Vec<u32> = self
            .regions
            .values()
            .filter(|r| r.is_local && !r.is_reachable())
            .map(|r| r.partition)
            .collect();
        let counters = vec![
            ("regions", self.regions.len() as u64),
            ("local_regions", local_total as u64),
        ];

        if !self.tracker.is_up() {
            self.health
                .report_unhealthy("partition tracker down", counters)
                .await;
        } else if !dead.is_empty() {
            self.health
                .report_unhealthy("local region terminated", counters)
                .await;
        } else {
            self.health.report_healthy_with(counters).await;
        }

        // Terminated regions leave the registry; the next command recreates
        // them
        for partition in dead {
            self.regions.remove(&partition);
            counter!(REGIONS_DROPPED).increment(1);
        }
    }

    fn shutdown(&mut self) {
        for (partition, region) in self.regions.drain() {
            if let RegionHandle::Local(sink) = region.handle {
                let _unused = sink.try_send(RegionEnvelope {
                    partition,
                    msg: RegionMsg::Stop,
                });
            }
        }
        info!("shard router stopped");
    }
}
