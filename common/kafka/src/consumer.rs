use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, Statistics, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::ConsumerError;

/// Properties recognized by the consumer wrapper (librdkafka itself rejects
/// unknown keys, so these never reach it). A host-aware assignor running in
/// the group leader uses them to co-locate partitions with the node that
/// hosts the matching local region.
pub const HOST_AWARENESS_HOST_PROPERTY: &str = "host.awareness.host";
pub const HOST_AWARENESS_PORT_PROPERTY: &str = "host.awareness.port";

#[derive(Clone)]
pub struct ConsumerSettings {
    pub group: String,
    pub topic: String,
    pub offset_reset: String,
    pub reuse_consumer_id: bool,
    pub properties: HashMap<String, String>,
}

impl ConsumerSettings {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            group: config.kafka_consumer_group.clone(),
            topic: config.kafka_consumer_topic.clone(),
            offset_reset: config.kafka_consumer_offset_reset.clone(),
            reuse_consumer_id: config.reuse_consumer_id,
            properties: HashMap::new(),
        }
    }

    /// Declare this consumer's advertised address for the assignor.
    pub fn with_host_awareness(mut self, host: &str, port: u16) -> Self {
        self.properties
            .insert(HOST_AWARENESS_HOST_PROPERTY.to_string(), host.to_string());
        self.properties
            .insert(HOST_AWARENESS_PORT_PROPERTY.to_string(), port.to_string());
        self
    }

    pub fn host_awareness(&self) -> Option<(String, u16)> {
        let host = self.properties.get(HOST_AWARENESS_HOST_PROPERTY)?;
        let port = self
            .properties
            .get(HOST_AWARENESS_PORT_PROPERTY)?
            .parse()
            .ok()?;
        Some((host.clone(), port))
    }
}

/// An offset that can be committed once the event it came with has been
/// fully processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittableOffset {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// One consumed event plus the offset to commit for it.
#[derive(Debug, Clone)]
pub struct EventPlusOffset {
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub offset: CommittableOffset,
}

/// Partition assignment changes observed by the consumer group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<(String, u32)>),
    Revoked(Vec<(String, u32)>),
}

/// The read half of the log: a committable stream of events.
#[async_trait]
pub trait CommittableSource: Send + Sync {
    async fn recv(&self) -> Result<EventPlusOffset, ConsumerError>;

    /// Commit processed offsets back to the group. Offsets passed here are
    /// record offsets; the implementation commits the next-to-read position.
    fn commit(&self, offsets: &[CommittableOffset]) -> Result<(), ConsumerError>;

    /// Live counters snapshot from the underlying client.
    fn metrics(&self) -> HashMap<String, f64>;

    /// Rewind every assigned partition to the start of the log.
    fn seek_to_beginning(&self) -> Result<(), ConsumerError>;
}

/// Creates sources; the stream supervisor needs a fresh one per (re)start.
pub trait SourceFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn CommittableSource>, ConsumerError>;
}

pub struct KafkaSourceFactory {
    pub config: KafkaConfig,
    pub settings: ConsumerSettings,
    pub rebalance_tx: Option<mpsc::UnboundedSender<RebalanceEvent>>,
    pub liveness: Option<HealthHandle>,
}

impl SourceFactory for KafkaSourceFactory {
    fn create(&self) -> Result<Arc<dyn CommittableSource>, ConsumerError> {
        Ok(Arc::new(KafkaCommittableSource::new(
            &self.config,
            &self.settings,
            self.rebalance_tx.clone(),
            self.liveness.clone(),
        )?))
    }
}

struct SourceContext {
    stats: Arc<RwLock<Option<Statistics>>>,
    rebalance_tx: Option<mpsc::UnboundedSender<RebalanceEvent>>,
    liveness: Option<HealthHandle>,
}

impl ClientContext for SourceContext {
    fn stats(&self, statistics: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
        if let Ok(mut slot) = self.stats.write() {
            *slot = Some(statistics);
        }
    }
}

fn tpl_pairs(tpl: &TopicPartitionList) -> Vec<(String, u32)> {
    tpl.elements()
        .iter()
        .map(|e| (e.topic().to_string(), e.partition() as u32))
        .collect()
}

impl ConsumerContext for SourceContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Some(tx) = &self.rebalance_tx else {
            return;
        };
        let event = match rebalance {
            Rebalance::Assign(tpl) => RebalanceEvent::Assigned(tpl_pairs(tpl)),
            Rebalance::Revoke(tpl) => RebalanceEvent::Revoked(tpl_pairs(tpl)),
            Rebalance::Error(e) => {
                warn!(error = %e, "consumer rebalance error");
                return;
            }
        };
        let _unused = tx.send(event);
    }
}

/// rdkafka-backed committable source.
pub struct KafkaCommittableSource {
    consumer: StreamConsumer<SourceContext>,
    stats: Arc<RwLock<Option<Statistics>>>,
    topic: String,
}

impl KafkaCommittableSource {
    /// `rebalance_tx`, when provided, receives this member's assignment
    /// changes; the partition tracker feeds the router from it. `liveness`
    /// gets pinged from the client's stats callback.
    pub fn new(
        config: &KafkaConfig,
        settings: &ConsumerSettings,
        rebalance_tx: Option<mpsc::UnboundedSender<RebalanceEvent>>,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &settings.group)
            .set("auto.offset.reset", &settings.offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        if let Some((host, port)) = settings.host_awareness() {
            // Surfaced through the client id so the group leader can map
            // members back to nodes
            client_config.set("client.id", format!("{host}:{port}"));
            if settings.reuse_consumer_id {
                client_config.set("group.instance.id", format!("{host}:{port}"));
            }
        } else if settings.reuse_consumer_id {
            client_config.set("group.instance.id", &settings.group);
        }

        let stats = Arc::new(RwLock::new(None));
        let context = SourceContext {
            stats: stats.clone(),
            rebalance_tx,
            liveness,
        };

        let consumer: StreamConsumer<SourceContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[settings.topic.as_str()])?;

        info!(
            topic = settings.topic,
            group = settings.group,
            "consumer subscribed"
        );

        Ok(Self {
            consumer,
            stats,
            topic: settings.topic.clone(),
        })
    }
}

#[async_trait]
impl CommittableSource for KafkaCommittableSource {
    async fn recv(&self) -> Result<EventPlusOffset, ConsumerError> {
        let message = self.consumer.recv().await?;
        Ok(EventPlusOffset {
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).to_string()),
            payload: message.payload().map(|p| p.to_vec()),
            offset: CommittableOffset {
                topic: message.topic().to_string(),
                partition: message.partition() as u32,
                offset: message.offset() as u64,
            },
        })
    }

    fn commit(&self, offsets: &[CommittableOffset]) -> Result<(), ConsumerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        // Collapse to the highest offset per partition; a batch may carry
        // several events from the same one
        let mut frontier: HashMap<(&str, u32), u64> = HashMap::new();
        for committable in offsets {
            frontier
                .entry((committable.topic.as_str(), committable.partition))
                .and_modify(|existing| *existing = (*existing).max(committable.offset))
                .or_insert(committable.offset);
        }
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in frontier {
            tpl.add_partition_offset(topic, partition as i32, Offset::Offset(offset as i64 + 1))?;
        }
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    fn metrics(&self) -> HashMap<String, f64> {
        let mut snapshot = HashMap::new();
        let Ok(guard) = self.stats.read() else {
            return snapshot;
        };
        let Some(stats) = guard.as_ref() else {
            return snapshot;
        };

        snapshot.insert("rxmsgs".to_string(), stats.rxmsgs as f64);
        snapshot.insert("txmsgs".to_string(), stats.txmsgs as f64);
        if let Some(topic) = stats.topics.get(&self.topic) {
            snapshot.insert(
                "assigned_partitions".to_string(),
                topic.partitions.len() as f64,
            );
            let lag: i64 = topic
                .partitions
                .values()
                .map(|p| p.consumer_lag.max(0))
                .sum();
            snapshot.insert("consumer_lag".to_string(), lag as f64);
        }
        snapshot
    }

    fn seek_to_beginning(&self) -> Result<(), ConsumerError> {
        let assignment = self.consumer.assignment()?;
        for element in assignment.elements() {
            self.consumer.seek(
                element.topic(),
                element.partition(),
                Offset::Beginning,
                Duration::from_secs(10),
            )?;
        }
        Ok(())
    }
}
