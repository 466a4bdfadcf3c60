use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::KafkaConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
    ReplaySuccessfullyStarted,
    ReplayFailed(String),
}

/// What actually rewinds the group. Typically resets committed offsets; runs
/// only while every consumer in the group is stopped.
#[async_trait]
pub trait ReplayStrategy: Send + Sync {
    async fn execute(&self) -> anyhow::Result<()>;
}

/// Runs the replay strategy under the overall replay deadline. The
/// stop-consumers / restart-consumers choreography around it belongs to the
/// stream manager; this only owns the strategy invocation.
pub struct ReplayCoordinator {
    strategy: Arc<dyn ReplayStrategy>,
    timeout: Duration,
}

impl ReplayCoordinator {
    pub fn new(strategy: Arc<dyn ReplayStrategy>, timeout: Duration) -> Self {
        Self { strategy, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self) -> ReplayResult {
        info!("running replay strategy");
        match tokio::time::timeout(self.timeout, self.strategy.execute()).await {
            Ok(Ok(())) => ReplayResult::ReplaySuccessfullyStarted,
            Ok(Err(e)) => {
                error!(error = %e, "replay strategy failed");
                ReplayResult::ReplayFailed(e.to_string())
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "replay timed out");
                ReplayResult::ReplayFailed(format!("replay timed out after {:?}", self.timeout))
            }
        }
    }
}

/// Rewind the consumer group to the start of the log by committing offset 0
/// for every partition of the topic. Valid only while the group has no
/// active members, which is exactly the window the stream manager provides.
pub struct RewindToStartStrategy {
    kafka: KafkaConfig,
    group: String,
    topic: String,
}

impl RewindToStartStrategy {
    pub fn new(kafka: KafkaConfig, group: String, topic: String) -> Self {
        Self {
            kafka,
            group,
            topic,
        }
    }
}

#[async_trait]
impl ReplayStrategy for RewindToStartStrategy {
    async fn execute(&self) -> anyhow::Result<()> {
        let kafka = self.kafka.clone();
        let group = self.group.clone();
        let topic = self.topic.clone();

        tokio::task::spawn_blocking(move || {
            let mut client_config = ClientConfig::new();
            client_config
                .set("bootstrap.servers", &kafka.kafka_hosts)
                .set("group.id", &group);
            if kafka.kafka_tls {
                client_config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
            let consumer: BaseConsumer = client_config.create()?;

            let metadata = consumer.fetch_metadata(Some(&topic), Duration::from_secs(10))?;
            let topic_meta = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| anyhow::anyhow!("topic {topic} not found"))?;

            let mut tpl = TopicPartitionList::new();
            for partition in topic_meta.partitions() {
                tpl.add_partition_offset(&topic, partition.id(), Offset::Offset(0))?;
            }
            consumer.commit(&tpl, CommitMode::Sync)?;
            info!(
                topic,
                partitions = topic_meta.partitions().len(),
                "consumer group rewound to start"
            );
            Ok(())
        })
        .await?
    }
}
