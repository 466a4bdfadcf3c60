use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::{classify, ProducerError};
use crate::record::{LogRecord, RecordMetadata};

/// Transactional id for one partition's publisher.
///
/// The prefix is assumed unique per application cluster; the broker fences
/// any older producer holding the same id, which is exactly what we want for
/// two instances of the same cluster fighting over a partition — and exactly
/// what we do NOT want for two independent deployments sharing a prefix and
/// topic. Override the prefix when clusters share brokers.
pub fn transactional_id(prefix: &str, topic: &str, partition: u32) -> String {
    format!("{prefix}-{topic}-{partition}")
}

/// The write half of the log, as used by a partition publisher. One instance
/// per owned partition, never shared.
#[async_trait]
pub trait LogProducer: Send + Sync {
    fn transactional_id(&self) -> &str;

    /// Register the transactional id with the broker, fencing out any older
    /// instance. Blocks up to the configured timeout.
    fn init_transactions(&self) -> Result<(), ProducerError>;

    /// Tear down and recreate the underlying client. Required after
    /// authorization/version failures before another init attempt can work.
    fn rebuild(&self) -> Result<(), ProducerError>;

    fn begin_transaction(&self) -> Result<(), ProducerError>;

    /// Submit all records concurrently and await every ack. Acks come back
    /// in the same order as the input records.
    async fn send_records(&self, records: Vec<LogRecord>)
        -> Result<Vec<RecordMetadata>, ProducerError>;

    fn commit_transaction(&self) -> Result<(), ProducerError>;

    fn abort_transaction(&self) -> Result<(), ProducerError>;
}

/// Emits the recovery watermark: a single empty record pushed outside any
/// transaction, so its offset is visible even while the transactional
/// producer is still initializing.
#[async_trait]
pub trait FlushRecordProducer: Send + Sync {
    async fn send_flush_record(
        &self,
        topic: &str,
        partition: u32,
    ) -> Result<RecordMetadata, ProducerError>;
}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

fn create_and_ping(client_config: &ClientConfig) -> Result<FutureProducer, ProducerError> {
    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer = client_config.create().map_err(|e| classify(&e))?;

    // "Ping" the Kafka brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(classify(&error));
        }
    }

    Ok(producer)
}

/// Partition count of a topic, for sizing the routing partitioner. The
/// count must agree with what the write path sees or entity routing drifts.
pub fn fetch_partition_count(config: &KafkaConfig, topic: &str) -> Result<u32, ProducerError> {
    let client_config = base_client_config(config);
    let producer: FutureProducer = client_config.create().map_err(|e| classify(&e))?;
    let metadata = producer
        .client()
        .fetch_metadata(Some(topic), Duration::from_secs(10))
        .map_err(|e| classify(&e))?;
    let count = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .map(|t| t.partitions().len() as u32)
        .unwrap_or(0);
    Ok(count)
}

/// rdkafka-backed transactional producer. The inner client sits behind a
/// lock only so `rebuild` can swap it; there is exactly one caller.
pub struct KafkaLogProducer {
    client_config: ClientConfig,
    transactional_id: String,
    timeout: Duration,
    inner: RwLock<FutureProducer>,
}

impl KafkaLogProducer {
    pub fn new(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
    ) -> Result<Self, ProducerError> {
        let mut client_config = base_client_config(config);
        client_config
            .set("transactional.id", transactional_id)
            .set("enable.idempotence", "true")
            .set(
                "transaction.timeout.ms",
                config.kafka_transaction_timeout_ms.to_string(),
            );

        let inner = create_and_ping(&client_config)?;

        Ok(Self {
            client_config,
            transactional_id: transactional_id.to_string(),
            timeout,
            inner: RwLock::new(inner),
        })
    }
}

#[async_trait]
impl LogProducer for KafkaLogProducer {
    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    fn init_transactions(&self) -> Result<(), ProducerError> {
        let inner = self.inner.read().expect("poisoned producer lock");
        inner
            .init_transactions(self.timeout)
            .map_err(|e| classify(&e))
    }

    fn rebuild(&self) -> Result<(), ProducerError> {
        let replacement = create_and_ping(&self.client_config)?;
        let mut inner = self.inner.write().expect("poisoned producer lock");
        *inner = replacement;
        Ok(())
    }

    fn begin_transaction(&self) -> Result<(), ProducerError> {
        let inner = self.inner.read().expect("poisoned producer lock");
        inner.begin_transaction().map_err(|e| classify(&e))
    }

    async fn send_records(
        &self,
        records: Vec<LogRecord>,
    ) -> Result<Vec<RecordMetadata>, ProducerError> {
        let mut delivery_futures = Vec::with_capacity(records.len());
        {
            let inner = self.inner.read().expect("poisoned producer lock");
            for record in &records {
                let result = inner.send_result(FutureRecord {
                    topic: &record.topic,
                    partition: record.partition.map(|p| p as i32),
                    payload: record.payload.as_ref(),
                    key: record.key.as_ref(),
                    timestamp: None,
                    headers: None,
                });
                match result {
                    Ok(future) => delivery_futures.push(future),
                    Err((error, _)) => return Err(classify(&error)),
                }
            }
        }

        let mut acks = Vec::with_capacity(records.len());
        let mut first_error: Option<ProducerError> = None;
        for (record, result) in records.iter().zip(join_all(delivery_futures).await) {
            match result {
                Ok(Ok((partition, offset))) => acks.push(RecordMetadata {
                    key: record.key.clone(),
                    topic: record.topic.clone(),
                    partition: partition as u32,
                    offset: offset as u64,
                }),
                Ok(Err((error, _))) => {
                    let classified = classify(&error);
                    // A fenced signal buried in the batch must win over any
                    // earlier transient failure
                    if classified.is_fenced() || first_error.is_none() {
                        first_error = Some(classified);
                    }
                }
                Err(_) => {
                    // Cancelled due to timeout while retrying
                    if first_error.is_none() {
                        first_error = Some(ProducerError::Transient(
                            "delivery cancelled before ack".to_string(),
                        ));
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(acks),
        }
    }

    fn commit_transaction(&self) -> Result<(), ProducerError> {
        let inner = self.inner.read().expect("poisoned producer lock");
        inner
            .commit_transaction(self.timeout)
            .map_err(|e| classify(&e))
    }

    fn abort_transaction(&self) -> Result<(), ProducerError> {
        let inner = self.inner.read().expect("poisoned producer lock");
        inner
            .abort_transaction(self.timeout)
            .map_err(|e| classify(&e))
    }
}

/// Plain non-transactional producer for flush records.
pub struct KafkaFlushRecordProducer {
    inner: FutureProducer,
}

impl KafkaFlushRecordProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, ProducerError> {
        let client_config = base_client_config(config);
        let inner = create_and_ping(&client_config)?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl FlushRecordProducer for KafkaFlushRecordProducer {
    async fn send_flush_record(
        &self,
        topic: &str,
        partition: u32,
    ) -> Result<RecordMetadata, ProducerError> {
        let result = self.inner.send_result(FutureRecord::<Vec<u8>, Vec<u8>> {
            topic,
            partition: Some(partition as i32),
            payload: None,
            key: None,
            timestamp: None,
            headers: None,
        });

        let future = match result {
            Ok(future) => future,
            Err((error, _)) => return Err(classify(&error)),
        };

        match future.await {
            Ok(Ok((ack_partition, offset))) => Ok(RecordMetadata {
                key: None,
                topic: topic.to_string(),
                partition: ack_partition as u32,
                offset: offset as u64,
            }),
            Ok(Err((error, _))) => Err(classify(&error)),
            Err(_) => Err(ProducerError::Transient(
                "flush record delivery cancelled".to_string(),
            )),
        }
    }
}
