use std::sync::Arc;
use std::time::Duration;

use common_kafka::consumer::{ConsumerSettings, KafkaSourceFactory};
use common_kafka::partitioner::Murmur2Partitioner;
use common_kafka::producer::{
    fetch_partition_count, transactional_id, KafkaFlushRecordProducer, KafkaLogProducer,
};
use health::HealthRegistry;
use shard_coordinator::assignments::HostPort;
use shard_coordinator::config::Config;
use shard_coordinator::publisher::{spawn_publisher, PublishError, PublisherConfig};
use shard_coordinator::region::{
    Command, RegionCreator, RegionEnvelope, RegionMsg, RemoteSelector, RemoteTransport,
};
use shard_coordinator::router::{
    spawn_dead_letter_logger, spawn_router, EntityIdExtractor, ExtractError, RouterSettings,
};
use shard_coordinator::server::status_router;
use shard_coordinator::statestore::ProcessedOffsetIndex;
use shard_coordinator::stream::manager::spawn_stream_manager;
use shard_coordinator::stream::pipeline::{CommitterSettings, CursorFlow};
use shard_coordinator::stream::replay::{ReplayCoordinator, RewindToStartStrategy};
use shard_coordinator::tracker::{spawn_rebalance_feed, spawn_tracker};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

/// Commands are JSON objects carrying the aggregate identity under
/// `entity_id`. Anything else is unroutable.
fn entity_id_extractor() -> EntityIdExtractor {
    Arc::new(|payload| {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| ExtractError(e.to_string()))?;
        value
            .get("entity_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ExtractError("missing entity_id".to_string()))
    })
}

/// Peer forwarding needs a transport wired by the deployment; until one is,
/// cross-node commands are dropped loudly.
struct UnconfiguredTransport;

impl RemoteTransport for UnconfiguredTransport {
    fn forward(&self, selector: &RemoteSelector, _envelope: RegionEnvelope) {
        warn!(
            address = %selector.address,
            path = selector.path,
            "no remote transport configured, dropping forwarded command"
        );
    }
}

/// Region factory: each owned partition gets a task hosting its
/// transactional publisher. Commands append their payload as an event and
/// upsert the entity's state record.
struct PublisherRegionCreator {
    config: Config,
    state_index: Arc<ProcessedOffsetIndex>,
    liveness: HealthRegistry,
    extractor: EntityIdExtractor,
}

impl RegionCreator for PublisherRegionCreator {
    fn create(&self, partition: u32) -> mpsc::Sender<RegionEnvelope> {
        let (tx, rx) = mpsc::channel(256);
        let config = self.config.clone();
        let state_index = self.state_index.clone();
        let liveness = self.liveness.clone();
        let extractor = self.extractor.clone();
        tokio::spawn(run_region(
            partition,
            config,
            state_index,
            liveness,
            extractor,
            rx,
        ));
        tx
    }
}

async fn run_region(
    partition: u32,
    config: Config,
    state_index: Arc<ProcessedOffsetIndex>,
    liveness: HealthRegistry,
    extractor: EntityIdExtractor,
    mut rx: mpsc::Receiver<RegionEnvelope>,
) {
    let txid = transactional_id(
        &config.transactional_id_prefix,
        &config.state_topic,
        partition,
    );
    let producer = match KafkaLogProducer::new(&config.kafka, &txid, Duration::from_secs(30)) {
        Ok(producer) => Arc::new(producer),
        Err(e) => {
            error!(partition, error = %e, "failed to create transactional producer");
            return;
        }
    };
    let flush_producer = match KafkaFlushRecordProducer::new(&config.kafka) {
        Ok(producer) => Arc::new(producer),
        Err(e) => {
            error!(partition, error = %e, "failed to create flush record producer");
            return;
        }
    };

    let component = format!("publisher-{partition}");
    let health = liveness
        .register(component.clone(), Duration::from_secs(30))
        .await;
    let publisher = spawn_publisher(
        PublisherConfig {
            partition,
            events_topic: config.events_topic.clone(),
            state_topic: config.state_topic.clone(),
            flush_interval: Duration::from_millis(config.publisher_flush_interval_ms),
        },
        producer,
        flush_producer,
        state_index,
        health,
    );

    while let Some(envelope) = rx.recv().await {
        match envelope.msg {
            RegionMsg::Stop => break,
            RegionMsg::Command(Command { payload, reply }) => {
                let entity_id = match (extractor)(&payload) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(partition, error = %e, "command reached region without entity id");
                        continue;
                    }
                };
                let state = (entity_id.clone(), Some(payload.clone()));
                let events = vec![(entity_id.clone(), payload)];
                match publisher.submit(entity_id, state, events).await {
                    Ok(outcome_rx) => {
                        tokio::spawn(async move {
                            let outcome =
                                outcome_rx.await.unwrap_or(Err(PublishError::Terminated));
                            let body = match outcome {
                                Ok(()) => serde_json::json!({ "ok": true }),
                                Err(e) => {
                                    serde_json::json!({ "ok": false, "error": e.to_string() })
                                }
                            };
                            let _unused = reply.send(serde_json::to_vec(&body).unwrap_or_default());
                        });
                    }
                    Err(e) => {
                        warn!(partition, error = %e, "publisher rejected command");
                    }
                }
            }
        }
    }
    liveness.deregister(&component);
    info!(partition, "region stopped");
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults().unwrap();
    let liveness = HealthRegistry::new("liveness");
    let self_address = HostPort::new(config.advertised_host.clone(), config.advertised_port);

    let partition_count = fetch_partition_count(&config.kafka, &config.state_topic)
        .expect("failed to fetch partition count for the state topic");
    let partitioner = Arc::new(Murmur2Partitioner::new(partition_count));
    let state_index = Arc::new(ProcessedOffsetIndex::new());

    let tracker = spawn_tracker();
    let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
    spawn_rebalance_feed(
        rebalance_rx,
        tracker.clone(),
        self_address.clone(),
        config.consumer.kafka_consumer_topic.clone(),
    );

    // Consumed stream: fold the state topic into the cursor index
    let settings = ConsumerSettings::from_config(&config.consumer)
        .with_host_awareness(&config.advertised_host, config.advertised_port);
    let consumer_liveness = liveness
        .register("kafka-consumer".to_string(), Duration::from_secs(30))
        .await;
    let factory = Arc::new(KafkaSourceFactory {
        config: config.kafka.clone(),
        settings,
        rebalance_tx: Some(rebalance_tx),
        liveness: Some(consumer_liveness),
    });
    let flow = Arc::new(CursorFlow::new(state_index.clone()));
    let committer = CommitterSettings {
        max_batch: config.committer_max_batch,
        max_interval: Duration::from_millis(config.committer_max_interval_ms),
        parallelism: config.committer_parallelism,
    };
    let coordinator = ReplayCoordinator::new(
        Arc::new(RewindToStartStrategy::new(
            config.kafka.clone(),
            config.consumer.kafka_consumer_group.clone(),
            config.consumer.kafka_consumer_topic.clone(),
        )),
        Duration::from_millis(config.entire_replay_timeout_ms),
    );
    let stream_health = liveness
        .register("stream-manager".to_string(), Duration::from_secs(30))
        .await;
    let stream = spawn_stream_manager(factory, flow, committer, coordinator, stream_health);
    stream.start().await;

    let dead_letters = spawn_dead_letter_logger(256);
    let region_creator = Arc::new(PublisherRegionCreator {
        config: config.clone(),
        state_index,
        liveness: liveness.clone(),
        extractor: entity_id_extractor(),
    });
    let router_health = liveness
        .register("shard-router".to_string(), Duration::from_secs(30))
        .await;
    let router = spawn_router(
        RouterSettings {
            self_address,
            topic: config.consumer.kafka_consumer_topic.clone(),
            dr_standby: config.dr_standby_enabled,
            ask_timeout: Duration::from_millis(config.router_ask_timeout_ms),
        },
        partitioner,
        entity_id_extractor(),
        region_creator,
        Arc::new(UnconfiguredTransport),
        dead_letters,
        tracker,
        router_health,
    );

    let app = common_metrics::setup_metrics_routes(status_router(liveness, router));
    let bind = format!("{}:{}", config.host, config.port);
    info!("Status server listening on {}", bind);

    tokio::select! {
        served = common_metrics::serve(app, &bind) => {
            if let Err(e) = served {
                error!(error = %e, "status server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    stream.stop().await;
    info!("shutdown complete");
}
