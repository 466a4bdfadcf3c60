use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common_kafka::error::ProducerError;
use common_kafka::producer::{FlushRecordProducer, LogProducer};
use common_kafka::record::LogRecord;
use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::metric_consts::{
    BATCHES_PUBLISHED, EVENTS_FAILED_TO_PUBLISH, EVENTS_PUBLISHED, FLUSH_BATCH_SIZE, FLUSH_TIME,
    IN_FLIGHT_RECORDS, PENDING_INITS, PENDING_WRITES, PUBLISHER_FENCED, RECORDS_RETIRED,
    STATE_CURRENT, STATE_NOT_CURRENT,
};
use crate::statestore::StateStoreMeta;

pub mod state;

use self::state::{PendingInit, PendingWrite, PublisherState};

pub const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const META_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// A transaction open longer than this marks the publisher unhealthy.
pub const TXN_STUCK_THRESHOLD: Duration = Duration::from_secs(120);
const TXN_WARN_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The batch containing this write was aborted. Nothing from it reached
    /// the log; retry with fresh state.
    #[error("publish failed, batch aborted")]
    FlushFailed,
    /// The publisher is gone (fenced or shut down); a replacement instance
    /// has to pick the partition up.
    #[error("publisher terminated")]
    Terminated,
}

#[derive(Clone)]
pub struct PublisherConfig {
    pub partition: u32,
    pub events_topic: String,
    pub state_topic: String,
    pub flush_interval: Duration,
}

pub enum PublisherMsg {
    Publish {
        entity_id: String,
        state: (String, Option<Vec<u8>>),
        events: Vec<(String, Vec<u8>)>,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
    IsStateCurrent {
        entity_id: String,
        deadline: Instant,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublisherMsg>,
}

impl PublisherHandle {
    /// Queue a state + events write. Resolves once the transaction holding
    /// the records commits; an aborted batch resolves with `FlushFailed`.
    pub async fn publish(
        &self,
        entity_id: String,
        state: (String, Option<Vec<u8>>),
        events: Vec<(String, Vec<u8>)>,
    ) -> Result<(), PublishError> {
        let rx = self.submit(entity_id, state, events).await?;
        rx.await.unwrap_or(Err(PublishError::Terminated))
    }

    /// Queue a write and hand back the completion channel instead of
    /// awaiting it, so a caller can keep enqueue order while collecting
    /// results concurrently.
    pub async fn submit(
        &self,
        entity_id: String,
        state: (String, Option<Vec<u8>>),
        events: Vec<(String, Vec<u8>)>,
    ) -> Result<oneshot::Receiver<Result<(), PublishError>>, PublishError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PublisherMsg::Publish {
                entity_id,
                state,
                events,
                reply,
            })
            .await
            .map_err(|_| PublishError::Terminated)?;
        Ok(rx)
    }

    /// True as soon as no write for this entity is waiting on the
    /// projection; false once the deadline passes. Never blocks the agent.
    pub async fn is_state_current(&self, entity_id: String, deadline: Instant) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PublisherMsg::IsStateCurrent {
                entity_id,
                deadline,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn is_up(&self) -> bool {
        !self.tx.is_closed()
    }
}

enum Phase {
    /// Producer not usable yet; `init_transactions` is being retried.
    InitializingTx { txn_ready: bool },
    /// Waiting for the projection to pass the recovery watermark, so any
    /// state written by a predecessor instance is known to be visible.
    RecoveringBacklog { end_offset: u64 },
    Processing,
}

struct TransactionalPublisher {
    config: PublisherConfig,
    producer: Arc<dyn LogProducer>,
    flush_producer: Arc<dyn FlushRecordProducer>,
    state_store: Arc<dyn StateStoreMeta>,
    health: HealthHandle,
    phase: Phase,
    state: PublisherState,
    stash: VecDeque<PublisherMsg>,
    last_txn_warn: Option<Instant>,
}

/// Start the publisher for one owned partition. The producers are owned
/// exclusively by this agent; nothing else may touch them.
pub fn spawn_publisher(
    config: PublisherConfig,
    producer: Arc<dyn LogProducer>,
    flush_producer: Arc<dyn FlushRecordProducer>,
    state_store: Arc<dyn StateStoreMeta>,
    health: HealthHandle,
) -> PublisherHandle {
    let (tx, rx) = mpsc::channel(1024);
    let agent = TransactionalPublisher {
        config,
        producer,
        flush_producer,
        state_store,
        health,
        phase: Phase::InitializingTx { txn_ready: false },
        state: PublisherState::new(),
        stash: VecDeque::new(),
        last_txn_warn: None,
    };
    tokio::spawn(agent.run(rx));
    PublisherHandle { tx }
}

impl TransactionalPublisher {
    async fn run(mut self, mut rx: mpsc::Receiver<PublisherMsg>) {
        info!(
            partition = self.config.partition,
            transactional_id = self.producer.transactional_id(),
            "starting partition publisher"
        );

        let mut init_tick = tokio::time::interval(INIT_RETRY_INTERVAL);
        let mut meta_tick = tokio::time::interval(META_POLL_INTERVAL);
        let mut flush_tick = tokio::time::interval(self.config.flush_interval);
        let mut health_tick = tokio::time::interval(HEALTH_REPORT_INTERVAL);
        meta_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = init_tick.tick(), if matches!(self.phase, Phase::InitializingTx { .. }) => {
                    if let Err(error) = self.try_init().await {
                        self.shutdown_fenced(&error).await;
                        return;
                    }
                }
                _ = meta_tick.tick(), if !matches!(self.phase, Phase::InitializingTx { .. }) => {
                    self.on_metadata_poll().await;
                }
                _ = flush_tick.tick(), if matches!(self.phase, Phase::Processing) => {
                    if let Err(error) = self.flush().await {
                        self.shutdown_fenced(&error).await;
                        return;
                    }
                }
                _ = health_tick.tick() => {
                    self.report_health().await;
                }
                maybe_msg = rx.recv() => match maybe_msg {
                    Some(msg) => self.handle_msg(msg),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    /// One initialization attempt: register the transactional id, then write
    /// the recovery watermark. Either step failing transiently just means we
    /// go around again on the next tick. Only fencing escapes.
    async fn try_init(&mut self) -> Result<(), ProducerError> {
        let Phase::InitializingTx { txn_ready } = &mut self.phase else {
            return Ok(());
        };

        if !*txn_ready {
            match self.producer.init_transactions() {
                Ok(()) => *txn_ready = true,
                Err(error) if error.is_fenced() => return Err(error),
                Err(error) => {
                    warn!(
                        partition = self.config.partition,
                        error = %error,
                        "transaction init failed, retrying"
                    );
                    if error.requires_rebuild() {
                        if let Err(rebuild_error) = self.producer.rebuild() {
                            error!(
                                partition = self.config.partition,
                                error = %rebuild_error,
                                "producer rebuild failed"
                            );
                        }
                    }
                    return Ok(());
                }
            }
        }

        match self
            .flush_producer
            .send_flush_record(&self.config.state_topic, self.config.partition)
            .await
        {
            Ok(ack) => {
                info!(
                    partition = self.config.partition,
                    end_offset = ack.offset,
                    "recovery watermark written"
                );
                self.phase = Phase::RecoveringBacklog {
                    end_offset: ack.offset,
                };
            }
            Err(error) => {
                warn!(
                    partition = self.config.partition,
                    error = %error,
                    "flush record write failed, retrying"
                );
            }
        }
        Ok(())
    }

    async fn on_metadata_poll(&mut self) {
        let meta = if self.state_store.is_open() {
            self.state_store
                .get_meta(&self.config.state_topic, self.config.partition)
                .await
        } else {
            None
        };

        match self.phase {
            Phase::RecoveringBacklog { end_offset } => {
                if let Some(meta) = meta {
                    if meta.offset >= end_offset {
                        info!(
                            partition = self.config.partition,
                            processed_offset = meta.offset,
                            "projection caught up, accepting commands"
                        );
                        self.phase = Phase::Processing;
                        let stashed: Vec<_> = self.stash.drain(..).collect();
                        for msg in stashed {
                            self.handle_msg(msg);
                        }
                    }
                }
            }
            Phase::Processing => {
                if let Some(meta) = meta {
                    let retired = self.state.retire(meta.offset);
                    if retired > 0 {
                        counter!(RECORDS_RETIRED).increment(retired as u64);
                    }
                }
                self.resolve_pending_inits();
            }
            Phase::InitializingTx { .. } => {}
        }
    }

    fn handle_msg(&mut self, msg: PublisherMsg) {
        if !matches!(self.phase, Phase::Processing) {
            self.stash.push_back(msg);
            return;
        }
        match msg {
            PublisherMsg::Publish {
                entity_id,
                state,
                events,
                reply,
            } => {
                self.state.enqueue_write(PendingWrite {
                    entity_id,
                    state,
                    events,
                    reply,
                });
            }
            PublisherMsg::IsStateCurrent {
                entity_id,
                deadline,
                reply,
            } => {
                if !self.state.is_in_flight(&entity_id) {
                    counter!(STATE_CURRENT).increment(1);
                    let _unused = reply.send(true);
                } else {
                    self.state.enqueue_init(PendingInit {
                        entity_id,
                        expires_at: deadline,
                        reply,
                    });
                }
            }
        }
    }

    /// One flush cycle: drain the queue, publish events + state in a single
    /// transaction, track the state acks as in-flight. Returns `Err` only
    /// when fenced; every other failure is absorbed here.
    async fn flush(&mut self) -> Result<(), ProducerError> {
        if self.state.transaction_in_progress() {
            let now = Instant::now();
            if self
                .last_txn_warn
                .map_or(true, |at| now.duration_since(at) >= TXN_WARN_INTERVAL)
            {
                self.last_txn_warn = Some(now);
                warn!(
                    partition = self.config.partition,
                    current_txn_ms = self.state.current_txn_ms(now).unwrap_or(0),
                    "flush skipped, transaction still in progress"
                );
            }
            return Ok(());
        }
        if !self.state.has_pending_writes() {
            return Ok(());
        }

        let writes = self.state.drain_writes();
        let timer = common_metrics::timing_guard(FLUSH_TIME);

        let mut records = Vec::new();
        for write in &writes {
            for (key, payload) in &write.events {
                records.push(LogRecord {
                    topic: self.config.events_topic.clone(),
                    partition: None,
                    key: Some(key.clone()),
                    payload: Some(payload.clone()),
                });
            }
            let (state_key, state_payload) = &write.state;
            records.push(LogRecord {
                topic: self.config.state_topic.clone(),
                partition: Some(self.config.partition),
                key: Some(state_key.clone()),
                payload: state_payload.clone(),
            });
        }
        let record_count = records.len() as u64;

        self.state.begin_transaction(Instant::now());
        if let Err(error) = self.producer.begin_transaction() {
            self.state.end_transaction();
            if error.is_fenced() {
                // Callers' reply channels drop with `writes`
                timer.label("outcome", "fenced").fin();
                return Err(error);
            }
            error!(
                partition = self.config.partition,
                error = %error,
                "failed to begin transaction"
            );
            counter!(EVENTS_FAILED_TO_PUBLISH).increment(record_count);
            self.fail_writes(writes);
            timer.label("outcome", "begin_failed").fin();
            return Ok(());
        }

        let outcome = match self.producer.send_records(records).await {
            Ok(acks) => self.producer.commit_transaction().map(|()| acks),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(acks) => {
                self.state.end_transaction();
                let events_published = acks
                    .iter()
                    .filter(|ack| ack.topic == self.config.events_topic)
                    .count() as u64;
                self.state.record_acks(acks.iter(), &self.config.state_topic);

                counter!(BATCHES_PUBLISHED).increment(1);
                counter!(EVENTS_PUBLISHED).increment(events_published);
                histogram!(FLUSH_BATCH_SIZE).record(writes.len() as f64);
                for write in writes {
                    let _unused = write.reply.send(Ok(()));
                }
                timer.label("outcome", "committed").fin();
                Ok(())
            }
            Err(error) if error.is_fenced() => {
                timer.label("outcome", "fenced").fin();
                Err(error)
            }
            Err(error) => {
                error!(
                    partition = self.config.partition,
                    error = %error,
                    "flush failed, aborting transaction"
                );
                counter!(EVENTS_FAILED_TO_PUBLISH).increment(record_count);
                match self.producer.abort_transaction() {
                    Ok(()) => {}
                    Err(abort_error) if abort_error.is_fenced() => {
                        self.state.end_transaction();
                        timer.label("outcome", "fenced").fin();
                        return Err(abort_error);
                    }
                    Err(abort_error) => {
                        error!(
                            partition = self.config.partition,
                            error = %abort_error,
                            "abort failed after flush failure"
                        );
                    }
                }
                self.state.end_transaction();
                self.fail_writes(writes);
                timer.label("outcome", "aborted").fin();
                Ok(())
            }
        }
    }

    fn fail_writes(&self, writes: Vec<PendingWrite>) {
        for write in writes {
            let _unused = write.reply.send(Err(PublishError::FlushFailed));
        }
    }

    fn resolve_pending_inits(&mut self) {
        for (init, current) in self.state.resolve_inits(Instant::now()) {
            if current {
                counter!(STATE_CURRENT).increment(1);
            } else {
                counter!(STATE_NOT_CURRENT).increment(1);
            }
            let _unused = init.reply.send(current);
        }
    }

    async fn report_health(&mut self) {
        let now = Instant::now();
        let (in_flight, pending_writes, pending_inits) = self.state.counters();
        let partition_label = self.config.partition.to_string();
        gauge!(IN_FLIGHT_RECORDS, "partition" => partition_label.clone()).set(in_flight as f64);
        gauge!(PENDING_WRITES, "partition" => partition_label.clone()).set(pending_writes as f64);
        gauge!(PENDING_INITS, "partition" => partition_label).set(pending_inits as f64);

        let txn_ms = self.state.current_txn_ms(now).unwrap_or(0);
        let counters = vec![
            ("in_flight", in_flight as u64),
            ("pending_writes", pending_writes as u64),
            ("pending_inits", pending_inits as u64),
            ("current_txn_ms", txn_ms),
        ];
        if txn_ms >= TXN_STUCK_THRESHOLD.as_millis() as u64 {
            self.health
                .report_unhealthy("transaction open too long", counters)
                .await;
        } else {
            self.health.report_healthy_with(counters).await;
        }
    }

    async fn shutdown_fenced(&mut self, error: &ProducerError) {
        error!(
            partition = self.config.partition,
            transactional_id = self.producer.transactional_id(),
            error = %error,
            "publisher fenced, terminating"
        );
        counter!(PUBLISHER_FENCED).increment(1);
        // Fencing already invalidated the transaction; no abort attempt.
        // Stashed and queued replies drop, so callers time out and retry
        // against the replacement instance.
        self.health
            .report_unhealthy("fenced", Vec::new())
            .await;
    }

    async fn shutdown(&mut self) {
        if self.state.transaction_in_progress() {
            // One last abort so the broker doesn't have to wait out the
            // transaction timeout
            if let Err(error) = self.producer.abort_transaction() {
                warn!(
                    partition = self.config.partition,
                    error = %error,
                    "abort on shutdown failed"
                );
            }
            self.state.end_transaction();
        }
        info!(partition = self.config.partition, "publisher stopped");
    }
}
