#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::consumer::{
    CommittableOffset, CommittableSource, EventPlusOffset, SourceFactory,
};
use common_kafka::error::{ConsumerError, ProducerError};
use common_kafka::partitioner::EntityPartitioner;
use common_kafka::producer::{FlushRecordProducer, LogProducer};
use common_kafka::record::{LogRecord, RecordMetadata};
use shard_coordinator::region::{RegionCreator, RegionEnvelope, RegionMsg};
use shard_coordinator::statestore::{StateMeta, StateStoreMeta};
use tokio::sync::mpsc;

pub const STATE_TOPIC: &str = "aggregate_state";
pub const EVENTS_TOPIC: &str = "aggregate_events";

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !check() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(check());
}

/// Scripted stand-in for the transactional producer. Offsets are handed out
/// sequentially from `first_offset` in send order.
pub struct MockLogProducer {
    next_offset: AtomicU64,
    pub sent: Mutex<Vec<LogRecord>>,
    pub begun: AtomicUsize,
    pub committed: AtomicUsize,
    pub aborted: AtomicUsize,
    pub rebuilds: AtomicUsize,
    pub init_errors: Mutex<VecDeque<ProducerError>>,
    pub begin_errors: Mutex<VecDeque<ProducerError>>,
    pub commit_errors: Mutex<VecDeque<ProducerError>>,
}

impl MockLogProducer {
    pub fn new(first_offset: u64) -> Arc<Self> {
        Arc::new(Self {
            next_offset: AtomicU64::new(first_offset),
            sent: Mutex::new(Vec::new()),
            begun: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            rebuilds: AtomicUsize::new(0),
            init_errors: Mutex::new(VecDeque::new()),
            begin_errors: Mutex::new(VecDeque::new()),
            commit_errors: Mutex::new(VecDeque::new()),
        })
    }

    pub fn fail_init_with(&self, error: ProducerError) {
        self.init_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_commit_with(&self, error: ProducerError) {
        self.commit_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_begin_with(&self, error: ProducerError) {
        self.begin_errors.lock().unwrap().push_back(error);
    }

    pub fn sent_keys(&self, topic: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.topic == topic)
            .filter_map(|record| record.key.clone())
            .collect()
    }
}

#[async_trait]
impl LogProducer for MockLogProducer {
    fn transactional_id(&self) -> &str {
        "test-aggregate_state-0"
    }

    fn init_transactions(&self) -> Result<(), ProducerError> {
        match self.init_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn rebuild(&self) -> Result<(), ProducerError> {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn begin_transaction(&self) -> Result<(), ProducerError> {
        match self.begin_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => {
                self.begun.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn send_records(
        &self,
        records: Vec<LogRecord>,
    ) -> Result<Vec<RecordMetadata>, ProducerError> {
        let mut acks = Vec::with_capacity(records.len());
        for record in &records {
            let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
            acks.push(RecordMetadata {
                key: record.key.clone(),
                topic: record.topic.clone(),
                partition: record.partition.unwrap_or(0),
                offset,
            });
        }
        self.sent.lock().unwrap().extend(records);
        Ok(acks)
    }

    fn commit_transaction(&self) -> Result<(), ProducerError> {
        match self.commit_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => {
                self.committed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn abort_transaction(&self) -> Result<(), ProducerError> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockFlushRecordProducer {
    pub watermark_offset: u64,
    pub sends: AtomicUsize,
}

impl MockFlushRecordProducer {
    pub fn new(watermark_offset: u64) -> Arc<Self> {
        Arc::new(Self {
            watermark_offset,
            sends: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl FlushRecordProducer for MockFlushRecordProducer {
    async fn send_flush_record(
        &self,
        topic: &str,
        partition: u32,
    ) -> Result<RecordMetadata, ProducerError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(RecordMetadata {
            key: None,
            topic: topic.to_string(),
            partition,
            offset: self.watermark_offset,
        })
    }
}

/// Projection cursor the tests move by hand.
pub struct MockStateStore {
    open: AtomicBool,
    meta: Mutex<Option<StateMeta>>,
}

impl MockStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            meta: Mutex::new(None),
        })
    }

    pub fn set_processed(&self, topic: &str, partition: u32, offset: u64) {
        *self.meta.lock().unwrap() = Some(StateMeta {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
        });
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStoreMeta for MockStateStore {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn get_meta(&self, topic: &str, partition: u32) -> Option<StateMeta> {
        let meta = self.meta.lock().unwrap().clone();
        meta.filter(|m| m.topic == topic && m.partition == partition)
    }
}

/// Deterministic entity → partition table for routing tests.
pub struct FixedPartitioner {
    map: HashMap<String, u32>,
    fallback: Option<u32>,
}

impl FixedPartitioner {
    pub fn new(entries: &[(&str, u32)], fallback: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            map: entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            fallback,
        })
    }
}

impl EntityPartitioner for FixedPartitioner {
    fn partition_for(&self, entity_id: &str) -> Option<u32> {
        self.map.get(entity_id).copied().or(self.fallback)
    }
}

/// What a mock region observed.
#[derive(Debug)]
pub enum RegionEvent {
    Command { partition: u32, payload: Vec<u8> },
    Stopped { partition: u32 },
}

/// Region factory whose regions echo `p<partition>-ack` to every command
/// and report everything they see on a channel.
pub struct MockRegionCreator {
    pub created: Mutex<Vec<u32>>,
    pub events: mpsc::UnboundedSender<RegionEvent>,
}

impl MockRegionCreator {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RegionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
                events,
            }),
            rx,
        )
    }

    pub fn created_partitions(&self) -> Vec<u32> {
        self.created.lock().unwrap().clone()
    }
}

impl RegionCreator for MockRegionCreator {
    fn create(&self, partition: u32) -> mpsc::Sender<RegionEnvelope> {
        self.created.lock().unwrap().push(partition);
        let events = self.events.clone();
        let (tx, mut rx) = mpsc::channel::<RegionEnvelope>(64);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope.msg {
                    RegionMsg::Command(command) => {
                        let _unused = events.send(RegionEvent::Command {
                            partition: envelope.partition,
                            payload: command.payload.clone(),
                        });
                        let _unused = command
                            .reply
                            .send(format!("p{}-ack", envelope.partition).into_bytes());
                    }
                    RegionMsg::Stop => {
                        let _unused = events.send(RegionEvent::Stopped {
                            partition: envelope.partition,
                        });
                        break;
                    }
                }
            }
        });
        tx
    }
}

enum ScriptedItem {
    Event(EventPlusOffset),
    Fail,
}

/// Committable source fed from a script; empty script means "pend".
pub struct MockSource {
    items: Mutex<VecDeque<ScriptedItem>>,
    pub committed: Mutex<Vec<CommittableOffset>>,
    pub snapshot: HashMap<String, f64>,
}

impl MockSource {
    fn new(items: VecDeque<ScriptedItem>, snapshot: HashMap<String, f64>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            committed: Mutex::new(Vec::new()),
            snapshot,
        })
    }

    pub fn committed_offsets(&self) -> Vec<u64> {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.offset)
            .collect()
    }
}

#[async_trait]
impl CommittableSource for MockSource {
    async fn recv(&self) -> Result<EventPlusOffset, ConsumerError> {
        loop {
            let next = self.items.lock().unwrap().pop_front();
            match next {
                Some(ScriptedItem::Event(event)) => return Ok(event),
                Some(ScriptedItem::Fail) => return Err(ConsumerError::Closed),
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    fn commit(&self, offsets: &[CommittableOffset]) -> Result<(), ConsumerError> {
        self.committed
            .lock()
            .unwrap()
            .extend_from_slice(offsets);
        Ok(())
    }

    fn metrics(&self) -> HashMap<String, f64> {
        self.snapshot.clone()
    }

    fn seek_to_beginning(&self) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// Builds one scripted source per (re)start, keeping every incarnation
/// around for inspection.
pub struct MockSourceFactory {
    scripts: Mutex<VecDeque<Vec<ScriptMsg>>>,
    pub sources: Mutex<Vec<Arc<MockSource>>>,
    pub snapshot: HashMap<String, f64>,
}

pub enum ScriptMsg {
    Event { partition: u32, offset: u64 },
    Fail,
}

impl MockSourceFactory {
    pub fn new(scripts: Vec<Vec<ScriptMsg>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            sources: Mutex::new(Vec::new()),
            snapshot: HashMap::new(),
        })
    }

    pub fn with_snapshot(scripts: Vec<Vec<ScriptMsg>>, snapshot: HashMap<String, f64>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            sources: Mutex::new(Vec::new()),
            snapshot,
        })
    }

    pub fn creates(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    pub fn source(&self, index: usize) -> Arc<MockSource> {
        self.sources.lock().unwrap()[index].clone()
    }
}

impl SourceFactory for MockSourceFactory {
    fn create(&self) -> Result<Arc<dyn CommittableSource>, ConsumerError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let items = script
            .into_iter()
            .map(|msg| match msg {
                ScriptMsg::Event { partition, offset } => ScriptedItem::Event(EventPlusOffset {
                    key: Some(format!("entity-{offset}")),
                    payload: Some(b"{}".to_vec()),
                    offset: CommittableOffset {
                        topic: STATE_TOPIC.to_string(),
                        partition,
                        offset,
                    },
                }),
                ScriptMsg::Fail => ScriptedItem::Fail,
            })
            .collect();
        let source = MockSource::new(items, self.snapshot.clone());
        self.sources.lock().unwrap().push(source.clone());
        Ok(source)
    }
}
