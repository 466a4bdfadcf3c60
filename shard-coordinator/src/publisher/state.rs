use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use common_kafka::record::RecordMetadata;
use tokio::sync::oneshot;

use super::PublishError;

/// A write accepted from a caller, waiting for the next flush.
pub struct PendingWrite {
    pub entity_id: String,
    pub state: (String, Option<Vec<u8>>),
    pub events: Vec<(String, Vec<u8>)>,
    pub reply: oneshot::Sender<Result<(), PublishError>>,
}

/// An outstanding "is the projection caught up for this key?" query.
pub struct PendingInit {
    pub entity_id: String,
    pub expires_at: Instant,
    pub reply: oneshot::Sender<bool>,
}

/// Bookkeeping for one partition's publisher, kept apart from the agent so
/// the transitions can be exercised without a runtime.
///
/// Holds three queues and a transaction timer:
///   - `pending_writes`, FIFO, drained completely by each flush attempt
///   - `inflight`, at most one record per key (the largest committed offset
///     not yet seen by the projection)
///   - `pending_inits`, resolved when their key leaves `inflight` or their
///     deadline passes
#[derive(Default)]
pub struct PublisherState {
    pending_writes: VecDeque<PendingWrite>,
    inflight: HashMap<String, RecordMetadata>,
    pending_inits: Vec<PendingInit>,
    transaction_started_at: Option<Instant>,
}

impl PublisherState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_write(&mut self, write: PendingWrite) {
        self.pending_writes.push_back(write);
    }

    /// Move out every queued write, preserving arrival order.
    pub fn drain_writes(&mut self) -> Vec<PendingWrite> {
        self.pending_writes.drain(..).collect()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending_writes.is_empty()
    }

    pub fn transaction_in_progress(&self) -> bool {
        self.transaction_started_at.is_some()
    }

    pub fn begin_transaction(&mut self, now: Instant) {
        self.transaction_started_at = Some(now);
    }

    pub fn end_transaction(&mut self) {
        self.transaction_started_at = None;
    }

    pub fn current_txn_ms(&self, now: Instant) -> Option<u64> {
        self.transaction_started_at
            .map(|started| now.saturating_duration_since(started).as_millis() as u64)
    }

    /// Track committed acks against the state topic. Only the largest offset
    /// per key is kept; a newer write supersedes whatever was in flight.
    pub fn record_acks<'a>(
        &mut self,
        acks: impl IntoIterator<Item = &'a RecordMetadata>,
        state_topic: &str,
    ) {
        for ack in acks {
            if ack.topic != state_topic {
                continue;
            }
            let Some(key) = &ack.key else {
                continue;
            };
            match self.inflight.get(key) {
                Some(existing) if existing.offset >= ack.offset => {}
                _ => {
                    self.inflight.insert(key.clone(), ack.clone());
                }
            }
        }
    }

    /// Drop every in-flight record the projection has caught up past.
    /// Returns how many were retired.
    pub fn retire(&mut self, processed_offset: u64) -> usize {
        let before = self.inflight.len();
        self.inflight.retain(|_, ack| ack.offset > processed_offset);
        before - self.inflight.len()
    }

    pub fn is_in_flight(&self, entity_id: &str) -> bool {
        self.inflight.contains_key(entity_id)
    }

    pub fn inflight_offset(&self, entity_id: &str) -> Option<u64> {
        self.inflight.get(entity_id).map(|ack| ack.offset)
    }

    pub fn enqueue_init(&mut self, init: PendingInit) {
        self.pending_inits.push(init);
    }

    /// Split out every query that can be answered now: `true` for keys with
    /// nothing in flight, `false` for queries past their deadline. The rest
    /// stay queued.
    pub fn resolve_inits(&mut self, now: Instant) -> Vec<(PendingInit, bool)> {
        let mut resolved = Vec::new();
        let mut remaining = Vec::new();
        for init in self.pending_inits.drain(..) {
            if !self.inflight.contains_key(&init.entity_id) {
                resolved.push((init, true));
            } else if now >= init.expires_at {
                resolved.push((init, false));
            } else {
                remaining.push(init);
            }
        }
        self.pending_inits = remaining;
        resolved
    }

    pub fn counters(&self) -> (usize, usize, usize) {
        (
            self.inflight.len(),
            self.pending_writes.len(),
            self.pending_inits.len(),
        )
    }
}
