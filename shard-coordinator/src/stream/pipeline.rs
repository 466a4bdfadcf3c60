use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common_kafka::consumer::{CommittableOffset, CommittableSource, EventPlusOffset, SourceFactory};
use futures::StreamExt;
use metrics::counter;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::metric_consts::{CONSUMER_RESTARTS, EVENTS_CONSUMED, OFFSETS_COMMITTED};
use crate::statestore::ProcessedOffsetIndex;

/// How one consumed event is folded into the projection. Supplied by the
/// application; the pipeline only cares about getting the offset back once
/// the event is durable.
#[async_trait]
pub trait EventFlow: Send + Sync {
    async fn process(&self, event: EventPlusOffset) -> anyhow::Result<CommittableOffset>;
}

/// Minimal projection flow: records the processed cursor per partition and
/// hands the offset straight back. Enough to drive publisher recovery and
/// retirement when the real view lives elsewhere.
pub struct CursorFlow {
    index: Arc<ProcessedOffsetIndex>,
}

impl CursorFlow {
    pub fn new(index: Arc<ProcessedOffsetIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl EventFlow for CursorFlow {
    async fn process(&self, event: EventPlusOffset) -> anyhow::Result<CommittableOffset> {
        let offset = event.offset;
        self.index
            .advance(&offset.topic, offset.partition, offset.offset);
        Ok(offset)
    }
}

#[derive(Clone)]
pub struct CommitterSettings {
    pub max_batch: usize,
    pub max_interval: Duration,
    pub parallelism: usize,
}

/// Bounded exponential backoff for consumer restarts: 1s doubling to 15s,
/// with 10% jitter so a fleet of restarting consumers doesn't stampede.
pub struct RestartBackoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(15),
            jitter: 0.1,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.min.as_secs_f64() * 2f64.powi(self.attempt as i32);
        let capped = exp.min(self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(capped * factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the manager and the live pipeline, so metrics
/// queries can reach the current consumer without joining the task.
#[derive(Default)]
pub struct PipelineShared {
    pub source: RwLock<Option<Arc<dyn CommittableSource>>>,
}

enum ConsumeOutcome {
    Stopped,
    Failed(anyhow::Error),
}

// A run shorter than this keeps escalating the backoff; a longer one was a
// real recovery and resets it.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// Consume until stopped, recreating the source with backoff on failure.
/// Business-flow errors restart the pipeline the same way consumer errors
/// do; uncommitted offsets get reprocessed, nothing surfaces to callers.
pub(crate) async fn run_pipeline(
    factory: Arc<dyn SourceFactory>,
    flow: Arc<dyn EventFlow>,
    committer: CommitterSettings,
    shared: Arc<PipelineShared>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = RestartBackoff::new();
    while !*stop.borrow() {
        let source = match factory.create() {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "failed to create consumer, backing off");
                counter!(CONSUMER_RESTARTS).increment(1);
                if wait_or_stop(&mut stop, backoff.next_delay()).await {
                    break;
                }
                continue;
            }
        };

        if let Ok(mut slot) = shared.source.write() {
            *slot = Some(source.clone());
        }
        let started = Instant::now();
        let outcome = consume(&source, flow.as_ref(), &committer, &mut stop).await;
        if let Ok(mut slot) = shared.source.write() {
            *slot = None;
        }

        match outcome {
            ConsumeOutcome::Stopped => break,
            ConsumeOutcome::Failed(e) => {
                error!(error = %e, "consumer pipeline failed, restarting");
                counter!(CONSUMER_RESTARTS).increment(1);
                if started.elapsed() >= STABLE_RUN {
                    backoff.reset();
                }
                if wait_or_stop(&mut stop, backoff.next_delay()).await {
                    break;
                }
            }
        }
    }
    info!("consumer pipeline exited");
}

/// Sleep for `delay`, or less if the stop signal fires. True means stop.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

async fn consume(
    source: &Arc<dyn CommittableSource>,
    flow: &dyn EventFlow,
    committer: &CommitterSettings,
    stop: &mut watch::Receiver<bool>,
) -> ConsumeOutcome {
    let mut pending: Vec<CommittableOffset> = Vec::new();
    let mut commit_tick = tokio::time::interval(committer.max_interval);
    commit_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first interval tick fires immediately; burn it so an empty
    // commit isn't attempted at startup
    commit_tick.tick().await;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    // Drain: processed offsets get committed before the
                    // consumer is released
                    if let Err(e) = commit_pending(source, &mut pending) {
                        warn!(error = %e, "final offset commit failed during drain");
                    }
                    return ConsumeOutcome::Stopped;
                }
            }
            _ = commit_tick.tick() => {
                if let Err(e) = commit_pending(source, &mut pending) {
                    return ConsumeOutcome::Failed(e);
                }
            }
            received = source.recv() => {
                let first = match received {
                    Ok(event) => event,
                    Err(e) => return ConsumeOutcome::Failed(e.into()),
                };

                // Opportunistically pull whatever else is already buffered,
                // up to the processing parallelism
                let mut events = vec![first];
                while events.len() < committer.parallelism {
                    match tokio::time::timeout(Duration::ZERO, source.recv()).await {
                        Ok(Ok(event)) => events.push(event),
                        Ok(Err(e)) => return ConsumeOutcome::Failed(e.into()),
                        Err(_) => break,
                    }
                }
                counter!(EVENTS_CONSUMED).increment(events.len() as u64);

                let results: Vec<_> = futures::stream::iter(
                    events.into_iter().map(|event| flow.process(event)),
                )
                .buffer_unordered(committer.parallelism)
                .collect()
                .await;

                for result in results {
                    match result {
                        Ok(offset) => pending.push(offset),
                        Err(e) => return ConsumeOutcome::Failed(e),
                    }
                }

                if pending.len() >= committer.max_batch {
                    if let Err(e) = commit_pending(source, &mut pending) {
                        return ConsumeOutcome::Failed(e);
                    }
                }
            }
        }
    }
}

fn commit_pending(
    source: &Arc<dyn CommittableSource>,
    pending: &mut Vec<CommittableOffset>,
) -> anyhow::Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    source.commit(pending)?;
    counter!(OFFSETS_COMMITTED).increment(pending.len() as u64);
    pending.clear();
    Ok(())
}
