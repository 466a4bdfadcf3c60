use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use common_kafka::consumer::SourceFactory;
use health::HealthHandle;
use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::metric_consts::{REPLAYS_FAILED, REPLAYS_STARTED, STREAM_STOPS};
use crate::stream::pipeline::{run_pipeline, CommitterSettings, EventFlow, PipelineShared};
use crate::stream::replay::{ReplayCoordinator, ReplayResult};

const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub enum StreamMsg {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Metrics(oneshot::Sender<HashMap<String, f64>>),
    Replay(oneshot::Sender<ReplayResult>),
}

#[derive(Clone)]
pub struct StreamManagerHandle {
    tx: mpsc::Sender<StreamMsg>,
}

impl StreamManagerHandle {
    /// Start consuming. Safe to call repeatedly.
    pub async fn start(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(StreamMsg::Start(ack)).await.is_ok() {
            let _unused = rx.await;
        }
    }

    /// Stop consuming. Resolves once in-progress offsets are drained and the
    /// consumer is released. Safe to call repeatedly.
    pub async fn stop(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(StreamMsg::Stop(ack)).await.is_ok() {
            let _unused = rx.await;
        }
    }

    /// Live counters from the underlying consumer; empty when not consuming.
    pub async fn metrics(&self) -> HashMap<String, f64> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StreamMsg::Metrics(reply)).await.is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the group, run the replay strategy, restart. On failure the
    /// consumers stay stopped and the caller decides what to do next.
    pub async fn replay(&self) -> ReplayResult {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StreamMsg::Replay(reply)).await.is_err() {
            return ReplayResult::ReplayFailed("stream manager terminated".to_string());
        }
        rx.await
            .unwrap_or_else(|_| ReplayResult::ReplayFailed("stream manager terminated".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerPhase {
    Stopped,
    Consuming,
    Stopping,
}

/// Internal notification that the pipeline task has exited.
struct PipelineExited;

type ExitedRx = mpsc::Receiver<PipelineExited>;

pub struct StreamManager {
    factory: Arc<dyn SourceFactory>,
    flow: Arc<dyn EventFlow>,
    committer: CommitterSettings,
    coordinator: ReplayCoordinator,
    health: HealthHandle,
    phase: ManagerPhase,
    stash: VecDeque<StreamMsg>,
    stop_tx: Option<watch::Sender<bool>>,
    pipeline_running: bool,
    pending_stop_acks: Vec<oneshot::Sender<()>>,
    shared: Arc<PipelineShared>,
    exited_tx: mpsc::Sender<PipelineExited>,
}

pub fn spawn_stream_manager(
    factory: Arc<dyn SourceFactory>,
    flow: Arc<dyn EventFlow>,
    committer: CommitterSettings,
    coordinator: ReplayCoordinator,
    health: HealthHandle,
) -> StreamManagerHandle {
    let (tx, rx) = mpsc::channel(256);
    let (exited_tx, exited_rx) = mpsc::channel(4);
    let manager = StreamManager {
        factory,
        flow,
        committer,
        coordinator,
        health,
        phase: ManagerPhase::Stopped,
        stash: VecDeque::new(),
        stop_tx: None,
        pipeline_running: false,
        pending_stop_acks: Vec::new(),
        shared: Arc::new(PipelineShared::default()),
        exited_tx,
    };
    tokio::spawn(manager.run(rx, exited_rx));
    StreamManagerHandle { tx }
}

impl StreamManager {
    async fn run(mut self, mut rx: mpsc::Receiver<StreamMsg>, mut exited_rx: ExitedRx) {
        let mut health_tick = tokio::time::interval(HEALTH_REPORT_INTERVAL);
        loop {
            tokio::select! {
                _ = health_tick.tick() => {
                    self.report_health().await;
                }
                Some(PipelineExited) = exited_rx.recv() => {
                    self.on_pipeline_exit(&mut exited_rx).await;
                }
                maybe_msg = rx.recv() => match maybe_msg {
                    Some(msg) => self.handle(msg, &mut exited_rx).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: StreamMsg, exited_rx: &mut ExitedRx) {
        if self.phase == ManagerPhase::Stopping {
            // Whatever arrives mid-drain replays verbatim once stopped
            self.stash.push_back(msg);
            return;
        }
        match msg {
            StreamMsg::Start(ack) => {
                if self.phase == ManagerPhase::Stopped {
                    self.start_pipeline();
                }
                let _unused = ack.send(());
            }
            StreamMsg::Stop(ack) => match self.phase {
                ManagerPhase::Stopped => {
                    let _unused = ack.send(());
                }
                ManagerPhase::Consuming => {
                    self.begin_stop();
                    self.pending_stop_acks.push(ack);
                }
                ManagerPhase::Stopping => unreachable!("stopping requests are stashed"),
            },
            StreamMsg::Metrics(reply) => {
                let snapshot = if self.phase == ManagerPhase::Consuming {
                    self.shared
                        .source
                        .read()
                        .ok()
                        .and_then(|slot| slot.as_ref().map(|source| source.metrics()))
                        .unwrap_or_default()
                } else {
                    HashMap::new()
                };
                let _unused = reply.send(snapshot);
            }
            StreamMsg::Replay(reply) => {
                self.handle_replay(reply, exited_rx).await;
            }
        }
    }

    fn start_pipeline(&mut self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let factory = self.factory.clone();
        let flow = self.flow.clone();
        let committer = self.committer.clone();
        let shared = self.shared.clone();
        let exited_tx = self.exited_tx.clone();
        tokio::spawn(async move {
            run_pipeline(factory, flow, committer, shared, stop_rx).await;
            let _unused = exited_tx.send(PipelineExited).await;
        });
        self.stop_tx = Some(stop_tx);
        self.pipeline_running = true;
        self.phase = ManagerPhase::Consuming;
        info!("stream consuming");
    }

    fn begin_stop(&mut self) {
        if let Some(stop_tx) = &self.stop_tx {
            let _unused = stop_tx.send(true);
        }
        self.phase = ManagerPhase::Stopping;
        info!("stream stopping, draining offsets");
    }

    async fn on_pipeline_exit(&mut self, exited_rx: &mut ExitedRx) {
        self.pipeline_running = false;
        self.stop_tx = None;
        if self.phase != ManagerPhase::Stopped {
            self.phase = ManagerPhase::Stopped;
            counter!(STREAM_STOPS).increment(1);
            info!("stream stopped");
        }
        for ack in self.pending_stop_acks.drain(..) {
            let _unused = ack.send(());
        }
        let stashed: Vec<StreamMsg> = self.stash.drain(..).collect();
        for msg in stashed {
            Box::pin(self.handle(msg, exited_rx)).await;
        }
    }

    async fn handle_replay(
        &mut self,
        reply: oneshot::Sender<ReplayResult>,
        exited_rx: &mut ExitedRx,
    ) {
        counter!(REPLAYS_STARTED).increment(1);
        info!("replay requested, stopping consumers");

        if self.phase == ManagerPhase::Consuming {
            self.begin_stop();
            // Drain inline; stop acks and stashed requests resolve through
            // the normal exit path
            let drained = tokio::time::timeout(self.coordinator.timeout(), async {
                if exited_rx.recv().await.is_some() {
                    Some(())
                } else {
                    None
                }
            })
            .await;
            match drained {
                Ok(_) => self.on_pipeline_exit(exited_rx).await,
                Err(_) => {
                    error!("drain before replay timed out");
                    counter!(REPLAYS_FAILED).increment(1);
                    let _unused = reply.send(ReplayResult::ReplayFailed(
                        "consumer drain timed out".to_string(),
                    ));
                    return;
                }
            }
        }

        match self.coordinator.run().await {
            ReplayResult::ReplaySuccessfullyStarted => {
                self.start_pipeline();
                let _unused = reply.send(ReplayResult::ReplaySuccessfullyStarted);
            }
            failed => {
                counter!(REPLAYS_FAILED).increment(1);
                warn!("replay failed, consumers stay stopped");
                let _unused = reply.send(failed);
            }
        }
    }

    async fn report_health(&mut self) {
        let counters = vec![(
            "consuming",
            u64::from(self.phase == ManagerPhase::Consuming),
        )];
        self.health.report_healthy_with(counters).await;
    }

    async fn shutdown(&mut self) {
        if let Some(stop_tx) = &self.stop_tx {
            let _unused = stop_tx.send(true);
        }
        info!("stream manager stopped");
    }
}
