use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Health reporting for the coordination loops of the service.
///
/// The process hosts several long-lived agents (the shard router, one
/// transactional publisher per owned partition, the consumed-stream
/// manager), and can only be trusted with traffic if all of them are
/// properly running and reporting.
///
/// HealthRegistry allows an arbitrary number of components to be
/// registered and report their health. The process' health status is the
/// combination of these individual statuses:
///   - if any component is unhealthy, the process is unhealthy
///   - if all components recently reported healthy, the process is healthy
///   - if a component failed to report healthy within its deadline, it is
///     considered stalled and the check fails.
///
/// Components that expose queue depths (pending writes, in-flight records)
/// can attach counters to their reports; these show up in the probe body
/// for debugging but do not affect the verdict.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentHealth>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    /// Latest counters attached by the component, e.g. queue depths.
    pub counters: Vec<(&'static str, u64)>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, with the component's stated reason
    Unhealthy(String),
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
    counters: Vec<(&'static str, u64)>,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_healthy_with(Vec::new()).await
    }

    /// Report healthy with a set of counters to surface in the probe body.
    pub async fn report_healthy_with(&self, counters: Vec<(&'static str, u64)>) {
        self.send(
            ComponentStatus::HealthyUntil(time::OffsetDateTime::now_utc().add(self.deadline)),
            counters,
        )
        .await
    }

    /// Report unhealthy with a reason, e.g. a transaction held open too long.
    pub async fn report_unhealthy(&self, reason: &str, counters: Vec<(&'static str, u64)>) {
        self.send(ComponentStatus::Unhealthy(reason.to_string()), counters)
            .await
    }

    async fn send(&self, status: ComponentStatus, counters: Vec<(&'static str, u64)>) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
            counters,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Synchronously report as healthy, returns when the message is queued.
    /// For callers stuck in sync callbacks (e.g. client library stats hooks).
    pub fn report_healthy_blocking(&self) {
        let message = HealthMessage {
            component: self.component.clone(),
            status: ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc().add(self.deadline),
            ),
            counters: Vec::new(),
        };
        // Don't panic if we're called from within an async context,
        // just spawn instead
        if let Ok(h) = runtime::Handle::try_current() {
            let m = self.clone();
            h.spawn(async move { m.send(message.status, message.counters).await });
        } else if let Err(err) = self.sender.blocking_send(message) {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    let _unused = map.insert(
                        message.component,
                        ComponentHealth {
                            status: message.status,
                            counters: message.counters,
                        },
                    );
                } else {
                    // Poisoned mutex: just warn, the probes will fail and the process restart
                    warn!("poisoned HealthRegistry mutex")
                }
            }
        });

        registry
    }

    /// Registers a new component in the registry. The returned handle should
    /// be passed to the component, to allow it to frequently report its
    /// health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.send(ComponentStatus::Starting, Vec::new()).await;
        handle
    }

    /// Deregister a component, e.g. a partition region torn down on
    /// rebalance. Its status stops contributing to the overall verdict.
    pub fn deregister(&self, component: &str) {
        if let Ok(mut map) = self.components.write() {
            let _unused = map.remove(component);
        }
    }

    /// Returns the overall process status, computed from the status of all
    /// the components currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");

        let mut result = HealthStatus {
            // unhealthy if no component has registered yet
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, health) in components.iter() {
            match &health.status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    let _unused = result.components.insert(name.clone(), health.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    let _unused = result.components.insert(
                        name.clone(),
                        ComponentHealth {
                            status: ComponentStatus::Stalled,
                            counters: health.counters.clone(),
                        },
                    );
                }
                _ => {
                    result.healthy = false;
                    let _unused = result.components.insert(name.clone(), health.clone());
                }
            }
        }
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
