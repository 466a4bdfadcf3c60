use std::time::Instant;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on
/// it. Intended to take a Router as returned by `setup_metrics_routes`,
/// potentially with more routes added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Buckets sized for millisecond timings: flushes sit well under a
    // second, replay and drain can take much longer.
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// A guard to record the time between creation and drop as a histogram
/// entry, in milliseconds.
pub struct TimingGuard {
    name: &'static str,
    labels: Vec<(&'static str, String)>,
    start: Instant,
}

pub fn timing_guard(name: &'static str) -> TimingGuard {
    TimingGuard {
        name,
        labels: Vec::new(),
        start: Instant::now(),
    }
}

impl TimingGuard {
    // This consumes the guard, making "label this span and then immediately
    // report the timing" a one-liner (simply don't re-bind the return
    // value), but also it's a bit of a footgun.
    pub fn label(mut self, key: &'static str, value: &str) -> Self {
        self.labels.push((key, value.to_string()));
        self
    }

    pub fn fin(self) {}
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let labels: Vec<(String, String)> = self
            .labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        metrics::histogram!(self.name, &labels).record(self.start.elapsed().as_millis() as f64);
    }
}
