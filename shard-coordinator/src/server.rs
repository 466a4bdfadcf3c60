use std::collections::HashMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use health::{HealthRegistry, HealthStatus};

use crate::region::RegionInfo;
use crate::router::RouterHandle;

#[derive(Clone)]
struct AppState {
    liveness: HealthRegistry,
    router: RouterHandle,
}

/// Status surface: liveness probe, region-map diagnostics. The caller adds
/// the metrics route and serves the result.
pub fn status_router(liveness: HealthRegistry, router: RouterHandle) -> Router {
    Router::new()
        .route("/_liveness", get(liveness_handler))
        .route("/regions", get(region_map_handler))
        .with_state(AppState { liveness, router })
}

async fn liveness_handler(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn region_map_handler(State(state): State<AppState>) -> Json<HashMap<u32, RegionInfo>> {
    Json(state.router.region_map().await)
}
