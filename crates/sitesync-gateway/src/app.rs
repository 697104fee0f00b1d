use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sitesync_core::config::SitesyncConfig;
use sitesync_scheduler::SchedulerHandle;

/// Shared state passed as `Arc<AppState>` to all handlers.
pub struct AppState {
    pub config: SitesyncConfig,
    pub scheduler: SchedulerHandle,
    pub job_count: usize,
}

impl AppState {
    pub fn new(config: SitesyncConfig, scheduler: SchedulerHandle, job_count: usize) -> Self {
        Self {
            config,
            scheduler,
            job_count,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/scheduler", post(crate::http::control::control_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
