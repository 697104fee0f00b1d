//! Scheduler control endpoint — POST /scheduler.
//!
//! The body is a JSON object tagged by `action`: `status`, `list`,
//! `trigger`, `enable` or `disable` (the last three carry `jobName`).

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use sitesync_scheduler::SchedulerError;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ControlRequest {
    Status,
    List,
    Trigger {
        #[serde(rename = "jobName")]
        job_name: String,
    },
    Enable {
        #[serde(rename = "jobName")]
        job_name: String,
    },
    Disable {
        #[serde(rename = "jobName")]
        job_name: String,
    },
}

type Reply = (StatusCode, Json<Value>);

pub async fn control_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Reply {
    let request: ControlRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "rejected scheduler control request");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid request: {e}") })),
            );
        }
    };

    let scheduler = &state.scheduler;
    match request {
        ControlRequest::Status => match scheduler.status().await {
            Ok(jobs) => (StatusCode::OK, Json(json!({ "jobs": jobs }))),
            Err(e) => scheduler_error(e, None),
        },
        ControlRequest::List => match scheduler.list().await {
            Ok(jobs) => (StatusCode::OK, Json(json!({ "jobs": jobs }))),
            Err(e) => scheduler_error(e, None),
        },
        ControlRequest::Trigger { job_name } => {
            info!(job = %job_name, "manual trigger");
            match scheduler.trigger(&job_name).await {
                Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
                Err(e) => scheduler_error(e, Some(&job_name)),
            }
        }
        ControlRequest::Enable { job_name } => set_enabled(&state, job_name, true).await,
        ControlRequest::Disable { job_name } => set_enabled(&state, job_name, false).await,
    }
}

async fn set_enabled(state: &AppState, job_name: String, enabled: bool) -> Reply {
    match state.scheduler.set_enabled(&job_name, enabled).await {
        Ok(()) => {
            info!(job = %job_name, enabled, "job enablement changed");
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "jobName": job_name, "enabled": enabled })),
            )
        }
        Err(e) => scheduler_error(e, Some(&job_name)),
    }
}

fn scheduler_error(e: SchedulerError, job_name: Option<&str>) -> Reply {
    match e {
        SchedulerError::JobNotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": "Job not found", "jobName": job_name })),
        ),
        SchedulerError::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": e.to_string(), "code": e.code() })),
        ),
        SchedulerError::Kv(_) => {
            warn!(error = %e, "scheduler state error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": e.to_string(), "code": e.code() })),
            )
        }
    }
}
