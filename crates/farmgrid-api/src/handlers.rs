//! Management API handlers.
//!
//! Each handler runs one scheduler call and returns a JSON response.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use farmgrid_scheduler::{NewJob, SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{ApiState, blocking};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn scheduler_error(e: &SchedulerError) -> Response {
    let status = match e {
        SchedulerError::JobNotFound(_) | SchedulerError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::InvalidIdentity(_)
        | SchedulerError::InvalidRange { .. }
        | SchedulerError::InvalidFileRef(_) => StatusCode::BAD_REQUEST,
        SchedulerError::Store(_) => {
            error!(error = %e, "store failure in management API");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

/// Run a scheduler call and wrap its result.
async fn respond<T, F>(state: &ApiState, success: StatusCode, call: F) -> Response
where
    F: FnOnce(&farmgrid_scheduler::Scheduler) -> SchedulerResult<T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match blocking(state, call).await {
        Ok(Ok(data)) => (success, ApiResponse::ok(data)).into_response(),
        Ok(Err(e)) => scheduler_error(&e),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Pause request body.
#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

/// Priority request body.
#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: f64,
}

// ── Jobs ───────────────────────────────────────────────────────

/// GET /api/v1/jobs
pub async fn list_jobs(State(state): State<ApiState>) -> Response {
    respond(&state, StatusCode::OK, |s| {
        Ok(s.jobs()?.iter().map(|job| job.snapshot()).collect::<Vec<_>>())
    })
    .await
}

/// POST /api/v1/jobs
pub async fn create_job(State(state): State<ApiState>, Json(new): Json<NewJob>) -> Response {
    respond(&state, StatusCode::CREATED, move |s| {
        let id = s.add_job(new)?;
        Ok(s.job(&id)?.snapshot())
    })
    .await
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(&state, StatusCode::OK, move |s| s.job(&id)).await
}

/// DELETE /api/v1/jobs/{id}
pub async fn delete_job(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(&state, StatusCode::OK, move |s| s.remove_job(&id).map(|()| "deleted")).await
}

/// POST /api/v1/jobs/{id}/pause
pub async fn pause_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<PauseRequest>,
) -> Response {
    respond(&state, StatusCode::OK, move |s| {
        s.set_job_paused(&id, req.paused)?;
        Ok(s.job(&id)?.snapshot())
    })
    .await
}

/// POST /api/v1/jobs/{id}/priority
pub async fn set_job_priority(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<PriorityRequest>,
) -> Response {
    if !req.priority.is_finite() || req.priority < 0.0 {
        return error_response("priority must be a non-negative number", StatusCode::BAD_REQUEST);
    }
    respond(&state, StatusCode::OK, move |s| {
        s.set_job_priority(&id, req.priority)?;
        Ok(s.job(&id)?.snapshot())
    })
    .await
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    respond(&state, StatusCode::OK, |s| s.nodes()).await
}

/// POST /api/v1/nodes/{id}/pause
pub async fn pause_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<PauseRequest>,
) -> Response {
    respond(&state, StatusCode::OK, move |s| {
        s.set_node_paused(&id, req.paused)?;
        s.node(&id)
    })
    .await
}

/// POST /api/v1/nodes/pause
pub async fn pause_all_nodes(
    State(state): State<ApiState>,
    Json(req): Json<PauseRequest>,
) -> Response {
    respond(&state, StatusCode::OK, move |s| {
        let changed = s.set_all_nodes_paused(req.paused)?;
        Ok(serde_json::json!({ "changed": changed, "paused": req.paused }))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_core::config::{FarmConfig, ProtocolConfig};
    use farmgrid_scheduler::Scheduler;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_state() -> (TempDir, ApiState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FarmConfig::default();
        config.store.data_dir = dir.path().to_path_buf();
        config.store.dir_cache_secs = 0.0;
        let scheduler = Scheduler::open(&config).unwrap();
        (
            dir,
            ApiState::new(Arc::new(scheduler), ProtocolConfig::default()),
        )
    }

    fn test_job() -> NewJob {
        NewJob {
            name: "shot010".into(),
            project: "feature".into(),
            file: "shows::seq/shot010.blend".into(),
            first: 1,
            last: 24,
            priority: Some(2.0),
            video: false,
            requires: vec![],
            asset: None,
        }
    }

    #[tokio::test]
    async fn list_jobs_empty() {
        let (_dir, state) = test_state();
        let resp = list_jobs(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let (_dir, state) = test_state();
        let resp = create_job(State(state.clone()), Json(test_job())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let jobs = state.scheduler.jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        let resp = get_job(State(state), Path(jobs[0].id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_job_with_bad_range_is_rejected() {
        let (_dir, state) = test_state();
        let mut job = test_job();
        job.last = 0;
        let resp = create_job(State(state), Json(job)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_nonexistent_job() {
        let (_dir, state) = test_state();
        let resp = get_job(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_job_exists_then_not() {
        let (_dir, state) = test_state();
        let id = state.scheduler.add_job(test_job()).unwrap();

        let resp = delete_job(State(state.clone()), Path(id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = delete_job(State(state), Path(id)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_and_reprioritise_job() {
        let (_dir, state) = test_state();
        let id = state.scheduler.add_job(test_job()).unwrap();

        let resp = pause_job(
            State(state.clone()),
            Path(id.clone()),
            Json(PauseRequest { paused: true }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = set_job_priority(
            State(state.clone()),
            Path(id.clone()),
            Json(PriorityRequest { priority: -1.0 }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = set_job_priority(
            State(state.clone()),
            Path(id.clone()),
            Json(PriorityRequest { priority: 9.0 }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let job = state.scheduler.job(&id).unwrap();
        assert!(job.paused);
        assert_eq!(job.priority, 9.0);
    }

    #[tokio::test]
    async fn node_pausing() {
        let (_dir, state) = test_state();
        state.scheduler.report_identity("a", &[], None).unwrap();

        let resp = pause_node(
            State(state.clone()),
            Path("ghost".to_string()),
            Json(PauseRequest { paused: true }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = pause_all_nodes(State(state.clone()), Json(PauseRequest { paused: true })).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.scheduler.node("a").unwrap().paused);

        let resp = list_nodes(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
