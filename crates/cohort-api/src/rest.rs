//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use cohort_core::{CohortError, DeviceDriver, GpuInfo, JobView};
use cohort_scheduler::{RunSummary, StatusBoard};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub run_id: Uuid,
    pub output_dir: PathBuf,
    pub board: StatusBoard,
    pub driver: Arc<dyn DeviceDriver>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:index", get(get_job))
        .route("/api/v1/summary", get(get_summary))
        .route("/api/v1/gpus", get(get_gpus))
        .route("/api/v1/status", get(get_status))
        .with_state(Arc::new(state))
}

/// List every job of the run
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    Json(state.board.views().await)
}

/// Get a single job by index
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
) -> Result<Json<JobView>, (StatusCode, String)> {
    state
        .board
        .get(index)
        .await
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                CohortError::JobNotFound(index.to_string()).to_string(),
            )
        })
}

async fn get_summary(State(state): State<Arc<AppState>>) -> Json<RunSummary> {
    Json(state.board.summary().await)
}

/// Get GPU information
async fn get_gpus(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GpuInfo>, (StatusCode, String)> {
    GpuInfo::from_driver(state.driver.as_ref())
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Run status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub run_id: Uuid,
    pub output_dir: PathBuf,
    pub finished: bool,
    pub summary: RunSummary,
    pub gpus: GpuInfo,
}

/// Get run status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let summary = state.board.summary().await;
    let gpus = GpuInfo::from_driver(state.driver.as_ref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to query GPUs for status");
        GpuInfo::empty()
    });
    debug!(run_id = %state.run_id, total = summary.total, "Serving run status");

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        run_id: state.run_id,
        output_dir: state.output_dir.clone(),
        finished: summary.is_done(),
        summary,
        gpus,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use cohort_core::{Job, JobStatus, RunConfig, RunSettings, Slot, StaticDriver, Task};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    const GIB: u64 = 1024 * 1024 * 1024;

    async fn state() -> AppState {
        let settings = Arc::new(RunSettings::from_config(&RunConfig::new("/runs/api")));
        let board = StatusBoard::new();

        let mut running = Job::ready(Task::new("a", 1), 0, Slot::new(1, 5004), settings.clone());
        running.mark_running().unwrap();
        board.insert(&running).await;
        board
            .insert(&Job::waitlisted(Task::new("b", 1), 1, settings.clone()))
            .await;

        AppState {
            run_id: settings.run_id,
            output_dir: settings.output_dir.clone(),
            board,
            driver: Arc::new(StaticDriver::uniform(2, 16 * GIB)),
        }
    }

    async fn get_json<T: DeserializeOwned>(router: Router, uri: &str) -> (StatusCode, Option<T>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).ok())
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let (status, jobs) = get_json::<Vec<JobView>>(create_router(state().await), "/api/v1/jobs").await;
        assert_eq!(status, StatusCode::OK);

        let jobs = jobs.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].condition, "a");
        assert!(jobs[0].running);
        assert_eq!(jobs[0].device, 1);
        assert_eq!(jobs[1].status, JobStatus::Waitlisted);
        assert_eq!(jobs[1].device, -1);
    }

    #[tokio::test]
    async fn test_get_job() {
        let router = create_router(state().await);
        let (status, job) = get_json::<JobView>(router.clone(), "/api/v1/jobs/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job.unwrap().condition, "b");

        let (status, _) = get_json::<JobView>(router, "/api/v1/jobs/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_summary_and_status() {
        let router = create_router(state().await);
        let (status, summary) = get_json::<RunSummary>(router.clone(), "/api/v1/summary").await;
        assert_eq!(status, StatusCode::OK);
        let summary = summary.unwrap();
        assert_eq!(summary.running, 1);
        assert_eq!(summary.waitlisted, 1);

        let (_, run) = get_json::<StatusResponse>(router.clone(), "/api/v1/status").await;
        let run = run.unwrap();
        assert!(!run.finished);
        assert_eq!(run.gpus.total_count, 2);

        let (_, gpus) = get_json::<GpuInfo>(router, "/api/v1/gpus").await;
        assert_eq!(gpus.unwrap().devices[1].memory_free, 16 * GIB);
    }
}
