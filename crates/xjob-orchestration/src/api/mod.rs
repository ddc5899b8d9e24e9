//! # HTTP Control API
//!
//! Thin mapping of operator intent onto backend operations, served under
//! `/v1.0/xcute`. JSON in and out; `202` on create, `204` on delete, pause
//! and resume, `400` for bad bodies or options, `404` for unknown ids and
//! `409` for illegal state transitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use xjob_shared::backend::JobBackend;
use xjob_shared::job::record::JobRecord;
use xjob_shared::job::{CreateJobRequest, Job};
use xjob_shared::modules::ModuleRegistry;
use xjob_shared::{XjobError, XjobResult};

/// Default page size for job listing
const DEFAULT_LIST_LIMIT: usize = 1000;

/// Shared state behind every handler
#[derive(Debug, Clone)]
pub struct ApiState {
    pub backend: JobBackend,
    pub registry: Arc<ModuleRegistry>,
}

/// Error wrapper translating the engine taxonomy to HTTP statuses
#[derive(Debug)]
pub struct ApiError(XjobError);

impl From<XjobError> for ApiError {
    fn from(err: XjobError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            XjobError::BadOptions(_)
            | XjobError::UnknownType(_)
            | XjobError::Serialization(_) => StatusCode::BAD_REQUEST,
            XjobError::NotFound(_) => StatusCode::NOT_FOUND,
            XjobError::BadState(_) | XjobError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Control API internal error");
        }

        let body = Json(json!({
            "status": status.as_u16(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Build the control router
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/waiting", get(list_waiting))
        .route("/jobs/locks", get(list_locks))
        .route("/jobs/{job_id}", get(show_job).delete(delete_job))
        .route("/jobs/{job_id}/pause", post(pause_job))
        .route("/jobs/{job_id}/resume", post(resume_job))
        .route("/orchestrator/{orchestrator_id}/jobs", get(orchestrator_jobs))
        .with_state(state);

    Router::new()
        .nest("/v1.0/xcute", api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the control API until `shutdown` fires.
pub async fn serve(
    state: ApiState,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> XjobResult<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Control API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    marker: Option<String>,
}

async fn create_job(
    State(state): State<ApiState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    let job = Job::create(&state.registry, request)?;
    state.backend.create(job.record()).await?;
    info!(
        job_id = %job.id(),
        job_type = %job.job_type(),
        "Created job"
    );
    Ok((StatusCode::ACCEPTED, Json(job.record().clone())))
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let jobs = state.backend.list(limit, query.marker.as_deref()).await?;
    Ok(Json(jobs))
}

async fn list_waiting(
    State(state): State<ApiState>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(state.backend.list_waiting().await?))
}

async fn list_locks(
    State(state): State<ApiState>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    Ok(Json(state.backend.locks().await?))
}

async fn show_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.backend.get(&job_id).await?))
}

async fn delete_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.backend.delete(&job_id).await?;
    info!(job_id = %job_id, "Deleted job");
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.backend.pause(&job_id).await?;
    info!(job_id = %job_id, "Paused job");
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.backend.resume(&job_id).await?;
    info!(job_id = %job_id, "Resumed job");
    Ok(StatusCode::NO_CONTENT)
}

async fn orchestrator_jobs(
    State(state): State<ApiState>,
    Path(orchestrator_id): Path<String>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(state.backend.list_orchestrator(&orchestrator_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state() -> ApiState {
        ApiState {
            backend: JobBackend::new_in_memory(),
            registry: Arc::new(ModuleRegistry::builtin()),
        }
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_tester_job(state: &ApiState) -> String {
        let app = router(state.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1.0/xcute/jobs",
                json!({"job": {"type": "tester"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let record = body_json(response).await;
        record["job"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_returns_202_with_record() {
        let state = test_state();
        let app = router(state.clone());

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1.0/xcute/jobs",
                json!({
                    "job": {"type": "tester"},
                    "items": {"max_per_second": 1000},
                    "options": {"error_percentage": 10}
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let record = body_json(response).await;
        assert_eq!(record["job"]["status"], json!("WAITING"));
        assert_eq!(record["items"]["max_per_second"], json!(1000));
        assert_eq!(record["options"]["error_percentage"], json!(10));
    }

    #[tokio::test]
    async fn test_create_unknown_type_is_400() {
        let state = test_state();
        let response = router(state)
            .oneshot(json_request(
                "POST",
                "/v1.0/xcute/jobs",
                json!({"job": {"type": "warp-drive"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_bad_options_is_400() {
        let state = test_state();
        let response = router(state)
            .oneshot(json_request(
                "POST",
                "/v1.0/xcute/jobs",
                json!({
                    "job": {"type": "tester"},
                    "options": {"error_percentage": 250}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("error_percentage"));
    }

    #[tokio::test]
    async fn test_show_job_and_404() {
        let state = test_state();
        let job_id = create_tester_job(&state).await;

        let response = router(state.clone())
            .oneshot(empty_request("GET", &format!("/v1.0/xcute/jobs/{job_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(state)
            .oneshot(empty_request("GET", "/v1.0/xcute/jobs/not-a-job"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_listing_orders_by_id() {
        let state = test_state();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(create_tester_job(&state).await);
        }
        ids.sort();

        let response = router(state)
            .oneshot(empty_request("GET", "/v1.0/xcute/jobs?limit=10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        let listed_ids: Vec<_> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["job"]["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(listed_ids, ids);
    }

    #[tokio::test]
    async fn test_waiting_endpoint() {
        let state = test_state();
        create_tester_job(&state).await;

        let response = router(state)
            .oneshot(empty_request("GET", "/v1.0/xcute/jobs/waiting"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let waiting = body_json(response).await;
        assert_eq!(waiting.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let state = test_state();
        let job_id = create_tester_job(&state).await;

        let response = router(state.clone())
            .oneshot(empty_request(
                "POST",
                &format!("/v1.0/xcute/jobs/{job_id}/pause"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let state = test_state();
        let job_id = create_tester_job(&state).await;
        state.backend.claim("orch-1").await.unwrap().unwrap();

        let response = router(state.clone())
            .oneshot(empty_request(
                "POST",
                &format!("/v1.0/xcute/jobs/{job_id}/pause"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router(state.clone())
            .oneshot(empty_request(
                "POST",
                &format!("/v1.0/xcute/jobs/{job_id}/resume"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let record = state.backend.get(&job_id).await.unwrap();
        assert_eq!(record.job.status.to_string(), "WAITING");
    }

    #[tokio::test]
    async fn test_delete_running_is_409_then_204_after_pause() {
        let state = test_state();
        let job_id = create_tester_job(&state).await;
        state.backend.claim("orch-1").await.unwrap().unwrap();

        let response = router(state.clone())
            .oneshot(empty_request(
                "DELETE",
                &format!("/v1.0/xcute/jobs/{job_id}"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        state.backend.pause(&job_id).await.unwrap();
        let response = router(state.clone())
            .oneshot(empty_request(
                "DELETE",
                &format!("/v1.0/xcute/jobs/{job_id}"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router(state)
            .oneshot(empty_request("GET", &format!("/v1.0/xcute/jobs/{job_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_locks_endpoint() {
        let state = test_state();
        let app = router(state.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1.0/xcute/jobs",
                json!({
                    "job": {"type": "rawx-decommission"},
                    "options": {"rawx_id": "rawx-1", "rdir_endpoint": "http://rdir:6300"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        state.backend.claim("orch-1").await.unwrap().unwrap();

        let response = router(state)
            .oneshot(empty_request("GET", "/v1.0/xcute/jobs/locks"))
            .await
            .unwrap();
        let locks = body_json(response).await;
        assert!(locks.as_object().unwrap().contains_key("rawx/rawx-1"));
    }

    #[tokio::test]
    async fn test_orchestrator_jobs_endpoint() {
        let state = test_state();
        let job_id = create_tester_job(&state).await;
        state.backend.claim("orch-9").await.unwrap().unwrap();

        let response = router(state)
            .oneshot(empty_request("GET", "/v1.0/xcute/orchestrator/orch-9/jobs"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let jobs = body_json(response).await;
        assert_eq!(jobs[0]["job"]["id"], json!(job_id));
        assert_eq!(jobs[0]["job"]["orchestrator_id"], json!("orch-9"));
    }
}
