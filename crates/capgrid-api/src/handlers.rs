//! REST API handlers.
//!
//! Each handler calls one `Scheduler` operation and returns JSON wrapped
//! in the `ApiResponse` envelope.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use capgrid_scheduler::{ErrorKind, SchedulerError, SchedulerResult, SubmitRequest};
use serde::{Deserialize, Serialize};
use tracing::error;

use capgrid_state::*;

use crate::ApiState;

/// Header bounding how long a request may wait for its cluster lock.
pub const LOCK_TIMEOUT_HEADER: &str = "x-lock-timeout-ms";

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

/// HTTP status for a scheduler error.
fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::UnknownCluster(_) | SchedulerError::UnknownDeployment(_) => StatusCode::NOT_FOUND,
        SchedulerError::NotOwner { .. } => StatusCode::FORBIDDEN,
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Integrity | ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn respond<T: Serialize>(result: SchedulerResult<T>, success: StatusCode) -> Response {
    match result {
        Ok(data) => (success, ApiResponse::ok(data)).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
                error!(error = %e, "request failed");
            }
            error_response(&e.to_string(), status)
        }
    }
}

/// Parse the optional lock deadline header.
fn lock_deadline(headers: &HeaderMap) -> Result<Option<Duration>, Response> {
    let Some(value) = headers.get(LOCK_TIMEOUT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| {
            error_response(
                &format!("{LOCK_TIMEOUT_HEADER} must be a non-negative integer"),
                StatusCode::BAD_REQUEST,
            )
        })
}

// ── Request bodies ─────────────────────────────────────────────

/// Resource amounts as sent by clients. Signed so that negative values
/// are reported as validation errors instead of parse failures.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesBody {
    pub cpu: i64,
    pub ram: i64,
    pub gpu: i64,
}

impl ResourcesBody {
    fn validate(self) -> SchedulerResult<Resources> {
        Ok(Resources::from_signed(self.cpu, self.ram, self.gpu)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClusterRequest {
    pub id: ClusterId,
    pub org_id: OrgId,
    pub name: String,
    pub capacity: ResourcesBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitDeploymentRequest {
    pub cluster_id: ClusterId,
    pub org_id: OrgId,
    pub name: String,
    #[serde(default)]
    pub image: String,
    pub resources: ResourcesBody,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<DeploymentId>,
}

/// Cancel request body. Only the submitting org may cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub org_id: OrgId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub depends_on: DeploymentId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub org_id: Option<OrgId>,
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v1/clusters
pub async fn list_clusters(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.list_clusters())
}

/// POST /api/v1/clusters
pub async fn register_cluster(
    State(state): State<ApiState>,
    Json(req): Json<RegisterClusterRequest>,
) -> impl IntoResponse {
    let result = req.capacity.validate().and_then(|capacity| {
        let spec = ClusterSpec {
            id: req.id,
            org_id: req.org_id,
            name: req.name,
            capacity,
        };
        state.scheduler.register_cluster(spec.clone()).map(|()| spec)
    });
    respond(result, StatusCode::CREATED)
}

/// GET /api/v1/clusters/:id/status
pub async fn cluster_status(State(state): State<ApiState>, Path(id): Path<ClusterId>) -> impl IntoResponse {
    respond(state.scheduler.get_cluster_status(id), StatusCode::OK)
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.list_deployments(query.org_id))
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<DeploymentId>) -> impl IntoResponse {
    respond(state.scheduler.get_deployment(id), StatusCode::OK)
}

/// POST /api/v1/deployments
pub async fn submit_deployment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SubmitDeploymentRequest>,
) -> impl IntoResponse {
    let deadline = match lock_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(resp) => return resp,
    };
    let resources = match req.resources.validate() {
        Ok(resources) => resources,
        Err(e) => return respond::<()>(Err(e), StatusCode::CREATED),
    };

    let request = SubmitRequest {
        cluster_id: req.cluster_id,
        org_id: req.org_id,
        name: req.name,
        image: req.image,
        resources,
        priority: req.priority,
        dependencies: req.dependencies,
    };
    respond(
        state.scheduler.submit_deployment(request, deadline).await,
        StatusCode::CREATED,
    )
}

/// POST /api/v1/deployments/:id/cancel
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
    headers: HeaderMap,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    let deadline = match lock_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(resp) => return resp,
    };
    let result = state.scheduler.cancel_deployment_as(id, req.org_id, deadline).await;
    respond(result, StatusCode::OK)
}

/// POST /api/v1/deployments/:id/complete
pub async fn complete_deployment(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let deadline = match lock_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(resp) => return resp,
    };
    respond(state.scheduler.complete_deployment(id, deadline).await, StatusCode::OK)
}

/// POST /api/v1/deployments/:id/fail
pub async fn fail_deployment(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let deadline = match lock_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(resp) => return resp,
    };
    respond(state.scheduler.fail_deployment(id, deadline).await, StatusCode::OK)
}

/// POST /api/v1/deployments/:id/dependencies
pub async fn add_dependency(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
    headers: HeaderMap,
    Json(req): Json<DependencyRequest>,
) -> impl IntoResponse {
    let deadline = match lock_deadline(&headers) {
        Ok(deadline) => deadline,
        Err(resp) => return resp,
    };
    respond(
        state.scheduler.add_dependency(id, req.depends_on, deadline).await,
        StatusCode::OK,
    )
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
