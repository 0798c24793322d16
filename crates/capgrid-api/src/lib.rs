//! capgrid-api — REST API for capgrid.
//!
//! Thin axum layer over [`Scheduler`]: every handler parses its request,
//! calls one scheduler operation and maps the outcome onto an HTTP status.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/clusters` | List clusters |
//! | POST | `/api/v1/clusters` | Register a cluster |
//! | GET | `/api/v1/clusters/:id/status` | Capacity books and queues |
//! | GET | `/api/v1/deployments` | List deployments (`?org_id=`) |
//! | POST | `/api/v1/deployments` | Submit a deployment |
//! | GET | `/api/v1/deployments/:id` | Get deployment details |
//! | POST | `/api/v1/deployments/:id/cancel` | Cancel a deployment |
//! | POST | `/api/v1/deployments/:id/complete` | Report completion |
//! | POST | `/api/v1/deployments/:id/fail` | Report failure |
//! | POST | `/api/v1/deployments/:id/dependencies` | Add a dependency |
//! | GET | `/healthz` | Liveness |
//!
//! Mutating routes honor an `x-lock-timeout-ms` header bounding how long
//! the request may wait for its cluster lock.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use capgrid_scheduler::Scheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

/// Build the complete API router.
pub fn build_router(scheduler: Arc<Scheduler>) -> Router {
    let api_state = ApiState { scheduler };

    let api_routes = Router::new()
        .route("/clusters", get(handlers::list_clusters).post(handlers::register_cluster))
        .route("/clusters/{id}/status", get(handlers::cluster_status))
        .route("/deployments", get(handlers::list_deployments).post(handlers::submit_deployment))
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .route("/deployments/{id}/complete", post(handlers::complete_deployment))
        .route("/deployments/{id}/fail", post(handlers::fail_deployment))
        .route("/deployments/{id}/dependencies", post(handlers::add_dependency))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
