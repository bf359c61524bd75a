//! Health endpoint.
//!
//! In local mode the snapshot status is surfaced verbatim so operators can
//! see when durability is degraded.

use crate::snapshot::{SnapshotStatus, StatusReporter};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Clone, Default)]
pub struct HealthState {
    snapshots: Option<StatusReporter>,
}

impl HealthState {
    /// State for a service running on the embedded local database.
    pub fn local(snapshots: StatusReporter) -> Self {
        Self {
            snapshots: Some(snapshots),
        }
    }

    /// State for a service backed by the cloud database.
    pub fn cloud() -> Self {
        Self { snapshots: None }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotStatus>,
}

pub async fn healthcheck(State(state): State<HealthState>) -> Json<HealthResponse> {
    let response = match &state.snapshots {
        Some(reporter) => HealthResponse {
            status: "ok",
            mode: "local",
            snapshot: Some(reporter.get_status()),
        },
        None => HealthResponse {
            status: "ok",
            mode: "cloud",
            snapshot: None,
        },
    };
    Json(response)
}

pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
