use crate::state::SyncStatus;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::watch;

type StatusReceiver = watch::Receiver<SyncStatus>;

pub async fn readiness_probe(State(status): State<StatusReceiver>) -> impl IntoResponse {
    if status.borrow().last_error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::NO_CONTENT
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn sync_status(State(status): State<StatusReceiver>) -> Json<SyncStatus> {
    Json(status.borrow().clone())
}

pub fn create_app(status: StatusReceiver) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/status", get(sync_status))
        .with_state(status)
}
