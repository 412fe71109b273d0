//! A3 — Health endpoint. Unauthenticated liveness/readiness probe that never
//! touches the OIDC verifier, the oracle, or cookies beyond reading a single
//! readiness flag.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    oidc_ready: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        oidc_ready: state.oidc.is_ready().await,
    })
}
