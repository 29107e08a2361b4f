//! Liveness probe.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::web::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = (chrono::Utc::now() - state.start_time).num_seconds();
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
    }))
}
