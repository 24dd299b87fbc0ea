use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;

/// GET /health - liveness plus the number of guarded resource types
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "resource_types": state.service.registry().len(),
    }))
}
