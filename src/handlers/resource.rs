use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use super::AppState;
use crate::actor::Actor;
use crate::api::format::{resource_to_api_value, resources_to_api_values};
use crate::error::GuardError;
use crate::middleware::{ApiResponse, ApiResult};
use crate::query::ListParams;
use crate::resource::NewResource;

fn parse_id(id: &str) -> Result<Uuid, GuardError> {
    Uuid::parse_str(id).map_err(|_| GuardError::validation("Invalid UUID"))
}

/// GET /api/:resource_type - scoped, paged list
pub async fn list_resources(
    State(state): State<AppState>,
    actor: Actor,
    Path(resource_type): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let params = ListParams::from_query(query)?;
    let page = state.service.list(&actor, &resource_type, params).await?;
    let policy = state.service.policy(&resource_type)?;

    Ok(ApiResponse::success(json!({
        "pagination": page.pagination,
        "data": resources_to_api_values(policy, &page.data),
    })))
}

/// GET /api/:resource_type/:id
pub async fn get_resource(
    State(state): State<AppState>,
    actor: Actor,
    Path((resource_type, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let id = parse_id(&id)?;
    let resource = state.service.get(&actor, &resource_type, id).await?;
    let policy = state.service.policy(&resource_type)?;
    Ok(ApiResponse::success(resource_to_api_value(policy, &resource)))
}

/// POST /api/:resource_type
pub async fn create_resource(
    State(state): State<AppState>,
    actor: Actor,
    Path(resource_type): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let input: NewResource = serde_json::from_value(body)
        .map_err(|e| GuardError::validation(format!("Invalid request body: {}", e)))?;
    let created = state.service.create(&actor, &resource_type, input).await?;
    let policy = state.service.policy(&resource_type)?;
    Ok(ApiResponse::created(resource_to_api_value(policy, &created)))
}

/// PATCH /api/:resource_type/:id
pub async fn update_resource(
    State(state): State<AppState>,
    actor: Actor,
    Path((resource_type, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let id = parse_id(&id)?;
    let updated = state.service.update(&actor, &resource_type, id, body).await?;
    let policy = state.service.policy(&resource_type)?;
    Ok(ApiResponse::success(resource_to_api_value(policy, &updated)))
}

/// DELETE /api/:resource_type/:id - soft or hard per policy
pub async fn delete_resource(
    State(state): State<AppState>,
    actor: Actor,
    Path((resource_type, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let id = parse_id(&id)?;
    let deleted = state.service.delete(&actor, &resource_type, id).await?;
    let policy = state.service.policy(&resource_type)?;
    Ok(ApiResponse::success(resource_to_api_value(policy, &deleted)))
}

/// POST /api/:resource_type/:id/restore
pub async fn restore_resource(
    State(state): State<AppState>,
    actor: Actor,
    Path((resource_type, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let id = parse_id(&id)?;
    let restored = state.service.restore(&actor, &resource_type, id).await?;
    let policy = state.service.policy(&resource_type)?;
    Ok(ApiResponse::success(resource_to_api_value(policy, &restored)))
}
