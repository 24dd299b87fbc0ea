// handlers/mod.rs - routes for the guarded resource API
//
// Public:    GET /health
// Protected: /api/:resource_type[/:id[/restore]], actor resolved per request
pub mod health;
pub mod resource;

use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::actor::ActorResolver;
use crate::config::SecurityConfig;
use crate::middleware::actor_middleware;
use crate::service::ResourceService;

/// Shared handles for every request
#[derive(Clone)]
pub struct AppState {
    pub resolver: ActorResolver,
    pub service: ResourceService,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/:resource_type",
            get(resource::list_resources).post(resource::create_resource),
        )
        .route(
            "/api/:resource_type/:id",
            get(resource::get_resource)
                .patch(resource::update_resource)
                .delete(resource::delete_resource),
        )
        .route("/api/:resource_type/:id/restore", post(resource::restore_resource))
        .route_layer(from_fn_with_state(state.clone(), actor_middleware));

    Router::new()
        .route("/health", get(health::health))
        .merge(protected)
        .with_state(state)
}

/// CORS from the security section. `*` allows any origin; entries that are
/// not valid header values are skipped with a warning.
pub fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if !security.enable_cors {
        return CorsLayer::new();
    }
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if security.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = security
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
