use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

use crate::actor::Actor;
use crate::error::GuardError;
use crate::handlers::AppState;

/// Resolves the bearer token to a live [`Actor`] and stores it in the request
/// extensions. Runs on every protected route, so a revoked account is refused
/// on its next request.
pub async fn actor_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GuardError> {
    let actor = state.resolver.resolve_headers(request.headers()).await?;
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

/// Handlers take `actor: Actor` as an argument; the extractor only reads what
/// [`actor_middleware`] stored.
#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = GuardError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Actor>()
            .copied()
            .ok_or_else(|| GuardError::unauthenticated("Authentication required"))
    }
}
