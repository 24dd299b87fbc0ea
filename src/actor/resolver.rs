use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};

use super::token::TokenVerifier;
use super::Actor;
use crate::error::{GuardError, GuardResult};
use crate::store::AccountStore;

/// Extract the bearer token from an `Authorization` header
pub fn extract_bearer_token(headers: &HeaderMap) -> GuardResult<String> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| GuardError::unauthenticated("Missing Authorization header"))?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| GuardError::unauthenticated("Invalid Authorization header format"))?;

    match auth_str.strip_prefix("Bearer ").map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        Some(_) => Err(GuardError::unauthenticated("Empty bearer token")),
        None => Err(GuardError::unauthenticated(
            "Authorization header must use Bearer token format",
        )),
    }
}

/// Turns a bearer token into an [`Actor`] whose account is live right now.
///
/// The token proves identity only. Every call re-reads the account so that a
/// deactivated or deleted account loses access before its token expires.
#[derive(Clone)]
pub struct ActorResolver {
    verifier: Arc<dyn TokenVerifier>,
    accounts: Arc<dyn AccountStore>,
}

impl ActorResolver {
    pub fn new(verifier: Arc<dyn TokenVerifier>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { verifier, accounts }
    }

    pub async fn resolve(&self, token: &str) -> GuardResult<Actor> {
        let verified = self.verifier.verify(token).await?;
        let actor = Actor::new(verified.subject_id, verified.role);

        if !self.accounts.find_active_account(actor.id, actor.role).await? {
            tracing::warn!(
                "Actor validation failed: {} account {} not found or inactive",
                actor.role,
                actor.id
            );
            return Err(GuardError::forbidden("Account not found or inactive"));
        }

        tracing::debug!("Resolved actor {} ({})", actor.id, actor.role);
        Ok(actor)
    }

    /// Header extraction and resolution in one step
    pub async fn resolve_headers(&self, headers: &HeaderMap) -> GuardResult<Actor> {
        let token = extract_bearer_token(headers)?;
        self.resolve(&token).await
    }
}
