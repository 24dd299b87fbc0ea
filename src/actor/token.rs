use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Role;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("unknown role in token: {0}")]
    UnknownRole(String),

    #[error("token secret not configured")]
    MissingSecret,

    #[error("token generation error: {0}")]
    Generation(String),
}

/// JWT payload. `type` is accepted in place of `role` for older issuers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(alias = "type")]
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(subject_id: Uuid, role: Role, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject_id,
            role: role.as_str().to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }
}

/// Identity carried by a token whose signature and expiry have been checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject_id: Uuid,
    pub role: Role,
}

/// Signature/expiry verification, delegated to whatever issues the tokens
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, TokenError>;
}

/// HS256 verifier sharing a secret with the token issuer
pub struct JwtVerifier {
    secret: String,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Result<Self, TokenError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(TokenError::MissingSecret);
        }
        Ok(Self {
            secret,
            validation: Validation::default(),
        })
    }

    /// Sign claims with the shared secret. Used by issuers and tests.
    pub fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        let encoding_key = EncodingKey::from_secret(self.secret.as_bytes());
        encode(&Header::default(), claims, &encoding_key)
            .map_err(|e| TokenError::Generation(e.to_string()))
    }

    pub fn issue_for(&self, subject_id: Uuid, role: Role, ttl: Duration) -> Result<String, TokenError> {
        self.issue(&Claims::new(subject_id, role, ttl))
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, TokenError> {
        let decoding_key = DecodingKey::from_secret(self.secret.as_bytes());
        let token_data = decode::<Claims>(token, &decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            }
        })?;
        Ok(token_data.claims)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let claims = self.decode_claims(token)?;
        let role = claims.role.parse::<Role>()?;
        Ok(VerifiedToken {
            subject_id: claims.sub,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_subject_and_role() {
        let verifier = JwtVerifier::new("test-secret").unwrap();
        let id = Uuid::new_v4();
        let token = verifier.issue_for(id, Role::Recruiter, Duration::hours(1)).unwrap();

        let verified = verifier.verify(&token).await.unwrap();
        assert_eq!(verified.subject_id, id);
        assert_eq!(verified.role, Role::Recruiter);
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let verifier = JwtVerifier::new("test-secret").unwrap();
        let token = verifier
            .issue_for(Uuid::new_v4(), Role::Patient, Duration::hours(-2))
            .unwrap();

        assert!(matches!(verifier.verify(&token).await, Err(TokenError::Expired)));
    }

    #[tokio::test]
    async fn rejects_token_signed_with_other_secret() {
        let issuer = JwtVerifier::new("issuer-secret").unwrap();
        let verifier = JwtVerifier::new("verifier-secret").unwrap();
        let token = issuer.issue_for(Uuid::new_v4(), Role::Member, Duration::hours(1)).unwrap();

        assert!(matches!(verifier.verify(&token).await, Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn rejects_unknown_role() {
        let verifier = JwtVerifier::new("test-secret").unwrap();
        let mut claims = Claims::new(Uuid::new_v4(), Role::Member, Duration::hours(1));
        claims.role = "superuser".to_string();
        let token = verifier.issue(&claims).unwrap();

        assert!(matches!(verifier.verify(&token).await, Err(TokenError::UnknownRole(_))));
    }

    #[tokio::test]
    async fn accepts_type_alias_for_role() {
        let verifier = JwtVerifier::new("test-secret").unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::json!({
            "sub": id,
            "type": "patient",
            "exp": (now + Duration::hours(1)).timestamp(),
            "iat": now.timestamp(),
        });
        let token = encode(
            &Header::default(),
            &payload,
            &EncodingKey::from_secret("test-secret".as_bytes()),
        )
        .unwrap();

        let verified = verifier.verify(&token).await.unwrap();
        assert_eq!(verified.role, Role::Patient);
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(JwtVerifier::new(""), Err(TokenError::MissingSecret)));
    }
}
