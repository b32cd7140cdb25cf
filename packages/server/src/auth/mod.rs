//! Capability tokens and request authorization.
//!
//! A token names one owner. It is accepted from the `Authorization: Bearer`
//! header or, for `EventSource` clients that cannot set headers, a `?token=`
//! query parameter.

pub mod jwt;

pub use jwt::{Claims, JwtService};

use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing capability token")]
    MissingToken,

    #[error("invalid capability token")]
    InvalidToken,

    #[error("token owner {token_owner} does not own this run")]
    WrongOwner { token_owner: Uuid },
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::WrongOwner { .. } => StatusCode::FORBIDDEN,
        }
    }
}

impl From<AuthError> for StatusCode {
    fn from(err: AuthError) -> Self {
        err.status_code()
    }
}

/// Extract Bearer token from Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

/// Verify a token, falling back to the Authorization header when none is given.
pub fn authenticate(
    jwt_service: &JwtService,
    token: Option<String>,
    headers: &HeaderMap,
) -> Result<Claims, AuthError> {
    let token = token
        .or_else(|| extract_bearer_token(headers))
        .ok_or(AuthError::MissingToken)?;

    jwt_service.verify_token(&token).map_err(|e| {
        debug!(error = %e, "rejected capability token");
        AuthError::InvalidToken
    })
}

/// Run-level authorization: the token must belong to the run's owner.
pub fn authorize_owner(claims: &Claims, owner_id: Uuid) -> Result<(), AuthError> {
    if claims.owner_id == owner_id {
        Ok(())
    } else {
        Err(AuthError::WrongOwner {
            token_owner: claims.owner_id,
        })
    }
}
