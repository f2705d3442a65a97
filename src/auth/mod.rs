//! Authentication gate for the WebSocket endpoint.
//!
//! Token issuance (login, JWT minting, password hashing) lives in the
//! external account service; it records each issued access token as a
//! session document carrying the authenticated user id and an expiry. The
//! core validates those sessions and checks that the selected player
//! profile belongs to the same user.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::services::Storage;

const SESSION_COLLECTION: &str = "auth_sessions";

/// Authentication failures, mapped to the WebSocket close codes the client
/// understands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no player profile selected")]
    MissingProfile,
    #[error("not authenticated")]
    InvalidAccessToken,
    #[error("profile belongs to different user")]
    ProfileUserMismatch,
    #[error("player profile not found")]
    ProfileNotFound,
}

impl AuthError {
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingProfile => 4400,
            AuthError::InvalidAccessToken => 4401,
            AuthError::ProfileUserMismatch => 4403,
            AuthError::ProfileNotFound => 4404,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionDoc {
    user_id: String,
    /// RFC 3339 expiry written by the account service.
    expires_at: String,
}

/// Validates access-token sessions against the shared session store.
pub struct AuthService {
    storage: Arc<dyn Storage>,
}

impl AuthService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        AuthService { storage }
    }

    /// Resolve an access token to its authenticated user id. Unknown,
    /// malformed, or expired sessions are all invalid.
    pub async fn validate_access_token(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidAccessToken);
        }
        let doc = match self.storage.get(SESSION_COLLECTION, token).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Err(AuthError::InvalidAccessToken),
            Err(e) => {
                tracing::warn!(error = %e, "session lookup failed");
                return Err(AuthError::InvalidAccessToken);
            }
        };
        let session: SessionDoc =
            serde_json::from_value(doc).map_err(|_| AuthError::InvalidAccessToken)?;
        let expires_at = chrono::DateTime::parse_from_rfc3339(&session.expires_at)
            .map_err(|_| AuthError::InvalidAccessToken)?;
        if expires_at < chrono::Utc::now() {
            return Err(AuthError::InvalidAccessToken);
        }
        Ok(session.user_id)
    }
}

/// Parse a Cookie header into name/value pairs. Malformed fragments are
/// skipped.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for part in header.split(';') {
        if let Some((name, value)) = part.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    cookies
}
