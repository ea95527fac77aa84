use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, injected into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(pub String);

// ── Token signing ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    /// Expiry, unix seconds.
    exp: i64,
}

/// Mint an HS256 JWT for `subject`, valid until `expires_at` (unix seconds).
pub fn sign(secret: &str, subject: &str, expires_at: i64) -> jsonwebtoken::errors::Result<String> {
    let claims = Claims {
        sub: subject.to_string(),
        exp: expires_at,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Subject of a correctly signed HS256 token that is still valid at `now`.
pub fn validate(secret: &str, token: &str, now: i64) -> Option<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    // Expiry is checked against `now` below.
    validation.validate_exp = false;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let claims = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| tracing::debug!(error = %e, "rejected token"))
        .ok()?
        .claims;

    if claims.sub.is_empty() || claims.exp <= now {
        return None;
    }
    Some(claims.sub)
}

// ── Middleware ──────────────────────────────────────────────────────

/// Require `Authorization: Bearer <token>` signed with the configured secret.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match validate_request(&state, &req) {
        Ok(subject) => {
            req.extensions_mut().insert(subject);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

fn validate_request(state: &AppState, req: &Request) -> Result<Subject, ApiError> {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let now = chrono::Utc::now().timestamp();
    validate(&state.config.token_secret, token, now)
        .map(Subject)
        .ok_or(ApiError::Unauthorized)
}
