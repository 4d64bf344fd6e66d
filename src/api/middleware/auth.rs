use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::state::AppState,
    config::AuthConfig,
    error::{AppError, Result},
};

pub const ADMIN_ROLE: &str = "admin";

/// Bearer token claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CurrentPrincipal {
    pub id: Uuid,
    pub is_admin: bool,
    pub email: Option<String>,
}

pub fn decode_principal(token: &str, config: &AuthConfig) -> Result<CurrentPrincipal> {
    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(issuer) = &config.jwt_issuer {
        validation.set_issuer(&[issuer]);
    }

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!("Rejected bearer token: {}", e);
        AppError::Unauthorized
    })?;

    let id = Uuid::parse_str(&data.claims.sub).map_err(|_| AppError::Unauthorized)?;
    Ok(CurrentPrincipal {
        id,
        is_admin: data.claims.roles.iter().any(|r| r == ADMIN_ROLE),
        email: data.claims.email.filter(|e| !e.trim().is_empty()),
    })
}

/// Mints a token the way the identity provider does. Used by tests and
/// local tooling.
pub fn issue_token(claims: &Claims, secret: &str) -> Result<String> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

fn bearer(request: &Request) -> Result<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthorized)
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let principal = decode_principal(bearer(&request)?, &state.settings.auth)?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let principal = decode_principal(bearer(&request)?, &state.settings.auth)?;
    if !principal.is_admin {
        return Err(AppError::Forbidden);
    }
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
