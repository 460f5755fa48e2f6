//! JWT authentication for the queue routes.
//!
//! Tokens are HS256 with `JWT_SECRET`. A token whose `role` claim is
//! `service_role` may act on any queue; any other token acts as the user in
//! `sub` and may only touch queues that user owns.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_common::error::AppError;

use crate::state::AppState;

pub const SERVICE_ROLE: &str = "service_role";

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User UUID, or an arbitrary identifier for service tokens
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Caller identity extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Parsed `sub`, when it is a UUID.
    pub user_id: Option<Uuid>,
    pub claims: Claims,
}

impl AuthUser {
    pub fn is_service(&self) -> bool {
        self.claims.role.as_deref() == Some(SERVICE_ROLE)
    }

    pub fn can_access(&self, owner_id: Uuid) -> bool {
        self.is_service() || self.user_id == Some(owner_id)
    }

    /// `Forbidden` unless the caller may act on resources of `owner_id`.
    pub fn ensure_can_access(&self, owner_id: Uuid) -> Result<(), AppError> {
        if self.can_access(owner_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Not allowed to access this queue".to_string(),
            ))
        }
    }
}

/// Encode a JWT for `sub`, optionally carrying a role.
pub fn encode_jwt(
    sub: &str,
    role: Option<&str>,
    secret: &str,
    expiry_hours: u64,
) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: sub.to_string(),
        role: role.map(str::to_string),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))?;

    Ok(token)
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

/// Extracts and validates the JWT from the `Authorization: Bearer <token>` header.
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|auth| auth.strip_prefix("Bearer "))
            .ok_or_else(|| {
                AppError::Auth(
                    "Missing or invalid Authorization header. Use 'Bearer <JWT>'".to_string(),
                )
            })?;

        let claims = decode_jwt(token, &state.config.jwt_secret)?;
        let user_id = Uuid::parse_str(&claims.sub).ok();

        if user_id.is_none() && claims.role.as_deref() != Some(SERVICE_ROLE) {
            return Err(AppError::Auth("Invalid user ID in token".to_string()));
        }

        Ok(AuthUser { user_id, claims })
    }
}
