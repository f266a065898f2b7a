//! Bearer-token validation for user-facing endpoints.
//!
//! Tokens are issued by the external session service; this crate only
//! verifies them (HS256, shared secret, issuer and audience) and exposes the
//! caller as an [`AuthUser`] extractor.

use crate::{errors::ServiceError, AppState};
use axum::{extract::FromRequestParts, http::header, http::request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ADMIN_ROLE: &str = "admin";

/// JWT claims expected from the session service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Authenticated caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    /// Owners and admins may read a resource; everyone else gets 403
    pub fn ensure_can_access(&self, owner_id: &str) -> Result<(), ServiceError> {
        if self.user_id == owner_id || self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "Resource belongs to another user".to_string(),
            ))
        }
    }

    pub fn ensure_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden("Admin role required".to_string()))
        }
    }
}

/// Validates `token` against the configured secret, issuer and audience
pub fn validate_token(
    token: &str,
    secret: &str,
    issuer: &str,
    audience: &str,
) -> Result<Claims, ServiceError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            ServiceError::Unauthorized("Token expired".to_string())
        }
        _ => {
            debug!(error = %e, "Bearer token rejected");
            ServiceError::Unauthorized("Invalid token".to_string())
        }
    })
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ServiceError::Unauthorized("Missing bearer token".to_string()))?;

        let claims = validate_token(
            token,
            &state.config.jwt_secret,
            &state.config.auth_issuer,
            &state.config.auth_audience,
        )?;

        Ok(AuthUser {
            user_id: claims.sub,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test_secret_that_is_long_enough_for_hs256_signing";

    fn token(iss: &str, aud: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "user-1".into(),
            name: None,
            email: None,
            roles: vec!["customer".into()],
            iat: now,
            exp: now + exp_offset,
            iss: iss.into(),
            aud: aud.into(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_token_for_expected_issuer_and_audience() {
        let claims =
            validate_token(&token("okpuja-auth", "okpuja-api", 600), SECRET, "okpuja-auth", "okpuja-api")
                .unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn rejects_wrong_audience_and_expired_tokens() {
        assert!(validate_token(&token("okpuja-auth", "other", 600), SECRET, "okpuja-auth", "okpuja-api").is_err());
        assert!(matches!(
            validate_token(&token("okpuja-auth", "okpuja-api", -600), SECRET, "okpuja-auth", "okpuja-api"),
            Err(ServiceError::Unauthorized(msg)) if msg == "Token expired"
        ));
    }

    #[test]
    fn owners_and_admins_can_access() {
        let user = AuthUser {
            user_id: "u-1".into(),
            email: None,
            roles: vec![],
        };
        assert!(user.ensure_can_access("u-1").is_ok());
        assert!(user.ensure_can_access("u-2").is_err());

        let admin = AuthUser {
            roles: vec![ADMIN_ROLE.into()],
            ..user
        };
        assert!(admin.ensure_can_access("u-2").is_ok());
        assert!(admin.ensure_admin().is_ok());
    }
}
