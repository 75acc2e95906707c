//! Bearer-token authentication.
//!
//! Token issuance and session management live in the identity service; this
//! layer only verifies the signed token and extracts the calling account.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use sketchbench_shared::AccountId;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: Uuid,
    /// Expiry, seconds since epoch. Checked by the decoder.
    pub exp: usize,
}

/// The authenticated caller, extracted from the `Authorization` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthAccount {
    pub account_id: AccountId,
}

impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Token verification failed");
            ApiError::Unauthorized
        })?;

        Ok(AuthAccount {
            account_id: AccountId::from(data.claims.sub),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: Uuid,
        exp: usize,
    }

    fn make_token(secret: &str, sub: Uuid, exp: usize) -> String {
        encode(
            &Header::default(),
            &TestClaims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_decodes() {
        let secret = "test-secret";
        let sub = Uuid::new_v4();
        let token = make_token(secret, sub, usize::MAX / 2);

        let data = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .unwrap();

        assert_eq!(data.claims.sub, sub);
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = make_token("secret-a", Uuid::new_v4(), usize::MAX / 2);

        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret-b"),
            &Validation::default(),
        );

        assert!(result.is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let token = make_token("test-secret", Uuid::new_v4(), 1);

        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"test-secret"),
            &Validation::default(),
        );

        assert!(result.is_err());
    }
}
