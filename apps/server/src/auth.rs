//! Token minting, password verification and the authenticated-request
//! extractor.
//!
//! Access tokens are short-lived HS256 JWTs. Refresh tokens are opaque random
//! values stored hashed; rotation revokes the consumed row and reuse of a
//! revoked token is treated as a security event.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng as PasswordOsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use mailhaven_core::sync::sha256_hex;

use crate::error::{ApiError, ApiResult};
use crate::models::RefreshTokenDB;
use crate::schema::{devices, refresh_tokens};
use crate::state::AppState;

/// JWT claims for access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub device_id: String,
    pub email: String,
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub device_id: String,
    pub email: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Passwords
// ─────────────────────────────────────────────────────────────────────────────

/// Server-side hash of the client's Argon2id auth hash. The raw master
/// password never reaches this process.
pub fn hash_password(transported_hash: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut PasswordOsRng);
    Argon2::default()
        .hash_password(transported_hash.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::internal(format!("password hashing failed: {}", e)))
}

pub fn verify_password(transported_hash: &str, verifier: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(verifier) else {
        return false;
    };
    Argon2::default()
        .verify_password(transported_hash.as_bytes(), &parsed)
        .is_ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────────────

pub fn mint_access_token(
    jwt_secret: &str,
    ttl_secs: i64,
    user_id: &str,
    device_id: &str,
    email: &str,
) -> ApiResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        device_id: device_id.to_string(),
        email: email.to_string(),
        token_type: "access".to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_secs)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::internal(format!("token minting failed: {}", e)))
}

pub fn decode_access_token(jwt_secret: &str, token: &str) -> ApiResult<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::unauthorized("UNAUTHORIZED", "Invalid or expired token"))?;

    if data.claims.token_type != "access" {
        return Err(ApiError::unauthorized("UNAUTHORIZED", "Not an access token"));
    }
    Ok(data.claims)
}

/// Generate an opaque refresh token and the hash the server stores.
pub fn generate_refresh_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let hash = sha256_hex(token.as_bytes());
    (token, hash)
}

pub fn refresh_token_hash(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Insert a fresh refresh-token row for the device.
pub fn insert_refresh_token(
    conn: &mut SqliteConnection,
    user_id: &str,
    device_id: &str,
    token_hash: &str,
    ttl_days: i64,
) -> ApiResult<()> {
    let now = Utc::now();
    let row = RefreshTokenDB {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        token_hash: token_hash.to_string(),
        created_at: now.to_rfc3339(),
        expires_at: (now + Duration::days(ttl_days)).to_rfc3339(),
        revoked: 0,
    };
    diesel::insert_into(refresh_tokens::table)
        .values(&row)
        .execute(conn)?;
    Ok(())
}

/// Revoke every refresh token issued to one device.
pub fn revoke_device_tokens(
    conn: &mut SqliteConnection,
    user_id: &str,
    device_id: &str,
) -> ApiResult<usize> {
    let revoked = diesel::update(
        refresh_tokens::table
            .filter(refresh_tokens::user_id.eq(user_id))
            .filter(refresh_tokens::device_id.eq(device_id)),
    )
    .set(refresh_tokens::revoked.eq(1))
    .execute(conn)?;
    Ok(revoked)
}

// ─────────────────────────────────────────────────────────────────────────────
// Extractor
// ─────────────────────────────────────────────────────────────────────────────

fn bearer_token(parts: &Parts) -> ApiResult<String> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("UNAUTHORIZED", "Missing Authorization header"))?;
    header
        .strip_prefix("Bearer ")
        .map(|t| t.to_string())
        .ok_or_else(|| ApiError::unauthorized("UNAUTHORIZED", "Expected Bearer token"))
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = decode_access_token(&state.config.jwt_secret, &token)?;

        // Tokens minted for a revoked device are dead, whatever their expiry.
        let user_id = claims.sub.clone();
        let device_id = claims.device_id.clone();
        let active: Option<i32> = state
            .with_conn(move |conn| {
                Ok(devices::table
                    .find((&device_id, &user_id))
                    .select(devices::is_active)
                    .first::<i32>(conn)
                    .optional()?)
            })
            .await?;
        match active {
            Some(1) => Ok(AuthContext {
                user_id: claims.sub,
                device_id: claims.device_id,
                email: claims.email,
            }),
            _ => Err(ApiError::unauthorized(
                "DEVICE_REVOKED",
                "This device is no longer authorized",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies_and_rejects() {
        let verifier = hash_password("client-side-hash").unwrap();
        assert!(verify_password("client-side-hash", &verifier));
        assert!(!verify_password("wrong", &verifier));
        assert!(!verify_password("client-side-hash", "not-a-phc-string"));
    }

    #[test]
    fn access_token_round_trip() {
        let token = mint_access_token("secret", 3600, "u-1", "d-1", "a@x.com").unwrap();
        let claims = decode_access_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.device_id, "d-1");
        assert_eq!(claims.token_type, "access");

        assert!(decode_access_token("other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        // Past the validator's default leeway window.
        let token = mint_access_token("secret", -120, "u-1", "d-1", "a@x.com").unwrap();
        assert!(decode_access_token("secret", &token).is_err());
    }

    #[test]
    fn refresh_tokens_are_unique_and_hash_stably() {
        let (token_a, hash_a) = generate_refresh_token();
        let (token_b, _) = generate_refresh_token();
        assert_ne!(token_a, token_b);
        assert_eq!(hash_a, refresh_token_hash(&token_a));
    }
}
