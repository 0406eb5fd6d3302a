//! Registration, login, token refresh and logout.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::{
    generate_refresh_token, hash_password, insert_refresh_token, mint_access_token,
    refresh_token_hash, revoke_device_tokens, verify_password, AuthContext,
};
use crate::error::{success, ApiError, ApiResult};
use crate::models::{DeviceDB, NewAuditEntryDB, RefreshTokenDB, UserDB};
use crate::schema::{audit_log, devices, refresh_tokens, users};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub email: String,
    /// Client-side Argon2id hash, not the raw password.
    pub password: String,
    pub auth_salt: String,
    pub master_key_salt: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthParamsBody {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

fn validate_email(email: &str) -> ApiResult<()> {
    let ok = email.len() >= 3
        && email.len() <= 254
        && email.contains('@')
        && !email.starts_with('@')
        && !email.ends_with('@');
    if ok {
        Ok(())
    } else {
        Err(ApiError::bad_request("INVALID_EMAIL", "Invalid email address"))
    }
}

fn validate_salt(name: &str, value: &str) -> ApiResult<()> {
    let ok = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(ApiError::bad_request(
            "INVALID_SALT",
            format!("{} must be 32 bytes hex", name),
        ))
    }
}

fn write_audit(
    conn: &mut SqliteConnection,
    user_id: &str,
    device_id: Option<&str>,
    event: &str,
    detail: Option<String>,
) -> ApiResult<()> {
    diesel::insert_into(audit_log::table)
        .values(NewAuditEntryDB {
            user_id: user_id.to_string(),
            device_id: device_id.map(|d| d.to_string()),
            event: event.to_string(),
            detail,
            created_at: Utc::now().to_rfc3339(),
        })
        .execute(conn)?;
    Ok(())
}

fn token_payload(
    conn: &mut SqliteConnection,
    config: &crate::state::ServerConfig,
    user: &UserDB,
    device_id: &str,
) -> ApiResult<serde_json::Value> {
    let access_token = mint_access_token(
        &config.jwt_secret,
        config.access_token_ttl_secs,
        &user.id,
        device_id,
        &user.email,
    )?;
    let (refresh_token, token_hash) = generate_refresh_token();
    insert_refresh_token(
        conn,
        &user.id,
        device_id,
        &token_hash,
        config.refresh_token_ttl_days,
    )?;

    Ok(json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "token_type": "Bearer",
        "expires_in": config.access_token_ttl_secs,
    }))
}

/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    validate_email(&body.email)?;
    validate_salt("auth_salt", &body.auth_salt)?;
    validate_salt("master_key_salt", &body.master_key_salt)?;
    if body.password.is_empty() {
        return Err(ApiError::bad_request("INVALID_PASSWORD", "Password is required"));
    }
    if body.device_id.is_empty() {
        return Err(ApiError::bad_request("INVALID_DEVICE", "Device ID is required"));
    }

    let verifier = hash_password(&body.password)?;
    let config = state.config.clone();
    let data = state
        .with_conn(move |conn| {
            conn.immediate_transaction::<_, ApiError, _>(|conn| {
                let existing: Option<String> = users::table
                    .filter(users::email.eq(&body.email))
                    .select(users::id)
                    .first::<String>(conn)
                    .optional()?;
                if existing.is_some() {
                    return Err(ApiError::conflict("EMAIL_EXISTS", "Email is already registered"));
                }

                let now = Utc::now().to_rfc3339();
                let user = UserDB {
                    id: uuid::Uuid::new_v4().to_string(),
                    email: body.email.clone(),
                    password_verifier: verifier,
                    auth_salt: body.auth_salt.clone(),
                    master_key_salt: body.master_key_salt.clone(),
                    created_at: now.clone(),
                };
                diesel::insert_into(users::table).values(&user).execute(conn)?;

                diesel::insert_into(devices::table)
                    .values(DeviceDB {
                        device_id: body.device_id.clone(),
                        user_id: user.id.clone(),
                        device_name: body.device_name.clone(),
                        platform: body.platform.clone(),
                        created_at: now.clone(),
                        last_seen_at: Some(now),
                        is_active: 1,
                    })
                    .execute(conn)?;

                let tokens = token_payload(conn, &config, &user, &body.device_id)?;
                write_audit(conn, &user.id, Some(&body.device_id), "user_registered", None)?;

                Ok(json!({
                    "user": { "id": user.id, "email": user.email },
                    "tokens": tokens,
                    "master_key_salt": user.master_key_salt,
                }))
            })
        })
        .await?;

    info!("registered new user");
    Ok((StatusCode::CREATED, success(data)))
}

/// POST /auth/params. Salts for local auth-hash derivation.
pub async fn params(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AuthParamsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let data = state
        .with_conn(move |conn| {
            let row: Option<(String, String)> = users::table
                .filter(users::email.eq(&body.email))
                .select((users::auth_salt, users::master_key_salt))
                .first::<(String, String)>(conn)
                .optional()?;
            let (auth_salt, master_key_salt) = row
                .ok_or_else(|| ApiError::not_found("USER_NOT_FOUND", "No such account"))?;
            Ok(json!({
                "auth_salt": auth_salt,
                "master_key_salt": master_key_salt,
            }))
        })
        .await?;
    Ok(success(data))
}

/// POST /auth/login. Devices register lazily on first login from an install.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.device_id.is_empty() {
        return Err(ApiError::bad_request("INVALID_DEVICE", "Device ID is required"));
    }

    let config = state.config.clone();
    let data = state
        .with_conn(move |conn| {
            let user: Option<UserDB> = users::table
                .filter(users::email.eq(&body.email))
                .first::<UserDB>(conn)
                .optional()?;
            let Some(user) = user else {
                return Err(ApiError::unauthorized(
                    "INVALID_CREDENTIALS",
                    "Invalid email or password",
                ));
            };
            if !verify_password(&body.password, &user.password_verifier) {
                return Err(ApiError::unauthorized(
                    "INVALID_CREDENTIALS",
                    "Invalid email or password",
                ));
            }

            conn.immediate_transaction::<_, ApiError, _>(|conn| {
                let now = Utc::now().to_rfc3339();
                diesel::insert_into(devices::table)
                    .values(DeviceDB {
                        device_id: body.device_id.clone(),
                        user_id: user.id.clone(),
                        device_name: "Unnamed device".to_string(),
                        platform: "unknown".to_string(),
                        created_at: now.clone(),
                        last_seen_at: Some(now.clone()),
                        is_active: 1,
                    })
                    .on_conflict((devices::device_id, devices::user_id))
                    .do_update()
                    .set((
                        devices::last_seen_at.eq(Some(now.clone())),
                        devices::is_active.eq(1),
                    ))
                    .execute(conn)?;

                let tokens = token_payload(conn, &config, &user, &body.device_id)?;
                write_audit(conn, &user.id, Some(&body.device_id), "user_login", None)?;

                Ok(json!({
                    "user": { "id": user.id, "email": user.email },
                    "tokens": tokens,
                    "master_key_salt": user.master_key_salt,
                }))
            })
        })
        .await?;

    Ok(success(data))
}

/// POST /auth/refresh. Rotates the pair; reuse of a consumed token is a
/// security event that kills the whole device's token family.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let config = state.config.clone();
    let hash = refresh_token_hash(&body.refresh_token);

    let data = state
        .with_conn(move |conn| {
            conn.immediate_transaction::<_, ApiError, _>(|conn| {
                let row: Option<RefreshTokenDB> = refresh_tokens::table
                    .filter(refresh_tokens::token_hash.eq(&hash))
                    .first::<RefreshTokenDB>(conn)
                    .optional()?;
                let Some(row) = row else {
                    return Err(ApiError::unauthorized(
                        "INVALID_REFRESH_TOKEN",
                        "Unknown refresh token",
                    ));
                };

                if row.revoked != 0 {
                    // Reuse of a rotated token: revoke everything this device
                    // holds and log it.
                    warn!("refresh token reuse detected");
                    revoke_device_tokens(conn, &row.user_id, &row.device_id)?;
                    write_audit(
                        conn,
                        &row.user_id,
                        Some(&row.device_id),
                        "refresh_token_reuse",
                        None,
                    )?;
                    return Err(ApiError::unauthorized(
                        "REFRESH_REUSED",
                        "Refresh token was already used",
                    ));
                }
                if row.expires_at.as_str() < Utc::now().to_rfc3339().as_str() {
                    return Err(ApiError::unauthorized(
                        "REFRESH_EXPIRED",
                        "Refresh token expired",
                    ));
                }

                let user: UserDB = users::table.find(&row.user_id).first::<UserDB>(conn)?;

                diesel::update(refresh_tokens::table.find(&row.id))
                    .set(refresh_tokens::revoked.eq(1))
                    .execute(conn)?;
                let tokens = token_payload(conn, &config, &user, &row.device_id)?;

                Ok(json!({ "tokens": tokens }))
            })
        })
        .await?;

    Ok(success(data))
}

/// POST /auth/logout. Revokes the device's refresh tokens.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .with_conn(move |conn| {
            conn.immediate_transaction::<_, ApiError, _>(|conn| {
                revoke_device_tokens(conn, &auth.user_id, &auth.device_id)?;
                write_audit(conn, &auth.user_id, Some(&auth.device_id), "user_logout", None)
            })
        })
        .await?;
    Ok(success(json!({ "message": "Signed out" })))
}
