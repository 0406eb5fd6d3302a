//! Device registry endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use serde_json::json;
use tracing::info;

use crate::auth::{revoke_device_tokens, AuthContext};
use crate::error::{success, ApiError, ApiResult};
use crate::models::{DeviceDB, NewAuditEntryDB};
use crate::schema::{audit_log, devices};
use crate::state::AppState;

/// First and last four characters, the middle elided.
fn mask_device_id(device_id: &str) -> String {
    if device_id.len() <= 8 {
        return device_id.to_string();
    }
    format!("{}…{}", &device_id[..4], &device_id[device_id.len() - 4..])
}

/// GET /devices
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = auth.user_id.clone();
    let current_device = auth.device_id.clone();

    let data = state
        .with_conn(move |conn| {
            let rows: Vec<DeviceDB> = devices::table
                .filter(devices::user_id.eq(&user_id))
                .order(devices::created_at.asc())
                .load::<DeviceDB>(conn)?;

            let total = rows.len() as i64;
            let active = rows.iter().filter(|d| d.is_active == 1).count() as i64;
            let list: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    json!({
                        "device_id": row.device_id,
                        "device_id_masked": mask_device_id(&row.device_id),
                        "device_name": row.device_name,
                        "platform": row.platform,
                        "is_current": row.device_id == current_device,
                        "is_active": row.is_active == 1,
                        "last_seen_at": row.last_seen_at,
                    })
                })
                .collect();

            Ok(json!({ "total": total, "active": active, "devices": list }))
        })
        .await?;

    Ok(success(data))
}

/// DELETE /devices/{device_id}
///
/// Revocation is atomic: the device is deactivated, its refresh tokens are
/// revoked and an audit row lands, all in one transaction.
pub async fn revoke_device(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(device_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if device_id == auth.device_id {
        return Err(ApiError::bad_request(
            "CANNOT_DELETE_CURRENT_DEVICE",
            "Sign out instead of revoking the device you are using",
        ));
    }

    let user_id = auth.user_id.clone();
    let acting_device = auth.device_id.clone();
    state
        .with_conn(move |conn| {
            conn.immediate_transaction::<_, ApiError, _>(|conn| {
                let updated = diesel::update(devices::table.find((&device_id, &user_id)))
                    .set(devices::is_active.eq(0))
                    .execute(conn)?;
                if updated == 0 {
                    return Err(ApiError::not_found("DEVICE_NOT_FOUND", "No such device"));
                }

                revoke_device_tokens(conn, &user_id, &device_id)?;
                diesel::insert_into(audit_log::table)
                    .values(NewAuditEntryDB {
                        user_id: user_id.clone(),
                        device_id: Some(device_id.clone()),
                        event: "device_revoked".to_string(),
                        detail: Some(format!("revoked_by={}", acting_device)),
                        created_at: Utc::now().to_rfc3339(),
                    })
                    .execute(conn)?;
                Ok(())
            })
        })
        .await?;

    info!("device revoked");
    Ok(success(json!({ "message": "Device revoked" })))
}
