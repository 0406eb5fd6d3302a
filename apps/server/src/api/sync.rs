//! Delta upload/download per `(user, data_type)`.
//!
//! Invariants enforced here: monotonic version counters, at-most-one
//! concurrent writer per `(user, data_type)`, opaque storage (ciphertext is
//! never interpreted), the LWW gate, per-batch atomicity, and 90-day
//! tombstone retention.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine as _;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::json;

use mailhaven_core::sync::{
    sha256_hex, should_apply_lww, ChangeOp, SyncDataType, MAX_DELTA_BATCH,
    TOMBSTONE_RETENTION_DAYS,
};

use crate::auth::AuthContext;
use crate::error::{success, ApiError, ApiResult};
use crate::models::{SyncRecordDB, SyncTombstoneDB, SyncVersionDB};
use crate::schema::{sync_records, sync_tombstones, sync_versions};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeUploadBody {
    pub record_id: String,
    pub change_type: ChangeOp,
    pub encrypted_record: Option<String>,
    pub record_nonce: Option<String>,
    pub record_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushDeltaBody {
    pub changes: Vec<ChangeUploadBody>,
    pub device_id: String,
    pub client_timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct DeltaQuery {
    pub since: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_data_type(raw: &str) -> ApiResult<SyncDataType> {
    SyncDataType::parse(raw)
        .ok_or_else(|| ApiError::bad_request("INVALID_DATA_TYPE", format!("Unknown data type '{}'", raw)))
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Validate an upload batch before touching the database: size cap, field
/// presence per change type, checksum format and checksum-over-ciphertext.
fn validate_batch(body: &PushDeltaBody) -> ApiResult<()> {
    if body.changes.len() > MAX_DELTA_BATCH {
        return Err(ApiError::bad_request(
            "BATCH_TOO_LARGE",
            format!("Batch exceeds {} changes", MAX_DELTA_BATCH),
        ));
    }
    if body.device_id.is_empty() {
        return Err(ApiError::bad_request("INVALID_DEVICE", "Device ID is required"));
    }

    for change in &body.changes {
        match change.change_type {
            ChangeOp::Delete => {}
            ChangeOp::Insert | ChangeOp::Update => {
                let (Some(payload), Some(_nonce), Some(checksum)) = (
                    change.encrypted_record.as_deref(),
                    change.record_nonce.as_deref(),
                    change.record_checksum.as_deref(),
                ) else {
                    return Err(ApiError::bad_request(
                        "VALIDATION_ERROR",
                        format!("Change for '{}' is missing ciphertext fields", change.record_id),
                    ));
                };
                if !is_sha256_hex(checksum) {
                    return Err(ApiError::bad_request(
                        "CHECKSUM_MISMATCH",
                        format!("Checksum for '{}' is not 64-hex SHA-256", change.record_id),
                    ));
                }
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .map_err(|_| {
                        ApiError::bad_request(
                            "VALIDATION_ERROR",
                            format!("Payload for '{}' is not valid base64", change.record_id),
                        )
                    })?;
                if sha256_hex(&bytes) != checksum.to_ascii_lowercase() {
                    return Err(ApiError::bad_request(
                        "CHECKSUM_MISMATCH",
                        format!("Checksum for '{}' does not match ciphertext", change.record_id),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// POST /sync/{data_type}/delta
pub async fn upload_delta(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(raw_data_type): Path<String>,
    Json(body): Json<PushDeltaBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let data_type = parse_data_type(&raw_data_type)?;
    validate_batch(&body)?;

    // One writer per (user, data_type); other pairs run in parallel.
    let lock = state.sync_lock(&auth.user_id, data_type.as_str());
    let _writer_guard = lock.lock().await;

    let user_id = auth.user_id.clone();
    let data = state
        .with_conn(move |conn| {
            conn.immediate_transaction::<_, ApiError, _>(|conn| {
                let data_type_db = data_type.as_str().to_string();
                let now = Utc::now();
                let now_str = now.to_rfc3339();

                let mut version = sync_versions::table
                    .find((&user_id, &data_type_db))
                    .select(sync_versions::version)
                    .first::<i64>(conn)
                    .optional()?
                    .unwrap_or(0);

                let mut processed = 0usize;
                let mut conflicts = Vec::new();

                for change in &body.changes {
                    match change.change_type {
                        ChangeOp::Insert | ChangeOp::Update => {
                            let existing: Option<SyncRecordDB> = sync_records::table
                                .find((&user_id, &data_type_db, &change.record_id))
                                .first::<SyncRecordDB>(conn)
                                .optional()?;

                            // LWW gate: a write whose client timestamp is
                            // older than the stored row's server timestamp
                            // never overwrites. The server clock is the
                            // authority here; origin clocks only break ties.
                            if let Some(existing) = existing.as_ref() {
                                if !should_apply_lww(
                                    &existing.server_timestamp,
                                    &existing.origin_device_id,
                                    &body.client_timestamp,
                                    &body.device_id,
                                ) {
                                    conflicts.push(json!({
                                        "record_id": change.record_id,
                                        "server_version": existing.version,
                                        "server_timestamp": existing.server_timestamp,
                                    }));
                                    continue;
                                }
                            }

                            // Insert against a younger tombstone loses too.
                            let tombstone: Option<SyncTombstoneDB> = sync_tombstones::table
                                .find((&user_id, &data_type_db, &change.record_id))
                                .first::<SyncTombstoneDB>(conn)
                                .optional()?;
                            if let Some(tombstone) = tombstone {
                                if tombstone.deleted_at.as_str() > body.client_timestamp.as_str() {
                                    conflicts.push(json!({
                                        "record_id": change.record_id,
                                        "server_version": version,
                                        "server_timestamp": tombstone.deleted_at,
                                    }));
                                    continue;
                                }
                                diesel::delete(sync_tombstones::table.find((
                                    &user_id,
                                    &data_type_db,
                                    &change.record_id,
                                )))
                                .execute(conn)?;
                            }

                            version += 1;
                            let row = SyncRecordDB {
                                user_id: user_id.clone(),
                                data_type: data_type_db.clone(),
                                record_id: change.record_id.clone(),
                                encrypted_payload: change
                                    .encrypted_record
                                    .clone()
                                    .unwrap_or_default(),
                                nonce: change.record_nonce.clone().unwrap_or_default(),
                                checksum: change
                                    .record_checksum
                                    .clone()
                                    .unwrap_or_default()
                                    .to_ascii_lowercase(),
                                version,
                                origin_device_id: body.device_id.clone(),
                                client_timestamp: body.client_timestamp.clone(),
                                server_timestamp: now_str.clone(),
                            };
                            diesel::insert_into(sync_records::table)
                                .values(&row)
                                .on_conflict((
                                    sync_records::user_id,
                                    sync_records::data_type,
                                    sync_records::record_id,
                                ))
                                .do_update()
                                .set(&row)
                                .execute(conn)?;
                            processed += 1;
                        }
                        ChangeOp::Delete => {
                            diesel::delete(sync_records::table.find((
                                &user_id,
                                &data_type_db,
                                &change.record_id,
                            )))
                            .execute(conn)?;

                            let tombstone = SyncTombstoneDB {
                                user_id: user_id.clone(),
                                data_type: data_type_db.clone(),
                                record_id: change.record_id.clone(),
                                deleted_at: now_str.clone(),
                                deleted_by_device_id: body.device_id.clone(),
                                expires_at: (now + Duration::days(TOMBSTONE_RETENTION_DAYS))
                                    .to_rfc3339(),
                            };
                            diesel::insert_into(sync_tombstones::table)
                                .values(&tombstone)
                                .on_conflict((
                                    sync_tombstones::user_id,
                                    sync_tombstones::data_type,
                                    sync_tombstones::record_id,
                                ))
                                .do_update()
                                .set(&tombstone)
                                .execute(conn)?;
                            processed += 1;
                        }
                    }
                }

                diesel::insert_into(sync_versions::table)
                    .values(SyncVersionDB {
                        user_id: user_id.clone(),
                        data_type: data_type_db.clone(),
                        version,
                    })
                    .on_conflict((sync_versions::user_id, sync_versions::data_type))
                    .do_update()
                    .set(sync_versions::version.eq(version))
                    .execute(conn)?;

                Ok(json!({
                    "data_type": data_type_db,
                    "version": version,
                    "processed_count": processed,
                    "conflict_count": conflicts.len(),
                    "conflicts": conflicts,
                    "synced_at": now_str,
                }))
            })
        })
        .await?;

    Ok(success(data))
}

fn clamp_page(query: &DeltaQuery) -> (i64, i64) {
    let limit = query
        .limit
        .unwrap_or(MAX_DELTA_BATCH as i64)
        .clamp(1, MAX_DELTA_BATCH as i64);
    let offset = query.offset.unwrap_or(0).max(0);
    (limit, offset)
}

/// GET /sync/{data_type}/delta?since&limit&offset
pub async fn download_delta(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(raw_data_type): Path<String>,
    Query(query): Query<DeltaQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let data_type = parse_data_type(&raw_data_type)?;
    let (limit, offset) = clamp_page(&query);
    let since = query.since.clone();
    let user_id = auth.user_id.clone();

    let data = state
        .with_conn(move |conn| {
            let data_type_db = data_type.as_str().to_string();
            let now = Utc::now().to_rfc3339();
            let since_bound = since.clone().unwrap_or_default();

            let total_changes: i64 = sync_records::table
                .filter(sync_records::user_id.eq(&user_id))
                .filter(sync_records::data_type.eq(&data_type_db))
                .filter(sync_records::server_timestamp.gt(&since_bound))
                .count()
                .get_result(conn)?;
            let rows: Vec<SyncRecordDB> = sync_records::table
                .filter(sync_records::user_id.eq(&user_id))
                .filter(sync_records::data_type.eq(&data_type_db))
                .filter(sync_records::server_timestamp.gt(&since_bound))
                .order((
                    sync_records::server_timestamp.asc(),
                    sync_records::record_id.asc(),
                ))
                .offset(offset)
                .limit(limit)
                .load::<SyncRecordDB>(conn)?;

            let total_deleted: i64 = sync_tombstones::table
                .filter(sync_tombstones::user_id.eq(&user_id))
                .filter(sync_tombstones::data_type.eq(&data_type_db))
                .filter(sync_tombstones::deleted_at.gt(&since_bound))
                .filter(sync_tombstones::expires_at.gt(&now))
                .count()
                .get_result(conn)?;
            let deleted: Vec<SyncTombstoneDB> = sync_tombstones::table
                .filter(sync_tombstones::user_id.eq(&user_id))
                .filter(sync_tombstones::data_type.eq(&data_type_db))
                .filter(sync_tombstones::deleted_at.gt(&since_bound))
                .filter(sync_tombstones::expires_at.gt(&now))
                .order(sync_tombstones::deleted_at.asc())
                .offset(offset)
                .limit(limit)
                .load::<SyncTombstoneDB>(conn)?;

            let returned_count = rows.len() as i64;
            let returned_deleted = deleted.len() as i64;
            let has_more = offset + returned_count < total_changes
                || offset + returned_deleted < total_deleted;

            let changes: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    json!({
                        "record_id": row.record_id,
                        "encrypted_record": row.encrypted_payload,
                        "record_nonce": row.nonce,
                        "record_checksum": row.checksum,
                        "version": row.version,
                        "origin_device_id": row.origin_device_id,
                        "client_timestamp": row.client_timestamp,
                        "server_timestamp": row.server_timestamp,
                    })
                })
                .collect();
            let deleted: Vec<serde_json::Value> = deleted
                .into_iter()
                .map(|row| {
                    json!({
                        "record_id": row.record_id,
                        "deleted_at": row.deleted_at,
                        "deleted_by_device_id": row.deleted_by_device_id,
                    })
                })
                .collect();

            Ok(json!({
                "data_type": data_type_db,
                "since": since,
                "changes": changes,
                "deleted": deleted,
                "pagination": {
                    "total_changes": total_changes,
                    "total_deleted": total_deleted,
                    "limit": limit,
                    "offset": offset,
                    "returned_count": returned_count,
                    "has_more": has_more,
                    "next_offset": if has_more { Some(offset + limit) } else { None },
                },
            }))
        })
        .await?;

    Ok(success(data))
}

/// GET /sync/{data_type}/deleted?since&limit&offset
pub async fn download_deleted(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(raw_data_type): Path<String>,
    Query(query): Query<DeltaQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let data_type = parse_data_type(&raw_data_type)?;
    let (limit, offset) = clamp_page(&query);
    let since = query.since.clone();
    let user_id = auth.user_id.clone();

    let data = state
        .with_conn(move |conn| {
            let data_type_db = data_type.as_str().to_string();
            let now = Utc::now().to_rfc3339();
            let since_bound = since.clone().unwrap_or_default();

            let total_deleted: i64 = sync_tombstones::table
                .filter(sync_tombstones::user_id.eq(&user_id))
                .filter(sync_tombstones::data_type.eq(&data_type_db))
                .filter(sync_tombstones::deleted_at.gt(&since_bound))
                .filter(sync_tombstones::expires_at.gt(&now))
                .count()
                .get_result(conn)?;
            let rows: Vec<SyncTombstoneDB> = sync_tombstones::table
                .filter(sync_tombstones::user_id.eq(&user_id))
                .filter(sync_tombstones::data_type.eq(&data_type_db))
                .filter(sync_tombstones::deleted_at.gt(&since_bound))
                .filter(sync_tombstones::expires_at.gt(&now))
                .order(sync_tombstones::deleted_at.asc())
                .offset(offset)
                .limit(limit)
                .load::<SyncTombstoneDB>(conn)?;

            let returned_count = rows.len() as i64;
            let has_more = offset + returned_count < total_deleted;
            let deleted: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    json!({
                        "record_id": row.record_id,
                        "deleted_at": row.deleted_at,
                        "deleted_by_device_id": row.deleted_by_device_id,
                    })
                })
                .collect();

            Ok(json!({
                "data_type": data_type_db,
                "since": since,
                "deleted": deleted,
                "pagination": {
                    "total_deleted": total_deleted,
                    "limit": limit,
                    "offset": offset,
                    "returned_count": returned_count,
                    "has_more": has_more,
                    "next_offset": if has_more { Some(offset + limit) } else { None },
                },
            }))
        })
        .await?;

    Ok(success(data))
}
