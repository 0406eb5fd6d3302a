//! Database models for the sync service.

use diesel::prelude::*;
use serde::Serialize;

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserDB {
    pub id: String,
    pub email: String,
    pub password_verifier: String,
    pub auth_salt: String,
    pub master_key_salt: String,
    pub created_at: String,
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(device_id, user_id))]
#[diesel(table_name = crate::schema::devices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeviceDB {
    pub device_id: String,
    pub user_id: String,
    pub device_name: String,
    pub platform: String,
    pub created_at: String,
    pub last_seen_at: Option<String>,
    pub is_active: i32,
}

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::refresh_tokens)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RefreshTokenDB {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub token_hash: String,
    pub created_at: String,
    pub expires_at: String,
    pub revoked: i32,
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(user_id, data_type))]
#[diesel(table_name = crate::schema::sync_versions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncVersionDB {
    pub user_id: String,
    pub data_type: String,
    pub version: i64,
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Serialize)]
#[diesel(primary_key(user_id, data_type, record_id))]
#[diesel(table_name = crate::schema::sync_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRecordDB {
    pub user_id: String,
    pub data_type: String,
    pub record_id: String,
    pub encrypted_payload: String,
    pub nonce: String,
    pub checksum: String,
    pub version: i64,
    pub origin_device_id: String,
    pub client_timestamp: String,
    pub server_timestamp: String,
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone, Serialize)]
#[diesel(primary_key(user_id, data_type, record_id))]
#[diesel(table_name = crate::schema::sync_tombstones)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncTombstoneDB {
    pub user_id: String,
    pub data_type: String,
    pub record_id: String,
    pub deleted_at: String,
    pub deleted_by_device_id: String,
    pub expires_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::audit_log)]
pub struct NewAuditEntryDB {
    pub user_id: String,
    pub device_id: Option<String>,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: String,
}
