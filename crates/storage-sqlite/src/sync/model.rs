//! Database models for the sync tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(data_type, record_id))]
#[diesel(table_name = crate::schema::sync_replica)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ReplicaRecordDB {
    pub data_type: String,
    pub record_id: String,
    pub encrypted_payload: String,
    pub nonce: String,
    pub checksum: String,
    pub version: i64,
    pub origin_device_id: String,
    pub client_timestamp: String,
    pub server_timestamp: Option<String>,
    pub corrupt: i32,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(data_type, record_id))]
#[diesel(table_name = crate::schema::sync_tombstones)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TombstoneDB {
    pub data_type: String,
    pub record_id: String,
    pub deleted_at: String,
    pub deleted_by_device_id: String,
    pub expires_at: String,
}

#[derive(Queryable, Identifiable, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(primary_key(seq))]
#[diesel(table_name = crate::schema::sync_journal)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JournalEntryDB {
    pub seq: i64,
    pub data_type: String,
    pub record_id: String,
    pub op: String,
    pub client_timestamp: String,
    pub payload: Option<String>,
    pub status: String,
}

/// Insert form without the autoincrement column.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_journal)]
pub struct NewJournalEntryDB {
    pub data_type: String,
    pub record_id: String,
    pub op: String,
    pub client_timestamp: String,
    pub payload: Option<String>,
    pub status: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueueItemDB {
    pub id: String,
    pub action: String,
    pub data_type: String,
    pub attempts: i32,
    pub next_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(data_type))]
#[diesel(table_name = crate::schema::sync_state_vectors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct StateVectorDB {
    pub data_type: String,
    pub local_version: i64,
    pub last_known_server_version: i64,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncSettingsDB {
    pub id: i32,
    pub config: String,
    pub updated_at: String,
}

#[derive(Queryable, Identifiable, Selectable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::sync_history)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncHistoryDB {
    pub id: i64,
    pub data_type: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub pushed_count: i64,
    pub pulled_count: i64,
    pub conflict_count: i64,
    pub error: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_history)]
pub struct NewSyncHistoryDB {
    pub data_type: String,
    pub started_at: String,
    pub status: String,
}
