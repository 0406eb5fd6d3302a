//! Core sync domain models: data types, journal, queue, replica and state vectors.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Days a tombstone is retained before the server (and local store) may purge it.
pub const TOMBSTONE_RETENTION_DAYS: i64 = 90;

/// Maximum number of changes in one delta upload or download page.
pub const MAX_DELTA_BATCH: usize = 1000;

/// Synchronized data categories. Each has its own encryption key and an
/// independent version line on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDataType {
    Accounts,
    Contacts,
    Preferences,
    Signatures,
}

impl SyncDataType {
    pub const ALL: [SyncDataType; 4] = [
        SyncDataType::Accounts,
        SyncDataType::Contacts,
        SyncDataType::Preferences,
        SyncDataType::Signatures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDataType::Accounts => "accounts",
            SyncDataType::Contacts => "contacts",
            SyncDataType::Preferences => "preferences",
            SyncDataType::Signatures => "signatures",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accounts" => Some(SyncDataType::Accounts),
            "contacts" => Some(SyncDataType::Contacts),
            "preferences" => Some(SyncDataType::Preferences),
            "signatures" => Some(SyncDataType::Signatures),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change operations carried by the journal and the wire protocol.
///
/// Delete carries no ciphertext fields anywhere it appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// Journal entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStatus {
    Pending,
    InFlight,
    Acked,
    Conflicted,
}

/// One local mutation awaiting upload.
///
/// `payload` is the plaintext JSON for Insert/Update and absent for Delete;
/// encryption happens when the reconciliation engine prepares the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub seq: i64,
    pub data_type: SyncDataType,
    pub record_id: String,
    pub op: ChangeOp,
    pub client_timestamp: String,
    pub payload: Option<String>,
    pub status: JournalStatus,
}

/// Offline queue actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Push,
    Pull,
}

/// Offline queue item lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Failed,
    Completed,
}

/// Durable retry state for one pending sync operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub action: QueueAction,
    pub data_type: SyncDataType,
    pub attempts: i32,
    pub next_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub created_at: String,
}

/// Per-data-type client sync metadata, updated atomically at the end of a
/// successful sync step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateVector {
    pub data_type: SyncDataType,
    pub local_version: i64,
    pub last_known_server_version: i64,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
}

impl SyncStateVector {
    pub fn empty(data_type: SyncDataType) -> Self {
        Self {
            data_type,
            local_version: 0,
            last_known_server_version: 0,
            last_sync_at: None,
            last_error: None,
        }
    }
}

/// One encrypted row in the local replica.
///
/// `encrypted_payload` and `nonce` are base64; `checksum` is lowercase 64-hex
/// SHA-256 of the ciphertext (including the AEAD tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRecord {
    pub data_type: SyncDataType,
    pub record_id: String,
    pub encrypted_payload: String,
    pub nonce: String,
    pub checksum: String,
    pub version: i64,
    pub origin_device_id: String,
    pub client_timestamp: String,
    pub server_timestamp: Option<String>,
    pub corrupt: bool,
}

/// Deletion marker propagated between devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub data_type: SyncDataType,
    pub record_id: String,
    pub deleted_at: String,
    pub deleted_by_device_id: String,
    pub expires_at: String,
}

/// Tombstone expiry: exactly `deleted_at + 90 days`.
pub fn tombstone_expires_at(deleted_at: DateTime<Utc>) -> DateTime<Utc> {
    deleted_at + Duration::days(TOMBSTONE_RETENTION_DAYS)
}

/// Lowercase 64-hex SHA-256. The integrity checksum used for every ciphertext
/// on the wire and in both stores.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Determines whether a remote change should overwrite local state.
///
/// Rule:
/// 1. higher client timestamp wins
/// 2. if equal, lexicographically greater device_id wins
pub fn should_apply_lww(
    local_client_timestamp: &str,
    local_device_id: &str,
    remote_client_timestamp: &str,
    remote_device_id: &str,
) -> bool {
    let local_parsed = chrono::DateTime::parse_from_rfc3339(local_client_timestamp)
        .map(|dt| dt.timestamp_millis());
    let remote_parsed = chrono::DateTime::parse_from_rfc3339(remote_client_timestamp)
        .map(|dt| dt.timestamp_millis());

    if let (Ok(local_ts), Ok(remote_ts)) = (local_parsed, remote_parsed) {
        if remote_ts > local_ts {
            return true;
        }
        if remote_ts == local_ts {
            return remote_device_id > local_device_id;
        }
        return false;
    }

    // Fallback to lexical ordering when one/both timestamps are non-RFC3339.
    if remote_client_timestamp > local_client_timestamp {
        return true;
    }
    if remote_client_timestamp == local_client_timestamp {
        return remote_device_id > local_device_id;
    }
    false
}

// ─────────────────────────────────────────────────────────────────────────────
// Client configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Platform identifier reported during device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(target_os = "macos")]
        return Platform::MacOS;

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        Platform::Linux
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOS => "macos",
            Platform::Linux => "linux",
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| format!("{} Device", Platform::current().as_str()))
}

/// Per-install sync configuration, persisted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub enabled: bool,
    pub user_id: Option<String>,

    /// Stable per-install UUID, generated once.
    pub device_id: String,
    pub device_name: String,
    pub platform: Platform,
    pub last_sync_at: Option<String>,

    /// Periodic interval in minutes; one of [`SYNC_INTERVALS_MINUTES`](crate::sync::SYNC_INTERVALS_MINUTES).
    pub sync_interval_minutes: u32,
    pub sync_on_startup: bool,

    pub sync_accounts: bool,
    pub sync_contacts: bool,
    pub sync_preferences: bool,
    pub sync_signatures: bool,

    /// Master key salt (32 bytes, hex). Non-secret; fetched from the server at
    /// login and cached here.
    pub master_key_salt: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
            platform: Platform::current(),
            last_sync_at: None,
            sync_interval_minutes: crate::sync::DEFAULT_SYNC_INTERVAL_MINUTES,
            sync_on_startup: true,
            sync_accounts: true,
            sync_contacts: true,
            sync_preferences: true,
            sync_signatures: true,
            master_key_salt: None,
        }
    }
}

impl SyncConfig {
    /// Whether the given data type participates in sync for this install.
    pub fn data_type_enabled(&self, data_type: SyncDataType) -> bool {
        match data_type {
            SyncDataType::Accounts => self.sync_accounts,
            SyncDataType::Contacts => self.sync_contacts,
            SyncDataType::Preferences => self.sync_preferences,
            SyncDataType::Signatures => self.sync_signatures,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status surface
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse per-data-type activity state shown in the status UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncActivityState {
    Idle,
    Syncing,
    Error,
    Conflict,
}

/// Snapshot of one data type's sync health for the status UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub data_type: SyncDataType,
    pub state: SyncActivityState,
    pub last_sync_at: Option<String>,
    pub failed_queue_items: i64,
    pub conflict_count: i64,
    pub corrupt_count: i64,
    pub last_error: Option<String>,
}
