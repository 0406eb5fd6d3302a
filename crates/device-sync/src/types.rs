//! Wire types for the sync service API.
//!
//! All bodies are UTF-8 JSON with snake_case keys. Unknown fields are ignored
//! on read; the server may add fields at any time.

use serde::{Deserialize, Serialize};

use mailhaven_core::sync::{ChangeOp, SyncDataType};

/// Response envelope. Success payloads live under `data`; errors carry an
/// UPPER_SNAKE code and a human message.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub code: Option<String>,
    pub message: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    /// Argon2id-derived authentication hash, base64. Never the raw password.
    pub password: String,
    /// Client-generated salts, hex. Both are non-secret.
    pub auth_salt: String,
    pub master_key_salt: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device_id: String,
}

/// Pre-login salt fetch so the client can derive the auth hash locally.
#[derive(Debug, Clone, Serialize)]
pub struct AuthParamsRequest {
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthParamsResponse {
    pub auth_salt: String,
    pub master_key_salt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSession {
    pub user: UserInfo,
    pub tokens: TokenBundle,
    /// Present on login so a fresh install can rebuild its key hierarchy.
    pub master_key_salt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub tokens: TokenBundle,
}

// ─────────────────────────────────────────────────────────────────────────────
// Delta sync
// ─────────────────────────────────────────────────────────────────────────────

/// One change in an upload batch. Ciphertext fields are absent for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeUpload {
    pub record_id: String,
    pub change_type: ChangeOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushDeltaRequest {
    pub changes: Vec<ChangeUpload>,
    pub device_id: String,
    /// LWW tiebreak timestamp for this push.
    pub client_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConflictEntry {
    pub record_id: String,
    pub server_version: i64,
    pub server_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushDeltaResponse {
    pub data_type: SyncDataType,
    pub version: i64,
    pub processed_count: usize,
    pub conflict_count: usize,
    pub conflicts: Vec<ConflictEntry>,
    pub synced_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub total_changes: Option<i64>,
    #[serde(default)]
    pub total_deleted: Option<i64>,
    pub limit: i64,
    pub offset: i64,
    pub returned_count: i64,
    pub has_more: bool,
    #[serde(default)]
    pub next_offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChange {
    pub record_id: String,
    pub encrypted_record: String,
    pub record_nonce: String,
    pub record_checksum: String,
    pub version: i64,
    pub origin_device_id: String,
    pub client_timestamp: String,
    pub server_timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTombstone {
    pub record_id: String,
    pub deleted_at: String,
    pub deleted_by_device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullDeltaResponse {
    pub data_type: SyncDataType,
    pub since: Option<String>,
    pub changes: Vec<RemoteChange>,
    pub deleted: Vec<RemoteTombstone>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletedResponse {
    pub data_type: SyncDataType,
    pub since: Option<String>,
    pub deleted: Vec<RemoteTombstone>,
    pub pagination: Pagination,
}

// ─────────────────────────────────────────────────────────────────────────────
// Devices
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_id_masked: String,
    pub device_name: String,
    pub platform: String,
    pub is_current: bool,
    pub is_active: bool,
    pub last_seen_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesResponse {
    pub total: i64,
    pub active: i64,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessResponse {
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_uploads_carry_no_ciphertext_fields() {
        let change = ChangeUpload {
            record_id: "c-001".to_string(),
            change_type: ChangeOp::Delete,
            encrypted_record: None,
            record_nonce: None,
            record_checksum: None,
        };
        let json = serde_json::to_string(&change).unwrap();
        assert!(!json.contains("encrypted_record"));
        assert!(!json.contains("record_nonce"));
        assert!(json.contains("\"change_type\":\"delete\""));
    }

    #[test]
    fn envelope_parses_unknown_fields() {
        let json = r#"{"success":true,"data":{"auth_salt":"aa","master_key_salt":"bb","future_field":1}}"#;
        let envelope: ApiEnvelope<AuthParamsResponse> = serde_json::from_str(json).unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.data.unwrap().auth_salt, "aa");
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let json = r#"{"success":false,"code":"EMAIL_EXISTS","message":"taken"}"#;
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.code.as_deref(), Some("EMAIL_EXISTS"));
    }
}
