//! Per-data-type conflict resolution policy.
//!
//! The server's LWW gate decides what it stores; the client owns the final
//! local decision. Conflicts are ordinary values here, never errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{should_apply_lww, SyncDataType};

/// Primary resolution policy per data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Winner by `(client_timestamp, device_id)`.
    LastWriteWins,
    /// Field union per record, newer side wins on overlapping fields.
    SetMerge,
    /// Escalate to the user; auto-merge only when field sets don't collide.
    UserPrompted,
}

/// Resolution policy per data type.
pub fn policy_for(data_type: SyncDataType) -> ConflictPolicy {
    match data_type {
        SyncDataType::Preferences => ConflictPolicy::LastWriteWins,
        SyncDataType::Signatures => ConflictPolicy::LastWriteWins,
        SyncDataType::Contacts => ConflictPolicy::SetMerge,
        SyncDataType::Accounts => ConflictPolicy::UserPrompted,
    }
}

/// One side of a conflict, decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSide {
    /// Plaintext payload; `None` for deletes.
    pub payload: Option<Value>,
    pub client_timestamp: String,
    pub device_id: String,
}

/// A change the server rejected at the LWW gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub data_type: SyncDataType,
    pub record_id: String,
    pub server_version: i64,
    pub server_timestamp: String,
}

/// Outcome of resolving one conflicted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "payload")]
pub enum Resolution {
    /// Local side stands; the engine re-enqueues it as a fresh update.
    KeepLocal,
    /// Server side stands; the local journal entry is dropped.
    TakeServer,
    /// Merged value; re-encrypted and re-enqueued as a fresh update.
    Merged(Value),
    /// Needs a user decision; parked in the conflict queue.
    Escalate,
}

/// Resolve a conflicted record according to the data type's policy.
pub fn resolve(data_type: SyncDataType, local: &ConflictSide, server: &ConflictSide) -> Resolution {
    let server_wins = should_apply_lww(
        &local.client_timestamp,
        &local.device_id,
        &server.client_timestamp,
        &server.device_id,
    );

    match policy_for(data_type) {
        ConflictPolicy::LastWriteWins => {
            if server_wins {
                Resolution::TakeServer
            } else {
                Resolution::KeepLocal
            }
        }
        ConflictPolicy::SetMerge => match (&local.payload, &server.payload) {
            (Some(local_value), Some(server_value)) => {
                let (winner, loser) = if server_wins {
                    (server_value, local_value)
                } else {
                    (local_value, server_value)
                };
                Resolution::Merged(merge_objects(winner, loser))
            }
            // One side is a delete; fall back to pure LWW.
            _ => {
                if server_wins {
                    Resolution::TakeServer
                } else {
                    Resolution::KeepLocal
                }
            }
        },
        ConflictPolicy::UserPrompted => match (&local.payload, &server.payload) {
            (Some(local_value), Some(server_value)) => {
                if overlapping_differing_fields(local_value, server_value).is_empty() {
                    let (winner, loser) = if server_wins {
                        (server_value, local_value)
                    } else {
                        (local_value, server_value)
                    };
                    Resolution::Merged(merge_objects(winner, loser))
                } else {
                    Resolution::Escalate
                }
            }
            _ => Resolution::Escalate,
        },
    }
}

/// Field union of two JSON objects; the winner's value stands wherever both
/// sides carry the field. Non-object payloads resolve to the winner unchanged.
fn merge_objects(winner: &Value, loser: &Value) -> Value {
    let (Some(winner_map), Some(loser_map)) = (winner.as_object(), loser.as_object()) else {
        return winner.clone();
    };

    let mut merged = loser_map.clone();
    for (key, value) in winner_map {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Fields present on both sides with different, non-null values.
fn overlapping_differing_fields(a: &Value, b: &Value) -> Vec<String> {
    let (Some(a_map), Some(b_map)) = (a.as_object(), b.as_object()) else {
        return vec!["<payload>".to_string()];
    };

    let mut fields = Vec::new();
    for (key, a_value) in a_map {
        if a_value.is_null() {
            continue;
        }
        if let Some(b_value) = b_map.get(key) {
            if !b_value.is_null() && b_value != a_value {
                fields.push(key.clone());
            }
        }
    }
    fields.sort();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn side(payload: Option<Value>, ts: &str, device: &str) -> ConflictSide {
        ConflictSide {
            payload,
            client_timestamp: ts.to_string(),
            device_id: device.to_string(),
        }
    }

    #[test]
    fn policy_table_matches_data_types() {
        assert_eq!(
            policy_for(SyncDataType::Preferences),
            ConflictPolicy::LastWriteWins
        );
        assert_eq!(
            policy_for(SyncDataType::Signatures),
            ConflictPolicy::LastWriteWins
        );
        assert_eq!(policy_for(SyncDataType::Contacts), ConflictPolicy::SetMerge);
        assert_eq!(
            policy_for(SyncDataType::Accounts),
            ConflictPolicy::UserPrompted
        );
    }

    #[test]
    fn preferences_newer_server_side_wins() {
        let local = side(
            Some(json!({"theme": "light"})),
            "2026-02-06T09:55:00Z",
            "device-b",
        );
        let server = side(
            Some(json!({"theme": "dark"})),
            "2026-02-06T10:00:00Z",
            "device-a",
        );
        assert_eq!(
            resolve(SyncDataType::Preferences, &local, &server),
            Resolution::TakeServer
        );
    }

    #[test]
    fn preferences_newer_local_side_is_kept() {
        let local = side(
            Some(json!({"theme": "light"})),
            "2026-02-06T10:05:00Z",
            "device-b",
        );
        let server = side(
            Some(json!({"theme": "dark"})),
            "2026-02-06T10:00:00Z",
            "device-a",
        );
        assert_eq!(
            resolve(SyncDataType::Preferences, &local, &server),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn equal_timestamps_break_on_device_id() {
        let local = side(Some(json!({})), "2026-02-06T10:00:00Z", "device-b");
        let server = side(Some(json!({})), "2026-02-06T10:00:00Z", "device-a");
        // device-b > device-a lexicographically, so local stands.
        assert_eq!(
            resolve(SyncDataType::Signatures, &local, &server),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn contacts_merge_unions_fields_with_newer_side_winning() {
        let local = side(
            Some(json!({"email": "a@x.com", "name": "Alice", "phone": "123"})),
            "2026-02-06T10:05:00Z",
            "device-b",
        );
        let server = side(
            Some(json!({"email": "a@x.com", "name": "Alice Smith", "company": "Acme"})),
            "2026-02-06T10:00:00Z",
            "device-a",
        );

        match resolve(SyncDataType::Contacts, &local, &server) {
            Resolution::Merged(merged) => {
                assert_eq!(merged["name"], "Alice"); // newer side wins the collision
                assert_eq!(merged["phone"], "123");
                assert_eq!(merged["company"], "Acme"); // loser's extra field kept
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn contact_delete_conflict_falls_back_to_lww() {
        let local = side(None, "2026-02-06T10:05:00Z", "device-b");
        let server = side(
            Some(json!({"email": "a@x.com"})),
            "2026-02-06T10:00:00Z",
            "device-a",
        );
        assert_eq!(
            resolve(SyncDataType::Contacts, &local, &server),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn accounts_with_colliding_fields_escalate() {
        let local = side(
            Some(json!({"email": "a@x.com", "imap_host": "imap.one.com"})),
            "2026-02-06T10:05:00Z",
            "device-b",
        );
        let server = side(
            Some(json!({"email": "a@x.com", "imap_host": "imap.two.com"})),
            "2026-02-06T10:00:00Z",
            "device-a",
        );
        assert_eq!(
            resolve(SyncDataType::Accounts, &local, &server),
            Resolution::Escalate
        );
    }

    #[test]
    fn accounts_with_disjoint_changes_auto_merge() {
        let local = side(
            Some(json!({"email": "a@x.com", "display_name": "Work"})),
            "2026-02-06T10:05:00Z",
            "device-b",
        );
        let server = side(
            Some(json!({"email": "a@x.com", "smtp_port": 465})),
            "2026-02-06T10:00:00Z",
            "device-a",
        );
        match resolve(SyncDataType::Accounts, &local, &server) {
            Resolution::Merged(merged) => {
                assert_eq!(merged["display_name"], "Work");
                assert_eq!(merged["smtp_port"], 465);
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }
}
