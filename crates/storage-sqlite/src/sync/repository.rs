//! Repository for the local sync tables.
//!
//! Reads go through the shared pool; every mutation runs on the writer actor
//! inside a single immediate transaction, which is what makes the phase
//! boundaries of the reconciliation engine atomic.

use base64::Engine as _;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use uuid::Uuid;

use mailhaven_core::errors::{DatabaseError, Error, Result};
use mailhaven_core::sync::{
    sha256_hex, ChangeOp, JournalEntry, JournalStatus, QueueAction, QueueItem, QueueStatus,
    ReplicaRecord, SyncActivityState, SyncConfig, SyncDataType, SyncRoundMetrics, SyncStateVector,
    SyncStatusReport, Tombstone,
};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{
    sync_history, sync_journal, sync_queue, sync_replica, sync_settings, sync_state_vectors,
    sync_tombstones,
};

use super::model::{
    JournalEntryDB, NewJournalEntryDB, NewSyncHistoryDB, QueueItemDB, ReplicaRecordDB,
    StateVectorDB, SyncHistoryDB, SyncSettingsDB, TombstoneDB,
};

fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

fn internal(message: impl Into<String>) -> Error {
    Error::Database(DatabaseError::Internal(message.into()))
}

/// Decode the base64 ciphertext and compare its SHA-256 against the stored
/// checksum. Returns Ok(false) on mismatch, Err on undecodable base64.
fn ciphertext_matches_checksum(encrypted_payload: &str, checksum: &str) -> Result<bool> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encrypted_payload)
        .map_err(|e| internal(format!("Replica payload is not valid base64: {}", e)))?;
    Ok(sha256_hex(&bytes) == checksum.to_ascii_lowercase())
}

fn to_replica_record(row: ReplicaRecordDB) -> Result<ReplicaRecord> {
    Ok(ReplicaRecord {
        data_type: enum_from_db(&row.data_type)?,
        record_id: row.record_id,
        encrypted_payload: row.encrypted_payload,
        nonce: row.nonce,
        checksum: row.checksum,
        version: row.version,
        origin_device_id: row.origin_device_id,
        client_timestamp: row.client_timestamp,
        server_timestamp: row.server_timestamp,
        corrupt: row.corrupt != 0,
    })
}

fn to_replica_row(record: &ReplicaRecord) -> Result<ReplicaRecordDB> {
    Ok(ReplicaRecordDB {
        data_type: enum_to_db(&record.data_type)?,
        record_id: record.record_id.clone(),
        encrypted_payload: record.encrypted_payload.clone(),
        nonce: record.nonce.clone(),
        checksum: record.checksum.to_ascii_lowercase(),
        version: record.version,
        origin_device_id: record.origin_device_id.clone(),
        client_timestamp: record.client_timestamp.clone(),
        server_timestamp: record.server_timestamp.clone(),
        corrupt: i32::from(record.corrupt),
    })
}

fn to_tombstone(row: TombstoneDB) -> Result<Tombstone> {
    Ok(Tombstone {
        data_type: enum_from_db(&row.data_type)?,
        record_id: row.record_id,
        deleted_at: row.deleted_at,
        deleted_by_device_id: row.deleted_by_device_id,
        expires_at: row.expires_at,
    })
}

fn to_journal_entry(row: JournalEntryDB) -> Result<JournalEntry> {
    Ok(JournalEntry {
        seq: row.seq,
        data_type: enum_from_db(&row.data_type)?,
        record_id: row.record_id,
        op: enum_from_db(&row.op)?,
        client_timestamp: row.client_timestamp,
        payload: row.payload,
        status: enum_from_db(&row.status)?,
    })
}

fn to_queue_item(row: QueueItemDB) -> Result<QueueItem> {
    Ok(QueueItem {
        id: row.id,
        action: enum_from_db(&row.action)?,
        data_type: enum_from_db(&row.data_type)?,
        attempts: row.attempts,
        next_attempt_at: row.next_attempt_at,
        last_error: row.last_error,
        status: enum_from_db(&row.status)?,
        created_at: row.created_at,
    })
}

fn to_state_vector(row: StateVectorDB) -> Result<SyncStateVector> {
    Ok(SyncStateVector {
        data_type: enum_from_db(&row.data_type)?,
        local_version: row.local_version,
        last_known_server_version: row.last_known_server_version,
        last_sync_at: row.last_sync_at,
        last_error: row.last_error,
    })
}

fn upsert_state_vector_tx(conn: &mut SqliteConnection, vector: &SyncStateVector) -> Result<()> {
    let row = StateVectorDB {
        data_type: enum_to_db(&vector.data_type)?,
        local_version: vector.local_version,
        last_known_server_version: vector.last_known_server_version,
        last_sync_at: vector.last_sync_at.clone(),
        last_error: vector.last_error.clone(),
    };

    diesel::insert_into(sync_state_vectors::table)
        .values(&row)
        .on_conflict(sync_state_vectors::data_type)
        .do_update()
        .set((
            sync_state_vectors::local_version.eq(row.local_version),
            sync_state_vectors::last_known_server_version.eq(row.last_known_server_version),
            sync_state_vectors::last_sync_at.eq(row.last_sync_at.clone()),
            sync_state_vectors::last_error.eq(row.last_error.clone()),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn state_vector_tx(conn: &mut SqliteConnection, data_type: SyncDataType) -> Result<SyncStateVector> {
    let row = sync_state_vectors::table
        .find(enum_to_db(&data_type)?)
        .first::<StateVectorDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    match row {
        Some(row) => to_state_vector(row),
        None => Ok(SyncStateVector::empty(data_type)),
    }
}

/// Upsert one record, enforcing the write-time invariants:
/// checksum matches ciphertext, version never regresses, and a live record
/// never coexists with a live tombstone. Returns whether the row was applied.
fn upsert_record_tx(conn: &mut SqliteConnection, record: &ReplicaRecord) -> Result<bool> {
    if !ciphertext_matches_checksum(&record.encrypted_payload, &record.checksum)? {
        return Err(internal(format!(
            "Checksum mismatch for {}/{}",
            record.data_type, record.record_id
        )));
    }

    let data_type_db = enum_to_db(&record.data_type)?;
    let existing = sync_replica::table
        .find((&data_type_db, &record.record_id))
        .first::<ReplicaRecordDB>(conn)
        .optional()
        .map_err(StorageError::from)?;

    if let Some(existing) = existing.as_ref() {
        if record.version < existing.version {
            return Err(internal(format!(
                "Version regression for {}/{}: {} -> {}",
                record.data_type, record.record_id, existing.version, record.version
            )));
        }
    }

    // Insert against a younger live tombstone loses; the deletion stands.
    let tombstone = sync_tombstones::table
        .find((&data_type_db, &record.record_id))
        .first::<TombstoneDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    if let Some(tombstone) = tombstone {
        if tombstone.deleted_at.as_str() > record.client_timestamp.as_str() {
            return Ok(false);
        }
        diesel::delete(sync_tombstones::table.find((&data_type_db, &record.record_id)))
            .execute(conn)
            .map_err(StorageError::from)?;
    }

    let row = to_replica_row(record)?;
    diesel::insert_into(sync_replica::table)
        .values(&row)
        .on_conflict((sync_replica::data_type, sync_replica::record_id))
        .do_update()
        .set(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(true)
}

/// Remove the live record and write a tombstone in the same transaction.
fn apply_tombstone_tx(conn: &mut SqliteConnection, tombstone: &Tombstone) -> Result<()> {
    let data_type_db = enum_to_db(&tombstone.data_type)?;

    diesel::delete(sync_replica::table.find((&data_type_db, &tombstone.record_id)))
        .execute(conn)
        .map_err(StorageError::from)?;

    let row = TombstoneDB {
        data_type: data_type_db,
        record_id: tombstone.record_id.clone(),
        deleted_at: tombstone.deleted_at.clone(),
        deleted_by_device_id: tombstone.deleted_by_device_id.clone(),
        expires_at: tombstone.expires_at.clone(),
    };
    diesel::insert_into(sync_tombstones::table)
        .values(&row)
        .on_conflict((sync_tombstones::data_type, sync_tombstones::record_id))
        .do_update()
        .set(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Whether the journal holds a pending Insert/Update for this record with a
/// client timestamp newer than `than_timestamp`.
fn journal_has_newer_pending_tx(
    conn: &mut SqliteConnection,
    data_type: SyncDataType,
    record_id: &str,
    than_timestamp: &str,
) -> Result<bool> {
    let count: i64 = sync_journal::table
        .filter(sync_journal::data_type.eq(enum_to_db(&data_type)?))
        .filter(sync_journal::record_id.eq(record_id))
        .filter(sync_journal::status.eq(enum_to_db(&JournalStatus::Pending)?))
        .filter(sync_journal::op.ne(enum_to_db(&ChangeOp::Delete)?))
        .filter(sync_journal::client_timestamp.gt(than_timestamp))
        .count()
        .get_result(conn)
        .map_err(StorageError::from)?;
    Ok(count > 0)
}

fn pending_entries_for_record_tx(
    conn: &mut SqliteConnection,
    data_type_db: &str,
    record_id: &str,
) -> Result<Vec<JournalEntryDB>> {
    Ok(sync_journal::table
        .filter(sync_journal::data_type.eq(data_type_db))
        .filter(sync_journal::record_id.eq(record_id))
        .filter(sync_journal::status.eq("pending"))
        .order(sync_journal::seq.asc())
        .load::<JournalEntryDB>(conn)
        .map_err(StorageError::from)?)
}

/// Append a local mutation with per-record coalescing:
/// - Update after an unsent Insert collapses into the Insert
/// - consecutive unsent Updates collapse to the latest
/// - Delete after an unsent Insert cancels the whole pair
///
/// Returns the seq of the surviving entry, or None when the mutation
/// collapsed to a local-only no-op. Only `pending` entries coalesce; in-flight
/// and conflicted entries are left alone.
fn journal_append_tx(
    conn: &mut SqliteConnection,
    data_type: SyncDataType,
    record_id: &str,
    op: ChangeOp,
    payload: Option<String>,
    client_timestamp: &str,
) -> Result<Option<i64>> {
    let data_type_db = enum_to_db(&data_type)?;
    let pending = pending_entries_for_record_tx(conn, &data_type_db, record_id)?;

    match op {
        ChangeOp::Insert => {
            let row = NewJournalEntryDB {
                data_type: data_type_db,
                record_id: record_id.to_string(),
                op: enum_to_db(&ChangeOp::Insert)?,
                client_timestamp: client_timestamp.to_string(),
                payload,
                status: enum_to_db(&JournalStatus::Pending)?,
            };
            let seq = diesel::insert_into(sync_journal::table)
                .values(&row)
                .returning(sync_journal::seq)
                .get_result::<i64>(conn)
                .map_err(StorageError::from)?;
            Ok(Some(seq))
        }
        ChangeOp::Update => {
            // Collapse into the newest unsent Insert/Update if one exists.
            if let Some(target) = pending
                .iter()
                .rev()
                .find(|entry| entry.op == "insert" || entry.op == "update")
            {
                diesel::update(sync_journal::table.find(target.seq))
                    .set((
                        sync_journal::payload.eq(payload),
                        sync_journal::client_timestamp.eq(client_timestamp),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                return Ok(Some(target.seq));
            }

            let row = NewJournalEntryDB {
                data_type: data_type_db,
                record_id: record_id.to_string(),
                op: enum_to_db(&ChangeOp::Update)?,
                client_timestamp: client_timestamp.to_string(),
                payload,
                status: enum_to_db(&JournalStatus::Pending)?,
            };
            let seq = diesel::insert_into(sync_journal::table)
                .values(&row)
                .returning(sync_journal::seq)
                .get_result::<i64>(conn)
                .map_err(StorageError::from)?;
            Ok(Some(seq))
        }
        ChangeOp::Delete => {
            let had_unsent_insert = pending.iter().any(|entry| entry.op == "insert");

            // Drop every unsent entry for the record; they're superseded.
            let pending_seqs: Vec<i64> = pending.iter().map(|entry| entry.seq).collect();
            if !pending_seqs.is_empty() {
                diesel::delete(sync_journal::table.filter(sync_journal::seq.eq_any(pending_seqs)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
            }

            // Insert-then-Delete while offline: the server never saw the
            // record, so nothing goes on the wire.
            if had_unsent_insert {
                return Ok(None);
            }

            let row = NewJournalEntryDB {
                data_type: data_type_db,
                record_id: record_id.to_string(),
                op: enum_to_db(&ChangeOp::Delete)?,
                client_timestamp: client_timestamp.to_string(),
                payload: None,
                status: enum_to_db(&JournalStatus::Pending)?,
            };
            let seq = diesel::insert_into(sync_journal::table)
                .values(&row)
                .returning(sync_journal::seq)
                .get_result::<i64>(conn)
                .map_err(StorageError::from)?;
            Ok(Some(seq))
        }
    }
}

/// A local mutation: the re-encrypted replica row (for Insert/Update) plus
/// the journal entry, applied in one transaction so the replica and the
/// upload log can never disagree.
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub data_type: SyncDataType,
    pub record_id: String,
    pub op: ChangeOp,
    /// Plaintext JSON for the journal; `None` for deletes.
    pub payload: Option<String>,
    /// Encrypted row for the replica; `None` for deletes.
    pub replica: Option<ReplicaRecord>,
    pub client_timestamp: String,
    pub device_id: String,
}

/// One downloaded remote change ready to apply.
#[derive(Debug, Clone)]
pub struct RemoteApplyBatch {
    pub data_type: SyncDataType,
    pub records: Vec<ReplicaRecord>,
    pub tombstones: Vec<Tombstone>,
}

/// Counts from applying a remote batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteApplyOutcome {
    pub applied_records: usize,
    pub applied_tombstones: usize,
    pub skipped: usize,
    pub quarantined: usize,
}

pub struct SyncRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SyncRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replica
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_record(
        &self,
        data_type: SyncDataType,
        record_id: &str,
    ) -> Result<Option<ReplicaRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_replica::table
            .find((enum_to_db(&data_type)?, record_id))
            .first::<ReplicaRecordDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(to_replica_record).transpose()
    }

    pub fn list_records(&self, data_type: SyncDataType) -> Result<Vec<ReplicaRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_replica::table
            .filter(sync_replica::data_type.eq(enum_to_db(&data_type)?))
            .order(sync_replica::record_id.asc())
            .load::<ReplicaRecordDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_replica_record).collect()
    }

    /// Records whose server timestamp is strictly newer than `since`.
    pub fn list_records_since(
        &self,
        data_type: SyncDataType,
        since: &str,
    ) -> Result<Vec<ReplicaRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_replica::table
            .filter(sync_replica::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_replica::server_timestamp.gt(since))
            .order(sync_replica::server_timestamp.asc())
            .load::<ReplicaRecordDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_replica_record).collect()
    }

    pub async fn upsert_record(&self, record: ReplicaRecord) -> Result<bool> {
        self.writer
            .exec(move |conn| upsert_record_tx(conn, &record))
            .await
    }

    /// Local delete: drops the live row and records a tombstone with the same
    /// retention semantics as the server.
    pub async fn delete_record(
        &self,
        data_type: SyncDataType,
        record_id: String,
        deleted_by_device_id: String,
    ) -> Result<Tombstone> {
        self.writer
            .exec(move |conn| {
                let deleted_at = Utc::now();
                let tombstone = Tombstone {
                    data_type,
                    record_id: record_id.clone(),
                    deleted_at: deleted_at.to_rfc3339(),
                    deleted_by_device_id,
                    expires_at: mailhaven_core::sync::tombstone_expires_at(deleted_at).to_rfc3339(),
                };
                apply_tombstone_tx(conn, &tombstone)?;
                Ok(tombstone)
            })
            .await
    }

    /// Quarantine a record that failed decryption or integrity checks.
    pub async fn mark_corrupt(&self, data_type: SyncDataType, record_id: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::update(sync_replica::table.find((enum_to_db(&data_type)?, &record_id)))
                    .set(sync_replica::corrupt.eq(1))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub fn corrupt_count(&self, data_type: SyncDataType) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(sync_replica::table
            .filter(sync_replica::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_replica::corrupt.eq(1))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tombstones
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_tombstones(&self, data_type: SyncDataType) -> Result<Vec<Tombstone>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_tombstones::table
            .filter(sync_tombstones::data_type.eq(enum_to_db(&data_type)?))
            .order(sync_tombstones::deleted_at.asc())
            .load::<TombstoneDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_tombstone).collect()
    }

    /// Purge tombstones past their retention window. Returns rows removed.
    pub async fn purge_expired_tombstones(&self) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let now = Utc::now().to_rfc3339();
                let deleted = diesel::delete(
                    sync_tombstones::table.filter(sync_tombstones::expires_at.lt(now)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(deleted)
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Change journal
    // ─────────────────────────────────────────────────────────────────────

    pub async fn journal_append(
        &self,
        data_type: SyncDataType,
        record_id: String,
        op: ChangeOp,
        payload: Option<String>,
        client_timestamp: String,
    ) -> Result<Option<i64>> {
        self.writer
            .exec(move |conn| {
                journal_append_tx(conn, data_type, &record_id, op, payload, &client_timestamp)
            })
            .await
    }

    /// Record a local mutation: materialize it in the replica (or as a local
    /// tombstone for deletes) and journal it for upload, atomically. The
    /// replica stays the authoritative copy for this device; the journal is
    /// only the upload log.
    ///
    /// Returns the seq of the surviving journal entry, or None when journal
    /// coalescing collapsed the mutation to a local-only no-op.
    pub async fn apply_local_change(&self, change: LocalChange) -> Result<Option<i64>> {
        self.writer
            .exec(move |conn| {
                match change.op {
                    ChangeOp::Insert | ChangeOp::Update => {
                        let record = change.replica.as_ref().ok_or_else(|| {
                            internal("Local insert/update is missing its replica row")
                        })?;
                        upsert_record_tx(conn, record)?;
                    }
                    ChangeOp::Delete => {
                        let deleted_at = chrono::DateTime::parse_from_rfc3339(
                            &change.client_timestamp,
                        )
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                        let tombstone = Tombstone {
                            data_type: change.data_type,
                            record_id: change.record_id.clone(),
                            deleted_at: change.client_timestamp.clone(),
                            deleted_by_device_id: change.device_id.clone(),
                            expires_at: mailhaven_core::sync::tombstone_expires_at(deleted_at)
                                .to_rfc3339(),
                        };
                        apply_tombstone_tx(conn, &tombstone)?;
                    }
                }

                journal_append_tx(
                    conn,
                    change.data_type,
                    &change.record_id,
                    change.op,
                    change.payload,
                    &change.client_timestamp,
                )
            })
            .await
    }

    /// Pending entries in seq order, capped for one upload batch.
    pub fn journal_pending(&self, data_type: SyncDataType, limit: i64) -> Result<Vec<JournalEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_journal::table
            .filter(sync_journal::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_journal::status.eq(enum_to_db(&JournalStatus::Pending)?))
            .order(sync_journal::seq.asc())
            .limit(limit)
            .load::<JournalEntryDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_journal_entry).collect()
    }

    pub fn journal_conflicted(&self, data_type: SyncDataType) -> Result<Vec<JournalEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_journal::table
            .filter(sync_journal::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_journal::status.eq(enum_to_db(&JournalStatus::Conflicted)?))
            .order(sync_journal::seq.asc())
            .load::<JournalEntryDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_journal_entry).collect()
    }

    pub async fn journal_mark_in_flight(&self, seqs: Vec<i64>) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        self.writer
            .exec(move |conn| {
                diesel::update(sync_journal::table.filter(sync_journal::seq.eq_any(seqs)))
                    .set(sync_journal::status.eq(enum_to_db(&JournalStatus::InFlight)?))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    /// Cancelled or failed round: in-flight entries return to pending so the
    /// next round retries them.
    pub async fn journal_reset_in_flight(&self, data_type: SyncDataType) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let reset = diesel::update(
                    sync_journal::table
                        .filter(sync_journal::data_type.eq(enum_to_db(&data_type)?))
                        .filter(sync_journal::status.eq(enum_to_db(&JournalStatus::InFlight)?)),
                )
                .set(sync_journal::status.eq(enum_to_db(&JournalStatus::Pending)?))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(reset)
            })
            .await
    }

    /// Upload result, applied atomically: acked entries leave the journal,
    /// their replica rows are stamped with the server's version and sync
    /// timestamp, conflicted entries are routed to the resolver, and the
    /// state vector's known server version advances — all or nothing.
    pub async fn complete_upload(
        &self,
        data_type: SyncDataType,
        acked: Vec<(i64, String)>,
        conflicted_seqs: Vec<i64>,
        new_server_version: i64,
        synced_at: String,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                if !acked.is_empty() {
                    let acked_seqs: Vec<i64> = acked.iter().map(|(seq, _)| *seq).collect();
                    diesel::delete(
                        sync_journal::table.filter(sync_journal::seq.eq_any(acked_seqs)),
                    )
                    .execute(conn)
                    .map_err(StorageError::from)?;

                    // The server assigned each accepted change a version up to
                    // the batch's final counter; stamping the final value keeps
                    // per-record comparisons monotonic (any later accepted
                    // change gets a strictly greater version).
                    let acked_ids: Vec<String> =
                        acked.into_iter().map(|(_, record_id)| record_id).collect();
                    diesel::update(
                        sync_replica::table
                            .filter(sync_replica::data_type.eq(enum_to_db(&data_type)?))
                            .filter(sync_replica::record_id.eq_any(acked_ids))
                            .filter(sync_replica::version.le(new_server_version)),
                    )
                    .set((
                        sync_replica::version.eq(new_server_version),
                        sync_replica::server_timestamp.eq(Some(synced_at)),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                }
                if !conflicted_seqs.is_empty() {
                    diesel::update(
                        sync_journal::table.filter(sync_journal::seq.eq_any(conflicted_seqs)),
                    )
                    .set(sync_journal::status.eq(enum_to_db(&JournalStatus::Conflicted)?))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                }

                let mut vector = state_vector_tx(conn, data_type)?;
                vector.last_known_server_version =
                    vector.last_known_server_version.max(new_server_version);
                vector.local_version = vector.local_version.max(new_server_version);
                upsert_state_vector_tx(conn, &vector)
            })
            .await
    }

    /// Remove journal entries consumed by conflict resolution.
    pub async fn journal_remove(&self, seqs: Vec<i64>) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        self.writer
            .exec(move |conn| {
                diesel::delete(sync_journal::table.filter(sync_journal::seq.eq_any(seqs)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub fn journal_pending_count(&self, data_type: SyncDataType) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(sync_journal::table
            .filter(sync_journal::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_journal::status.eq(enum_to_db(&JournalStatus::Pending)?))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?)
    }

    pub fn journal_conflicted_count(&self, data_type: SyncDataType) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(sync_journal::table
            .filter(sync_journal::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_journal::status.eq(enum_to_db(&JournalStatus::Conflicted)?))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Remote apply (download phase)
    // ─────────────────────────────────────────────────────────────────────

    /// Apply a page of downloaded changes in one transaction.
    ///
    /// Records apply when their version is newer than the local row (or no row
    /// exists); records flagged corrupt upstream are stored quarantined.
    /// Tombstones apply unless a newer local Insert/Update is still pending.
    pub async fn apply_remote_changes(&self, batch: RemoteApplyBatch) -> Result<RemoteApplyOutcome> {
        self.writer
            .exec(move |conn| {
                let mut outcome = RemoteApplyOutcome::default();
                let data_type_db = enum_to_db(&batch.data_type)?;

                for record in &batch.records {
                    let existing = sync_replica::table
                        .find((&data_type_db, &record.record_id))
                        .first::<ReplicaRecordDB>(conn)
                        .optional()
                        .map_err(StorageError::from)?;
                    if let Some(existing) = existing {
                        if record.version <= existing.version {
                            outcome.skipped += 1;
                            continue;
                        }
                    }

                    if record.corrupt {
                        outcome.quarantined += 1;
                    }
                    if upsert_record_tx(conn, record)? {
                        outcome.applied_records += 1;
                    } else {
                        outcome.skipped += 1;
                    }
                }

                for tombstone in &batch.tombstones {
                    if journal_has_newer_pending_tx(
                        conn,
                        batch.data_type,
                        &tombstone.record_id,
                        &tombstone.deleted_at,
                    )? {
                        outcome.skipped += 1;
                        continue;
                    }
                    apply_tombstone_tx(conn, tombstone)?;
                    outcome.applied_tombstones += 1;
                }

                Ok(outcome)
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // State vectors
    // ─────────────────────────────────────────────────────────────────────

    pub fn state_vector(&self, data_type: SyncDataType) -> Result<SyncStateVector> {
        let mut conn = get_connection(&self.pool)?;
        state_vector_tx(&mut conn, data_type)
    }

    pub async fn state_vector_set(&self, vector: SyncStateVector) -> Result<()> {
        self.writer
            .exec(move |conn| upsert_state_vector_tx(conn, &vector))
            .await
    }

    /// Final phase of a round: persist the sync point atomically.
    pub async fn commit_sync_point(
        &self,
        data_type: SyncDataType,
        last_sync_at: Option<String>,
        last_error: Option<String>,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let mut vector = state_vector_tx(conn, data_type)?;
                if let Some(at) = last_sync_at {
                    vector.last_sync_at = Some(at);
                }
                vector.last_error = last_error;
                upsert_state_vector_tx(conn, &vector)
            })
            .await
    }

    /// Full-replace fallback when the server GC watermark passed us by:
    /// drop the replica, tombstones and sync point for the data type so the
    /// next round downloads from scratch. Pending local changes survive.
    pub async fn reset_data_type(&self, data_type: SyncDataType) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let data_type_db = enum_to_db(&data_type)?;
                diesel::delete(
                    sync_replica::table.filter(sync_replica::data_type.eq(&data_type_db)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                diesel::delete(
                    sync_tombstones::table.filter(sync_tombstones::data_type.eq(&data_type_db)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;

                let mut vector = state_vector_tx(conn, data_type)?;
                vector.last_sync_at = None;
                vector.last_known_server_version = 0;
                upsert_state_vector_tx(conn, &vector)
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Offline queue
    // ─────────────────────────────────────────────────────────────────────

    /// Enqueue a push for the data type. Coalesced: at most one pending push
    /// per data type; while one is in progress a single follow-up slot is
    /// kept pending.
    pub async fn queue_enqueue_push(&self, data_type: SyncDataType) -> Result<QueueItem> {
        self.writer
            .exec(move |conn| {
                let data_type_db = enum_to_db(&data_type)?;
                let action_db = enum_to_db(&QueueAction::Push)?;

                let existing = sync_queue::table
                    .filter(sync_queue::data_type.eq(&data_type_db))
                    .filter(sync_queue::action.eq(&action_db))
                    .filter(sync_queue::status.eq(enum_to_db(&QueueStatus::Pending)?))
                    .first::<QueueItemDB>(conn)
                    .optional()
                    .map_err(StorageError::from)?;
                if let Some(existing) = existing {
                    return to_queue_item(existing);
                }

                let row = QueueItemDB {
                    id: Uuid::now_v7().to_string(),
                    action: action_db,
                    data_type: data_type_db,
                    attempts: 0,
                    next_attempt_at: None,
                    last_error: None,
                    status: enum_to_db(&QueueStatus::Pending)?,
                    created_at: Utc::now().to_rfc3339(),
                };
                diesel::insert_into(sync_queue::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                to_queue_item(row)
            })
            .await
    }

    /// Pending items whose `next_attempt_at` has passed (or was never set).
    pub fn queue_due(&self, limit: i64) -> Result<Vec<QueueItem>> {
        let mut conn = get_connection(&self.pool)?;
        let now = Utc::now().to_rfc3339();
        let rows = sync_queue::table
            .filter(sync_queue::status.eq(enum_to_db(&QueueStatus::Pending)?))
            .filter(
                sync_queue::next_attempt_at
                    .is_null()
                    .or(sync_queue::next_attempt_at.le(now)),
            )
            .order(sync_queue::created_at.asc())
            .limit(limit)
            .load::<QueueItemDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_queue_item).collect()
    }

    pub async fn queue_mark_in_progress(&self, id: String) -> Result<()> {
        self.set_queue_status(id, QueueStatus::InProgress, None, None)
            .await
    }

    pub async fn queue_complete(&self, id: String) -> Result<()> {
        self.set_queue_status(id, QueueStatus::Completed, None, None)
            .await
    }

    pub async fn queue_fail(&self, id: String, error: Option<String>) -> Result<()> {
        self.set_queue_status(id, QueueStatus::Failed, None, error)
            .await
    }

    async fn set_queue_status(
        &self,
        id: String,
        status: QueueStatus,
        next_attempt_at: Option<String>,
        last_error: Option<String>,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::update(sync_queue::table.find(&id))
                    .set((
                        sync_queue::status.eq(enum_to_db(&status)?),
                        sync_queue::next_attempt_at.eq(next_attempt_at),
                        sync_queue::last_error.eq(last_error),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    /// Schedule a retry: bump attempts, stamp the backoff deadline, return to
    /// pending.
    pub async fn queue_schedule_retry(
        &self,
        id: String,
        next_attempt_at: String,
        error: Option<String>,
    ) -> Result<QueueItem> {
        self.writer
            .exec(move |conn| {
                let row = sync_queue::table
                    .find(&id)
                    .first::<QueueItemDB>(conn)
                    .map_err(StorageError::from)?;
                diesel::update(sync_queue::table.find(&id))
                    .set((
                        sync_queue::attempts.eq(row.attempts + 1),
                        sync_queue::next_attempt_at.eq(Some(next_attempt_at)),
                        sync_queue::status.eq(enum_to_db(&QueueStatus::Pending)?),
                        sync_queue::last_error.eq(error),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                let updated = sync_queue::table
                    .find(&id)
                    .first::<QueueItemDB>(conn)
                    .map_err(StorageError::from)?;
                to_queue_item(updated)
            })
            .await
    }

    pub fn queue_failed_count(&self, data_type: SyncDataType) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        Ok(sync_queue::table
            .filter(sync_queue::data_type.eq(enum_to_db(&data_type)?))
            .filter(sync_queue::status.eq(enum_to_db(&QueueStatus::Failed)?))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Config, history, status
    // ─────────────────────────────────────────────────────────────────────

    pub fn load_sync_config(&self) -> Result<Option<SyncConfig>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_settings::table
            .find(1)
            .first::<SyncSettingsDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(|r| Ok(serde_json::from_str(&r.config)?)).transpose()
    }

    pub async fn save_sync_config(&self, config: SyncConfig) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let row = SyncSettingsDB {
                    id: 1,
                    config: serde_json::to_string(&config)?,
                    updated_at: Utc::now().to_rfc3339(),
                };
                diesel::insert_into(sync_settings::table)
                    .values(&row)
                    .on_conflict(sync_settings::id)
                    .do_update()
                    .set((
                        sync_settings::config.eq(row.config.clone()),
                        sync_settings::updated_at.eq(row.updated_at.clone()),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub async fn history_begin(&self, data_type: SyncDataType) -> Result<i64> {
        self.writer
            .exec(move |conn| {
                let row = NewSyncHistoryDB {
                    data_type: enum_to_db(&data_type)?,
                    started_at: Utc::now().to_rfc3339(),
                    status: "running".to_string(),
                };
                let id = diesel::insert_into(sync_history::table)
                    .values(&row)
                    .returning(sync_history::id)
                    .get_result::<i64>(conn)
                    .map_err(StorageError::from)?;
                Ok(id)
            })
            .await
    }

    pub async fn history_finish(
        &self,
        id: i64,
        metrics: SyncRoundMetrics,
        error: Option<String>,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::update(sync_history::table.find(id))
                    .set((
                        sync_history::finished_at.eq(Some(Utc::now().to_rfc3339())),
                        sync_history::status.eq(metrics.status.clone()),
                        sync_history::pushed_count.eq(metrics.pushed_count as i64),
                        sync_history::pulled_count.eq(metrics.pulled_count as i64),
                        sync_history::conflict_count.eq(metrics.conflict_count as i64),
                        sync_history::error.eq(error),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub fn recent_history(&self, limit: i64) -> Result<Vec<SyncHistoryDB>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(sync_history::table
            .order(sync_history::id.desc())
            .limit(limit)
            .load::<SyncHistoryDB>(&mut conn)
            .map_err(StorageError::from)?)
    }

    /// Status UI snapshot for one data type.
    pub fn status_report(
        &self,
        data_type: SyncDataType,
        state: SyncActivityState,
    ) -> Result<SyncStatusReport> {
        let vector = self.state_vector(data_type)?;
        Ok(SyncStatusReport {
            data_type,
            state,
            last_sync_at: vector.last_sync_at,
            failed_queue_items: self.queue_failed_count(data_type)?,
            conflict_count: self.journal_conflicted_count(data_type)?,
            corrupt_count: self.corrupt_count(data_type)?,
            last_error: vector.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use tempfile::tempdir;

    use crate::db::{create_pool, get_connection, init, run_migrations, spawn_writer};

    fn setup_db() -> (Arc<DbPool>, WriteHandle) {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        (pool, writer)
    }

    fn repo() -> SyncRepository {
        let (pool, writer) = setup_db();
        SyncRepository::new(pool, writer)
    }

    fn encrypted(record_id: &str, version: i64, client_ts: &str) -> ReplicaRecord {
        let ciphertext = format!("ciphertext-{}", record_id).into_bytes();
        ReplicaRecord {
            data_type: SyncDataType::Contacts,
            record_id: record_id.to_string(),
            encrypted_payload: base64::engine::general_purpose::STANDARD.encode(&ciphertext),
            nonce: base64::engine::general_purpose::STANDARD.encode([7u8; 12]),
            checksum: sha256_hex(&ciphertext),
            version,
            origin_device_id: "device-1".to_string(),
            client_timestamp: client_ts.to_string(),
            server_timestamp: Some(client_ts.to_string()),
            corrupt: false,
        }
    }

    #[tokio::test]
    async fn creates_sync_foundation_tables() {
        let (pool, _writer) = setup_db();
        let mut conn = get_connection(&pool).expect("conn");
        for table in [
            "sync_replica",
            "sync_tombstones",
            "sync_journal",
            "sync_queue",
            "sync_state_vectors",
            "sync_settings",
            "sync_history",
        ] {
            let sql = format!(
                "SELECT COUNT(*) as c FROM sqlite_master WHERE type='table' AND name='{}'",
                table
            );
            #[derive(diesel::QueryableByName)]
            struct CountRow {
                #[diesel(sql_type = diesel::sql_types::BigInt)]
                c: i64,
            }
            let row = diesel::sql_query(sql)
                .get_result::<CountRow>(&mut conn)
                .expect("table exists");
            assert_eq!(row.c, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn upsert_rejects_checksum_mismatch() {
        let repo = repo();
        let mut record = encrypted("c-001", 1, "2026-02-06T10:00:00Z");
        record.checksum = "0".repeat(64);

        let result = repo.upsert_record(record).await;
        assert!(result.is_err(), "expected checksum rejection");
        assert!(repo
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn upsert_rejects_version_regression() {
        let repo = repo();
        repo.upsert_record(encrypted("c-001", 3, "2026-02-06T10:00:00Z"))
            .await
            .unwrap();

        let stale = encrypted("c-001", 2, "2026-02-06T10:05:00Z");
        assert!(repo.upsert_record(stale).await.is_err());

        let current = repo
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 3);
    }

    #[tokio::test]
    async fn live_record_and_tombstone_never_coexist() {
        let repo = repo();
        repo.upsert_record(encrypted("c-001", 1, "2026-02-06T10:00:00Z"))
            .await
            .unwrap();

        let tombstone = repo
            .delete_record(
                SyncDataType::Contacts,
                "c-001".to_string(),
                "device-1".to_string(),
            )
            .await
            .unwrap();
        assert!(repo
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .is_none());
        let deleted_at = tombstone
            .deleted_at
            .parse::<chrono::DateTime<Utc>>()
            .unwrap();
        let expires_at = tombstone
            .expires_at
            .parse::<chrono::DateTime<Utc>>()
            .unwrap();
        assert_eq!(expires_at - deleted_at, chrono::Duration::days(90));

        // Insert with a client timestamp older than the deletion loses.
        let stale_insert = encrypted("c-001", 2, "2020-01-01T00:00:00Z");
        assert!(!repo.upsert_record(stale_insert).await.unwrap());

        // A genuinely newer insert clears the tombstone and lands.
        let future_ts = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let fresh_insert = encrypted("c-001", 2, &future_ts);
        assert!(repo.upsert_record(fresh_insert).await.unwrap());
        assert!(repo
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .is_some());
        assert!(repo.list_tombstones(SyncDataType::Contacts).unwrap().is_empty());
    }

    #[tokio::test]
    async fn journal_insert_update_delete_collapses_to_nothing() {
        let repo = repo();
        repo.journal_append(
            SyncDataType::Contacts,
            "c-001".to_string(),
            ChangeOp::Insert,
            Some("{\"v\":1}".to_string()),
            "2026-02-06T10:00:00Z".to_string(),
        )
        .await
        .unwrap()
        .expect("insert appended");
        repo.journal_append(
            SyncDataType::Contacts,
            "c-001".to_string(),
            ChangeOp::Update,
            Some("{\"v\":2}".to_string()),
            "2026-02-06T10:01:00Z".to_string(),
        )
        .await
        .unwrap();
        repo.journal_append(
            SyncDataType::Contacts,
            "c-001".to_string(),
            ChangeOp::Update,
            Some("{\"v\":3}".to_string()),
            "2026-02-06T10:02:00Z".to_string(),
        )
        .await
        .unwrap();

        // Still one entry: the original Insert carrying the latest payload.
        let pending = repo.journal_pending(SyncDataType::Contacts, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, ChangeOp::Insert);
        assert_eq!(pending[0].payload.as_deref(), Some("{\"v\":3}"));
        assert_eq!(pending[0].client_timestamp, "2026-02-06T10:02:00Z");

        // Deleting a never-acked insert is a local no-op.
        let seq = repo
            .journal_append(
                SyncDataType::Contacts,
                "c-001".to_string(),
                ChangeOp::Delete,
                None,
                "2026-02-06T10:03:00Z".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(seq, None);
        assert!(repo
            .journal_pending(SyncDataType::Contacts, 100)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn journal_delete_after_acked_insert_emits_delete() {
        let repo = repo();
        // Update without a pending insert models an already-acked record.
        repo.journal_append(
            SyncDataType::Contacts,
            "c-002".to_string(),
            ChangeOp::Update,
            Some("{}".to_string()),
            "2026-02-06T10:00:00Z".to_string(),
        )
        .await
        .unwrap();
        let seq = repo
            .journal_append(
                SyncDataType::Contacts,
                "c-002".to_string(),
                ChangeOp::Delete,
                None,
                "2026-02-06T10:01:00Z".to_string(),
            )
            .await
            .unwrap();
        assert!(seq.is_some());

        let pending = repo.journal_pending(SyncDataType::Contacts, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, ChangeOp::Delete);
        assert!(pending[0].payload.is_none());
    }

    #[tokio::test]
    async fn journal_delete_then_insert_is_a_recreation() {
        let repo = repo();
        repo.journal_append(
            SyncDataType::Contacts,
            "c-003".to_string(),
            ChangeOp::Update,
            Some("{}".to_string()),
            "2026-02-06T10:00:00Z".to_string(),
        )
        .await
        .unwrap();
        repo.journal_append(
            SyncDataType::Contacts,
            "c-003".to_string(),
            ChangeOp::Delete,
            None,
            "2026-02-06T10:01:00Z".to_string(),
        )
        .await
        .unwrap();
        repo.journal_append(
            SyncDataType::Contacts,
            "c-003".to_string(),
            ChangeOp::Insert,
            Some("{\"fresh\":true}".to_string()),
            "2026-02-06T10:02:00Z".to_string(),
        )
        .await
        .unwrap();

        let pending = repo.journal_pending(SyncDataType::Contacts, 100).unwrap();
        let ops: Vec<ChangeOp> = pending.iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![ChangeOp::Delete, ChangeOp::Insert]);
    }

    #[tokio::test]
    async fn in_flight_entries_do_not_coalesce_and_reset_to_pending() {
        let repo = repo();
        let seq = repo
            .journal_append(
                SyncDataType::Preferences,
                "preferences".to_string(),
                ChangeOp::Update,
                Some("{\"theme\":\"dark\"}".to_string()),
                "2026-02-06T10:00:00Z".to_string(),
            )
            .await
            .unwrap()
            .unwrap();
        repo.journal_mark_in_flight(vec![seq]).await.unwrap();

        // A new update while one is in flight appends instead of coalescing.
        repo.journal_append(
            SyncDataType::Preferences,
            "preferences".to_string(),
            ChangeOp::Update,
            Some("{\"theme\":\"light\"}".to_string()),
            "2026-02-06T10:01:00Z".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(
            repo.journal_pending_count(SyncDataType::Preferences).unwrap(),
            1
        );

        // Cancelled round: the in-flight entry returns to pending.
        let reset = repo
            .journal_reset_in_flight(SyncDataType::Preferences)
            .await
            .unwrap();
        assert_eq!(reset, 1);
        assert_eq!(
            repo.journal_pending_count(SyncDataType::Preferences).unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn complete_upload_acks_conflicts_and_advances_vector_atomically() {
        let repo = repo();
        // Locally materialized row awaiting its server stamp.
        repo.upsert_record(encrypted("c-001", 0, "2026-02-06T10:00:00Z"))
            .await
            .unwrap();
        let s1 = repo
            .journal_append(
                SyncDataType::Contacts,
                "c-001".to_string(),
                ChangeOp::Update,
                Some("{}".to_string()),
                "2026-02-06T10:00:00Z".to_string(),
            )
            .await
            .unwrap()
            .unwrap();
        let s2 = repo
            .journal_append(
                SyncDataType::Contacts,
                "c-002".to_string(),
                ChangeOp::Update,
                Some("{}".to_string()),
                "2026-02-06T10:00:00Z".to_string(),
            )
            .await
            .unwrap()
            .unwrap();

        repo.complete_upload(
            SyncDataType::Contacts,
            vec![(s1, "c-001".to_string())],
            vec![s2],
            7,
            "2026-02-06T10:00:05Z".to_string(),
        )
        .await
        .unwrap();

        assert_eq!(repo.journal_pending_count(SyncDataType::Contacts).unwrap(), 0);
        let conflicted = repo.journal_conflicted(SyncDataType::Contacts).unwrap();
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].record_id, "c-002");

        // The acked row carries the server's version and sync timestamp now.
        let record = repo
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 7);
        assert_eq!(
            record.server_timestamp.as_deref(),
            Some("2026-02-06T10:00:05Z")
        );

        let vector = repo.state_vector(SyncDataType::Contacts).unwrap();
        assert_eq!(vector.last_known_server_version, 7);
    }

    #[tokio::test]
    async fn local_change_materializes_replica_and_journal_together() {
        let repo = repo();
        let record = encrypted("c-100", 0, "2026-02-06T10:00:00Z");
        let seq = repo
            .apply_local_change(LocalChange {
                data_type: SyncDataType::Contacts,
                record_id: "c-100".to_string(),
                op: ChangeOp::Insert,
                payload: Some("{\"email\":\"a@x.com\"}".to_string()),
                replica: Some(record.clone()),
                client_timestamp: "2026-02-06T10:00:00Z".to_string(),
                device_id: "device-1".to_string(),
            })
            .await
            .unwrap();
        assert!(seq.is_some());

        // The unsynced edit is already readable from the replica.
        let stored = repo
            .get_record(SyncDataType::Contacts, "c-100")
            .unwrap()
            .unwrap();
        assert_eq!(stored.encrypted_payload, record.encrypted_payload);
        assert_eq!(repo.journal_pending_count(SyncDataType::Contacts).unwrap(), 1);

        // Deleting it removes the row, records a tombstone and collapses the
        // never-acked journal pair to nothing.
        let seq = repo
            .apply_local_change(LocalChange {
                data_type: SyncDataType::Contacts,
                record_id: "c-100".to_string(),
                op: ChangeOp::Delete,
                payload: None,
                replica: None,
                client_timestamp: "2026-02-06T10:01:00Z".to_string(),
                device_id: "device-1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(seq, None);
        assert!(repo
            .get_record(SyncDataType::Contacts, "c-100")
            .unwrap()
            .is_none());
        assert_eq!(repo.journal_pending_count(SyncDataType::Contacts).unwrap(), 0);
        let tombstones = repo.list_tombstones(SyncDataType::Contacts).unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].record_id, "c-100");
    }

    #[tokio::test]
    async fn apply_remote_changes_honors_version_guard_and_pending_edits() {
        let repo = repo();
        repo.upsert_record(encrypted("c-001", 2, "2026-02-06T10:00:00Z"))
            .await
            .unwrap();

        // A pending local edit newer than the tombstone protects the record.
        repo.journal_append(
            SyncDataType::Contacts,
            "c-002".to_string(),
            ChangeOp::Update,
            Some("{}".to_string()),
            "2026-02-06T11:00:00Z".to_string(),
        )
        .await
        .unwrap();
        repo.upsert_record(encrypted("c-002", 1, "2026-02-06T09:00:00Z"))
            .await
            .unwrap();

        let batch = RemoteApplyBatch {
            data_type: SyncDataType::Contacts,
            records: vec![
                encrypted("c-001", 1, "2026-02-06T09:00:00Z"), // stale version
                encrypted("c-003", 1, "2026-02-06T10:30:00Z"), // new record
            ],
            tombstones: vec![Tombstone {
                data_type: SyncDataType::Contacts,
                record_id: "c-002".to_string(),
                deleted_at: "2026-02-06T10:30:00Z".to_string(),
                deleted_by_device_id: "device-2".to_string(),
                expires_at: "2026-05-07T10:30:00Z".to_string(),
            }],
        };

        let outcome = repo.apply_remote_changes(batch).await.unwrap();
        assert_eq!(outcome.applied_records, 1);
        assert_eq!(outcome.applied_tombstones, 0);
        assert_eq!(outcome.skipped, 2);

        // c-001 kept its newer local version; c-002 survived the tombstone.
        assert_eq!(
            repo.get_record(SyncDataType::Contacts, "c-001")
                .unwrap()
                .unwrap()
                .version,
            2
        );
        assert!(repo
            .get_record(SyncDataType::Contacts, "c-002")
            .unwrap()
            .is_some());
        assert!(repo
            .get_record(SyncDataType::Contacts, "c-003")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn queue_coalesces_one_pending_push_per_data_type() {
        let repo = repo();
        let first = repo
            .queue_enqueue_push(SyncDataType::Accounts)
            .await
            .unwrap();
        let second = repo
            .queue_enqueue_push(SyncDataType::Accounts)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        // A different data type gets its own slot.
        let other = repo
            .queue_enqueue_push(SyncDataType::Contacts)
            .await
            .unwrap();
        assert_ne!(first.id, other.id);

        // While one is in progress, a follow-up slot is created once.
        repo.queue_mark_in_progress(first.id.clone()).await.unwrap();
        let follow_up = repo
            .queue_enqueue_push(SyncDataType::Accounts)
            .await
            .unwrap();
        assert_ne!(follow_up.id, first.id);
        let again = repo
            .queue_enqueue_push(SyncDataType::Accounts)
            .await
            .unwrap();
        assert_eq!(follow_up.id, again.id);
    }

    #[tokio::test]
    async fn queue_retry_bumps_attempts_and_defers() {
        let repo = repo();
        let item = repo
            .queue_enqueue_push(SyncDataType::Contacts)
            .await
            .unwrap();

        let deadline = (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
        let updated = repo
            .queue_schedule_retry(item.id.clone(), deadline.clone(), Some("HTTP 503".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.next_attempt_at.as_deref(), Some(deadline.as_str()));
        assert_eq!(updated.status, QueueStatus::Pending);

        // Deferred items are not due yet.
        assert!(repo.queue_due(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_tombstones_are_purged() {
        let repo = repo();
        repo.upsert_record(encrypted("c-old", 1, "2020-01-01T00:00:00Z"))
            .await
            .unwrap();
        repo.delete_record(
            SyncDataType::Contacts,
            "c-old".to_string(),
            "device-1".to_string(),
        )
        .await
        .unwrap();

        // Fresh tombstone: not purged.
        assert_eq!(repo.purge_expired_tombstones().await.unwrap(), 0);

        // Force expiry into the past and purge again.
        let batch = RemoteApplyBatch {
            data_type: SyncDataType::Contacts,
            records: vec![],
            tombstones: vec![Tombstone {
                data_type: SyncDataType::Contacts,
                record_id: "c-old".to_string(),
                deleted_at: "2020-01-01T00:00:00Z".to_string(),
                deleted_by_device_id: "device-1".to_string(),
                expires_at: "2020-03-31T00:00:00Z".to_string(),
            }],
        };
        repo.apply_remote_changes(batch).await.unwrap();
        assert_eq!(repo.purge_expired_tombstones().await.unwrap(), 1);
        assert!(repo.list_tombstones(SyncDataType::Contacts).unwrap().is_empty());
    }

    #[tokio::test]
    async fn quarantined_records_are_flagged_and_counted() {
        let repo = repo();
        repo.upsert_record(encrypted("c-001", 1, "2026-02-06T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(repo.corrupt_count(SyncDataType::Contacts).unwrap(), 0);

        repo.mark_corrupt(SyncDataType::Contacts, "c-001".to_string())
            .await
            .unwrap();
        let record = repo
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert!(record.corrupt);
        assert_eq!(repo.corrupt_count(SyncDataType::Contacts).unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_config_round_trips_through_settings() {
        let repo = repo();
        assert!(repo.load_sync_config().unwrap().is_none());

        let mut config = SyncConfig::default();
        config.enabled = true;
        config.sync_interval_minutes = 60;
        config.sync_signatures = false;
        repo.save_sync_config(config.clone()).await.unwrap();

        let loaded = repo.load_sync_config().unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn status_report_counts_failures_and_conflicts() {
        let repo = repo();
        let item = repo
            .queue_enqueue_push(SyncDataType::Contacts)
            .await
            .unwrap();
        repo.queue_fail(item.id, Some("HTTP 400".to_string()))
            .await
            .unwrap();

        let seq = repo
            .journal_append(
                SyncDataType::Contacts,
                "c-001".to_string(),
                ChangeOp::Update,
                Some("{}".to_string()),
                "2026-02-06T10:00:00Z".to_string(),
            )
            .await
            .unwrap()
            .unwrap();
        repo.complete_upload(
            SyncDataType::Contacts,
            vec![],
            vec![seq],
            1,
            "2026-02-06T10:00:05Z".to_string(),
        )
        .await
        .unwrap();

        let report = repo
            .status_report(SyncDataType::Contacts, SyncActivityState::Conflict)
            .unwrap();
        assert_eq!(report.failed_queue_items, 1);
        assert_eq!(report.conflict_count, 1);
        assert_eq!(report.state, SyncActivityState::Conflict);
    }

    #[tokio::test]
    async fn history_records_round_outcome() {
        let repo = repo();
        let id = repo.history_begin(SyncDataType::Accounts).await.unwrap();
        repo.history_finish(
            id,
            SyncRoundMetrics {
                pushed_count: 3,
                pulled_count: 2,
                conflict_count: 1,
                duration_ms: 120,
                status: "ok".to_string(),
            },
            None,
        )
        .await
        .unwrap();

        let history = repo.recent_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "ok");
        assert_eq!(history[0].pushed_count, 3);
        assert!(history[0].finished_at.is_some());
    }
}
