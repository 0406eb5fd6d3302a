//! Reconciliation engine: plans and executes sync rounds.
//!
//! A round for one data type is an explicit phase machine
//! (Prepare, Upload, HandleConflicts, Download, Apply, Commit),
//! cancellable between phases, never within. Conflicts are routed to the
//! per-data-type policy; nothing throws across a phase boundary, every
//! outcome is a structured result.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::Mutex;

use mailhaven_core::sync::{
    queue_backoff_seconds, resolve, tombstone_expires_at, ChangeOp, ConflictSide, QueueAction,
    Resolution, ReplicaRecord, SyncActivityState, SyncConfig, SyncDataType, SyncRetryClass,
    SyncRoundMetrics, SyncStatusReport, Tombstone, MAX_DELTA_BATCH,
    QUEUE_PERMANENT_FAILURE_LIMIT, TOMBSTONE_RETENTION_DAYS,
};
use mailhaven_storage_sqlite::sync::{LocalChange, RemoteApplyBatch, SyncRepository};

use crate::client::SyncApiClient;
use crate::crypto::KeyChain;
use crate::error::{DeviceSyncError, Result};
use crate::types::{ChangeUpload, PushDeltaRequest, RemoteChange, RemoteTombstone};

/// Outcome of one data type's sync round.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRoundResult {
    pub data_type: SyncDataType,
    pub status: String,
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub conflict_count: usize,
    pub duration_ms: i64,
}

impl SyncRoundResult {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Outcome of a full sync pass over all enabled data types.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub status: String,
    pub rounds: Vec<SyncRoundResult>,
}

/// Tracks progress through one round and renders failures as structured
/// results instead of errors.
struct RoundContext {
    data_type: SyncDataType,
    started_at: std::time::Instant,
    pushed_count: usize,
    pulled_count: usize,
    conflict_count: usize,
}

impl RoundContext {
    fn new(data_type: SyncDataType) -> Self {
        Self {
            data_type,
            started_at: std::time::Instant::now(),
            pushed_count: 0,
            pulled_count: 0,
            conflict_count: 0,
        }
    }

    fn result(&self, status: &str) -> SyncRoundResult {
        SyncRoundResult {
            data_type: self.data_type,
            status: status.to_string(),
            pushed_count: self.pushed_count,
            pulled_count: self.pulled_count,
            conflict_count: self.conflict_count,
            duration_ms: self.started_at.elapsed().as_millis() as i64,
        }
    }

    /// Record a round failure in the state vector, then return a result.
    async fn fail(
        &self,
        repository: &SyncRepository,
        status: &str,
        message: String,
    ) -> Result<SyncRoundResult> {
        warn!("[DeviceSync] Round failed ({}): {}", status, message);
        repository
            .commit_sync_point(self.data_type, None, Some(message))
            .await?;
        Ok(self.result(status))
    }
}

pub struct SyncEngine {
    repository: Arc<SyncRepository>,
    client: Arc<SyncApiClient>,
    keys: RwLock<Option<Arc<KeyChain>>>,
    config: RwLock<SyncConfig>,
    cancel_flag: AtomicBool,
    round_mutex: Mutex<()>,
    activity: RwLock<std::collections::HashMap<SyncDataType, SyncActivityState>>,
}

impl SyncEngine {
    pub fn new(
        repository: Arc<SyncRepository>,
        client: Arc<SyncApiClient>,
        config: SyncConfig,
    ) -> Self {
        Self {
            repository,
            client,
            keys: RwLock::new(None),
            config: RwLock::new(config),
            cancel_flag: AtomicBool::new(false),
            round_mutex: Mutex::new(()),
            activity: RwLock::new(std::collections::HashMap::new()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keys & config
    // ─────────────────────────────────────────────────────────────────────

    /// Derive and install the key hierarchy from the master password.
    pub fn unlock_keys(&self, master_password: &str) -> Result<()> {
        let salt_hex = self
            .config
            .read()
            .expect("config lock")
            .master_key_salt
            .clone()
            .ok_or_else(|| DeviceSyncError::crypto("No master key salt configured"))?;
        let chain = KeyChain::derive_from_hex_salt(master_password, &salt_hex)?;
        *self.keys.write().expect("keys lock") = Some(Arc::new(chain));
        Ok(())
    }

    /// Drop the key hierarchy. The zeroizing containers wipe themselves when
    /// the last handle goes away; any round still holding a handle finishes,
    /// then the memory is gone.
    pub fn lock_keys(&self) {
        *self.keys.write().expect("keys lock") = None;
        info!("[DeviceSync] Keys locked and zeroized");
    }

    fn keychain(&self) -> Result<Arc<KeyChain>> {
        self.keys
            .read()
            .expect("keys lock")
            .clone()
            .ok_or(DeviceSyncError::KeysUnavailable)
    }

    pub fn config(&self) -> SyncConfig {
        self.config.read().expect("config lock").clone()
    }

    pub async fn update_config(&self, config: SyncConfig) -> Result<()> {
        self.repository.save_sync_config(config.clone()).await?;
        *self.config.write().expect("config lock") = config;
        Ok(())
    }

    fn device_id(&self) -> String {
        self.config.read().expect("config lock").device_id.clone()
    }

    fn set_activity(&self, data_type: SyncDataType, state: SyncActivityState) {
        self.activity
            .write()
            .expect("activity lock")
            .insert(data_type, state);
    }

    fn activity_for(&self, data_type: SyncDataType) -> SyncActivityState {
        self.activity
            .read()
            .expect("activity lock")
            .get(&data_type)
            .copied()
            .unwrap_or(SyncActivityState::Idle)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local mutations (UI-facing; enqueue only, never dequeue)
    // ─────────────────────────────────────────────────────────────────────

    /// Record a local mutation: encrypt it into the replica (the replica is
    /// authoritative for this device, so the edit is readable immediately),
    /// journal it for upload, and make sure a push is queued. Replica and
    /// journal commit in one transaction.
    pub async fn record_local_change(
        &self,
        data_type: SyncDataType,
        record_id: &str,
        op: ChangeOp,
        plaintext: Option<serde_json::Value>,
    ) -> Result<()> {
        let client_timestamp = Utc::now().to_rfc3339();
        let payload = plaintext.map(|v| v.to_string());

        let replica = match op {
            ChangeOp::Delete => None,
            ChangeOp::Insert | ChangeOp::Update => {
                let Some(payload) = payload.as_deref() else {
                    return Err(DeviceSyncError::invalid_request(
                        "Insert/Update requires a payload",
                    ));
                };
                let keys = self.keychain()?;
                Some(self.seal_local_record(
                    &keys,
                    data_type,
                    record_id,
                    payload,
                    &client_timestamp,
                )?)
            }
        };

        let appended = self
            .repository
            .apply_local_change(LocalChange {
                data_type,
                record_id: record_id.to_string(),
                op,
                payload,
                replica,
                client_timestamp,
                device_id: self.device_id(),
            })
            .await?;

        if appended.is_some() {
            self.repository.queue_enqueue_push(data_type).await?;
        }
        Ok(())
    }

    /// Encrypt a plaintext into a replica row. The row keeps the base row's
    /// server version and timestamp: it is "a local edit on top of server
    /// version N" until the next upload stamps it.
    fn seal_local_record(
        &self,
        keys: &KeyChain,
        data_type: SyncDataType,
        record_id: &str,
        payload: &str,
        client_timestamp: &str,
    ) -> Result<ReplicaRecord> {
        let sealed = keys.encrypt(data_type, payload.as_bytes())?;
        let base = self.repository.get_record(data_type, record_id)?;
        Ok(ReplicaRecord {
            data_type,
            record_id: record_id.to_string(),
            encrypted_payload: sealed.ciphertext_b64(),
            nonce: sealed.nonce_b64(),
            checksum: sealed.checksum,
            version: base.as_ref().map(|r| r.version).unwrap_or(0),
            origin_device_id: self.device_id(),
            client_timestamp: client_timestamp.to_string(),
            server_timestamp: base.and_then(|r| r.server_timestamp),
            corrupt: false,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────

    /// Request cancellation of the in-flight round. Takes effect at the next
    /// phase boundary; calling it repeatedly is harmless.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync rounds
    // ─────────────────────────────────────────────────────────────────────

    /// Run one round for every enabled data type. At most one sync pass runs
    /// at a time per device.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let _round_guard = self.round_mutex.lock().await;
        self.cancel_flag.store(false, Ordering::Relaxed);

        let config = self.config();
        let mut rounds = Vec::new();
        for data_type in SyncDataType::ALL {
            if !config.data_type_enabled(data_type) {
                continue;
            }
            let result = self.run_round(data_type).await?;
            let stop = result.status == "cancelled" || result.status == "auth_required";
            rounds.push(result);
            if stop {
                break;
            }
        }

        // Local tombstones age out on the same schedule as the server's.
        let purged = self.repository.purge_expired_tombstones().await?;
        if purged > 0 {
            debug!("[DeviceSync] Purged {} expired local tombstone(s)", purged);
        }

        let status = if rounds.iter().all(|r| r.is_ok()) {
            "ok".to_string()
        } else {
            rounds
                .iter()
                .find(|r| !r.is_ok())
                .map(|r| r.status.clone())
                .unwrap_or_else(|| "ok".to_string())
        };
        Ok(SyncSummary { status, rounds })
    }

    /// Run a single data type's round under the round lock.
    pub async fn sync_data_type(&self, data_type: SyncDataType) -> Result<SyncRoundResult> {
        let _round_guard = self.round_mutex.lock().await;
        self.cancel_flag.store(false, Ordering::Relaxed);
        self.run_round(data_type).await
    }

    async fn run_round(&self, data_type: SyncDataType) -> Result<SyncRoundResult> {
        let repository = self.repository.clone();
        let history_id = repository.history_begin(data_type).await?;
        self.set_activity(data_type, SyncActivityState::Syncing);

        let outcome = self.run_round_phases(data_type).await;

        let (state, result) = match &outcome {
            Ok(result) if result.is_ok() => {
                let has_conflicts = repository.journal_conflicted_count(data_type)? > 0;
                let state = if has_conflicts {
                    SyncActivityState::Conflict
                } else {
                    SyncActivityState::Idle
                };
                (state, result.clone())
            }
            Ok(result) => (SyncActivityState::Error, result.clone()),
            Err(err) => {
                let ctx = RoundContext::new(data_type);
                let result = ctx.result("internal_error");
                warn!("[DeviceSync] Round aborted: {}", err);
                (SyncActivityState::Error, result)
            }
        };
        self.set_activity(data_type, state);

        repository
            .history_finish(
                history_id,
                SyncRoundMetrics {
                    pushed_count: result.pushed_count,
                    pulled_count: result.pulled_count,
                    conflict_count: result.conflict_count,
                    duration_ms: result.duration_ms,
                    status: result.status.clone(),
                },
                None,
            )
            .await?;

        outcome
    }

    async fn run_round_phases(&self, data_type: SyncDataType) -> Result<SyncRoundResult> {
        let repository = self.repository.clone();
        let mut ctx = RoundContext::new(data_type);
        let device_id = self.device_id();

        let keys = match self.keychain() {
            Ok(keys) => keys,
            Err(_) => {
                return ctx
                    .fail(
                        &repository,
                        "keys_unavailable",
                        "Sync keys are locked; sign in first".to_string(),
                    )
                    .await;
            }
        };

        let mut vector = repository.state_vector(data_type)?;

        // Offline past the tombstone window: deletions may already be GC'd
        // server-side, so incremental sync can't be trusted. Full replace.
        if let Some(last_sync) = vector.last_sync_at.as_deref() {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(last_sync) {
                let age = Utc::now() - parsed.with_timezone(&Utc);
                if age > chrono::Duration::days(TOMBSTONE_RETENTION_DAYS) {
                    info!(
                        "[DeviceSync] {} last synced {} days ago; forcing full replace",
                        data_type,
                        age.num_days()
                    );
                    repository.reset_data_type(data_type).await?;
                    vector = repository.state_vector(data_type)?;
                }
            }
        }

        // Phase 1: prepare upload.
        let entries = repository.journal_pending(data_type, MAX_DELTA_BATCH as i64)?;
        let mut changes = Vec::with_capacity(entries.len());
        let mut seqs = Vec::with_capacity(entries.len());
        let mut seq_by_record: Vec<(String, i64)> = Vec::with_capacity(entries.len());
        let mut batch_timestamp: Option<String> = None;

        for entry in &entries {
            seqs.push(entry.seq);
            seq_by_record.push((entry.record_id.clone(), entry.seq));
            if batch_timestamp
                .as_deref()
                .map(|ts| entry.client_timestamp.as_str() > ts)
                .unwrap_or(true)
            {
                batch_timestamp = Some(entry.client_timestamp.clone());
            }

            match entry.op {
                ChangeOp::Delete => changes.push(ChangeUpload {
                    record_id: entry.record_id.clone(),
                    change_type: ChangeOp::Delete,
                    encrypted_record: None,
                    record_nonce: None,
                    record_checksum: None,
                }),
                ChangeOp::Insert | ChangeOp::Update => {
                    let Some(plaintext) = entry.payload.as_deref() else {
                        warn!(
                            "[DeviceSync] Journal entry {} has no payload; skipping",
                            entry.seq
                        );
                        continue;
                    };
                    let encrypted = keys.encrypt(data_type, plaintext.as_bytes())?;
                    changes.push(ChangeUpload {
                        record_id: entry.record_id.clone(),
                        change_type: entry.op,
                        encrypted_record: Some(encrypted.ciphertext_b64()),
                        record_nonce: Some(encrypted.nonce_b64()),
                        record_checksum: Some(encrypted.checksum),
                    });
                }
            }
        }
        repository.journal_mark_in_flight(seqs.clone()).await?;

        if self.cancelled() {
            repository.journal_reset_in_flight(data_type).await?;
            return Ok(ctx.result("cancelled"));
        }

        // Phase 2: upload.
        if !changes.is_empty() {
            let request = PushDeltaRequest {
                changes,
                device_id: device_id.clone(),
                client_timestamp: batch_timestamp.unwrap_or_else(|| Utc::now().to_rfc3339()),
            };
            match self.client.push_delta(data_type, &request).await {
                Ok(response) => {
                    // Phase 3: handle conflicts.
                    let conflicted_ids: HashSet<String> = response
                        .conflicts
                        .iter()
                        .map(|c| c.record_id.clone())
                        .collect();
                    let mut acked = Vec::new();
                    let mut conflicted = Vec::new();
                    for (record_id, seq) in &seq_by_record {
                        if conflicted_ids.contains(record_id) {
                            conflicted.push(*seq);
                        } else {
                            acked.push((*seq, record_id.clone()));
                        }
                    }
                    ctx.pushed_count = acked.len();
                    ctx.conflict_count = conflicted.len();
                    repository
                        .complete_upload(
                            data_type,
                            acked,
                            conflicted,
                            response.version,
                            response.synced_at,
                        )
                        .await?;
                }
                Err(err) => {
                    repository.journal_reset_in_flight(data_type).await?;
                    let status = match err.retry_class() {
                        SyncRetryClass::ReauthRequired => "auth_required",
                        SyncRetryClass::Retryable => "push_retry",
                        SyncRetryClass::Fatal => "push_rejected",
                        SyncRetryClass::Permanent => "push_error",
                    };
                    return ctx
                        .fail(&repository, status, format!("Push failed: {}", err))
                        .await;
                }
            }
        }

        if self.cancelled() {
            return Ok(ctx.result("cancelled"));
        }

        // Phase 4: download. Changes first, then tombstones, both paginated.
        let since = vector.last_sync_at.clone();
        let mut remote_changes: Vec<RemoteChange> = Vec::new();
        let mut remote_tombstones: Vec<RemoteTombstone> = Vec::new();
        let mut max_server_timestamp = since.clone();

        let mut offset = 0i64;
        loop {
            let page = match self
                .client
                .pull_delta(data_type, since.as_deref(), MAX_DELTA_BATCH as i64, offset)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    let status = match err.retry_class() {
                        SyncRetryClass::ReauthRequired => "auth_required",
                        SyncRetryClass::Retryable => "pull_retry",
                        SyncRetryClass::Fatal => "pull_rejected",
                        SyncRetryClass::Permanent => "pull_error",
                    };
                    return ctx
                        .fail(&repository, status, format!("Pull failed: {}", err))
                        .await;
                }
            };
            for change in &page.changes {
                if max_server_timestamp
                    .as_deref()
                    .map(|ts| change.server_timestamp.as_str() > ts)
                    .unwrap_or(true)
                {
                    max_server_timestamp = Some(change.server_timestamp.clone());
                }
            }
            remote_changes.extend(page.changes);
            if !page.pagination.has_more {
                break;
            }
            offset = page
                .pagination
                .next_offset
                .unwrap_or(offset + page.pagination.returned_count);
            // Yield between pages so other tasks (and data types) get a turn.
            tokio::task::yield_now().await;
        }

        let mut offset = 0i64;
        loop {
            let page = match self
                .client
                .pull_deleted(data_type, since.as_deref(), MAX_DELTA_BATCH as i64, offset)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    let status = match err.retry_class() {
                        SyncRetryClass::ReauthRequired => "auth_required",
                        SyncRetryClass::Retryable => "pull_retry",
                        SyncRetryClass::Fatal => "pull_rejected",
                        SyncRetryClass::Permanent => "pull_error",
                    };
                    return ctx
                        .fail(&repository, status, format!("Tombstone pull failed: {}", err))
                        .await;
                }
            };
            for tombstone in &page.deleted {
                if max_server_timestamp
                    .as_deref()
                    .map(|ts| tombstone.deleted_at.as_str() > ts)
                    .unwrap_or(true)
                {
                    max_server_timestamp = Some(tombstone.deleted_at.clone());
                }
            }
            remote_tombstones.extend(page.deleted);
            if !page.pagination.has_more {
                break;
            }
            offset = page
                .pagination
                .next_offset
                .unwrap_or(offset + page.pagination.returned_count);
            tokio::task::yield_now().await;
        }

        if self.cancelled() {
            return Ok(ctx.result("cancelled"));
        }

        // Phase 5: apply remote changes. Our own writes come back here too;
        // the per-record version guard turns already-stamped ones into no-ops
        // and refreshes any row whose upload ack never landed.
        let mut records = Vec::with_capacity(remote_changes.len());
        for change in remote_changes {
            if let Some(record) = self.decode_remote_change(&keys, data_type, change) {
                records.push(record);
            }
        }
        let tombstones = remote_tombstones
            .into_iter()
            .map(|t| {
                let deleted_at = chrono::DateTime::parse_from_rfc3339(&t.deleted_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Tombstone {
                    data_type,
                    record_id: t.record_id,
                    deleted_at: t.deleted_at,
                    deleted_by_device_id: t.deleted_by_device_id,
                    expires_at: tombstone_expires_at(deleted_at).to_rfc3339(),
                }
            })
            .collect();

        let outcome = repository
            .apply_remote_changes(RemoteApplyBatch {
                data_type,
                records,
                tombstones,
            })
            .await?;
        ctx.pulled_count = outcome.applied_records + outcome.applied_tombstones;
        if outcome.quarantined > 0 {
            warn!(
                "[DeviceSync] {} record(s) failed integrity checks and were quarantined",
                outcome.quarantined
            );
        }

        // Conflicted journal entries can be resolved now that the server's
        // copies are local.
        self.resolve_conflicts(&keys, data_type).await?;

        // Phase 6: commit the sync point.
        repository
            .commit_sync_point(data_type, max_server_timestamp, None)
            .await?;

        Ok(ctx.result("ok"))
    }

    /// Decrypt-check one downloaded record. Integrity failures come back as a
    /// quarantined row; payloads that are not even valid base64 cannot be
    /// stored and are dropped with a warning.
    fn decode_remote_change(
        &self,
        keys: &KeyChain,
        data_type: SyncDataType,
        change: RemoteChange,
    ) -> Option<ReplicaRecord> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&change.encrypted_record)
            .ok()
            .zip(
                base64::engine::general_purpose::STANDARD
                    .decode(&change.record_nonce)
                    .ok(),
            );
        let Some((ciphertext, nonce)) = decoded else {
            warn!(
                "[DeviceSync] Undecodable payload for {}/{}; dropping",
                data_type, change.record_id
            );
            return None;
        };

        let (corrupt, checksum) =
            match keys.decrypt(data_type, &ciphertext, &nonce, &change.record_checksum) {
                Ok(_) => (false, change.record_checksum.to_ascii_lowercase()),
                Err(err) => {
                    warn!(
                        "[DeviceSync] Integrity failure for {}/{}: {}",
                        data_type, change.record_id, err
                    );
                    // Store under the ciphertext's true checksum so the row
                    // satisfies the store's write invariant.
                    (true, mailhaven_core::sync::sha256_hex(&ciphertext))
                }
            };

        Some(ReplicaRecord {
            data_type,
            record_id: change.record_id,
            encrypted_payload: change.encrypted_record,
            nonce: change.record_nonce,
            checksum,
            version: change.version,
            origin_device_id: change.origin_device_id,
            client_timestamp: change.client_timestamp,
            server_timestamp: Some(change.server_timestamp),
            corrupt,
        })
    }

    /// Apply the per-data-type conflict policy to every conflicted entry.
    async fn resolve_conflicts(&self, keys: &KeyChain, data_type: SyncDataType) -> Result<()> {
        let conflicted = self.repository.journal_conflicted(data_type)?;
        if conflicted.is_empty() {
            return Ok(());
        }
        let device_id = self.device_id();

        for entry in conflicted {
            let local = ConflictSide {
                payload: entry
                    .payload
                    .as_deref()
                    .and_then(|p| serde_json::from_str(p).ok()),
                client_timestamp: entry.client_timestamp.clone(),
                device_id: device_id.clone(),
            };

            let server_record = self.repository.get_record(data_type, &entry.record_id)?;
            let server = match server_record {
                Some(record) if !record.corrupt => {
                    let payload = self.decrypt_record_payload(keys, &record).ok();
                    ConflictSide {
                        payload,
                        client_timestamp: record.client_timestamp.clone(),
                        device_id: record.origin_device_id.clone(),
                    }
                }
                _ => {
                    // Server copy is a delete (or quarantined): empty side.
                    ConflictSide {
                        payload: None,
                        client_timestamp: entry.client_timestamp.clone(),
                        device_id: String::new(),
                    }
                }
            };

            match resolve(data_type, &local, &server) {
                Resolution::TakeServer => {
                    debug!(
                        "[DeviceSync] Conflict on {}/{}: server wins",
                        data_type, entry.record_id
                    );
                    self.repository.journal_remove(vec![entry.seq]).await?;
                }
                Resolution::KeepLocal => {
                    debug!(
                        "[DeviceSync] Conflict on {}/{}: local wins, re-enqueued",
                        data_type, entry.record_id
                    );
                    self.repository.journal_remove(vec![entry.seq]).await?;
                    if let Some(payload) = entry.payload.clone() {
                        self.enqueue_resolved_update(keys, data_type, &entry.record_id, payload)
                            .await?;
                    }
                }
                Resolution::Merged(value) => {
                    debug!(
                        "[DeviceSync] Conflict on {}/{}: merged, re-enqueued",
                        data_type, entry.record_id
                    );
                    self.repository.journal_remove(vec![entry.seq]).await?;
                    self.enqueue_resolved_update(
                        keys,
                        data_type,
                        &entry.record_id,
                        value.to_string(),
                    )
                    .await?;
                }
                Resolution::Escalate => {
                    // Stays conflicted; surfaced through the status report
                    // until the user picks a side.
                    debug!(
                        "[DeviceSync] Conflict on {}/{} needs user resolution",
                        data_type, entry.record_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Re-encrypt a resolved value into the replica and queue a fresh update,
    /// stamped now so it wins the next LWW comparison.
    async fn enqueue_resolved_update(
        &self,
        keys: &KeyChain,
        data_type: SyncDataType,
        record_id: &str,
        payload: String,
    ) -> Result<()> {
        let client_timestamp = Utc::now().to_rfc3339();
        let replica =
            self.seal_local_record(keys, data_type, record_id, &payload, &client_timestamp)?;
        self.repository
            .apply_local_change(LocalChange {
                data_type,
                record_id: record_id.to_string(),
                op: ChangeOp::Update,
                payload: Some(payload),
                replica: Some(replica),
                client_timestamp,
                device_id: self.device_id(),
            })
            .await?;
        self.repository.queue_enqueue_push(data_type).await?;
        Ok(())
    }

    fn decrypt_record_payload(
        &self,
        keys: &KeyChain,
        record: &ReplicaRecord,
    ) -> Result<serde_json::Value> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&record.encrypted_payload)
            .map_err(|_| DeviceSyncError::crypto("Stored payload is not valid base64"))?;
        let nonce = base64::engine::general_purpose::STANDARD
            .decode(&record.nonce)
            .map_err(|_| DeviceSyncError::crypto("Stored nonce is not valid base64"))?;
        let plaintext = keys.decrypt(record.data_type, &ciphertext, &nonce, &record.checksum)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Decrypt a replica record into its plaintext JSON (UI read path).
    pub fn read_record(
        &self,
        data_type: SyncDataType,
        record_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let Some(record) = self.repository.get_record(data_type, record_id)? else {
            return Ok(None);
        };
        if record.corrupt {
            return Err(DeviceSyncError::crypto("Record is quarantined as corrupt"));
        }
        let keys = self.keychain()?;
        Ok(Some(self.decrypt_record_payload(&keys, &record)?))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Offline queue processing
    // ─────────────────────────────────────────────────────────────────────

    /// Drain due queue items, retrying with exponential backoff and jitter.
    pub async fn process_queue(&self) -> Result<Vec<SyncRoundResult>> {
        let due = self.repository.queue_due(16)?;
        let mut results = Vec::new();

        for item in due {
            self.repository.queue_mark_in_progress(item.id.clone()).await?;
            let result = match item.action {
                QueueAction::Push | QueueAction::Pull => {
                    self.sync_data_type(item.data_type).await?
                }
            };

            if result.is_ok() || result.status == "cancelled" {
                self.repository.queue_complete(item.id.clone()).await?;
            } else {
                let attempts = item.attempts + 1;
                let vector = self.repository.state_vector(item.data_type)?;
                let error = vector.last_error.clone();

                let class = classify_round_status(&result.status);
                match class {
                    SyncRetryClass::Fatal => {
                        self.repository.queue_fail(item.id.clone(), error).await?;
                    }
                    SyncRetryClass::Permanent if attempts >= QUEUE_PERMANENT_FAILURE_LIMIT => {
                        self.repository.queue_fail(item.id.clone(), error).await?;
                    }
                    _ => {
                        let delay = backoff_with_jitter(attempts, None);
                        let next_attempt =
                            (Utc::now() + chrono::Duration::seconds(delay)).to_rfc3339();
                        self.repository
                            .queue_schedule_retry(item.id.clone(), next_attempt, error)
                            .await?;
                    }
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Status surface
    // ─────────────────────────────────────────────────────────────────────

    pub fn status(&self, data_type: SyncDataType) -> Result<SyncStatusReport> {
        Ok(self
            .repository
            .status_report(data_type, self.activity_for(data_type))?)
    }

    pub fn status_all(&self) -> Result<Vec<SyncStatusReport>> {
        SyncDataType::ALL.iter().map(|dt| self.status(*dt)).collect()
    }
}

/// Map a round status string back to a retry class for queue handling.
fn classify_round_status(status: &str) -> SyncRetryClass {
    match status {
        "push_retry" | "pull_retry" => SyncRetryClass::Retryable,
        "auth_required" | "keys_unavailable" => SyncRetryClass::ReauthRequired,
        "push_rejected" | "pull_rejected" => SyncRetryClass::Fatal,
        _ => SyncRetryClass::Permanent,
    }
}

/// Queue backoff with ±20% jitter, floored by a server-provided Retry-After.
pub fn backoff_with_jitter(attempts: i32, retry_after_floor: Option<u64>) -> i64 {
    let base = queue_backoff_seconds(attempts);
    let jitter_span = (base / 5).max(1);
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let delayed = (base + jitter).max(1);
    match retry_after_floor {
        Some(floor) => delayed.max(floor as i64),
        None => delayed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhaven_core::secrets::{InMemorySecretStore, SecretStore};
    use mailhaven_core::sync::JournalStatus;
    use mailhaven_storage_sqlite::db::{create_pool, init, run_migrations, spawn_writer};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use tempfile::tempdir;

    const SALT_HEX: &str = "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a";

    fn test_repository() -> Arc<SyncRepository> {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        Arc::new(SyncRepository::new(pool, writer))
    }

    fn engine_for(server: &Server) -> SyncEngine {
        let secrets = Arc::new(InMemorySecretStore::new());
        secrets
            .set_secret(
                "sync_tokens",
                r#"{"access_token":"at","refresh_token":"rt","token_type":"Bearer","expires_in":3600}"#,
            )
            .unwrap();
        let client = SyncApiClient::new(&server.url(), secrets.clone());

        let config = SyncConfig {
            enabled: true,
            device_id: "device-1".to_string(),
            master_key_salt: Some(SALT_HEX.to_string()),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(test_repository(), Arc::new(client), config);
        engine.unlock_keys("master-password").unwrap();
        engine
    }

    fn empty_pull_body(data_type: &str) -> String {
        format!(
            r#"{{"success":true,"data":{{"data_type":"{}","since":null,"changes":[],"deleted":[],"pagination":{{"limit":1000,"offset":0,"returned_count":0,"has_more":false}}}}}}"#,
            data_type
        )
    }

    fn empty_deleted_body(data_type: &str) -> String {
        format!(
            r#"{{"success":true,"data":{{"data_type":"{}","since":null,"deleted":[],"pagination":{{"limit":1000,"offset":0,"returned_count":0,"has_more":false}}}}}}"#,
            data_type
        )
    }

    async fn mock_empty_downloads(server: &mut Server, data_type: &str) {
        server
            .mock("GET", format!("/sync/{}/delta", data_type).as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(empty_pull_body(data_type))
            .create_async()
            .await;
        server
            .mock("GET", format!("/sync/{}/deleted", data_type).as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(empty_deleted_body(data_type))
            .create_async()
            .await;
    }

    #[tokio::test]
    async fn offline_insert_update_delete_reaches_the_wire_as_nothing() {
        let mut server = Server::new_async().await;
        mock_empty_downloads(&mut server, "contacts").await;
        // No push mock: an upload request would fail the test with a 501.

        let engine = engine_for(&server);
        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Insert,
                Some(json!({"email": "a@x.com"})),
            )
            .await
            .unwrap();
        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Update,
                Some(json!({"email": "a@x.com", "name": "A"})),
            )
            .await
            .unwrap();
        engine
            .record_local_change(SyncDataType::Contacts, "c-001", ChangeOp::Delete, None)
            .await
            .unwrap();

        let result = engine.sync_data_type(SyncDataType::Contacts).await.unwrap();
        assert_eq!(result.status, "ok");
        assert_eq!(result.pushed_count, 0);
    }

    #[tokio::test]
    async fn round_pushes_pending_changes_and_clears_journal() {
        let mut server = Server::new_async().await;
        let push = server
            .mock("POST", "/sync/contacts/delta")
            .with_status(200)
            .with_body(
                r#"{"success":true,"data":{"data_type":"contacts","version":1,"processed_count":1,"conflict_count":0,"conflicts":[],"synced_at":"2026-02-06T10:00:01Z"}}"#,
            )
            .create_async()
            .await;
        mock_empty_downloads(&mut server, "contacts").await;

        let engine = engine_for(&server);
        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Insert,
                Some(json!({"email": "a@x.com", "name": "A"})),
            )
            .await
            .unwrap();

        let result = engine.sync_data_type(SyncDataType::Contacts).await.unwrap();
        assert_eq!(result.status, "ok");
        assert_eq!(result.pushed_count, 1);
        assert_eq!(result.conflict_count, 0);
        push.assert_async().await;

        // Journal drained and the state vector advanced.
        assert_eq!(
            engine
                .repository
                .journal_pending_count(SyncDataType::Contacts)
                .unwrap(),
            0
        );
        let vector = engine.repository.state_vector(SyncDataType::Contacts).unwrap();
        assert_eq!(vector.last_known_server_version, 1);

        // The replica row now carries the server's version and sync stamp and
        // still reads back as the local edit.
        let record = engine
            .repository
            .get_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(
            record.server_timestamp.as_deref(),
            Some("2026-02-06T10:00:01Z")
        );
        let value = engine
            .read_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert_eq!(value["email"], "a@x.com");
    }

    #[tokio::test]
    async fn local_changes_are_readable_before_any_sync() {
        let server = Server::new_async().await;
        let engine = engine_for(&server);

        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Insert,
                Some(json!({"email": "a@x.com", "name": "A"})),
            )
            .await
            .unwrap();
        let value = engine
            .read_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert_eq!(value["name"], "A");

        // An edit is visible immediately as well, still unsynced.
        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Update,
                Some(json!({"email": "a@x.com", "name": "Alice"})),
            )
            .await
            .unwrap();
        let value = engine
            .read_record(SyncDataType::Contacts, "c-001")
            .unwrap()
            .unwrap();
        assert_eq!(value["name"], "Alice");
        assert_eq!(
            engine
                .repository
                .get_record(SyncDataType::Contacts, "c-001")
                .unwrap()
                .unwrap()
                .version,
            0
        );

        // With the keys locked, mutations are refused outright.
        engine.lock_keys();
        let result = engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-002",
                ChangeOp::Insert,
                Some(json!({"email": "b@x.com"})),
            )
            .await;
        assert!(matches!(result, Err(DeviceSyncError::KeysUnavailable)));
    }

    #[tokio::test]
    async fn second_round_with_no_changes_is_idempotent() {
        let mut server = Server::new_async().await;
        mock_empty_downloads(&mut server, "contacts").await;

        let engine = engine_for(&server);
        let first = engine.sync_data_type(SyncDataType::Contacts).await.unwrap();
        let vector_after_first = engine.repository.state_vector(SyncDataType::Contacts).unwrap();

        let second = engine.sync_data_type(SyncDataType::Contacts).await.unwrap();
        let vector_after_second = engine.repository.state_vector(SyncDataType::Contacts).unwrap();

        assert_eq!(first.status, "ok");
        assert_eq!(second.status, "ok");
        assert_eq!(second.pushed_count, 0);
        assert_eq!(second.pulled_count, 0);
        assert_eq!(vector_after_first, vector_after_second);
    }

    #[tokio::test]
    async fn cancelled_round_leaves_journal_pending() {
        let server = Server::new_async().await;
        let engine = engine_for(&server);
        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Insert,
                Some(json!({"email": "a@x.com"})),
            )
            .await
            .unwrap();

        // Cancel before the round starts; the flag is rechecked after Prepare.
        engine.cancel();
        engine.cancel(); // idempotent
        let result = engine.run_round(SyncDataType::Contacts).await.unwrap();
        assert_eq!(result.status, "cancelled");

        let pending = engine
            .repository
            .journal_pending(SyncDataType::Contacts, 10)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, JournalStatus::Pending);
    }

    #[tokio::test]
    async fn lww_conflict_takes_server_copy_for_preferences() {
        let mut server = Server::new_async().await;

        // Build the server's (winning) ciphertext with the same key chain.
        let keys = KeyChain::derive_from_hex_salt("master-password", SALT_HEX).unwrap();
        let server_payload = keys
            .encrypt(
                SyncDataType::Preferences,
                br#"{"theme":"dark"}"#,
            )
            .unwrap();

        let _push = server
            .mock("POST", "/sync/preferences/delta")
            .with_status(200)
            .with_body(format!(
                r#"{{"success":true,"data":{{"data_type":"preferences","version":1,"processed_count":0,"conflict_count":1,"conflicts":[{{"record_id":"preferences","server_version":1,"server_timestamp":"2026-02-06T10:00:00Z"}}],"synced_at":"2026-02-06T10:00:05Z"}}}}"#,
            ))
            .create_async()
            .await;
        let _pull = server
            .mock("GET", "/sync/preferences/delta")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"success":true,"data":{{"data_type":"preferences","since":null,"changes":[{{"record_id":"preferences","encrypted_record":"{}","record_nonce":"{}","record_checksum":"{}","version":1,"origin_device_id":"device-2","client_timestamp":"2026-02-06T10:00:00Z","server_timestamp":"2026-02-06T10:00:00Z"}}],"deleted":[],"pagination":{{"limit":1000,"offset":0,"returned_count":1,"has_more":false}}}}}}"#,
                server_payload.ciphertext_b64(),
                server_payload.nonce_b64(),
                server_payload.checksum,
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/sync/preferences/deleted")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(empty_deleted_body("preferences"))
            .create_async()
            .await;

        let engine = engine_for(&server);
        // Local change that is OLDER than the server's copy: LWW loses.
        engine
            .repository
            .journal_append(
                SyncDataType::Preferences,
                "preferences".to_string(),
                ChangeOp::Update,
                Some(r#"{"theme":"light"}"#.to_string()),
                "2026-02-06T09:55:00Z".to_string(),
            )
            .await
            .unwrap();

        let result = engine
            .sync_data_type(SyncDataType::Preferences)
            .await
            .unwrap();
        assert_eq!(result.status, "ok");
        assert_eq!(result.conflict_count, 1);

        // Server copy stands locally, journal entry is gone.
        let value = engine
            .read_record(SyncDataType::Preferences, "preferences")
            .unwrap()
            .unwrap();
        assert_eq!(value["theme"], "dark");
        assert_eq!(
            engine
                .repository
                .journal_conflicted_count(SyncDataType::Preferences)
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn tampered_download_is_quarantined_not_applied() {
        let mut server = Server::new_async().await;
        let keys = KeyChain::derive_from_hex_salt("master-password", SALT_HEX).unwrap();
        let mut payload = keys
            .encrypt(SyncDataType::Contacts, br#"{"email":"a@x.com"}"#)
            .unwrap();
        payload.ciphertext[0] ^= 0xFF; // tamper after checksum was computed

        let _pull = server
            .mock("GET", "/sync/contacts/delta")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"success":true,"data":{{"data_type":"contacts","since":null,"changes":[{{"record_id":"c-bad","encrypted_record":"{}","record_nonce":"{}","record_checksum":"{}","version":1,"origin_device_id":"device-2","client_timestamp":"2026-02-06T10:00:00Z","server_timestamp":"2026-02-06T10:00:00Z"}}],"deleted":[],"pagination":{{"limit":1000,"offset":0,"returned_count":1,"has_more":false}}}}}}"#,
                payload.ciphertext_b64(),
                payload.nonce_b64(),
                payload.checksum,
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/sync/contacts/deleted")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(empty_deleted_body("contacts"))
            .create_async()
            .await;

        let engine = engine_for(&server);
        let result = engine.sync_data_type(SyncDataType::Contacts).await.unwrap();
        assert_eq!(result.status, "ok");

        // Quarantined: present, flagged, unreadable, counted in status.
        let record = engine
            .repository
            .get_record(SyncDataType::Contacts, "c-bad")
            .unwrap()
            .unwrap();
        assert!(record.corrupt);
        assert!(engine.read_record(SyncDataType::Contacts, "c-bad").is_err());
        let report = engine.status(SyncDataType::Contacts).unwrap();
        assert_eq!(report.corrupt_count, 1);
    }

    #[tokio::test]
    async fn failed_push_resets_journal_and_schedules_retry() {
        let mut server = Server::new_async().await;
        let _push = server
            .mock("POST", "/sync/contacts/delta")
            .with_status(503)
            .with_body(r#"{"success":false,"code":"UNAVAILABLE","message":"maintenance"}"#)
            .create_async()
            .await;

        let engine = engine_for(&server);
        engine
            .record_local_change(
                SyncDataType::Contacts,
                "c-001",
                ChangeOp::Insert,
                Some(json!({"email": "a@x.com"})),
            )
            .await
            .unwrap();

        let results = engine.process_queue().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "push_retry");

        // Journal entry survives for the next attempt, and the queue item is
        // deferred rather than failed.
        assert_eq!(
            engine
                .repository
                .journal_pending_count(SyncDataType::Contacts)
                .unwrap(),
            1
        );
        assert_eq!(
            engine
                .repository
                .queue_failed_count(SyncDataType::Contacts)
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn locked_keys_abort_rounds() {
        let server = Server::new_async().await;
        let engine = engine_for(&server);
        engine.lock_keys();
        let result = engine.sync_data_type(SyncDataType::Contacts).await.unwrap();
        assert_eq!(result.status, "keys_unavailable");
    }

    #[test]
    fn backoff_jitter_stays_within_twenty_percent() {
        for attempts in 1..12 {
            let base = queue_backoff_seconds(attempts);
            for _ in 0..50 {
                let delay = backoff_with_jitter(attempts, None);
                assert!(delay >= (base - (base / 5).max(1)).max(1));
                assert!(delay <= base + (base / 5).max(1));
            }
        }
    }

    #[test]
    fn retry_after_floors_the_backoff() {
        let delay = backoff_with_jitter(1, Some(60));
        assert!(delay >= 60);
    }
}
