//! Single-writer actor serializing all mutations.
//!
//! Every job runs inside one immediate transaction on a dedicated thread, so
//! multi-table mutations (journal + state vector, replica + tombstone) commit
//! or roll back together. The writer lock is never held across await points —
//! callers only await the reply channel.

use std::sync::mpsc;
use std::thread;

use diesel::sqlite::SqliteConnection;
use diesel::Connection;

use mailhaven_core::errors::{Error, Result};

use crate::db::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

/// Transaction error carrier: either the job's own error or a commit/rollback
/// failure from diesel.
enum TxError {
    App(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(e: diesel::result::Error) -> Self {
        TxError::Diesel(e)
    }
}

/// Handle to the writer thread. Cheap to clone.
#[derive(Clone)]
pub struct WriteHandle {
    sender: mpsc::Sender<Job>,
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle").finish()
    }
}

/// Spawn the writer thread against a dedicated pooled connection.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (sender, receiver) = mpsc::channel::<Job>();

    thread::Builder::new()
        .name("mailhaven-db-writer".to_string())
        .spawn(move || {
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("[Storage] Writer failed to acquire connection: {}", e);
                    return;
                }
            };
            while let Ok(job) = receiver.recv() {
                job(&mut conn);
            }
        })
        .expect("Failed to spawn database writer thread");

    WriteHandle { sender }
}

impl WriteHandle {
    /// Run `job` in one immediate transaction on the writer thread.
    pub async fn exec<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel::<Result<T>>();

        let wrapped: Job = Box::new(move |conn| {
            let outcome = conn
                .immediate_transaction::<T, TxError, _>(|tx| job(tx).map_err(TxError::App))
                .map_err(|e| match e {
                    TxError::App(err) => err,
                    TxError::Diesel(err) => Error::from(StorageError::Diesel(err)),
                });
            let _ = reply_tx.send(outcome);
        });

        self.sender.send(wrapped).map_err(|_| {
            Error::from(StorageError::Internal(
                "Database writer is no longer running".to_string(),
            ))
        })?;

        reply_rx.await.map_err(|_| {
            Error::from(StorageError::Internal(
                "Database writer dropped the job".to_string(),
            ))
        })?
    }
}
