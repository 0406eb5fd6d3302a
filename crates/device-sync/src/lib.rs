//! Client-side sync engine: crypto kernel, API client, reconciliation and
//! background scheduling.

pub mod client;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod types;

pub use client::SyncApiClient;
pub use crypto::KeyChain;
pub use engine::{SyncEngine, SyncRoundResult, SyncSummary};
pub use error::{DeviceSyncError, Result};
pub use scheduler::{SyncRunHandle, SyncScheduler};
pub use types::*;
