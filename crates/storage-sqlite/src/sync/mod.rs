//! Local sync store: replica, journal, queue, tombstones, state vectors.

mod model;
mod repository;

pub use model::*;
pub use repository::{LocalChange, RemoteApplyBatch, RemoteApplyOutcome, SyncRepository};
