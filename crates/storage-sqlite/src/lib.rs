//! SQLite-backed local store for the mailhaven sync engine.
//!
//! Holds the encrypted replica, change journal, offline queue, tombstones,
//! state vectors and sync history for one device. All mutations go through a
//! single writer actor so transactional boundaries stay serialized.

pub mod db;
pub mod errors;
pub mod schema;
pub mod sync;
