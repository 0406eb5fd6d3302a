//! Domain models and shared helpers for the mailhaven sync engine.

pub mod errors;
pub mod secrets;
pub mod sync;
