//! mailhaven sync service: zero-knowledge storage for encrypted device state.

pub mod api;
pub mod auth;
pub mod db;
pub mod error;
pub mod janitor;
pub mod models;
pub mod rate_limit;
pub mod schema;
pub mod state;

use std::sync::Arc;

use axum::Router;

pub use state::{AppState, ServerConfig};

/// Build the full application router.
pub fn app(state: Arc<AppState>) -> Router {
    api::router(state)
}
