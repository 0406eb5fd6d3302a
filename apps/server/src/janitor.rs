//! Background janitor purging expired tombstones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use tracing::{info, warn};

use crate::error::ApiResult;
use crate::schema::sync_tombstones;
use crate::state::AppState;

const JANITOR_INTERVAL_SECS: u64 = 60 * 60;

/// Delete tombstones whose retention window has passed. Returns rows removed.
pub async fn purge_expired_tombstones(state: &AppState) -> ApiResult<usize> {
    state
        .with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let purged =
                diesel::delete(sync_tombstones::table.filter(sync_tombstones::expires_at.lt(now)))
                    .execute(conn)?;
            Ok(purged)
        })
        .await
}

/// Hourly purge loop.
pub fn spawn_tombstone_janitor(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match purge_expired_tombstones(&state).await {
                Ok(0) => {}
                Ok(purged) => info!("janitor purged {} expired tombstone(s)", purged),
                Err(err) => warn!("janitor pass failed: {}", err),
            }
            tokio::time::sleep(Duration::from_secs(JANITOR_INTERVAL_SECS)).await;
        }
    })
}
