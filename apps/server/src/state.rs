//! Shared application state and configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::db::{init_database, DbPool};
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::RateLimiter;

/// Service configuration. Read from the environment in production; tests
/// construct it directly with relaxed rate limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_days: i64,
    pub upload_limit_per_min: u32,
    pub download_limit_per_min: u32,
    pub register_limit_per_hour: u32,
    pub login_limit_per_min: u32,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("MAILHAVEN_JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("MAILHAVEN_JWT_SECRET is required"))?;
        Ok(Self {
            db_path: std::env::var("MAILHAVEN_DB_PATH")
                .unwrap_or_else(|_| "data/mailhaven-server.db".to_string()),
            bind_addr: std::env::var("MAILHAVEN_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8484".to_string()),
            jwt_secret,
            access_token_ttl_secs: 3600,
            refresh_token_ttl_days: 30,
            upload_limit_per_min: 20,
            download_limit_per_min: 30,
            register_limit_per_hour: 3,
            login_limit_per_min: 5,
        })
    }

    /// Test configuration with limits high enough to stay out of the way.
    pub fn for_tests(db_path: &str) -> Self {
        Self {
            db_path: db_path.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: "test-secret".to_string(),
            access_token_ttl_secs: 3600,
            refresh_token_ttl_days: 30,
            upload_limit_per_min: 10_000,
            download_limit_per_min: 10_000,
            register_limit_per_hour: 10_000,
            login_limit_per_min: 10_000,
        }
    }
}

pub struct AppState {
    pub pool: Arc<DbPool>,
    pub config: ServerConfig,
    pub limiter: RateLimiter,
    sync_locks: StdMutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let pool = init_database(&config.db_path)?;
        Ok(Self {
            pool,
            config,
            limiter: RateLimiter::new(),
            sync_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Serialization point for uploads: one lock per `(user, data_type)`.
    /// Different pairs proceed in parallel.
    pub fn sync_lock(&self, user_id: &str, data_type: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().expect("sync locks");
        locks
            .entry((user_id.to_string(), data_type.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a blocking database closure off the async runtime.
    pub async fn with_conn<T, F>(&self, job: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut diesel::sqlite::SqliteConnection) -> ApiResult<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = crate::db::get_connection(&pool)?;
            job(&mut conn)
        })
        .await
        .map_err(|e| ApiError::internal(format!("database worker failed: {}", e)))?
    }
}
