use std::sync::{Arc, OnceLock};

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::backend::RedisBackend;
use rsq_config::RsqSettings;

pub const TEST_REDIS_DSN_ENV: &str = "RSQ_TEST_REDIS_DSN";

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Exclusive handle on the test Redis database, flushed on creation.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: RsqSettings,
    pub backend: Arc<RedisBackend>,
}

impl RedisTestContext {
    /// Returns `None` when `RSQ_TEST_REDIS_DSN` is unset so Redis-backed tests
    /// skip on machines without a server.
    pub async fn try_new() -> Result<Option<Self>> {
        let Ok(redis_dsn) = std::env::var(TEST_REDIS_DSN_ENV) else {
            return Ok(None);
        };
        let guard = redis_lock().lock().await;
        let settings = RsqSettings {
            redis_dsn,
            stream_name: format!("rsq:stream:test-{}", Uuid::new_v4()),
            consumer_group: format!("rsq:group:test-{}", Uuid::new_v4()),
            ..RsqSettings::default()
        };
        let backend = RedisBackend::connect(&settings.redis_dsn).await?;
        backend.flushdb().await?;
        Ok(Some(Self {
            _guard: guard,
            settings,
            backend: Arc::new(backend),
        }))
    }
}
