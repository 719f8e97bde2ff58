use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_CONSUMER_GROUP, DEFAULT_ERROR_BACKOFF_SECONDS, DEFAULT_LAST_RUN_KEY_PREFIX,
    DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECONDS, DEFAULT_LOCK_NAME, DEFAULT_LOCK_RETRY_WAIT_SECONDS,
    DEFAULT_LOCK_TTL_SECONDS, DEFAULT_MAX_WAIT_SECONDS, DEFAULT_PENDING_SCAN_BATCH,
    DEFAULT_REDIS_DSN, DEFAULT_SCHEDULE_HORIZON_SECONDS, DEFAULT_STREAM_NAME,
    DEFAULT_STUCK_CHECK_INTERVAL_SECONDS, DEFAULT_STUCK_TIMEOUT_SECONDS,
};

/// Binds a registered handler name to a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronJobConfig {
    pub function_name: String,
    pub schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RsqSettings {
    pub redis_dsn: String,
    pub stream_name: String,
    pub consumer_group: String,
    /// Failed job events are forwarded here. When unset, handler failures are
    /// logged and dropped.
    pub dead_letter_stream: Option<String>,
    pub stuck_timeout_seconds: f64,
    pub stuck_check_interval_seconds: f64,
    pub pending_scan_batch: usize,
    pub lock_name: String,
    pub lock_ttl_seconds: f64,
    pub lock_retry_wait_seconds: f64,
    pub lock_acquire_timeout_seconds: f64,
    pub last_run_key_prefix: String,
    pub max_wait_seconds: f64,
    pub schedule_horizon_seconds: i64,
    pub worker_concurrency: usize,
    pub error_backoff_seconds: f64,
    pub cron_jobs: Vec<CronJobConfig>,
}

impl Default for RsqSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            dead_letter_stream: None,
            stuck_timeout_seconds: DEFAULT_STUCK_TIMEOUT_SECONDS,
            stuck_check_interval_seconds: DEFAULT_STUCK_CHECK_INTERVAL_SECONDS,
            pending_scan_batch: DEFAULT_PENDING_SCAN_BATCH,
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
            lock_retry_wait_seconds: DEFAULT_LOCK_RETRY_WAIT_SECONDS,
            lock_acquire_timeout_seconds: DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECONDS,
            last_run_key_prefix: DEFAULT_LAST_RUN_KEY_PREFIX.to_string(),
            max_wait_seconds: DEFAULT_MAX_WAIT_SECONDS,
            schedule_horizon_seconds: DEFAULT_SCHEDULE_HORIZON_SECONDS,
            worker_concurrency: 1,
            error_backoff_seconds: DEFAULT_ERROR_BACKOFF_SECONDS,
            cron_jobs: Vec::new(),
        }
    }
}
