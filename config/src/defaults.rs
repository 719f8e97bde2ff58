pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_STREAM_NAME: &str = "rsq:stream:default";
pub const DEFAULT_CONSUMER_GROUP: &str = "rsq:group:workers";
pub const DEFAULT_LOCK_NAME: &str = "rsq:lock:scheduler";
pub const DEFAULT_LAST_RUN_KEY_PREFIX: &str = "rsq:last_run:";

pub const STREAM_KEY_PREFIX: &str = "rsq:stream:";

pub const DEFAULT_STUCK_TIMEOUT_SECONDS: f64 = 5.0;
pub const DEFAULT_STUCK_CHECK_INTERVAL_SECONDS: f64 = 10.0;
pub const DEFAULT_PENDING_SCAN_BATCH: usize = 100;

pub const DEFAULT_LOCK_TTL_SECONDS: f64 = 30.0;
pub const DEFAULT_LOCK_RETRY_WAIT_SECONDS: f64 = 1.0;
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECONDS: f64 = 5.0;

pub const DEFAULT_MAX_WAIT_SECONDS: f64 = 60.0;
pub const DEFAULT_SCHEDULE_HORIZON_SECONDS: i64 = 60 * 60 * 24;
pub const MAX_SCHEDULE_HORIZON_SECONDS: i64 = 60 * 60 * 24 * 366;
pub const DEFAULT_ERROR_BACKOFF_SECONDS: f64 = 1.0;
