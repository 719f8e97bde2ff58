use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::LockBackend;
use rsq_config::{DEFAULT_LOCK_RETRY_WAIT_SECONDS, DEFAULT_LOCK_TTL_SECONDS, RsqSettings};

/// Lease-based mutual exclusion over a single key.
///
/// A lease expires after `ttl` whether or not it was released. If the holder
/// keeps working past the TTL another process can acquire the same key, and
/// both will believe they hold it. Keep the TTL comfortably above the longest
/// expected critical section.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    ttl: Duration,
    retry_wait: Duration,
}

/// Proof of a successful `acquire`; hand it back to `release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
    acquired_at: Instant,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            ttl: Duration::from_secs_f64(DEFAULT_LOCK_TTL_SECONDS),
            retry_wait: Duration::from_secs_f64(DEFAULT_LOCK_RETRY_WAIT_SECONDS),
        }
    }

    pub fn from_settings(backend: Arc<dyn LockBackend>, settings: &RsqSettings) -> Self {
        Self::new(backend, &settings.lock_name)
            .with_ttl(Duration::from_secs_f64(settings.lock_ttl_seconds))
            .with_retry_wait(Duration::from_secs_f64(settings.lock_retry_wait_seconds))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tries to take the lock with a fresh token.
    ///
    /// Without `block` this is a single attempt. With `block`, retries every
    /// `retry_wait` until `timeout` has elapsed (forever when `None`).
    pub async fn acquire(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<LockLease>> {
        let token = Uuid::new_v4().to_string();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let acquired = self
                .backend
                .set_if_absent(&self.key, &token, self.ttl)
                .await
                .with_context(|| format!("failed to acquire lock {}", self.key))?;
            if acquired {
                debug!(lock = %self.key, "lock acquired");
                return Ok(Some(LockLease {
                    key: self.key.clone(),
                    token,
                    acquired_at: Instant::now(),
                }));
            }
            if !block {
                return Ok(None);
            }
            let sleep_for = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(self.retry_wait)
                }
                None => self.retry_wait,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Deletes the lock if it still holds the lease's token. Returns `false`
    /// when the lease had already expired and the key is gone or owned by
    /// someone else.
    pub async fn release(&self, lease: LockLease) -> Result<bool> {
        let released = self
            .backend
            .delete_if_equals(&lease.key, &lease.token)
            .await
            .with_context(|| format!("failed to release lock {}", lease.key))?;
        if released {
            debug!(
                lock = %lease.key,
                held_ms = lease.held_for().as_millis() as u64,
                "lock released"
            );
        } else {
            debug!(lock = %lease.key, "lock lease was already lost");
        }
        Ok(released)
    }

    /// Runs `f` while holding the lock and releases it afterwards, also when
    /// `f` fails. Returns `Ok(None)` without running `f` if the lock could not
    /// be acquired.
    pub async fn with_lock<F, Fut, T>(
        &self,
        block: bool,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(lease) = self.acquire(block, timeout).await? else {
            return Ok(None);
        };
        let outcome = f().await;
        if let Err(err) = self.release(lease).await {
            warn!(lock = %self.key, error = %err, "failed to release lock; it will expire by TTL");
        }
        outcome.map(Some)
    }
}
