//! Storage primitives the queue, lock and key-value store are built on.
//!
//! Each concern is a separate trait so a deployment can mix backends, but
//! both shipped implementations ([`RedisBackend`] and [`MemoryBackend`])
//! provide all three.

mod memory;
mod redis_backend;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

/// Identifier assigned to a stream entry at append time: `<millis>-<seq>`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest ID strictly greater than `self`.
    pub fn successor(&self) -> Self {
        if self.seq == u64::MAX {
            Self::new(self.ms + 1, 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (ms, seq) = raw.split_once('-').unwrap_or((raw, "0"));
        let ms = ms
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("invalid stream id: {raw}"))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("invalid stream id: {raw}"))?;
        Ok(Self::new(ms, seq))
    }
}

impl TryFrom<String> for StreamId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StreamId> for String {
    fn from(value: StreamId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub payload: Vec<u8>,
}

/// One row of a consumer group's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: StreamId,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub deliveries: u64,
}

#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Creates the consumer group (and the stream if missing). Idempotent.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<StreamId>;

    /// Delivers the next never-delivered entry of the group to `consumer`,
    /// waiting up to `block` for one to arrive.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Option<Duration>,
    ) -> Result<Option<StreamEntry>>;

    /// Pending entries in ID order, starting strictly after `after`.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Reassigns a pending entry to `consumer` if it has been idle for at
    /// least `min_idle`. Returns `None` when another consumer won the claim
    /// or the entry is gone.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: StreamId,
    ) -> Result<Option<StreamEntry>>;

    /// Acknowledges the entry for the group and deletes it from the stream.
    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<()>;

    async fn range(
        &self,
        stream: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    async fn len(&self, stream: &str) -> Result<u64>;

    /// Drops per-consumer resources such as a dedicated blocking connection.
    /// Pending entries of the consumer are untouched.
    async fn release_consumer(&self, _consumer: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Sets `key` to `token` with a TTL unless the key already exists.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only if it still holds `token`.
    async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool>;
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}
