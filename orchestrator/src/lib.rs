pub mod backend;
pub mod client;
pub mod cron;
pub mod job;
pub mod kv;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backend::{MemoryBackend, RedisBackend, StreamId};
pub use client::{Client, JobHandle};
pub use cron::{CronError, CronExpr};
pub use job::{DeadLetterEntry, JobError, JobEvent, JobOutcome};
pub use kv::KeyValueStore;
pub use lock::{DistributedLock, LockLease};
pub use queue::{ConsumerContext, Message, StreamQueue};
pub use registry::{Handler, Registry, ScheduledJob};
pub use rsq_config::{RsqSettings, load_toml_settings};
pub use worker::{Dispatched, Worker};
