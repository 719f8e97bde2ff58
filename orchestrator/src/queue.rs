use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{StreamBackend, StreamId};
use rsq_config::{
    DEFAULT_PENDING_SCAN_BATCH, DEFAULT_STUCK_CHECK_INTERVAL_SECONDS,
    DEFAULT_STUCK_TIMEOUT_SECONDS, RsqSettings,
};

/// Per-worker consumer identity plus the delivery bookkeeping tied to it.
///
/// A context is owned by exactly one loop and is meant to live as long as
/// that loop: backends may keep a connection per consumer name until
/// [`StreamQueue::release`]. It remembers the message returned by the last
/// `get` so the next `get` (or `task_done`) can acknowledge it.
#[derive(Debug)]
pub struct ConsumerContext {
    name: String,
    outstanding: Option<StreamId>,
    next_stuck_check: Option<Instant>,
}

impl ConsumerContext {
    pub fn new() -> Self {
        Self::with_name(Uuid::new_v4().to_string())
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outstanding: None,
            next_stuck_check: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outstanding(&self) -> Option<StreamId> {
        self.outstanding
    }

    /// Forgets the outstanding message without acknowledging it. It stays
    /// pending under this consumer until the stuck sweep reclaims it.
    pub fn abandon(&mut self) -> Option<StreamId> {
        self.outstanding.take()
    }
}

impl Default for ConsumerContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: StreamId,
    pub data: Vec<u8>,
    /// Set when the message was reclaimed from a stalled consumer.
    pub redelivered: bool,
}

/// At-least-once FIFO queue over one stream and consumer group.
#[derive(Clone)]
pub struct StreamQueue {
    backend: Arc<dyn StreamBackend>,
    stream: String,
    group: String,
    stuck_timeout: Duration,
    stuck_check_interval: Duration,
    pending_scan_batch: usize,
    group_ready: Arc<OnceCell<()>>,
}

impl StreamQueue {
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            stream: stream.into(),
            group: group.into(),
            stuck_timeout: Duration::from_secs_f64(DEFAULT_STUCK_TIMEOUT_SECONDS),
            stuck_check_interval: Duration::from_secs_f64(DEFAULT_STUCK_CHECK_INTERVAL_SECONDS),
            pending_scan_batch: DEFAULT_PENDING_SCAN_BATCH,
            group_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn from_settings(backend: Arc<dyn StreamBackend>, settings: &RsqSettings) -> Self {
        Self::new(backend, &settings.stream_name, &settings.consumer_group)
            .with_stuck_timeout(Duration::from_secs_f64(settings.stuck_timeout_seconds))
            .with_stuck_check_interval(Duration::from_secs_f64(
                settings.stuck_check_interval_seconds,
            ))
            .with_pending_scan_batch(settings.pending_scan_batch)
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self.group_ready = Arc::new(OnceCell::new());
        self
    }

    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    pub fn with_stuck_check_interval(mut self, interval: Duration) -> Self {
        self.stuck_check_interval = interval;
        self
    }

    pub fn with_pending_scan_batch(mut self, batch: usize) -> Self {
        self.pending_scan_batch = batch.max(1);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    async fn ensure_group(&self) -> Result<()> {
        self.group_ready
            .get_or_try_init(|| async {
                self.backend
                    .create_group(&self.stream, &self.group)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to create consumer group {} on {}",
                            self.group, self.stream
                        )
                    })
            })
            .await?;
        Ok(())
    }

    pub async fn put(&self, data: &[u8]) -> Result<StreamId> {
        self.ensure_group().await?;
        let id = self
            .backend
            .append(&self.stream, data)
            .await
            .with_context(|| format!("failed to append to {}", self.stream))?;
        debug!(stream = %self.stream, message_id = %id, "message enqueued");
        Ok(id)
    }

    /// Returns the next message for `ctx`.
    ///
    /// The message returned by the previous call on the same context is
    /// acknowledged first. When the stuck-check interval has elapsed, the
    /// oldest pending entry idle for at least the stuck timeout is claimed and
    /// returned ahead of new messages. With `block`, waits up to `timeout`
    /// (forever when `None`) for a new message.
    pub async fn get(
        &self,
        ctx: &mut ConsumerContext,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        self.ensure_group().await?;
        self.task_done(ctx).await?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let now = Instant::now();
            let sweep_due = ctx.next_stuck_check.is_none_or(|due| now >= due);
            if sweep_due {
                ctx.next_stuck_check = Some(now + self.stuck_check_interval);
                if let Some(message) = self.reclaim_oldest_stuck(ctx).await? {
                    ctx.outstanding = Some(message.id);
                    return Ok(Some(message));
                }
            }

            let wait = if block {
                let until_sweep = ctx
                    .next_stuck_check
                    .map(|due| due.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.stuck_check_interval);
                let wait = match deadline {
                    Some(deadline) => {
                        until_sweep.min(deadline.saturating_duration_since(Instant::now()))
                    }
                    None => until_sweep,
                };
                Some(wait)
            } else {
                None
            };

            let entry = self
                .backend
                .read_group(&self.stream, &self.group, &ctx.name, wait)
                .await
                .with_context(|| format!("failed to read from {}", self.stream))?;
            if let Some(entry) = entry {
                ctx.outstanding = Some(entry.id);
                return Ok(Some(Message {
                    id: entry.id,
                    data: entry.payload,
                    redelivered: false,
                }));
            }

            if !block {
                return Ok(None);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
        }
    }

    async fn reclaim_oldest_stuck(&self, ctx: &ConsumerContext) -> Result<Option<Message>> {
        let mut after = None;
        loop {
            let page = self
                .backend
                .pending(&self.stream, &self.group, after, self.pending_scan_batch)
                .await
                .with_context(|| format!("failed to scan pending entries of {}", self.stream))?;
            let Some(last) = page.last() else {
                return Ok(None);
            };
            after = Some(last.id);
            let exhausted = page.len() < self.pending_scan_batch;

            // Pages come back in ID order, so the first overdue row is the oldest.
            if let Some(stuck) = page.iter().find(|row| row.idle >= self.stuck_timeout) {
                let claimed = self
                    .backend
                    .claim(
                        &self.stream,
                        &self.group,
                        &ctx.name,
                        self.stuck_timeout,
                        stuck.id,
                    )
                    .await
                    .with_context(|| format!("failed to claim {} on {}", stuck.id, self.stream))?;
                return Ok(claimed.map(|entry| {
                    info!(
                        stream = %self.stream,
                        message_id = %entry.id,
                        previous_consumer = %stuck.consumer,
                        consumer = %ctx.name,
                        idle_ms = stuck.idle.as_millis() as u64,
                        "reclaimed stuck message"
                    );
                    Message {
                        id: entry.id,
                        data: entry.payload,
                        redelivered: true,
                    }
                }));
            }

            if exhausted {
                return Ok(None);
            }
        }
    }

    /// Releases backend resources held for `ctx`. Call once the context is
    /// retired; an unacknowledged message stays pending.
    pub async fn release(&self, ctx: &ConsumerContext) -> Result<()> {
        self.backend
            .release_consumer(&ctx.name)
            .await
            .with_context(|| format!("failed to release consumer {}", ctx.name))
    }

    /// Acknowledges the message most recently returned to `ctx`, if any.
    pub async fn task_done(&self, ctx: &mut ConsumerContext) -> Result<()> {
        if let Some(id) = ctx.outstanding.take() {
            self.ack(id).await?;
        }
        Ok(())
    }

    pub async fn ack(&self, id: StreamId) -> Result<()> {
        self.backend
            .ack(&self.stream, &self.group, id)
            .await
            .with_context(|| format!("failed to ack {id} on {}", self.stream))
    }

    pub async fn len(&self) -> Result<u64> {
        self.backend.len(&self.stream).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.ensure_group().await?;
        let mut total = 0;
        let mut after = None;
        loop {
            let page = self
                .backend
                .pending(&self.stream, &self.group, after, self.pending_scan_batch)
                .await?;
            total += page.len();
            match page.last() {
                Some(last) if page.len() == self.pending_scan_batch => after = Some(last.id),
                _ => return Ok(total),
            }
        }
    }
}
