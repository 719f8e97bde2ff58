use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::time::{Duration, sleep};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{KvBackend, LockBackend, StreamBackend, StreamId};
use crate::client::{Client, JobHandle};
use crate::cron::{CronError, truncate_to_minute};
use crate::job::{DeadLetterEntry, JobError, JobEvent, JobOutcome};
use crate::kv::KeyValueStore;
use crate::lock::DistributedLock;
use crate::queue::{ConsumerContext, Message, StreamQueue};
use crate::registry::Registry;
use rsq_config::RsqSettings;

const WORKER_ID_PREFIX: &str = "rsq_worker_";

/// Result of handling one message.
#[derive(Debug)]
pub struct Dispatched {
    pub id: StreamId,
    pub redelivered: bool,
    pub result: Result<JobOutcome, JobError>,
}

/// Message handling shared by the scheduling loop and extra consumer loops.
#[derive(Clone)]
struct Consumer {
    registry: Arc<Registry>,
    queue: StreamQueue,
    dead_letter: Option<StreamQueue>,
}

impl Consumer {
    /// Dispatches `message`, routes failures, then acknowledges it whatever the
    /// handler outcome. A failed dead-letter write leaves the message pending
    /// so the stuck sweep can retry it.
    async fn process(&self, ctx: &mut ConsumerContext, message: Message) -> Result<Dispatched> {
        let result = self.registry.dispatch(&message.data).await;
        match &result {
            Ok(JobOutcome::Completed(_)) => {
                debug!(message_id = %message.id, redelivered = message.redelivered, "job completed");
            }
            Ok(JobOutcome::Skipped(reason)) => {
                debug!(message_id = %message.id, reason = %reason, "message skipped");
            }
            Err(err) => {
                if let Err(route_err) = self.route_failure(&message, err).await {
                    ctx.abandon();
                    return Err(route_err);
                }
            }
        }
        self.queue.task_done(ctx).await?;
        Ok(Dispatched {
            id: message.id,
            redelivered: message.redelivered,
            result,
        })
    }

    async fn route_failure(&self, message: &Message, err: &JobError) -> Result<()> {
        let func = err.func().unwrap_or("<unknown>");
        let Some(dead_letter) = self.dead_letter.as_ref() else {
            error!(
                message_id = %message.id,
                function_name = %func,
                error = %err,
                "job failed; no dead-letter stream configured, dropping it"
            );
            return Ok(());
        };
        let entry = DeadLetterEntry::new(&message.data, err, Utc::now());
        let payload = serde_json::to_vec(&entry).context("failed to encode dead-letter entry")?;
        let dead_id = dead_letter.put(&payload).await?;
        warn!(
            message_id = %message.id,
            function_name = %func,
            error = %err,
            dead_letter_stream = %dead_letter.stream(),
            dead_letter_id = %dead_id,
            "job failed; moved to dead-letter stream"
        );
        Ok(())
    }
}

/// Consumes job events and evaluates registered schedules.
///
/// Every worker sharing a backend may evaluate schedules; the scheduler lock
/// and the per-function last-run record make each matching minute fire once.
pub struct Worker {
    settings: RsqSettings,
    worker_id: String,
    registry: Arc<Registry>,
    queue: StreamQueue,
    dead_letter: Option<StreamQueue>,
    lock: DistributedLock,
    last_run: KeyValueStore,
    client: Client,
    next_schedule_at: DateTime<Utc>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new<B>(settings: RsqSettings, mut registry: Registry, backend: Arc<B>) -> Result<Self>
    where
        B: StreamBackend + LockBackend + KvBackend + 'static,
    {
        rsq_config::validate_settings(&settings)?;
        for job in &settings.cron_jobs {
            registry
                .bind_schedule(&job.function_name, &job.schedule)
                .with_context(|| format!("invalid cron job for {}", job.function_name))?;
        }

        let streams: Arc<dyn StreamBackend> = backend.clone();
        let queue = StreamQueue::from_settings(streams.clone(), &settings);
        let dead_letter = settings.dead_letter_stream.as_ref().map(|stream| {
            StreamQueue::from_settings(streams.clone(), &settings).with_stream(stream)
        });
        if dead_letter.is_none() {
            warn!("no dead-letter stream configured; failed jobs will only be logged");
        }
        let lock = DistributedLock::from_settings(backend.clone(), &settings);
        let last_run = KeyValueStore::new(backend, settings.last_run_key_prefix.clone());
        let client = Client::new(queue.clone());
        let worker_id = format!(
            "{WORKER_ID_PREFIX}{}_{}",
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..6]
        );

        let mut worker = Self {
            settings,
            worker_id,
            registry: Arc::new(registry),
            queue,
            dead_letter,
            lock,
            last_run,
            client,
            next_schedule_at: Utc::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        worker.next_schedule_at = worker.compute_next_schedule(Utc::now());
        Ok(worker)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn settings(&self) -> &RsqSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn next_schedule_at(&self) -> DateTime<Utc> {
        self.next_schedule_at
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Registers a handler with a schedule and pulls the next evaluation
    /// forward if this schedule fires sooner.
    pub fn schedule<F, Fut>(
        &mut self,
        name: impl Into<String>,
        expr: &str,
        handler: F,
    ) -> Result<(), CronError>
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Arc::make_mut(&mut self.registry).schedule(name, expr, handler)?;
        self.next_schedule_at = self.compute_next_schedule(Utc::now());
        Ok(())
    }

    /// Registers an unscheduled handler and returns a handle that enqueues
    /// calls to it.
    pub fn job<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> JobHandle
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        Arc::make_mut(&mut self.registry).job(name.clone(), handler);
        self.client.handle(name)
    }

    /// Soonest fire time strictly after `now` within the schedule horizon, or
    /// the horizon end when nothing fires before it.
    fn compute_next_schedule(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let horizon_end = now + TimeDelta::seconds(self.settings.schedule_horizon_seconds);
        let start = truncate_to_minute(now) + TimeDelta::minutes(1);
        self.registry
            .schedules()
            .iter()
            .filter_map(|job| job.expr.next(start, Some(horizon_end)))
            .min()
            .unwrap_or(horizon_end)
    }

    /// Enqueues every schedule matching the minute of `now` that has not
    /// fired for that minute yet. Returns how many events were enqueued; zero
    /// when another worker holds the scheduler lock.
    pub async fn evaluate_schedules(&self, now: DateTime<Utc>) -> Result<usize> {
        let tick = truncate_to_minute(now);
        let span = tracing::info_span!("rsq.schedule", tick = %tick.to_rfc3339());
        let timeout = Duration::from_secs_f64(self.settings.lock_acquire_timeout_seconds);
        let evaluated = self
            .lock
            .with_lock(true, Some(timeout), || self.fire_due_schedules(tick))
            .instrument(span)
            .await?;
        match evaluated {
            Some(enqueued) => Ok(enqueued),
            None => {
                debug!(tick = %tick.to_rfc3339(), "scheduler lock busy; skipping tick");
                Ok(0)
            }
        }
    }

    async fn fire_due_schedules(&self, tick: DateTime<Utc>) -> Result<usize> {
        let mut enqueued = 0;
        for job in self.registry.schedules() {
            let last: Option<DateTime<Utc>> = self.last_run.get(&job.func).await?;
            if last.is_some_and(|last| last >= tick) {
                debug!(function_name = %job.func, "already fired this minute");
                continue;
            }
            if !job.expr.matches(&tick) {
                continue;
            }
            let id = self.client.enqueue_event(&JobEvent::new(&job.func)).await?;
            self.last_run.put(&job.func, &tick).await?;
            info!(
                function_name = %job.func,
                schedule = %job.expr,
                message_id = %id,
                "scheduled job enqueued"
            );
            enqueued += 1;
        }
        Ok(enqueued)
    }

    fn consumer(&self) -> Consumer {
        Consumer {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            dead_letter: self.dead_letter.clone(),
        }
    }

    fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.settings.max_wait_seconds)
    }

    /// Evaluates schedules when due, then waits for a message for at most
    /// `max_wait_seconds` or until the next schedule, whichever comes first.
    async fn poll(&mut self, ctx: &mut ConsumerContext) -> Result<Option<Message>> {
        let now = Utc::now();
        if !self.registry.schedules().is_empty() && now >= self.next_schedule_at {
            self.evaluate_schedules(now).await?;
            self.next_schedule_at = self.compute_next_schedule(Utc::now());
        }

        let mut wait = self.max_wait();
        if !self.registry.schedules().is_empty() {
            let until_next = (self.next_schedule_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            wait = wait.min(until_next);
        }
        self.queue.get(ctx, true, Some(wait)).await
    }

    /// One iteration of the main loop. Returns `None` when no message arrived
    /// before the wait elapsed.
    pub async fn step(&mut self, ctx: &mut ConsumerContext) -> Result<Option<Dispatched>> {
        let Some(message) = self.poll(ctx).await? else {
            return Ok(None);
        };
        self.consumer().process(ctx, message).await.map(Some)
    }

    /// Runs the scheduling loop plus `worker_concurrency - 1` consumer-only
    /// loops until shutdown is requested. Errors are logged and retried after
    /// a jittered backoff.
    pub async fn run(mut self) -> Result<()> {
        let concurrency = self.settings.worker_concurrency.max(1);
        info!(
            worker_id = %self.worker_id,
            stream = %self.queue.stream(),
            concurrency,
            schedules = self.registry.schedules().len(),
            "worker started"
        );

        let mut handles = Vec::with_capacity(concurrency - 1);
        for _ in 1..concurrency {
            let consumer = self.consumer();
            let shutdown = self.shutdown.clone();
            let max_wait = self.max_wait();
            let backoff = self.settings.error_backoff_seconds;
            handles.push(tokio::spawn(async move {
                consumer_loop(consumer, shutdown, max_wait, backoff).await;
            }));
        }

        let mut ctx = ConsumerContext::new();
        let shutdown = self.shutdown.clone();
        while !shutdown.load(Ordering::SeqCst) {
            let polled = tokio::select! {
                _ = wait_for_flag(&shutdown) => break,
                polled = self.poll(&mut ctx) => polled,
            };
            let outcome = match polled {
                Ok(Some(message)) => self.consumer().process(&mut ctx, message).await.map(|_| ()),
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                error!(worker_id = %self.worker_id, error = %format!("{err:#}"), "worker loop error");
                let delay = calculate_jittered_delay(self.settings.error_backoff_seconds, 0.5);
                sleep_with_shutdown(&shutdown, delay).await;
            }
        }

        if let Err(err) = self.queue.release(&ctx).await {
            warn!(consumer = %ctx.name(), error = %format!("{err:#}"), "failed to release consumer");
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Like [`Worker::run`], stopping on SIGINT or SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        let shutdown = self.shutdown_handle();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });
        self.run().await
    }
}

async fn consumer_loop(
    consumer: Consumer,
    shutdown: Arc<AtomicBool>,
    max_wait: Duration,
    backoff_seconds: f64,
) {
    let mut ctx = ConsumerContext::new();
    while !shutdown.load(Ordering::SeqCst) {
        let polled = tokio::select! {
            _ = wait_for_flag(&shutdown) => break,
            polled = consumer.queue.get(&mut ctx, true, Some(max_wait)) => polled,
        };
        let outcome = match polled {
            Ok(Some(message)) => consumer.process(&mut ctx, message).await.map(|_| ()),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            error!(consumer = %ctx.name(), error = %format!("{err:#}"), "consumer loop error");
            let delay = calculate_jittered_delay(backoff_seconds, 0.5);
            sleep_with_shutdown(&shutdown, delay).await;
        }
    }
    if let Err(err) = consumer.queue.release(&ctx).await {
        warn!(consumer = %ctx.name(), error = %format!("{err:#}"), "failed to release consumer");
    }
}

fn calculate_jittered_delay(base_delay: f64, jitter_factor: f64) -> Duration {
    if base_delay <= 0.0 {
        return Duration::ZERO;
    }
    let jitter = jitter_factor.clamp(0.0, 0.99);
    let min_delay = (base_delay * (1.0 - jitter)).max(0.0);
    let mut max_delay = base_delay * (1.0 + jitter);
    if max_delay < min_delay {
        max_delay = min_delay;
    }
    let mut rng = rand::rng();
    let delay = rng.random_range(min_delay..=max_delay);
    Duration::from_secs_f64(delay)
}

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

async fn wait_for_flag(flag: &Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        sleep(SHUTDOWN_POLL).await;
    }
}

async fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, duration: Duration) {
    let mut remaining = duration;
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let next = remaining.min(SHUTDOWN_POLL);
        sleep(next).await;
        remaining = remaining.saturating_sub(next);
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::TimeZone;
    use rsq_config::CronJobConfig;
    use serde_json::json;
    use crate::backend::{PendingEntry, StreamEntry};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Memory backend that fails a configured number of calls.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing_append_stream: Option<String>,
        append_failures: AtomicUsize,
        read_failures: AtomicUsize,
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl StreamBackend for FlakyBackend {
        async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
            self.inner.create_group(stream, group).await
        }

        async fn append(&self, stream: &str, payload: &[u8]) -> Result<StreamId> {
            if self.failing_append_stream.as_deref() == Some(stream)
                && take_failure(&self.append_failures)
            {
                anyhow::bail!("connection reset while appending to {stream}");
            }
            self.inner.append(stream, payload).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            block: Option<Duration>,
        ) -> Result<Option<StreamEntry>> {
            if take_failure(&self.read_failures) {
                anyhow::bail!("connection reset while reading {stream}");
            }
            self.inner.read_group(stream, group, consumer, block).await
        }

        async fn pending(
            &self,
            stream: &str,
            group: &str,
            after: Option<StreamId>,
            count: usize,
        ) -> Result<Vec<PendingEntry>> {
            self.inner.pending(stream, group, after, count).await
        }

        async fn claim(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            id: StreamId,
        ) -> Result<Option<StreamEntry>> {
            self.inner.claim(stream, group, consumer, min_idle, id).await
        }

        async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<()> {
            self.inner.ack(stream, group, id).await
        }

        async fn range(
            &self,
            stream: &str,
            after: Option<StreamId>,
            count: usize,
        ) -> Result<Vec<StreamEntry>> {
            self.inner.range(stream, after, count).await
        }

        async fn len(&self, stream: &str) -> Result<u64> {
            self.inner.len(stream).await
        }
    }

    #[async_trait]
    impl LockBackend for FlakyBackend {
        async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_if_absent(key, token, ttl).await
        }

        async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool> {
            self.inner.delete_if_equals(key, token).await
        }
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            KvBackend::get(&self.inner, key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value).await
        }
    }

    fn settings() -> RsqSettings {
        RsqSettings {
            stream_name: "rsq:stream:worker-test".to_string(),
            ..RsqSettings::default()
        }
    }

    fn with_dead_letter(mut settings: RsqSettings) -> RsqSettings {
        settings.dead_letter_stream = Some("rsq:stream:worker-test:dead".to_string());
        settings
    }

    fn minute(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn noop_registry(names: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for name in names {
            registry.job(*name, |_| async { Ok(Value::Null) });
        }
        registry
    }

    async fn drain(queue: &StreamQueue) -> Vec<JobEvent> {
        let mut ctx = ConsumerContext::new();
        let mut events = Vec::new();
        while let Some(message) = queue.get(&mut ctx, false, None).await.unwrap() {
            events.push(serde_json::from_slice(&message.data).unwrap());
        }
        events
    }

    #[test]
    fn calculate_jittered_delay_handles_non_positive_base() {
        assert_eq!(calculate_jittered_delay(0.0, 0.5), Duration::ZERO);
        assert_eq!(calculate_jittered_delay(-1.0, 0.5), Duration::ZERO);
        let delay = calculate_jittered_delay(2.0, 0.5);
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn two_workers_fire_each_minute_once() {
        let backend = Arc::new(MemoryBackend::new());
        let mut first = Worker::new(settings(), Registry::new(), backend.clone()).unwrap();
        let mut second = Worker::new(settings(), Registry::new(), backend.clone()).unwrap();
        for worker in [&mut first, &mut second] {
            worker
                .schedule("reports.tick", "* * * * *", |_| async { Ok(Value::Null) })
                .unwrap();
        }

        let ticks = 5;
        for index in 0..ticks {
            let now = minute(10, index) + TimeDelta::seconds(7);
            let (a, b) = tokio::join!(first.evaluate_schedules(now), second.evaluate_schedules(now));
            assert_eq!(a.unwrap() + b.unwrap(), 1);
            let last: Option<DateTime<Utc>> = first.last_run.get("reports.tick").await.unwrap();
            assert_eq!(last, Some(minute(10, index)));
        }

        let events = drain(first.queue()).await;
        assert_eq!(events.len(), ticks as usize);
        assert!(events.iter().all(|event| event == &JobEvent::new("reports.tick")));
    }

    #[tokio::test(start_paused = true)]
    async fn skips_schedule_already_fired_this_minute() {
        let backend = Arc::new(MemoryBackend::new());
        let worker = Worker::new(
            settings(),
            {
                let mut registry = noop_registry(&[]);
                registry
                    .schedule("cleanup", "*/5 * * * *", |_| async { Ok(Value::Null) })
                    .unwrap();
                registry
            },
            backend.clone(),
        )
        .unwrap();

        worker.last_run.put("cleanup", &minute(3, 10)).await.unwrap();
        assert_eq!(worker.evaluate_schedules(minute(3, 10)).await.unwrap(), 0);
        assert_eq!(worker.evaluate_schedules(minute(3, 11)).await.unwrap(), 0);
        assert_eq!(worker.evaluate_schedules(minute(3, 15)).await.unwrap(), 1);
        assert_eq!(worker.queue().len().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_skips_tick() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker = Worker::new(settings(), Registry::new(), backend.clone()).unwrap();
        worker
            .schedule("reports.tick", "* * * * *", |_| async { Ok(Value::Null) })
            .unwrap();
        let other = DistributedLock::from_settings(backend.clone(), worker.settings());
        let _lease = other.acquire(false, None).await.unwrap().unwrap();

        assert_eq!(worker.evaluate_schedules(minute(0, 0)).await.unwrap(), 0);
        assert_eq!(worker.queue().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn next_schedule_is_soonest_match_or_horizon() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker = Worker::new(settings(), Registry::new(), backend).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
        assert_eq!(
            worker.compute_next_schedule(now),
            now + TimeDelta::seconds(worker.settings().schedule_horizon_seconds)
        );

        worker
            .schedule("hourly", "0 * * * *", |_| async { Ok(Value::Null) })
            .unwrap();
        worker
            .schedule("quarterly", "*/15 * * * *", |_| async { Ok(Value::Null) })
            .unwrap();
        assert_eq!(worker.compute_next_schedule(now), minute(10, 15));
        // Strictly after the current minute.
        assert_eq!(
            worker.compute_next_schedule(minute(10, 15)),
            minute(10, 30)
        );

        worker
            .schedule("never", "0 0 30 2 *", |_| async { Ok(Value::Null) })
            .unwrap();
        assert_eq!(worker.compute_next_schedule(now), minute(10, 15));
    }

    #[tokio::test(start_paused = true)]
    async fn step_dispatches_and_acks() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker = Worker::new(settings(), Registry::new(), backend).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = {
            let calls = calls.clone();
            worker.job("counter.bump", move |event: JobEvent| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"args": event.args}))
                }
            })
        };
        handle.delay(vec![json!(7)], serde_json::Map::new()).await.unwrap();

        let mut ctx = ConsumerContext::new();
        let dispatched = worker.step(&mut ctx).await.unwrap().unwrap();
        assert!(!dispatched.redelivered);
        assert_eq!(
            dispatched.result.unwrap(),
            JobOutcome::Completed(json!({"args": [7]}))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.outstanding(), None);
        assert_eq!(worker.queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn step_evaluates_due_schedules_first() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker = Worker::new(settings(), Registry::new(), backend).unwrap();
        worker
            .schedule("always", "* * * * *", |_| async { Ok(json!("ran")) })
            .unwrap();
        worker.next_schedule_at = Utc::now() - TimeDelta::seconds(1);

        let mut ctx = ConsumerContext::new();
        let dispatched = worker.step(&mut ctx).await.unwrap().unwrap();
        assert_eq!(dispatched.result.unwrap(), JobOutcome::Completed(json!("ran")));
        assert!(worker.next_schedule_at() > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_goes_to_dead_letter_and_is_acked() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker =
            Worker::new(with_dead_letter(settings()), Registry::new(), backend.clone()).unwrap();
        let handle = worker.job("mail.send", |_| async { anyhow::bail!("smtp down") });
        handle
            .delay(vec![json!("bob")], serde_json::Map::new())
            .await
            .unwrap();

        let mut ctx = ConsumerContext::new();
        let dispatched = worker.step(&mut ctx).await.unwrap().unwrap();
        assert!(matches!(dispatched.result, Err(JobError::Handler { .. })));
        assert_eq!(worker.queue().pending_count().await.unwrap(), 0);
        assert_eq!(worker.queue().len().await.unwrap(), 0);

        let entries = backend
            .range("rsq:stream:worker-test:dead", None, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let entry: DeadLetterEntry = serde_json::from_slice(&entries[0].payload).unwrap();
        assert_eq!(
            entry.event,
            json!({"func": "mail.send", "args": ["bob"], "kwargs": {}})
        );
        assert_eq!(entry.error, "handler mail.send failed: smtp down");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_dead_letter_is_dropped() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker = Worker::new(settings(), Registry::new(), backend).unwrap();
        worker
            .client()
            .enqueue("missing.fn", Vec::new(), serde_json::Map::new())
            .await
            .unwrap();

        let mut ctx = ConsumerContext::new();
        let dispatched = worker.step(&mut ctx).await.unwrap().unwrap();
        assert!(matches!(dispatched.result, Err(JobError::UnknownFunction(_))));
        assert_eq!(worker.queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_job_is_redelivered_to_another() {
        let backend = Arc::new(MemoryBackend::new());
        let mut worker = Worker::new(settings(), Registry::new(), backend.clone()).unwrap();
        worker.job("slow", |_| async { Ok(json!("done")) });
        worker
            .client()
            .enqueue("slow", Vec::new(), serde_json::Map::new())
            .await
            .unwrap();

        let mut crashed = ConsumerContext::new();
        worker.queue().get(&mut crashed, false, None).await.unwrap().unwrap();
        drop(crashed);

        let mut ctx = ConsumerContext::new();
        let dispatched = worker.step(&mut ctx).await.unwrap().unwrap();
        assert!(dispatched.redelivered);
        assert_eq!(dispatched.result.unwrap(), JobOutcome::Completed(json!("done")));
    }

    #[tokio::test]
    async fn configured_cron_jobs_bind_to_registered_handlers() {
        let backend = Arc::new(MemoryBackend::new());
        let mut settings = settings();
        settings.cron_jobs = vec![CronJobConfig {
            function_name: "nightly".to_string(),
            schedule: "0 3 * * *".to_string(),
        }];

        let worker =
            Worker::new(settings.clone(), noop_registry(&["nightly"]), backend.clone()).unwrap();
        assert_eq!(worker.registry().schedules().len(), 1);
        assert_eq!(worker.registry().schedules()[0].expr.as_str(), "0 3 * * *");

        let err = Worker::new(settings.clone(), Registry::new(), backend.clone())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("nightly"));

        settings.cron_jobs[0].schedule = "0 3 * *".to_string();
        assert!(Worker::new(settings, noop_registry(&["nightly"]), backend).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_jobs_until_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let mut settings = settings();
        settings.worker_concurrency = 3;
        let mut worker = Worker::new(settings, Registry::new(), backend).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = {
            let calls = calls.clone();
            worker.job("count", move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };
        for _ in 0..10 {
            handle.delay(Vec::new(), serde_json::Map::new()).await.unwrap();
        }

        let queue = worker.queue().clone();
        let shutdown = worker.shutdown_handle();
        let running = tokio::spawn(worker.run());
        while calls.load(Ordering::SeqCst) < 10 {
            sleep(Duration::from_millis(50)).await;
        }
        shutdown.store(true, Ordering::SeqCst);
        running.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn redis_backed_workers_fire_each_minute_once() {
        let Some(ctx) = crate::test_support::RedisTestContext::try_new().await.unwrap() else {
            return;
        };
        let mut first = Worker::new(ctx.settings.clone(), Registry::new(), ctx.backend.clone()).unwrap();
        let mut second =
            Worker::new(ctx.settings.clone(), Registry::new(), ctx.backend.clone()).unwrap();
        for worker in [&mut first, &mut second] {
            worker
                .schedule("reports.tick", "* * * * *", |_| async { Ok(Value::Null) })
                .unwrap();
        }

        for index in 0..3 {
            let now = minute(12, index);
            let (a, b) = tokio::join!(first.evaluate_schedules(now), second.evaluate_schedules(now));
            assert_eq!(a.unwrap() + b.unwrap(), 1);
        }
        assert_eq!(first.queue().len().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dead_letter_write_keeps_message_pending() {
        let dead_letter = "rsq:stream:worker-test:dead";
        let backend = Arc::new(FlakyBackend {
            failing_append_stream: Some(dead_letter.to_string()),
            append_failures: AtomicUsize::new(1),
            ..FlakyBackend::default()
        });
        let mut worker =
            Worker::new(with_dead_letter(settings()), Registry::new(), backend.clone()).unwrap();
        let handle = worker.job("mail.send", |_| async { anyhow::bail!("smtp down") });
        let id = handle.delay(Vec::new(), serde_json::Map::new()).await.unwrap();

        let mut ctx = ConsumerContext::new();
        assert!(worker.step(&mut ctx).await.is_err());
        assert_eq!(ctx.outstanding(), None);
        assert_eq!(worker.queue().pending_count().await.unwrap(), 1);
        assert_eq!(worker.queue().len().await.unwrap(), 1);

        // The same context keeps going; the sweep hands the message back.
        let dispatched = worker.step(&mut ctx).await.unwrap().unwrap();
        assert_eq!(dispatched.id, id);
        assert!(dispatched.redelivered);
        assert!(matches!(dispatched.result, Err(JobError::Handler { .. })));
        assert_eq!(worker.queue().pending_count().await.unwrap(), 0);
        assert_eq!(backend.inner.len(dead_letter).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_survives_transient_read_errors() {
        let backend = Arc::new(FlakyBackend {
            read_failures: AtomicUsize::new(2),
            ..FlakyBackend::default()
        });
        let mut settings = settings();
        settings.worker_concurrency = 2;
        let mut worker = Worker::new(settings, Registry::new(), backend.clone()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = {
            let calls = calls.clone();
            worker.job("count", move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };
        for _ in 0..3 {
            handle.delay(Vec::new(), serde_json::Map::new()).await.unwrap();
        }

        let queue = worker.queue().clone();
        let shutdown = worker.shutdown_handle();
        let running = tokio::spawn(worker.run());
        while calls.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(50)).await;
        }
        shutdown.store(true, Ordering::SeqCst);
        running.await.unwrap().unwrap();

        assert_eq!(backend.read_failures.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_rejects_invalid_settings() {
        let backend = Arc::new(MemoryBackend::new());
        let mut bad = settings();
        bad.stuck_timeout_seconds = -1.0;
        let err = Worker::new(bad, Registry::new(), backend.clone())
            .err()
            .unwrap();
        assert!(err.to_string().contains("stuck_timeout_seconds"));

        let mut bad = settings();
        bad.max_wait_seconds = f64::NAN;
        assert!(Worker::new(bad, Registry::new(), backend.clone()).is_err());

        let mut bad = settings();
        bad.schedule_horizon_seconds = i64::MAX;
        assert!(Worker::new(bad, Registry::new(), backend).is_err());
    }
}
