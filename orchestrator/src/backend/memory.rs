use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{KvBackend, LockBackend, PendingEntry, StreamBackend, StreamEntry, StreamId};

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<StreamId, Vec<u8>>,
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingRecord>,
}

struct PendingRecord {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    locks: HashMap<String, (String, Instant)>,
    values: HashMap<String, String>,
}

/// Process-local backend with the same delivery, claim and expiry rules as
/// the Redis backend. Idle times and TTLs follow `tokio::time`, so tests can
/// drive them with a paused clock.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory backend state poisoned"))
    }

    fn try_read(&self, stream: &str, group: &str, consumer: &str) -> Result<Option<StreamEntry>> {
        let mut state = self.state()?;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;
        let next = entries
            .range((Bound::Excluded(group_state.last_delivered), Bound::Unbounded))
            .next()
            .map(|(id, payload)| StreamEntry {
                id: *id,
                payload: payload.clone(),
            });
        if let Some(entry) = next.as_ref() {
            group_state.last_delivered = entry.id;
            group_state.pending.insert(
                entry.id,
                PendingRecord {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
        }
        Ok(next)
    }
}

fn nogroup(stream: &str, group: &str) -> anyhow::Error {
    anyhow::anyhow!("NOGROUP no consumer group '{group}' for stream '{stream}'")
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state()?;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<StreamId> {
        let id = {
            let mut state = self.state()?;
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            let now_ms = Utc::now().timestamp_millis().max(0) as u64;
            let id = if now_ms > stream_state.last_id.ms {
                StreamId::new(now_ms, 0)
            } else {
                stream_state.last_id.successor()
            };
            stream_state.last_id = id;
            stream_state.entries.insert(id, payload.to_vec());
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Option<Duration>,
    ) -> Result<Option<StreamEntry>> {
        let deadline = block.map(|wait| Instant::now() + wait);
        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            if let Some(entry) = self.try_read(stream, group, consumer)? {
                return Ok(Some(entry));
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let state = self.state()?;
        let group_state = state
            .streams
            .get(stream)
            .and_then(|stream_state| stream_state.groups.get(group))
            .ok_or_else(|| nogroup(stream, group))?;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let now = Instant::now();
        Ok(group_state
            .pending
            .range((lower, Bound::Unbounded))
            .take(count)
            .map(|(id, record)| PendingEntry {
                id: *id,
                consumer: record.consumer.clone(),
                idle: now.saturating_duration_since(record.delivered_at),
                deliveries: record.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: StreamId,
    ) -> Result<Option<StreamEntry>> {
        let mut state = self.state()?;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| nogroup(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| nogroup(stream, group))?;
        let now = Instant::now();
        let Some(record) = group_state.pending.get_mut(&id) else {
            return Ok(None);
        };
        if now.saturating_duration_since(record.delivered_at) < min_idle {
            return Ok(None);
        }
        let Some(payload) = entries.get(&id) else {
            group_state.pending.remove(&id);
            return Ok(None);
        };
        record.consumer = consumer.to_string();
        record.delivered_at = now;
        record.deliveries += 1;
        Ok(Some(StreamEntry {
            id,
            payload: payload.clone(),
        }))
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<()> {
        let mut state = self.state()?;
        if let Some(stream_state) = state.streams.get_mut(stream) {
            if let Some(group_state) = stream_state.groups.get_mut(group) {
                group_state.pending.remove(&id);
            }
            stream_state.entries.remove(&id);
        }
        Ok(())
    }

    async fn range(
        &self,
        stream: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let state = self.state()?;
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(stream_state
            .entries
            .range((lower, Bound::Unbounded))
            .take(count)
            .map(|(id, payload)| StreamEntry {
                id: *id,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let state = self.state()?;
        Ok(state
            .streams
            .get(stream)
            .map(|stream_state| stream_state.entries.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state()?;
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(key)
            && *expires_at > now
        {
            return Ok(false);
        }
        state
            .locks
            .insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool> {
        let mut state = self.state()?;
        let now = Instant::now();
        let matches = match state.locks.get(key) {
            Some((held, expires_at)) => *expires_at > now && held == token,
            None => false,
        };
        if matches {
            state.locks.remove(key);
        }
        Ok(matches)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state()?;
        Ok(state.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state()?;
        state.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "rsq:stream:memory-test";
    const GROUP: &str = "workers";

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let backend = MemoryBackend::new();
        let mut last = StreamId::MIN;
        for index in 0..50u8 {
            let id = backend.append(STREAM, &[index]).await.unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(backend.len(STREAM).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn read_group_requires_group() {
        let backend = MemoryBackend::new();
        backend.append(STREAM, b"x").await.unwrap();
        let err = backend
            .read_group(STREAM, GROUP, "c1", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }

    #[tokio::test]
    async fn read_group_delivers_each_entry_once() {
        let backend = MemoryBackend::new();
        backend.create_group(STREAM, GROUP).await.unwrap();
        let first = backend.append(STREAM, b"one").await.unwrap();
        let second = backend.append(STREAM, b"two").await.unwrap();

        let a = backend.read_group(STREAM, GROUP, "c1", None).await.unwrap();
        let b = backend.read_group(STREAM, GROUP, "c2", None).await.unwrap();
        let c = backend.read_group(STREAM, GROUP, "c1", None).await.unwrap();
        assert_eq!(a.unwrap().id, first);
        assert_eq!(b.unwrap().id, second);
        assert!(c.is_none());

        let pending = backend.pending(STREAM, GROUP, None, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[1].consumer, "c2");

        backend.ack(STREAM, GROUP, first).await.unwrap();
        let pending = backend.pending(STREAM, GROUP, None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(backend.len(STREAM).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_wakes_on_append() {
        let backend = MemoryBackend::new();
        backend.create_group(STREAM, GROUP).await.unwrap();
        let reader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .read_group(STREAM, GROUP, "c1", Some(Duration::from_secs(30)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        let id = backend.append(STREAM, b"late").await.unwrap();
        let entry = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.payload, b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_times_out() {
        let backend = MemoryBackend::new();
        backend.create_group(STREAM, GROUP).await.unwrap();
        let started = Instant::now();
        let entry = backend
            .read_group(STREAM, GROUP, "c1", Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert!(entry.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn claim_respects_min_idle_and_single_winner() {
        let backend = MemoryBackend::new();
        backend.create_group(STREAM, GROUP).await.unwrap();
        let id = backend.append(STREAM, b"job").await.unwrap();
        backend
            .read_group(STREAM, GROUP, "dead", None)
            .await
            .unwrap()
            .unwrap();

        let min_idle = Duration::from_secs(5);
        let early = backend
            .claim(STREAM, GROUP, "c1", min_idle, id)
            .await
            .unwrap();
        assert!(early.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let won = backend
            .claim(STREAM, GROUP, "c1", min_idle, id)
            .await
            .unwrap();
        let lost = backend
            .claim(STREAM, GROUP, "c2", min_idle, id)
            .await
            .unwrap();
        assert_eq!(won.unwrap().payload, b"job");
        assert!(lost.is_none());

        let pending = backend.pending(STREAM, GROUP, None, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_expires_after_ttl() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(2);
        assert!(backend.set_if_absent("lock", "a", ttl).await.unwrap());
        assert!(!backend.set_if_absent("lock", "b", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(backend.set_if_absent("lock", "b", ttl).await.unwrap());
        assert!(!backend.delete_if_equals("lock", "a").await.unwrap());
        assert!(backend.delete_if_equals("lock", "b").await.unwrap());
    }

    #[tokio::test]
    async fn kv_last_write_wins() {
        let backend = MemoryBackend::new();
        assert_eq!(KvBackend::get(&backend, "k").await.unwrap(), None);
        KvBackend::set(&backend, "k", "1").await.unwrap();
        KvBackend::set(&backend, "k", "2").await.unwrap();
        assert_eq!(
            KvBackend::get(&backend, "k").await.unwrap(),
            Some("2".to_string())
        );
    }
}
