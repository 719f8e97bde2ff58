use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId as RedisStreamId, StreamPendingCountReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;

use super::{KvBackend, LockBackend, PendingEntry, StreamBackend, StreamEntry, StreamId};

const RELEASE_LOCK_IF_OWNER_LUA: &str = include_str!("../lua/release_lock_if_owner.lua");

/// Field name holding the payload inside each stream entry.
const PAYLOAD_FIELD: &str = "data";

fn summarize_redis_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else if host.is_empty() {
        format!("{scheme}://")
    } else {
        format!("{scheme}://{host}")
    }
}

fn is_tls_handshake_error(err: &redis::RedisError) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("tls handshake") || message.contains("handshake eof")
}

fn redis_connect_context(dsn: &str, err: &redis::RedisError) -> String {
    let summary = summarize_redis_dsn(dsn);
    let mut context = if summary.is_empty() {
        "failed to connect to Redis".to_string()
    } else {
        format!("failed to connect to Redis ({summary})")
    };

    if is_tls_handshake_error(err) {
        if dsn.starts_with("rediss://") || dsn.starts_with("valkeys://") {
            context.push_str(
                "; TLS handshake failed - verify the endpoint supports TLS and the port/certs are correct",
            );
        } else {
            context.push_str(
                "; TLS handshake failed - if Redis requires TLS, use rediss:// for the DSN",
            );
        }
    }

    context
}

/// Redis-backed streams, locks and key-value storage.
///
/// Ordinary commands share one multiplexed connection. `XREADGROUP ... BLOCK`
/// holds its connection until it returns, so every consumer gets its own
/// connection for blocking reads. That connection is cached until
/// `release_consumer` is called for the consumer name.
pub struct RedisBackend {
    dsn: String,
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    release_lock_if_owner_script: Script,
}

impl RedisBackend {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let client = redis::Client::open(dsn).with_context(|| "failed to create Redis client")?;
        let conn = open_connection(&client, dsn).await?;
        Ok(Self {
            dsn: dsn.to_string(),
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            release_lock_if_owner_script: Script::new(RELEASE_LOCK_IF_OWNER_LUA),
        })
    }

    /// DSN with credentials and database stripped, for log lines.
    pub fn endpoint(&self) -> String {
        summarize_redis_dsn(&self.dsn)
    }

    pub async fn flushdb(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn blocking_connection(&self, consumer: &str) -> Result<MultiplexedConnection> {
        let mut connections = self.blocking.lock().await;
        if let Some(conn) = connections.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = open_connection(&self.client, &self.dsn).await?;
        connections.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }
}

async fn open_connection(client: &redis::Client, dsn: &str) -> Result<MultiplexedConnection> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|err| {
            let context = redis_connect_context(dsn, &err);
            anyhow::Error::new(err).context(context)
        })
}

fn parse_id(raw: &str) -> Result<StreamId> {
    raw.parse()
}

fn to_entry(raw: &RedisStreamId) -> Result<StreamEntry> {
    let payload = raw
        .get::<Vec<u8>>(PAYLOAD_FIELD)
        .with_context(|| format!("stream entry {} has no '{PAYLOAD_FIELD}' field", raw.id))?;
    Ok(StreamEntry {
        id: parse_id(&raw.id)?,
        payload,
    })
}

fn exclusive_start(after: Option<StreamId>) -> String {
    match after {
        Some(id) => format!("({id}"),
        None => "-".to_string(),
    }
}

fn duration_ms(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to create group {group} on {stream}"))),
        }
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<StreamId> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]).await?;
        parse_id(&id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Option<Duration>,
    ) -> Result<Option<StreamEntry>> {
        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        let mut conn = match block {
            Some(wait) => {
                // BLOCK 0 waits forever.
                options = options.block(duration_ms(wait).max(1));
                self.blocking_connection(consumer).await?
            }
            None => self.conn.clone(),
        };
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;
        let Some(reply) = reply else {
            return Ok(None);
        };
        reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .next()
            .map(to_entry)
            .transpose()
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, exclusive_start(after), "+", count)
            .await?;
        reply
            .ids
            .into_iter()
            .map(|row| {
                Ok(PendingEntry {
                    id: parse_id(&row.id)?,
                    consumer: row.consumer,
                    idle: Duration::from_millis(row.last_delivered_ms as u64),
                    deliveries: row.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: StreamId,
    ) -> Result<Option<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(
                stream,
                group,
                consumer,
                duration_ms(min_idle),
                &[id.to_string()],
            )
            .await?;
        reply.ids.first().map(to_entry).transpose()
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<()> {
        let mut conn = self.conn.clone();
        let id = id.to_string();
        redis::pipe()
            .atomic()
            .xack(stream, group, &[&id])
            .xdel(stream, &[&id])
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn range(
        &self,
        stream: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, exclusive_start(after), "+", count)
            .await?;
        reply.ids.iter().map(to_entry).collect()
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn release_consumer(&self, consumer: &str) -> Result<()> {
        self.blocking.lock().await.remove(consumer);
        Ok(())
    }
}

#[async_trait]
impl LockBackend for RedisBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(duration_ms(ttl).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_lock_if_owner_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }
}
