//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Topic**: one stream per topic, entries carry a single `payload` field
//! - **Consumer group**: shared by all workers of a queue; each entry goes to
//!   one consumer
//! - **Redelivery**: entries left pending longer than the visibility timeout
//!   are taken over with XAUTOCLAIM
//! - **Retries**: sorted set `<topic>:delayed` scored by due time (ms), used
//!   for immediate retries too; due members are moved back onto the stream by
//!   a Lua script
//! - **Dead-letter queue**: stream `<topic>:dlq`
//!
//! Reads never use `BLOCK`: a blocking read would stall every other command
//! sharing the multiplexed connection. `consume` polls instead.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use conveyor_broker::{AckHandle, Broker, BrokerError, Delivery};

use super::LazyConnection;

const DEFAULT_GROUP: &str = "conveyor-workers";
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROMOTE_BATCH: usize = 100;

/// Moves due members of KEYS[1] (zset) onto KEYS[2] (stream) atomically.
const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, payload in ipairs(due) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('XADD', KEYS[2], '*', 'payload', payload)
end
return #due
"#;

fn unavailable(op: &str, e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(format!("{op} failed: {e}"))
}

fn delayed_key(topic: &str) -> String {
    format!("{topic}:delayed")
}

fn dlq_key(topic: &str) -> String {
    format!("{topic}:dlq")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn due_at(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Every requeue goes through the delayed set, even with no delay. ZADD of
/// the same member only rescores it, so a requeue repeated after a failed
/// release does not leave a second copy behind.
fn schedule_cmd(topic: &str, payload: Vec<u8>, due_ms: i64) -> redis::Cmd {
    let mut cmd = redis::cmd("ZADD");
    cmd.arg(delayed_key(topic)).arg(due_ms).arg(payload);
    cmd
}

#[derive(Debug)]
pub struct RedisStreamsBroker {
    conn: LazyConnection,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
    promote: redis::Script,
    known_groups: Mutex<HashSet<String>>,
}

impl RedisStreamsBroker {
    /// Validate `url`; the connection itself is opened on first use.
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let conn = LazyConnection::open(url).map_err(|e| BrokerError::Config(e.to_string()))?;
        Ok(Self {
            conn,
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            promote: redis::Script::new(PROMOTE_DUE),
            known_groups: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    async fn conn(&self) -> Result<ConnectionManager, BrokerError> {
        self.conn.get().await.map_err(|e| unavailable("connect", e))
    }

    /// Create the consumer group (and stream) once per topic.
    async fn ensure_group(&self, conn: &mut ConnectionManager, topic: &str) -> Result<(), BrokerError> {
        if self
            .known_groups
            .lock()
            .map(|g| g.contains(topic))
            .unwrap_or(false)
        {
            return Ok(());
        }

        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, ()>(conn)
            .await;
        match created {
            Ok(()) => debug!(topic, group = %self.group, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(unavailable("XGROUP CREATE", e)),
        }

        if let Ok(mut groups) = self.known_groups.lock() {
            groups.insert(topic.to_string());
        }
        Ok(())
    }

    async fn promote_due(&self, conn: &mut ConnectionManager, topic: &str) -> Result<(), BrokerError> {
        let moved: i64 = self
            .promote
            .key(delayed_key(topic))
            .key(topic)
            .arg(now_ms())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await
            .map_err(|e| unavailable("promote delayed", e))?;
        if moved > 0 {
            debug!(topic, moved, "delayed messages due");
        }
        Ok(())
    }

    /// Take over one entry another consumer left pending for too long.
    async fn claim_stale(
        &self,
        conn: &mut ConnectionManager,
        topic: &str,
    ) -> Result<Option<(String, Vec<u8>)>, BrokerError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XAUTOCLAIM", e))?;
        Ok(parse_autoclaim(reply).into_iter().next())
    }

    async fn read_new(
        &self,
        conn: &mut ConnectionManager,
        topic: &str,
    ) -> Result<Option<(String, Vec<u8>)>, BrokerError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(topic)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XREADGROUP", e))?;
        Ok(parse_read_reply(reply).into_iter().next())
    }

    async fn release(&self, conn: &mut ConnectionManager, handle: &AckHandle) -> Result<(), BrokerError> {
        let acked: i64 = redis::cmd("XACK")
            .arg(&handle.topic)
            .arg(&self.group)
            .arg(&handle.id)
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XACK", e))?;
        if acked == 0 {
            return Err(BrokerError::UnknownDelivery(handle.id.clone()));
        }
        redis::cmd("XDEL")
            .arg(&handle.topic)
            .arg(&handle.id)
            .query_async::<_, i64>(conn)
            .await
            .map_err(|e| unavailable("XDEL", e))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()), err)]
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        self.ensure_group(&mut conn, topic).await?;
        redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| unavailable("XADD", e))?;
        Ok(())
    }

    async fn consume(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.conn().await?;
        self.ensure_group(&mut conn, topic).await?;

        loop {
            self.promote_due(&mut conn, topic).await?;

            let (entry, redelivered) = match self.claim_stale(&mut conn, topic).await? {
                Some(entry) => (Some(entry), true),
                None => (self.read_new(&mut conn, topic).await?, false),
            };

            if let Some((id, payload)) = entry {
                if redelivered {
                    warn!(topic, id = %id, "reclaimed entry past visibility timeout");
                }
                return Ok(Some(Delivery {
                    payload,
                    handle: AckHandle {
                        topic: topic.to_string(),
                        id,
                    },
                    redelivered,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
    }

    #[instrument(skip(self), fields(topic = %handle.topic, id = %handle.id), err)]
    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        self.release(&mut conn, handle).await
    }

    #[instrument(skip(self, payload), fields(topic = %handle.topic, id = %handle.id, delay_ms = delay.as_millis() as u64), err)]
    async fn requeue(
        &self,
        handle: &AckHandle,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        schedule_cmd(&handle.topic, payload, due_at(now_ms(), delay))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| unavailable("ZADD", e))?;

        match self.release(&mut conn, handle).await {
            Err(BrokerError::UnknownDelivery(id)) => {
                warn!(topic = %handle.topic, id = %id, "requeue of stale delivery");
                Ok(())
            }
            other => other,
        }
    }

    #[instrument(skip(self), fields(topic = %handle.topic, id = %handle.id), err)]
    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(&handle.topic)
            .arg(&handle.id)
            .arg(&handle.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("XRANGE", e))?;
        let payload = parse_entries(reply)
            .into_iter()
            .next()
            .map(|(_, payload)| payload)
            .unwrap_or_default();

        redis::cmd("XADD")
            .arg(dlq_key(&handle.topic))
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("reason")
            .arg(reason)
            .arg("original_id")
            .arg(&handle.id)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| unavailable("DLQ XADD", e))?;
        warn!(topic = %handle.topic, id = %handle.id, reason, "entry moved to dead-letter queue");

        self.release(&mut conn, handle).await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| unavailable("PING", e))
    }
}

// Reply parsing. Entry format: [id, [field1, value1, field2, value2, ...]]

fn parse_entry(entry: redis::Value) -> Option<(String, Vec<u8>)> {
    let redis::Value::Bulk(mut parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }
    let fields = parts.pop()?;
    let id = match parts.pop()? {
        redis::Value::Data(id) => String::from_utf8_lossy(&id).into_owned(),
        redis::Value::Status(id) => id,
        _ => return None,
    };

    let redis::Value::Bulk(fields) = fields else {
        return None;
    };
    let mut iter = fields.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        if let (redis::Value::Data(key), redis::Value::Data(value)) = (key, value) {
            if key == b"payload" {
                return Some((id, value));
            }
        }
    }
    None
}

/// Entries of an XRANGE reply (or the entry list inside other replies).
/// Nil entries (deleted while pending) are skipped.
fn parse_entries(reply: redis::Value) -> Vec<(String, Vec<u8>)> {
    match reply {
        redis::Value::Bulk(entries) => entries.into_iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// XREADGROUP reply: nil, or [[stream, [entry, ...]], ...].
fn parse_read_reply(reply: redis::Value) -> Vec<(String, Vec<u8>)> {
    let redis::Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    streams
        .into_iter()
        .filter_map(|stream| match stream {
            redis::Value::Bulk(mut parts) if parts.len() == 2 => parts.pop(),
            _ => None,
        })
        .flat_map(parse_entries)
        .collect()
}

/// XAUTOCLAIM reply: [next_cursor, [entry, ...], (deleted ids, Redis 7+)].
fn parse_autoclaim(reply: redis::Value) -> Vec<(String, Vec<u8>)> {
    match reply {
        redis::Value::Bulk(mut parts) if parts.len() >= 2 => parse_entries(parts.swap_remove(1)),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use redis::Value;

    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> Value {
        Value::Bulk(vec![data(id), Value::Bulk(vec![data("payload"), data(payload)])])
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("tasks"),
            Value::Bulk(vec![entry("1-0", "{\"a\":1}"), entry("1-1", "x")]),
        ])]);
        let entries = parse_read_reply(reply);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("1-0".to_string(), b"{\"a\":1}".to_vec()));
        assert_eq!(entries[1].0, "1-1");

        assert!(parse_read_reply(Value::Nil).is_empty());
    }

    #[test]
    fn parses_xautoclaim_reply_and_skips_deleted() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![Value::Nil, entry("5-0", "late")]),
            Value::Bulk(vec![data("4-0")]),
        ]);
        let entries = parse_autoclaim(reply);
        assert_eq!(entries, vec![("5-0".to_string(), b"late".to_vec())]);

        let empty = Value::Bulk(vec![data("0-0"), Value::Bulk(vec![])]);
        assert!(parse_autoclaim(empty).is_empty());
    }

    #[test]
    fn entry_without_payload_field_is_ignored() {
        let e = Value::Bulk(vec![data("1-0"), Value::Bulk(vec![data("other"), data("v")])]);
        assert_eq!(parse_entry(e), None);
    }

    #[test]
    fn immediate_requeue_is_scheduled_for_now() {
        assert_eq!(due_at(1_000, Duration::ZERO), 1_000);
        assert_eq!(due_at(1_000, Duration::from_millis(250)), 1_250);
        assert_eq!(due_at(1_000, Duration::MAX), i64::MAX);

        let packed = schedule_cmd("conveyor:tasks", b"p".to_vec(), 1_000).get_packed_command();
        let expected = redis::cmd("ZADD")
            .arg("conveyor:tasks:delayed")
            .arg(1_000)
            .arg(b"p".to_vec())
            .get_packed_command();
        assert_eq!(packed, expected);
    }

    #[test]
    fn key_layout() {
        assert_eq!(delayed_key("conveyor:tasks"), "conveyor:tasks:delayed");
        assert_eq!(dlq_key("conveyor:tasks"), "conveyor:tasks:dlq");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(matches!(
            RedisStreamsBroker::new("nope"),
            Err(BrokerError::Config(_))
        ));
        let broker = RedisStreamsBroker::new("redis://localhost:6379")
            .unwrap()
            .with_group("g")
            .with_consumer("c1");
        assert_eq!(broker.group, "g");
        assert_eq!(broker.consumer, "c1");
    }
}
