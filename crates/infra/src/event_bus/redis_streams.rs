//! Redis Streams adapters (durable, at-least-once delivery).
//!
//! - **Stream key**: the topic name (e.g. `orders`)
//! - **Consumer group**: one per consuming service (`order-service-group`)
//! - **Consumer**: a stable name per process, so its pending entries survive restarts
//! - **Dead-letter stream**: `<topic>:dlq`
//!
//! ## Publishing
//!
//! XADD runs inside a Lua script that first checks a per-event dedupe key
//! (`<topic>:dedupe:<event_id>`). The check and the append are atomic, so a
//! publish retried after a lost reply never appends the event twice. Each
//! entry carries `event_id`, `event_type`, `key`, `seq` and `payload`.
//!
//! ## Consuming
//!
//! On start a source first re-reads its own pending entries (id `0`): messages
//! delivered before a crash but never acknowledged. Once that list is empty it
//! blocks on new entries (id `>`). XACK happens only on `ack`/`dead_letter`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{ErrorKind, RedisError, Value};
use tracing::{debug, info, instrument, warn};

use orderflow_events::{Delivery, EventEnvelope, EventPublisher, MessageSource, PublishError, SourceError};

use crate::config::BrokerConfig;

/// Append unless the event id was already seen.
///
/// KEYS[1] stream, KEYS[2] dedupe key; ARGV[1] dedupe ttl (s), ARGV[2..] field/value pairs.
const APPEND_ONCE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return false
end
local id = redis.call('XADD', KEYS[1], '*', unpack(ARGV, 2))
redis.call('SET', KEYS[2], id, 'EX', ARGV[1])
return id
"#;

fn dedupe_key(topic: &str, event_id: &str) -> String {
    format!("{topic}:dedupe:{event_id}")
}

/// Connection-level failures are worth retrying; command errors are not.
fn is_transient(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(
            err.kind(),
            ErrorKind::TryAgain
                | ErrorKind::BusyLoadingError
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
                | ErrorKind::ReadOnly
        )
}

fn publish_error(operation: &str, err: RedisError) -> PublishError {
    if is_transient(&err) {
        PublishError::Transient(format!("{operation}: {err}"))
    } else {
        PublishError::Fatal(format!("{operation}: {err}"))
    }
}

fn source_error(operation: &str, err: RedisError) -> SourceError {
    if is_transient(&err) {
        SourceError::Transient(format!("{operation}: {err}"))
    } else {
        SourceError::Fatal(format!("{operation}: {err}"))
    }
}

/// Producer session: one managed connection, writes in call order.
pub struct RedisStreamsPublisher {
    conn: ConnectionManager,
    script: redis::Script,
    seq: AtomicU64,
    max_message_bytes: usize,
    dedupe_ttl_secs: u64,
    closed: AtomicBool,
}

impl RedisStreamsPublisher {
    #[instrument(skip(config), fields(url = %config.url), err)]
    pub async fn connect(config: &BrokerConfig) -> Result<Self, PublishError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| PublishError::Fatal(format!("invalid broker url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| publish_error("connect", e))?;

        info!("connected event publisher to redis");

        Ok(Self {
            conn,
            script: redis::Script::new(APPEND_ONCE_SCRIPT),
            seq: AtomicU64::new(0),
            max_message_bytes: config.max_message_bytes,
            dedupe_ttl_secs: config.dedupe_ttl.as_secs().max(1),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EventPublisher for RedisStreamsPublisher {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), event_type = %event.event_type(), key = %event.key()),
        err
    )]
    async fn publish(&self, topic: &str, event: &EventEnvelope) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        if event.payload().len() > self.max_message_bytes {
            return Err(PublishError::Fatal(format!(
                "message of {} bytes exceeds limit of {} bytes",
                event.payload().len(),
                self.max_message_bytes
            )));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut conn = self.conn.clone();

        let entry_id: Option<String> = self
            .script
            .key(topic)
            .key(dedupe_key(topic, event.event_id()))
            .arg(self.dedupe_ttl_secs)
            .arg("event_id")
            .arg(event.event_id())
            .arg("event_type")
            .arg(event.event_type())
            .arg("key")
            .arg(event.key())
            .arg("seq")
            .arg(seq)
            .arg("payload")
            .arg(event.payload())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| publish_error("XADD", e))?;

        match entry_id {
            Some(id) => debug!(entry_id = %id, seq, "event appended"),
            None => debug!("duplicate event id, append skipped"),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        // Every publish awaits its own reply, so nothing is buffered.
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One stream entry as returned by XREADGROUP.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

/// Entries read from the stream but not yet handed to the consumer, plus how
/// often each entry id has been handed out.
///
/// Pending re-reads return entries that were buffered but never handed out;
/// those must not count as attempts.
#[derive(Debug, Default)]
struct Inbox {
    queue: VecDeque<StreamEntry>,
    attempts: HashMap<String, u32>,
}

impl Inbox {
    fn fill(&mut self, entries: Vec<StreamEntry>) {
        self.queue.extend(entries);
    }

    /// Hand out the next entry. This is the only place an attempt is counted.
    fn take(&mut self, topic: &str) -> Option<Delivery> {
        let mut entry = self.queue.pop_front()?;
        let attempt = self.attempts.entry(entry.id.clone()).or_insert(0);
        *attempt += 1;

        // Entries trimmed from the stream come back without fields; an
        // empty payload fails decoding and gets acknowledged.
        let payload = entry.fields.remove("payload").unwrap_or_default();

        Some(Delivery {
            id: entry.id,
            topic: topic.to_string(),
            payload,
            attempt: *attempt,
        })
    }

    /// Forget everything not yet handed out. It is still pending in the group.
    fn rewind(&mut self) {
        self.queue.clear();
    }

    /// The entry left the pending list; stop counting it.
    fn settle(&mut self, id: &str) {
        self.attempts.remove(id);
    }
}

/// A consumer within a consumer group, on its own connection.
pub struct RedisStreamsSource {
    conn: MultiplexedConnection,
    topic: String,
    dead_letter_topic: String,
    group: String,
    consumer: String,
    block_ms: u64,
    batch_size: usize,
    inbox: Inbox,
    /// Still re-reading entries delivered to this consumer but never acked.
    recovering: bool,
}

impl RedisStreamsSource {
    #[instrument(
        skip(config),
        fields(topic = %config.topic, group = %config.group_id, consumer = %config.consumer_name),
        err
    )]
    pub async fn connect(config: &BrokerConfig) -> Result<Self, SourceError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| SourceError::Fatal(format!("invalid broker url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| source_error("connect", e))?;

        let mut source = Self {
            conn,
            topic: config.topic.clone(),
            dead_letter_topic: config.dead_letter_topic(),
            group: config.group_id.clone(),
            consumer: config.consumer_name.clone(),
            block_ms: config.block.as_millis() as u64,
            batch_size: config.batch_size.max(1),
            inbox: Inbox::default(),
            recovering: true,
        };
        source.ensure_group().await?;
        Ok(source)
    }

    /// Create the consumer group (and the stream) if missing.
    async fn ensure_group(&mut self) -> Result<(), SourceError> {
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.topic)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match created {
            Ok(()) => {
                info!(topic = %self.topic, group = %self.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(source_error("XGROUP CREATE", e)),
        }
    }

    async fn read(&mut self, from: &str, block: bool) -> Result<Vec<StreamEntry>, SourceError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size);
        if block {
            cmd.arg("BLOCK").arg(self.block_ms);
        }
        cmd.arg("STREAMS").arg(&self.topic).arg(from);

        let reply: Value = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| source_error("XREADGROUP", e))?;

        parse_read_reply(reply)
    }

    async fn xack(&mut self, id: &str) -> Result<(), SourceError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| source_error("XACK", e))?;

        self.inbox.settle(id);
        Ok(())
    }
}

#[async_trait]
impl MessageSource for RedisStreamsSource {
    async fn next(&mut self) -> Result<Option<Delivery>, SourceError> {
        if let Some(delivery) = self.inbox.take(&self.topic) {
            return Ok(Some(delivery));
        }

        if self.recovering {
            let pending = self.read("0", false).await?;
            if pending.is_empty() {
                self.recovering = false;
            } else {
                debug!(count = pending.len(), "redelivering pending entries");
                self.inbox.fill(pending);
                return Ok(self.inbox.take(&self.topic));
            }
        }

        let fresh = self.read(">", true).await?;
        self.inbox.fill(fresh);
        Ok(self.inbox.take(&self.topic))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        self.xack(&delivery.id).await
    }

    async fn release(&mut self, _delivery: &Delivery) -> Result<(), SourceError> {
        // Everything buffered is already pending for this consumer; drop the
        // buffer and re-read the pending list in stream order.
        self.inbox.rewind();
        self.recovering = true;
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(entry_id = %delivery.id, attempt = delivery.attempt), err)]
    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), SourceError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.dead_letter_topic)
            .arg("*")
            .arg("original_id")
            .arg(&delivery.id)
            .arg("group")
            .arg(&self.group)
            .arg("attempts")
            .arg(delivery.attempt)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(delivery.payload.as_slice())
            .query_async(&mut self.conn)
            .await
            .map_err(|e| source_error("dead-letter XADD", e))?;

        warn!(dead_letter_topic = %self.dead_letter_topic, reason, "message moved to dead-letter stream");

        self.xack(&delivery.id).await
    }
}

/// Parse an XREADGROUP reply for a single stream.
///
/// Shape: `[[stream, [[id, [field, value, ...]], ...]]]`, or nil when a
/// blocking read timed out.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, SourceError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => return Err(malformed(format!("unexpected reply {other:?}"))),
    };

    let mut entries = Vec::new();
    for stream in streams {
        let Value::Bulk(mut parts) = stream else {
            return Err(malformed("stream element is not an array".to_string()));
        };
        if parts.len() != 2 {
            return Err(malformed(format!("stream element has {} parts", parts.len())));
        }
        let Value::Bulk(raw_entries) = parts.remove(1) else {
            return Err(malformed("stream entries are not an array".to_string()));
        };
        for raw in raw_entries {
            entries.push(parse_entry(raw)?);
        }
    }
    Ok(entries)
}

fn parse_entry(raw: Value) -> Result<StreamEntry, SourceError> {
    let Value::Bulk(mut parts) = raw else {
        return Err(malformed("entry is not an array".to_string()));
    };
    if parts.len() != 2 {
        return Err(malformed(format!("entry has {} parts", parts.len())));
    }

    let raw_fields = parts.pop().unwrap_or(Value::Nil);
    let id = match parts.pop() {
        Some(Value::Data(bytes)) => String::from_utf8(bytes).map_err(|_| malformed("entry id is not utf-8".to_string()))?,
        other => return Err(malformed(format!("unexpected entry id {other:?}"))),
    };

    let mut fields = HashMap::new();
    if let Value::Bulk(values) = raw_fields {
        let mut values = values.into_iter();
        while let (Some(field), Some(value)) = (values.next(), values.next()) {
            if let (Value::Data(field), Value::Data(value)) = (field, value) {
                fields.insert(String::from_utf8_lossy(&field).into_owned(), value);
            }
        }
    }

    Ok(StreamEntry { id, fields })
}

fn malformed(detail: String) -> SourceError {
    SourceError::Fatal(format!("malformed XREADGROUP reply: {detail}"))
}
