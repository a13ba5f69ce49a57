//! # Redis Streams Broker
//!
//! Each topic is a Redis stream. Publishing is `XADD` with an approximate
//! length cap; consuming is `XREADGROUP` as a named consumer in a consumer
//! group. An entry is acknowledged with `XACK` only when it is handed to the
//! caller, by `next` or `drain_buffered`.
//!
//! A consumer group created here starts at `$`, so a fresh group only sees
//! entries added after it exists. Every subscription first re-reads the
//! consumer's own pending list (entries delivered to it but never
//! acknowledged, e.g. by a read cut short) before asking for new entries.
//! Entries left pending under other consumer names are reported at
//! subscribe time, not claimed.

use crate::broker::{BusError, BusResult, InboundStream, MessageBroker};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamId, StreamMaxlen, StreamPendingReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field name under which the message body is stored in each entry.
const PAYLOAD_FIELD: &str = "payload";

/// Auto-generated entry ID for `XADD`.
const STREAM_ID_NEW: &str = "*";

/// Only entries never delivered to any consumer of the group.
const STREAM_ID_UNDELIVERED: &str = ">";

/// Start of this consumer's pending list.
const STREAM_ID_BACKLOG_START: &str = "0";

/// Consumer groups start at the tail of the stream.
const GROUP_START_TAIL: &str = "$";

/// Default approximate stream length cap.
pub const DEFAULT_STREAM_MAXLEN: usize = 10_000;

/// Default number of entries fetched per `XREADGROUP`.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default server-side block time per `XREADGROUP`.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(1);

/// [`MessageBroker`] backed by Redis Streams.
pub struct RedisStreamBroker {
    client: Client,
    publisher: RwLock<Option<MultiplexedConnection>>,
    max_len: usize,
    batch_size: usize,
    block: Duration,
}

impl RedisStreamBroker {
    /// Create a broker for the given `redis://` URL. Does not connect.
    pub fn open(url: &str) -> BusResult<Self> {
        let client = Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            publisher: RwLock::new(None),
            max_len: DEFAULT_STREAM_MAXLEN,
            batch_size: DEFAULT_BATCH_SIZE,
            block: DEFAULT_BLOCK,
        })
    }

    /// Override the approximate stream length cap.
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Override the read batch size and block time.
    #[must_use]
    pub fn with_read_options(mut self, batch_size: usize, block: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.block = block;
        self
    }

    fn publisher(&self) -> BusResult<MultiplexedConnection> {
        self.publisher
            .read()
            .map_err(|_| BusError::Connection("publisher lock poisoned".into()))?
            .clone()
            .ok_or(BusError::NotConnected)
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> BusResult<()> {
        let con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let mut slot = self
            .publisher
            .write()
            .map_err(|_| BusError::Connection("publisher lock poisoned".into()))?;
        *slot = Some(con);
        debug!("Redis stream broker connected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> BusResult<()> {
        let mut con = self.publisher()?;
        con.xadd_maxlen::<_, _, _, _, ()>(
            topic,
            StreamMaxlen::Approx(self.max_len),
            STREAM_ID_NEW,
            &[(PAYLOAD_FIELD, payload)],
        )
        .await
        .map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> BusResult<Box<dyn InboundStream>> {
        // Fail fast when closed
        self.publisher()?;

        // Dedicated connection for the blocking XREADGROUP
        let mut con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| subscribe_error(topic, &e))?;

        match con
            .xgroup_create_mkstream::<_, _, _, ()>(topic, group, GROUP_START_TAIL)
            .await
        {
            Ok(()) => debug!(topic, group, "Consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(topic, group, "Consumer group already exists");
            }
            Err(e) => return Err(subscribe_error(topic, &e)),
        }

        match con
            .xpending::<_, _, StreamPendingReply>(topic, group)
            .await
        {
            Ok(pending) if pending.count() > 0 => {
                warn!(
                    topic,
                    group,
                    pending = pending.count(),
                    "Consumer group has unacknowledged entries; entries owned by other consumer names are not re-read"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(topic, group, error = %e, "Could not inspect pending entries"),
        }

        let block_ms = usize::try_from(self.block.as_millis()).unwrap_or(usize::MAX);
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(self.batch_size)
            .block(block_ms);

        debug!(topic, group, consumer, "Redis subscription opened");
        Ok(Box::new(RedisStreamSubscription {
            con,
            key: topic.to_string(),
            group: group.to_string(),
            options,
            cursor: ReadCursor::start(),
            buffer: VecDeque::new(),
        }))
    }

    async fn close(&self) -> BusResult<()> {
        if let Ok(mut slot) = self.publisher.write() {
            slot.take();
        }
        debug!("Redis stream broker closed");
        Ok(())
    }
}

/// Where the next `XREADGROUP` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Re-reading this consumer's pending list after the given entry id
    Backlog(String),
    /// Entries never delivered to the group
    New,
}

impl ReadCursor {
    fn start() -> Self {
        Self::Backlog(STREAM_ID_BACKLOG_START.to_string())
    }

    fn id(&self) -> &str {
        match self {
            Self::Backlog(after) => after,
            Self::New => STREAM_ID_UNDELIVERED,
        }
    }

    fn is_backlog(&self) -> bool {
        matches!(self, Self::Backlog(_))
    }

    /// Move past a read whose last entry was `last_id`. An empty backlog
    /// read means the pending list is exhausted.
    fn advance(&mut self, last_id: Option<&str>) {
        if !self.is_backlog() {
            return;
        }
        *self = match last_id {
            Some(id) => Self::Backlog(id.to_string()),
            None => Self::New,
        };
    }
}

/// A fetched entry that has not been acknowledged yet.
struct FetchedEntry {
    id: String,
    payload: Vec<u8>,
}

/// Consumer-group subscription on one stream.
pub struct RedisStreamSubscription {
    con: MultiplexedConnection,
    key: String,
    group: String,
    options: StreamReadOptions,
    cursor: ReadCursor,
    buffer: VecDeque<FetchedEntry>,
}

impl RedisStreamSubscription {
    async fn fetch(&mut self) -> BusResult<()> {
        let backlog = self.cursor.is_backlog();
        let reply: Option<StreamReadReply> = self
            .con
            .xread_options(&[&self.key], &[self.cursor.id()], &self.options)
            .await
            .map_err(|e| BusError::Receive(e.to_string()))?;

        // `None` when the block time elapsed with nothing new
        let entries: Vec<StreamId> = reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default();
        self.cursor.advance(entries.last().map(|entry| entry.id.as_str()));

        if backlog && !entries.is_empty() {
            info!(stream = %self.key, recovered = entries.len(), "Re-reading unacknowledged entries");
        }

        for entry in entries {
            match entry.get::<Vec<u8>>(PAYLOAD_FIELD) {
                Some(payload) => self.buffer.push_back(FetchedEntry {
                    id: entry.id,
                    payload,
                }),
                None => {
                    warn!(stream = %self.key, entry = %entry.id, "Stream entry without payload field");
                    self.ack(&entry.id).await?;
                }
            }
        }
        Ok(())
    }

    async fn ack(&mut self, id: &str) -> BusResult<()> {
        self.con
            .xack::<_, _, _, ()>(&self.key, &self.group, &[id])
            .await
            .map_err(|e| BusError::Receive(e.to_string()))
    }

    /// Acknowledge an entry being handed out. A failed ack leaves the entry
    /// pending; the next subscription re-reads it.
    async fn hand_out(&mut self, entry: FetchedEntry) -> Vec<u8> {
        if let Err(e) = self.ack(&entry.id).await {
            warn!(stream = %self.key, entry = %entry.id, error = %e, "Failed to acknowledge entry");
        }
        entry.payload
    }
}

#[async_trait]
impl InboundStream for RedisStreamSubscription {
    async fn next(&mut self) -> Option<BusResult<Vec<u8>>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(self.hand_out(entry).await));
            }
            if let Err(e) = self.fetch().await {
                return Some(Err(e));
            }
        }
    }

    async fn drain_buffered(&mut self) -> Vec<Vec<u8>> {
        let mut drained = Vec::with_capacity(self.buffer.len());
        while let Some(entry) = self.buffer.pop_front() {
            drained.push(self.hand_out(entry).await);
        }
        drained
    }
}

fn subscribe_error(topic: &str, error: &RedisError) -> BusError {
    BusError::Subscribe {
        topic: topic.to_string(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_reads_backlog_first() {
        let cursor = ReadCursor::start();
        assert!(cursor.is_backlog());
        assert_eq!(cursor.id(), "0");
    }

    #[test]
    fn test_cursor_walks_backlog_then_switches_to_new() {
        let mut cursor = ReadCursor::start();

        cursor.advance(Some("1700000000000-3"));
        assert_eq!(cursor.id(), "1700000000000-3");

        cursor.advance(None);
        assert_eq!(cursor, ReadCursor::New);
        assert_eq!(cursor.id(), ">");

        // Empty reads of new entries keep reading new entries
        cursor.advance(None);
        cursor.advance(Some("1700000000001-0"));
        assert_eq!(cursor, ReadCursor::New);
    }

    #[test]
    fn test_open_rejects_non_redis_url() {
        assert!(matches!(
            RedisStreamBroker::open("localhost:9092"),
            Err(BusError::Connection(_))
        ));
    }

    #[test]
    fn test_read_options_clamp_batch_size() {
        let broker = RedisStreamBroker::open("redis://127.0.0.1:6379")
            .unwrap()
            .with_read_options(0, Duration::from_millis(50));
        assert_eq!(broker.batch_size, 1);
        assert_eq!(broker.block, Duration::from_millis(50));
    }
}
