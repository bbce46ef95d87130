//! Event Bus (spec §4.9): a durable at-least-once queue for inbound chat
//! envelopes, plus best-effort pub/sub topics for state-change broadcast.
//!
//! Grounded directly on the teacher's `publisher.rs`, which already talks to
//! Redis pub/sub for `mm:asset_config`/`mm:shadow_fills`/`mm:engine_status`.
//! The durable queue generalizes that same `redis::Client` into a Redis list
//! consumed with `BLPOP` plus a companion "processing" list that a crashed
//! consumer's envelope can be recovered from (a minimal reliable-queue
//! pattern) — the in-memory bound and spill-to-backing-store behavior of
//! spec §4.3 map onto Redis's own list length, which we cap defensively.

use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

pub const MESSAGE_QUEUE_KEY: &str = "queue:message_queue";
const MESSAGE_QUEUE_PROCESSING_KEY: &str = "queue:message_queue:processing";
const MESSAGE_QUEUE_MAX_LEN: isize = 1_000;

pub const TOPIC_SIGNAL_NEW_MESSAGE: &str = "signal:new-message";
pub const TOPIC_SIGNAL_NEW: &str = "signal:new";
pub const TOPIC_SIGNAL_EXECUTED: &str = "signal:executed";
pub const TOPIC_SIGNAL_FAILED: &str = "signal:failed";
pub const TOPIC_POSITION_OPENED: &str = "position:opened";
pub const TOPIC_POSITION_UPDATED: &str = "position:updated";
pub const TOPIC_POSITION_CLOSED: &str = "position:closed";
pub const TOPIC_POSITION_COMPENSATION_REQUIRED: &str = "position:compensation-required";
pub const TOPIC_CHANNEL_UPDATE: &str = "channel:update";
pub const TOPIC_ACCOUNT_UPDATE: &str = "account:update";

#[derive(Clone)]
pub struct EventBus {
    client: redis::Client,
}

impl EventBus {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    /// Pushes an envelope onto the durable queue. Overflow drops the oldest
    /// entry (spec §4.3: bounded at 1,000, spill-oldest-drop).
    pub async fn enqueue<T: Serialize>(&self, item: &T) -> Result<(), redis::RedisError> {
        let mut con = self.client.get_async_connection().await?;
        let payload = serde_json::to_string(item)
            .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string())))?;
        let _: () = con.rpush(MESSAGE_QUEUE_KEY, &payload).await?;
        let len: isize = con.llen(MESSAGE_QUEUE_KEY).await?;
        if len > MESSAGE_QUEUE_MAX_LEN {
            let _: Option<String> = con.lpop(MESSAGE_QUEUE_KEY, None).await?;
            tracing::warn!(queue = MESSAGE_QUEUE_KEY, "queue overflow, dropped oldest envelope");
        }
        Ok(())
    }

    /// At-least-once dequeue: the envelope is moved atomically into a
    /// "processing" list and only removed from there once the caller
    /// explicitly acknowledges it, so a crash between dequeue and ack leaves
    /// the envelope recoverable.
    pub async fn dequeue<T: DeserializeOwned>(
        &self,
        block_secs: f64,
    ) -> Result<Option<(String, T)>, redis::RedisError> {
        let mut con = self.client.get_async_connection().await?;
        let raw: Option<String> = con
            .blmove(
                MESSAGE_QUEUE_KEY,
                MESSAGE_QUEUE_PROCESSING_KEY,
                redis::Direction::Left,
                redis::Direction::Right,
                block_secs,
            )
            .await?;
        match raw {
            Some(payload) => {
                let item: T = serde_json::from_str(&payload).map_err(|e| {
                    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialize", e.to_string()))
                })?;
                Ok(Some((payload, item)))
            }
            None => Ok(None),
        }
    }

    /// Acknowledges a previously dequeued envelope, removing it from the
    /// processing list.
    pub async fn ack(&self, raw_payload: &str) -> Result<(), redis::RedisError> {
        let mut con = self.client.get_async_connection().await?;
        let _: i32 = con.lrem(MESSAGE_QUEUE_PROCESSING_KEY, 1, raw_payload).await?;
        Ok(())
    }

    /// Best-effort fan-out publish (spec §4.9 pub/sub topics). Subscribers
    /// must tolerate missed events and reconcile from state.
    pub async fn publish<T: Serialize>(&self, topic: &str, event: &T) -> Result<(), redis::RedisError> {
        let mut con = self.client.get_async_connection().await?;
        let payload = serde_json::to_string(event)
            .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string())))?;
        let _: i32 = con.publish(topic, payload).await?;
        Ok(())
    }

    pub async fn subscribe(&self, topic: &'static str) -> Result<redis::aio::PubSub, redis::RedisError> {
        let con = self.client.get_async_connection().await?;
        let mut pubsub = con.into_pubsub();
        pubsub.subscribe(topic).await?;
        Ok(pubsub)
    }
}
