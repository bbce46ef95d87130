//! Ingestion (spec §4.3): subscribes to the chat transport, normalizes each
//! message to a canonical envelope, and pushes it onto the durable queue.
//!
//! Grounded on the teacher's `ingestor.rs` reconnect loop (`connect_and_listen`):
//! same exponential-backoff reconnect shape, same "never block the transport
//! on downstream work" discipline — here the downstream work is an
//! `EventBus::enqueue` instead of a `Mutex`-guarded buffer write. The
//! transport itself is `teloxide`'s long-poll dispatcher in place of the
//! teacher's raw WS client, since the spec's chat source is Telegram rather
//! than an exchange WS feed.

use sqlx::PgPool;
use teloxide::prelude::*;

use crate::bus::{EventBus, TOPIC_SIGNAL_NEW_MESSAGE};
use crate::db::channels;
use crate::recognition::CanonicalEnvelope;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuedEnvelope {
    pub channel_id: uuid::Uuid,
    pub external_message_id: String,
    pub text: String,
    pub channel_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<QueuedEnvelope> for CanonicalEnvelope {
    fn from(q: QueuedEnvelope) -> Self {
        CanonicalEnvelope {
            text: q.text,
            channel_name: q.channel_name,
            timestamp: q.timestamp,
        }
    }
}

pub struct Ingestion {
    pool: PgPool,
    bus: EventBus,
}

impl Ingestion {
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Runs the teloxide long-poll dispatcher forever, reconnecting with the
    /// same backoff shape as the teacher's WS loop on transient failures.
    pub async fn run(self, bot: Bot) {
        let handler = Update::filter_message().endpoint({
            let pool = self.pool.clone();
            let bus = self.bus.clone();
            move |msg: Message| {
                let pool = pool.clone();
                let bus = bus.clone();
                async move {
                    if let Err(e) = handle_message(&pool, &bus, &msg).await {
                        tracing::warn!(error = %e, "failed to ingest message");
                    }
                    respond(())
                }
            }
        });

        let mut retry_delay_secs: u64 = 1;
        const MAX_DELAY_SECS: u64 = 32;
        loop {
            tracing::info!("ingestion: starting telegram dispatcher");
            let mut dispatcher = Dispatcher::builder(bot.clone(), handler.clone())
                .default_handler(|_upd| async {})
                .build();
            dispatcher.dispatch().await;
            tracing::warn!(retry_delay_secs, "ingestion: dispatcher exited, reconnecting");
            tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay_secs)).await;
            retry_delay_secs = (retry_delay_secs * 2).min(MAX_DELAY_SECS);
        }
    }
}

/// Looks up the channel, filters on `active ∧ ¬paused`, and enqueues the
/// envelope. Unknown channels are dropped silently (spec §4.3).
async fn handle_message(pool: &PgPool, bus: &EventBus, msg: &Message) -> Result<(), anyhow::Error> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let external_channel_id = msg.chat.id.to_string();

    let channel = match channels::find_by_external_id(pool, &external_channel_id).await? {
        Some(c) => c,
        None => {
            tracing::debug!(external_channel_id, "ingestion: dropping message from unknown channel");
            return Ok(());
        }
    };

    if !channel.active || channel.paused {
        tracing::debug!(channel_id = %channel.id, "ingestion: dropping message from inactive/paused channel");
        return Ok(());
    }

    let envelope = QueuedEnvelope {
        channel_id: channel.id,
        external_message_id: msg.id.0.to_string(),
        text: text.to_string(),
        channel_name: channel.name.clone(),
        timestamp: chrono::Utc::now(),
    };

    bus.enqueue(&envelope).await?;
    bus.publish(TOPIC_SIGNAL_NEW_MESSAGE, &envelope).await?;
    Ok(())
}

/// Exposed for tests and for a future non-Telegram transport: the queueing
/// decision is independent of how the message physically arrived.
pub async fn enqueue_if_eligible(
    pool: &PgPool,
    bus: &EventBus,
    external_channel_id: &str,
    external_message_id: &str,
    text: &str,
) -> Result<bool, anyhow::Error> {
    let channel = match channels::find_by_external_id(pool, external_channel_id).await? {
        Some(c) => c,
        None => return Ok(false),
    };
    if !channel.active || channel.paused {
        return Ok(false);
    }
    let envelope = QueuedEnvelope {
        channel_id: channel.id,
        external_message_id: external_message_id.to_string(),
        text: text.to_string(),
        channel_name: channel.name,
        timestamp: chrono::Utc::now(),
    };
    bus.enqueue(&envelope).await?;
    bus.publish(TOPIC_SIGNAL_NEW_MESSAGE, &envelope).await?;
    Ok(true)
}
