//! Signal Feed (spec §4.4): long-running consumer of `message_queue`.
//! Looks up the channel, invokes Recognition, applies policy and dedup, and
//! either forwards to the Executor (auto-execute) or waits for manual
//! approval.
//!
//! No teacher module plays this role directly; the consumer-loop shape
//! (block on the queue, process one envelope, ack, loop) is grounded on the
//! teacher's `bus`/bounded-queue discipline in `publisher.rs` and the
//! reconnect-tolerant worker loops in `ingestor.rs`, generalized from a
//! single WS reader into a pool of `workerPoolSize` consumer tasks (spec
//! §5) pulling from the same durable queue key.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use uuid::Uuid;

use crate::bus::{EventBus, TOPIC_SIGNAL_NEW};
use crate::db::models::{Direction, SignalStatus, SignalType};
use crate::db::{channels, signals};
use crate::executor::{execute, ApprovedSignal, ExecutionContext};
use crate::exchange::ExchangeClient;
use crate::ingestion::QueuedEnvelope;
use crate::recognition::{RecognitionEngine, SignalKind};
use crate::registry::KeyedLocks;

const DEDUP_EPSILON_FRACTION: Decimal = dec!(0.001); // 0.1% of entry price

pub struct SignalFeed {
    pool: PgPool,
    bus: EventBus,
    recognition: RecognitionEngine,
    exchange: std::sync::Arc<dyn ExchangeClient>,
    min_confidence: Decimal,
    locks: KeyedLocks,
    /// Operator override (spec §6): bypasses §4.4 dedup and §4.5 sanity
    /// checks, never sizing. Logged loudly by the executor on every
    /// signal executed under it.
    risk_management_disabled: bool,
}

impl SignalFeed {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        recognition: RecognitionEngine,
        exchange: std::sync::Arc<dyn ExchangeClient>,
        min_confidence: Decimal,
        locks: KeyedLocks,
        risk_management_disabled: bool,
    ) -> Self {
        Self {
            pool,
            bus,
            recognition,
            exchange,
            min_confidence,
            locks,
            risk_management_disabled,
        }
    }

    /// Runs one consumer worker forever. Spawn `workerPoolSize` of these
    /// against the same queue key (spec §5) — Redis `BLMOVE` fairly
    /// distributes envelopes across concurrent blocking callers.
    pub async fn run_worker(&self, worker_id: usize) {
        loop {
            match self.bus.dequeue::<QueuedEnvelope>(5.0).await {
                Ok(Some((raw, envelope))) => {
                    if let Err(e) = self.process(envelope).await {
                        tracing::error!(worker_id, error = %e, "feed: failed to process envelope");
                    }
                    if let Err(e) = self.bus.ack(&raw).await {
                        tracing::error!(worker_id, error = %e, "feed: failed to ack envelope");
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "feed: dequeue failed, backing off");
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process(&self, envelope: QueuedEnvelope) -> Result<(), anyhow::Error> {
        // Step 1: channel lookup, active/paused re-check (state may have
        // changed between enqueue and processing).
        let channel = match channels::get(&self.pool, envelope.channel_id).await {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        if !channel.active || channel.paused {
            return Ok(());
        }

        if let Some(existing) =
            signals::find_by_external_message(&self.pool, envelope.channel_id, &envelope.external_message_id).await?
        {
            tracing::debug!(signal_id = %existing.id, "feed: replay of already-processed message, skipping");
            return Ok(());
        }

        // Step 2: Recognition
        let recognition = self.recognition.classify(envelope.clone().into()).await?;

        let confidence = Decimal::try_from(recognition.confidence).unwrap_or(Decimal::ZERO);

        // Step 3/4: low confidence or non-ENTRY -> persist for audit, stop.
        if !recognition.is_signal || confidence < self.min_confidence || recognition.kind != SignalKind::Entry {
            let kind = match recognition.kind {
                SignalKind::Entry => SignalType::Entry,
                SignalKind::Update => SignalType::Update,
                SignalKind::Close => SignalType::Close,
                SignalKind::General => SignalType::General,
            };
            self.persist_audit_only(&envelope, kind, confidence).await?;
            return Ok(());
        }

        let extracted = recognition.extracted.expect("ENTRY signal always carries extracted block");
        let direction = match extracted.direction {
            crate::recognition::Direction::Long => Direction::Long,
            crate::recognition::Direction::Short => Direction::Short,
        };

        // Step 5: dedup — open Signal with same (channel, asset, direction,
        // entryPrice ± ε) processed in the last 24h. Bypassed under the
        // RISK_MANAGEMENT_DISABLED override (spec §6).
        if self.risk_management_disabled {
            tracing::warn!(channel_id = %envelope.channel_id, "feed: RISK_MANAGEMENT_DISABLED override active, skipping dedup check");
        } else {
            let epsilon = extracted.entry_price * DEDUP_EPSILON_FRACTION;
            if signals::find_recent_duplicate(
                &self.pool,
                envelope.channel_id,
                &extracted.asset,
                direction,
                extracted.entry_price,
                epsilon,
                chrono::Utc::now(),
            )
            .await?
            .is_some()
            {
                tracing::debug!(channel_id = %envelope.channel_id, asset = %extracted.asset, "feed: duplicate signal within dedup window, dropping");
                return Ok(());
            }
        }

        // Step 6: persist PENDING
        let new_signal = signals::NewSignal {
            channel_id: envelope.channel_id,
            external_message_id: envelope.external_message_id.clone(),
            asset: Some(extracted.asset.clone()),
            direction: Some(direction),
            leverage: Some(extracted.leverage as i32),
            entry_price: Some(extracted.entry_price),
            tp_levels: extracted.tp_levels.clone(),
            stop_loss: Some(extracted.stop_loss),
            suggested_volume: None,
            confidence,
            raw_message: envelope.text.clone(),
            parsed: None,
            message_timestamp: envelope.timestamp,
            kind: SignalType::Entry,
        };
        let signal = signals::insert(&self.pool, new_signal).await?;

        // Step 7: auto-execute or broadcast for manual approval.
        if channel.auto_execute {
            self.forward_to_executor(signal.id, &channel).await?;
        } else {
            self.bus.publish(TOPIC_SIGNAL_NEW, &signal.id).await?;
        }

        Ok(())
    }

    async fn persist_audit_only(
        &self,
        envelope: &QueuedEnvelope,
        kind: SignalType,
        confidence: Decimal,
    ) -> Result<(), anyhow::Error> {
        let new_signal = signals::NewSignal {
            channel_id: envelope.channel_id,
            external_message_id: envelope.external_message_id.clone(),
            asset: None,
            direction: None,
            leverage: None,
            entry_price: None,
            tp_levels: vec![],
            stop_loss: None,
            suggested_volume: None,
            confidence,
            raw_message: envelope.text.clone(),
            parsed: None,
            message_timestamp: envelope.timestamp,
            kind,
        };
        let signal = signals::insert(&self.pool, new_signal).await?;
        signals::transition(&self.pool, signal.id, SignalStatus::Ignored, Some("audit only, not an entry signal")).await?;
        Ok(())
    }

    /// `approve(signalId)` (spec §4.4 manual operations). Idempotent on
    /// terminal states.
    pub async fn approve(&self, signal_id: Uuid) -> Result<(), anyhow::Error> {
        let signal = signals::get(&self.pool, signal_id).await?;
        if signal.status.is_terminal() {
            return Ok(());
        }
        let channel = channels::get(&self.pool, signal.channel_id).await?;
        self.forward_to_executor(signal_id, &channel).await
    }

    /// `ignore(signalId, reason)` (spec §4.4). Idempotent on terminal states.
    pub async fn ignore(&self, signal_id: Uuid, reason: &str) -> Result<(), anyhow::Error> {
        let signal = signals::get(&self.pool, signal_id).await?;
        if signal.status.is_terminal() {
            return Ok(());
        }
        signals::transition(&self.pool, signal_id, SignalStatus::Ignored, Some(reason)).await?;
        Ok(())
    }

    async fn forward_to_executor(&self, signal_id: Uuid, channel: &crate::db::models::Channel) -> Result<(), anyhow::Error> {
        let signal = signals::get(&self.pool, signal_id).await?;
        let (Some(asset), Some(direction), Some(entry_price), Some(stop_loss), Some(leverage)) =
            (signal.asset.clone(), signal.direction, signal.entry_price, signal.stop_loss, signal.leverage)
        else {
            signals::transition(&self.pool, signal_id, SignalStatus::Failed, Some("incomplete signal fields")).await?;
            return Ok(());
        };

        // Serialize execution against this (channel, asset) pair: a concurrent
        // reconciler pass or another signal for the same pair must not race
        // with sizing/placement (spec §5).
        let _guard = self.locks.lock_channel_asset(channel.id, &asset).await;

        signals::transition(&self.pool, signal_id, SignalStatus::Approved, None).await?;

        let sub_account = channels::get_sub_account(&self.pool, channel.id).await?;
        let approved = ApprovedSignal {
            signal_id,
            channel_id: channel.id,
            sub_account_id: sub_account.id,
            venue_sub_account_id: sub_account.venue_sub_account_id.clone(),
            venue_symbol: asset,
            direction,
            entry_price,
            stop_loss,
            tp_levels: signal.tp_levels.0.clone(),
            leverage: leverage as u32,
            risk_percent: channel.risk_percent,
            max_position_percent: channel.max_position_percent,
            tp_distribution: channel.tp_distribution.0.clone(),
            risk_management_disabled: self.risk_management_disabled,
        };

        let ctx = ExecutionContext {
            pool: &self.pool,
            bus: &self.bus,
            exchange: self.exchange.as_ref(),
        };
        execute(&ctx, approved).await;
        Ok(())
    }
}
