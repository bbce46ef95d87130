//! Position Reconciler (spec §4.7): periodically syncs open positions
//! against the venue, detecting externally closed and partially filled
//! positions.
//!
//! Grounded on the teacher's `InternalInventory::reconcile` and
//! `MmExecutionEngine::reconcile_after_reconnect` (`execution.rs`): same
//! "diff internal vs. live, log what moved, converge state" shape, applied
//! per sub-account against Postgres rows instead of an in-memory map, and
//! run on a fixed interval rather than only after a WS reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::bus::{EventBus, TOPIC_POSITION_CLOSED, TOPIC_POSITION_UPDATED};
use crate::db::models::PositionStatus;
use crate::db::positions;
use crate::error::ReconcileError;
use crate::exchange::{ExchangeClient, VenuePosition};
use crate::registry::KeyedLocks;

pub struct Reconciler {
    pool: PgPool,
    bus: EventBus,
    exchange: Arc<dyn ExchangeClient>,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(pool: PgPool, bus: EventBus, exchange: Arc<dyn ExchangeClient>, locks: KeyedLocks) -> Self {
        Self { pool, bus, exchange, locks }
    }

    /// Runs the periodic pass forever at `interval_secs` (spec default 30s).
    pub async fn run_forever(self, interval_secs: u64) {
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.pass_all_sub_accounts().await {
                tracing::error!(error = %e, "reconciler: pass failed");
            }
        }
    }

    async fn pass_all_sub_accounts(&self) -> Result<(), ReconcileError> {
        let sub_account_ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT DISTINCT sub_account_id FROM positions WHERE status != 'CLOSED'")
                .fetch_all(&self.pool)
                .await?;
        for sub_account_id in sub_account_ids {
            self.reconcile_sub_account(sub_account_id).await?;
        }
        Ok(())
    }

    async fn reconcile_sub_account(&self, sub_account_id: Uuid) -> Result<(), ReconcileError> {
        let open_positions = positions::open_positions_for_sub_account(&self.pool, sub_account_id).await?;
        if open_positions.is_empty() {
            return Ok(());
        }

        let venue_positions = self.exchange.positions(Some(&sub_account_id.to_string())).await?;
        let by_symbol: HashMap<String, VenuePosition> =
            venue_positions.into_iter().map(|p| (p.venue_symbol.clone(), p)).collect();

        for local in open_positions {
            // Hold the same (channel, asset) lock the Executor takes while
            // placing or closing orders, so a reconcile pass never patches a
            // position mid-placement.
            let _guard = match local.channel_id {
                Some(channel_id) => Some(self.locks.lock_channel_asset(channel_id, &local.venue_symbol).await),
                None => None,
            };
            match by_symbol.get(&local.venue_symbol) {
                None => {
                    // Venue no longer reports the position: closed externally
                    // (TP/SL fill, liquidation, manual). Best-effort realized
                    // P&L from the last known mark price (spec §4.7 step 2).
                    let exit_price = local.current_price.unwrap_or(local.entry_price);
                    let realized_delta = local.unrealized_pnl;
                    positions::close_reconciled(
                        &self.pool,
                        local.id,
                        exit_price,
                        local.realized_pnl + realized_delta,
                        Utc::now(),
                    )
                    .await?;
                    tracing::warn!(position_id = %local.id, venue_symbol = %local.venue_symbol, "reconciler: position closed externally");
                    let _ = self.bus.publish(TOPIC_POSITION_CLOSED, &local.id).await;
                }
                Some(venue) => {
                    positions::patch_from_venue(
                        &self.pool,
                        local.id,
                        venue.mark_price,
                        venue.unrealized_pnl,
                        venue.size,
                        venue.leverage,
                    )
                    .await?;

                    if local.quantity > venue.size {
                        let realized_delta = venue.mark_price * (local.quantity - venue.size);
                        positions::mark_partially_closed(&self.pool, local.id, venue.size, realized_delta).await?;
                        tracing::info!(position_id = %local.id, local = %local.quantity, venue = %venue.size, "reconciler: partial fill detected");
                    }

                    let _ = self.bus.publish(TOPIC_POSITION_UPDATED, &local.id).await;
                }
            }
        }
        Ok(())
    }

    /// On-demand reconciliation for a single position (spec §4.7
    /// `reconcile(positionId)`).
    pub async fn reconcile_one(&self, position_id: Uuid) -> Result<(), ReconcileError> {
        let Some(local) = positions::get(&self.pool, position_id).await? else {
            return Ok(());
        };
        if local.status == PositionStatus::Closed {
            return Ok(());
        }
        self.reconcile_sub_account(local.sub_account_id).await
    }
}

/// P6: at the end of a pass, every non-terminal position is either
/// represented on the venue or has been closed locally. Exposed for tests
/// that drive `Reconciler` against a `SimExchangeClient`.
#[allow(dead_code)]
fn invariant_holds(locals: &[(Uuid, PositionStatus)], by_symbol_present: &[bool]) -> bool {
    locals
        .iter()
        .zip(by_symbol_present)
        .all(|((_, status), present)| *present || *status == PositionStatus::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_rejects_non_terminal_unrepresented_position() {
        let locals = vec![(Uuid::new_v4(), PositionStatus::Open)];
        assert!(!invariant_holds(&locals, &[false]));
    }

    #[test]
    fn invariant_accepts_closed_unrepresented_position() {
        let locals = vec![(Uuid::new_v4(), PositionStatus::Closed)];
        assert!(invariant_holds(&locals, &[false]));
    }

    #[test]
    fn invariant_accepts_represented_open_position() {
        let locals = vec![(Uuid::new_v4(), PositionStatus::Open)];
        assert!(invariant_holds(&locals, &[true]));
    }
}

