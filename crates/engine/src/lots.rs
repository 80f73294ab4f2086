use anyhow::Result;
use chrono::{DateTime, Utc};
use gridtrade_core::{
    Backoff, ExchangeAdapter, FillEvent, GridConfig, OrderStatus, PlaceOrderRequest, Product, Side,
};
use gridtrade_store::{LotRecord, LotStatus, Store};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

use crate::orders::{OrderSubmitter, SubmitError, SubmitOutcome};
use crate::planner;
use crate::risk::{Admission, RiskGovernor, RiskSnapshot};

/// Result of ingesting one fill.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    /// Duplicate delivery; nothing to do.
    Duplicate,
    /// Buy fill opened (or re-keyed to) this lot.
    LotOpened(i64),
    /// Sell fill progressed a lot; `closed` is set when fully exited.
    LotProgressed { lot_id: i64, realized: Decimal, closed: bool },
    /// Fill did not map to anything we track.
    Unmatched,
}

/// Owns the lot lifecycle: buy fill to paired sell to close.
///
/// Sells are never abandoned. A lot whose sell could not be placed stays
/// OPEN and is retried every tick, gated by exponential backoff per lot.
pub struct LotManager {
    store: Store,
    submitter: OrderSubmitter,
    retry: HashMap<i64, SellRetry>,
}

struct SellRetry {
    backoff: Backoff,
    next_attempt: Instant,
}

impl LotManager {
    #[must_use]
    pub fn new(store: Store, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            submitter: OrderSubmitter::new(store.clone(), adapter),
            store,
            retry: HashMap::new(),
        }
    }

    /// Ingests a buy fill: records it, opens a lot, and attempts the paired
    /// sell immediately.
    ///
    /// # Errors
    /// Returns an error on store failure. Sell placement failure is not an
    /// error here; the lot stays OPEN for retry.
    pub async fn on_buy_fill(
        &mut self,
        fill: &FillEvent,
        config: &GridConfig,
        product: &Product,
    ) -> Result<FillOutcome> {
        if !self.store.fills().insert(fill).await? {
            return Ok(FillOutcome::Duplicate);
        }
        self.store
            .orders()
            .set_status(&fill.order_id, OrderStatus::Filled)
            .await?;
        self.store
            .state()
            .set_last_fill_at(&fill.market_id, fill.timestamp)
            .await?;

        let lot_id = self
            .store
            .lots()
            .create(
                &fill.market_id,
                &fill.order_id,
                fill.price,
                fill.size,
                fill.fee,
                fill.timestamp,
            )
            .await?;
        self.store.orders().set_lot(&fill.order_id, lot_id).await?;

        tracing::info!(
            market = %fill.market_id,
            lot = lot_id,
            price = %fill.price,
            size = %fill.size,
            "buy filled, lot opened"
        );

        if let Some(lot) = self.store.lots().get(lot_id).await? {
            // First sell attempt rides on the fill; failures retry per tick.
            if let Err(e) = self.place_sell(&lot, config, product).await {
                tracing::warn!(lot = lot_id, error = %e, "paired sell not yet placed");
            }
        }

        Ok(FillOutcome::LotOpened(lot_id))
    }

    /// Ingests a sell fill: locates the lot by sell order, realizes PnL
    /// (proportionally for partial fills), and closes the lot once the full
    /// buy size has exited.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub async fn on_sell_fill(
        &mut self,
        fill: &FillEvent,
        now: DateTime<Utc>,
    ) -> Result<FillOutcome> {
        if !self.store.fills().insert(fill).await? {
            return Ok(FillOutcome::Duplicate);
        }

        let Some(lot) = self.store.lots().by_sell_order(&fill.order_id).await? else {
            tracing::error!(
                order = %fill.order_id,
                "sell fill without a matching lot, leaving for reconciliation"
            );
            self.store
                .audit()
                .append(
                    "system",
                    "unmatched_sell_fill",
                    None,
                    Some(serde_json::json!({ "order_id": fill.order_id })),
                )
                .await?;
            return Ok(FillOutcome::Unmatched);
        };

        // Buy fee is attributed proportionally to the sold slice.
        let buy_fee_share = if lot.buy_size.is_zero() {
            Decimal::ZERO
        } else {
            lot.buy_fee * fill.size / lot.buy_size
        };
        let realized = (fill.price - lot.buy_price) * fill.size - fill.fee - buy_fee_share;

        let updated = self
            .store
            .lots()
            .apply_sell_fill(lot.id, fill.size, realized, fill.timestamp)
            .await?;
        let closed = updated.status == LotStatus::Closed;
        if closed {
            self.store
                .orders()
                .set_status(&fill.order_id, OrderStatus::Filled)
                .await?;
            self.retry.remove(&lot.id);
        }

        self.store
            .state()
            .set_last_fill_at(&fill.market_id, fill.timestamp)
            .await?;
        let tracker = self.store.state().add_profit(realized, now).await?;
        self.roll_daily_snapshot(fill.timestamp).await?;

        tracing::info!(
            lot = lot.id,
            realized = %realized,
            month_total = %tracker.current_month_realized_pnl_usd,
            closed,
            "sell filled, profit realized"
        );

        Ok(FillOutcome::LotProgressed {
            lot_id: lot.id,
            realized,
            closed,
        })
    }

    /// Retries paired sells for every lot still missing one. Called each
    /// tick; per-lot backoff keeps a flapping exchange from being hammered.
    /// Sells go through the governor too (the hard order cap binds them),
    /// but a denial just defers to the next tick, never abandons.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub async fn place_pending_sells(
        &mut self,
        market_id: &str,
        config: &GridConfig,
        product: &Product,
        mut snapshot: RiskSnapshot,
    ) -> Result<u32> {
        let lots = self.store.lots().needing_sell(market_id).await?;
        let mut placed = 0;
        let now = Instant::now();

        for lot in lots {
            if let Some(retry) = self.retry.get(&lot.id) {
                if now < retry.next_attempt {
                    continue;
                }
            }
            if let Admission::Deny(reason) = RiskGovernor::admit_sell(config, &snapshot) {
                tracing::info!(lot = lot.id, %reason, "sell deferred by risk governor");
                continue;
            }
            match self.place_sell(&lot, config, product).await {
                Ok(()) => {
                    placed += 1;
                    snapshot.open_orders += 1;
                }
                Err(e) => {
                    tracing::warn!(lot = lot.id, error = %e, "sell retry failed");
                }
            }
        }
        Ok(placed)
    }

    /// Places the paired sell for one lot. The sell price is the profit
    /// policy's target rounded up to the quote increment, so the exit never
    /// undercuts the configured margin.
    async fn place_sell(
        &mut self,
        lot: &LotRecord,
        config: &GridConfig,
        product: &Product,
    ) -> Result<(), SubmitError> {
        let target = planner::sell_price(lot.buy_price, config);
        let price = product.round_price_up(target);

        // Fees exceeding the step would exit at a net loss. Refuse and leave
        // the lot OPEN until the config is corrected.
        let net = price * (Decimal::ONE - config.fee_buffer_pct);
        if net < lot.buy_price {
            let err = gridtrade_core::ExchangeError::Permanent(format!(
                "sell at {price} would undercut buy {} after fees",
                lot.buy_price
            ));
            self.note_failure(lot.id);
            return Err(SubmitError::Exchange(err));
        }

        let size = lot.buy_size - lot.sold_size;
        let request = PlaceOrderRequest {
            market_id: lot.market_id.clone(),
            side: Side::Sell,
            price,
            size,
            client_tag: format!("sell-{}", lot.id),
            post_only: true,
        };

        match self.submitter.submit(&request, Some(lot.id)).await {
            Ok(SubmitOutcome::Placed(id) | SubmitOutcome::AlreadyLive(id)) => {
                self.store
                    .lots()
                    .set_sell_placed(lot.id, &id, price)
                    .await
                    .map_err(SubmitError::Store)?;
                self.retry.remove(&lot.id);
                tracing::info!(lot = lot.id, price = %price, "paired sell resting");
                Ok(())
            }
            Err(e) => {
                self.note_failure(lot.id);
                Err(e)
            }
        }
    }

    fn note_failure(&mut self, lot_id: i64) {
        let entry = self.retry.entry(lot_id).or_insert_with(|| SellRetry {
            backoff: Backoff::default(),
            next_attempt: Instant::now(),
        });
        let delay = entry.backoff.next_delay();
        entry.next_attempt = Instant::now() + delay;
    }

    /// Rolls the day's realized PnL into the daily snapshot table.
    async fn roll_daily_snapshot(&self, fill_time: DateTime<Utc>) -> Result<()> {
        let day_start = fill_time
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc());
        let Some(day_start) = day_start else {
            return Ok(());
        };

        let day_pnl = self.store.lots().realized_pnl_since(day_start).await?;
        let trades = self.store.lots().closed_count_since(day_start).await?;
        let cumulative = self.store.lots().realized_pnl_total().await?;
        self.store
            .snapshots()
            .upsert(
                &fill_time.format("%Y-%m-%d").to_string(),
                day_pnl,
                trades,
                cumulative,
            )
            .await
    }
}
