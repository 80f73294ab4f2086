use anyhow::Result;
use chrono::Utc;
use gridtrade_core::{
    CancelOutcome, EngineMode, ExchangeAdapter, GridConfig, OrderStatus, PlaceOrderRequest,
    Product, Side,
};
use gridtrade_store::Store;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

use crate::lots::LotManager;
use crate::orders::{OrderSubmitter, SubmitError, SubmitOutcome};
use crate::planner::{self, PlannedGrid};
use crate::risk::{Admission, DenyReason, RiskGovernor, RiskSnapshot};

/// Client tags we recognize as our own on the exchange.
const OUR_TAG_PREFIXES: [&str; 2] = ["grid-", "sell-"];

fn is_our_tag(tag: Option<&str>) -> bool {
    tag.map_or(false, |t| {
        OUR_TAG_PREFIXES.iter().any(|prefix| t.starts_with(prefix))
    })
}

/// Per-tick API budget for the reconciler.
///
/// At most `current` cancels and `current` placements are issued per tick.
/// A 429/5xx halves the budget (floor 1) and starts a cooldown that gates
/// placements for the following ticks; clean ticks recover it.
#[derive(Debug, Clone)]
pub struct ApiBudget {
    base: u32,
    current: u32,
    cooldown_ticks: u32,
    used_cancels: u32,
    used_places: u32,
}

impl ApiBudget {
    #[must_use]
    pub fn new(base: u32) -> Self {
        let base = base.max(1);
        Self {
            base,
            current: base,
            cooldown_ticks: 0,
            used_cancels: 0,
            used_places: 0,
        }
    }

    pub fn begin_tick(&mut self) {
        self.used_cancels = 0;
        self.used_places = 0;
        self.cooldown_ticks = self.cooldown_ticks.saturating_sub(1);
    }

    pub fn on_transient_failure(&mut self) {
        self.current = (self.current / 2).max(1);
        self.cooldown_ticks = self.cooldown_ticks.saturating_add(1);
    }

    pub fn on_clean_tick(&mut self) {
        if self.cooldown_ticks == 0 {
            self.current = (self.current.saturating_mul(2)).min(self.base);
        }
    }

    #[must_use]
    pub fn try_cancel(&mut self) -> bool {
        if self.used_cancels < self.current {
            self.used_cancels += 1;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn try_place(&mut self) -> bool {
        if self.cooldown_ticks > 0 {
            return false;
        }
        if self.used_places < self.current {
            self.used_places += 1;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub const fn in_cooldown(&self) -> bool {
        self.cooldown_ticks > 0
    }

    #[must_use]
    pub const fn current(&self) -> u32 {
        self.current
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub canceled: u32,
    pub placed: u32,
    pub denied: u32,
    pub transient_failures: u32,
}

/// What startup reconciliation found and repaired.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartupReport {
    pub matched: u32,
    pub orphans_canceled_on_exchange: u32,
    pub orphans_adopted: u32,
    pub local_marked_filled: u32,
    pub local_marked_canceled: u32,
}

/// Aligns local order state with the exchange: a blocking pass at startup
/// and a budgeted diff pass every tick.
pub struct Reconciler {
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    submitter: OrderSubmitter,
    budget: ApiBudget,
}

impl Reconciler {
    #[must_use]
    pub fn new(store: Store, adapter: Arc<dyn ExchangeAdapter>, budget_per_tick: u32) -> Self {
        Self {
            submitter: OrderSubmitter::new(store.clone(), adapter.clone()),
            store,
            adapter,
            budget: ApiBudget::new(budget_per_tick),
        }
    }

    #[must_use]
    pub const fn budget(&self) -> &ApiBudget {
        &self.budget
    }

    /// Startup reconciliation. Blocks the tick loop until local and
    /// exchange state agree on what is open, filled, and canceled.
    ///
    /// # Errors
    /// Returns an error if the exchange or store cannot be reached; the
    /// caller must not start trading in that case.
    pub async fn startup(
        &mut self,
        market_id: &str,
        config: &GridConfig,
        product: &Product,
        lots: &mut LotManager,
    ) -> Result<StartupReport> {
        let mut report = StartupReport::default();
        let orders = self.store.orders();

        // Snapshot both sides before any repair so later writes (fill
        // replay places new sells) are not judged against stale views.
        let exchange_open = self.adapter.list_open_orders(Some(market_id)).await?;
        let exchange_ids: HashSet<&str> = exchange_open.iter().map(|o| o.id.as_str()).collect();
        let local_open_before = orders.open_orders(Some(market_id)).await?;

        // Pending rows whose exchange order actually made it: adopt them,
        // so the fill replay below finds their rows under the exchange id.
        for pending in orders.pending_place(market_id).await? {
            let Some(tag) = pending.client_tag.as_deref() else {
                continue;
            };
            if let Some(acked) = exchange_open
                .iter()
                .find(|o| o.client_tag.as_deref() == Some(tag))
            {
                orders.promote_to_open(tag, &acked.id).await?;
                report.orphans_adopted += 1;
                tracing::info!(tag, exchange_id = %acked.id, "adopted acknowledged order");
            } else {
                orders.set_status(&pending.id, OrderStatus::Canceled).await?;
                orders.release_tag(&pending.id).await?;
                report.local_marked_canceled += 1;
            }
        }

        // Replay fills missed while we were down. Buys become lots with
        // paired sells, sells close their lots; the fills table dedups.
        let since = self.store.state().market_state(market_id).await?.last_fill_at;
        let missed = self.adapter.get_fills(since).await?;
        for fill in &missed {
            if fill.market_id != market_id {
                continue;
            }
            let outcome = match fill.side {
                Side::Buy => lots.on_buy_fill(fill, config, product).await?,
                Side::Sell => lots.on_sell_fill(fill, Utc::now()).await?,
            };
            if !matches!(outcome, crate::lots::FillOutcome::Duplicate) {
                report.local_marked_filled += 1;
            }
        }

        // Judge the pre-replay local OPEN rows by their current status:
        // rows the replay advanced are done; rows still OPEN must exist on
        // the exchange or be marked canceled.
        for local in &local_open_before {
            let Some(current) = orders.get(&local.id).await? else {
                continue;
            };
            if current.status != OrderStatus::Open {
                continue;
            }
            if exchange_ids.contains(local.id.as_str()) {
                report.matched += 1;
            } else {
                tracing::warn!(order = %local.id, "open locally but missing on exchange");
                orders.set_status(&local.id, OrderStatus::Canceled).await?;
                orders.release_tag(&local.id).await?;
                if let (Some(lot_id), Side::Sell) = (local.lot_id, local.side) {
                    self.store.lots().clear_sell(lot_id).await?;
                }
                report.local_marked_canceled += 1;
            }
        }

        // Exchange orders we have no row for: ours are adopted above, so
        // anything left is unknown-origin and gets canceled.
        for remote in &exchange_open {
            if orders.get(&remote.id).await?.is_some() {
                continue;
            }
            let tag = remote.client_tag.as_deref();
            let tag_free = match tag {
                Some(t) => orders.get_by_tag(t).await?.is_none(),
                None => false,
            };
            if is_our_tag(tag) && tag_free {
                // Ours but untracked (lost row): re-adopt it.
                let tag = tag.unwrap_or_default();
                let lot_id = tag
                    .strip_prefix("sell-")
                    .and_then(|raw| raw.parse::<i64>().ok());
                orders
                    .insert_pending(
                        tag,
                        &remote.market_id,
                        remote.side,
                        remote.price,
                        remote.size,
                        lot_id,
                    )
                    .await?;
                orders.promote_to_open(tag, &remote.id).await?;
                report.orphans_adopted += 1;
                tracing::info!(order = %remote.id, tag, "re-adopted untracked order");
                continue;
            }
            tracing::warn!(order = %remote.id, "unknown-origin exchange order, canceling");
            self.adapter.cancel_order(&remote.id).await?;
            report.orphans_canceled_on_exchange += 1;
        }

        self.store
            .audit()
            .append(
                "system",
                "startup_reconciliation",
                None,
                Some(serde_json::json!({
                    "market_id": market_id,
                    "matched": report.matched,
                    "orphans_canceled": report.orphans_canceled_on_exchange,
                    "orphans_adopted": report.orphans_adopted,
                    "marked_filled": report.local_marked_filled,
                    "marked_canceled": report.local_marked_canceled,
                })),
            )
            .await?;

        Ok(report)
    }

    /// Per-tick pass: prune open buys that fell out of the staging band,
    /// then place missing desired levels. Cancels run before placements so
    /// the order-count cap is never transiently exceeded.
    ///
    /// # Errors
    /// Returns an error on store failure; exchange failures are absorbed
    /// into the budget and retried next tick.
    pub async fn reconcile_tick(
        &mut self,
        market_id: &str,
        plan: &PlannedGrid,
        config: &GridConfig,
        mode: EngineMode,
        deployed_capital: Decimal,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.budget.begin_tick();

        let orders = self.store.orders();
        let open_buys = orders.open_by_side(market_id, Side::Buy).await?;

        // Prune: anything below the band floor. Orders inside the band stay
        // even if they sit off-lattice after an anchor rebase.
        for order in &open_buys {
            if order.price >= plan.band_floor {
                continue;
            }
            if !self.budget.try_cancel() {
                break;
            }
            match self.adapter.cancel_order(&order.id).await {
                Ok(CancelOutcome::Canceled | CancelOutcome::NotFound) => {
                    orders.set_status(&order.id, OrderStatus::Canceled).await?;
                    orders.release_tag(&order.id).await?;
                    report.canceled += 1;
                    tracing::info!(
                        order = %order.id,
                        price = %order.price,
                        floor = %plan.band_floor,
                        "pruned order below staging band"
                    );
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(order = %order.id, error = %e, "cancel failed, backing off");
                    self.budget.on_transient_failure();
                    report.transient_failures += 1;
                    break;
                }
                Err(e) => {
                    tracing::error!(order = %order.id, error = %e, "cancel rejected");
                }
            }
        }

        // Extend: place desired levels that have no resting order.
        let mut occupied: Vec<Decimal> = open_buys.iter().map(|o| o.price).collect();
        occupied.extend(
            orders
                .pending_place(market_id)
                .await?
                .iter()
                .filter(|o| o.side == Side::Buy)
                .map(|o| o.price),
        );

        let mut open_count = orders.count_open().await?;
        let mut deployed = deployed_capital;

        for level in &plan.levels {
            if occupied.iter().any(|p| planner::prices_match(*p, level.price)) {
                continue;
            }

            let snapshot = RiskSnapshot {
                mode,
                open_orders: open_count,
                deployed_capital: deployed,
                active_market_count: 1,
            };
            let notional = level.price * level.size_base;
            match RiskGovernor::admit_buy(config, &snapshot, notional) {
                Admission::Allow => {}
                Admission::Deny(reason) => {
                    report.denied += 1;
                    tracing::info!(price = %level.price, %reason, "buy denied by risk governor");
                    if matches!(
                        reason,
                        DenyReason::MaxOpenOrders
                            | DenyReason::MarketOrderCap
                            | DenyReason::Hold
                            | DenyReason::Stopped
                            | DenyReason::Paused
                            | DenyReason::TradingDisabled
                    ) {
                        break;
                    }
                    continue;
                }
            }

            if !self.budget.try_place() {
                break;
            }

            let request = PlaceOrderRequest {
                market_id: market_id.to_string(),
                side: Side::Buy,
                price: level.price,
                size: level.size_base,
                client_tag: format!("grid-{market_id}-{}", uuid::Uuid::new_v4().simple()),
                post_only: true,
            };
            match self.submitter.submit(&request, None).await {
                Ok(SubmitOutcome::Placed(_) | SubmitOutcome::AlreadyLive(_)) => {
                    report.placed += 1;
                    occupied.push(level.price);
                    open_count += 1;
                    deployed += notional;
                    tracing::info!(price = %level.price, size = %level.size_base, "grid buy placed");
                }
                Err(e) if e.is_transient() => {
                    self.budget.on_transient_failure();
                    report.transient_failures += 1;
                    break;
                }
                Err(SubmitError::Exchange(_)) => {
                    // Rejected permanently (bad increment, post-only cross).
                    // Logged by the submitter; move on to the next level.
                }
                Err(SubmitError::Store(e)) => return Err(e),
            }
        }

        if report.transient_failures == 0 {
            self.budget.on_clean_tick();
        }

        Ok(report)
    }

    /// Cancels every OPEN order, bypassing the risk governor. Used by the
    /// kill switch and the Highlander market switch. Failed cancels stay
    /// OPEN and are swept again on following ticks.
    ///
    /// # Errors
    /// Returns an error on store failure only.
    pub async fn cancel_all_open(&mut self, market_id: Option<&str>) -> Result<(u32, u32)> {
        let orders = self.store.orders();
        let open = orders.open_orders(market_id).await?;
        let mut canceled = 0;
        let mut failed = 0;

        for order in open {
            match self.adapter.cancel_order(&order.id).await {
                Ok(CancelOutcome::Canceled | CancelOutcome::NotFound) => {
                    orders.set_status(&order.id, OrderStatus::Canceled).await?;
                    orders.release_tag(&order.id).await?;
                    if let Some(lot_id) = order.lot_id {
                        if order.side == Side::Sell {
                            self.store.lots().clear_sell(lot_id).await?;
                        }
                    }
                    canceled += 1;
                }
                Err(e) => {
                    tracing::error!(order = %order.id, error = %e, "kill-path cancel failed");
                    failed += 1;
                }
            }
        }
        Ok((canceled, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_halves_on_transient_and_recovers() {
        let mut budget = ApiBudget::new(10);
        budget.begin_tick();
        assert!(budget.try_cancel());

        budget.on_transient_failure();
        assert_eq!(budget.current(), 5);
        assert!(budget.in_cooldown());

        budget.on_transient_failure();
        budget.on_transient_failure();
        budget.on_transient_failure();
        assert_eq!(budget.current(), 1); // floor

        // Cooldown gates placements.
        budget.begin_tick();
        assert!(!budget.try_place());

        // Enough clean ticks drain the cooldown and restore the budget.
        for _ in 0..10 {
            budget.begin_tick();
            budget.on_clean_tick();
        }
        assert_eq!(budget.current(), 10);
        budget.begin_tick();
        assert!(budget.try_place());
    }

    #[test]
    fn budget_caps_actions_per_tick() {
        let mut budget = ApiBudget::new(2);
        budget.begin_tick();
        assert!(budget.try_cancel());
        assert!(budget.try_cancel());
        assert!(!budget.try_cancel());
        assert!(budget.try_place());
        assert!(budget.try_place());
        assert!(!budget.try_place());

        budget.begin_tick();
        assert!(budget.try_cancel());
    }

    #[test]
    fn recognizes_own_tags() {
        assert!(is_our_tag(Some("grid-BTC-USD-abc")));
        assert!(is_our_tag(Some("sell-42")));
        assert!(!is_our_tag(Some("manual-order")));
        assert!(!is_our_tag(None));
    }
}
