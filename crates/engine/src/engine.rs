use anyhow::{bail, Context, Result};
use chrono::Utc;
use gridtrade_core::{
    BotEvent, EngineMode, EngineSettings, ExchangeAdapter, ExchangeError, FillEvent, GridConfig,
    Product, Side, TickerUpdate,
};
use gridtrade_store::Store;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::commands::{CancelAllReport, EngineCommand, EngineStatus};
use crate::events::EventBus;
use crate::fill_queue::FillQueue;
use crate::lots::{FillOutcome, LotManager};
use crate::orders::SubmitError;
use crate::planner::{self, SizingInputs};
use crate::reconciler::Reconciler;
use crate::risk::{RiskGovernor, RiskSnapshot};
use crate::runtime::StreamManager;

enum Flow {
    Continue,
    Shutdown,
}

/// The tick-loop actor. Owns all trading state transitions; every write to
/// anchor, orders, and lots flows through this single task, so no two
/// ticks can ever overlap or race.
pub struct Engine {
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    bus: EventBus,
    settings: EngineSettings,
    rx: mpsc::Receiver<EngineCommand>,
    kill: Arc<AtomicBool>,
    ticker_rx: watch::Receiver<Option<TickerUpdate>>,
    fill_rx: mpsc::Receiver<FillEvent>,
    streams: StreamManager,
    mode: EngineMode,
    lots: LotManager,
    reconciler: Reconciler,
    fill_queue: FillQueue,
    products: HashMap<String, Product>,
    consecutive_failures: u32,
    pending_state_events: Vec<BotEvent>,
}

impl Engine {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        adapter: Arc<dyn ExchangeAdapter>,
        bus: EventBus,
        settings: EngineSettings,
        rx: mpsc::Receiver<EngineCommand>,
        kill: Arc<AtomicBool>,
        ticker_rx: watch::Receiver<Option<TickerUpdate>>,
        fill_rx: mpsc::Receiver<FillEvent>,
        streams: StreamManager,
        initial_mode: EngineMode,
    ) -> Self {
        let reconcile_budget = settings.reconcile_budget;
        Self {
            lots: LotManager::new(store.clone(), adapter.clone()),
            reconciler: Reconciler::new(store.clone(), adapter.clone(), reconcile_budget),
            store,
            adapter,
            bus,
            settings,
            rx,
            kill,
            ticker_rx,
            fill_rx,
            streams,
            mode: initial_mode,
            fill_queue: FillQueue::new(),
            products: HashMap::new(),
            consecutive_failures: 0,
            pending_state_events: Vec::new(),
        }
    }

    /// Runs the actor until shutdown. Commands and ticks are serialized on
    /// this task; a long tick delays the next one instead of overlapping.
    pub async fn run(mut self) {
        tracing::info!(mode = self.mode.as_str(), "engine starting");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.tick_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        None => break,
                        Some(command) => {
                            if let Flow::Shutdown = self.handle_command(command).await {
                                break;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }

        tracing::info!("engine stopped");
    }

    fn kill_requested(&self) -> bool {
        self.kill.load(Ordering::Acquire)
    }

    async fn run_tick(&mut self) {
        match self.tick().await {
            Ok(()) => {
                self.consecutive_failures = 0;
            }
            Err(e) => {
                tracing::error!(error = %e, "tick failed");
                let _ = self
                    .store
                    .audit()
                    .append(
                        "system",
                        "tick_error",
                        None,
                        Some(serde_json::json!({ "error": e.to_string() })),
                    )
                    .await;

                let transient = e
                    .downcast_ref::<ExchangeError>()
                    .map_or(false, ExchangeError::is_transient)
                    || e.downcast_ref::<SubmitError>()
                        .map_or(false, SubmitError::is_transient);
                if transient {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.settings.failure_hold_threshold
                        && self.mode == EngineMode::Running
                    {
                        self.transition(EngineMode::Hold, None, "exchange degraded")
                            .await;
                    }
                } else {
                    self.consecutive_failures = 0;
                }
            }
        }
        self.flush_state_events();
    }

    /// One tick, in the fixed phase order. The kill flag is checked between
    /// phases; any phase error ends the tick early and the next tick retries.
    ///
    /// Public so hosts and tests can drive single ticks without the timer.
    ///
    /// # Errors
    /// Returns the first phase failure; state written by earlier phases is
    /// kept and repaired by reconciliation on the next tick.
    pub async fn tick(&mut self) -> Result<()> {
        if self.mode == EngineMode::Stopped {
            self.sweep_residual_orders().await?;
            return Ok(());
        }

        // Phase 1: refresh state.
        let config = self.store.config().load_or_init().await?;
        let Some(market) = self.store.markets().active().await? else {
            self.transition(EngineMode::Stopped, None, "no enabled market")
                .await;
            return Ok(());
        };
        let now = Utc::now();

        if self.mode == EngineMode::Paused {
            self.store.state().touch_tick(&market.id, now).await?;
            return Ok(());
        }
        if !config.live_trading_enabled && !config.paper_mode {
            tracing::debug!("live trading disabled and not in paper mode, skipping tick");
            return Ok(());
        }
        let product = self.product(&market.id).await?;
        if self.kill_requested() {
            return Ok(());
        }

        // Phase 2: ingest price.
        let price = self.current_price(&market.id).await?;
        if price <= Decimal::ZERO {
            bail!("invalid price for {}: {price}", market.id);
        }
        if self.kill_requested() {
            return Ok(());
        }

        // Phase 3: update anchor (never decreases).
        let anchor = self.store.state().raise_anchor(&market.id, price).await?;
        if self.kill_requested() {
            return Ok(());
        }

        // Phase 4: compute the desired grid.
        let tracker = self.store.state().profit_tracker(now).await?;
        let lifetime = self.store.lots().realized_pnl_total().await?;
        let deployed = self.store.lots().deployed_capital().await?;
        let sizing = SizingInputs {
            available_capital: config.budget_usd - deployed + lifetime,
            monthly_realized_pnl: tracker.current_month_realized_pnl_usd,
            lifetime_realized_pnl: lifetime,
        };
        let plan = planner::desired_levels(price, anchor, &config, &product, &sizing);
        if self.kill_requested() {
            return Ok(());
        }

        // Phase 5: ingest fills, then retry any missing paired sells.
        let fill_events = self.ingest_fills(&config).await?;
        let snapshot = RiskSnapshot {
            mode: self.mode,
            open_orders: self.store.orders().count_open().await?,
            deployed_capital: self.store.lots().deployed_capital().await?,
            active_market_count: 1,
        };
        self.lots
            .place_pending_sells(&market.id, &config, &product, snapshot)
            .await?;
        if self.kill_requested() {
            return Ok(());
        }

        // Hold is re-evaluated from post-fill deployed capital.
        let deployed = self.store.lots().deployed_capital().await?;
        match (self.mode, RiskGovernor::hold_engaged(&config, deployed)) {
            (EngineMode::Running, true) => {
                self.transition(EngineMode::Hold, Some(market.id.clone()), "capital cap reached")
                    .await;
            }
            (EngineMode::Hold, false) => {
                self.transition(
                    EngineMode::Running,
                    Some(market.id.clone()),
                    "capital back under cap",
                )
                .await;
            }
            _ => {}
        }
        if self.kill_requested() {
            return Ok(());
        }

        // Phase 6: reconcile open orders against the desired grid.
        self.reconciler
            .reconcile_tick(&market.id, &plan, &config, self.mode, deployed)
            .await?;
        if self.kill_requested() {
            return Ok(());
        }

        // Phase 7: publish. Price first, fills second, state changes last.
        self.bus.publish(&BotEvent::PriceUpdate {
            market_id: market.id.clone(),
            price,
            anchor,
            grid_top: plan.grid_top,
            timestamp: now,
        });
        for event in fill_events {
            self.bus.publish(&event);
        }
        self.flush_state_events();

        self.store.state().touch_tick(&market.id, now).await?;
        Ok(())
    }

    /// Reads the freshest ticker from the stream cell, falling back to REST
    /// when the stream has gone quiet for too long.
    async fn current_price(&mut self, market_id: &str) -> Result<Decimal> {
        let stale_secs =
            self.settings.tick_interval_secs * u64::from(self.settings.stale_ticker_ticks);
        let stale_after = chrono::Duration::seconds(i64::try_from(stale_secs).unwrap_or(i64::MAX));
        let cached = self.ticker_rx.borrow().clone();

        if let Some(ticker) = cached {
            if ticker.market_id == market_id && Utc::now() - ticker.timestamp <= stale_after {
                return Ok(ticker.price);
            }
            tracing::warn!(
                market = market_id,
                age_secs = (Utc::now() - ticker.timestamp).num_seconds(),
                "ticker stream stale, falling back to REST"
            );
        } else {
            tracing::warn!(market = market_id, "no ticker yet, fetching over REST");
        }

        let price = self.adapter.get_ticker(market_id).await?;
        Ok(price)
    }

    /// Drains the fill stream into the timestamp-ordered queue and applies
    /// each fill through the lot manager.
    async fn ingest_fills(&mut self, config: &GridConfig) -> Result<Vec<BotEvent>> {
        while let Ok(fill) = self.fill_rx.try_recv() {
            self.fill_queue.push(fill);
        }

        let mut events = Vec::new();
        while let Some(fill) = self.fill_queue.pop() {
            let product = self.product(&fill.market_id).await?;
            let outcome = match fill.side {
                Side::Buy => self.lots.on_buy_fill(&fill, config, &product).await?,
                Side::Sell => self.lots.on_sell_fill(&fill, Utc::now()).await?,
            };
            match outcome {
                FillOutcome::Duplicate => continue,
                FillOutcome::LotOpened(lot_id) => {
                    events.push(Self::fill_event(&fill, Some(lot_id), None));
                }
                FillOutcome::LotProgressed {
                    lot_id, realized, ..
                } => {
                    events.push(Self::fill_event(&fill, Some(lot_id), Some(realized)));
                }
                FillOutcome::Unmatched => {
                    events.push(Self::fill_event(&fill, None, None));
                }
            }
        }
        Ok(events)
    }

    fn fill_event(fill: &FillEvent, lot_id: Option<i64>, realized: Option<Decimal>) -> BotEvent {
        BotEvent::OrderFilled {
            market_id: fill.market_id.clone(),
            order_id: fill.order_id.clone(),
            side: fill.side,
            price: fill.price,
            size: fill.size,
            lot_id,
            realized_pnl: realized,
            timestamp: fill.timestamp,
        }
    }

    /// While stopped, keep sweeping any orders a partial kill left behind.
    async fn sweep_residual_orders(&mut self) -> Result<()> {
        if self.store.orders().count_open().await? == 0 {
            return Ok(());
        }
        let (canceled, failed) = self.reconciler.cancel_all_open(None).await?;
        tracing::info!(canceled, failed, "swept residual open orders");
        Ok(())
    }

    async fn product(&mut self, market_id: &str) -> Result<Product> {
        if let Some(product) = self.products.get(market_id) {
            return Ok(product.clone());
        }
        let products = self.adapter.get_products().await?;
        for product in products {
            self.products.insert(product.id.clone(), product);
        }
        self.products
            .get(market_id)
            .cloned()
            .with_context(|| format!("unknown product: {market_id}"))
    }

    async fn transition(&mut self, mode: EngineMode, market_id: Option<String>, reason: &str) {
        if self.mode == mode {
            return;
        }
        tracing::info!(from = self.mode.as_str(), to = mode.as_str(), reason, "state change");
        let before = self.mode;
        self.mode = mode;
        let _ = self
            .store
            .audit()
            .append(
                "system",
                "state_change",
                Some(serde_json::json!({ "mode": before.as_str() })),
                Some(serde_json::json!({ "mode": mode.as_str(), "reason": reason })),
            )
            .await;
        self.pending_state_events.push(BotEvent::StateChange {
            mode,
            market_id,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn flush_state_events(&mut self) {
        for event in std::mem::take(&mut self.pending_state_events) {
            self.bus.publish(&event);
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) -> Flow {
        match command {
            EngineCommand::Start { reply } => {
                let result = match self.store.markets().active().await {
                    Ok(Some(market)) => {
                        self.transition(EngineMode::Running, Some(market.id), "started")
                            .await;
                        Ok(())
                    }
                    Ok(None) => Err("no market is enabled".to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = reply.send(result);
            }
            EngineCommand::Pause => {
                if matches!(self.mode, EngineMode::Running | EngineMode::Hold) {
                    self.transition(EngineMode::Paused, None, "operator pause").await;
                }
            }
            EngineCommand::Resume => {
                if self.mode == EngineMode::Paused {
                    self.transition(EngineMode::Running, None, "operator resume")
                        .await;
                }
            }
            EngineCommand::StartMarket { market_id, reply } => {
                let result = self
                    .highlander_start(&market_id)
                    .await
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            EngineCommand::StopMarket { market_id, reply } => {
                let result = self.stop_market(&market_id).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            EngineCommand::CancelAll { reply } => {
                let report = self.kill_switch().await;
                let _ = reply.send(report);
            }
            EngineCommand::ResetAnchor { market_id, reply } => {
                let result = self.reset_anchor(&market_id).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            EngineCommand::UpdateConfig { config, reply } => {
                let result = self.update_config(config).await.map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            EngineCommand::GetStatus { reply } => {
                let _ = reply.send(self.status().await);
            }
            EngineCommand::Shutdown => {
                return Flow::Shutdown;
            }
        }
        self.flush_state_events();
        Flow::Continue
    }

    /// The Highlander switch: stop whatever trades now, then enable the
    /// target. If stopping the incumbent fails, the target is not touched.
    async fn highlander_start(&mut self, market_id: &str) -> Result<()> {
        let markets = self.store.markets();
        if markets.get(market_id).await?.is_none() {
            bail!("market not found: {market_id}");
        }

        if let Some(current) = markets.active().await? {
            if current.id != market_id {
                let (canceled, failed) =
                    self.reconciler.cancel_all_open(Some(&current.id)).await?;
                if failed > 0 {
                    bail!(
                        "could not cancel {failed} open orders on {}, aborting switch",
                        current.id
                    );
                }
                markets.disable(&current.id).await?;
                self.store
                    .audit()
                    .append(
                        "user",
                        "market_stop",
                        Some(serde_json::json!({ "market_id": current.id, "enabled": true })),
                        Some(serde_json::json!({
                            "market_id": current.id,
                            "enabled": false,
                            "orders_canceled": canceled,
                        })),
                    )
                    .await?;
            }
        }

        markets.set_enabled_exclusive(market_id).await?;
        self.store
            .audit()
            .append(
                "user",
                "market_start",
                None,
                Some(serde_json::json!({ "market_id": market_id, "enabled": true })),
            )
            .await?;

        self.streams.restart_ticker(vec![market_id.to_string()]);
        self.transition(EngineMode::Running, Some(market_id.to_string()), "market started")
            .await;
        Ok(())
    }

    async fn stop_market(&mut self, market_id: &str) -> Result<()> {
        let markets = self.store.markets();
        let was_active = markets
            .active()
            .await?
            .map_or(false, |market| market.id == market_id);

        let (canceled, _failed) = self.reconciler.cancel_all_open(Some(market_id)).await?;
        markets.disable(market_id).await?;
        self.store
            .audit()
            .append(
                "user",
                "market_stop",
                Some(serde_json::json!({ "market_id": market_id, "enabled": was_active })),
                Some(serde_json::json!({
                    "market_id": market_id,
                    "enabled": false,
                    "orders_canceled": canceled,
                })),
            )
            .await?;

        if was_active {
            self.transition(EngineMode::Stopped, Some(market_id.to_string()), "market stopped")
                .await;
        }
        Ok(())
    }

    /// Emergency stop. Always reports rather than fails: residual orders a
    /// flaky exchange refused to cancel are swept on subsequent ticks.
    async fn kill_switch(&mut self) -> CancelAllReport {
        tracing::warn!("kill switch triggered");
        let requested = self.store.orders().count_open().await.unwrap_or(0);

        let (canceled, failed) = match self.reconciler.cancel_all_open(None).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "kill-path store failure");
                (0, requested)
            }
        };
        if let Err(e) = self.store.markets().disable_all().await {
            tracing::error!(error = %e, "failed to disable markets");
        }

        self.transition(EngineMode::Stopped, None, "kill switch").await;
        let _ = self
            .store
            .audit()
            .append(
                "user",
                "cancel_all",
                None,
                Some(serde_json::json!({
                    "requested": requested,
                    "canceled": canceled,
                    "failed": failed,
                })),
            )
            .await;

        // Clear the abort flag so post-kill sweeps still tick.
        self.kill.store(false, Ordering::Release);
        CancelAllReport {
            requested,
            canceled,
            failed,
        }
    }

    async fn reset_anchor(&mut self, market_id: &str) -> Result<()> {
        let before = self.store.state().market_state(market_id).await?;
        self.store.state().reset_anchor(market_id).await?;
        self.store
            .audit()
            .append(
                "user",
                "anchor_reset",
                Some(serde_json::json!({
                    "market_id": market_id,
                    "anchor_high": before.anchor_high,
                })),
                Some(serde_json::json!({ "market_id": market_id, "anchor_high": null })),
            )
            .await?;
        Ok(())
    }

    async fn update_config(&mut self, config: GridConfig) -> Result<()> {
        config.validate()?;
        let before = self.store.config().load().await?;
        self.store.config().save(&config).await?;
        self.store
            .audit()
            .append(
                "user",
                "config_change",
                before.map(|c| serde_json::to_value(c)).transpose()?,
                Some(serde_json::to_value(&config)?),
            )
            .await?;
        tracing::info!("configuration replaced");
        Ok(())
    }

    async fn status(&mut self) -> EngineStatus {
        let active = self
            .store
            .markets()
            .active()
            .await
            .ok()
            .flatten()
            .map(|m| m.id);
        let (last_tick_at, anchor_high) = match &active {
            Some(market_id) => {
                let state = self
                    .store
                    .state()
                    .market_state(market_id)
                    .await
                    .unwrap_or_default();
                (state.last_tick_at, state.anchor_high)
            }
            None => (None, None),
        };
        let last_price = self.ticker_rx.borrow().as_ref().map(|t| t.price);
        EngineStatus {
            mode: self.mode,
            last_price,
            anchor_high,
            last_tick_at,
            open_orders: self.store.orders().count_open().await.unwrap_or(0),
            deployed_capital: self
                .store
                .lots()
                .deployed_capital()
                .await
                .unwrap_or(Decimal::ZERO),
            active_market: active,
        }
    }
}
