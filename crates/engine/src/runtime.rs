use anyhow::{Context, Result};
use gridtrade_core::{
    Backoff, EngineMode, EngineSettings, ExchangeAdapter, FillEvent, TickerUpdate,
};
use gridtrade_store::Store;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::events::EventBus;
use crate::handle::EngineHandle;
use crate::lots::LotManager;
use crate::reconciler::Reconciler;

/// Owns the exchange stream tasks feeding the engine.
///
/// The ticker stream is restarted whenever the active market changes; the
/// fill stream is account-wide and runs for the engine's lifetime. Both
/// reconnect forever with backoff.
pub struct StreamManager {
    adapter: Arc<dyn ExchangeAdapter>,
    ticker_tx: Arc<watch::Sender<Option<TickerUpdate>>>,
    fill_tx: mpsc::Sender<FillEvent>,
    ticker_task: Option<JoinHandle<()>>,
    fill_task: Option<JoinHandle<()>>,
}

impl StreamManager {
    #[must_use]
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        ticker_tx: watch::Sender<Option<TickerUpdate>>,
        fill_tx: mpsc::Sender<FillEvent>,
    ) -> Self {
        Self {
            adapter,
            ticker_tx: Arc::new(ticker_tx),
            fill_tx,
            ticker_task: None,
            fill_task: None,
        }
    }

    /// (Re)subscribes the ticker stream to the given markets.
    pub fn restart_ticker(&mut self, market_ids: Vec<String>) {
        if let Some(task) = self.ticker_task.take() {
            task.abort();
        }
        if market_ids.is_empty() {
            return;
        }

        let adapter = Arc::clone(&self.adapter);
        let cell = Arc::clone(&self.ticker_tx);
        self.ticker_task = Some(tokio::spawn(async move {
            let mut backoff = Backoff::default();
            loop {
                let (tx, mut rx) = mpsc::channel::<TickerUpdate>(64);
                let pump_cell = Arc::clone(&cell);
                let pump = tokio::spawn(async move {
                    // Last value wins; slow consumers only ever see the
                    // freshest price.
                    while let Some(update) = rx.recv().await {
                        let _ = pump_cell.send(Some(update));
                    }
                });

                let result = adapter.stream_ticker(market_ids.clone(), tx).await;
                pump.abort();
                match result {
                    Ok(()) => return,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %e, ?delay, "ticker stream down, restarting");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }));
    }

    /// Starts the account-wide fill stream once.
    pub fn start_fills(&mut self) {
        if self.fill_task.is_some() {
            return;
        }
        let adapter = Arc::clone(&self.adapter);
        let fill_tx = self.fill_tx.clone();
        self.fill_task = Some(tokio::spawn(async move {
            let mut backoff = Backoff::default();
            loop {
                match adapter.stream_fills(fill_tx.clone()).await {
                    Ok(()) => return,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %e, ?delay, "fill stream down, restarting");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }));
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if let Some(task) = self.ticker_task.take() {
            task.abort();
        }
        if let Some(task) = self.fill_task.take() {
            task.abort();
        }
    }
}

/// Everything `start` hands back to the host process.
pub struct EngineRuntime {
    pub handle: EngineHandle,
    pub bus: EventBus,
    pub task: JoinHandle<()>,
}

/// Boots the trading engine: seeds markets on first run, performs blocking
/// startup reconciliation for the active market, wires the exchange
/// streams, and spawns the tick-loop actor.
///
/// # Errors
/// Returns an error if the store or exchange is unreachable, or if startup
/// reconciliation fails; trading must not begin on inconsistent state.
pub async fn start(
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    settings: EngineSettings,
) -> Result<EngineRuntime> {
    let bus = EventBus::new(settings.event_queue_depth);

    // First boot on an empty database: seed the markets table from the
    // exchange's product list so the dashboard has rows to enable.
    let products = adapter
        .get_products()
        .await
        .context("failed to fetch products")?;
    match adapter.get_balances().await {
        Ok(balances) => {
            let usd = balances.get("USD").copied().unwrap_or(Decimal::ZERO);
            tracing::info!(%usd, assets = balances.len(), "exchange balances loaded");
        }
        Err(e) => tracing::warn!(error = %e, "could not fetch balances"),
    }
    if store.markets().list(false).await?.is_empty() {
        let mut ranked = products.clone();
        ranked.sort_by(|a, b| {
            b.volume_24h
                .unwrap_or(Decimal::ZERO)
                .cmp(&a.volume_24h.unwrap_or(Decimal::ZERO))
        });
        for (rank, product) in ranked.iter().enumerate() {
            store
                .markets()
                .upsert_product(product, i64::try_from(rank).unwrap_or(i64::MAX) + 1)
                .await?;
        }
        tracing::info!(count = ranked.len(), "seeded markets from exchange products");
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let kill = Arc::new(AtomicBool::new(false));
    let (ticker_tx, ticker_rx) = watch::channel(None);
    let (fill_tx, fill_rx) = mpsc::channel(256);

    let mut streams = StreamManager::new(Arc::clone(&adapter), ticker_tx, fill_tx);
    streams.start_fills();

    // Blocking startup reconciliation before the loop starts.
    let initial_mode = match store.markets().active().await? {
        Some(market) => {
            let config = store.config().load_or_init().await?;
            let product = products
                .iter()
                .find(|p| p.id == market.id)
                .cloned()
                .with_context(|| format!("active market {} not in product list", market.id))?;
            let mut lots = LotManager::new(store.clone(), Arc::clone(&adapter));
            let mut reconciler =
                Reconciler::new(store.clone(), Arc::clone(&adapter), settings.reconcile_budget);
            let report = reconciler
                .startup(&market.id, &config, &product, &mut lots)
                .await
                .context("startup reconciliation failed")?;
            tracing::info!(
                market = %market.id,
                matched = report.matched,
                adopted = report.orphans_adopted,
                canceled_remote = report.orphans_canceled_on_exchange,
                repaired_local = report.local_marked_canceled,
                "startup reconciliation complete"
            );
            streams.restart_ticker(vec![market.id.clone()]);
            EngineMode::Running
        }
        None => EngineMode::Stopped,
    };

    let handle = EngineHandle::new(cmd_tx, Arc::clone(&kill));
    let engine = Engine::new(
        store,
        adapter,
        bus.clone(),
        settings,
        cmd_rx,
        kill,
        ticker_rx,
        fill_rx,
        streams,
        initial_mode,
    );
    let task = tokio::spawn(engine.run());

    Ok(EngineRuntime { handle, bus, task })
}
