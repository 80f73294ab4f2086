use chrono::Utc;
use gridtrade_core::{
    EngineMode, EngineSettings, ExchangeAdapter, GridConfig, OrderStatus, PlaceOrderRequest, Side,
    SizingMode, TickerUpdate,
};
use gridtrade_engine::events::EventBus;
use gridtrade_engine::{Engine, OrderSubmitter, StreamManager, SubmitOutcome};
use gridtrade_exchange_mock::MockAdapter;
use gridtrade_store::{LotStatus, Store};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

struct Harness {
    store: Store,
    adapter: Arc<MockAdapter>,
    engine: Engine,
    ticker_tx: watch::Sender<Option<TickerUpdate>>,
}

/// Builds an engine wired to an in-memory store and a mock exchange, with
/// the ticker cell under test control.
async fn harness(config: GridConfig) -> Harness {
    let store = Store::in_memory().await.unwrap();
    let adapter = Arc::new(MockAdapter::new());
    let adapter_dyn: Arc<dyn ExchangeAdapter> = adapter.clone();

    for (rank, product) in adapter_dyn.get_products().await.unwrap().iter().enumerate() {
        store
            .markets()
            .upsert_product(product, rank as i64 + 1)
            .await
            .unwrap();
    }
    store.config().save(&config).await.unwrap();

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    drop(cmd_tx);
    let (fill_tx, fill_rx) = mpsc::channel(256);
    let (ticker_tx, ticker_rx) = watch::channel(None);
    let (stream_tx, _stream_rx) = watch::channel(None);

    let streamer = adapter.clone();
    tokio::spawn(async move {
        let _ = streamer.stream_fills(fill_tx).await;
    });
    tokio::task::yield_now().await;

    let engine = Engine::new(
        store.clone(),
        adapter_dyn.clone(),
        EventBus::new(64),
        EngineSettings::default(),
        cmd_rx,
        Arc::new(AtomicBool::new(false)),
        ticker_rx,
        fill_rx,
        StreamManager::new(adapter_dyn, stream_tx, mpsc::channel(1).0),
        EngineMode::Running,
    );

    Harness {
        store,
        adapter,
        engine,
        ticker_tx,
    }
}

fn grid_config() -> GridConfig {
    GridConfig {
        grid_step_pct: dec!(0.01),
        budget_usd: dec!(10000),
        staging_band_depth_pct: dec!(0.05),
        min_band_orders: 10,
        max_band_orders: 10,
        sizing_mode: SizingMode::FixedUsd,
        fixed_usd_per_trade: dec!(100),
        paper_mode: true,
        ..GridConfig::default()
    }
}

impl Harness {
    async fn set_market_price(&self, price: Decimal) {
        self.adapter.set_price("BTC-USD", price).await;
        self.ticker_tx
            .send(Some(TickerUpdate {
                market_id: "BTC-USD".to_string(),
                price,
                timestamp: Utc::now(),
            }))
            .unwrap();
        // Let the fill stream task relay any paper fills into the engine.
        tokio::task::yield_now().await;
    }

    async fn enable_market(&self) {
        self.store
            .markets()
            .set_enabled_exclusive("BTC-USD")
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn basic_cycle_builds_grid_and_pairs_sell() {
    let mut h = harness(grid_config()).await;
    h.enable_market().await;
    h.set_market_price(dec!(100)).await;

    // Tick 1: exactly ten buys descending 1% from the price.
    h.engine.tick().await.unwrap();
    let buys = h.store.orders().open_by_side("BTC-USD", Side::Buy).await.unwrap();
    assert_eq!(buys.len(), 10);
    assert_eq!(buys[0].price, dec!(99.00));
    assert_eq!(buys[1].price, dec!(98.01));
    assert_eq!(buys[9].price, dec!(90.43));

    // The top buy fills.
    h.set_market_price(dec!(99.00)).await;
    h.engine.tick().await.unwrap();

    let lots = h.store.lots().list(10, 0).await.unwrap();
    assert_eq!(lots.len(), 1);
    let lot = &lots[0];
    assert_eq!(lot.buy_price, dec!(99.00));
    assert_eq!(lot.status, LotStatus::SellPlaced);
    assert_eq!(lot.sell_price, Some(dec!(99.99)));

    let sells = h.store.orders().open_by_side("BTC-USD", Side::Sell).await.unwrap();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].price, dec!(99.99));
    assert_eq!(sells[0].size, lot.buy_size);
    assert_eq!(sells[0].lot_id, Some(lot.id));
}

#[tokio::test]
async fn closing_the_cycle_realizes_profit() {
    let mut h = harness(grid_config()).await;
    h.enable_market().await;
    h.set_market_price(dec!(100)).await;
    h.engine.tick().await.unwrap();

    h.set_market_price(dec!(99.00)).await;
    h.engine.tick().await.unwrap();

    // Price recovers through the sell.
    h.set_market_price(dec!(99.99)).await;
    h.engine.tick().await.unwrap();

    let lots = h.store.lots().list(10, 0).await.unwrap();
    let lot = lots.iter().find(|l| l.status == LotStatus::Closed).unwrap();
    // (99.99 - 99.00) * size, no fees in the mock.
    let expected = (dec!(99.99) - dec!(99.00)) * lot.buy_size;
    assert_eq!(lot.realized_pnl, expected);

    let tracker = h.store.state().profit_tracker(Utc::now()).await.unwrap();
    assert_eq!(tracker.current_month_realized_pnl_usd, expected);
}

#[tokio::test]
async fn anchor_rebase_adds_levels_without_canceling_in_band_orders() {
    let mut h = harness(GridConfig {
        max_band_orders: 10,
        min_band_orders: 5,
        ..grid_config()
    })
    .await;
    h.enable_market().await;

    for price in [dec!(100), dec!(101), dec!(102)] {
        h.set_market_price(price).await;
        h.engine.tick().await.unwrap();
    }

    let anchor = h
        .store
        .state()
        .market_state("BTC-USD")
        .await
        .unwrap()
        .anchor_high;
    assert_eq!(anchor, Some(dec!(102)));

    // The newest levels descend from min(price, grid_top) = 102.
    let buys = h.store.orders().open_by_side("BTC-USD", Side::Buy).await.unwrap();
    assert_eq!(buys[0].price, dec!(100.98));
    // The tick-1 order at 99.00 is off the new lattice but inside the band:
    // the rebase alone must not cancel it.
    assert!(buys.iter().any(|o| o.price == dec!(99.00)));

    // Any cancels were band-exit prunes, never rebase casualties: every
    // canceled order sits below the final staging band floor.
    let band_floor = dec!(102) * (Decimal::ONE - dec!(0.05));
    let canceled = h
        .store
        .orders()
        .list(Some(OrderStatus::Canceled), 100, 0)
        .await
        .unwrap();
    assert!(canceled.iter().all(|o| o.price < band_floor));
}

#[tokio::test]
async fn open_orders_never_exceed_the_cap() {
    let mut h = harness(GridConfig {
        max_open_orders: 5,
        min_band_orders: 5,
        max_band_orders: 5,
        ..grid_config()
    })
    .await;
    h.enable_market().await;

    for price in [dec!(100), dec!(99), dec!(97), dec!(96), dec!(95)] {
        h.set_market_price(price).await;
        h.engine.tick().await.unwrap();
        let open = h.store.orders().count_open().await.unwrap();
        assert!(open <= 5, "open orders {open} exceeded cap");
    }
}

#[tokio::test]
async fn hold_suspends_buys_but_sells_continue() {
    // Budget 1000 caps grid capital at 700; a resting 800 USD lot holds.
    let mut h = harness(GridConfig {
        budget_usd: dec!(1000),
        min_band_orders: 2,
        max_band_orders: 2,
        fixed_usd_per_trade: dec!(100),
        ..grid_config()
    })
    .await;
    h.enable_market().await;

    h.store
        .lots()
        .create("BTC-USD", "manual-buy-1", dec!(100), dec!(8), Decimal::ZERO, Utc::now())
        .await
        .unwrap();
    h.adapter.credit_balance("BTC", dec!(8));

    h.set_market_price(dec!(100)).await;
    h.engine.tick().await.unwrap();

    // The lot's exit is admitted even though the engine is holding...
    let sells = h.store.orders().open_by_side("BTC-USD", Side::Sell).await.unwrap();
    assert_eq!(sells.len(), 1, "paired sell must be admitted in HOLD");
    assert_eq!(sells[0].price, dec!(101.00));

    // ...while no new buys are.
    let buys = h.store.orders().open_by_side("BTC-USD", Side::Buy).await.unwrap();
    assert!(buys.is_empty(), "buys must be suspended in HOLD");

    // The sell fills, capital frees up, buys resume.
    h.set_market_price(dec!(101.00)).await;
    h.engine.tick().await.unwrap();
    h.set_market_price(dec!(100.50)).await;
    h.engine.tick().await.unwrap();

    let lots = h.store.lots().list(10, 0).await.unwrap();
    assert_eq!(lots[0].status, LotStatus::Closed);
    assert_eq!(lots[0].realized_pnl, dec!(8.00));
    let buys = h.store.orders().open_by_side("BTC-USD", Side::Buy).await.unwrap();
    assert!(!buys.is_empty(), "buys resume once capital frees up");
}

#[tokio::test]
async fn fees_exceeding_the_step_leave_the_lot_open() {
    // A 2% fee buffer against a 1% step: any exit would be a net loss.
    let mut h = harness(GridConfig {
        fee_buffer_pct: dec!(0.02),
        ..grid_config()
    })
    .await;
    h.enable_market().await;
    h.set_market_price(dec!(100)).await;
    h.engine.tick().await.unwrap();

    h.set_market_price(dec!(99.00)).await;
    h.engine.tick().await.unwrap();

    // The buy fill opened a lot, but its sell was refused at submission.
    let lots = h.store.lots().list(10, 0).await.unwrap();
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].status, LotStatus::Open);
    assert!(lots[0].sell_order_id.is_none());
    assert!(h
        .store
        .orders()
        .open_by_side("BTC-USD", Side::Sell)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn submitting_with_same_tag_twice_creates_one_order() {
    let h = harness(grid_config()).await;
    h.enable_market().await;

    let adapter_dyn: Arc<dyn ExchangeAdapter> = h.adapter.clone();
    let submitter = OrderSubmitter::new(h.store.clone(), adapter_dyn);
    let request = PlaceOrderRequest {
        market_id: "BTC-USD".to_string(),
        side: Side::Buy,
        price: dec!(44000),
        size: dec!(0.001),
        client_tag: "grid-BTC-USD-fixed".to_string(),
        post_only: true,
    };

    let first = submitter.submit(&request, None).await.unwrap();
    let second = submitter.submit(&request, None).await.unwrap();

    let SubmitOutcome::Placed(first_id) = first else {
        panic!("expected placement");
    };
    assert_eq!(second, SubmitOutcome::AlreadyLive(first_id));
    assert_eq!(h.adapter.list_open_orders(None).await.unwrap().len(), 1);
    assert_eq!(h.store.orders().count_open().await.unwrap(), 1);
}

/// Runs the same price/fill script against a fresh store and returns the
/// observable outcome.
async fn scripted_run() -> (Vec<Decimal>, Vec<(LotStatus, Decimal)>) {
    let mut h = harness(grid_config()).await;
    h.enable_market().await;
    for price in [dec!(100), dec!(99.00), dec!(98.01), dec!(99.99), dec!(100.5)] {
        h.set_market_price(price).await;
        h.engine.tick().await.unwrap();
    }

    let mut open: Vec<Decimal> = h
        .store
        .orders()
        .open_orders(Some("BTC-USD"))
        .await
        .unwrap()
        .iter()
        .map(|o| o.price)
        .collect();
    open.sort();

    let lots = h
        .store
        .lots()
        .list(100, 0)
        .await
        .unwrap()
        .iter()
        .map(|l| (l.status, l.realized_pnl))
        .collect();
    (open, lots)
}

#[tokio::test]
async fn identical_streams_produce_identical_final_state() {
    let (open_a, lots_a) = scripted_run().await;
    let (open_b, lots_b) = scripted_run().await;
    assert_eq!(open_a, open_b);
    assert_eq!(lots_a, lots_b);
}
