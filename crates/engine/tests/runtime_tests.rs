use gridtrade_core::{EngineMode, EngineSettings, GridConfig, SizingMode};
use gridtrade_engine::runtime;
use gridtrade_exchange_mock::MockAdapter;
use gridtrade_store::Store;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> EngineSettings {
    EngineSettings {
        tick_interval_secs: 1,
        ..EngineSettings::default()
    }
}

fn config() -> GridConfig {
    GridConfig {
        grid_step_pct: dec!(0.01),
        budget_usd: dec!(100000),
        staging_band_depth_pct: dec!(0.05),
        min_band_orders: 5,
        max_band_orders: 5,
        sizing_mode: SizingMode::FixedUsd,
        fixed_usd_per_trade: dec!(100),
        paper_mode: true,
        ..GridConfig::default()
    }
}

async fn boot() -> (Store, runtime::EngineRuntime) {
    let store = Store::in_memory().await.unwrap();
    store.config().save(&config()).await.unwrap();
    let adapter = Arc::new(MockAdapter::new());
    let rt = runtime::start(store.clone(), adapter, settings())
        .await
        .unwrap();
    (store, rt)
}

#[tokio::test]
async fn boot_seeds_markets_and_starts_stopped() {
    let (store, rt) = boot().await;

    let markets = store.markets().list(false).await.unwrap();
    assert!(!markets.is_empty());
    assert!(markets.iter().all(|m| !m.enabled));

    let status = rt.handle.status().await.unwrap();
    assert_eq!(status.mode, EngineMode::Stopped);
    assert!(status.active_market.is_none());
}

#[tokio::test]
async fn highlander_switch_moves_the_single_enabled_market() {
    let (store, rt) = boot().await;

    rt.handle.start_market("BTC-USD").await.unwrap();
    // Let a couple of ticks build the BTC grid.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let btc_orders = store.orders().open_orders(Some("BTC-USD")).await.unwrap();
    assert!(!btc_orders.is_empty(), "expected a BTC grid before the switch");

    rt.handle.start_market("ETH-USD").await.unwrap();

    // By the end of the transition the old market is flat and disabled.
    let markets = store.markets().list(false).await.unwrap();
    let btc = markets.iter().find(|m| m.id == "BTC-USD").unwrap();
    let eth = markets.iter().find(|m| m.id == "ETH-USD").unwrap();
    assert!(!btc.enabled);
    assert!(eth.enabled);
    assert_eq!(
        markets.iter().filter(|m| m.enabled).count(),
        1,
        "exactly one market may be enabled"
    );
    assert!(store
        .orders()
        .open_orders(Some("BTC-USD"))
        .await
        .unwrap()
        .is_empty());

    let actions: Vec<String> = store
        .audit()
        .recent(20)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.action.clone())
        .collect();
    assert!(actions.iter().any(|a| a == "market_stop"));
    assert!(actions.iter().any(|a| a == "market_start"));

    let status = rt.handle.status().await.unwrap();
    assert_eq!(status.active_market.as_deref(), Some("ETH-USD"));
}

#[tokio::test]
async fn starting_an_unknown_market_leaves_the_current_one_running() {
    let (store, rt) = boot().await;
    rt.handle.start_market("BTC-USD").await.unwrap();

    assert!(rt.handle.start_market("NOPE-USD").await.is_err());
    let active = store.markets().active().await.unwrap().unwrap();
    assert_eq!(active.id, "BTC-USD");
}

#[tokio::test]
async fn kill_switch_flattens_everything_and_stops() {
    let (store, rt) = boot().await;
    rt.handle.start_market("BTC-USD").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2300)).await;

    let open_before = store.orders().count_open().await.unwrap();
    assert!(open_before > 0);

    let report = rt.handle.cancel_all().await.unwrap();
    // A tick may land between the count and the kill; never fewer though.
    assert!(report.requested >= open_before);
    assert_eq!(report.failed, 0);

    assert_eq!(store.orders().count_open().await.unwrap(), 0);
    assert!(store.markets().active().await.unwrap().is_none());

    let status = rt.handle.status().await.unwrap();
    assert_eq!(status.mode, EngineMode::Stopped);

    // Stopped means stopped: no grid reappears on later ticks.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(store.orders().count_open().await.unwrap(), 0);

    let actions: Vec<String> = store
        .audit()
        .recent(10)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.action.clone())
        .collect();
    assert!(actions.iter().any(|a| a == "cancel_all"));
}

#[tokio::test]
async fn restart_resumes_running_with_the_enabled_market() {
    let (store, rt) = boot().await;
    rt.handle.start_market("BTC-USD").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;
    rt.handle.shutdown().await.unwrap();

    // Same store, new process: startup reconciliation runs and the enabled
    // market resumes without operator action.
    let adapter = Arc::new(MockAdapter::new());
    let rt2 = runtime::start(store.clone(), adapter, settings())
        .await
        .unwrap();
    let status = rt2.handle.status().await.unwrap();
    assert_eq!(status.mode, EngineMode::Running);
    assert_eq!(status.active_market.as_deref(), Some("BTC-USD"));

    // The fresh exchange knows nothing of the old orders; reconciliation
    // must have repaired every stale OPEN row instead of trusting it.
    assert_eq!(store.orders().count_open().await.unwrap(), 0);
}