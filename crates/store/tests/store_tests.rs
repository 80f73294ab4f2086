use chrono::{TimeZone, Utc};
use gridtrade_core::{FillEvent, GridConfig, OrderStatus, Product, Side};
use gridtrade_store::{LotStatus, Store};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn product(id: &str) -> Product {
    Product {
        id: id.to_string(),
        base_increment: dec!(0.0001),
        quote_increment: dec!(0.01),
        min_size: dec!(0.0001),
        price: None,
        volume_24h: Some(dec!(1000000)),
    }
}

#[tokio::test]
async fn enabling_a_market_disables_the_previous_one() {
    let store = Store::in_memory().await.unwrap();
    let markets = store.markets();

    markets.upsert_product(&product("BTC-USD"), 1).await.unwrap();
    markets.upsert_product(&product("ETH-USD"), 2).await.unwrap();

    markets.set_enabled_exclusive("BTC-USD").await.unwrap();
    assert_eq!(markets.active().await.unwrap().unwrap().id, "BTC-USD");

    markets.set_enabled_exclusive("ETH-USD").await.unwrap();
    let active = markets.active().await.unwrap().unwrap();
    assert_eq!(active.id, "ETH-USD");

    let all = markets.list(false).await.unwrap();
    let enabled: Vec<_> = all.iter().filter(|m| m.enabled).collect();
    assert_eq!(enabled.len(), 1);
}

#[tokio::test]
async fn enabling_unknown_market_fails_without_side_effects() {
    let store = Store::in_memory().await.unwrap();
    let markets = store.markets();

    markets.upsert_product(&product("BTC-USD"), 1).await.unwrap();
    markets.set_enabled_exclusive("BTC-USD").await.unwrap();

    assert!(markets.set_enabled_exclusive("DOGE-USD").await.is_err());
    // The failed transaction must not have disabled the current market.
    assert_eq!(markets.active().await.unwrap().unwrap().id, "BTC-USD");
}

#[tokio::test]
async fn pending_orders_are_idempotent_by_client_tag() {
    let store = Store::in_memory().await.unwrap();
    let markets = store.markets();
    let orders = store.orders();

    markets.upsert_product(&product("BTC-USD"), 1).await.unwrap();

    orders
        .insert_pending("grid-abc", "BTC-USD", Side::Buy, dec!(99.00), dec!(0.01), None)
        .await
        .unwrap();
    orders
        .insert_pending("grid-abc", "BTC-USD", Side::Buy, dec!(99.00), dec!(0.01), None)
        .await
        .unwrap();

    let pending = orders.pending_place("BTC-USD").await.unwrap();
    assert_eq!(pending.len(), 1);

    orders.promote_to_open("grid-abc", "ex-1").await.unwrap();
    let open = orders.open_orders(Some("BTC-USD")).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, "ex-1");
    assert_eq!(open[0].status, OrderStatus::Open);
    assert_eq!(open[0].client_tag.as_deref(), Some("grid-abc"));
}

#[tokio::test]
async fn duplicate_fills_are_ignored() {
    let store = Store::in_memory().await.unwrap();
    store
        .markets()
        .upsert_product(&product("BTC-USD"), 1)
        .await
        .unwrap();

    let fill = FillEvent {
        trade_id: "t-1".to_string(),
        order_id: "ex-1".to_string(),
        market_id: "BTC-USD".to_string(),
        side: Side::Buy,
        price: dec!(99.00),
        size: dec!(1),
        fee: dec!(0.10),
        timestamp: Utc::now(),
    };

    assert!(store.fills().insert(&fill).await.unwrap());
    assert!(!store.fills().insert(&fill).await.unwrap());
    assert_eq!(store.fills().list(10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lot_lifecycle_tracks_partial_sells() {
    let store = Store::in_memory().await.unwrap();
    let lots = store.lots();

    let lot_id = lots
        .create("BTC-USD", "buy-1", dec!(98), dec!(1.0), dec!(0.1), Utc::now())
        .await
        .unwrap();

    // Creating again for the same buy order returns the existing lot.
    let dup = lots
        .create("BTC-USD", "buy-1", dec!(98), dec!(1.0), dec!(0.1), Utc::now())
        .await
        .unwrap();
    assert_eq!(lot_id, dup);

    lots.set_sell_placed(lot_id, "sell-1", dec!(98.98)).await.unwrap();
    let lot = lots.get(lot_id).await.unwrap().unwrap();
    assert_eq!(lot.status, LotStatus::SellPlaced);

    // Half the size sells; the lot stays open for the remainder.
    let lot = lots
        .apply_sell_fill(lot_id, dec!(0.5), dec!(0.44), Utc::now())
        .await
        .unwrap();
    assert_eq!(lot.status, LotStatus::SellPlaced);
    assert_eq!(lot.sold_size, dec!(0.5));

    let lot = lots
        .apply_sell_fill(lot_id, dec!(0.5), dec!(0.44), Utc::now())
        .await
        .unwrap();
    assert_eq!(lot.status, LotStatus::Closed);
    assert_eq!(lot.realized_pnl, dec!(0.88));

    assert_eq!(lots.deployed_capital().await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn deployed_capital_counts_unsold_inventory_at_cost() {
    let store = Store::in_memory().await.unwrap();
    let lots = store.lots();

    lots.create("BTC-USD", "buy-1", dec!(100), dec!(2.0), dec!(0), Utc::now())
        .await
        .unwrap();
    let second = lots
        .create("BTC-USD", "buy-2", dec!(50), dec!(1.0), dec!(0), Utc::now())
        .await
        .unwrap();
    lots.apply_sell_fill(second, dec!(0.5), dec!(1), Utc::now())
        .await
        .unwrap();

    // 100*2 + 50*0.5 remaining.
    assert_eq!(lots.deployed_capital().await.unwrap(), dec!(225.0));
}

#[tokio::test]
async fn profit_tracker_resets_on_utc_month_boundary() {
    let store = Store::in_memory().await.unwrap();
    let state = store.state();

    let july = Utc.with_ymd_and_hms(2025, 7, 31, 23, 59, 0).unwrap();
    state.add_profit(dec!(950), july).await.unwrap();
    let tracker = state.profit_tracker(july).await.unwrap();
    assert_eq!(tracker.current_month_realized_pnl_usd, dec!(950));

    let august = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
    let tracker = state.profit_tracker(august).await.unwrap();
    assert_eq!(tracker.current_month_realized_pnl_usd, Decimal::ZERO);
    assert_eq!(tracker.month, "2025-08");
}

#[tokio::test]
async fn anchor_only_rises_until_reset() {
    let store = Store::in_memory().await.unwrap();
    let state = store.state();

    assert_eq!(state.raise_anchor("BTC-USD", dec!(100)).await.unwrap(), dec!(100));
    assert_eq!(state.raise_anchor("BTC-USD", dec!(102)).await.unwrap(), dec!(102));
    assert_eq!(state.raise_anchor("BTC-USD", dec!(95)).await.unwrap(), dec!(102));

    state.reset_anchor("BTC-USD").await.unwrap();
    assert_eq!(state.raise_anchor("BTC-USD", dec!(95)).await.unwrap(), dec!(95));
}

#[tokio::test]
async fn grid_config_round_trips_and_rejects_invalid() {
    let store = Store::in_memory().await.unwrap();
    let config = store.config();

    let initial = config.load_or_init().await.unwrap();
    assert_eq!(initial, GridConfig::default());

    let mut updated = initial.clone();
    updated.grid_step_pct = dec!(0.01);
    updated.budget_usd = dec!(5000);
    config.save(&updated).await.unwrap();
    assert_eq!(config.load().await.unwrap().unwrap(), updated);

    let mut invalid = updated;
    invalid.grid_step_pct = Decimal::ZERO;
    assert!(config.save(&invalid).await.is_err());
    // The rejected write must not have clobbered the stored config.
    assert_eq!(
        config.load().await.unwrap().unwrap().grid_step_pct,
        dec!(0.01)
    );
}
