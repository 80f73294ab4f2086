use chrono::Utc;
use gridtrade_core::{
    ExchangeAdapter, GridConfig, OrderStatus, PlaceOrderRequest, Product, Side, SizingMode,
};
use gridtrade_engine::{LotManager, Reconciler};
use gridtrade_exchange_mock::MockAdapter;
use gridtrade_store::{LotStatus, Store};
use rust_decimal_macros::dec;
use std::sync::Arc;

fn product() -> Product {
    Product {
        id: "BTC-USD".to_string(),
        base_increment: dec!(0.00000001),
        quote_increment: dec!(0.01),
        min_size: dec!(0.00000001),
        price: None,
        volume_24h: None,
    }
}

fn config() -> GridConfig {
    GridConfig {
        grid_step_pct: dec!(0.01),
        sizing_mode: SizingMode::FixedUsd,
        fixed_usd_per_trade: dec!(100),
        paper_mode: true,
        ..GridConfig::default()
    }
}

async fn setup() -> (Store, Arc<MockAdapter>, Reconciler, LotManager) {
    let store = Store::in_memory().await.unwrap();
    let adapter = Arc::new(MockAdapter::new());
    let adapter_dyn: Arc<dyn ExchangeAdapter> = adapter.clone();

    for (rank, p) in adapter_dyn.get_products().await.unwrap().iter().enumerate() {
        store
            .markets()
            .upsert_product(p, rank as i64 + 1)
            .await
            .unwrap();
    }

    let reconciler = Reconciler::new(store.clone(), adapter_dyn.clone(), 10);
    let lots = LotManager::new(store.clone(), adapter_dyn);
    (store, adapter, reconciler, lots)
}

#[tokio::test]
async fn startup_turns_missed_buy_fill_into_lot_with_sell() {
    let (store, adapter, mut reconciler, mut lots) = setup().await;

    // A grid buy was resting when the process died...
    adapter.set_price("BTC-USD", dec!(99)).await;
    let order_id = adapter
        .place_limit_order(&PlaceOrderRequest {
            market_id: "BTC-USD".to_string(),
            side: Side::Buy,
            price: dec!(98),
            size: dec!(1.0),
            client_tag: "grid-BTC-USD-restartcase".to_string(),
            post_only: true,
        })
        .await
        .unwrap();
    store
        .orders()
        .insert_pending("grid-BTC-USD-restartcase", "BTC-USD", Side::Buy, dec!(98), dec!(1.0), None)
        .await
        .unwrap();
    store
        .orders()
        .promote_to_open("grid-BTC-USD-restartcase", &order_id)
        .await
        .unwrap();

    // ...and filled at 98 while we were down.
    adapter.set_price("BTC-USD", dec!(98)).await;

    let report = reconciler
        .startup("BTC-USD", &config(), &product(), &mut lots)
        .await
        .unwrap();
    assert_eq!(report.local_marked_filled, 1);

    // The fill became a lot with its paired sell at 98 * 1.01.
    let lot = store.lots().by_buy_order(&order_id).await.unwrap().unwrap();
    assert_eq!(lot.buy_price, dec!(98));
    assert_eq!(lot.buy_size, dec!(1.0));
    assert_eq!(lot.status, LotStatus::SellPlaced);
    assert_eq!(lot.sell_price, Some(dec!(98.98)));

    let open_sells = adapter.list_open_orders(Some("BTC-USD")).await.unwrap();
    assert_eq!(open_sells.len(), 1);
    assert_eq!(open_sells[0].side, Side::Sell);
    assert_eq!(open_sells[0].price, dec!(98.98));
}

#[tokio::test]
async fn startup_cancels_unknown_origin_exchange_orders() {
    let (store, adapter, mut reconciler, mut lots) = setup().await;

    // Someone placed an order by hand on the same account.
    adapter.set_price("BTC-USD", dec!(100)).await;
    adapter
        .place_limit_order(&PlaceOrderRequest {
            market_id: "BTC-USD".to_string(),
            side: Side::Buy,
            price: dec!(90),
            size: dec!(0.5),
            client_tag: "manual-trade".to_string(),
            post_only: true,
        })
        .await
        .unwrap();

    let report = reconciler
        .startup("BTC-USD", &config(), &product(), &mut lots)
        .await
        .unwrap();
    assert_eq!(report.orphans_canceled_on_exchange, 1);
    assert!(adapter
        .list_open_orders(Some("BTC-USD"))
        .await
        .unwrap()
        .is_empty());
    // Unknown orders are canceled, never imported.
    assert!(store.orders().get("manual-trade").await.unwrap().is_none());
}

#[tokio::test]
async fn startup_marks_vanished_local_orders_canceled() {
    let (store, _adapter, mut reconciler, mut lots) = setup().await;

    store
        .orders()
        .insert_pending("grid-BTC-USD-ghost", "BTC-USD", Side::Buy, dec!(95), dec!(1.0), None)
        .await
        .unwrap();
    store
        .orders()
        .promote_to_open("grid-BTC-USD-ghost", "exchange-id-ghost")
        .await
        .unwrap();

    let report = reconciler
        .startup("BTC-USD", &config(), &product(), &mut lots)
        .await
        .unwrap();
    assert_eq!(report.local_marked_canceled, 1);

    let order = store.orders().get("exchange-id-ghost").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Canceled);
}

#[tokio::test]
async fn startup_adopts_acked_pending_rows_by_tag() {
    let (store, adapter, mut reconciler, mut lots) = setup().await;

    // Placement crashed between the exchange ACK and the row promotion.
    adapter.set_price("BTC-USD", dec!(100)).await;
    let exchange_id = adapter
        .place_limit_order(&PlaceOrderRequest {
            market_id: "BTC-USD".to_string(),
            side: Side::Buy,
            price: dec!(97),
            size: dec!(1.0),
            client_tag: "grid-BTC-USD-halfway".to_string(),
            post_only: true,
        })
        .await
        .unwrap();
    store
        .orders()
        .insert_pending("grid-BTC-USD-halfway", "BTC-USD", Side::Buy, dec!(97), dec!(1.0), None)
        .await
        .unwrap();

    let report = reconciler
        .startup("BTC-USD", &config(), &product(), &mut lots)
        .await
        .unwrap();
    assert_eq!(report.orphans_adopted, 1);

    let order = store.orders().get(&exchange_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Open);
    assert_eq!(order.client_tag.as_deref(), Some("grid-BTC-USD-halfway"));
}
