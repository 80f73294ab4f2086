use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridtrade_core::{
    CancelOutcome, ExchangeAdapter, ExchangeError, FillEvent, OpenOrder, OrderStatus,
    PlaceOrderRequest, Product, Side, TickerUpdate,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory exchange used for paper trading and tests.
///
/// Orders rest in a map and fill deterministically when the price crosses
/// their limit: a buy fills once the price trades at or below it, a sell
/// once the price trades at or above it, always at the limit price. Tests
/// drive the price directly with [`MockAdapter::set_price`]; the paper
/// runtime drives it from a seeded random walk in `stream_ticker`.
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
    fill_subscribers: Arc<Mutex<Vec<mpsc::Sender<FillEvent>>>>,
    tick_interval: Duration,
    walk_seed: u64,
}

struct MockState {
    products: Vec<Product>,
    prices: HashMap<String, Decimal>,
    balances: HashMap<String, Decimal>,
    orders: HashMap<String, MockOrder>,
    live_tags: HashMap<String, String>,
    fills: Vec<FillEvent>,
    fee_rate: Decimal,
    next_id: u64,
}

#[derive(Debug, Clone)]
struct MockOrder {
    id: String,
    client_tag: String,
    market_id: String,
    side: Side,
    price: Decimal,
    size: Decimal,
    status: OrderStatus,
}

fn seed_product(id: &str, price: Decimal, volume: Decimal) -> (Product, Decimal) {
    (
        Product {
            id: id.to_string(),
            base_increment: dec!(0.00000001),
            quote_increment: dec!(0.01),
            min_size: dec!(0.00000001),
            price: Some(price),
            volume_24h: Some(volume),
        },
        price,
    )
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    #[must_use]
    pub fn new() -> Self {
        let seeds = [
            seed_product("BTC-USD", dec!(45000), dec!(90000000)),
            seed_product("ETH-USD", dec!(2800), dec!(40000000)),
            seed_product("SOL-USD", dec!(95), dec!(15000000)),
            seed_product("ADA-USD", dec!(0.55), dec!(5000000)),
            seed_product("DOGE-USD", dec!(0.08), dec!(4000000)),
            seed_product("LTC-USD", dec!(70), dec!(2500000)),
            seed_product("LINK-USD", dec!(15), dec!(2000000)),
            seed_product("AVAX-USD", dec!(35), dec!(1500000)),
        ];

        let mut products = Vec::new();
        let mut prices = HashMap::new();
        for (product, price) in seeds {
            prices.insert(product.id.clone(), price);
            products.push(product);
        }

        let mut balances = HashMap::new();
        balances.insert("USD".to_string(), dec!(100000));

        Self {
            state: Arc::new(Mutex::new(MockState {
                products,
                prices,
                balances,
                orders: HashMap::new(),
                live_tags: HashMap::new(),
                fills: Vec::new(),
                fee_rate: Decimal::ZERO,
                next_id: 1,
            })),
            fill_subscribers: Arc::new(Mutex::new(Vec::new())),
            tick_interval: Duration::from_millis(500),
            walk_seed: 7,
        }
    }

    /// Applies a maker fee rate to simulated fills (fraction of notional).
    #[must_use]
    pub fn with_fee_rate(self, fee_rate: Decimal) -> Self {
        self.state
            .lock()
            .expect("mock state poisoned")
            .fee_rate = fee_rate;
        self
    }

    /// Moves the market price and matches resting orders against it.
    /// Resulting fills are recorded and pushed to fill-stream subscribers.
    pub async fn set_price(&self, market_id: &str, price: Decimal) -> Vec<FillEvent> {
        let fills = {
            let mut state = self.state.lock().expect("mock state poisoned");
            state.prices.insert(market_id.to_string(), price);
            state.match_orders(market_id, price, Utc::now())
        };
        self.dispatch_fills(&fills).await;
        fills
    }

    /// Current balance of one asset, for assertions in tests.
    #[must_use]
    pub fn balance(&self, asset: &str) -> Decimal {
        self.state
            .lock()
            .expect("mock state poisoned")
            .balances
            .get(asset)
            .copied()
            .unwrap_or_default()
    }

    pub fn credit_balance(&self, asset: &str, amount: Decimal) {
        let mut state = self.state.lock().expect("mock state poisoned");
        *state.balances.entry(asset.to_string()).or_default() += amount;
    }

    async fn dispatch_fills(&self, fills: &[FillEvent]) {
        if fills.is_empty() {
            return;
        }
        let subscribers: Vec<mpsc::Sender<FillEvent>> = {
            let mut subs = self.fill_subscribers.lock().expect("subscribers poisoned");
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };
        for fill in fills {
            for tx in &subscribers {
                if tx.send(fill.clone()).await.is_err() {
                    tracing::debug!("fill subscriber dropped");
                }
            }
        }
    }
}

impl MockState {
    fn base_asset(market_id: &str) -> &str {
        market_id.split('-').next().unwrap_or(market_id)
    }

    fn match_orders(
        &mut self,
        market_id: &str,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<FillEvent> {
        let matched: Vec<MockOrder> = self
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Open
                    && o.market_id == market_id
                    && match o.side {
                        Side::Buy => price <= o.price,
                        Side::Sell => price >= o.price,
                    }
            })
            .cloned()
            .collect();

        let mut fills = Vec::new();
        for order in matched {
            let fee = order.price * order.size * self.fee_rate;
            let base = Self::base_asset(market_id).to_string();
            match order.side {
                // Quote was escrowed at placement; credit the base asset.
                Side::Buy => *self.balances.entry(base).or_default() += order.size,
                Side::Sell => {
                    *self.balances.entry("USD".to_string()).or_default() +=
                        order.price * order.size - fee;
                }
            }

            if let Some(entry) = self.orders.get_mut(&order.id) {
                entry.status = OrderStatus::Filled;
            }
            self.live_tags.remove(&order.client_tag);

            let fill = FillEvent {
                trade_id: format!("mock-trade-{}", self.next_id),
                order_id: order.id.clone(),
                market_id: market_id.to_string(),
                side: order.side,
                price: order.price,
                size: order.size,
                fee,
                timestamp: now,
            };
            self.next_id += 1;
            tracing::info!(
                side = order.side.as_str(),
                price = %order.price,
                size = %order.size,
                "paper fill"
            );
            self.fills.push(fill.clone());
            fills.push(fill);
        }
        fills
    }
}

#[async_trait]
impl ExchangeAdapter for MockAdapter {
    async fn get_products(&self) -> Result<Vec<Product>, ExchangeError> {
        let state = self.state.lock().expect("mock state poisoned");
        let mut products = state.products.clone();
        for product in &mut products {
            product.price = state.prices.get(&product.id).copied();
        }
        Ok(products)
    }

    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        Ok(self.state.lock().expect("mock state poisoned").balances.clone())
    }

    async fn get_ticker(&self, market_id: &str) -> Result<Decimal, ExchangeError> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .prices
            .get(market_id)
            .copied()
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown product: {market_id}")))
    }

    async fn place_limit_order(&self, req: &PlaceOrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().expect("mock state poisoned");

        // Idempotency: a live order with this tag is the same logical order.
        if let Some(existing) = state.live_tags.get(&req.client_tag) {
            return Ok(existing.clone());
        }

        let price = state
            .prices
            .get(&req.market_id)
            .copied()
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown product: {}", req.market_id)))?;

        if req.post_only {
            let crosses = match req.side {
                Side::Buy => req.price >= price,
                Side::Sell => req.price <= price,
            };
            if crosses {
                return Err(ExchangeError::Permanent(format!(
                    "post-only {} at {} would cross market at {price}",
                    req.side.as_str(),
                    req.price
                )));
            }
        }

        if req.size <= Decimal::ZERO || req.price <= Decimal::ZERO {
            return Err(ExchangeError::Permanent("invalid price or size".to_string()));
        }

        // Escrow funds the way a real venue would.
        match req.side {
            Side::Buy => {
                let cost = req.price * req.size;
                let usd = state.balances.entry("USD".to_string()).or_default();
                if *usd < cost {
                    return Err(ExchangeError::Permanent("insufficient USD balance".to_string()));
                }
                *usd -= cost;
            }
            Side::Sell => {
                let base = MockState::base_asset(&req.market_id).to_string();
                let held = state.balances.entry(base).or_default();
                if *held < req.size {
                    return Err(ExchangeError::Permanent(
                        "insufficient base balance".to_string(),
                    ));
                }
                *held -= req.size;
            }
        }

        let id = format!("mock-{}", uuid::Uuid::new_v4());
        state.live_tags.insert(req.client_tag.clone(), id.clone());
        state.orders.insert(
            id.clone(),
            MockOrder {
                id: id.clone(),
                client_tag: req.client_tag.clone(),
                market_id: req.market_id.clone(),
                side: req.side,
                price: req.price,
                size: req.size,
                status: OrderStatus::Open,
            },
        );
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let Some(order) = state.orders.get(order_id).cloned() else {
            return Ok(CancelOutcome::NotFound);
        };
        if order.status != OrderStatus::Open {
            return Ok(CancelOutcome::NotFound);
        }

        // Release escrow.
        match order.side {
            Side::Buy => {
                *state.balances.entry("USD".to_string()).or_default() +=
                    order.price * order.size;
            }
            Side::Sell => {
                let base = MockState::base_asset(&order.market_id).to_string();
                *state.balances.entry(base).or_default() += order.size;
            }
        }

        if let Some(entry) = state.orders.get_mut(order_id) {
            entry.status = OrderStatus::Canceled;
        }
        state.live_tags.remove(&order.client_tag);
        Ok(CancelOutcome::Canceled)
    }

    async fn list_open_orders(
        &self,
        market_id: Option<&str>,
    ) -> Result<Vec<OpenOrder>, ExchangeError> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Open
                    && market_id.map_or(true, |market| o.market_id == market)
            })
            .map(|o| OpenOrder {
                id: o.id.clone(),
                client_tag: Some(o.client_tag.clone()),
                market_id: o.market_id.clone(),
                side: o.side,
                price: o.price,
                size: o.size,
            })
            .collect())
    }

    async fn get_fills(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FillEvent>, ExchangeError> {
        let state = self.state.lock().expect("mock state poisoned");
        Ok(state
            .fills
            .iter()
            .filter(|f| since.map_or(true, |ts| f.timestamp >= ts))
            .cloned()
            .collect())
    }

    async fn stream_ticker(
        &self,
        market_ids: Vec<String>,
        tx: mpsc::Sender<TickerUpdate>,
    ) -> Result<(), ExchangeError> {
        let mut rng = StdRng::seed_from_u64(self.walk_seed);
        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            interval.tick().await;
            for market_id in &market_ids {
                let current = match self.get_ticker(market_id).await {
                    Ok(price) => price,
                    Err(_) => continue,
                };
                // Random walk, +/-5 bps per step.
                let bps: i64 = rng.gen_range(-5..=5);
                let next = current + current * Decimal::new(bps, 4);
                let _ = self.set_price(market_id, next).await;

                let update = TickerUpdate {
                    market_id: market_id.clone(),
                    price: next,
                    timestamp: Utc::now(),
                };
                if tx.send(update).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn stream_fills(&self, tx: mpsc::Sender<FillEvent>) -> Result<(), ExchangeError> {
        self.fill_subscribers
            .lock()
            .expect("subscribers poisoned")
            .push(tx.clone());
        // The stream stays registered until the consumer goes away.
        tx.closed().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy_request(tag: &str, price: Decimal) -> PlaceOrderRequest {
        PlaceOrderRequest {
            market_id: "BTC-USD".to_string(),
            side: Side::Buy,
            price,
            size: dec!(0.01),
            client_tag: tag.to_string(),
            post_only: true,
        }
    }

    #[tokio::test]
    async fn repeated_tag_returns_same_order() {
        let mock = MockAdapter::new();
        let first = mock
            .place_limit_order(&buy_request("tag-1", dec!(44000)))
            .await
            .unwrap();
        let second = mock
            .place_limit_order(&buy_request("tag-1", dec!(44000)))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.list_open_orders(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn buy_fills_when_price_crosses_down() {
        let mock = MockAdapter::new();
        let id = mock
            .place_limit_order(&buy_request("tag-1", dec!(44000)))
            .await
            .unwrap();

        assert!(mock.set_price("BTC-USD", dec!(44500)).await.is_empty());
        let fills = mock.set_price("BTC-USD", dec!(44000)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, id);
        assert_eq!(fills[0].price, dec!(44000));
        assert!(mock.list_open_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn post_only_order_that_would_cross_is_rejected() {
        let mock = MockAdapter::new();
        let err = mock
            .place_limit_order(&buy_request("tag-1", dec!(46000)))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn cancel_releases_escrowed_funds() {
        let mock = MockAdapter::new();
        let before = mock.balance("USD");
        let id = mock
            .place_limit_order(&buy_request("tag-1", dec!(44000)))
            .await
            .unwrap();
        assert!(mock.balance("USD") < before);

        assert_eq!(mock.cancel_order(&id).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(mock.balance("USD"), before);
        assert_eq!(mock.cancel_order(&id).await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn maker_fee_reduces_sell_proceeds() {
        let mock = MockAdapter::new().with_fee_rate(dec!(0.001));
        mock.credit_balance("BTC", dec!(1));
        let usd_before = mock.balance("USD");

        mock.place_limit_order(&PlaceOrderRequest {
            market_id: "BTC-USD".to_string(),
            side: Side::Sell,
            price: dec!(46000),
            size: dec!(1),
            client_tag: "sell-1".to_string(),
            post_only: true,
        })
        .await
        .unwrap();

        let fills = mock.set_price("BTC-USD", dec!(46000)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].fee, dec!(46.000));
        assert_eq!(mock.balance("USD"), usd_before + dec!(46000) - dec!(46.000));
    }

    #[tokio::test]
    async fn fills_are_streamed_to_subscribers() {
        let mock = Arc::new(MockAdapter::new());
        let (tx, mut rx) = mpsc::channel(16);

        let streamer = Arc::clone(&mock);
        tokio::spawn(async move {
            let _ = streamer.stream_fills(tx).await;
        });
        // Give the stream task a chance to register.
        tokio::task::yield_now().await;

        mock.place_limit_order(&buy_request("tag-1", dec!(44000)))
            .await
            .unwrap();
        mock.set_price("BTC-USD", dec!(43900)).await;

        let fill = rx.recv().await.unwrap();
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.price, dec!(44000));
    }
}
