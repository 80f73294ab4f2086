use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::errors::ExchangeError;
use crate::types::{CancelOutcome, FillEvent, OpenOrder, PlaceOrderRequest, Product, TickerUpdate};

/// Capability set every exchange backend must provide.
///
/// The engine is polymorphic over this trait and never names a concrete
/// adapter. Streaming endpoints push into channels owned by the caller and
/// run until the channel closes or the connection permanently fails;
/// delivery is at-least-once.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_products(&self) -> Result<Vec<Product>, ExchangeError>;

    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError>;

    async fn get_ticker(&self, market_id: &str) -> Result<Decimal, ExchangeError>;

    /// Places a post-only limit order and returns the exchange order id.
    ///
    /// Idempotent by `client_tag`: repeating a request whose tag matches a
    /// live (non-terminal) order returns that order's id without creating a
    /// duplicate.
    async fn place_limit_order(&self, req: &PlaceOrderRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome, ExchangeError>;

    async fn list_open_orders(
        &self,
        market_id: Option<&str>,
    ) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Fills at or after `since`, oldest first. Bounded by the server.
    async fn get_fills(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FillEvent>, ExchangeError>;

    /// Streams ticker updates for the given markets into `tx`.
    async fn stream_ticker(
        &self,
        market_ids: Vec<String>,
        tx: mpsc::Sender<TickerUpdate>,
    ) -> Result<(), ExchangeError>;

    /// Streams the account's fills into `tx`.
    async fn stream_fills(&self, tx: mpsc::Sender<FillEvent>) -> Result<(), ExchangeError>;
}
