use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridtrade_core::{
    CancelOutcome, ExchangeAdapter, ExchangeError, FillEvent, OpenOrder, PlaceOrderRequest,
    Product, Side, TickerUpdate,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::{CoinbaseClient, CoinbaseCredentials};
use crate::websocket::CoinbaseWebSocket;

/// Coinbase Advanced Trade adapter.
pub struct CoinbaseAdapter {
    client: CoinbaseClient,
    ws_url: String,
}

impl CoinbaseAdapter {
    #[must_use]
    pub fn new(
        api_url: String,
        ws_url: String,
        credentials: CoinbaseCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            client: CoinbaseClient::new(api_url, credentials, timeout),
            ws_url,
        }
    }
}

fn field_decimal(value: &serde_json::Value, field: &str) -> Option<Decimal> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| Decimal::from_str(s).ok())
}

fn field_string(value: &serde_json::Value, field: &str) -> Option<String> {
    value.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

fn field_side(value: &serde_json::Value, field: &str) -> Option<Side> {
    field_string(value, field).and_then(|s| s.parse().ok())
}

fn field_time(value: &serde_json::Value, field: &str) -> Option<DateTime<Utc>> {
    field_string(value, field)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_product(raw: &serde_json::Value) -> Option<Product> {
    Some(Product {
        id: field_string(raw, "product_id")?,
        base_increment: field_decimal(raw, "base_increment")?,
        quote_increment: field_decimal(raw, "quote_increment")?,
        min_size: field_decimal(raw, "base_min_size").unwrap_or(Decimal::ZERO),
        price: field_decimal(raw, "price"),
        volume_24h: field_decimal(raw, "volume_24h"),
    })
}

fn parse_open_order(raw: &serde_json::Value) -> Option<OpenOrder> {
    let config = raw
        .get("order_configuration")
        .and_then(|c| c.get("limit_limit_gtc"));
    Some(OpenOrder {
        id: field_string(raw, "order_id")?,
        client_tag: field_string(raw, "client_order_id"),
        market_id: field_string(raw, "product_id")?,
        side: field_side(raw, "side")?,
        price: config.and_then(|c| field_decimal(c, "limit_price"))?,
        size: config.and_then(|c| field_decimal(c, "base_size"))?,
    })
}

fn parse_fill(raw: &serde_json::Value) -> Option<FillEvent> {
    Some(FillEvent {
        trade_id: field_string(raw, "trade_id")?,
        order_id: field_string(raw, "order_id")?,
        market_id: field_string(raw, "product_id")?,
        side: field_side(raw, "side")?,
        price: field_decimal(raw, "price")?,
        size: field_decimal(raw, "size")?,
        fee: field_decimal(raw, "commission").unwrap_or(Decimal::ZERO),
        timestamp: field_time(raw, "trade_time")?,
    })
}

#[async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    async fn get_products(&self) -> Result<Vec<Product>, ExchangeError> {
        let data = self.client.get("/brokerage/products").await?;
        let products = data
            .get("products")
            .and_then(|p| p.as_array())
            .map(|list| {
                list.iter()
                    // USD spot pairs only; skip rows with malformed increments.
                    .filter(|raw| {
                        field_string(raw, "product_id")
                            .map_or(false, |id| id.ends_with("-USD"))
                    })
                    .filter_map(parse_product)
                    .collect()
            })
            .unwrap_or_default();
        Ok(products)
    }

    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let data = self.client.get("/brokerage/accounts").await?;
        let mut balances = HashMap::new();
        if let Some(accounts) = data.get("accounts").and_then(|a| a.as_array()) {
            for account in accounts {
                let Some(currency) = field_string(account, "currency") else {
                    continue;
                };
                let available = account
                    .get("available_balance")
                    .and_then(|b| field_decimal(b, "value"))
                    .unwrap_or(Decimal::ZERO);
                if available > Decimal::ZERO {
                    balances.insert(currency, available);
                }
            }
        }
        Ok(balances)
    }

    async fn get_ticker(&self, market_id: &str) -> Result<Decimal, ExchangeError> {
        let data = self
            .client
            .get(&format!("/brokerage/products/{market_id}"))
            .await?;
        field_decimal(&data, "price")
            .ok_or_else(|| ExchangeError::Permanent(format!("no price for {market_id}")))
    }

    async fn place_limit_order(&self, req: &PlaceOrderRequest) -> Result<String, ExchangeError> {
        let body = json!({
            "client_order_id": req.client_tag,
            "product_id": req.market_id,
            "side": req.side.as_str(),
            "order_configuration": {
                "limit_limit_gtc": {
                    "base_size": req.size.to_string(),
                    "limit_price": req.price.to_string(),
                    "post_only": req.post_only,
                }
            }
        });

        let data = self.client.post("/brokerage/orders", body).await?;

        if data.get("success").and_then(serde_json::Value::as_bool) == Some(false) {
            let reason = data
                .get("error_response")
                .and_then(|e| field_string(e, "message"))
                .unwrap_or_else(|| "order rejected".to_string());
            return Err(ExchangeError::Permanent(reason));
        }

        data.get("success_response")
            .and_then(|r| field_string(r, "order_id"))
            .or_else(|| field_string(&data, "order_id"))
            .ok_or_else(|| ExchangeError::Permanent("no order_id in response".to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome, ExchangeError> {
        let body = json!({ "order_ids": [order_id] });
        let data = self
            .client
            .post("/brokerage/orders/batch_cancel", body)
            .await?;

        let succeeded = data
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|list| list.first())
            .and_then(|r| r.get("success"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if succeeded {
            Ok(CancelOutcome::Canceled)
        } else {
            Ok(CancelOutcome::NotFound)
        }
    }

    async fn list_open_orders(
        &self,
        market_id: Option<&str>,
    ) -> Result<Vec<OpenOrder>, ExchangeError> {
        let mut endpoint = "/brokerage/orders/historical/batch?order_status=OPEN".to_string();
        if let Some(market) = market_id {
            endpoint.push_str(&format!("&product_id={market}"));
        }
        let data = self.client.get(&endpoint).await?;
        Ok(data
            .get("orders")
            .and_then(|o| o.as_array())
            .map(|list| list.iter().filter_map(parse_open_order).collect())
            .unwrap_or_default())
    }

    async fn get_fills(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FillEvent>, ExchangeError> {
        let mut endpoint = "/brokerage/orders/historical/fills".to_string();
        if let Some(ts) = since {
            endpoint.push_str(&format!("?start_sequence_timestamp={}", ts.to_rfc3339()));
        }
        let data = self.client.get(&endpoint).await?;
        let mut fills: Vec<FillEvent> = data
            .get("fills")
            .and_then(|f| f.as_array())
            .map(|list| list.iter().filter_map(parse_fill).collect())
            .unwrap_or_default();
        fills.sort_by_key(|f| f.timestamp);
        Ok(fills)
    }

    async fn stream_ticker(
        &self,
        market_ids: Vec<String>,
        tx: mpsc::Sender<TickerUpdate>,
    ) -> Result<(), ExchangeError> {
        CoinbaseWebSocket::new(self.ws_url.clone())
            .run_ticker(market_ids, tx)
            .await
    }

    async fn stream_fills(&self, tx: mpsc::Sender<FillEvent>) -> Result<(), ExchangeError> {
        CoinbaseWebSocket::new(self.ws_url.clone())
            .run_user_fills(tx)
            .await
    }
}
