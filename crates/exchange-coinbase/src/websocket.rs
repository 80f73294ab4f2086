use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use gridtrade_core::{Backoff, ExchangeError, FillEvent, TickerUpdate};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Market-data and user-event WebSocket streams.
///
/// Each stream reconnects forever with exponential backoff; the consumer
/// dropping its channel ends the stream. Delivery is at-least-once: after
/// a reconnect the exchange may replay recent events, and downstream
/// dedup (fill ids) absorbs the repeats.
pub struct CoinbaseWebSocket {
    ws_url: String,
}

impl CoinbaseWebSocket {
    #[must_use]
    pub const fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// Streams ticker prices for `market_ids` into `tx` until the receiver
    /// is dropped.
    ///
    /// # Errors
    /// Currently never returns an error; connection failures are retried.
    pub async fn run_ticker(
        &self,
        market_ids: Vec<String>,
        tx: mpsc::Sender<TickerUpdate>,
    ) -> Result<(), ExchangeError> {
        let subscribe = json!({
            "type": "subscribe",
            "channel": "ticker",
            "product_ids": market_ids,
        });

        self.run_channel(subscribe, |message| {
            let mut updates = Vec::new();
            if message.get("channel").and_then(|c| c.as_str()) != Some("ticker") {
                return updates;
            }
            let Some(events) = message.get("events").and_then(|e| e.as_array()) else {
                return updates;
            };
            for event in events {
                let Some(tickers) = event.get("tickers").and_then(|t| t.as_array()) else {
                    continue;
                };
                for ticker in tickers {
                    let (Some(market_id), Some(price)) = (
                        ticker.get("product_id").and_then(|v| v.as_str()),
                        ticker
                            .get("price")
                            .and_then(|v| v.as_str())
                            .and_then(|s| Decimal::from_str(s).ok()),
                    ) else {
                        continue;
                    };
                    updates.push(TickerUpdate {
                        market_id: market_id.to_string(),
                        price,
                        timestamp: Utc::now(),
                    });
                }
            }
            updates
        }, tx)
        .await
    }

    /// Streams the account's fills into `tx` until the receiver is dropped.
    ///
    /// # Errors
    /// Currently never returns an error; connection failures are retried.
    pub async fn run_user_fills(
        &self,
        tx: mpsc::Sender<FillEvent>,
    ) -> Result<(), ExchangeError> {
        let subscribe = json!({
            "type": "subscribe",
            "channel": "user",
        });

        self.run_channel(subscribe, |message| {
            let mut fills = Vec::new();
            if message.get("channel").and_then(|c| c.as_str()) != Some("user") {
                return fills;
            }
            let Some(events) = message.get("events").and_then(|e| e.as_array()) else {
                return fills;
            };
            for event in events {
                let Some(orders) = event.get("fills").and_then(|o| o.as_array()) else {
                    continue;
                };
                for raw in orders {
                    let get_str =
                        |field: &str| raw.get(field).and_then(|v| v.as_str()).map(str::to_string);
                    let get_dec = |field: &str| {
                        raw.get(field)
                            .and_then(|v| v.as_str())
                            .and_then(|s| Decimal::from_str(s).ok())
                    };
                    let (Some(trade_id), Some(order_id), Some(market_id), Some(side)) = (
                        get_str("trade_id"),
                        get_str("order_id"),
                        get_str("product_id"),
                        get_str("side").and_then(|s| s.parse().ok()),
                    ) else {
                        continue;
                    };
                    let (Some(price), Some(size)) = (get_dec("price"), get_dec("size")) else {
                        continue;
                    };
                    fills.push(FillEvent {
                        trade_id,
                        order_id,
                        market_id,
                        side,
                        price,
                        size,
                        fee: get_dec("commission").unwrap_or(Decimal::ZERO),
                        timestamp: raw
                            .get("trade_time")
                            .and_then(|v| v.as_str())
                            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                            .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc)),
                    });
                }
            }
            fills
        }, tx)
        .await
    }

    async fn run_channel<T, F>(
        &self,
        subscribe: serde_json::Value,
        parse: F,
        tx: mpsc::Sender<T>,
    ) -> Result<(), ExchangeError>
    where
        F: Fn(&serde_json::Value) -> Vec<T> + Send,
        T: Send,
    {
        let mut backoff = Backoff::default();

        loop {
            if tx.is_closed() {
                return Ok(());
            }

            match self.connect_and_pump(&subscribe, &parse, &tx).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, ?delay, "websocket dropped, reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Runs one connection until it drops. Returns `Ok` only when the
    /// consumer is gone (the stream is finished for good).
    async fn connect_and_pump<T, F>(
        &self,
        subscribe: &serde_json::Value,
        parse: &F,
        tx: &mpsc::Sender<T>,
    ) -> Result<(), ExchangeError>
    where
        F: Fn(&serde_json::Value) -> Vec<T> + Send,
        T: Send,
    {
        let (mut stream, _) = connect_async(&self.ws_url)
            .await
            .map_err(|e| ExchangeError::Transient(format!("connect failed: {e}")))?;

        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| ExchangeError::Transient(format!("subscribe failed: {e}")))?;
        tracing::info!(url = %self.ws_url, "websocket connected");

        while let Some(message) = stream.next().await {
            let message =
                message.map_err(|e| ExchangeError::Transient(format!("stream error: {e}")))?;
            match message {
                Message::Text(text) => {
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    for item in parse(&value) {
                        if tx.send(item).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = stream.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => {
                    return Err(ExchangeError::Transient("server closed stream".to_string()));
                }
                _ => {}
            }
        }

        Err(ExchangeError::Transient("stream ended".to_string()))
    }
}
