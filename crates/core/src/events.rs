use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{EngineMode, Side};

/// Events fanned out to WebSocket subscribers.
///
/// Price updates are lossy under backpressure; fills and state changes are
/// never dropped. Within a tick the publication order is price update,
/// then fills, then state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BotEvent {
    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate {
        market_id: String,
        price: Decimal,
        anchor: Decimal,
        grid_top: Decimal,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "ORDER_FILLED")]
    OrderFilled {
        market_id: String,
        order_id: String,
        side: Side,
        price: Decimal,
        size: Decimal,
        lot_id: Option<i64>,
        realized_pnl: Option<Decimal>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "STATE_CHANGE")]
    StateChange {
        mode: EngineMode,
        market_id: Option<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "LOG_ENTRY")]
    LogEntry {
        level: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl BotEvent {
    /// Whether subscribers may lose this event under backpressure.
    #[must_use]
    pub const fn is_lossy(&self) -> bool {
        matches!(self, Self::PriceUpdate { .. } | Self::LogEntry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = BotEvent::StateChange {
            mode: EngineMode::Running,
            market_id: Some("BTC-USD".to_string()),
            reason: "started".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "STATE_CHANGE");
        assert_eq!(json["data"]["mode"], "RUNNING");
    }

    #[test]
    fn price_updates_are_lossy_fills_are_not() {
        let price = BotEvent::PriceUpdate {
            market_id: "BTC-USD".to_string(),
            price: dec!(100),
            anchor: dec!(100),
            grid_top: dec!(100),
            timestamp: Utc::now(),
        };
        let fill = BotEvent::OrderFilled {
            market_id: "BTC-USD".to_string(),
            order_id: "x".to_string(),
            side: Side::Buy,
            price: dec!(99),
            size: dec!(1),
            lot_id: None,
            realized_pnl: None,
            timestamp: Utc::now(),
        };
        assert!(price.is_lossy());
        assert!(!fill.is_lossy());
    }
}
