use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => anyhow::bail!("unknown order side: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingPlace,
    Open,
    Filled,
    Canceled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingPlace => "PENDING_PLACE",
            Self::Open => "OPEN",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_PLACE" => Ok(Self::PendingPlace),
            "OPEN" => Ok(Self::Open),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" => Ok(Self::Canceled),
            "REJECTED" => Ok(Self::Rejected),
            "UNKNOWN" => Ok(Self::Unknown),
            other => anyhow::bail!("unknown order status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineMode {
    Stopped,
    Running,
    Hold,
    Paused,
}

impl EngineMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::Hold => "HOLD",
            Self::Paused => "PAUSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfitMode {
    Step,
    StepReinvest,
    Custom,
    SmartReinvest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingMode {
    BudgetSplit,
    FixedUsd,
    CapitalPct,
}

/// Tradable product metadata as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub base_increment: Decimal,
    pub quote_increment: Decimal,
    pub min_size: Decimal,
    pub price: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
}

impl Product {
    /// Rounds a base-asset quantity down to the product's base increment.
    #[must_use]
    pub fn round_size_down(&self, size: Decimal) -> Decimal {
        round_down_to(size, self.base_increment)
    }

    /// Rounds a quote price down to the product's quote increment.
    #[must_use]
    pub fn round_price_down(&self, price: Decimal) -> Decimal {
        round_down_to(price, self.quote_increment)
    }

    /// Rounds a quote price up to the product's quote increment.
    #[must_use]
    pub fn round_price_up(&self, price: Decimal) -> Decimal {
        round_up_to(price, self.quote_increment)
    }
}

fn round_down_to(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).floor() * increment
}

fn round_up_to(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).ceil() * increment
}

/// A price observation from the ticker stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub market_id: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A fill reported by the exchange (stream or history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub trade_id: String,
    pub order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// An order currently resting on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub client_tag: Option<String>,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub client_tag: String,
    pub post_only: bool,
}

impl PlaceOrderRequest {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
}
