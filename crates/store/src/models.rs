use anyhow::Result;
use chrono::{DateTime, Utc};
use gridtrade_core::{OrderStatus, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: String,
    pub enabled: bool,
    pub is_favorite: bool,
    pub market_rank: i64,
    pub volume_24h: Decimal,
    pub settings: Option<serde_json::Value>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub client_tag: Option<String>,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub status: OrderStatus,
    pub lot_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub id: String,
    pub order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Open,
    SellPlaced,
    Closed,
}

impl LotStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::SellPlaced => "SELL_PLACED",
            Self::Closed => "CLOSED",
        }
    }
}

impl FromStr for LotStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(Self::Open),
            "SELL_PLACED" => Ok(Self::SellPlaced),
            "CLOSED" => Ok(Self::Closed),
            other => anyhow::bail!("unknown lot status: {other}"),
        }
    }
}

/// One unit of inventory: a buy fill and its paired profit-taking sell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotRecord {
    pub id: i64,
    pub market_id: String,
    pub buy_order_id: String,
    pub buy_price: Decimal,
    pub buy_size: Decimal,
    pub buy_fee: Decimal,
    pub buy_time: DateTime<Utc>,
    pub sell_order_id: Option<String>,
    pub sell_price: Option<Decimal>,
    pub sell_time: Option<DateTime<Utc>>,
    pub sold_size: Decimal,
    pub realized_pnl: Decimal,
    pub status: LotStatus,
}

impl LotRecord {
    /// Quote capital still tied up in this lot (unsold portion at cost).
    #[must_use]
    pub fn deployed(&self) -> Decimal {
        if self.status == LotStatus::Closed {
            return Decimal::ZERO;
        }
        self.buy_price * (self.buy_size - self.sold_size)
    }
}

/// Per-market engine state persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketState {
    pub anchor_high: Option<Decimal>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_fill_at: Option<DateTime<Utc>>,
}

/// Monthly realized-profit counter for SMART_REINVEST sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitTracker {
    pub current_month_realized_pnl_usd: Decimal,
    /// UTC month the counter was last reset for, as "YYYY-MM".
    pub month: String,
}

impl ProfitTracker {
    #[must_use]
    pub fn for_month(now: DateTime<Utc>) -> Self {
        Self {
            current_month_realized_pnl_usd: Decimal::ZERO,
            month: now.format("%Y-%m").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub date: String,
    pub realized_pnl: Decimal,
    pub trade_count: i64,
    pub cumulative_pnl: Decimal,
}

/// Parses a TEXT decimal column. SQLite has no native decimal type, so all
/// prices and sizes round-trip through strings at this boundary.
pub(crate) fn parse_decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| anyhow::anyhow!("invalid decimal in column {column}: {raw:?} ({e})"))
}

pub(crate) fn parse_decimal_opt(column: &str, raw: Option<&str>) -> Result<Option<Decimal>> {
    raw.map(|s| parse_decimal(column, s)).transpose()
}

pub(crate) fn parse_json_opt(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(s).map_err(Into::into))
        .transpose()
}
