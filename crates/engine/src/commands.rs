use chrono::{DateTime, Utc};
use gridtrade_core::EngineMode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum EngineCommand {
    /// Resume ticking for the currently enabled market.
    Start {
        reply: oneshot::Sender<Result<(), String>>,
    },
    Pause,
    Resume,
    /// Highlander switch: stop the active market, then enable the target.
    StartMarket {
        market_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    StopMarket {
        market_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Kill switch: cancel everything, disable all markets, stop.
    CancelAll {
        reply: oneshot::Sender<CancelAllReport>,
    },
    ResetAnchor {
        market_id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Full replacement of the runtime trading configuration.
    UpdateConfig {
        config: gridtrade_core::GridConfig,
        reply: oneshot::Sender<Result<(), String>>,
    },
    GetStatus {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub mode: EngineMode,
    pub active_market: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_price: Option<Decimal>,
    pub anchor_high: Option<Decimal>,
    pub open_orders: u32,
    pub deployed_capital: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelAllReport {
    pub requested: u32,
    pub canceled: u32,
    pub failed: u32,
}
