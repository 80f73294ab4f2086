use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{ProfitMode, SizingMode};

/// Static application configuration (server, database, exchange selection).
///
/// Loaded once at startup from `config/Config.toml` merged with environment
/// overrides. Trading parameters live in [`GridConfig`], which is persisted
/// in the store and hot-reloadable over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_env")]
    pub env: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_env() -> String {
    "dev".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// "coinbase" or "mock".
    pub exchange_type: String,
    pub api_url: String,
    pub ws_url: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            exchange_type: "mock".to_string(),
            api_url: "https://api.coinbase.com/api/v3".to_string(),
            ws_url: "wss://advanced-trade-ws.coinbase.com".to_string(),
        }
    }
}

/// Engine loop tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Tick cadence in seconds. Ticks never overlap; a long tick delays the next.
    pub tick_interval_secs: u64,
    /// A ticker older than this many tick periods is stale and forces a REST refetch.
    pub stale_ticker_ticks: u32,
    /// Max cancels and max placements issued per tick by the reconciler.
    pub reconcile_budget: u32,
    /// Consecutive transient exchange failures before the engine degrades to HOLD.
    pub failure_hold_threshold: u32,
    /// Per-subscriber event queue depth for the WebSocket fan-out.
    pub event_queue_depth: usize,
    /// Exchange HTTP call deadline in seconds.
    pub request_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            stale_ticker_ticks: 3,
            reconcile_budget: 10,
            failure_hold_threshold: 10,
            event_queue_depth: 64,
            request_timeout_secs: 10,
        }
    }
}

/// Runtime trading configuration. One logical row in the store; replaced
/// atomically via `POST /api/config/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Distance between adjacent grid levels, as a fraction (0.01 = 1%).
    pub grid_step_pct: Decimal,
    /// Total quote-currency budget the grid may deploy.
    pub budget_usd: Decimal,
    /// Hard cap on concurrently open orders (exchange limit is 500; stay under).
    pub max_open_orders: u32,
    pub buffer_enabled: bool,
    /// Fraction shaved off the anchor when the buffer is enabled.
    pub buffer_pct: Decimal,
    /// Depth of the staging band below the live price, as a fraction.
    pub staging_band_depth_pct: Decimal,
    pub min_band_orders: u32,
    pub max_band_orders: u32,
    pub profit_mode: ProfitMode,
    pub custom_profit_pct: Decimal,
    pub monthly_profit_target_usd: Decimal,
    /// Buy-size multiplier while the monthly target is unmet (SMART_REINVEST).
    pub smart_conservative_multiplier: Decimal,
    pub sizing_mode: SizingMode,
    pub fixed_usd_per_trade: Decimal,
    /// Percent (not fraction) of available capital per trade for CAPITAL_PCT.
    pub capital_pct_per_trade: Decimal,
    pub live_trading_enabled: bool,
    pub paper_mode: bool,
    /// Fraction of notional reserved for fees when checking sell viability.
    pub fee_buffer_pct: Decimal,
    /// Fraction of the budget that may sit in open lots before HOLD engages.
    pub max_grid_capital_pct: Decimal,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_step_pct: Decimal::new(33, 4), // 0.33%
            budget_usd: Decimal::new(1000, 0),
            max_open_orders: 490,
            buffer_enabled: false,
            buffer_pct: Decimal::ZERO,
            staging_band_depth_pct: Decimal::new(5, 2), // 5%
            min_band_orders: 10,
            max_band_orders: 25,
            profit_mode: ProfitMode::Step,
            custom_profit_pct: Decimal::new(1, 2), // 1%
            monthly_profit_target_usd: Decimal::new(1000, 0),
            smart_conservative_multiplier: Decimal::new(5, 1), // 0.5
            sizing_mode: SizingMode::BudgetSplit,
            fixed_usd_per_trade: Decimal::new(10, 0),
            capital_pct_per_trade: Decimal::new(1, 0),
            live_trading_enabled: false,
            paper_mode: true,
            fee_buffer_pct: Decimal::ZERO,
            max_grid_capital_pct: Decimal::new(70, 2), // 0.70
        }
    }
}

impl GridConfig {
    /// Validates the configuration. Called before persisting an API update;
    /// a failed validation rejects the whole write.
    ///
    /// # Errors
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.grid_step_pct <= Decimal::ZERO {
            bail!("grid_step_pct must be positive");
        }
        if self.grid_step_pct >= Decimal::ONE {
            bail!("grid_step_pct must be below 1.0");
        }
        if self.budget_usd <= Decimal::ZERO {
            bail!("budget_usd must be positive");
        }
        if self.max_open_orders == 0 || self.max_open_orders > 490 {
            bail!("max_open_orders must be in 1..=490");
        }
        if self.buffer_pct < Decimal::ZERO || self.buffer_pct >= Decimal::ONE {
            bail!("buffer_pct must be in [0, 1)");
        }
        if self.staging_band_depth_pct < Decimal::ZERO
            || self.staging_band_depth_pct >= Decimal::ONE
        {
            bail!("staging_band_depth_pct must be in [0, 1)");
        }
        if self.min_band_orders == 0 {
            bail!("min_band_orders must be at least 1");
        }
        if self.min_band_orders > self.max_band_orders {
            bail!("min_band_orders must not exceed max_band_orders");
        }
        if self.max_band_orders > self.max_open_orders {
            bail!("max_band_orders must not exceed max_open_orders");
        }
        if self.custom_profit_pct <= Decimal::ZERO {
            bail!("custom_profit_pct must be positive");
        }
        if self.smart_conservative_multiplier <= Decimal::ZERO {
            bail!("smart_conservative_multiplier must be positive");
        }
        if self.fixed_usd_per_trade <= Decimal::ZERO {
            bail!("fixed_usd_per_trade must be positive");
        }
        if self.capital_pct_per_trade <= Decimal::ZERO
            || self.capital_pct_per_trade > Decimal::new(100, 0)
        {
            bail!("capital_pct_per_trade must be in (0, 100]");
        }
        if self.fee_buffer_pct < Decimal::ZERO || self.fee_buffer_pct >= Decimal::ONE {
            bail!("fee_buffer_pct must be in [0, 1)");
        }
        if self.max_grid_capital_pct <= Decimal::ZERO || self.max_grid_capital_pct > Decimal::ONE {
            bail!("max_grid_capital_pct must be in (0, 1]");
        }
        Ok(())
    }

    /// Capital ceiling above which the engine holds new buys.
    #[must_use]
    pub fn capital_cap(&self) -> Decimal {
        self.budget_usd * self.max_grid_capital_pct
    }
}
