use gridtrade_core::{EngineMode, GridConfig};
use rust_decimal::Decimal;

/// Inputs the governor needs to rule on a placement.
#[derive(Debug, Clone, Copy)]
pub struct RiskSnapshot {
    pub mode: EngineMode,
    pub open_orders: u32,
    pub deployed_capital: Decimal,
    pub active_market_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MaxOpenOrders,
    MarketOrderCap,
    CapitalCap,
    Hold,
    TradingDisabled,
    Paused,
    Stopped,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::MaxOpenOrders => "open order cap reached",
            Self::MarketOrderCap => "per-market order cap reached",
            Self::CapitalCap => "grid capital cap reached",
            Self::Hold => "engine holding, buys suspended",
            Self::TradingDisabled => "neither live trading nor paper mode is enabled",
            Self::Paused => "engine paused",
            Self::Stopped => "engine stopped",
        };
        f.write_str(reason)
    }
}

/// Pure admission control over candidate order placements.
///
/// Applied before every placement; the kill path deliberately bypasses it
/// (cancels must always go through).
pub struct RiskGovernor;

impl RiskGovernor {
    /// Rules on a buy of the given notional value.
    #[must_use]
    pub fn admit_buy(
        config: &GridConfig,
        snapshot: &RiskSnapshot,
        notional: Decimal,
    ) -> Admission {
        if let Some(reason) = Self::global_deny(config, snapshot) {
            return Admission::Deny(reason);
        }
        if snapshot.mode == EngineMode::Hold {
            return Admission::Deny(DenyReason::Hold);
        }
        if snapshot.open_orders >= Self::market_order_cap(config, snapshot) {
            return Admission::Deny(DenyReason::MarketOrderCap);
        }
        if snapshot.deployed_capital + notional > config.capital_cap() {
            return Admission::Deny(DenyReason::CapitalCap);
        }
        Admission::Allow
    }

    /// Rules on a paired sell. Sells stay admitted in HOLD so inventory can
    /// always exit.
    #[must_use]
    pub fn admit_sell(config: &GridConfig, snapshot: &RiskSnapshot) -> Admission {
        if let Some(reason) = Self::global_deny(config, snapshot) {
            return Admission::Deny(reason);
        }
        Admission::Allow
    }

    fn global_deny(config: &GridConfig, snapshot: &RiskSnapshot) -> Option<DenyReason> {
        if !config.live_trading_enabled && !config.paper_mode {
            return Some(DenyReason::TradingDisabled);
        }
        match snapshot.mode {
            EngineMode::Paused => return Some(DenyReason::Paused),
            EngineMode::Stopped => return Some(DenyReason::Stopped),
            EngineMode::Running | EngineMode::Hold => {}
        }
        if snapshot.open_orders >= config.max_open_orders {
            return Some(DenyReason::MaxOpenOrders);
        }
        None
    }

    /// Soft per-market cap: the order budget split across active markets.
    /// With the single-active-market invariant this equals the global cap.
    fn market_order_cap(config: &GridConfig, snapshot: &RiskSnapshot) -> u32 {
        config.max_open_orders / snapshot.active_market_count.max(1)
    }

    /// Whether deployed capital has reached the HOLD threshold.
    #[must_use]
    pub fn hold_engaged(config: &GridConfig, deployed_capital: Decimal) -> bool {
        deployed_capital >= config.capital_cap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> GridConfig {
        GridConfig {
            budget_usd: dec!(1000),
            max_grid_capital_pct: dec!(0.70),
            max_open_orders: 10,
            paper_mode: true,
            ..GridConfig::default()
        }
    }

    fn snapshot() -> RiskSnapshot {
        RiskSnapshot {
            mode: EngineMode::Running,
            open_orders: 0,
            deployed_capital: Decimal::ZERO,
            active_market_count: 1,
        }
    }

    #[test]
    fn admits_a_buy_within_all_caps() {
        let admission = RiskGovernor::admit_buy(&config(), &snapshot(), dec!(100));
        assert_eq!(admission, Admission::Allow);
    }

    #[test]
    fn denies_buy_at_order_cap() {
        let snap = RiskSnapshot {
            open_orders: 10,
            ..snapshot()
        };
        assert_eq!(
            RiskGovernor::admit_buy(&config(), &snap, dec!(100)),
            Admission::Deny(DenyReason::MaxOpenOrders)
        );
    }

    #[test]
    fn denies_buy_that_would_exceed_capital_cap() {
        let snap = RiskSnapshot {
            deployed_capital: dec!(650),
            ..snapshot()
        };
        assert_eq!(
            RiskGovernor::admit_buy(&config(), &snap, dec!(100)),
            Admission::Deny(DenyReason::CapitalCap)
        );
        // The same order fits when less capital is deployed.
        let snap = RiskSnapshot {
            deployed_capital: dec!(600),
            ..snapshot()
        };
        assert_eq!(
            RiskGovernor::admit_buy(&config(), &snap, dec!(100)),
            Admission::Allow
        );
    }

    #[test]
    fn hold_denies_buys_but_admits_sells() {
        let snap = RiskSnapshot {
            mode: EngineMode::Hold,
            deployed_capital: dec!(700),
            ..snapshot()
        };
        assert_eq!(
            RiskGovernor::admit_buy(&config(), &snap, dec!(10)),
            Admission::Deny(DenyReason::Hold)
        );
        assert_eq!(RiskGovernor::admit_sell(&config(), &snap), Admission::Allow);
    }

    #[test]
    fn refuses_to_act_when_neither_live_nor_paper() {
        let cfg = GridConfig {
            live_trading_enabled: false,
            paper_mode: false,
            ..config()
        };
        assert_eq!(
            RiskGovernor::admit_buy(&cfg, &snapshot(), dec!(10)),
            Admission::Deny(DenyReason::TradingDisabled)
        );
        assert_eq!(
            RiskGovernor::admit_sell(&cfg, &snapshot()),
            Admission::Deny(DenyReason::TradingDisabled)
        );
    }

    #[test]
    fn paused_and_stopped_deny_everything() {
        for mode in [EngineMode::Paused, EngineMode::Stopped] {
            let snap = RiskSnapshot { mode, ..snapshot() };
            assert!(matches!(
                RiskGovernor::admit_buy(&config(), &snap, dec!(10)),
                Admission::Deny(_)
            ));
            assert!(matches!(
                RiskGovernor::admit_sell(&config(), &snap),
                Admission::Deny(_)
            ));
        }
    }

    #[test]
    fn hold_threshold_is_budget_times_cap() {
        assert!(!RiskGovernor::hold_engaged(&config(), dec!(699.99)));
        assert!(RiskGovernor::hold_engaged(&config(), dec!(700)));
    }
}
