use gridtrade_core::{GridConfig, Product, ProfitMode, SizingMode};
use rust_decimal::Decimal;

/// Inputs the sizing modes need beyond the static config.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingInputs {
    /// Budget minus deployed capital plus realized profit.
    pub available_capital: Decimal,
    /// Realized PnL accrued this UTC month.
    pub monthly_realized_pnl: Decimal,
    /// Realized PnL over the bot's lifetime.
    pub lifetime_realized_pnl: Decimal,
}

/// One desired buy level.
#[derive(Debug, Clone, PartialEq)]
pub struct GridLevel {
    pub price: Decimal,
    pub size_base: Decimal,
    pub size_usd: Decimal,
}

/// The staging band the reconciler maintains: desired levels in descending
/// price order plus the band bounds used for pruning.
#[derive(Debug, Clone)]
pub struct PlannedGrid {
    pub grid_top: Decimal,
    /// Lowest price the band reaches; open buys below it are pruned.
    pub band_floor: Decimal,
    pub levels: Vec<GridLevel>,
}

/// Relative tolerance when matching an open order to a desired level.
const LEVEL_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 4); // 0.0001

/// Whether an existing order price occupies a desired level.
#[must_use]
pub fn prices_match(existing: Decimal, level: Decimal) -> bool {
    if level.is_zero() {
        return existing.is_zero();
    }
    ((existing - level) / level).abs() < LEVEL_TOLERANCE
}

/// Computes the desired buy levels for the staging band.
///
/// Levels descend multiplicatively from `min(price, grid_top)` by
/// `grid_step_pct` until they leave the band, capped at `max_band_orders`
/// and widened below the band as needed to reach `min_band_orders`.
/// Deterministic: identical inputs yield identical output.
#[must_use]
pub fn desired_levels(
    price: Decimal,
    anchor_high: Decimal,
    config: &GridConfig,
    product: &Product,
    sizing: &SizingInputs,
) -> PlannedGrid {
    let grid_top = if config.buffer_enabled && config.buffer_pct > Decimal::ZERO {
        anchor_high * (Decimal::ONE - config.buffer_pct)
    } else {
        anchor_high
    };

    let band_hi = price.min(grid_top);
    let band_lo = price * (Decimal::ONE - config.staging_band_depth_pct);
    let step_down = Decimal::ONE - config.grid_step_pct;

    let min_levels = config.min_band_orders as usize;
    let max_levels = config.max_band_orders as usize;

    let mut raw_levels: Vec<Decimal> = Vec::with_capacity(max_levels);
    let mut level = band_hi;
    loop {
        level *= step_down;
        if level <= Decimal::ZERO {
            break;
        }
        if level < band_lo && raw_levels.len() >= min_levels {
            break;
        }
        raw_levels.push(level);
        if raw_levels.len() >= max_levels {
            break;
        }
    }

    let level_count = raw_levels.len().max(1);
    let base_usd = match config.sizing_mode {
        SizingMode::BudgetSplit => {
            let pool = if config.profit_mode == ProfitMode::StepReinvest {
                config.budget_usd + sizing.lifetime_realized_pnl
            } else {
                config.budget_usd
            };
            pool / Decimal::from(level_count as u64)
        }
        SizingMode::FixedUsd => config.fixed_usd_per_trade,
        SizingMode::CapitalPct => {
            sizing.available_capital * config.capital_pct_per_trade / Decimal::ONE_HUNDRED
        }
    };

    let size_usd = if config.profit_mode == ProfitMode::SmartReinvest
        && sizing.monthly_realized_pnl < config.monthly_profit_target_usd
    {
        base_usd * config.smart_conservative_multiplier
    } else {
        base_usd
    };

    let mut levels = Vec::with_capacity(raw_levels.len());
    let mut band_floor = band_lo;
    for raw in raw_levels {
        let level_price = product.round_price_down(raw);
        if level_price <= Decimal::ZERO {
            continue;
        }
        if level_price < band_floor {
            band_floor = level_price;
        }
        let size_base = product.round_size_down(size_usd / level_price);
        if size_base < product.min_size || size_base <= Decimal::ZERO {
            continue;
        }
        levels.push(GridLevel {
            price: level_price,
            size_base,
            size_usd,
        });
    }

    PlannedGrid {
        grid_top,
        band_floor,
        levels,
    }
}

/// Target sell price for a filled buy, before increment rounding.
#[must_use]
pub fn sell_price(buy_price: Decimal, config: &GridConfig) -> Decimal {
    let pct = match config.profit_mode {
        ProfitMode::Custom => config.custom_profit_pct,
        ProfitMode::Step | ProfitMode::StepReinvest | ProfitMode::SmartReinvest => {
            config.grid_step_pct
        }
    };
    buy_price * (Decimal::ONE + pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn product() -> Product {
        Product {
            id: "BTC-USD".to_string(),
            base_increment: dec!(0.00000001),
            quote_increment: dec!(0.01),
            min_size: dec!(0.00000001),
            price: None,
            volume_24h: None,
        }
    }

    fn config() -> GridConfig {
        GridConfig {
            grid_step_pct: dec!(0.01),
            budget_usd: dec!(1000),
            staging_band_depth_pct: dec!(0.05),
            min_band_orders: 10,
            max_band_orders: 10,
            sizing_mode: SizingMode::FixedUsd,
            fixed_usd_per_trade: dec!(100),
            ..GridConfig::default()
        }
    }

    #[test]
    fn basic_grid_descends_one_percent_from_price() {
        let plan = desired_levels(
            dec!(100),
            dec!(100),
            &config(),
            &product(),
            &SizingInputs::default(),
        );

        assert_eq!(plan.levels.len(), 10);
        assert_eq!(plan.levels[0].price, dec!(99.00));
        assert_eq!(plan.levels[1].price, dec!(98.01));
        // 100 * 0.99^10, rounded down to the cent.
        assert_eq!(plan.levels[9].price, dec!(90.43));

        // Strictly descending, deterministic order.
        for pair in plan.levels.windows(2) {
            assert!(pair[0].price > pair[1].price);
        }
    }

    #[test]
    fn identical_inputs_produce_identical_grids() {
        let a = desired_levels(
            dec!(100),
            dec!(105),
            &config(),
            &product(),
            &SizingInputs::default(),
        );
        let b = desired_levels(
            dec!(100),
            dec!(105),
            &config(),
            &product(),
            &SizingInputs::default(),
        );
        assert_eq!(a.levels, b.levels);
    }

    #[test]
    fn band_tops_out_at_grid_top_when_price_is_above() {
        // Price recovered above the buffered anchor: levels start from grid_top.
        let cfg = GridConfig {
            buffer_enabled: true,
            buffer_pct: dec!(0.10),
            ..config()
        };
        let plan = desired_levels(
            dec!(100),
            dec!(100),
            &cfg,
            &product(),
            &SizingInputs::default(),
        );
        assert_eq!(plan.grid_top, dec!(90.00));
        assert!(plan.levels[0].price < dec!(90.00));
    }

    #[test]
    fn zero_band_depth_still_yields_min_orders() {
        let cfg = GridConfig {
            staging_band_depth_pct: Decimal::ZERO,
            min_band_orders: 10,
            max_band_orders: 25,
            ..config()
        };
        let plan = desired_levels(
            dec!(100),
            dec!(100),
            &cfg,
            &product(),
            &SizingInputs::default(),
        );
        assert_eq!(plan.levels.len(), 10);
    }

    #[test]
    fn level_count_is_capped_at_max_band_orders() {
        let cfg = GridConfig {
            grid_step_pct: dec!(0.001), // 0.1% steps would fit ~50 in a 5% band
            max_band_orders: 25,
            ..config()
        };
        let plan = desired_levels(
            dec!(100),
            dec!(100),
            &cfg,
            &product(),
            &SizingInputs::default(),
        );
        assert_eq!(plan.levels.len(), 25);
    }

    #[test]
    fn budget_split_divides_budget_across_levels() {
        let cfg = GridConfig {
            sizing_mode: SizingMode::BudgetSplit,
            ..config()
        };
        let plan = desired_levels(
            dec!(100),
            dec!(100),
            &cfg,
            &product(),
            &SizingInputs::default(),
        );
        assert_eq!(plan.levels[0].size_usd, dec!(100)); // 1000 / 10 levels
    }

    #[test]
    fn capital_pct_sizes_from_available_capital() {
        let cfg = GridConfig {
            sizing_mode: SizingMode::CapitalPct,
            capital_pct_per_trade: dec!(2),
            ..config()
        };
        let sizing = SizingInputs {
            available_capital: dec!(500),
            ..SizingInputs::default()
        };
        let plan = desired_levels(dec!(100), dec!(100), &cfg, &product(), &sizing);
        assert_eq!(plan.levels[0].size_usd, dec!(10)); // 500 * 2%
    }

    #[test]
    fn smart_reinvest_shrinks_size_until_target_met() {
        let cfg = GridConfig {
            profit_mode: ProfitMode::SmartReinvest,
            monthly_profit_target_usd: dec!(1000),
            smart_conservative_multiplier: dec!(0.5),
            ..config()
        };

        let under = SizingInputs {
            monthly_realized_pnl: dec!(950),
            ..SizingInputs::default()
        };
        let over = SizingInputs {
            monthly_realized_pnl: dec!(1000),
            ..SizingInputs::default()
        };

        let conservative = desired_levels(dec!(100), dec!(100), &cfg, &product(), &under);
        let full = desired_levels(dec!(100), dec!(100), &cfg, &product(), &over);
        assert_eq!(conservative.levels[0].size_usd, dec!(50));
        assert_eq!(full.levels[0].size_usd, dec!(100));
    }

    #[test]
    fn step_reinvest_recycles_realized_profit_into_split() {
        let cfg = GridConfig {
            profit_mode: ProfitMode::StepReinvest,
            sizing_mode: SizingMode::BudgetSplit,
            ..config()
        };
        let sizing = SizingInputs {
            lifetime_realized_pnl: dec!(500),
            ..SizingInputs::default()
        };
        let plan = desired_levels(dec!(100), dec!(100), &cfg, &product(), &sizing);
        assert_eq!(plan.levels[0].size_usd, dec!(150)); // (1000 + 500) / 10
    }

    #[test]
    fn sell_price_follows_profit_mode() {
        let step = config();
        assert_eq!(sell_price(dec!(99.00), &step), dec!(99.99));

        let custom = GridConfig {
            profit_mode: ProfitMode::Custom,
            custom_profit_pct: dec!(0.02),
            ..config()
        };
        assert_eq!(sell_price(dec!(100), &custom), dec!(102.00));
    }

    #[test]
    fn tolerance_matches_nearby_prices_only() {
        assert!(prices_match(dec!(99.000), dec!(99.001)));
        assert!(!prices_match(dec!(99.00), dec!(99.50)));
    }

    #[test]
    fn dust_levels_are_dropped() {
        let coarse = Product {
            min_size: dec!(1),
            base_increment: dec!(1),
            ..product()
        };
        let cfg = GridConfig {
            sizing_mode: SizingMode::FixedUsd,
            fixed_usd_per_trade: dec!(10), // 10 USD at price ~99 rounds to 0 units
            ..config()
        };
        let plan = desired_levels(
            dec!(100),
            dec!(100),
            &cfg,
            &coarse,
            &SizingInputs::default(),
        );
        assert!(plan.levels.is_empty());
    }
}
