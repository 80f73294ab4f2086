use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Datelike, Duration, TimeZone, Utc};
use gridtrade_core::{EngineMode, ExchangeAdapter, GridConfig, OrderStatus, Side};
use gridtrade_store::{FillRecord, LotRecord, MarketRecord, OrderRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Bot status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct BotStatusResponse {
    pub env: String,
    pub live_trading: bool,
    pub exchange_type: String,
    pub paper_mode: bool,
    pub running: bool,
    pub active_markets: Vec<String>,
}

/// `GET /api/bot/status`
///
/// # Errors
/// Returns 503 if the engine is unreachable.
pub async fn bot_status(
    State(state): State<AppState>,
) -> Result<Json<BotStatusResponse>, ApiError> {
    let status = state
        .handle
        .status()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    let config = state.store.config().load_or_init().await?;

    Ok(Json(BotStatusResponse {
        env: state.env.env.clone(),
        live_trading: config.live_trading_enabled,
        exchange_type: state.env.exchange_type.clone(),
        paper_mode: config.paper_mode,
        running: matches!(status.mode, EngineMode::Running | EngineMode::Hold),
        active_markets: status.active_market.into_iter().collect(),
    }))
}

/// `POST /api/bot/start`: resume ticking for the enabled market.
///
/// # Errors
/// Returns 400 if no market is enabled.
pub async fn bot_start(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .handle
        .start()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// `POST /api/bot/pause`: ticks become no-ops until resumed.
///
/// # Errors
/// Returns 503 if the engine is unreachable.
pub async fn bot_pause(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .handle
        .pause()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// `POST /api/bot/resume`
///
/// # Errors
/// Returns 503 if the engine is unreachable.
pub async fn bot_resume(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .handle
        .resume()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MarketListQuery {
    #[serde(default)]
    pub favorites_only: bool,
}

/// `GET /api/markets/`
///
/// # Errors
/// Returns 500 on store failure.
pub async fn list_markets(
    State(state): State<AppState>,
    Query(query): Query<MarketListQuery>,
) -> Result<Json<Vec<MarketRecord>>, ApiError> {
    Ok(Json(state.store.markets().list(query.favorites_only).await?))
}

#[derive(Serialize)]
pub struct PairPrice {
    pub product_id: String,
    pub price: Option<Decimal>,
}

/// `GET /api/markets/all-pairs`
///
/// # Errors
/// Returns 503 if the exchange cannot be reached.
pub async fn all_pairs(State(state): State<AppState>) -> Result<Json<Vec<PairPrice>>, ApiError> {
    let products = state
        .adapter
        .get_products()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(
        products
            .into_iter()
            .map(|p| PairPrice {
                product_id: p.id,
                price: p.price,
            })
            .collect(),
    ))
}

/// `POST /api/markets/{id}/favorite`
///
/// # Errors
/// Returns 404 for unknown markets.
pub async fn toggle_favorite(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.store.markets().get(&market_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("market not found: {market_id}")));
    }
    let favorite = state.store.markets().toggle_favorite(&market_id).await?;
    Ok(Json(json!({ "market_id": market_id, "is_favorite": favorite })))
}

/// `POST /api/markets/{id}/start`: the Highlander switch.
///
/// # Errors
/// Returns 400 if the switch fails (the previous market is untouched).
pub async fn start_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .handle
        .start_market(&market_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// `POST /api/markets/{id}/stop`
///
/// # Errors
/// Returns 400 if the stop fails.
pub async fn stop_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .handle
        .stop_market(&market_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// `POST /api/markets/{id}/reset-anchor`: the one sanctioned way to move
/// the anchor down.
///
/// # Errors
/// Returns 400 if the reset fails.
pub async fn reset_anchor(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .handle
        .reset_anchor(&market_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct MarketUpdate {
    pub ranking: Option<i64>,
    pub settings: Option<serde_json::Value>,
}

/// `PATCH /api/markets/{id}`
///
/// # Errors
/// Returns 404 for unknown markets.
pub async fn update_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(update): Json<MarketUpdate>,
) -> Result<Json<MarketRecord>, ApiError> {
    if state.store.markets().get(&market_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("market not found: {market_id}")));
    }
    let market = state
        .store
        .markets()
        .update_partial(&market_id, update.ranking, update.settings)
        .await?;
    Ok(Json(market))
}

// ---------------------------------------------------------------------------
// Orders / lots / history
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct OrderListQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub skip: i64,
}

fn default_limit() -> i64 {
    100
}

/// `GET /api/orders/`
///
/// # Errors
/// Returns 400 for an invalid status filter.
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<Vec<OrderRecord>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<OrderStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(
        state
            .store
            .orders()
            .list(status, query.limit.clamp(1, 1000), query.skip.max(0))
            .await?,
    ))
}

/// `DELETE /api/orders/{id}`: manual cancel.
///
/// # Errors
/// Returns 404 for unknown orders, 400 when the order is not open.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let orders = state.store.orders();
    let Some(order) = orders.get(&order_id).await? else {
        return Err(ApiError::NotFound(format!("order not found: {order_id}")));
    };
    if order.status != OrderStatus::Open {
        return Err(ApiError::BadRequest(format!(
            "order {order_id} is {}, not OPEN",
            order.status.as_str()
        )));
    }

    state
        .adapter
        .cancel_order(&order_id)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    orders.set_status(&order_id, OrderStatus::Canceled).await?;
    orders.release_tag(&order_id).await?;
    if let (Some(lot_id), Side::Sell) = (order.lot_id, order.side) {
        state.store.lots().clear_sell(lot_id).await?;
    }
    state
        .store
        .audit()
        .append(
            "user",
            "order_cancel",
            Some(json!({ "order_id": order_id, "status": "OPEN" })),
            Some(json!({ "order_id": order_id, "status": "CANCELED" })),
        )
        .await?;

    Ok(Json(json!({ "order_id": order_id, "status": "CANCELED" })))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub skip: i64,
}

/// `GET /api/lots/`
///
/// # Errors
/// Returns 500 on store failure.
pub async fn list_lots(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<LotRecord>>, ApiError> {
    Ok(Json(
        state
            .store
            .lots()
            .list(query.limit.clamp(1, 1000), query.skip.max(0))
            .await?,
    ))
}

/// `GET /api/history/fills`
///
/// # Errors
/// Returns 500 on store failure.
pub async fn list_fills(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<FillRecord>>, ApiError> {
    Ok(Json(
        state
            .store
            .fills()
            .list(query.limit.clamp(1, 1000), query.skip.max(0))
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `GET /api/config/`
///
/// # Errors
/// Returns 500 on store failure.
pub async fn get_config(State(state): State<AppState>) -> Result<Json<GridConfig>, ApiError> {
    Ok(Json(state.store.config().load_or_init().await?))
}

/// `POST /api/config/`: full replacement, all-or-nothing.
///
/// # Errors
/// Returns 400 if validation fails; the stored config is unchanged.
pub async fn update_config(
    State(state): State<AppState>,
    Json(config): Json<GridConfig>,
) -> Result<Json<GridConfig>, ApiError> {
    state
        .handle
        .update_config(config.clone())
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(config))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// `POST /api/control/cancel_all`: the kill switch. Always 2xx when the
/// engine is reachable; partial failures are reported in the body and
/// swept by subsequent ticks.
///
/// # Errors
/// Returns 503 only if the engine task is gone.
pub async fn cancel_all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state
        .handle
        .cancel_all()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(json!({
        "status": "triggered",
        "requested": report.requested,
        "canceled": report.canceled,
        "failed": report.failed,
    })))
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct CapitalSummary {
    pub starting_capital: Decimal,
    pub current_capital: Decimal,
    pub net_change_usd: Decimal,
    pub net_change_pct: Decimal,
    pub deployed_capital: Decimal,
    pub available_capital: Decimal,
    pub unrealized_pnl: Decimal,
}

/// `GET /api/stats/capital-summary`
///
/// # Errors
/// Returns 500 on store failure. Price-fetch failures skip that market's
/// unrealized contribution rather than failing the request.
pub async fn capital_summary(
    State(state): State<AppState>,
) -> Result<Json<CapitalSummary>, ApiError> {
    let config = state.store.config().load_or_init().await?;
    let lifetime = state.store.lots().realized_pnl_total().await?;
    let deployed = state.store.lots().deployed_capital().await?;
    let open_lots = state.store.lots().open_lots(None).await?;

    // Mark open inventory to market, one ticker call per market.
    let mut by_market: HashMap<String, Vec<&LotRecord>> = HashMap::new();
    for lot in &open_lots {
        by_market.entry(lot.market_id.clone()).or_default().push(lot);
    }
    let mut unrealized = Decimal::ZERO;
    for (market_id, lots) in by_market {
        match state.adapter.get_ticker(&market_id).await {
            Ok(price) => {
                for lot in lots {
                    let remaining = lot.buy_size - lot.sold_size;
                    unrealized += (price - lot.buy_price) * remaining;
                }
            }
            Err(e) => {
                tracing::warn!(market = %market_id, error = %e, "skipping unrealized pnl");
            }
        }
    }

    let starting = config.budget_usd;
    let current = starting + lifetime;
    let pct = if starting > Decimal::ZERO {
        lifetime / starting * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };

    Ok(Json(CapitalSummary {
        starting_capital: starting,
        current_capital: current,
        net_change_usd: lifetime,
        net_change_pct: pct,
        deployed_capital: deployed,
        available_capital: starting - deployed + lifetime,
        unrealized_pnl: unrealized,
    }))
}

#[derive(Serialize)]
pub struct PnlBreakdown {
    pub today_pnl: Decimal,
    pub today_pct: Decimal,
    pub week_pnl: Decimal,
    pub week_pct: Decimal,
    pub month_pnl: Decimal,
    pub month_pct: Decimal,
    pub year_pnl: Decimal,
    pub year_pct: Decimal,
    pub lifetime_pnl: Decimal,
    pub lifetime_pct: Decimal,
}

/// `GET /api/stats/pnl-breakdown`
///
/// # Errors
/// Returns 500 on store failure.
pub async fn pnl_breakdown(State(state): State<AppState>) -> Result<Json<PnlBreakdown>, ApiError> {
    let config = state.store.config().load_or_init().await?;
    let now = Utc::now();
    let today = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now);
    let week = today - Duration::days(i64::from(now.weekday().num_days_from_monday()));
    let month = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(today);
    let year = Utc
        .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(today);

    let lots = state.store.lots();
    let today_pnl = lots.realized_pnl_since(today).await?;
    let week_pnl = lots.realized_pnl_since(week).await?;
    let month_pnl = lots.realized_pnl_since(month).await?;
    let year_pnl = lots.realized_pnl_since(year).await?;
    let lifetime_pnl = lots.realized_pnl_total().await?;

    let pct = |pnl: Decimal| {
        if config.budget_usd > Decimal::ZERO {
            pnl / config.budget_usd * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    };

    Ok(Json(PnlBreakdown {
        today_pct: pct(today_pnl),
        week_pct: pct(week_pnl),
        month_pct: pct(month_pnl),
        year_pct: pct(year_pnl),
        lifetime_pct: pct(lifetime_pnl),
        today_pnl,
        week_pnl,
        month_pnl,
        year_pnl,
        lifetime_pnl,
    }))
}

#[derive(Deserialize)]
pub struct PnlHistoryQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    30
}

#[derive(Serialize)]
pub struct DailyPnlPoint {
    pub date: String,
    pub pnl: Decimal,
    pub cumulative: Decimal,
}

#[derive(Serialize)]
pub struct PnlHistory {
    pub daily_pnl: Vec<DailyPnlPoint>,
}

/// `GET /api/stats/pnl-history?days=N`
///
/// Serves end-of-day snapshots when they exist and falls back to grouping
/// closed lots by day.
///
/// # Errors
/// Returns 500 on store failure.
pub async fn pnl_history(
    State(state): State<AppState>,
    Query(query): Query<PnlHistoryQuery>,
) -> Result<Json<PnlHistory>, ApiError> {
    let since = Utc::now() - Duration::days(query.days.clamp(1, 3650));
    let since_date = since.format("%Y-%m-%d").to_string();

    let snapshots = state.store.snapshots().range(&since_date).await?;
    if !snapshots.is_empty() {
        return Ok(Json(PnlHistory {
            daily_pnl: snapshots
                .into_iter()
                .map(|s| DailyPnlPoint {
                    date: s.date,
                    pnl: s.realized_pnl,
                    cumulative: s.cumulative_pnl,
                })
                .collect(),
        }));
    }

    let mut cumulative = Decimal::ZERO;
    let daily = state
        .store
        .lots()
        .realized_by_day(since)
        .await?
        .into_iter()
        .map(|(date, pnl)| {
            cumulative += pnl;
            DailyPnlPoint {
                date,
                pnl,
                cumulative,
            }
        })
        .collect();
    Ok(Json(PnlHistory { daily_pnl: daily }))
}
