use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;

use crate::models::{MarketState, ProfitTracker};

const PROFIT_KEY: &str = "profit_tracker";

/// Repository for the bot_state key/value table.
///
/// Rows are JSON blobs: one per market (anchor and tick bookkeeping) plus
/// the global monthly profit tracker.
#[derive(Debug, Clone)]
pub struct StateRepo {
    pool: SqlitePool,
}

impl StateRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM bot_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(raw,)| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    async fn save_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO bot_state (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn market_key(market_id: &str) -> String {
        format!("market:{market_id}")
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn market_state(&self, market_id: &str) -> Result<MarketState> {
        Ok(self
            .load_json(&Self::market_key(market_id))
            .await?
            .unwrap_or_default())
    }

    /// Raises the anchor for a market. The anchor never decreases; a lower
    /// candidate is ignored and the stored value returned.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn raise_anchor(&self, market_id: &str, candidate: Decimal) -> Result<Decimal> {
        let mut state = self.market_state(market_id).await?;
        let anchor = match state.anchor_high {
            Some(current) if current >= candidate => current,
            _ => {
                state.anchor_high = Some(candidate);
                self.save_json(&Self::market_key(market_id), &state).await?;
                candidate
            }
        };
        Ok(anchor)
    }

    /// Operator-initiated anchor reset: the one sanctioned way down.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn reset_anchor(&self, market_id: &str) -> Result<()> {
        let mut state = self.market_state(market_id).await?;
        state.anchor_high = None;
        self.save_json(&Self::market_key(market_id), &state).await
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn touch_tick(&self, market_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.market_state(market_id).await?;
        state.last_tick_at = Some(at);
        self.save_json(&Self::market_key(market_id), &state).await
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_last_fill_at(&self, market_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.market_state(market_id).await?;
        if state.last_fill_at.map_or(true, |current| at > current) {
            state.last_fill_at = Some(at);
            self.save_json(&Self::market_key(market_id), &state).await?;
        }
        Ok(())
    }

    /// Loads the profit tracker, resetting it if the UTC month rolled over.
    ///
    /// # Errors
    /// Returns an error if the read or write fails.
    pub async fn profit_tracker(&self, now: DateTime<Utc>) -> Result<ProfitTracker> {
        let month = now.format("%Y-%m").to_string();
        match self.load_json::<ProfitTracker>(PROFIT_KEY).await? {
            Some(tracker) if tracker.month == month => Ok(tracker),
            stale => {
                if let Some(old) = stale {
                    tracing::info!(
                        old_month = %old.month,
                        new_month = %month,
                        "new month, resetting profit counter"
                    );
                }
                let fresh = ProfitTracker::for_month(now);
                self.save_json(PROFIT_KEY, &fresh).await?;
                Ok(fresh)
            }
        }
    }

    /// Adds realized profit to the current month's counter.
    ///
    /// # Errors
    /// Returns an error if the read or write fails.
    pub async fn add_profit(&self, amount: Decimal, now: DateTime<Utc>) -> Result<ProfitTracker> {
        let mut tracker = self.profit_tracker(now).await?;
        tracker.current_month_realized_pnl_usd += amount;
        self.save_json(PROFIT_KEY, &tracker).await?;
        Ok(tracker)
    }
}
