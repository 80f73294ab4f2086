use anyhow::Result;
use chrono::{DateTime, Utc};
use gridtrade_core::{FillEvent, Side};
use sqlx::sqlite::SqlitePool;

use crate::models::{parse_decimal, FillRecord};

/// Repository for the fills table.
#[derive(Debug, Clone)]
pub struct FillRepo {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct FillRow {
    id: String,
    order_id: String,
    market_id: String,
    side: String,
    price: String,
    size: String,
    fee: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<FillRow> for FillRecord {
    type Error = anyhow::Error;

    fn try_from(row: FillRow) -> Result<Self> {
        Ok(Self {
            side: row.side.parse::<Side>()?,
            price: parse_decimal("price", &row.price)?,
            size: parse_decimal("size", &row.size)?,
            fee: parse_decimal("fee", &row.fee)?,
            timestamp: row.timestamp,
            id: row.id,
            order_id: row.order_id,
            market_id: row.market_id,
        })
    }
}

const SELECT: &str =
    "SELECT id, order_id, market_id, side, price, size, fee, timestamp FROM fills";

impl FillRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a fill. Returns false if the trade id was already recorded;
    /// the streams deliver at-least-once, so duplicates are expected.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn insert(&self, fill: &FillEvent) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO fills (id, order_id, market_id, side, price, size, fee, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&fill.trade_id)
        .bind(&fill.order_id)
        .bind(&fill.market_id)
        .bind(fill.side.as_str())
        .bind(fill.price.to_string())
        .bind(fill.size.to_string())
        .bind(fill.fee.to_string())
        .bind(fill.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Timestamp of the newest recorded fill, used as the reconciliation
    /// lower bound after a restart.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn last_fill_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT timestamp FROM fills ORDER BY timestamp DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ts,)| ts))
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn for_order(&self, order_id: &str) -> Result<Vec<FillRecord>> {
        let rows = sqlx::query_as::<_, FillRow>(&format!(
            "{SELECT} WHERE order_id = ?1 ORDER BY timestamp ASC"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FillRecord::try_from).collect()
    }

    /// Paged listing for the API, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list(&self, limit: i64, skip: i64) -> Result<Vec<FillRecord>> {
        let rows = sqlx::query_as::<_, FillRow>(&format!(
            "{SELECT} ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FillRecord::try_from).collect()
    }
}
