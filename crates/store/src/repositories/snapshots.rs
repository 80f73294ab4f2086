use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;

use crate::models::{parse_decimal, SnapshotRecord};

/// Repository for end-of-day PnL snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotRepo {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    date: String,
    realized_pnl: String,
    trade_count: i64,
    cumulative_pnl: String,
}

impl TryFrom<SnapshotRow> for SnapshotRecord {
    type Error = anyhow::Error;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        Ok(Self {
            realized_pnl: parse_decimal("realized_pnl", &row.realized_pnl)?,
            cumulative_pnl: parse_decimal("cumulative_pnl", &row.cumulative_pnl)?,
            date: row.date,
            trade_count: row.trade_count,
        })
    }
}

impl SnapshotRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Writes or refreshes the snapshot for one day (date as "YYYY-MM-DD").
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn upsert(
        &self,
        date: &str,
        realized_pnl: Decimal,
        trade_count: i64,
        cumulative_pnl: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO daily_snapshots (date, realized_pnl, trade_count, cumulative_pnl)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (date) DO UPDATE SET
                realized_pnl = excluded.realized_pnl,
                trade_count = excluded.trade_count,
                cumulative_pnl = excluded.cumulative_pnl
            ",
        )
        .bind(date)
        .bind(realized_pnl.to_string())
        .bind(trade_count)
        .bind(cumulative_pnl.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Snapshots from `since_date` (inclusive), ascending.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn range(&self, since_date: &str) -> Result<Vec<SnapshotRecord>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT date, realized_pnl, trade_count, cumulative_pnl FROM daily_snapshots \
             WHERE date >= ?1 ORDER BY date ASC",
        )
        .bind(since_date)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SnapshotRecord::try_from).collect()
    }
}
