use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;

use crate::models::{parse_decimal, parse_decimal_opt, LotRecord, LotStatus};

/// Repository for the lots table.
#[derive(Debug, Clone)]
pub struct LotRepo {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct LotRow {
    id: i64,
    market_id: String,
    buy_order_id: String,
    buy_price: String,
    buy_size: String,
    buy_fee: String,
    buy_time: DateTime<Utc>,
    sell_order_id: Option<String>,
    sell_price: Option<String>,
    sell_time: Option<DateTime<Utc>>,
    sold_size: String,
    realized_pnl: String,
    status: String,
}

impl TryFrom<LotRow> for LotRecord {
    type Error = anyhow::Error;

    fn try_from(row: LotRow) -> Result<Self> {
        Ok(Self {
            buy_price: parse_decimal("buy_price", &row.buy_price)?,
            buy_size: parse_decimal("buy_size", &row.buy_size)?,
            buy_fee: parse_decimal("buy_fee", &row.buy_fee)?,
            sell_price: parse_decimal_opt("sell_price", row.sell_price.as_deref())?,
            sold_size: parse_decimal("sold_size", &row.sold_size)?,
            realized_pnl: parse_decimal("realized_pnl", &row.realized_pnl)?,
            status: row.status.parse::<LotStatus>()?,
            id: row.id,
            market_id: row.market_id,
            buy_order_id: row.buy_order_id,
            buy_time: row.buy_time,
            sell_order_id: row.sell_order_id,
            sell_time: row.sell_time,
        })
    }
}

const SELECT: &str = "SELECT id, market_id, buy_order_id, buy_price, buy_size, buy_fee, buy_time, \
                      sell_order_id, sell_price, sell_time, sold_size, realized_pnl, status FROM lots";

impl LotRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a lot for a buy fill and returns its id. Idempotent per buy
    /// order: if a lot already exists for `buy_order_id`, its id is returned.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn create(
        &self,
        market_id: &str,
        buy_order_id: &str,
        buy_price: Decimal,
        buy_size: Decimal,
        buy_fee: Decimal,
        buy_time: DateTime<Utc>,
    ) -> Result<i64> {
        if let Some(existing) = self.by_buy_order(buy_order_id).await? {
            return Ok(existing.id);
        }

        let row: (i64,) = sqlx::query_as(
            r"
            INSERT INTO lots (market_id, buy_order_id, buy_price, buy_size, buy_fee, buy_time, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'OPEN')
            RETURNING id
            ",
        )
        .bind(market_id)
        .bind(buy_order_id)
        .bind(buy_price.to_string())
        .bind(buy_size.to_string())
        .bind(buy_fee.to_string())
        .bind(buy_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get(&self, id: i64) -> Result<Option<LotRecord>> {
        let row = sqlx::query_as::<_, LotRow>(&format!("{SELECT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LotRecord::try_from).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn by_buy_order(&self, buy_order_id: &str) -> Result<Option<LotRecord>> {
        let row = sqlx::query_as::<_, LotRow>(&format!("{SELECT} WHERE buy_order_id = ?1"))
            .bind(buy_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LotRecord::try_from).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn by_sell_order(&self, sell_order_id: &str) -> Result<Option<LotRecord>> {
        let row = sqlx::query_as::<_, LotRow>(&format!("{SELECT} WHERE sell_order_id = ?1"))
            .bind(sell_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LotRecord::try_from).transpose()
    }

    /// Marks the paired sell as resting on the exchange.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_sell_placed(
        &self,
        id: i64,
        sell_order_id: &str,
        sell_price: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE lots SET sell_order_id = ?2, sell_price = ?3, status = 'SELL_PLACED' WHERE id = ?1",
        )
        .bind(id)
        .bind(sell_order_id)
        .bind(sell_price.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Detaches a canceled sell so the lot is retried on a later tick.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn clear_sell(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE lots SET sell_order_id = NULL, sell_price = NULL, status = 'OPEN' \
             WHERE id = ?1 AND status = 'SELL_PLACED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies a (possibly partial) sell fill: accrues sold size and
    /// realized PnL, and closes the lot when fully sold.
    ///
    /// # Errors
    /// Returns an error if the lot does not exist or the write fails.
    pub async fn apply_sell_fill(
        &self,
        id: i64,
        fill_size: Decimal,
        pnl: Decimal,
        sell_time: DateTime<Utc>,
    ) -> Result<LotRecord> {
        let Some(lot) = self.get(id).await? else {
            bail!("lot not found: {id}");
        };

        let sold = lot.sold_size + fill_size;
        let realized = lot.realized_pnl + pnl;
        let closed = sold >= lot.buy_size;
        let status = if closed {
            LotStatus::Closed
        } else {
            LotStatus::SellPlaced
        };

        sqlx::query(
            "UPDATE lots SET sold_size = ?2, realized_pnl = ?3, status = ?4, sell_time = ?5 WHERE id = ?1",
        )
        .bind(id)
        .bind(sold.to_string())
        .bind(realized.to_string())
        .bind(status.as_str())
        .bind(sell_time)
        .execute(&self.pool)
        .await?;

        match self.get(id).await? {
            Some(updated) => Ok(updated),
            None => bail!("lot vanished during update: {id}"),
        }
    }

    /// Lots that still need a sell order placed (buy filled, no sell resting).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn needing_sell(&self, market_id: &str) -> Result<Vec<LotRecord>> {
        let rows = sqlx::query_as::<_, LotRow>(&format!(
            "{SELECT} WHERE market_id = ?1 AND status = 'OPEN' ORDER BY id ASC"
        ))
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LotRecord::try_from).collect()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn open_lots(&self, market_id: Option<&str>) -> Result<Vec<LotRecord>> {
        let rows = match market_id {
            Some(market) => {
                sqlx::query_as::<_, LotRow>(&format!(
                    "{SELECT} WHERE market_id = ?1 AND status != 'CLOSED' ORDER BY id ASC"
                ))
                .bind(market)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, LotRow>(&format!(
                    "{SELECT} WHERE status != 'CLOSED' ORDER BY id ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(LotRecord::try_from).collect()
    }

    /// Quote capital currently tied up in open lots.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn deployed_capital(&self) -> Result<Decimal> {
        let lots = self.open_lots(None).await?;
        Ok(lots.iter().map(LotRecord::deployed).sum())
    }

    /// Lifetime realized PnL across all lots.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn realized_pnl_total(&self) -> Result<Decimal> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT realized_pnl FROM lots")
            .fetch_all(&self.pool)
            .await?;
        let mut total = Decimal::ZERO;
        for (raw,) in rows {
            total += parse_decimal("realized_pnl", &raw)?;
        }
        Ok(total)
    }

    /// Realized PnL from lots closed at or after `since`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn realized_pnl_since(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT realized_pnl FROM lots WHERE status = 'CLOSED' AND sell_time >= ?1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let mut total = Decimal::ZERO;
        for (raw,) in rows {
            total += parse_decimal("realized_pnl", &raw)?;
        }
        Ok(total)
    }

    /// Closed-lot PnL grouped by close day (UTC), ascending, for the PnL
    /// history fallback when no snapshots exist.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn realized_by_day(&self, since: DateTime<Utc>) -> Result<Vec<(String, Decimal)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r"
            SELECT date(sell_time) AS day, realized_pnl FROM lots
            WHERE status = 'CLOSED' AND sell_time >= ?1
            ORDER BY day ASC
            ",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut days: Vec<(String, Decimal)> = Vec::new();
        for (day, raw) in rows {
            let pnl = parse_decimal("realized_pnl", &raw)?;
            match days.last_mut() {
                Some((last_day, total)) if *last_day == day => *total += pnl,
                _ => days.push((day, pnl)),
            }
        }
        Ok(days)
    }

    /// Count of lots closed at or after `since`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn closed_count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM lots WHERE status = 'CLOSED' AND sell_time >= ?1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Paged listing for the API, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list(&self, limit: i64, skip: i64) -> Result<Vec<LotRecord>> {
        let rows = sqlx::query_as::<_, LotRow>(&format!(
            "{SELECT} ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LotRecord::try_from).collect()
    }
}
