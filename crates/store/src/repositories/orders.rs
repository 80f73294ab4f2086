use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use gridtrade_core::{OrderStatus, Side};
use sqlx::sqlite::SqlitePool;

use crate::models::{parse_decimal, OrderRecord};

/// Repository for the orders table.
///
/// Order rows are keyed by the exchange order id. A row is inserted in
/// `PENDING_PLACE` under its client tag before the exchange call and
/// promoted to the exchange id on acknowledgement, so a crash between the
/// two leaves a resumable row instead of an untracked order.
#[derive(Debug, Clone)]
pub struct OrderRepo {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    client_tag: Option<String>,
    market_id: String,
    side: String,
    price: String,
    size: String,
    status: String,
    lot_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Self {
            side: row.side.parse::<Side>()?,
            price: parse_decimal("price", &row.price)?,
            size: parse_decimal("size", &row.size)?,
            status: row.status.parse::<OrderStatus>()?,
            lot_id: row.lot_id,
            created_at: row.created_at,
            id: row.id,
            client_tag: row.client_tag,
            market_id: row.market_id,
        })
    }
}

const SELECT: &str = "SELECT id, client_tag, market_id, side, price, size, status, lot_id, \
                      created_at FROM orders";

impl OrderRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a `PENDING_PLACE` row keyed by its client tag (the exchange
    /// id is not known yet). Idempotent: re-inserting the same tag is a
    /// no-op, so a retried placement never duplicates the row.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn insert_pending(
        &self,
        client_tag: &str,
        market_id: &str,
        side: Side,
        price: rust_decimal::Decimal,
        size: rust_decimal::Decimal,
        lot_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO orders (id, client_tag, market_id, side, price, size, status, lot_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING_PLACE', ?7, ?8)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(client_tag)
        .bind(client_tag)
        .bind(market_id)
        .bind(side.as_str())
        .bind(price.to_string())
        .bind(size.to_string())
        .bind(lot_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-keys a pending row to the exchange-assigned id and opens it.
    ///
    /// # Errors
    /// Returns an error if no pending row carries the tag.
    pub async fn promote_to_open(&self, client_tag: &str, exchange_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE orders SET id = ?2, status = 'OPEN' WHERE client_tag = ?1 AND status = 'PENDING_PLACE'",
        )
        .bind(client_tag)
        .bind(exchange_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("no pending order for client tag {client_tag}");
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_status(&self, id: &str, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Revives a terminal row that never reached the exchange (its id is
    /// still the client tag) so the placement can be retried in place.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn reset_pending(
        &self,
        id: &str,
        price: rust_decimal::Decimal,
        size: rust_decimal::Decimal,
        lot_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET status = 'PENDING_PLACE', price = ?2, size = ?3, lot_id = ?4 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(price.to_string())
        .bind(size.to_string())
        .bind(lot_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Frees a terminal order's client tag so the tag can be reused for a
    /// replacement order (a canceled sell keeps its lot's stable tag).
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn release_tag(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE orders SET client_tag = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_lot(&self, id: &str, lot_id: i64) -> Result<()> {
        sqlx::query("UPDATE orders SET lot_id = ?2 WHERE id = ?1")
            .bind(id)
            .bind(lot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("{SELECT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OrderRecord::try_from).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_by_tag(&self, client_tag: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("{SELECT} WHERE client_tag = ?1"))
            .bind(client_tag)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OrderRecord::try_from).transpose()
    }

    /// All OPEN orders, optionally for one market.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn open_orders(&self, market_id: Option<&str>) -> Result<Vec<OrderRecord>> {
        let rows = match market_id {
            Some(market) => {
                sqlx::query_as::<_, OrderRow>(&format!(
                    "{SELECT} WHERE market_id = ?1 AND status = 'OPEN' ORDER BY created_at ASC"
                ))
                .bind(market)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OrderRow>(&format!(
                    "{SELECT} WHERE status = 'OPEN' ORDER BY created_at ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(OrderRecord::try_from).collect()
    }

    /// OPEN orders on one side of one market, prices descending.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn open_by_side(&self, market_id: &str, side: Side) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "{SELECT} WHERE market_id = ?1 AND side = ?2 AND status = 'OPEN' \
             ORDER BY CAST(price AS REAL) DESC"
        ))
        .bind(market_id)
        .bind(side.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OrderRecord::try_from).collect()
    }

    /// Rows stuck in `PENDING_PLACE` (crash or transient failure mid-placement).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn pending_place(&self, market_id: &str) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "{SELECT} WHERE market_id = ?1 AND status = 'PENDING_PLACE' ORDER BY created_at ASC"
        ))
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OrderRecord::try_from).collect()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_open(&self) -> Result<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM orders WHERE status = 'OPEN'")
                .fetch_one(&self.pool)
                .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Paged listing for the API.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list(
        &self,
        status: Option<OrderStatus>,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<OrderRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, OrderRow>(&format!(
                    "{SELECT} WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ))
                .bind(status.as_str())
                .bind(limit)
                .bind(skip)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OrderRow>(&format!(
                    "{SELECT} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ))
                .bind(limit)
                .bind(skip)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(OrderRecord::try_from).collect()
    }
}
