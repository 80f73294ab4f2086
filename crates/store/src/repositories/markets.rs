use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use gridtrade_core::Product;
use sqlx::sqlite::SqlitePool;

use crate::models::{parse_decimal, parse_json_opt, MarketRecord};

/// Repository for the markets table.
#[derive(Debug, Clone)]
pub struct MarketRepo {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MarketRow {
    id: String,
    enabled: bool,
    is_favorite: bool,
    market_rank: i64,
    volume_24h: String,
    settings: Option<String>,
    last_updated: DateTime<Utc>,
}

impl TryFrom<MarketRow> for MarketRecord {
    type Error = anyhow::Error;

    fn try_from(row: MarketRow) -> Result<Self> {
        Ok(Self {
            enabled: row.enabled,
            is_favorite: row.is_favorite,
            market_rank: row.market_rank,
            volume_24h: parse_decimal("volume_24h", &row.volume_24h)?,
            settings: parse_json_opt(row.settings.as_deref())?,
            last_updated: row.last_updated,
            id: row.id,
        })
    }
}

const SELECT: &str = "SELECT id, enabled, is_favorite, market_rank, volume_24h, settings, \
                      last_updated FROM markets";

impl MarketRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or refreshes a market row from exchange product metadata.
    /// Never touches `enabled` or `is_favorite` on existing rows.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn upsert_product(&self, product: &Product, rank: i64) -> Result<()> {
        let volume = product
            .volume_24h
            .unwrap_or_default()
            .to_string();
        sqlx::query(
            r"
            INSERT INTO markets (id, enabled, is_favorite, market_rank, volume_24h, last_updated)
            VALUES (?1, 0, 0, ?2, ?3, ?4)
            ON CONFLICT (id) DO UPDATE SET
                market_rank = excluded.market_rank,
                volume_24h = excluded.volume_24h,
                last_updated = excluded.last_updated
            ",
        )
        .bind(&product.id)
        .bind(rank)
        .bind(volume)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails or a row is malformed.
    pub async fn list(&self, favorites_only: bool) -> Result<Vec<MarketRecord>> {
        let sql = if favorites_only {
            format!("{SELECT} WHERE is_favorite = 1 ORDER BY market_rank ASC, id ASC")
        } else {
            format!("{SELECT} ORDER BY market_rank ASC, id ASC")
        };
        let rows = sqlx::query_as::<_, MarketRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MarketRecord::try_from).collect()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<MarketRecord>> {
        let row = sqlx::query_as::<_, MarketRow>(&format!("{SELECT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MarketRecord::try_from).transpose()
    }

    /// The single enabled market, if any.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn active(&self) -> Result<Option<MarketRecord>> {
        let row = sqlx::query_as::<_, MarketRow>(&format!("{SELECT} WHERE enabled = 1"))
            .fetch_optional(&self.pool)
            .await?;
        row.map(MarketRecord::try_from).transpose()
    }

    /// Enables `id` and disables every other market in one transaction.
    /// The partial unique index on `enabled` makes a second enabled row
    /// impossible even under concurrent writers.
    ///
    /// # Errors
    /// Returns an error if the market does not exist or the write fails.
    pub async fn set_enabled_exclusive(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE markets SET enabled = 0 WHERE enabled = 1")
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query("UPDATE markets SET enabled = 1, last_updated = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            bail!("market not found: {id}");
        }

        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn disable(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE markets SET enabled = 0, last_updated = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn disable_all(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE markets SET enabled = 0 WHERE enabled = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Toggles the favorite flag and returns the new value.
    ///
    /// # Errors
    /// Returns an error if the market does not exist or the write fails.
    pub async fn toggle_favorite(&self, id: &str) -> Result<bool> {
        let Some(market) = self.get(id).await? else {
            bail!("market not found: {id}");
        };
        let flag = !market.is_favorite;
        sqlx::query("UPDATE markets SET is_favorite = ?2, last_updated = ?3 WHERE id = ?1")
            .bind(id)
            .bind(flag)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(flag)
    }

    /// Partial update used by `PATCH /api/markets/{id}`.
    ///
    /// # Errors
    /// Returns an error if the market does not exist or the write fails.
    pub async fn update_partial(
        &self,
        id: &str,
        market_rank: Option<i64>,
        settings: Option<serde_json::Value>,
    ) -> Result<MarketRecord> {
        if let Some(rank) = market_rank {
            sqlx::query("UPDATE markets SET market_rank = ?2, last_updated = ?3 WHERE id = ?1")
                .bind(id)
                .bind(rank)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        }
        if let Some(settings) = settings {
            sqlx::query("UPDATE markets SET settings = ?2, last_updated = ?3 WHERE id = ?1")
                .bind(id)
                .bind(settings.to_string())
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        }
        match self.get(id).await? {
            Some(market) => Ok(market),
            None => bail!("market not found: {id}"),
        }
    }
}
