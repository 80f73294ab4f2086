use anyhow::Result;
use gridtrade_core::GridConfig;
use sqlx::sqlite::SqlitePool;

const GRID_KEY: &str = "grid";

/// Repository for the config table.
///
/// The runtime trading configuration is one JSON row replaced atomically;
/// a partially-applied config can never be observed.
#[derive(Debug, Clone)]
pub struct ConfigRepo {
    pool: SqlitePool,
}

impl ConfigRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Loads the stored grid configuration, if one has been saved.
    ///
    /// # Errors
    /// Returns an error if the query fails or the stored JSON is malformed.
    pub async fn load(&self) -> Result<Option<GridConfig>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(GRID_KEY)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(raw,)| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    /// Loads the stored configuration or persists and returns the default.
    ///
    /// # Errors
    /// Returns an error if the read or write fails.
    pub async fn load_or_init(&self) -> Result<GridConfig> {
        if let Some(config) = self.load().await? {
            return Ok(config);
        }
        let config = GridConfig::default();
        self.save(&config).await?;
        Ok(config)
    }

    /// Validates and persists a full replacement configuration.
    ///
    /// # Errors
    /// Returns an error if validation or the write fails.
    pub async fn save(&self, config: &GridConfig) -> Result<()> {
        config.validate()?;
        sqlx::query(
            r"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(GRID_KEY)
        .bind(serde_json::to_string(config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
