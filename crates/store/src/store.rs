use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::repositories::{
    AuditRepo, ConfigRepo, FillRepo, LotRepo, MarketRepo, OrderRepo, SnapshotRepo, StateRepo,
};

/// Handle to the bot's single logical database.
///
/// Cheap to clone; every clone shares the underlying pool. Repositories
/// borrow the pool for the duration of one statement or transaction.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the database at `url` and runs migrations.
    ///
    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests and ephemeral runs.
    ///
    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn in_memory() -> Result<Self> {
        // A single connection so the in-memory database is shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn markets(&self) -> MarketRepo {
        MarketRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn orders(&self) -> OrderRepo {
        OrderRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn fills(&self) -> FillRepo {
        FillRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn lots(&self) -> LotRepo {
        LotRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn state(&self) -> StateRepo {
        StateRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn audit(&self) -> AuditRepo {
        AuditRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn config(&self) -> ConfigRepo {
        ConfigRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn snapshots(&self) -> SnapshotRepo {
        SnapshotRepo::new(self.pool.clone())
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
