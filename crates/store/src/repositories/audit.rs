use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::models::{parse_json_opt, AuditRecord};

/// Repository for the audit_log table. Append-only.
#[derive(Debug, Clone)]
pub struct AuditRepo {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: DateTime<Utc>,
    actor: String,
    action: String,
    before: Option<String>,
    after: Option<String>,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = anyhow::Error;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(Self {
            before: parse_json_opt(row.before.as_deref())?,
            after: parse_json_opt(row.after.as_deref())?,
            id: row.id,
            timestamp: row.timestamp,
            actor: row.actor,
            action: row.action,
        })
    }
}

impl AuditRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn append(
        &self,
        actor: &str,
        action: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO audit_log (timestamp, actor, action, before, after)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(Utc::now())
        .bind(actor)
        .bind(action)
        .bind(before.map(|v| v.to_string()))
        .bind(after.map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest entries first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, timestamp, actor, action, before, after FROM audit_log \
             ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AuditRecord::try_from).collect()
    }
}
