/// Persisted run history
///
/// Append-only `runs` table holding the serialized run record of every
/// service-triggered run, indexed by workflow and start time.

use crate::runtime::trace::{RunRecord, RunSummary};
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};
use uuid::Uuid;

/// SQLite-backed run history
#[derive(Debug, Clone)]
pub struct RunHistoryStore {
    pool: SqlitePool,
}

impl RunHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                started_at TEXT NOT NULL,
                record JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_workflow_started
            ON runs(workflow_id, started_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a finished run
    pub async fn append(&self, record: &RunRecord) -> Result<()> {
        let record_json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, workflow_id, status, mode, started_at, record)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_id)
        .bind(record.status.to_string())
        .bind(record.mode.to_string())
        .bind(record.started_at.to_rfc3339())
        .bind(&record_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Stored run {} of workflow {}", record.run_id, record.workflow_id);
        Ok(())
    }

    /// Most recent runs of a workflow first
    pub async fn list_for_workflow(&self, workflow_id: &str, limit: u32) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            "SELECT record FROM runs WHERE workflow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let record_json: String = row.get("record");
            let record: RunRecord = serde_json::from_str(&record_json)?;
            summaries.push(record.summary());
        }
        Ok(summaries)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT record FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record_json: String = row.get("record");
                Ok(Some(serde_json::from_str(&record_json)?))
            }
            None => Ok(None),
        }
    }
}
