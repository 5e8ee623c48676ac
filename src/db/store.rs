use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{to_ms, ObservationRow, RetryRow, RunAuditRow};
use crate::error::Result;
use crate::types::{Observation, RunAudit, RunStatus};

const OBSERVATION_COLUMNS: &str = "id, scraped_at, window_start, coin_id, vendor_id, agent_id, \
     price, method, confidence, failed, in_stock, self_confidence, agrees";

/// Filter for [`Store::most_recent_matching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Any primary-side row, successful or not. Verification rows are excluded.
    Acquired,
    /// Priced and in stock: the only rows eligible as last-known-good.
    InStockPriced,
}

impl Match {
    fn clause(self) -> &'static str {
        match self {
            Match::Acquired => "AND method != 'verification'",
            Match::InStockPriced => "AND method != 'verification' AND price IS NOT NULL AND in_stock = 1",
        }
    }
}

/// SQLite-backed observation store shared by independent agents.
///
/// Appends never coordinate; the only contested write is the confidence
/// backfill, which is idempotent.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Database ready at {db_path}");
        Ok(store)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    pub async fn insert_observation(&self, o: &Observation) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO observations (
                scraped_at, window_start, coin_id, vendor_id, agent_id,
                price, method, confidence, failed, in_stock, self_confidence, agrees
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_ms(o.scraped_at))
        .bind(to_ms(o.window_start))
        .bind(&o.coin_id)
        .bind(&o.vendor_id)
        .bind(&o.agent_id)
        .bind(o.price.map(crate::types::round2))
        .bind(o.method.as_str())
        .bind(o.confidence.map(i64::from))
        .bind(i64::from(o.failed))
        .bind(i64::from(o.in_stock))
        .bind(o.self_confidence.map(|t| t.as_str()))
        .bind(o.agrees.map(i64::from))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Rows for a coin (optionally one vendor) with `from <= scraped_at <= to`.
    pub async fn observations_between(
        &self,
        coin_id: &str,
        vendor_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations \
             WHERE coin_id = ? AND (? IS NULL OR vendor_id = ?) \
               AND scraped_at >= ? AND scraped_at <= ? \
             ORDER BY scraped_at ASC, id ASC"
        );
        let rows: Vec<ObservationRow> = sqlx::query_as(&sql)
            .bind(coin_id)
            .bind(vendor_id)
            .bind(vendor_id)
            .bind(to_ms(from))
            .bind(to_ms(to))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().filter_map(ObservationRow::into_observation).collect())
    }

    /// Latest row for (coin, vendor) at or before `before` that satisfies `filter`.
    pub async fn most_recent_matching(
        &self,
        coin_id: &str,
        vendor_id: &str,
        before: DateTime<Utc>,
        filter: Match,
    ) -> Result<Option<Observation>> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations \
             WHERE coin_id = ? AND vendor_id = ? AND scraped_at <= ? {} \
             ORDER BY scraped_at DESC, id DESC LIMIT 1",
            filter.clause()
        );
        let row: Option<ObservationRow> = sqlx::query_as(&sql)
            .bind(coin_id)
            .bind(vendor_id)
            .bind(to_ms(before))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(ObservationRow::into_observation))
    }

    /// Sets confidence on the priced, non-failed primary-side rows of one
    /// (coin, vendor, window) that have none yet. Applying it again is a no-op.
    pub async fn backfill_confidence(
        &self,
        coin_id: &str,
        vendor_id: &str,
        window_start: DateTime<Utc>,
        confidence: u8,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE observations SET confidence = ?
            WHERE coin_id = ? AND vendor_id = ? AND window_start = ?
              AND method != 'verification' AND confidence IS NULL
              AND price IS NOT NULL AND failed = 0
            "#,
        )
        .bind(i64::from(confidence.min(100)))
        .bind(coin_id)
        .bind(vendor_id)
        .bind(to_ms(window_start))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Run audits
    // -----------------------------------------------------------------------

    /// Marks runs this agent left in `running` (crashed cycles) as `error`.
    pub async fn fail_stale_runs(&self, agent_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE run_audits SET status = 'error', finished_at = COALESCE(finished_at, ?)
            WHERE agent_id = ? AND status = 'running'
            "#,
        )
        .bind(to_ms(now))
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn start_run(&self, run: &RunAudit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_audits (run_id, agent_id, started_at, status, total, captured, failed)
            VALUES (?, ?, ?, ?, ?, 0, 0)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.agent_id)
        .bind(to_ms(run.started_at))
        .bind(RunStatus::Running.as_str())
        .bind(i64::from(run.total))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn finish_run(&self, run: &RunAudit) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_audits
            SET finished_at = ?, status = ?, total = ?, captured = ?, failed = ?
            WHERE run_id = ?
            "#,
        )
        .bind(run.finished_at.map(to_ms))
        .bind(run.status.as_str())
        .bind(i64::from(run.total))
        .bind(i64::from(run.captured))
        .bind(i64::from(run.failed))
        .bind(&run.run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunAudit>> {
        let rows: Vec<RunAuditRow> = sqlx::query_as(
            r#"
            SELECT run_id, agent_id, started_at, finished_at, status, total, captured, failed
            FROM run_audits
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(RunAuditRow::into_audit).collect())
    }

    // -----------------------------------------------------------------------
    // Deferred retry queue
    // -----------------------------------------------------------------------

    pub async fn enqueue_retry(
        &self,
        coin_id: &str,
        vendor_id: &str,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_queue (coin_id, vendor_id, agent_id, queued_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(coin_id, vendor_id, agent_id) DO UPDATE SET queued_at = excluded.queued_at
            "#,
        )
        .bind(coin_id)
        .bind(vendor_id)
        .bind(agent_id)
        .bind(to_ms(at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn pending_retries(&self, agent_id: &str) -> Result<Vec<RetryRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT coin_id, vendor_id, queued_at FROM retry_queue
            WHERE agent_id = ?
            ORDER BY queued_at ASC
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn clear_retry(&self, coin_id: &str, vendor_id: &str, agent_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM retry_queue WHERE coin_id = ? AND vendor_id = ? AND agent_id = ?")
            .bind(coin_id)
            .bind(vendor_id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
