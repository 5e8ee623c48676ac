/// Database row types matching `migrations/0001_init.sql`.
/// Timestamps are epoch milliseconds; flags are 0/1 integers.
use chrono::{DateTime, Utc};

use crate::types::{Method, Observation, RunAudit, RunStatus, Tier};

#[derive(Debug, sqlx::FromRow)]
pub struct ObservationRow {
    pub id: i64,
    pub scraped_at: i64,
    pub window_start: i64,
    pub coin_id: String,
    pub vendor_id: String,
    pub agent_id: String,
    pub price: Option<f64>,
    pub method: String,
    pub confidence: Option<i64>,
    pub failed: i64,
    pub in_stock: i64,
    pub self_confidence: Option<String>,
    pub agrees: Option<i64>,
}

impl ObservationRow {
    /// Rows written by a newer agent with an unknown method label are skipped.
    pub fn into_observation(self) -> Option<Observation> {
        let method = Method::parse(&self.method)?;
        Some(Observation {
            id: Some(self.id),
            scraped_at: from_ms(self.scraped_at)?,
            window_start: from_ms(self.window_start)?,
            coin_id: self.coin_id,
            vendor_id: self.vendor_id,
            agent_id: self.agent_id,
            price: self.price,
            method,
            confidence: self.confidence.map(|c| c.clamp(0, 100) as u8),
            failed: self.failed != 0,
            in_stock: self.in_stock != 0,
            self_confidence: self.self_confidence.as_deref().and_then(Tier::parse),
            agrees: self.agrees.map(|a| a != 0),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RunAuditRow {
    pub run_id: String,
    pub agent_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: String,
    pub total: i64,
    pub captured: i64,
    pub failed: i64,
}

impl RunAuditRow {
    pub fn into_audit(self) -> Option<RunAudit> {
        Some(RunAudit {
            run_id: self.run_id,
            agent_id: self.agent_id,
            started_at: from_ms(self.started_at)?,
            finished_at: self.finished_at.and_then(from_ms),
            status: RunStatus::parse(&self.status),
            total: self.total.max(0) as u32,
            captured: self.captured.max(0) as u32,
            failed: self.failed.max(0) as u32,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RetryRow {
    pub coin_id: String,
    pub vendor_id: String,
    pub queued_at: i64,
}

pub fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
