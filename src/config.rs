use std::str::FromStr;

use chrono::Duration;

use crate::error::{AppError, Result};
use crate::types::EgressRoute;

/// Maximum characters of an error message kept in per-target log lines.
pub const LOG_MSG_MAX_CHARS: usize = 200;

/// Tunable thresholds for the consensus resolver and the deviation score.
///
/// Percentages are whole percents (3.0 = 3%). None of these have an empirical
/// derivation yet, which is why they are read from the environment instead of
/// being baked in.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusThresholds {
    /// Primary and verification prices within this relative difference agree.
    pub agreement_pct: f64,
    /// Chosen price within this distance of the window median earns a bonus.
    pub near_median_pct: f64,
    /// Chosen price beyond this distance of the window median is penalised.
    pub far_median_pct: f64,
    /// Chosen price beyond this distance of the previous period's median is penalised.
    pub prev_period_pct: f64,
    pub agreement_confidence: u8,
    pub divergent_confidence_cap: u8,
    pub verification_base: u8,
    pub verification_tier_step: u8,
    pub verification_headroom: u8,
    pub stale_confidence_cap: u8,
    pub score_base: i32,
    pub near_median_bonus: i32,
    pub far_median_penalty: i32,
    pub prev_period_penalty: i32,
}

impl Default for ConsensusThresholds {
    fn default() -> Self {
        Self {
            agreement_pct: 3.0,
            near_median_pct: 3.0,
            far_median_pct: 8.0,
            prev_period_pct: 10.0,
            agreement_confidence: 99,
            divergent_confidence_cap: 70,
            verification_base: 70,
            verification_tier_step: 15,
            verification_headroom: 20,
            stale_confidence_cap: 50,
            score_base: 50,
            near_median_bonus: 30,
            far_median_penalty: 15,
            prev_period_penalty: 20,
        }
    }
}

/// Time-window parameters shared by the aggregator, the fallback and the exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub width: Duration,
    /// How far back duplicate writer rows are considered for the current window.
    pub lookback: Duration,
    /// Oldest a last-known-good value may be and still be served.
    pub staleness_budget: Duration,
    /// Number of window floors in the rolling series (96 × 15 min = 24h).
    pub series_windows: u32,
    pub daily_days: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: Duration::minutes(15),
            lookback: Duration::minutes(120),
            staleness_budget: Duration::minutes(240),
            series_windows: 96,
            daily_days: 30,
        }
    }
}

/// Upper bound on any history the window settings may ask an export to load.
const MAX_HISTORY_DAYS: i64 = 3650;

impl WindowConfig {
    /// Span of history an export needs to load to evaluate every rule.
    pub fn history_span(&self) -> Duration {
        self.checked_history_span()
            .unwrap_or_else(|| Duration::days(MAX_HISTORY_DAYS))
    }

    fn checked_history_span(&self) -> Option<Duration> {
        let series = self.width.checked_mul(i32::try_from(self.series_windows).ok()?)?;
        let widest = series.max(self.lookback).max(self.staleness_budget);
        widest.checked_add(&self.width.checked_mul(2)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width <= Duration::zero() {
            return Err(AppError::Config("WINDOW_MINUTES must be positive".to_string()));
        }
        if self.lookback < Duration::zero() || self.staleness_budget < Duration::zero() {
            return Err(AppError::Config(
                "LOOKBACK_MINUTES and STALENESS_BUDGET_MINUTES must not be negative".to_string(),
            ));
        }
        let limit = Duration::days(MAX_HISTORY_DAYS);
        match self.checked_history_span() {
            Some(span) if span <= limit => {}
            _ => {
                return Err(AppError::Config(format!(
                    "window settings span more than {MAX_HISTORY_DAYS} days of history"
                )))
            }
        }
        if i64::from(self.daily_days) > MAX_HISTORY_DAYS {
            return Err(AppError::Config(format!(
                "DAILY_DAYS must not exceed {MAX_HISTORY_DAYS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_step_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub render_service_url: Option<String>,
    pub verify_service_url: Option<String>,
    /// Alternate egress routes, walked after the direct route.
    pub egress_proxies: Vec<EgressRoute>,
}

impl FetchConfig {
    /// Looks up an egress route by name; `direct` is always available.
    pub fn route(&self, name: &str) -> Result<EgressRoute> {
        if name == EgressRoute::Direct.name() {
            return Ok(EgressRoute::Direct);
        }
        self.egress_proxies
            .iter()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("unknown egress route {name:?}")))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub catalog_path: String,
    pub output_dir: String,
    pub agent_id: String,
    pub api_port: u16,
    pub windows: WindowConfig,
    pub fetch: FetchConfig,
    pub thresholds: ConsensusThresholds,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let thresholds = ConsensusThresholds {
            agreement_pct: env_or("AGREEMENT_PCT", 3.0)?,
            near_median_pct: env_or("NEAR_MEDIAN_PCT", 3.0)?,
            far_median_pct: env_or("FAR_MEDIAN_PCT", 8.0)?,
            prev_period_pct: env_or("PREV_PERIOD_PCT", 10.0)?,
            divergent_confidence_cap: env_or("DIVERGENT_CONFIDENCE_CAP", 70)?,
            stale_confidence_cap: env_or("STALE_CONFIDENCE_CAP", 50)?,
            ..ConsensusThresholds::default()
        };

        let windows = WindowConfig {
            width: minutes("WINDOW_MINUTES", env_or("WINDOW_MINUTES", 15)?)?,
            lookback: minutes("LOOKBACK_MINUTES", env_or("LOOKBACK_MINUTES", 120)?)?,
            staleness_budget: minutes(
                "STALENESS_BUDGET_MINUTES",
                env_or("STALENESS_BUDGET_MINUTES", 240)?,
            )?,
            series_windows: env_or("SERIES_WINDOWS", 96)?,
            daily_days: env_or("DAILY_DAYS", 30)?,
        };
        windows.validate()?;

        let fetch = FetchConfig {
            timeout_secs: env_or("FETCH_TIMEOUT_SECS", 30)?,
            retries: env_or("FETCH_RETRIES", 2)?,
            backoff_step_ms: env_or("BACKOFF_STEP_MS", 1500)?,
            jitter_min_ms: env_or("JITTER_MIN_MS", 2000)?,
            jitter_max_ms: env_or("JITTER_MAX_MS", 8000)?,
            render_service_url: optional_env("RENDER_SERVICE_URL"),
            verify_service_url: optional_env("VERIFY_SERVICE_URL"),
            egress_proxies: parse_proxies(&std::env::var("EGRESS_PROXIES").unwrap_or_default())?,
        };
        if fetch.jitter_min_ms > fetch.jitter_max_ms {
            return Err(AppError::Config(
                "JITTER_MIN_MS must not exceed JITTER_MAX_MS".to_string(),
            ));
        }

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "prices.db".to_string()),
            catalog_path: std::env::var("CATALOG_PATH")
                .unwrap_or_else(|_| "catalog.json".to_string()),
            output_dir: std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "data".to_string()),
            agent_id: std::env::var("AGENT_ID").unwrap_or_else(|_| "local".to_string()),
            api_port: env_or("API_PORT", 3000)?,
            windows,
            fetch,
            thresholds,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        _ => Ok(default),
    }
}

fn minutes(key: &str, n: i64) -> Result<Duration> {
    Duration::try_minutes(n)
        .ok_or_else(|| AppError::Config(format!("{key} is out of range: {n}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parses `name=url,name=url` into proxy routes, keeping the given order.
pub fn parse_proxies(raw: &str) -> Result<Vec<EgressRoute>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                Ok(EgressRoute::Proxy {
                    name: name.trim().to_string(),
                    url: url.trim().to_string(),
                })
            }
            _ => Err(AppError::Config(format!(
                "EGRESS_PROXIES entry must be name=url, got {entry:?}"
            ))),
        })
        .collect()
}
