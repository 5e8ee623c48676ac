use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// Rounds a USD price to cents. Applied at every write boundary.
pub fn round2(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Acquisition method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    Primary,
    RenderedFallback,
    Retry,
    Verification,
    LastKnown,
    GapFill,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Primary => "primary",
            Method::RenderedFallback => "rendered-fallback",
            Method::Retry => "retry",
            Method::Verification => "verification",
            Method::LastKnown => "last-known",
            Method::GapFill => "gap-fill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Method::Primary),
            "rendered-fallback" => Some(Method::RenderedFallback),
            "retry" => Some(Method::Retry),
            "verification" => Some(Method::Verification),
            "last-known" => Some(Method::LastKnown),
            "gap-fill" => Some(Method::GapFill),
            _ => None,
        }
    }

    /// Verification rows are fused by the resolver, never merged with primary-side rows.
    pub fn is_verification(self) -> bool {
        self == Method::Verification
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported certainty of the visual verification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Some(Tier::High),
            "medium" => Some(Tier::Medium),
            "low" => Some(Tier::Low),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One immutable (coin, vendor) price record. Only `confidence` may be
/// backfilled later, once.
///
/// `failed` is derived at construction: a row is failed exactly when no price
/// was found and the vendor was not confirmed out of stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: Option<i64>,
    pub scraped_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub coin_id: String,
    pub vendor_id: String,
    pub agent_id: String,
    pub price: Option<f64>,
    pub method: Method,
    pub confidence: Option<u8>,
    pub failed: bool,
    pub in_stock: bool,
    /// Only set on verification rows.
    pub self_confidence: Option<Tier>,
    /// Only set on verification rows.
    pub agrees: Option<bool>,
}

impl Observation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coin_id: &str,
        vendor_id: &str,
        agent_id: &str,
        scraped_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        method: Method,
        price: Option<f64>,
        in_stock: bool,
    ) -> Self {
        let price = price.map(round2);
        Self {
            id: None,
            scraped_at,
            window_start,
            coin_id: coin_id.to_string(),
            vendor_id: vendor_id.to_string(),
            agent_id: agent_id.to_string(),
            price,
            method,
            confidence: None,
            failed: price.is_none() && in_stock,
            in_stock,
            self_confidence: None,
            agrees: None,
        }
    }

    pub fn with_verification_meta(mut self, tier: Option<Tier>, agrees: Option<bool>) -> Self {
        self.self_confidence = tier;
        self.agrees = agrees;
        self
    }

    /// In stock with a usable price.
    pub fn is_priced_in_stock(&self) -> bool {
        self.in_stock && self.price.is_some()
    }

    /// Explicit out-of-stock signal.
    pub fn is_confirmed_unavailable(&self) -> bool {
        !self.in_stock
    }
}

// ---------------------------------------------------------------------------
// Run audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "ok" => RunStatus::Ok,
            _ => RunStatus::Error,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAudit {
    pub run_id: String,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total: u32,
    pub captured: u32,
    pub failed: u32,
}

// ---------------------------------------------------------------------------
// Acquisition targets
// ---------------------------------------------------------------------------

/// Network path an extraction attempt is sent through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressRoute {
    Direct,
    Proxy { name: String, url: String },
}

impl EgressRoute {
    pub fn name(&self) -> &str {
        match self {
            EgressRoute::Direct => "direct",
            EgressRoute::Proxy { name, .. } => name,
        }
    }

    pub fn proxy_url(&self) -> Option<&str> {
        match self {
            EgressRoute::Direct => None,
            EgressRoute::Proxy { url, .. } => Some(url),
        }
    }
}

/// One (coin, vendor) listing to acquire, with its plausible price range.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub coin_id: String,
    pub vendor_id: String,
    pub url: String,
    pub min_price: f64,
    pub max_price: f64,
}

impl Target {
    /// Accessory prices and unrelated listings fall outside the weight-scaled range.
    pub fn is_plausible(&self, price: f64) -> bool {
        price.is_finite() && price >= self.min_price && price <= self.max_price
    }

    pub fn key(&self) -> (String, String) {
        (self.coin_id.clone(), self.vendor_id.clone())
    }
}
