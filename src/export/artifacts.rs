//! JSON shapes polled by the presentation layer. Field names are part of the
//! compatibility surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::SeriesPoint;
use crate::resolver::{PricePoint, Resolution, StockReason};
use crate::types::{round2, Method};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorEntry {
    pub price: Option<f64>,
    pub confidence: Option<u8>,
    pub source: Method,
    #[serde(rename = "inStock")]
    pub in_stock: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_reason: Option<StockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_in_stock: Option<PricePoint>,
}

impl From<&Resolution> for VendorEntry {
    fn from(r: &Resolution) -> Self {
        Self {
            price: r.price.map(round2),
            confidence: r.confidence,
            source: r.method,
            in_stock: r.in_stock,
            stale: r.stale,
            stale_since: r.stale_since,
            stock_reason: (r.stock_reason != StockReason::InStock).then_some(r.stock_reason),
            last_in_stock: r.last_in_stock.map(|p| PricePoint { price: round2(p.price), at: p.at }),
        }
    }
}

/// Per-item current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoinLatest {
    pub window_start: DateTime<Utc>,
    pub median_price: Option<f64>,
    pub lowest_price: Option<f64>,
    pub vendors: BTreeMap<String, VendorEntry>,
    pub windows_24h: Vec<SeriesPoint>,
}

/// Global index of exported items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Index {
    pub generated_at: DateTime<Utc>,
    pub latest_window: Option<DateTime<Utc>>,
    pub coin_count: usize,
    pub coins: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn vendor_entry_uses_wire_names_and_omits_fresh_flags() {
        let r = Resolution {
            price: Some(35.004),
            confidence: Some(99),
            method: Method::Primary,
            in_stock: true,
            stock_reason: StockReason::InStock,
            stale: false,
            stale_since: None,
            last_in_stock: None,
        };
        let json = serde_json::to_value(VendorEntry::from(&r)).unwrap();
        assert_eq!(json["price"], 35.0);
        assert_eq!(json["source"], "primary");
        assert_eq!(json["inStock"], true);
        assert!(json.get("stale").is_none());
        assert!(json.get("stale_since").is_none());
        assert!(json.get("stock_reason").is_none());
    }

    #[test]
    fn stale_entry_carries_since() {
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let r = Resolution {
            price: Some(35.0),
            confidence: Some(50),
            method: Method::LastKnown,
            in_stock: true,
            stock_reason: StockReason::InStock,
            stale: true,
            stale_since: Some(since),
            last_in_stock: None,
        };
        let json = serde_json::to_value(VendorEntry::from(&r)).unwrap();
        assert_eq!(json["stale"], true);
        assert_eq!(json["source"], "last-known");
        assert_eq!(json["stale_since"], "2026-03-01T10:00:00Z");
    }
}
