use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::aggregator::window::{in_stock_prices, merge_by_recency, rows_in, WindowStats};
use crate::types::{round2, Observation};

/// One point of the rolling per-item series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub window: DateTime<Utc>,
    pub median: Option<f64>,
    pub low: Option<f64>,
    pub vendors: BTreeMap<String, f64>,
}

/// Walks the `count` most recent window floors ending at `current_window`
/// (inclusive) and summarises each from primary-side rows, oldest first.
/// Windows without a single in-stock price are left out.
pub fn rolling_series(
    rows: &[Observation],
    current_window: DateTime<Utc>,
    width: Duration,
    count: u32,
) -> Vec<SeriesPoint> {
    (0..count as i32)
        .rev()
        .filter_map(|back| {
            let start = current_window - width * back;
            let merged = merge_by_recency(
                rows_in(rows, start, start + width).filter(|o| !o.method.is_verification()),
            );
            let vendors: BTreeMap<String, f64> = merged
                .iter()
                .filter(|(_, o)| o.is_priced_in_stock())
                .filter_map(|(vendor, o)| o.price.map(|p| (vendor.clone(), round2(p))))
                .collect();
            if vendors.is_empty() {
                return None;
            }
            let stats = WindowStats::from_prices(&in_stock_prices(merged.values()));
            Some(SeriesPoint {
                window: start,
                median: stats.median.map(round2),
                low: stats.lowest.map(round2),
                vendors,
            })
        })
        .collect()
}
