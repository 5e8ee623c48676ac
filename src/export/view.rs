use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::aggregator::window::{in_stock_prices, merge_by_recency, rows_in};
use crate::aggregator::{floor_window, median, rolling_series, WindowStats};
use crate::config::{ConsensusThresholds, WindowConfig};
use crate::export::artifacts::{CoinLatest, VendorEntry};
use crate::resolver::fallback::{last_in_stock_point, substitute};
use crate::resolver::{resolve, PrimaryInput, Resolution, VerificationInput};
use crate::types::{round2, Method, Observation};

/// A pending idempotent confidence write for one (vendor, window).
#[derive(Debug, Clone, PartialEq)]
pub struct Backfill {
    pub vendor_id: String,
    pub window_start: DateTime<Utc>,
    pub confidence: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoinView {
    pub latest: CoinLatest,
    pub backfills: Vec<Backfill>,
}

/// Builds the current-window view of one coin from its loaded history.
///
/// Pure: the same rows, `now` and configuration always give the same view.
/// Returns `None` when the coin has nothing to publish.
pub fn build_coin_view(
    history: &[Observation],
    configured_vendors: &[String],
    now: DateTime<Utc>,
    windows: &WindowConfig,
    th: &ConsensusThresholds,
) -> Option<CoinView> {
    let current_window = floor_window(now, windows.width);
    let lookback_from = now - windows.lookback;
    let current: Vec<&Observation> = history
        .iter()
        .filter(|o| o.scraped_at >= lookback_from && o.scraped_at <= now)
        .collect();

    let primary_rows = merge_by_recency(current.iter().copied().filter(|o| !o.method.is_verification()));
    let verification_rows = merge_by_recency(current.iter().copied().filter(|o| o.method.is_verification()));

    let window_median = median(&in_stock_prices(primary_rows.values()));
    // Previous period: the same lookback merge, ending where the current window starts.
    let prev_rows = merge_by_recency(
        rows_in(history, current_window - windows.lookback, current_window)
            .filter(|o| !o.method.is_verification()),
    );
    let prev_median = median(&in_stock_prices(prev_rows.values()));

    let present: BTreeSet<&String> = primary_rows.keys().chain(verification_rows.keys()).collect();
    let mut resolved: BTreeMap<String, Resolution> = BTreeMap::new();
    let mut backfills = Vec::new();

    for vendor in present {
        let primary_row = primary_rows.get(vendor);
        let primary = primary_row.map_or_else(PrimaryInput::absent, PrimaryInput::from_observation);
        let verification = verification_rows.get(vendor).map(VerificationInput::from_observation);

        let consensus = resolve(&primary, verification.as_ref(), window_median, prev_median, th);
        let mut resolution = Resolution::from_consensus(consensus, primary.method);

        if !resolution.in_stock {
            resolution.last_in_stock = last_in_stock_point(history, vendor, now);
        }

        if resolution.is_unresolved() {
            let Some(substituted) = substitute(
                history,
                vendor,
                now,
                windows.staleness_budget,
                Method::LastKnown,
                window_median,
                prev_median,
                th,
            ) else {
                continue;
            };
            resolved.insert(vendor.clone(), substituted);
            continue;
        }

        // Only a price taken from the primary-side row is backfilled onto it.
        let from_primary = !resolution.method.is_verification();
        if let (Some(confidence), Some(row), true) = (resolution.confidence, primary_row, from_primary) {
            backfills.push(Backfill {
                vendor_id: vendor.clone(),
                window_start: row.window_start,
                confidence,
            });
        }
        resolved.insert(vendor.clone(), resolution);
    }

    // Vendors expected for this coin but absent from every recent row.
    for vendor in configured_vendors {
        if primary_rows.contains_key(vendor) || verification_rows.contains_key(vendor) {
            continue;
        }
        if let Some(substituted) = substitute(
            history,
            vendor,
            now,
            windows.staleness_budget,
            Method::GapFill,
            window_median,
            prev_median,
            th,
        ) {
            resolved.insert(vendor.clone(), substituted);
        }
    }

    let series_rows: Vec<Observation> = history
        .iter()
        .filter(|o| o.scraped_at <= now)
        .cloned()
        .collect();
    let windows_24h = rolling_series(&series_rows, current_window, windows.width, windows.series_windows);

    if resolved.is_empty() && windows_24h.is_empty() {
        return None;
    }

    let published: Vec<f64> = resolved
        .values()
        .filter(|r| r.in_stock)
        .filter_map(|r| r.price)
        .collect();
    let stats = WindowStats::from_prices(&published);

    Some(CoinView {
        latest: CoinLatest {
            window_start: current_window,
            median_price: stats.median.map(round2),
            lowest_price: stats.lowest.map(round2),
            vendors: resolved.iter().map(|(v, r)| (v.clone(), VendorEntry::from(r))).collect(),
            windows_24h,
        },
        backfills,
    })
}
