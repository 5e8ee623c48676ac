use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::aggregator::window::{floor_window, lowest, median, merge_by_recency};
use crate::types::{round2, Observation};

/// Per (coin, vendor, date) statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub avg_price: f64,
    pub min_price: f64,
    pub sample_count: u32,
    pub in_stock: bool,
}

/// Cross-vendor summary of one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRollup {
    pub date: NaiveDate,
    pub avg_median: Option<f64>,
    pub avg_low: Option<f64>,
    pub sample_count: u32,
    pub vendors: BTreeMap<String, DailyAggregate>,
}

#[derive(Default)]
struct VendorDay {
    prices: Vec<f64>,
    last_seen: Option<(DateTime<Utc>, bool)>,
}

/// Groups primary-side rows by (UTC date, vendor) and summarises them.
///
/// Duplicate writer rows are reconciled per window first, so two agents
/// scraping the same window count once. The day summary is the median and
/// minimum of the per-vendor averages. Output is ordered by date.
pub fn daily_rollups(rows: &[Observation], width: Duration) -> Vec<DailyRollup> {
    let mut by_window: BTreeMap<DateTime<Utc>, Vec<&Observation>> = BTreeMap::new();
    for row in rows.iter().filter(|o| !o.method.is_verification()) {
        by_window
            .entry(floor_window(row.scraped_at, width))
            .or_default()
            .push(row);
    }

    let mut days: BTreeMap<NaiveDate, BTreeMap<String, VendorDay>> = BTreeMap::new();
    for (window, window_rows) in by_window {
        let date = window.date_naive();
        for (vendor, row) in merge_by_recency(window_rows) {
            if row.failed {
                continue;
            }
            let day = days.entry(date).or_default().entry(vendor).or_default();
            if let (true, Some(price)) = (row.in_stock, row.price) {
                day.prices.push(price);
            }
            if day.last_seen.map_or(true, |(ts, _)| row.scraped_at >= ts) {
                day.last_seen = Some((row.scraped_at, row.in_stock));
            }
        }
    }

    days.into_iter()
        .filter_map(|(date, vendor_days)| {
            let vendors: BTreeMap<String, DailyAggregate> = vendor_days
                .into_iter()
                .filter(|(_, d)| !d.prices.is_empty())
                .map(|(vendor, d)| {
                    let count = d.prices.len();
                    let avg = d.prices.iter().sum::<f64>() / count as f64;
                    let agg = DailyAggregate {
                        avg_price: round2(avg),
                        min_price: round2(lowest(&d.prices).unwrap_or(avg)),
                        sample_count: count as u32,
                        in_stock: d.last_seen.map_or(true, |(_, in_stock)| in_stock),
                    };
                    (vendor, agg)
                })
                .collect();
            if vendors.is_empty() {
                return None;
            }
            let averages: Vec<f64> = vendors.values().map(|a| a.avg_price).collect();
            Some(DailyRollup {
                date,
                avg_median: median(&averages).map(round2),
                avg_low: lowest(&averages).map(round2),
                sample_count: vendors.values().map(|a| a.sample_count).sum(),
                vendors,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Method;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    fn obs(vendor: &str, agent: &str, ts: DateTime<Utc>, price: Option<f64>, in_stock: bool) -> Observation {
        Observation::new("ase", vendor, agent, ts, ts, Method::Primary, price, in_stock)
    }

    #[test]
    fn rolls_up_per_vendor_then_across_vendors() {
        let rows = vec![
            obs("apmex", "a1", at(1, 10, 0), Some(30.0), true),
            obs("apmex", "a1", at(1, 11, 0), Some(32.0), true),
            obs("jmb", "a1", at(1, 10, 0), Some(40.0), true),
            obs("sdb", "a1", at(1, 10, 0), Some(20.0), true),
            obs("apmex", "a1", at(2, 9, 0), Some(33.0), true),
        ];
        let rollups = daily_rollups(&rows, Duration::minutes(15));
        assert_eq!(rollups.len(), 2);

        let day1 = &rollups[0];
        assert_eq!(day1.date, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(day1.vendors["apmex"].avg_price, 31.0);
        assert_eq!(day1.vendors["apmex"].min_price, 30.0);
        assert_eq!(day1.vendors["apmex"].sample_count, 2);
        // averages: sdb 20, apmex 31, jmb 40
        assert_eq!(day1.avg_median, Some(31.0));
        assert_eq!(day1.avg_low, Some(20.0));
        assert_eq!(day1.sample_count, 4);

        assert_eq!(rollups[1].vendors.len(), 1);
    }

    #[test]
    fn duplicate_writers_in_one_window_count_once() {
        let rows = vec![
            obs("apmex", "a1", at(1, 10, 1), Some(30.0), true),
            obs("apmex", "a2", at(1, 10, 5), Some(31.0), true),
        ];
        let rollups = daily_rollups(&rows, Duration::minutes(15));
        let apmex = &rollups[0].vendors["apmex"];
        assert_eq!(apmex.sample_count, 1);
        assert_eq!(apmex.avg_price, 31.0);
    }

    #[test]
    fn last_stock_state_of_the_day_is_reported() {
        let rows = vec![
            obs("apmex", "a1", at(1, 10, 0), Some(30.0), true),
            obs("apmex", "a1", at(1, 18, 0), None, false),
        ];
        let rollups = daily_rollups(&rows, Duration::minutes(15));
        assert!(!rollups[0].vendors["apmex"].in_stock);
        assert_eq!(rollups[0].vendors["apmex"].sample_count, 1);
    }

    #[test]
    fn failed_rows_produce_nothing() {
        let rows = vec![obs("apmex", "a1", at(1, 10, 0), None, true)];
        assert!(daily_rollups(&rows, Duration::minutes(15)).is_empty());
    }
}
