use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::types::Observation;

/// Floors a timestamp to the start of its fixed-width UTC window.
pub fn floor_window(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let ms = ts.timestamp_millis();
    let floored = ms - ms.rem_euclid(width_ms);
    DateTime::from_timestamp_millis(floored).unwrap_or(ts)
}

/// Median with an exact tie-break: for even-length input the lower of the two
/// middle elements is returned, never their average. `[10, 20, 30, 40]` → 20.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[(sorted.len() - 1) / 2])
}

pub fn lowest(values: &[f64]) -> Option<f64> {
    values.iter().copied().min_by(|a, b| a.total_cmp(b))
}

/// Rows with `from <= scraped_at < to`.
pub fn rows_in<'a>(
    rows: &'a [Observation],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> impl Iterator<Item = &'a Observation> {
    rows.iter()
        .filter(move |o| o.scraped_at >= from && o.scraped_at < to)
}

/// Total order on rows of one vendor: later `scraped_at` wins, remaining ties
/// are broken on row content so the result never depends on insertion order.
fn recency_cmp(a: &Observation, b: &Observation) -> Ordering {
    a.scraped_at
        .cmp(&b.scraped_at)
        .then_with(|| a.agent_id.cmp(&b.agent_id))
        .then_with(|| a.method.cmp(&b.method))
        .then_with(|| a.in_stock.cmp(&b.in_stock))
        .then_with(|| {
            let pa = a.price.unwrap_or(f64::NEG_INFINITY);
            let pb = b.price.unwrap_or(f64::NEG_INFINITY);
            pa.total_cmp(&pb)
        })
}

/// Reconciles rows written by independent, uncoordinated agents: per vendor,
/// the most recent successful row wins. A vendor that only has failed rows is
/// represented by its most recent failed row so callers still see it as
/// present.
///
/// This is the only cross-writer consistency rule; there is no locking.
pub fn merge_by_recency<'a, I>(rows: I) -> BTreeMap<String, Observation>
where
    I: IntoIterator<Item = &'a Observation>,
{
    let mut merged: BTreeMap<String, Observation> = BTreeMap::new();
    for row in rows {
        match merged.get(&row.vendor_id) {
            None => {
                merged.insert(row.vendor_id.clone(), row.clone());
            }
            Some(current) => {
                let replace = match (current.failed, row.failed) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => recency_cmp(row, current) == Ordering::Greater,
                };
                if replace {
                    merged.insert(row.vendor_id.clone(), row.clone());
                }
            }
        }
    }
    merged
}

/// In-stock, priced values of a merged vendor map.
pub fn in_stock_prices<'a, I>(rows: I) -> Vec<f64>
where
    I: IntoIterator<Item = &'a Observation>,
{
    rows.into_iter()
        .filter(|o| o.is_priced_in_stock())
        .filter_map(|o| o.price)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    pub median: Option<f64>,
    pub lowest: Option<f64>,
}

impl WindowStats {
    pub fn from_prices(prices: &[f64]) -> Self {
        Self {
            median: median(prices),
            lowest: lowest(prices),
        }
    }
}
