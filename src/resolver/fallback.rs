use chrono::{DateTime, Duration, Utc};

use crate::config::ConsensusThresholds;
use crate::resolver::consensus::deviation_score;
use crate::resolver::{PricePoint, Resolution, StockReason};
use crate::types::{Method, Observation};

/// Most recent in-stock priced row for `vendor` at or before `now`, ignoring age.
pub fn last_in_stock<'a>(
    history: &'a [Observation],
    vendor: &str,
    now: DateTime<Utc>,
) -> Option<&'a Observation> {
    history
        .iter()
        .filter(|o| o.vendor_id == vendor && !o.method.is_verification())
        .filter(|o| o.scraped_at <= now && o.is_priced_in_stock())
        .max_by(|a, b| a.scraped_at.cmp(&b.scraped_at).then_with(|| a.id.cmp(&b.id)))
}

pub fn last_in_stock_point(history: &[Observation], vendor: &str, now: DateTime<Utc>) -> Option<PricePoint> {
    last_in_stock(history, vendor, now)
        .and_then(|o| o.price.map(|price| PricePoint { price, at: o.scraped_at }))
}

/// Most recent in-stock priced row no older than `budget`. A row exactly at
/// the budget is eligible; anything older is never served.
pub fn last_known_good<'a>(
    history: &'a [Observation],
    vendor: &str,
    now: DateTime<Utc>,
    budget: Duration,
) -> Option<&'a Observation> {
    last_in_stock(history, vendor, now).filter(|o| now - o.scraped_at <= budget)
}

/// Whether the vendor's latest definite signal is "out of stock". Failed rows
/// carry no signal and are skipped. Substitution never resurrects such a vendor.
pub fn is_explicitly_unavailable(history: &[Observation], vendor: &str, now: DateTime<Utc>) -> bool {
    history
        .iter()
        .filter(|o| o.vendor_id == vendor && !o.method.is_verification())
        .filter(|o| o.scraped_at <= now && !o.failed)
        .max_by(|a, b| a.scraped_at.cmp(&b.scraped_at).then_with(|| a.id.cmp(&b.id)))
        .is_some_and(|o| o.is_confirmed_unavailable())
}

/// Staleness-gated substitution for a vendor with no usable price.
/// Returns `None` when the vendor must be left out of the export.
#[allow(clippy::too_many_arguments)]
pub fn substitute(
    history: &[Observation],
    vendor: &str,
    now: DateTime<Utc>,
    budget: Duration,
    method: Method,
    window_median: Option<f64>,
    prev_median: Option<f64>,
    th: &ConsensusThresholds,
) -> Option<Resolution> {
    if is_explicitly_unavailable(history, vendor, now) {
        return None;
    }
    let good = last_known_good(history, vendor, now, budget)?;
    let price = good.price?;
    let confidence = deviation_score(price, window_median, prev_median, th).min(th.stale_confidence_cap);
    Some(Resolution {
        price: Some(price),
        confidence: Some(confidence),
        method,
        in_stock: true,
        stock_reason: StockReason::InStock,
        stale: true,
        stale_since: Some(good.scraped_at),
        last_in_stock: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn obs(vendor: &str, ts: DateTime<Utc>, price: Option<f64>, in_stock: bool) -> Observation {
        Observation::new("ase", vendor, "a1", ts, ts, Method::Primary, price, in_stock)
    }

    fn sub(history: &[Observation]) -> Option<Resolution> {
        substitute(
            history,
            "apmex",
            now(),
            Duration::hours(4),
            Method::LastKnown,
            None,
            None,
            &ConsensusThresholds::default(),
        )
    }

    #[test]
    fn value_exactly_at_budget_is_eligible() {
        let history = vec![obs("apmex", now() - Duration::hours(4), Some(35.0), true)];
        let r = sub(&history).expect("at-budget value should be served");
        assert_eq!(r.price, Some(35.0));
        assert!(r.stale);
        assert_eq!(r.stale_since, Some(now() - Duration::hours(4)));
        assert_eq!(r.method, Method::LastKnown);
    }

    #[test]
    fn value_one_unit_past_budget_is_not() {
        let history = vec![obs(
            "apmex",
            now() - Duration::hours(4) - Duration::milliseconds(1),
            Some(35.0),
            true,
        )];
        assert!(sub(&history).is_none());
    }

    #[test]
    fn newest_good_value_is_used() {
        let history = vec![
            obs("apmex", now() - Duration::hours(3), Some(34.0), true),
            obs("apmex", now() - Duration::hours(1), Some(36.0), true),
            obs("apmex", now() - Duration::minutes(30), None, true),
        ];
        assert_eq!(sub(&history).unwrap().price, Some(36.0));
    }

    #[test]
    fn no_history_means_omit() {
        assert!(sub(&[]).is_none());
        let failures = vec![obs("apmex", now() - Duration::minutes(10), None, true)];
        assert!(sub(&failures).is_none());
    }

    #[test]
    fn out_of_stock_vendor_is_never_resurrected() {
        let history = vec![
            obs("apmex", now() - Duration::hours(2), Some(35.0), true),
            obs("apmex", now() - Duration::hours(1), None, false),
            obs("apmex", now() - Duration::minutes(5), None, true),
        ];
        assert!(sub(&history).is_none());
    }

    #[test]
    fn stale_confidence_is_capped() {
        let history = vec![obs("apmex", now() - Duration::hours(1), Some(100.0), true)];
        let r = substitute(
            &history,
            "apmex",
            now(),
            Duration::hours(4),
            Method::GapFill,
            Some(100.0),
            None,
            &ConsensusThresholds::default(),
        )
        .unwrap();
        assert_eq!(r.confidence, Some(50));
    }

    #[test]
    fn other_vendors_and_future_rows_are_ignored() {
        let history = vec![
            obs("jmb", now() - Duration::minutes(5), Some(35.0), true),
            obs("apmex", now() + Duration::minutes(5), Some(35.0), true),
        ];
        assert!(sub(&history).is_none());
    }
}
