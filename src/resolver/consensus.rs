use crate::config::ConsensusThresholds;
use crate::resolver::StockReason;
use crate::types::{Method, Observation, Tier};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What the primary-side row says. A missing or failed row is `price: None,
/// in_stock: true` (no signal).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimaryInput {
    pub price: Option<f64>,
    pub in_stock: bool,
    pub method: Method,
}

impl PrimaryInput {
    pub fn absent() -> Self {
        Self { price: None, in_stock: true, method: Method::Primary }
    }

    pub fn from_observation(o: &Observation) -> Self {
        Self {
            price: o.price,
            in_stock: o.in_stock,
            method: o.method,
        }
    }
}

/// Availability as reported by the verification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockSignal {
    Available,
    Unavailable,
    /// No verification row, or one that found nothing.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationInput {
    pub price: Option<f64>,
    pub stock: StockSignal,
    pub tier: Option<Tier>,
    pub agrees: Option<bool>,
}

impl VerificationInput {
    pub fn from_observation(o: &Observation) -> Self {
        let stock = if !o.in_stock {
            StockSignal::Unavailable
        } else if o.price.is_some() {
            StockSignal::Available
        } else {
            StockSignal::Silent
        };
        Self {
            price: o.price,
            stock,
            tier: o.self_confidence,
            agrees: o.agrees,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Verification,
}

/// The five price cases, checked in order. Each variant carries exactly the
/// fields that case produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceCase {
    /// Both sources present and agreeing.
    Agreement { price: f64, confidence: u8 },
    /// Both present but apart; the one nearer the window median was kept.
    Divergent { price: f64, picked: Side, confidence: u8 },
    VerificationOnly { price: f64, confidence: u8 },
    PrimaryOnly { price: f64, confidence: u8 },
    Unresolved,
}

impl PriceCase {
    pub fn price(&self) -> Option<f64> {
        match *self {
            PriceCase::Agreement { price, .. }
            | PriceCase::Divergent { price, .. }
            | PriceCase::VerificationOnly { price, .. }
            | PriceCase::PrimaryOnly { price, .. } => Some(price),
            PriceCase::Unresolved => None,
        }
    }

    pub fn confidence(&self) -> Option<u8> {
        match *self {
            PriceCase::Agreement { confidence, .. }
            | PriceCase::Divergent { confidence, .. }
            | PriceCase::VerificationOnly { confidence, .. }
            | PriceCase::PrimaryOnly { confidence, .. } => Some(confidence),
            PriceCase::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consensus {
    Available { reason: StockReason, case: PriceCase },
    Unavailable { reason: StockReason },
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Stock-status consensus. Verification inspects rendered state, so its
/// explicit verdict outranks the primary's.
pub fn stock_consensus(primary_in_stock: bool, verification: StockSignal) -> (bool, StockReason) {
    match (primary_in_stock, verification) {
        (false, StockSignal::Unavailable) => (false, StockReason::BothUnavailable),
        (true, StockSignal::Unavailable) => (false, StockReason::VerificationUnavailable),
        (false, StockSignal::Silent) => (false, StockReason::PrimaryUnavailable),
        (false, StockSignal::Available) => (true, StockReason::VerificationOverride),
        (true, _) => (true, StockReason::InStock),
    }
}

/// Fuses one primary and an optional verification reading into a verdict.
pub fn resolve(
    primary: &PrimaryInput,
    verification: Option<&VerificationInput>,
    window_median: Option<f64>,
    prev_median: Option<f64>,
    th: &ConsensusThresholds,
) -> Consensus {
    let signal = verification.map_or(StockSignal::Silent, |v| v.stock);
    let (in_stock, reason) = stock_consensus(primary.in_stock, signal);
    if !in_stock {
        return Consensus::Unavailable { reason };
    }

    let score = |price: f64| deviation_score(price, window_median, prev_median, th);
    let v_price = verification.and_then(|v| v.price);

    let case = match (primary.price, v_price) {
        (Some(p), Some(v)) => {
            let agrees = verification.and_then(|x| x.agrees) == Some(true);
            if agrees || relative_diff_pct(p, v) <= th.agreement_pct {
                PriceCase::Agreement { price: p, confidence: th.agreement_confidence.min(100) }
            } else {
                let picked = match window_median {
                    Some(m) if (v - m).abs() < (p - m).abs() => Side::Verification,
                    _ => Side::Primary,
                };
                let price = if picked == Side::Primary { p } else { v };
                PriceCase::Divergent {
                    price,
                    picked,
                    confidence: score(price).min(th.divergent_confidence_cap),
                }
            }
        }
        (None, Some(v)) => {
            let tier = verification.and_then(|x| x.tier);
            let base = i32::from(th.verification_base);
            let step = i32::from(th.verification_tier_step);
            let by_tier = match tier {
                Some(Tier::High) => base + step,
                Some(Tier::Low) => base - step,
                Some(Tier::Medium) | None => base,
            };
            let cap = i32::from(score(v)) + i32::from(th.verification_headroom);
            PriceCase::VerificationOnly { price: v, confidence: clamp_pct(by_tier.min(cap)) }
        }
        (Some(p), None) => PriceCase::PrimaryOnly { price: p, confidence: score(p) },
        (None, None) => PriceCase::Unresolved,
    };

    Consensus::Available { reason, case }
}

/// Confidence derived from how far `price` sits from the window median and
/// from the previous period's median.
pub fn deviation_score(
    price: f64,
    window_median: Option<f64>,
    prev_median: Option<f64>,
    th: &ConsensusThresholds,
) -> u8 {
    let mut score = th.score_base;
    if let Some(m) = window_median.filter(|m| *m > 0.0) {
        let dev = (price - m).abs() / m * 100.0;
        if dev <= th.near_median_pct {
            score += th.near_median_bonus;
        } else if dev > th.far_median_pct {
            score -= th.far_median_penalty;
        }
    }
    if let Some(prev) = prev_median.filter(|m| *m > 0.0) {
        if (price - prev).abs() / prev * 100.0 > th.prev_period_pct {
            score -= th.prev_period_penalty;
        }
    }
    clamp_pct(score)
}

/// Relative difference of `other` against the primary price, in percent.
fn relative_diff_pct(primary: f64, other: f64) -> f64 {
    if primary <= 0.0 {
        return f64::INFINITY;
    }
    (primary - other).abs() / primary * 100.0
}

fn clamp_pct(v: i32) -> u8 {
    v.clamp(0, 100) as u8
}
