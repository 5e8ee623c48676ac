//! Turns the merged rows of one (coin, vendor, window) into a single trusted
//! price. Everything here is pure; results are recomputed on every export.

pub mod consensus;
pub mod fallback;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Method;
use consensus::{Consensus, PriceCase, Side};

pub use consensus::{resolve, PrimaryInput, VerificationInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StockReason {
    InStock,
    BothUnavailable,
    VerificationUnavailable,
    PrimaryUnavailable,
    VerificationOverride,
}

/// A historical in-stock price shown next to an unavailable vendor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Flattened view of a vendor's verdict for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub price: Option<f64>,
    pub confidence: Option<u8>,
    pub method: Method,
    pub in_stock: bool,
    pub stock_reason: StockReason,
    pub stale: bool,
    pub stale_since: Option<DateTime<Utc>>,
    /// Display-only; never the active price.
    pub last_in_stock: Option<PricePoint>,
}

impl Resolution {
    pub fn from_consensus(consensus: Consensus, primary_method: Method) -> Self {
        match consensus {
            Consensus::Unavailable { reason } => Self {
                price: None,
                confidence: None,
                method: primary_method,
                in_stock: false,
                stock_reason: reason,
                stale: false,
                stale_since: None,
                last_in_stock: None,
            },
            Consensus::Available { reason, case } => {
                let method = match case {
                    PriceCase::VerificationOnly { .. }
                    | PriceCase::Divergent { picked: Side::Verification, .. } => Method::Verification,
                    _ => primary_method,
                };
                Self {
                    price: case.price(),
                    confidence: case.confidence(),
                    method,
                    in_stock: true,
                    stock_reason: reason,
                    stale: false,
                    stale_since: None,
                    last_in_stock: None,
                }
            }
        }
    }

    /// Available but without a price: the only state eligible for substitution.
    pub fn is_unresolved(&self) -> bool {
        self.in_stock && self.price.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_resolution_has_no_price_or_confidence() {
        let r = Resolution::from_consensus(
            Consensus::Unavailable { reason: StockReason::PrimaryUnavailable },
            Method::Primary,
        );
        assert!(!r.in_stock);
        assert_eq!(r.price, None);
        assert_eq!(r.confidence, None);
        assert!(!r.is_unresolved());
    }

    #[test]
    fn verification_sourced_cases_report_verification_method() {
        let r = Resolution::from_consensus(
            Consensus::Available {
                reason: StockReason::InStock,
                case: PriceCase::VerificationOnly { price: 10.0, confidence: 70 },
            },
            Method::RenderedFallback,
        );
        assert_eq!(r.method, Method::Verification);

        let r = Resolution::from_consensus(
            Consensus::Available {
                reason: StockReason::InStock,
                case: PriceCase::Agreement { price: 10.0, confidence: 99 },
            },
            Method::RenderedFallback,
        );
        assert_eq!(r.method, Method::RenderedFallback);
    }

    #[test]
    fn unresolved_case_is_a_substitution_candidate() {
        let r = Resolution::from_consensus(
            Consensus::Available { reason: StockReason::InStock, case: PriceCase::Unresolved },
            Method::Primary,
        );
        assert!(r.is_unresolved());
        assert_eq!(r.confidence, None);
    }
}
