use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::FetchConfig;
use crate::types::{EgressRoute, Target, Tier};

/// What one source made of one target. `Ok` from a source means content was
/// obtained, not that it contained a price.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub price: Option<f64>,
    pub in_stock: bool,
    pub self_confidence: Option<Tier>,
    pub agrees_with_other: Option<bool>,
}

impl Extraction {
    #[cfg(test)]
    pub fn priced(price: f64) -> Self {
        Self { price: Some(price), ..Self::empty() }
    }

    #[cfg(test)]
    pub fn unavailable() -> Self {
        Self { in_stock: false, ..Self::empty() }
    }

    /// Content without a price or an availability verdict.
    pub fn empty() -> Self {
        Self {
            price: None,
            in_stock: true,
            self_confidence: None,
            agrees_with_other: None,
        }
    }

    /// A price or an explicit "out of stock": either ends the fallback chain.
    pub fn has_signal(&self) -> bool {
        self.price.is_some() || !self.in_stock
    }

    /// Drops a price outside the target's plausible range. Returns whether
    /// anything was dropped.
    pub fn enforce_plausible(&mut self, target: &Target) -> bool {
        match self.price {
            Some(p) if !target.is_plausible(p) => {
                self.price = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("blocked with status {0}")]
    Blocked(u16),

    #[error("unreadable response: {0}")]
    Parse(String),
}

impl SourceError {
    /// Whether the same request on the same route is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Timeout(_) | SourceError::Http(_) => true,
            SourceError::Status(code) => *code >= 500,
            SourceError::Blocked(_) | SourceError::Parse(_) => false,
        }
    }
}

/// One interchangeable extraction method.
#[async_trait]
pub trait ExtractionSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, target: &Target, route: &EgressRoute) -> Result<Extraction, SourceError>;
}

/// Per-attempt timeout with a fixed number of retries and linear backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &FetchConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_secs),
            retries: cfg.retries,
            backoff_step: Duration::from_millis(cfg.backoff_step_ms),
        }
    }

    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut n = 0u32;
        loop {
            let err = match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => SourceError::Timeout(self.timeout),
            };
            if n >= self.retries || !err.is_retryable() {
                return Err(err);
            }
            n += 1;
            tokio::time::sleep(self.backoff_step * n).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn target() -> Target {
        Target {
            coin_id: "ase".into(),
            vendor_id: "apmex".into(),
            url: "https://apmex.test/ase".into(),
            min_price: 20.0,
            max_price: 150.0,
        }
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            retries,
            backoff_step: Duration::ZERO,
        }
    }

    #[test]
    fn implausible_price_becomes_not_found() {
        let mut e = Extraction::priced(4.95);
        assert!(e.enforce_plausible(&target()));
        assert_eq!(e.price, None);
        assert!(e.in_stock);
        assert!(!e.has_signal());

        let mut ok = Extraction::priced(36.5);
        assert!(!ok.enforce_plausible(&target()));
        assert!(ok.has_signal());
    }

    #[test]
    fn unavailable_is_a_signal() {
        assert!(Extraction::unavailable().has_signal());
        assert!(!Extraction::empty().has_signal());
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = policy(2)
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::Status(503))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = policy(1)
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Status(502))
            })
            .await;
        assert!(matches!(out, Err(SourceError::Status(502))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blocked_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = policy(3)
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Blocked(403))
            })
            .await;
        assert!(matches!(out, Err(SourceError::Blocked(403))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let out: Result<(), _> = policy(0)
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(SourceError::Timeout(_))));
    }
}
