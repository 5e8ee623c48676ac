//! Attempt latency per extraction source, summarised at the end of a cycle.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use tracing::info;

/// Per-source histograms. Values stored in milliseconds, 1ms to 10min,
/// 3 significant figures.
#[derive(Default)]
pub struct SourceLatency {
    inner: Mutex<BTreeMap<&'static str, Histogram<u64>>>,
}

impl SourceLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: &'static str, d: Duration) {
        let ms = d.as_millis().clamp(1, 600_000) as u64;
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        if !map.contains_key(source) {
            let Ok(h) = Histogram::new_with_bounds(1, 600_000, 3) else {
                return;
            };
            map.insert(source, h);
        }
        if let Some(h) = map.get_mut(source) {
            let _ = h.record(ms);
        }
    }

    /// (p50_ms, p95_ms, p99_ms). None if the source has no samples.
    pub fn percentiles(&self, source: &str) -> Option<(u64, u64, u64)> {
        let map = self.inner.lock().ok()?;
        let h = map.get(source).filter(|h| h.len() > 0)?;
        Some((
            h.value_at_quantile(0.5),
            h.value_at_quantile(0.95),
            h.value_at_quantile(0.99),
        ))
    }

    pub fn len(&self, source: &str) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(source).map(|h| h.len()))
            .unwrap_or(0)
    }

    pub fn log_summary(&self, run_id: &str) {
        let sources: Vec<&'static str> = match self.inner.lock() {
            Ok(map) => map.keys().copied().collect(),
            Err(_) => return,
        };
        for source in sources {
            if let Some((p50, p95, p99)) = self.percentiles(source) {
                info!(
                    run_id,
                    source,
                    samples = self.len(source),
                    p50_ms = p50,
                    p95_ms = p95,
                    p99_ms = p99,
                    "Attempt latency"
                );
            }
        }
    }
}
