use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::acquisition::latency::SourceLatency;
use crate::acquisition::source::{Extraction, ExtractionSource, SourceError};
use crate::aggregator::floor_window;
use crate::config::LOG_MSG_MAX_CHARS;
use crate::db::models::{from_ms, RetryRow};
use crate::db::{Match, Store};
use crate::error::{truncate_msg, AppError, Result};
use crate::types::{EgressRoute, Method, Observation, RunAudit, RunStatus, Target};

/// The sources a controller walks, in tier order.
#[derive(Clone)]
pub struct Sources {
    pub primary: Arc<dyn ExtractionSource>,
    pub rendered: Option<Arc<dyn ExtractionSource>>,
    pub verification: Option<Arc<dyn ExtractionSource>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Cycle,
    Retry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub run_id: String,
    pub total: u32,
    pub captured: u32,
    pub failed: u32,
    pub status: RunStatus,
}

/// Drives targets through the tiered fallback chain, strictly one at a time.
pub struct AcquisitionController {
    store: Store,
    sources: Sources,
    /// Alternate egress routes tried after the first one, in order.
    alternates: Vec<EgressRoute>,
    agent_id: String,
    window_width: Duration,
    jitter_ms: (u64, u64),
    latency: SourceLatency,
}

/// Result of the primary/rendered chain for one target.
struct ChainOutcome {
    method: Method,
    extraction: Extraction,
}

impl AcquisitionController {
    pub fn new(
        store: Store,
        sources: Sources,
        alternates: Vec<EgressRoute>,
        agent_id: impl Into<String>,
        window_width: Duration,
        jitter_ms: (u64, u64),
    ) -> Self {
        Self {
            store,
            sources,
            alternates,
            agent_id: agent_id.into(),
            window_width,
            jitter_ms,
            latency: SourceLatency::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    /// One acquisition cycle over every target. Zero captured out of a
    /// non-empty target list is a [`AppError::TotalFailure`].
    pub async fn run_cycle(&self, mut targets: Vec<Target>, now: DateTime<Utc>) -> Result<CycleReport> {
        targets.shuffle(&mut rand::thread_rng());
        let report = self.run_pass(&targets, None, Pass::Cycle, now).await?;
        if report.total > 0 && report.captured == 0 {
            return Err(AppError::TotalFailure { total: report.total as usize });
        }
        Ok(report)
    }

    /// Deferred retry pass over this agent's queue. Every loaded entry is
    /// cleared afterwards whatever the outcome; anything still unresolved is
    /// left to last-known-good substitution at export time.
    pub async fn run_retry_pass(
        &self,
        catalog_targets: &[Target],
        forced_route: Option<EgressRoute>,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let queued = self.store.pending_retries(&self.agent_id).await?;
        let by_key: BTreeMap<(String, String), &Target> =
            catalog_targets.iter().map(|t| (t.key(), t)).collect();

        let mut targets = Vec::with_capacity(queued.len());
        for entry in &queued {
            let Some(target) = by_key.get(&(entry.coin_id.clone(), entry.vendor_id.clone())) else {
                warn!(
                    coin = %entry.coin_id,
                    vendor = %entry.vendor_id,
                    "Queued retry no longer in catalog, dropping"
                );
                continue;
            };
            if self.captured_since(entry, now).await? {
                debug!(coin = %entry.coin_id, vendor = %entry.vendor_id, "Captured since queued, skipping");
                continue;
            }
            targets.push((*target).clone());
        }
        info!(queued = queued.len(), route = forced_route.as_ref().map(|r| r.name()).unwrap_or("default"), "Starting retry pass");

        let outcome = self.run_pass(&targets, forced_route.as_ref(), Pass::Retry, now).await;

        for entry in &queued {
            if let Err(e) = self
                .store
                .clear_retry(&entry.coin_id, &entry.vendor_id, &self.agent_id)
                .await
            {
                warn!(
                    coin = %entry.coin_id,
                    vendor = %entry.vendor_id,
                    "Failed to clear retry entry: {}",
                    truncate_msg(&e.to_string(), LOG_MSG_MAX_CHARS)
                );
            }
        }
        outcome
    }

    /// Whether a later cycle already stored a successful row for this entry.
    async fn captured_since(&self, entry: &RetryRow, now: DateTime<Utc>) -> Result<bool> {
        let Some(queued_at) = from_ms(entry.queued_at) else {
            return Ok(false);
        };
        let latest = self
            .store
            .most_recent_matching(&entry.coin_id, &entry.vendor_id, now, Match::Acquired)
            .await?;
        Ok(latest.is_some_and(|o| !o.failed && o.scraped_at > queued_at))
    }

    async fn run_pass(
        &self,
        targets: &[Target],
        forced_route: Option<&EgressRoute>,
        pass: Pass,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let stale = self.store.fail_stale_runs(&self.agent_id, now).await?;
        if stale > 0 {
            warn!(agent = %self.agent_id, count = stale, "Marked abandoned runs as error");
        }

        let mut audit = RunAudit {
            run_id: uuid::Uuid::new_v4().to_string(),
            agent_id: self.agent_id.clone(),
            started_at: now,
            finished_at: None,
            status: RunStatus::Running,
            total: targets.len() as u32,
            captured: 0,
            failed: 0,
        };
        self.store.start_run(&audit).await?;
        info!(run_id = %audit.run_id, agent = %self.agent_id, targets = audit.total, ?pass, "Run started");

        let mut store_failed = false;
        for (i, target) in targets.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            match self.acquire_target(target, forced_route, pass).await {
                Ok(obs) if obs.failed => audit.failed += 1,
                Ok(_) => audit.captured += 1,
                Err(e) => {
                    store_failed = true;
                    audit.failed += 1;
                    error!(
                        run_id = %audit.run_id,
                        coin = %target.coin_id,
                        vendor = %target.vendor_id,
                        "Store write failed: {}",
                        truncate_msg(&e.to_string(), LOG_MSG_MAX_CHARS)
                    );
                }
            }
        }

        audit.finished_at = Some(Utc::now().max(now));
        audit.status = if store_failed || (pass == Pass::Cycle && audit.total > 0 && audit.captured == 0) {
            RunStatus::Error
        } else {
            RunStatus::Ok
        };
        self.store.finish_run(&audit).await?;
        self.latency.log_summary(&audit.run_id);
        info!(
            run_id = %audit.run_id,
            total = audit.total,
            captured = audit.captured,
            failed = audit.failed,
            status = %audit.status,
            "Run finished"
        );

        Ok(CycleReport {
            run_id: audit.run_id,
            total: audit.total,
            captured: audit.captured,
            failed: audit.failed,
            status: audit.status,
        })
    }

    async fn pause(&self) {
        let (lo, hi) = self.jitter_ms;
        if hi == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(lo..=hi.max(lo));
        tokio::time::sleep(StdDuration::from_millis(ms)).await;
    }

    // -----------------------------------------------------------------------
    // Per target
    // -----------------------------------------------------------------------

    /// Walks the chain, writes exactly one primary-side observation, queues a
    /// failed target for the retry pass and, on a normal cycle, records the
    /// verification reading. Only store errors are returned.
    async fn acquire_target(
        &self,
        target: &Target,
        forced_route: Option<&EgressRoute>,
        pass: Pass,
    ) -> Result<Observation> {
        let chain = self.walk_chain(target, forced_route).await;
        let method = match pass {
            Pass::Cycle => chain.method,
            Pass::Retry => Method::Retry,
        };

        let scraped_at = Utc::now();
        let mut obs = Observation::new(
            &target.coin_id,
            &target.vendor_id,
            &self.agent_id,
            scraped_at,
            floor_window(scraped_at, self.window_width),
            method,
            chain.extraction.price,
            chain.extraction.in_stock,
        );
        obs.id = Some(self.store.insert_observation(&obs).await?);

        if obs.failed {
            warn!(coin = %target.coin_id, vendor = %target.vendor_id, %method, "No price after all tiers");
            if pass == Pass::Cycle {
                self.store
                    .enqueue_retry(&target.coin_id, &target.vendor_id, &self.agent_id, scraped_at)
                    .await?;
            }
        } else {
            debug!(
                coin = %target.coin_id,
                vendor = %target.vendor_id,
                %method,
                price = ?obs.price,
                in_stock = obs.in_stock,
                "Captured"
            );
        }

        if pass == Pass::Cycle {
            self.verify(target).await?;
        }
        Ok(obs)
    }

    async fn walk_chain(&self, target: &Target, forced_route: Option<&EgressRoute>) -> ChainOutcome {
        let first_route = forced_route.cloned().unwrap_or(EgressRoute::Direct);

        if let Some(extraction) = self
            .attempt(self.sources.primary.as_ref(), target, &first_route)
            .await
            .filter(Extraction::has_signal)
        {
            return ChainOutcome { method: Method::Primary, extraction };
        }

        if let Some(rendered) = &self.sources.rendered {
            let routes = std::iter::once(first_route.clone())
                .chain(self.alternates.iter().filter(|r| **r != first_route).cloned());
            for route in routes {
                // The first route that yields content ends the walk, signal or not.
                if let Some(extraction) = self.attempt(rendered.as_ref(), target, &route).await {
                    if extraction.has_signal() {
                        return ChainOutcome { method: Method::RenderedFallback, extraction };
                    }
                    break;
                }
            }
        }

        ChainOutcome { method: Method::Primary, extraction: Extraction::empty() }
    }

    /// One source on one route. `None` when no content was obtained.
    async fn attempt(
        &self,
        source: &dyn ExtractionSource,
        target: &Target,
        route: &EgressRoute,
    ) -> Option<Extraction> {
        let started = Instant::now();
        let result = source.extract(target, route).await;
        self.latency.record(source.name(), started.elapsed());

        match result {
            Ok(mut extraction) => {
                let found = extraction.price;
                if extraction.enforce_plausible(target) {
                    info!(
                        coin = %target.coin_id,
                        vendor = %target.vendor_id,
                        source = source.name(),
                        price = ?found,
                        "Rejected implausible price"
                    );
                }
                Some(extraction)
            }
            Err(e) => {
                log_source_error(source.name(), target, route, &e);
                None
            }
        }
    }

    /// Independent verification reading, stored as its own observation. A
    /// failed reading is stored as a failed verification row.
    async fn verify(&self, target: &Target) -> Result<()> {
        let Some(verifier) = &self.sources.verification else {
            return Ok(());
        };
        let extraction = self
            .attempt(verifier.as_ref(), target, &EgressRoute::Direct)
            .await
            .unwrap_or_else(Extraction::empty);

        let scraped_at = Utc::now();
        let obs = Observation::new(
            &target.coin_id,
            &target.vendor_id,
            &self.agent_id,
            scraped_at,
            floor_window(scraped_at, self.window_width),
            Method::Verification,
            extraction.price,
            extraction.in_stock,
        )
        .with_verification_meta(extraction.self_confidence, extraction.agrees_with_other);
        self.store.insert_observation(&obs).await?;
        Ok(())
    }
}

fn log_source_error(source: &str, target: &Target, route: &EgressRoute, e: &SourceError) {
    warn!(
        coin = %target.coin_id,
        vendor = %target.vendor_id,
        source,
        route = route.name(),
        "Extraction failed: {}",
        truncate_msg(&e.to_string(), LOG_MSG_MAX_CHARS)
    );
}
