//! Aggregation pass: loads history from the store, derives the per-coin
//! views and writes the polled artifacts. Nothing derived is cached; every
//! call recomputes from the store and an explicit `now`.

pub mod artifacts;
pub mod view;
pub mod writer;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::aggregator::{daily_rollups, floor_window, DailyRollup};
use crate::catalog::Catalog;
use crate::config::{ConsensusThresholds, WindowConfig, LOG_MSG_MAX_CHARS};
use crate::db::{Match, Store};
use crate::error::{truncate_msg, AppError, Result};
use crate::resolver::PricePoint;
use crate::types::round2;

pub use artifacts::{CoinLatest, Index};
pub use view::{build_coin_view, Backfill, CoinView};
pub use writer::ArtifactWriter;

/// One coin ready to publish.
#[derive(Debug, Clone)]
pub struct CoinExport {
    pub coin_id: String,
    pub view: CoinView,
    pub daily: Vec<DailyRollup>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub coins: usize,
    pub snapshots_written: usize,
    pub rows_backfilled: u64,
}

#[derive(Clone)]
pub struct Exporter {
    store: Store,
    catalog: Arc<Catalog>,
    windows: WindowConfig,
    thresholds: ConsensusThresholds,
}

impl Exporter {
    pub fn new(
        store: Store,
        catalog: Arc<Catalog>,
        windows: WindowConfig,
        thresholds: ConsensusThresholds,
    ) -> Self {
        Self { store, catalog, windows, thresholds }
    }

    pub async fn coin_view(&self, coin_id: &str, now: DateTime<Utc>) -> Result<Option<CoinView>> {
        if self.catalog.coin(coin_id).is_none() {
            return Err(AppError::UnknownCoin(coin_id.to_string()));
        }
        let from = now - self.windows.history_span();
        let history = self.store.observations_between(coin_id, None, from, now).await?;
        let mut view = build_coin_view(
            &history,
            &self.catalog.vendors_for(coin_id),
            now,
            &self.windows,
            &self.thresholds,
        );

        // An unavailable vendor's last in-stock price may predate the loaded span.
        if let Some(view) = view.as_mut() {
            for (vendor, entry) in view.latest.vendors.iter_mut() {
                if entry.in_stock || entry.last_in_stock.is_some() {
                    continue;
                }
                let older = self
                    .store
                    .most_recent_matching(coin_id, vendor, now, Match::InStockPriced)
                    .await?;
                entry.last_in_stock = older.and_then(|o| {
                    o.price.map(|price| PricePoint { price: round2(price), at: o.scraped_at })
                });
            }
        }
        Ok(view)
    }

    /// Daily rollups over the configured number of UTC days ending today.
    pub async fn coin_daily(&self, coin_id: &str, now: DateTime<Utc>) -> Result<Vec<DailyRollup>> {
        if self.catalog.coin(coin_id).is_none() {
            return Err(AppError::UnknownCoin(coin_id.to_string()));
        }
        let today = floor_window(now, Duration::days(1));
        let from = today - Duration::days(i64::from(self.windows.daily_days.saturating_sub(1)));
        let history = self.store.observations_between(coin_id, None, from, now).await?;
        Ok(daily_rollups(&history, self.windows.width))
    }

    /// Every coin with something to publish, in catalog order.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<Vec<CoinExport>> {
        let mut coins = Vec::new();
        for coin_id in self.catalog.coin_ids() {
            let Some(view) = self.coin_view(&coin_id, now).await? else {
                debug!(coin = %coin_id, "No data for coin, skipping");
                continue;
            };
            let daily = self.coin_daily(&coin_id, now).await?;
            coins.push(CoinExport { coin_id, view, daily });
        }
        Ok(coins)
    }

    pub fn index(&self, coins: &[CoinExport], now: DateTime<Utc>) -> Index {
        Index {
            generated_at: now,
            latest_window: coins.iter().map(|c| c.view.latest.window_start).max(),
            coin_count: coins.len(),
            coins: coins.iter().map(|c| c.coin_id.clone()).collect(),
        }
    }

    /// Full export: artifacts for every coin with data, then the index.
    /// Writes nothing at all when no coin has data.
    pub async fn run(&self, now: DateTime<Utc>, writer: &ArtifactWriter) -> Result<ExportSummary> {
        let coins = self.collect(now).await?;
        if coins.is_empty() {
            warn!("No coin has data to export, leaving artifacts untouched");
            return Ok(ExportSummary::default());
        }

        let mut summary = ExportSummary { coins: coins.len(), ..Default::default() };
        for coin in &coins {
            summary.rows_backfilled += self.apply_backfills(&coin.coin_id, &coin.view.backfills).await;

            writer.write_latest(&coin.coin_id, &coin.view.latest).await?;
            writer.write_daily(&coin.coin_id, &coin.daily).await?;
            if writer.write_snapshot(&coin.coin_id, &coin.view.latest).await? {
                summary.snapshots_written += 1;
            }
            let name = self.catalog.coin(&coin.coin_id).map(|c| c.name.as_str());
            info!(
                coin = %coin.coin_id,
                name = name.unwrap_or_default(),
                vendors = coin.view.latest.vendors.len(),
                median = ?coin.view.latest.median_price,
                "Exported coin"
            );
        }

        writer.write_index(&self.index(&coins, now)).await?;
        info!(
            coins = summary.coins,
            snapshots = summary.snapshots_written,
            backfilled = summary.rows_backfilled,
            out = %writer.root().display(),
            "Export complete"
        );
        Ok(summary)
    }

    /// Backfill failures are logged and skipped; the write is retried on the
    /// next export.
    async fn apply_backfills(&self, coin_id: &str, backfills: &[Backfill]) -> u64 {
        let mut updated = 0;
        for b in backfills {
            match self
                .store
                .backfill_confidence(coin_id, &b.vendor_id, b.window_start, b.confidence)
                .await
            {
                Ok(n) => updated += n,
                Err(e) => warn!(
                    coin = %coin_id,
                    vendor = %b.vendor_id,
                    "Confidence backfill failed: {}",
                    truncate_msg(&e.to_string(), LOG_MSG_MAX_CHARS)
                ),
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::SAMPLE;
    use crate::types::{Method, Observation, Tier};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 7, 0).unwrap()
    }

    fn obs(coin: &str, vendor: &str, ago_min: i64, method: Method, price: Option<f64>, in_stock: bool) -> Observation {
        let at = now() - Duration::minutes(ago_min);
        let window = floor_window(at, Duration::minutes(15));
        Observation::new(coin, vendor, "a1", at, window, method, price, in_stock)
    }

    async fn exporter() -> (Exporter, Store) {
        let store = Store::in_memory().await.unwrap();
        let catalog = Arc::new(Catalog::from_json(SAMPLE).unwrap());
        let exporter = Exporter::new(
            store.clone(),
            catalog,
            WindowConfig::default(),
            ConsensusThresholds::default(),
        );
        (exporter, store)
    }

    #[tokio::test]
    async fn unknown_coin_is_an_error() {
        let (exporter, _) = exporter().await;
        assert!(matches!(
            exporter.coin_view("nope", now()).await,
            Err(AppError::UnknownCoin(_))
        ));
    }

    #[tokio::test]
    async fn empty_store_writes_nothing() {
        let (exporter, _) = exporter().await;
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let summary = exporter.run(now(), &writer).await.unwrap();
        assert_eq!(summary.coins, 0);
        assert!(!dir.path().join("index.json").exists());
    }

    #[tokio::test]
    async fn export_writes_artifacts_and_backfills_once() {
        let (exporter, store) = exporter().await;
        store.insert_observation(&obs("ase", "apmex", 2, Method::Primary, Some(100.0), true)).await.unwrap();
        store
            .insert_observation(
                &obs("ase", "apmex", 2, Method::Verification, Some(99.0), true)
                    .with_verification_meta(Some(Tier::High), Some(true)),
            )
            .await
            .unwrap();
        store.insert_observation(&obs("ase", "jmb", 3, Method::Primary, Some(101.0), true)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let first = exporter.run(now(), &writer).await.unwrap();
        assert_eq!(first.coins, 1);
        assert_eq!(first.snapshots_written, 1);
        assert_eq!(first.rows_backfilled, 2);

        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index["coin_count"], 1);
        assert_eq!(index["coins"][0], "ase");
        assert!(dir.path().join("ase/daily.json").exists());

        let latest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("ase/latest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(latest["vendors"]["apmex"]["price"], 100.0);
        assert_eq!(latest["vendors"]["apmex"]["confidence"], 99);

        let second = exporter.run(now(), &writer).await.unwrap();
        assert_eq!(second.rows_backfilled, 0);
        assert_eq!(second.snapshots_written, 0);

        let rows = store.observations_between("ase", Some("apmex"), now() - Duration::hours(1), now()).await.unwrap();
        let primary = rows.iter().find(|o| o.method == Method::Primary).unwrap();
        let verification = rows.iter().find(|o| o.method == Method::Verification).unwrap();
        assert_eq!(primary.confidence, Some(99));
        assert_eq!(verification.confidence, None);
    }

    #[tokio::test]
    async fn verification_sourced_price_leaves_failed_primary_row_alone() {
        let (exporter, store) = exporter().await;
        store.insert_observation(&obs("ase", "apmex", 2, Method::Primary, None, true)).await.unwrap();
        store
            .insert_observation(
                &obs("ase", "apmex", 2, Method::Verification, Some(36.0), true)
                    .with_verification_meta(Some(Tier::High), None),
            )
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let summary = exporter.run(now(), &ArtifactWriter::new(dir.path())).await.unwrap();
        assert_eq!(summary.coins, 1);
        assert_eq!(summary.rows_backfilled, 0);

        let rows = store.observations_between("ase", Some("apmex"), now() - Duration::hours(1), now()).await.unwrap();
        assert!(rows.iter().all(|o| o.confidence.is_none()));
    }

    #[tokio::test]
    async fn unavailable_vendor_reports_in_stock_price_older_than_span() {
        let (exporter, store) = exporter().await;
        store.insert_observation(&obs("ase", "apmex", 60 * 24 * 5, Method::Primary, Some(31.0), true)).await.unwrap();
        store.insert_observation(&obs("ase", "apmex", 2, Method::Primary, None, false)).await.unwrap();

        let view = exporter.coin_view("ase", now()).await.unwrap().unwrap();
        let apmex = &view.latest.vendors["apmex"];
        assert!(!apmex.in_stock);
        assert_eq!(apmex.price, None);
        assert_eq!(apmex.last_in_stock.map(|p| p.price), Some(31.0));
    }

    #[tokio::test]
    async fn repeated_collection_is_identical() {
        let (exporter, store) = exporter().await;
        store.insert_observation(&obs("ase", "apmex", 200, Method::Primary, Some(35.0), true)).await.unwrap();
        store.insert_observation(&obs("ase", "apmex", 2, Method::Primary, None, true)).await.unwrap();
        store.insert_observation(&obs("ase", "jmb", 2, Method::Primary, Some(34.5), true)).await.unwrap();
        store.insert_observation(&obs("age-half", "apmex", 30, Method::RenderedFallback, Some(1450.0), true)).await.unwrap();

        let a = exporter.collect(now()).await.unwrap();
        for c in &a {
            exporter.apply_backfills(&c.coin_id, &c.view.backfills).await;
        }
        let b = exporter.collect(now()).await.unwrap();

        let render = |coins: &[CoinExport]| {
            coins
                .iter()
                .map(|c| serde_json::to_string(&(&c.view.latest, &c.daily)).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(render(&a), render(&b));
        assert_eq!(a.len(), 2);
        assert!(a[0].view.latest.vendors["apmex"].stale);
    }
}
