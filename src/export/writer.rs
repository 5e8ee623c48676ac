use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::DailyRollup;
use crate::error::Result;
use crate::export::artifacts::{CoinLatest, Index};

/// Writes artifacts under a root directory. Mutable artifacts are replaced
/// atomically; per-window snapshots are written once and never replaced.
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write_index(&self, index: &Index) -> Result<()> {
        write_json_atomic(&self.root.join("index.json"), index).await
    }

    pub async fn write_latest(&self, coin_id: &str, latest: &CoinLatest) -> Result<()> {
        write_json_atomic(&self.root.join(coin_id).join("latest.json"), latest).await
    }

    pub async fn write_daily(&self, coin_id: &str, daily: &[DailyRollup]) -> Result<()> {
        write_json_atomic(&self.root.join(coin_id).join("daily.json"), &daily).await
    }

    /// Returns `false` when the snapshot for this window already exists.
    pub async fn write_snapshot(&self, coin_id: &str, latest: &CoinLatest) -> Result<bool> {
        let path = self.snapshot_path(coin_id, latest.window_start);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        let tmp = temp_path(&path);
        write_file(&tmp, latest).await?;
        // hard_link refuses to replace an existing file, so a concurrent
        // exporter that got there first keeps its snapshot.
        let linked = match tokio::fs::hard_link(&tmp, &path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        };
        tokio::fs::remove_file(&tmp).await?;
        Ok(linked)
    }

    pub fn snapshot_path(&self, coin_id: &str, window: DateTime<Utc>) -> PathBuf {
        self.root
            .join(coin_id)
            .join("windows")
            .join(window.format("%Y").to_string())
            .join(window.format("%m").to_string())
            .join(window.format("%d").to_string())
            .join(format!("{}.json", window.format("%H%M")))
    }
}

async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp = temp_path(path);
    write_file(&tmp, value).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Sibling temp file, unique per process so concurrent exporters never share one.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn latest(median: f64) -> CoinLatest {
        CoinLatest {
            window_start: Utc.with_ymd_and_hms(2026, 3, 1, 12, 15, 0).unwrap(),
            median_price: Some(median),
            lowest_price: Some(median),
            vendors: BTreeMap::new(),
            windows_24h: Vec::new(),
        }
    }

    #[test]
    fn snapshot_path_is_date_partitioned() {
        let writer = ArtifactWriter::new("/out");
        let path = writer.snapshot_path("ase", Utc.with_ymd_and_hms(2026, 3, 1, 9, 45, 0).unwrap());
        assert_eq!(path, PathBuf::from("/out/ase/windows/2026/03/01/0945.json"));
    }

    #[tokio::test]
    async fn latest_is_replaced_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        writer.write_latest("ase", &latest(35.0)).await.unwrap();
        writer.write_latest("ase", &latest(36.0)).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("ase/latest.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["median_price"], 36.0);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("ase"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        assert!(writer.write_snapshot("ase", &latest(35.0)).await.unwrap());
        assert!(!writer.write_snapshot("ase", &latest(99.0)).await.unwrap());

        let path = writer.snapshot_path("ase", latest(0.0).window_start);
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["median_price"], 35.0);
    }
}
