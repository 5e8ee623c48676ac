//! Fixed item catalog: coins, vendors, and the listing URL for each pair.
//! Read-only here; editing the catalog happens elsewhere.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::types::Target;

#[derive(Debug, Clone, Deserialize)]
pub struct MetalRange {
    pub min_per_oz: f64,
    pub max_per_oz: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Coin {
    pub id: String,
    pub name: String,
    pub metal: String,
    pub weight_oz: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub coin_id: String,
    pub vendor_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub metals: BTreeMap<String, MetalRange>,
    pub coins: Vec<Coin>,
    pub vendors: Vec<Vendor>,
    pub targets: Vec<Listing>,
}

impl Catalog {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let vendor_ids: BTreeSet<&str> = self.vendors.iter().map(|v| v.id.as_str()).collect();
        for coin in &self.coins {
            let Some(range) = self.metals.get(&coin.metal) else {
                return Err(AppError::Catalog(format!(
                    "coin {} references unknown metal {}",
                    coin.id, coin.metal
                )));
            };
            if coin.weight_oz <= 0.0 || range.min_per_oz > range.max_per_oz {
                return Err(AppError::Catalog(format!(
                    "coin {} has an empty plausible price range",
                    coin.id
                )));
            }
        }
        for listing in &self.targets {
            if self.coin(&listing.coin_id).is_none() {
                return Err(AppError::Catalog(format!(
                    "target references unknown coin {}",
                    listing.coin_id
                )));
            }
            if !vendor_ids.contains(listing.vendor_id.as_str()) {
                return Err(AppError::Catalog(format!(
                    "target references unknown vendor {}",
                    listing.vendor_id
                )));
            }
        }
        Ok(())
    }

    pub fn coin(&self, coin_id: &str) -> Option<&Coin> {
        self.coins.iter().find(|c| c.id == coin_id)
    }

    /// Weight-scaled plausible range for one coin.
    pub fn price_range(&self, coin_id: &str) -> Option<(f64, f64)> {
        let coin = self.coin(coin_id)?;
        let range = self.metals.get(&coin.metal)?;
        Some((
            range.min_per_oz * coin.weight_oz,
            range.max_per_oz * coin.weight_oz,
        ))
    }

    /// Every listing resolved into an acquisition target.
    pub fn acquisition_targets(&self) -> Vec<Target> {
        self.targets
            .iter()
            .filter_map(|l| {
                let (min_price, max_price) = self.price_range(&l.coin_id)?;
                Some(Target {
                    coin_id: l.coin_id.clone(),
                    vendor_id: l.vendor_id.clone(),
                    url: l.url.clone(),
                    min_price,
                    max_price,
                })
            })
            .collect()
    }

    /// Vendors expected to carry a coin, in catalog order without duplicates.
    pub fn vendors_for(&self, coin_id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.targets
            .iter()
            .filter(|l| l.coin_id == coin_id)
            .filter(|l| seen.insert(l.vendor_id.clone()))
            .map(|l| l.vendor_id.clone())
            .collect()
    }

    pub fn coin_ids(&self) -> Vec<String> {
        self.coins.iter().map(|c| c.id.clone()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "metals": {
            "silver": { "min_per_oz": 20.0, "max_per_oz": 150.0 },
            "gold": { "min_per_oz": 1500.0, "max_per_oz": 6000.0 }
        },
        "coins": [
            { "id": "ase", "name": "American Silver Eagle", "metal": "silver", "weight_oz": 1.0 },
            { "id": "age-half", "name": "American Gold Eagle 1/2 oz", "metal": "gold", "weight_oz": 0.5 }
        ],
        "vendors": [
            { "id": "apmex", "name": "APMEX" },
            { "id": "jmb", "name": "JM Bullion" }
        ],
        "targets": [
            { "coin_id": "ase", "vendor_id": "apmex", "url": "https://apmex.test/ase" },
            { "coin_id": "ase", "vendor_id": "jmb", "url": "https://jmb.test/ase" },
            { "coin_id": "age-half", "vendor_id": "apmex", "url": "https://apmex.test/age" }
        ]
    }"#;

    #[test]
    fn ranges_scale_with_weight() {
        let c = Catalog::from_json(SAMPLE).unwrap();
        assert_eq!(c.price_range("ase"), Some((20.0, 150.0)));
        assert_eq!(c.price_range("age-half"), Some((750.0, 3000.0)));
    }

    #[test]
    fn targets_carry_ranges() {
        let c = Catalog::from_json(SAMPLE).unwrap();
        let targets = c.acquisition_targets();
        assert_eq!(targets.len(), 3);
        let age = targets.iter().find(|t| t.coin_id == "age-half").unwrap();
        assert!(!age.is_plausible(45.0), "accessory-sized price must be rejected");
        assert!(age.is_plausible(1400.0));
    }

    #[test]
    fn vendors_for_coin() {
        let c = Catalog::from_json(SAMPLE).unwrap();
        assert_eq!(c.vendors_for("ase"), vec!["apmex", "jmb"]);
        assert!(c.vendors_for("unknown").is_empty());
    }

    #[test]
    fn unknown_vendor_reference_is_rejected() {
        let raw = SAMPLE.replace("\"vendor_id\": \"jmb\"", "\"vendor_id\": \"sdb\"");
        assert!(matches!(Catalog::from_json(&raw), Err(AppError::Catalog(_))));
    }

    #[test]
    fn unknown_metal_is_rejected() {
        let raw = SAMPLE.replace("\"metal\": \"gold\"", "\"metal\": \"platinum\"");
        assert!(matches!(Catalog::from_json(&raw), Err(AppError::Catalog(_))));
    }
}
