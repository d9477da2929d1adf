//! Probe content published by the asset layer
//!
//! The tracker never looks inside probe blobs. It only needs, for each probe
//! index, where the blob lives, the stable id the client caches it under, and
//! an opaque digest to pass through.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::constants::probes::MAX_PROBES;
use crate::constants::store::MAX_MANIFEST_SIZE;
use crate::error::{CacheMarkError, Result};

/// One probe blob as listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAsset {
    pub url: String,
    /// Identity the client caches the content under
    pub uuid: String,
    /// Opaque content digest
    #[serde(rename = "hash")]
    pub digest: String,
}

/// Source of probe content for the marking round
pub trait ContentStore: Send + Sync {
    /// N, fixed for the lifetime of the store
    fn probe_count(&self) -> usize;

    /// Stable asset for probe `index`
    fn asset(&self, index: usize) -> Result<ProbeAsset>;
}

/// Content store backed by a `packs.json` manifest
#[derive(Debug, Clone)]
pub struct ManifestContentStore {
    assets: Vec<ProbeAsset>,
}

impl ManifestContentStore {
    /// Validate and wrap a list of assets; position i is probe i
    pub fn new(assets: Vec<ProbeAsset>) -> Result<Self> {
        if assets.is_empty() {
            return Err(CacheMarkError::config("probe manifest is empty"));
        }
        if assets.len() > MAX_PROBES {
            return Err(CacheMarkError::InvalidProbeCount {
                count: assets.len(),
                max: MAX_PROBES,
            });
        }

        let mut seen = HashSet::new();
        for (i, asset) in assets.iter().enumerate() {
            if asset.url.trim().is_empty() {
                return Err(CacheMarkError::invalid_config(
                    format!("probes[{}].url", i),
                    "must not be empty",
                ));
            }
            if asset.uuid.trim().is_empty() {
                return Err(CacheMarkError::invalid_config(
                    format!("probes[{}].uuid", i),
                    "must not be empty",
                ));
            }
            if !seen.insert(asset.uuid.as_str()) {
                return Err(CacheMarkError::invalid_config(
                    format!("probes[{}].uuid", i),
                    format!("duplicate probe id {}", asset.uuid),
                ));
            }
        }

        Ok(Self { assets })
    }

    /// Load a manifest file; any problem is a configuration error
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|source| CacheMarkError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() > MAX_MANIFEST_SIZE {
            return Err(CacheMarkError::config(format!(
                "probe manifest {} too large: {} bytes (max {})",
                path.display(),
                metadata.len(),
                MAX_MANIFEST_SIZE
            )));
        }

        let content = fs::read_to_string(path).map_err(|source| CacheMarkError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let assets: Vec<ProbeAsset> = serde_json::from_str(&content).map_err(|e| {
            CacheMarkError::config(format!("invalid probe manifest {}: {}", path.display(), e))
        })?;

        let store = Self::new(assets)?;
        info!(path = %path.display(), probes = store.assets.len(), "Loaded probe manifest");
        Ok(store)
    }
}

impl ContentStore for ManifestContentStore {
    fn probe_count(&self) -> usize {
        self.assets.len()
    }

    fn asset(&self, index: usize) -> Result<ProbeAsset> {
        self.assets
            .get(index)
            .cloned()
            .ok_or_else(|| CacheMarkError::content_unavailable(index, "no manifest entry"))
    }
}
