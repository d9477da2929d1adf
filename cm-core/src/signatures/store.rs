//! On-disk signature file
//!
//! The whole index is one JSON document, rewritten atomically on every
//! mutation. Anything unreadable is discarded and the index starts empty.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::constants::store::{MAX_STORE_SIZE, SCHEMA_VERSION};
use crate::error::{CacheMarkError, Result};
use crate::probe::Fingerprint;

/// Durable record of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSignature {
    pub identity: String,
    pub display_name: String,
    pub fingerprints: BTreeSet<u64>,
    /// Last time a fingerprint was recorded (ms)
    pub last_updated: i64,
    /// Last time the identity started a session (ms)
    #[serde(default)]
    pub last_seen: i64,
}

/// Root of the signature file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    pub version: u32,
    /// Probe count the values were taken with
    #[serde(default)]
    pub probe_count: usize,
    pub signatures: BTreeMap<String, StoredSignature>,
}

impl SignatureFile {
    pub fn empty(probe_count: usize) -> Self {
        Self {
            version: SCHEMA_VERSION,
            probe_count,
            signatures: BTreeMap::new(),
        }
    }

    /// Load the file at `path`, or an empty file if it is missing or unusable
    pub fn load_or_init(path: &Path, probe_count: usize) -> Self {
        match Self::try_load(path, probe_count) {
            Ok(Some(file)) => {
                info!(
                    path = %path.display(),
                    identities = file.signatures.len(),
                    "Loaded signature store"
                );
                file
            }
            Ok(None) => {
                debug!(path = %path.display(), "No signature store found, starting empty");
                Self::empty(probe_count)
            }
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "Discarding signature store");
                Self::empty(probe_count)
            }
        }
    }

    /// Probe count recorded in an existing store file
    ///
    /// Fails for anything `load_or_init` would discard, so a read-only caller
    /// can tell an unusable store from an empty one.
    pub fn read_probe_count(path: &Path) -> Result<usize> {
        let metadata = fs::metadata(path).map_err(|source| CacheMarkError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() > MAX_STORE_SIZE {
            return Err(CacheMarkError::FileTooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                max_size: MAX_STORE_SIZE,
            });
        }
        let content = fs::read_to_string(path).map_err(|source| CacheMarkError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: Self = serde_json::from_str(&content)?;

        if file.version != SCHEMA_VERSION {
            return Err(CacheMarkError::config(format!(
                "{}: schema version {} does not match {}",
                path.display(),
                file.version,
                SCHEMA_VERSION
            )));
        }
        file.check_consistency()
            .map_err(|reason| CacheMarkError::config(format!("{}: {}", path.display(), reason)))?;
        Ok(file.probe_count)
    }

    fn try_load(path: &Path, probe_count: usize) -> std::result::Result<Option<Self>, String> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read metadata: {}", e)),
        };

        if metadata.len() > MAX_STORE_SIZE {
            return Err(format!(
                "file too large: {} bytes (max {})",
                metadata.len(),
                MAX_STORE_SIZE
            ));
        }

        let content =
            fs::read_to_string(path).map_err(|e| format!("failed to read file: {}", e))?;
        let file: Self =
            serde_json::from_str(&content).map_err(|e| format!("corrupt file: {}", e))?;

        if file.version != SCHEMA_VERSION {
            return Err(format!(
                "schema version {} does not match {}",
                file.version, SCHEMA_VERSION
            ));
        }
        if file.probe_count != probe_count {
            return Err(format!(
                "probe count {} does not match {}",
                file.probe_count, probe_count
            ));
        }
        file.check_consistency()?;

        Ok(Some(file))
    }

    fn check_consistency(&self) -> std::result::Result<(), String> {
        for (key, record) in &self.signatures {
            if *key != record.identity {
                return Err(format!("record key {} holds identity {}", key, record.identity));
            }
            if let Some(bad) = record
                .fingerprints
                .iter()
                .find(|v| !Fingerprint::from_bits(**v).fits(self.probe_count))
            {
                return Err(format!("value {} out of range for identity {}", bad, key));
            }
        }
        Ok(())
    }

    /// Atomically replace the file at `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| CacheMarkError::FileWrite {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("json.tmp");
        let write_err = |source| CacheMarkError::FileWrite {
            path: temp_path.clone(),
            source,
        };

        let mut file = fs::File::create(&temp_path).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|source| CacheMarkError::FileWrite {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), identities = self.signatures.len(), "Saved signature store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(probe_count: usize) -> SignatureFile {
        let mut file = SignatureFile::empty(probe_count);
        file.signatures.insert(
            "a".to_string(),
            StoredSignature {
                identity: "a".to_string(),
                display_name: "Alice".to_string(),
                fingerprints: [5u64, 9].into_iter().collect(),
                last_updated: 100,
                last_seen: 200,
            },
        );
        file
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = SignatureFile::load_or_init(&dir.path().join("none.json"), 8);
        assert!(file.signatures.is_empty());
        assert_eq!(file.probe_count, 8);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("signatures.json");
        let file = sample(8);
        file.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(SignatureFile::load_or_init(&path, 8), file);
    }

    #[test]
    fn test_read_probe_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");
        sample(24).save(&path).unwrap();
        assert_eq!(SignatureFile::read_probe_count(&path).unwrap(), 24);
        assert!(SignatureFile::read_probe_count(&dir.path().join("none.json")).is_err());
    }

    #[test]
    fn test_read_probe_count_rejects_discarded_stores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");

        let mut newer = sample(8);
        newer.version = SCHEMA_VERSION + 1;
        newer.save(&path).unwrap();
        assert!(matches!(
            SignatureFile::read_probe_count(&path),
            Err(CacheMarkError::Config(_))
        ));

        let mut out_of_range = sample(4);
        out_of_range
            .signatures
            .get_mut("a")
            .unwrap()
            .fingerprints
            .insert(1 << 4);
        out_of_range.save(&path).unwrap();
        assert!(matches!(
            SignatureFile::read_probe_count(&path),
            Err(CacheMarkError::Config(_))
        ));
    }

    #[test]
    fn test_layout_uses_camel_case_fields() {
        let json = serde_json::to_value(sample(8)).unwrap();
        let record = &json["signatures"]["a"];
        assert_eq!(record["displayName"], "Alice");
        assert_eq!(record["lastUpdated"], 100);
        assert_eq!(record["fingerprints"], serde_json::json!([5, 9]));
        assert_eq!(json["version"], SCHEMA_VERSION);
    }

    #[test]
    fn test_record_without_last_seen_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");
        fs::write(
            &path,
            r#"{"version":1,"probe_count":8,"signatures":{"a":{"identity":"a","displayName":"A","fingerprints":[3],"lastUpdated":1}}}"#,
        )
        .unwrap();
        let file = SignatureFile::load_or_init(&path, 8);
        assert_eq!(file.signatures["a"].last_seen, 0);
    }

    #[test]
    fn test_version_mismatch_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");
        let mut file = sample(8);
        file.version = SCHEMA_VERSION + 1;
        file.save(&path).unwrap();
        assert!(SignatureFile::load_or_init(&path, 8).signatures.is_empty());
    }

    #[test]
    fn test_probe_count_mismatch_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");
        sample(8).save(&path).unwrap();
        let file = SignatureFile::load_or_init(&path, 16);
        assert!(file.signatures.is_empty());
        assert_eq!(file.probe_count, 16);
    }

    #[test]
    fn test_corrupt_file_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(SignatureFile::load_or_init(&path, 8).signatures.is_empty());
    }

    #[test]
    fn test_out_of_range_value_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signatures.json");
        let mut file = sample(4);
        file.signatures
            .get_mut("a")
            .unwrap()
            .fingerprints
            .insert(1 << 4);
        file.save(&path).unwrap();
        assert!(SignatureFile::load_or_init(&path, 4).signatures.is_empty());
    }

    #[test]
    fn test_save_into_missing_directory_target_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let result = sample(8).save(&blocker.join("signatures.json"));
        assert!(matches!(result, Err(CacheMarkError::FileWrite { .. })));
    }
}
