//! Tracker Settings
//!
//! Settings stored as JSON in /etc/cachemark/settings.json (or the per-user
//! config directory). Every field has a default, so a missing file or a
//! partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::constants::{limits, paths, probes, timing};
use crate::error::{CacheMarkError, Result};

/// Runtime settings of the tracker daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Probe manifest (`packs.json`); its length defines N
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    /// Durable signature store
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Unix socket the daemon listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Delay between detection challenges for one identity
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Randomize challenge issue order per session
    #[serde(default)]
    pub shuffle_challenges: bool,

    /// URL used for detection challenges; must never be fetchable
    #[serde(default = "default_unreachable_url")]
    pub unreachable_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(paths::CONFIG_DIR).join(paths::MANIFEST_FILE)
}

fn default_store_path() -> PathBuf {
    PathBuf::from(paths::STORE_PATH)
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(paths::SOCKET_PATH)
}

fn default_pacing_ms() -> u64 {
    timing::DEFAULT_PACING_MS
}

fn default_unreachable_url() -> String {
    probes::UNREACHABLE_URL.to_string()
}

fn default_max_connections() -> usize {
    limits::DEFAULT_MAX_CONNECTIONS
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            store_path: default_store_path(),
            socket_path: default_socket_path(),
            pacing_ms: default_pacing_ms(),
            shuffle_challenges: false,
            unreachable_url: default_unreachable_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl TrackerSettings {
    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            CacheMarkError::config(format!("Failed to read settings file: {}", e))
        })?;

        let settings: Self = serde_json::from_str(&content).map_err(|e| {
            CacheMarkError::config(format!("Failed to parse settings JSON: {}", e))
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load from the system path, falling back to the user config directory
    pub fn load_default() -> Result<Self> {
        Self::load(&paths::resolve_settings_path())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pacing_ms > timing::MAX_PACING_MS {
            return Err(CacheMarkError::invalid_config(
                "pacing_ms",
                format!("{} exceeds maximum {}", self.pacing_ms, timing::MAX_PACING_MS),
            ));
        }

        if self.max_connections == 0 || self.max_connections > limits::MAX_CONNECTIONS_CEILING {
            return Err(CacheMarkError::invalid_config(
                "max_connections",
                format!("must be 1-{}", limits::MAX_CONNECTIONS_CEILING),
            ));
        }

        let url = self.unreachable_url.trim();
        if url.is_empty() || !url.contains("://") {
            return Err(CacheMarkError::invalid_config(
                "unreachable_url",
                "must be an absolute URL",
            ));
        }

        for (field, path) in [
            ("manifest_path", &self.manifest_path),
            ("store_path", &self.store_path),
            ("socket_path", &self.socket_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(CacheMarkError::invalid_config(field, "must not be empty"));
            }
        }

        Ok(())
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = TrackerSettings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, TrackerSettings::default());
        assert_eq!(settings.pacing(), Duration::from_millis(50));
        assert!(!settings.shuffle_challenges);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"pacing_ms": 0, "shuffle_challenges": true}"#).unwrap();
        let settings = TrackerSettings::load(&path).unwrap();
        assert_eq!(settings.pacing_ms, 0);
        assert!(settings.shuffle_challenges);
        assert_eq!(settings.unreachable_url, probes::UNREACHABLE_URL);
        assert_eq!(settings.store_path, PathBuf::from(paths::STORE_PATH));
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        let mut settings = TrackerSettings::default();
        settings.pacing_ms = timing::MAX_PACING_MS + 1;
        assert!(settings.validate().unwrap_err().is_fatal());

        let mut settings = TrackerSettings::default();
        settings.max_connections = 0;
        assert!(settings.validate().is_err());

        let mut settings = TrackerSettings::default();
        settings.unreachable_url = "nowhere".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2").unwrap();
        assert!(TrackerSettings::load(&path).unwrap_err().is_fatal());
    }
}
