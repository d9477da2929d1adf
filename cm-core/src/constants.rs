//! Constants and configuration defaults for cachemark
//!
//! Centralizes magic numbers, paths, and configuration defaults.
//! Add new values here instead of scattering literals across modules.

use std::time::Duration;

/// System paths
pub mod paths {
    use std::path::PathBuf;

    /// System configuration directory
    pub const CONFIG_DIR: &str = "/etc/cachemark";

    /// Settings file name (inside the configuration directory)
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Probe manifest published by the asset layer
    pub const MANIFEST_FILE: &str = "packs.json";

    /// Durable signature store location
    pub const STORE_PATH: &str = "/var/lib/cachemark/signatures.json";

    /// Daemon socket location
    pub const SOCKET_PATH: &str = "/run/cachemark.sock";

    /// Per-user configuration directory, used when no system config exists
    pub fn user_config_dir() -> Option<PathBuf> {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("cachemark"));
        }
        dirs::config_dir().map(|p| p.join("cachemark"))
    }

    /// Resolve the settings file: system path if present, else the user path
    pub fn resolve_settings_path() -> PathBuf {
        let system = PathBuf::from(CONFIG_DIR).join(SETTINGS_FILE);
        if system.exists() {
            return system;
        }
        user_config_dir()
            .map(|d| d.join(SETTINGS_FILE))
            .unwrap_or(system)
    }
}

/// Probe protocol parameters
pub mod probes {
    /// Upper bound on N: a fingerprint must fit in a u64
    pub const MAX_PROBES: usize = 64;

    /// Endpoint that can never be fetched; detection relies on the client cache only
    pub const UNREACHABLE_URL: &str = "http://127.0.0.1:0";
}

/// Durable store parameters
pub mod store {
    /// Current schema version of the signature file
    pub const SCHEMA_VERSION: u32 = 1;

    /// Maximum store size accepted on load (10 MB)
    pub const MAX_STORE_SIZE: u64 = 10 * 1024 * 1024;

    /// Maximum manifest size accepted on load (1 MB)
    pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;
}

/// Timing defaults
pub mod timing {
    use super::*;

    /// Default delay between detection challenges for one identity
    pub const DEFAULT_PACING_MS: u64 = 50;

    /// Largest accepted pacing delay
    pub const MAX_PACING_MS: u64 = 5_000;

    /// Write timeout for pushing messages to a transport connection
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Client-side timeout for admin queries against the daemon
    pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Server limits
pub mod limits {
    /// Default maximum concurrent daemon connections
    pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

    /// Hard ceiling for the configurable connection limit
    pub const MAX_CONNECTIONS_CEILING: usize = 1024;
}
