//! Unified error handling for cachemark
//!
//! This crate provides a single error type used across the tracker core, the
//! daemon and the admin CLI. It uses thiserror for the Display and Error impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using CacheMarkError
pub type Result<T> = std::result::Result<T, CacheMarkError>;

/// Unified error type for all cachemark operations
#[derive(thiserror::Error, Debug)]
pub enum CacheMarkError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Configuration Errors (fatal at startup)
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Invalid probe count {count} (must be 1-{max})")]
    InvalidProbeCount {
        count: usize,
        max: usize,
    },

    // ============================================================================
    // Probe Content Errors
    // ============================================================================
    #[error("Probe content unavailable for probe {probe}: {reason}")]
    ContentUnavailable {
        probe: usize,
        reason: String,
    },

    // ============================================================================
    // Transport and IPC Errors
    // ============================================================================
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Daemon not available")]
    DaemonNotAvailable,

    #[error("Daemon connection failed: {0}")]
    DaemonConnection(String),

    #[error("Daemon response error: {0}")]
    DaemonResponse(String),

    #[error("IPC protocol error: {0}")]
    IpcProtocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    // ============================================================================
    // Lookup Errors
    // ============================================================================
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl CacheMarkError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a content error for a probe index
    pub fn content_unavailable(probe: usize, reason: impl Into<String>) -> Self {
        Self::ContentUnavailable {
            probe,
            reason: reason.into(),
        }
    }

    /// Create a transport error from a string
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether this error must abort startup rather than be logged and survived
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidConfig { .. } | Self::InvalidProbeCount { .. }
        )
    }
}

// Allow converting from String to CacheMarkError
impl From<String> for CacheMarkError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to CacheMarkError
impl From<&str> for CacheMarkError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
