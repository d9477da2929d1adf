//! cachemark Core Library
//!
//! Recognizes a returning client device across account identities by reading
//! which probe blobs it already holds in its content cache.
//!
//! # Features
//!
//! - **Probe sessions**: per-identity detection state machine
//! - **Marking**: fresh ⌊N/2⌋-bit values planted into unseen devices
//! - **Signature index**: durable identity → fingerprint map with reverse lookup
//! - **Alt correlation**: single-hop correlation and canonical account pick
//!
//! # Module Structure
//!
//! - `probe/` - fingerprints, generator, session state machine
//! - `signatures/` - durable store and index
//! - `tracker` - session ownership and the two probe rounds
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cm_core::{IdentityId, ManifestContentStore, SignatureIndex, Tracker, TrackerOptions};
//!
//! let content = Arc::new(ManifestContentStore::load("packs.json".as_ref()).unwrap());
//! let index = Arc::new(SignatureIndex::load_or_init("signatures.json", 24).unwrap());
//! let tracker = Tracker::new(content, index, TrackerOptions::default()).unwrap();
//!
//! let started = tracker.session_start(&IdentityId::from("player-1"), "Steve").unwrap();
//! assert_eq!(started.challenges.len(), 24);
//! ```

// Grouped modules
pub mod probe;
pub mod signatures;

// Standalone modules
pub mod challenge;
pub mod constants;
pub mod content;
pub mod correlation;
pub mod daemon_client;
pub mod error;
pub mod identity;
pub mod settings;
pub mod time;
pub mod tracker;

// Re-export error types
pub use error::{CacheMarkError, Result};

pub use identity::IdentityId;

// Re-export probe types
pub use probe::{
    validate_probe_count, Fingerprint, FingerprintGenerator, IgnoreReason, ProbeOutcome,
    ProbeSession, ProbeUpdate, ProbeVector, SessionState,
};

// Re-export index types
pub use signatures::{
    IndexStats, IndexView, Observation, SignatureFile, SignatureIndex, SignatureRecord,
    StoredSignature,
};

pub use challenge::{detection_round, issue_all, marking_round, Challenge, ChallengeSink, Round};
pub use content::{ContentStore, ManifestContentStore, ProbeAsset};
pub use correlation::{AltAccount, AltCorrelator, AltReport};
pub use daemon_client::DaemonClient;
pub use settings::TrackerSettings;
pub use tracker::{ProbeProgress, SessionStarted, Tracker, TrackerOptions};
