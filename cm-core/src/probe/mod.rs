//! Probe rounds and per-session state
//!
//! A device is identified by which of the N probe blobs it already holds in
//! its content cache. Each probe is one bit:
//!
//! 1. **Detection round** - every probe is requested from an unreachable URL.
//!    The client can only answer HIT if the content is cached under that probe's
//!    identity, so the answers read the cache without changing it.
//! 2. **Marking round** - only for devices whose detection came back all MISS.
//!    A fresh value with ⌊N/2⌋ bits is generated and the probes for the set bits
//!    are downloaded for real, so the next detection round reads the value back.

mod fingerprint;
mod generator;
mod session;

pub use fingerprint::Fingerprint;
pub use generator::FingerprintGenerator;
pub use session::{IgnoreReason, ProbeOutcome, ProbeSession, ProbeUpdate, ProbeVector, SessionState};

use crate::constants::probes::MAX_PROBES;
use crate::error::{CacheMarkError, Result};

/// Check that a probe count is usable for the lifetime of the process
pub fn validate_probe_count(count: usize) -> Result<()> {
    if count == 0 || count > MAX_PROBES {
        return Err(CacheMarkError::InvalidProbeCount {
            count,
            max: MAX_PROBES,
        });
    }
    Ok(())
}
