//! Per-identity probe session state machine

use serde::{Deserialize, Serialize};

use super::{validate_probe_count, Fingerprint};
use crate::error::Result;
use crate::identity::IdentityId;
use crate::time::current_timestamp_ms;

/// Outcome of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    /// Waiting for the client's answer
    Pending,
    /// The client could not fetch the content (not cached)
    Miss,
    /// The client served the content from its cache
    Hit,
}

impl Default for ProbeOutcome {
    fn default() -> Self {
        Self::Pending
    }
}

impl From<cm_protocol::ProbeStatus> for ProbeOutcome {
    fn from(status: cm_protocol::ProbeStatus) -> Self {
        match status {
            cm_protocol::ProbeStatus::Hit => ProbeOutcome::Hit,
            cm_protocol::ProbeStatus::Miss => ProbeOutcome::Miss,
        }
    }
}

/// Lifecycle state of a session, derived from its vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No probe answered yet
    Pending,
    /// Some probes answered
    Partial,
    /// Every probe answered; the fingerprint is defined
    Complete,
}

/// Why a probe result did not change the vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No active session for the identity (disconnect race)
    NoSession,
    /// Probe id outside [0, N)
    OutOfRange,
    /// Probe already resolved; the first answer wins
    Duplicate,
    /// A PENDING outcome is not an answer
    Unresolved,
}

/// Result of applying one probe answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeUpdate {
    Ignored(IgnoreReason),
    /// Recorded; more answers are needed
    Recorded { resolved: usize, total: usize },
    /// Recorded and the vector is now complete
    Completed(Fingerprint),
}

/// Fixed-length vector of probe outcomes; index i is probe i
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeVector {
    outcomes: Vec<ProbeOutcome>,
    resolved: usize,
}

impl ProbeVector {
    /// A vector of `probe_count` pending outcomes; N must be in 1..=64
    pub fn new(probe_count: usize) -> Result<Self> {
        validate_probe_count(probe_count)?;
        Ok(Self {
            outcomes: vec![ProbeOutcome::Pending; probe_count],
            resolved: 0,
        })
    }

    /// Build a vector from explicit outcomes
    pub fn from_outcomes(outcomes: Vec<ProbeOutcome>) -> Result<Self> {
        validate_probe_count(outcomes.len())?;
        let resolved = outcomes
            .iter()
            .filter(|o| **o != ProbeOutcome::Pending)
            .count();
        Ok(Self { outcomes, resolved })
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn resolved(&self) -> usize {
        self.resolved
    }

    pub fn get(&self, probe_id: usize) -> Option<ProbeOutcome> {
        self.outcomes.get(probe_id).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.resolved == self.outcomes.len()
    }

    pub fn state(&self) -> SessionState {
        if self.is_complete() {
            SessionState::Complete
        } else if self.resolved == 0 {
            SessionState::Pending
        } else {
            SessionState::Partial
        }
    }

    /// Apply an answer for one probe
    pub fn resolve(&mut self, probe_id: usize, outcome: ProbeOutcome) -> ProbeUpdate {
        if outcome == ProbeOutcome::Pending {
            return ProbeUpdate::Ignored(IgnoreReason::Unresolved);
        }

        let Some(slot) = self.outcomes.get_mut(probe_id) else {
            return ProbeUpdate::Ignored(IgnoreReason::OutOfRange);
        };

        if *slot != ProbeOutcome::Pending {
            return ProbeUpdate::Ignored(IgnoreReason::Duplicate);
        }

        *slot = outcome;
        self.resolved += 1;

        match self.fingerprint() {
            Some(fp) => ProbeUpdate::Completed(fp),
            None => ProbeUpdate::Recorded {
                resolved: self.resolved,
                total: self.outcomes.len(),
            },
        }
    }

    /// HIT bitmask, or None while any probe is pending
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let mut bits = 0u64;
        for (i, outcome) in self.outcomes.iter().enumerate() {
            match outcome {
                ProbeOutcome::Hit => bits |= 1u64 << i,
                ProbeOutcome::Miss => {}
                ProbeOutcome::Pending => return None,
            }
        }
        Some(Fingerprint::from_bits(bits))
    }
}

/// Detection state for one connected identity
#[derive(Debug, Clone)]
pub struct ProbeSession {
    pub identity: IdentityId,
    pub display_name: String,
    pub vector: ProbeVector,
    /// Milliseconds since the Unix epoch
    pub started_at: i64,
}

impl ProbeSession {
    pub fn new(
        identity: IdentityId,
        display_name: impl Into<String>,
        probe_count: usize,
    ) -> Result<Self> {
        Ok(Self {
            identity,
            display_name: display_name.into(),
            vector: ProbeVector::new(probe_count)?,
            started_at: current_timestamp_ms(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.vector.state()
    }

    pub fn resolve(&mut self, probe_id: usize, outcome: ProbeOutcome) -> ProbeUpdate {
        self.vector.resolve(probe_id, outcome)
    }
}
