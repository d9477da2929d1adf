//! Session tracker
//!
//! Owns the active probe sessions and drives both probe rounds against the
//! signature index.
//!
//! Locking: the session map is only held for lookups, inserts and removals.
//! Each session sits behind its own mutex, so events for different
//! identities never wait on each other. A session lock is never held while
//! the map lock is taken, and content lookups and store writes run with no
//! lock of the tracker held.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::challenge::{detection_round, marking_round, Challenge};
use crate::content::ContentStore;
use crate::correlation::AltCorrelator;
use crate::error::{CacheMarkError, Result};
use crate::identity::IdentityId;
use crate::probe::{
    Fingerprint, FingerprintGenerator, IgnoreReason, ProbeOutcome, ProbeSession, ProbeUpdate,
    SessionState,
};
use crate::settings::TrackerSettings;
use crate::signatures::SignatureIndex;

/// Behaviour switches taken from the settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerOptions {
    pub unreachable_url: String,
    pub shuffle_challenges: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self::from(&TrackerSettings::default())
    }
}

impl From<&TrackerSettings> for TrackerOptions {
    fn from(settings: &TrackerSettings) -> Self {
        Self {
            unreachable_url: settings.unreachable_url.clone(),
            shuffle_challenges: settings.shuffle_challenges,
        }
    }
}

/// A freshly started session and the detection challenges to send
#[derive(Debug)]
pub struct SessionStarted {
    /// Distinguishes this session from earlier ones of the same identity
    pub epoch: u64,
    /// Whether the identity already had a signature record
    pub known: bool,
    pub challenges: Vec<Challenge>,
}

/// Effect of one probe result
#[derive(Debug, PartialEq, Eq)]
pub enum ProbeProgress {
    Ignored(IgnoreReason),
    /// Still waiting for more answers
    Pending { resolved: usize, total: usize },
    /// Device recognized; the value was recorded
    Returning { fingerprint: Fingerprint },
    /// Device unseen; a new value was assigned and must be planted
    Marked {
        fingerprint: Fingerprint,
        challenges: Vec<Challenge>,
    },
}

struct SessionSlot {
    session: ProbeSession,
    epoch: u64,
    /// Set once the session completes or is ended; late events are ignored
    closed: bool,
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

pub struct Tracker {
    options: TrackerOptions,
    content: Arc<dyn ContentStore>,
    index: Arc<SignatureIndex>,
    correlator: AltCorrelator,
    generator: FingerprintGenerator,
    sessions: RwLock<HashMap<IdentityId, SharedSlot>>,
    next_epoch: AtomicU64,
}

impl Tracker {
    pub fn new(
        content: Arc<dyn ContentStore>,
        index: Arc<SignatureIndex>,
        options: TrackerOptions,
    ) -> Result<Self> {
        let generator = FingerprintGenerator::new(content.probe_count())?;
        Self::with_generator(content, index, options, generator)
    }

    /// Build with an explicit generator (seeded in tests)
    pub fn with_generator(
        content: Arc<dyn ContentStore>,
        index: Arc<SignatureIndex>,
        options: TrackerOptions,
        generator: FingerprintGenerator,
    ) -> Result<Self> {
        let probe_count = content.probe_count();
        if index.probe_count() != probe_count || generator.probe_count() != probe_count {
            return Err(CacheMarkError::config(format!(
                "probe count mismatch: manifest {}, index {}, generator {}",
                probe_count,
                index.probe_count(),
                generator.probe_count()
            )));
        }

        info!(
            probe_count,
            shuffle = options.shuffle_challenges,
            "Tracker ready"
        );

        Ok(Self {
            options,
            correlator: AltCorrelator::new(Arc::clone(&index)),
            content,
            index,
            generator,
            sessions: RwLock::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn probe_count(&self) -> usize {
        self.content.probe_count()
    }

    pub fn index(&self) -> &Arc<SignatureIndex> {
        &self.index
    }

    pub fn correlator(&self) -> &AltCorrelator {
        &self.correlator
    }

    /// Open a session with N pending probes, replacing any existing one
    ///
    /// Nothing changes if the detection challenges cannot be built.
    pub fn session_start(&self, identity: &IdentityId, display_name: &str) -> Result<SessionStarted> {
        let mut challenges =
            detection_round(self.content.as_ref(), identity, &self.options.unreachable_url)?;
        if self.options.shuffle_challenges {
            self.generator.shuffle(&mut challenges);
        }

        let session = ProbeSession::new(identity.clone(), display_name, self.probe_count())?;
        let known = self.index.mark_seen(identity, display_name);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(SessionSlot {
            session,
            epoch,
            closed: false,
        }));

        let replaced = self.sessions.write().insert(identity.clone(), slot);
        if let Some(old) = replaced {
            old.lock().closed = true;
            debug!(identity = %identity, "Replaced existing session");
        }

        debug!(identity = %identity, epoch, known, "Session started");
        Ok(SessionStarted {
            epoch,
            known,
            challenges,
        })
    }

    /// Apply one probe answer
    ///
    /// Completing the vector records the value (returning device) or assigns
    /// and records a new one (unseen device). An error means the marking
    /// challenges could not be built; nothing was recorded and the session
    /// is gone.
    pub fn probe_result(
        &self,
        identity: &IdentityId,
        probe_id: usize,
        outcome: ProbeOutcome,
    ) -> Result<ProbeProgress> {
        let Some(slot) = self.sessions.read().get(identity).cloned() else {
            return Ok(ProbeProgress::Ignored(IgnoreReason::NoSession));
        };

        // Content lookups and store writes happen after the slot is released
        let (display_name, fingerprint) = {
            let mut guard = slot.lock();
            if guard.closed {
                return Ok(ProbeProgress::Ignored(IgnoreReason::NoSession));
            }

            match guard.session.resolve(probe_id, outcome) {
                ProbeUpdate::Ignored(reason) => return Ok(ProbeProgress::Ignored(reason)),
                ProbeUpdate::Recorded { resolved, total } => {
                    return Ok(ProbeProgress::Pending { resolved, total })
                }
                ProbeUpdate::Completed(fingerprint) => {
                    guard.closed = true;
                    (guard.session.display_name.clone(), fingerprint)
                }
            }
        };

        self.remove_slot(identity, &slot);
        self.complete(identity, &display_name, fingerprint)
    }

    fn complete(
        &self,
        identity: &IdentityId,
        display_name: &str,
        detected: Fingerprint,
    ) -> Result<ProbeProgress> {
        if !detected.is_unseen() {
            self.index.record_observation(identity, display_name, detected);
            info!(identity = %identity, value = detected.bits(), "Returning device recognized");
            return Ok(ProbeProgress::Returning {
                fingerprint: detected,
            });
        }

        let value = self.generator.generate();
        if value.is_unseen() {
            warn!(
                identity = %identity,
                probe_count = self.probe_count(),
                "Too few probes to mark a new device"
            );
            return Ok(ProbeProgress::Marked {
                fingerprint: value,
                challenges: Vec::new(),
            });
        }

        let mut challenges = marking_round(self.content.as_ref(), identity, value)?;
        if self.options.shuffle_challenges {
            self.generator.shuffle(&mut challenges);
        }
        self.index.record_observation(identity, display_name, value);
        info!(
            identity = %identity,
            value = value.bits(),
            marked = challenges.len(),
            "New device marked"
        );

        Ok(ProbeProgress::Marked {
            fingerprint: value,
            challenges,
        })
    }

    fn remove_slot(&self, identity: &IdentityId, slot: &SharedSlot) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(identity);
        }
    }

    /// Drop the identity's session without recording anything
    pub fn session_end(&self, identity: &IdentityId) -> bool {
        let removed = self.sessions.write().remove(identity);
        match removed {
            Some(slot) => {
                slot.lock().closed = true;
                debug!(identity = %identity, "Session ended");
                true
            }
            None => false,
        }
    }

    /// Drop the identity's session only if it is still the one from `epoch`
    pub fn session_end_epoch(&self, identity: &IdentityId, epoch: u64) -> bool {
        let Some(slot) = self.sessions.read().get(identity).cloned() else {
            return false;
        };

        {
            let mut guard = slot.lock();
            if guard.epoch != epoch || guard.closed {
                return false;
            }
            guard.closed = true;
        }

        self.remove_slot(identity, &slot);
        true
    }

    /// End a batch of sessions (a closed transport connection)
    pub fn end_sessions<I>(&self, sessions: I) -> usize
    where
        I: IntoIterator<Item = (IdentityId, u64)>,
    {
        sessions
            .into_iter()
            .filter(|(identity, epoch)| self.session_end_epoch(identity, *epoch))
            .count()
    }

    /// Whether `epoch` is still the identity's open session
    pub fn is_current(&self, identity: &IdentityId, epoch: u64) -> bool {
        let slot = self.sessions.read().get(identity).cloned();
        slot.is_some_and(|slot| {
            let guard = slot.lock();
            guard.epoch == epoch && !guard.closed
        })
    }

    pub fn session_state(&self, identity: &IdentityId) -> Option<SessionState> {
        let slot = self.sessions.read().get(identity).cloned();
        slot.map(|slot| slot.lock().session.state())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn status(&self) -> cm_protocol::TrackerStatus {
        let stats = self.index.stats();
        cm_protocol::TrackerStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            probe_count: self.probe_count(),
            active_sessions: self.active_sessions(),
            identities: stats.identities,
            fingerprints: stats.fingerprints,
        }
    }
}
