//! Identity → fingerprint index with its reverse lookup

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use super::store::{SignatureFile, StoredSignature};
use crate::error::Result;
use crate::identity::IdentityId;
use crate::probe::{validate_probe_count, Fingerprint};
use crate::time::current_timestamp_ms;

/// Everything known about one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub identity: IdentityId,
    pub display_name: String,
    /// Grows monotonically
    pub fingerprints: BTreeSet<Fingerprint>,
    pub last_updated: i64,
    pub last_seen: i64,
}

impl SignatureRecord {
    fn to_stored(&self) -> StoredSignature {
        StoredSignature {
            identity: self.identity.to_string(),
            display_name: self.display_name.clone(),
            fingerprints: self.fingerprints.iter().map(|f| f.bits()).collect(),
            last_updated: self.last_updated,
            last_seen: self.last_seen,
        }
    }

    fn from_stored(stored: StoredSignature) -> Self {
        Self {
            identity: IdentityId::from(stored.identity),
            display_name: stored.display_name,
            fingerprints: stored.fingerprints.into_iter().map(Fingerprint::from_bits).collect(),
            last_updated: stored.last_updated,
            last_seen: stored.last_seen,
        }
    }
}

/// What `record_observation` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First observation for the identity
    Created,
    /// New value added to an existing record
    Added,
    /// Value already known for the identity; only metadata changed
    Repeated,
    /// Value does not fit the probe count; nothing changed
    Rejected,
}

/// Index size summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    pub identities: usize,
    pub fingerprints: usize,
}

#[derive(Default)]
struct IndexState {
    records: HashMap<IdentityId, SignatureRecord>,
    reverse: HashMap<Fingerprint, BTreeSet<IdentityId>>,
}

impl IndexState {
    fn from_file(file: SignatureFile) -> Self {
        let mut state = Self::default();
        for (_, stored) in file.signatures {
            let record = SignatureRecord::from_stored(stored);
            for fp in &record.fingerprints {
                state
                    .reverse
                    .entry(*fp)
                    .or_default()
                    .insert(record.identity.clone());
            }
            state.records.insert(record.identity.clone(), record);
        }
        state
    }

    fn to_file(&self, probe_count: usize) -> SignatureFile {
        let mut file = SignatureFile::empty(probe_count);
        for (id, record) in &self.records {
            file.signatures.insert(id.to_string(), record.to_stored());
        }
        file
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            identities: self.records.len(),
            fingerprints: self.reverse.len(),
        }
    }
}

/// Consistent read-only view over the index
///
/// Holds the read lock; keep it short-lived.
pub struct IndexView<'a> {
    state: RwLockReadGuard<'a, IndexState>,
}

impl IndexView<'_> {
    pub fn fingerprints_of(&self, identity: &str) -> BTreeSet<Fingerprint> {
        self.state
            .records
            .get(identity)
            .map(|r| r.fingerprints.clone())
            .unwrap_or_default()
    }

    pub fn identities_with_fingerprint(&self, fingerprint: Fingerprint) -> BTreeSet<IdentityId> {
        self.state
            .reverse
            .get(&fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, identity: &str) -> Option<&SignatureRecord> {
        self.state.records.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.state.records.contains_key(identity)
    }

    pub fn stats(&self) -> IndexStats {
        self.state.stats()
    }
}

/// Durable signature index
///
/// Forward and reverse maps change together under one write lock. Every
/// mutation rewrites the store file; a failed write is logged, leaves the
/// in-memory state authoritative and is retried by the next mutation or
/// by [`SignatureIndex::flush`].
pub struct SignatureIndex {
    path: Option<PathBuf>,
    probe_count: usize,
    state: RwLock<IndexState>,
    /// Serializes snapshot + write so the file never goes backwards
    persist_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl SignatureIndex {
    /// Load the store at `path`, starting empty if it is missing or unusable
    pub fn load_or_init(path: impl Into<PathBuf>, probe_count: usize) -> Result<Self> {
        validate_probe_count(probe_count)?;
        let path = path.into();
        let file = SignatureFile::load_or_init(&path, probe_count);
        Ok(Self {
            path: Some(path),
            probe_count,
            state: RwLock::new(IndexState::from_file(file)),
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Index that never touches disk
    pub fn in_memory(probe_count: usize) -> Result<Self> {
        validate_probe_count(probe_count)?;
        Ok(Self {
            path: None,
            probe_count,
            state: RwLock::new(IndexState::default()),
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the last write failed and memory is ahead of disk
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn read(&self) -> IndexView<'_> {
        IndexView {
            state: self.state.read(),
        }
    }

    /// Upsert the record and add `fingerprint` to it
    pub fn record_observation(
        &self,
        identity: &IdentityId,
        display_name: &str,
        fingerprint: Fingerprint,
    ) -> Observation {
        self.record_observation_at(identity, display_name, fingerprint, current_timestamp_ms())
    }

    /// [`record_observation`](Self::record_observation) with an explicit timestamp
    pub fn record_observation_at(
        &self,
        identity: &IdentityId,
        display_name: &str,
        fingerprint: Fingerprint,
        now: i64,
    ) -> Observation {
        if !fingerprint.fits(self.probe_count) {
            warn!(
                identity = %identity,
                value = fingerprint.bits(),
                probe_count = self.probe_count,
                "Rejecting fingerprint outside probe range"
            );
            return Observation::Rejected;
        }

        let observation = self.mutate(|state| {
            let observation = match state.records.get_mut(identity) {
                Some(record) => {
                    record.display_name = display_name.to_string();
                    record.last_updated = now;
                    record.last_seen = record.last_seen.max(now);
                    if record.fingerprints.insert(fingerprint) {
                        Observation::Added
                    } else {
                        Observation::Repeated
                    }
                }
                None => {
                    let record = SignatureRecord {
                        identity: identity.clone(),
                        display_name: display_name.to_string(),
                        fingerprints: BTreeSet::from([fingerprint]),
                        last_updated: now,
                        last_seen: now,
                    };
                    state.records.insert(identity.clone(), record);
                    Observation::Created
                }
            };
            state
                .reverse
                .entry(fingerprint)
                .or_default()
                .insert(identity.clone());
            (observation, true)
        });

        debug!(
            identity = %identity,
            value = fingerprint.bits(),
            ?observation,
            "Recorded observation"
        );
        observation
    }

    /// Refresh name and last-seen of a known identity; false if unknown
    pub fn mark_seen(&self, identity: &IdentityId, display_name: &str) -> bool {
        self.mark_seen_at(identity, display_name, current_timestamp_ms())
    }

    /// [`mark_seen`](Self::mark_seen) with an explicit timestamp
    pub fn mark_seen_at(&self, identity: &IdentityId, display_name: &str, now: i64) -> bool {
        self.mutate(|state| match state.records.get_mut(identity) {
            Some(record) => {
                record.display_name = display_name.to_string();
                record.last_seen = record.last_seen.max(now);
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn fingerprints_of(&self, identity: &str) -> BTreeSet<Fingerprint> {
        self.read().fingerprints_of(identity)
    }

    pub fn identities_with_fingerprint(&self, fingerprint: Fingerprint) -> BTreeSet<IdentityId> {
        self.read().identities_with_fingerprint(fingerprint)
    }

    pub fn record(&self, identity: &str) -> Option<SignatureRecord> {
        self.read().record(identity).cloned()
    }

    /// Identities whose last known name matches, ignoring case
    pub fn find_by_name(&self, name: &str) -> Vec<IdentityId> {
        let wanted = name.trim().to_lowercase();
        let state = self.state.read();
        let mut found: Vec<IdentityId> = state
            .records
            .values()
            .filter(|r| r.display_name.to_lowercase() == wanted)
            .map(|r| r.identity.clone())
            .collect();
        found.sort();
        found
    }

    pub fn stats(&self) -> IndexStats {
        self.state.read().stats()
    }

    /// Write the current state to disk
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _persist = self.persist_lock.lock();
        let snapshot = self.state.read().to_file(self.probe_count);
        match snapshot.save(path) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Apply `f` under the write lock and persist if it reports a change
    fn mutate<R>(&self, f: impl FnOnce(&mut IndexState) -> (R, bool)) -> R {
        let _persist = self.persist_lock.lock();

        let (result, snapshot) = {
            let mut state = self.state.write();
            let (result, changed) = f(&mut state);
            let snapshot = (changed && self.path.is_some())
                .then(|| state.to_file(self.probe_count));
            (result, snapshot)
        };

        if let (Some(snapshot), Some(path)) = (snapshot, &self.path) {
            self.persist(&snapshot, path);
        }
        result
    }

    fn persist(&self, snapshot: &SignatureFile, path: &Path) {
        match snapshot.save(path) {
            Ok(()) => {
                if self.dirty.swap(false, Ordering::AcqRel) {
                    debug!(path = %path.display(), "Signature store caught up after earlier failure");
                }
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to persist signature store, keeping in-memory state"
                );
            }
        }
    }
}
