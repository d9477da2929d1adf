//! Alt-account correlation over the signature index
//!
//! Two identities are correlated when they share at least one fingerprint
//! value. Correlation is single-hop: A–B and B–C does not make A–C.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::identity::IdentityId;
use crate::signatures::{IndexView, SignatureIndex};

/// One correlated account, as listed to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltAccount {
    pub identity: IdentityId,
    pub display_name: String,
    /// Milliseconds since the Unix epoch, 0 if never seen
    pub last_seen: i64,
}

impl From<AltAccount> for cm_protocol::AltInfo {
    fn from(alt: AltAccount) -> Self {
        Self {
            identity: alt.identity.into_string(),
            display_name: alt.display_name,
            last_seen: alt.last_seen,
        }
    }
}

/// Canonical pick and alt list computed from one read of the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltReport {
    pub identity: IdentityId,
    pub canonical: IdentityId,
    pub alts: Vec<AltAccount>,
}

/// Read-side queries over a shared [`SignatureIndex`]
#[derive(Clone)]
pub struct AltCorrelator {
    index: Arc<SignatureIndex>,
}

impl AltCorrelator {
    pub fn new(index: Arc<SignatureIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<SignatureIndex> {
        &self.index
    }

    /// Identities sharing a fingerprint with `identity`, excluding itself
    pub fn correlates_of(&self, identity: &str) -> BTreeSet<IdentityId> {
        correlates_in(&self.index.read(), identity)
    }

    /// Smallest identifier among `identity` and its correlates
    ///
    /// An ordering heuristic for "earliest account", not a guarantee.
    pub fn canonical_of(&self, identity: &str) -> IdentityId {
        let view = self.index.read();
        canonical_in(identity, &correlates_in(&view, identity))
    }

    /// Correlated accounts, most recently seen first
    pub fn alts_of(&self, identity: &str) -> Vec<AltAccount> {
        let view = self.index.read();
        alts_in(&view, &correlates_in(&view, identity))
    }

    pub fn report(&self, identity: &str) -> AltReport {
        let view = self.index.read();
        let correlates = correlates_in(&view, identity);
        AltReport {
            identity: IdentityId::from(identity),
            canonical: canonical_in(identity, &correlates),
            alts: alts_in(&view, &correlates),
        }
    }
}

fn correlates_in(view: &IndexView<'_>, identity: &str) -> BTreeSet<IdentityId> {
    let mut correlates = BTreeSet::new();
    for fingerprint in view.fingerprints_of(identity) {
        correlates.extend(view.identities_with_fingerprint(fingerprint));
    }
    correlates.remove(identity);
    correlates
}

fn canonical_in(identity: &str, correlates: &BTreeSet<IdentityId>) -> IdentityId {
    match correlates.first() {
        Some(first) if first.as_str() < identity => first.clone(),
        _ => IdentityId::from(identity),
    }
}

fn alts_in(view: &IndexView<'_>, correlates: &BTreeSet<IdentityId>) -> Vec<AltAccount> {
    let mut alts: Vec<AltAccount> = correlates
        .iter()
        .map(|id| match view.record(id.as_str()) {
            Some(record) => AltAccount {
                identity: id.clone(),
                display_name: record.display_name.clone(),
                last_seen: record.last_seen,
            },
            None => AltAccount {
                identity: id.clone(),
                display_name: String::new(),
                last_seen: 0,
            },
        })
        .collect();
    alts.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    alts
}
