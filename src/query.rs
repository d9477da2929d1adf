/*
 * This file is part of cachemark.
 *
 * Copyright (C) 2026 cachemark contributors
 *
 * cachemark is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * cachemark is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with cachemark. If not, see <https://www.gnu.org/licenses/>.
 */

//! Alt lookups against the daemon or a store file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cm_core::{AltCorrelator, DaemonClient, SignatureFile, SignatureIndex};
use cm_protocol::{AltInfo, TrackerStatus};
use serde::Serialize;
use tracing::debug;

/// Canonical pick and alts for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AltLookup {
    /// What the operator typed
    pub query: String,
    pub identity: String,
    pub canonical: String,
    /// Last known name of the canonical identity, if any
    pub canonical_name: Option<String>,
    pub alts: Vec<AltInfo>,
}

/// Where lookups are answered from
pub trait AltSource {
    /// Identities whose last known name matches `name`
    fn find_by_name(&mut self, name: &str) -> anyhow::Result<Vec<String>>;

    fn lookup(&mut self, query: &str, identity: &str) -> anyhow::Result<AltLookup>;

    fn status(&mut self) -> anyhow::Result<TrackerStatus>;

    /// Human-readable description for status output
    fn describe(&self) -> String;
}

/// Live queries over the daemon socket
pub struct DaemonSource {
    client: DaemonClient,
    socket: PathBuf,
}

impl DaemonSource {
    pub fn connect(socket: &Path) -> anyhow::Result<Self> {
        let client = DaemonClient::connect(socket)
            .with_context(|| format!("Cannot reach cachemarkd at {}", socket.display()))?;
        Ok(Self {
            client,
            socket: socket.to_path_buf(),
        })
    }
}

impl AltSource for DaemonSource {
    fn find_by_name(&mut self, name: &str) -> anyhow::Result<Vec<String>> {
        // Anything that cannot be a display name is looked up as an identity
        if cm_protocol::validate_display_name(name).is_err() {
            return Ok(Vec::new());
        }
        Ok(self.client.find_by_name(name)?)
    }

    fn lookup(&mut self, query: &str, identity: &str) -> anyhow::Result<AltLookup> {
        let canonical = self.client.canonical(identity)?;
        let alts = self.client.alts(identity)?;
        let canonical_name = alts
            .iter()
            .find(|a| a.identity == canonical)
            .map(|a| a.display_name.clone())
            .or_else(|| (canonical == identity && query != identity).then(|| query.to_string()));

        Ok(AltLookup {
            query: query.to_string(),
            identity: identity.to_string(),
            canonical,
            canonical_name,
            alts,
        })
    }

    fn status(&mut self) -> anyhow::Result<TrackerStatus> {
        Ok(self.client.status()?)
    }

    fn describe(&self) -> String {
        format!("daemon ({})", self.socket.display())
    }
}

/// Read-only queries against a signature store file
///
/// The probe count is taken from the file itself, so no manifest is needed.
pub struct StoreSource {
    correlator: AltCorrelator,
    path: PathBuf,
}

impl StoreSource {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let probe_count = SignatureFile::read_probe_count(path)
            .with_context(|| format!("Cannot read signature store {}", path.display()))?;
        let index = SignatureIndex::load_or_init(path, probe_count)
            .with_context(|| format!("Unusable signature store {}", path.display()))?;
        debug!(path = %path.display(), probe_count, "Opened signature store");

        Ok(Self {
            correlator: AltCorrelator::new(Arc::new(index)),
            path: path.to_path_buf(),
        })
    }
}

impl AltSource for StoreSource {
    fn find_by_name(&mut self, name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .correlator
            .index()
            .find_by_name(name)
            .into_iter()
            .map(|id| id.into_string())
            .collect())
    }

    fn lookup(&mut self, query: &str, identity: &str) -> anyhow::Result<AltLookup> {
        let report = self.correlator.report(identity);
        let canonical_name = self
            .correlator
            .index()
            .record(report.canonical.as_str())
            .map(|r| r.display_name);

        Ok(AltLookup {
            query: query.to_string(),
            identity: report.identity.into_string(),
            canonical: report.canonical.into_string(),
            canonical_name,
            alts: report.alts.into_iter().map(AltInfo::from).collect(),
        })
    }

    fn status(&mut self) -> anyhow::Result<TrackerStatus> {
        let index = self.correlator.index();
        let stats = index.stats();
        Ok(TrackerStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            probe_count: index.probe_count(),
            active_sessions: 0,
            identities: stats.identities,
            fingerprints: stats.fingerprints,
        })
    }

    fn describe(&self) -> String {
        format!("store file ({})", self.path.display())
    }
}

/// Resolve `target` as a display name first, then as a raw identity
pub fn resolve_target(source: &mut dyn AltSource, target: &str) -> anyhow::Result<Vec<String>> {
    let by_name = source.find_by_name(target)?;
    if by_name.is_empty() {
        debug!(target, "No name match, treating as identity");
        return Ok(vec![target.to_string()]);
    }
    debug!(target, matches = by_name.len(), "Resolved by display name");
    Ok(by_name)
}

/// Look up every identity `target` resolves to
pub fn lookup_all(source: &mut dyn AltSource, target: &str) -> anyhow::Result<Vec<AltLookup>> {
    resolve_target(source, target)?
        .iter()
        .map(|identity| source.lookup(target, identity))
        .collect()
}
