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

//! Operator-facing text output

use std::fmt::{self, Write};

use chrono::TimeZone;
use cm_protocol::TrackerStatus;

use crate::query::AltLookup;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a millisecond timestamp in `tz`; 0 means the identity was never seen
pub fn format_timestamp<Tz>(ms: i64, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if ms <= 0 {
        return "never".to_string();
    }
    match tz.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        None => "unknown".to_string(),
    }
}

fn account_label(name: Option<&str>, identity: &str) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("{} ({})", name, identity),
        _ => identity.to_string(),
    }
}

pub fn format_alt_report<Tz>(lookup: &AltLookup, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let mut out = String::new();
    let _ = writeln!(out, "=== Alt Accounts for {} ===", lookup.query);
    if lookup.identity != lookup.query {
        let _ = writeln!(out, "Identity: {}", lookup.identity);
    }
    let _ = writeln!(
        out,
        "Original Account: {}",
        account_label(lookup.canonical_name.as_deref(), &lookup.canonical)
    );

    if lookup.alts.is_empty() {
        out.push_str("No alt accounts found.\n");
        return out;
    }

    out.push_str("Alt Accounts:\n");
    for alt in &lookup.alts {
        let _ = writeln!(
            out,
            "  • {} - Last seen: {}",
            account_label(Some(&alt.display_name), &alt.identity),
            format_timestamp(alt.last_seen, tz)
        );
    }
    out
}

pub fn format_canonical(lookup: &AltLookup) -> String {
    format!(
        "{} -> {}\n",
        lookup.identity,
        account_label(lookup.canonical_name.as_deref(), &lookup.canonical)
    )
}

pub fn format_status(status: &TrackerStatus, source: &str) -> String {
    let mut out = String::new();
    out.push_str("cachemark Status\n");
    out.push_str("================\n");
    let _ = writeln!(out, "Source:          {}", source);
    let _ = writeln!(out, "Version:         {}", status.version);
    let _ = writeln!(out, "Probes:          {}", status.probe_count);
    let _ = writeln!(out, "Active sessions: {}", status.active_sessions);
    let _ = writeln!(out, "Identities:      {}", status.identities);
    let _ = writeln!(out, "Fingerprints:    {}", status.fingerprints);
    out
}
