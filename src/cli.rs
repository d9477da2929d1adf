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

//! Command Line Interface

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::query::{lookup_all, AltSource, DaemonSource, StoreSource};
use crate::report;

#[derive(Parser, Debug)]
#[command(name = "cachemark")]
#[command(version)]
#[command(about = "cachemark - alt account lookups")]
#[command(long_about = "cachemark - alt account lookups

Queries the running cachemarkd over its socket, or reads a signature
store file directly with --store.

EXAMPLES:
    cachemark alts Steve                 Alts of the account named Steve
    cachemark canonical 4f2a-...         Canonical account for an identity
    cachemark --store signatures.json status

ENVIRONMENT VARIABLES:
    RUST_LOG=debug         Enable debug logging

FILES:
    /run/cachemark.sock                  Daemon socket
    /var/lib/cachemark/signatures.json   Signature store")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Daemon socket path
    #[arg(long, global = true, conflicts_with = "store")]
    pub socket: Option<PathBuf>,

    /// Read this signature store instead of asking the daemon
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List accounts sharing a fingerprint with the target
    Alts {
        /// Display name or identity
        target: String,
    },

    /// Show the canonical (earliest) account for the target
    Canonical {
        /// Display name or identity
        target: String,
    },

    /// Show tracker or store status
    Status,
}

impl Cli {
    pub fn open_source(&self) -> anyhow::Result<Box<dyn AltSource>> {
        if let Some(store) = &self.store {
            return Ok(Box::new(StoreSource::open(store)?));
        }
        let socket = self
            .socket
            .clone()
            .unwrap_or_else(cm_core::daemon_client::default_socket_path);
        Ok(Box::new(DaemonSource::connect(&socket)?))
    }
}

/// Run the parsed command against the configured source
pub fn run(cli: &Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut source = cli.open_source()?;
    execute(&cli.command, source.as_mut(), cli.json, out)
}

pub fn execute(
    command: &Commands,
    source: &mut dyn AltSource,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Commands::Alts { target } => {
            let lookups = lookup_all(source, target)?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&lookups)?)?;
                return Ok(());
            }
            for (i, lookup) in lookups.iter().enumerate() {
                if i > 0 {
                    writeln!(out)?;
                }
                write!(out, "{}", report::format_alt_report(lookup, &chrono::Local))?;
            }
        }
        Commands::Canonical { target } => {
            let lookups = lookup_all(source, target)?;
            if json {
                let pairs: Vec<_> = lookups
                    .iter()
                    .map(|l| serde_json::json!({ "identity": l.identity, "canonical": l.canonical }))
                    .collect();
                writeln!(out, "{}", serde_json::to_string_pretty(&pairs)?)?;
                return Ok(());
            }
            for lookup in &lookups {
                write!(out, "{}", report::format_canonical(lookup))?;
            }
        }
        Commands::Status => {
            let status = source.status()?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&status)?)?;
                return Ok(());
            }
            write!(out, "{}", report::format_status(&status, &source.describe()))?;
        }
    }
    Ok(())
}
