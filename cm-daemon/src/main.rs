//! cachemark Daemon (cachemarkd)
//!
//! Long-running tracker service. The transport bridge connects over a Unix
//! domain socket, reports session and probe events, and receives the probe
//! challenges to forward to clients. Admin tools query the same socket.
//!
//! # Startup
//! - Settings, probe manifest and signature store are loaded up front;
//!   only configuration errors abort startup
//! - A corrupt or mismatched store is discarded and the index starts empty
//!
//! # Shutdown
//! - SIGINT/SIGTERM stop accepting connections, flush the index and remove
//!   the socket

mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cm_core::{
    ContentStore, ManifestContentStore, SignatureIndex, Tracker, TrackerOptions, TrackerSettings,
};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "cachemarkd", version, about = "cachemark tracker daemon")]
struct Args {
    /// Settings file (default: /etc/cachemark/settings.json, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path (overrides the settings file)
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

// ============================================================================
// Logging
// ============================================================================

/// Log to the systemd journal when available, stdout otherwise
fn init_logging() -> bool {
    let log_level = std::env::var("CACHEMARK_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = Path::new("/run/systemd/journal/socket").exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
    false
}

/// Files created by the daemon are not world-readable
fn set_secure_umask() {
    // SAFETY: umask only sets the file creation mask of this process.
    unsafe { libc::umask(0o027) };
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn cleanup(socket_path: &Path, index: &SignatureIndex) {
    if let Err(e) = index.flush() {
        error!("Failed to flush signature store: {}", e);
    }

    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("Failed to remove socket: {}", e);
        }
    }

    info!("Cleanup complete");
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    set_secure_umask();
    let journald = init_logging();

    info!("STARTUP: cachemarkd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });

    let mut settings = match &args.config {
        Some(path) => TrackerSettings::load(path),
        None => TrackerSettings::load_default(),
    }
    .context("Failed to load settings")?;
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }

    let content = ManifestContentStore::load(&settings.manifest_path)
        .context("Failed to load probe manifest")?;
    let probe_count = content.probe_count();

    let index = Arc::new(
        SignatureIndex::load_or_init(&settings.store_path, probe_count)
            .context("Failed to open signature store")?,
    );
    let stats = index.stats();
    info!(
        "STARTUP: {} probes, {} identities, {} fingerprints",
        probe_count, stats.identities, stats.fingerprints
    );

    let tracker = Arc::new(
        Tracker::new(
            Arc::new(content),
            Arc::clone(&index),
            TrackerOptions::from(&settings),
        )
        .context("Failed to start tracker")?,
    );

    let listener = server::bind_socket(&settings.socket_path)?;
    let state = Arc::new(server::DaemonState::new(
        tracker,
        settings.pacing(),
        settings.max_connections,
    ));

    info!("STARTUP: Socket path: {}", settings.socket_path.display());
    info!("STARTUP: PID: {}", std::process::id());

    server::run_server(listener, state, shutdown_signal()).await;

    cleanup(&settings.socket_path, &index);
    info!("SHUTDOWN: Daemon terminated gracefully");
    Ok(())
}
