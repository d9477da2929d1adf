/*
 * Integration tests for cachemark
 *
 * These tests drive the tracker end to end, persist through a real store
 * file, and read the result back the way the admin CLI does.
 */

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use cachemark::cli::{execute, Commands};
use cachemark::query::{lookup_all, AltSource, StoreSource};
use cm_core::constants::paths;
use cm_core::{
    IdentityId, ManifestContentStore, ProbeAsset, ProbeOutcome, ProbeProgress, SignatureIndex,
    Tracker, TrackerOptions, TrackerSettings,
};
use serial_test::serial;
use tempfile::TempDir;

const N: usize = 8;

fn manifest() -> ManifestContentStore {
    let assets = (0..N)
        .map(|i| ProbeAsset {
            url: format!("https://cdn.example/pack-{}.zip", i),
            uuid: format!("00000000-0000-0000-0000-{:012}", i),
            digest: format!("{:040x}", i),
        })
        .collect();
    ManifestContentStore::new(assets).unwrap()
}

fn tracker_at(path: &PathBuf) -> Tracker {
    let index = Arc::new(SignatureIndex::load_or_init(path, N).unwrap());
    Tracker::new(Arc::new(manifest()), index, TrackerOptions::default()).unwrap()
}

/// Run one full session reporting HIT exactly for the bits of `value`
fn run_session(tracker: &Tracker, identity: &str, name: &str, value: u64) -> ProbeProgress {
    let id = IdentityId::from(identity);
    tracker.session_start(&id, name).unwrap();
    let mut last = None;
    for probe in 0..N {
        let outcome = if value & (1 << probe) != 0 {
            ProbeOutcome::Hit
        } else {
            ProbeOutcome::Miss
        };
        last = Some(tracker.probe_result(&id, probe, outcome).unwrap());
    }
    last.unwrap()
}

#[test]
fn test_marked_device_is_recognised_under_another_account() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("signatures.json");

    // First account: unseen device gets marked
    let value = {
        let tracker = tracker_at(&store);
        match run_session(&tracker, "3", "Steve", 0) {
            ProbeProgress::Marked { fingerprint, challenges } => {
                assert_eq!(challenges.len(), N / 2);
                fingerprint.bits()
            }
            other => panic!("expected marking, got {:?}", other),
        }
    };

    // Restart, second account on the same device reports the planted bits
    {
        let tracker = tracker_at(&store);
        match run_session(&tracker, "1", "Alex", value) {
            ProbeProgress::Returning { fingerprint } => assert_eq!(fingerprint.bits(), value),
            other => panic!("expected returning device, got {:?}", other),
        }
    }

    let mut source = StoreSource::open(&store).unwrap();
    let lookups = lookup_all(&mut source, "Steve").unwrap();
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].identity, "3");
    assert_eq!(lookups[0].canonical, "1");
    assert_eq!(lookups[0].alts.len(), 1);
    assert_eq!(lookups[0].alts[0].display_name, "Alex");
}

#[test]
fn test_cli_alts_text_output_from_store() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("signatures.json");
    let tracker = tracker_at(&store);
    run_session(&tracker, "a", "Alice", 0b0000_0110);
    run_session(&tracker, "b", "Bob", 0b0000_0110);
    drop(tracker);

    let mut source = StoreSource::open(&store).unwrap();
    let mut out = Vec::new();
    execute(
        &Commands::Alts { target: "bob".to_string() },
        &mut source,
        false,
        &mut out,
    )
    .unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("=== Alt Accounts for bob ===\n"));
    assert!(text.contains("Original Account: Alice (a)\n"));
    assert!(text.contains("  • Alice (a) - Last seen: "));
}

#[test]
fn test_cli_status_json_from_store() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("signatures.json");
    let tracker = tracker_at(&store);
    run_session(&tracker, "a", "Alice", 0b1);
    drop(tracker);

    let mut source = StoreSource::open(&store).unwrap();
    let mut out = Vec::new();
    execute(&Commands::Status, &mut source, true, &mut out).unwrap();

    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["probe_count"], N);
    assert_eq!(json["identities"], 1);
    assert_eq!(json["fingerprints"], 1);
}

#[test]
fn test_disconnect_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("signatures.json");
    let tracker = tracker_at(&store);
    let id = IdentityId::from("a");

    tracker.session_start(&id, "Alice").unwrap();
    tracker.probe_result(&id, 0, ProbeOutcome::Hit).unwrap();
    tracker.session_end(&id);

    assert!(!store.exists());
    assert_eq!(tracker.index().stats().identities, 0);
}

#[test]
fn test_store_written_for_other_probe_count_is_discarded() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("signatures.json");
    {
        let index = SignatureIndex::load_or_init(&store, 4).unwrap();
        index.record_observation(&IdentityId::from("a"), "Alice", cm_core::Fingerprint::from_bits(3));
    }

    let tracker = tracker_at(&store);
    assert_eq!(tracker.index().stats().identities, 0);

    let mut source = StoreSource::open(&store).unwrap();
    assert_eq!(source.status().unwrap().probe_count, 4);
}

#[test]
#[serial]
fn test_settings_path_falls_back_to_xdg_config_home() {
    let system = PathBuf::from(paths::CONFIG_DIR).join(paths::SETTINGS_FILE);
    if system.exists() {
        return;
    }

    let dir = TempDir::new().unwrap();
    let previous = std::env::var("XDG_CONFIG_HOME").ok();
    std::env::set_var("XDG_CONFIG_HOME", dir.path());

    let resolved = paths::resolve_settings_path();
    assert_eq!(resolved, dir.path().join("cachemark").join(paths::SETTINGS_FILE));

    match previous {
        Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
        None => std::env::remove_var("XDG_CONFIG_HOME"),
    }
}

#[test]
#[serial]
fn test_default_settings_load_from_user_config() {
    let system = PathBuf::from(paths::CONFIG_DIR).join(paths::SETTINGS_FILE);
    if system.exists() {
        return;
    }

    let dir = TempDir::new().unwrap();
    let config_dir = dir.path().join("cachemark");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join(paths::SETTINGS_FILE),
        r#"{"pacing_ms": 5, "shuffle_challenges": true}"#,
    )
    .unwrap();

    let previous = std::env::var("XDG_CONFIG_HOME").ok();
    std::env::set_var("XDG_CONFIG_HOME", dir.path());

    let settings = TrackerSettings::load_default().unwrap();
    assert_eq!(settings.pacing_ms, 5);
    assert!(settings.shuffle_challenges);

    match previous {
        Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
        None => std::env::remove_var("XDG_CONFIG_HOME"),
    }
}
