//! Per-manifest snapshot store with crash recovery via event-log replay.
//!
//! Layout per manifest, per §4.3: `<baseDir>/<manifestId>/{state.json, events.log}`.
//! This crate owns `state.json`; `protoreg-events` owns `events.log` and the replay
//! function this crate falls back to when the snapshot is missing or corrupt.
//!
//! # Example
//!
//! ```
//! use protoreg_persist::SnapshotStore;
//! use tempfile::tempdir;
//!
//! let dir = tempdir().unwrap();
//! let store = SnapshotStore::new(dir.path());
//! assert!(!store.exists("m1"));
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protoreg_events::EventLog;
use protoreg_types::{RegistryError, VersionedState};

/// Default snapshot file name under a manifest's directory.
pub const STATE_FILE: &str = "state.json";

/// Persistent, atomically-written snapshot store rooted at a base directory, with
/// one subdirectory per manifest id.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    base_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn manifest_dir(&self, manifest_id: &str) -> PathBuf {
        self.base_dir.join(manifest_id)
    }

    pub fn state_path(&self, manifest_id: &str) -> PathBuf {
        self.manifest_dir(manifest_id).join(STATE_FILE)
    }

    pub fn events_path(&self, manifest_id: &str) -> PathBuf {
        protoreg_events::events_path(&self.manifest_dir(manifest_id))
    }

    /// Write `state` atomically via temp-file + fsync + rename, pretty-printed.
    pub fn save(&self, manifest_id: &str, state: &VersionedState) -> Result<()> {
        let path = self.state_path(manifest_id);
        let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        protoreg_events::atomic_write(&path, json.as_bytes())
    }

    /// Load the raw snapshot. Fails if the file is missing or does not parse; callers
    /// that want crash recovery should use [`SnapshotStore::load_with_recovery`].
    pub fn load(&self, manifest_id: &str) -> Result<VersionedState> {
        let path = self.state_path(manifest_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state JSON from {}", path.display()))?;
        Ok(state)
    }

    pub fn exists(&self, manifest_id: &str) -> bool {
        self.state_path(manifest_id).exists()
    }

    pub fn delete(&self, manifest_id: &str) -> Result<()> {
        let path = self.state_path(manifest_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete state file {}", path.display()))?;
        }
        Ok(())
    }

    /// `loadStateWithRecovery` (§4.3): return the snapshot if it parses; otherwise
    /// replay `events.log` from empty state and persist the reconstruction as a new
    /// snapshot; otherwise report `not_found`. A corrupted event-log line surfaces as
    /// `RegistryError::Integrity` carrying the replay failure (fail-stop default).
    pub fn load_with_recovery(
        &self,
        manifest_id: &str,
        event_log: &EventLog,
    ) -> Result<VersionedState, RegistryError> {
        let _ = event_log; // append-path lock table is irrelevant to a read-only replay
        if let Ok(state) = self.load(manifest_id) {
            return Ok(state);
        }

        let events_path = self.events_path(manifest_id);
        let events = protoreg_events::read_from_file(&events_path).map_err(|e| {
            RegistryError::Integrity {
                reason: format!("event log unreadable for {manifest_id}: {e}"),
            }
        })?;

        if events.is_empty() {
            return Err(RegistryError::not_found(format!(
                "manifest {manifest_id}"
            )));
        }

        let reconstructed = protoreg_events::replay(&events).map_err(|e| RegistryError::Integrity {
            reason: format!("event replay failed for {manifest_id}: {e}"),
        })?;

        self.save(manifest_id, &reconstructed)
            .map_err(|e| RegistryError::Integrity {
                reason: format!("failed to persist recovered snapshot for {manifest_id}: {e}"),
            })?;

        Ok(reconstructed)
    }
}

pub fn state_path(manifest_dir: &Path) -> PathBuf {
    manifest_dir.join(STATE_FILE)
}
