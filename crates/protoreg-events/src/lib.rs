//! Atomic file writes and the append-only event log.
//!
//! Two leaf responsibilities live here:
//! - [`atomic_write`] — durable write of a byte buffer via temp-file + fsync + rename,
//!   shared by this crate's own log rotation and by `protoreg-persist`'s snapshots.
//! - [`EventLog`] — an append-only JSON-Lines log per manifest, guarded by a
//!   per-manifest write mutex so that concurrent appenders on the same file cannot
//!   interleave an append with its fsync (§5's file-system race fix).
//!
//! Event replay ([`replay`]) reconstructs a [`VersionedState`] from a manifest's full
//! event history; `protoreg-persist` uses it for crash recovery when `state.json` is
//! missing or corrupt.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use protoreg_types::{EventEnvelope, EventType, LastTransition, Manifest, ManifestState, VersionedState};

/// Default event-log file name under a manifest's directory.
pub const EVENTS_FILE: &str = "events.log";

/// The events-log path for a manifest's state directory.
pub fn events_path(manifest_dir: &Path) -> PathBuf {
    manifest_dir.join(EVENTS_FILE)
}

/// Durable write of `bytes` to `path` via temp-file + fsync + atomic rename.
///
/// The temp file lives alongside the destination (same filesystem, so the rename is
/// atomic) and is named by appending `.tmp` to the destination's file name.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file {}", tmp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Append-only, per-manifest event log writer.
///
/// Holds one `Mutex<()>` per manifest id so that the append+fsync pair for a given
/// manifest is serialized across concurrent callers, without serializing writers on
/// distinct manifests against each other.
#[derive(Debug, Default)]
pub struct EventLog {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, manifest_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("event log lock table poisoned");
        locks
            .entry(manifest_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one event to `path`, syncing before returning. Serialized per
    /// `manifest_id` via the guard table above.
    pub fn append(&self, manifest_id: &str, path: &Path, event: &EventEnvelope) -> Result<()> {
        let manifest_lock = self.lock_for(manifest_id);
        let _guard = manifest_lock
            .lock()
            .expect("per-manifest event log mutex poisoned");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(event).context("failed to serialize event")?;
        writeln!(writer, "{line}").context("failed to write event line")?;
        writer.flush().context("failed to flush events file")?;
        writer
            .get_ref()
            .sync_all()
            .context("failed to fsync events file")?;

        Ok(())
    }
}

/// Read every event from `path` in order. Returns an empty vector if the file does
/// not exist. A malformed line is a fatal parse error carrying the offending line
/// number (§4.3's default fail-stop behavior; no skip-and-log mode is implemented).
pub fn read_from_file(path: &Path) -> Result<Vec<EventEnvelope>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", line_no + 1, path.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event: EventEnvelope = serde_json::from_str(&line).with_context(|| {
            format!(
                "corrupted event log: line {} of {} is not valid JSON",
                line_no + 1,
                path.display()
            )
        })?;
        events.push(event);
    }

    Ok(events)
}

/// Reconstruct a [`VersionedState`] by replaying a manifest's full event history from
/// empty state. Deterministic and order-preserving: `manifest.created` seeds the
/// state, each `state.changed` event applies its recorded transition;
/// `registration.completed`, `integration.completed` and `error.occurred` are
/// informational and do not affect state. The replayed snapshot's version is
/// always reset to 1 (§8 scenario 5): version is a CAS counter over
/// `state.json` writes, not a property of the replayed state itself, so a
/// reconstruction after crash recovery starts that counter over regardless of
/// how many transitions the manifest went through before the crash.
pub fn replay(events: &[EventEnvelope]) -> Result<VersionedState> {
    let mut state: Option<ManifestState> = None;
    let mut seen_creation = false;
    let mut updated_at = chrono::Utc::now();

    for event in events {
        match event.event_type {
            EventType::ManifestCreated => {
                let manifest: Manifest = serde_json::from_value(
                    event
                        .payload
                        .get("manifest")
                        .cloned()
                        .context("manifest.created event missing `manifest` payload field")?,
                )
                .context("manifest.created payload did not contain a valid manifest")?;
                let created_at = event.timestamp;
                state = Some(ManifestState {
                    current_state: protoreg_types::LifecycleState::Draft,
                    manifest,
                    manifest_id: event.manifest_id.clone(),
                    created_at,
                    updated_at: created_at,
                    last_transition: None,
                    reviewer: None,
                    review_notes: None,
                    rejection_reason: None,
                });
                seen_creation = true;
                updated_at = created_at;
            }
            EventType::StateChanged => {
                let current = state
                    .as_mut()
                    .context("state.changed event before manifest.created")?;
                if let Some(value) = event.payload.get("current_state") {
                    current.current_state = serde_json::from_value(value.clone())
                        .context("invalid current_state in state.changed payload")?;
                }
                if let Some(value) = event.payload.get("last_transition") {
                    current.last_transition = Some(
                        serde_json::from_value::<LastTransition>(value.clone())
                            .context("invalid last_transition in state.changed payload")?,
                    );
                }
                if let Some(value) = event.payload.get("reviewer") {
                    current.reviewer = serde_json::from_value(value.clone()).unwrap_or(None);
                }
                if let Some(value) = event.payload.get("review_notes") {
                    current.review_notes = serde_json::from_value(value.clone()).unwrap_or(None);
                }
                if let Some(value) = event.payload.get("rejection_reason") {
                    current.rejection_reason =
                        serde_json::from_value(value.clone()).unwrap_or(None);
                }
                current.updated_at = event.timestamp;
                updated_at = event.timestamp;
            }
            EventType::RegistrationCompleted
            | EventType::IntegrationCompleted
            | EventType::ErrorOccurred => {
                // Informational: does not affect persisted version or state.
            }
        }
    }

    let state = state.context("no manifest.created event found; cannot reconstruct state")?;
    if !seen_creation {
        bail!("event replay produced no versioned state");
    }

    Ok(VersionedState {
        version: 1,
        state,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_types::{Governance, LifecycleEvent, LifecycleState, ManifestMetadata, ManifestType, Urn};
    use tempfile::tempdir;

    fn sample_manifest() -> Manifest {
        Manifest {
            urn: Urn::new("urn:svc:orders"),
            manifest_type: ManifestType::Api,
            namespace: "commerce".to_string(),
            metadata: ManifestMetadata {
                tags: vec!["billing".to_string()],
                governance: Governance {
                    owner: "team-commerce".to_string(),
                    classification: "internal".to_string(),
                    pii: false,
                },
            },
            dependencies: vec![],
            agent: None,
            api: None,
            extra: serde_json::Map::new(),
        }
    }

    fn created_event(manifest_id: &str, manifest: &Manifest) -> EventEnvelope {
        EventEnvelope::new(
            "evt-1",
            EventType::ManifestCreated,
            manifest_id,
            serde_json::json!({ "manifest": manifest }),
        )
    }

    fn state_changed_event(
        manifest_id: &str,
        to: LifecycleState,
        event: LifecycleEvent,
        from: LifecycleState,
    ) -> EventEnvelope {
        let transition = LastTransition {
            from,
            to,
            event,
            timestamp: chrono::Utc::now(),
            attempt: 1,
        };
        EventEnvelope::new(
            "evt-2",
            EventType::StateChanged,
            manifest_id,
            serde_json::json!({
                "current_state": to,
                "last_transition": transition,
            }),
        )
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("state.json");
        atomic_write(&path, b"{\"hello\":\"world\"}").expect("write");
        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content, "{\"hello\":\"world\"}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn event_log_append_then_read_back() {
        let dir = tempdir().expect("tmp");
        let path = events_path(dir.path());
        let log = EventLog::new();

        let manifest = sample_manifest();
        log.append("m1", &path, &created_event("m1", &manifest))
            .expect("append 1");
        log.append(
            "m1",
            &path,
            &state_changed_event(
                "m1",
                LifecycleState::Reviewed,
                LifecycleEvent::SubmitForReview,
                LifecycleState::Draft,
            ),
        )
        .expect("append 2");

        let events = read_from_file(&path).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::ManifestCreated);
        assert_eq!(events[1].event_type, EventType::StateChanged);
    }

    #[test]
    fn read_from_file_returns_empty_when_missing() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("missing.log");
        let events = read_from_file(&path).expect("read");
        assert!(events.is_empty());
    }

    #[test]
    fn read_from_file_fails_on_corrupted_line() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("events.log");
        fs::write(&path, "not json\n").expect("write");
        let err = read_from_file(&path).expect_err("should fail");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn replay_reconstructs_state_from_full_history() {
        let manifest = sample_manifest();
        let events = vec![
            created_event("m1", &manifest),
            state_changed_event(
                "m1",
                LifecycleState::Reviewed,
                LifecycleEvent::SubmitForReview,
                LifecycleState::Draft,
            ),
            state_changed_event(
                "m1",
                LifecycleState::Approved,
                LifecycleEvent::Approve,
                LifecycleState::Reviewed,
            ),
        ];

        let versioned = replay(&events).expect("replay");
        assert_eq!(versioned.version, 1);
        assert_eq!(versioned.state.current_state, LifecycleState::Approved);
        assert_eq!(versioned.state.manifest_id, "m1");
    }

    #[test]
    fn replay_resets_version_to_one_regardless_of_transition_count() {
        let manifest = sample_manifest();
        let mut events = vec![
            created_event("m1", &manifest),
            state_changed_event(
                "m1",
                LifecycleState::Reviewed,
                LifecycleEvent::SubmitForReview,
                LifecycleState::Draft,
            ),
        ];
        events.push(EventEnvelope::new(
            "evt-3",
            EventType::RegistrationCompleted,
            "m1",
            serde_json::json!({}),
        ));

        let versioned = replay(&events).expect("replay");
        assert_eq!(versioned.version, 1);
    }

    #[test]
    fn replay_fails_without_manifest_created() {
        let events = vec![state_changed_event(
            "m1",
            LifecycleState::Reviewed,
            LifecycleEvent::SubmitForReview,
            LifecycleState::Draft,
        )];
        let err = replay(&events).expect_err("should fail");
        assert!(err.to_string().contains("manifest.created"));
    }
}
