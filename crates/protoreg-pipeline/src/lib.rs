//! The registration pipeline: binds the state-machine kernel, the snapshot store,
//! the event log, and the optimistic-lock runtime into the six entry points of
//! §4.4, each a thin wrapper over [`Pipeline::transition`].
//!
//! Observability follows the §9 redesign flags: no event-emitter base class, no
//! prototype-patched metrics. [`Metrics`] is a plain struct of atomic counters
//! composed into the pipeline, and [`Pipeline::subscribe`] registers a plain
//! `Fn(&PipelineNotification)` observer — no inheritance, no callbacks threaded
//! through the retry loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use protoreg_events::EventLog;
use protoreg_kernel::TransitionContext;
use protoreg_persist::SnapshotStore;
use protoreg_retry::{CasOutcome, ComputeOutcome, OptimisticLockError, RetryConfig, VersionedRead};
use protoreg_types::{
    EventEnvelope, EventType, LastTransition, LifecycleEvent, Manifest, ManifestState,
    RegistryError, VersionedState,
};

pub use protoreg_kernel::TransitionContext as Context;

/// Counters for optimistic-lock retries, exhaustions, and already-applied
/// short-circuits (§4.4's observability requirement).
#[derive(Debug, Default)]
pub struct Metrics {
    retries: AtomicU64,
    exhaustions: AtomicU64,
    already_applied: AtomicU64,
}

impl Metrics {
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn exhaustions(&self) -> u64 {
        self.exhaustions.load(Ordering::Relaxed)
    }

    pub fn already_applied(&self) -> u64 {
        self.already_applied.load(Ordering::Relaxed)
    }
}

/// A value-based notification emitted on retries, exhaustion, already-applied
/// short-circuits, and successful transitions. Delivered to every handler
/// registered via [`Pipeline::subscribe`].
#[derive(Debug, Clone)]
pub enum PipelineNotification {
    Created {
        manifest_id: String,
    },
    Retry {
        manifest_id: String,
        attempt: u32,
    },
    Exhausted {
        manifest_id: String,
    },
    AlreadyApplied {
        manifest_id: String,
        event: LifecycleEvent,
    },
    Transitioned {
        manifest_id: String,
        event: LifecycleEvent,
        to: protoreg_types::LifecycleState,
    },
}

type Handler = Box<dyn Fn(&PipelineNotification) + Send + Sync>;

/// Composes kernel + snapshot store + event log + CAS runtime.
pub struct Pipeline {
    snapshots: SnapshotStore,
    events: EventLog,
    retry_cfg: RetryConfig,
    metrics: Metrics,
    subscribers: Mutex<Vec<Handler>>,
}

impl Pipeline {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_retry_config(base_dir, RetryConfig::default())
    }

    pub fn with_retry_config(base_dir: impl Into<PathBuf>, retry_cfg: RetryConfig) -> Self {
        Self {
            snapshots: SnapshotStore::new(base_dir),
            events: EventLog::new(),
            retry_cfg,
            metrics: Metrics::default(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Read the current versioned state without attempting any transition,
    /// recovering from the event log if the snapshot is missing or corrupt.
    pub fn load(&self, manifest_id: &str) -> Result<VersionedState, RegistryError> {
        self.snapshots.load_with_recovery(manifest_id, &self.events)
    }

    /// Register an observer invoked on every notification. No inheritance, no
    /// method attached to a prototype: notification is a value passed to a plain
    /// handler function.
    pub fn subscribe(&self, handler: impl Fn(&PipelineNotification) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Box::new(handler));
    }

    fn notify(&self, notification: PipelineNotification) {
        let subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        for handler in subscribers.iter() {
            handler(&notification);
        }
    }

    fn event_id(manifest_id: &str, suffix: &str) -> String {
        format!(
            "{manifest_id}-{suffix}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    }

    /// `initialize(manifestId, manifest)`: fails if a record already exists.
    pub fn initialize(
        &self,
        manifest_id: &str,
        manifest: Manifest,
    ) -> Result<VersionedState, RegistryError> {
        if self.snapshots.exists(manifest_id)
            || !protoreg_events::read_from_file(&self.snapshots.events_path(manifest_id))
                .unwrap_or_default()
                .is_empty()
        {
            return Err(RegistryError::Conflict {
                reason: format!("manifest {manifest_id} already exists"),
            });
        }

        let now = Utc::now();
        let state = ManifestState {
            current_state: protoreg_types::LifecycleState::Draft,
            manifest: manifest.clone(),
            manifest_id: manifest_id.to_string(),
            created_at: now,
            updated_at: now,
            last_transition: None,
            reviewer: None,
            review_notes: None,
            rejection_reason: None,
        };
        let versioned = VersionedState {
            version: 1,
            state,
            updated_at: now,
        };

        self.snapshots
            .save(manifest_id, &versioned)
            .map_err(|e| RegistryError::Integrity {
                reason: format!("failed to persist initial snapshot: {e}"),
            })?;

        let envelope = EventEnvelope::new(
            Self::event_id(manifest_id, "created"),
            EventType::ManifestCreated,
            manifest_id,
            serde_json::json!({ "manifest": manifest }),
        );
        self.events
            .append(
                manifest_id,
                &self.snapshots.events_path(manifest_id),
                &envelope,
            )
            .map_err(|e| RegistryError::Integrity {
                reason: format!("failed to append manifest.created event: {e}"),
            })?;

        self.notify(PipelineNotification::Created {
            manifest_id: manifest_id.to_string(),
        });

        Ok(versioned)
    }

    pub fn submit_for_review(&self, manifest_id: &str) -> Result<VersionedState, RegistryError> {
        self.transition(
            manifest_id,
            LifecycleEvent::SubmitForReview,
            TransitionContext::default(),
        )
    }

    pub fn approve(
        &self,
        manifest_id: &str,
        reviewer: &str,
        notes: &str,
    ) -> Result<VersionedState, RegistryError> {
        self.transition(
            manifest_id,
            LifecycleEvent::Approve,
            TransitionContext {
                reviewer: Some(reviewer.to_string()),
                review_notes: Some(notes.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn reject(&self, manifest_id: &str, reason: &str) -> Result<VersionedState, RegistryError> {
        self.transition(
            manifest_id,
            LifecycleEvent::Reject,
            TransitionContext {
                rejection_reason: Some(reason.to_string()),
                ..Default::default()
            },
        )
    }

    /// `register(context)`: the caller (normally `protoreg-orchestrator`) supplies
    /// `context.conflicting_urn` after its own catalog conflict check.
    pub fn register(
        &self,
        manifest_id: &str,
        context: TransitionContext,
    ) -> Result<VersionedState, RegistryError> {
        self.transition(manifest_id, LifecycleEvent::Register, context)
    }

    pub fn revert_to_draft(&self, manifest_id: &str) -> Result<VersionedState, RegistryError> {
        self.transition(
            manifest_id,
            LifecycleEvent::RevertToDraft,
            TransitionContext::default(),
        )
    }

    /// CAS (§4.2) -> inside `compute`: consult the kernel (§4.1) -> build the new
    /// state with `lastTransition` and merge in `ctx` -> write snapshot -> append
    /// `state.changed` -> notify subscribers.
    fn transition(
        &self,
        manifest_id: &str,
        event: LifecycleEvent,
        ctx: TransitionContext,
    ) -> Result<VersionedState, RegistryError> {
        let events_path = self.snapshots.events_path(manifest_id);

        let read = || -> Result<VersionedRead<ManifestState>, RegistryError> {
            let versioned = self.snapshots.load_with_recovery(manifest_id, &self.events)?;
            Ok(VersionedRead {
                version: versioned.version,
                state: versioned.state,
            })
        };

        let compute = |current: &ManifestState,
                        attempt: u32|
         -> Result<ComputeOutcome<ManifestState>, RegistryError> {
            if attempt > 1 {
                self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                self.notify(PipelineNotification::Retry {
                    manifest_id: manifest_id.to_string(),
                    attempt,
                });
            }

            if already_applied(current, event) {
                return Ok(ComputeOutcome::AlreadyApplied);
            }

            let target = protoreg_kernel::apply_transition(
                manifest_id,
                current.current_state,
                &current.manifest,
                event,
                &ctx,
            )?;

            let mut next = current.clone();
            next.current_state = target;
            next.last_transition = Some(LastTransition {
                from: current.current_state,
                to: target,
                event,
                timestamp: Utc::now(),
                attempt,
            });
            match event {
                LifecycleEvent::Approve => {
                    next.reviewer = ctx.reviewer.clone();
                    next.review_notes = ctx.review_notes.clone();
                }
                LifecycleEvent::Reject => {
                    next.rejection_reason = ctx.rejection_reason.clone();
                }
                _ => {}
            }
            next.updated_at = Utc::now();
            Ok(ComputeOutcome::Apply(next))
        };

        let write = |version: u64, new_state: &ManifestState| -> Result<(), RegistryError> {
            let versioned = VersionedState {
                version,
                state: new_state.clone(),
                updated_at: new_state.updated_at,
            };
            self.snapshots
                .save(manifest_id, &versioned)
                .map_err(|e| RegistryError::Integrity {
                    reason: format!("failed to persist snapshot: {e}"),
                })?;

            let payload = serde_json::json!({
                "current_state": new_state.current_state,
                "last_transition": new_state.last_transition,
                "reviewer": new_state.reviewer,
                "review_notes": new_state.review_notes,
                "rejection_reason": new_state.rejection_reason,
            });
            let envelope = EventEnvelope::new(
                Self::event_id(manifest_id, "changed"),
                EventType::StateChanged,
                manifest_id,
                payload,
            );
            self.events
                .append(manifest_id, &events_path, &envelope)
                .map_err(|e| RegistryError::Integrity {
                    reason: format!("failed to append state.changed event: {e}"),
                })?;
            Ok(())
        };

        let outcome = protoreg_retry::compare_and_swap(manifest_id, &self.retry_cfg, read, compute, write);

        match outcome {
            Ok(CasOutcome::Applied { version, state }) => {
                self.notify(PipelineNotification::Transitioned {
                    manifest_id: manifest_id.to_string(),
                    event,
                    to: state.current_state,
                });
                Ok(VersionedState {
                    version,
                    updated_at: state.updated_at,
                    state,
                })
            }
            Ok(CasOutcome::AlreadyApplied { version, state }) => {
                self.metrics.already_applied.fetch_add(1, Ordering::Relaxed);
                self.notify(PipelineNotification::AlreadyApplied {
                    manifest_id: manifest_id.to_string(),
                    event,
                });
                Ok(VersionedState {
                    version,
                    updated_at: state.updated_at,
                    state,
                })
            }
            Err(OptimisticLockError::RetryExhausted { attempts, .. }) => {
                self.metrics.exhaustions.fetch_add(1, Ordering::Relaxed);
                self.notify(PipelineNotification::Exhausted {
                    manifest_id: manifest_id.to_string(),
                });
                Err(RegistryError::Conflict {
                    reason: format!(
                        "retry_exhausted for manifest {manifest_id} after {attempts} attempts"
                    ),
                })
            }
            Err(OptimisticLockError::Operation(e)) => Err(e),
        }
    }
}

/// The idempotent-retry check from §4.2: the requested event has already been
/// applied if the persisted `lastTransition.event` matches and the manifest is
/// already sitting in the state that event would have produced.
fn already_applied(current: &ManifestState, event: LifecycleEvent) -> bool {
    match &current.last_transition {
        Some(last) if last.event == event => {
            protoreg_kernel::check_transition(last.from, event) == Some(current.current_state)
                && current.current_state == last.to
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_types::{Governance, LifecycleState, ManifestMetadata, ManifestType, Urn};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_manifest(urn: &str) -> Manifest {
        Manifest {
            urn: Urn::new(urn),
            manifest_type: ManifestType::Api,
            namespace: "commerce".to_string(),
            metadata: ManifestMetadata {
                tags: vec![],
                governance: Governance {
                    owner: "team".to_string(),
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

    #[test]
    fn happy_path_drives_draft_to_approved() {
        let dir = tempdir().expect("tmp");
        let pipeline = Pipeline::new(dir.path());

        let created = pipeline
            .initialize("M1", sample_manifest("urn:svc:a"))
            .expect("initialize");
        assert_eq!(created.version, 1);
        assert_eq!(created.state.current_state, LifecycleState::Draft);

        let reviewed = pipeline.submit_for_review("M1").expect("submit");
        assert_eq!(reviewed.version, 2);
        assert_eq!(reviewed.state.current_state, LifecycleState::Reviewed);

        let approved = pipeline.approve("M1", "alice", "ok").expect("approve");
        assert_eq!(approved.version, 3);
        assert_eq!(approved.state.current_state, LifecycleState::Approved);
        assert_eq!(approved.state.reviewer.as_deref(), Some("alice"));
    }

    #[test]
    fn initialize_rejects_duplicate_manifest_id() {
        let dir = tempdir().expect("tmp");
        let pipeline = Pipeline::new(dir.path());
        pipeline
            .initialize("M1", sample_manifest("urn:svc:a"))
            .expect("first init");
        let err = pipeline
            .initialize("M1", sample_manifest("urn:svc:b"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[test]
    fn guard_failure_leaves_version_and_state_unchanged() {
        let dir = tempdir().expect("tmp");
        let pipeline = Pipeline::new(dir.path());
        pipeline
            .initialize("M3", sample_manifest("urn:svc:b"))
            .expect("init");
        pipeline.submit_for_review("M3").expect("submit");

        let err = pipeline.approve("M3", "", "").unwrap_err();
        assert!(matches!(err, RegistryError::GuardFailed { .. }));

        let current = pipeline.snapshots().load("M3").expect("load");
        assert_eq!(current.version, 2);
        assert_eq!(current.state.current_state, LifecycleState::Reviewed);
    }

    #[test]
    fn retrying_a_successful_transition_is_a_no_op() {
        let dir = tempdir().expect("tmp");
        let pipeline = Pipeline::new(dir.path());
        pipeline
            .initialize("M4", sample_manifest("urn:svc:c"))
            .expect("init");

        let first = pipeline.submit_for_review("M4").expect("first submit");
        let second = pipeline.submit_for_review("M4").expect("retry submit");

        assert_eq!(first.version, second.version);
        let events = protoreg_events::read_from_file(&pipeline.snapshots().events_path("M4"))
            .expect("read events");
        let changed_count = events
            .iter()
            .filter(|e| e.event_type == EventType::StateChanged)
            .count();
        assert_eq!(changed_count, 1);
        assert!(pipeline.metrics().already_applied() >= 1);
    }

    #[test]
    fn subscribers_observe_transition_notifications() {
        let dir = tempdir().expect("tmp");
        let pipeline = Pipeline::new(dir.path());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        pipeline.subscribe(move |notification| {
            if matches!(notification, PipelineNotification::Transitioned { .. }) {
                seen_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        pipeline
            .initialize("M5", sample_manifest("urn:svc:d"))
            .expect("init");
        pipeline.submit_for_review("M5").expect("submit");

        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
