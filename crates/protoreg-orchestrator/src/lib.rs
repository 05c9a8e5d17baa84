//! Thin binding of the registration pipeline to the registry writer at the
//! `REGISTER` transition (spec §4.8). This crate adds no state of its own:
//! it sequences a pipeline load, a catalog conflict check, the pipeline's
//! `APPROVED -> REGISTERED` transition, the writer's fan-out, and a final
//! `integration.completed` event.

use protoreg_kernel::TransitionContext;
use protoreg_pipeline::Pipeline;
use protoreg_types::{EventEnvelope, EventType, RegistryError, Urn, VersionedState};
use protoreg_writer::{RegistrationResult, Writer};

/// Everything the orchestrator did, end to end.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub state: VersionedState,
    pub registration: RegistrationResult,
}

/// Binds one [`Pipeline`] to one [`Writer`]. Neither owns the other; both
/// are expected to share the same manifest id space.
pub struct Orchestrator<'a> {
    pipeline: &'a Pipeline,
    writer: &'a Writer,
}

impl<'a> Orchestrator<'a> {
    pub fn new(pipeline: &'a Pipeline, writer: &'a Writer) -> Self {
        Self { pipeline, writer }
    }

    /// `register(manifestId)`, per §4.8:
    /// 1. Load current state; error if missing.
    /// 2. Catalog conflict check; error if conflict.
    /// 3. Transition `APPROVED -> REGISTERED` via the pipeline (which guards
    ///    on URN presence and, via the context below, on the conflict check
    ///    just performed).
    /// 4. Invoke the registry writer with the manifest and reviewer context.
    /// 5. Append `integration.completed` summarizing both phases.
    /// 6. Return the aggregated result.
    pub fn register(&self, manifest_id: &str) -> Result<OrchestrationResult, RegistryError> {
        let events_path = self.pipeline.snapshots().events_path(manifest_id);

        let current = match self.pipeline.load(manifest_id) {
            Ok(state) => state,
            Err(e) => return Err(self.fail(manifest_id, &events_path, e)),
        };

        let conflicting_urn = if self.writer.catalog().contains(&current.state.manifest.urn) {
            Some(current.state.manifest.urn.clone())
        } else {
            None
        };
        if conflicting_urn.is_some() {
            let err = RegistryError::Conflict {
                reason: format!(
                    "urn_conflict: {} is already present in the catalog",
                    current.state.manifest.urn
                ),
            };
            return Err(self.fail(manifest_id, &events_path, err));
        }

        let transitioned = match self.pipeline.register(
            manifest_id,
            TransitionContext {
                conflicting_urn,
                ..Default::default()
            },
        ) {
            Ok(state) => state,
            Err(e) => return Err(self.fail(manifest_id, &events_path, e)),
        };

        let registration = match self.writer.register(
            manifest_id,
            transitioned.state.manifest.clone(),
            &events_path,
        ) {
            Ok(registration) => registration,
            Err(e) => return Err(self.fail(manifest_id, &events_path, e)),
        };

        let envelope = EventEnvelope::new(
            format!("{manifest_id}-integration-completed"),
            EventType::IntegrationCompleted,
            manifest_id,
            serde_json::json!({
                "urn": registration.urn,
                "catalog_size": registration.catalog_size,
                "nodes_added": registration.nodes_added,
                "edges_added": registration.edges_added,
            }),
        );
        if let Err(e) = append_event(&events_path, manifest_id, envelope) {
            return Err(self.fail(manifest_id, &events_path, e));
        }

        Ok(OrchestrationResult {
            state: transitioned,
            registration,
        })
    }

    /// Appends `error.occurred` against the manifest (§4.8 step 6) and
    /// returns `err` unchanged for the caller to propagate. The append is
    /// best-effort: a logging failure must not mask the original error.
    fn fail(&self, manifest_id: &str, events_path: &std::path::Path, err: RegistryError) -> RegistryError {
        let envelope = EventEnvelope::new(
            format!("{manifest_id}-error-occurred"),
            EventType::ErrorOccurred,
            manifest_id,
            serde_json::json!({ "reason": err.to_string() }),
        );
        if let Err(log_err) = append_event(events_path, manifest_id, envelope) {
            tracing::warn!(manifest_id, error = %log_err, "failed to append error.occurred event");
        }
        err
    }
}

fn append_event(
    events_path: &std::path::Path,
    manifest_id: &str,
    envelope: EventEnvelope,
) -> Result<(), RegistryError> {
    let log = protoreg_events::EventLog::new();
    log.append(manifest_id, events_path, &envelope)
        .map_err(|e| RegistryError::Integrity {
            reason: format!("failed to append {} event: {e}", envelope.event_type),
        })
}

/// Convenience used by callers that already have a URN handy and want a
/// typed lookup rather than string comparison.
pub fn urn_of(state: &VersionedState) -> &Urn {
    &state.state.manifest.urn
}
