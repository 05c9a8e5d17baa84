//! Composition root for the protocol-manifest registry.
//!
//! [`RegistryService`] binds one [`Pipeline`], one [`Writer`], and the typed
//! [`Config`] behind a single facade, one core library crate composing a
//! set of micro-crates behind one public surface. `protoreg-server` is the
//! only intended caller: it owns one `RegistryService` per process and
//! translates HTTP requests into facade calls, keeping every lifecycle
//! rule, index, and graph invariant out of the transport layer.

use protoreg_catalog::{Catalog, GovernanceCriteria, QueryResult};
use protoreg_config::Config;
use protoreg_graph::Graph;
use protoreg_orchestrator::{OrchestrationResult, Orchestrator};
use protoreg_pipeline::{Metrics as PipelineMetrics, Pipeline, PipelineNotification};
use protoreg_types::{Manifest, RegistryError, Urn, VersionedState};
use protoreg_writer::{Metrics as WriterMetrics, UnregistrationResult, Writer};

/// A read-only snapshot of both metrics structs, for a `/health`- or
/// metrics-style endpoint to serialize.
#[derive(Debug, Clone, Copy)]
pub struct ServiceMetrics {
    pub pipeline_retries: u64,
    pub pipeline_exhaustions: u64,
    pub pipeline_already_applied: u64,
    pub writer_registrations: u64,
    pub writer_conflicts: u64,
    pub writer_errors: u64,
    pub writer_average_duration_ms: f64,
    pub writer_last_duration_ms: f64,
    pub catalog_size: usize,
    pub graph_nodes: usize,
}

/// Owns the pipeline, the writer, and the config they were built from.
/// One instance per running server process.
pub struct RegistryService {
    config: Config,
    pipeline: Pipeline,
    writer: Writer,
}

impl RegistryService {
    pub fn new(config: Config) -> Self {
        let pipeline = Pipeline::with_retry_config(
            config.base_dir.clone(),
            config.retry_config.clone(),
        );
        Self {
            config,
            pipeline,
            writer: Writer::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn catalog(&self) -> &Catalog {
        self.writer.catalog()
    }

    pub fn graph(&self) -> &Graph {
        self.writer.graph()
    }

    /// Registers a notification observer on the underlying pipeline (§4.4).
    pub fn on_pipeline_event(&self, handler: impl Fn(&PipelineNotification) + Send + Sync + 'static) {
        self.pipeline.subscribe(handler);
    }

    // -- Lifecycle (§4.4, delegated) --------------------------------------

    pub fn submit_manifest(
        &self,
        manifest_id: &str,
        manifest: Manifest,
    ) -> Result<VersionedState, RegistryError> {
        self.pipeline.initialize(manifest_id, manifest)
    }

    pub fn submit_for_review(&self, manifest_id: &str) -> Result<VersionedState, RegistryError> {
        self.pipeline.submit_for_review(manifest_id)
    }

    pub fn approve(
        &self,
        manifest_id: &str,
        reviewer: &str,
        notes: &str,
    ) -> Result<VersionedState, RegistryError> {
        self.pipeline.approve(manifest_id, reviewer, notes)
    }

    pub fn reject(&self, manifest_id: &str, reason: &str) -> Result<VersionedState, RegistryError> {
        self.pipeline.reject(manifest_id, reason)
    }

    pub fn revert_to_draft(&self, manifest_id: &str) -> Result<VersionedState, RegistryError> {
        self.pipeline.revert_to_draft(manifest_id)
    }

    pub fn state(&self, manifest_id: &str) -> Result<VersionedState, RegistryError> {
        self.pipeline.load(manifest_id)
    }

    // -- Registration (§4.8, delegated) -----------------------------------

    /// Drives `APPROVED -> REGISTERED` and fans the manifest out to the
    /// catalog and graph, via a freshly bound [`Orchestrator`].
    pub fn register(&self, manifest_id: &str) -> Result<OrchestrationResult, RegistryError> {
        let result = Orchestrator::new(&self.pipeline, &self.writer).register(manifest_id);
        match &result {
            Ok(outcome) => tracing::info!(manifest_id, urn = %outcome.registration.urn, "manifest registered"),
            Err(e) => tracing::warn!(manifest_id, error = %e, "registration failed"),
        }
        result
    }

    pub fn unregister(&self, urn: &Urn) -> UnregistrationResult {
        tracing::info!(%urn, "manifest unregistered");
        self.writer.unregister(urn)
    }

    // -- Discovery (§4.5, §4.6, delegated) --------------------------------

    pub fn resolve(&self, urn: &Urn) -> Option<Manifest> {
        self.catalog().get(urn)
    }

    pub fn find_by_governance(&self, criteria: &GovernanceCriteria) -> QueryResult<Urn> {
        self.catalog().find_by_governance(criteria)
    }

    pub fn find_by_tags_or(&self, tags: &[String]) -> QueryResult<Urn> {
        self.catalog().find_by_tags_or(tags)
    }

    pub fn find_references(&self, urn: &Urn) -> QueryResult<Urn> {
        self.catalog().find_references(urn)
    }

    /// `findAgentsForApi`: computes `apiUrn`'s consumers via the graph, then
    /// intersects against the catalog's workflow-indexed agents. Kept as a
    /// two-crate join here rather than inside `protoreg-catalog` itself, so
    /// the catalog never depends on the graph crate.
    pub fn find_agents_for_api(&self, api_urn: &Urn) -> QueryResult<Urn> {
        let consumers = self.graph().find_consumers(api_urn);
        self.catalog().find_agents_for_api(&consumers)
    }

    pub fn dependency_tree(&self, urn: &Urn) -> Vec<Urn> {
        self.graph().get_dependency_tree(urn)
    }

    pub fn build_order(&self) -> Result<Vec<Urn>, RegistryError> {
        self.graph().build_order()
    }

    // -- Observability ------------------------------------------------------

    pub fn metrics(&self) -> ServiceMetrics {
        let pipeline: &PipelineMetrics = self.pipeline.metrics();
        let writer: &WriterMetrics = self.writer.metrics();
        ServiceMetrics {
            pipeline_retries: pipeline.retries(),
            pipeline_exhaustions: pipeline.exhaustions(),
            pipeline_already_applied: pipeline.already_applied(),
            writer_registrations: writer.registrations(),
            writer_conflicts: writer.conflicts(),
            writer_errors: writer.errors(),
            writer_average_duration_ms: writer.average_duration_ms(),
            writer_last_duration_ms: writer.last_duration_ms(),
            catalog_size: self.catalog().len(),
            graph_nodes: self.graph().node_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_types::{Governance, ManifestMetadata, ManifestType};
    use tempfile::tempdir;

    fn manifest(urn: &str) -> Manifest {
        Manifest {
            urn: Urn::new(urn),
            manifest_type: ManifestType::Api,
            namespace: "commerce".to_string(),
            metadata: ManifestMetadata {
                tags: vec!["checkout".to_string()],
                governance: Governance {
                    owner: "team-orders".to_string(),
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

    fn service(dir: &std::path::Path) -> RegistryService {
        let mut config = Config::new();
        config.api_key = Some("test-key".to_string());
        config.base_dir = dir.to_path_buf();
        RegistryService::new(config)
    }

    #[test]
    fn facade_drives_a_manifest_from_draft_to_catalog() {
        let dir = tempdir().expect("tmp");
        let service = service(dir.path());

        service
            .submit_manifest("m1", manifest("urn:svc:orders"))
            .expect("submit");
        service.submit_for_review("m1").expect("review");
        service.approve("m1", "alice", "looks good").expect("approve");
        let result = service.register("m1").expect("register");

        assert_eq!(
            result.state.state.current_state,
            protoreg_types::LifecycleState::Registered
        );
        assert!(service.resolve(&Urn::new("urn:svc:orders")).is_some());

        let metrics = service.metrics();
        assert_eq!(metrics.writer_registrations, 1);
        assert_eq!(metrics.catalog_size, 1);
    }

    #[test]
    fn facade_rejects_registering_an_unapproved_manifest() {
        let dir = tempdir().expect("tmp");
        let service = service(dir.path());

        service
            .submit_manifest("m1", manifest("urn:svc:orders"))
            .expect("submit");
        let err = service.register("m1").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::GuardFailed { .. } | RegistryError::Conflict { .. }
        ));
    }

    #[test]
    fn subscribers_observe_lifecycle_notifications_through_the_facade() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempdir().expect("tmp");
        let service = service(dir.path());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        service.on_pipeline_event(move |_| {
            seen_clone.fetch_add(1, Ordering::Relaxed);
        });

        service
            .submit_manifest("m1", manifest("urn:svc:orders"))
            .expect("submit");
        service.submit_for_review("m1").expect("review");

        assert!(seen.load(Ordering::Relaxed) >= 2);
    }
}
