//! Registration fan-out: binds the catalog and dependency graph at the
//! moment a manifest is registered (spec §4.7).
//!
//! The six phases run in a fixed order: URN conflict check, batch
//! preparation, catalog insert, graph batch apply, a post-condition cycle
//! check, then event emission. Graph errors are collected rather than
//! aborting the batch (§4.7: "the batch always completes"); only the
//! conflict check itself can stop registration before anything is written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use protoreg_catalog::Catalog;
use protoreg_events::EventLog;
use protoreg_graph::{EdgeKind, EdgeSpec, Graph, MissingTargetPolicy, NodeSpec};
use protoreg_types::{EventEnvelope, EventType, Manifest, ManifestType, RegistryError, Urn};

/// Per-phase timings for one registration, in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct PhaseTimings {
    pub conflict_check_ms: f64,
    pub catalog_write_ms: f64,
    pub graph_update_ms: f64,
    pub total_ms: f64,
}

/// What `register` (successfully) returns: the manifest's final location in
/// the catalog/graph, the node/edge counts produced, and any non-fatal
/// warnings surfaced along the way.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    pub urn: Urn,
    pub nodes_added: usize,
    pub edges_added: usize,
    pub placeholders_inserted: Vec<Urn>,
    pub graph_errors: Vec<String>,
    pub cycle_warning: Option<Vec<Urn>>,
    pub timings: PhaseTimings,
    pub catalog_size: usize,
}

/// What `unregister` returns: both sub-operations are attempted
/// unconditionally and each outcome is reported independently.
#[derive(Debug, Clone)]
pub struct UnregistrationResult {
    pub catalog_removed: Result<(), String>,
    pub graph_node_present_after: bool,
}

/// Running averages, last-operation snapshot, and error/conflict counters
/// for the writer, in the same shape as `protoreg-pipeline`'s `Metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    registrations: AtomicU64,
    conflicts: AtomicU64,
    errors: AtomicU64,
    total_duration_ms: Mutex<f64>,
    last_duration_ms: Mutex<f64>,
}

impl Metrics {
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn average_duration_ms(&self) -> f64 {
        let count = self.registrations();
        if count == 0 {
            return 0.0;
        }
        *self.total_duration_ms.lock().expect("metrics lock poisoned") / count as f64
    }

    pub fn last_duration_ms(&self) -> f64 {
        *self.last_duration_ms.lock().expect("metrics lock poisoned")
    }

    fn record_success(&self, duration_ms: f64) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        *self.total_duration_ms.lock().expect("metrics lock poisoned") += duration_ms;
        *self.last_duration_ms.lock().expect("metrics lock poisoned") = duration_ms;
    }

    fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Composes a catalog and a dependency graph under one registration
/// surface; also owns the event log handle so it can append
/// `registration.completed` itself.
pub struct Writer {
    catalog: Catalog,
    graph: Graph,
    events: EventLog,
    metrics: Metrics,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(),
            graph: Graph::new(),
            events: EventLog::new(),
            metrics: Metrics::default(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The six phases of §4.7, in order.
    pub fn register(
        &self,
        manifest_id: &str,
        manifest: Manifest,
        events_path: &std::path::Path,
    ) -> Result<RegistrationResult, RegistryError> {
        let total_start = Instant::now();

        // Phase 1: URN conflict check.
        let conflict_start = Instant::now();
        if self.catalog.contains(&manifest.urn) {
            self.metrics.record_conflict();
            return Err(RegistryError::Conflict {
                reason: format!("urn_conflict: {} is already registered", manifest.urn),
            });
        }
        let conflict_check_ms = conflict_start.elapsed().as_secs_f64() * 1000.0;

        // Phase 2: prepare batch (primary node + dependency edges + API endpoint children).
        let primary_kind = manifest.manifest_type;
        let mut nodes = vec![NodeSpec {
            urn: manifest.urn.clone(),
            kind: primary_kind,
        }];
        let mut edges: Vec<EdgeSpec> = manifest
            .dependencies
            .iter()
            .map(|dep| EdgeSpec {
                from: manifest.urn.clone(),
                kind: EdgeKind::DependsOn,
                to: dep.clone(),
            })
            .collect();

        if let Some(api) = &manifest.api {
            for endpoint in &api.endpoints {
                let endpoint_urn = Urn::new(format!(
                    "{}#{} {}",
                    manifest.urn, endpoint.method, endpoint.path
                ));
                nodes.push(NodeSpec {
                    urn: endpoint_urn.clone(),
                    kind: ManifestType::Api,
                });
                edges.push(EdgeSpec {
                    from: manifest.urn.clone(),
                    kind: EdgeKind::Exposes,
                    to: endpoint_urn,
                });
            }
        }

        // Phase 3: catalog add (idempotent insert; conflict was already ruled out above).
        let catalog_start = Instant::now();
        self.catalog.add(manifest.clone()).map_err(|e| {
            self.metrics.record_error();
            RegistryError::Internal {
                reason: format!("catalog add failed after conflict check passed: {e}"),
            }
        })?;
        let catalog_write_ms = catalog_start.elapsed().as_secs_f64() * 1000.0;

        // Phase 4: graph batch apply. Per-edge errors are collected, not fatal.
        let graph_start = Instant::now();
        let batch = self
            .graph
            .apply_batch(nodes, edges, MissingTargetPolicy::InsertPlaceholder);
        let graph_update_ms = graph_start.elapsed().as_secs_f64() * 1000.0;
        if !batch.errors.is_empty() {
            self.metrics.record_error();
            tracing::warn!(manifest_id, errors = ?batch.errors, "graph batch apply reported errors");
        }

        // Phase 5: post-condition cycle check. Warn only; never rolls back.
        let cycle_report = self.graph.detect_cycles();
        let cycle_warning = cycle_report.first_cycle.filter(|_| cycle_report.count > 0);
        if cycle_warning.is_some() {
            tracing::warn!(manifest_id, "registration introduced a dependency cycle");
        }

        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        let timings = PhaseTimings {
            conflict_check_ms,
            catalog_write_ms,
            graph_update_ms,
            total_ms,
        };

        // Phase 6: event emission.
        let envelope = EventEnvelope::new(
            format!("{manifest_id}-registration-completed"),
            EventType::RegistrationCompleted,
            manifest_id,
            serde_json::json!({
                "timings_ms": {
                    "conflict_check": timings.conflict_check_ms,
                    "catalog_write": timings.catalog_write_ms,
                    "graph_update": timings.graph_update_ms,
                    "total": timings.total_ms,
                },
                "catalog_size": self.catalog.len(),
                "graph_errors": batch.errors,
            }),
        );
        self.events
            .append(manifest_id, events_path, &envelope)
            .map_err(|e| RegistryError::Integrity {
                reason: format!("failed to append registration.completed event: {e}"),
            })?;

        self.metrics.record_success(total_ms);

        Ok(RegistrationResult {
            urn: manifest.urn,
            nodes_added: batch.nodes_added,
            edges_added: batch.edges_added,
            placeholders_inserted: batch.placeholders_inserted,
            graph_errors: batch.errors,
            cycle_warning,
            timings,
            catalog_size: self.catalog.len(),
        })
    }

    /// Both sub-steps are attempted even if one fails; neither outcome is
    /// contingent on the other.
    pub fn unregister(&self, urn: &Urn) -> UnregistrationResult {
        let catalog_removed = self.catalog.remove(urn).map(|_| ()).map_err(|e| e.to_string());
        // The graph keeps placeholder-safe history: the node itself is left
        // in place (other manifests may still reference it), only its
        // primary-catalog presence is retracted.
        let graph_node_present_after = self.graph.has_node(urn);
        UnregistrationResult {
            catalog_removed,
            graph_node_present_after,
        }
    }
}
