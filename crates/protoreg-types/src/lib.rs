//! # protoreg-types
//!
//! Core domain types for the protocol-manifest registry:
//! - [`Urn`] - opaque catalog key
//! - [`Manifest`] - structured description of an API, dataset, event, workflow, or agent
//! - [`LifecycleState`] / [`LifecycleEvent`] - the registration state machine's vocabulary
//! - [`VersionedState`] - the persisted `{version, state, updatedAt}` envelope
//! - [`EventEnvelope`] / [`EventType`] - the append-only event-log record shape
//! - [`RegistryError`] - the closed error taxonomy shared by every core crate
//!
//! Timestamps are `DateTime<Utc>` (via `chrono`'s `serde` feature) throughout; every
//! type here round-trips through `serde_json` with no custom `Deserialize` impls beyond
//! what `derive` produces, so the on-disk and wire representations are the same.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque, catalog-unique identifier for a manifest.
///
/// A `Urn` is treated as a flat string key for primary lookup; callers may also read
/// structure into it (e.g. `urn:namespace:name`), but the registry itself never parses it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Urn {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Urn {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for Urn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The type-specific shape a manifest declares via its `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestType {
    Api,
    Data,
    Event,
    Workflow,
    Agent,
    Semantic,
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManifestType::Api => "api",
            ManifestType::Data => "data",
            ManifestType::Event => "event",
            ManifestType::Workflow => "workflow",
            ManifestType::Agent => "agent",
            ManifestType::Semantic => "semantic",
        };
        f.write_str(s)
    }
}

/// Ownership and data-handling metadata carried by every manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Governance {
    pub owner: String,
    pub classification: String,
    #[serde(default)]
    pub pii: bool,
}

/// The manifest's required metadata block: tags plus governance.
///
/// `tags` is an ordered sequence; duplicates are permitted here and are only
/// de-duplicated when the catalog indexes a manifest (see `protoreg-catalog`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    pub governance: Governance,
}

/// One HTTP-shaped endpoint exposed by an `api`-typed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Type-specific shape for `api` manifests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiSpec {
    #[serde(default)]
    pub endpoints: Vec<ApiEndpoint>,
}

/// Type-specific shape for `agent` manifests: the four capability arrays that feed
/// the catalog's agent-discovery indexes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub workflows: Vec<Urn>,
    #[serde(default)]
    pub apis: Vec<Urn>,
}

/// A structured description of an API, dataset, event, workflow, or agent: the unit
/// of registration.
///
/// Manifests are treated as immutable once `REGISTERED`; re-registration requires a
/// new URN or an unregister-then-register cycle (enforced by `protoreg-pipeline` and
/// `protoreg-writer`, not by this type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub manifest_type: ManifestType,
    pub namespace: String,
    pub metadata: ManifestMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSpec>,
    /// Any additional type-specific fields not modeled above, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    /// SHA-256 hex digest over the manifest's canonical JSON form: `serde_json`'s
    /// default `Map` is key-sorted (the `preserve_order` feature is never enabled in
    /// this workspace), so `serde_json::to_vec` already yields sorted-key, whitespace-free
    /// bytes — no separate canonicalization pass is needed.
    pub fn digest(&self) -> Result<String, RegistryError> {
        let bytes = serde_json::to_vec(self).map_err(|e| RegistryError::Internal {
            reason: format!("manifest serialization failed: {e}"),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// The enumeration of registration-lifecycle states. `Registered` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Draft,
    Reviewed,
    Approved,
    Registered,
    Rejected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Draft => "DRAFT",
            LifecycleState::Reviewed => "REVIEWED",
            LifecycleState::Approved => "APPROVED",
            LifecycleState::Registered => "REGISTERED",
            LifecycleState::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// The named events the state-machine kernel accepts. Corresponds 1:1 to the column
/// headers of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    SubmitForReview,
    Approve,
    Reject,
    Register,
    RevertToDraft,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleEvent::SubmitForReview => "submit_for_review",
            LifecycleEvent::Approve => "approve",
            LifecycleEvent::Reject => "reject",
            LifecycleEvent::Register => "register",
            LifecycleEvent::RevertToDraft => "revert_to_draft",
        };
        f.write_str(s)
    }
}

/// Record of the most recent state-machine transition applied to a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub event: LifecycleEvent,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

/// The `state` half of a [`VersionedState`]: everything the kernel and pipeline
/// track about one manifest's registration progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestState {
    pub current_state: LifecycleState,
    pub manifest: Manifest,
    pub manifest_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<LastTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// The full persisted record for one manifest: `{version, state, updatedAt}`.
///
/// Version starts at 1 on creation and strictly increases by 1 on every successful
/// write; see `protoreg-retry`'s compare-and-swap runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedState {
    pub version: u64,
    pub state: ManifestState,
    pub updated_at: DateTime<Utc>,
}

/// The kinds of events appended to a manifest's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "manifest.created")]
    ManifestCreated,
    #[serde(rename = "state.changed")]
    StateChanged,
    #[serde(rename = "registration.completed")]
    RegistrationCompleted,
    #[serde(rename = "integration.completed")]
    IntegrationCompleted,
    #[serde(rename = "error.occurred")]
    ErrorOccurred,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::ManifestCreated => "manifest.created",
            EventType::StateChanged => "state.changed",
            EventType::RegistrationCompleted => "registration.completed",
            EventType::IntegrationCompleted => "integration.completed",
            EventType::ErrorOccurred => "error.occurred",
        };
        f.write_str(s)
    }
}

/// One line of a manifest's `events.log`. Appended exactly once per successful
/// operation and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub manifest_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        event_id: impl Into<String>,
        event_type: EventType,
        manifest_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: Utc::now(),
            event_type,
            manifest_id: manifest_id.into(),
            payload,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// The closed error taxonomy (§7): every kind from spec.md's "Error kinds" table, plus
/// the context each kind carries. Network status-code mapping lives at the HTTP
/// boundary (`protoreg-server`), not here — this enum is transport-agnostic.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("guard failed: {reason}")]
    GuardFailed { reason: String },

    #[error("cycle detected: {cycle:?}")]
    CycleDetected { cycle: Vec<Urn> },

    #[error("integrity failure: {reason}")]
    Integrity { reason: String },

    #[error("provenance invalid: {reason}")]
    ProvenanceInvalid { reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RegistryError {
    /// The taxonomy name from spec.md §7, stable across releases for log correlation.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Validation { .. } => "validation",
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::Conflict { .. } => "conflict",
            RegistryError::GuardFailed { .. } => "guard_failed",
            RegistryError::CycleDetected { .. } => "cycle_detected",
            RegistryError::Integrity { .. } => "integrity",
            RegistryError::ProvenanceInvalid { .. } => "provenance_invalid",
            RegistryError::Unauthorized => "unauthorized",
            RegistryError::RateLimited => "rate_limited",
            RegistryError::Internal { .. } => "internal",
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        RegistryError::Internal {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        RegistryError::NotFound { what: what.into() }
    }
}

/// Aliases the per-agent capability arrays to the four index key spaces, so
/// `protoreg-catalog` can read off index keys without re-deriving the mapping.
pub fn agent_capability_keys(
    caps: &AgentCapabilities,
) -> BTreeMap<&'static str, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert("tool", caps.tools.clone());
    map.insert("resource", caps.resources.clone());
    map.insert(
        "workflow",
        caps.workflows.iter().map(|u| u.as_str().to_string()).collect(),
    );
    map.insert(
        "api",
        caps.apis.iter().map(|u| u.as_str().to_string()).collect(),
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            urn: Urn::new("urn:svc:orders"),
            manifest_type: ManifestType::Api,
            namespace: "commerce".to_string(),
            metadata: ManifestMetadata {
                tags: vec!["billing".to_string(), "billing".to_string()],
                governance: Governance {
                    owner: "team-commerce".to_string(),
                    classification: "internal".to_string(),
                    pii: false,
                },
            },
            dependencies: vec![Urn::new("urn:svc:inventory")],
            agent: None,
            api: Some(ApiSpec {
                endpoints: vec![ApiEndpoint {
                    path: "/orders".to_string(),
                    method: "GET".to_string(),
                    name: None,
                }],
            }),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn urn_round_trips_through_json_as_a_plain_string() {
        let urn = Urn::new("urn:svc:orders");
        let json = serde_json::to_string(&urn).unwrap();
        assert_eq!(json, "\"urn:svc:orders\"");
        let back: Urn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, urn);
    }

    #[test]
    fn manifest_round_trips() {
        let manifest = sample_manifest();
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn manifest_digest_is_stable_across_field_reorder_in_source() {
        let a = sample_manifest();
        let mut b = sample_manifest();
        // mutate unrelated field and back, to make sure digest is content-based
        b.metadata.tags.push("extra".to_string());
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap(), sample_manifest().digest().unwrap());
    }

    #[test]
    fn event_type_serializes_to_dotted_strings() {
        assert_eq!(
            serde_json::to_string(&EventType::ManifestCreated).unwrap(),
            "\"manifest.created\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::StateChanged).unwrap(),
            "\"state.changed\""
        );
    }

    #[test]
    fn lifecycle_state_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&LifecycleState::Draft).unwrap(),
            "\"DRAFT\""
        );
        assert_eq!(
            serde_json::to_string(&LifecycleState::Registered).unwrap(),
            "\"REGISTERED\""
        );
    }

    #[test]
    fn error_kind_matches_taxonomy_name() {
        let err = RegistryError::Conflict {
            reason: "urn already present".to_string(),
        };
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn agent_capability_keys_cover_all_four_index_spaces() {
        let caps = AgentCapabilities {
            tools: vec!["search".to_string()],
            resources: vec!["file://data".to_string()],
            workflows: vec![Urn::new("urn:wf:ingest")],
            apis: vec![Urn::new("urn:api:orders")],
        };
        let keys = agent_capability_keys(&caps);
        assert_eq!(keys["tool"], vec!["search".to_string()]);
        assert_eq!(keys["api"], vec!["urn:api:orders".to_string()]);
    }
}
