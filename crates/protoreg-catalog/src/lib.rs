//! Primary URN index, secondary inverted indexes, and agent capability
//! discovery for the manifest catalog (spec §4.5).
//!
//! The whole structure sits behind a single [`std::sync::RwLock`] (§5: "a
//! single exclusive lock guarding each whole structure") rather than a
//! lock-per-index scheme, so a write never observes the indexes in a
//! half-updated state relative to the primary map.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Instant;

use protoreg_types::{agent_capability_keys, Manifest, ManifestType, RegistryError, Urn};

/// The uniform shape every catalog query returns: matching keys, their count,
/// and the measured latency of the call.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    pub results: Vec<T>,
    pub count: usize,
    pub took_ms: f64,
}

fn timed<T>(f: impl FnOnce() -> Vec<T>) -> QueryResult<T> {
    let start = Instant::now();
    let results = f();
    let took_ms = start.elapsed().as_secs_f64() * 1000.0;
    let count = results.len();
    QueryResult {
        results,
        count,
        took_ms,
    }
}

/// A conjunctive filter for [`Catalog::find_by_governance`]. Every `Some`
/// field narrows the match; `None` fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct GovernanceCriteria {
    pub namespace: Option<String>,
    pub tag: Option<String>,
    pub owner: Option<String>,
    pub manifest_type: Option<ManifestType>,
    pub classification: Option<String>,
    pub pii: Option<bool>,
}

#[derive(Default)]
struct Indexes {
    by_namespace: HashMap<String, BTreeSet<Urn>>,
    by_tag: HashMap<String, BTreeSet<Urn>>,
    by_owner: HashMap<String, BTreeSet<Urn>>,
    by_type: HashMap<String, BTreeSet<Urn>>,
    by_classification: HashMap<String, BTreeSet<Urn>>,
    by_pii: BTreeSet<Urn>,
    by_tool: HashMap<String, BTreeSet<Urn>>,
    by_resource: HashMap<String, BTreeSet<Urn>>,
    by_workflow: HashMap<String, BTreeSet<Urn>>,
    by_api: HashMap<String, BTreeSet<Urn>>,
}

struct Inner {
    manifests: HashMap<Urn, Manifest>,
    indexes: Indexes,
}

/// The in-memory catalog: `urn -> manifest` plus every derived index.
pub struct Catalog {
    inner: RwLock<Inner>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                manifests: HashMap::new(),
                indexes: Indexes::default(),
            }),
        }
    }

    /// Insert a manifest. Fails with `conflict` if the URN is already present
    /// (re-registration is the caller's job, via unregister-then-register).
    pub fn add(&self, manifest: Manifest) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("catalog lock poisoned");
        if inner.manifests.contains_key(&manifest.urn) {
            return Err(RegistryError::Conflict {
                reason: format!("urn_conflict: {} is already cataloged", manifest.urn),
            });
        }

        let urn = manifest.urn.clone();
        inner
            .indexes
            .by_namespace
            .entry(manifest.namespace.clone())
            .or_default()
            .insert(urn.clone());
        for tag in dedup(&manifest.metadata.tags) {
            inner.indexes.by_tag.entry(tag).or_default().insert(urn.clone());
        }
        inner
            .indexes
            .by_owner
            .entry(manifest.metadata.governance.owner.clone())
            .or_default()
            .insert(urn.clone());
        inner
            .indexes
            .by_type
            .entry(manifest.manifest_type.to_string())
            .or_default()
            .insert(urn.clone());
        inner
            .indexes
            .by_classification
            .entry(manifest.metadata.governance.classification.clone())
            .or_default()
            .insert(urn.clone());
        if manifest.metadata.governance.pii {
            inner.indexes.by_pii.insert(urn.clone());
        }

        if manifest.manifest_type == ManifestType::Agent {
            index_agent_capabilities(&mut inner.indexes, &urn, &manifest);
        }

        inner.manifests.insert(urn, manifest);
        Ok(())
    }

    /// Remove a manifest and every index entry it produced on `add`. Empty
    /// index buckets are left behind (cheap, and harmless since queries never
    /// report a URN that isn't in the bucket).
    pub fn remove(&self, urn: &Urn) -> Result<Manifest, RegistryError> {
        let mut inner = self.inner.write().expect("catalog lock poisoned");
        let manifest = inner
            .manifests
            .remove(urn)
            .ok_or_else(|| RegistryError::not_found(format!("manifest {urn}")))?;

        if let Some(set) = inner.indexes.by_namespace.get_mut(&manifest.namespace) {
            set.remove(urn);
        }
        for tag in dedup(&manifest.metadata.tags) {
            if let Some(set) = inner.indexes.by_tag.get_mut(&tag) {
                set.remove(urn);
            }
        }
        if let Some(set) = inner
            .indexes
            .by_owner
            .get_mut(&manifest.metadata.governance.owner)
        {
            set.remove(urn);
        }
        if let Some(set) = inner.indexes.by_type.get_mut(&manifest.manifest_type.to_string()) {
            set.remove(urn);
        }
        if let Some(set) = inner
            .indexes
            .by_classification
            .get_mut(&manifest.metadata.governance.classification)
        {
            set.remove(urn);
        }
        inner.indexes.by_pii.remove(urn);

        if let Some(caps) = &manifest.agent {
            remove_agent_capabilities(&mut inner.indexes, urn, caps);
        }

        Ok(manifest)
    }

    pub fn get(&self, urn: &Urn) -> Option<Manifest> {
        self.inner
            .read()
            .expect("catalog lock poisoned")
            .manifests
            .get(urn)
            .cloned()
    }

    pub fn contains(&self, urn: &Urn) -> bool {
        self.inner
            .read()
            .expect("catalog lock poisoned")
            .manifests
            .contains_key(urn)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("catalog lock poisoned").manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_namespace(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_namespace.get(key)))
    }

    pub fn find_by_tag(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_tag.get(key)))
    }

    pub fn find_by_owner(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_owner.get(key)))
    }

    pub fn find_by_type(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_type.get(key)))
    }

    pub fn find_by_classification(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_classification.get(key)))
    }

    pub fn find_by_pii(&self, pii: bool) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| {
            if pii {
                inner.indexes.by_pii.iter().cloned().collect()
            } else {
                inner
                    .manifests
                    .keys()
                    .filter(|urn| !inner.indexes.by_pii.contains(*urn))
                    .cloned()
                    .collect()
            }
        })
    }

    /// Intersects every provided criterion, starting from the smallest
    /// matching set to keep the intersection cheap.
    pub fn find_by_governance(&self, criteria: &GovernanceCriteria) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| {
            let mut candidate_sets: Vec<BTreeSet<Urn>> = Vec::new();

            if let Some(ns) = &criteria.namespace {
                candidate_sets.push(inner.indexes.by_namespace.get(ns).cloned().unwrap_or_default());
            }
            if let Some(tag) = &criteria.tag {
                candidate_sets.push(inner.indexes.by_tag.get(tag).cloned().unwrap_or_default());
            }
            if let Some(owner) = &criteria.owner {
                candidate_sets.push(inner.indexes.by_owner.get(owner).cloned().unwrap_or_default());
            }
            if let Some(manifest_type) = &criteria.manifest_type {
                candidate_sets.push(
                    inner
                        .indexes
                        .by_type
                        .get(&manifest_type.to_string())
                        .cloned()
                        .unwrap_or_default(),
                );
            }
            if let Some(classification) = &criteria.classification {
                candidate_sets.push(
                    inner
                        .indexes
                        .by_classification
                        .get(classification)
                        .cloned()
                        .unwrap_or_default(),
                );
            }
            if let Some(pii) = criteria.pii {
                candidate_sets.push(if pii {
                    inner.indexes.by_pii.clone()
                } else {
                    inner
                        .manifests
                        .keys()
                        .filter(|urn| !inner.indexes.by_pii.contains(*urn))
                        .cloned()
                        .collect()
                });
            }

            if candidate_sets.is_empty() {
                return Vec::new();
            }

            candidate_sets.sort_by_key(|s| s.len());
            let mut iter = candidate_sets.into_iter();
            let mut acc = iter.next().unwrap();
            for set in iter {
                acc = acc.intersection(&set).cloned().collect();
            }
            acc.into_iter().collect()
        })
    }

    pub fn find_by_tags_or(&self, tags: &[String]) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| {
            let mut union: BTreeSet<Urn> = BTreeSet::new();
            for tag in tags {
                if let Some(set) = inner.indexes.by_tag.get(tag) {
                    union.extend(set.iter().cloned());
                }
            }
            union.into_iter().collect()
        })
    }

    pub fn find_by_urn_pattern(&self, substr: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| {
            inner
                .manifests
                .keys()
                .filter(|urn| urn.as_str().contains(substr))
                .cloned()
                .collect()
        })
    }

    /// Brittle by design: scans every manifest's serialized JSON text for the
    /// URN string rather than following declared reference fields. Kept as
    /// documented pack behavior (false positives against unrelated text are
    /// possible, e.g. a tag that happens to contain the substring).
    pub fn find_references(&self, urn: &Urn) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| {
            let needle = urn.as_str();
            inner
                .manifests
                .iter()
                .filter(|(candidate, manifest)| {
                    *candidate != urn
                        && serde_json::to_string(manifest)
                            .map(|text| text.contains(needle))
                            .unwrap_or(false)
                })
                .map(|(candidate, _)| candidate.clone())
                .collect()
        })
    }

    pub fn find_agents_by_tool(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_tool.get(key)))
    }

    pub fn find_agents_by_resource(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_resource.get(key)))
    }

    pub fn find_agents_by_workflow(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_workflow.get(key)))
    }

    pub fn find_agents_by_api(&self, key: &str) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| set_to_vec(inner.indexes.by_api.get(key)))
    }

    /// `findAgentsForAPI`: intersects the graph's one-hop consumers of
    /// `api_urn` (supplied by the caller, normally `protoreg-writer` binding
    /// this catalog to `protoreg-graph`) with every agent that appears in the
    /// workflow index, i.e. every agent that declares at least one workflow.
    pub fn find_agents_for_api(&self, consumers: &[Urn]) -> QueryResult<Urn> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        timed(|| {
            let workflow_agents: BTreeSet<Urn> = inner
                .indexes
                .by_workflow
                .values()
                .flat_map(|set| set.iter().cloned())
                .collect();
            consumers
                .iter()
                .filter(|urn| workflow_agents.contains(*urn))
                .cloned()
                .collect()
        })
    }
}

fn dedup(tags: &[String]) -> BTreeSet<String> {
    tags.iter().cloned().collect()
}

fn set_to_vec(set: Option<&BTreeSet<Urn>>) -> Vec<Urn> {
    set.map(|s| s.iter().cloned().collect()).unwrap_or_default()
}

fn index_agent_capabilities(
    indexes: &mut Indexes,
    urn: &Urn,
    manifest: &Manifest,
) {
    let Some(caps) = &manifest.agent else {
        return;
    };
    for (kind, keys) in agent_capability_keys(caps) {
        let bucket = match kind {
            "tool" => &mut indexes.by_tool,
            "resource" => &mut indexes.by_resource,
            "workflow" => &mut indexes.by_workflow,
            "api" => &mut indexes.by_api,
            _ => continue,
        };
        for key in keys {
            bucket.entry(key).or_default().insert(urn.clone());
        }
    }
}

fn remove_agent_capabilities(
    indexes: &mut Indexes,
    urn: &Urn,
    caps: &protoreg_types::AgentCapabilities,
) {
    for (kind, keys) in agent_capability_keys(caps) {
        let bucket = match kind {
            "tool" => &mut indexes.by_tool,
            "resource" => &mut indexes.by_resource,
            "workflow" => &mut indexes.by_workflow,
            "api" => &mut indexes.by_api,
            _ => continue,
        };
        for key in keys {
            if let Some(set) = bucket.get_mut(&key) {
                set.remove(urn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_types::{AgentCapabilities, ApiEndpoint, ApiSpec, Governance, ManifestMetadata};

    fn manifest(urn: &str, namespace: &str, owner: &str, tags: &[&str]) -> Manifest {
        Manifest {
            urn: Urn::new(urn),
            manifest_type: ManifestType::Api,
            namespace: namespace.to_string(),
            metadata: ManifestMetadata {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                governance: Governance {
                    owner: owner.to_string(),
                    classification: "internal".to_string(),
                    pii: false,
                },
            },
            dependencies: vec![],
            agent: None,
            api: Some(ApiSpec {
                endpoints: vec![ApiEndpoint {
                    path: "/x".to_string(),
                    method: "GET".to_string(),
                    name: None,
                }],
            }),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let catalog = Catalog::new();
        let m = manifest("urn:svc:a", "commerce", "team-a", &["billing"]);
        catalog.add(m.clone()).unwrap();
        assert_eq!(catalog.get(&Urn::new("urn:svc:a")), Some(m));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn add_rejects_duplicate_urn() {
        let catalog = Catalog::new();
        catalog
            .add(manifest("urn:svc:a", "commerce", "team-a", &[]))
            .unwrap();
        let err = catalog
            .add(manifest("urn:svc:a", "commerce", "team-b", &[]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[test]
    fn remove_clears_all_derived_indexes() {
        let catalog = Catalog::new();
        catalog
            .add(manifest("urn:svc:a", "commerce", "team-a", &["billing"]))
            .unwrap();
        catalog.remove(&Urn::new("urn:svc:a")).unwrap();

        assert!(catalog.find_by_namespace("commerce").results.is_empty());
        assert!(catalog.find_by_tag("billing").results.is_empty());
        assert!(catalog.find_by_owner("team-a").results.is_empty());
    }

    #[test]
    fn find_by_tags_or_unions_across_tags() {
        let catalog = Catalog::new();
        catalog
            .add(manifest("urn:svc:a", "commerce", "team-a", &["billing"]))
            .unwrap();
        catalog
            .add(manifest("urn:svc:b", "commerce", "team-a", &["shipping"]))
            .unwrap();
        let result = catalog.find_by_tags_or(&["billing".to_string(), "shipping".to_string()]);
        assert_eq!(result.count, 2);
    }

    #[test]
    fn find_by_governance_intersects_criteria() {
        let catalog = Catalog::new();
        catalog
            .add(manifest("urn:svc:a", "commerce", "team-a", &["billing"]))
            .unwrap();
        catalog
            .add(manifest("urn:svc:b", "commerce", "team-b", &["billing"]))
            .unwrap();

        let result = catalog.find_by_governance(&GovernanceCriteria {
            namespace: Some("commerce".to_string()),
            owner: Some("team-a".to_string()),
            ..Default::default()
        });
        assert_eq!(result.results, vec![Urn::new("urn:svc:a")]);
    }

    #[test]
    fn find_references_scans_serialized_text() {
        let catalog = Catalog::new();
        let mut dependent = manifest("urn:svc:b", "commerce", "team-a", &[]);
        dependent.dependencies = vec![Urn::new("urn:svc:a")];
        catalog.add(manifest("urn:svc:a", "commerce", "team-a", &[])).unwrap();
        catalog.add(dependent).unwrap();

        let result = catalog.find_references(&Urn::new("urn:svc:a"));
        assert_eq!(result.results, vec![Urn::new("urn:svc:b")]);
    }

    #[test]
    fn agent_indexes_populate_on_add_and_query_by_capability() {
        let catalog = Catalog::new();
        let agent = Manifest {
            urn: Urn::new("urn:agent:ops"),
            manifest_type: ManifestType::Agent,
            namespace: "platform".to_string(),
            metadata: ManifestMetadata {
                tags: vec![],
                governance: Governance {
                    owner: "team-platform".to_string(),
                    classification: "internal".to_string(),
                    pii: false,
                },
            },
            dependencies: vec![],
            agent: Some(AgentCapabilities {
                tools: vec!["search".to_string()],
                resources: vec![],
                workflows: vec![Urn::new("urn:wf:ingest")],
                apis: vec![Urn::new("urn:svc:orders")],
            }),
            api: None,
            extra: serde_json::Map::new(),
        };
        catalog.add(agent).unwrap();

        assert_eq!(
            catalog.find_agents_by_tool("search").results,
            vec![Urn::new("urn:agent:ops")]
        );
        assert_eq!(
            catalog.find_agents_by_workflow("urn:wf:ingest").results,
            vec![Urn::new("urn:agent:ops")]
        );
    }

    #[test]
    fn find_agents_for_api_intersects_consumers_with_workflow_agents() {
        let catalog = Catalog::new();
        let agent = Manifest {
            urn: Urn::new("urn:agent:ops"),
            manifest_type: ManifestType::Agent,
            namespace: "platform".to_string(),
            metadata: ManifestMetadata {
                tags: vec![],
                governance: Governance {
                    owner: "team-platform".to_string(),
                    classification: "internal".to_string(),
                    pii: false,
                },
            },
            dependencies: vec![],
            agent: Some(AgentCapabilities {
                tools: vec![],
                resources: vec![],
                workflows: vec![Urn::new("urn:wf:ingest")],
                apis: vec![],
            }),
            api: None,
            extra: serde_json::Map::new(),
        };
        catalog.add(agent).unwrap();

        let consumers = vec![Urn::new("urn:agent:ops"), Urn::new("urn:svc:unrelated")];
        let result = catalog.find_agents_for_api(&consumers);
        assert_eq!(result.results, vec![Urn::new("urn:agent:ops")]);
    }

    #[test]
    fn find_by_pii_partitions_the_catalog() {
        let catalog = Catalog::new();
        let mut pii_manifest = manifest("urn:svc:a", "commerce", "team-a", &[]);
        pii_manifest.metadata.governance.pii = true;
        catalog.add(pii_manifest).unwrap();
        catalog
            .add(manifest("urn:svc:b", "commerce", "team-a", &[]))
            .unwrap();

        assert_eq!(catalog.find_by_pii(true).results, vec![Urn::new("urn:svc:a")]);
        assert_eq!(catalog.find_by_pii(false).results, vec![Urn::new("urn:svc:b")]);
    }
}
