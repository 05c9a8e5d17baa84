//! Directed dependency graph over manifest URNs (spec §4.6).
//!
//! Per the redesign flags (§9): the graph keeps a single edge relation set as
//! the source of truth, with `dependencies` (out-edges) and `dependents`
//! (in-edges) maintained as derived, ordered adjacency indexes mirrored on
//! every write — not two independently-authoritative maps that could drift
//! apart. One `std::sync::RwLock` guards the whole structure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use protoreg_types::{ManifestType, RegistryError, Urn};

/// What happens to an edge whose target node doesn't exist yet, during
/// [`Graph::apply_batch`]. Configurable per spec; default is
/// [`MissingTargetPolicy::InsertPlaceholder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingTargetPolicy {
    #[default]
    InsertPlaceholder,
    Skip,
}

/// A node to add in a batch: its URN and declared kind.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub urn: Urn,
    pub kind: ManifestType,
}

/// The label on an edge (§3): `depends_on` for a manifest-to-manifest
/// dependency, `exposes` for a manifest-to-sub-entity relation such as an
/// API endpoint. Traversals that mean "what does this manifest depend on"
/// (`get_dependency_tree`, `build_order`, cycle detection) only ever follow
/// `DependsOn` edges; `Exposes` edges are bookkeeping for the writer's child
/// nodes and are never dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    DependsOn,
    Exposes,
}

/// An edge to add in a batch: `from` relates to `to` via `kind`.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub from: Urn,
    pub kind: EdgeKind,
    pub to: Urn,
}

/// Everything `apply_batch` adds or reports, in one value.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub nodes_added: usize,
    pub edges_added: usize,
    pub placeholders_inserted: Vec<Urn>,
    pub errors: Vec<String>,
}

/// The result of a cycle scan: the first cycle found (as an ordered URN
/// list) and the total number of cycles encountered.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub first_cycle: Option<Vec<Urn>>,
    pub count: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct Inner {
    nodes: HashMap<Urn, ManifestType>,
    /// Single relation set keyed by `(u, kind, v)` (§9 redesign flag); the
    /// source of truth. `dependencies`/`dependents` below are derived
    /// indexes over the `DependsOn` subset only, mirrored on every write.
    edges: HashSet<(Urn, EdgeKind, Urn)>,
    dependencies: HashMap<Urn, Vec<Urn>>,
    dependents: HashMap<Urn, Vec<Urn>>,
}

/// The dependency graph: one lock over nodes, the edge relation, and its two
/// derived adjacency indexes.
pub struct Graph {
    inner: RwLock<Inner>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                edges: HashSet::new(),
                dependencies: HashMap::new(),
                dependents: HashMap::new(),
            }),
        }
    }

    /// Idempotent: adding a node that already exists is a no-op (its kind is
    /// left unchanged).
    pub fn add_node(&self, urn: Urn, kind: ManifestType) -> bool {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        add_node_locked(&mut inner, urn, kind)
    }

    pub fn has_node(&self, urn: &Urn) -> bool {
        self.inner.read().expect("graph lock poisoned").nodes.contains_key(urn)
    }

    pub fn node_kind(&self, urn: &Urn) -> Option<ManifestType> {
        self.inner.read().expect("graph lock poisoned").nodes.get(urn).copied()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().expect("graph lock poisoned").nodes.len()
    }

    /// Add a single `depends_on` edge, applying `policy` if `to` has no node
    /// yet. Returns `Ok(true)` if the edge was newly inserted, `Ok(false)` if
    /// it already existed or was skipped under `Skip` policy.
    pub fn add_edge(
        &self,
        from: Urn,
        to: Urn,
        policy: MissingTargetPolicy,
    ) -> Result<bool, RegistryError> {
        self.add_edge_kind(from, EdgeKind::DependsOn, to, policy)
    }

    /// Add a single edge of the given `kind`. Same semantics as
    /// [`Graph::add_edge`] but lets callers record `exposes` relations
    /// without them being mistaken for dependencies.
    pub fn add_edge_kind(
        &self,
        from: Urn,
        kind: EdgeKind,
        to: Urn,
        policy: MissingTargetPolicy,
    ) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        add_edge_locked(&mut inner, from, kind, to, policy).map(|outcome| outcome.inserted)
    }

    /// `applyBatch({nodes, edges})`: adds all nodes first, then all edges.
    /// Missing edge targets are handled per `policy`; per-edge failures are
    /// collected in `errors` rather than aborting the batch.
    pub fn apply_batch(
        &self,
        nodes: Vec<NodeSpec>,
        edges: Vec<EdgeSpec>,
        policy: MissingTargetPolicy,
    ) -> BatchResult {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        let mut result = BatchResult::default();

        for node in nodes {
            if add_node_locked(&mut inner, node.urn, node.kind) {
                result.nodes_added += 1;
            }
        }

        for edge in edges {
            match add_edge_locked(&mut inner, edge.from.clone(), edge.kind, edge.to.clone(), policy) {
                Ok(outcome) => {
                    if outcome.inserted {
                        result.edges_added += 1;
                    }
                    if let Some(placeholder) = outcome.placeholder {
                        result.placeholders_inserted.push(placeholder);
                    }
                }
                Err(e) => result.errors.push(format!("{} -> {}: {e}", edge.from, edge.to)),
            }
        }

        result
    }

    /// BFS over `dependencies`, returning every transitively reachable URN
    /// excluding `urn` itself. Empty if `urn` has no node.
    pub fn get_dependency_tree(&self, urn: &Urn) -> Vec<Urn> {
        let inner = self.inner.read().expect("graph lock poisoned");
        if !inner.nodes.contains_key(urn) {
            return Vec::new();
        }

        let mut visited: HashSet<Urn> = HashSet::new();
        let mut queue: VecDeque<Urn> = VecDeque::new();
        queue.push_back(urn.clone());
        visited.insert(urn.clone());

        let mut reachable = Vec::new();
        while let Some(current) = queue.pop_front() {
            if let Some(deps) = inner.dependencies.get(&current) {
                for dep in deps {
                    if visited.insert(dep.clone()) {
                        reachable.push(dep.clone());
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        reachable
    }

    /// One hop over `dependents`: manifests that directly depend on `urn`.
    pub fn find_consumers(&self, urn: &Urn) -> Vec<Urn> {
        self.inner
            .read()
            .expect("graph lock poisoned")
            .dependents
            .get(urn)
            .cloned()
            .unwrap_or_default()
    }

    /// BFS shortest path from `from` to `to` over `dependencies`.
    pub fn find_path(&self, from: &Urn, to: &Urn) -> Option<Vec<Urn>> {
        let inner = self.inner.read().expect("graph lock poisoned");
        if from == to {
            return Some(vec![from.clone()]);
        }
        if !inner.nodes.contains_key(from) || !inner.nodes.contains_key(to) {
            return None;
        }

        let mut visited: HashSet<Urn> = HashSet::new();
        let mut parent: HashMap<Urn, Urn> = HashMap::new();
        let mut queue: VecDeque<Urn> = VecDeque::new();
        queue.push_back(from.clone());
        visited.insert(from.clone());

        while let Some(current) = queue.pop_front() {
            let Some(deps) = inner.dependencies.get(&current) else {
                continue;
            };
            for dep in deps {
                if visited.insert(dep.clone()) {
                    parent.insert(dep.clone(), current.clone());
                    if dep == to {
                        let mut path = vec![dep.clone()];
                        let mut cursor = dep.clone();
                        while let Some(p) = parent.get(&cursor) {
                            path.push(p.clone());
                            cursor = p.clone();
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(dep.clone());
                }
            }
        }
        None
    }

    /// Iterative three-color DFS over the whole graph, O(V+E). Returns the
    /// first cycle found (as a URN cycle, first element repeated at the end
    /// is omitted: callers get the distinct nodes in cycle order) and the
    /// total number of back-edges encountered (one per cycle detected, which
    /// may overcount graphs with overlapping cycles through shared nodes).
    pub fn detect_cycles(&self) -> CycleReport {
        let inner = self.inner.read().expect("graph lock poisoned");
        detect_cycles_locked(&inner)
    }

    /// Kahn's algorithm on `dependencies`. Fails with `cycle_detected`
    /// carrying the witness cycle if the graph is not a DAG.
    pub fn build_order(&self) -> Result<Vec<Urn>, RegistryError> {
        let inner = self.inner.read().expect("graph lock poisoned");

        let mut in_degree: HashMap<Urn, usize> = inner.nodes.keys().map(|u| (u.clone(), 0)).collect();
        for deps in inner.dependencies.values() {
            for dep in deps {
                *in_degree.entry(dep.clone()).or_insert(0) += 1;
            }
        }

        // Deterministic order: nodes with no in-edges, sorted.
        let mut initial: Vec<Urn> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(urn, _)| urn.clone())
            .collect();
        initial.sort();
        let mut queue: VecDeque<Urn> = initial.into();

        let mut order = Vec::with_capacity(inner.nodes.len());
        while let Some(urn) = queue.pop_front() {
            order.push(urn.clone());
            if let Some(deps) = inner.dependencies.get(&urn) {
                let mut newly_free = Vec::new();
                for dep in deps {
                    let degree = in_degree.get_mut(dep).expect("dependency has no in-degree entry");
                    *degree -= 1;
                    if *degree == 0 {
                        newly_free.push(dep.clone());
                    }
                }
                newly_free.sort();
                for urn in newly_free {
                    queue.push_back(urn);
                }
            }
        }

        if order.len() != inner.nodes.len() {
            let report = detect_cycles_locked(&inner);
            return Err(RegistryError::CycleDetected {
                cycle: report.first_cycle.unwrap_or_default(),
            });
        }

        Ok(order)
    }

    /// Checks the structural invariants of §4.6: every edge's endpoints have
    /// node entries, `dependencies`/`dependents` mirror each other exactly,
    /// and (if `allow_cycles` is false) the graph is acyclic.
    pub fn validate_invariants(&self, allow_cycles: bool) -> Result<(), RegistryError> {
        let inner = self.inner.read().expect("graph lock poisoned");

        for (from, _kind, to) in &inner.edges {
            if !inner.nodes.contains_key(from) || !inner.nodes.contains_key(to) {
                return Err(RegistryError::Integrity {
                    reason: format!("edge {from} -> {to} references a node with no entry"),
                });
            }
        }

        for (from, deps) in &inner.dependencies {
            for to in deps {
                let mirrored = inner
                    .dependents
                    .get(to)
                    .is_some_and(|back| back.contains(from));
                if !mirrored {
                    return Err(RegistryError::Integrity {
                        reason: format!("dependents[{to}] is missing the mirror of {from} -> {to}"),
                    });
                }
            }
        }

        if !allow_cycles {
            let report = detect_cycles_locked(&inner);
            if let Some(cycle) = report.first_cycle {
                return Err(RegistryError::CycleDetected { cycle });
            }
        }

        Ok(())
    }
}

fn add_node_locked(inner: &mut Inner, urn: Urn, kind: ManifestType) -> bool {
    if inner.nodes.contains_key(&urn) {
        return false;
    }
    inner.nodes.insert(urn.clone(), kind);
    inner.dependencies.entry(urn.clone()).or_default();
    inner.dependents.entry(urn).or_default();
    true
}

struct EdgeOutcome {
    inserted: bool,
    placeholder: Option<Urn>,
}

fn add_edge_locked(
    inner: &mut Inner,
    from: Urn,
    kind: EdgeKind,
    to: Urn,
    policy: MissingTargetPolicy,
) -> Result<EdgeOutcome, RegistryError> {
    if !inner.nodes.contains_key(&from) {
        return Err(RegistryError::Validation {
            reason: format!("edge source {from} has no node entry"),
        });
    }

    let mut placeholder = None;
    if !inner.nodes.contains_key(&to) {
        match policy {
            MissingTargetPolicy::InsertPlaceholder => {
                add_node_locked(inner, to.clone(), ManifestType::Api);
                placeholder = Some(to.clone());
            }
            MissingTargetPolicy::Skip => {
                return Ok(EdgeOutcome {
                    inserted: false,
                    placeholder: None,
                });
            }
        }
    }

    // Dedup keys on (from, kind, to): a depends_on and an exposes edge
    // between the same pair are distinct relations, both kept (§3).
    if inner.edges.contains(&(from.clone(), kind, to.clone())) {
        return Ok(EdgeOutcome {
            inserted: false,
            placeholder,
        });
    }

    inner.edges.insert((from.clone(), kind, to.clone()));
    if kind == EdgeKind::DependsOn {
        inner.dependencies.entry(from.clone()).or_default().push(to.clone());
        inner.dependents.entry(to).or_default().push(from);
    }

    Ok(EdgeOutcome {
        inserted: true,
        placeholder,
    })
}

fn detect_cycles_locked(inner: &Inner) -> CycleReport {
    let mut color: HashMap<Urn, Color> = inner.nodes.keys().map(|u| (u.clone(), Color::White)).collect();
    let mut first_cycle = None;
    let mut count = 0;

    let mut node_order: Vec<Urn> = inner.nodes.keys().cloned().collect();
    node_order.sort();

    for start in node_order {
        if color.get(&start) != Some(&Color::White) {
            continue;
        }

        // Iterative DFS: stack of (node, next child index to visit).
        let mut stack: Vec<(Urn, usize)> = vec![(start.clone(), 0)];
        color.insert(start, Color::Gray);

        while let Some((node, idx)) = stack.pop() {
            let children = inner.dependencies.get(&node).cloned().unwrap_or_default();
            if idx < children.len() {
                stack.push((node.clone(), idx + 1));
                let child = children[idx].clone();
                match color.get(&child) {
                    Some(Color::White) => {
                        color.insert(child.clone(), Color::Gray);
                        stack.push((child, 0));
                    }
                    Some(Color::Gray) => {
                        count += 1;
                        if first_cycle.is_none() {
                            let cycle = extract_cycle(&stack, &child);
                            first_cycle = Some(cycle);
                        }
                    }
                    _ => {}
                }
            } else {
                color.insert(node, Color::Black);
            }
        }
    }

    CycleReport { first_cycle, count }
}

fn extract_cycle(stack: &[(Urn, usize)], back_to: &Urn) -> Vec<Urn> {
    let position = stack.iter().position(|(urn, _)| urn == back_to);
    match position {
        Some(start) => stack[start..].iter().map(|(urn, _)| urn.clone()).collect(),
        None => vec![back_to.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_edge_mirrors_dependencies_and_dependents() {
        let graph = Graph::new();
        graph.add_node(Urn::new("a"), ManifestType::Api);
        graph.add_node(Urn::new("b"), ManifestType::Api);
        graph
            .add_edge(Urn::new("a"), Urn::new("b"), MissingTargetPolicy::InsertPlaceholder)
            .unwrap();

        assert_eq!(graph.get_dependency_tree(&Urn::new("a")), vec![Urn::new("b")]);
        assert_eq!(graph.find_consumers(&Urn::new("b")), vec![Urn::new("a")]);
    }

    #[test]
    fn apply_batch_inserts_placeholder_for_missing_target_by_default() {
        let graph = Graph::new();
        let result = graph.apply_batch(
            vec![NodeSpec {
                urn: Urn::new("a"),
                kind: ManifestType::Api,
            }],
            vec![EdgeSpec {
                from: Urn::new("a"),
                kind: EdgeKind::DependsOn,
                to: Urn::new("ghost"),
            }],
            MissingTargetPolicy::InsertPlaceholder,
        );

        assert_eq!(result.placeholders_inserted, vec![Urn::new("ghost")]);
        assert!(graph.has_node(&Urn::new("ghost")));
        assert_eq!(graph.node_kind(&Urn::new("ghost")), Some(ManifestType::Api));
    }

    #[test]
    fn apply_batch_skip_policy_drops_edges_to_missing_targets() {
        let graph = Graph::new();
        let result = graph.apply_batch(
            vec![NodeSpec {
                urn: Urn::new("a"),
                kind: ManifestType::Api,
            }],
            vec![EdgeSpec {
                from: Urn::new("a"),
                kind: EdgeKind::DependsOn,
                to: Urn::new("ghost"),
            }],
            MissingTargetPolicy::Skip,
        );

        assert_eq!(result.edges_added, 0);
        assert!(!graph.has_node(&Urn::new("ghost")));
    }

    #[test]
    fn parallel_edges_of_distinct_kinds_between_the_same_pair_are_both_kept() {
        let graph = Graph::new();
        graph.add_node(Urn::new("a"), ManifestType::Api);
        graph.add_node(Urn::new("b"), ManifestType::Api);

        assert!(graph
            .add_edge_kind(Urn::new("a"), EdgeKind::DependsOn, Urn::new("b"), MissingTargetPolicy::Skip)
            .unwrap());
        assert!(graph
            .add_edge_kind(Urn::new("a"), EdgeKind::Exposes, Urn::new("b"), MissingTargetPolicy::Skip)
            .unwrap());
        // Re-adding the same (from, kind, to) is a no-op.
        assert!(!graph
            .add_edge_kind(Urn::new("a"), EdgeKind::DependsOn, Urn::new("b"), MissingTargetPolicy::Skip)
            .unwrap());
    }

    #[test]
    fn dependency_tree_only_follows_depends_on_edges_not_exposes() {
        let graph = Graph::new();
        graph.add_node(Urn::new("a"), ManifestType::Api);
        graph.add_node(Urn::new("endpoint"), ManifestType::Api);

        graph
            .add_edge_kind(Urn::new("a"), EdgeKind::Exposes, Urn::new("endpoint"), MissingTargetPolicy::Skip)
            .unwrap();

        assert_eq!(graph.get_dependency_tree(&Urn::new("a")), Vec::<Urn>::new());
        assert!(graph.find_consumers(&Urn::new("endpoint")).is_empty());
    }

    #[test]
    fn detect_cycles_finds_a_simple_cycle() {
        let graph = Graph::new();
        for urn in ["a", "b", "c"] {
            graph.add_node(Urn::new(urn), ManifestType::Api);
        }
        graph.add_edge(Urn::new("a"), Urn::new("b"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("b"), Urn::new("c"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("c"), Urn::new("a"), MissingTargetPolicy::Skip).unwrap();

        let report = graph.detect_cycles();
        assert_eq!(report.count, 1);
        let cycle = report.first_cycle.unwrap();
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn build_order_topologically_sorts_a_dag() {
        let graph = Graph::new();
        for urn in ["a", "b", "c"] {
            graph.add_node(Urn::new(urn), ManifestType::Api);
        }
        graph.add_edge(Urn::new("a"), Urn::new("b"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("b"), Urn::new("c"), MissingTargetPolicy::Skip).unwrap();

        let order = graph.build_order().unwrap();
        let pos = |u: &str| order.iter().position(|x| x == &Urn::new(u)).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn build_order_fails_with_cycle_detected_on_a_cyclic_graph() {
        let graph = Graph::new();
        for urn in ["a", "b"] {
            graph.add_node(Urn::new(urn), ManifestType::Api);
        }
        graph.add_edge(Urn::new("a"), Urn::new("b"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("b"), Urn::new("a"), MissingTargetPolicy::Skip).unwrap();

        let err = graph.build_order().unwrap_err();
        assert!(matches!(err, RegistryError::CycleDetected { .. }));
    }

    #[test]
    fn find_path_returns_shortest_route() {
        let graph = Graph::new();
        for urn in ["a", "b", "c", "d"] {
            graph.add_node(Urn::new(urn), ManifestType::Api);
        }
        graph.add_edge(Urn::new("a"), Urn::new("b"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("b"), Urn::new("d"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("a"), Urn::new("c"), MissingTargetPolicy::Skip).unwrap();

        let path = graph.find_path(&Urn::new("a"), &Urn::new("d")).unwrap();
        assert_eq!(path, vec![Urn::new("a"), Urn::new("b"), Urn::new("d")]);
        assert!(graph.find_path(&Urn::new("c"), &Urn::new("d")).is_none());
    }

    #[test]
    fn validate_invariants_rejects_cycles_when_disallowed() {
        let graph = Graph::new();
        for urn in ["a", "b"] {
            graph.add_node(Urn::new(urn), ManifestType::Api);
        }
        graph.add_edge(Urn::new("a"), Urn::new("b"), MissingTargetPolicy::Skip).unwrap();
        graph.add_edge(Urn::new("b"), Urn::new("a"), MissingTargetPolicy::Skip).unwrap();

        assert!(graph.validate_invariants(true).is_ok());
        assert!(matches!(
            graph.validate_invariants(false),
            Err(RegistryError::CycleDetected { .. })
        ));
    }
}
