//! The schedule graph: stop events as nodes, causal dependencies as edges.

use crate::error::{DispatchError, Reference};
use crate::models::{DependencyEdge, DependencyKind, NodeKey, StopNode, StopReport, TrainId};
use crate::time::minutes_between;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub mod propagation;
pub mod resolver;

/// Outcome of removing nodes from the graph
///
/// `dependents` are surviving nodes that lost a reference and need
/// re-evaluation; their governing input falls back per the failure rules.
#[derive(Debug, Clone, Default)]
pub struct RemovedNodes {
    pub keys: Vec<NodeKey>,
    pub dependents: Vec<NodeIndex>,
}

/// Dependency graph over every known stop event
///
/// Nodes and edges live in a stable-index arena; indices survive removals,
/// so views and override edges can hold them across updates. The subgraph
/// of path, automatic and active override edges is kept acyclic: `link`
/// re-sorts on every install and rolls back an edge that would close a
/// cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleGraph {
    #[serde(with = "graph_serde")]
    pub graph: StableDiGraph<StopNode, DependencyEdge>,
    /// Node index per train, ordered by sequence
    paths: HashMap<TrainId, BTreeMap<u32, NodeIndex>>,
    #[serde(skip)]
    topo_cache: Option<Vec<NodeIndex>>,
}

impl ScheduleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::default(),
            paths: HashMap::new(),
            topo_cache: None,
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn index_of(&self, key: NodeKey) -> Option<NodeIndex> {
        self.paths.get(&key.train)?.get(&key.sequence).copied()
    }

    #[must_use]
    pub fn stop(&self, index: NodeIndex) -> Option<&StopNode> {
        self.graph.node_weight(index)
    }

    pub fn stop_mut(&mut self, index: NodeIndex) -> Option<&mut StopNode> {
        self.graph.node_weight_mut(index)
    }

    #[must_use]
    pub fn stop_by_key(&self, key: NodeKey) -> Option<&StopNode> {
        self.stop(self.index_of(key)?)
    }

    /// A train's node indices in sequence order
    #[must_use]
    pub fn train_nodes(&self, train: TrainId) -> Vec<NodeIndex> {
        self.paths
            .get(&train)
            .map(|path| path.values().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn first_node(&self, train: TrainId) -> Option<NodeIndex> {
        self.paths.get(&train)?.values().next().copied()
    }

    #[must_use]
    pub fn last_node(&self, train: TrainId) -> Option<NodeIndex> {
        self.paths.get(&train)?.values().next_back().copied()
    }

    /// Insert or update the stop at (`train`, `sequence`) from a feed report
    ///
    /// New nodes are spliced into the train's path-edge chain. Measured
    /// times freeze the respective computed delay at the observed value;
    /// a later report updates everything else in place. The flag says
    /// whether the report actually changed the stored state, so callers
    /// can tell a fresh observation from a repeated one.
    pub fn upsert_stop(
        &mut self,
        train: TrainId,
        sequence: u32,
        report: &StopReport,
    ) -> (NodeIndex, bool) {
        let key = NodeKey::new(train, sequence);
        let (index, inserted) = match self.index_of(key) {
            Some(index) => (index, false),
            None => {
                let index = self.graph.add_node(StopNode::new(train, sequence, &*report.track));
                self.splice_into_path(train, sequence, index);
                (index, true)
            }
        };

        let mut changed = inserted;
        if let Some(node) = self.graph.node_weight_mut(index) {
            let before = node.clone();
            node.track.clone_from(&report.track);
            node.planned_arrival = report.planned_arrival;
            node.planned_departure = report.planned_departure;
            node.flags = report.flags;
            node.linked_train = report.linked_train;

            if let (Some(planned), Some(measured)) =
                (report.planned_arrival, report.measured_arrival)
            {
                node.arrived = true;
                node.arrival_delay = minutes_between(planned, measured);
                node.reported_delay = Some(node.arrival_delay);
            }
            if let (Some(planned), Some(measured)) =
                (report.planned_departure, report.measured_departure)
            {
                node.departed = true;
                node.departure_delay = minutes_between(planned, measured);
                node.reported_delay = Some(node.departure_delay);
            }
            changed |= *node != before;
        }
        (index, changed)
    }

    /// Wire the path edges around a freshly inserted node
    fn splice_into_path(&mut self, train: TrainId, sequence: u32, index: NodeIndex) {
        let path = self.paths.entry(train).or_default();
        let prev = path.range(..sequence).next_back().map(|(_, &i)| i);
        let next = path.range(sequence + 1..).next().map(|(_, &i)| i);
        path.insert(sequence, index);

        if let (Some(prev), Some(next)) = (prev, next) {
            if let Some(direct) = self.find_edge_of_kind(prev, next, DependencyKind::Path) {
                self.graph.remove_edge(direct);
            }
        }
        if let Some(prev) = prev {
            self.graph
                .add_edge(prev, index, DependencyEdge::automatic(DependencyKind::Path));
        }
        if let Some(next) = next {
            self.graph
                .add_edge(index, next, DependencyEdge::automatic(DependencyKind::Path));
        }
        self.topo_cache = None;
    }

    /// Drop a train's nodes from `len` onward after a shortened re-report
    pub fn truncate_train(&mut self, train: TrainId, len: u32) -> RemovedNodes {
        let tail: Vec<NodeIndex> = self
            .paths
            .get(&train)
            .map(|path| path.range(len..).map(|(_, &i)| i).collect())
            .unwrap_or_default();
        self.remove_nodes(train, &tail)
    }

    /// Drop every node of a train, typically on eviction
    pub fn remove_train(&mut self, train: TrainId) -> RemovedNodes {
        let all = self.train_nodes(train);
        let removed = self.remove_nodes(train, &all);
        self.paths.remove(&train);
        removed
    }

    fn remove_nodes(&mut self, train: TrainId, indices: &[NodeIndex]) -> RemovedNodes {
        let mut removed = RemovedNodes::default();
        for &index in indices {
            for neighbor in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let external = self
                    .stop(neighbor)
                    .is_some_and(|stop| stop.train != train);
                if external && !removed.dependents.contains(&neighbor) {
                    removed.dependents.push(neighbor);
                }
            }
        }
        for &index in indices {
            if let Some(stop) = self.graph.remove_node(index) {
                removed.keys.push(stop.key());
                if let Some(path) = self.paths.get_mut(&train) {
                    path.remove(&stop.sequence);
                }
            }
        }
        if !removed.keys.is_empty() {
            self.topo_cache = None;
        }
        // dependents that went down with the same batch are not survivors
        removed
            .dependents
            .retain(|&index| self.graph.node_weight(index).is_some());
        removed
    }

    /// Install or update the dependency edge `reference -> dependent`
    ///
    /// An existing edge of the same kind between the pair is updated in
    /// place, including its activation. A new edge is checked against the
    /// acyclicity invariant and rolled back when it would close a cycle.
    ///
    /// # Errors
    ///
    /// `UnknownReference` if either key does not resolve to a live node,
    /// `CycleRejected` if the edge would make the dependency relation
    /// cyclic; the graph is left exactly as it was.
    pub fn link(
        &mut self,
        reference: NodeKey,
        dependent: NodeKey,
        edge: DependencyEdge,
    ) -> Result<EdgeIndex, DispatchError> {
        let source = self
            .index_of(reference)
            .ok_or(DispatchError::UnknownReference(Reference::Stop(reference)))?;
        let target = self
            .index_of(dependent)
            .ok_or(DispatchError::UnknownReference(Reference::Stop(dependent)))?;

        if let Some(existing) = self.find_edge_of_kind(source, target, edge.kind) {
            if let Some(weight) = self.graph.edge_weight_mut(existing) {
                *weight = edge;
            }
            return Ok(existing);
        }

        let added = self.graph.add_edge(source, target, edge);
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(order) => {
                self.topo_cache = Some(order);
                Ok(added)
            }
            Err(_) => {
                self.graph.remove_edge(added);
                Err(DispatchError::CycleRejected {
                    reference,
                    dependent,
                })
            }
        }
    }

    fn find_edge_of_kind(
        &self,
        source: NodeIndex,
        target: NodeIndex,
        kind: DependencyKind,
    ) -> Option<EdgeIndex> {
        self.graph
            .edges_connecting(source, target)
            .find(|edge| edge.weight().kind.same_kind(kind))
            .map(|edge| edge.id())
    }

    /// Incoming edges of a node as (source, payload) pairs
    #[must_use]
    pub fn edges_into(&self, index: NodeIndex) -> Vec<(NodeIndex, DependencyEdge)> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
            .collect()
    }

    /// Outgoing edges of a node as (target, payload) pairs
    #[must_use]
    pub fn edges_out_of(&self, index: NodeIndex) -> Vec<(NodeIndex, DependencyEdge)> {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| (edge.target(), *edge.weight()))
            .collect()
    }

    /// Remove incoming edges of `dependent` matching the predicate
    pub fn unlink_into_where(
        &mut self,
        dependent: NodeIndex,
        predicate: impl Fn(&DependencyEdge) -> bool,
    ) -> usize {
        let doomed: Vec<EdgeIndex> = self
            .graph
            .edges_directed(dependent, Direction::Incoming)
            .filter(|edge| predicate(edge.weight()))
            .map(|edge| edge.id())
            .collect();
        for edge in &doomed {
            self.graph.remove_edge(*edge);
        }
        if !doomed.is_empty() {
            self.topo_cache = None;
        }
        doomed.len()
    }

    /// Remove outgoing edges of `source` matching the predicate
    pub fn unlink_from_where(
        &mut self,
        source: NodeIndex,
        predicate: impl Fn(&DependencyEdge) -> bool,
    ) -> usize {
        let doomed: Vec<EdgeIndex> = self
            .graph
            .edges_directed(source, Direction::Outgoing)
            .filter(|edge| predicate(edge.weight()))
            .map(|edge| edge.id())
            .collect();
        for edge in &doomed {
            self.graph.remove_edge(*edge);
        }
        if !doomed.is_empty() {
            self.topo_cache = None;
        }
        doomed.len()
    }

    /// Topological evaluation order, rebuilt lazily after structural changes
    ///
    /// The install-time check keeps the graph acyclic, so a sort failure
    /// here means internal corruption; propagation is skipped rather than
    /// run in a wrong order.
    pub fn topo_order(&mut self) -> Vec<NodeIndex> {
        if self.topo_cache.is_none() {
            match petgraph::algo::toposort(&self.graph, None) {
                Ok(order) => self.topo_cache = Some(order),
                Err(_) => {
                    log::error!("dependency graph turned cyclic, skipping propagation");
                    self.topo_cache = Some(Vec::new());
                }
            }
        }
        self.topo_cache.clone().unwrap_or_default()
    }

    /// Every node's (key, arrival delay, departure delay), sorted by key
    ///
    /// Used by tests to compare whole-graph state before and after a
    /// mutation.
    #[must_use]
    pub fn delay_snapshot(&self) -> Vec<(NodeKey, i64, i64)> {
        let mut snapshot: Vec<(NodeKey, i64, i64)> = self
            .graph
            .node_weights()
            .map(|stop| (stop.key(), stop.arrival_delay, stop.departure_delay))
            .collect();
        snapshot.sort_unstable_by_key(|entry| entry.0);
        snapshot
    }
}

impl Default for ScheduleGraph {
    fn default() -> Self {
        Self::new()
    }
}

// Serialization helpers
mod graph_serde {
    use super::{DependencyEdge, StopNode};
    use petgraph::stable_graph::StableDiGraph;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(
        graph: &StableDiGraph<StopNode, DependencyEdge>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        graph.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<StableDiGraph<StopNode, DependencyEdge>, D::Error>
    where
        D: Deserializer<'de>,
    {
        StableDiGraph::deserialize(deserializer)
    }
}
