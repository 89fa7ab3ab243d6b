//! Track occupancy intervals and the conflicts derived from them.

use crate::constants::MIN_SLOT_MINUTES;
use crate::graph::resolver;
use crate::graph::ScheduleGraph;
use crate::models::{DependencyKind, NodeKey};
use crate::registry::TrainRegistry;
use crate::time::add_minutes;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The time window one stop occupies its track
///
/// Bounded by the estimated arrival and departure; a stop without one of
/// the two, and any stop shorter than a minute, occupies one minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub node: NodeKey,
    pub track: String,
    /// Track name, or the configured sector the track maps to
    pub resource: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Two families claim the same track or sector at once
    TrackOverlap,
    /// A staging partner is timed on the wrong side of its counterpart
    StagingOrder,
    /// Coupling order not inferable from the plan, needs a decision
    OrderAmbiguous,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictKind::TrackOverlap => "overlap",
            ConflictKind::StagingOrder => "staging",
            ConflictKind::OrderAmbiguous => "order",
        };
        write!(f, "{label}")
    }
}

/// One derived conflict between two stops
///
/// Informational state, never an error: the dispatcher resolves it on the
/// layout, the view only keeps reporting it while the condition holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyConflict {
    pub kind: ConflictKind,
    pub resource: String,
    pub nodes: [NodeKey; 2],
    /// The disputed time window
    pub window: (NaiveDateTime, NaiveDateTime),
    /// Suppressed by an acknowledge action until the window moves
    pub acknowledged: bool,
}

impl OccupancyConflict {
    /// Stable identity across refreshes, independent of the window
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}.{}+{}.{}",
            self.kind,
            self.resource,
            self.nodes[0].train,
            self.nodes[0].sequence,
            self.nodes[1].train,
            self.nodes[1].sequence
        )
    }
}

/// Occupancy slots and conflicts over every known track
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackOccupancy {
    /// Track name to sector name; unmapped tracks stand alone
    sectors: HashMap<String, String>,
    slots: Vec<Slot>,
    conflicts: IndexMap<String, OccupancyConflict>,
    /// Window snapshot per acknowledged conflict key
    acked: HashMap<String, (NaiveDateTime, NaiveDateTime)>,
}

impl TrackOccupancy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a track onto a shared sector resource
    pub fn set_sector(&mut self, track: impl Into<String>, sector: impl Into<String>) {
        self.sectors.insert(track.into(), sector.into());
    }

    pub fn remove_sector(&mut self, track: &str) {
        self.sectors.remove(track);
    }

    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_on(&self, resource: &str) -> impl Iterator<Item = &Slot> {
        let resource = resource.to_owned();
        self.slots.iter().filter(move |slot| slot.resource == resource)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &OccupancyConflict> {
        self.conflicts.values()
    }

    /// Conflicts not currently suppressed by an acknowledgement
    pub fn active(&self) -> impl Iterator<Item = &OccupancyConflict> {
        self.conflicts.values().filter(|conflict| !conflict.acknowledged)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OccupancyConflict> {
        self.conflicts.get(key)
    }

    /// Suppress a conflict at its current window; false for an unknown key
    pub fn acknowledge(&mut self, key: &str) -> bool {
        let Some(conflict) = self.conflicts.get_mut(key) else {
            return false;
        };
        conflict.acknowledged = true;
        self.acked.insert(key.to_owned(), conflict.window);
        true
    }

    /// Withdraw an acknowledgement; false if none was set
    pub fn clear_acknowledgement(&mut self, key: &str) -> bool {
        let existed = self.acked.remove(key).is_some();
        if let Some(conflict) = self.conflicts.get_mut(key) {
            conflict.acknowledged = false;
        }
        existed
    }

    /// Rebuild slots and conflicts from the current graph state
    ///
    /// Returns the conflict keys that appeared, changed or vanished.
    /// Acknowledgements survive as long as the conflict's window stays
    /// where it was acknowledged; a moved window resurfaces the conflict.
    pub fn refresh(&mut self, graph: &ScheduleGraph, registry: &TrainRegistry) -> Vec<String> {
        self.slots = self.build_slots(graph);
        let mut next: IndexMap<String, OccupancyConflict> = IndexMap::new();

        for conflict in self.overlap_conflicts(registry) {
            next.insert(conflict.key(), conflict);
        }
        for conflict in staging_conflicts(graph) {
            next.insert(conflict.key(), conflict);
        }
        for finding in resolver::coupling_order_findings(graph) {
            if let Some(conflict) = order_conflict(graph, finding) {
                next.insert(conflict.key(), conflict);
            }
        }

        self.acked.retain(|key, _| next.contains_key(key));
        for (key, conflict) in &mut next {
            conflict.acknowledged = self.acked.get(key) == Some(&conflict.window);
        }

        let mut changed: Vec<String> = Vec::new();
        for (key, conflict) in &next {
            if self.conflicts.get(key) != Some(conflict) {
                changed.push(key.clone());
            }
        }
        for key in self.conflicts.keys() {
            if !next.contains_key(key) {
                changed.push(key.clone());
            }
        }
        self.conflicts = next;
        changed
    }

    fn build_slots(&self, graph: &ScheduleGraph) -> Vec<Slot> {
        let mut slots: Vec<Slot> = Vec::new();
        for stop in graph.graph.node_weights() {
            let start = match stop.estimated_arrival().or_else(|| stop.estimated_departure()) {
                Some(start) => start,
                None => continue,
            };
            let end = stop.estimated_departure().unwrap_or(start);
            let end = end.max(add_minutes(start, MIN_SLOT_MINUTES));
            let resource = self
                .sectors
                .get(&stop.track)
                .cloned()
                .unwrap_or_else(|| stop.track.clone());
            slots.push(Slot {
                node: stop.key(),
                track: stop.track.clone(),
                resource,
                start,
                end,
            });
        }
        slots.sort_unstable_by(|a, b| {
            (&a.resource, a.start, a.node).cmp(&(&b.resource, b.start, b.node))
        });
        slots
    }

    /// Pairwise overlap within each resource, same chain family excluded
    fn overlap_conflicts(&self, registry: &TrainRegistry) -> Vec<OccupancyConflict> {
        let mut conflicts = Vec::new();
        for (i, first) in self.slots.iter().enumerate() {
            let family = registry.chain_family(first.node.train);
            for second in self.slots[i + 1..]
                .iter()
                .take_while(|second| second.resource == first.resource)
            {
                // slots are start-sorted, so no later slot can still overlap
                if second.start > first.end {
                    break;
                }
                if family.contains(&second.node.train) {
                    continue;
                }
                conflicts.push(OccupancyConflict {
                    kind: ConflictKind::TrackOverlap,
                    resource: first.resource.clone(),
                    nodes: [first.node, second.node],
                    window: (second.start, first.end.min(second.end)),
                    acknowledged: false,
                });
            }
        }
        conflicts
    }
}

/// Coupling and splitting partners timed on the wrong side of each other
fn staging_conflicts(graph: &ScheduleGraph) -> Vec<OccupancyConflict> {
    let mut conflicts = Vec::new();
    for edge in graph.graph.edge_references() {
        let (Some(source), Some(target)) = (graph.stop(edge.source()), graph.stop(edge.target()))
        else {
            continue;
        };
        match edge.weight().kind {
            DependencyKind::Coupling => {
                // the trunk must still stand there when the feeder rolls on
                let left_already = target.departed;
                let (Some(feeder_arrival), Some(trunk_departure)) =
                    (source.estimated_arrival(), target.estimated_departure())
                else {
                    continue;
                };
                if left_already && feeder_arrival > trunk_departure {
                    conflicts.push(OccupancyConflict {
                        kind: ConflictKind::StagingOrder,
                        resource: target.track.clone(),
                        nodes: [source.key(), target.key()],
                        window: (trunk_departure, feeder_arrival),
                        acknowledged: false,
                    });
                }
            }
            DependencyKind::Splitting => {
                // the child cannot leave before its cars have arrived
                let (Some(child_departure), Some(parent_arrival)) =
                    (target.estimated_departure(), source.estimated_arrival())
                else {
                    continue;
                };
                if child_departure < parent_arrival {
                    conflicts.push(OccupancyConflict {
                        kind: ConflictKind::StagingOrder,
                        resource: source.track.clone(),
                        nodes: [source.key(), target.key()],
                        window: (child_departure, parent_arrival),
                        acknowledged: false,
                    });
                }
            }
            _ => {}
        }
    }
    conflicts
}

fn order_conflict(graph: &ScheduleGraph, finding: resolver::OrderFinding) -> Option<OccupancyConflict> {
    let feeder = graph.stop_by_key(finding.feeder)?;
    let trunk = graph.stop_by_key(finding.trunk)?;
    Some(OccupancyConflict {
        kind: ConflictKind::OrderAmbiguous,
        resource: trunk.track.clone(),
        nodes: [finding.feeder, finding.trunk],
        window: (trunk.estimated_arrival()?, feeder.estimated_arrival()?),
        acknowledged: false,
    })
}
