//! Incremental topological delay evaluation.

use super::ScheduleGraph;
use crate::constants::DispatchParams;
use crate::models::{AutoRule, DependencyKind, NodeKey, NodeOverride};
use crate::time::{add_minutes, minutes_between};
use chrono::NaiveDateTime;
use petgraph::stable_graph::NodeIndex;
use std::collections::{HashSet, VecDeque};

/// What one recompute pass touched
#[derive(Debug, Clone, Default)]
pub struct PropagationResult {
    /// Nodes whose computed delay changed, in evaluation order
    pub changed: Vec<NodeKey>,
    /// Nodes visited, changed or not
    pub evaluated: usize,
}

/// Recompute the nodes forward-reachable from `seeds`, in topological order
///
/// Every node's estimate is a pure function of its stored feed state and
/// its sources' already-evaluated estimates, so the pass is deterministic
/// and idempotent: running it again without new input changes nothing.
pub fn propagate(
    graph: &mut ScheduleGraph,
    params: &DispatchParams,
    seeds: &[NodeIndex],
) -> PropagationResult {
    let dirty = forward_closure(graph, seeds);
    run(graph, params, &dirty)
}

/// Recompute every node, used after bulk mutations
pub fn propagate_all(graph: &mut ScheduleGraph, params: &DispatchParams) -> PropagationResult {
    let dirty: HashSet<NodeIndex> = graph.graph.node_indices().collect();
    run(graph, params, &dirty)
}

fn run(
    graph: &mut ScheduleGraph,
    params: &DispatchParams,
    dirty: &HashSet<NodeIndex>,
) -> PropagationResult {
    #[cfg(feature = "perf_timing")]
    let started = std::time::Instant::now();

    let order = graph.topo_order();
    let mut result = PropagationResult::default();
    for index in order {
        if !dirty.contains(&index) {
            continue;
        }
        let Some((arrival, departure)) = evaluate(graph, params, index) else {
            continue;
        };
        result.evaluated += 1;
        if let Some(stop) = graph.stop_mut(index) {
            if stop.arrival_delay != arrival || stop.departure_delay != departure {
                stop.arrival_delay = arrival;
                stop.departure_delay = departure;
                result.changed.push(stop.key());
            }
        }
    }

    #[cfg(feature = "perf_timing")]
    log::debug!(
        "propagated {} nodes, {} changed, in {:?}",
        result.evaluated,
        result.changed.len(),
        started.elapsed()
    );
    result
}

/// Seeds plus everything reachable over outgoing dependency edges
///
/// Stale seed indices (nodes already evicted) are skipped.
fn forward_closure(graph: &ScheduleGraph, seeds: &[NodeIndex]) -> HashSet<NodeIndex> {
    let mut dirty = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = seeds
        .iter()
        .copied()
        .filter(|&index| graph.stop(index).is_some())
        .collect();
    while let Some(current) = queue.pop_front() {
        if !dirty.insert(current) {
            continue;
        }
        for (target, _) in graph.edges_out_of(current) {
            if !dirty.contains(&target) {
                queue.push_back(target);
            }
        }
    }
    dirty
}

/// One node's (arrival delay, departure delay) from its governing inputs
///
/// Observed arrivals and departures freeze the respective value; a
/// dispatcher override wins over every automatic formula; a node with no
/// input at all falls back to its own reported delay or zero.
fn evaluate(graph: &ScheduleGraph, params: &DispatchParams, index: NodeIndex) -> Option<(i64, i64)> {
    let stop = graph.stop(index)?.clone();
    let incoming = graph.edges_into(index);

    let mut arrival_inputs: Vec<i64> = Vec::new();
    let mut feeder_arrivals: Vec<i64> = Vec::new();
    let mut carries_through = false;
    for (source, edge) in &incoming {
        let Some(source) = graph.stop(*source) else {
            continue;
        };
        match edge.kind {
            DependencyKind::Path => arrival_inputs.push(source.departure_delay),
            DependencyKind::Replacement | DependencyKind::Splitting => {
                arrival_inputs.push(source.arrival_delay);
                carries_through = true;
            }
            DependencyKind::Coupling => feeder_arrivals.push(source.arrival_delay),
            DependencyKind::WaitArrival { .. } | DependencyKind::WaitDeparture { .. } => {}
        }
    }

    let arrival = if stop.arrived {
        stop.arrival_delay
    } else {
        match stop.rule {
            AutoRule::Entry => stop.reported_delay.unwrap_or(0),
            _ => arrival_inputs
                .into_iter()
                .max()
                .unwrap_or_else(|| stop.reported_delay.unwrap_or(0)),
        }
    };

    let departure = if stop.departed {
        stop.departure_delay
    } else if let Some(NodeOverride::FixedDelay(minutes)) = stop.manual {
        minutes
    } else if stop.manual == Some(NodeOverride::DoNotWait) {
        stop.reported_delay.unwrap_or(0)
    } else {
        let splits_here = graph
            .edges_out_of(index)
            .iter()
            .any(|(_, edge)| edge.kind == DependencyKind::Splitting);

        let base = match stop.rule {
            AutoRule::SignalHalt { minutes } => minutes,
            AutoRule::Entry => arrival,
            AutoRule::PlanStop => {
                if feeder_arrivals.is_empty() {
                    if carries_through || splits_here || !stop.flags.halts() {
                        arrival
                    } else if stop.planned_departure.is_none() {
                        arrival
                    } else {
                        (arrival - stop.recoverable_slack()).max(0)
                    }
                } else {
                    // the joined train leaves once both parts are there
                    let feeder_max = feeder_arrivals.into_iter().max().unwrap_or(arrival);
                    arrival.max(feeder_max) + params.coupling_overhead
                }
            }
        };

        let mut departure = base;
        for (source, edge) in &incoming {
            let Some(source) = graph.stop(*source) else {
                continue;
            };
            let clamp = match edge.kind {
                DependencyKind::WaitArrival { extra } => {
                    wait_clamp(source.estimated_arrival(), extra, stop.planned_departure)
                }
                DependencyKind::WaitDeparture { extra } => {
                    wait_clamp(source.estimated_departure(), extra, stop.planned_departure)
                }
                _ => None,
            };
            if let Some(min_delay) = clamp {
                departure = departure.max(min_delay);
            }
        }
        departure
    };

    Some((arrival, departure))
}

/// Minimum departure delay that honors waiting for `reference` plus margin
fn wait_clamp(
    reference: Option<NaiveDateTime>,
    extra: i64,
    planned_departure: Option<NaiveDateTime>,
) -> Option<i64> {
    let reference = reference?;
    let planned = planned_departure?;
    Some(minutes_between(planned, add_minutes(reference, extra)))
}
