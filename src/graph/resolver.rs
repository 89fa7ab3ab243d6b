//! Automatic rule and staging-edge derivation from reported plans.

use super::ScheduleGraph;
use crate::constants::DispatchParams;
use crate::models::{
    Activation, AutoRule, ChainRole, DependencyEdge, DependencyKind, NodeKey, StopFlags, TrainId,
    TrainStatus,
};
use crate::registry::TrainRegistry;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use std::collections::BTreeSet;

/// A coupling pair whose physical order cannot be read off the plan
///
/// Surfaced for manual resolution through the conflict view instead of
/// guessing which train reaches the shared track first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderFinding {
    pub feeder: NodeKey,
    pub trunk: NodeKey,
}

/// Re-derive rules, minimum dwell and staging edges for one train
///
/// Runs after every report for the train and is deterministic: with no
/// new feed data it leaves the graph exactly as it was. Automatic staging
/// edges sourced at this train are retired first and rebuilt from the
/// current flags, so withdrawn flags drop their edges.
pub fn classify_train(
    graph: &mut ScheduleGraph,
    registry: &mut TrainRegistry,
    params: &DispatchParams,
    train: TrainId,
) {
    let Some((status, reported)) = registry
        .get(train)
        .map(|train| (train.status, train.reported_delay))
    else {
        log::warn!("classify called for unknown train {train}");
        return;
    };
    let nodes = graph.train_nodes(train);
    let first = nodes.first().copied();

    for &index in &nodes {
        let staged_from_elsewhere = graph.edges_into(index).iter().any(|(_, edge)| {
            matches!(
                edge.kind,
                DependencyKind::Replacement | DependencyKind::Splitting
            )
        });
        if let Some(stop) = graph.stop_mut(index) {
            stop.min_dwell = stop.flags.min_dwell(params);
            if let AutoRule::SignalHalt { .. } = stop.rule {
                // holds until the feed clears it
            } else if Some(index) == first
                && status == TrainStatus::Pending
                && !staged_from_elsewhere
            {
                stop.rule = AutoRule::Entry;
                stop.reported_delay = Some(reported);
            } else {
                stop.rule = AutoRule::PlanStop;
            }
        }
    }

    for &index in &nodes {
        graph.unlink_from_where(index, |edge| {
            edge.activation == Activation::Automatic
                && matches!(
                    edge.kind,
                    DependencyKind::Replacement
                        | DependencyKind::Coupling
                        | DependencyKind::Splitting
                )
        });
    }
    for &index in &nodes {
        install_staging(graph, registry, train, index);
    }
}

/// Re-classify every train whose plan names `target` as a staging partner
///
/// Needed when `target` shows up after the trains pointing at it: their
/// staging edges could not be installed while the partner had no plan.
pub fn classify_linkers_of(
    graph: &mut ScheduleGraph,
    registry: &mut TrainRegistry,
    params: &DispatchParams,
    target: TrainId,
) {
    let linkers: BTreeSet<TrainId> = graph
        .graph
        .node_weights()
        .filter(|stop| stop.linked_train == Some(target) && stop.train != target)
        .map(|stop| stop.train)
        .collect();
    for train in linkers {
        classify_train(graph, registry, params, train);
    }
}

/// Wire the staging edges demanded by one node's flags
fn install_staging(
    graph: &mut ScheduleGraph,
    registry: &mut TrainRegistry,
    train: TrainId,
    index: NodeIndex,
) {
    let Some(stop) = graph.stop(index) else {
        return;
    };
    let flags = stop.flags;
    let linked = stop.linked_train;
    let source = stop.key();
    let track = stop.track.clone();

    if !flags.is_staging_point() {
        if let Some(other) = linked {
            log::warn!("train {train} names {other} at {source} without a staging flag");
        }
        return;
    }
    let Some(other) = linked else {
        log::warn!("train {train} carries a staging flag at {source} without a linked train");
        return;
    };
    if !registry.contains(other) {
        log::debug!("staging partner {other} of train {train} not announced yet");
        return;
    }

    if flags.contains(StopFlags::REPLACEMENT) {
        link_to_first(graph, registry, source, ChainRole::Replacement, other);
    }
    if flags.contains(StopFlags::SPLITTING) {
        link_to_first(graph, registry, source, ChainRole::Splitting, other);
    }
    if flags.contains(StopFlags::COUPLING) {
        if let Err(error) = registry.chain(train, ChainRole::Coupling, other) {
            log::warn!("coupling of train {train} onto {other} rejected: {error}");
            return;
        }
        // the feeder rolls onto the trunk's stop at the shared track
        let join = graph
            .train_nodes(other)
            .into_iter()
            .find(|&candidate| graph.stop(candidate).is_some_and(|stop| stop.track == track));
        match join.and_then(|candidate| graph.stop(candidate)).map(|stop| stop.key()) {
            Some(target) => {
                if let Err(error) =
                    graph.link(source, target, DependencyEdge::automatic(DependencyKind::Coupling))
                {
                    log::warn!("coupling edge {source} -> {target} rejected: {error}");
                }
            }
            None => log::debug!("trunk {other} has no stop on track {track} yet"),
        }
    }
}

/// Chain `role` to `other` and hang the staging edge on its first node
fn link_to_first(
    graph: &mut ScheduleGraph,
    registry: &mut TrainRegistry,
    source: NodeKey,
    role: ChainRole,
    other: TrainId,
) {
    if let Err(error) = registry.chain(source.train, role, other) {
        log::warn!("{role} chain of train {} to {other} rejected: {error}", source.train);
        return;
    }
    let Some(target_index) = graph.first_node(other) else {
        log::debug!("{role} partner {other} has no plan yet");
        return;
    };
    let Some(target) = graph.stop(target_index).map(|stop| stop.key()) else {
        return;
    };
    let kind = match role {
        ChainRole::Replacement => DependencyKind::Replacement,
        ChainRole::Splitting => DependencyKind::Splitting,
        ChainRole::Coupling => DependencyKind::Coupling,
    };
    match graph.link(source, target, DependencyEdge::automatic(kind)) {
        Ok(_) => {
            // the continuation is fed by the edge, not tracked as an entry
            if let Some(stop) = graph.stop_mut(target_index) {
                if stop.rule == AutoRule::Entry {
                    stop.rule = AutoRule::PlanStop;
                }
            }
        }
        Err(error) => log::warn!("{role} edge {source} -> {target} rejected: {error}"),
    }
}

/// Coupling pairs where the feeder is estimated to arrive after the trunk
///
/// The plan alone cannot say which train reaches the shared track first
/// in that case, so the pair is reported instead of resolved.
#[must_use]
pub fn coupling_order_findings(graph: &ScheduleGraph) -> Vec<OrderFinding> {
    let mut findings = Vec::new();
    for edge in graph.graph.edge_references() {
        if edge.weight().kind != DependencyKind::Coupling {
            continue;
        }
        let (Some(feeder), Some(trunk)) = (graph.stop(edge.source()), graph.stop(edge.target()))
        else {
            continue;
        };
        let (Some(feeder_eta), Some(trunk_eta)) =
            (feeder.estimated_arrival(), trunk.estimated_arrival())
        else {
            continue;
        };
        if feeder_eta > trunk_eta {
            findings.push(OrderFinding {
                feeder: feeder.key(),
                trunk: trunk.key(),
            });
        }
    }
    findings.sort_unstable_by_key(|finding| (finding.trunk, finding.feeder));
    findings
}
