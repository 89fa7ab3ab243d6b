//! One feed connection's complete dispatch state and mutation pipeline.

use crate::connection::{ConnectionKey, ConnectionMatrix};
use crate::constants::{DispatchParams, BASE_MIDNIGHT};
use crate::dispatch::DispatcherAction;
use crate::error::{DispatchError, Reference};
use crate::graph::propagation::{self, PropagationResult};
use crate::graph::{resolver, ScheduleGraph};
use crate::models::{
    AutoRule, DependencyEdge, DependencyKind, FeedEvent, NodeKey, NodeOverride, StopNode, Train,
    TrainId, TrainReport,
};
use crate::occupancy::{OccupancyConflict, TrackOccupancy};
use crate::registry::TrainRegistry;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use petgraph::stable_graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// What one mutation changed, keyed for incremental redraw
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Stops whose stored state or computed delays changed, or vanished
    pub nodes: Vec<NodeKey>,
    /// Connection pairs that changed, appeared or vanished
    pub connections: Vec<ConnectionKey>,
    /// Conflict keys that changed, appeared or vanished
    pub conflicts: Vec<String>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.connections.is_empty() && self.conflicts.is_empty()
    }
}

/// The explicit per-connection context: registry, graph, views, clock
///
/// One session per feed connection; every mutation enters through
/// `ingest` (best-effort) or `execute` (strict) and runs the full
/// pipeline synchronously: registry and graph mutation, reclassification
/// of the affected trains, incremental delay propagation, view refresh.
/// Between mutations the session is a read-only snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSession {
    pub id: Uuid,
    pub params: DispatchParams,
    now: NaiveDateTime,
    registry: TrainRegistry,
    graph: ScheduleGraph,
    matrices: IndexMap<String, ConnectionMatrix>,
    occupancy: TrackOccupancy,
}

impl DispatchSession {
    #[must_use]
    pub fn new(params: DispatchParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            now: BASE_MIDNIGHT,
            registry: TrainRegistry::new(),
            graph: ScheduleGraph::new(),
            matrices: IndexMap::new(),
            occupancy: TrackOccupancy::new(),
        }
    }

    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    #[must_use]
    pub fn graph(&self) -> &ScheduleGraph {
        &self.graph
    }

    #[must_use]
    pub fn registry(&self) -> &TrainRegistry {
        &self.registry
    }

    #[must_use]
    pub fn occupancy(&self) -> &TrackOccupancy {
        &self.occupancy
    }

    #[must_use]
    pub fn train(&self, id: TrainId) -> Option<&Train> {
        self.registry.get(id)
    }

    /// Computed (arrival delay, departure delay) of one stop
    #[must_use]
    pub fn delay(&self, train: TrainId, sequence: u32) -> Option<(i64, i64)> {
        let stop = self.graph.stop_by_key(NodeKey::new(train, sequence))?;
        Some((stop.arrival_delay, stop.departure_delay))
    }

    /// A train's stops in sequence order
    #[must_use]
    pub fn stops(&self, train: TrainId) -> Vec<&StopNode> {
        self.graph
            .train_nodes(train)
            .into_iter()
            .filter_map(|index| self.graph.stop(index))
            .collect()
    }

    #[must_use]
    pub fn chain_family(&self, id: TrainId) -> HashSet<TrainId> {
        self.registry.chain_family(id)
    }

    #[must_use]
    pub fn connection_matrix(&self, station: &str) -> Option<&ConnectionMatrix> {
        self.matrices.get(station)
    }

    /// Currently active (unacknowledged) conflicts
    pub fn conflicts(&self) -> impl Iterator<Item = &OccupancyConflict> {
        self.occupancy.active()
    }

    /// Register a station group to derive a connection matrix for
    pub fn add_station_view(
        &mut self,
        station: impl Into<String>,
        tracks: impl IntoIterator<Item = String>,
    ) -> ChangeSet {
        let station = station.into();
        let mut matrix = ConnectionMatrix::new(station.clone(), tracks);
        let connections = matrix.refresh(&self.graph, &self.registry, &self.params, self.now);
        self.matrices.insert(station, matrix);
        ChangeSet {
            connections,
            ..ChangeSet::default()
        }
    }

    /// Map a track onto a shared occupancy sector
    pub fn set_sector(&mut self, track: impl Into<String>, sector: impl Into<String>) -> ChangeSet {
        self.occupancy.set_sector(track, sector);
        let conflicts = self.occupancy.refresh(&self.graph, &self.registry);
        ChangeSet {
            conflicts,
            ..ChangeSet::default()
        }
    }

    /// Apply one feed item, best-effort
    ///
    /// Malformed or unresolvable parts are dropped with a diagnostic;
    /// the rest of the item still applies. Never fails.
    pub fn ingest(&mut self, event: FeedEvent) -> ChangeSet {
        match event {
            FeedEvent::Report(report) => self.ingest_report(&report),
            FeedEvent::UnscheduledHalt { train, minutes } => {
                self.set_signal_halt(train, minutes.max(0))
            }
            FeedEvent::HaltCleared { train } => self.clear_signal_halt(train),
            FeedEvent::Clock(now) => self.advance_clock(now),
        }
    }

    /// Apply one dispatcher action, strictly
    ///
    /// # Errors
    ///
    /// `UnknownReference` when the named stop, connection or conflict is
    /// not present; `CycleRejected` when a wait edge would close a
    /// dependency cycle. A rejected action has no effect at all.
    pub fn execute(&mut self, action: DispatcherAction) -> Result<ChangeSet, DispatchError> {
        log::debug!("dispatcher action: {action}");
        match action {
            DispatcherAction::WaitForArrival {
                reference,
                dependent,
                extra,
            } => {
                let extra = extra.unwrap_or(self.params.wait_arrival_extra);
                self.install_wait(reference, dependent, DependencyKind::WaitArrival { extra })
            }
            DispatcherAction::WaitForDeparture {
                reference,
                dependent,
                extra,
            } => {
                let extra = extra.unwrap_or(self.params.wait_departure_extra);
                self.install_wait(reference, dependent, DependencyKind::WaitDeparture { extra })
            }
            DispatcherAction::SetFixedDelay { node, minutes } => {
                self.set_override(node, Some(NodeOverride::FixedDelay(minutes)))
            }
            DispatcherAction::AdjustDelay { node, delta } => {
                let index = self.resolve(node)?;
                let current = self
                    .graph
                    .stop(index)
                    .map_or(0, |stop| stop.departure_delay);
                self.set_override(node, Some(NodeOverride::FixedDelay(current + delta)))
            }
            DispatcherAction::DoNotWait { node } => {
                self.set_override(node, Some(NodeOverride::DoNotWait))
            }
            DispatcherAction::ClearOverrides { node } => {
                let index = self.resolve(node)?;
                if let Some(stop) = self.graph.stop_mut(index) {
                    stop.manual = None;
                }
                self.graph.unlink_into_where(index, |edge| {
                    edge.activation == crate::models::Activation::DispatcherOverride
                        && edge.kind.is_wait()
                });
                Ok(self.after_reseed(vec![index]))
            }
            DispatcherAction::GiveUpConnection { arrival, departure } => {
                self.mark_connection(arrival, departure, true)
            }
            DispatcherAction::RestoreConnection { arrival, departure } => {
                self.mark_connection(arrival, departure, false)
            }
            DispatcherAction::AcknowledgeConflict { key } => {
                if self.occupancy.acknowledge(&key) {
                    Ok(self.views_only())
                } else {
                    Err(DispatchError::UnknownReference(Reference::Conflict(key)))
                }
            }
            DispatcherAction::ClearAcknowledgement { key } => {
                if self.occupancy.clear_acknowledgement(&key) {
                    Ok(self.views_only())
                } else {
                    Err(DispatchError::UnknownReference(Reference::Conflict(key)))
                }
            }
        }
    }

    fn ingest_report(&mut self, report: &TrainReport) -> ChangeSet {
        let train = report.id;
        if report.stops.is_empty() && !self.registry.contains(train) {
            log::warn!("dropping report for unknown train {train} without stops");
            return ChangeSet::default();
        }
        let is_new = self.registry.upsert(report, self.now);

        let mut touched: Vec<NodeKey> = Vec::new();
        let mut dependents: Vec<NodeIndex> = Vec::new();
        for (sequence, stop) in report.stops.iter().enumerate() {
            let Ok(sequence) = u32::try_from(sequence) else {
                log::warn!("train {train} plan too long, ignoring the tail");
                break;
            };
            let (_, changed) = self.graph.upsert_stop(train, sequence, stop);
            if changed {
                touched.push(NodeKey::new(train, sequence));
            }
        }
        if !report.stops.is_empty() {
            // a shorter re-report shrinks the plan
            let len = u32::try_from(report.stops.len()).unwrap_or(u32::MAX);
            let removed = self.graph.truncate_train(train, len);
            touched.extend(removed.keys);
            dependents.extend(removed.dependents);
        }

        resolver::classify_train(&mut self.graph, &mut self.registry, &self.params, train);
        if is_new {
            resolver::classify_linkers_of(&mut self.graph, &mut self.registry, &self.params, train);
        }

        let mut seeds = self.graph.train_nodes(train);
        seeds.extend(dependents);
        let result = propagation::propagate(&mut self.graph, &self.params, &seeds);
        self.finish(touched, result)
    }

    /// Hang a signal halt on the train's next open stop
    fn set_signal_halt(&mut self, train: TrainId, minutes: i64) -> ChangeSet {
        let open = self
            .graph
            .train_nodes(train)
            .into_iter()
            .find(|&index| self.graph.stop(index).is_some_and(|stop| !stop.departed));
        let Some(index) = open else {
            log::warn!("unscheduled halt for train {train} with no open stop");
            return ChangeSet::default();
        };
        if let Some(stop) = self.graph.stop_mut(index) {
            stop.rule = AutoRule::SignalHalt { minutes };
        }
        self.after_reseed(vec![index])
    }

    fn clear_signal_halt(&mut self, train: TrainId) -> ChangeSet {
        let mut seeds: Vec<NodeIndex> = Vec::new();
        for index in self.graph.train_nodes(train) {
            if let Some(stop) = self.graph.stop_mut(index) {
                if let AutoRule::SignalHalt { .. } = stop.rule {
                    stop.rule = AutoRule::PlanStop;
                    seeds.push(index);
                }
            }
        }
        if seeds.is_empty() {
            log::debug!("halt cleared for train {train} without an active halt");
            return ChangeSet::default();
        }
        // restore entry tracking where the halt had taken over
        resolver::classify_train(&mut self.graph, &mut self.registry, &self.params, train);
        self.after_reseed(seeds)
    }

    /// Advance the session clock, evicting trains past retention
    fn advance_clock(&mut self, now: NaiveDateTime) -> ChangeSet {
        self.now = now;
        let mut removed_keys: Vec<NodeKey> = Vec::new();
        let mut seeds: Vec<NodeIndex> = Vec::new();
        for train in self.registry.expired(now, self.params.retention_minutes) {
            let removed = self.graph.remove_train(train);
            removed_keys.extend(removed.keys);
            seeds.extend(removed.dependents);
            self.registry.remove(train);
            log::debug!("evicted train {train} after retention");
        }
        let result = propagation::propagate(&mut self.graph, &self.params, &seeds);
        self.finish(removed_keys, result)
    }

    fn install_wait(
        &mut self,
        reference: NodeKey,
        dependent: NodeKey,
        kind: DependencyKind,
    ) -> Result<ChangeSet, DispatchError> {
        self.graph
            .link(reference, dependent, DependencyEdge::manual(kind))?;
        let index = self.resolve(dependent)?;
        Ok(self.after_reseed(vec![index]))
    }

    fn set_override(
        &mut self,
        node: NodeKey,
        manual: Option<NodeOverride>,
    ) -> Result<ChangeSet, DispatchError> {
        let index = self.resolve(node)?;
        if let Some(stop) = self.graph.stop_mut(index) {
            stop.manual = manual;
        }
        Ok(self.after_reseed(vec![index]))
    }

    fn mark_connection(
        &mut self,
        arrival: NodeKey,
        departure: NodeKey,
        give_up: bool,
    ) -> Result<ChangeSet, DispatchError> {
        let mut found = false;
        for matrix in self.matrices.values_mut() {
            found |= if give_up {
                matrix.give_up(arrival, departure)
            } else {
                matrix.restore(arrival, departure)
            };
        }
        if found {
            Ok(self.views_only())
        } else {
            Err(DispatchError::UnknownReference(Reference::Connection(
                arrival, departure,
            )))
        }
    }

    fn resolve(&self, node: NodeKey) -> Result<NodeIndex, DispatchError> {
        self.graph
            .index_of(node)
            .ok_or(DispatchError::UnknownReference(Reference::Stop(node)))
    }

    fn after_reseed(&mut self, seeds: Vec<NodeIndex>) -> ChangeSet {
        let result = propagation::propagate(&mut self.graph, &self.params, &seeds);
        self.finish(Vec::new(), result)
    }

    fn views_only(&mut self) -> ChangeSet {
        let (connections, conflicts) = self.refresh_views();
        ChangeSet {
            nodes: Vec::new(),
            connections,
            conflicts,
        }
    }

    fn finish(&mut self, mut nodes: Vec<NodeKey>, result: PropagationResult) -> ChangeSet {
        nodes.extend(result.changed);
        nodes.sort_unstable();
        nodes.dedup();
        let (connections, conflicts) = self.refresh_views();
        ChangeSet {
            nodes,
            connections,
            conflicts,
        }
    }

    fn refresh_views(&mut self) -> (Vec<ConnectionKey>, Vec<String>) {
        let mut connections: Vec<ConnectionKey> = Vec::new();
        for matrix in self.matrices.values_mut() {
            connections.extend(matrix.refresh(&self.graph, &self.registry, &self.params, self.now));
        }
        let conflicts = self.occupancy.refresh(&self.graph, &self.registry);
        (connections, conflicts)
    }
}

impl Default for DispatchSession {
    fn default() -> Self {
        Self::new(DispatchParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BASE_DATE;
    use crate::models::{StopReport, TrainStatus};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        BASE_DATE.and_hms_opt(h, m, 0).expect("valid time")
    }

    fn stop(track: &str, arrival: Option<(u32, u32)>, departure: Option<(u32, u32)>) -> StopReport {
        let mut report = StopReport::new(track);
        report.planned_arrival = arrival.map(|(h, m)| at(h, m));
        report.planned_departure = departure.map(|(h, m)| at(h, m));
        report
    }

    fn train_report(id: i64, delay: i64, stops: Vec<StopReport>) -> TrainReport {
        let mut report = TrainReport::new(TrainId(id), format!("RB {id}"), "RB");
        report.delay = delay;
        report.stops = stops;
        report
    }

    /// Entry at 8:00, stop with 5 minutes slack, exit
    fn simple_report(id: i64, delay: i64) -> TrainReport {
        train_report(
            id,
            delay,
            vec![
                stop("1", None, Some((8, 0))),
                stop("2", Some((8, 10)), Some((8, 15))),
                stop("3", Some((8, 25)), None),
            ],
        )
    }

    #[test]
    fn test_report_pipeline_and_idempotence() {
        let mut session = DispatchSession::default();
        let changes = session.ingest(FeedEvent::Report(simple_report(1, 5)));
        assert!(!changes.nodes.is_empty());

        let train = TrainId(1);
        assert_eq!(session.delay(train, 0), Some((5, 5)));
        assert_eq!(session.delay(train, 1), Some((5, 0)), "dwell absorbs the delay");
        assert_eq!(session.delay(train, 2), Some((0, 0)));
        assert_eq!(session.stops(train).len(), 3);

        let repeat = session.ingest(FeedEvent::Report(simple_report(1, 5)));
        assert!(repeat.is_empty(), "identical report changes nothing");
    }

    #[test]
    fn test_shrunken_plan_drops_tail() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(simple_report(1, 0)));
        let shorter = train_report(
            1,
            0,
            vec![
                stop("1", None, Some((8, 0))),
                stop("2", Some((8, 10)), None),
            ],
        );
        let changes = session.ingest(FeedEvent::Report(shorter));
        assert_eq!(session.stops(TrainId(1)).len(), 2);
        assert!(changes.nodes.contains(&NodeKey::new(TrainId(1), 2)));
    }

    #[test]
    fn test_coupling_formula_end_to_end() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(train_report(
            1,
            4,
            vec![
                stop("1", None, Some((8, 0))),
                stop("5", Some((8, 10)), Some((8, 30))),
                stop("7", Some((8, 50)), None),
            ],
        )));
        session.ingest(FeedEvent::Report(train_report(
            2,
            9,
            vec![
                stop("2", None, Some((8, 5))),
                stop("5", Some((8, 15)), None).with_flags("K(1)"),
            ],
        )));

        let trunk = TrainId(1);
        assert_eq!(session.delay(trunk, 1), Some((4, 11)), "max(4, 9) + 2");
        assert_eq!(session.delay(trunk, 2).map(|(arrival, _)| arrival), Some(11));
        assert!(session.chain_family(trunk).contains(&TrainId(2)));
    }

    #[test]
    fn test_late_trunk_is_linked_when_it_appears() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(train_report(
            2,
            9,
            vec![
                stop("2", None, Some((8, 5))),
                stop("5", Some((8, 15)), None).with_flags("K(1)"),
            ],
        )));
        assert!(session.chain_family(TrainId(2)).len() == 1, "partner unknown");

        session.ingest(FeedEvent::Report(train_report(
            1,
            4,
            vec![
                stop("1", None, Some((8, 0))),
                stop("5", Some((8, 10)), Some((8, 30))),
            ],
        )));
        assert_eq!(session.delay(TrainId(1), 1), Some((4, 11)));
    }

    #[test]
    fn test_connection_window_boundary() {
        let params = DispatchParams {
            min_transfer: 3,
            max_connection: 20,
            ..DispatchParams::default()
        };
        let mut session = DispatchSession::new(params);
        session.add_station_view("Hbf", ["1", "2"].map(String::from));

        session.ingest(FeedEvent::Report(train_report(
            1,
            0,
            vec![stop("1", Some((8, 0)), Some((8, 30)))],
        )));
        session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("2", None, Some((8, 3)))],
        )));
        session.ingest(FeedEvent::Report(train_report(
            3,
            0,
            vec![stop("2", None, Some((8, 2)))],
        )));

        let matrix = session.connection_matrix("Hbf").expect("view exists");
        let arrival = NodeKey::new(TrainId(1), 0);
        let boundary = matrix
            .get(arrival, NodeKey::new(TrainId(2), 0))
            .expect("pair");
        assert_eq!(boundary.status, crate::connection::ConnectionStatus::Likely);
        let below = matrix
            .get(arrival, NodeKey::new(TrainId(3), 0))
            .expect("pair");
        assert_eq!(below.status, crate::connection::ConnectionStatus::Broken);

        // more delay never rescues a plan below the minimum
        session.ingest(FeedEvent::Report(train_report(
            3,
            10,
            vec![stop("2", None, Some((8, 2)))],
        )));
        let matrix = session.connection_matrix("Hbf").expect("view exists");
        let below = matrix
            .get(arrival, NodeKey::new(TrainId(3), 0))
            .expect("pair");
        assert_eq!(below.status, crate::connection::ConnectionStatus::Broken);
    }

    #[test]
    fn test_eviction_releases_dependent_and_views() {
        fn retiring_report(delay: i64) -> TrainReport {
            train_report(
                1,
                delay,
                vec![
                    stop("1", None, Some((8, 0))),
                    stop("2", Some((8, 20)), None).with_flags("E(2)"),
                ],
            )
        }

        let mut session = DispatchSession::default();
        session.add_station_view("Hbf", ["1", "2", "3"].map(String::from));
        session.ingest(FeedEvent::Report(retiring_report(7)));
        session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("2", None, Some((8, 30))), stop("3", Some((8, 45)), None)],
        )));
        assert_eq!(session.delay(TrainId(2), 0), Some((7, 7)), "inherited");
        let pair = (NodeKey::new(TrainId(1), 1), NodeKey::new(TrainId(2), 0));
        assert!(session
            .connection_matrix("Hbf")
            .and_then(|matrix| matrix.get(pair.0, pair.1))
            .is_some());

        session.ingest(FeedEvent::Clock(at(9, 0)));
        let mut departed = retiring_report(7);
        departed.status = TrainStatus::Departed;
        session.ingest(FeedEvent::Report(departed));

        let changes = session.ingest(FeedEvent::Clock(at(10, 1)));
        assert!(session.train(TrainId(1)).is_none(), "evicted");
        assert!(changes.nodes.contains(&NodeKey::new(TrainId(1), 0)));
        assert_eq!(session.delay(TrainId(2), 0), Some((0, 0)), "fell back");
        assert!(session
            .connection_matrix("Hbf")
            .and_then(|matrix| matrix.get(pair.0, pair.1))
            .is_none());
        assert!(changes.connections.contains(&pair));
    }

    #[test]
    fn test_override_precedence_and_revert() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(simple_report(1, 6)));
        let node = NodeKey::new(TrainId(1), 1);
        assert_eq!(session.delay(TrainId(1), 1), Some((6, 1)));

        let changes = session
            .execute(DispatcherAction::SetFixedDelay { node, minutes: 12 })
            .expect("apply");
        assert_eq!(session.delay(TrainId(1), 1), Some((6, 12)));
        assert_eq!(session.delay(TrainId(1), 2).map(|(arrival, _)| arrival), Some(12));
        assert!(changes.nodes.contains(&node));

        session
            .execute(DispatcherAction::ClearOverrides { node })
            .expect("clear");
        assert_eq!(session.delay(TrainId(1), 1), Some((6, 1)), "formula returns");
    }

    #[test]
    fn test_adjust_delay_is_relative() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(simple_report(1, 6)));
        let node = NodeKey::new(TrainId(1), 1);
        session
            .execute(DispatcherAction::AdjustDelay { node, delta: 3 })
            .expect("apply");
        assert_eq!(session.delay(TrainId(1), 1), Some((6, 4)), "1 + 3");
    }

    #[test]
    fn test_wait_for_departure_holds_dependent() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(simple_report(1, 10)));
        session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("9", None, Some((8, 20))), stop("10", Some((8, 35)), None)],
        )));

        session
            .execute(DispatcherAction::WaitForDeparture {
                reference: NodeKey::new(TrainId(1), 1),
                dependent: NodeKey::new(TrainId(2), 0),
                extra: None,
            })
            .expect("apply");
        // feeder leaves 8:20 (5 of 10 absorbed); default margin 2
        assert_eq!(session.delay(TrainId(2), 0).map(|(_, dep)| dep), Some(2));
    }

    #[test]
    fn test_cycle_rejection_is_atomic() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(simple_report(1, 0)));
        session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("9", None, Some((8, 20))), stop("10", Some((8, 35)), None)],
        )));
        session
            .execute(DispatcherAction::WaitForArrival {
                reference: NodeKey::new(TrainId(1), 1),
                dependent: NodeKey::new(TrainId(2), 0),
                extra: None,
            })
            .expect("forward edge");

        let before = session.graph().delay_snapshot();
        let err = session
            .execute(DispatcherAction::WaitForArrival {
                reference: NodeKey::new(TrainId(2), 1),
                dependent: NodeKey::new(TrainId(1), 0),
                extra: None,
            })
            .expect_err("cycle");
        assert!(matches!(err, DispatchError::CycleRejected { .. }));
        assert_eq!(session.graph().delay_snapshot(), before);
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let mut session = DispatchSession::default();
        let err = session
            .execute(DispatcherAction::SetFixedDelay {
                node: NodeKey::new(TrainId(9), 0),
                minutes: 5,
            })
            .expect_err("no such node");
        assert!(matches!(err, DispatchError::UnknownReference(_)));
    }

    #[test]
    fn test_unscheduled_halt_sets_and_clears() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(simple_report(1, 0)));
        let train = TrainId(1);

        session.ingest(FeedEvent::UnscheduledHalt { train, minutes: 8 });
        assert_eq!(session.delay(train, 0).map(|(_, dep)| dep), Some(8));
        assert_eq!(session.delay(train, 1).map(|(arrival, _)| arrival), Some(8));

        let changes = session.ingest(FeedEvent::HaltCleared { train });
        assert_eq!(session.delay(train, 0), Some((0, 0)));
        assert!(changes.nodes.contains(&NodeKey::new(train, 0)));
    }

    #[test]
    fn test_give_up_connection_and_restore() {
        let mut session = DispatchSession::default();
        session.add_station_view("Hbf", ["1", "2"].map(String::from));
        session.ingest(FeedEvent::Report(train_report(
            1,
            0,
            vec![stop("1", Some((8, 0)), Some((8, 30)))],
        )));
        session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("2", None, Some((8, 5)))],
        )));
        let arrival = NodeKey::new(TrainId(1), 0);
        let departure = NodeKey::new(TrainId(2), 0);

        session
            .execute(DispatcherAction::GiveUpConnection { arrival, departure })
            .expect("known pair");
        let status = session
            .connection_matrix("Hbf")
            .and_then(|matrix| matrix.get(arrival, departure))
            .map(|connection| connection.status);
        assert_eq!(status, Some(crate::connection::ConnectionStatus::DispatcherBroken));

        session
            .execute(DispatcherAction::RestoreConnection { arrival, departure })
            .expect("restore");
        let err = session
            .execute(DispatcherAction::GiveUpConnection {
                arrival,
                departure: NodeKey::new(TrainId(3), 0),
            })
            .expect_err("unknown pair");
        assert!(matches!(err, DispatchError::UnknownReference(_)));
    }

    #[test]
    fn test_conflict_acknowledgement_via_actions() {
        let mut session = DispatchSession::default();
        session.ingest(FeedEvent::Report(train_report(
            1,
            0,
            vec![stop("3", Some((8, 0)), Some((8, 10)))],
        )));
        let changes = session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("3", Some((8, 5)), Some((8, 15)))],
        )));
        assert_eq!(changes.conflicts.len(), 1);
        let key = changes.conflicts[0].clone();
        assert_eq!(session.conflicts().count(), 1);

        session
            .execute(DispatcherAction::AcknowledgeConflict { key: key.clone() })
            .expect("known conflict");
        assert_eq!(session.conflicts().count(), 0, "suppressed");

        session
            .execute(DispatcherAction::ClearAcknowledgement { key: key.clone() })
            .expect("was acknowledged");
        assert_eq!(session.conflicts().count(), 1);

        let err = session
            .execute(DispatcherAction::AcknowledgeConflict {
                key: "overlap:9:8.0+9.0".into(),
            })
            .expect_err("unknown conflict");
        assert!(matches!(err, DispatchError::UnknownReference(_)));
    }

    #[test]
    fn test_empty_report_for_unknown_train_is_dropped() {
        let mut session = DispatchSession::default();
        let changes = session.ingest(FeedEvent::Report(train_report(5, 3, Vec::new())));
        assert!(changes.is_empty());
        assert!(session.train(TrainId(5)).is_none());
    }

    #[test]
    fn test_clock_only_update_refreshes_views() {
        let mut session = DispatchSession::default();
        session.add_station_view("Hbf", ["1", "2"].map(String::from));
        let mut landed = stop("1", Some((8, 0)), Some((8, 30)));
        landed.measured_arrival = Some(at(8, 0));
        session.ingest(FeedEvent::Report(train_report(1, 0, vec![landed])));
        session.ingest(FeedEvent::Report(train_report(
            2,
            0,
            vec![stop("2", None, Some((8, 5)))],
        )));

        let arrival = NodeKey::new(TrainId(1), 0);
        let departure = NodeKey::new(TrainId(2), 0);
        let before = session
            .connection_matrix("Hbf")
            .and_then(|matrix| matrix.get(arrival, departure))
            .map(|connection| connection.status);
        assert_eq!(before, Some(crate::connection::ConnectionStatus::Likely));

        let changes = session.ingest(FeedEvent::Clock(at(8, 2)));
        let after = session
            .connection_matrix("Hbf")
            .and_then(|matrix| matrix.get(arrival, departure))
            .map(|connection| connection.status);
        assert_eq!(after, Some(crate::connection::ConnectionStatus::Met));
        assert!(changes.connections.contains(&(arrival, departure)));
    }
}
