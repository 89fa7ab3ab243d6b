//! Connection matrix: transfer feasibility between arriving and departing
//! trains of one station group.

use crate::constants::DispatchParams;
use crate::graph::ScheduleGraph;
use crate::models::{ChainRole, NodeKey, NodeOverride, StopNode};
use crate::registry::TrainRegistry;
use crate::time::minutes_between;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// (arrival node, departure node) identifying one transfer pair
pub type ConnectionKey = (NodeKey, NodeKey);

/// Transfer feasibility, ordered by the precedence the refresh applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Both stops belong to the same chain family
    SameTrain,
    /// The pair is a planned coupling, not a passenger transfer
    CouplingPending,
    /// The transfer already worked out
    Met,
    /// A dispatcher wait edge holds the departure
    DispatcherWaiting,
    /// Given up by the dispatcher or severed by do-not-wait
    DispatcherBroken,
    /// The effective transfer undercuts the minimum
    Broken,
    /// Expected to work out as estimated
    Likely,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::SameTrain => "same train",
            ConnectionStatus::CouplingPending => "coupling",
            ConnectionStatus::Met => "met",
            ConnectionStatus::DispatcherWaiting => "waiting",
            ConnectionStatus::DispatcherBroken => "given up",
            ConnectionStatus::Broken => "broken",
            ConnectionStatus::Likely => "likely",
        };
        write!(f, "{label}")
    }
}

/// One transfer pair as last refreshed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub arrival: NodeKey,
    pub departure: NodeKey,
    pub arrival_track: String,
    pub departure_track: String,
    /// Planned minutes between arrival and departure
    pub planned_gap: i64,
    /// Planned gap corrected by the current delay estimates
    pub effective_transfer: i64,
    pub status: ConnectionStatus,
}

/// All transfer pairs of one configured station group
///
/// The matrix owns no schedule state; `refresh` rebuilds the pair list
/// from the graph and keeps only the dispatcher's given-up marks across
/// updates. Pairs form between different trains whose stops lie on the
/// group's tracks with a planned gap inside `[0, max_connection]`; a gap
/// below the minimum transfer still shows up, as broken, so the
/// dispatcher sees the impossible connection rather than nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMatrix {
    pub station: String,
    tracks: BTreeSet<String>,
    given_up: HashSet<ConnectionKey>,
    #[serde(with = "indexmap::map::serde_seq")]
    connections: IndexMap<ConnectionKey, Connection>,
}

impl ConnectionMatrix {
    #[must_use]
    pub fn new(station: impl Into<String>, tracks: impl IntoIterator<Item = String>) -> Self {
        Self {
            station: station.into(),
            tracks: tracks.into_iter().collect(),
            given_up: HashSet::new(),
            connections: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn covers_track(&self, track: &str) -> bool {
        self.tracks.contains(track)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    #[must_use]
    pub fn get(&self, arrival: NodeKey, departure: NodeKey) -> Option<&Connection> {
        self.connections.get(&(arrival, departure))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Mark a pair as given up; returns false for a pair not in the matrix
    pub fn give_up(&mut self, arrival: NodeKey, departure: NodeKey) -> bool {
        if self.connections.contains_key(&(arrival, departure)) {
            self.given_up.insert((arrival, departure));
            true
        } else {
            false
        }
    }

    /// Withdraw a give-up mark; returns false if none was set
    pub fn restore(&mut self, arrival: NodeKey, departure: NodeKey) -> bool {
        self.given_up.remove(&(arrival, departure))
    }

    /// Rebuild the pair list from the current graph state
    ///
    /// Returns the keys whose entry changed, appeared or vanished since
    /// the previous refresh.
    pub fn refresh(
        &mut self,
        graph: &ScheduleGraph,
        registry: &TrainRegistry,
        params: &DispatchParams,
        now: NaiveDateTime,
    ) -> Vec<ConnectionKey> {
        self.given_up
            .retain(|(a, d)| graph.index_of(*a).is_some() && graph.index_of(*d).is_some());

        let mut arrivals: Vec<StopNode> = Vec::new();
        let mut departures: Vec<StopNode> = Vec::new();
        for stop in graph.graph.node_weights() {
            if !stop.flags.halts() || !self.tracks.contains(&stop.track) {
                continue;
            }
            if stop.planned_arrival.is_some() {
                arrivals.push(stop.clone());
            }
            if stop.planned_departure.is_some() {
                departures.push(stop.clone());
            }
        }
        arrivals.sort_unstable_by_key(|stop| (stop.planned_arrival, stop.key()));
        departures.sort_unstable_by_key(|stop| (stop.planned_departure, stop.key()));

        let mut next: IndexMap<ConnectionKey, Connection> = IndexMap::new();
        for arrival in &arrivals {
            for departure in &departures {
                if arrival.train == departure.train {
                    continue;
                }
                let (Some(planned_in), Some(planned_out)) =
                    (arrival.planned_arrival, departure.planned_departure)
                else {
                    continue;
                };
                let planned_gap = minutes_between(planned_in, planned_out);
                if planned_gap < 0 || planned_gap > params.max_connection {
                    continue;
                }
                let key = (arrival.key(), departure.key());
                let effective_transfer =
                    planned_gap + departure.departure_delay - arrival.arrival_delay;
                let status = self.status_of(graph, registry, params, now, arrival, departure);
                next.insert(
                    key,
                    Connection {
                        arrival: arrival.key(),
                        departure: departure.key(),
                        arrival_track: arrival.track.clone(),
                        departure_track: departure.track.clone(),
                        planned_gap,
                        effective_transfer,
                        status,
                    },
                );
            }
        }

        let mut changed: Vec<ConnectionKey> = Vec::new();
        for (key, connection) in &next {
            if self.connections.get(key) != Some(connection) {
                changed.push(*key);
            }
        }
        for key in self.connections.keys() {
            if !next.contains_key(key) {
                changed.push(*key);
            }
        }
        self.connections = next;
        changed
    }

    /// The status ladder, first match wins
    fn status_of(
        &self,
        graph: &ScheduleGraph,
        registry: &TrainRegistry,
        params: &DispatchParams,
        now: NaiveDateTime,
        arrival: &StopNode,
        departure: &StopNode,
    ) -> ConnectionStatus {
        if registry.chain_family(arrival.train).contains(&departure.train) {
            let coupled = registry
                .get(arrival.train)
                .and_then(|train| train.successor(ChainRole::Coupling))
                == Some(departure.train);
            return if coupled {
                ConnectionStatus::CouplingPending
            } else {
                ConnectionStatus::SameTrain
            };
        }

        let transfer_elapsed = arrival.arrived
            && arrival
                .estimated_arrival()
                .is_some_and(|at| minutes_between(at, now) >= params.min_transfer);
        if departure.departed || transfer_elapsed {
            return ConnectionStatus::Met;
        }

        if let (Some(source), Some(target)) =
            (graph.index_of(arrival.key()), graph.index_of(departure.key()))
        {
            let waiting = graph
                .edges_into(target)
                .iter()
                .any(|(from, edge)| *from == source && edge.kind.is_wait());
            if waiting {
                return ConnectionStatus::DispatcherWaiting;
            }
        }
        if departure.manual == Some(NodeOverride::DoNotWait)
            || self.given_up.contains(&(arrival.key(), departure.key()))
        {
            return ConnectionStatus::DispatcherBroken;
        }

        let planned_gap = match (arrival.planned_arrival, departure.planned_departure) {
            (Some(planned_in), Some(planned_out)) => minutes_between(planned_in, planned_out),
            _ => return ConnectionStatus::Broken,
        };
        if planned_gap < params.min_transfer {
            return ConnectionStatus::Broken;
        }
        let effective = planned_gap + departure.departure_delay - arrival.arrival_delay;
        if effective < params.min_transfer {
            ConnectionStatus::Broken
        } else {
            ConnectionStatus::Likely
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BASE_DATE;
    use crate::models::{
        DependencyEdge, DependencyKind, StopReport, TrainId, TrainReport,
    };

    fn at(h: u32, m: u32) -> NaiveDateTime {
        BASE_DATE.and_hms_opt(h, m, 0).expect("valid time")
    }

    fn report(track: &str, arrival: Option<(u32, u32)>, departure: Option<(u32, u32)>) -> StopReport {
        let mut report = StopReport::new(track);
        report.planned_arrival = arrival.map(|(h, m)| at(h, m));
        report.planned_departure = departure.map(|(h, m)| at(h, m));
        report
    }

    struct Fixture {
        graph: ScheduleGraph,
        registry: TrainRegistry,
        params: DispatchParams,
        matrix: ConnectionMatrix,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: ScheduleGraph::new(),
                registry: TrainRegistry::new(),
                params: DispatchParams::default(),
                matrix: ConnectionMatrix::new(
                    "Hbf",
                    ["1", "2", "3"].map(String::from),
                ),
            }
        }

        fn register(&mut self, id: i64) -> TrainId {
            let report = TrainReport::new(TrainId(id), format!("RE {id}"), "RE");
            self.registry.upsert(&report, at(7, 0));
            TrainId(id)
        }

        /// Arriving train: stops at the station, later leaves the area
        fn arriving(&mut self, id: i64, track: &str, minute: u32) -> TrainId {
            let train = self.register(id);
            self.graph
                .upsert_stop(train, 0, &report(track, Some((8, minute)), Some((8, minute + 30))));
            train
        }

        /// Departing train: begins at the station
        fn departing(&mut self, id: i64, track: &str, minute: u32) -> TrainId {
            let train = self.register(id);
            self.graph
                .upsert_stop(train, 0, &report(track, None, Some((8, minute))));
            train
        }

        fn refresh(&mut self, now: NaiveDateTime) -> Vec<ConnectionKey> {
            self.matrix
                .refresh(&self.graph, &self.registry, &self.params, now)
        }

        fn status(&self, a: TrainId, d: TrainId) -> ConnectionStatus {
            self.matrix
                .get(NodeKey::new(a, 0), NodeKey::new(d, 0))
                .expect("pair exists")
                .status
        }
    }

    #[test]
    fn test_window_boundary() {
        let mut fx = Fixture::new();
        fx.params.min_transfer = 3;
        fx.params.max_connection = 20;
        let a = fx.arriving(1, "1", 0);
        let on_boundary = fx.departing(2, "2", 3);
        let below = fx.departing(3, "2", 2);
        fx.refresh(at(7, 30));

        assert_eq!(fx.status(a, on_boundary), ConnectionStatus::Likely);
        assert_eq!(fx.status(a, below), ConnectionStatus::Broken);

        // a late departure cannot rescue a plan below the minimum
        let index = fx.graph.index_of(NodeKey::new(below, 0)).expect("node");
        fx.graph.stop_mut(index).expect("node").departure_delay = 10;
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, below), ConnectionStatus::Broken);
    }

    #[test]
    fn test_delay_breaks_connection() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 5);
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, d), ConnectionStatus::Likely);

        let index = fx.graph.index_of(NodeKey::new(a, 0)).expect("node");
        fx.graph.stop_mut(index).expect("node").arrival_delay = 4;
        fx.refresh(at(7, 30));
        // 5 + 0 - 4 = 1 < min transfer 2
        assert_eq!(fx.status(a, d), ConnectionStatus::Broken);
    }

    #[test]
    fn test_pair_window_excludes_far_departures() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let late = fx.departing(2, "2", 40);
        let before = fx.departing(3, "2", 59);
        fx.graph.upsert_stop(before, 0, &report("2", None, Some((7, 59))));
        fx.refresh(at(7, 30));

        assert!(fx.matrix.get(NodeKey::new(a, 0), NodeKey::new(late, 0)).is_none());
        assert!(fx.matrix.get(NodeKey::new(a, 0), NodeKey::new(before, 0)).is_none());
    }

    #[test]
    fn test_met_once_departure_happened() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 5);
        let mut done = report("2", None, Some((8, 5)));
        done.measured_departure = Some(at(8, 6));
        fx.graph.upsert_stop(d, 0, &done);
        fx.refresh(at(8, 6));
        assert_eq!(fx.status(a, d), ConnectionStatus::Met);
    }

    #[test]
    fn test_met_after_transfer_time_elapsed() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 5);
        let mut landed = report("1", Some((8, 0)), Some((8, 30)));
        landed.measured_arrival = Some(at(8, 0));
        fx.graph.upsert_stop(a, 0, &landed);

        fx.refresh(at(8, 1));
        assert_eq!(fx.status(a, d), ConnectionStatus::Likely, "transfer still running");
        fx.refresh(at(8, 2));
        assert_eq!(fx.status(a, d), ConnectionStatus::Met);
    }

    #[test]
    fn test_wait_edge_shows_as_waiting() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 4);
        fx.graph
            .link(
                NodeKey::new(a, 0),
                NodeKey::new(d, 0),
                DependencyEdge::manual(DependencyKind::WaitArrival { extra: 0 }),
            )
            .expect("wait edge");
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, d), ConnectionStatus::DispatcherWaiting);
    }

    #[test]
    fn test_give_up_and_restore() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 5);
        fx.refresh(at(7, 30));

        assert!(fx.matrix.give_up(NodeKey::new(a, 0), NodeKey::new(d, 0)));
        let changed = fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, d), ConnectionStatus::DispatcherBroken);
        assert_eq!(changed, vec![(NodeKey::new(a, 0), NodeKey::new(d, 0))]);

        assert!(fx.matrix.restore(NodeKey::new(a, 0), NodeKey::new(d, 0)));
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, d), ConnectionStatus::Likely);
    }

    #[test]
    fn test_give_up_unknown_pair_is_rejected() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        fx.refresh(at(7, 30));
        assert!(!fx.matrix.give_up(NodeKey::new(a, 0), NodeKey::new(TrainId(9), 0)));
    }

    #[test]
    fn test_do_not_wait_breaks_pair() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 5);
        let index = fx.graph.index_of(NodeKey::new(d, 0)).expect("node");
        fx.graph.stop_mut(index).expect("node").manual = Some(NodeOverride::DoNotWait);
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, d), ConnectionStatus::DispatcherBroken);
    }

    #[test]
    fn test_chain_family_is_not_a_transfer() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "1", 10);
        fx.registry
            .chain(a, ChainRole::Replacement, d)
            .expect("chain");
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(a, d), ConnectionStatus::SameTrain);
    }

    #[test]
    fn test_coupling_pair_reported_as_coupling() {
        let mut fx = Fixture::new();
        let feeder = fx.arriving(1, "1", 0);
        let trunk = fx.departing(2, "1", 8);
        fx.registry
            .chain(feeder, ChainRole::Coupling, trunk)
            .expect("chain");
        fx.refresh(at(7, 30));
        assert_eq!(fx.status(feeder, trunk), ConnectionStatus::CouplingPending);
    }

    #[test]
    fn test_pass_through_is_not_paired() {
        let mut fx = Fixture::new();
        let a = fx.register(1);
        fx.graph
            .upsert_stop(a, 0, &report("1", Some((8, 0)), Some((8, 0))).with_flags("D"));
        let d = fx.departing(2, "2", 5);
        fx.refresh(at(7, 30));
        assert!(fx.matrix.get(NodeKey::new(a, 0), NodeKey::new(d, 0)).is_none());
        assert!(fx.matrix.is_empty());
    }

    #[test]
    fn test_refresh_reports_only_real_changes() {
        let mut fx = Fixture::new();
        let a = fx.arriving(1, "1", 0);
        let d = fx.departing(2, "2", 5);
        let first = fx.refresh(at(7, 30));
        assert_eq!(first.len(), 1);
        let second = fx.refresh(at(7, 30));
        assert!(second.is_empty(), "unchanged matrix reports nothing");

        fx.graph.remove_train(d);
        let third = fx.refresh(at(7, 30));
        assert_eq!(third, vec![(NodeKey::new(a, 0), NodeKey::new(d, 0))]);
        assert!(fx.matrix.is_empty());
    }
}
