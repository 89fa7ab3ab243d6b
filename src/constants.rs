use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Base date used for all schedule times
pub const BASE_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2024, 1, 1) {
    Some(date) => date,
    None => panic!("Invalid base date"),
};

/// Base midnight datetime (`BASE_DATE` at 00:00:00)
pub const BASE_MIDNIGHT: NaiveDateTime = match BASE_DATE.and_hms_opt(0, 0, 0) {
    Some(dt) => dt,
    None => panic!("Invalid base midnight"),
};

// Minimum dwell imposed by stop flags, in minutes

/// Minimum dwell when the locomotive is exchanged
pub const LOCO_CHANGE_DWELL: i64 = 5;

/// Minimum dwell when the locomotive runs around the train
pub const LOCO_ROTATION_DWELL: i64 = 2;

/// Minimum dwell when the train reverses direction
pub const DIRECTION_CHANGE_DWELL: i64 = 3;

/// Minimum processing time at a replacement (renumbering) stop
pub const REPLACEMENT_DWELL: i64 = 1;

/// Minimum processing time at a coupling stop
pub const COUPLING_DWELL: i64 = 1;

/// Minimum processing time at a splitting stop
pub const SPLITTING_DWELL: i64 = 1;

// Dependency and view timing, in minutes

/// Extra margin added when a train waits for another train's arrival
pub const WAIT_ARRIVAL_EXTRA: i64 = 0;

/// Extra margin added when a train waits for another train's departure
pub const WAIT_DEPARTURE_EXTRA: i64 = 2;

/// Shunting time added on top of the later arrival when trains couple
pub const COUPLING_OVERHEAD: i64 = 2;

/// Shortest transfer a passenger can be expected to make
pub const MIN_TRANSFER: i64 = 2;

/// Longest planned gap still treated as a connection
pub const MAX_CONNECTION: i64 = 15;

/// How long departed trains stay resolvable before eviction
pub const RETENTION_MINUTES: i64 = 60;

/// Shortest occupancy interval recorded for any stop
pub const MIN_SLOT_MINUTES: i64 = 1;

/// Tunable timing parameters for one dispatch session
///
/// Defaults mirror the operational constants above; hosts override
/// individual fields to match local working rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchParams {
    pub loco_change_dwell: i64,
    pub loco_rotation_dwell: i64,
    pub direction_change_dwell: i64,
    pub replacement_dwell: i64,
    pub coupling_dwell: i64,
    pub splitting_dwell: i64,
    pub wait_arrival_extra: i64,
    pub wait_departure_extra: i64,
    pub coupling_overhead: i64,
    pub min_transfer: i64,
    pub max_connection: i64,
    pub retention_minutes: i64,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            loco_change_dwell: LOCO_CHANGE_DWELL,
            loco_rotation_dwell: LOCO_ROTATION_DWELL,
            direction_change_dwell: DIRECTION_CHANGE_DWELL,
            replacement_dwell: REPLACEMENT_DWELL,
            coupling_dwell: COUPLING_DWELL,
            splitting_dwell: SPLITTING_DWELL,
            wait_arrival_extra: WAIT_ARRIVAL_EXTRA,
            wait_departure_extra: WAIT_DEPARTURE_EXTRA,
            coupling_overhead: COUPLING_OVERHEAD,
            min_transfer: MIN_TRANSFER,
            max_connection: MAX_CONNECTION,
            retention_minutes: RETENTION_MINUTES,
        }
    }
}
