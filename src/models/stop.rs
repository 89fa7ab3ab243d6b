use super::dependency::{AutoRule, NodeOverride};
use super::train::TrainId;
use crate::constants::DispatchParams;
use crate::time::minutes_between;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags::bitflags! {
    /// Operational nature of a stop, as flagged by the feed
    ///
    /// An ordinary scheduled stop carries no flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StopFlags: u16 {
        const PASS_THROUGH     = 0b0_0000_0001;
        const ENTRY            = 0b0_0000_0010;
        const EXIT             = 0b0_0000_0100;
        const REPLACEMENT      = 0b0_0000_1000;
        const COUPLING         = 0b0_0001_0000;
        const SPLITTING        = 0b0_0010_0000;
        const DIRECTION_CHANGE = 0b0_0100_0000;
        const LOCO_CHANGE      = 0b0_1000_0000;
        const LOCO_ROTATION    = 0b1_0000_0000;
        const STAGING = Self::REPLACEMENT.bits() | Self::COUPLING.bits()
                      | Self::SPLITTING.bits();
    }
}

impl Default for StopFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl StopFlags {
    /// Whether the train actually halts at this stop
    #[must_use]
    pub const fn halts(self) -> bool {
        !self.contains(Self::PASS_THROUGH)
    }

    /// Whether this stop is a replacement, coupling or splitting point
    #[must_use]
    pub const fn is_staging_point(self) -> bool {
        self.intersects(Self::STAGING)
    }

    /// Minimum dwell in minutes these flags impose; the largest rule wins
    #[must_use]
    pub fn min_dwell(self, params: &DispatchParams) -> i64 {
        if !self.halts() {
            return 0;
        }
        let mut dwell = 0;
        if self.contains(Self::LOCO_CHANGE) {
            dwell = dwell.max(params.loco_change_dwell);
        }
        if self.contains(Self::LOCO_ROTATION) {
            dwell = dwell.max(params.loco_rotation_dwell);
        }
        if self.contains(Self::DIRECTION_CHANGE) {
            dwell = dwell.max(params.direction_change_dwell);
        }
        if self.contains(Self::REPLACEMENT) {
            dwell = dwell.max(params.replacement_dwell);
        }
        if self.contains(Self::COUPLING) {
            dwell = dwell.max(params.coupling_dwell);
        }
        if self.contains(Self::SPLITTING) {
            dwell = dwell.max(params.splitting_dwell);
        }
        dwell
    }

    /// Parse the feed's flag field, e.g. `"D"`, `"E(8012)"`, `"R W"`
    ///
    /// Staging letters name the continuing train in parentheses; that id is
    /// returned alongside the flags. Unknown letters are skipped, matching
    /// the best-effort feed contract.
    #[must_use]
    pub fn parse_feed(field: &str) -> (Self, Option<TrainId>) {
        let mut flags = Self::empty();
        let mut linked = None;
        let mut chars = field.chars().peekable();
        while let Some(c) = chars.next() {
            let flag = match c {
                'D' => Self::PASS_THROUGH,
                'E' => Self::REPLACEMENT,
                'K' => Self::COUPLING,
                'F' => Self::SPLITTING,
                'R' => Self::DIRECTION_CHANGE,
                'W' => Self::LOCO_CHANGE,
                'L' => Self::LOCO_ROTATION,
                _ => continue,
            };
            flags |= flag;
            if flag.is_staging_point() && chars.peek() == Some(&'(') {
                chars.next();
                let digits: String = chars.by_ref().take_while(|d| *d != ')').collect();
                if let Ok(id) = digits.parse::<i64>() {
                    linked = Some(TrainId(id));
                }
            }
        }
        (flags, linked)
    }
}

/// External address of a schedule node: owning train plus position in its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub train: TrainId,
    pub sequence: u32,
}

impl NodeKey {
    #[must_use]
    pub const fn new(train: TrainId, sequence: u32) -> Self {
        Self { train, sequence }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "train {} stop {}", self.train, self.sequence)
    }
}

/// One planned stop of one train, the unit the schedule graph works on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopNode {
    pub train: TrainId,
    pub sequence: u32,
    pub track: String,
    /// Absent for the train's first node
    pub planned_arrival: Option<NaiveDateTime>,
    /// Absent for the train's last node
    pub planned_departure: Option<NaiveDateTime>,
    /// Delay the feed reported for this stop, if any, in minutes
    pub reported_delay: Option<i64>,
    /// Estimated arrival delay in minutes, written by propagation
    pub arrival_delay: i64,
    /// Estimated departure delay in minutes, written by propagation
    pub departure_delay: i64,
    pub flags: StopFlags,
    /// Minimum dwell in minutes, derived from flags on classification
    pub min_dwell: i64,
    /// The arrival has been observed, freezing the arrival estimate
    pub arrived: bool,
    /// The departure has been observed, freezing the departure estimate
    pub departed: bool,
    /// Continuing train named by the feed at a staging point
    pub linked_train: Option<TrainId>,
    /// Automatic rule governing this node's own evaluation
    pub rule: AutoRule,
    /// Dispatcher override pinned to this node, if any
    pub manual: Option<NodeOverride>,
}

impl StopNode {
    #[must_use]
    pub fn new(train: TrainId, sequence: u32, track: impl Into<String>) -> Self {
        Self {
            train,
            sequence,
            track: track.into(),
            planned_arrival: None,
            planned_departure: None,
            reported_delay: None,
            arrival_delay: 0,
            departure_delay: 0,
            flags: StopFlags::empty(),
            min_dwell: 0,
            arrived: false,
            departed: false,
            linked_train: None,
            rule: AutoRule::PlanStop,
            manual: None,
        }
    }

    #[must_use]
    pub const fn key(&self) -> NodeKey {
        NodeKey::new(self.train, self.sequence)
    }

    /// Planned dwell in minutes; zero when either time is missing
    #[must_use]
    pub fn planned_dwell(&self) -> i64 {
        match (self.planned_arrival, self.planned_departure) {
            (Some(arrival), Some(departure)) => minutes_between(arrival, departure).max(0),
            _ => 0,
        }
    }

    /// Dwell slack this stop can absorb without departing late
    #[must_use]
    pub fn recoverable_slack(&self) -> i64 {
        (self.planned_dwell() - self.min_dwell).max(0)
    }

    /// Planned arrival shifted by the current estimate
    #[must_use]
    pub fn estimated_arrival(&self) -> Option<NaiveDateTime> {
        self.planned_arrival
            .map(|t| crate::time::add_minutes(t, self.arrival_delay))
    }

    /// Planned departure shifted by the current estimate
    #[must_use]
    pub fn estimated_departure(&self) -> Option<NaiveDateTime> {
        self.planned_departure
            .map(|t| crate::time::add_minutes(t, self.departure_delay))
    }
}
