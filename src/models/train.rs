use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Feed-assigned numeric train identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrainId(pub i64);

impl fmt::Display for TrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a train relative to the controlled area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainStatus {
    Pending,  // announced, not yet inside the controlled area
    Active,   // currently tracked inside the area
    Departed, // left the area, retained until eviction
}

/// How two trains are chained across a renumbering or staging operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainRole {
    Replacement, // the same cars continue under a new number
    Coupling,    // two trains join and continue as one
    Splitting,   // one train divides into two
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainRole::Replacement => "replacement",
            ChainRole::Coupling => "coupling",
            ChainRole::Splitting => "splitting",
        };
        write!(f, "{name}")
    }
}

/// One directed chain link to a predecessor or successor train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub other: TrainId,
    pub role: ChainRole,
}

/// One train as tracked by the registry
///
/// Created on first sighting in the feed, updated on every report, and
/// retained after departure until the retention window expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Train {
    pub id: TrainId,
    pub name: String,
    pub category: String,
    pub status: TrainStatus,
    /// Trains this one continues from (two only when formed by coupling)
    pub predecessors: Vec<ChainLink>,
    /// Trains continuing from this one (two only when it splits)
    pub successors: Vec<ChainLink>,
    /// Latest feed-reported delay estimate in minutes
    pub reported_delay: i64,
    pub current_track: Option<String>,
    /// Set when the train leaves the area; drives retention eviction
    pub departed_at: Option<NaiveDateTime>,
}

impl Train {
    #[must_use]
    pub fn new(id: TrainId, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            category: category.into(),
            status: TrainStatus::Pending,
            predecessors: Vec::new(),
            successors: Vec::new(),
            reported_delay: 0,
            current_track: None,
            departed_at: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == TrainStatus::Active
    }

    #[must_use]
    pub fn has_departed(&self) -> bool {
        self.status == TrainStatus::Departed
    }

    /// The successor link of the given role, if present
    #[must_use]
    pub fn successor(&self, role: ChainRole) -> Option<TrainId> {
        self.successors
            .iter()
            .find(|link| link.role == role)
            .map(|link| link.other)
    }
}
