use serde::{Deserialize, Serialize};
use std::fmt;

/// What a dependency edge means for the dependent node's estimate
///
/// The set is closed on purpose; propagation matches exhaustively so a new
/// kind cannot be added without handling its formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Same train, previous stop to next stop
    Path,
    /// Old number's last stop feeds the new number's first stop
    Replacement,
    /// Feeder arrival feeds the joined train's departure
    Coupling,
    /// Parent arrival feeds the continuing part's first departure
    Splitting,
    /// Hold departure until the reference arrival plus margin
    WaitArrival { extra: i64 },
    /// Hold departure until the reference departure plus margin
    WaitDeparture { extra: i64 },
}

impl DependencyKind {
    /// Wait edges are the dispatcher-authored relational kinds
    #[must_use]
    pub const fn is_wait(self) -> bool {
        matches!(self, Self::WaitArrival { .. } | Self::WaitDeparture { .. })
    }

    /// Same variant regardless of carried parameters
    #[must_use]
    pub fn same_kind(self, other: Self) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Path => "path",
            Self::Replacement => "replacement",
            Self::Coupling => "coupling",
            Self::Splitting => "splitting",
            Self::WaitArrival { .. } => "wait-arrival",
            Self::WaitDeparture { .. } => "wait-departure",
        };
        write!(f, "{name}")
    }
}

/// Who put the edge there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Automatic,          // derived by the resolver, retired on reclassification
    DispatcherOverride, // authored by an edit action, persists until cleared
}

/// Edge payload of the schedule graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub kind: DependencyKind,
    pub activation: Activation,
}

impl DependencyEdge {
    #[must_use]
    pub const fn automatic(kind: DependencyKind) -> Self {
        Self {
            kind,
            activation: Activation::Automatic,
        }
    }

    #[must_use]
    pub const fn manual(kind: DependencyKind) -> Self {
        Self {
            kind,
            activation: Activation::DispatcherOverride,
        }
    }
}

/// Automatic rule governing a node's own evaluation
///
/// Relational effects travel on edges; these are the node-local cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoRule {
    /// Mirror the feed's entry estimate until the train is in the area
    Entry,
    /// Inherit along the path, absorbing delay up to the recoverable slack
    PlanStop,
    /// Departure pinned to a measured unscheduled halt
    SignalHalt { minutes: i64 },
}

/// Dispatcher override scoped to a single node, no reference involved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOverride {
    /// Departure delay pinned to this value, automatic inputs ignored
    FixedDelay(i64),
    /// Inherited waits are dropped; only the node's own report counts
    DoNotWait,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_kind_ignores_parameters() {
        let a = DependencyKind::WaitArrival { extra: 0 };
        let b = DependencyKind::WaitArrival { extra: 5 };
        assert!(a.same_kind(b));
        assert!(!a.same_kind(DependencyKind::WaitDeparture { extra: 0 }));
    }

    #[test]
    fn test_wait_kinds_are_manual() {
        assert!(DependencyKind::WaitDeparture { extra: 2 }.is_wait());
        assert!(!DependencyKind::Coupling.is_wait());
        assert!(!DependencyKind::Path.is_wait());
    }
}
