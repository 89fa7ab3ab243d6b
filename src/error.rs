use crate::models::{ChainRole, NodeKey, TrainId};
use std::fmt;
use thiserror::Error;

/// What an edit action pointed at when the target could not be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Train(TrainId),
    Stop(NodeKey),
    Connection(NodeKey, NodeKey),
    Conflict(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Train(id) => write!(f, "train {id}"),
            Reference::Stop(key) => write!(f, "{key}"),
            Reference::Connection(arrival, departure) => {
                write!(f, "connection {arrival} -> {departure}")
            }
            Reference::Conflict(key) => write!(f, "conflict {key}"),
        }
    }
}

/// Typed rejection reasons for strict mutations
///
/// Feed ingestion never returns these; malformed feed items are dropped
/// with a logged diagnostic instead. Derived-view findings (track overlap,
/// staging order, ambiguous coupling order) are conflict state, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The requested chain link violates role cardinality
    #[error("train {train} already chained to {existing} as {role}")]
    ChainConflict {
        train: TrainId,
        existing: TrainId,
        role: ChainRole,
    },
    /// The requested edge would make the dependency relation cyclic
    #[error("dependency {reference} -> {dependent} would close a cycle")]
    CycleRejected {
        reference: NodeKey,
        dependent: NodeKey,
    },
    /// The action names a train, stop, connection or conflict no longer
    /// present
    #[error("unknown reference: {0}")]
    UnknownReference(Reference),
}
