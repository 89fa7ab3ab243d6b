//! Dispatcher edit actions.

use crate::models::NodeKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One strict edit from the dispatcher
///
/// Unlike feed events these are validated: the session either applies the
/// whole action and reports what changed, or rejects it typed with no
/// partial effect. `extra` margins default to the session parameters when
/// not given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatcherAction {
    /// Hold `dependent` until `reference` has arrived, plus a margin
    WaitForArrival {
        reference: NodeKey,
        dependent: NodeKey,
        extra: Option<i64>,
    },
    /// Hold `dependent` until `reference` has departed, plus a margin
    WaitForDeparture {
        reference: NodeKey,
        dependent: NodeKey,
        extra: Option<i64>,
    },
    /// Pin the node's departure delay to an absolute value
    SetFixedDelay { node: NodeKey, minutes: i64 },
    /// Pin the node's departure delay relative to its current estimate
    AdjustDelay { node: NodeKey, delta: i64 },
    /// Let the node depart on its own report, ignoring inherited delay
    DoNotWait { node: NodeKey },
    /// Drop the node's override and every manual wait edge into it
    ClearOverrides { node: NodeKey },
    /// Mark a connection pair as given up
    GiveUpConnection { arrival: NodeKey, departure: NodeKey },
    /// Withdraw a give-up mark
    RestoreConnection { arrival: NodeKey, departure: NodeKey },
    /// Suppress a conflict at its current window
    AcknowledgeConflict { key: String },
    /// Withdraw an acknowledgement
    ClearAcknowledgement { key: String },
}

impl fmt::Display for DispatcherAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherAction::WaitForArrival { reference, dependent, .. } => {
                write!(f, "wait for arrival of {reference} at {dependent}")
            }
            DispatcherAction::WaitForDeparture { reference, dependent, .. } => {
                write!(f, "wait for departure of {reference} at {dependent}")
            }
            DispatcherAction::SetFixedDelay { node, minutes } => {
                write!(f, "fix delay of {node} at {minutes}")
            }
            DispatcherAction::AdjustDelay { node, delta } => {
                write!(f, "adjust delay of {node} by {delta}")
            }
            DispatcherAction::DoNotWait { node } => write!(f, "do not wait at {node}"),
            DispatcherAction::ClearOverrides { node } => write!(f, "clear overrides of {node}"),
            DispatcherAction::GiveUpConnection { arrival, departure } => {
                write!(f, "give up connection {arrival} -> {departure}")
            }
            DispatcherAction::RestoreConnection { arrival, departure } => {
                write!(f, "restore connection {arrival} -> {departure}")
            }
            DispatcherAction::AcknowledgeConflict { key } => {
                write!(f, "acknowledge conflict {key}")
            }
            DispatcherAction::ClearAcknowledgement { key } => {
                write!(f, "clear acknowledgement of {key}")
            }
        }
    }
}
