#![allow(clippy::implicit_hasher)]
#![allow(unknown_lints)]
#![allow(clippy::manual_is_multiple_of)]

pub mod connection;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod models;
pub mod occupancy;
pub mod registry;
pub mod session;
pub mod time;

pub use connection::{Connection, ConnectionKey, ConnectionMatrix, ConnectionStatus};
pub use constants::DispatchParams;
pub use dispatch::DispatcherAction;
pub use error::{DispatchError, Reference};
pub use graph::ScheduleGraph;
pub use models::{FeedEvent, NodeKey, StopReport, TrainId, TrainReport};
pub use occupancy::{ConflictKind, OccupancyConflict, TrackOccupancy};
pub use session::{ChangeSet, DispatchSession};
