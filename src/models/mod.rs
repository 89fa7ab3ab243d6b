mod dependency;
mod report;
mod stop;
mod train;

pub use dependency::{Activation, AutoRule, DependencyEdge, DependencyKind, NodeOverride};
pub use report::{FeedEvent, StopReport, TrainReport};
pub use stop::{NodeKey, StopFlags, StopNode};
pub use train::{ChainLink, ChainRole, Train, TrainId, TrainStatus};
