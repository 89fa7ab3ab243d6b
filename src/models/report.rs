use super::stop::StopFlags;
use super::train::{TrainId, TrainStatus};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One stop in a train's reported plan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopReport {
    pub track: String,
    pub planned_arrival: Option<NaiveDateTime>,
    pub planned_departure: Option<NaiveDateTime>,
    pub measured_arrival: Option<NaiveDateTime>,
    pub measured_departure: Option<NaiveDateTime>,
    pub flags: StopFlags,
    /// Continuing train named by a staging flag
    pub linked_train: Option<TrainId>,
}

impl StopReport {
    #[must_use]
    pub fn new(track: impl Into<String>) -> Self {
        Self {
            track: track.into(),
            ..Self::default()
        }
    }

    /// Apply a raw feed flag field, e.g. `"E(8012)"`, to this stop
    #[must_use]
    pub fn with_flags(mut self, field: &str) -> Self {
        let (flags, linked) = StopFlags::parse_feed(field);
        self.flags = flags;
        self.linked_train = linked;
        self
    }
}

/// Full state of one train as delivered by the feed
///
/// Later reports for a known train update it in place; partial plans are
/// accepted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub id: TrainId,
    pub name: String,
    pub category: String,
    pub status: TrainStatus,
    /// Current delay estimate in minutes, the entry estimate while pending
    pub delay: i64,
    pub current_track: Option<String>,
    pub stops: Vec<StopReport>,
}

impl TrainReport {
    #[must_use]
    pub fn new(id: TrainId, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            category: category.into(),
            status: TrainStatus::Pending,
            delay: 0,
            current_track: None,
            stops: Vec::new(),
        }
    }
}

/// One item of the inbound mutation stream
///
/// Feed items are best-effort: a malformed item is dropped with a logged
/// diagnostic and never aborts the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FeedEvent {
    /// Plan/position update for one train
    Report(TrainReport),
    /// Train held at a signal outside its plan, duration in minutes
    UnscheduledHalt { train: TrainId, minutes: i64 },
    /// The unscheduled halt resolved
    HaltCleared { train: TrainId },
    /// Feed clock tick
    Clock(NaiveDateTime),
}
