use crate::error::{DispatchError, Reference};
use crate::models::{ChainLink, ChainRole, Train, TrainId, TrainReport, TrainStatus};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Identity and lifecycle store for every train the feed has mentioned
///
/// Trains are never deleted on departure; they stay resolvable for the
/// retention window so late chain links and references still work, then
/// get evicted by the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainRegistry {
    trains: IndexMap<TrainId, Train>,
}

impl TrainRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a train from a feed report; returns true when the
    /// train was not known before
    ///
    /// Lifecycle only moves forward; a stale report cannot reactivate a
    /// departed train. `now` stamps the departure for retention.
    pub fn upsert(&mut self, report: &TrainReport, now: NaiveDateTime) -> bool {
        let is_new = !self.trains.contains_key(&report.id);
        let train = self
            .trains
            .entry(report.id)
            .or_insert_with(|| Train::new(report.id, report.name.clone(), report.category.clone()));

        train.name.clone_from(&report.name);
        train.category.clone_from(&report.category);
        train.reported_delay = report.delay;
        train.current_track.clone_from(&report.current_track);

        if status_rank(report.status) > status_rank(train.status) {
            train.status = report.status;
            if report.status == TrainStatus::Departed {
                train.departed_at = Some(now);
            }
        }
        is_new
    }

    #[must_use]
    pub fn get(&self, id: TrainId) -> Option<&Train> {
        self.trains.get(&id)
    }

    pub fn get_mut(&mut self, id: TrainId) -> Option<&mut Train> {
        self.trains.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: TrainId) -> bool {
        self.trains.contains_key(&id)
    }

    /// Trains in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = &Train> {
        self.trains.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trains.is_empty()
    }

    /// Establish a chain link: `train` continues as `other` under `role`
    ///
    /// Both directions are linked atomically. Re-asserting an existing link
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// `UnknownReference` if either train is not registered.
    /// `ChainConflict` if the link would exceed the role's cardinality
    /// (one successor unless splitting, one predecessor unless coupling) or
    /// the slot is taken by a different partner.
    pub fn chain(
        &mut self,
        train: TrainId,
        role: ChainRole,
        other: TrainId,
    ) -> Result<(), DispatchError> {
        if !self.trains.contains_key(&train) {
            return Err(DispatchError::UnknownReference(Reference::Train(train)));
        }
        if !self.trains.contains_key(&other) {
            return Err(DispatchError::UnknownReference(Reference::Train(other)));
        }

        let source = &self.trains[&train];
        let target = &self.trains[&other];
        let down = check_slot(&source.successors, role, other, ChainRole::Splitting)
            .map_err(|existing| DispatchError::ChainConflict {
                train,
                existing,
                role,
            })?;
        let up = check_slot(&target.predecessors, role, train, ChainRole::Coupling)
            .map_err(|existing| DispatchError::ChainConflict {
                train: other,
                existing,
                role,
            })?;

        if !down {
            if let Some(source) = self.trains.get_mut(&train) {
                source.successors.push(ChainLink { other, role });
            }
        }
        if !up {
            if let Some(target) = self.trains.get_mut(&other) {
                target.predecessors.push(ChainLink { other: train, role });
            }
        }
        Ok(())
    }

    /// Every train transitively connected to `id` through chain links
    ///
    /// The family always contains `id` itself. Used to treat renumbered,
    /// coupled and split trains as one physical unit in the derived views.
    #[must_use]
    pub fn chain_family(&self, id: TrainId) -> HashSet<TrainId> {
        let mut family = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !family.insert(current) {
                continue;
            }
            let Some(train) = self.trains.get(&current) else {
                continue;
            };
            for link in train.predecessors.iter().chain(&train.successors) {
                if !family.contains(&link.other) {
                    queue.push_back(link.other);
                }
            }
        }
        family
    }

    /// Trains whose departure lies further back than the retention window
    #[must_use]
    pub fn expired(&self, now: NaiveDateTime, retention_minutes: i64) -> Vec<TrainId> {
        self.trains
            .values()
            .filter(|train| {
                train
                    .departed_at
                    .is_some_and(|at| crate::time::minutes_between(at, now) > retention_minutes)
            })
            .map(|train| train.id)
            .collect()
    }

    /// Drop a train and detach it from every partner's chain links
    pub fn remove(&mut self, id: TrainId) -> Option<Train> {
        let train = self.trains.shift_remove(&id)?;
        for other in self.trains.values_mut() {
            other.predecessors.retain(|link| link.other != id);
            other.successors.retain(|link| link.other != id);
        }
        Some(train)
    }
}

/// Lifecycle order; reports can only move a train forward
const fn status_rank(status: TrainStatus) -> u8 {
    match status {
        TrainStatus::Pending => 0,
        TrainStatus::Active => 1,
        TrainStatus::Departed => 2,
    }
}

/// Whether `links` can take the link (`role`, `other`)
///
/// Returns true when the identical link already exists, false when a slot
/// is free, and the occupying partner when the link must be refused. Two
/// links are only allowed for `expands` (splitting successors, coupling
/// predecessors); mixed roles never share a direction.
fn check_slot(
    links: &[ChainLink],
    role: ChainRole,
    other: TrainId,
    expands: ChainRole,
) -> Result<bool, TrainId> {
    if links.iter().any(|l| l.role == role && l.other == other) {
        return Ok(true);
    }
    if let Some(mixed) = links.iter().find(|l| l.role != role) {
        return Err(mixed.other);
    }
    let capacity = if role == expands { 2 } else { 1 };
    if links.len() >= capacity {
        return Err(links[0].other);
    }
    Ok(false)
}
