use crate::arena::{Arena, Index};
use crate::condition::ConditionSet;

use super::event_file::{EventFile, TableManagerIdx};
use super::manager::TableManager;

pub type EventFileIdx = Index<EventFile>;

/// Opaque handle returned by [`EventRecorder::open_event_file`]. Detectors
/// hold one of these per feature list they score or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(EventFileIdx);

/// Owns every table manager and event-file binding in the engine, per
/// spec.md §4.2. The C source threads these as two singly-linked lists;
/// here both live in their own [`Arena`] so a detector's [`EventHandle`]
/// stays valid across `prune_unused`.
#[derive(Default)]
pub struct EventRecorder {
    managers: Arena<TableManager>,
    files: Arena<EventFile>,
    now: u64,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_compatible_manager(
        &self,
        feats: &[u8],
        feat_names: &[String],
        conditions: ConditionSet,
        scale_freq: u64,
        scale_factor: f64,
        prune_threshold: f64,
    ) -> Option<TableManagerIdx> {
        self.managers
            .iter()
            .find(|(_, m)| m.is_compatible(feats, feat_names, conditions, scale_freq, scale_factor, prune_threshold))
            .map(|(idx, _)| idx)
    }

    fn find_event_file(&self, manager: TableManagerIdx, feat_depth: usize, calc_feats: Option<&[u8]>) -> Option<EventFileIdx> {
        self.files
            .iter()
            .find(|(_, f)| f.matches(manager, feat_depth, calc_feats))
            .map(|(idx, _)| idx)
    }

    /// spec.md §4.2 `open_event_file`. `feats`/`feat_names` describe the
    /// leading features this caller records/scores on; `calc_feats` are
    /// extra features appended purely for recording (e.g. `dead-dest`'s
    /// destination IP).
    #[allow(clippy::too_many_arguments)]
    pub fn open_event_file(
        &mut self,
        feats: &[u8],
        feat_names: &[String],
        conditions: ConditionSet,
        scale_freq: u64,
        scale_factor: f64,
        prune_threshold: f64,
        fresh_only: bool,
        calc_feats: Option<Vec<u8>>,
    ) -> EventHandle {
        // The manager's own feature list carries calc_feats on its tail, so
        // the generic `record` pass below stores them too; scoring still
        // only ever sees the first `feat_depth` of them.
        let storage_feats: Vec<u8> = match &calc_feats {
            Some(extra) => feats.iter().chain(extra.iter()).copied().collect(),
            None => feats.to_vec(),
        };
        let storage_names: Vec<String> = match &calc_feats {
            Some(extra) => feat_names
                .iter()
                .cloned()
                .chain(extra.iter().map(|&f| crate::packet::Feature::name_for_id(f).to_string()))
                .collect(),
            None => feat_names.to_vec(),
        };

        let existing = if fresh_only {
            None
        } else {
            self.find_compatible_manager(&storage_feats, &storage_names, conditions, scale_freq, scale_factor, prune_threshold)
        };

        let manager_idx = match existing {
            Some(idx) => {
                self.managers.get_mut(idx).maybe_extend(&storage_feats, &storage_names);
                idx
            }
            None => self.managers.alloc(TableManager::new(
                storage_feats,
                storage_names,
                conditions,
                scale_freq,
                scale_factor,
                prune_threshold,
                self.now,
            )),
        };

        let feat_depth = feats.len();
        let file_idx = match self.find_event_file(manager_idx, feat_depth, calc_feats.as_deref()) {
            Some(idx) => idx,
            None => {
                self.managers.get_mut(manager_idx).use_count += 1;
                self.files.alloc(EventFile {
                    manager: manager_idx,
                    feat_depth,
                    calc_feats,
                })
            }
        };
        EventHandle(file_idx)
    }

    pub fn event_file(&self, handle: EventHandle) -> &EventFile {
        self.files.get(handle.0)
    }

    pub fn manager(&self, handle: EventHandle) -> &TableManager {
        self.managers.get(self.event_file(handle).manager)
    }

    pub fn manager_mut(&mut self, handle: EventHandle) -> &mut TableManager {
        let manager = self.event_file(handle).manager;
        self.managers.get_mut(manager)
    }

    /// spec.md §4.2 `record`: every manager whose condition set is a subset
    /// of `matching_conds` gets the event's feature values mapped into its
    /// own feature-list order and recorded. Returns the number of managers
    /// actually recorded into, which the engine uses to drive
    /// checkpoint-every-N-records.
    pub fn record(&mut self, event_features: &[u32], matching_conds: ConditionSet) -> usize {
        let mut hits = 0;
        for (_, manager) in self.managers.iter_mut() {
            if !manager.conditions.all_of_in(matching_conds) {
                continue;
            }
            let vals: Vec<u32> = manager.feats.iter().map(|&f| event_features[f as usize]).collect();
            manager.table.record(&manager.feats, &vals);
            hits += 1;
        }
        hits
    }

    /// Every table manager currently live, for checkpoint serialization.
    pub fn managers(&self) -> impl Iterator<Item = &TableManager> {
        self.managers.iter().map(|(_, m)| m)
    }

    /// Re-inserts a manager restored from a checkpoint. The restored
    /// manager's `use_count` starts at 0; it becomes live again once a
    /// detector's `open_event_file` call finds it compatible.
    pub fn restore_manager(&mut self, manager: TableManager) {
        self.managers.alloc(manager);
    }

    /// spec.md §4.2 `advance_time`: scale managers whose period has
    /// elapsed, bumping `last_scaled` by exactly one period rather than
    /// catching up to `now` in one jump.
    pub fn advance_time(&mut self, now: u64) {
        self.now = now;
        for (_, manager) in self.managers.iter_mut() {
            if manager.use_count == 0 || manager.scale_freq == 0 {
                continue;
            }
            while now.saturating_sub(manager.last_scaled) >= manager.scale_freq {
                manager
                    .table
                    .scale_and_prune(manager.scale_factor, manager.prune_threshold);
                manager.last_scaled += manager.scale_freq;
            }
        }
    }

    /// spec.md §4.2 `needed_conditions`: union of every manager's condition
    /// set, used by the engine to skip classifying conditions nothing
    /// consumes.
    pub fn needed_conditions(&self) -> ConditionSet {
        self.managers.iter().fold(ConditionSet::EMPTY, |acc, (_, m)| acc | m.conditions)
    }

    /// Release a handle a detector no longer needs (e.g. on
    /// reconfiguration), making its manager eligible for `prune_unused`
    /// once nothing else references it.
    pub fn release(&mut self, handle: EventHandle) {
        self.managers.get_mut(self.event_file(handle).manager).use_count -= 1;
    }

    /// spec.md §4.2 `prune_unused`: drop managers no event file references.
    /// Event files are left in place since they are only reachable through
    /// a handle a caller already holds; a dangling `manager` index would
    /// only arise from a bug upstream, not from normal use.
    pub fn prune_unused(&mut self) {
        let dead: Vec<TableManagerIdx> = self
            .managers
            .iter()
            .filter(|(_, m)| m.use_count == 0)
            .map(|(idx, _)| idx)
            .collect();
        for idx in dead {
            self.managers.free(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(feats: &[u8]) -> Vec<String> {
        feats.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn reuses_compatible_manager_across_open_calls() {
        let mut rec = EventRecorder::new();
        let h1 = rec.open_event_file(&[1, 2], &names(&[1, 2]), ConditionSet::EMPTY, 100, 0.9, 0.1, false, None);
        let h2 = rec.open_event_file(&[1, 2], &names(&[1, 2]), ConditionSet::EMPTY, 100, 0.9, 0.1, false, None);
        assert_eq!(rec.event_file(h1).manager, rec.event_file(h2).manager);
        assert_eq!(h1, h2);
    }

    #[test]
    fn fresh_only_forces_a_new_manager() {
        let mut rec = EventRecorder::new();
        let h1 = rec.open_event_file(&[1], &names(&[1]), ConditionSet::EMPTY, 0, 1.0, 0.0, false, None);
        let h2 = rec.open_event_file(&[1], &names(&[1]), ConditionSet::EMPTY, 0, 1.0, 0.0, true, None);
        assert_ne!(rec.event_file(h1).manager, rec.event_file(h2).manager);
    }

    #[test]
    fn record_only_touches_managers_whose_conditions_are_satisfied() {
        let mut rec = EventRecorder::new();
        let h = rec.open_event_file(&[0], &names(&[0]), ConditionSet::bit(3), 0, 1.0, 0.0, false, None);
        rec.record(&[7], ConditionSet::EMPTY);
        assert_eq!(rec.manager(h).table.tree_count(), 0);
        rec.record(&[7], ConditionSet::bit(3));
        assert_eq!(rec.manager(h).table.tree_count(), 1);
    }

    #[test]
    fn advance_time_scales_each_full_period_without_catch_up_burst() {
        let mut rec = EventRecorder::new();
        let h = rec.open_event_file(&[0], &names(&[0]), ConditionSet::EMPTY, 10, 0.5, 0.0, false, None);
        rec.record(&[1], ConditionSet::EMPTY);
        rec.advance_time(25);
        assert_eq!(rec.manager(h).last_scaled, 20);
    }

    #[test]
    fn prune_unused_removes_released_managers() {
        let mut rec = EventRecorder::new();
        let h = rec.open_event_file(&[0], &names(&[0]), ConditionSet::bit(5), 0, 1.0, 0.0, true, None);
        rec.release(h);
        rec.prune_unused();
        assert_eq!(rec.needed_conditions(), ConditionSet::EMPTY);
    }
}
