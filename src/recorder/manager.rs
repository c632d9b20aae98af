use crate::condition::ConditionSet;
use crate::prob_table::ProbabilityTable;

/// One scaled, conditioned probability table plus the bookkeeping
/// `EventRecorder::open_event_file` needs to decide whether an existing
/// table can be reused (spec.md §4.2).
pub struct TableManager {
    pub table: ProbabilityTable,
    pub feats: Vec<u8>,
    pub feat_names: Vec<String>,
    pub conditions: ConditionSet,
    pub scale_freq: u64,
    pub scale_factor: f64,
    pub prune_threshold: f64,
    pub start_time: u64,
    pub last_scaled: u64,
    /// Number of distinct event-file handles bound to this manager. A
    /// manager with `use_count == 0` is orphaned and eligible for
    /// `prune_unused`.
    pub use_count: u32,
}

impl TableManager {
    pub fn new(
        feats: Vec<u8>,
        feat_names: Vec<String>,
        conditions: ConditionSet,
        scale_freq: u64,
        scale_factor: f64,
        prune_threshold: f64,
        start_time: u64,
    ) -> Self {
        Self {
            table: ProbabilityTable::new(),
            feats,
            feat_names,
            conditions,
            scale_freq,
            scale_factor,
            prune_threshold,
            start_time,
            last_scaled: start_time,
            use_count: 0,
        }
    }

    /// Whether this manager can stand in for a request with the given
    /// parameters, per spec.md §4.2 `open_event_file` step 1: identical
    /// condition set, identical scaling parameters unless this manager is
    /// orphaned, and one feature list a prefix of the other.
    pub fn is_compatible(
        &self,
        feats: &[u8],
        feat_names: &[String],
        conditions: ConditionSet,
        scale_freq: u64,
        scale_factor: f64,
        prune_threshold: f64,
    ) -> bool {
        if self.conditions != conditions {
            return false;
        }
        if self.use_count > 0
            && (self.scale_freq != scale_freq
                || self.scale_factor != scale_factor
                || self.prune_threshold != prune_threshold)
        {
            return false;
        }
        let shorter = self.feats.len().min(feats.len());
        self.feats[..shorter] == feats[..shorter] && self.feat_names[..shorter] == feat_names[..shorter]
    }

    /// Extend this manager's tracked feature list to the longer of the two,
    /// but only while its table is still empty (spec.md §4.2 step 1
    /// parenthetical).
    pub fn maybe_extend(&mut self, feats: &[u8], feat_names: &[String]) {
        let empty = self.table.leaf_count() == 0 && self.table.interior_node_count() == 0;
        if empty && feats.len() > self.feats.len() {
            self.feats = feats.to_vec();
            self.feat_names = feat_names.to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr(feats: &[u8]) -> TableManager {
        let names = feats.iter().map(|f| f.to_string()).collect();
        TableManager::new(feats.to_vec(), names, ConditionSet::EMPTY, 0, 1.0, 0.0, 0)
    }

    #[test]
    fn prefix_lists_are_compatible() {
        let m = mgr(&[1, 2, 3]);
        let names: Vec<String> = vec!["1".into(), "2".into()];
        assert!(m.is_compatible(&[1, 2], &names, ConditionSet::EMPTY, 0, 1.0, 0.0));
    }

    #[test]
    fn mismatched_conditions_are_incompatible() {
        let m = mgr(&[1, 2]);
        let names: Vec<String> = vec!["1".into(), "2".into()];
        assert!(!m.is_compatible(&[1, 2], &names, ConditionSet::bit(0), 0, 1.0, 0.0));
    }

    #[test]
    fn orphaned_manager_ignores_scaling_mismatch() {
        let m = mgr(&[1]);
        let names: Vec<String> = vec!["1".into()];
        assert!(m.is_compatible(&[1], &names, ConditionSet::EMPTY, 999, 0.5, 0.1));
    }
}
