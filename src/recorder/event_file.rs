use crate::arena::Index;
use super::manager::TableManager;

pub type TableManagerIdx = Index<TableManager>;

/// A detector's binding into the recorder: which table manager it feeds,
/// how many leading event features it uses, and any extra "calculated"
/// features (e.g. `dead-dest`'s destination-IP feature) appended for
/// recording but not for scoring (spec.md §4.2, §8).
pub struct EventFile {
    pub manager: TableManagerIdx,
    pub feat_depth: usize,
    pub calc_feats: Option<Vec<u8>>,
}

impl EventFile {
    pub fn matches(&self, manager: TableManagerIdx, feat_depth: usize, calc_feats: Option<&[u8]>) -> bool {
        self.manager == manager && self.feat_depth == feat_depth && self.calc_feats.as_deref() == calc_feats
    }
}
