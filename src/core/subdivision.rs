use crate::domain::model::{Cell, CellId, ExternalItem, MergeCoverage, MergeResult};
use crate::domain::ports::GridIndex;
use crate::utils::error::{HarvestError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// 單次查詢可取回的結果上限；超過即視為過密
pub const DEFAULT_DENSE_THRESHOLD: usize = 240;
/// H3 的最細解析度
pub const DEFAULT_MAX_RESOLUTION: u8 = 15;
/// 單次切分最多跨越的層數
pub const MAX_RESOLUTION_JUMP: u8 = 2;

/// 父 → 子、子 → 父的雙向索引
#[derive(Debug, Default, Clone)]
pub struct ParentChildIndex {
    children: HashMap<CellId, Vec<CellId>>,
    parents: HashMap<CellId, CellId>,
}

impl ParentChildIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登記一組父子關係。已屬於其他父格子的子格子會被拒絕，以保持每個子格子只有一個父格子。
    pub fn register(&mut self, parent: &CellId, children: &[CellId]) -> Result<()> {
        if let Some(conflict) = children
            .iter()
            .find(|c| self.parents.get(*c).is_some_and(|p| p != parent))
        {
            return Err(HarvestError::ProcessingError {
                message: format!(
                    "cell {} already belongs to {}",
                    conflict,
                    self.parents[conflict]
                ),
            });
        }

        let list = self.children.entry(parent.clone()).or_default();
        for child in children {
            if self.parents.insert(child.clone(), parent.clone()).is_none() {
                list.push(child.clone());
            }
        }
        Ok(())
    }

    pub fn children_of(&self, parent: &CellId) -> &[CellId] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent_of(&self, child: &CellId) -> Option<&CellId> {
        self.parents.get(child)
    }

    pub fn parents(&self) -> impl Iterator<Item = &CellId> {
        self.children.keys()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn clear(&mut self) {
        self.children.clear();
        self.parents.clear();
    }
}

/// 子格子處理完後留下的結果，合併時使用
#[derive(Debug, Clone, Default)]
pub struct CellOutcome {
    pub count: usize,
    pub items: Vec<ExternalItem>,
    /// 過密但沒有被解開：以截斷結果收下，或是切分後的合併仍是 `PartialDense`
    pub still_dense: bool,
}

impl CellOutcome {
    pub fn new(count: usize, items: Vec<ExternalItem>, still_dense: bool) -> Self {
        Self {
            count,
            items,
            still_dense,
        }
    }
}

pub struct SubdivisionManager<G: GridIndex> {
    grid: Arc<G>,
    threshold: usize,
    max_resolution: u8,
}

impl<G: GridIndex> SubdivisionManager<G> {
    pub fn new(grid: Arc<G>) -> Self {
        Self {
            grid,
            threshold: DEFAULT_DENSE_THRESHOLD,
            max_resolution: DEFAULT_MAX_RESOLUTION,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_max_resolution(mut self, max_resolution: u8) -> Self {
        self.max_resolution = max_resolution;
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn max_resolution(&self) -> u8 {
        self.max_resolution
    }

    pub fn is_dense(&self, result_count: usize) -> bool {
        result_count > self.threshold
    }

    /// 是否還能再往下切一層
    pub fn can_split(&self, cell: &Cell) -> bool {
        cell.resolution < self.max_resolution
    }

    /// 把格子切成 `target_resolution` 的子格子並登記到索引。回傳的子格子狀態皆為 `Queued`。
    pub fn split(
        &self,
        cell: &Cell,
        target_resolution: u8,
        index: &mut ParentChildIndex,
    ) -> Result<Vec<Cell>> {
        let invalid = |reason: &str| HarvestError::SplitConfiguration {
            cell_id: cell.id.to_string(),
            current: cell.resolution,
            target: target_resolution,
            reason: reason.to_string(),
        };

        if target_resolution <= cell.resolution {
            return Err(invalid("target resolution must be finer than the current one"));
        }
        if target_resolution - cell.resolution > MAX_RESOLUTION_JUMP {
            return Err(invalid("cannot skip more than two resolution levels"));
        }
        if target_resolution > self.max_resolution {
            return Err(invalid("target resolution exceeds the configured maximum"));
        }

        let child_ids = self
            .grid
            .cell_to_children(&cell.id, target_resolution)
            .map_err(|e| invalid(&format!("grid could not enumerate children: {}", e)))?;
        if child_ids.is_empty() {
            return Err(invalid("grid returned no children"));
        }

        index.register(&cell.id, &child_ids)?;

        let children: Vec<Cell> = child_ids
            .into_iter()
            .map(|id| {
                let child = Cell::child(id.clone(), target_resolution, cell.id.clone());
                match (self.grid.cell_to_center(&id), self.grid.cell_to_boundary(&id)) {
                    (Ok(center), Ok(boundary)) => child.with_geometry(center, boundary),
                    _ => child,
                }
            })
            .collect();

        tracing::info!(
            "✂️ Split {} (res {}) into {} children at res {}",
            cell.id,
            cell.resolution,
            children.len(),
            target_resolution
        );
        Ok(children)
    }

    /// 合併父格子底下所有子格子的結果。未處理或失敗的子格子視為 0 筆。
    ///
    /// `PartialDense` 只看子格子是否仍未解開，不看合併後的筆數；
    /// 切分完成的子格子總數超過門檻是正常的。
    pub fn merge_children(
        &self,
        parent_id: &CellId,
        index: &ParentChildIndex,
        outcomes: &HashMap<CellId, CellOutcome>,
    ) -> MergeResult {
        let mut total_count = 0;
        let mut any_dense = false;
        let mut any_empty = false;
        let mut merged = Vec::new();

        for child in index.children_of(parent_id) {
            let outcome = outcomes.get(child);
            let count = outcome.map(|o| o.count).unwrap_or(0);
            total_count += count;
            any_dense |= outcome.is_some_and(|o| o.still_dense);
            any_empty |= count == 0;
            if let Some(outcome) = outcome {
                merged.extend(outcome.items.iter().cloned());
            }
        }

        let coverage = if any_dense {
            MergeCoverage::PartialDense
        } else if any_empty {
            MergeCoverage::PartialEmpty
        } else {
            MergeCoverage::Complete
        };

        MergeResult {
            parent_id: parent_id.clone(),
            total_count,
            unique_items: dedup_items(merged),
            coverage,
        }
    }
}

/// 依 id 去重，保留第一次出現的順序
pub fn dedup_items(items: impl IntoIterator<Item = ExternalItem>) -> Vec<ExternalItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::FakeGrid;
    use crate::domain::model::CellStatus;

    fn manager() -> (SubdivisionManager<FakeGrid>, Arc<FakeGrid>) {
        let grid = Arc::new(FakeGrid::new());
        (SubdivisionManager::new(Arc::clone(&grid)), grid)
    }

    fn items(prefix: &str, n: usize) -> Vec<ExternalItem> {
        (0..n)
            .map(|i| ExternalItem::new(format!("{}-{}", prefix, i), None))
            .collect()
    }

    #[test]
    fn test_dense_threshold() {
        let (manager, _) = manager();
        assert!(!manager.is_dense(240));
        assert!(manager.is_dense(241));
    }

    #[test]
    fn test_split_dense_cell_one_level() {
        let (manager, grid) = manager();
        let cell = grid.materialize("a", None);
        let mut index = ParentChildIndex::new();

        assert!(manager.is_dense(241));
        let children = manager.split(&cell, cell.resolution + 1, &mut index).unwrap();

        assert_eq!(children.len(), 7);
        for child in &children {
            assert_eq!(child.parent_id(), Some(&cell.id));
            assert_eq!(child.resolution, cell.resolution + 1);
            assert_eq!(child.status(), CellStatus::Queued);
            assert!(child.center.is_some());
            assert_eq!(index.parent_of(&child.id), Some(&cell.id));
        }
        assert_eq!(index.children_of(&cell.id).len(), 7);
    }

    #[test]
    fn test_two_level_jump_is_allowed() {
        let (manager, grid) = manager();
        let cell = grid.materialize("a", None);
        let mut index = ParentChildIndex::new();
        let children = manager.split(&cell, cell.resolution + 2, &mut index).unwrap();
        assert_eq!(children.len(), 49);
    }

    #[test]
    fn test_invalid_jumps_are_rejected() {
        let (manager, grid) = manager();
        let cell = grid.materialize("a", None);
        let mut index = ParentChildIndex::new();

        for target in [cell.resolution, cell.resolution - 1, cell.resolution + 3] {
            let err = manager.split(&cell, target, &mut index).unwrap_err();
            assert!(matches!(err, HarvestError::SplitConfiguration { .. }));
        }
        assert!(index.is_empty());
    }

    #[test]
    fn test_max_resolution_bound() {
        let grid = Arc::new(FakeGrid::new());
        let manager = SubdivisionManager::new(Arc::clone(&grid)).with_max_resolution(7);
        let cell = grid.materialize("a", None);
        assert!(!manager.can_split(&cell));
        assert!(manager
            .split(&cell, 8, &mut ParentChildIndex::new())
            .is_err());
    }

    #[test]
    fn test_index_rejects_second_parent() {
        let mut index = ParentChildIndex::new();
        let child = CellId::new("x/0");
        index.register(&CellId::new("x"), &[child.clone()]).unwrap();
        // 同一個父格子重複登記沒有問題
        index.register(&CellId::new("x"), &[child.clone()]).unwrap();
        assert_eq!(index.children_of(&CellId::new("x")).len(), 1);

        assert!(index.register(&CellId::new("y"), &[child]).is_err());
    }

    #[test]
    fn test_merge_prefers_partial_dense() {
        let (manager, _) = manager();
        let parent = CellId::new("a");
        let children = vec![CellId::new("a/0"), CellId::new("a/1"), CellId::new("a/2")];
        let mut index = ParentChildIndex::new();
        index.register(&parent, &children).unwrap();

        let mut outcomes = HashMap::new();
        outcomes.insert(children[0].clone(), CellOutcome::new(50, items("p", 50), false));
        outcomes.insert(children[1].clone(), CellOutcome::new(0, vec![], false));
        outcomes.insert(children[2].clone(), CellOutcome::new(300, items("q", 300), true));

        let merged = manager.merge_children(&parent, &index, &outcomes);
        assert_eq!(merged.coverage, MergeCoverage::PartialDense);
        assert_eq!(merged.total_count, 350);
        assert_eq!(merged.unique_items.len(), 350);
    }

    #[test]
    fn test_merge_of_resolved_child_is_not_dense() {
        let (manager, _) = manager();
        let parent = CellId::new("a");
        let children = vec![CellId::new("a/0"), CellId::new("a/1")];
        let mut index = ParentChildIndex::new();
        index.register(&parent, &children).unwrap();

        // a/0 已切分且合併完整：總數超過門檻但不算過密
        let mut outcomes = HashMap::new();
        outcomes.insert(children[0].clone(), CellOutcome::new(280, items("g", 280), false));
        outcomes.insert(children[1].clone(), CellOutcome::new(20, items("h", 20), false));

        let merged = manager.merge_children(&parent, &index, &outcomes);
        assert_eq!(merged.coverage, MergeCoverage::Complete);
        assert_eq!(merged.total_count, 300);
    }

    #[test]
    fn test_merge_reports_empty_and_complete() {
        let (manager, _) = manager();
        let parent = CellId::new("a");
        let children = vec![CellId::new("a/0"), CellId::new("a/1")];
        let mut index = ParentChildIndex::new();
        index.register(&parent, &children).unwrap();

        let mut outcomes = HashMap::new();
        outcomes.insert(children[0].clone(), CellOutcome::new(10, items("p", 10), false));
        let merged = manager.merge_children(&parent, &index, &outcomes);
        assert_eq!(merged.coverage, MergeCoverage::PartialEmpty);

        outcomes.insert(children[1].clone(), CellOutcome::new(5, items("p", 5), false));
        let merged = manager.merge_children(&parent, &index, &outcomes);
        assert_eq!(merged.coverage, MergeCoverage::Complete);
        // 兩個子格子回傳的 p-0..p-4 重疊
        assert_eq!(merged.total_count, 15);
        assert_eq!(merged.unique_items.len(), 10);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let mut all = items("a", 5);
        all.extend(items("a", 3));
        let once = dedup_items(all);
        assert_eq!(once.len(), 5);
        let twice = dedup_items(once.clone());
        assert_eq!(once, twice);
    }
}
