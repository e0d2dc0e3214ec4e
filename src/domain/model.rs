use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 格子識別碼。內容格式由格網服務決定 (H3 為 15 字元十六進位字串)。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// 格子在父子關係中的位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellLineage {
    TopLevel,
    Child {
        parent_id: CellId,
    },
    /// 已被切分；`parent_id` 在子格子再被切分時才會存在
    Parent {
        parent_id: Option<CellId>,
        child_ids: Vec<CellId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Queued,
    Processing,
    Fetched,
    Failed,
    Split,
}

impl CellStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CellStatus::Fetched | CellStatus::Failed | CellStatus::Split
        )
    }
}

/// 子格子合併後的覆蓋狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeCoverage {
    Complete,
    PartialDense,
    PartialEmpty,
}

/// 單一格子的覆蓋品質標籤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageLabel {
    Pending,
    Complete,
    Empty,
    /// 部分探針失敗
    PartialProbes,
    /// 仍然過密但已無法再切分
    Truncated,
    Merged(MergeCoverage),
    Failed,
}

impl fmt::Display for CoverageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CoverageLabel::Pending => "pending",
            CoverageLabel::Complete => "complete",
            CoverageLabel::Empty => "empty",
            CoverageLabel::PartialProbes => "partial-probes",
            CoverageLabel::Truncated => "truncated",
            CoverageLabel::Merged(MergeCoverage::Complete) => "merged-complete",
            CoverageLabel::Merged(MergeCoverage::PartialDense) => "partial-dense",
            CoverageLabel::Merged(MergeCoverage::PartialEmpty) => "partial-empty",
            CoverageLabel::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub resolution: u8,
    pub center: Option<GeoPoint>,
    pub boundary: Vec<GeoPoint>,
    lineage: CellLineage,
    status: CellStatus,
    pub result_count: usize,
    pub coverage: CoverageLabel,
    pub error: Option<String>,
}

impl Cell {
    pub fn new(id: CellId, resolution: u8, lineage: CellLineage) -> Self {
        Self {
            id,
            resolution,
            center: None,
            boundary: Vec::new(),
            lineage,
            status: CellStatus::Queued,
            result_count: 0,
            coverage: CoverageLabel::Pending,
            error: None,
        }
    }

    pub fn top_level(id: CellId, resolution: u8) -> Self {
        Self::new(id, resolution, CellLineage::TopLevel)
    }

    pub fn child(id: CellId, resolution: u8, parent_id: CellId) -> Self {
        Self::new(id, resolution, CellLineage::Child { parent_id })
    }

    pub fn with_geometry(mut self, center: GeoPoint, boundary: Vec<GeoPoint>) -> Self {
        self.center = Some(center);
        self.boundary = boundary;
        self
    }

    pub fn lineage(&self) -> &CellLineage {
        &self.lineage
    }

    pub fn status(&self) -> CellStatus {
        self.status
    }

    pub fn parent_id(&self) -> Option<&CellId> {
        match &self.lineage {
            CellLineage::TopLevel => None,
            CellLineage::Child { parent_id } => Some(parent_id),
            CellLineage::Parent { parent_id, .. } => parent_id.as_ref(),
        }
    }

    pub fn child_ids(&self) -> &[CellId] {
        match &self.lineage {
            CellLineage::Parent { child_ids, .. } => child_ids,
            _ => &[],
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id().is_none()
    }

    pub fn start_processing(&mut self) {
        self.status = CellStatus::Processing;
        self.error = None;
    }

    pub fn mark_fetched(&mut self, result_count: usize, coverage: CoverageLabel) {
        self.status = CellStatus::Fetched;
        self.result_count = result_count;
        self.coverage = coverage;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = CellStatus::Failed;
        self.coverage = CoverageLabel::Failed;
        self.error = Some(error.into());
    }

    /// 回到排隊狀態 (重試或取消後使用)
    pub fn requeue(&mut self) {
        self.status = CellStatus::Queued;
    }

    /// 標記為已切分。子格子清單不可為空，否則 `Split` 狀態與父子關係會不一致。
    #[must_use = "an empty child list leaves the cell unsplit"]
    pub fn mark_split(&mut self, result_count: usize, child_ids: Vec<CellId>) -> bool {
        if child_ids.is_empty() {
            return false;
        }
        let parent_id = self.parent_id().cloned();
        self.lineage = CellLineage::Parent {
            parent_id,
            child_ids,
        };
        self.status = CellStatus::Split;
        self.result_count = result_count;
        self.error = None;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeRole {
    Primary,
    Corner,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProbe {
    pub center: GeoPoint,
    pub radius_m: f64,
    pub role: ProbeRole,
    pub description: String,
}

/// 外部搜尋 API 回傳的單筆資料。`id` 是唯一的去重依據。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub id: String,
    pub name: Option<String>,
    pub coordinates: Option<GeoPoint>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ExternalItem {
    pub fn new(id: impl Into<String>, coordinates: Option<GeoPoint>) -> Self {
        Self {
            id: id.into(),
            name: None,
            coordinates,
            raw: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub probe: SearchProbe,
    pub reported_total: usize,
    pub pages_fetched: u32,
    pub items: Vec<ExternalItem>,
    /// 分頁在 API 的最大 offset 停下，API 仍有更多資料
    pub truncated: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellResult {
    pub cell_id: CellId,
    pub total_count: usize,
    pub unique_items: Vec<ExternalItem>,
    pub per_probe_results: Vec<ProbeResult>,
    pub status: SearchStatus,
    pub error: Option<String>,
    /// 座標落在其他格子、因此從本格剔除的資料
    pub leaked_items: Vec<ExternalItem>,
    pub validation_failures: usize,
    pub api_calls: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub parent_id: CellId,
    pub total_count: usize,
    pub unique_items: Vec<ExternalItem>,
    pub coverage: MergeCoverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl CoverageQuality {
    /// 依成功 (fetched / split) 格子比例分級
    pub fn from_success_ratio(ratio: f64) -> Self {
        if ratio >= 0.95 {
            CoverageQuality::Excellent
        } else if ratio >= 0.85 {
            CoverageQuality::Good
        } else if ratio >= 0.70 {
            CoverageQuality::Fair
        } else {
            CoverageQuality::Poor
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub cells: usize,
    pub fetched: usize,
    pub split: usize,
    pub failed: usize,
    pub queued: usize,
    pub items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCell {
    pub id: CellId,
    pub resolution: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub cells_total: usize,
    pub cells_queued: usize,
    pub cells_processing: usize,
    pub cells_fetched: usize,
    pub cells_split: usize,
    pub cells_failed: usize,
    pub phase_two_pending: usize,
    pub probes_issued: u64,
    pub api_calls: u64,
    pub items_leaked: u64,
    pub validation_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub daily_used: u64,
    pub daily_remaining: u64,
    pub daily_limit: u64,
    pub per_second_used: u32,
    pub per_second_remaining: u32,
    pub per_second_limit: u32,
    pub last_daily_reset: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaEstimate {
    pub estimated_calls: u64,
    pub daily_remaining: u64,
    pub usage_ratio: f64,
    pub risk_level: RiskLevel,
    pub can_process: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub top_level_cells: usize,
    pub total_cells: usize,
    pub fetched: usize,
    pub split: usize,
    pub failed: usize,
    pub queued: usize,
    pub per_resolution: BTreeMap<u8, ResolutionStats>,
    /// 全部格子 (含越界資料) 去重後的總筆數
    pub total_unique_items: usize,
    pub leaked_items: usize,
    pub api_calls: u64,
    pub quality: CoverageQuality,
    pub failed_cells: Vec<FailedCell>,
    pub cancelled: bool,
    pub aborted: Option<String>,
    pub quota: QuotaStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_requires_children() {
        let mut cell = Cell::top_level(CellId::new("a"), 7);
        assert!(!cell.mark_split(300, vec![]));
        assert_eq!(cell.status(), CellStatus::Queued);

        assert!(cell.mark_split(300, vec![CellId::new("a1"), CellId::new("a2")]));
        assert_eq!(cell.status(), CellStatus::Split);
        assert_eq!(cell.child_ids().len(), 2);
        assert!(cell.is_top_level());
    }

    #[test]
    fn test_split_child_keeps_parent_link() {
        let mut cell = Cell::child(CellId::new("a1"), 8, CellId::new("a"));
        assert!(cell.mark_split(260, vec![CellId::new("a1x")]));
        assert_eq!(cell.parent_id(), Some(&CellId::new("a")));
        assert_eq!(cell.child_ids(), &[CellId::new("a1x")]);
    }

    #[test]
    fn test_failed_cell_records_reason() {
        let mut cell = Cell::top_level(CellId::new("a"), 7);
        cell.start_processing();
        cell.mark_failed("boom");
        assert_eq!(cell.status(), CellStatus::Failed);
        assert_eq!(cell.coverage, CoverageLabel::Failed);
        assert_eq!(cell.error.as_deref(), Some("boom"));
        assert!(cell.status().is_terminal());
    }

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(CoverageQuality::from_success_ratio(1.0), CoverageQuality::Excellent);
        assert_eq!(CoverageQuality::from_success_ratio(0.9), CoverageQuality::Good);
        assert_eq!(CoverageQuality::from_success_ratio(0.75), CoverageQuality::Fair);
        assert_eq!(CoverageQuality::from_success_ratio(0.5), CoverageQuality::Poor);
    }

    #[test]
    fn test_coverage_label_display() {
        assert_eq!(
            CoverageLabel::Merged(MergeCoverage::PartialDense).to_string(),
            "partial-dense"
        );
        assert_eq!(CoverageLabel::Truncated.to_string(), "truncated");
    }
}
