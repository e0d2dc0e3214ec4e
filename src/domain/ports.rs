use crate::domain::model::{CellId, ExternalItem, GeoPoint};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 階層式六角格網。全部視為純函式；錯誤代表「無法計算覆蓋或驗證」，不會中止整個流程。
pub trait GridIndex: Send + Sync {
    fn cell_to_center(&self, id: &CellId) -> Result<GeoPoint>;
    fn cell_to_boundary(&self, id: &CellId) -> Result<Vec<GeoPoint>>;
    fn cell_area_km2(&self, id: &CellId) -> Result<f64>;
    fn cell_resolution(&self, id: &CellId) -> Result<u8>;
    fn cell_to_children(&self, id: &CellId, target_resolution: u8) -> Result<Vec<CellId>>;
    fn point_to_cell(&self, lat: f64, lng: f64, resolution: u8) -> Result<CellId>;
    /// 該解析度下格子中心到最近邊中點的平均距離 (公尺)
    fn expected_in_radius_m(&self, resolution: u8) -> Result<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: u32,
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    /// API 回報的符合總數 (不一定都能取回)
    pub total: usize,
    pub items: Vec<ExternalItem>,
}

/// 只接受圓心 + 半徑的分頁搜尋 API
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage>;

    fn page_size(&self) -> u32;

    /// 可請求的最大 offset (不含)
    fn max_offset(&self) -> u32;
}
