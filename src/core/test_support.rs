//! In-crate fakes shared by the unit tests.

use crate::domain::model::{Cell, CellId, ExternalItem, GeoPoint};
use crate::domain::ports::{GridIndex, SearchApi, SearchPage, SearchRequest};
use crate::utils::error::{HarvestError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 假格網：id 以 `/` 串接子格子序號，例如 `a/3/0`。每層 7 個子格子，頂層解析度 7。
pub struct FakeGrid {
    base_resolution: u8,
    default_area: f64,
    area_overrides: HashMap<String, f64>,
    broken_area: bool,
    pins: HashMap<String, CellId>,
}

impl FakeGrid {
    pub fn new() -> Self {
        Self {
            base_resolution: 7,
            default_area: 2.0,
            area_overrides: HashMap::new(),
            broken_area: false,
            pins: HashMap::new(),
        }
    }

    pub fn with_default_area(mut self, area: f64) -> Self {
        self.default_area = area;
        self
    }

    pub fn with_area(mut self, id: &str, area: f64) -> Self {
        self.area_overrides.insert(id.to_string(), area);
        self
    }

    pub fn with_broken_area(mut self) -> Self {
        self.broken_area = true;
        self
    }

    /// 指定某個座標在驗證時屬於哪個格子；未指定的座標查詢會失敗
    pub fn with_pin(mut self, point: GeoPoint, id: &str) -> Self {
        self.pins.insert(pin_key(point.lat, point.lng), CellId::new(id));
        self
    }

    pub fn materialize(&self, id: &str, parent: Option<&str>) -> Cell {
        let id = CellId::new(id);
        let resolution = self.cell_resolution(&id).unwrap_or(self.base_resolution);
        let cell = match parent {
            Some(parent) => Cell::child(id.clone(), resolution, CellId::new(parent)),
            None => Cell::top_level(id.clone(), resolution),
        };
        match (self.cell_to_center(&id), self.cell_to_boundary(&id)) {
            (Ok(center), Ok(boundary)) => cell.with_geometry(center, boundary),
            _ => cell,
        }
    }

    fn segments(id: &CellId) -> Result<Vec<&str>> {
        if id.as_str().is_empty() || id.as_str().starts_with('!') {
            return Err(HarvestError::grid(format!("invalid fake cell {}", id)));
        }
        Ok(id.as_str().split('/').collect())
    }

    fn depth(id: &CellId) -> Result<usize> {
        Ok(Self::segments(id)?.len() - 1)
    }
}

impl Default for FakeGrid {
    fn default() -> Self {
        Self::new()
    }
}

fn pin_key(lat: f64, lng: f64) -> String {
    format!("{:.6},{:.6}", lat, lng)
}

impl GridIndex for FakeGrid {
    fn cell_to_center(&self, id: &CellId) -> Result<GeoPoint> {
        let segments = Self::segments(id)?;
        let root: u32 = segments[0].bytes().map(u32::from).sum();
        let mut lat = 10.0 + f64::from(root % 50) * 0.1;
        let mut lng = 20.0 + f64::from(root % 37) * 0.1;
        for (depth, segment) in segments.iter().enumerate().skip(1) {
            let index: f64 = segment
                .parse::<u32>()
                .map(f64::from)
                .map_err(|_| HarvestError::grid(format!("bad segment in {}", id)))?;
            let scale = 0.01 / 3f64.powi(depth as i32);
            lat += (index + 1.0) * scale;
            lng -= (index + 1.0) * scale * 0.5;
        }
        Ok(GeoPoint::new(lat, lng))
    }

    fn cell_to_boundary(&self, id: &CellId) -> Result<Vec<GeoPoint>> {
        let center = self.cell_to_center(id)?;
        let r = 0.02 / 2.6f64.powi(Self::depth(id)? as i32);
        Ok((0..6)
            .map(|i| {
                let angle = (60.0 * i as f64).to_radians();
                GeoPoint::new(center.lat + r * angle.cos(), center.lng + r * angle.sin())
            })
            .collect())
    }

    fn cell_area_km2(&self, id: &CellId) -> Result<f64> {
        Self::segments(id)?;
        if self.broken_area {
            return Err(HarvestError::grid("area unavailable"));
        }
        Ok(*self
            .area_overrides
            .get(id.as_str())
            .unwrap_or(&self.default_area))
    }

    fn cell_resolution(&self, id: &CellId) -> Result<u8> {
        Ok(self.base_resolution + Self::depth(id)? as u8)
    }

    fn cell_to_children(&self, id: &CellId, target_resolution: u8) -> Result<Vec<CellId>> {
        let resolution = self.cell_resolution(id)?;
        if target_resolution <= resolution {
            return Err(HarvestError::grid("target resolution must be finer"));
        }
        let mut ids = vec![id.as_str().to_string()];
        for _ in resolution..target_resolution {
            ids = ids
                .iter()
                .flat_map(|parent| (0..7).map(move |i| format!("{}/{}", parent, i)))
                .collect();
        }
        Ok(ids.into_iter().map(CellId::new).collect())
    }

    fn point_to_cell(&self, lat: f64, lng: f64, resolution: u8) -> Result<CellId> {
        let pinned = self
            .pins
            .get(&pin_key(lat, lng))
            .ok_or_else(|| HarvestError::grid("point not pinned"))?;
        if self.cell_resolution(pinned)? != resolution {
            return Err(HarvestError::grid("pinned at another resolution"));
        }
        Ok(pinned.clone())
    }

    fn expected_in_radius_m(&self, resolution: u8) -> Result<f64> {
        Ok(1000.0 / 2.6f64.powi(i32::from(resolution) - 7))
    }
}

type Handler = Box<dyn Fn(&SearchRequest) -> Result<SearchPage> + Send + Sync>;

/// 依測試提供的函式回應的搜尋 API，並記錄所有請求
pub struct ScriptedSearchApi {
    page_size: u32,
    max_offset: u32,
    handler: Handler,
    calls: AtomicU64,
    requests: Mutex<Vec<SearchRequest>>,
}

impl ScriptedSearchApi {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&SearchRequest) -> Result<SearchPage> + Send + Sync + 'static,
    {
        Self {
            page_size: 50,
            max_offset: 1000,
            handler: Box::new(handler),
            calls: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_paging(mut self, page_size: u32, max_offset: u32) -> Self {
        self.page_size = page_size;
        self.max_offset = max_offset;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchApi for ScriptedSearchApi {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        (self.handler)(request)
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn max_offset(&self) -> u32 {
        self.max_offset
    }
}

/// 產生 `{prefix}-{n}` 形式、共 `total` 筆資料中的一頁
pub fn page_of(prefix: &str, total: usize, request: &SearchRequest, at: Option<GeoPoint>) -> SearchPage {
    let start = request.offset as usize;
    let end = (start + request.limit as usize).min(total);
    let items = (start..end)
        .map(|n| ExternalItem::new(format!("{}-{}", prefix, n), at))
        .collect();
    SearchPage { total, items }
}

/// 判斷請求是否落在某點附近 (同一格子的中心探針)
pub fn near(request: &SearchRequest, point: GeoPoint) -> bool {
    (request.lat - point.lat).abs() < 1e-9 && (request.lng - point.lng).abs() < 1e-9
}
