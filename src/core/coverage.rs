use crate::domain::model::{Cell, GeoPoint, ProbeRole, SearchProbe};
use crate::domain::ports::GridIndex;
use crate::utils::error::{HarvestError, Result};
use crate::utils::geo::{haversine_m, midpoint};
use std::sync::Arc;

/// 面積 ≤ 此值只需中心探針
pub const SMALL_CELL_KM2: f64 = 3.0;
/// 面積 ≤ 此值使用中心 + 2 個角探針
pub const MEDIUM_CELL_KM2: f64 = 8.0;
/// 超過此面積的方案必須至少有 2 個角探針
pub const LARGE_CELL_VALIDATION_KM2: f64 = 10.0;
/// 邊界或面積無法取得時使用的保守半徑
pub const FALLBACK_PRIMARY_RADIUS_M: f64 = 1000.0;

const PRIMARY_VERTEX_FACTOR: f64 = 0.9;
const PRIMARY_IN_RADIUS_FACTOR: f64 = 1.1;
const SECONDARY_IN_RADIUS_FACTOR: f64 = 0.9;
const MEDIUM_SECONDARY_FACTOR: f64 = 0.6;
const LARGE_SECONDARY_FACTOR: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct CoveragePlan {
    pub probes: Vec<SearchProbe>,
    pub area_km2: Option<f64>,
    /// 是否因為格網資料不足而退回單一保守探針
    pub fallback: bool,
}

impl CoveragePlan {
    pub fn count(&self, role: ProbeRole) -> usize {
        self.probes.iter().filter(|p| p.role == role).count()
    }
}

/// 依格子面積決定探針數量與半徑。無狀態，對同一格子永遠產生相同結果。
pub struct CoveragePlanner<G: GridIndex> {
    grid: Arc<G>,
}

impl<G: GridIndex> CoveragePlanner<G> {
    pub fn new(grid: Arc<G>) -> Self {
        Self { grid }
    }

    pub fn plan(&self, cell: &Cell) -> CoveragePlan {
        let center = match cell.center {
            Some(center) => center,
            None => match self.grid.cell_to_center(&cell.id) {
                Ok(center) => center,
                Err(e) => {
                    tracing::warn!("⚠️ No center for cell {}: {}", cell.id, e);
                    return CoveragePlan {
                        probes: Vec::new(),
                        area_km2: None,
                        fallback: true,
                    };
                }
            },
        };

        match self.graduated_probes(cell, center) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::debug!(
                    "📐 Falling back to a single {}m probe for {}: {}",
                    FALLBACK_PRIMARY_RADIUS_M,
                    cell.id,
                    e
                );
                CoveragePlan {
                    probes: vec![SearchProbe {
                        center,
                        radius_m: FALLBACK_PRIMARY_RADIUS_M,
                        role: ProbeRole::Primary,
                        description: format!("fallback primary for {}", cell.id),
                    }],
                    area_km2: None,
                    fallback: true,
                }
            }
        }
    }

    /// 產生方案並檢查是否可用；不合格時回傳 `CoverageGeneration` 錯誤
    pub fn plan_validated(&self, cell: &Cell) -> Result<Vec<SearchProbe>> {
        let plan = self.plan(cell);
        validate_plan(cell, &plan)?;
        Ok(plan.probes)
    }

    fn graduated_probes(&self, cell: &Cell, center: GeoPoint) -> Result<CoveragePlan> {
        let boundary = if cell.boundary.is_empty() {
            self.grid.cell_to_boundary(&cell.id)?
        } else {
            cell.boundary.clone()
        };
        let vertices = open_ring(&boundary);
        if vertices.len() < 3 {
            return Err(HarvestError::CoverageGeneration {
                cell_id: cell.id.to_string(),
                reason: format!("degenerate boundary with {} vertices", vertices.len()),
            });
        }

        let area_km2 = self.grid.cell_area_km2(&cell.id)?;
        let in_radius_m = self.grid.expected_in_radius_m(cell.resolution)?;

        let farthest_m = vertices
            .iter()
            .map(|v| haversine_m(center, *v))
            .fold(0.0_f64, f64::max);
        let primary_radius = (PRIMARY_VERTEX_FACTOR * farthest_m)
            .min(PRIMARY_IN_RADIUS_FACTOR * in_radius_m);

        let mut probes = vec![SearchProbe {
            center,
            radius_m: primary_radius,
            role: ProbeRole::Primary,
            description: format!("primary at center of {}", cell.id),
        }];

        let (corners, edges, factor) = if area_km2 <= SMALL_CELL_KM2 {
            (0, 0, 0.0)
        } else if area_km2 <= MEDIUM_CELL_KM2 {
            (2, 0, MEDIUM_SECONDARY_FACTOR)
        } else {
            (3, 2, LARGE_SECONDARY_FACTOR)
        };
        let secondary_radius =
            (factor * primary_radius).min(SECONDARY_IN_RADIUS_FACTOR * in_radius_m);

        let n = vertices.len();
        // 角探針取等距頂點 (依頂點順序)，邊探針落在相鄰頂點中點，避開角探針
        for i in 0..corners {
            let index = i * n / corners;
            probes.push(SearchProbe {
                center: vertices[index],
                radius_m: secondary_radius,
                role: ProbeRole::Corner,
                description: format!("corner at vertex {} of {}", index, cell.id),
            });
        }
        for j in 0..edges {
            let index = (j * n / edges + 1) % n;
            let next = (index + 1) % n;
            probes.push(SearchProbe {
                center: midpoint(vertices[index], vertices[next]),
                radius_m: secondary_radius,
                role: ProbeRole::Edge,
                description: format!("edge between vertices {}-{} of {}", index, next, cell.id),
            });
        }

        Ok(CoveragePlan {
            probes,
            area_km2: Some(area_km2),
            fallback: false,
        })
    }
}

/// 方案至少一個探針、恰好一個中心探針；大格子需至少兩個角探針
pub fn validate_plan(cell: &Cell, plan: &CoveragePlan) -> Result<()> {
    let reject = |reason: String| {
        Err(HarvestError::CoverageGeneration {
            cell_id: cell.id.to_string(),
            reason,
        })
    };

    if plan.probes.is_empty() {
        return reject("no probes generated".to_string());
    }
    let primaries = plan.count(ProbeRole::Primary);
    if primaries != 1 {
        return reject(format!("expected exactly one primary probe, got {}", primaries));
    }
    if let Some(area) = plan.area_km2 {
        let corners = plan.count(ProbeRole::Corner);
        if area > LARGE_CELL_VALIDATION_KM2 && corners < 2 {
            return reject(format!(
                "cell of {:.2} km² needs at least 2 corner probes, got {}",
                area, corners
            ));
        }
    }
    if plan
        .probes
        .iter()
        .any(|p| p.radius_m.is_nan() || p.radius_m <= 0.0)
    {
        return reject("probe radius must be positive".to_string());
    }
    Ok(())
}

/// 去掉封閉環重複的最後一點
fn open_ring(boundary: &[GeoPoint]) -> Vec<GeoPoint> {
    let mut vertices = boundary.to_vec();
    if vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    vertices
}
