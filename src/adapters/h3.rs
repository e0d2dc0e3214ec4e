use crate::domain::model::{CellId, GeoPoint};
use crate::domain::ports::GridIndex;
use crate::utils::error::{HarvestError, Result};
use h3o::{CellIndex, LatLng, Resolution};
use std::str::FromStr;

/// 以 `h3o` 實作的 H3 格網。格子 id 為 15 字元的十六進位字串。
#[derive(Debug, Clone, Copy, Default)]
pub struct H3Grid;

impl H3Grid {
    pub fn new() -> Self {
        Self
    }

    fn parse(id: &CellId) -> Result<CellIndex> {
        CellIndex::from_str(id.as_str().trim())
            .map_err(|e| HarvestError::grid(format!("invalid H3 cell {}: {}", id, e)))
    }

    fn resolution(value: u8) -> Result<Resolution> {
        Resolution::try_from(value)
            .map_err(|e| HarvestError::grid(format!("invalid resolution {}: {}", value, e)))
    }
}

fn to_point(ll: LatLng) -> GeoPoint {
    GeoPoint::new(ll.lat(), ll.lng())
}

impl GridIndex for H3Grid {
    fn cell_to_center(&self, id: &CellId) -> Result<GeoPoint> {
        Ok(to_point(LatLng::from(Self::parse(id)?)))
    }

    fn cell_to_boundary(&self, id: &CellId) -> Result<Vec<GeoPoint>> {
        let boundary = Self::parse(id)?.boundary();
        Ok(boundary.iter().copied().map(to_point).collect())
    }

    fn cell_area_km2(&self, id: &CellId) -> Result<f64> {
        Ok(Self::parse(id)?.area_km2())
    }

    fn cell_resolution(&self, id: &CellId) -> Result<u8> {
        Ok(u8::from(Self::parse(id)?.resolution()))
    }

    fn cell_to_children(&self, id: &CellId, target_resolution: u8) -> Result<Vec<CellId>> {
        let cell = Self::parse(id)?;
        let target = Self::resolution(target_resolution)?;
        if target <= cell.resolution() {
            return Err(HarvestError::grid(format!(
                "resolution {} is not finer than {} for {}",
                target_resolution,
                u8::from(cell.resolution()),
                id
            )));
        }
        Ok(cell
            .children(target)
            .map(|child| CellId::new(child.to_string()))
            .collect())
    }

    fn point_to_cell(&self, lat: f64, lng: f64, resolution: u8) -> Result<CellId> {
        // h3o 只擋非有限值，超出經緯度範圍的座標要自己拒絕
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(HarvestError::grid(format!(
                "coordinate ({}, {}) is out of range",
                lat, lng
            )));
        }
        let point = LatLng::new(lat, lng)
            .map_err(|e| HarvestError::grid(format!("invalid coordinate ({}, {}): {}", lat, lng, e)))?;
        Ok(CellId::new(point.to_cell(Self::resolution(resolution)?).to_string()))
    }

    /// 以該解析度的平均邊長推算正六邊形的內切圓半徑
    fn expected_in_radius_m(&self, resolution: u8) -> Result<f64> {
        let edge_m = Self::resolution(resolution)?.edge_length_km() * 1000.0;
        Ok(edge_m * 3f64.sqrt() / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coverage::CoveragePlanner;
    use crate::domain::model::{Cell, ProbeRole};
    use crate::utils::geo::haversine_m;
    use std::sync::Arc;

    const SAN_FRANCISCO: (f64, f64) = (37.7749, -122.4194);

    fn cell_at(resolution: u8) -> CellId {
        H3Grid
            .point_to_cell(SAN_FRANCISCO.0, SAN_FRANCISCO.1, resolution)
            .unwrap()
    }

    fn materialize(grid: &H3Grid, id: &CellId) -> Cell {
        let resolution = grid.cell_resolution(id).unwrap();
        Cell::top_level(id.clone(), resolution).with_geometry(
            grid.cell_to_center(id).unwrap(),
            grid.cell_to_boundary(id).unwrap(),
        )
    }

    #[test]
    fn test_center_and_boundary() {
        let grid = H3Grid::new();
        let id = cell_at(7);
        assert_eq!(id.as_str().len(), 15);
        assert_eq!(grid.cell_resolution(&id).unwrap(), 7);

        let center = grid.cell_to_center(&id).unwrap();
        assert!(haversine_m(center, GeoPoint::new(SAN_FRANCISCO.0, SAN_FRANCISCO.1)) < 2500.0);
        // 中心點必須落回同一個格子
        assert_eq!(grid.point_to_cell(center.lat, center.lng, 7).unwrap(), id);

        let boundary = grid.cell_to_boundary(&id).unwrap();
        assert_eq!(boundary.len(), 6);
    }

    #[test]
    fn test_children_round_trip_to_parent() {
        let grid = H3Grid::new();
        let id = cell_at(7);
        let parent = CellIndex::from_str(id.as_str()).unwrap();

        let children = grid.cell_to_children(&id, 8).unwrap();
        assert_eq!(children.len(), 7);
        for child in &children {
            let index = CellIndex::from_str(child.as_str()).unwrap();
            assert_eq!(index.parent(Resolution::Seven), Some(parent));
            assert_eq!(grid.cell_resolution(child).unwrap(), 8);
        }

        assert_eq!(grid.cell_to_children(&id, 9).unwrap().len(), 49);
        assert!(grid.cell_to_children(&id, 7).is_err());
    }

    #[test]
    fn test_invalid_inputs_are_grid_errors() {
        let grid = H3Grid::new();
        assert!(matches!(
            grid.cell_to_center(&CellId::new("not-a-cell")),
            Err(HarvestError::Grid { .. })
        ));
        assert!(grid.point_to_cell(123.0, 0.0, 7).is_err());
        assert!(grid.point_to_cell(-90.5, 0.0, 7).is_err());
        assert!(grid.point_to_cell(10.0, 181.0, 7).is_err());
        assert!(grid.point_to_cell(f64::NAN, 0.0, 7).is_err());
        // 邊界值本身有效
        assert!(grid.point_to_cell(90.0, 180.0, 7).is_ok());
        assert!(grid.expected_in_radius_m(16).is_err());
    }

    #[test]
    fn test_in_radius_shrinks_with_resolution() {
        let grid = H3Grid::new();
        let r7 = grid.expected_in_radius_m(7).unwrap();
        let r8 = grid.expected_in_radius_m(8).unwrap();
        assert!(r7 > 1100.0 && r7 < 1300.0, "r7 = {}", r7);
        assert!(r8 < r7 / 2.0);
    }

    #[test]
    fn test_planner_probe_counts_on_real_cells() {
        let grid = Arc::new(H3Grid::new());
        let planner = CoveragePlanner::new(Arc::clone(&grid));

        let medium = planner.plan(&materialize(&grid, &cell_at(7)));
        assert_eq!(medium.probes.len(), 3);
        assert_eq!(medium.count(ProbeRole::Corner), 2);

        let large = planner.plan(&materialize(&grid, &cell_at(6)));
        assert_eq!(large.probes.len(), 6);
        assert_eq!(large.count(ProbeRole::Edge), 2);

        let small = planner.plan(&materialize(&grid, &cell_at(8)));
        assert_eq!(small.probes.len(), 1);
        assert!(!small.fallback);
    }
}
