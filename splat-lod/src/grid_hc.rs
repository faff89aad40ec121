use ahash::AHashMap;
use glam::Vec3A;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bounds::Aabb;
use crate::camera::LodCamera;
use crate::error::{LodError, Result};
use crate::hc::{Hc, HcParams, MetricWeights};
use crate::splat::Splat;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundsParams {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridHcParams {
    pub subdivisions: [u32; 3],
    /// Grid extent. Derived from the splat positions when absent.
    pub bounds: Option<BoundsParams>,
    pub hc: HcParams,
}

impl Default for GridHcParams {
    fn default() -> Self {
        Self { subdivisions: [20; 3], bounds: None, hc: HcParams::default() }
    }
}

impl GridHcParams {
    pub fn validate(&self) -> Result<()> {
        if self.subdivisions.contains(&0) {
            return Err(LodError::InvalidParams(format!("subdivisions must be positive, got {:?}", self.subdivisions)));
        }
        if let Some(bounds) = &self.bounds {
            let valid = (0..3).all(|d| bounds.min[d].is_finite() && bounds.max[d].is_finite() && bounds.min[d] <= bounds.max[d]);
            if !valid {
                return Err(LodError::InvalidParams(format!("invalid bounds {:?}..{:?}", bounds.min, bounds.max)));
            }
        }
        self.hc.validate()
    }
}

#[derive(Clone, Debug)]
pub struct GridCell {
    pub coord: [u32; 3],
    /// Start of this cell's nodes in the concatenated splat array.
    pub offset: u32,
    /// Input splat index of each of the cell's leaves.
    pub indices: Vec<u32>,
    pub hc: Hc,
}

/// Uniform grid with an independent [`Hc`] per non-empty cell.
#[derive(Clone, Debug, Default)]
pub struct GridHc {
    pub params: GridHcParams,
    cells: Vec<GridCell>,
    splats: Vec<Splat>,
}

impl GridHc {
    pub fn build(splats: &[Splat], params: &GridHcParams) -> Result<Self> {
        params.validate()?;
        if let Some((splat, s)) = splats.iter().enumerate().find(|(_, s)| !s.center().is_finite()) {
            return Err(LodError::NonFinitePosition { splat, position: s.center().to_array() });
        }

        let aabb = match &params.bounds {
            Some(bounds) => Aabb { min: Vec3A::from_array(bounds.min), max: Vec3A::from_array(bounds.max) },
            None => Aabb::from_points(splats.iter().map(|s| s.center())),
        };
        let aabb = if aabb.is_empty() { Aabb { min: Vec3A::ZERO, max: Vec3A::ZERO } } else { aabb.cube() };
        let side = match aabb.extent().max_element() {
            side if side > 0.0 => side,
            _ => 1.0,
        };
        let divisions = Vec3A::from_array(params.subdivisions.map(|n| n as f32));
        let cell_size = 1.1 * side / divisions;
        let origin = aabb.min - 0.1 * side / divisions;

        let [nx, ny, _] = params.subdivisions.map(u64::from);
        let mut buckets: AHashMap<u64, Vec<u32>> = AHashMap::new();
        for (i, splat) in splats.iter().enumerate() {
            let position = splat.center();
            let cell = ((position - origin) / cell_size).floor().to_array().map(|c| c as i64);
            let inside = (0..3).all(|d| cell[d] >= 0 && cell[d] < params.subdivisions[d] as i64);
            if !inside {
                return Err(LodError::CellOutOfBounds {
                    splat: i,
                    position: position.to_array(),
                    cell,
                    subdivisions: params.subdivisions,
                });
            }
            let key = cell[0] as u64 + nx * (cell[1] as u64 + ny * cell[2] as u64);
            buckets.entry(key).or_default().push(i as u32);
        }

        let mut buckets: Vec<(u64, Vec<u32>)> = buckets.into_iter().collect();
        buckets.sort_unstable_by_key(|(key, _)| *key);
        debug!("grid_hc::build: {} splats in {} non-empty cells", splats.len(), buckets.len());

        let built = buckets.into_par_iter().map(|(key, indices)| -> Result<([u32; 3], Vec<u32>, Hc)> {
            let members = indices.iter().map(|&i| splats[i as usize]).collect();
            let hc = Hc::build(members, &params.hc)?;
            let coord = [(key % nx) as u32, (key / nx % ny) as u32, (key / (nx * ny)) as u32];
            Ok((coord, indices, hc))
        }).collect::<Result<Vec<_>>>()?;

        let mut cells = Vec::with_capacity(built.len());
        let mut flat = Vec::new();
        for (coord, indices, hc) in built {
            let offset = flat.len() as u32;
            flat.extend_from_slice(hc.splats());
            cells.push(GridCell { coord, offset, indices, hc });
        }

        info!("grid_hc::build: {} splats -> {} nodes in {} cells", splats.len(), flat.len(), cells.len());
        Ok(Self { params: *params, cells, splats: flat })
    }

    pub fn cells(&self) -> &[GridCell] { &self.cells }

    pub fn splats(&self) -> &[Splat] { &self.splats }

    pub fn num_roots(&self) -> usize {
        self.cells.iter().map(|cell| cell.hc.roots().len()).sum()
    }

    fn gather(&self, query: impl Fn(&Hc) -> Vec<u32>) -> Vec<u32> {
        self.cells.iter()
            .flat_map(|cell| query(&cell.hc).into_iter().map(move |i| i + cell.offset))
            .collect()
    }

    pub fn get_indices_depth(&self, budget: u32) -> Vec<u32> {
        self.gather(|hc| hc.get_indices_depth(budget))
    }

    pub fn get_indices(&self, camera: &impl LodCamera, threshold: f32, weights: &MetricWeights) -> Vec<u32> {
        self.gather(|hc| hc.get_indices(camera, threshold, weights))
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::camera::Camera;
    use crate::splat::tests::splat_at;

    fn scattered(count: usize, extent: f32) -> Vec<Splat> {
        (0..count).map(|i| {
            let t = i as f32;
            let position = [
                (t * 0.618_034).fract() * extent,
                (t * 0.414_213_6).fract() * extent,
                (t * 0.732_050_8).fract() * extent,
            ];
            splat_at(position, 0.3, [0.4, 0.5, 0.6, 0.9])
        }).collect()
    }

    fn params(n: u32) -> GridHcParams {
        GridHcParams { subdivisions: [n; 3], ..Default::default() }
    }

    #[test]
    fn every_splat_lands_in_exactly_one_cell() {
        let splats = scattered(200, 10.0);
        let grid = GridHc::build(&splats, &params(4)).unwrap();
        let mut seen: Vec<u32> = grid.cells().iter().flat_map(|c| c.indices.iter().copied()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
        assert!(grid.cells().len() > 1);
        assert!(grid.cells().iter().all(|c| c.coord.iter().all(|&x| x < 4)));
    }

    #[test]
    fn cells_are_concatenated_with_offsets() {
        let splats = scattered(120, 6.0);
        let grid = GridHc::build(&splats, &params(3)).unwrap();
        let mut expected = 0;
        for cell in grid.cells() {
            assert_eq!(cell.offset, expected);
            for (local, splat) in cell.hc.splats().iter().enumerate() {
                assert_eq!(grid.splats()[cell.offset as usize + local], *splat);
            }
            for (leaf, &input) in cell.indices.iter().enumerate() {
                assert_eq!(cell.hc.splats()[leaf], splats[input as usize]);
            }
            expected += cell.hc.splats().len() as u32;
        }
        assert_eq!(grid.splats().len() as u32, expected);
    }

    #[test]
    fn queries_concatenate_cell_queries() {
        let splats = scattered(150, 8.0);
        let grid = GridHc::build(&splats, &params(3)).unwrap();
        let camera = Camera::look_at(Vec3::new(4.0, 4.0, 20.0), Vec3::new(4.0, 4.0, 4.0), Vec3::Y);
        let weights = MetricWeights::default();

        for budget in [0, 1, 3, 1000] {
            let expected: Vec<u32> = grid.cells().iter()
                .flat_map(|c| c.hc.get_indices_depth(budget).into_iter().map(move |i| i + c.offset))
                .collect();
            assert_eq!(grid.get_indices_depth(budget), expected);
        }
        for threshold in [0.0, 0.01, f32::INFINITY] {
            let expected: Vec<u32> = grid.cells().iter()
                .flat_map(|c| c.hc.get_indices(&camera, threshold, &weights).into_iter().map(move |i| i + c.offset))
                .collect();
            assert_eq!(grid.get_indices(&camera, threshold, &weights), expected);
        }
        assert_eq!(grid.get_indices_depth(0).len(), grid.cells().len());
        assert_eq!(grid.get_indices_depth(u32::MAX).len(), 150);
    }

    #[test]
    fn cells_are_in_linear_index_order() {
        let grid = GridHc::build(&scattered(300, 5.0), &params(5)).unwrap();
        let keys: Vec<u32> = grid.cells().iter().map(|c| c.coord[0] + 5 * (c.coord[1] + 5 * c.coord[2])).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn splat_outside_explicit_bounds_is_an_error() {
        let mut splats = scattered(20, 1.0);
        splats.push(splat_at([5.0, 0.5, 0.5], 0.3, [0.4, 0.5, 0.6, 0.9]));
        let params = GridHcParams {
            subdivisions: [4; 3],
            bounds: Some(BoundsParams { min: [0.0; 3], max: [1.0; 3] }),
            ..Default::default()
        };
        match GridHc::build(&splats, &params) {
            Err(LodError::CellOutOfBounds { splat, cell, .. }) => {
                assert_eq!(splat, 20);
                assert!(cell[0] >= 4);
            }
            other => panic!("expected CellOutOfBounds, got {:?}", other.map(|g| g.cells().len())),
        }
    }

    #[test]
    fn boundary_splats_stay_inside() {
        let splats: Vec<Splat> = [[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [1.0, 0.0, 1.0]]
            .into_iter()
            .map(|p| splat_at(p, 0.3, [0.4, 0.5, 0.6, 0.9]))
            .collect();
        let grid = GridHc::build(&splats, &params(20)).unwrap();
        assert_eq!(grid.cells().len(), 3);
    }

    #[test]
    fn degenerate_inputs() {
        let empty = GridHc::build(&[], &GridHcParams::default()).unwrap();
        assert!(empty.cells().is_empty());
        assert!(empty.get_indices_depth(5).is_empty());

        let same: Vec<Splat> = (0..4).map(|_| splat_at([2.0, 2.0, 2.0], 0.3, [0.4, 0.5, 0.6, 0.9])).collect();
        let grid = GridHc::build(&same, &GridHcParams::default()).unwrap();
        assert_eq!(grid.cells().len(), 1);
        assert_eq!(grid.num_roots(), 1);

        let mut bad = scattered(4, 1.0);
        bad[2].transform.w_axis.y = f32::INFINITY;
        assert!(matches!(GridHc::build(&bad, &GridHcParams::default()), Err(LodError::NonFinitePosition { splat: 2, .. })));
        assert!(matches!(GridHc::build(&same, &params(0)), Err(LodError::InvalidParams(_))));
    }
}
