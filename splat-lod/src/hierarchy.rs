use serde::{Deserialize, Serialize};

use crate::camera::LodCamera;
use crate::error::Result;
use crate::grid_hc::{GridHc, GridHcParams};
use crate::hc::{Hc, HcParams, MetricWeights};
use crate::octree::{Octree, OctreeParams};
use crate::splat::{compose, Splat, SplatSplit};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HierarchyConfig {
    Hc(HcParams),
    Octree(OctreeParams),
    GridHc(GridHcParams),
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        HierarchyConfig::GridHc(GridHcParams::default())
    }
}

impl HierarchyConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            HierarchyConfig::Hc(_) => "hc",
            HierarchyConfig::Octree(_) => "octree",
            HierarchyConfig::GridHc(_) => "grid_hc",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            HierarchyConfig::Hc(params) => params.validate(),
            HierarchyConfig::Octree(params) => params.validate(),
            HierarchyConfig::GridHc(params) => params.validate(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HierarchyStats {
    pub kind: &'static str,
    pub num_input: usize,
    pub num_splats: usize,
    pub num_roots: usize,
    pub num_cells: Option<usize>,
    pub max_depth: u32,
}

/// A built LOD hierarchy. Every variant exposes one flat splat array that
/// the index lists returned by the queries point into.
#[derive(Clone, Debug)]
pub enum Hierarchy {
    Hc(Hc),
    Octree(Octree),
    GridHc(GridHc),
}

impl Hierarchy {
    pub fn build(config: &HierarchyConfig, splits: &[SplatSplit]) -> Result<Self> {
        Ok(match config {
            HierarchyConfig::Hc(params) => Hierarchy::Hc(Hc::build(splits.iter().map(compose).collect(), params)?),
            HierarchyConfig::Octree(params) => Hierarchy::Octree(Octree::build(splits, params)?),
            HierarchyConfig::GridHc(params) => {
                let splats: Vec<Splat> = splits.iter().map(compose).collect();
                Hierarchy::GridHc(GridHc::build(&splats, params)?)
            }
        })
    }

    pub fn splats(&self) -> &[Splat] {
        match self {
            Hierarchy::Hc(hc) => hc.splats(),
            Hierarchy::Octree(octree) => octree.splats(),
            Hierarchy::GridHc(grid) => grid.splats(),
        }
    }

    /// For `Hc` `depth` is a budget of expanded merges shared by all roots,
    /// for `GridHc` the same budget applied to each cell, and for the octree
    /// a level of the tree.
    pub fn get_indices_depth(&self, depth: u32) -> Vec<u32> {
        match self {
            Hierarchy::Hc(hc) => hc.get_indices_depth(depth),
            Hierarchy::Octree(octree) => octree.get_indices_depth(depth),
            Hierarchy::GridHc(grid) => grid.get_indices_depth(depth),
        }
    }

    /// The octree reads `threshold` as a minimum screen area and ignores
    /// `weights`.
    pub fn get_indices(&self, camera: &impl LodCamera, threshold: f32, weights: &MetricWeights) -> Vec<u32> {
        match self {
            Hierarchy::Hc(hc) => hc.get_indices(camera, threshold, weights),
            Hierarchy::Octree(octree) => octree.get_indices(camera, threshold),
            Hierarchy::GridHc(grid) => grid.get_indices(camera, threshold, weights),
        }
    }

    pub fn stats(&self) -> HierarchyStats {
        match self {
            Hierarchy::Hc(hc) => HierarchyStats {
                kind: "hc",
                num_input: hc.num_leaves(),
                num_splats: hc.splats().len(),
                num_roots: hc.roots().len(),
                num_cells: None,
                max_depth: hc.nodes().iter().map(|n| n.depth).max().unwrap_or(0),
            },
            Hierarchy::Octree(octree) => HierarchyStats {
                kind: "octree",
                num_input: octree.nodes().first().map_or(0, |root| root.indices.len()),
                num_splats: octree.splats().len(),
                num_roots: octree.root().map_or(0, |_| 1),
                num_cells: None,
                max_depth: octree.nodes().iter().map(|n| n.depth).max().unwrap_or(0),
            },
            Hierarchy::GridHc(grid) => HierarchyStats {
                kind: "grid_hc",
                num_input: grid.cells().iter().map(|c| c.hc.num_leaves()).sum(),
                num_splats: grid.splats().len(),
                num_roots: grid.num_roots(),
                num_cells: Some(grid.cells().len()),
                max_depth: grid.cells().iter()
                    .flat_map(|c| c.hc.nodes().iter().map(|n| n.depth))
                    .max()
                    .unwrap_or(0),
            },
        }
    }
}
