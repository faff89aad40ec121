use std::collections::VecDeque;

use glam::Vec3A;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::bounds::{Aabb, Bb};
use crate::camera::LodCamera;
use crate::error::{LodError, Result};
use crate::splat::{compose, merge_weighted, Splat, SplatSplit};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeParams {
    pub max_depth: u32,
    pub max_splats_per_node: usize,
}

impl Default for OctreeParams {
    fn default() -> Self {
        Self { max_depth: 10, max_splats_per_node: 1 }
    }
}

impl OctreeParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_splats_per_node == 0 {
            return Err(LodError::InvalidParams("max_splats_per_node must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct OctreeNode {
    pub depth: u32,
    pub aabb: Aabb,
    /// Input splats contained in this subtree.
    pub indices: Vec<u32>,
    pub children: SmallVec<[u32; 8]>,
}

impl OctreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn bb(&self) -> Bb {
        Bb::from_aabb(self.aabb.min, self.aabb.max)
    }
}

fn octant(center: Vec3A, point: Vec3A) -> usize {
    (point.x > center.x) as usize | ((point.y > center.y) as usize) << 1 | ((point.z > center.z) as usize) << 2
}

fn octant_aabb(parent: &Aabb, octant: usize) -> Aabb {
    let center = parent.center();
    let pick = |bit: usize, lo: f32, mid: f32, hi: f32| if octant & bit != 0 { (mid, hi) } else { (lo, mid) };
    let (x0, x1) = pick(1, parent.min.x, center.x, parent.max.x);
    let (y0, y1) = pick(2, parent.min.y, center.y, parent.max.y);
    let (z0, z1) = pick(4, parent.min.z, center.z, parent.max.z);
    Aabb { min: Vec3A::new(x0, y0, z0), max: Vec3A::new(x1, y1, z1) }
}

/// Octree over decoded splats. Node `i` is represented by `splats[i]` and
/// nodes are stored parents first, in breadth-first order.
#[derive(Clone, Debug, Default)]
pub struct Octree {
    pub params: OctreeParams,
    nodes: Vec<OctreeNode>,
    splats: Vec<Splat>,
}

impl Octree {
    pub fn build(splits: &[SplatSplit], params: &OctreeParams) -> Result<Self> {
        params.validate()?;
        if let Some((splat, split)) = splits.iter().enumerate().find(|(_, s)| !s.position.is_finite()) {
            return Err(LodError::NonFinitePosition { splat, position: split.position.to_array() });
        }
        if splits.is_empty() {
            return Ok(Self { params: *params, ..Default::default() });
        }

        let nodes = Self::split(splits, params);
        let split_count = nodes.len();
        let nodes = Self::collapse(nodes);
        debug!("octree::build: {} nodes split, {} after collapse", split_count, nodes.len());

        let splats = Self::generate(splits, &nodes);
        info!("octree::build: {} splats -> {} nodes", splits.len(), nodes.len());
        Ok(Self { params: *params, nodes, splats })
    }

    fn split(splits: &[SplatSplit], params: &OctreeParams) -> Vec<OctreeNode> {
        let aabb = Aabb::from_points(splits.iter().map(|s| s.position)).cube();
        let mut nodes = vec![OctreeNode {
            depth: 0,
            aabb,
            indices: (0..splits.len() as u32).collect(),
            children: SmallVec::new(),
        }];

        let mut frontier = VecDeque::from([0usize]);
        while let Some(index) = frontier.pop_front() {
            let node = &nodes[index];
            if node.depth >= params.max_depth || node.indices.len() <= params.max_splats_per_node {
                continue;
            }
            // Coincident splats never separate
            let first = splits[node.indices[0] as usize].position;
            if node.indices.iter().all(|&i| splits[i as usize].position == first) {
                continue;
            }

            let center = node.aabb.center();
            let mut buckets: [Vec<u32>; 8] = Default::default();
            for &i in node.indices.iter() {
                buckets[octant(center, splits[i as usize].position)].push(i);
            }

            let (depth, parent_aabb) = (node.depth, node.aabb);
            for (oct, bucket) in buckets.into_iter().enumerate() {
                if bucket.is_empty() {
                    continue;
                }
                let child = nodes.len();
                nodes.push(OctreeNode {
                    depth: depth + 1,
                    aabb: octant_aabb(&parent_aabb, oct),
                    indices: bucket,
                    children: SmallVec::new(),
                });
                nodes[index].children.push(child as u32);
                frontier.push_back(child);
            }
        }
        nodes
    }

    /// Replaces every single-child node by its child, then renumbers the
    /// surviving nodes in breadth-first order.
    fn collapse(mut nodes: Vec<OctreeNode>) -> Vec<OctreeNode> {
        let mut order = vec![0usize];
        let mut head = 0;
        while head < order.len() {
            let index = order[head];
            while nodes[index].children.len() == 1 {
                let child = nodes[index].children[0] as usize;
                let indices = std::mem::take(&mut nodes[child].indices);
                let children = std::mem::take(&mut nodes[child].children);
                nodes[index] = OctreeNode { depth: nodes[child].depth, aabb: nodes[child].aabb, indices, children };
            }
            order.extend(nodes[index].children.iter().map(|&c| c as usize));
            head += 1;
        }

        let mut remap = vec![u32::MAX; nodes.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new as u32;
        }
        order.iter().map(|&old| {
            let node = &mut nodes[old];
            OctreeNode {
                depth: node.depth,
                aabb: node.aabb,
                indices: std::mem::take(&mut node.indices),
                children: node.children.iter().map(|&c| remap[c as usize]).collect(),
            }
        }).collect()
    }

    fn generate(splits: &[SplatSplit], nodes: &[OctreeNode]) -> Vec<Splat> {
        let mut splats = vec![Splat::default(); nodes.len()];
        let mut mass = vec![0.0f32; nodes.len()];

        for (index, node) in nodes.iter().enumerate().rev() {
            let (members, weights): (SmallVec<[Splat; 8]>, SmallVec<[f32; 8]>) = if node.is_leaf() {
                node.indices.iter().map(|&i| {
                    let split = &splits[i as usize];
                    (compose(split), split.weight())
                }).unzip()
            } else {
                node.children.iter().map(|&c| (splats[c as usize], mass[c as usize])).unzip()
            };
            splats[index] = merge_weighted(&members, &weights);
            mass[index] = weights.iter().sum();
        }
        splats
    }

    pub fn root(&self) -> Option<u32> {
        if self.nodes.is_empty() { None } else { Some(0) }
    }

    pub fn nodes(&self) -> &[OctreeNode] { &self.nodes }

    pub fn splats(&self) -> &[Splat] { &self.splats }

    fn cut(&self, mut emit: impl FnMut(&OctreeNode) -> bool) -> Vec<u32> {
        let mut indices = Vec::new();
        let mut frontier: VecDeque<u32> = self.root().into_iter().collect();
        while let Some(index) = frontier.pop_front() {
            let node = &self.nodes[index as usize];
            if node.is_leaf() || emit(node) {
                indices.push(index);
            } else {
                frontier.extend(node.children.iter().copied());
            }
        }
        indices
    }

    /// Stops at nodes whose projected box covers less than `min_screen_area`
    /// of normalized device coordinates.
    pub fn get_indices(&self, camera: &impl LodCamera, min_screen_area: f32) -> Vec<u32> {
        self.cut(|node| node.bb().screen_area(camera) < min_screen_area)
    }

    pub fn get_indices_depth(&self, depth: u32) -> Vec<u32> {
        self.cut(|node| node.depth >= depth)
    }
}
