use std::cmp::Reverse;
use std::collections::BinaryHeap;

use glam::Vec3A;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::LodCamera;
use crate::error::{LodError, Result};
use crate::splat::{divergence, merge_weighted, normalized_weights, Splat};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HcParams {
    /// Merge candidates costing this much or more are never enqueued.
    /// `None` leaves the cost unbounded.
    pub max_error: Option<f32>,
}

impl HcParams {
    pub fn with_max_error(max_error: f32) -> Self {
        Self { max_error: Some(max_error) }
    }

    pub fn ceiling(&self) -> f32 {
        self.max_error.unwrap_or(f32::INFINITY)
    }

    pub fn validate(&self) -> Result<()> {
        match self.max_error {
            Some(max_error) if max_error.is_nan() || max_error < 0.0 => {
                Err(LodError::InvalidParams(format!("max_error must be non-negative, got {}", max_error)))
            }
            _ => Ok(()),
        }
    }
}

/// Exponents of the adaptive refinement metric
/// `error^error * weight^weight / distance^distance`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub error: f32,
    pub weight: f32,
    pub distance: f32,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self { error: 1.0, weight: 1.0, distance: 2.0 }
    }
}

impl MetricWeights {
    pub fn metric(&self, error: f32, weight: f32, distance: f32) -> f32 {
        let distance = distance.max(1.0e-6);
        error.powf(self.error) * weight.powf(self.weight) / distance.powf(self.distance)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HcNode {
    pub depth: u32,
    pub error: f32,
    pub children: Option<[u32; 2]>,
}

impl HcNode {
    fn leaf() -> Self {
        Self { depth: 0, error: 0.0, children: None }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// Agglomerative merge tree. Node `i` is represented by `splats[i]`; the
/// first `num_leaves` nodes are the input splats.
#[derive(Clone, Debug, Default)]
pub struct Hc {
    pub params: HcParams,
    nodes: Vec<HcNode>,
    splats: Vec<Splat>,
    roots: Vec<u32>,
    num_leaves: usize,
}

type Candidate = Reverse<(OrderedFloat<f32>, u32, u32)>;

/// Merged splat and the weighted divergence of both inputs from it.
fn merge_candidate(a: &Splat, b: &Splat) -> (Splat, f32) {
    let weights = [a.weight(), b.weight()];
    let merged = merge_weighted(&[*a, *b], &weights);
    let normalized = normalized_weights(&weights);

    let div_a = divergence(a, &merged);
    let div_b = divergence(b, &merged);
    if !div_a.is_finite() || !div_b.is_finite() {
        return (merged, f32::INFINITY);
    }
    (merged, normalized[0] * div_a + normalized[1] * div_b)
}

fn push_candidate(splats: &[Splat], queue: &mut BinaryHeap<Candidate>, a: u32, b: u32, ceiling: f32) -> bool {
    let (_, cost) = merge_candidate(&splats[a as usize], &splats[b as usize]);
    if cost < ceiling {
        queue.push(Reverse((OrderedFloat(cost), a, b)));
        true
    } else {
        false
    }
}

impl Hc {
    pub fn build(splats: Vec<Splat>, params: &HcParams) -> Result<Self> {
        params.validate()?;
        let num_leaves = splats.len();
        let ceiling = params.ceiling();
        debug!("hc::build: num_leaves={}, ceiling={}", num_leaves, ceiling);

        let mut splats = splats;
        splats.reserve(num_leaves.saturating_sub(1));
        let mut nodes = Vec::with_capacity(splats.capacity());
        nodes.resize(num_leaves, HcNode::leaf());
        let mut processed = Vec::with_capacity(splats.capacity());
        processed.resize(num_leaves, false);
        let mut active: Vec<u32> = (0..num_leaves as u32).collect();

        let mut queue = BinaryHeap::new();
        let mut pruned = 0usize;
        for (i, &a) in active.iter().enumerate() {
            for &b in &active[(i + 1)..] {
                if !push_candidate(&splats, &mut queue, a, b, ceiling) {
                    pruned += 1;
                }
            }
        }
        debug!("hc::build: initial candidates={}, pruned={}", queue.len(), pruned);

        while let Some(Reverse((OrderedFloat(_cost), a, b))) = queue.pop() {
            if processed[a as usize] || processed[b as usize] {
                continue;
            }
            if a == b {
                return Err(LodError::InvariantViolation(format!("node {} selected as both children of a merge", a)));
            }

            processed[a as usize] = true;
            processed[b as usize] = true;
            active.retain(|&index| index != a && index != b);

            let (merged, error) = merge_candidate(&splats[a as usize], &splats[b as usize]);
            let index = splats.len() as u32;
            let depth = nodes[a as usize].depth.max(nodes[b as usize].depth) + 1;
            splats.push(merged);
            nodes.push(HcNode { depth, error, children: Some([a, b]) });
            processed.push(false);

            for &other in active.iter() {
                if !push_candidate(&splats, &mut queue, index, other, ceiling) {
                    pruned += 1;
                }
            }
            active.push(index);
        }

        if num_leaves > 0 && active.len() > 1 {
            warn!("hc::build: {} roots remain after merging, {} candidates pruned", active.len(), pruned);
        }
        info!("hc::build: {} splats -> {} nodes, {} roots", num_leaves, nodes.len(), active.len());

        Ok(Self { params: *params, nodes, splats, roots: active, num_leaves })
    }

    pub fn splats(&self) -> &[Splat] { &self.splats }

    pub fn nodes(&self) -> &[HcNode] { &self.nodes }

    pub fn roots(&self) -> &[u32] { &self.roots }

    pub fn num_leaves(&self) -> usize { self.num_leaves }

    pub fn num_merges(&self) -> usize { self.nodes.len() - self.num_leaves }

    fn root_stack(&self) -> Vec<u32> {
        self.roots.iter().rev().copied().collect()
    }

    /// Expands at most `budget` internal nodes, depth first from the roots.
    pub fn get_indices_depth(&self, budget: u32) -> Vec<u32> {
        let mut stack = self.root_stack();
        let mut remaining = budget;
        let mut indices = Vec::new();

        while let Some(index) = stack.pop() {
            match self.nodes[index as usize].children {
                Some([a, b]) if remaining > 0 => {
                    remaining -= 1;
                    stack.push(b);
                    stack.push(a);
                }
                _ => indices.push(index),
            }
        }
        indices
    }

    pub fn metric(&self, index: u32, origin: Vec3A, weights: &MetricWeights) -> f32 {
        let node = &self.nodes[index as usize];
        let splat = &self.splats[index as usize];
        weights.metric(node.error, splat.weight(), splat.center().distance(origin))
    }

    /// Refines every internal node whose metric reaches `threshold`.
    pub fn get_indices(&self, camera: &impl LodCamera, threshold: f32, weights: &MetricWeights) -> Vec<u32> {
        let origin = camera.position();
        let mut stack = self.root_stack();
        let mut indices = Vec::new();

        while let Some(index) = stack.pop() {
            match self.nodes[index as usize].children {
                Some([a, b]) if self.metric(index, origin, weights) >= threshold => {
                    stack.push(b);
                    stack.push(a);
                }
                _ => indices.push(index),
            }
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::camera::Camera;
    use crate::splat::tests::splat_at;

    fn line(count: usize, spacing: f32) -> Vec<Splat> {
        (0..count).map(|i| {
            let x = i as f32 * spacing + 0.01 * (i * i) as f32;
            splat_at([x, 0.0, 0.0], 0.5, [0.5, 0.5, 0.5, 1.0])
        }).collect()
    }

    fn sorted(mut indices: Vec<u32>) -> Vec<u32> {
        indices.sort_unstable();
        indices
    }

    #[test]
    fn builds_single_root_with_n_minus_one_merges() {
        let hc = Hc::build(line(9, 1.0), &HcParams::default()).unwrap();
        assert_eq!(hc.num_leaves(), 9);
        assert_eq!(hc.num_merges(), 8);
        assert_eq!(hc.roots().len(), 1);
        assert_eq!(hc.splats().len(), 17);
        assert_eq!(hc.roots()[0], 16);
    }

    #[test]
    fn node_depths_and_children_are_consistent() {
        let hc = Hc::build(line(12, 0.7), &HcParams::default()).unwrap();
        let mut parents = vec![0; hc.nodes().len()];
        for (index, node) in hc.nodes().iter().enumerate() {
            match node.children {
                None => {
                    assert_eq!(node.depth, 0);
                    assert_eq!(node.error, 0.0);
                }
                Some([a, b]) => {
                    assert_ne!(a, b);
                    assert!((a as usize) < index && (b as usize) < index);
                    let (da, db) = (hc.nodes()[a as usize].depth, hc.nodes()[b as usize].depth);
                    assert_eq!(node.depth, da.max(db) + 1);
                    assert!(node.error.is_finite() && node.error >= 0.0);
                    parents[a as usize] += 1;
                    parents[b as usize] += 1;
                }
            }
        }
        for (index, &count) in parents.iter().enumerate() {
            let expected = if hc.roots().contains(&(index as u32)) { 0 } else { 1 };
            assert_eq!(count, expected, "node {} has {} parents", index, count);
        }
    }

    #[test]
    fn zero_ceiling_prunes_every_merge() {
        let hc = Hc::build(line(6, 1.0), &HcParams::with_max_error(0.0)).unwrap();
        assert_eq!(hc.num_merges(), 0);
        assert_eq!(sorted(hc.roots().to_vec()), (0..6).collect::<Vec<_>>());
        assert_eq!(sorted(hc.get_indices_depth(u32::MAX)), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn small_ceiling_leaves_a_forest() {
        let splats: Vec<Splat> = line(3, 1.0).into_iter()
            .chain(line(3, 1.0).into_iter().map(|s| splat_at((s.center() + Vec3A::new(0.0, 100.0, 0.0)).to_array(), 0.5, [0.5, 0.5, 0.5, 1.0])))
            .collect();
        let hc = Hc::build(splats, &HcParams::with_max_error(5.0)).unwrap();
        assert_eq!(hc.roots().len(), 2);
        assert_eq!(hc.num_merges(), 4);
    }

    #[test]
    fn depth_budget_is_shared_across_roots() {
        let splats: Vec<Splat> = line(3, 1.0).into_iter()
            .chain(line(3, 1.0).into_iter().map(|s| splat_at((s.center() + Vec3A::new(0.0, 100.0, 0.0)).to_array(), 0.5, [0.5, 0.5, 0.5, 1.0])))
            .collect();
        let hc = Hc::build(splats, &HcParams::with_max_error(5.0)).unwrap();
        assert_eq!(hc.roots().len(), 2);
        for budget in 0..=4 {
            assert_eq!(hc.get_indices_depth(budget).len(), 2 + budget as usize);
        }
        assert_eq!(hc.get_indices_depth(1)[2], hc.roots()[1]);
    }

    #[test]
    fn depth_budget_bounds() {
        let hc = Hc::build(line(7, 1.0), &HcParams::default()).unwrap();
        assert_eq!(hc.get_indices_depth(0), hc.roots().to_vec());
        assert_eq!(sorted(hc.get_indices_depth(1_000)), (0..7).collect::<Vec<_>>());

        let root = hc.roots()[0];
        let children = hc.nodes()[root as usize].children.unwrap();
        assert_eq!(hc.get_indices_depth(1), children.to_vec());
        for budget in 0..7 {
            assert_eq!(hc.get_indices_depth(budget).len(), budget as usize + 1);
        }
    }

    #[test]
    fn adjacent_pairs_merge_before_diagonals() {
        let splats: Vec<Splat> = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]]
            .into_iter()
            .map(|p| splat_at(p, 0.5, [0.5, 0.5, 0.5, 1.0]))
            .collect();
        let hc = Hc::build(splats, &HcParams::default()).unwrap();
        assert_eq!(hc.num_merges(), 3);

        let first = hc.nodes()[4].children.unwrap();
        let second = hc.nodes()[5].children.unwrap();
        let adjacent = [[0, 1], [2, 3], [0, 2], [1, 3]];
        for pair in [first, second] {
            let mut pair = pair;
            pair.sort_unstable();
            assert!(adjacent.contains(&pair), "{:?} is not an adjacent pair", pair);
        }
        assert_eq!(hc.nodes()[6].children.map(|mut c| { c.sort_unstable(); c }), Some([4, 5]));
    }

    #[test]
    fn singular_splats_are_never_merged() {
        let mut splats = line(3, 1.0);
        splats.push(splat_at([0.5, 0.0, 0.0], 0.0, [0.5, 0.5, 0.5, 1.0]));
        let hc = Hc::build(splats, &HcParams::default()).unwrap();
        assert_eq!(hc.num_merges(), 2);
        assert_eq!(hc.roots().len(), 2);
        assert!(hc.roots().contains(&3));
    }

    #[test]
    fn empty_and_single_inputs() {
        let empty = Hc::build(Vec::new(), &HcParams::default()).unwrap();
        assert!(empty.roots().is_empty());
        assert!(empty.get_indices_depth(10).is_empty());
        let camera = Camera::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!(empty.get_indices(&camera, 0.0, &MetricWeights::default()).is_empty());

        let single = Hc::build(line(1, 1.0), &HcParams::default()).unwrap();
        assert_eq!(single.get_indices_depth(3), vec![0]);
    }

    #[test]
    fn negative_ceiling_is_rejected() {
        assert!(matches!(Hc::build(line(2, 1.0), &HcParams::with_max_error(-1.0)), Err(LodError::InvalidParams(_))));
    }

    #[test]
    fn adaptive_query_threshold_extremes() {
        let hc = Hc::build(line(8, 1.0), &HcParams::default()).unwrap();
        let camera = Camera::look_at(Vec3::new(3.0, 0.0, 10.0), Vec3::new(3.0, 0.0, 0.0), Vec3::Y);
        let weights = MetricWeights::default();
        assert_eq!(sorted(hc.get_indices(&camera, 0.0, &weights)), (0..8).collect::<Vec<_>>());
        assert_eq!(hc.get_indices(&camera, f32::INFINITY, &weights), hc.roots().to_vec());
    }

    #[test]
    fn adaptive_query_refines_near_camera() {
        let mut splats = line(8, 1.0);
        splats.extend((0..8).map(|i| splat_at([i as f32 + 0.01 * (i * i) as f32, 200.0, 0.0], 0.5, [0.5, 0.5, 0.5, 1.0])));
        let hc = Hc::build(splats, &HcParams::default()).unwrap();
        let camera = Camera::look_at(Vec3::new(3.5, 0.0, 4.0), Vec3::new(3.5, 0.0, 0.0), Vec3::Y);
        let weights = MetricWeights::default();

        let root = hc.roots()[0];
        let far = hc.nodes()[root as usize].children.unwrap().into_iter()
            .find(|&child| hc.splats()[child as usize].center().y > 100.0)
            .unwrap();
        let threshold = 2.0 * hc.metric(far, camera.position(), &weights);
        let indices = hc.get_indices(&camera, threshold, &weights);

        assert!(indices.contains(&far));
        assert_eq!(indices.len(), 9);
        assert!(indices.iter().filter(|&&i| i != far).all(|&i| hc.nodes()[i as usize].is_leaf()));
    }

    #[test]
    fn lower_threshold_never_coarsens() {
        let hc = Hc::build(line(10, 0.8), &HcParams::default()).unwrap();
        let camera = Camera::look_at(Vec3::new(2.0, 1.0, 6.0), Vec3::new(4.0, 0.0, 0.0), Vec3::Y);
        let weights = MetricWeights::default();
        let mut previous = 0;
        for threshold in [10.0, 1.0, 0.1, 0.01, 0.001, 0.0] {
            let indices = hc.get_indices(&camera, threshold, &weights);
            for &index in &indices {
                let node = &hc.nodes()[index as usize];
                assert!(node.is_leaf() || hc.metric(index, camera.position(), &weights) < threshold);
            }
            assert!(indices.len() >= previous);
            previous = indices.len();
        }
        assert_eq!(previous, 10);
    }

    #[test]
    fn metric_defaults_to_inverse_square() {
        let weights = MetricWeights::default();
        assert!((weights.metric(2.0, 3.0, 2.0) - 1.5).abs() < 1.0e-6);
        assert!(weights.metric(1.0, 1.0, 0.0).is_finite());
    }
}
