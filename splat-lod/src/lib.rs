pub mod bounds;
pub mod camera;
pub mod error;
pub mod grid_hc;
pub mod hc;
pub mod hierarchy;
pub mod octree;
pub mod splat;

pub use camera::{Camera, LodCamera};
pub use error::{LodError, Result};
pub use grid_hc::{BoundsParams, GridHc, GridHcParams};
pub use hc::{Hc, HcParams, MetricWeights};
pub use hierarchy::{Hierarchy, HierarchyConfig, HierarchyStats};
pub use octree::{Octree, OctreeParams};
pub use splat::{RawSplat, Splat, SplatSplit};
