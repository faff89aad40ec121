use glam::{Mat4, Vec3, Vec3A};

use crate::camera::LodCamera;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3A,
    pub max: Vec3A,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: Vec3A::splat(f32::INFINITY),
            max: Vec3A::splat(f32::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3A>) -> Self {
        points.into_iter().fold(Aabb::empty(), |aabb, point| aabb.add_point(point))
    }

    pub fn extend(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn add_point(&self, point: Vec3A) -> Self {
        self.extend(&Aabb { min: point, max: point })
    }

    pub fn center(&self) -> Vec3A {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3A {
        self.max - self.min
    }

    /// Expands about the center to a cube with the longest side.
    pub fn cube(&self) -> Self {
        let half = Vec3A::splat(0.5 * self.extent().max_element());
        let center = self.center();
        Self { min: center - half, max: center + half }
    }
}

/// Box as an affine transform: translation is the center, the diagonal the size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bb {
    pub transform: Mat4,
}

impl Bb {
    pub fn from_aabb(min: Vec3A, max: Vec3A) -> Self {
        let size = Vec3::from(max - min);
        let center = Vec3::from((min + max) * 0.5);
        Self { transform: Mat4::from_scale_rotation_translation(size, glam::Quat::IDENTITY, center) }
    }

    pub fn center(&self) -> Vec3A {
        Vec3A::from(self.transform.w_axis.truncate())
    }

    pub fn size(&self) -> Vec3A {
        Vec3A::new(
            self.transform.x_axis.truncate().length(),
            self.transform.y_axis.truncate().length(),
            self.transform.z_axis.truncate().length(),
        )
    }

    pub fn min(&self) -> Vec3A { self.center() - self.size() * 0.5 }

    pub fn max(&self) -> Vec3A { self.center() + self.size() * 0.5 }

    pub fn corners(&self) -> [Vec3A; 8] {
        let half = self.size() * 0.5;
        let center = self.center();
        std::array::from_fn(|i| {
            let sign = Vec3A::new(
                if i & 1 != 0 { 1.0 } else { -1.0 },
                if i & 2 != 0 { 1.0 } else { -1.0 },
                if i & 4 != 0 { 1.0 } else { -1.0 },
            );
            center + sign * half
        })
    }

    /// Area of the NDC rectangle enclosing the corners in front of the eye.
    /// A box fully behind the eye has area 0.
    pub fn screen_area(&self, camera: &impl LodCamera) -> f32 {
        let view_proj = camera.view_proj();
        let mut min = [f32::INFINITY; 2];
        let mut max = [f32::NEG_INFINITY; 2];
        let mut visible = false;

        for corner in self.corners() {
            let clip = view_proj * corner.extend(1.0);
            if !(clip.w > 0.0) {
                continue;
            }
            visible = true;
            let ndc = [clip.x / clip.w, clip.y / clip.w];
            for d in 0..2 {
                min[d] = min[d].min(ndc[d]);
                max[d] = max[d].max(ndc[d]);
            }
        }

        if !visible {
            return 0.0;
        }
        let area = (max[0] - min[0]) * (max[1] - min[1]);
        if area.is_nan() { 0.0 } else { area }
    }
}
