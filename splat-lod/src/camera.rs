use glam::{Mat4, Vec3, Vec3A};

/// What LOD selection needs to know about the viewer.
pub trait LodCamera {
    fn position(&self) -> Vec3A;
    fn view_proj(&self) -> Mat4;
}

/// Perspective camera with OpenGL clip conventions.
#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub world: Mat4,
    pub fov_y_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            world: Mat4::IDENTITY,
            fov_y_degrees: 45.0,
            aspect: 1.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera {
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        Self { world: Mat4::look_at_rh(eye, target, up).inverse(), ..Default::default() }
    }

    pub fn view(&self) -> Mat4 { self.world.inverse() }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y_degrees.to_radians(), self.aspect, self.near, self.far)
    }
}

impl LodCamera for Camera {
    fn position(&self) -> Vec3A { Vec3A::from(self.world.w_axis.truncate()) }

    fn view_proj(&self) -> Mat4 { self.projection() * self.view() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_places_camera_at_eye() {
        let camera = Camera::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!(camera.position().abs_diff_eq(Vec3A::new(0.0, 0.0, 5.0), 1.0e-5));
    }

    #[test]
    fn target_projects_to_screen_center() {
        let camera = Camera::look_at(Vec3::new(3.0, 1.0, 4.0), Vec3::new(0.5, 0.0, 0.0), Vec3::Y);
        let clip = camera.view_proj() * Vec3::new(0.5, 0.0, 0.0).extend(1.0);
        assert!(clip.w > 0.0);
        assert!((clip.x / clip.w).abs() < 1.0e-5);
        assert!((clip.y / clip.w).abs() < 1.0e-5);
    }
}
