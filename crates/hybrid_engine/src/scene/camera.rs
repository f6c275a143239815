//! Scene camera

use crate::foundation::math::{utils, Mat4, Mat4Ext, Vec3};

/// Perspective camera described by a position and Euler angles
///
/// Angles are `(pitch, yaw, roll)` in radians, applied as yaw about +Y, then
/// pitch about +X, then roll about +Z. With all angles zero the camera looks
/// down -Z with +Y up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    position: Vec3,
    euler_angles: Vec3,
    fov: f32,
    near: f32,
    far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            euler_angles: Vec3::zeros(),
            fov: utils::deg_to_rad(45.0),
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Camera at `position` with the given `(pitch, yaw, roll)`
    pub fn new(position: Vec3, euler_angles: Vec3) -> Self {
        Self {
            position,
            euler_angles,
            ..Self::default()
        }
    }

    /// Camera-to-world transform
    pub fn inverse_view(&self) -> Mat4 {
        let [pitch, yaw, roll]: [f32; 3] = self.euler_angles.into();
        Mat4::new_translation(&self.position) * Mat4::rotation_y(yaw) * Mat4::rotation_x(pitch) * Mat4::rotation_z(roll)
    }

    /// World-to-camera transform
    pub fn view(&self) -> Mat4 {
        // Rigid transform: invert as transpose of the rotation.
        let [pitch, yaw, roll]: [f32; 3] = self.euler_angles.into();
        let rotation = Mat4::rotation_y(yaw) * Mat4::rotation_x(pitch) * Mat4::rotation_z(roll);
        rotation.transpose() * Mat4::new_translation(&-self.position)
    }

    /// Vulkan clip-space projection for the given aspect ratio
    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_vk(self.fov, aspect, self.near, self.far)
    }

    /// Position
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Set the position
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    /// `(pitch, yaw, roll)` in radians
    pub fn euler_angles(&self) -> Vec3 {
        self.euler_angles
    }

    /// Set `(pitch, yaw, roll)` in radians
    pub fn set_euler_angles(&mut self, euler_angles: Vec3) {
        self.euler_angles = euler_angles;
    }

    /// Vertical field of view in radians
    pub fn fov(&self) -> f32 {
        self.fov
    }

    /// Set the vertical field of view in radians
    pub fn set_fov(&mut self, fov: f32) {
        self.fov = fov;
    }

    /// Near plane distance
    pub fn near(&self) -> f32 {
        self.near
    }

    /// Set the near plane distance
    pub fn set_near(&mut self, near: f32) {
        self.near = near;
    }

    /// Far plane distance
    pub fn far(&self) -> f32 {
        self.far
    }

    /// Set the far plane distance
    pub fn set_far(&mut self, far: f32) {
        self.far = far;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::constants::HALF_PI;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let camera = Camera::default();
        assert_relative_eq!(camera.fov(), utils::deg_to_rad(45.0));
        assert_relative_eq!(camera.near(), 0.1);
        assert_relative_eq!(camera.far(), 1000.0);
    }

    #[test]
    fn test_view_inverts_inverse_view() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.3, -1.1, 0.2));
        let product = camera.view() * camera.inverse_view();
        assert_relative_eq!(product, Mat4::identity(), epsilon = 1e-5);
    }

    #[test]
    fn test_yaw_turns_view_direction() {
        let camera = Camera::new(Vec3::zeros(), Vec3::new(0.0, HALF_PI, 0.0));
        let forward = camera.inverse_view() * Vec4::new(0.0, 0.0, -1.0, 0.0);
        assert_relative_eq!(forward.x, -1.0, epsilon = 1e-5);
        assert_relative_eq!(forward.z, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_view_moves_camera_to_origin() {
        let camera = Camera::new(Vec3::new(0.0, 5.0, 10.0), Vec3::zeros());
        let eye = camera.view() * Vec4::new(0.0, 5.0, 10.0, 1.0);
        assert_relative_eq!(eye, Vec4::new(0.0, 0.0, 0.0, 1.0), epsilon = 1e-5);
    }
}
