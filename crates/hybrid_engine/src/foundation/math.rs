//! Math utilities and types
//!
//! Thin aliases over `nalgebra` plus the handful of conversions the GPU-facing
//! code needs (column arrays for uniforms, 3x4 rows for instance transforms).

pub use nalgebra::{Matrix3, Matrix4, Quaternion, Unit, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Math constants
pub mod constants {
    /// Pi constant
    pub const PI: f32 = std::f32::consts::PI;

    /// 2 * Pi
    pub const TAU: f32 = 2.0 * PI;

    /// Pi / 2
    pub const HALF_PI: f32 = PI * 0.5;

    /// Degrees to radians conversion factor
    pub const DEG_TO_RAD: f32 = PI / 180.0;
}

/// Math utility functions
pub mod utils {
    use super::constants;

    /// Convert degrees to radians
    pub fn deg_to_rad(degrees: f32) -> f32 {
        degrees * constants::DEG_TO_RAD
    }

    /// Wrap `value` into `[0, modulus)`.
    ///
    /// Unlike `%`, negative inputs land in the positive range, and the result
    /// is clamped below `modulus` so float rounding never yields `modulus` itself.
    pub fn wrap(value: f32, modulus: f32) -> f32 {
        let wrapped = value.rem_euclid(modulus);
        if wrapped >= modulus {
            0.0
        } else {
            wrapped
        }
    }
}

/// Extension trait for Mat4 with additional convenience methods
pub trait Mat4Ext {
    /// Create a rotation matrix around the X axis
    fn rotation_x(angle: f32) -> Mat4;

    /// Create a rotation matrix around the Y axis
    fn rotation_y(angle: f32) -> Mat4;

    /// Create a rotation matrix around the Z axis
    fn rotation_z(angle: f32) -> Mat4;

    /// Vulkan clip-space perspective projection (Y down, depth in `[0, 1]`)
    /// for a right-handed view space looking down -Z.
    fn perspective_vk(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Column-major array layout expected by std140/std430 `mat4`.
    fn to_cols_array(&self) -> [[f32; 4]; 4];

    /// First three rows, row-major, as used by acceleration-structure instances.
    fn to_rows_3x4(&self) -> [f32; 12];
}

impl Mat4Ext for Mat4 {
    fn rotation_x(angle: f32) -> Mat4 {
        Mat4::from_axis_angle(&Vec3::x_axis(), angle)
    }

    fn rotation_y(angle: f32) -> Mat4 {
        Mat4::from_axis_angle(&Vec3::y_axis(), angle)
    }

    fn rotation_z(angle: f32) -> Mat4 {
        Mat4::from_axis_angle(&Vec3::z_axis(), angle)
    }

    fn perspective_vk(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        // P * X where X flips Y and Z so a right-handed, Y-up view space lands in
        // Vulkan's Y-down, Z-forward clip space.
        let tan_half_fovy = (fov_y * 0.5).tan();

        let mut result = Mat4::zeros();
        result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        result[(1, 1)] = -1.0 / tan_half_fovy;
        result[(2, 2)] = far / (near - far);
        result[(2, 3)] = -(near * far) / (far - near);
        result[(3, 2)] = -1.0;
        result
    }

    fn to_cols_array(&self) -> [[f32; 4]; 4] {
        (*self).into()
    }

    fn to_rows_3x4(&self) -> [f32; 12] {
        let m = self;
        [
            m[(0, 0)], m[(0, 1)], m[(0, 2)], m[(0, 3)],
            m[(1, 0)], m[(1, 1)], m[(1, 2)], m[(1, 3)],
            m[(2, 0)], m[(2, 1)], m[(2, 2)], m[(2, 3)],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_wrap_stays_in_unit_range() {
        assert_relative_eq!(utils::wrap(1.25, 1.0), 0.25);
        assert_relative_eq!(utils::wrap(-0.25, 1.0), 0.75);
        assert!(utils::wrap(0.999_999_9, 1.0) < 1.0);
        assert_relative_eq!(utils::wrap(1.0, 1.0), 0.0);
    }

    #[test]
    fn test_perspective_maps_near_and_far_to_vulkan_depth() {
        let proj = Mat4::perspective_vk(utils::deg_to_rad(45.0), 16.0 / 9.0, 0.1, 100.0);

        let near = proj * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -100.0, 1.0);

        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_perspective_flips_y() {
        let proj = Mat4::perspective_vk(utils::deg_to_rad(90.0), 1.0, 0.1, 10.0);
        let up = proj * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(up.y / up.w < 0.0);
    }

    #[test]
    fn test_rows_3x4_carry_translation() {
        let m = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        let rows = m.to_rows_3x4();
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows[7], 2.0);
        assert_eq!(rows[11], 3.0);
        assert_eq!(rows[0], 1.0);
    }

    #[test]
    fn test_cols_array_is_column_major() {
        let m = Mat4::new_translation(&Vec3::new(4.0, 5.0, 6.0));
        let cols = m.to_cols_array();
        assert_eq!(cols[3], [4.0, 5.0, 6.0, 1.0]);
    }
}
