//! Camera model and its packed GPU form.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Quat, Vec3, Vec4};

/// Right-handed camera basis. `view` points into the scene; `right` and
/// `up` complete the basis and are assumed orthonormal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub view: Vec3,
    pub up: Vec3,
    pub right: Vec3,
    /// tan(vertical_fov / 2).
    pub tan_fov: f32,
}

impl Camera {
    pub fn new(position: Vec3, view: Vec3, up: Vec3, fov_y_degrees: f32) -> Self {
        let view = view.normalize();
        let right = view.cross(up.normalize()).normalize();
        let up = right.cross(view);
        Self {
            position,
            view,
            up,
            right,
            tan_fov: (fov_y_degrees.to_radians() * 0.5).tan(),
        }
    }

    pub fn look_at(position: Vec3, target: Vec3, up: Vec3, fov_y_degrees: f32) -> Self {
        Self::new(position, target - position, up, fov_y_degrees)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 60.0)
    }
}

/// Camera as the trace kernel consumes it: a rotation quaternion packed
/// with position and tan-FOV. Field order is part of the parameter-buffer
/// wire contract.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PackedCamera {
    pub rotation: [f32; 4],
    pub pos_and_tan_fov: [f32; 4],
}

impl PackedCamera {
    pub fn pack(cam: &Camera) -> Self {
        // Basis columns are (right, -up, view): the kernel rotates
        // screen-space directions where +y points down the image.
        let rotation = Quat::from_mat3(&Mat3::from_cols(cam.right, -cam.up, cam.view));
        Self {
            rotation: [rotation.x, rotation.y, rotation.z, rotation.w],
            pos_and_tan_fov: Vec4::new(
                cam.position.x,
                cam.position.y,
                cam.position.z,
                cam.tan_fov,
            )
            .to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_builds_orthonormal_basis() {
        let cam = Camera::look_at(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, Vec3::Y, 60.0);
        assert!(cam.view.dot(cam.right).abs() < 1e-6);
        assert!(cam.view.dot(cam.up).abs() < 1e-6);
        assert!(cam.right.dot(cam.up).abs() < 1e-6);
        assert!((cam.view.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn packed_camera_keeps_position_and_fov() {
        let cam = Camera::look_at(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, Vec3::Y, 90.0);
        let packed = PackedCamera::pack(&cam);
        assert_eq!(packed.pos_and_tan_fov[0], 1.0);
        assert_eq!(packed.pos_and_tan_fov[1], 2.0);
        assert_eq!(packed.pos_and_tan_fov[2], 3.0);
        assert!((packed.pos_and_tan_fov[3] - 1.0).abs() < 1e-5);
        // Unit quaternion.
        let q = packed.rotation;
        let len2 = q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3];
        assert!((len2 - 1.0).abs() < 1e-5);
    }
}
