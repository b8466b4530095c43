//! Render environments: one camera + scene + light/instance set per
//! batch slot.
//!
//! An environment starts with one instance per scene mesh (the scene's
//! default instantiation) and mutates freely between renders. Any
//! mutation marks the TLAS dirty; the orchestrator rebuilds it exactly
//! once per render call while the flag is set and never when it is
//! clean, even across frames.

use crate::accel::{build_bvh, pack_inverse_rows, transform_aabb, Aabb, BvhNode, PackedInstance};
use crate::camera::Camera;
use crate::config::limits;
use crate::error::{RenderError, RenderResult};
use crate::handle::EnvironmentHandle;
use crate::scene::Scene;

use glam::{Mat4, Quat, Vec3};
use rand::Rng;
use std::sync::Arc;

pub const INSTANCE_VISIBLE: u32 = 1 << 0;

/// Per-environment parameters drawn once at creation when randomization
/// is enabled; identity otherwise.
#[derive(Debug, Clone, Copy)]
pub struct DomainRandomization {
    pub env_map_rotation: Quat,
    pub light_filter: Vec3,
    pub env_map_idx: u32,
}

impl Default for DomainRandomization {
    fn default() -> Self {
        Self {
            env_map_rotation: Quat::IDENTITY,
            light_filter: Vec3::ONE,
            env_map_idx: 0,
        }
    }
}

impl DomainRandomization {
    pub fn draw<R: Rng>(rng: &mut R, num_env_maps: u32) -> Self {
        let yaw = rng.gen_range(0.0..std::f32::consts::TAU);
        Self {
            env_map_rotation: Quat::from_rotation_y(yaw),
            light_filter: Vec3::new(
                rng.gen_range(0.7..1.3),
                rng.gen_range(0.7..1.3),
                rng.gen_range(0.7..1.3),
            ),
            env_map_idx: rng.gen_range(0..num_env_maps.max(1)),
        }
    }
}

/// TLAS nodes plus the instance records their leaves index. Instances
/// are emitted in leaf order, so leaf ranges address them directly.
#[derive(Debug, Clone, Default)]
pub struct TlasData {
    pub nodes: Vec<BvhNode>,
    pub instances: Vec<PackedInstance>,
}

pub struct Environment {
    backend: EnvironmentHandle,
    scene: Arc<Scene>,
    camera: Camera,
    prev_camera: Camera,
    transforms: Vec<Mat4>,
    material_indices: Vec<u32>,
    instance_flags: Vec<u32>,
    instance_meshes: Vec<u32>,
    randomization: DomainRandomization,
    tlas: TlasData,
    tlas_dirty: bool,
    tlas_builds: u64,
}

impl Environment {
    pub(crate) fn new(backend: EnvironmentHandle, scene: Arc<Scene>, camera: Camera) -> Self {
        let num_meshes = scene.num_meshes() as usize;
        let instance_meshes: Vec<u32> = (0..num_meshes as u32).collect();
        let material_indices = scene.mesh_materials().to_vec();
        Self {
            backend,
            scene,
            camera,
            prev_camera: camera,
            transforms: vec![Mat4::IDENTITY; num_meshes],
            material_indices,
            instance_flags: vec![INSTANCE_VISIBLE; num_meshes],
            instance_meshes,
            randomization: DomainRandomization::default(),
            tlas: TlasData::default(),
            tlas_dirty: true,
            tlas_builds: 0,
        }
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn previous_camera(&self) -> &Camera {
        &self.prev_camera
    }

    /// Save the current camera as last frame's before packing overwrites
    /// it; temporal reuse reads the saved one.
    pub(crate) fn snapshot_camera(&mut self) {
        self.prev_camera = self.camera;
    }

    pub fn move_camera(&mut self, camera: Camera) {
        self.camera = camera;
        self.tlas_dirty = true;
    }

    pub fn add_light(&mut self, position: Vec3, color: Vec3) -> u32 {
        self.tlas_dirty = true;
        self.backend.add_light(position, color)
    }

    /// Removes by index; the last light takes the removed slot.
    pub fn remove_light(&mut self, idx: u32) {
        self.tlas_dirty = true;
        self.backend.remove_light(idx);
    }

    pub fn num_instances(&self) -> u32 {
        self.transforms.len() as u32
    }

    pub fn add_instance(
        &mut self,
        mesh_idx: u32,
        material_idx: u32,
        transform: Mat4,
    ) -> RenderResult<u32> {
        if mesh_idx >= self.scene.num_meshes() {
            return Err(RenderError::render(format!(
                "instance references mesh {mesh_idx} of {}",
                self.scene.num_meshes()
            )));
        }
        if self.transforms.len() as u32 >= limits::MAX_INSTANCES {
            return Err(RenderError::capacity(format!(
                "environment instance count at {}",
                limits::MAX_INSTANCES
            )));
        }
        let idx = self.transforms.len() as u32;
        self.transforms.push(transform);
        self.material_indices.push(material_idx);
        self.instance_flags.push(INSTANCE_VISIBLE);
        self.instance_meshes.push(mesh_idx);
        self.tlas_dirty = true;
        Ok(idx)
    }

    pub fn set_transform(&mut self, instance_idx: u32, transform: Mat4) {
        self.transforms[instance_idx as usize] = transform;
        self.tlas_dirty = true;
    }

    pub fn set_instance_material(&mut self, instance_idx: u32, material_idx: u32) {
        self.material_indices[instance_idx as usize] = material_idx;
        self.tlas_dirty = true;
    }

    pub fn set_instance_visibility(&mut self, instance_idx: u32, visible: bool) {
        let flags = &mut self.instance_flags[instance_idx as usize];
        if visible {
            *flags |= INSTANCE_VISIBLE;
        } else {
            *flags &= !INSTANCE_VISIBLE;
        }
        self.tlas_dirty = true;
    }

    pub fn transforms(&self) -> &[Mat4] {
        &self.transforms
    }

    pub fn material_indices(&self) -> &[u32] {
        &self.material_indices
    }

    pub fn randomization(&self) -> &DomainRandomization {
        &self.randomization
    }

    pub(crate) fn set_randomization(&mut self, randomization: DomainRandomization) {
        self.randomization = randomization;
    }

    pub(crate) fn backend(&self) -> &EnvironmentHandle {
        &self.backend
    }

    pub(crate) fn backend_mut(&mut self) -> &mut EnvironmentHandle {
        &mut self.backend
    }

    pub fn is_dirty(&self) -> bool {
        self.tlas_dirty
    }

    /// Current TLAS, rebuilt only while the dirty flag is set.
    pub(crate) fn tlas(&mut self) -> &TlasData {
        if self.tlas_dirty {
            self.rebuild_tlas();
            self.tlas_dirty = false;
            self.tlas_builds += 1;
        }
        &self.tlas
    }

    #[cfg(test)]
    fn tlas_build_count(&self) -> u64 {
        self.tlas_builds
    }

    fn rebuild_tlas(&mut self) {
        let mesh_aabbs = self.scene.mesh_aabbs();
        let blas_roots = self.scene.mesh_blas_roots();

        let world_aabbs: Vec<Aabb> = self
            .instance_meshes
            .iter()
            .zip(&self.transforms)
            .map(|(&mesh, transform)| {
                transform_aabb(&mesh_aabbs[mesh as usize], transform)
            })
            .collect();

        let bvh = build_bvh(&world_aabbs);
        let instances = bvh
            .prim_order
            .iter()
            .map(|&prim| {
                let i = prim as usize;
                let mesh = self.instance_meshes[i];
                PackedInstance {
                    inv_transform: pack_inverse_rows(&self.transforms[i]),
                    mesh_idx: mesh,
                    blas_root: blas_roots[mesh as usize],
                    material_idx: self.material_indices[i],
                    flags: self.instance_flags[i],
                }
            })
            .collect();

        self.tlas = TlasData {
            nodes: bvh.nodes,
            instances,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::EnvironmentBackend;

    struct NullLights;

    impl EnvironmentBackend for NullLights {
        fn add_light(&mut self, _position: Vec3, _color: Vec3) -> u32 {
            0
        }
        fn remove_light(&mut self, _idx: u32) {}
    }

    fn test_env() -> Environment {
        let scene = Arc::new(crate::scene::Scene::detached(
            Aabb::new([0.0; 3], [10.0; 3]),
            vec![Aabb::new([-1.0; 3], [1.0; 3]), Aabb::new([-2.0; 3], [2.0; 3])],
            vec![0, 5],
            vec![0, 1],
        ));
        Environment::new(EnvironmentHandle::wrap(NullLights), scene, Camera::default())
    }

    #[test]
    fn tlas_rebuilds_once_while_dirty() {
        let mut env = test_env();
        assert!(env.is_dirty());
        env.tlas();
        assert_eq!(env.tlas_build_count(), 1);
        assert!(!env.is_dirty());

        // clean: repeated renders reuse the build
        env.tlas();
        env.tlas();
        assert_eq!(env.tlas_build_count(), 1);

        env.set_transform(0, Mat4::from_translation(Vec3::X));
        assert!(env.is_dirty());
        env.tlas();
        env.tlas();
        assert_eq!(env.tlas_build_count(), 2);
    }

    #[test]
    fn tlas_instances_follow_leaf_order() {
        let mut env = test_env();
        env.set_transform(1, Mat4::from_translation(Vec3::splat(100.0)));
        let tlas = env.tlas();
        assert_eq!(tlas.instances.len(), 2);
        let mut meshes: Vec<u32> = tlas.instances.iter().map(|i| i.mesh_idx).collect();
        meshes.sort_unstable();
        assert_eq!(meshes, vec![0, 1]);
        assert_eq!(tlas.instances.iter().map(|i| i.blas_root).max(), Some(5));
    }

    #[test]
    fn instance_bounds_reflect_transforms() {
        let mut env = test_env();
        env.set_transform(0, Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)));
        let tlas = env.tlas();
        assert!(tlas.nodes[0].aabb.max[0] >= 51.0);
    }

    #[test]
    fn add_instance_validates_mesh() {
        let mut env = test_env();
        assert!(env.add_instance(99, 0, Mat4::IDENTITY).is_err());
        let idx = env.add_instance(1, 0, Mat4::IDENTITY).unwrap();
        assert_eq!(idx, 2);
        assert!(env.is_dirty());
    }

    #[test]
    fn camera_snapshot_preserves_previous_frame() {
        let mut env = test_env();
        let first = Camera::look_at(Vec3::Z * 5.0, Vec3::ZERO, Vec3::Y, 60.0);
        env.move_camera(first);
        env.snapshot_camera();
        let second = Camera::look_at(Vec3::X * 5.0, Vec3::ZERO, Vec3::Y, 60.0);
        env.move_camera(second);
        assert_eq!(env.previous_camera(), &first);
        assert_eq!(env.camera(), &second);
    }
}
