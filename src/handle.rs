//! Type-erased backend handles.
//!
//! The public renderer dispatches every backend operation through plain
//! function pointers captured at construction, with the backend instance
//! behind an opaque pointer. A generic constructor monomorphizes one shim
//! per operation for the concrete backend type, so there is no trait
//! object or vtable indirection on the hot path and a second backend can
//! satisfy the same contract without touching the call sites.
//!
//! Handles are move-only and destroy their instance on drop through the
//! captured destroy pointer.

use crate::batch::RenderBatch;
use crate::camera::Camera;
use crate::environment::Environment;
use crate::error::RenderResult;
use crate::scene::{EnvironmentMapGroup, Scene, SceneLoadData};

use glam::Vec3;
use half::f16;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

/// Host-side copies of the auxiliary render targets, packed half RGBA
/// per environment (only populated when auxiliary outputs are enabled).
pub struct AuxiliaryOutputs {
    pub normal: Vec<f16>,
    pub albedo: Vec<f16>,
}

/// Owned opaque backend instance plus its captured destructor.
struct RawHandle {
    ptr: NonNull<()>,
    destroy: unsafe fn(NonNull<()>),
}

// The instance is uniquely owned and every wrapped type is bounded
// `Send` at construction.
unsafe impl Send for RawHandle {}

impl RawHandle {
    fn new<B: Send + 'static>(backend: B) -> Self {
        unsafe fn destroy_shim<B>(ptr: NonNull<()>) {
            drop(unsafe { Box::from_raw(ptr.cast::<B>().as_ptr()) });
        }
        let boxed = Box::into_raw(Box::new(backend));
        Self {
            // Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(boxed.cast::<()>()) },
            destroy: destroy_shim::<B>,
        }
    }

    /// Caller must pass the exact type the handle was constructed with.
    unsafe fn downcast_mut<B>(&mut self) -> &mut B {
        unsafe { self.ptr.cast::<B>().as_mut() }
    }

    unsafe fn downcast_ref<B>(&self) -> &B {
        unsafe { self.ptr.cast::<B>().as_ref() }
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.ptr) }
    }
}

/// Construction-time contract for loader backends. Used only to
/// monomorphize [`LoaderHandle`] shims; never stored as a trait object.
pub(crate) trait LoaderBackend: Send + 'static {
    fn load_scene(&mut self, data: SceneLoadData) -> RenderResult<Arc<Scene>>;
    fn load_environment_maps(
        &mut self,
        paths: &[PathBuf],
    ) -> RenderResult<Arc<EnvironmentMapGroup>>;
}

pub struct LoaderHandle {
    load_scene: unsafe fn(NonNull<()>, SceneLoadData) -> RenderResult<Arc<Scene>>,
    load_env_maps: unsafe fn(NonNull<()>, &[PathBuf]) -> RenderResult<Arc<EnvironmentMapGroup>>,
    raw: RawHandle,
}

impl LoaderHandle {
    pub(crate) fn wrap<B: LoaderBackend>(backend: B) -> Self {
        unsafe fn load_scene_shim<B: LoaderBackend>(
            ptr: NonNull<()>,
            data: SceneLoadData,
        ) -> RenderResult<Arc<Scene>> {
            unsafe { ptr.cast::<B>().as_mut() }.load_scene(data)
        }
        unsafe fn load_env_maps_shim<B: LoaderBackend>(
            ptr: NonNull<()>,
            paths: &[PathBuf],
        ) -> RenderResult<Arc<EnvironmentMapGroup>> {
            unsafe { ptr.cast::<B>().as_mut() }.load_environment_maps(paths)
        }
        Self {
            load_scene: load_scene_shim::<B>,
            load_env_maps: load_env_maps_shim::<B>,
            raw: RawHandle::new(backend),
        }
    }

    pub fn load_scene(&mut self, data: SceneLoadData) -> RenderResult<Arc<Scene>> {
        unsafe { (self.load_scene)(self.raw.ptr, data) }
    }

    pub fn load_environment_maps(
        &mut self,
        paths: &[PathBuf],
    ) -> RenderResult<Arc<EnvironmentMapGroup>> {
        unsafe { (self.load_env_maps)(self.raw.ptr, paths) }
    }
}

/// Backend-side per-environment state (packed lights, randomization
/// draws, TLAS scratch). Lives behind [`EnvironmentHandle`] inside the
/// public `Environment`.
pub(crate) trait EnvironmentBackend: Send + 'static {
    fn add_light(&mut self, position: Vec3, color: Vec3) -> u32;
    fn remove_light(&mut self, idx: u32);
}

pub struct EnvironmentHandle {
    add_light: unsafe fn(NonNull<()>, Vec3, Vec3) -> u32,
    remove_light: unsafe fn(NonNull<()>, u32),
    raw: RawHandle,
}

impl EnvironmentHandle {
    pub(crate) fn wrap<B: EnvironmentBackend>(backend: B) -> Self {
        unsafe fn add_light_shim<B: EnvironmentBackend>(
            ptr: NonNull<()>,
            position: Vec3,
            color: Vec3,
        ) -> u32 {
            unsafe { ptr.cast::<B>().as_mut() }.add_light(position, color)
        }
        unsafe fn remove_light_shim<B: EnvironmentBackend>(ptr: NonNull<()>, idx: u32) {
            unsafe { ptr.cast::<B>().as_mut() }.remove_light(idx)
        }
        Self {
            add_light: add_light_shim::<B>,
            remove_light: remove_light_shim::<B>,
            raw: RawHandle::new(backend),
        }
    }

    pub fn add_light(&mut self, position: Vec3, color: Vec3) -> u32 {
        unsafe { (self.add_light)(self.raw.ptr, position, color) }
    }

    pub fn remove_light(&mut self, idx: u32) {
        unsafe { (self.remove_light)(self.raw.ptr, idx) }
    }

    /// Backend-internal access. Safety: `B` must be the type this handle
    /// was constructed with; only the creating backend calls this.
    pub(crate) unsafe fn state_mut<B>(&mut self) -> &mut B {
        unsafe { self.raw.downcast_mut::<B>() }
    }

    pub(crate) unsafe fn state_ref<B>(&self) -> &B {
        unsafe { self.raw.downcast_ref::<B>() }
    }
}

/// Opaque per-batch backend state (framebuffers, parameter buffers,
/// bind groups). Only the creating backend looks inside.
pub struct BatchHandle {
    raw: RawHandle,
}

impl BatchHandle {
    pub(crate) fn wrap<B: Send + 'static>(backend: B) -> Self {
        Self {
            raw: RawHandle::new(backend),
        }
    }

    pub(crate) unsafe fn state_mut<B>(&mut self) -> &mut B {
        unsafe { self.raw.downcast_mut::<B>() }
    }

    pub(crate) unsafe fn state_ref<B>(&self) -> &B {
        unsafe { self.raw.downcast_ref::<B>() }
    }
}

pub(crate) trait BakerBackend: Send + 'static {
    fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()>;
}

pub struct BakerHandle {
    bake: unsafe fn(NonNull<()>, &mut RenderBatch) -> RenderResult<()>,
    raw: RawHandle,
}

impl BakerHandle {
    pub(crate) fn wrap<B: BakerBackend>(backend: B) -> Self {
        unsafe fn bake_shim<B: BakerBackend>(
            ptr: NonNull<()>,
            batch: &mut RenderBatch,
        ) -> RenderResult<()> {
            unsafe { ptr.cast::<B>().as_mut() }.bake(batch)
        }
        Self {
            bake: bake_shim::<B>,
            raw: RawHandle::new(backend),
        }
    }

    pub fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        unsafe { (self.bake)(self.raw.ptr, batch) }
    }

    /// Safety: `B` must be the type this handle was constructed with.
    pub(crate) unsafe fn state_ref<B>(&self) -> &B {
        unsafe { self.raw.downcast_ref::<B>() }
    }
}

/// Construction-time contract for renderer backends.
pub(crate) trait RenderBackend: Send + 'static {
    fn make_loader(&mut self) -> RenderResult<LoaderHandle>;
    fn make_environment(
        &mut self,
        scene: &Arc<Scene>,
        camera: &Camera,
    ) -> RenderResult<Environment>;
    fn set_active_environment_maps(&mut self, maps: Arc<EnvironmentMapGroup>);
    fn make_render_batch(&mut self) -> RenderResult<BatchHandle>;
    fn render(&mut self, batch: &mut RenderBatch) -> RenderResult<()>;
    fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()>;
    fn wait_for_batch(&mut self, batch: &mut RenderBatch) -> RenderResult<()>;
    fn read_output(&mut self, batch: &mut RenderBatch) -> RenderResult<Vec<f16>>;
    fn auxiliary_outputs(&mut self, batch: &mut RenderBatch) -> RenderResult<AuxiliaryOutputs>;
}

pub struct RendererHandle {
    make_loader: unsafe fn(NonNull<()>) -> RenderResult<LoaderHandle>,
    make_environment: unsafe fn(NonNull<()>, &Arc<Scene>, &Camera) -> RenderResult<Environment>,
    set_env_maps: unsafe fn(NonNull<()>, Arc<EnvironmentMapGroup>),
    make_batch: unsafe fn(NonNull<()>) -> RenderResult<BatchHandle>,
    render: unsafe fn(NonNull<()>, &mut RenderBatch) -> RenderResult<()>,
    bake: unsafe fn(NonNull<()>, &mut RenderBatch) -> RenderResult<()>,
    wait: unsafe fn(NonNull<()>, &mut RenderBatch) -> RenderResult<()>,
    read_output: unsafe fn(NonNull<()>, &mut RenderBatch) -> RenderResult<Vec<f16>>,
    aux_outputs: unsafe fn(NonNull<()>, &mut RenderBatch) -> RenderResult<AuxiliaryOutputs>,
    raw: RawHandle,
}

impl RendererHandle {
    pub(crate) fn wrap<B: RenderBackend>(backend: B) -> Self {
        unsafe fn make_loader_shim<B: RenderBackend>(
            ptr: NonNull<()>,
        ) -> RenderResult<LoaderHandle> {
            unsafe { ptr.cast::<B>().as_mut() }.make_loader()
        }
        unsafe fn make_env_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            scene: &Arc<Scene>,
            camera: &Camera,
        ) -> RenderResult<Environment> {
            unsafe { ptr.cast::<B>().as_mut() }.make_environment(scene, camera)
        }
        unsafe fn set_env_maps_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            maps: Arc<EnvironmentMapGroup>,
        ) {
            unsafe { ptr.cast::<B>().as_mut() }.set_active_environment_maps(maps)
        }
        unsafe fn make_batch_shim<B: RenderBackend>(
            ptr: NonNull<()>,
        ) -> RenderResult<BatchHandle> {
            unsafe { ptr.cast::<B>().as_mut() }.make_render_batch()
        }
        unsafe fn render_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            batch: &mut RenderBatch,
        ) -> RenderResult<()> {
            unsafe { ptr.cast::<B>().as_mut() }.render(batch)
        }
        unsafe fn bake_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            batch: &mut RenderBatch,
        ) -> RenderResult<()> {
            unsafe { ptr.cast::<B>().as_mut() }.bake(batch)
        }
        unsafe fn wait_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            batch: &mut RenderBatch,
        ) -> RenderResult<()> {
            unsafe { ptr.cast::<B>().as_mut() }.wait_for_batch(batch)
        }
        unsafe fn read_output_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            batch: &mut RenderBatch,
        ) -> RenderResult<Vec<f16>> {
            unsafe { ptr.cast::<B>().as_mut() }.read_output(batch)
        }
        unsafe fn aux_shim<B: RenderBackend>(
            ptr: NonNull<()>,
            batch: &mut RenderBatch,
        ) -> RenderResult<AuxiliaryOutputs> {
            unsafe { ptr.cast::<B>().as_mut() }.auxiliary_outputs(batch)
        }
        Self {
            make_loader: make_loader_shim::<B>,
            make_environment: make_env_shim::<B>,
            set_env_maps: set_env_maps_shim::<B>,
            make_batch: make_batch_shim::<B>,
            render: render_shim::<B>,
            bake: bake_shim::<B>,
            wait: wait_shim::<B>,
            read_output: read_output_shim::<B>,
            aux_outputs: aux_shim::<B>,
            raw: RawHandle::new(backend),
        }
    }

    pub fn make_loader(&mut self) -> RenderResult<LoaderHandle> {
        unsafe { (self.make_loader)(self.raw.ptr) }
    }

    pub fn make_environment(
        &mut self,
        scene: &Arc<Scene>,
        camera: &Camera,
    ) -> RenderResult<Environment> {
        unsafe { (self.make_environment)(self.raw.ptr, scene, camera) }
    }

    pub fn set_active_environment_maps(&mut self, maps: Arc<EnvironmentMapGroup>) {
        unsafe { (self.set_env_maps)(self.raw.ptr, maps) }
    }

    pub fn make_render_batch(&mut self) -> RenderResult<BatchHandle> {
        unsafe { (self.make_batch)(self.raw.ptr) }
    }

    pub fn render(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        unsafe { (self.render)(self.raw.ptr, batch) }
    }

    pub fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        unsafe { (self.bake)(self.raw.ptr, batch) }
    }

    pub fn wait_for_batch(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        unsafe { (self.wait)(self.raw.ptr, batch) }
    }

    pub fn read_output(&mut self, batch: &mut RenderBatch) -> RenderResult<Vec<f16>> {
        unsafe { (self.read_output)(self.raw.ptr, batch) }
    }

    pub fn auxiliary_outputs(&mut self, batch: &mut RenderBatch) -> RenderResult<AuxiliaryOutputs> {
        unsafe { (self.aux_outputs)(self.raw.ptr, batch) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct CountingLights {
        lights: Vec<(Vec3, Vec3)>,
        dropped: Arc<AtomicBool>,
    }

    impl EnvironmentBackend for CountingLights {
        fn add_light(&mut self, position: Vec3, color: Vec3) -> u32 {
            self.lights.push((position, color));
            (self.lights.len() - 1) as u32
        }

        fn remove_light(&mut self, idx: u32) {
            self.lights.swap_remove(idx as usize);
        }
    }

    impl Drop for CountingLights {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_reaches_backend_state() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut handle = EnvironmentHandle::wrap(CountingLights {
            lights: Vec::new(),
            dropped: dropped.clone(),
        });

        assert_eq!(handle.add_light(Vec3::ONE, Vec3::X), 0);
        assert_eq!(handle.add_light(Vec3::ZERO, Vec3::Y), 1);
        handle.remove_light(0);

        let state = unsafe { handle.state_ref::<CountingLights>() };
        assert_eq!(state.lights.len(), 1);
        // swap_remove moved the last light into slot 0
        assert_eq!(state.lights[0].1, Vec3::Y);
    }

    #[test]
    fn drop_destroys_instance() {
        let dropped = Arc::new(AtomicBool::new(false));
        let handle = EnvironmentHandle::wrap(CountingLights {
            lights: Vec::new(),
            dropped: dropped.clone(),
        });
        assert!(!dropped.load(Ordering::SeqCst));
        drop(handle);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
