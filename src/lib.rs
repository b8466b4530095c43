//! raybatch: a batched, GPU-resident path tracer built on wgpu.
//!
//! A [`Renderer`] owns the device and compiled kernels. Loaders parse
//! scene blobs into shared device arenas, environments pair a scene with
//! a camera and light set, and a [`RenderBatch`] renders many
//! environments in one dispatch, tiled into a single framebuffer plane.
//! Render calls are asynchronous; `wait_for_batch`/`read_output` fence
//! and fetch results. `bake` produces irradiance probes for the biased
//! render mode.

pub mod accel;
pub mod batch;
pub mod camera;
pub mod config;
pub mod environment;
pub mod error;
pub mod probe;
pub mod scene;

mod gpu;
mod handle;
mod render;

pub use batch::RenderBatch;
pub use camera::Camera;
pub use config::{limits, RenderConfig, RenderFlags, RenderMode};
pub use environment::Environment;
pub use error::{RenderError, RenderResult};
pub use handle::{AuxiliaryOutputs, LoaderHandle};
pub use scene::{EnvironmentMapGroup, Scene, SceneLoadData};

use crate::batch::BatchState;
use crate::handle::RendererHandle;
use crate::render::WgpuBackend;

use half::f16;
use std::sync::Arc;

/// The renderer facade. All GPU work funnels through the backend handle
/// constructed at `new`.
pub struct Renderer {
    backend: RendererHandle,
    config: RenderConfig,
}

impl Renderer {
    pub fn new(mut config: RenderConfig) -> RenderResult<Self> {
        if config.batch_size == 0 {
            return Err(RenderError::render("batch_size must be at least 1"));
        }
        if config.img_width == 0 || config.img_height == 0 {
            return Err(RenderError::render("image dimensions must be nonzero"));
        }
        if config.spp == 0 {
            return Err(RenderError::render("spp must be at least 1"));
        }
        if config.max_depth == 0 {
            return Err(RenderError::render("max_depth must be at least 1"));
        }
        if matches!(config.mode, RenderMode::Biased) && config.probe_path.is_none() {
            return Err(RenderError::probe(
                "biased mode requires a probe path in the config",
            ));
        }

        // decide (and log) the sampling strategy once at startup
        render::sampling::select_strategy(
            config.spp,
            config.img_width,
            config.img_height,
            config.flags.contains(RenderFlags::FORCE_UNIFORM),
        );
        if config.flags.contains(RenderFlags::ADAPTIVE_SAMPLE)
            && config.spp < limits::ADAPTIVE_SAMPLES_PER_THREAD
        {
            log::warn!(
                "spp {} is below the adaptive chunk of {}; disabling adaptive sampling",
                config.spp,
                limits::ADAPTIVE_SAMPLES_PER_THREAD
            );
            config.flags = config.flags.without(RenderFlags::ADAPTIVE_SAMPLE);
        }

        let backend = WgpuBackend::new(config.clone())?;
        Ok(Self {
            backend: RendererHandle::wrap(backend),
            config,
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// A new scene loader with its own transfer and BLAS-build queues.
    /// Loaders are independent and may run on worker threads.
    pub fn make_loader(&mut self) -> RenderResult<LoaderHandle> {
        self.backend.make_loader()
    }

    pub fn make_environment(
        &mut self,
        scene: &Arc<Scene>,
        camera: &Camera,
    ) -> RenderResult<Environment> {
        self.backend.make_environment(scene, camera)
    }

    /// Swap the environment-map set sampled by subsequent renders.
    pub fn set_active_environment_maps(&mut self, maps: Arc<EnvironmentMapGroup>) {
        self.backend.set_active_environment_maps(maps);
    }

    pub fn make_render_batch(&mut self) -> RenderResult<RenderBatch> {
        let handle = self.backend.make_render_batch()?;
        Ok(RenderBatch::new(handle, self.config.batch_size))
    }

    /// Launch a render of every environment in the batch. Returns once
    /// the work is submitted; pair with [`wait_for_batch`] or
    /// [`read_output`].
    ///
    /// [`wait_for_batch`]: Renderer::wait_for_batch
    /// [`read_output`]: Renderer::read_output
    pub fn render(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        self.backend.render(batch)
    }

    /// Bake irradiance probes for the batch's scene, resuming from the
    /// configured probe file if it already holds records.
    pub fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        self.backend.bake(batch)
    }

    /// Block until the batch's last submitted render completes.
    pub fn wait_for_batch(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        self.backend.wait_for_batch(batch)
    }

    /// The device staging buffer the output plane is copied into, for
    /// callers doing their own readback or interop.
    pub fn output_buffer<'a>(&self, batch: &'a RenderBatch) -> &'a wgpu::Buffer {
        let state = unsafe { batch.backend().state_ref::<BatchState>() };
        &state.output_staging
    }

    /// Fence the batch and copy its output home: `img_width * img_height
    /// * 4` halfs per environment, environments in batch order.
    pub fn read_output(&mut self, batch: &mut RenderBatch) -> RenderResult<Vec<f16>> {
        self.backend.read_output(batch)
    }

    /// Normal and albedo planes in the same layout as [`read_output`];
    /// requires [`RenderFlags::AUXILIARY_OUTPUTS`].
    ///
    /// [`read_output`]: Renderer::read_output
    pub fn auxiliary_outputs(&mut self, batch: &mut RenderBatch) -> RenderResult<AuxiliaryOutputs> {
        self.backend.auxiliary_outputs(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_zeroes() {
        let cases = [
            RenderConfig {
                batch_size: 0,
                ..Default::default()
            },
            RenderConfig {
                img_width: 0,
                ..Default::default()
            },
            RenderConfig {
                spp: 0,
                ..Default::default()
            },
            RenderConfig {
                max_depth: 0,
                ..Default::default()
            },
        ];
        for cfg in cases {
            assert!(Renderer::new(cfg).is_err());
        }
    }

    #[test]
    fn biased_mode_requires_probe_path() {
        let cfg = RenderConfig {
            mode: RenderMode::Biased,
            probe_path: None,
            ..Default::default()
        };
        assert!(matches!(Renderer::new(cfg), Err(RenderError::Probe(_))));
    }
}
