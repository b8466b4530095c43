//! Render orchestration: parameter packing, kernel dispatch, and the
//! backend implementing the renderer contract.
//!
//! One code path, [`execute_batch`], serves interactive renders and
//! probe bakes; a [`RenderIntent`] selects the viewpoint and how samples
//! are chunked across dispatches. Every kernel sees the same four bind
//! groups: batch state, the shared scene arenas, environment maps, and
//! baked probes (a placeholder until a bake happens).

pub mod adaptive;
pub mod sampling;

use crate::accel::{Aabb, BvhNode, PackedInstance};
use crate::batch::{
    AdaptiveTile, BatchState, FrameConstants, FramebufferConfig, PackedEnv, PackedLight,
    ParamBufferConfig, RenderBatch,
};
use crate::camera::{Camera, PackedCamera};
use crate::config::{limits, RenderConfig, RenderFlags, RenderMode};
use crate::environment::{DomainRandomization, Environment};
use crate::error::{RenderError, RenderResult};
use crate::gpu::queue::{QueueState, RENDER_QUEUE_COUNT};
use crate::gpu::{divide_round_up, GpuContext};
use crate::handle::{
    AuxiliaryOutputs, BakerHandle, BatchHandle, EnvironmentHandle, LoaderHandle, RenderBackend,
};
use crate::probe::WgpuBaker;
use crate::render::adaptive::AdaptiveState;
use crate::render::sampling::SampleStrategy;
use crate::scene::loader::{
    build_env_map_bind_group, env_map_bind_group_layout, placeholder_env_map_group, WgpuLoader,
};
use crate::scene::{EnvironmentMapGroup, Scene, SharedSceneState};

use glam::Vec3;
use half::f16;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::mem;
use std::sync::{mpsc, Arc};

/// Compute pipelines compiled once per renderer. All share one layout so
/// bind groups stay set across pipeline switches within a pass.
pub struct Pipelines {
    pub trace_full: wgpu::ComputePipeline,
    pub trace_adaptive: wgpu::ComputePipeline,
    pub denoise: wgpu::ComputePipeline,
    pub exposure: wgpu::ComputePipeline,
    pub tonemap: wgpu::ComputePipeline,
}

impl Pipelines {
    pub fn new(
        device: &wgpu::Device,
        batch_layout: &wgpu::BindGroupLayout,
        scene_layout: &wgpu::BindGroupLayout,
        env_map_layout: &wgpu::BindGroupLayout,
        probe_layout: &wgpu::BindGroupLayout,
        cfg: &RenderConfig,
    ) -> Self {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("render-pipeline-layout"),
            bind_group_layouts: &[batch_layout, scene_layout, env_map_layout, probe_layout],
            push_constant_ranges: &[],
        });

        let prelude = shader_prelude(cfg);
        let module = |label: &str, src: &str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(format!("{prelude}\n{src}").into()),
            })
        };
        let pathtracer = module("pathtracer", include_str!("../shaders/pathtracer.wgsl"));
        let post = module("post", include_str!("../shaders/post.wgsl"));
        let denoise = module("denoise", include_str!("../shaders/denoise.wgsl"));

        let pipeline = |label: &str, module: &wgpu::ShaderModule, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module,
                entry_point: entry,
            })
        };

        Self {
            trace_full: pipeline("trace-full", &pathtracer, "trace_full"),
            trace_adaptive: pipeline("trace-adaptive", &pathtracer, "trace_adaptive"),
            denoise: pipeline("denoise", &denoise, "denoise"),
            exposure: pipeline("exposure", &post, "reduce_illuminance"),
            tonemap: pipeline("tonemap", &post, "tonemap_resolve"),
        }
    }
}

/// Host constants prepended to every kernel source, generated from the
/// same values the packing code uses.
fn shader_prelude(cfg: &RenderConfig) -> String {
    format!(
        "const WORKGROUP_X: u32 = {wx}u;\n\
         const WORKGROUP_Y: u32 = {wy}u;\n\
         const ADAPTIVE_SAMPLES_PER_THREAD: u32 = {aspt}u;\n\
         const MAX_SCENES: u32 = {scenes}u;\n\
         const FLAG_AUX_OUTPUTS: u32 = {aux}u;\n\
         const FLAG_TONEMAP: u32 = {tonemap}u;\n\
         const FLAG_ADAPTIVE: u32 = {adaptive}u;\n\
         const FLAG_DENOISE: u32 = {denoise}u;\n\
         const STRATEGY_UNIFORM: u32 = 1u;\n\
         const INSTANCE_VISIBLE: u32 = 1u;\n\
         const BIASED_MODE: bool = {biased};\n",
        wx = limits::LOCAL_WORKGROUP_X,
        wy = limits::LOCAL_WORKGROUP_Y,
        aspt = limits::ADAPTIVE_SAMPLES_PER_THREAD,
        scenes = limits::MAX_SCENES,
        aux = RenderFlags::AUXILIARY_OUTPUTS.bits(),
        tonemap = RenderFlags::TONEMAP.bits(),
        adaptive = RenderFlags::ADAPTIVE_SAMPLE.bits(),
        denoise = RenderFlags::DENOISE.bits(),
        biased = matches!(cfg.mode, RenderMode::Biased),
    )
}

/// Baked probes as a dispatch sees them.
pub struct ProbeBinding<'a> {
    pub bind_group: &'a wgpu::BindGroup,
    pub grid_dims: [u32; 3],
}

/// Everything a dispatch needs besides the batch itself.
pub struct ExecContext<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a QueueState,
    pub pipelines: &'a Pipelines,
    pub shared: &'a SharedSceneState,
    pub env_maps: &'a EnvironmentMapGroup,
    pub probe_group: Option<ProbeBinding<'a>>,
    pub placeholder_probe: &'a wgpu::BindGroup,
    pub cfg: &'a RenderConfig,
}

/// How one `execute_batch` call spreads its samples over dispatches.
pub enum SampleChunking {
    /// All samples in one dispatch.
    Single,
    /// Fixed chunks accumulated into the HDR plane; used by probe bakes.
    FixedChunks {
        samples_per_chunk: u32,
        num_chunks: u32,
    },
    /// Per-tile convergence loop.
    Adaptive,
}

/// Ray-generation model for a dispatch.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Perspective,
    /// Full-sphere equirectangular; probe bakes render these.
    Equirectangular,
}

pub struct RenderIntent {
    /// Camera override applied to every environment; `None` uses each
    /// environment's own camera and advances its temporal history.
    pub viewpoint: Option<Camera>,
    pub chunking: SampleChunking,
    pub projection: Projection,
}

/// Pack parameters, dispatch the trace kernel per the intent's chunking,
/// run the post passes, and queue output copies. Returns the fence of
/// the last submission; the caller decides when to wait.
pub fn execute_batch(
    ctx: &ExecContext<'_>,
    state: &mut BatchState,
    envs: &mut [Environment],
    cur: usize,
    intent: &RenderIntent,
) -> RenderResult<wgpu::SubmissionIndex> {
    if envs.is_empty() {
        return Err(RenderError::render("batch has no environments"));
    }
    let num_envs = envs.len() as u32;

    pack_batch_params(
        &state.param_cfg,
        &mut state.param_staging,
        envs,
        intent.viewpoint.as_ref(),
    )?;
    ctx.queue
        .write_buffer(&state.param_buffer, 0, &state.param_staging);

    match intent.chunking {
        SampleChunking::Single => {
            let mut fc = base_frame_constants(ctx, state, envs, ctx.cfg.spp);
            fc.projection = intent.projection as u32;
            fc.samples_this_pass = ctx.cfg.spp;
            ctx.queue
                .write_buffer(&state.frame_const_buffer, 0, bytemuck::bytes_of(&fc));

            let mut encoder = trace_encoder(ctx, state, cur, &ctx.pipelines.trace_full);
            encode_post(ctx, state, cur, &mut encoder, num_envs);
            let idx = ctx.queue.submit([encoder.finish()]);
            state.frame_counter += num_envs;
            Ok(idx)
        }
        SampleChunking::FixedChunks {
            samples_per_chunk,
            num_chunks,
        } => {
            let total = samples_per_chunk * num_chunks;
            let mut fc = base_frame_constants(ctx, state, envs, total);
            fc.projection = intent.projection as u32;
            fc.samples_this_pass = samples_per_chunk;
            let mut last = None;
            for chunk in 0..num_chunks {
                fc.sample_offset = chunk * samples_per_chunk;
                // queue-timeline ordering places this write between the
                // previous chunk and the next submission
                ctx.queue
                    .write_buffer(&state.frame_const_buffer, 0, bytemuck::bytes_of(&fc));
                let mut encoder = trace_encoder(ctx, state, cur, &ctx.pipelines.trace_full);
                if chunk + 1 == num_chunks {
                    encode_post(ctx, state, cur, &mut encoder, num_envs);
                }
                last = Some(ctx.queue.submit([encoder.finish()]));
            }
            state.frame_counter += num_envs;
            // num_chunks >= 1: the loop always submits
            last.ok_or_else(|| RenderError::render("zero sample chunks requested"))
        }
        SampleChunking::Adaptive => execute_adaptive(ctx, state, envs, cur),
    }
}

/// Convergence-driven loop: dispatch pending tiles, read back per-tile
/// statistics, re-emit what has not converged.
fn execute_adaptive(
    ctx: &ExecContext<'_>,
    state: &mut BatchState,
    envs: &[Environment],
    cur: usize,
) -> RenderResult<wgpu::SubmissionIndex> {
    let num_envs = envs.len() as u32;
    let fb = state.fb_cfg;
    let mut loop_state = AdaptiveState::new(&fb, num_envs, ctx.cfg.spp);
    let mut fc = base_frame_constants(ctx, state, envs, ctx.cfg.spp);
    fc.samples_this_pass = limits::ADAPTIVE_SAMPLES_PER_THREAD;

    loop {
        let items = loop_state.emit();
        if items.is_empty() {
            break;
        }
        ctx.queue.write_buffer(
            &state.fb_buffer,
            fb.input_tile_offset,
            bytemuck::cast_slice(&items),
        );
        fc.frame_counter = state.frame_counter;
        ctx.queue
            .write_buffer(&state.frame_const_buffer, 0, bytemuck::bytes_of(&fc));
        state.frame_counter += num_envs;

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("adaptive-iteration"),
            });
        {
            let mut pass = begin_pass(&mut encoder, "adaptive-trace", ctx, state, cur);
            pass.set_pipeline(&ctx.pipelines.trace_adaptive);
            pass.dispatch_workgroups(items.len() as u32, 1, 1);
            // fresh per-environment illuminance for the convergence test
            pass.set_pipeline(&ctx.pipelines.exposure);
            pass.dispatch_workgroups(num_envs, 1, 1);
        }
        encoder.copy_buffer_to_buffer(
            &state.fb_buffer,
            fb.illuminance_offset,
            &state.stats_staging,
            0,
            fb.illuminance_bytes,
        );
        encoder.copy_buffer_to_buffer(
            &state.fb_buffer,
            fb.adaptive_offset,
            &state.stats_staging,
            fb.illuminance_bytes,
            fb.adaptive_bytes,
        );
        let idx = ctx.queue.submit([encoder.finish()]);
        ctx.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(idx));

        let bytes = read_staging(ctx.device, &state.stats_staging)?;
        let illum_end = fb.illuminance_bytes as usize;
        let illuminance: Vec<f32> = bytemuck::cast_slice(&bytes[..illum_end]).to_vec();
        let stats: &[AdaptiveTile] = bytemuck::cast_slice(&bytes[illum_end..]);
        loop_state.update(stats, &illuminance);
    }

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("adaptive-resolve"),
        });
    encode_post(ctx, state, cur, &mut encoder, num_envs);
    Ok(ctx.queue.submit([encoder.finish()]))
}

fn plane_workgroups(fb: &FramebufferConfig) -> (u32, u32) {
    (
        divide_round_up(fb.frame_width, limits::LOCAL_WORKGROUP_X),
        divide_round_up(fb.frame_height, limits::LOCAL_WORKGROUP_Y),
    )
}

fn begin_pass<'a>(
    encoder: &'a mut wgpu::CommandEncoder,
    label: &str,
    ctx: &'a ExecContext<'_>,
    state: &'a BatchState,
    cur: usize,
) -> wgpu::ComputePass<'a> {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_bind_group(0, &state.bind_groups[cur], &[]);
    pass.set_bind_group(1, ctx.shared.bind_group(), &[]);
    pass.set_bind_group(2, &ctx.env_maps.bind_group, &[]);
    let probe_bg = match &ctx.probe_group {
        Some(p) => p.bind_group,
        None => ctx.placeholder_probe,
    };
    pass.set_bind_group(3, probe_bg, &[]);
    pass
}

/// Encoder with one full-plane trace dispatch.
fn trace_encoder(
    ctx: &ExecContext<'_>,
    state: &BatchState,
    cur: usize,
    pipeline: &wgpu::ComputePipeline,
) -> wgpu::CommandEncoder {
    let (wx, wy) = plane_workgroups(&state.fb_cfg);
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("trace"),
        });
    {
        let mut pass = begin_pass(&mut encoder, "trace", ctx, state, cur);
        pass.set_pipeline(pipeline);
        pass.dispatch_workgroups(wx, wy, 1);
    }
    encoder
}

/// Post chain: optional denoise, illuminance reduction, tonemap/resolve
/// into the output plane, then copies into the readback buffers.
fn encode_post(
    ctx: &ExecContext<'_>,
    state: &BatchState,
    cur: usize,
    encoder: &mut wgpu::CommandEncoder,
    num_envs: u32,
) {
    let fb = &state.fb_cfg;
    let (wx, wy) = plane_workgroups(fb);
    {
        let mut pass = begin_pass(encoder, "post", ctx, state, cur);
        if ctx.cfg.flags.contains(RenderFlags::DENOISE) {
            pass.set_pipeline(&ctx.pipelines.denoise);
            pass.dispatch_workgroups(wx, wy, 1);
        }
        pass.set_pipeline(&ctx.pipelines.exposure);
        pass.dispatch_workgroups(num_envs, 1, 1);
        pass.set_pipeline(&ctx.pipelines.tonemap);
        pass.dispatch_workgroups(wx, wy, 1);
    }
    encoder.copy_buffer_to_buffer(
        &state.fb_buffer,
        fb.output_offset,
        &state.output_staging,
        0,
        fb.output_bytes,
    );
    if ctx.cfg.flags.contains(RenderFlags::AUXILIARY_OUTPUTS) {
        encoder.copy_buffer_to_buffer(
            &state.fb_buffer,
            fb.normal_offset,
            &state.aux_staging,
            0,
            fb.normal_bytes,
        );
        encoder.copy_buffer_to_buffer(
            &state.fb_buffer,
            fb.albedo_offset,
            &state.aux_staging,
            fb.normal_bytes,
            fb.albedo_bytes,
        );
    }
}

/// Strategy decision without the startup logging; `select_strategy` in
/// [`sampling`] warns once when the renderer is built.
fn strategy_for(flags: RenderFlags, spp: u32, width: u32, height: u32) -> SampleStrategy {
    if flags.contains(RenderFlags::FORCE_UNIFORM) || sampling::index_bits(spp, width, height) > 32
    {
        SampleStrategy::Uniform
    } else {
        SampleStrategy::ZSobol
    }
}

fn base_frame_constants(
    ctx: &ExecContext<'_>,
    state: &BatchState,
    envs: &[Environment],
    spp_total: u32,
) -> FrameConstants {
    let fb = &state.fb_cfg;
    let img_width = fb.frame_width / fb.images_wide;
    let img_height = fb.frame_height / fb.images_tall;
    let (probe_grid, probe_bounds) = match &ctx.probe_group {
        Some(p) => {
            let [x, y, z] = p.grid_dims;
            ([x, y, z, x * y * z], envs[0].scene().world_aabb())
        }
        None => ([0; 4], Aabb::empty()),
    };
    FrameConstants {
        frame_counter: state.frame_counter,
        batch_size: envs.len() as u32,
        img_width,
        img_height,
        spp: spp_total,
        max_depth: ctx.cfg.max_depth,
        flags: ctx.cfg.flags.bits(),
        clamp_threshold: ctx.cfg.clamp_threshold,
        images_wide: fb.images_wide,
        tiles_wide: fb.tiles_wide,
        tiles_tall: fb.tiles_tall,
        sample_strategy: strategy_for(ctx.cfg.flags, spp_total, img_width, img_height) as u32,
        sample_offset: 0,
        samples_this_pass: 0,
        projection: Projection::Perspective as u32,
        _pad: 0,
        probe_grid,
        probe_bounds_min: [probe_bounds.min[0], probe_bounds.min[1], probe_bounds.min[2], 0.0],
        probe_bounds_max: [probe_bounds.max[0], probe_bounds.max[1], probe_bounds.max[2], 0.0],
    }
}

/// Per-environment light list behind the environment handle.
#[derive(Default)]
pub(crate) struct WgpuEnvLights {
    pub lights: Vec<PackedLight>,
}

impl crate::handle::EnvironmentBackend for WgpuEnvLights {
    fn add_light(&mut self, position: Vec3, color: Vec3) -> u32 {
        self.lights.push(PackedLight {
            position: position.to_array(),
            _pad0: 0.0,
            color: color.to_array(),
            _pad1: 0.0,
        });
        (self.lights.len() - 1) as u32
    }

    fn remove_light(&mut self, idx: u32) {
        self.lights.swap_remove(idx as usize);
    }
}

fn write_pod(staging: &mut [u8], offset: u64, bytes: &[u8]) {
    let start = offset as usize;
    staging[start..start + bytes.len()].copy_from_slice(bytes);
}

/// Assemble every environment's parameters into the staging image of the
/// parameter buffer: packed env records, instances and TLAS nodes in
/// leaf order, and the concatenated light lists. Bases accumulate across
/// environments; capacity failures leave nothing submitted.
pub(crate) fn pack_batch_params(
    param_cfg: &ParamBufferConfig,
    staging: &mut [u8],
    envs: &mut [Environment],
    viewpoint: Option<&Camera>,
) -> RenderResult<()> {
    let tlas_capacity = (param_cfg.tlas_bytes / mem::size_of::<BvhNode>() as u64) as u32;
    let mut instance_base = 0u32;
    let mut light_base = 0u32;
    let mut tlas_base = 0u32;

    for (slot, env) in envs.iter_mut().enumerate() {
        let lights = unsafe { env.backend().state_ref::<WgpuEnvLights>() }
            .lights
            .clone();
        if light_base + lights.len() as u32 > limits::MAX_LIGHTS {
            return Err(RenderError::capacity(format!(
                "batch exceeds {} lights",
                limits::MAX_LIGHTS
            )));
        }

        let rnd = *env.randomization();
        let scene_id = env.scene().id().0;
        let cam = viewpoint.copied().unwrap_or(*env.camera());
        let prev_cam = *env.previous_camera();

        let (num_instances, num_nodes) = {
            let tlas = env.tlas();
            let num_instances = tlas.instances.len() as u32;
            let num_nodes = tlas.nodes.len() as u32;
            if instance_base + num_instances > limits::MAX_INSTANCES {
                return Err(RenderError::capacity(format!(
                    "batch exceeds {} instances",
                    limits::MAX_INSTANCES
                )));
            }
            if tlas_base + num_nodes > tlas_capacity {
                return Err(RenderError::capacity("batch TLAS node region exhausted"));
            }
            write_pod(
                staging,
                param_cfg.instance_offset
                    + instance_base as u64 * mem::size_of::<PackedInstance>() as u64,
                bytemuck::cast_slice(&tlas.instances),
            );
            write_pod(
                staging,
                param_cfg.tlas_offset + tlas_base as u64 * mem::size_of::<BvhNode>() as u64,
                bytemuck::cast_slice(&tlas.nodes),
            );
            (num_instances, num_nodes)
        };

        write_pod(
            staging,
            param_cfg.light_offset + light_base as u64 * mem::size_of::<PackedLight>() as u64,
            bytemuck::cast_slice(&lights),
        );

        let q = rnd.env_map_rotation;
        let f = rnd.light_filter;
        let record = PackedEnv {
            cam: PackedCamera::pack(&cam),
            prev_cam: PackedCamera::pack(&prev_cam),
            scene_and_instances: [scene_id, instance_base, num_instances, tlas_base],
            lights: [light_base, lights.len() as u32, rnd.env_map_idx, 0],
            env_map_rotation: [q.x, q.y, q.z, q.w],
            light_filter: [f.x, f.y, f.z, 1.0],
        };
        write_pod(
            staging,
            param_cfg.env_offset + slot as u64 * mem::size_of::<PackedEnv>() as u64,
            bytemuck::bytes_of(&record),
        );

        // a pinned bake viewpoint must not disturb temporal history
        if viewpoint.is_none() {
            env.snapshot_camera();
        }

        instance_base += num_instances;
        light_base += lights.len() as u32;
        tlas_base += num_nodes;
    }
    Ok(())
}

/// Map a MAP_READ staging buffer and copy its contents out.
pub(crate) fn read_staging(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
) -> RenderResult<Vec<u8>> {
    let slice = buffer.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| RenderError::readback("map callback dropped"))?
        .map_err(|e| RenderError::readback(format!("buffer map failed: {e:?}")))?;
    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(data)
}

/// Reorder a tiled batch plane into env-major images. `comps` is the
/// per-pixel component count of `plane`.
pub(crate) fn detile_plane(plane: &[f16], fb: &FramebufferConfig, comps: usize) -> Vec<f16> {
    let img_w = (fb.frame_width / fb.images_wide) as usize;
    let img_h = (fb.frame_height / fb.images_tall) as usize;
    let plane_w = fb.frame_width as usize;
    let num_envs = (fb.images_wide * fb.images_tall) as usize;

    let mut out = Vec::with_capacity(num_envs * img_w * img_h * comps);
    for env in 0..num_envs {
        let ox = (env % fb.images_wide as usize) * img_w;
        let oy = (env / fb.images_wide as usize) * img_h;
        for row in 0..img_h {
            let start = ((oy + row) * plane_w + ox) * comps;
            out.extend_from_slice(&plane[start..start + img_w * comps]);
        }
    }
    out
}

/// The wgpu renderer backend behind [`crate::handle::RendererHandle`].
pub struct WgpuBackend {
    gpu: GpuContext,
    cfg: RenderConfig,
    shared: Arc<SharedSceneState>,
    pipelines: Arc<Pipelines>,
    batch_layout: Arc<wgpu::BindGroupLayout>,
    env_map_layout: Arc<wgpu::BindGroupLayout>,
    probe_layout: Arc<wgpu::BindGroupLayout>,
    placeholder_probe: Arc<wgpu::BindGroup>,
    env_maps: Arc<EnvironmentMapGroup>,
    transfer_queues: Vec<QueueState>,
    compute_queues: Vec<QueueState>,
    next_loader: u32,
    cur_render_queue: usize,
    active_probes: Option<(Arc<wgpu::BindGroup>, [u32; 3])>,
    baker: Option<BakerHandle>,
    rng: StdRng,
}

impl WgpuBackend {
    pub fn new(cfg: RenderConfig) -> RenderResult<Self> {
        let gpu = GpuContext::new(cfg.gpu_id)?;
        let shared =
            SharedSceneState::new(&gpu.device, gpu.queue.clone(), cfg.max_texture_resolution);
        let batch_layout = Arc::new(BatchState::bind_group_layout(&gpu.device));
        let env_map_layout = Arc::new(env_map_bind_group_layout(&gpu.device));
        let probe_layout = Arc::new(env_map_bind_group_layout(&gpu.device));
        let pipelines = Arc::new(Pipelines::new(
            &gpu.device,
            &batch_layout,
            shared.bind_group_layout(),
            &env_map_layout,
            &probe_layout,
            &cfg,
        ));
        let env_maps = placeholder_env_map_group(&gpu.device, &gpu.queue, &env_map_layout);
        let placeholder = placeholder_env_map_group(&gpu.device, &gpu.queue, &probe_layout);
        let placeholder_probe = Arc::new(build_env_map_bind_group(
            &gpu.device,
            &probe_layout,
            &placeholder.texture,
        ));

        let transfer_queues = gpu.transfer_queues(cfg.num_loaders);
        let compute_queues = gpu.compute_queues(cfg.num_loaders);

        Ok(Self {
            gpu,
            cfg,
            shared,
            pipelines,
            batch_layout,
            env_map_layout,
            probe_layout,
            placeholder_probe,
            env_maps,
            transfer_queues,
            compute_queues,
            next_loader: 0,
            cur_render_queue: 0,
            active_probes: None,
            baker: None,
            rng: StdRng::from_entropy(),
        })
    }
}

impl RenderBackend for WgpuBackend {
    fn make_loader(&mut self) -> RenderResult<LoaderHandle> {
        let idx = self.next_loader;
        self.next_loader += 1;
        if idx >= self.cfg.num_loaders {
            log::warn!(
                "loader {} exceeds the configured count of {}; queues will be shared",
                idx,
                self.cfg.num_loaders
            );
        }
        let transfer = self.transfer_queues[idx as usize % self.transfer_queues.len()].clone();
        let loader_queues = self.compute_queues.len() - RENDER_QUEUE_COUNT as usize;
        let compute =
            self.compute_queues[RENDER_QUEUE_COUNT as usize + idx as usize % loader_queues]
                .clone();
        Ok(LoaderHandle::wrap(WgpuLoader::new(
            self.gpu.device.clone(),
            transfer,
            compute,
            self.shared.clone(),
            self.env_map_layout.clone(),
        )))
    }

    fn make_environment(
        &mut self,
        scene: &Arc<Scene>,
        camera: &Camera,
    ) -> RenderResult<Environment> {
        let mut env = Environment::new(
            EnvironmentHandle::wrap(WgpuEnvLights::default()),
            scene.clone(),
            *camera,
        );
        if self.cfg.flags.contains(RenderFlags::RANDOMIZE) {
            env.set_randomization(DomainRandomization::draw(
                &mut self.rng,
                self.env_maps.num_maps,
            ));
        }
        Ok(env)
    }

    fn set_active_environment_maps(&mut self, maps: Arc<EnvironmentMapGroup>) {
        self.env_maps = maps;
    }

    fn make_render_batch(&mut self) -> RenderResult<BatchHandle> {
        let param_cfg = ParamBufferConfig::new(self.cfg.batch_size, self.gpu.storage_alignment);
        let fb_cfg = FramebufferConfig::new(
            &self.cfg,
            self.cfg.img_width,
            self.cfg.img_height,
            self.gpu.storage_alignment,
        );
        let state = BatchState::new(&self.gpu.device, &self.batch_layout, param_cfg, fb_cfg);
        Ok(BatchHandle::wrap(state))
    }

    fn render(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        if batch.num_environments() != self.cfg.batch_size {
            return Err(RenderError::render(format!(
                "batch holds {} environments, configured for {}",
                batch.num_environments(),
                self.cfg.batch_size
            )));
        }
        if matches!(self.cfg.mode, RenderMode::Biased) && self.active_probes.is_none() {
            return Err(RenderError::render(
                "biased mode requires baked probes; call bake first",
            ));
        }
        // without double buffering the batch's buffers are not reused
        // until the previous render has drained
        if !self.cfg.double_buffered {
            self.wait_for_batch(batch)?;
        }

        let intent = RenderIntent {
            viewpoint: None,
            chunking: if self.cfg.flags.contains(RenderFlags::ADAPTIVE_SAMPLE) {
                SampleChunking::Adaptive
            } else {
                SampleChunking::Single
            },
            projection: Projection::Perspective,
        };
        let cur = batch.cur_buffer();
        {
            let queue = &self.compute_queues[self.cur_render_queue];
            let ctx = ExecContext {
                device: &self.gpu.device,
                queue,
                pipelines: &self.pipelines,
                shared: &self.shared,
                env_maps: &self.env_maps,
                probe_group: self.active_probes.as_ref().map(|(bg, dims)| ProbeBinding {
                    bind_group: bg,
                    grid_dims: *dims,
                }),
                placeholder_probe: &self.placeholder_probe,
                cfg: &self.cfg,
            };
            let (envs, handle) = batch.parts_mut();
            let state = unsafe { handle.state_mut::<BatchState>() };
            let fence = execute_batch(&ctx, state, envs, cur, &intent)?;
            state.fence = Some(fence);
        }
        batch.flip();
        self.cur_render_queue = (self.cur_render_queue + 1) % RENDER_QUEUE_COUNT as usize;
        Ok(())
    }

    fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        if self.baker.is_none() {
            let baker = WgpuBaker {
                device: self.gpu.device.clone(),
                queue: self.compute_queues[0].clone(),
                pipelines: self.pipelines.clone(),
                shared: self.shared.clone(),
                env_maps: self.env_maps.clone(),
                probe_layout: self.probe_layout.clone(),
                batch_layout: self.batch_layout.clone(),
                placeholder_probe: self.placeholder_probe.clone(),
                cfg: self.cfg.clone(),
                storage_alignment: self.gpu.storage_alignment,
                probe_group: None,
            };
            self.baker = Some(BakerHandle::wrap(baker));
        }
        let baker = match self.baker.as_mut() {
            Some(b) => b,
            None => return Err(RenderError::render("baker construction failed")),
        };
        baker.bake(batch)?;

        let state = unsafe { baker.state_ref::<WgpuBaker>() };
        if let Some(group) = state.probe_group() {
            self.active_probes = Some((group.bind_group.clone(), group.grid_dims));
        }
        Ok(())
    }

    fn wait_for_batch(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        let state = unsafe { batch.backend_mut().state_mut::<BatchState>() };
        if let Some(fence) = state.fence.take() {
            self.gpu
                .device
                .poll(wgpu::Maintain::WaitForSubmissionIndex(fence));
        }
        Ok(())
    }

    fn read_output(&mut self, batch: &mut RenderBatch) -> RenderResult<Vec<f16>> {
        self.wait_for_batch(batch)?;
        let state = unsafe { batch.backend().state_ref::<BatchState>() };
        let bytes = read_staging(&self.gpu.device, &state.output_staging)?;
        let plane: &[f16] = bytemuck::cast_slice(&bytes);
        Ok(detile_plane(plane, &state.fb_cfg, 4))
    }

    fn auxiliary_outputs(&mut self, batch: &mut RenderBatch) -> RenderResult<AuxiliaryOutputs> {
        if !self.cfg.flags.contains(RenderFlags::AUXILIARY_OUTPUTS) {
            return Err(RenderError::render("auxiliary outputs are not enabled"));
        }
        self.wait_for_batch(batch)?;
        let state = unsafe { batch.backend().state_ref::<BatchState>() };
        let bytes = read_staging(&self.gpu.device, &state.aux_staging)?;
        let split = state.fb_cfg.normal_bytes as usize;
        let normal: &[f16] = bytemuck::cast_slice(&bytes[..split]);
        let albedo: &[f16] = bytemuck::cast_slice(&bytes[split..]);
        Ok(AuxiliaryOutputs {
            normal: detile_plane(normal, &state.fb_cfg, 4),
            albedo: detile_plane(albedo, &state.fb_cfg, 4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::EnvironmentBackend;

    fn test_env(blas_roots: Vec<u32>) -> Environment {
        let n = blas_roots.len();
        let scene = Arc::new(Scene::detached(
            Aabb::new([0.0; 3], [8.0; 3]),
            vec![Aabb::new([-1.0; 3], [1.0; 3]); n],
            blas_roots,
            vec![0; n],
        ));
        Environment::new(
            EnvironmentHandle::wrap(WgpuEnvLights::default()),
            scene,
            Camera::default(),
        )
    }

    #[test]
    fn light_removal_swaps_in_last() {
        let mut lights = WgpuEnvLights::default();
        assert_eq!(lights.add_light(Vec3::X, Vec3::ONE), 0);
        assert_eq!(lights.add_light(Vec3::Y, Vec3::ONE), 1);
        assert_eq!(lights.add_light(Vec3::Z, Vec3::ONE), 2);
        lights.remove_light(0);
        assert_eq!(lights.lights.len(), 2);
        assert_eq!(lights.lights[0].position, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn packed_records_accumulate_bases() {
        let param_cfg = ParamBufferConfig::new(2, 256);
        let mut staging = vec![0u8; param_cfg.total_bytes as usize];
        let mut envs = vec![test_env(vec![0, 4]), test_env(vec![0])];
        envs[0].add_light(Vec3::ONE, Vec3::ONE);
        envs[1].add_light(Vec3::ZERO, Vec3::ONE);
        envs[1].add_light(Vec3::X, Vec3::ONE);

        pack_batch_params(&param_cfg, &mut staging, &mut envs, None).unwrap();

        let records: &[PackedEnv] = bytemuck::cast_slice(
            &staging[param_cfg.env_offset as usize
                ..param_cfg.env_offset as usize + 2 * mem::size_of::<PackedEnv>()],
        );
        // env 0: 2 instances from instance_base 0
        assert_eq!(records[0].scene_and_instances[1], 0);
        assert_eq!(records[0].scene_and_instances[2], 2);
        assert_eq!(records[0].lights[0], 0);
        assert_eq!(records[0].lights[1], 1);
        // env 1 starts where env 0 ended
        assert_eq!(records[1].scene_and_instances[1], 2);
        assert_eq!(records[1].scene_and_instances[2], 1);
        assert_eq!(records[1].lights[0], 1);
        assert_eq!(records[1].lights[1], 2);
        assert!(records[1].scene_and_instances[3] >= records[0].scene_and_instances[3]);
    }

    #[test]
    fn packing_advances_camera_history() {
        let param_cfg = ParamBufferConfig::new(1, 256);
        let mut staging = vec![0u8; param_cfg.total_bytes as usize];
        let mut envs = vec![test_env(vec![0])];
        let moved = Camera::look_at(Vec3::splat(3.0), Vec3::ZERO, Vec3::Y, 60.0);
        envs[0].move_camera(moved);

        pack_batch_params(&param_cfg, &mut staging, &mut envs, None).unwrap();
        assert_eq!(envs[0].previous_camera(), &moved);

        // a pinned viewpoint leaves history alone
        let pinned = Camera::default();
        envs[0].move_camera(Camera::look_at(Vec3::X, Vec3::ZERO, Vec3::Y, 45.0));
        pack_batch_params(&param_cfg, &mut staging, &mut envs, Some(&pinned)).unwrap();
        assert_eq!(envs[0].previous_camera(), &moved);
    }

    #[test]
    fn light_overflow_is_a_capacity_error() {
        let param_cfg = ParamBufferConfig::new(1, 256);
        let mut staging = vec![0u8; param_cfg.total_bytes as usize];
        let mut envs = vec![test_env(vec![0])];
        for _ in 0..=limits::MAX_LIGHTS {
            envs[0].add_light(Vec3::ONE, Vec3::ONE);
        }
        assert!(matches!(
            pack_batch_params(&param_cfg, &mut staging, &mut envs, None),
            Err(RenderError::Capacity(_))
        ));
    }

    #[test]
    fn detile_restores_env_major_order() {
        // 2x1 plane of 2x2 images, 1 component: env 0 left, env 1 right
        let rc = RenderConfig {
            batch_size: 2,
            ..Default::default()
        };
        let fb = FramebufferConfig::new(&rc, 2, 2, 256);
        assert_eq!((fb.images_wide, fb.images_tall), (2, 1));
        let plane: Vec<f16> = [
            0.0, 1.0, 10.0, 11.0, // row 0: env0 then env1
            2.0, 3.0, 12.0, 13.0, // row 1
        ]
        .iter()
        .map(|&v| f16::from_f32(v))
        .collect();
        let out = detile_plane(&plane, &fb, 1);
        let vals: Vec<f32> = out.iter().map(|v| v.to_f32()).collect();
        assert_eq!(vals, vec![0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn strategy_matches_selection_rules() {
        assert_eq!(
            strategy_for(RenderFlags::NONE, 64, 128, 128),
            SampleStrategy::ZSobol
        );
        assert_eq!(
            strategy_for(RenderFlags::FORCE_UNIFORM, 64, 128, 128),
            SampleStrategy::Uniform
        );
        assert_eq!(
            strategy_for(RenderFlags::NONE, 1024, 4096, 4096),
            SampleStrategy::Uniform
        );
    }
}
