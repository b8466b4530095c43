//! Per-batch GPU state and the buffer layouts behind it.
//!
//! All per-render parameters live in one device parameter buffer and all
//! framebuffer planes in one framebuffer heap; `ParamBufferConfig` and
//! `FramebufferConfig` are the pure descriptors of those layouts,
//! computed once at batch creation. Their offsets are the wire contract
//! with the WGSL kernels: every region starts at a storage-aligned
//! offset, regions never overlap, and the total is the aligned sum.

use crate::accel::{BvhNode, PackedInstance};
use crate::camera::PackedCamera;
use crate::config::{limits, RenderConfig, RenderFlags};
use crate::environment::Environment;
use crate::gpu::{align_offset, divide_round_up};
use crate::handle::BatchHandle;

use bytemuck::{Pod, Zeroable};
use std::mem;

/// Per-environment record in the parameter buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PackedEnv {
    pub cam: PackedCamera,
    pub prev_cam: PackedCamera,
    /// scene_id, instance_base, num_instances, tlas_base
    pub scene_and_instances: [u32; 4],
    /// light_offset, num_lights, env_map_idx, reserved
    pub lights: [u32; 4],
    pub env_map_rotation: [f32; 4],
    /// rgb = domain-randomized light filter
    pub light_filter: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PackedLight {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub color: [f32; 3],
    pub _pad1: f32,
}

/// Running mean/variance statistics per (environment, tile).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct AdaptiveTile {
    pub mean: f32,
    pub m2: f32,
    pub samples: u32,
    pub _pad: u32,
}

/// One adaptive work item: a workgroup's tile plus its sample offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InputTile {
    pub batch_idx: u32,
    pub x_base: u32,
    pub y_base: u32,
    pub sample_offset: u32,
}

/// Uniform constants rebuilt every dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct FrameConstants {
    pub frame_counter: u32,
    pub batch_size: u32,
    pub img_width: u32,
    pub img_height: u32,
    pub spp: u32,
    pub max_depth: u32,
    pub flags: u32,
    pub clamp_threshold: f32,
    pub images_wide: u32,
    pub tiles_wide: u32,
    pub tiles_tall: u32,
    pub sample_strategy: u32,
    /// First sample index of this dispatch.
    pub sample_offset: u32,
    /// Samples each thread accumulates this dispatch.
    pub samples_this_pass: u32,
    /// 0 = perspective, 1 = equirectangular (probe bakes).
    pub projection: u32,
    pub _pad: u32,
    /// xyz = probe grid dims, w = probe count (0 when probes unused)
    pub probe_grid: [u32; 4],
    pub probe_bounds_min: [f32; 4],
    pub probe_bounds_max: [f32; 4],
}

/// Bytes per pixel of each framebuffer plane.
pub const OUTPUT_BYTES_PER_PIXEL: u64 = 8; // rgba16f packed as 2 x u32
pub const HDR_BYTES_PER_PIXEL: u64 = 16; // rgba32f
pub const AUX_BYTES_PER_PIXEL: u64 = 8; // rgba16f
pub const RESERVOIR_BYTES_PER_PIXEL: u64 = 32;

/// Byte layout of the parameter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamBufferConfig {
    pub env_offset: u64,
    pub env_bytes: u64,
    pub instance_offset: u64,
    pub instance_bytes: u64,
    pub light_offset: u64,
    pub light_bytes: u64,
    pub tlas_offset: u64,
    pub tlas_bytes: u64,
    pub total_bytes: u64,
}

impl ParamBufferConfig {
    pub fn new(batch_size: u32, alignment: u64) -> Self {
        let env_offset = 0;
        let env_bytes = batch_size as u64 * mem::size_of::<PackedEnv>() as u64;

        let instance_offset = align_offset(env_offset + env_bytes, alignment);
        let instance_bytes =
            limits::MAX_INSTANCES as u64 * mem::size_of::<PackedInstance>() as u64;

        let light_offset = align_offset(instance_offset + instance_bytes, alignment);
        let light_bytes = limits::MAX_LIGHTS as u64 * mem::size_of::<PackedLight>() as u64;

        let tlas_offset = align_offset(light_offset + light_bytes, alignment);
        // a binary tree over every instance slot, padded for leaf splits
        let tlas_bytes = 2 * limits::MAX_INSTANCES as u64 * mem::size_of::<BvhNode>() as u64;

        let total_bytes = align_offset(tlas_offset + tlas_bytes, alignment);

        Self {
            env_offset,
            env_bytes,
            instance_offset,
            instance_bytes,
            light_offset,
            light_bytes,
            tlas_offset,
            tlas_bytes,
            total_bytes,
        }
    }

    pub fn regions(&self) -> [(u64, u64); 4] {
        [
            (self.env_offset, self.env_bytes),
            (self.instance_offset, self.instance_bytes),
            (self.light_offset, self.light_bytes),
            (self.tlas_offset, self.tlas_bytes),
        ]
    }
}

/// Geometry and byte layout of the framebuffer heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferConfig {
    /// Batch images tiled into one plane, this many across.
    pub images_wide: u32,
    pub images_tall: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub minibatch_size: u32,
    pub tiles_wide: u32,
    pub tiles_tall: u32,
    pub tiles_per_env: u32,
    pub total_tiles: u32,

    pub output_offset: u64,
    pub output_bytes: u64,
    pub hdr_offset: u64,
    pub hdr_bytes: u64,
    pub normal_offset: u64,
    pub normal_bytes: u64,
    pub albedo_offset: u64,
    pub albedo_bytes: u64,
    pub illuminance_offset: u64,
    pub illuminance_bytes: u64,
    pub adaptive_offset: u64,
    pub adaptive_bytes: u64,
    pub input_tile_offset: u64,
    pub input_tile_bytes: u64,
    pub reservoir_offsets: [u64; 2],
    pub reservoir_bytes: u64,
    pub total_bytes: u64,
}

/// Smallest divisor of `batch_size` that is >= ceil(sqrt(batch_size)).
pub fn images_wide(batch_size: u32) -> u32 {
    let mut wide = (batch_size as f64).sqrt().ceil() as u32;
    while batch_size % wide != 0 {
        wide += 1;
    }
    wide
}

impl FramebufferConfig {
    pub fn new(cfg: &RenderConfig, width: u32, height: u32, alignment: u64) -> Self {
        let batch = cfg.batch_size;
        let images_wide = images_wide(batch);
        let images_tall = batch / images_wide;
        let frame_width = width * images_wide;
        let frame_height = height * images_tall;
        let pixels = frame_width as u64 * frame_height as u64;

        let minibatch_size = (batch / limits::MINIBATCH_DIVISOR).max(1);

        let tiles_wide = divide_round_up(width, limits::LOCAL_WORKGROUP_X);
        let tiles_tall = divide_round_up(height, limits::LOCAL_WORKGROUP_Y);
        let tiles_per_env = tiles_wide * tiles_tall;
        let total_tiles = tiles_per_env * batch;

        let aux = cfg.flags.contains(RenderFlags::AUXILIARY_OUTPUTS)
            || cfg.flags.contains(RenderFlags::DENOISE);
        // unused planes still get a valid (minimal) binding
        let aux_bytes = if aux {
            pixels * AUX_BYTES_PER_PIXEL
        } else {
            AUX_BYTES_PER_PIXEL
        };

        let output_offset = 0;
        let output_bytes = pixels * OUTPUT_BYTES_PER_PIXEL;
        let hdr_offset = align_offset(output_offset + output_bytes, alignment);
        let hdr_bytes = pixels * HDR_BYTES_PER_PIXEL;
        let normal_offset = align_offset(hdr_offset + hdr_bytes, alignment);
        let normal_bytes = aux_bytes;
        let albedo_offset = align_offset(normal_offset + normal_bytes, alignment);
        let albedo_bytes = aux_bytes;
        let illuminance_offset = align_offset(albedo_offset + albedo_bytes, alignment);
        let illuminance_bytes = batch as u64 * mem::size_of::<f32>() as u64;
        let adaptive_offset = align_offset(illuminance_offset + illuminance_bytes, alignment);
        let adaptive_bytes = total_tiles as u64 * mem::size_of::<AdaptiveTile>() as u64;
        let input_tile_offset = align_offset(adaptive_offset + adaptive_bytes, alignment);
        let input_tile_bytes = limits::MAX_TILES as u64 * mem::size_of::<InputTile>() as u64;
        let reservoir_bytes = pixels * RESERVOIR_BYTES_PER_PIXEL;
        let reservoir0 = align_offset(input_tile_offset + input_tile_bytes, alignment);
        let reservoir1 = align_offset(reservoir0 + reservoir_bytes, alignment);
        let total_bytes = align_offset(reservoir1 + reservoir_bytes, alignment);

        Self {
            images_wide,
            images_tall,
            frame_width,
            frame_height,
            minibatch_size,
            tiles_wide,
            tiles_tall,
            tiles_per_env,
            total_tiles,
            output_offset,
            output_bytes,
            hdr_offset,
            hdr_bytes,
            normal_offset,
            normal_bytes,
            albedo_offset,
            albedo_bytes,
            illuminance_offset,
            illuminance_bytes,
            adaptive_offset,
            adaptive_bytes,
            input_tile_offset,
            input_tile_bytes,
            reservoir_offsets: [reservoir0, reservoir1],
            reservoir_bytes,
            total_bytes,
        }
    }

    pub fn regions(&self) -> Vec<(u64, u64)> {
        vec![
            (self.output_offset, self.output_bytes),
            (self.hdr_offset, self.hdr_bytes),
            (self.normal_offset, self.normal_bytes),
            (self.albedo_offset, self.albedo_bytes),
            (self.illuminance_offset, self.illuminance_bytes),
            (self.adaptive_offset, self.adaptive_bytes),
            (self.input_tile_offset, self.input_tile_bytes),
            (self.reservoir_offsets[0], self.reservoir_bytes),
            (self.reservoir_offsets[1], self.reservoir_bytes),
        ]
    }
}

/// Device-side batch state, owned behind the batch's opaque handle.
pub struct BatchState {
    pub param_cfg: ParamBufferConfig,
    pub fb_cfg: FramebufferConfig,
    /// CPU staging assembled per render, then queued to `param_buffer`.
    pub param_staging: Vec<u8>,
    pub param_buffer: wgpu::Buffer,
    pub fb_buffer: wgpu::Buffer,
    pub frame_const_buffer: wgpu::Buffer,
    pub output_staging: wgpu::Buffer,
    pub aux_staging: wgpu::Buffer,
    pub stats_staging: wgpu::Buffer,
    /// One bind group per reservoir pairing; index with `cur_buffer`.
    pub bind_groups: [wgpu::BindGroup; 2],
    pub frame_counter: u32,
    pub fence: Option<wgpu::SubmissionIndex>,
}

impl BatchState {
    pub fn new(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        param_cfg: ParamBufferConfig,
        fb_cfg: FramebufferConfig,
    ) -> Self {
        let param_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("batch-params"),
            size: param_cfg.total_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let fb_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("batch-framebuffer"),
            size: fb_cfg.total_bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let frame_const_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("batch-frame-constants"),
            size: mem::size_of::<FrameConstants>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let readback = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let output_staging = readback("batch-output-staging", fb_cfg.output_bytes);
        let aux_staging = readback(
            "batch-aux-staging",
            fb_cfg.normal_bytes + fb_cfg.albedo_bytes,
        );
        let stats_staging = readback(
            "batch-stats-staging",
            fb_cfg.illuminance_bytes + fb_cfg.adaptive_bytes,
        );

        let bind_groups = [
            Self::build_bind_group(device, layout, &param_cfg, &fb_cfg, &param_buffer, &fb_buffer, &frame_const_buffer, 0),
            Self::build_bind_group(device, layout, &param_cfg, &fb_cfg, &param_buffer, &fb_buffer, &frame_const_buffer, 1),
        ];

        Self {
            param_cfg,
            fb_cfg,
            param_staging: vec![0; param_cfg.total_bytes as usize],
            param_buffer,
            fb_buffer,
            frame_const_buffer,
            output_staging,
            aux_staging,
            stats_staging,
            bind_groups,
            frame_counter: 0,
            fence: None,
        }
    }

    /// Batch bind group layout (group 0 of every kernel).
    pub fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        // 1 envs, 2 instances, 3 lights, 4 tlas, 5 out, 6 hdr,
        // 7 prev reservoirs, 8 cur reservoirs, 9 illuminance,
        // 10 adaptive, 11 input tiles, 12 normal, 13 albedo
        let read_only = [
            true, true, true, true, false, false, true, false, false, false, true, false, false,
        ];
        for (i, ro) in read_only.iter().enumerate() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: *ro },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("batch-bgl"),
            entries: &entries,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        param_cfg: &ParamBufferConfig,
        fb_cfg: &FramebufferConfig,
        param_buffer: &wgpu::Buffer,
        fb_buffer: &wgpu::Buffer,
        frame_consts: &wgpu::Buffer,
        cur: usize,
    ) -> wgpu::BindGroup {
        let param = |offset, size| {
            wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: param_buffer,
                offset,
                size: wgpu::BufferSize::new(size),
            })
        };
        let fb = |offset, size| {
            wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: fb_buffer,
                offset,
                size: wgpu::BufferSize::new(size),
            })
        };
        // call N's current reservoirs become call N+1's previous
        let cur_res = fb_cfg.reservoir_offsets[cur];
        let prev_res = fb_cfg.reservoir_offsets[1 - cur];

        let entries = [
            wgpu::BindGroupEntry {
                binding: 0,
                resource: frame_consts.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: param(param_cfg.env_offset, param_cfg.env_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: param(param_cfg.instance_offset, param_cfg.instance_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: param(param_cfg.light_offset, param_cfg.light_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: param(param_cfg.tlas_offset, param_cfg.tlas_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: fb(fb_cfg.output_offset, fb_cfg.output_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: fb(fb_cfg.hdr_offset, fb_cfg.hdr_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 7,
                resource: fb(prev_res, fb_cfg.reservoir_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 8,
                resource: fb(cur_res, fb_cfg.reservoir_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 9,
                resource: fb(fb_cfg.illuminance_offset, fb_cfg.illuminance_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 10,
                resource: fb(fb_cfg.adaptive_offset, fb_cfg.adaptive_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 11,
                resource: fb(fb_cfg.input_tile_offset, fb_cfg.input_tile_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 12,
                resource: fb(fb_cfg.normal_offset, fb_cfg.normal_bytes),
            },
            wgpu::BindGroupEntry {
                binding: 13,
                resource: fb(fb_cfg.albedo_offset, fb_cfg.albedo_bytes),
            },
        ];

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("batch-bg"),
            layout,
            entries: &entries,
        })
    }
}

/// A batch of environments plus its backend GPU state. `cur_buffer`
/// alternates every render call, selecting which reservoir pairing is
/// current vs. previous.
pub struct RenderBatch {
    environments: Vec<Environment>,
    backend: BatchHandle,
    cur_buffer: usize,
}

impl RenderBatch {
    pub(crate) fn new(backend: BatchHandle, capacity: u32) -> Self {
        Self {
            environments: Vec::with_capacity(capacity as usize),
            backend,
            cur_buffer: 0,
        }
    }

    pub fn push_environment(&mut self, env: Environment) {
        self.environments.push(env);
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn environments_mut(&mut self) -> &mut [Environment] {
        &mut self.environments
    }

    pub fn num_environments(&self) -> u32 {
        self.environments.len() as u32
    }

    pub fn cur_buffer(&self) -> usize {
        self.cur_buffer
    }

    pub(crate) fn flip(&mut self) {
        self.cur_buffer = 1 - self.cur_buffer;
    }

    pub(crate) fn backend(&self) -> &BatchHandle {
        &self.backend
    }

    pub(crate) fn backend_mut(&mut self) -> &mut BatchHandle {
        &mut self.backend
    }

    /// Split borrow used during packing, which walks environments while
    /// writing backend staging memory.
    pub(crate) fn parts_mut(&mut self) -> (&mut [Environment], &mut BatchHandle) {
        (&mut self.environments, &mut self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;

    fn check_regions(regions: &[(u64, u64)], alignment: u64, total: u64) {
        let mut sorted = regions.to_vec();
        sorted.sort_by_key(|&(off, _)| off);
        let mut prev_end = 0;
        for &(off, len) in &sorted {
            assert_eq!(off % alignment, 0, "offset {off} unaligned");
            assert!(off >= prev_end, "region at {off} overlaps previous");
            prev_end = off + len;
        }
        assert!(total >= prev_end);
        assert_eq!(total % alignment, 0);
        assert_eq!(total, align_offset(prev_end, alignment));
    }

    #[test]
    fn param_regions_are_aligned_and_disjoint() {
        for batch in [1, 7, 32] {
            let cfg = ParamBufferConfig::new(batch, 256);
            check_regions(&cfg.regions(), 256, cfg.total_bytes);
        }
    }

    #[test]
    fn framebuffer_regions_are_aligned_and_disjoint() {
        let mut rc = RenderConfig {
            batch_size: 16,
            ..Default::default()
        };
        rc.flags |= RenderFlags::AUXILIARY_OUTPUTS | RenderFlags::ADAPTIVE_SAMPLE;
        let cfg = FramebufferConfig::new(&rc, 64, 64, 256);
        check_regions(&cfg.regions(), 256, cfg.total_bytes);
    }

    #[test]
    fn images_wide_is_smallest_divisor_above_sqrt() {
        assert_eq!(images_wide(1), 1);
        assert_eq!(images_wide(4), 2);
        assert_eq!(images_wide(8), 4); // ceil(sqrt(8)) = 3, next divisor 4
        assert_eq!(images_wide(12), 4);
        assert_eq!(images_wide(16), 4);
        assert_eq!(images_wide(7), 7); // prime: full row
    }

    #[test]
    fn frame_plane_covers_batch() {
        let rc = RenderConfig {
            batch_size: 8,
            ..Default::default()
        };
        let cfg = FramebufferConfig::new(&rc, 128, 128, 256);
        assert_eq!(cfg.images_wide * cfg.images_tall, 8);
        assert_eq!(cfg.frame_width, 128 * cfg.images_wide);
        assert_eq!(cfg.frame_height, 128 * cfg.images_tall);
        assert_eq!(cfg.minibatch_size, 1);
        assert_eq!(cfg.tiles_per_env, 16 * 16);
        assert_eq!(cfg.total_tiles, 16 * 16 * 8);
    }

    #[test]
    fn reservoir_regions_are_distinct_and_equal_sized() {
        let rc = RenderConfig::default();
        let cfg = FramebufferConfig::new(&rc, 32, 32, 256);
        let [r0, r1] = cfg.reservoir_offsets;
        assert_ne!(r0, r1);
        assert!(r1 >= r0 + cfg.reservoir_bytes);
        assert_eq!(cfg.reservoir_bytes, 32 * 32 * 32);
    }

    #[test]
    fn packed_env_is_gpu_sized() {
        assert_eq!(mem::size_of::<PackedEnv>(), 128);
        assert_eq!(mem::size_of::<FrameConstants>(), 112);
        assert_eq!(mem::size_of::<AdaptiveTile>(), 16);
        assert_eq!(mem::size_of::<InputTile>(), 16);
        assert_eq!(mem::size_of::<PackedLight>(), 32);
    }
}
