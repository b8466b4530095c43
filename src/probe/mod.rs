//! Irradiance-probe baking.
//!
//! Probes sit on a regular 3-D grid inside the scene's default bounding
//! box. Each probe is a small equirectangular HDR render from a pinned
//! viewpoint, accumulated in fixed sample chunks through the same
//! pipeline that serves ordinary renders. Finished probes are appended
//! to the probe file immediately, so a bake interrupted at probe N
//! resumes at probe N. A completed bake (or a pre-existing file) yields
//! the probe texture array the biased kernel samples for indirect light.

pub mod file;

use crate::batch::{BatchState, FramebufferConfig, ParamBufferConfig, RenderBatch};
use crate::camera::Camera;
use crate::config::{limits, RenderConfig};
use crate::error::{RenderError, RenderResult};
use crate::gpu::queue::QueueState;
use crate::handle::BakerBackend;
use crate::render::{
    execute_batch, ExecContext, Pipelines, Projection, RenderIntent, SampleChunking,
};
use crate::scene::{EnvironmentMapGroup, SharedSceneState};

use crate::accel::Aabb;
use glam::Vec3;
use std::sync::Arc;

/// Equirectangular probe image size (2:1).
pub const PROBE_WIDTH: u32 = 128;
pub const PROBE_HEIGHT: u32 = 64;
/// Total samples accumulated per probe texel.
pub const BAKE_TOTAL_SAMPLES: u32 = 1024;
/// World-space spacing between probes.
pub const PROBE_SPACING: f32 = 2.0;
/// Per-axis cap keeps the probe array within texture layer limits.
pub const MAX_PROBES_PER_AXIS: u32 = 6;

pub const PROBE_RECORD_BYTES: usize = (PROBE_WIDTH * PROBE_HEIGHT * 16) as usize;

/// Grid dimensions covering `aabb` at [`PROBE_SPACING`].
pub fn grid_dims(aabb: &Aabb) -> [u32; 3] {
    let extent = aabb.extent();
    let axis = |e: f32| ((e / PROBE_SPACING).ceil() as u32).clamp(1, MAX_PROBES_PER_AXIS);
    [axis(extent.x), axis(extent.y), axis(extent.z)]
}

/// Cell-centered position of probe `idx` (x-major, then y, then z).
pub fn probe_position(aabb: &Aabb, dims: [u32; 3], idx: u32) -> Vec3 {
    let x = idx % dims[0];
    let y = (idx / dims[0]) % dims[1];
    let z = idx / (dims[0] * dims[1]);
    let cell = |i: u32, d: u32, min: f32, extent: f32| {
        min + (i as f32 + 0.5) / d as f32 * extent
    };
    let min = Vec3::from(aabb.min);
    let extent = aabb.extent();
    Vec3::new(
        cell(x, dims[0], min.x, extent.x),
        cell(y, dims[1], min.y, extent.y),
        cell(z, dims[2], min.z, extent.z),
    )
}

/// Bake orientation is fixed; the equirect projection covers the full
/// sphere regardless, and a pinned basis keeps records reproducible.
pub fn probe_camera(position: Vec3) -> Camera {
    Camera::new(position, Vec3::NEG_Z, Vec3::Y, 90.0)
}

/// Baked probes resident on the device, exposed to the biased kernel.
pub struct ProbeGroup {
    pub texture: wgpu::Texture,
    pub bind_group: Arc<wgpu::BindGroup>,
    pub grid_dims: [u32; 3],
}

pub struct WgpuBaker {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: QueueState,
    pub(crate) pipelines: Arc<Pipelines>,
    pub(crate) shared: Arc<SharedSceneState>,
    pub(crate) env_maps: Arc<EnvironmentMapGroup>,
    pub(crate) probe_layout: Arc<wgpu::BindGroupLayout>,
    pub(crate) batch_layout: Arc<wgpu::BindGroupLayout>,
    pub(crate) placeholder_probe: Arc<wgpu::BindGroup>,
    pub(crate) cfg: RenderConfig,
    pub(crate) storage_alignment: u64,
    pub(crate) probe_group: Option<ProbeGroup>,
}

impl WgpuBaker {
    fn upload_probe(&self, texture: &wgpu::Texture, layer: u32, data: &[u8]) {
        self.queue.raw().write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(PROBE_WIDTH * 16),
                rows_per_image: Some(PROBE_HEIGHT),
            },
            wgpu::Extent3d {
                width: PROBE_WIDTH,
                height: PROBE_HEIGHT,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_probe_texture(&self, layers: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("probe-array"),
            size: wgpu::Extent3d {
                width: PROBE_WIDTH,
                height: PROBE_HEIGHT,
                depth_or_array_layers: layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    /// Read the probe batch's HDR plane after a bake render.
    fn read_probe_hdr(
        &self,
        state: &BatchState,
        staging: &wgpu::Buffer,
    ) -> RenderResult<Vec<u8>> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("probe-readback"),
            });
        encoder.copy_buffer_to_buffer(
            &state.fb_buffer,
            state.fb_cfg.hdr_offset,
            staging,
            0,
            state.fb_cfg.hdr_bytes,
        );
        let idx = self.queue.submit([encoder.finish()]);
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(idx));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| RenderError::readback("probe map callback dropped"))?
            .map_err(|e| RenderError::readback(format!("probe map failed: {e:?}")))?;
        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    pub fn probe_group(&self) -> Option<&ProbeGroup> {
        self.probe_group.as_ref()
    }
}

impl BakerBackend for WgpuBaker {
    fn bake(&mut self, batch: &mut RenderBatch) -> RenderResult<()> {
        let path = self
            .cfg
            .probe_path
            .clone()
            .ok_or_else(|| RenderError::probe("no probe path configured"))?;

        let scene_aabb = batch
            .environments()
            .first()
            .ok_or_else(|| RenderError::probe("bake needs at least one environment"))?
            .scene()
            .world_aabb();

        let (dims, mut records, mut writer) = if path.exists() {
            let contents = file::read_probe_file(&path)?;
            for (i, record) in contents.records.iter().enumerate() {
                if record.len() != PROBE_RECORD_BYTES {
                    return Err(RenderError::probe(format!(
                        "probe {i} holds {} bytes, expected {PROBE_RECORD_BYTES}",
                        record.len()
                    )));
                }
            }
            let writer = file::ProbeFileWriter::append_to(&path)?;
            (contents.grid_dims, contents.records, writer)
        } else {
            let dims = grid_dims(&scene_aabb);
            let writer = file::ProbeFileWriter::create(&path, dims)?;
            (dims, Vec::new(), writer)
        };
        let total = (dims[0] * dims[1] * dims[2]) as usize;
        if records.len() > total {
            return Err(RenderError::probe(format!(
                "probe file holds {} records for a {total}-probe grid",
                records.len()
            )));
        }

        let texture = self.create_probe_texture(total as u32);
        for (layer, record) in records.iter().enumerate() {
            self.upload_probe(&texture, layer as u32, record);
        }

        if records.len() < total {
            log::info!(
                "baking probes {}..{total} on a {}x{}x{} grid",
                records.len(),
                dims[0],
                dims[1],
                dims[2]
            );

            // Probe-sized batch state, allocated once for the whole bake.
            let mut probe_cfg = self.cfg.clone();
            probe_cfg.batch_size = 1;
            let param_cfg = ParamBufferConfig::new(1, self.storage_alignment);
            let fb_cfg = FramebufferConfig::new(
                &probe_cfg,
                PROBE_WIDTH,
                PROBE_HEIGHT,
                self.storage_alignment,
            );
            let mut state = BatchState::new(&self.device, &self.batch_layout, param_cfg, fb_cfg);
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("probe-hdr-staging"),
                size: fb_cfg.hdr_bytes,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let ctx = ExecContext {
                device: &self.device,
                queue: &self.queue,
                pipelines: &self.pipelines,
                shared: &self.shared,
                env_maps: &self.env_maps,
                probe_group: None,
                placeholder_probe: &self.placeholder_probe,
                cfg: &probe_cfg,
            };

            for idx in records.len()..total {
                let position = probe_position(&scene_aabb, dims, idx as u32);
                let intent = RenderIntent {
                    viewpoint: Some(probe_camera(position)),
                    chunking: SampleChunking::FixedChunks {
                        samples_per_chunk: limits::BAKE_SAMPLES_PER_CHUNK,
                        num_chunks: BAKE_TOTAL_SAMPLES / limits::BAKE_SAMPLES_PER_CHUNK,
                    },
                    projection: Projection::Equirectangular,
                };
                let (envs, _) = batch.parts_mut();
                let fence = execute_batch(&ctx, &mut state, &mut envs[..1], 0, &intent)?;
                self.device
                    .poll(wgpu::Maintain::WaitForSubmissionIndex(fence));

                let hdr = self.read_probe_hdr(&state, &staging)?;
                self.upload_probe(&texture, idx as u32, &hdr);
                writer.append_record(&hdr)?;
                records.push(hdr);
            }
        }

        let bind_group = crate::scene::loader::build_env_map_bind_group(
            &self.device,
            &self.probe_layout,
            &texture,
        );
        self.probe_group = Some(ProbeGroup {
            texture,
            bind_group: Arc::new(bind_group),
            grid_dims: dims,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_bounds_within_caps() {
        let aabb = Aabb::new([0.0; 3], [10.0, 1.0, 4.0]);
        assert_eq!(grid_dims(&aabb), [5, 1, 2]);
        // huge scene clamps per axis
        let big = Aabb::new([0.0; 3], [100.0; 3]);
        assert_eq!(grid_dims(&big), [MAX_PROBES_PER_AXIS; 3]);
    }

    #[test]
    fn probe_positions_stay_inside_bounds() {
        let aabb = Aabb::new([-4.0, 0.0, -4.0], [4.0, 2.0, 4.0]);
        let dims = grid_dims(&aabb);
        let total = dims[0] * dims[1] * dims[2];
        for idx in 0..total {
            let p = probe_position(&aabb, dims, idx);
            assert!(p.x > aabb.min[0] && p.x < aabb.max[0]);
            assert!(p.y > aabb.min[1] && p.y < aabb.max[1]);
            assert!(p.z > aabb.min[2] && p.z < aabb.max[2]);
        }
    }

    #[test]
    fn probe_indexing_is_x_major() {
        let aabb = Aabb::new([0.0; 3], [4.0, 4.0, 4.0]);
        let dims = [2, 2, 2];
        let p0 = probe_position(&aabb, dims, 0);
        let p1 = probe_position(&aabb, dims, 1);
        let p2 = probe_position(&aabb, dims, 2);
        let p4 = probe_position(&aabb, dims, 4);
        assert!(p1.x > p0.x && (p1.y, p1.z) == (p0.y, p0.z));
        assert!(p2.y > p0.y && (p2.x, p2.z) == (p0.x, p0.z));
        assert!(p4.z > p0.z && (p4.x, p4.y) == (p0.x, p0.y));
    }

    #[test]
    fn probe_camera_is_pinned() {
        let a = probe_camera(Vec3::ZERO);
        let b = probe_camera(Vec3::splat(9.0));
        assert_eq!(a.view, b.view);
        assert_eq!(a.up, b.up);
        assert_ne!(a.position, b.position);
    }
}
