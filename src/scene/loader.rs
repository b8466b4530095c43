//! Scene and environment-map loading.
//!
//! Each loader owns a transfer queue for geometry/texture uploads and a
//! compute queue for BLAS node uploads. Loading is CPU-bound parsing and
//! BVH construction followed by queued writes into the shared arenas;
//! the shared lock is taken only to reserve ranges and to publish the
//! finished scene.

use crate::accel::{build_bvh, triangle_aabbs, BvhNode};
use crate::error::{RenderError, RenderResult};
use crate::gpu::queue::QueueState;
use crate::handle::LoaderBackend;
use crate::scene::shared::SceneCounts;
use crate::scene::{
    Scene, SceneAllocation, SceneLoadData, SharedSceneState, TextureData, NO_TEXTURE,
};

use glam::Vec3;
use image::imageops::{self, FilterType};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

/// One or more equirectangular HDR maps in a layered texture, with the
/// bind group the trace kernel samples them through. Independent of any
/// scene's lifetime.
pub struct EnvironmentMapGroup {
    pub texture: wgpu::Texture,
    pub bind_group: wgpu::BindGroup,
    pub num_maps: u32,
    pub width: u32,
    pub height: u32,
}

pub struct WgpuLoader {
    device: Arc<wgpu::Device>,
    transfer_queue: QueueState,
    compute_queue: QueueState,
    shared: Arc<SharedSceneState>,
    env_map_layout: Arc<wgpu::BindGroupLayout>,
}

impl WgpuLoader {
    pub fn new(
        device: Arc<wgpu::Device>,
        transfer_queue: QueueState,
        compute_queue: QueueState,
        shared: Arc<SharedSceneState>,
        env_map_layout: Arc<wgpu::BindGroupLayout>,
    ) -> Self {
        Self {
            device,
            transfer_queue,
            compute_queue,
            shared,
            env_map_layout,
        }
    }

    fn upload_scene(
        &self,
        data: &SceneLoadData,
        reordered_indices: &[u32],
        meshes_with_roots: &[crate::scene::PackedMeshInfo],
        blas_nodes: &[BvhNode],
        alloc: &SceneAllocation,
    ) {
        let q = &self.transfer_queue;
        q.write_buffer(
            &self.shared.vertex_buffer,
            alloc.vertex_base as u64 * mem::size_of::<crate::scene::PackedVertex>() as u64,
            bytemuck::cast_slice(&data.vertices),
        );
        q.write_buffer(
            &self.shared.index_buffer,
            alloc.index_base as u64 * mem::size_of::<u32>() as u64,
            bytemuck::cast_slice(reordered_indices),
        );
        q.write_buffer(
            &self.shared.mesh_buffer,
            alloc.mesh_base as u64 * mem::size_of::<crate::scene::PackedMeshInfo>() as u64,
            bytemuck::cast_slice(meshes_with_roots),
        );

        let mut materials = data.materials.clone();
        let dim = self.shared.texture_dim as f32;
        for mat in &mut materials {
            if mat.base_texture_idx != NO_TEXTURE {
                let tex = &data.textures[mat.base_texture_idx as usize];
                let (w, h) = fitted_dims(tex.width, tex.height, self.shared.texture_dim);
                mat.tex_scale = [w as f32 / dim, h as f32 / dim];
            }
        }
        q.write_buffer(
            &self.shared.material_buffer,
            alloc.material_base as u64 * mem::size_of::<crate::scene::PackedMaterial>() as u64,
            bytemuck::cast_slice(&materials),
        );

        // BLAS nodes go over the compute queue like any other
        // acceleration-structure write.
        self.compute_queue.write_buffer(
            &self.shared.blas_buffer,
            alloc.blas_base as u64 * mem::size_of::<BvhNode>() as u64,
            bytemuck::cast_slice(blas_nodes),
        );

        for (i, tex) in data.textures.iter().enumerate() {
            let (pixels, w, h) = prepare_texture(tex, self.shared.texture_dim);
            q.raw().write_texture(
                wgpu::ImageCopyTexture {
                    texture: &self.shared.texture_array,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: alloc.texture_base + i as u32,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                &pixels,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(w * 4),
                    rows_per_image: Some(h),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
            );
        }
    }
}

impl LoaderBackend for WgpuLoader {
    fn load_scene(&mut self, data: SceneLoadData) -> RenderResult<Arc<Scene>> {
        // CPU work first: one BLAS per mesh, with the mesh's index range
        // reordered so leaves reference contiguous triangle runs.
        let positions: Vec<Vec3> = data.vertices.iter().map(|v| Vec3::from(v.position)).collect();
        let mut reordered_indices = vec![0u32; data.indices.len()];
        let mut blas_nodes: Vec<BvhNode> = Vec::new();
        let mut mesh_aabbs = Vec::with_capacity(data.meshes.len());
        let mut meshes = data.meshes.clone();

        for mesh in &mut meshes {
            let start = mesh.index_offset as usize;
            let end = start + (mesh.num_triangles * 3) as usize;
            let mesh_indices = &data.indices[start..end];
            let prim_aabbs = triangle_aabbs(&positions, mesh_indices);
            let bvh = build_bvh(&prim_aabbs);
            mesh_aabbs.push(bvh.world_aabb);

            for (slot, &prim) in bvh.prim_order.iter().enumerate() {
                let src = prim as usize * 3;
                let dst = start + slot * 3;
                reordered_indices[dst..dst + 3]
                    .copy_from_slice(&mesh_indices[src..src + 3]);
            }

            let node_base = blas_nodes.len() as u32;
            mesh.blas_root = node_base;
            for node in &bvh.nodes {
                let mut node = *node;
                // child links are scene-relative; leaf ranges stay
                // mesh-relative triangle slots
                if !node.is_leaf() {
                    node.left_idx += node_base;
                    node.right_idx += node_base;
                }
                blas_nodes.push(node);
            }
        }

        let counts = SceneCounts {
            vertices: data.vertices.len() as u32,
            indices: data.indices.len() as u32,
            meshes: meshes.len() as u32,
            materials: data.materials.len() as u32,
            blas_nodes: blas_nodes.len() as u32,
            textures: data.textures.len() as u32,
        };
        let alloc = self.shared.allocate_ranges(&counts)?;

        self.upload_scene(&data, &reordered_indices, &meshes, &blas_nodes, &alloc);

        let id = match self.shared.publish(&alloc) {
            Ok(id) => id,
            Err(err) => {
                // Uploads target ranges nothing references yet; returning
                // them is enough to undo the load.
                self.shared.release_ranges_only(&alloc);
                return Err(err);
            }
        };

        log::debug!(
            "loaded scene {:?}: {} meshes, {} vertices, {} BLAS nodes",
            id,
            counts.meshes,
            counts.vertices,
            counts.blas_nodes
        );

        let mesh_blas_roots = meshes.iter().map(|m| m.blas_root).collect();
        let mesh_materials = meshes.iter().map(|m| m.material_idx).collect();
        Ok(Arc::new(Scene::new(
            id,
            alloc,
            data.world_aabb,
            mesh_aabbs,
            mesh_blas_roots,
            mesh_materials,
            self.shared.clone(),
        )))
    }

    fn load_environment_maps(
        &mut self,
        paths: &[PathBuf],
    ) -> RenderResult<Arc<EnvironmentMapGroup>> {
        if paths.is_empty() {
            return Err(RenderError::load("no environment map paths given"));
        }
        if paths.len() as u32 > crate::config::limits::MAX_ENV_MAPS {
            return Err(RenderError::capacity(format!(
                "{} environment maps exceeds {}",
                paths.len(),
                crate::config::limits::MAX_ENV_MAPS
            )));
        }

        let mut layers: Vec<Vec<f32>> = Vec::with_capacity(paths.len());
        let mut dims: Option<(u32, u32)> = None;
        for path in paths {
            let img = image::open(path)
                .map_err(|e| RenderError::load(format!("{}: {e}", path.display())))?
                .into_rgb32f();
            let img = match dims {
                None => {
                    dims = Some(img.dimensions());
                    img
                }
                Some((w, h)) if img.dimensions() == (w, h) => img,
                // All layers of one texture share dimensions; resample
                // stragglers to the first map's size.
                Some((w, h)) => imageops::resize(&img, w, h, FilterType::Triangle),
            };
            let mut rgba = Vec::with_capacity(img.len() / 3 * 4);
            for px in img.pixels() {
                rgba.extend_from_slice(&[px.0[0], px.0[1], px.0[2], 1.0]);
            }
            layers.push(rgba);
        }
        let (width, height) = dims.unwrap_or((1, 1));

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("env-map-array"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: layers.len() as u32,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        for (layer, pixels) in layers.iter().enumerate() {
            self.transfer_queue.raw().write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: layer as u32,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(pixels),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(width * 16),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }

        let bind_group = build_env_map_bind_group(&self.device, &self.env_map_layout, &texture);

        Ok(Arc::new(EnvironmentMapGroup {
            texture,
            bind_group,
            num_maps: paths.len() as u32,
            width,
            height,
        }))
    }
}

/// Group layout for environment maps; owned by the backend so the
/// pipelines and every loaded group agree on it.
pub fn env_map_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("env-map-bgl"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    // Rgba32Float: loads only, no filtering
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2Array,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            },
        ],
    })
}

pub fn build_env_map_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    texture: &wgpu::Texture,
) -> wgpu::BindGroup {
    let view = texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(wgpu::TextureViewDimension::D2Array),
        ..Default::default()
    });
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("env-map-sampler"),
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        address_mode_u: wgpu::AddressMode::Repeat,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        ..Default::default()
    });
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("env-map-bg"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&sampler),
            },
        ],
    })
}

/// A 1x1 black group bound before any caller-provided maps exist.
pub fn placeholder_env_map_group(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
) -> Arc<EnvironmentMapGroup> {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("env-map-placeholder"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba32Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(&[0.0f32, 0.0, 0.0, 1.0]),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(16),
            rows_per_image: Some(1),
        },
        wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
    );
    let bind_group = build_env_map_bind_group(device, layout, &texture);
    Arc::new(EnvironmentMapGroup {
        texture,
        bind_group,
        num_maps: 1,
        width: 1,
        height: 1,
    })
}

fn fitted_dims(width: u32, height: u32, max_dim: u32) -> (u32, u32) {
    (width.min(max_dim), height.min(max_dim))
}

/// Downsample a blob texture to fit the shared array layer if needed.
fn prepare_texture(tex: &TextureData, max_dim: u32) -> (Vec<u8>, u32, u32) {
    let (w, h) = fitted_dims(tex.width, tex.height, max_dim);
    if (w, h) == (tex.width, tex.height) {
        return (tex.data.clone(), w, h);
    }
    let img = image::RgbaImage::from_raw(tex.width, tex.height, tex.data.clone())
        .unwrap_or_else(|| image::RgbaImage::new(1, 1));
    let resized = imageops::resize(&img, w, h, FilterType::Triangle);
    (resized.into_raw(), w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_textures_shrink_to_the_layer() {
        let tex = TextureData {
            width: 8,
            height: 4,
            data: vec![255u8; 8 * 4 * 4],
        };
        let (pixels, w, h) = prepare_texture(&tex, 4);
        assert_eq!((w, h), (4, 4));
        assert_eq!(pixels.len(), (w * h * 4) as usize);
    }

    #[test]
    fn small_textures_pass_through() {
        let tex = TextureData {
            width: 2,
            height: 2,
            data: vec![7u8; 16],
        };
        let (pixels, w, h) = prepare_texture(&tex, 512);
        assert_eq!((w, h), (2, 2));
        assert_eq!(pixels, tex.data);
    }
}
