//! State shared by every loader and every render dispatch: the bounded
//! scene-id pool, the device arenas geometry is suballocated from, the
//! per-scene address table, and the bind group exposing all of it.
//!
//! The mutex guards only CPU bookkeeping (id pool, range allocators) and
//! table writes; it is never held across a GPU wait.

use crate::accel::BvhNode;
use crate::config::limits;
use crate::error::{RenderError, RenderResult};
use crate::scene::{
    PackedMaterial, PackedMeshInfo, PackedVertex, SceneAllocation, SceneId,
};

use bytemuck::{Pod, Zeroable};
use std::mem;
use std::sync::{Arc, Mutex};
use wgpu::util::DeviceExt;

/// Element capacities of the device arenas. Together these stay inside
/// the scene-arena byte budget in `config::limits`.
pub const VERTEX_ARENA_ELEMS: u32 = 1 << 20;
pub const INDEX_ARENA_ELEMS: u32 = 1 << 22;
pub const BLAS_ARENA_NODES: u32 = 1 << 20;
pub const MESH_ARENA_ELEMS: u32 = limits::MAX_SCENES * limits::MAX_MESHES;
pub const MATERIAL_ARENA_ELEMS: u32 = limits::MAX_SCENES * limits::MAX_MATERIALS;
/// Layer count and square dimension of the shared scene texture array.
pub const TEXTURE_ARRAY_LAYERS: u32 = 128;
pub const DEFAULT_TEXTURE_DIM: u32 = 512;

/// First-fit free-list allocator over `[0, capacity)` elements.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    capacity: u32,
    /// Disjoint free ranges (base, len), sorted by base.
    free: Vec<(u32, u32)>,
}

impl RangeAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: vec![(0, capacity)],
        }
    }

    pub fn alloc(&mut self, len: u32) -> Option<u32> {
        if len == 0 {
            return Some(0);
        }
        let slot = self.free.iter().position(|&(_, flen)| flen >= len)?;
        let (base, flen) = self.free[slot];
        if flen == len {
            self.free.remove(slot);
        } else {
            self.free[slot] = (base + len, flen - len);
        }
        Some(base)
    }

    pub fn free(&mut self, base: u32, len: u32) {
        if len == 0 {
            return;
        }
        debug_assert!(base + len <= self.capacity);
        let slot = self
            .free
            .iter()
            .position(|&(fbase, _)| fbase > base)
            .unwrap_or(self.free.len());
        self.free.insert(slot, (base, len));
        // coalesce with neighbors
        if slot + 1 < self.free.len() && base + len == self.free[slot + 1].0 {
            self.free[slot].1 += self.free[slot + 1].1;
            self.free.remove(slot + 1);
        }
        if slot > 0 && self.free[slot - 1].0 + self.free[slot - 1].1 == base {
            self.free[slot - 1].1 += self.free[slot].1;
            self.free.remove(slot);
        }
    }

    pub fn available(&self) -> u32 {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Per-scene entry in the device address table; bases are element
/// indices into the arenas.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PackedSceneAddrs {
    pub vertex_base: u32,
    pub index_base: u32,
    pub mesh_base: u32,
    pub material_base: u32,
    pub blas_base: u32,
    pub texture_base: u32,
    pub num_meshes: u32,
    pub _pad: u32,
}

/// Element counts a scene needs from each arena.
#[derive(Debug, Clone, Copy)]
pub struct SceneCounts {
    pub vertices: u32,
    pub indices: u32,
    pub meshes: u32,
    pub materials: u32,
    pub blas_nodes: u32,
    pub textures: u32,
}

/// CPU bookkeeping behind the shared lock. Separate from the GPU state
/// so the allocation and reuse rules stay unit-testable.
#[derive(Debug)]
pub struct ScenePool {
    free_ids: Vec<u32>,
    next_id: u32,
    vertex: RangeAllocator,
    index: RangeAllocator,
    mesh: RangeAllocator,
    material: RangeAllocator,
    blas: RangeAllocator,
    texture: RangeAllocator,
}

impl ScenePool {
    pub fn new() -> Self {
        Self {
            free_ids: Vec::new(),
            next_id: 0,
            vertex: RangeAllocator::new(VERTEX_ARENA_ELEMS),
            index: RangeAllocator::new(INDEX_ARENA_ELEMS),
            mesh: RangeAllocator::new(MESH_ARENA_ELEMS),
            material: RangeAllocator::new(MATERIAL_ARENA_ELEMS),
            blas: RangeAllocator::new(BLAS_ARENA_NODES),
            texture: RangeAllocator::new(TEXTURE_ARRAY_LAYERS),
        }
    }

    /// Reserve arena ranges for a scene; all-or-nothing.
    pub fn allocate_ranges(&mut self, counts: &SceneCounts) -> RenderResult<SceneAllocation> {
        let mut alloc = SceneAllocation {
            num_vertices: counts.vertices,
            num_indices: counts.indices,
            num_meshes: counts.meshes,
            num_materials: counts.materials,
            num_blas_nodes: counts.blas_nodes,
            num_textures: counts.textures,
            ..Default::default()
        };
        let mut taken: Vec<(usize, u32, u32)> = Vec::new();
        let arenas: [(&str, u32, &mut u32); 6] = [
            ("vertex", counts.vertices, &mut alloc.vertex_base),
            ("index", counts.indices, &mut alloc.index_base),
            ("mesh", counts.meshes, &mut alloc.mesh_base),
            ("material", counts.materials, &mut alloc.material_base),
            ("blas", counts.blas_nodes, &mut alloc.blas_base),
            ("texture", counts.textures, &mut alloc.texture_base),
        ];
        for (slot, (name, len, base)) in arenas.into_iter().enumerate() {
            match self.allocator_mut(slot).alloc(len) {
                Some(b) => {
                    *base = b;
                    taken.push((slot, b, len));
                }
                None => {
                    for (s, b, l) in taken {
                        self.allocator_mut(s).free(b, l);
                    }
                    return Err(RenderError::capacity(format!(
                        "{name} arena exhausted ({len} elements requested)"
                    )));
                }
            }
        }
        Ok(alloc)
    }

    pub fn free_ranges(&mut self, alloc: &SceneAllocation) {
        self.vertex.free(alloc.vertex_base, alloc.num_vertices);
        self.index.free(alloc.index_base, alloc.num_indices);
        self.mesh.free(alloc.mesh_base, alloc.num_meshes);
        self.material.free(alloc.material_base, alloc.num_materials);
        self.blas.free(alloc.blas_base, alloc.num_blas_nodes);
        self.texture.free(alloc.texture_base, alloc.num_textures);
    }

    /// Draw an id: reuse a released one, extend the pool otherwise.
    pub fn alloc_id(&mut self) -> RenderResult<SceneId> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(SceneId(id));
        }
        if self.next_id >= limits::MAX_SCENES {
            return Err(RenderError::capacity(format!(
                "all {} scene ids live",
                limits::MAX_SCENES
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(SceneId(id))
    }

    pub fn release_id(&mut self, id: SceneId) {
        debug_assert!(!self.free_ids.contains(&id.0));
        self.free_ids.push(id.0);
    }

    pub fn live_ids(&self) -> u32 {
        self.next_id - self.free_ids.len() as u32
    }

    fn allocator_mut(&mut self, slot: usize) -> &mut RangeAllocator {
        match slot {
            0 => &mut self.vertex,
            1 => &mut self.index,
            2 => &mut self.mesh,
            3 => &mut self.material,
            4 => &mut self.blas,
            _ => &mut self.texture,
        }
    }
}

impl Default for ScenePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Device arenas plus the shared bind group every dispatch sees.
pub struct SharedSceneState {
    pool: Mutex<ScenePool>,
    queue: Arc<wgpu::Queue>,
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub mesh_buffer: wgpu::Buffer,
    pub material_buffer: wgpu::Buffer,
    pub blas_buffer: wgpu::Buffer,
    pub table_buffer: wgpu::Buffer,
    pub texture_array: wgpu::Texture,
    pub texture_dim: u32,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl SharedSceneState {
    pub fn new(
        device: &wgpu::Device,
        queue: Arc<wgpu::Queue>,
        max_texture_resolution: u32,
    ) -> Arc<Self> {
        let storage = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };

        let vertex_buffer = storage(
            "scene-vertex-arena",
            VERTEX_ARENA_ELEMS as u64 * mem::size_of::<PackedVertex>() as u64,
        );
        let index_buffer = storage(
            "scene-index-arena",
            INDEX_ARENA_ELEMS as u64 * mem::size_of::<u32>() as u64,
        );
        let mesh_buffer = storage(
            "scene-mesh-arena",
            MESH_ARENA_ELEMS as u64 * mem::size_of::<PackedMeshInfo>() as u64,
        );
        let material_buffer = storage(
            "scene-material-arena",
            MATERIAL_ARENA_ELEMS as u64 * mem::size_of::<PackedMaterial>() as u64,
        );
        let blas_buffer = storage(
            "scene-blas-arena",
            BLAS_ARENA_NODES as u64 * mem::size_of::<BvhNode>() as u64,
        );
        let table_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scene-table"),
            contents: bytemuck::cast_slice(
                &[PackedSceneAddrs::default(); limits::MAX_SCENES as usize],
            ),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });

        let texture_dim = match max_texture_resolution {
            0 => DEFAULT_TEXTURE_DIM,
            dim => dim.min(DEFAULT_TEXTURE_DIM),
        };
        let texture_array = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("scene-texture-array"),
            size: wgpu::Extent3d {
                width: texture_dim,
                height: texture_dim,
                depth_or_array_layers: TEXTURE_ARRAY_LAYERS,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let texture_view = texture_array.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("scene-sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            ..Default::default()
        });

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("shared-scene-bgl"),
                entries: &[
                    storage_entry(0),
                    storage_entry(1),
                    storage_entry(2),
                    storage_entry(3),
                    storage_entry(4),
                    storage_entry(5),
                    wgpu::BindGroupLayoutEntry {
                        binding: 6,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2Array,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 7,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shared-scene-bg"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: table_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: vertex_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: index_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: mesh_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: material_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: blas_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::TextureView(&texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        Arc::new(Self {
            pool: Mutex::new(ScenePool::new()),
            queue,
            vertex_buffer,
            index_buffer,
            mesh_buffer,
            material_buffer,
            blas_buffer,
            table_buffer,
            texture_array,
            texture_dim,
            bind_group_layout,
            bind_group,
        })
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    /// Reserve arena ranges before upload. Lock scope: allocation only.
    pub fn allocate_ranges(&self, counts: &SceneCounts) -> RenderResult<SceneAllocation> {
        self.pool
            .lock()
            .map_err(|_| RenderError::load("scene pool lock poisoned"))?
            .allocate_ranges(counts)
    }

    /// Draw the scene id and publish the arena bases to the device table.
    /// Called after geometry upload; lock scope: id + table write.
    pub fn publish(&self, alloc: &SceneAllocation) -> RenderResult<SceneId> {
        let mut pool = self
            .pool
            .lock()
            .map_err(|_| RenderError::load("scene pool lock poisoned"))?;
        let id = pool.alloc_id()?;
        let entry = PackedSceneAddrs {
            vertex_base: alloc.vertex_base,
            index_base: alloc.index_base,
            mesh_base: alloc.mesh_base,
            material_base: alloc.material_base,
            blas_base: alloc.blas_base,
            texture_base: alloc.texture_base,
            num_meshes: alloc.num_meshes,
            _pad: 0,
        };
        self.queue.write_buffer(
            &self.table_buffer,
            id.0 as u64 * mem::size_of::<PackedSceneAddrs>() as u64,
            bytemuck::bytes_of(&entry),
        );
        Ok(id)
    }

    /// Undo a range reservation that was never published.
    pub fn release_ranges_only(&self, alloc: &SceneAllocation) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.free_ranges(alloc);
        }
    }

    /// Return the id and arena ranges; called from `Scene::drop`.
    pub fn release(&self, id: SceneId, alloc: &SceneAllocation) {
        // Poison here means a loader panicked; nothing left to unwind.
        if let Ok(mut pool) = self.pool.lock() {
            pool.free_ranges(alloc);
            pool.release_id(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_first_fit_and_coalesce() {
        let mut a = RangeAllocator::new(100);
        let x = a.alloc(40).unwrap();
        let y = a.alloc(40).unwrap();
        assert_eq!((x, y), (0, 40));
        assert!(a.alloc(40).is_none());
        a.free(x, 40);
        a.free(y, 40);
        // coalesced back into one range
        assert_eq!(a.alloc(100).unwrap(), 0);
    }

    #[test]
    fn allocator_reuses_freed_hole() {
        let mut a = RangeAllocator::new(30);
        let x = a.alloc(10).unwrap();
        let _y = a.alloc(10).unwrap();
        a.free(x, 10);
        assert_eq!(a.alloc(10).unwrap(), 0);
        assert_eq!(a.available(), 10);
    }

    fn counts(vertices: u32) -> SceneCounts {
        SceneCounts {
            vertices,
            indices: 3,
            meshes: 1,
            materials: 1,
            blas_nodes: 1,
            textures: 0,
        }
    }

    #[test]
    fn ids_are_distinct_and_reused() {
        let mut pool = ScenePool::new();
        let a = pool.alloc_id().unwrap();
        let b = pool.alloc_id().unwrap();
        assert_ne!(a, b);
        pool.release_id(a);
        let c = pool.alloc_id().unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.live_ids(), 2);
    }

    #[test]
    fn id_pool_is_bounded() {
        let mut pool = ScenePool::new();
        let ids: Vec<_> = (0..limits::MAX_SCENES)
            .map(|_| pool.alloc_id().unwrap())
            .collect();
        assert!(matches!(
            pool.alloc_id(),
            Err(RenderError::Capacity(_))
        ));
        pool.release_id(ids[3]);
        assert_eq!(pool.alloc_id().unwrap(), ids[3]);
    }

    #[test]
    fn failed_range_allocation_rolls_back() {
        let mut pool = ScenePool::new();
        let before = pool.vertex.available();
        // index demand exceeds its arena while vertices would fit
        let err = pool.allocate_ranges(&SceneCounts {
            vertices: 10,
            indices: INDEX_ARENA_ELEMS + 1,
            meshes: 1,
            materials: 1,
            blas_nodes: 1,
            textures: 0,
        });
        assert!(err.is_err());
        assert_eq!(pool.vertex.available(), before);
    }

    #[test]
    fn ranges_return_on_free() {
        let mut pool = ScenePool::new();
        let alloc = pool.allocate_ranges(&counts(100)).unwrap();
        let after = pool.vertex.available();
        assert_eq!(after, VERTEX_ARENA_ELEMS - 100);
        pool.free_ranges(&alloc);
        assert_eq!(pool.vertex.available(), VERTEX_ARENA_ELEMS);
    }
}
