//! Scene data: blob parsing, GPU-ready packed records, and the shared
//! scene lifecycle.
//!
//! Scenes arrive as preprocessed binary blobs produced by the external
//! conversion tool; this crate only reads them. A loaded `Scene` is
//! immutable and `Arc`-shared between environments; it owns ranges in the
//! device-resident arenas plus a `SceneId` drawn from a bounded pool, all
//! returned on last release.

pub mod loader;
pub mod shared;

pub use loader::{EnvironmentMapGroup, WgpuLoader};
pub use shared::SharedSceneState;

use crate::accel::Aabb;
use crate::config::limits;
use crate::error::{RenderError, RenderResult};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

const BLOB_MAGIC: &[u8; 4] = b"RBSC";
const BLOB_VERSION: u32 = 1;

/// Vertex as stored in the blob and the device vertex arena. Padded to
/// 48 bytes so WGSL `array<Vertex>` strides match.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PackedVertex {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub normal: [f32; 3],
    pub _pad1: f32,
    pub uv: [f32; 2],
    pub _pad2: [f32; 2],
}

/// Per-mesh record in the device mesh-info arena. `blas_root` is filled
/// in after the BLAS build (node offset inside the scene's BLAS range).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PackedMeshInfo {
    pub index_offset: u32,
    pub num_triangles: u32,
    pub material_idx: u32,
    pub blas_root: u32,
}

/// Material record shared by the blob and the device material arena.
/// `tex_scale` maps normalized UVs into the occupied region of the
/// texture-array layer and is computed at load time.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PackedMaterial {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    /// Layer index relative to the scene's texture base; `u32::MAX`
    /// means untextured.
    pub base_texture_idx: u32,
    pub _pad0: u32,
    pub tex_scale: [f32; 2],
    pub _pad1: [f32; 2],
}

pub const NO_TEXTURE: u32 = u32::MAX;

/// RGBA8 texture payload from the blob.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Parsed, validated scene blob ready for upload.
#[derive(Debug, Clone)]
pub struct SceneLoadData {
    pub vertices: Vec<PackedVertex>,
    pub indices: Vec<u32>,
    pub meshes: Vec<PackedMeshInfo>,
    pub materials: Vec<PackedMaterial>,
    pub textures: Vec<TextureData>,
    pub world_aabb: Aabb,
}

struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> RenderResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| RenderError::load("scene blob truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> RenderResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> RenderResult<f32> {
        Ok(f32::from_bits(self.u32()?))
    }
}

impl SceneLoadData {
    pub fn from_file(path: &Path) -> RenderResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Parse and validate a little-endian scene blob.
    pub fn parse(bytes: &[u8]) -> RenderResult<Self> {
        let mut r = BlobReader::new(bytes);

        if r.bytes(4)? != BLOB_MAGIC {
            return Err(RenderError::load("scene blob magic mismatch"));
        }
        let version = r.u32()?;
        if version != BLOB_VERSION {
            return Err(RenderError::load(format!(
                "scene blob version {version}, expected {BLOB_VERSION}"
            )));
        }

        let num_meshes = r.u32()?;
        let num_vertices = r.u32()?;
        let num_indices = r.u32()?;
        let num_materials = r.u32()?;
        let num_textures = r.u32()?;

        if num_meshes == 0 || num_vertices == 0 || num_indices == 0 {
            return Err(RenderError::load("scene blob has no geometry"));
        }
        if num_meshes > limits::MAX_MESHES {
            return Err(RenderError::capacity(format!(
                "{num_meshes} meshes exceeds {}",
                limits::MAX_MESHES
            )));
        }
        if num_materials > limits::MAX_MATERIALS {
            return Err(RenderError::capacity(format!(
                "{num_materials} materials exceeds {}",
                limits::MAX_MATERIALS
            )));
        }
        if num_textures > limits::MAX_SCENE_TEXTURES {
            return Err(RenderError::capacity(format!(
                "{num_textures} textures exceeds {}",
                limits::MAX_SCENE_TEXTURES
            )));
        }

        let mut world_aabb = Aabb::empty();
        for i in 0..3 {
            world_aabb.min[i] = r.f32()?;
        }
        for i in 0..3 {
            world_aabb.max[i] = r.f32()?;
        }
        if !world_aabb.is_valid() {
            return Err(RenderError::load("scene blob world bounds inverted"));
        }

        let mut vertices = Vec::with_capacity(num_vertices as usize);
        for _ in 0..num_vertices {
            let mut position = [0.0; 3];
            let mut normal = [0.0; 3];
            let mut uv = [0.0; 2];
            for v in &mut position {
                *v = r.f32()?;
            }
            for v in &mut normal {
                *v = r.f32()?;
            }
            for v in &mut uv {
                *v = r.f32()?;
            }
            vertices.push(PackedVertex {
                position,
                normal,
                uv,
                ..Default::default()
            });
        }

        let mut indices = Vec::with_capacity(num_indices as usize);
        for _ in 0..num_indices {
            let idx = r.u32()?;
            if idx >= num_vertices {
                return Err(RenderError::load(format!(
                    "index {idx} out of range ({num_vertices} vertices)"
                )));
            }
            indices.push(idx);
        }

        let mut meshes = Vec::with_capacity(num_meshes as usize);
        for _ in 0..num_meshes {
            let index_offset = r.u32()?;
            let index_count = r.u32()?;
            let material_idx = r.u32()?;
            if index_count == 0 || index_count % 3 != 0 {
                return Err(RenderError::load("mesh index count not a triangle list"));
            }
            match index_offset.checked_add(index_count) {
                Some(end) if end <= num_indices => {}
                _ => return Err(RenderError::load("mesh index range out of bounds")),
            }
            if material_idx >= num_materials {
                return Err(RenderError::load("mesh references missing material"));
            }
            meshes.push(PackedMeshInfo {
                index_offset,
                num_triangles: index_count / 3,
                material_idx,
                blas_root: 0,
            });
        }

        let mut materials = Vec::with_capacity(num_materials as usize);
        for _ in 0..num_materials {
            let mut base_color = [0.0; 4];
            for v in &mut base_color {
                *v = r.f32()?;
            }
            let metallic = r.f32()?;
            let roughness = r.f32()?;
            let base_texture_idx = r.u32()?;
            let _reserved = r.u32()?;
            if base_texture_idx != NO_TEXTURE && base_texture_idx >= num_textures {
                return Err(RenderError::load("material references missing texture"));
            }
            materials.push(PackedMaterial {
                base_color,
                metallic,
                roughness,
                base_texture_idx,
                tex_scale: [1.0, 1.0],
                ..Default::default()
            });
        }

        let mut textures = Vec::with_capacity(num_textures as usize);
        for _ in 0..num_textures {
            let width = r.u32()?;
            let height = r.u32()?;
            if width == 0 || height == 0 {
                return Err(RenderError::load("zero-sized scene texture"));
            }
            let len = (width as usize)
                .checked_mul(height as usize)
                .and_then(|p| p.checked_mul(4))
                .ok_or_else(|| RenderError::load("scene texture size overflow"))?;
            let data = r.bytes(len)?.to_vec();
            textures.push(TextureData {
                width,
                height,
                data,
            });
        }

        Ok(Self {
            vertices,
            indices,
            meshes,
            materials,
            textures,
            world_aabb,
        })
    }

    /// Triangle positions for one mesh, used by the BLAS build.
    pub fn mesh_positions(&self, mesh: &PackedMeshInfo) -> (Vec<Vec3>, Vec<u32>) {
        let positions = self
            .vertices
            .iter()
            .map(|v| Vec3::from(v.position))
            .collect();
        let start = mesh.index_offset as usize;
        let end = start + (mesh.num_triangles * 3) as usize;
        (positions, self.indices[start..end].to_vec())
    }
}

/// Identifier of a live scene; indexes the shared scene table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneId(pub u32);

/// Element ranges a scene owns inside the device arenas.
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneAllocation {
    pub vertex_base: u32,
    pub num_vertices: u32,
    pub index_base: u32,
    pub num_indices: u32,
    pub mesh_base: u32,
    pub num_meshes: u32,
    pub material_base: u32,
    pub num_materials: u32,
    pub blas_base: u32,
    pub num_blas_nodes: u32,
    pub texture_base: u32,
    pub num_textures: u32,
}

/// Immutable loaded scene. Dropping the last `Arc` returns the id and the
/// arena ranges to [`SharedSceneState`].
pub struct Scene {
    id: SceneId,
    allocation: SceneAllocation,
    world_aabb: Aabb,
    /// Object-space bounds of each mesh BLAS root; TLAS builds transform
    /// these per instance.
    mesh_aabbs: Vec<Aabb>,
    /// Scene-relative BLAS root node offset per mesh.
    mesh_blas_roots: Vec<u32>,
    /// Material index each mesh references by default.
    mesh_materials: Vec<u32>,
    /// `None` only for detached scenes in tests.
    shared: Option<Arc<SharedSceneState>>,
}

impl Scene {
    pub(crate) fn new(
        id: SceneId,
        allocation: SceneAllocation,
        world_aabb: Aabb,
        mesh_aabbs: Vec<Aabb>,
        mesh_blas_roots: Vec<u32>,
        mesh_materials: Vec<u32>,
        shared: Arc<SharedSceneState>,
    ) -> Self {
        Self {
            id,
            allocation,
            world_aabb,
            mesh_aabbs,
            mesh_blas_roots,
            mesh_materials,
            shared: Some(shared),
        }
    }

    /// Scene with no backing arenas; for exercising TLAS and packing
    /// logic without a device.
    #[cfg(test)]
    pub(crate) fn detached(
        world_aabb: Aabb,
        mesh_aabbs: Vec<Aabb>,
        mesh_blas_roots: Vec<u32>,
        mesh_materials: Vec<u32>,
    ) -> Self {
        let allocation = SceneAllocation {
            num_meshes: mesh_aabbs.len() as u32,
            ..Default::default()
        };
        Self {
            id: SceneId(0),
            allocation,
            world_aabb,
            mesh_aabbs,
            mesh_blas_roots,
            mesh_materials,
            shared: None,
        }
    }

    pub fn mesh_aabbs(&self) -> &[Aabb] {
        &self.mesh_aabbs
    }

    pub fn mesh_blas_roots(&self) -> &[u32] {
        &self.mesh_blas_roots
    }

    pub fn mesh_materials(&self) -> &[u32] {
        &self.mesh_materials
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn allocation(&self) -> &SceneAllocation {
        &self.allocation
    }

    /// Default bounding box; the probe grid spans this volume.
    pub fn world_aabb(&self) -> Aabb {
        self.world_aabb
    }

    pub fn num_meshes(&self) -> u32 {
        self.allocation.num_meshes
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.id)
            .field("allocation", &self.allocation)
            .finish()
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.release(self.id, &self.allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_f32(buf: &mut Vec<u8>, v: f32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn tiny_blob() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"RBSC");
        push_u32(&mut buf, 1); // version
        push_u32(&mut buf, 1); // meshes
        push_u32(&mut buf, 3); // vertices
        push_u32(&mut buf, 3); // indices
        push_u32(&mut buf, 1); // materials
        push_u32(&mut buf, 0); // textures
        for v in [0.0, 0.0, 0.0, 1.0, 1.0, 1.0] {
            push_f32(&mut buf, v);
        }
        // vertices: position, normal, uv
        for (px, py) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)] {
            push_f32(&mut buf, px);
            push_f32(&mut buf, py);
            push_f32(&mut buf, 0.0);
            for n in [0.0, 0.0, 1.0] {
                push_f32(&mut buf, n);
            }
            push_f32(&mut buf, px);
            push_f32(&mut buf, py);
        }
        for i in [0u32, 1, 2] {
            push_u32(&mut buf, i);
        }
        // mesh: offset, count, material
        push_u32(&mut buf, 0);
        push_u32(&mut buf, 3);
        push_u32(&mut buf, 0);
        // material
        for c in [0.8, 0.2, 0.2, 1.0] {
            push_f32(&mut buf, c);
        }
        push_f32(&mut buf, 0.0); // metallic
        push_f32(&mut buf, 0.5); // roughness
        push_u32(&mut buf, NO_TEXTURE);
        push_u32(&mut buf, 0); // reserved
        buf
    }

    #[test]
    fn parses_minimal_blob() {
        let data = SceneLoadData::parse(&tiny_blob()).unwrap();
        assert_eq!(data.vertices.len(), 3);
        assert_eq!(data.indices, vec![0, 1, 2]);
        assert_eq!(data.meshes.len(), 1);
        assert_eq!(data.meshes[0].num_triangles, 1);
        assert_eq!(data.materials[0].base_texture_idx, NO_TEXTURE);
        assert_eq!(data.world_aabb.max, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = tiny_blob();
        blob[0] = b'X';
        assert!(matches!(
            SceneLoadData::parse(&blob),
            Err(RenderError::Load(_))
        ));
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = tiny_blob();
        let cut = &blob[..blob.len() - 8];
        assert!(matches!(
            SceneLoadData::parse(cut),
            Err(RenderError::Load(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut blob = tiny_blob();
        // first index lives right after header + bounds + 3 vertices
        let index_pos = 4 + 4 + 5 * 4 + 6 * 4 + 3 * 32;
        blob[index_pos..index_pos + 4].copy_from_slice(&99u32.to_le_bytes());
        assert!(SceneLoadData::parse(&blob).is_err());
    }

    #[test]
    fn rejects_non_triangle_mesh() {
        let mut blob = tiny_blob();
        let mesh_pos = 4 + 4 + 5 * 4 + 6 * 4 + 3 * 32 + 3 * 4;
        // index_count field follows index_offset
        blob[mesh_pos + 4..mesh_pos + 8].copy_from_slice(&4u32.to_le_bytes());
        assert!(SceneLoadData::parse(&blob).is_err());
    }
}
