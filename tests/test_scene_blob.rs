// tests/test_scene_blob.rs
// Scene blob parsing and validation against hand-built byte streams.
// RELEVANT FILES:src/scene/mod.rs

use raybatch::scene::{SceneLoadData, NO_TEXTURE};
use raybatch::RenderError;

struct BlobBuilder {
    bytes: Vec<u8>,
}

impl BlobBuilder {
    fn new() -> Self {
        Self {
            bytes: b"RBSC".to_vec(),
        }
    }

    fn u32(mut self, v: u32) -> Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn f32(mut self, v: f32) -> Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn f32s(mut self, vs: &[f32]) -> Self {
        for v in vs {
            self.bytes.extend_from_slice(&v.to_le_bytes());
        }
        self
    }
}

/// Two triangles sharing a material, no textures.
fn quad_blob() -> Vec<u8> {
    let b = BlobBuilder::new()
        .u32(1) // version
        .u32(1) // meshes
        .u32(4) // vertices
        .u32(6) // indices
        .u32(1) // materials
        .u32(0) // textures
        .f32s(&[0.0, 0.0, 0.0]) // world min
        .f32s(&[1.0, 1.0, 0.0]); // world max

    let verts = [
        ([0.0, 0.0, 0.0], [0.0, 0.0]),
        ([1.0, 0.0, 0.0], [1.0, 0.0]),
        ([1.0, 1.0, 0.0], [1.0, 1.0]),
        ([0.0, 1.0, 0.0], [0.0, 1.0]),
    ];
    let mut b = verts.iter().fold(b, |b, (pos, uv)| {
        b.f32s(pos).f32s(&[0.0, 0.0, 1.0]).f32s(uv)
    });
    for idx in [0u32, 1, 2, 0, 2, 3] {
        b = b.u32(idx);
    }
    b = b.u32(0).u32(6).u32(0); // mesh: offset, count, material
    b = b
        .f32s(&[0.8, 0.2, 0.2, 1.0]) // base color
        .f32(0.0) // metallic
        .f32(0.7) // roughness
        .u32(NO_TEXTURE)
        .u32(0); // reserved
    b.bytes
}

#[test]
fn quad_blob_parses() {
    let data = SceneLoadData::parse(&quad_blob()).unwrap();
    assert_eq!(data.vertices.len(), 4);
    assert_eq!(data.indices.len(), 6);
    assert_eq!(data.meshes.len(), 1);
    assert_eq!(data.meshes[0].num_triangles, 2);
    assert_eq!(data.materials.len(), 1);
    assert!(data.textures.is_empty());
    assert_eq!(data.world_aabb.max, [1.0, 1.0, 0.0]);
}

#[test]
fn wrong_magic_is_rejected() {
    let mut bytes = quad_blob();
    bytes[0] = b'X';
    assert!(matches!(
        SceneLoadData::parse(&bytes),
        Err(RenderError::Load(_))
    ));
}

#[test]
fn truncation_is_rejected_at_any_point() {
    let bytes = quad_blob();
    // every prefix short of the full blob must fail, never panic
    for len in 0..bytes.len() {
        assert!(SceneLoadData::parse(&bytes[..len]).is_err(), "prefix {len}");
    }
}

#[test]
fn out_of_range_vertex_index_is_rejected() {
    let full = quad_blob();
    let mut bytes = full.clone();
    // first index lives right after header + bounds + 4 vertices
    let index_pos = 4 + 4 + 5 * 4 + 6 * 4 + 4 * 8 * 4;
    bytes[index_pos..index_pos + 4].copy_from_slice(&99u32.to_le_bytes());
    assert!(SceneLoadData::parse(&bytes).is_err());
    // sanity: the unmodified offset still parses
    assert!(SceneLoadData::parse(&full).is_ok());
}

#[test]
fn mesh_positions_cover_the_index_range() {
    let data = SceneLoadData::parse(&quad_blob()).unwrap();
    let (positions, indices) = data.mesh_positions(&data.meshes[0]);
    assert_eq!(positions.len(), 4);
    assert_eq!(indices, vec![0, 1, 2, 0, 2, 3]);
}
