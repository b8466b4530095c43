//! CPU-built bounding volume hierarchies.
//!
//! Two layers share one node layout: a per-mesh BLAS built over triangles
//! at scene load, and a per-environment TLAS built over instance bounds
//! whenever the environment is dirty. Nodes are written in a GPU-ready
//! `#[repr(C)]` layout; the root is always node 0.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Axis-aligned bounding box in the layout the WGSL kernels read.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub _pad0: f32,
    pub max: [f32; 3],
    pub _pad1: f32,
}

impl Aabb {
    /// Inverted bounds; the identity for union.
    pub fn empty() -> Self {
        Self {
            min: [f32::INFINITY; 3],
            _pad0: 0.0,
            max: [f32::NEG_INFINITY; 3],
            _pad1: 0.0,
        }
    }

    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self {
            min,
            _pad0: 0.0,
            max,
            _pad1: 0.0,
        }
    }

    pub fn expand_point(&mut self, point: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(point[i]);
            self.max[i] = self.max[i].max(point[i]);
        }
    }

    pub fn expand_aabb(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    pub fn center(&self) -> Vec3 {
        (Vec3::from(self.min) + Vec3::from(self.max)) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        Vec3::from(self.max) - Vec3::from(self.min)
    }

    pub fn is_valid(&self) -> bool {
        self.min[0] <= self.max[0] && self.min[1] <= self.max[1] && self.min[2] <= self.max[2]
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.min[i] <= other.min[i] && self.max[i] >= other.max[i])
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

/// BVH node matching the WGSL struct. For internal nodes `left_idx` /
/// `right_idx` are child node indices; for leaves they are the first
/// primitive slot and the primitive count.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb: Aabb,
    pub kind: u32, // 0 = internal, 1 = leaf
    pub left_idx: u32,
    pub right_idx: u32,
    pub _pad: u32,
}

impl BvhNode {
    pub fn internal(aabb: Aabb, left: u32, right: u32) -> Self {
        Self {
            aabb,
            kind: 0,
            left_idx: left,
            right_idx: right,
            _pad: 0,
        }
    }

    pub fn leaf(aabb: Aabb, first_prim: u32, prim_count: u32) -> Self {
        Self {
            aabb,
            kind: 1,
            left_idx: first_prim,
            right_idx: prim_count,
            _pad: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == 1
    }
}

/// Per-instance record consumed by the trace kernel: world-to-object rows
/// plus the indices needed to resolve geometry after a TLAS leaf hit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PackedInstance {
    /// Rows of the inverse transform (object = inv * world).
    pub inv_transform: [[f32; 4]; 3],
    pub mesh_idx: u32,
    /// Node offset of the mesh BLAS root inside the scene arena region.
    pub blas_root: u32,
    pub material_idx: u32,
    pub flags: u32,
}

/// A built hierarchy: nodes (root first) and the primitive order leaves
/// index into.
#[derive(Debug, Clone)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    pub prim_order: Vec<u32>,
    pub world_aabb: Aabb,
}

const MAX_LEAF_SIZE: u32 = 4;
const MAX_DEPTH: u32 = 64;

/// Build over arbitrary primitive bounds. Median split on the longest
/// centroid axis; degenerate splits collapse to a leaf.
pub fn build_bvh(prim_aabbs: &[Aabb]) -> Bvh {
    assert!(!prim_aabbs.is_empty(), "bvh build over zero primitives");

    let mut world_aabb = Aabb::empty();
    for aabb in prim_aabbs {
        world_aabb.expand_aabb(aabb);
    }

    let mut order: Vec<u32> = (0..prim_aabbs.len() as u32).collect();
    let mut nodes = Vec::with_capacity(2 * prim_aabbs.len());
    let count = order.len() as u32;
    build_subtree(prim_aabbs, &mut order, &mut nodes, world_aabb, 0, count, 0);

    Bvh {
        nodes,
        prim_order: order,
        world_aabb,
    }
}

fn bounds_of(prim_aabbs: &[Aabb], order: &[u32]) -> Aabb {
    let mut aabb = Aabb::empty();
    for &idx in order {
        aabb.expand_aabb(&prim_aabbs[idx as usize]);
    }
    aabb
}

fn build_subtree(
    prim_aabbs: &[Aabb],
    order: &mut Vec<u32>,
    nodes: &mut Vec<BvhNode>,
    aabb: Aabb,
    first: u32,
    count: u32,
    depth: u32,
) -> u32 {
    let node_idx = nodes.len() as u32;
    nodes.push(BvhNode::zeroed());

    if count <= MAX_LEAF_SIZE || depth >= MAX_DEPTH {
        nodes[node_idx as usize] = BvhNode::leaf(aabb, first, count);
        return node_idx;
    }

    let slice = &mut order[first as usize..(first + count) as usize];
    let axis = {
        let e = aabb.extent();
        if e.x >= e.y && e.x >= e.z {
            0
        } else if e.y >= e.z {
            1
        } else {
            2
        }
    };
    slice.sort_unstable_by(|&a, &b| {
        let ca = prim_aabbs[a as usize].center()[axis];
        let cb = prim_aabbs[b as usize].center()[axis];
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mid = count / 2;
    let left_aabb = bounds_of(prim_aabbs, &order[first as usize..(first + mid) as usize]);
    let right_aabb = bounds_of(
        prim_aabbs,
        &order[(first + mid) as usize..(first + count) as usize],
    );

    let left = build_subtree(prim_aabbs, order, nodes, left_aabb, first, mid, depth + 1);
    let right = build_subtree(
        prim_aabbs,
        order,
        nodes,
        right_aabb,
        first + mid,
        count - mid,
        depth + 1,
    );
    nodes[node_idx as usize] = BvhNode::internal(aabb, left, right);
    node_idx
}

/// Triangle bounds for a mesh slice of the scene's index array.
pub fn triangle_aabbs(positions: &[Vec3], indices: &[u32]) -> Vec<Aabb> {
    indices
        .chunks_exact(3)
        .map(|tri| {
            let mut aabb = Aabb::empty();
            for &i in tri {
                aabb.expand_point(positions[i as usize].to_array());
            }
            aabb
        })
        .collect()
}

/// Bounds of `aabb` after `transform` (all eight corners).
pub fn transform_aabb(aabb: &Aabb, transform: &Mat4) -> Aabb {
    let mut out = Aabb::empty();
    for i in 0..8 {
        let corner = Vec3::new(
            if i & 1 == 0 { aabb.min[0] } else { aabb.max[0] },
            if i & 2 == 0 { aabb.min[1] } else { aabb.max[1] },
            if i & 4 == 0 { aabb.min[2] } else { aabb.max[2] },
        );
        out.expand_point(transform.transform_point3(corner).to_array());
    }
    out
}

/// Pack the top three rows of an inverse transform for the kernel.
pub fn pack_inverse_rows(transform: &Mat4) -> [[f32; 4]; 3] {
    let inv = transform.inverse();
    // glam is column-major; the kernel consumes rows.
    let m = inv.to_cols_array_2d();
    [
        [m[0][0], m[1][0], m[2][0], m[3][0]],
        [m[0][1], m[1][1], m[2][1], m[3][1]],
        [m[0][2], m[1][2], m[2][2], m[3][2]],
    ]
}
