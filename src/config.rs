//! Renderer configuration and fixed capacity limits.
//!
//! `RenderConfig` is the single value handed to `Renderer::new`; the
//! `limits` module holds the compile-time capacities that size the shared
//! scene table and the per-batch linear parameter regions. Shader-side
//! constants are generated from the same values, so the two sides cannot
//! drift independently.

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Feature-flag bitmask carried by [`RenderConfig`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderFlags(u32);

impl RenderFlags {
    pub const NONE: RenderFlags = RenderFlags(0);
    /// Write normal/albedo buffers alongside the color output.
    pub const AUXILIARY_OUTPUTS: RenderFlags = RenderFlags(1 << 0);
    /// Run the exposure-histogram + tonemap passes after tracing.
    pub const TONEMAP: RenderFlags = RenderFlags(1 << 1);
    /// Draw per-environment domain-randomization parameters on creation.
    pub const RANDOMIZE: RenderFlags = RenderFlags(1 << 2);
    /// Drive sampling with the per-tile convergence loop.
    pub const ADAPTIVE_SAMPLE: RenderFlags = RenderFlags(1 << 3);
    /// Run the denoise pass over HDR/albedo/normal before tonemapping.
    pub const DENOISE: RenderFlags = RenderFlags(1 << 4);
    /// Force uniform sampling even when the Z-sobol budget would fit.
    pub const FORCE_UNIFORM: RenderFlags = RenderFlags(1 << 5);

    pub fn contains(self, other: RenderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits as the kernels see them.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn without(self, other: RenderFlags) -> RenderFlags {
        RenderFlags(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RenderFlags {
    type Output = RenderFlags;
    fn bitor(self, rhs: RenderFlags) -> RenderFlags {
        RenderFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RenderFlags {
    fn bitor_assign(&mut self, rhs: RenderFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RenderFlags {
    type Output = RenderFlags;
    fn bitand(self, rhs: RenderFlags) -> RenderFlags {
        RenderFlags(self.0 & rhs.0)
    }
}

/// Which trace kernel drives the batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    /// Unbiased path tracing.
    PathTracer,
    /// Biased shading that looks up baked irradiance probes for indirect
    /// light. Requires a probe bake (or probe file) before rendering.
    Biased,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Index into the system's adapter list.
    pub gpu_id: u32,
    /// Number of concurrent scene loaders the caller intends to create.
    pub num_loaders: u32,
    /// Environments rendered per launch.
    pub batch_size: u32,
    pub img_width: u32,
    pub img_height: u32,
    /// Samples per pixel per render call.
    pub spp: u32,
    /// Maximum path depth (1 = primary rays only).
    pub max_depth: u32,
    /// Scene textures are downsampled to this resolution at load.
    /// 0 means unlimited.
    pub max_texture_resolution: u32,
    /// Keep two batch states in flight (caller overlap control).
    pub double_buffered: bool,
    /// Clamp for indirect bounces; 0 disables clamping.
    pub clamp_threshold: f32,
    pub mode: RenderMode,
    pub flags: RenderFlags,
    /// Irradiance-probe file read or written by `bake`. Required in
    /// `Biased` mode.
    pub probe_path: Option<std::path::PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            num_loaders: 1,
            batch_size: 1,
            img_width: 128,
            img_height: 128,
            spp: 8,
            max_depth: 4,
            max_texture_resolution: 0,
            double_buffered: false,
            clamp_threshold: 0.0,
            mode: RenderMode::PathTracer,
            flags: RenderFlags::NONE,
            probe_path: None,
        }
    }
}

/// Fixed capacities shared between host-side packing code and the WGSL
/// kernels. Changing any of these changes the wire contract.
pub mod limits {
    /// Bound on concurrently live scenes (sizes the shared scene table).
    pub const MAX_SCENES: u32 = 16;
    /// Per-batch bound on instances across all environments.
    pub const MAX_INSTANCES: u32 = 4096;
    /// Per-batch bound on lights across all environments.
    pub const MAX_LIGHTS: u32 = 1024;
    /// Per-scene bound on materials.
    pub const MAX_MATERIALS: u32 = 2048;
    /// Per-scene bound on meshes.
    pub const MAX_MESHES: u32 = 1024;
    /// Texture layers addressable per scene.
    pub const MAX_SCENE_TEXTURES: u32 = 64;
    /// Environment maps addressable in one group.
    pub const MAX_ENV_MAPS: u32 = 32;
    /// Upper bound on adaptive work items per iteration.
    pub const MAX_TILES: u32 = 1 << 16;

    /// Trace kernel workgroup shape. A tile is one workgroup's pixel
    /// footprint.
    pub const LOCAL_WORKGROUP_X: u32 = 8;
    pub const LOCAL_WORKGROUP_Y: u32 = 8;
    pub const LOCAL_WORKGROUP_Z: u32 = 1;

    /// Samples each adaptive work item contributes per pixel.
    pub const ADAPTIVE_SAMPLES_PER_THREAD: u32 = 8;
    /// Sample chunk per probe-bake dispatch.
    pub const BAKE_SAMPLES_PER_CHUNK: u32 = 64;
    /// Minibatch subdivision of the batch framebuffer plane.
    pub const MINIBATCH_DIVISOR: u32 = 8;

    /// Device-resident arena shared by all live scenes.
    pub const SCENE_ARENA_BYTES: u64 = 128 << 20;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_ops() {
        let f = RenderFlags::TONEMAP | RenderFlags::ADAPTIVE_SAMPLE;
        assert!(f.contains(RenderFlags::TONEMAP));
        assert!(f.contains(RenderFlags::ADAPTIVE_SAMPLE));
        assert!(!f.contains(RenderFlags::DENOISE));
        assert!(RenderFlags::NONE.is_empty());
    }

    #[test]
    fn config_serde_round_trip() {
        let cfg = RenderConfig {
            batch_size: 16,
            flags: RenderFlags::TONEMAP | RenderFlags::RANDOMIZE,
            mode: RenderMode::Biased,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RenderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size, 16);
        assert_eq!(back.mode, RenderMode::Biased);
        assert!(back.flags.contains(RenderFlags::RANDOMIZE));
    }
}
