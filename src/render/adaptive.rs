//! Adaptive-sampling work emission and convergence decisions.
//!
//! The orchestrator drives a bounded loop: emit one work item per
//! unconverged (environment, tile) pair, dispatch, read back per-tile
//! statistics plus each environment's mean illuminance, and re-emit
//! whatever has not converged. A tile is converged once it carries at
//! least the minimum sample count AND its normalized variance sits under
//! the threshold; the loop stops when nothing is pending or a tile hits
//! the sample cap, never beyond it.

use crate::batch::{AdaptiveTile, FramebufferConfig, InputTile};
use crate::config::limits;

/// Relative-variance threshold a tile must reach.
pub const CONVERGENCE_THRESHOLD: f32 = 5e-4;
/// Per-pixel sample cap across all iterations.
pub const MAX_ADAPTIVE_SAMPLES: u32 = 10_000;

pub fn tile_converged(
    stats: &AdaptiveTile,
    illuminance: f32,
    threshold: f32,
    min_samples: u32,
) -> bool {
    if stats.samples < min_samples {
        return false;
    }
    let variance = stats.m2 / stats.samples as f32;
    let scale = (illuminance * illuminance).max(1e-6);
    variance / scale < threshold
}

/// Per-batch adaptive loop state. Indexing is env-major: the slot of
/// tile (t) in environment (e) is `e * tiles_per_env + t`.
pub struct AdaptiveState {
    images_wide: u32,
    tiles_wide: u32,
    tiles_per_env: u32,
    pending: Vec<bool>,
    emitted: Vec<bool>,
    samples_done: Vec<u32>,
    min_samples: u32,
    max_samples: u32,
}

impl AdaptiveState {
    pub fn new(fb_cfg: &FramebufferConfig, batch_size: u32, spp: u32) -> Self {
        let total = (fb_cfg.tiles_per_env * batch_size) as usize;
        Self {
            images_wide: fb_cfg.images_wide,
            tiles_wide: fb_cfg.tiles_wide,
            tiles_per_env: fb_cfg.tiles_per_env,
            pending: vec![true; total],
            emitted: vec![false; total],
            samples_done: vec![0; total],
            min_samples: spp,
            max_samples: MAX_ADAPTIVE_SAMPLES,
        }
    }

    pub fn num_pending(&self) -> u32 {
        self.pending.iter().filter(|&&p| p).count() as u32
    }

    /// Work items for the next iteration; empty means the loop is done.
    /// Each emitted item advances its tile by one sample chunk.
    pub fn emit(&mut self) -> Vec<InputTile> {
        let chunk = limits::ADAPTIVE_SAMPLES_PER_THREAD;
        let mut items = Vec::new();
        self.emitted.fill(false);
        for slot in 0..self.pending.len() {
            if !self.pending[slot] {
                continue;
            }
            if items.len() as u32 >= limits::MAX_TILES {
                break;
            }
            self.emitted[slot] = true;
            let env = slot as u32 / self.tiles_per_env;
            let tile = slot as u32 % self.tiles_per_env;
            let tile_x = tile % self.tiles_wide;
            let tile_y = tile / self.tiles_wide;
            items.push(InputTile {
                batch_idx: env,
                x_base: tile_x * limits::LOCAL_WORKGROUP_X,
                y_base: tile_y * limits::LOCAL_WORKGROUP_Y,
                sample_offset: self.samples_done[slot],
            });
            self.samples_done[slot] += chunk;
        }
        items
    }

    /// Fold in read-back statistics; tiles at the cap stop regardless of
    /// variance. Only slots dispatched by the preceding `emit` are
    /// judged: the stats buffer persists across renders, so a slot held
    /// back by the per-iteration cap still carries stale numbers.
    pub fn update(&mut self, stats: &[AdaptiveTile], illuminance: &[f32]) {
        debug_assert_eq!(stats.len(), self.pending.len());
        for (slot, pending) in self.pending.iter_mut().enumerate() {
            if !*pending || !self.emitted[slot] {
                continue;
            }
            let env = slot as u32 / self.tiles_per_env;
            let done = tile_converged(
                &stats[slot],
                illuminance[env as usize],
                CONVERGENCE_THRESHOLD,
                self.min_samples,
            );
            if done || self.samples_done[slot] >= self.max_samples {
                *pending = false;
            }
        }
    }

    /// Plane-space pixel origin of an environment's image, for mapping
    /// tile coordinates into the shared framebuffer.
    pub fn env_origin(&self, env: u32, img_width: u32, img_height: u32) -> (u32, u32) {
        let x = (env % self.images_wide) * img_width;
        let y = (env / self.images_wide) * img_height;
        (x, y)
    }
}
