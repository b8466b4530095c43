// tests/test_batch_layout.rs
// Byte-layout invariants of the per-batch parameter and framebuffer
// heaps: alignment, region disjointness, and plane tiling geometry.
// RELEVANT FILES:src/batch/mod.rs

use raybatch::batch::{images_wide, FramebufferConfig, ParamBufferConfig};
use raybatch::config::limits;
use raybatch::{RenderConfig, RenderFlags};

const ALIGN: u64 = 256;

fn assert_disjoint_and_aligned(regions: &[(u64, u64)], total: u64) {
    let mut sorted: Vec<_> = regions.to_vec();
    sorted.sort_by_key(|&(off, _)| off);
    let mut prev_end = 0;
    for (off, bytes) in sorted {
        assert_eq!(off % ALIGN, 0, "offset {off} unaligned");
        assert!(bytes > 0, "empty region at {off}");
        assert!(off >= prev_end, "region at {off} overlaps previous");
        prev_end = off + bytes;
    }
    assert!(prev_end <= total);
}

#[test]
fn param_regions_are_disjoint_and_aligned() {
    for batch in [1, 2, 7, 32, 128] {
        let cfg = ParamBufferConfig::new(batch, ALIGN);
        assert_disjoint_and_aligned(&cfg.regions(), cfg.total_bytes);
    }
}

#[test]
fn framebuffer_regions_are_disjoint_and_aligned() {
    for flags in [RenderFlags::NONE, RenderFlags::AUXILIARY_OUTPUTS] {
        let rc = RenderConfig {
            batch_size: 6,
            flags,
            ..Default::default()
        };
        let fb = FramebufferConfig::new(&rc, 33, 17, ALIGN);
        assert_disjoint_and_aligned(&fb.regions(), fb.total_bytes);
    }
}

#[test]
fn plane_tiling_covers_the_batch_exactly() {
    for batch in [1, 2, 3, 4, 6, 9, 16, 24] {
        let wide = images_wide(batch);
        assert_eq!(batch % wide, 0, "batch {batch}");
        let rc = RenderConfig {
            batch_size: batch,
            ..Default::default()
        };
        let fb = FramebufferConfig::new(&rc, 64, 48, ALIGN);
        assert_eq!(fb.images_wide * fb.images_tall, batch);
        assert_eq!(fb.frame_width, 64 * fb.images_wide);
        assert_eq!(fb.frame_height, 48 * fb.images_tall);
    }
}

#[test]
fn aux_planes_collapse_when_disabled() {
    let rc = RenderConfig {
        batch_size: 4,
        ..Default::default()
    };
    let off = FramebufferConfig::new(&rc, 64, 64, ALIGN);
    let on = FramebufferConfig::new(
        &RenderConfig {
            flags: RenderFlags::AUXILIARY_OUTPUTS,
            ..rc
        },
        64,
        64,
        ALIGN,
    );
    assert!(off.normal_bytes < on.normal_bytes);
    let pixels = (on.frame_width * on.frame_height) as u64;
    assert_eq!(on.normal_bytes, pixels * raybatch::batch::AUX_BYTES_PER_PIXEL);
}

#[test]
fn tile_grid_covers_odd_image_sizes() {
    let rc = RenderConfig {
        batch_size: 2,
        ..Default::default()
    };
    let fb = FramebufferConfig::new(&rc, 33, 17, ALIGN);
    assert!(fb.tiles_wide * limits::LOCAL_WORKGROUP_X >= 33);
    assert!(fb.tiles_tall * limits::LOCAL_WORKGROUP_Y >= 17);
    assert_eq!(fb.tiles_per_env, fb.tiles_wide * fb.tiles_tall);
    assert_eq!(fb.total_tiles, fb.tiles_per_env * 2);
}
