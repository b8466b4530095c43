//! Logical execution-queue wrappers.
//!
//! The renderer hands out a fixed set of transfer and compute queues:
//! two compute queues for render submission (round-robined) and one
//! transfer + one compute queue per loader. When more logical consumers
//! exist than physical queues, the wrapper carries a `shared` flag meaning
//! its submissions must be externally serialized by the caller; there is
//! no implicit queuing or backpressure beyond that flag.
//!
//! wgpu exposes a single physical queue per device, so every wrapper
//! aliases it; the sharing arithmetic is kept (and tested) in terms of a
//! physical queue count so a multi-queue backend keeps the same contract.

use std::sync::Arc;

/// Render submission rotates over this many compute queues.
pub const RENDER_QUEUE_COUNT: u32 = 2;

#[derive(Clone)]
pub struct QueueState {
    queue: Arc<wgpu::Queue>,
    shared: bool,
}

impl QueueState {
    pub fn new(queue: Arc<wgpu::Queue>, shared: bool) -> Self {
        Self { queue, shared }
    }

    /// Submissions on a shared queue must be serialized by the caller.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn submit<I: IntoIterator<Item = wgpu::CommandBuffer>>(
        &self,
        command_buffers: I,
    ) -> wgpu::SubmissionIndex {
        self.queue.submit(command_buffers)
    }

    pub fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
        self.queue.write_buffer(buffer, offset, data);
    }

    pub fn raw(&self) -> &wgpu::Queue {
        &self.queue
    }
}

/// Whether transfer queues must be shared: one logical transfer queue per
/// loader against however many physical queues exist.
pub fn transfer_queues_shared(num_loaders: u32, num_physical: u32) -> bool {
    num_loaders > num_physical
}

/// Per-queue `shared` flags for the compute queue set. The first
/// [`RENDER_QUEUE_COUNT`] queues are reserved for render submission;
/// the remainder serve loader acceleration-structure builds.
pub fn compute_share_flags(num_loaders: u32, num_physical: u32, logical: u32) -> Vec<bool> {
    let loader_queues = num_physical.saturating_sub(RENDER_QUEUE_COUNT);
    let loaders_shared = num_loaders > loader_queues;
    (0..logical)
        .map(|i| loader_queues == 0 || (i >= RENDER_QUEUE_COUNT && loaders_shared))
        .collect()
}

/// Compute-queue index serving loader `loader_idx` BLAS builds.
pub fn loader_compute_queue_index(loader_idx: u32, num_physical: u32) -> u32 {
    let loader_queues = num_physical.saturating_sub(RENDER_QUEUE_COUNT);
    if loader_queues == 0 {
        0
    } else {
        RENDER_QUEUE_COUNT + loader_idx % loader_queues
    }
}

pub(crate) fn transfer_queue_states(queue: &Arc<wgpu::Queue>, num_loaders: u32) -> Vec<QueueState> {
    let physical = 1;
    let shared = transfer_queues_shared(num_loaders, physical);
    (0..physical.max(1))
        .map(|_| QueueState::new(queue.clone(), shared))
        .collect()
}

pub(crate) fn compute_queue_states(queue: &Arc<wgpu::Queue>, num_loaders: u32) -> Vec<QueueState> {
    let physical = 1;
    let logical = RENDER_QUEUE_COUNT + num_loaders.max(1);
    compute_share_flags(num_loaders, physical, logical)
        .into_iter()
        .map(|shared| QueueState::new(queue.clone(), shared))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_sharing_tracks_loader_count() {
        assert!(!transfer_queues_shared(1, 1));
        assert!(!transfer_queues_shared(2, 4));
        assert!(transfer_queues_shared(2, 1));
        assert!(transfer_queues_shared(5, 4));
    }

    #[test]
    fn single_physical_queue_shares_everything() {
        let flags = compute_share_flags(2, 1, 4);
        assert!(flags.iter().all(|&s| s));
    }

    #[test]
    fn plentiful_queues_share_nothing() {
        // 6 physical: 2 render + 4 loader queues for 3 loaders.
        let flags = compute_share_flags(3, 6, 5);
        assert!(flags.iter().all(|&s| !s));
    }

    #[test]
    fn overcommitted_loaders_share_loader_queues_only() {
        // 4 physical: 2 render + 2 loader queues for 3 loaders.
        let flags = compute_share_flags(3, 4, 5);
        assert!(!flags[0]);
        assert!(!flags[1]);
        assert!(flags[2] && flags[3] && flags[4]);
    }

    #[test]
    fn loader_queue_assignment_round_robins() {
        assert_eq!(loader_compute_queue_index(0, 4), 2);
        assert_eq!(loader_compute_queue_index(1, 4), 3);
        assert_eq!(loader_compute_queue_index(2, 4), 2);
        // No dedicated loader queues: fall back to queue 0.
        assert_eq!(loader_compute_queue_index(1, 1), 0);
    }
}
