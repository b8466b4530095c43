//! Device and queue management.
//!
//! Owns the wgpu instance/adapter/device plus the fixed set of logical
//! transfer/compute queue wrappers handed to loaders and the render
//! orchestrator.

pub mod queue;

use crate::error::{install_device_error_hook, RenderError, RenderResult};
use crate::gpu::queue::{compute_queue_states, transfer_queue_states, QueueState};
use std::sync::Arc;

/// Storage-buffer bindings the trace kernel needs per stage; the batch
/// bindings plus the shared scene arenas exceed the default limit of 8.
const REQUIRED_STORAGE_BUFFERS_PER_STAGE: u32 = 24;

pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter: wgpu::Adapter,
    /// Minimum storage-buffer offset alignment reported by the device.
    pub storage_alignment: u64,
}

impl GpuContext {
    /// Select the adapter at `gpu_id` (ordering as enumerated over all
    /// backends) and create a device sized for the batch bindings.
    pub fn new(gpu_id: u32) -> RenderResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let adapter = if (gpu_id as usize) < adapters.len() {
            adapters.swap_remove(gpu_id as usize)
        } else {
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            }))
            .ok_or_else(|| RenderError::device("no suitable GPU adapter"))?
        };

        let adapter_limits = adapter.limits();
        if adapter_limits.max_storage_buffers_per_shader_stage
            < REQUIRED_STORAGE_BUFFERS_PER_STAGE
        {
            return Err(RenderError::device(format!(
                "adapter supports {} storage buffers per stage, need {}",
                adapter_limits.max_storage_buffers_per_shader_stage,
                REQUIRED_STORAGE_BUFFERS_PER_STAGE
            )));
        }

        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: REQUIRED_STORAGE_BUFFERS_PER_STAGE,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: wgpu::Features::empty(),
                required_limits,
                label: Some("raybatch-device"),
            },
            None,
        ))
        .map_err(RenderError::device)?;

        install_device_error_hook(&device);

        let storage_alignment = device.limits().min_storage_buffer_offset_alignment as u64;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter,
            storage_alignment,
        })
    }

    /// Round `offset` up to the device's storage-buffer alignment.
    pub fn align_storage_offset(&self, offset: u64) -> u64 {
        align_offset(offset, self.storage_alignment)
    }

    /// Logical transfer queues for `num_loaders` loaders.
    pub fn transfer_queues(&self, num_loaders: u32) -> Vec<QueueState> {
        transfer_queue_states(&self.queue, num_loaders)
    }

    /// Logical compute queues: two render queues plus loader BLAS-build
    /// queues.
    pub fn compute_queues(&self, num_loaders: u32) -> Vec<QueueState> {
        compute_queue_states(&self.queue, num_loaders)
    }
}

/// Round `offset` up to `alignment` (power of two not required).
pub fn align_offset(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    offset.div_ceil(alignment) * alignment
}

/// Align to wgpu's required bytes-per-row for buffer/texture copies.
#[inline]
pub fn align_copy_bpr(unpadded: u32) -> u32 {
    let a = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(a) * a
}

/// Ceiling division for dispatch sizing.
#[inline]
pub fn divide_round_up(v: u32, d: u32) -> u32 {
    v.div_ceil(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_offset_rounds_up() {
        assert_eq!(align_offset(0, 256), 0);
        assert_eq!(align_offset(1, 256), 256);
        assert_eq!(align_offset(256, 256), 256);
        assert_eq!(align_offset(257, 64), 320);
    }

    #[test]
    fn copy_bpr_is_aligned() {
        let a = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        assert_eq!(align_copy_bpr(1) % a, 0);
        assert_eq!(align_copy_bpr(a), a);
        assert_eq!(align_copy_bpr(a + 1), 2 * a);
    }
}
