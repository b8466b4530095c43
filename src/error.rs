//! Central error handling for the raybatch renderer.
//!
//! Provides a unified `RenderError` enum with consistent categorization.
//! Device-level failures are treated as unrecoverable: a batch is an
//! indivisible unit of GPU work, so anything the driver reports after
//! submission aborts the process rather than continuing with
//! half-rendered state.

use std::process;

/// Centralized error type for all renderer operations.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Readback error: {0}")]
    Readback(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn device<T: ToString>(msg: T) -> Self {
        RenderError::Device(msg.to_string())
    }

    pub fn load<T: ToString>(msg: T) -> Self {
        RenderError::Load(msg.to_string())
    }

    pub fn capacity<T: ToString>(msg: T) -> Self {
        RenderError::Capacity(msg.to_string())
    }

    pub fn render<T: ToString>(msg: T) -> Self {
        RenderError::Render(msg.to_string())
    }

    pub fn readback<T: ToString>(msg: T) -> Self {
        RenderError::Readback(msg.to_string())
    }

    pub fn probe<T: ToString>(msg: T) -> Self {
        RenderError::Probe(msg.to_string())
    }
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = Result<T, RenderError>;

/// Log the failure and terminate the process. Used for device loss,
/// allocation exhaustion, and acceleration-structure build failures,
/// none of which have a defined degraded mode.
pub fn fatal(msg: &str) -> ! {
    log::error!("fatal: {msg}");
    process::abort();
}

/// Install the uncaptured-error hook on a device. Any error the driver
/// surfaces outside a captured scope indicates unrecoverable device state.
pub fn install_device_error_hook(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|err| {
        fatal(&format!("uncaptured device error: {err}"));
    }));
}
