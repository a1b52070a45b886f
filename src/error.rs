//! Error types for tile-offload

use crate::runtime::DeviceId;
use thiserror::Error;

/// Result type alias using tile-offload's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while initializing or driving an offload device
///
/// Every variant is recoverable at the run level: a device that reports one of
/// these is either excluded at initialization or disabled, and its work falls
/// back to the host. Contract violations (missing directory entries, double
/// unbinding of a cache slot) panic instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The device could not back a single cache slot
    #[error("Device {device}: not enough memory for {required} cache slots of {slot_bytes} bytes (got {slots})")]
    NoDeviceMemory {
        /// Device that was probed
        device: DeviceId,
        /// Slots that could be allocated
        slots: usize,
        /// Slots needed for the device to be usable
        required: usize,
        /// Bytes per slot
        slot_bytes: usize,
    },

    /// Out of memory on a single allocation
    #[error("Out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// Device or context setup failed
    #[error("Device {device} initialization failed: {reason}")]
    DeviceInit {
        /// Device that failed
        device: DeviceId,
        /// Backend-provided reason
        reason: String,
    },

    /// Host/device copy failed
    #[error("Transfer failed ({direction}): {reason}")]
    Transfer {
        /// "host->device" or "device->host"
        direction: &'static str,
        /// Backend-provided reason
        reason: String,
    },

    /// Kernel launch failed
    #[error("Launch failed: {0}")]
    Launch(String),

    /// A lane (stream) reported an error while being polled or synchronized
    #[error("Lane {lane} failed: {reason}")]
    Lane {
        /// Lane index on the device
        lane: usize,
        /// Backend-provided reason
        reason: String,
    },

    /// The device has been removed from service for the rest of the run
    #[error("Device {0} is disabled")]
    DeviceDisabled(DeviceId),

    /// Invalid configuration value
    #[error("Invalid configuration '{field}': {reason}")]
    InvalidConfig {
        /// The offending field
        field: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),

    /// CUDA driver error
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

impl Error {
    /// Create a host->device transfer error
    pub fn copy_in(reason: impl Into<String>) -> Self {
        Self::Transfer {
            direction: "host->device",
            reason: reason.into(),
        }
    }

    /// Create a device->host transfer error
    pub fn copy_out(reason: impl Into<String>) -> Self {
        Self::Transfer {
            direction: "device->host",
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Create a device initialization error
    pub fn device_init(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::DeviceInit {
            device,
            reason: reason.into(),
        }
    }
}
