//! CUDA backend
//!
//! Drives an NVIDIA GPU through cudarc: raw driver calls for device memory
//! and asynchronous copies, one CUDA stream per lane, and cuBLAS SGEMM for the
//! tile update.
//!
//! # Thread Safety
//!
//! The owning thread of a device changes over a run. Every entry point binds
//! the device's context to the calling thread before touching the driver.
//!
//! # Lane ordering
//!
//! Streams run concurrently. `wait_for` records the producer lane's event and
//! makes the consumer stream wait on it, without blocking the host.
//!
//! # Host memory
//!
//! Copies are issued with `cuMemcpy*Async` on pageable host memory. The host
//! tile must stay alive and untouched until the lane that copies it has
//! completed; tasks keep their tiles alive until they are reported.

mod device;

pub use device::{CudaDevice, CudaLane};

use crate::error::{Error, Result};
use cudarc::driver::sys::CUresult;

/// Log a CUDA memory operation failure.
#[cold]
#[inline(never)]
fn log_cuda_memory_error(operation: &str, ptr: u64, result: CUresult) {
    log::warn!("{operation} failed for ptr 0x{ptr:x}: {result:?}");
}

/// Map a raw driver status to an error built by `make`.
#[inline]
fn check(result: CUresult, make: impl FnOnce(String) -> Error) -> Result<()> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(make(format!("{result:?}")))
    }
}

/// Number of CUDA devices visible to the driver
pub fn device_count() -> Result<usize> {
    cudarc::driver::result::init()?;
    let count = cudarc::driver::result::device::get_count()?;
    Ok(count as usize)
}

/// One [`CudaDevice`] per visible GPU.
///
/// Devices whose context cannot be created are skipped with a warning, the
/// same way devices that fail later probes are excluded from offload.
pub fn inventory() -> Result<Vec<CudaDevice>> {
    let mut devices = Vec::new();
    for ordinal in 0..device_count()? {
        match CudaDevice::new(ordinal) {
            Ok(device) => devices.push(device),
            Err(e) => log::warn!("cuda:{ordinal}: skipped: {e}"),
        }
    }
    Ok(devices)
}
