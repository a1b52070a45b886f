//! Device backends for the offload engine
//!
//! This module defines the `Backend` trait the dispatch loop drives, and
//! provides implementations for different accelerators.
//!
//! # Architecture
//!
//! ```text
//! Backend (one accelerator)
//! ├── memory     (allocate / deallocate cache slots, usable memory probe)
//! ├── Lane       (asynchronous execution channel: stream / queue)
//! ├── copies     (host->device, device->host, enqueued on a lane)
//! ├── launch     (tile GEMM, enqueued on a lane)
//! ├── query      (non-blocking lane completion check, blocking synchronize)
//! └── wait_for   (order one lane after the work already on another)
//! ```
//!
//! Work enqueued on one lane runs in order; different lanes may overlap
//! unless ordered with `wait_for`.
//! Every enqueue method may fail; a failure is treated by the caller as a
//! hard device error.

pub mod cpu;
pub mod emulated;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::error::Result;
use crate::tile::HostTile;
use std::fmt;
use std::sync::Arc;

/// Index of a device in the inventory handed to the context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl DeviceId {
    /// Position in the inventory
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu:{}", self.0)
    }
}

/// Device address (opaque to the engine)
pub type DevicePtr = u64;

/// Result of a non-blocking lane query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneStatus {
    /// All work enqueued on the lane has completed
    Ready,
    /// Work is still running
    Pending,
}

/// Arguments of a square tile GEMM: `C = beta * C + alpha * A * B^T`
///
/// All three operands are `dim x dim`, row-major, already resident on the
/// device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GemmLaunch {
    /// Device address of A
    pub a: DevicePtr,
    /// Device address of B
    pub b: DevicePtr,
    /// Device address of C
    pub c: DevicePtr,
    /// Tile dimension
    pub dim: usize,
    /// Scale on the product
    pub alpha: f32,
    /// Scale on C
    pub beta: f32,
}

/// Core trait for accelerator backends
///
/// A backend is owned by exactly one device entry of the context. All methods
/// taking a lane are only ever called by the thread currently owning the
/// device, but that thread changes over the run, so implementations must not
/// rely on thread-local state (CUDA backends rebind their context on entry).
pub trait Backend: Send + Sync + 'static {
    /// Asynchronous execution channel
    type Lane: Send;

    /// Human-readable name
    fn name(&self) -> String;

    /// Bytes of device memory available for the tile cache
    fn usable_memory(&self) -> Result<u64>;

    /// Allocate device memory
    fn allocate(&self, size_bytes: usize) -> Result<DevicePtr>;

    /// Deallocate device memory
    fn deallocate(&self, ptr: DevicePtr, size_bytes: usize);

    /// Create a new lane
    fn create_lane(&self) -> Result<Self::Lane>;

    /// Release a lane
    fn destroy_lane(&self, lane: Self::Lane) {
        drop(lane);
    }

    /// Enqueue a host->device copy of a whole tile
    fn copy_to_device(&self, lane: &mut Self::Lane, src: &Arc<HostTile>, dst: DevicePtr)
    -> Result<()>;

    /// Enqueue a device->host copy of a whole tile
    fn copy_from_device(
        &self,
        lane: &mut Self::Lane,
        src: DevicePtr,
        dst: &Arc<HostTile>,
    ) -> Result<()>;

    /// Enqueue a tile GEMM
    fn launch_gemm(&self, lane: &mut Self::Lane, launch: &GemmLaunch) -> Result<()>;

    /// Check whether everything enqueued on the lane has completed, without blocking
    fn query(&self, lane: &mut Self::Lane) -> Result<LaneStatus>;

    /// Block until everything enqueued on the lane has completed
    fn synchronize(&self, lane: &mut Self::Lane) -> Result<()>;

    /// Make work enqueued on `lane` after this call start only once
    /// everything already enqueued on `producer` has completed.
    ///
    /// The default blocks the caller on `producer`; backends with
    /// cross-stream events order the lanes on the device instead.
    fn wait_for(&self, _lane: &mut Self::Lane, producer: &mut Self::Lane) -> Result<()> {
        self.synchronize(producer)
    }
}
