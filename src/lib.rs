//! # tile-offload
//!
//! **Device offload and tile caching for tiled dense linear algebra.**
//!
//! tile-offload takes GEMM tasks from a task-based factorization running on
//! host cores and executes them on accelerators. It keeps a per-device cache
//! of tiles so repeated uses of a tile do not cross the bus again, pipelines
//! host-to-device copies with computation, and hands any task a device cannot
//! run back to the host scheduler.
//!
//! ## Components
//!
//! - **Tile directory**: one consistency record per tile, with the host
//!   version and the slot holding it on each device
//! - **Device cache**: fixed pool of slots per device, strict LRU
//! - **Pipeline**: a ring of lanes (streams) per device, copies and GEMM
//!   enqueued asynchronously and retired by non-blocking polls
//! - **Dispatch**: a per-device atomic counter elects one owner thread;
//!   other callers queue their task and return at once
//! - **Fallback**: tasks of a failed device go back to the host, exactly once
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tile_offload::prelude::*;
//!
//! struct Host;
//! impl HostScheduler for Host {
//!     fn task_complete(&self, _task: GemmTask, _status: TaskStatus) {}
//! }
//!
//! let ctx = Context::new(
//!     OffloadConfig::new(2),
//!     vec![EmulatedDevice::new("emu0", 1 << 16)],
//!     Arc::new(Host),
//! )?;
//!
//! let a = Arc::new(HostTile::from_vec(vec![1.0, 0.0, 0.0, 1.0]));
//! let c = Arc::new(HostTile::from_vec(vec![5.0; 4]));
//! let task = GemmTask::new(
//!     0,
//!     TileOperand::new((1, 0), a.clone()),
//!     TileOperand::new((1, 0), a),
//!     TileOperand::new((1, 1), c.clone()),
//! )
//! .with_writeback(true);
//!
//! ctx.submit(task);
//! assert_eq!(c.to_vec(), vec![4.0, 5.0, 5.0, 4.0]);
//! # Ok::<(), tile_offload::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): parallel host reference GEMM
//! - `cuda`: NVIDIA CUDA backend through cudarc and cuBLAS

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod offload;
pub mod placement;
pub mod report;
pub mod runtime;
pub mod task;
pub mod tile;

pub use config::OffloadConfig;
pub use context::Context;
pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::OffloadConfig;
    pub use crate::context::Context;
    pub use crate::directory::TileDirectory;
    pub use crate::error::{Error, Result};
    pub use crate::offload::{DeviceState, FallbackReason, HostScheduler, Offload, TaskStatus};
    pub use crate::placement::PlacementPolicy;
    pub use crate::report::{DeviceStats, Report};
    pub use crate::runtime::emulated::EmulatedDevice;
    pub use crate::runtime::{Backend, DeviceId};
    pub use crate::task::{GemmTask, TaskId, TileOperand};
    pub use crate::tile::{AccessMask, HostTile, TileCoordinate};

    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::CudaDevice;
}
