//! Host-side reference execution
//!
//! The host path provides a reference implementation of the tile GEMM. It is
//! used by the emulated device to execute launches and by
//! [`execute_on_host`] so a host scheduler can run tasks the offload engine
//! handed back.

mod gemm;
mod host;

pub use gemm::gemm_nt;
pub use host::execute_on_host;
