//! Deferred lanes of the emulated device

use super::device::Memory;
use crate::error::{Error, Result};
use crate::runtime::cpu::gemm_nt;
use crate::runtime::{DevicePtr, GemmLaunch};
use crate::tile::HostTile;
use std::collections::VecDeque;
use std::sync::Arc;

/// Work enqueued on a lane, executed in order when the lane completes
pub(super) enum LaneOp {
    CopyIn { src: Arc<HostTile>, dst: DevicePtr },
    Gemm(GemmLaunch),
    CopyOut { src: DevicePtr, dst: Arc<HostTile> },
}

/// Asynchronous execution channel of an [`EmulatedDevice`](super::EmulatedDevice)
pub struct EmulatedLane {
    pub(super) index: usize,
    pub(super) ops: VecDeque<LaneOp>,
    pub(super) polls_left: usize,
}

impl EmulatedLane {
    pub(super) fn new(index: usize) -> Self {
        Self {
            index,
            ops: VecDeque::new(),
            polls_left: 0,
        }
    }

    /// Lane index on its device
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of operations waiting to run
    pub fn queued(&self) -> usize {
        self.ops.len()
    }

    pub(super) fn push(&mut self, op: LaneOp, latency: usize) {
        self.ops.push_back(op);
        self.polls_left = latency;
    }

    /// Run every queued operation against `memory`.
    ///
    /// The queue is consumed even if an operation fails; a failed lane has
    /// nothing left to report on.
    pub(super) fn drain(&mut self, memory: &mut Memory) -> Result<()> {
        while let Some(op) = self.ops.pop_front() {
            if let Err(e) = run(op, memory) {
                self.ops.clear();
                return Err(Error::Lane {
                    lane: self.index,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    pub(super) fn discard(&mut self) {
        self.ops.clear();
        self.polls_left = 0;
    }
}

fn run(op: LaneOp, memory: &mut Memory) -> Result<()> {
    match op {
        LaneOp::CopyIn { src, dst } => {
            let block = memory.block_mut(dst)?;
            let data = src.lock();
            if data.len() > block.len() {
                return Err(Error::copy_in(format!(
                    "{} elements do not fit a block of {} at 0x{:x}",
                    data.len(),
                    block.len(),
                    dst
                )));
            }
            block[..data.len()].copy_from_slice(&data);
        }
        LaneOp::Gemm(launch) => {
            let len = launch.dim * launch.dim;
            // A, B and C may alias when a task names one tile twice.
            let a = memory.read(launch.a, len)?;
            let b = memory.read(launch.b, len)?;
            let block = memory.block_mut(launch.c)?;
            if block.len() < len {
                return Err(Error::Launch(format!(
                    "C block at 0x{:x} holds {} elements, need {}",
                    launch.c,
                    block.len(),
                    len
                )));
            }
            gemm_nt(&a, &b, &mut block[..len], launch.dim, launch.alpha, launch.beta);
        }
        LaneOp::CopyOut { src, dst } => {
            let mut data = dst.lock();
            let len = data.len();
            let block = memory.read(src, len)?;
            data.copy_from_slice(&block);
        }
    }
    Ok(())
}
