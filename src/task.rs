//! Offloadable GEMM tasks
//!
//! A [`GemmTask`] is the unit handed to the offload engine by the task-graph
//! producer. It names three tiles and computes, in place on tile C:
//!
//! ```text
//! C = beta * C + alpha * A * B^T
//! ```
//!
//! The defaults (`alpha = -1`, `beta = 1`) give the trailing-matrix update of a
//! tiled factorization.
//!
//! Tasks are move-only. Each one is consumed by exactly one
//! [`HostScheduler::task_complete`](crate::offload::HostScheduler::task_complete)
//! call, so handing the same task to the host twice cannot be expressed.

use crate::tile::{AccessMask, HostTile, TileCoordinate};
use std::fmt;
use std::sync::Arc;

/// Identifier assigned by the task producer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// One tile operand: its coordinate and the host buffer holding its data
#[derive(Clone, Debug)]
pub struct TileOperand {
    /// Tile coordinate, the directory key
    pub coord: TileCoordinate,
    /// Host copy of the tile
    pub host: Arc<HostTile>,
}

impl TileOperand {
    /// Create an operand
    pub fn new(coord: impl Into<TileCoordinate>, host: Arc<HostTile>) -> Self {
        Self {
            coord: coord.into(),
            host,
        }
    }
}

/// A GEMM task over three tiles
#[derive(Debug)]
pub struct GemmTask {
    id: TaskId,
    /// First factor, read-only
    pub a: TileOperand,
    /// Second factor (used transposed), read-only
    pub b: TileOperand,
    /// Accumulation target, read-write
    pub c: TileOperand,
    /// Step index, used for routing and diagnostics
    pub k: usize,
    /// Row index, used for routing and diagnostics
    pub m: usize,
    /// Column index, used for routing and diagnostics
    pub n: usize,
    /// Scale applied to `A * B^T`
    pub alpha: f32,
    /// Scale applied to the previous contents of C
    pub beta: f32,
    /// Copy C back to the host after the update (last device writer of C)
    pub writeback: bool,
}

impl GemmTask {
    /// Create a task with the trailing-update scalars and no writeback
    pub fn new(id: u64, a: TileOperand, b: TileOperand, c: TileOperand) -> Self {
        Self {
            id: TaskId(id),
            a,
            b,
            c,
            k: 0,
            m: 0,
            n: 0,
            alpha: -1.0,
            beta: 1.0,
            writeback: false,
        }
    }

    /// Set the `(k, m, n)` indices
    pub fn with_indices(mut self, k: usize, m: usize, n: usize) -> Self {
        self.k = k;
        self.m = m;
        self.n = n;
        self
    }

    /// Set `alpha` and `beta`
    pub fn with_scalars(mut self, alpha: f32, beta: f32) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    /// Mark this task as the last device writer of C
    pub fn with_writeback(mut self, writeback: bool) -> Self {
        self.writeback = writeback;
        self
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Operands in resolution order, with the access each one needs
    pub fn operands(&self) -> [(&TileOperand, AccessMask); 3] {
        [
            (&self.a, AccessMask::READ),
            (&self.b, AccessMask::READ),
            (&self.c, AccessMask::READ_WRITE),
        ]
    }

    /// Panics unless every operand holds exactly `len` elements.
    pub(crate) fn assert_tile_len(&self, len: usize) {
        for (operand, _) in self.operands() {
            let got = operand.host.len();
            assert_eq!(
                got, len,
                "{}: tile {} holds {} elements, device tiles hold {}",
                self.id, operand.coord, got, len
            );
        }
    }
}

impl fmt::Display for GemmTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (k = {}, m = {}, n = {})",
            self.id, self.k, self.m, self.n
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operand(row: usize, col: usize) -> TileOperand {
        TileOperand::new((row, col), Arc::new(HostTile::zeros(4)))
    }

    #[test]
    fn test_builder_defaults() {
        let task = GemmTask::new(7, operand(1, 0), operand(2, 0), operand(2, 1))
            .with_indices(0, 2, 1)
            .with_writeback(true);
        assert_eq!(task.id(), TaskId(7));
        assert_eq!(task.alpha, -1.0);
        assert_eq!(task.beta, 1.0);
        assert!(task.writeback);
        assert_eq!(task.to_string(), "task#7 (k = 0, m = 2, n = 1)");

        let masks: Vec<AccessMask> = task.operands().iter().map(|(_, m)| *m).collect();
        assert_eq!(
            masks,
            vec![AccessMask::READ, AccessMask::READ, AccessMask::READ_WRITE]
        );
    }

    #[test]
    #[should_panic(expected = "holds 4 elements")]
    fn test_tile_len_mismatch_panics() {
        let task = GemmTask::new(1, operand(0, 0), operand(0, 1), operand(1, 1));
        task.assert_tile_len(16);
    }
}
