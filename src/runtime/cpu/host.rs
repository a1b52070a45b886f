//! Host execution of offloadable tasks

use super::gemm::gemm_nt;
use crate::directory::TileDirectory;
use crate::task::GemmTask;

/// Execute `task` on the host buffers and invalidate C in `directory`.
///
/// Intended for [`HostScheduler`](crate::offload::HostScheduler)
/// implementations honouring a fallback: after this returns, every device copy
/// of C is stale and will be re-transferred on next use.
///
/// A and B are snapshotted before C is locked, so a task naming the same host
/// buffer twice does not deadlock.
///
/// # Panics
/// Panics if the operands do not all hold `dim * dim` elements.
pub fn execute_on_host(directory: &TileDirectory, task: &GemmTask, dim: usize) {
    task.assert_tile_len(dim * dim);

    let a = task.a.host.to_vec();
    let b = task.b.host.to_vec();
    {
        let mut c = task.c.host.lock();
        gemm_nt(&a, &b, &mut c, dim, task.alpha, task.beta);
    }

    directory.invalidate(task.c.coord);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TileOperand;
    use crate::tile::{HostTile, TileCoordinate};
    use std::sync::Arc;

    #[test]
    fn test_execute_on_host_updates_c_and_invalidates() {
        let directory = TileDirectory::new(1);
        let c_coord = TileCoordinate::new(1, 1);
        let record = directory.get_or_create(c_coord);

        let a = Arc::new(HostTile::from_vec(vec![1.0, 0.0, 0.0, 1.0]));
        let c = Arc::new(HostTile::from_vec(vec![5.0, 5.0, 5.0, 5.0]));
        // A and B share one buffer: C -= A * A^T
        let task = GemmTask::new(
            3,
            TileOperand::new((1, 0), Arc::clone(&a)),
            TileOperand::new((1, 0), Arc::clone(&a)),
            TileOperand::new(c_coord, Arc::clone(&c)),
        );

        execute_on_host(&directory, &task, 2);

        assert_eq!(c.to_vec(), vec![4.0, 5.0, 5.0, 4.0]);
        assert_eq!(record.host_version(), 1);
    }
}
