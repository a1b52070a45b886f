//! Device selection for submitted tasks

use crate::runtime::DeviceId;
use crate::task::GemmTask;

/// Load of one active device as seen at submission time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLoad {
    /// Device identity
    pub id: DeviceId,
    /// Tasks offloaded and not yet reported
    pub outstanding: usize,
}

/// How [`Context::submit`](crate::Context::submit) picks a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Follow the device holding a write-tagged copy of C, so a tile keeps
    /// being updated where it already lives. Tasks with no such device go to
    /// the least loaded active device, lowest id first on ties.
    #[default]
    WriteAffinity,
    /// Always the lowest-numbered active device
    FirstActive,
    /// Always the given device, if it is active
    Pinned(DeviceId),
}

impl PlacementPolicy {
    /// Choose a device for `task`.
    ///
    /// `hint` is the write owner of the task's C tile; `active` lists the
    /// devices still accepting work, in id order. `None` means the task
    /// should go straight to the host.
    pub fn select(
        &self,
        task: &GemmTask,
        hint: Option<DeviceId>,
        active: &[DeviceLoad],
    ) -> Option<DeviceId> {
        let is_active = |id: DeviceId| active.iter().any(|d| d.id == id);
        let chosen = match *self {
            Self::WriteAffinity => hint.filter(|&id| is_active(id)).or_else(|| {
                active
                    .iter()
                    .min_by_key(|d| (d.outstanding, d.id))
                    .map(|d| d.id)
            }),
            Self::FirstActive => active.iter().map(|d| d.id).min(),
            Self::Pinned(id) => Some(id).filter(|&id| is_active(id)),
        };
        log::trace!("{task}: placed on {chosen:?} (hint {hint:?})");
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TileOperand;
    use crate::tile::HostTile;
    use std::sync::Arc;

    fn task() -> GemmTask {
        let tile = Arc::new(HostTile::zeros(1));
        GemmTask::new(
            1,
            TileOperand::new((1, 0), Arc::clone(&tile)),
            TileOperand::new((1, 0), Arc::clone(&tile)),
            TileOperand::new((1, 1), tile),
        )
    }

    fn loads(outstanding: &[(usize, usize)]) -> Vec<DeviceLoad> {
        outstanding
            .iter()
            .map(|&(id, outstanding)| DeviceLoad {
                id: DeviceId(id),
                outstanding,
            })
            .collect()
    }

    #[test]
    fn test_write_affinity_prefers_active_hint() {
        let active = loads(&[(0, 0), (1, 9)]);
        let policy = PlacementPolicy::WriteAffinity;
        assert_eq!(policy.select(&task(), Some(DeviceId(1)), &active), Some(DeviceId(1)));
        // Disabled write owner: fall through to load
        assert_eq!(policy.select(&task(), Some(DeviceId(2)), &active), Some(DeviceId(0)));
    }

    #[test]
    fn test_write_affinity_balances_without_hint() {
        let policy = PlacementPolicy::WriteAffinity;
        assert_eq!(
            policy.select(&task(), None, &loads(&[(0, 3), (1, 1), (2, 1)])),
            Some(DeviceId(1))
        );
        assert_eq!(policy.select(&task(), None, &[]), None);
    }

    #[test]
    fn test_first_active_and_pinned() {
        let active = loads(&[(2, 5), (3, 0)]);
        assert_eq!(
            PlacementPolicy::FirstActive.select(&task(), Some(DeviceId(3)), &active),
            Some(DeviceId(2))
        );
        assert_eq!(
            PlacementPolicy::Pinned(DeviceId(3)).select(&task(), None, &active),
            Some(DeviceId(3))
        );
        assert_eq!(
            PlacementPolicy::Pinned(DeviceId(0)).select(&task(), None, &active),
            None
        );
    }
}
