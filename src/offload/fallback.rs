//! Task completion delivery

use super::{FallbackReason, HostScheduler, TaskStatus};
use crate::runtime::DeviceId;
use crate::task::GemmTask;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Delivers every task to the host scheduler
///
/// Tasks are moved in, so each one is delivered at most once; the dispatch
/// loop guarantees at least once.
pub(crate) struct CompletionSink {
    scheduler: Arc<dyn HostScheduler>,
    host_tasks: AtomicU64,
}

impl CompletionSink {
    pub(crate) fn new(scheduler: Arc<dyn HostScheduler>) -> Self {
        Self {
            scheduler,
            host_tasks: AtomicU64::new(0),
        }
    }

    /// `task` ran on `device`
    pub(crate) fn completed(&self, task: GemmTask, device: DeviceId) {
        log::debug!("{device}: complete {task}");
        self.scheduler
            .task_complete(task, TaskStatus::Completed { device });
    }

    /// Hand `task` back for host execution
    pub(crate) fn fallback(&self, task: GemmTask, device: Option<DeviceId>, reason: FallbackReason) {
        match device {
            Some(device) => log::debug!("{device}: {task} falls back ({reason})"),
            None => log::debug!("{task} falls back ({reason})"),
        }
        self.host_tasks.fetch_add(1, Ordering::Relaxed);
        self.scheduler
            .task_complete(task, TaskStatus::Fallback { device, reason });
    }

    /// Tasks handed back so far
    pub(crate) fn host_tasks(&self) -> u64 {
        self.host_tasks.load(Ordering::Relaxed)
    }
}
