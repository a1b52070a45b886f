//! Device dispatch
//!
//! This module hands GEMM tasks to devices and reports every task back to
//! the host scheduler exactly once.
//!
//! # Architecture
//!
//! ```text
//! offload(task)
//! ├── device disabled        -> fallback, return FellBack
//! ├── counter 0 -> 1         -> caller becomes owner, drives the pipeline
//! │                             until the counter drops back to 0
//! └── counter n -> n+1       -> task queued for the current owner, return Queued
//! ```
//!
//! The ownership counter counts tasks offloaded to the device and not yet
//! reported (queued, being submitted, or in flight). Only the thread that
//! moved it from 0 to 1 touches the device's lanes and cache, and it keeps
//! ownership until its own decrements bring the counter back to 0.
//!
//! A device error disables the device for the rest of the run. The owner
//! then reports every outstanding task: in-flight tasks whose lanes still
//! synchronize cleanly complete normally, everything else falls back.

mod dispatch;
mod fallback;
mod pipeline;

pub(crate) use dispatch::Device;
pub(crate) use fallback::CompletionSink;
pub(crate) use pipeline::{Engine, TILES_PER_TASK};

use crate::runtime::DeviceId;
use crate::task::GemmTask;
use std::fmt;

/// Receiver of task completions
///
/// The engine calls [`task_complete`](HostScheduler::task_complete) exactly
/// once per task, possibly from any thread that happens to own a device.
/// Implementations must not block for long: the calling thread is usually
/// driving a device pipeline.
///
/// It is fine to submit new tasks from inside the callback.
pub trait HostScheduler: Send + Sync {
    /// `task` is done with the offload path
    fn task_complete(&self, task: GemmTask, status: TaskStatus);
}

/// How a task left the offload path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task ran on `device`; its output is in the device cache, and on
    /// the host too if it requested writeback
    Completed {
        /// Device that executed the task
        device: DeviceId,
    },
    /// The task did not run; the scheduler must execute it on the host
    Fallback {
        /// Device the task was offloaded to, if any
        device: Option<DeviceId>,
        /// Why the device did not run it
        reason: FallbackReason,
    },
}

impl TaskStatus {
    /// Returns true if the host has to execute the task
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// Why a task was handed back to the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    /// No device was available for the task
    NoDevice,
    /// The device had been disabled by an earlier error
    DeviceDisabled,
    /// The device failed while handling this task or one queued with it
    DeviceError(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => f.write_str("no device available"),
            Self::DeviceDisabled => f.write_str("device disabled"),
            Self::DeviceError(reason) => write!(f, "device error: {reason}"),
        }
    }
}

/// Result of handing a task to the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offload {
    /// The caller became the device owner and drained its work before
    /// returning
    Executed,
    /// Another thread owns the device; the task is queued for it
    Queued,
    /// The task was handed back to the host scheduler immediately
    FellBack,
}

/// Observable state of a device's dispatch controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// No thread owns the device
    Idle,
    /// A thread owns the device and is driving its pipeline
    OwnedActive,
    /// The device failed and no longer accepts work
    Disabled,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::OwnedActive => "active",
            Self::Disabled => "disabled",
        })
    }
}
