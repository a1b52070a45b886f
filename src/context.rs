//! Offload context: directory, devices and scheduler for one run

use crate::cache::DeviceCache;
use crate::config::OffloadConfig;
use crate::directory::TileDirectory;
use crate::error::{Error, Result};
use crate::offload::{
    CompletionSink, Device, DeviceState, Engine, FallbackReason, HostScheduler, Offload,
    TILES_PER_TASK,
};
use crate::placement::{DeviceLoad, PlacementPolicy};
use crate::report::{DeviceCounters, DeviceReport, DeviceStats, Report};
use crate::runtime::{Backend, DeviceId};
use crate::task::GemmTask;
use std::sync::Arc;

/// Fewest cache slots a device needs to take part.
///
/// A task keeps A, B and C resident at once, so a device that can only
/// allocate one or two slots is excluded like one that allocates none.
pub const MIN_SLOTS: usize = TILES_PER_TASK;

/// Owns everything the offload engine needs for one run
///
/// A context is shared by reference between the scheduler's worker threads;
/// every method except [`shutdown`](Context::shutdown) takes `&self`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tile_offload::prelude::*;
///
/// struct Host;
/// impl HostScheduler for Host {
///     fn task_complete(&self, _task: GemmTask, status: TaskStatus) {
///         assert!(!status.is_fallback());
///     }
/// }
///
/// let config = OffloadConfig::new(4);
/// let devices = vec![EmulatedDevice::new("emu0", 1 << 20)];
/// let ctx = Context::new(config, devices, Arc::new(Host)).unwrap();
///
/// let tile = || Arc::new(HostTile::zeros(16));
/// let task = GemmTask::new(
///     0,
///     TileOperand::new((1, 0), tile()),
///     TileOperand::new((1, 0), tile()),
///     TileOperand::new((1, 1), tile()),
/// );
/// assert_eq!(ctx.submit(task), Offload::Executed);
///
/// let report = ctx.shutdown();
/// assert_eq!(report.device_tasks(), 1);
/// ```
pub struct Context<B: Backend> {
    config: OffloadConfig,
    directory: Arc<TileDirectory>,
    devices: Vec<Device<B>>,
    excluded: Vec<DeviceId>,
    sink: Arc<CompletionSink>,
    placement: PlacementPolicy,
}

impl<B: Backend> Context<B> {
    /// Set up every device of `inventory`.
    ///
    /// Device `i` of the inventory gets [`DeviceId`]`(i)`. A device that
    /// cannot be probed, cannot hold [`MIN_SLOTS`] tiles, or cannot open a
    /// lane is excluded with a warning; the run continues without it.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: OffloadConfig,
        inventory: Vec<B>,
        scheduler: Arc<dyn HostScheduler>,
    ) -> Result<Self> {
        config.validate()?;

        let directory = Arc::new(TileDirectory::new(inventory.len()));
        let sink = Arc::new(CompletionSink::new(scheduler));
        let mut devices = Vec::with_capacity(inventory.len());
        let mut excluded = Vec::new();

        for (index, backend) in inventory.into_iter().enumerate() {
            let id = DeviceId(index);
            let name = backend.name();
            match init_device(id, backend, &config, &directory, &sink) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    log::warn!("{id} ({name}): excluded from offload: {e}");
                    excluded.push(id);
                }
            }
        }

        if devices.is_empty() {
            log::warn!("no offload device available, every task runs on the host");
        }

        Ok(Self {
            config,
            directory,
            devices,
            excluded,
            sink,
            placement: PlacementPolicy::default(),
        })
    }

    /// Use `policy` for [`submit`](Context::submit)
    pub fn with_placement(mut self, policy: PlacementPolicy) -> Self {
        self.placement = policy;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// The tile directory
    pub fn directory(&self) -> &TileDirectory {
        &self.directory
    }

    /// Devices that passed initialization, in id order
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    /// Devices excluded at initialization
    pub fn excluded(&self) -> &[DeviceId] {
        &self.excluded
    }

    /// Devices still accepting work
    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| !d.is_disabled())
            .map(|d| d.id())
            .collect()
    }

    /// Offload `task` to the device chosen by the placement policy.
    ///
    /// Returns once the task is queued, handed back, or (if the caller
    /// became the device owner) once the device ran out of work.
    ///
    /// # Panics
    /// Panics if an operand does not hold exactly one tile of data.
    pub fn submit(&self, task: GemmTask) -> Offload {
        let hint = self.directory.write_owner(task.c.coord);
        let active: Vec<DeviceLoad> = self
            .devices
            .iter()
            .filter(|d| !d.is_disabled())
            .map(|d| DeviceLoad {
                id: d.id(),
                outstanding: d.outstanding(),
            })
            .collect();

        match self.placement.select(&task, hint, &active) {
            Some(id) => self.offload(id, task),
            None => {
                self.sink.fallback(task, None, FallbackReason::NoDevice);
                Offload::FellBack
            }
        }
    }

    /// Offload `task` to `device`, bypassing the placement policy.
    ///
    /// A device that was excluded at initialization hands the task straight
    /// back.
    pub fn offload(&self, device: DeviceId, task: GemmTask) -> Offload {
        match self.device(device) {
            Some(device) => device.offload(task),
            None => {
                self.sink.fallback(task, None, FallbackReason::NoDevice);
                Offload::FellBack
            }
        }
    }

    /// Run `task` on the host buffers and invalidate its C tile
    ///
    /// Convenience for schedulers honouring a
    /// [`Fallback`](crate::offload::TaskStatus::Fallback).
    pub fn execute_on_host(&self, task: &GemmTask) {
        crate::runtime::cpu::execute_on_host(&self.directory, task, self.config.tile_dim);
    }

    /// Dispatch state of `device`; `None` if it was excluded
    pub fn device_state(&self, device: DeviceId) -> Option<DeviceState> {
        self.device(device).map(|d| d.state())
    }

    /// Counters of `device`; `None` if it was excluded
    pub fn stats(&self, device: DeviceId) -> Option<DeviceStats> {
        self.device(device).map(|d| d.stats())
    }

    /// Tasks handed back to the host so far
    pub fn host_tasks(&self) -> u64 {
        self.sink.host_tasks()
    }

    /// Release device memory and lanes, drop the directory and summarize
    /// the run.
    pub fn shutdown(self) -> Report {
        let mut reports = Vec::with_capacity(self.devices.len());
        for device in self.devices {
            let (slots, lanes) = device.layout();
            reports.push(DeviceReport {
                id: device.id(),
                name: device.name().to_string(),
                slots,
                lanes,
                disabled: device.is_disabled(),
                stats: device.stats(),
            });
            drop(device.into_backend());
        }
        self.directory.clear();

        let report = Report {
            devices: reports,
            host_tasks: self.sink.host_tasks(),
        };
        log::info!("offload summary\n{report}");
        report
    }

    fn device(&self, id: DeviceId) -> Option<&Device<B>> {
        self.devices.iter().find(|d| d.id() == id)
    }
}

/// Probe `backend`, carve its cache and open its lanes.
fn init_device<B: Backend>(
    id: DeviceId,
    backend: B,
    config: &OffloadConfig,
    directory: &Arc<TileDirectory>,
    sink: &Arc<CompletionSink>,
) -> Result<Device<B>> {
    let slot_bytes = config.tile_bytes();
    let usable = backend
        .usable_memory()
        .map_err(|e| Error::device_init(id, e.to_string()))?;
    let wanted = config.slots_for(usable);
    if wanted < MIN_SLOTS {
        return Err(Error::NoDeviceMemory {
            device: id,
            slots: wanted,
            required: MIN_SLOTS,
            slot_bytes,
        });
    }

    let cache = DeviceCache::new(id, &backend, wanted, slot_bytes)?;
    if cache.capacity() < MIN_SLOTS {
        let slots = cache.capacity();
        cache.release(&backend);
        return Err(Error::NoDeviceMemory {
            device: id,
            slots,
            required: MIN_SLOTS,
            slot_bytes,
        });
    }

    // In-flight tasks must never hold more tiles than the cache.
    let lane_count = config
        .max_lanes
        .min(cache.capacity() / TILES_PER_TASK)
        .max(1);
    let mut lanes = Vec::with_capacity(lane_count);
    for _ in 0..lane_count {
        match backend.create_lane() {
            Ok(lane) => lanes.push(lane),
            Err(e) => {
                for lane in lanes {
                    backend.destroy_lane(lane);
                }
                cache.release(&backend);
                return Err(Error::device_init(id, format!("lane creation failed: {e}")));
            }
        }
    }

    let name = backend.name();
    log::info!(
        "{id} ({name}): {} cache slots of {} bytes, {} lanes",
        cache.capacity(),
        slot_bytes,
        lane_count
    );

    let counters = Arc::new(DeviceCounters::default());
    let engine = Engine::new(
        id,
        backend,
        cache,
        lanes,
        config.tile_dim,
        Arc::clone(directory),
        Arc::clone(&counters),
    );
    Ok(Device::new(
        id,
        name,
        config.tile_len(),
        engine,
        counters,
        Arc::clone(sink),
    ))
}
