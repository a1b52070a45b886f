//! Device counters and the shutdown report

use crate::runtime::DeviceId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live per-device counters, updated by the owning thread and read by anyone
#[derive(Debug, Default)]
pub(crate) struct DeviceCounters {
    executed: AtomicU64,
    fell_back: AtomicU64,
    required_in: AtomicU64,
    transferred_in: AtomicU64,
    required_out: AtomicU64,
    transferred_out: AtomicU64,
}

impl DeviceCounters {
    pub(crate) fn executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fell_back(&self) {
        self.fell_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn require_in(&self, bytes: u64) {
        self.required_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn transfer_in(&self, bytes: u64) {
        self.transferred_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn require_out(&self, bytes: u64) {
        self.required_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn transfer_out(&self, bytes: u64) {
        self.transferred_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            executed: self.executed.load(Ordering::Relaxed),
            fell_back: self.fell_back.load(Ordering::Relaxed),
            required_in: self.required_in.load(Ordering::Relaxed),
            transferred_in: self.transferred_in.load(Ordering::Relaxed),
            required_out: self.required_out.load(Ordering::Relaxed),
            transferred_out: self.transferred_out.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one device's counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Tasks executed on the device.
    ///
    /// Once the device is disabled nothing new is submitted, but tasks
    /// already in flight on lanes that still complete cleanly are counted
    /// here, since their results stand and they are not handed back.
    pub executed: u64,
    /// Tasks offloaded to the device that fell back to the host
    pub fell_back: u64,
    /// Bytes the executed tasks read, cached or not
    pub required_in: u64,
    /// Bytes actually copied host->device
    pub transferred_in: u64,
    /// Bytes requested for writeback
    pub required_out: u64,
    /// Bytes actually copied device->host
    pub transferred_out: u64,
}

impl DeviceStats {
    /// Host->device traffic as a percentage of what the tasks needed.
    /// Lower is better: the rest was served by the cache.
    pub fn in_ratio(&self) -> f64 {
        percent(self.transferred_in, self.required_in)
    }

    /// Device->host traffic as a percentage of what was requested
    pub fn out_ratio(&self) -> f64 {
        percent(self.transferred_out, self.required_out)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Scale `bytes` to the largest of B/KB/MB/GB keeping the value above 1024
/// units of the next one down.
pub fn best_unit(bytes: u64) -> (f64, &'static str) {
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in ["KB", "MB", "GB"] {
        if value <= 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    (value, unit)
}

/// Final state of one device
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceReport {
    /// Device identity
    pub id: DeviceId,
    /// Backend-provided name
    pub name: String,
    /// Cache slots
    pub slots: usize,
    /// Lanes
    pub lanes: usize,
    /// Whether the device was disabled by an error
    pub disabled: bool,
    /// Counters at shutdown
    pub stats: DeviceStats,
}

/// Run summary returned by [`Context::shutdown`](crate::Context::shutdown)
///
/// `Display` renders the human-readable table. The layout is for people, not
/// for parsers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report {
    /// One entry per device that passed initialization
    pub devices: Vec<DeviceReport>,
    /// Tasks handed back to the host scheduler
    pub host_tasks: u64,
}

impl Report {
    /// Tasks executed on any device
    pub fn device_tasks(&self) -> u64 {
        self.devices.iter().map(|d| d.stats.executed).sum()
    }

    /// Tasks seen by the engine
    pub fn total_tasks(&self) -> u64 {
        self.device_tasks() + self.host_tasks
    }
}

const WIDTH: usize = 78;
const SEPARATOR: &str =
    "|---------|-----------|--------|-------------|--------|-------------|--------|";

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total_tasks();
        let share = |n: u64| percent(n, total);

        writeln!(f, "{}", "-".repeat(WIDTH))?;
        writeln!(
            f,
            "|PU       |  # GEMM   |    %   |   Data In   |    %   |   Data Out  |    %   |"
        )?;
        writeln!(f, "{SEPARATOR}")?;
        for device in &self.devices {
            let s = &device.stats;
            let (data_in, in_unit) = best_unit(s.transferred_in);
            let (data_out, out_unit) = best_unit(s.transferred_out);
            writeln!(
                f,
                "|GPU:  {:2} |{:10} | {:6.2} |{:10.2}{:>2} | {:6.2} |{:10.2}{:>2} | {:6.2} |",
                device.id.index(),
                s.executed,
                share(s.executed),
                data_in,
                in_unit,
                s.in_ratio(),
                data_out,
                out_unit,
                s.out_ratio(),
            )?;
        }
        writeln!(f, "{SEPARATOR}")?;

        let total_in: u64 = self.devices.iter().map(|d| d.stats.transferred_in).sum();
        let total_out: u64 = self.devices.iter().map(|d| d.stats.transferred_out).sum();
        let (data_in, in_unit) = best_unit(total_in);
        let (data_out, out_unit) = best_unit(total_out);
        writeln!(
            f,
            "|All GPUs |{:10} | {:6.2} |{:10.2}{:>2} | {:6.2} |{:10.2}{:>2} | {:6.2} |",
            self.device_tasks(),
            share(self.device_tasks()),
            data_in,
            in_unit,
            100.0,
            data_out,
            out_unit,
            100.0,
        )?;
        writeln!(
            f,
            "|All CPUs |{:10} | {:6.2} |{:10.2}{:>2} | {:6.2} |{:10.2}{:>2} | {:6.2} |",
            self.host_tasks,
            share(self.host_tasks),
            0.0,
            "",
            0.0,
            0.0,
            "",
            0.0,
        )?;
        write!(f, "{}", "-".repeat(WIDTH))
    }
}
