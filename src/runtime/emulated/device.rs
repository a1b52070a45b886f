//! Emulated device handle and its `Backend` implementation

use super::lane::{EmulatedLane, LaneOp};
use crate::error::{Error, Result};
use crate::runtime::{Backend, DevicePtr, GemmLaunch, LaneStatus};
use crate::tile::HostTile;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// First address handed out; keeps 0 free as the null pointer.
const BASE_ADDRESS: DevicePtr = 0x1000;

/// Device memory: one host block per allocation
#[derive(Default)]
pub(crate) struct Memory {
    next: DevicePtr,
    used: u64,
    blocks: HashMap<DevicePtr, Box<[f32]>>,
}

impl Memory {
    pub(super) fn block_mut(&mut self, ptr: DevicePtr) -> Result<&mut [f32]> {
        self.blocks
            .get_mut(&ptr)
            .map(|block| &mut block[..])
            .ok_or_else(|| Error::Backend(format!("invalid device address 0x{ptr:x}")))
    }

    pub(super) fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<f32>> {
        let block = self
            .blocks
            .get(&ptr)
            .ok_or_else(|| Error::Backend(format!("invalid device address 0x{ptr:x}")))?;
        block.get(..len).map(<[f32]>::to_vec).ok_or_else(|| {
            Error::Backend(format!(
                "read of {len} elements past the end of block 0x{ptr:x} ({} elements)",
                block.len()
            ))
        })
    }
}

/// Countdown until an operation starts failing. `None` means never.
#[derive(Default)]
struct Fault {
    remaining: Mutex<Option<usize>>,
}

impl Fault {
    fn arm(&self, successes: usize) {
        *self.remaining.lock() = Some(successes);
    }

    /// Consume one call; returns true if this call must fail.
    fn trip(&self) -> bool {
        let mut remaining = self.remaining.lock();
        match remaining.as_mut() {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Counters {
    launches: AtomicU64,
    copies_in: AtomicU64,
    copies_out: AtomicU64,
    queries: AtomicU64,
    lane_waits: AtomicU64,
    inside: AtomicUsize,
    max_inside: AtomicUsize,
}

/// Snapshot of an emulated device's activity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatedStats {
    /// GEMM launches enqueued
    pub launches: u64,
    /// Host->device copies enqueued
    pub copies_in: u64,
    /// Device->host copies enqueued
    pub copies_out: u64,
    /// Lane queries answered
    pub queries: u64,
    /// Cross-lane orderings requested with `wait_for`
    pub lane_waits: u64,
    /// Bytes currently allocated
    pub allocated_bytes: u64,
    /// Largest number of threads seen inside lane methods at the same time
    pub max_concurrent_callers: usize,
}

struct Inner {
    name: String,
    capacity: u64,
    latency: AtomicUsize,
    lanes_created: AtomicUsize,
    memory: Mutex<Memory>,
    unavailable: AtomicBool,
    held: AtomicBool,
    eager: AtomicBool,
    stalled: Mutex<HashSet<usize>>,
    launch_fault: Fault,
    copy_fault: Fault,
    query_fault: Fault,
    counters: Counters,
}

/// Handle to an emulated accelerator
///
/// Cloning the handle shares the device, so a test can keep one handle for
/// fault injection and statistics while the context owns another.
#[derive(Clone)]
pub struct EmulatedDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

/// Decrements the in-flight caller count on drop.
struct Entered<'a>(&'a Counters);

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.0.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EmulatedDevice {
    /// Create a device with `capacity` bytes of memory.
    ///
    /// Lanes complete on the first poll after work is enqueued.
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity,
                latency: AtomicUsize::new(0),
                lanes_created: AtomicUsize::new(0),
                memory: Mutex::new(Memory {
                    next: BASE_ADDRESS,
                    ..Memory::default()
                }),
                unavailable: AtomicBool::new(false),
                held: AtomicBool::new(false),
                eager: AtomicBool::new(false),
                stalled: Mutex::new(HashSet::new()),
                launch_fault: Fault::default(),
                copy_fault: Fault::default(),
                query_fault: Fault::default(),
                counters: Counters::default(),
            }),
        }
    }

    /// Report `Pending` for `polls` queries after each enqueue
    pub fn with_latency(self, polls: usize) -> Self {
        self.inner.latency.store(polls, Ordering::Relaxed);
        self
    }

    /// Run work as soon as it is enqueued, unless its lane is stalled or the
    /// device is held. Lanes then finish out of submission order whenever an
    /// older lane is stalled.
    pub fn with_eager_lanes(self) -> Self {
        self.inner.eager.store(true, Ordering::Relaxed);
        self
    }

    /// While stalled, lane `index` keeps its work queued and reports
    /// `Pending`. Synchronizing the lane, or ordering another lane after it,
    /// still runs the work.
    pub fn stall_lane(&self, index: usize, stalled: bool) {
        let mut lanes = self.inner.stalled.lock();
        if stalled {
            lanes.insert(index);
        } else {
            lanes.remove(&index);
        }
    }

    /// Fail every GEMM launch after `successes` successful ones
    pub fn fail_launch_after(&self, successes: usize) {
        self.inner.launch_fault.arm(successes);
    }

    /// Fail every copy (either direction) after `successes` successful ones
    pub fn fail_copy_after(&self, successes: usize) {
        self.inner.copy_fault.arm(successes);
    }

    /// Fail every lane query and synchronize after `successes` successful ones
    pub fn fail_query_after(&self, successes: usize) {
        self.inner.query_fault.arm(successes);
    }

    /// Make the memory probe fail, so the device is excluded at initialization
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// While held, lanes never complete: queries report `Pending` and
    /// synchronize waits for the release.
    pub fn set_held(&self, held: bool) {
        self.inner.held.store(held, Ordering::SeqCst);
    }

    /// Device memory capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Current statistics
    pub fn stats(&self) -> EmulatedStats {
        let c = &self.inner.counters;
        EmulatedStats {
            launches: c.launches.load(Ordering::SeqCst),
            copies_in: c.copies_in.load(Ordering::SeqCst),
            copies_out: c.copies_out.load(Ordering::SeqCst),
            queries: c.queries.load(Ordering::SeqCst),
            lane_waits: c.lane_waits.load(Ordering::SeqCst),
            allocated_bytes: self.inner.memory.lock().used,
            max_concurrent_callers: c.max_inside.load(Ordering::SeqCst),
        }
    }

    fn enter(&self) -> Entered<'_> {
        let c = &self.inner.counters;
        let now = c.inside.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_inside.fetch_max(now, Ordering::SeqCst);
        Entered(c)
    }

    fn latency(&self) -> usize {
        self.inner.latency.load(Ordering::Relaxed)
    }

    fn is_held(&self) -> bool {
        self.inner.held.load(Ordering::SeqCst)
    }

    fn is_stalled(&self, lane: &EmulatedLane) -> bool {
        self.inner.stalled.lock().contains(&lane.index)
    }

    /// In eager mode, run what was just enqueued.
    fn settle(&self, lane: &mut EmulatedLane) -> Result<()> {
        if !self.inner.eager.load(Ordering::Relaxed) || self.is_held() || self.is_stalled(lane) {
            return Ok(());
        }
        lane.polls_left = 0;
        lane.drain(&mut self.inner.memory.lock())
    }

    fn check_copy(&self, lane: &EmulatedLane, make: fn(String) -> Error) -> Result<()> {
        if self.inner.copy_fault.trip() {
            return Err(make(format!(
                "{}: injected copy fault on lane {}",
                self.inner.name, lane.index
            )));
        }
        Ok(())
    }
}

impl Backend for EmulatedDevice {
    type Lane = EmulatedLane;

    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn usable_memory(&self) -> Result<u64> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Backend(format!("{} is unavailable", self.inner.name)));
        }
        let used = self.inner.memory.lock().used;
        Ok(self.inner.capacity.saturating_sub(used))
    }

    fn allocate(&self, size_bytes: usize) -> Result<DevicePtr> {
        let mut memory = self.inner.memory.lock();
        if memory.used + size_bytes as u64 > self.inner.capacity {
            return Err(Error::OutOfMemory { size: size_bytes });
        }

        let ptr = memory.next;
        let elements = size_bytes.div_ceil(std::mem::size_of::<f32>());
        memory.next += (size_bytes as u64).max(1).next_multiple_of(256);
        memory.used += size_bytes as u64;
        memory
            .blocks
            .insert(ptr, vec![0.0; elements].into_boxed_slice());
        Ok(ptr)
    }

    fn deallocate(&self, ptr: DevicePtr, size_bytes: usize) {
        let mut memory = self.inner.memory.lock();
        if memory.blocks.remove(&ptr).is_some() {
            memory.used = memory.used.saturating_sub(size_bytes as u64);
        } else {
            log::warn!("{}: free of unknown address 0x{:x}", self.inner.name, ptr);
        }
    }

    fn create_lane(&self) -> Result<EmulatedLane> {
        let index = self.inner.lanes_created.fetch_add(1, Ordering::Relaxed);
        Ok(EmulatedLane::new(index))
    }

    fn copy_to_device(
        &self,
        lane: &mut EmulatedLane,
        src: &Arc<HostTile>,
        dst: DevicePtr,
    ) -> Result<()> {
        let _entered = self.enter();
        self.check_copy(lane, |reason| Error::copy_in(reason))?;
        self.inner.counters.copies_in.fetch_add(1, Ordering::SeqCst);
        lane.push(
            LaneOp::CopyIn {
                src: Arc::clone(src),
                dst,
            },
            self.latency(),
        );
        self.settle(lane)
    }

    fn copy_from_device(
        &self,
        lane: &mut EmulatedLane,
        src: DevicePtr,
        dst: &Arc<HostTile>,
    ) -> Result<()> {
        let _entered = self.enter();
        self.check_copy(lane, |reason| Error::copy_out(reason))?;
        self.inner.counters.copies_out.fetch_add(1, Ordering::SeqCst);
        lane.push(
            LaneOp::CopyOut {
                src,
                dst: Arc::clone(dst),
            },
            self.latency(),
        );
        self.settle(lane)
    }

    fn launch_gemm(&self, lane: &mut EmulatedLane, launch: &GemmLaunch) -> Result<()> {
        let _entered = self.enter();
        if self.inner.launch_fault.trip() {
            return Err(Error::Launch(format!(
                "{}: injected launch fault on lane {}",
                self.inner.name, lane.index
            )));
        }
        self.inner.counters.launches.fetch_add(1, Ordering::SeqCst);
        lane.push(LaneOp::Gemm(*launch), self.latency());
        self.settle(lane)
    }

    fn query(&self, lane: &mut EmulatedLane) -> Result<LaneStatus> {
        let _entered = self.enter();
        self.inner.counters.queries.fetch_add(1, Ordering::SeqCst);
        if self.inner.query_fault.trip() {
            lane.discard();
            return Err(Error::Lane {
                lane: lane.index,
                reason: format!("{}: injected query fault", self.inner.name),
            });
        }
        if lane.ops.is_empty() {
            return Ok(LaneStatus::Ready);
        }
        if self.is_held() || self.is_stalled(lane) {
            return Ok(LaneStatus::Pending);
        }
        if lane.polls_left > 0 {
            lane.polls_left -= 1;
            return Ok(LaneStatus::Pending);
        }
        lane.drain(&mut self.inner.memory.lock())?;
        Ok(LaneStatus::Ready)
    }

    fn synchronize(&self, lane: &mut EmulatedLane) -> Result<()> {
        let _entered = self.enter();
        while self.is_held() {
            std::thread::yield_now();
        }
        if self.inner.query_fault.trip() {
            lane.discard();
            return Err(Error::Lane {
                lane: lane.index,
                reason: format!("{}: injected synchronize fault", self.inner.name),
            });
        }
        lane.polls_left = 0;
        lane.drain(&mut self.inner.memory.lock())
    }

    /// Completes the producer's queued work on the spot, which orders it
    /// before anything `lane` runs later.
    fn wait_for(&self, lane: &mut EmulatedLane, producer: &mut EmulatedLane) -> Result<()> {
        let _entered = self.enter();
        self.inner.counters.lane_waits.fetch_add(1, Ordering::SeqCst);
        log::trace!(
            "{}: lane {} ordered after lane {}",
            self.inner.name,
            lane.index,
            producer.index
        );
        while self.is_held() {
            std::thread::yield_now();
        }
        producer.polls_left = 0;
        producer.drain(&mut self.inner.memory.lock())
    }
}
