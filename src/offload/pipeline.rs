//! Transfer/compute pipeline of one device
//!
//! Lanes form a ring. Tasks are submitted to the lane after the youngest busy
//! one and retired from the oldest busy one, so the tasks in flight are always
//! the most recently submitted ones. Together with the lane count never
//! exceeding a third of the cache slots, this keeps every tile used by an
//! in-flight task out of the LRU victim position.
//!
//! Lanes may run concurrently, so a cache hit alone does not make a slot's
//! bytes usable. Each slot remembers the last submission that wrote it and the
//! submissions reading it since. Before a lane touches a slot that another
//! in-flight lane wrote, or overwrites a slot another in-flight lane reads, it
//! is ordered after that lane with [`Backend::wait_for`].

use crate::cache::DeviceCache;
use crate::directory::{TileDirectory, TileRecord};
use crate::error::{Error, Result};
use crate::report::DeviceCounters;
use crate::runtime::{Backend, DeviceId, DevicePtr, GemmLaunch, LaneStatus};
use crate::task::GemmTask;
use crate::tile::AccessMask;
use std::sync::Arc;

/// Tiles a task can touch; a lane may only be opened per this many slots.
pub(crate) const TILES_PER_TASK: usize = 3;

/// C must be re-versioned when the lane carrying its writeback completes
struct Writeback {
    tile: Arc<TileRecord>,
    slot: usize,
}

/// Submissions that last touched a cache slot, numbered from 0 per device
#[derive(Default)]
struct SlotUse {
    writer: Option<u64>,
    readers: Vec<u64>,
}

struct InFlight {
    task: GemmTask,
    writeback: Option<Writeback>,
}

enum LaneState {
    Idle,
    Busy(InFlight),
}

struct Lane<L> {
    handle: L,
    state: LaneState,
}

/// A task whose lane failed, with the error
pub(crate) struct LaneFailure {
    pub(crate) task: GemmTask,
    pub(crate) error: Error,
}

/// Backend, cache and lanes of one device; only touched by its owner
pub(crate) struct Engine<B: Backend> {
    device: DeviceId,
    backend: B,
    cache: DeviceCache,
    lanes: Vec<Lane<B::Lane>>,
    uses: Vec<SlotUse>,
    oldest: usize,
    in_flight: usize,
    submitted: u64,
    retired: u64,
    tile_dim: usize,
    directory: Arc<TileDirectory>,
    counters: Arc<DeviceCounters>,
}

impl<B: Backend> Engine<B> {
    pub(crate) fn new(
        device: DeviceId,
        backend: B,
        cache: DeviceCache,
        lanes: Vec<B::Lane>,
        tile_dim: usize,
        directory: Arc<TileDirectory>,
        counters: Arc<DeviceCounters>,
    ) -> Self {
        assert!(!lanes.is_empty(), "{device}: engine needs at least one lane");
        let uses = (0..cache.capacity()).map(|_| SlotUse::default()).collect();
        Self {
            device,
            backend,
            cache,
            uses,
            lanes: lanes
                .into_iter()
                .map(|handle| Lane {
                    handle,
                    state: LaneState::Idle,
                })
                .collect(),
            oldest: 0,
            in_flight: 0,
            submitted: 0,
            retired: 0,
            tile_dim,
            directory,
            counters,
        }
    }

    pub(crate) fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn has_free_lane(&self) -> bool {
        self.in_flight < self.lanes.len()
    }

    /// Enqueue `task` on the next free lane: operand transfers, the GEMM,
    /// then the writeback of C if requested.
    ///
    /// On error the task is returned with the error; the lane is left idle
    /// and the device must be disabled.
    pub(crate) fn submit(&mut self, task: GemmTask) -> std::result::Result<(), LaneFailure> {
        debug_assert!(self.has_free_lane());
        let ticket = self.submitted;
        let index = self.lane_of(ticket);
        debug_assert_eq!(index, (self.oldest + self.in_flight) % self.lanes.len());
        log::debug!("{}: submit {} on lane {}", self.device, task, index);

        match self.enqueue(index, ticket, &task) {
            Ok(writeback) => {
                self.lanes[index].state = LaneState::Busy(InFlight { task, writeback });
                self.in_flight += 1;
                self.submitted += 1;
                Ok(())
            }
            Err(error) => Err(LaneFailure { task, error }),
        }
    }

    fn enqueue(
        &mut self,
        index: usize,
        ticket: u64,
        task: &GemmTask,
    ) -> Result<Option<Writeback>> {
        let tile_bytes = self.cache.slot_bytes() as u64;
        let mut ptrs: [DevicePtr; TILES_PER_TASK] = [0; TILES_PER_TASK];
        let mut target = None;
        let mut waited = Vec::new();

        for (i, (operand, mask)) in task.operands().into_iter().enumerate() {
            let record = self.directory.get_or_create(operand.coord);
            record.note_access(mask);
            let resolution = self.cache.resolve(&record, mask);
            let overwrites = resolution.transfer_required || mask.is_write();
            self.order_after_users(index, resolution.slot, overwrites, &mut waited)?;

            self.counters.require_in(tile_bytes);
            if resolution.transfer_required {
                let lane = &mut self.lanes[index].handle;
                self.backend
                    .copy_to_device(lane, &operand.host, resolution.device_ptr)?;
                self.counters.transfer_in(tile_bytes);
            }
            self.note_use(resolution.slot, ticket, mask, overwrites);
            ptrs[i] = resolution.device_ptr;
            if mask.is_write() {
                target = Some((record, resolution.slot));
            }
        }

        let launch = GemmLaunch {
            a: ptrs[0],
            b: ptrs[1],
            c: ptrs[2],
            dim: self.tile_dim,
            alpha: task.alpha,
            beta: task.beta,
        };
        let lane = &mut self.lanes[index].handle;
        self.backend.launch_gemm(lane, &launch)?;

        self.counters.require_out(tile_bytes);
        if !task.writeback {
            return Ok(None);
        }
        self.backend.copy_from_device(lane, launch.c, &task.c.host)?;
        self.counters.transfer_out(tile_bytes);
        Ok(target.map(|(tile, slot)| Writeback { tile, slot }))
    }

    /// Lane carrying submission `ticket`. Lanes are filled and retired in
    /// ring order starting from lane 0.
    fn lane_of(&self, ticket: u64) -> usize {
        (ticket % self.lanes.len() as u64) as usize
    }

    /// Order lane `index` after every other in-flight lane that wrote `slot`
    /// or, when this task overwrites it, reads it. Lanes in `waited` are
    /// already ordered and get skipped.
    fn order_after_users(
        &mut self,
        index: usize,
        slot: usize,
        overwrites: bool,
        waited: &mut Vec<usize>,
    ) -> Result<()> {
        let usage = &self.uses[slot];
        let readers: &[u64] = if overwrites { &usage.readers } else { &[] };
        let mut producers: Vec<usize> = usage
            .writer
            .iter()
            .chain(readers)
            .filter(|&&ticket| ticket >= self.retired)
            .map(|&ticket| self.lane_of(ticket))
            .filter(|&lane| lane != index && !waited.contains(&lane))
            .collect();
        producers.sort_unstable();
        producers.dedup();

        for producer in producers {
            log::trace!(
                "{}: lane {} waits for lane {} on slot {}",
                self.device,
                index,
                producer,
                slot
            );
            let (lane, other) = pair_mut(&mut self.lanes, index, producer);
            self.backend.wait_for(&mut lane.handle, &mut other.handle)?;
            waited.push(producer);
        }
        Ok(())
    }

    fn note_use(&mut self, slot: usize, ticket: u64, mask: AccessMask, overwrites: bool) {
        let retired = self.retired;
        let usage = &mut self.uses[slot];
        if overwrites {
            usage.writer = Some(ticket);
            usage.readers.clear();
        }
        if mask.is_read() {
            usage.readers.retain(|&reader| reader >= retired);
            usage.readers.push(ticket);
        }
    }

    /// Check the oldest busy lane without blocking.
    ///
    /// Returns the finished task, or `None` if nothing is in flight or the
    /// oldest lane is still running.
    pub(crate) fn poll(&mut self) -> std::result::Result<Option<GemmTask>, LaneFailure> {
        if self.in_flight == 0 {
            return Ok(None);
        }
        let lane = &mut self.lanes[self.oldest].handle;
        match self.backend.query(lane) {
            Ok(LaneStatus::Pending) => Ok(None),
            Ok(LaneStatus::Ready) => Ok(Some(self.retire())),
            Err(error) => Err(self.abandon(error)),
        }
    }

    /// Block until the oldest busy lane finishes.
    ///
    /// # Panics
    /// Panics if nothing is in flight.
    pub(crate) fn wait(&mut self) -> std::result::Result<GemmTask, LaneFailure> {
        assert!(self.in_flight > 0, "{}: wait with no lane in flight", self.device);
        let lane = &mut self.lanes[self.oldest].handle;
        match self.backend.synchronize(lane) {
            Ok(()) => Ok(self.retire()),
            Err(error) => Err(self.abandon(error)),
        }
    }

    fn take_oldest(&mut self) -> InFlight {
        let lane = &mut self.lanes[self.oldest];
        let state = std::mem::replace(&mut lane.state, LaneState::Idle);
        self.oldest = (self.oldest + 1) % self.lanes.len();
        self.in_flight -= 1;
        self.retired += 1;
        match state {
            LaneState::Busy(in_flight) => in_flight,
            LaneState::Idle => panic!("{}: oldest lane is idle", self.device),
        }
    }

    /// The oldest lane completed: publish the writeback, if any.
    fn retire(&mut self) -> GemmTask {
        let InFlight { task, writeback } = self.take_oldest();
        if let Some(Writeback { tile, slot }) = writeback {
            let version = tile.bump_version();
            // The slot keeps the data it just wrote back.
            if self.cache.bound_tile(slot) == Some(tile.coord()) {
                self.cache.mark_written_back(slot, version);
            }
        }
        task
    }

    fn abandon(&mut self, error: Error) -> LaneFailure {
        let InFlight { task, .. } = self.take_oldest();
        LaneFailure { task, error }
    }

    /// Free the cache and destroy the lanes
    pub(crate) fn release(self) -> B {
        debug_assert_eq!(self.in_flight, 0);
        for lane in self.lanes {
            self.backend.destroy_lane(lane.handle);
        }
        self.cache.release(&self.backend);
        self.backend
    }
}

/// Two distinct elements of `items`, both mutable
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "pair_mut needs two distinct indices");
    if a < b {
        let (low, high) = items.split_at_mut(b);
        (&mut low[a], &mut high[0])
    } else {
        let (low, high) = items.split_at_mut(a);
        (&mut high[0], &mut low[b])
    }
}
