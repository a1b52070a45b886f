//! Per-device dispatch controller

use super::pipeline::{Engine, LaneFailure};
use super::{CompletionSink, DeviceState, FallbackReason, Offload};
use crate::report::{DeviceCounters, DeviceStats};
use crate::runtime::{Backend, DeviceId};
use crate::task::GemmTask;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Steps of the owner loop
enum Phase {
    /// Put a task on a lane
    Submit(GemmTask),
    /// Retire finished lanes without blocking
    Poll,
    /// Take the next queued task
    Fetch,
    /// Every lane is busy and a task is waiting: block on the oldest lane
    Wait(GemmTask),
    /// Every lane is busy and nothing is queued: block on the oldest lane
    Retire,
    /// The counter reached zero; ownership is given up
    Released,
}

/// One offload device: ownership counter, pending queue and pipeline
pub(crate) struct Device<B: Backend> {
    id: DeviceId,
    name: String,
    tile_len: usize,
    owners: AtomicUsize,
    disabled: AtomicBool,
    pending: Mutex<VecDeque<GemmTask>>,
    engine: Mutex<Engine<B>>,
    counters: Arc<DeviceCounters>,
    sink: Arc<CompletionSink>,
}

impl<B: Backend> Device<B> {
    pub(crate) fn new(
        id: DeviceId,
        name: String,
        tile_len: usize,
        engine: Engine<B>,
        counters: Arc<DeviceCounters>,
        sink: Arc<CompletionSink>,
    ) -> Self {
        Self {
            id,
            name,
            tile_len,
            owners: AtomicUsize::new(0),
            disabled: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            engine: Mutex::new(engine),
            counters,
            sink,
        }
    }

    pub(crate) fn id(&self) -> DeviceId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Tasks offloaded here and not yet reported
    pub(crate) fn outstanding(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> DeviceState {
        if self.is_disabled() {
            DeviceState::Disabled
        } else if self.outstanding() > 0 {
            DeviceState::OwnedActive
        } else {
            DeviceState::Idle
        }
    }

    pub(crate) fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }

    /// Cache slots and lanes. Waits for the current owner, if any.
    pub(crate) fn layout(&self) -> (usize, usize) {
        let engine = self.engine.lock();
        (engine.cache().capacity(), engine.lane_count())
    }

    /// Hand `task` to this device.
    ///
    /// # Panics
    /// Panics if an operand does not hold exactly one tile of data.
    pub(crate) fn offload(&self, task: GemmTask) -> Offload {
        task.assert_tile_len(self.tile_len);

        if self.is_disabled() {
            self.counters.fell_back();
            self.sink
                .fallback(task, Some(self.id), FallbackReason::DeviceDisabled);
            return Offload::FellBack;
        }

        if self.owners.fetch_add(1, Ordering::AcqRel) > 0 {
            self.pending.lock().push_back(task);
            return Offload::Queued;
        }

        log::debug!("{}: owner enters with {}", self.id, task);
        self.drive(task);
        Offload::Executed
    }

    /// Owner loop: runs until the counter drops back to zero.
    fn drive(&self, first: GemmTask) {
        let mut engine = self.engine.lock();
        let mut phase = Phase::Submit(first);
        loop {
            phase = match phase {
                Phase::Submit(task) => self.submit(&mut engine, task),
                Phase::Poll => self.poll(&mut engine),
                Phase::Fetch => self.fetch(&engine),
                Phase::Wait(task) => self.wait(&mut engine, task),
                Phase::Retire => self.retire(&mut engine),
                Phase::Released => break,
            };
        }
        log::debug!("{}: owner leaves", self.id);
    }

    fn submit(&self, engine: &mut Engine<B>, task: GemmTask) -> Phase {
        if self.is_disabled() {
            return self.after(self.hand_back(task, FallbackReason::DeviceDisabled));
        }
        if !engine.has_free_lane() {
            return Phase::Wait(task);
        }
        match engine.submit(task) {
            Ok(()) => Phase::Poll,
            Err(failure) => self.fail(engine, failure),
        }
    }

    fn poll(&self, engine: &mut Engine<B>) -> Phase {
        loop {
            match engine.poll() {
                Ok(Some(task)) => {
                    if self.complete(task) {
                        return Phase::Released;
                    }
                }
                Ok(None) => return Phase::Fetch,
                Err(failure) => return self.fail(engine, failure),
            }
        }
    }

    fn fetch(&self, engine: &Engine<B>) -> Phase {
        if let Some(task) = self.pending.lock().pop_front() {
            return Phase::Submit(task);
        }
        if engine.in_flight() == 0 {
            // Another thread has incremented the counter and is about to push.
            thread::yield_now();
            return Phase::Fetch;
        }
        if engine.has_free_lane() {
            // A task may still arrive for the free lane.
            thread::yield_now();
            return Phase::Poll;
        }
        Phase::Retire
    }

    fn retire(&self, engine: &mut Engine<B>) -> Phase {
        match engine.wait() {
            Ok(done) => {
                if self.complete(done) {
                    Phase::Released
                } else {
                    Phase::Poll
                }
            }
            Err(failure) => self.fail(engine, failure),
        }
    }

    fn wait(&self, engine: &mut Engine<B>, task: GemmTask) -> Phase {
        match engine.wait() {
            Ok(done) => {
                let released = self.complete(done);
                debug_assert!(!released, "waiting task still holds the counter");
            }
            Err(failure) => {
                self.fail(engine, failure);
            }
        }
        Phase::Submit(task)
    }

    /// Disable the device and report everything in flight.
    ///
    /// Lanes that still synchronize complete their task normally; the failing
    /// task and any lane that errors fall back. Queued tasks fall back as the
    /// loop fetches them.
    fn fail(&self, engine: &mut Engine<B>, failure: LaneFailure) -> Phase {
        let LaneFailure { task, error } = failure;
        log::error!(
            "{} ({}): disabled after error on {}: {}",
            self.id,
            self.name,
            task,
            error
        );
        self.disabled.store(true, Ordering::Release);

        let mut released = self.hand_back(task, FallbackReason::DeviceError(error.to_string()));
        while engine.in_flight() > 0 {
            released = match engine.wait() {
                Ok(done) => self.complete(done),
                Err(LaneFailure { task, error }) => {
                    log::warn!("{}: lane lost {}: {}", self.id, task, error);
                    self.hand_back(task, FallbackReason::DeviceError(error.to_string()))
                }
            };
        }
        self.after(released)
    }

    fn after(&self, released: bool) -> Phase {
        if released {
            Phase::Released
        } else {
            Phase::Fetch
        }
    }

    /// Report `task` as executed. Returns true if this released ownership.
    fn complete(&self, task: GemmTask) -> bool {
        self.counters.executed();
        self.sink.completed(task, self.id);
        self.release_one()
    }

    /// Report `task` as fallen back. Returns true if this released ownership.
    fn hand_back(&self, task: GemmTask, reason: FallbackReason) -> bool {
        self.counters.fell_back();
        self.sink.fallback(task, Some(self.id), reason);
        self.release_one()
    }

    fn release_one(&self) -> bool {
        self.owners.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Tear down the pipeline and return the backend.
    ///
    /// Must only be called once no thread can offload to this device.
    pub(crate) fn into_backend(self) -> B {
        debug_assert_eq!(self.outstanding(), 0);
        self.engine.into_inner().release()
    }
}
