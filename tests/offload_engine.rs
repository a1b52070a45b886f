//! End-to-end tests of the offload engine on emulated devices

mod common;

use common::*;
use std::sync::Arc;
use std::thread;
use tile_offload::prelude::*;

fn context(
    devices: Vec<EmulatedDevice>,
    scheduler: &Arc<RecordingScheduler>,
) -> Context<EmulatedDevice> {
    Context::new(
        OffloadConfig::new(DIM).with_max_slots(12),
        devices,
        scheduler.clone(),
    )
    .unwrap()
}

#[test]
fn test_writeback_matches_host_reference() {
    let mut rng = rng(11);
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = context(vec![EmulatedDevice::new("emu0", 1 << 20).with_latency(2)], &scheduler);

    let a = random_tile(&mut rng);
    let b = random_tile(&mut rng);
    let c = random_tile(&mut rng);
    let expected = reference_update(&a.to_vec(), &b.to_vec(), &c.to_vec());

    let task = gemm(1, ((2, 0), &a), ((1, 0), &b), ((2, 1), &c)).with_writeback(true);
    assert_eq!(ctx.submit(task), Offload::Executed);

    assert_allclose_f32(&c.to_vec(), &expected, 1e-5, 1e-5, "writeback");
    let record = ctx.directory().expect(TileCoordinate::new(2, 1));
    assert_eq!(record.host_version(), 1);
    assert_eq!(
        scheduler.seen(),
        vec![(TaskId(1), TaskStatus::Completed { device: DeviceId(0) })]
    );
}

#[test]
fn test_without_writeback_host_copy_is_untouched() {
    let mut rng = rng(12);
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = context(vec![EmulatedDevice::new("emu0", 1 << 20)], &scheduler);

    let a = random_tile(&mut rng);
    let c = random_tile(&mut rng);
    let before = c.to_vec();

    ctx.submit(gemm(1, ((1, 0), &a), ((1, 0), &a), ((1, 1), &c)));
    assert_eq!(c.to_vec(), before);
    assert_eq!(ctx.directory().expect(TileCoordinate::new(1, 1)).host_version(), 0);

    let stats = ctx.stats(DeviceId(0)).unwrap();
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.transferred_out, 0);
    assert_eq!(stats.required_out, TILE_BYTES);
}

#[test]
fn test_write_affinity_keeps_c_on_its_device() {
    let mut rng = rng(13);
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = context(
        vec![
            EmulatedDevice::new("emu0", 1 << 20),
            EmulatedDevice::new("emu1", 1 << 20),
        ],
        &scheduler,
    );

    let a = random_tile(&mut rng);
    let b = random_tile(&mut rng);
    let c = random_tile(&mut rng);
    let mut expected = c.to_vec();
    for _ in 0..3 {
        expected = reference_update(&a.to_vec(), &b.to_vec(), &expected);
    }

    let step = |id| gemm(id, ((3, 0), &a), ((2, 0), &b), ((3, 2), &c));

    // First update pinned to device 1; it now holds a write-tagged copy of C.
    assert_eq!(ctx.offload(DeviceId(1), step(1)), Offload::Executed);
    assert_eq!(ctx.directory().write_owner(TileCoordinate::new(3, 2)), Some(DeviceId(1)));

    // Later updates follow C, hitting every operand in device 1's cache.
    assert_eq!(ctx.submit(step(2)), Offload::Executed);
    assert_eq!(ctx.submit(step(3).with_writeback(true)), Offload::Executed);

    let on_one = ctx.stats(DeviceId(1)).unwrap();
    assert_eq!(on_one.executed, 3);
    assert_eq!(on_one.required_in, 9 * TILE_BYTES);
    assert_eq!(on_one.transferred_in, 3 * TILE_BYTES);
    assert_eq!(on_one.transferred_out, TILE_BYTES);
    assert_eq!(ctx.stats(DeviceId(0)).unwrap().executed, 0);

    assert_allclose_f32(&c.to_vec(), &expected, 1e-5, 1e-5, "accumulated on device");
}

#[test]
fn test_host_update_invalidates_device_copy() {
    let mut rng = rng(14);
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = context(vec![EmulatedDevice::new("emu0", 1 << 20)], &scheduler);

    let a = random_tile(&mut rng);
    let b = random_tile(&mut rng);
    let c = random_tile(&mut rng);

    let first = gemm(1, ((1, 0), &a), ((2, 0), &b), ((2, 1), &c)).with_writeback(true);
    ctx.submit(first);

    // The host runs the next update itself; the device copy of C is stale.
    let on_host = gemm(2, ((1, 0), &a), ((2, 0), &b), ((2, 1), &c));
    ctx.execute_on_host(&on_host);
    assert_eq!(ctx.directory().expect(TileCoordinate::new(2, 1)).host_version(), 2);

    let expected = reference_update(&a.to_vec(), &b.to_vec(), &c.to_vec());
    let third = gemm(3, ((1, 0), &a), ((2, 0), &b), ((2, 1), &c)).with_writeback(true);
    ctx.submit(third);

    // Only C crossed the bus again.
    let stats = ctx.stats(DeviceId(0)).unwrap();
    assert_eq!(stats.transferred_in, 4 * TILE_BYTES);
    assert_allclose_f32(&c.to_vec(), &expected, 1e-5, 1e-5, "after host update");
}

#[test]
fn test_failure_disables_device_and_falls_back_once() {
    let handle = EmulatedDevice::new("emu0", 1 << 20);
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = Arc::new(context(vec![handle.clone()], &scheduler));

    let tiles: Vec<_> = (0..5).map(|_| zero_tile()).collect();
    let task = |id: usize| {
        gemm(
            id as u64,
            ((id, 0), &tiles[id]),
            ((id, 0), &tiles[id]),
            ((id, id + 1), &tiles[id]),
        )
    };

    // Pin task 0 on its lane so the owner stays in its loop.
    handle.set_held(true);
    let owner = {
        let ctx = Arc::clone(&ctx);
        let first = task(0);
        thread::spawn(move || ctx.submit(first))
    };
    while handle.stats().launches < 1 {
        thread::yield_now();
    }

    handle.fail_launch_after(0);
    for id in 1..5 {
        assert_ne!(ctx.offload(DeviceId(0), task(id)), Offload::Executed);
    }
    handle.set_held(false);
    assert_eq!(owner.join().unwrap(), Offload::Executed);

    assert_eq!(ctx.device_state(DeviceId(0)), Some(DeviceState::Disabled));
    assert!(ctx.active_devices().is_empty());

    let counts = scheduler.counts();
    assert_eq!(counts.len(), 5);
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(scheduler.fallbacks(), 4);
    assert!(scheduler.seen().contains(&(
        TaskId(0),
        TaskStatus::Completed { device: DeviceId(0) }
    )));

    let stats = ctx.stats(DeviceId(0)).unwrap();
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.fell_back, 4);
    assert_eq!(ctx.host_tasks(), 4);

    // Disabled for the rest of the run.
    assert_eq!(ctx.submit(task(1)), Offload::FellBack);
    assert_eq!(
        scheduler.seen().last(),
        Some(&(
            TaskId(1),
            TaskStatus::Fallback {
                device: None,
                reason: FallbackReason::NoDevice
            }
        ))
    );
}

#[test]
fn test_owner_blocks_once_every_lane_is_busy() {
    let handle = EmulatedDevice::new("emu0", 1 << 20).with_latency(500);
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = Context::new(
        OffloadConfig::new(DIM).with_max_lanes(1),
        vec![handle.clone()],
        scheduler.clone(),
    )
    .unwrap();

    let tile = zero_tile();
    let task = gemm(1, ((1, 0), &tile), ((1, 0), &tile), ((1, 1), &tile));
    assert_eq!(ctx.submit(task), Offload::Executed);

    // One look at the lane, then a synchronize instead of a polling loop.
    assert!(handle.stats().queries <= 2);
    assert_eq!(scheduler.fallbacks(), 0);
    assert_eq!(ctx.stats(DeviceId(0)).unwrap().executed, 1);
}

#[test]
fn test_fallback_tasks_run_on_host() {
    let mut rng = rng(15);
    let handle = EmulatedDevice::new("emu0", 1 << 20);
    handle.fail_copy_after(2);
    let scheduler = Arc::new(RecordingScheduler::keeping_fallbacks());
    let ctx = context(vec![handle], &scheduler);

    let a = random_tile(&mut rng);
    let b = random_tile(&mut rng);
    let c = random_tile(&mut rng);
    let expected = reference_update(&a.to_vec(), &b.to_vec(), &c.to_vec());

    // The third operand copy fails.
    let task = gemm(7, ((1, 0), &a), ((2, 0), &b), ((2, 1), &c)).with_writeback(true);
    assert_eq!(ctx.submit(task), Offload::Executed);
    assert_eq!(scheduler.fallbacks(), 1);

    for task in scheduler.take_parked() {
        ctx.execute_on_host(&task);
    }
    assert_allclose_f32(&c.to_vec(), &expected, 1e-5, 1e-5, "host fallback");
    assert_eq!(ctx.device_state(DeviceId(0)), Some(DeviceState::Disabled));

    let report = ctx.shutdown();
    assert_eq!(report.host_tasks, 1);
    assert_eq!(report.device_tasks(), 0);
    assert!(report.devices[0].disabled);
}

#[test]
fn test_concurrent_submitters_deliver_exactly_once() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 40;

    let devices = vec![
        EmulatedDevice::new("emu0", 1 << 20).with_latency(3),
        EmulatedDevice::new("emu1", 1 << 20).with_latency(1),
    ];
    let handles = devices.clone();
    let scheduler = Arc::new(RecordingScheduler::default());
    let ctx = Arc::new(context(devices, &scheduler));

    let mut rng = rng(16);
    let panel: Vec<_> = (0..4).map(|_| random_tile(&mut rng)).collect();
    let panel = Arc::new(panel);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let ctx = Arc::clone(&ctx);
            let panel = Arc::clone(&panel);
            thread::spawn(move || {
                let mut targets = Vec::new();
                for i in 0..PER_THREAD {
                    let id = t * PER_THREAD + i;
                    let c = zero_tile();
                    let (p, q) = (id % 4, (id / 4) % 4);
                    let task = gemm(
                        id as u64,
                        ((p, 0), &panel[p]),
                        ((q, 0), &panel[q]),
                        ((100 + id, 1), &c),
                    )
                    .with_writeback(true);
                    ctx.submit(task);
                    targets.push((id, c));
                }
                targets
            })
        })
        .collect();

    let targets: Vec<_> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();

    let counts = scheduler.counts();
    assert_eq!(counts.len(), THREADS * PER_THREAD);
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(scheduler.fallbacks(), 0);

    for device in [DeviceId(0), DeviceId(1)] {
        assert_eq!(ctx.device_state(device), Some(DeviceState::Idle));
    }
    for handle in &handles {
        assert_eq!(handle.stats().max_concurrent_callers, 1);
    }

    let zeros = vec![0.0; TILE_LEN];
    for (id, c) in targets {
        let (p, q) = (id % 4, (id / 4) % 4);
        let expected = reference_update(&panel[p].to_vec(), &panel[q].to_vec(), &zeros);
        assert_allclose_f32(&c.to_vec(), &expected, 1e-5, 1e-5, &format!("task {id}"));
    }

    let ctx = Arc::into_inner(ctx).unwrap();
    let report = ctx.shutdown();
    assert_eq!(report.total_tasks(), (THREADS * PER_THREAD) as u64);
    assert_eq!(report.host_tasks, 0);
}

#[test]
fn test_reentrant_scheduler_can_submit_follow_up_work() {
    struct Chain {
        ctx: parking_lot::Mutex<Option<Arc<Context<EmulatedDevice>>>>,
        tiles: Vec<Arc<HostTile>>,
        done: parking_lot::Mutex<Vec<TaskId>>,
    }

    impl HostScheduler for Chain {
        fn task_complete(&self, task: GemmTask, status: TaskStatus) {
            assert!(!status.is_fallback());
            self.done.lock().push(task.id());
            let next = task.id().0 + 1;
            if next < self.tiles.len() as u64 {
                let ctx = self.ctx.lock().clone();
                if let Some(ctx) = ctx {
                    let tile = &self.tiles[next as usize];
                    let coord = (next as usize, 0);
                    ctx.submit(gemm(next, (coord, tile), (coord, tile), ((9, 9), tile)));
                }
            }
        }
    }

    let chain = Arc::new(Chain {
        ctx: parking_lot::Mutex::new(None),
        tiles: (0..6).map(|_| zero_tile()).collect(),
        done: parking_lot::Mutex::new(Vec::new()),
    });
    let ctx = Arc::new(
        Context::new(
            OffloadConfig::new(DIM),
            vec![EmulatedDevice::new("emu0", 1 << 20)],
            chain.clone(),
        )
        .unwrap(),
    );
    *chain.ctx.lock() = Some(Arc::clone(&ctx));

    let tile = &chain.tiles[0];
    assert_eq!(
        ctx.submit(gemm(0, ((0, 0), tile), ((0, 0), tile), ((9, 9), tile))),
        Offload::Executed
    );

    let done = chain.done.lock().clone();
    assert_eq!(done, (0..6).map(TaskId).collect::<Vec<_>>());
    assert_eq!(ctx.device_state(DeviceId(0)), Some(DeviceState::Idle));

    // Break the cycle between the scheduler and the context.
    chain.ctx.lock().take();
}
