//! Common test utilities
#![allow(dead_code)]

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tile_offload::prelude::*;

/// Tile dimension used by the integration tests
pub const DIM: usize = 4;

/// Elements per tile
pub const TILE_LEN: usize = DIM * DIM;

/// Bytes per tile
pub const TILE_BYTES: u64 = (TILE_LEN * std::mem::size_of::<f32>()) as u64;

/// Host scheduler that records every completion it receives
#[derive(Default)]
pub struct RecordingScheduler {
    seen: Mutex<Vec<(TaskId, TaskStatus)>>,
    parked: Mutex<Vec<GemmTask>>,
    keep_fallbacks: bool,
}

impl RecordingScheduler {
    /// Also keep every fallen-back task so the test can run it on the host
    pub fn keeping_fallbacks() -> Self {
        Self {
            keep_fallbacks: true,
            ..Self::default()
        }
    }

    /// Completions in arrival order
    pub fn seen(&self) -> Vec<(TaskId, TaskStatus)> {
        self.seen.lock().clone()
    }

    /// Number of reports received per task
    pub fn counts(&self) -> HashMap<TaskId, usize> {
        let mut counts = HashMap::new();
        for (id, _) in self.seen.lock().iter() {
            *counts.entry(*id).or_insert(0) += 1;
        }
        counts
    }

    /// Number of fallback reports
    pub fn fallbacks(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|(_, status)| status.is_fallback())
            .count()
    }

    /// Take the fallen-back tasks kept so far
    pub fn take_parked(&self) -> Vec<GemmTask> {
        std::mem::take(&mut *self.parked.lock())
    }
}

impl HostScheduler for RecordingScheduler {
    fn task_complete(&self, task: GemmTask, status: TaskStatus) {
        self.seen.lock().push((task.id(), status.clone()));
        if self.keep_fallbacks && status.is_fallback() {
            self.parked.lock().push(task);
        }
    }
}

/// Seeded random generator
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Tile filled with values in [-1, 1)
pub fn random_tile(rng: &mut StdRng) -> Arc<HostTile> {
    let data = (0..TILE_LEN).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    Arc::new(HostTile::from_vec(data))
}

/// Zero-filled tile
pub fn zero_tile() -> Arc<HostTile> {
    Arc::new(HostTile::zeros(TILE_LEN))
}

/// Task over three existing host tiles
pub fn gemm(
    id: u64,
    a: ((usize, usize), &Arc<HostTile>),
    b: ((usize, usize), &Arc<HostTile>),
    c: ((usize, usize), &Arc<HostTile>),
) -> GemmTask {
    GemmTask::new(
        id,
        TileOperand::new(a.0, Arc::clone(a.1)),
        TileOperand::new(b.0, Arc::clone(b.1)),
        TileOperand::new(c.0, Arc::clone(c.1)),
    )
}

/// `c - a * b^T`, computed naively
pub fn reference_update(a: &[f32], b: &[f32], c: &[f32]) -> Vec<f32> {
    let mut out = c.to_vec();
    for i in 0..DIM {
        for j in 0..DIM {
            let dot: f32 = (0..DIM).map(|p| a[i * DIM + p] * b[j * DIM + p]).sum();
            out[i * DIM + j] -= dot;
        }
    }
    out
}

/// Assert two f32 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}
