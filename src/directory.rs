//! Tile directory: the single source of truth for tile versions
//!
//! The directory maps every [`TileCoordinate`] the offload path has touched to
//! a [`TileRecord`]. A record carries the authoritative host version of the
//! tile and, per device, a handle to the cache slot currently holding a copy.
//!
//! # Concurrency
//!
//! Records are created lazily and concurrently: two devices touching a tile
//! for the first time at the same moment race to insert, and exactly one
//! record wins. The loser's allocation is dropped and it continues with the
//! winner's record.
//!
//! Once created, a record is shared through `Arc` and never removed until
//! [`TileDirectory::clear`] at shutdown. Versions and usage counters are
//! atomics. The per-device slot table is mutated only by the thread owning
//! the corresponding device, under a short uncontended lock.

use crate::runtime::DeviceId;
use crate::tile::{AccessMask, TileCoordinate};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reverse link from a tile record to the cache slot holding it on one device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRef {
    /// Slot index in the device cache
    pub slot: usize,
    /// Access accumulated by in-flight tasks on that slot
    pub access: AccessMask,
}

/// Consistency record of one tile
#[derive(Debug)]
pub struct TileRecord {
    coord: TileCoordinate,
    host_version: AtomicU64,
    readers: AtomicU64,
    writers: AtomicU64,
    copies: Mutex<Vec<Option<SlotRef>>>,
}

impl TileRecord {
    fn new(coord: TileCoordinate, devices: usize) -> Self {
        Self {
            coord,
            host_version: AtomicU64::new(0),
            readers: AtomicU64::new(0),
            writers: AtomicU64::new(0),
            copies: Mutex::new(vec![None; devices]),
        }
    }

    /// Tile coordinate
    pub fn coord(&self) -> TileCoordinate {
        self.coord
    }

    /// Version of the host-resident copy
    pub fn host_version(&self) -> u64 {
        self.host_version.load(Ordering::Acquire)
    }

    /// Number of read accesses recorded
    pub fn readers(&self) -> u64 {
        self.readers.load(Ordering::Relaxed)
    }

    /// Number of write accesses recorded
    pub fn writers(&self) -> u64 {
        self.writers.load(Ordering::Relaxed)
    }

    /// Slot holding this tile on `device`, if any
    pub fn copy_on(&self, device: DeviceId) -> Option<SlotRef> {
        self.copies.lock().get(device.index()).copied().flatten()
    }

    /// Devices currently holding a cached copy
    pub fn cached_on(&self) -> Vec<DeviceId> {
        self.copies
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, copy)| copy.map(|_| DeviceId(i)))
            .collect()
    }

    /// First device holding a WRITE-tagged copy
    pub fn write_owner(&self) -> Option<DeviceId> {
        self.copies
            .lock()
            .iter()
            .position(|copy| matches!(copy, Some(slot) if slot.access.is_write()))
            .map(DeviceId)
    }

    /// Bump the host version and return the new value.
    pub(crate) fn bump_version(&self) -> u64 {
        self.host_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn note_access(&self, mask: AccessMask) {
        if mask.contains(AccessMask::READ) {
            self.readers.fetch_add(1, Ordering::Relaxed);
        }
        if mask.is_write() {
            self.writers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record that `slot` on `device` now holds this tile.
    ///
    /// # Panics
    /// Panics if the tile is already bound on that device.
    pub(crate) fn bind(&self, device: DeviceId, slot: SlotRef) {
        let mut copies = self.copies.lock();
        let entry = &mut copies[device.index()];
        assert!(
            entry.is_none(),
            "tile {} is already bound to slot {:?} on {}",
            self.coord,
            entry,
            device
        );
        *entry = Some(slot);
    }

    /// Remove the link to `slot` on `device` (eviction).
    ///
    /// # Panics
    /// Panics if the tile is not bound to that slot.
    pub(crate) fn unbind(&self, device: DeviceId, slot: usize) {
        let mut copies = self.copies.lock();
        let entry = &mut copies[device.index()];
        match entry {
            Some(bound) if bound.slot == slot => *entry = None,
            other => panic!(
                "tile {} unbound from slot {} on {} but is linked to {:?}",
                self.coord, slot, device, other
            ),
        }
    }

    pub(crate) fn set_access(&self, device: DeviceId, slot: usize, access: AccessMask) {
        let mut copies = self.copies.lock();
        if let Some(bound) = copies[device.index()].as_mut() {
            debug_assert_eq!(bound.slot, slot);
            bound.access = access;
        }
    }
}

/// Global mapping from tile coordinate to tile record
#[derive(Debug)]
pub struct TileDirectory {
    devices: usize,
    tiles: RwLock<HashMap<TileCoordinate, Arc<TileRecord>>>,
}

impl TileDirectory {
    /// Create an empty directory for an inventory of `devices` devices
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            tiles: RwLock::new(HashMap::new()),
        }
    }

    /// Number of devices records are sized for
    pub fn device_count(&self) -> usize {
        self.devices
    }

    /// Get the record for `coord`, creating it on first touch.
    ///
    /// Idempotent and safe under concurrent first touch: every caller gets
    /// the same record.
    pub fn get_or_create(&self, coord: TileCoordinate) -> Arc<TileRecord> {
        if let Some(record) = self.tiles.read().get(&coord) {
            return Arc::clone(record);
        }

        let fresh = Arc::new(TileRecord::new(coord, self.devices));
        let mut tiles = self.tiles.write();
        // A racing thread may have inserted between the two locks; its record wins.
        Arc::clone(tiles.entry(coord).or_insert(fresh))
    }

    /// Get the record for `coord` if the tile has been touched
    pub fn get(&self, coord: TileCoordinate) -> Option<Arc<TileRecord>> {
        self.tiles.read().get(&coord).cloned()
    }

    /// Get the record for `coord`.
    ///
    /// # Panics
    /// Panics if the tile was never touched; callers use this where a record
    /// must exist.
    pub fn expect(&self, coord: TileCoordinate) -> Arc<TileRecord> {
        self.get(coord)
            .unwrap_or_else(|| panic!("tile {coord} has no directory entry"))
    }

    /// Record a usage of `coord` in the reader/writer counters.
    ///
    /// A tile never touched by the offload path has nothing to track and is
    /// left alone.
    pub fn mark_usage(&self, coord: TileCoordinate, mask: AccessMask) {
        if let Some(record) = self.get(coord) {
            record.note_access(mask);
        }
    }

    /// Declare that the host copy of `coord` was modified outside the
    /// offload path. Every cached device copy becomes stale.
    ///
    /// Returns the new host version, or `None` for an untouched tile.
    pub fn invalidate(&self, coord: TileCoordinate) -> Option<u64> {
        self.get(coord).map(|record| record.bump_version())
    }

    /// Device currently holding a WRITE-tagged copy of `coord`.
    ///
    /// This is a routing hint: the returned device is likely to hold the
    /// freshest copy, nothing stronger.
    pub fn write_owner(&self, coord: TileCoordinate) -> Option<DeviceId> {
        self.get(coord).and_then(|record| record.write_owner())
    }

    /// Number of tiles touched so far
    pub fn len(&self) -> usize {
        self.tiles.read().len()
    }

    /// Returns true if no tile has been touched
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record (shutdown)
    pub fn clear(&self) {
        self.tiles.write().clear();
    }
}
