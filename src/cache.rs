//! Per-device tile cache
//!
//! A device cache is a fixed pool of equally sized slots carved out of device
//! memory at initialization. Each slot holds at most one tile. Replacement is
//! strict LRU over slot indices: a hit moves the slot to the MRU end, a miss
//! takes the LRU slot, evicting whatever it held.
//!
//! Eviction never copies a dirty slot back to the host. Device-side writes
//! reach the host only through the writeback a task requests with
//! [`GemmTask::writeback`](crate::task::GemmTask::writeback), so the last
//! device writer of a tile must set it.
//!
//! The cache is only ever touched by the thread owning its device.

use crate::directory::{SlotRef, TileRecord};
use crate::error::{Error, Result};
use crate::runtime::{Backend, DeviceId, DevicePtr};
use crate::tile::{AccessMask, TileCoordinate};
use std::sync::Arc;

/// Outcome of [`DeviceCache::resolve`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Slot now holding the tile
    pub slot: usize,
    /// Device address of the slot
    pub device_ptr: DevicePtr,
    /// The slot does not hold the current host version; a host->device copy
    /// must be issued before the tile is used
    pub transfer_required: bool,
}

struct CacheSlot {
    ptr: DevicePtr,
    bound: Option<Arc<TileRecord>>,
    cached_version: u64,
    access: AccessMask,
}

const NIL: usize = usize::MAX;

/// Intrusive doubly-linked list over slot indices, LRU at the head
struct LruList {
    prev: Vec<usize>,
    next: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruList {
    /// All `len` slots linked in index order
    fn new(len: usize) -> Self {
        let mut list = Self {
            prev: vec![NIL; len],
            next: vec![NIL; len],
            head: NIL,
            tail: NIL,
        };
        for i in 0..len {
            list.push_back(i);
        }
        list
    }

    fn push_back(&mut self, i: usize) {
        self.prev[i] = self.tail;
        self.next[i] = NIL;
        if self.tail == NIL {
            self.head = i;
        } else {
            self.next[self.tail] = i;
        }
        self.tail = i;
    }

    fn unlink(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        if p == NIL {
            self.head = n;
        } else {
            self.next[p] = n;
        }
        if n == NIL {
            self.tail = p;
        } else {
            self.prev[n] = p;
        }
        self.prev[i] = NIL;
        self.next[i] = NIL;
    }

    /// Move `i` to the MRU end
    fn touch(&mut self, i: usize) {
        if self.tail != i {
            self.unlink(i);
            self.push_back(i);
        }
    }

    fn front(&self) -> Option<usize> {
        (self.head != NIL).then_some(self.head)
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.front(), move |&i| {
            let n = self.next[i];
            (n != NIL).then_some(n)
        })
    }
}

/// Fixed-capacity LRU cache of tiles on one device
pub struct DeviceCache {
    device: DeviceId,
    slot_bytes: usize,
    slots: Vec<CacheSlot>,
    lru: LruList,
}

impl std::fmt::Debug for DeviceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCache")
            .field("device", &self.device)
            .field("capacity", &self.slots.len())
            .field("slot_bytes", &self.slot_bytes)
            .finish()
    }
}

impl DeviceCache {
    /// Allocate up to `capacity` slots of `slot_bytes` on `backend`.
    ///
    /// Allocation stops at the first failure; the cache keeps whatever was
    /// allocated before it.
    ///
    /// # Errors
    /// Returns [`Error::NoDeviceMemory`] if not a single slot could be
    /// allocated.
    pub fn new<B: Backend>(
        device: DeviceId,
        backend: &B,
        capacity: usize,
        slot_bytes: usize,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match backend.allocate(slot_bytes) {
                Ok(ptr) => slots.push(CacheSlot {
                    ptr,
                    bound: None,
                    cached_version: 0,
                    access: AccessMask::NONE,
                }),
                Err(e) => {
                    log::debug!(
                        "{}: slot allocation stopped at {} of {}: {}",
                        device,
                        slots.len(),
                        capacity,
                        e
                    );
                    break;
                }
            }
        }

        if slots.is_empty() {
            return Err(Error::NoDeviceMemory {
                device,
                slots: 0,
                required: 1,
                slot_bytes,
            });
        }

        let lru = LruList::new(slots.len());
        Ok(Self {
            device,
            slot_bytes,
            slots,
            lru,
        })
    }

    /// Device this cache lives on
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per slot
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Make `tile` resident for an access of kind `mask`.
    ///
    /// On a hit the slot becomes MRU and `mask` is merged into its access.
    /// On a miss the LRU slot is evicted and rebound to `tile`. Either way,
    /// the slot is stamped with the current host version, and
    /// `transfer_required` reports whether the caller must copy the host data
    /// in before using it.
    pub fn resolve(&mut self, tile: &Arc<TileRecord>, mask: AccessMask) -> Resolution {
        let host_version = tile.host_version();

        if let Some(SlotRef { slot: index, .. }) = tile.copy_on(self.device) {
            self.lru.touch(index);
            let slot = &mut self.slots[index];
            slot.access |= mask;
            tile.set_access(self.device, index, slot.access);

            let transfer_required = slot.cached_version != host_version;
            slot.cached_version = host_version;
            return Resolution {
                slot: index,
                device_ptr: slot.ptr,
                transfer_required,
            };
        }

        let index = self
            .lru
            .front()
            .unwrap_or_else(|| panic!("{}: cache has no slots", self.device));
        self.lru.touch(index);

        let slot = &mut self.slots[index];
        if let Some(evicted) = slot.bound.take() {
            log::debug!(
                "{}: evict tile {} from slot {} for {}",
                self.device,
                evicted.coord(),
                index,
                tile.coord()
            );
            evicted.unbind(self.device, index);
        }

        tile.bind(
            self.device,
            SlotRef {
                slot: index,
                access: mask,
            },
        );
        slot.bound = Some(Arc::clone(tile));
        slot.access = mask;
        slot.cached_version = host_version;

        Resolution {
            slot: index,
            device_ptr: slot.ptr,
            transfer_required: true,
        }
    }

    /// Record that `slot` and the host agree at `version` after a writeback.
    ///
    /// # Panics
    /// Panics if `slot` is out of range.
    pub fn mark_written_back(&mut self, slot: usize, version: u64) {
        self.slots[slot].cached_version = version;
    }

    /// Tile bound to `slot`, if any
    pub fn bound_tile(&self, slot: usize) -> Option<TileCoordinate> {
        self.slots[slot].bound.as_ref().map(|tile| tile.coord())
    }

    /// Version stamped on `slot`
    pub fn cached_version(&self, slot: usize) -> u64 {
        self.slots[slot].cached_version
    }

    /// Slot indices from LRU to MRU
    pub fn lru_order(&self) -> Vec<usize> {
        self.lru.iter().collect()
    }

    /// Bound tiles from LRU to MRU
    pub fn lru_tiles(&self) -> Vec<TileCoordinate> {
        self.lru
            .iter()
            .filter_map(|index| self.bound_tile(index))
            .collect()
    }

    /// Unbind every tile and free device memory
    pub fn release<B: Backend>(mut self, backend: &B) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(tile) = slot.bound.take() {
                tile.unbind(self.device, index);
            }
            backend.deallocate(slot.ptr, self.slot_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::TileDirectory;
    use crate::runtime::emulated::EmulatedDevice;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SLOT_BYTES: usize = 64;

    fn cache_with(capacity: usize) -> (EmulatedDevice, DeviceCache) {
        let backend = EmulatedDevice::new("emu0", 1 << 20);
        let cache = DeviceCache::new(DeviceId(0), &backend, capacity, SLOT_BYTES).unwrap();
        (backend, cache)
    }

    fn coord(row: usize) -> TileCoordinate {
        TileCoordinate::new(row, 0)
    }

    #[test]
    fn test_hit_miss_and_eviction_order() {
        let directory = TileDirectory::new(1);
        let (_backend, mut cache) = cache_with(2);
        let a = directory.get_or_create(coord(0));
        let b = directory.get_or_create(coord(1));
        let c = directory.get_or_create(coord(2));

        assert!(cache.resolve(&a, AccessMask::WRITE).transfer_required);
        assert!(cache.resolve(&b, AccessMask::WRITE).transfer_required);
        assert!(!cache.resolve(&a, AccessMask::WRITE).transfer_required);
        assert!(cache.resolve(&c, AccessMask::WRITE).transfer_required);

        assert_eq!(cache.lru_tiles(), vec![coord(0), coord(2)]);
        assert_eq!(b.copy_on(DeviceId(0)), None);
        assert!(a.copy_on(DeviceId(0)).is_some());
    }

    #[test]
    fn test_lru_victim_is_least_recently_used() {
        let directory = TileDirectory::new(1);
        let capacity = 4;
        let (_backend, mut cache) = cache_with(capacity);
        let tiles: Vec<_> = (0..=capacity)
            .map(|i| directory.get_or_create(coord(i)))
            .collect();

        for tile in &tiles[..capacity] {
            cache.resolve(tile, AccessMask::READ);
        }
        // Touch tile 0 so tile 1 becomes LRU
        cache.resolve(&tiles[0], AccessMask::READ);
        let resolution = cache.resolve(&tiles[capacity], AccessMask::READ);

        assert!(resolution.transfer_required);
        assert_eq!(tiles[1].copy_on(DeviceId(0)), None);
        assert_eq!(
            cache.lru_tiles(),
            vec![coord(2), coord(3), coord(0), coord(4)]
        );
    }

    #[test]
    fn test_stale_hit_requires_transfer() {
        let directory = TileDirectory::new(1);
        let (_backend, mut cache) = cache_with(2);
        let a = directory.get_or_create(coord(0));

        let first = cache.resolve(&a, AccessMask::READ);
        directory.invalidate(coord(0));
        let second = cache.resolve(&a, AccessMask::READ);
        assert_eq!(first.slot, second.slot);
        assert!(second.transfer_required);
        assert_eq!(cache.cached_version(second.slot), 1);
        assert!(!cache.resolve(&a, AccessMask::READ).transfer_required);
    }

    #[test]
    fn test_write_mask_accumulates_until_eviction() {
        let directory = TileDirectory::new(1);
        let (_backend, mut cache) = cache_with(1);
        let a = directory.get_or_create(coord(0));
        let b = directory.get_or_create(coord(1));

        cache.resolve(&a, AccessMask::READ);
        assert_eq!(directory.write_owner(coord(0)), None);
        cache.resolve(&a, AccessMask::READ_WRITE);
        cache.resolve(&a, AccessMask::READ);
        assert_eq!(directory.write_owner(coord(0)), Some(DeviceId(0)));

        cache.resolve(&b, AccessMask::READ);
        assert_eq!(directory.write_owner(coord(0)), None);
        assert_eq!(
            b.copy_on(DeviceId(0)).map(|s| s.access),
            Some(AccessMask::READ)
        );
    }

    #[test]
    fn test_allocation_stops_at_device_limit() {
        let backend = EmulatedDevice::new("emu0", 3 * SLOT_BYTES as u64);
        let cache = DeviceCache::new(DeviceId(0), &backend, 8, SLOT_BYTES).unwrap();
        assert_eq!(cache.capacity(), 3);
        cache.release(&backend);
        assert_eq!(backend.stats().allocated_bytes, 0);

        let tiny = EmulatedDevice::new("emu1", SLOT_BYTES as u64 - 1);
        assert!(matches!(
            DeviceCache::new(DeviceId(1), &tiny, 8, SLOT_BYTES),
            Err(Error::NoDeviceMemory { slots: 0, .. })
        ));
    }

    #[test]
    fn test_release_unbinds_tiles() {
        let directory = TileDirectory::new(1);
        let (backend, mut cache) = cache_with(2);
        let a = directory.get_or_create(coord(0));
        cache.resolve(&a, AccessMask::READ_WRITE);
        cache.release(&backend);
        assert!(a.cached_on().is_empty());
    }

    /// Reference model: a plain vector ordered LRU -> MRU of (coord, version).
    #[test]
    fn test_randomized_against_reference_model() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let directory = TileDirectory::new(1);
        let capacity = 5;
        let (_backend, mut cache) = cache_with(capacity);
        let mut model: Vec<(TileCoordinate, u64)> = Vec::new();

        for _ in 0..2_000 {
            let key = coord(rng.random_range(0..12));
            if rng.random_bool(0.1) {
                directory.get_or_create(key);
                directory.invalidate(key);
                continue;
            }

            let tile = directory.get_or_create(key);
            let version = tile.host_version();
            let expected_transfer = match model.iter().position(|(c, _)| *c == key) {
                Some(pos) => {
                    let (_, cached) = model.remove(pos);
                    cached != version
                }
                None => {
                    if model.len() == capacity {
                        model.remove(0);
                    }
                    true
                }
            };
            model.push((key, version));

            let resolution = cache.resolve(&tile, AccessMask::READ);
            assert_eq!(resolution.transfer_required, expected_transfer);
            let resident: Vec<_> = model.iter().map(|(c, _)| *c).collect();
            assert_eq!(cache.lru_tiles(), resident);
        }
    }
}
