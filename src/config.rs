//! Offload engine configuration

use crate::error::{Error, Result};

/// Lanes per device when not configured otherwise
pub const DEFAULT_MAX_LANES: usize = 4;

/// Share of usable device memory given to the tile cache
pub const DEFAULT_MEMORY_FRACTION: f64 = 0.9;

/// Configuration shared by every device of a context
///
/// # Example
///
/// ```
/// use tile_offload::OffloadConfig;
///
/// let config = OffloadConfig::new(256)
///     .with_max_lanes(2)
///     .with_max_slots(64);
/// assert_eq!(config.tile_bytes(), 256 * 256 * 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct OffloadConfig {
    /// Tile dimension: every tile is `tile_dim x tile_dim` `f32` elements
    pub tile_dim: usize,
    /// Upper bound on concurrently in-flight tasks per device
    pub max_lanes: usize,
    /// Fraction of the device's usable memory turned into cache slots
    pub memory_fraction: f64,
    /// Upper bound on cache slots per device, typically half the tile count
    /// of the matrix
    pub max_slots: Option<usize>,
}

impl OffloadConfig {
    /// Configuration for `tile_dim x tile_dim` tiles with default limits
    pub fn new(tile_dim: usize) -> Self {
        Self {
            tile_dim,
            max_lanes: DEFAULT_MAX_LANES,
            memory_fraction: DEFAULT_MEMORY_FRACTION,
            max_slots: None,
        }
    }

    /// Set the lane limit
    pub fn with_max_lanes(mut self, max_lanes: usize) -> Self {
        self.max_lanes = max_lanes;
        self
    }

    /// Set the memory fraction
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    /// Cap the number of cache slots per device
    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = Some(max_slots);
        self
    }

    /// Cap slots at half the tiles of an `mt x nt` tiled matrix
    pub fn with_matrix_tiles(self, mt: usize, nt: usize) -> Self {
        self.with_max_slots((mt * nt / 2).max(1))
    }

    /// Elements per tile
    pub fn tile_len(&self) -> usize {
        self.tile_dim * self.tile_dim
    }

    /// Bytes per tile (and per cache slot)
    pub fn tile_bytes(&self) -> usize {
        self.tile_len() * std::mem::size_of::<f32>()
    }

    /// Number of cache slots a device with `usable` bytes should get
    pub fn slots_for(&self, usable: u64) -> usize {
        let budget = (usable as f64 * self.memory_fraction) as u64;
        let slots = (budget / self.tile_bytes() as u64) as usize;
        match self.max_slots {
            Some(cap) => slots.min(cap),
            None => slots,
        }
    }

    /// Check every field
    pub fn validate(&self) -> Result<()> {
        if self.tile_dim == 0 {
            return Err(Error::invalid_config("tile_dim", "must be positive"));
        }
        if self.max_lanes == 0 {
            return Err(Error::invalid_config("max_lanes", "must be positive"));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(Error::invalid_config(
                "memory_fraction",
                format!("{} is outside (0, 1]", self.memory_fraction),
            ));
        }
        if self.max_slots == Some(0) {
            return Err(Error::invalid_config("max_slots", "must be positive"));
        }
        Ok(())
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self::new(128)
    }
}
