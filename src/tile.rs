//! Tile identity, access masks and host-side tile buffers

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Position of a tile within a tiled matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    /// Tile row index
    pub row: usize,
    /// Tile column index
    pub col: usize,
}

impl TileCoordinate {
    /// Create a new tile coordinate
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

impl From<(usize, usize)> for TileCoordinate {
    fn from((row, col): (usize, usize)) -> Self {
        Self::new(row, col)
    }
}

/// How a task uses a tile: a small `{READ, WRITE}` bitset
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessMask(u8);

impl AccessMask {
    /// No access recorded
    pub const NONE: Self = Self(0);
    /// Tile is read
    pub const READ: Self = Self(0b01);
    /// Tile is written
    pub const WRITE: Self = Self(0b10);
    /// Tile is read and written (accumulation target)
    pub const READ_WRITE: Self = Self(0b11);

    /// Returns true if every bit of `other` is set in `self`
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bit is set
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the READ bit is set
    #[inline]
    pub const fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// Returns true if the WRITE bit is set
    #[inline]
    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl BitOr for AccessMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => f.write_str("READ|WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

/// Host-resident tile data (row-major `f32`)
///
/// The buffer is a boxed slice and never reallocates, so the address handed
/// to an asynchronous copy stays valid for as long as the tile is alive. Tasks
/// keep their tiles alive through `Arc<HostTile>` until they complete.
pub struct HostTile {
    data: Mutex<Box<[f32]>>,
}

impl HostTile {
    /// Create a zero-filled tile of `len` elements
    pub fn zeros(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    /// Create a tile from existing data
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            data: Mutex::new(data.into_boxed_slice()),
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns true if the tile holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes
    pub fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    /// Lock the tile for host access
    pub fn lock(&self) -> MutexGuard<'_, Box<[f32]>> {
        self.data.lock()
    }

    /// Copy the contents out
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.lock().to_vec()
    }

    /// Raw base address for DMA engines.
    ///
    /// The caller must keep the tile alive until the transfer using this
    /// address has completed.
    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    pub(crate) fn as_mut_ptr(&self) -> *mut f32 {
        self.data.lock().as_mut_ptr()
    }
}

impl fmt::Debug for HostTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTile")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
