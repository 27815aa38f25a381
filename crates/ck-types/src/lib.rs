#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default disk block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Default number of buffer cache slots.
pub const DEFAULT_CACHE_SLOTS: usize = 30;

/// Default number of buffer cache hash buckets.
pub const DEFAULT_CACHE_BUCKETS: usize = 13;

/// Default physical page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default number of allocatable page frames.
pub const DEFAULT_PAGE_COUNT: usize = 1024;

/// Default base address of the allocatable physical range.
pub const DEFAULT_PAGE_BASE: u64 = 0x8000_0000;

/// Identifies a disk device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Block number on a device. `(DeviceId, BlockNumber)` is a buffer's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Physical address of a page frame.
///
/// This is a unit-carrying wrapper so byte offsets and page addresses cannot
/// be mixed up; the allocator validates alignment and range before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Whether this address is a multiple of `page_size`.
    #[must_use]
    pub fn is_aligned(self, page_size: PageSize) -> bool {
        self.0 % u64::from(page_size.get()) == 0
    }
}

/// Logical clock tick used to rank unreferenced buffers for eviction.
///
/// Stamped when a buffer's reference count last reached zero; the value is
/// stale (and never consulted) while the buffer is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    pub const ZERO: Self = Self(0);
}

/// Validated disk block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// The stock block size, [`DEFAULT_BLOCK_SIZE`] bytes.
    pub const DEFAULT: Self = Self(DEFAULT_BLOCK_SIZE);

    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ConfigError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` buffer length.
    #[must_use]
    pub fn byte_len(self) -> usize {
        self.0 as usize
    }
}

/// Validated physical page size (power of two in 256..=65536).
///
/// The lower bound leaves room for the free-list link that lives inside a
/// free page's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    /// The stock page size, [`DEFAULT_PAGE_SIZE`] bytes.
    pub const DEFAULT: Self = Self(DEFAULT_PAGE_SIZE);

    /// Create a `PageSize` if `value` is a power of two in [256, 65536].
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() || !(256..=65536).contains(&value) {
            return Err(ConfigError::InvalidField {
                field: "page_size",
                reason: "must be power of two in 256..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Page size as a `usize` frame length.
    #[must_use]
    pub fn byte_len(self) -> usize {
        self.0 as usize
    }
}

/// Configuration validation errors shared by both subsystems.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}
