//! Per-connection lookaside pool.
//!
//! Small, short-lived allocations made on behalf of a connection are served
//! from a fixed number of equal-size cells carved out of one arena, avoiding
//! general-heap traffic. A request that is too large, or that arrives while
//! every cell is out, falls through to the heap; the two kinds of miss are
//! counted separately.
//!
//! Cells are always exactly `slot_size` bytes and are never resized.

use serde::Serialize;
use sqlboot_error::{Result, SqlbootError};
use tracing::debug;

use crate::slots::{SlotArena, SlotId};

/// Slot sizes at or below this are too small to be useful and disable the pool.
pub const MIN_SLOT_SIZE: usize = 8;

/// Snapshot of the lookaside counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LookasideStats {
    /// Requests served from the pool.
    pub hits: u64,
    /// Requests rejected because they were larger than a cell.
    pub size_misses: u64,
    /// Requests rejected because no cell was free.
    pub full_misses: u64,
    /// Cells currently handed out.
    pub outstanding: usize,
    /// Largest value `outstanding` has reached.
    pub high_water: usize,
}

/// Individually resettable lookaside counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookasideCounter {
    Hit,
    MissSize,
    MissFull,
}

#[derive(Debug)]
pub struct Lookaside {
    arena: SlotArena,
    enabled: bool,
    high_water: usize,
    hits: u64,
    size_misses: u64,
    full_misses: u64,
}

impl Lookaside {
    /// A pool with no cells; every request falls through to the heap.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            arena: SlotArena::empty(),
            enabled: false,
            high_water: 0,
            hits: 0,
            size_misses: 0,
            full_misses: 0,
        }
    }

    /// Build a pool of `count` cells of `slot_size` bytes.
    ///
    /// `slot_size` is rounded down to a multiple of 8. A size of
    /// [`MIN_SLOT_SIZE`] or less, a zero count, or a failure to reserve the
    /// arena all yield a disabled pool rather than an error.
    #[must_use]
    pub fn new(slot_size: usize, count: usize) -> Self {
        let size = slot_size & !7;
        if size <= MIN_SLOT_SIZE || count == 0 {
            return Self::disabled();
        }
        match SlotArena::new(size, count) {
            Some(arena) => Self {
                arena,
                enabled: true,
                ..Self::disabled()
            },
            None => {
                debug!(
                    target: "sqlboot.lookaside",
                    slot_size = size,
                    count,
                    "lookaside arena unavailable; pool disabled"
                );
                Self::disabled()
            }
        }
    }

    /// Replace the pool geometry. Fails while any cell is outstanding.
    pub fn reconfigure(&mut self, slot_size: usize, count: usize) -> Result<()> {
        if self.arena.outstanding() > 0 {
            return Err(SqlbootError::Busy {
                resource: "lookaside",
            });
        }
        *self = Self::new(slot_size, count);
        debug!(
            target: "sqlboot.lookaside",
            slot_size = self.slot_size(),
            count = self.capacity(),
            enabled = self.enabled,
            "lookaside reconfigured"
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn the pool on or off, returning the previous setting. A pool with
    /// no cells stays off.
    pub fn set_enabled(&mut self, on: bool) -> bool {
        let previous = self.enabled;
        self.enabled = on && self.arena.capacity() > 0;
        previous
    }

    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.arena.slot_size()
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.arena.outstanding()
    }

    /// Take a cell for a request of `n` bytes.
    pub fn acquire(&mut self, n: usize) -> Option<SlotId> {
        if !self.enabled {
            return None;
        }
        if n > self.arena.slot_size() {
            self.size_misses += 1;
            return None;
        }
        let Some(slot) = self.arena.pop() else {
            self.full_misses += 1;
            return None;
        };
        self.hits += 1;
        self.high_water = self.high_water.max(self.arena.outstanding());
        Some(slot)
    }

    /// Return a cell to the free list.
    pub fn release(&mut self, slot: SlotId) {
        self.arena.push(slot);
    }

    #[must_use]
    pub fn owns(&self, slot: &SlotId) -> bool {
        self.arena.owns(slot)
    }

    #[must_use]
    pub fn bytes(&self, slot: &SlotId) -> &[u8] {
        self.arena.bytes(slot)
    }

    pub fn bytes_mut(&mut self, slot: &SlotId) -> &mut [u8] {
        self.arena.bytes_mut(slot)
    }

    #[must_use]
    pub fn stats(&self) -> LookasideStats {
        LookasideStats {
            hits: self.hits,
            size_misses: self.size_misses,
            full_misses: self.full_misses,
            outstanding: self.arena.outstanding(),
            high_water: self.high_water,
        }
    }

    /// Read one counter, optionally zeroing it.
    pub fn read_counter(&mut self, which: LookasideCounter, reset: bool) -> u64 {
        let counter = match which {
            LookasideCounter::Hit => &mut self.hits,
            LookasideCounter::MissSize => &mut self.size_misses,
            LookasideCounter::MissFull => &mut self.full_misses,
        };
        let value = *counter;
        if reset {
            *counter = 0;
        }
        value
    }

    /// Reset the high-water mark to the current outstanding count.
    pub fn reset_high_water(&mut self) {
        self.high_water = self.arena.outstanding();
    }
}
