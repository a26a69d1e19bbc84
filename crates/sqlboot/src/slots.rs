//! Fixed-size slot arena with an index-based free list.
//!
//! One contiguous `Vec<u8>` is sliced into `count` cells of `slot_size`
//! bytes. Free cells are chained through a parallel `next` table of `u32`
//! indices, so acquire and release are O(1) and a cell carries no metadata
//! beyond its index. Handles ([`SlotId`]) are move-only and remember which
//! arena produced them, so a cell can never be released into another pool.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const NIL: u32 = u32::MAX;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one cell of a [`SlotArena`]. Not `Clone`: releasing it consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotId {
    arena: u64,
    index: u32,
}

impl SlotId {
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }
}

pub struct SlotArena {
    id: u64,
    backing: Vec<u8>,
    slot_size: usize,
    next: Vec<u32>,
    head: u32,
    free: usize,
}

impl SlotArena {
    /// An arena with no cells. Every `pop` fails.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            backing: Vec::new(),
            slot_size: 0,
            next: Vec::new(),
            head: NIL,
            free: 0,
        }
    }

    /// Allocate backing storage for `count` cells of `slot_size` bytes and
    /// link them into the free list, lowest index first.
    ///
    /// Returns `None` if the backing storage cannot be reserved or the
    /// geometry overflows.
    #[must_use]
    pub fn new(slot_size: usize, count: usize) -> Option<Self> {
        let count_u32 = u32::try_from(count).ok().filter(|&c| c != NIL)?;
        let total = slot_size.checked_mul(count)?;

        let mut backing = Vec::new();
        backing.try_reserve_exact(total).ok()?;
        backing.resize(total, 0);
        let mut next = Vec::new();
        next.try_reserve_exact(count).ok()?;
        next.extend((1..=count_u32).map(|i| if i == count_u32 { NIL } else { i }));

        Some(Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            backing,
            slot_size,
            next,
            head: if count == 0 { NIL } else { 0 },
            free: count,
        })
    }

    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total number of cells.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    /// Number of cells currently on the free list.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Number of cells currently handed out.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.capacity() - self.free
    }

    /// Pop the head of the free list.
    pub fn pop(&mut self) -> Option<SlotId> {
        if self.head == NIL {
            return None;
        }
        let index = self.head;
        self.head = self.next[index as usize];
        self.free -= 1;
        Some(SlotId {
            arena: self.id,
            index,
        })
    }

    /// Push a cell back onto the free list.
    pub fn push(&mut self, slot: SlotId) {
        assert!(self.owns(&slot), "slot released into a foreign arena");
        debug_assert!(self.free < self.capacity(), "more releases than acquires");
        self.next[slot.index as usize] = self.head;
        self.head = slot.index;
        self.free += 1;
    }

    /// Whether `slot` was produced by this arena.
    #[must_use]
    pub fn owns(&self, slot: &SlotId) -> bool {
        slot.arena == self.id && (slot.index as usize) < self.capacity()
    }

    #[must_use]
    pub fn bytes(&self, slot: &SlotId) -> &[u8] {
        assert!(self.owns(slot), "slot read through a foreign arena");
        let start = slot.index as usize * self.slot_size;
        &self.backing[start..start + self.slot_size]
    }

    pub fn bytes_mut(&mut self, slot: &SlotId) -> &mut [u8] {
        assert!(self.owns(slot), "slot written through a foreign arena");
        let start = slot.index as usize * self.slot_size;
        &mut self.backing[start..start + self.slot_size]
    }
}

impl fmt::Debug for SlotArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotArena")
            .field("slot_size", &self.slot_size)
            .field("capacity", &self.capacity())
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}
