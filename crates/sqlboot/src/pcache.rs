//! Page-cache strategy hooks consumed by bootstrap and shutdown.
//!
//! The eviction policy lives elsewhere; this core only brings the strategy
//! up, wires the configured page-buffer region into it, and takes it down.

use parking_lot::Mutex;
use sqlboot_error::Result;
use tracing::debug;

use crate::config::BufferRegion;
use crate::slots::{SlotArena, SlotId};

/// Page buffers smaller than this are not worth pooling.
pub const MIN_PAGE_SLOT: usize = 512;

/// Pluggable page-cache implementation.
pub trait PageCacheMethods: Send + Sync {
    /// Called once per bootstrap, serialized by the init lock.
    fn init(&self) -> Result<()>;
    fn shutdown(&self);
    /// Hand the configured page-buffer region to the cache.
    fn buffer_setup(&self, region: BufferRegion);
}

/// Drop regions that are too small to be useful and round the cell size
/// down to a multiple of 8.
#[must_use]
pub fn normalize_page_region(region: BufferRegion) -> BufferRegion {
    if region.slot_size < MIN_PAGE_SLOT || region.count == 0 {
        BufferRegion::NONE
    } else {
        BufferRegion {
            slot_size: region.slot_size & !7,
            count: region.count,
        }
    }
}

#[derive(Debug)]
struct PageCacheState {
    initialized: bool,
    arena: SlotArena,
}

/// Built-in page cache: owns the page-buffer arena and hands out cells.
#[derive(Debug)]
pub struct DefaultPageCache {
    state: Mutex<PageCacheState>,
}

impl DefaultPageCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PageCacheState {
                initialized: false,
                arena: SlotArena::empty(),
            }),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Geometry of the wired region (`BufferRegion::NONE` if none).
    #[must_use]
    pub fn region(&self) -> BufferRegion {
        let state = self.state.lock();
        BufferRegion {
            slot_size: state.arena.slot_size(),
            count: state.arena.capacity(),
        }
    }

    /// Take one page buffer from the wired region.
    pub fn take_buffer(&self) -> Option<SlotId> {
        self.state.lock().arena.pop()
    }

    pub fn return_buffer(&self, slot: SlotId) {
        self.state.lock().arena.push(slot);
    }

    #[must_use]
    pub fn free_buffers(&self) -> usize {
        self.state.lock().arena.free_count()
    }
}

impl Default for DefaultPageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCacheMethods for DefaultPageCache {
    fn init(&self) -> Result<()> {
        self.state.lock().initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.initialized = false;
        state.arena = SlotArena::empty();
    }

    fn buffer_setup(&self, region: BufferRegion) {
        let mut state = self.state.lock();
        if !state.initialized {
            return;
        }
        state.arena = if region.is_none() {
            SlotArena::empty()
        } else {
            SlotArena::new(region.slot_size, region.count).unwrap_or_else(SlotArena::empty)
        };
        debug!(
            target: "sqlboot.pcache",
            slot_size = state.arena.slot_size(),
            slots = state.arena.capacity(),
            "page-cache buffer wired"
        );
    }
}
