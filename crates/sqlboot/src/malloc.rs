//! Memory allocation subsystem.
//!
//! Wraps the installed [`MemMethods`] strategy with the engine-wide pieces
//! that sit on top of it: the request size ceiling, optional memory
//! statistics, and the scratch-buffer pool. `init`/`end` are driven by the
//! bootstrap protocol; until `init` runs every request fails.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlboot_error::Result;
use tracing::{debug, warn};

use crate::config::BufferRegion;
use crate::mem::MemMethods;

/// Requests of this many bytes or more are refused outright.
pub const MAX_ALLOCATION_SIZE: usize = 0x7fff_ff00;

/// Scratch slots smaller than this disable the scratch pool.
pub const MIN_SCRATCH_SLOT: usize = 100;

/// Process-wide counters reported by [`Malloc::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusOp {
    /// Bytes currently allocated from the heap.
    MemoryUsed,
    /// Largest single heap request.
    MallocSize,
    /// Heap blocks currently outstanding.
    MallocCount,
    /// Scratch slots currently handed out.
    ScratchUsed,
    /// Bytes of scratch requests that had to come from the heap.
    ScratchOverflow,
    /// Largest single scratch request.
    ScratchSize,
}

impl StatusOp {
    const COUNT: usize = 6;

    const fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct StatusTable {
    current: [usize; StatusOp::COUNT],
    high_water: [usize; StatusOp::COUNT],
}

impl StatusTable {
    fn add(&mut self, op: StatusOp, n: usize) {
        let i = op.slot();
        self.current[i] += n;
        self.high_water[i] = self.high_water[i].max(self.current[i]);
    }

    fn sub(&mut self, op: StatusOp, n: usize) {
        let i = op.slot();
        self.current[i] = self.current[i].saturating_sub(n);
    }

    fn record(&mut self, op: StatusOp, n: usize) {
        let i = op.slot();
        self.current[i] = n;
        self.high_water[i] = self.high_water[i].max(n);
    }
}

/// Point-in-time copy of the memory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub memory_used: usize,
    pub memory_high_water: usize,
    pub malloc_count: usize,
    pub largest_request: usize,
}

/// A scratch buffer: either a pooled slot or a heap overflow block.
#[derive(Debug)]
pub struct ScratchBuf {
    buf: Vec<u8>,
    pooled: bool,
    generation: u64,
}

impl ScratchBuf {
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[derive(Debug, Default)]
struct ScratchPool {
    slot_size: usize,
    free: Vec<Vec<u8>>,
    /// Bumped on every init and end so stale slots are not re-pooled.
    generation: u64,
}

impl ScratchPool {
    fn reset(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self {
            generation,
            ..Self::default()
        };
    }
}

pub struct Malloc {
    methods: RwLock<Option<Arc<dyn MemMethods>>>,
    memstat: RwLock<bool>,
    status: Mutex<StatusTable>,
    scratch: Mutex<ScratchPool>,
}

impl Malloc {
    pub(crate) fn new() -> Self {
        Self {
            methods: RwLock::new(None),
            memstat: RwLock::new(false),
            status: Mutex::new(StatusTable::default()),
            scratch: Mutex::new(ScratchPool::default()),
        }
    }

    /// Bring the subsystem up over `methods`.
    pub(crate) fn init(
        &self,
        methods: Arc<dyn MemMethods>,
        memstat: bool,
        scratch: BufferRegion,
    ) -> Result<()> {
        methods.init()?;
        *self.methods.write() = Some(methods);
        *self.memstat.write() = memstat;
        *self.status.lock() = StatusTable::default();

        let mut pool = self.scratch.lock();
        pool.reset();
        let slot_size = scratch.slot_size & !7;
        if scratch.slot_size >= MIN_SCRATCH_SLOT && scratch.count > 0 {
            for _ in 0..scratch.count {
                let mut buf = Vec::new();
                if buf.try_reserve_exact(slot_size).is_err() {
                    break;
                }
                buf.resize(slot_size, 0);
                pool.free.push(buf);
            }
            pool.slot_size = slot_size;
        }
        debug!(
            target: "sqlboot.malloc",
            memstat,
            scratch_slots = pool.free.len(),
            scratch_slot_size = pool.slot_size,
            "malloc subsystem initialized"
        );
        Ok(())
    }

    /// Tear the subsystem down and drop the strategy.
    pub(crate) fn end(&self) {
        if let Some(methods) = self.methods.write().take() {
            methods.shutdown();
        }
        self.scratch.lock().reset();
        *self.status.lock() = StatusTable::default();
        debug!(target: "sqlboot.malloc", "malloc subsystem shut down");
    }

    fn methods(&self) -> Option<Arc<dyn MemMethods>> {
        self.methods.read().clone()
    }

    fn memstat(&self) -> bool {
        *self.memstat.read()
    }

    /// Allocate `n` bytes from the heap.
    ///
    /// Zero-byte and oversized requests fail without consulting the strategy.
    pub fn malloc(&self, n: usize) -> Option<Vec<u8>> {
        if n == 0 || n >= MAX_ALLOCATION_SIZE {
            return None;
        }
        let methods = self.methods()?;
        let block = methods.malloc(n);
        match &block {
            Some(b) if self.memstat() => {
                let mut status = self.status.lock();
                status.record(StatusOp::MallocSize, n);
                status.add(StatusOp::MemoryUsed, methods.size(b));
                status.add(StatusOp::MallocCount, 1);
            }
            Some(_) => {}
            None => warn!(target: "sqlboot.malloc", bytes = n, "failed to allocate memory"),
        }
        block
    }

    /// Resize a heap block. On failure the block comes back untouched.
    pub fn realloc(&self, block: Vec<u8>, n: usize) -> std::result::Result<Vec<u8>, Vec<u8>> {
        if n == 0 || n >= MAX_ALLOCATION_SIZE {
            return Err(block);
        }
        let Some(methods) = self.methods() else {
            return Err(block);
        };
        let old_size = methods.size(&block);
        match methods.realloc(block, n) {
            Ok(resized) => {
                if self.memstat() {
                    let mut status = self.status.lock();
                    status.record(StatusOp::MallocSize, n);
                    status.sub(StatusOp::MemoryUsed, old_size);
                    status.add(StatusOp::MemoryUsed, methods.size(&resized));
                }
                Ok(resized)
            }
            Err(original) => {
                warn!(
                    target: "sqlboot.malloc",
                    from = old_size,
                    to = n,
                    "failed to resize memory block"
                );
                Err(original)
            }
        }
    }

    pub fn free(&self, block: Vec<u8>) {
        let Some(methods) = self.methods() else {
            return;
        };
        if self.memstat() {
            let mut status = self.status.lock();
            status.sub(StatusOp::MemoryUsed, methods.size(&block));
            status.sub(StatusOp::MallocCount, 1);
        }
        methods.free(block);
    }

    /// Usable size of a heap block.
    #[must_use]
    pub fn size(&self, block: &[u8]) -> usize {
        self.methods().map_or(block.len(), |m| m.size(block))
    }

    /// Take a scratch buffer of at least `n` bytes.
    ///
    /// Served from the scratch pool when it fits and a slot is free,
    /// otherwise from the heap.
    pub fn scratch_malloc(&self, n: usize) -> Option<ScratchBuf> {
        let (pooled, generation) = {
            let mut pool = self.scratch.lock();
            let buf = if n <= pool.slot_size { pool.free.pop() } else { None };
            (buf, pool.generation)
        };
        let memstat = self.memstat();
        if let Some(buf) = pooled {
            if memstat {
                let mut status = self.status.lock();
                status.record(StatusOp::ScratchSize, n);
                status.add(StatusOp::ScratchUsed, 1);
            }
            return Some(ScratchBuf {
                buf,
                pooled: true,
                generation,
            });
        }
        let buf = self.malloc(n)?;
        if memstat {
            let size = self.size(&buf);
            let mut status = self.status.lock();
            status.record(StatusOp::ScratchSize, n);
            status.add(StatusOp::ScratchOverflow, size);
        }
        Some(ScratchBuf {
            buf,
            pooled: false,
            generation,
        })
    }

    /// Return a scratch buffer taken by [`Malloc::scratch_malloc`].
    ///
    /// A pooled slot handed out before the last re-initialization is dropped
    /// instead of joining the current pool.
    pub fn scratch_free(&self, scratch: ScratchBuf) {
        let memstat = self.memstat();
        if scratch.pooled {
            let mut pool = self.scratch.lock();
            if scratch.generation != pool.generation {
                return;
            }
            pool.free.push(scratch.buf);
            drop(pool);
            if memstat {
                self.status.lock().sub(StatusOp::ScratchUsed, 1);
            }
        } else {
            if memstat {
                let size = self.size(&scratch.buf);
                self.status.lock().sub(StatusOp::ScratchOverflow, size);
            }
            self.free(scratch.buf);
        }
    }

    /// `(current, high_water)` for `op`; `reset` sets the high-water mark
    /// back to the current value.
    pub fn status(&self, op: StatusOp, reset: bool) -> (usize, usize) {
        let mut status = self.status.lock();
        let i = op.slot();
        let out = (status.current[i], status.high_water[i]);
        if reset {
            status.high_water[i] = status.current[i];
        }
        out
    }

    #[must_use]
    pub fn memory_status(&self) -> MemoryStatus {
        let status = self.status.lock();
        MemoryStatus {
            memory_used: status.current[StatusOp::MemoryUsed.slot()],
            memory_high_water: status.high_water[StatusOp::MemoryUsed.slot()],
            malloc_count: status.current[StatusOp::MallocCount.slot()],
            largest_request: status.high_water[StatusOp::MallocSize.slot()],
        }
    }
}

impl std::fmt::Debug for Malloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Malloc")
            .field("installed", &self.methods.read().is_some())
            .field("memstat", &self.memstat())
            .finish_non_exhaustive()
    }
}
