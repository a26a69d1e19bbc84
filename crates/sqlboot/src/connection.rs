//! Connection-scoped allocator.
//!
//! Every allocation a connection makes goes through [`Connection::allocate`]
//! or [`Connection::reallocate`]. Small requests are served from the
//! connection's lookaside pool; everything else goes to the engine heap.
//! The first heap failure latches the connection into a failed state, after
//! which every request fails immediately until the latch is cleared.
//!
//! Allocation methods take `&mut self`: holding the connection mutably is
//! the precondition that the connection's lock is held.

use bitflags::bitflags;
use sqlboot_error::{ErrorCode, Result, SqlbootError};
use tracing::debug;

use crate::lookaside::{Lookaside, LookasideCounter};
use crate::mutex::{MutexHandle, MutexKind};
use crate::runtime::Runtime;
use crate::slots::SlotId;

bitflags! {
    /// Diagnostic tag describing where a block came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemType: u8 {
        const HEAP      = 0x01;
        const LOOKASIDE = 0x02;
        const SCRATCH   = 0x04;
        const PCACHE    = 0x08;
        const DB        = 0x10;
    }
}

#[derive(Debug)]
enum Storage {
    Lookaside(SlotId),
    Heap(Vec<u8>),
}

/// A block owned by a connection.
///
/// Hand it back with [`Connection::free`]. A dropped block releases heap
/// memory but leaks its lookaside cell until the pool is rebuilt.
#[derive(Debug)]
pub struct Block {
    storage: Storage,
    len: usize,
    tag: MemType,
}

impl Block {
    #[inline]
    #[must_use]
    pub fn is_lookaside(&self) -> bool {
        matches!(self.storage, Storage::Lookaside(_))
    }

    #[inline]
    #[must_use]
    pub fn is_heap(&self) -> bool {
        matches!(self.storage, Storage::Heap(_))
    }

    #[inline]
    #[must_use]
    pub fn mem_type(&self) -> MemType {
        self.tag
    }

    /// Requested length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Lookaside counters readable through [`Connection::db_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbStatusOp {
    LookasideUsed,
    LookasideHit,
    LookasideMissSize,
    LookasideMissFull,
}

pub struct Connection<'rt> {
    runtime: &'rt Runtime,
    mutex: Option<MutexHandle>,
    malloc_failed: bool,
    lookaside: Lookaside,
}

impl<'rt> Connection<'rt> {
    /// Open a connection on `runtime`, initializing the engine if needed.
    ///
    /// Registered auto extensions run against the new connection before it
    /// is returned; the first failure aborts the open.
    pub fn open(runtime: &'rt Runtime) -> Result<Self> {
        runtime.initialize()?;

        let mutex = if runtime.config().full_mutex() {
            Some(
                runtime
                    .mutex_alloc(MutexKind::Recursive)
                    .ok_or(SqlbootError::OutOfMemory)?,
            )
        } else {
            None
        };
        let region = runtime.config().lookaside();
        let mut conn = Self {
            runtime,
            mutex,
            malloc_failed: false,
            lookaside: Lookaside::new(region.slot_size, region.count),
        };
        for extension in runtime.auto_extensions() {
            extension(&mut conn)?;
        }
        debug!(
            target: "sqlboot.conn",
            serialized = conn.mutex.is_some(),
            lookaside_slots = conn.lookaside.capacity(),
            "connection opened"
        );
        Ok(conn)
    }

    #[must_use]
    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    /// The connection's own lock; `None` unless the engine is serialized.
    #[must_use]
    pub fn mutex(&self) -> Option<&MutexHandle> {
        self.mutex.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn malloc_failed(&self) -> bool {
        self.malloc_failed
    }

    /// Reset the failure latch so allocation can be attempted again.
    pub fn clear_malloc_failed(&mut self) {
        self.malloc_failed = false;
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `n` bytes.
    ///
    /// The caller must hold the connection's lock. `&mut self` is that proof:
    /// a connection is not `Sync`-shared for allocation, so no other thread
    /// can be inside this connection while the borrow is live. The debug
    /// assertion additionally rejects callers that hold the handle on some
    /// other thread.
    ///
    /// Returns `None` immediately, without touching the pool or the heap,
    /// while the failure latch is set. A heap failure sets the latch.
    pub fn allocate(&mut self, n: usize) -> Option<Block> {
        self.debug_assert_lock_available();
        if self.malloc_failed {
            return None;
        }
        if let Some(slot) = self.lookaside.acquire(n) {
            return Some(Block {
                storage: Storage::Lookaside(slot),
                len: n,
                tag: MemType::DB | MemType::LOOKASIDE,
            });
        }
        match self.runtime.malloc().malloc(n) {
            Some(buf) => Some(Block {
                storage: Storage::Heap(buf),
                len: n,
                tag: MemType::DB | MemType::HEAP,
            }),
            None => {
                self.fail(n);
                None
            }
        }
    }

    /// Like [`allocate`](Self::allocate) but the returned bytes are zeroed.
    pub fn allocate_zeroed(&mut self, n: usize) -> Option<Block> {
        let mut block = self.allocate(n)?;
        self.bytes_mut(&mut block).fill(0);
        Some(block)
    }

    /// Resize `block` to `n` bytes.
    ///
    /// `None` behaves exactly like [`allocate`](Self::allocate). On failure
    /// the original block comes back unchanged in `Err`, and a heap failure
    /// sets the latch. The result is always heap memory.
    pub fn reallocate(
        &mut self,
        block: Option<Block>,
        n: usize,
    ) -> std::result::Result<Block, Option<Block>> {
        self.debug_assert_lock_available();
        if self.malloc_failed {
            return Err(block);
        }
        let Some(block) = block else {
            return self.allocate(n).ok_or(None);
        };
        debug_assert!(!block.is_lookaside(), "pool cells cannot be resized in place");
        let buf = match block.storage {
            Storage::Heap(buf) => buf,
            Storage::Lookaside(slot) => {
                self.assert_owned(&slot);
                match self.migrate_to_heap(slot, block.len) {
                    Ok(buf) => buf,
                    Err(slot) => {
                        self.fail(n);
                        return Err(Some(Block {
                            storage: Storage::Lookaside(slot),
                            ..block
                        }));
                    }
                }
            }
        };
        let old_len = block.len.min(buf.len());
        match self.runtime.malloc().realloc(buf, n) {
            Ok(buf) => {
                let tag = if self.lookaside.is_enabled() {
                    MemType::DB | MemType::LOOKASIDE
                } else {
                    MemType::DB | MemType::HEAP
                };
                Ok(Block {
                    storage: Storage::Heap(buf),
                    len: n,
                    tag,
                })
            }
            Err(buf) => {
                self.fail(n);
                Err(Some(Block {
                    storage: Storage::Heap(buf),
                    len: old_len,
                    tag: MemType::DB | MemType::HEAP,
                }))
            }
        }
    }

    fn migrate_to_heap(&mut self, slot: SlotId, len: usize) -> std::result::Result<Vec<u8>, SlotId> {
        let Some(mut buf) = self.runtime.malloc().malloc(len.max(1)) else {
            return Err(slot);
        };
        buf[..len].copy_from_slice(&self.lookaside.bytes(&slot)[..len]);
        self.lookaside.release(slot);
        Ok(buf)
    }

    /// The connection lock is either held by this thread or free. A clone of
    /// the handle held by another thread means two threads are inside the
    /// connection.
    fn debug_assert_lock_available(&self) {
        if cfg!(debug_assertions) {
            if let Some(mutex) = &self.mutex {
                let usable = mutex.held() || {
                    let free = mutex.try_enter();
                    if free {
                        mutex.leave();
                    }
                    free
                };
                debug_assert!(usable, "connection lock held by another thread during allocation");
            }
        }
    }

    /// Lookaside cells never move between connections; a foreign cell here
    /// would corrupt this connection's free list.
    fn assert_owned(&self, slot: &SlotId) {
        assert!(
            self.lookaside.owns(slot),
            "lookaside block used through a connection that does not own it"
        );
    }

    fn fail(&mut self, n: usize) {
        self.malloc_failed = true;
        self.runtime
            .log(ErrorCode::NoMem, &format!("failed to allocate {n} bytes"));
    }

    /// Give a block back to whichever pool it came from.
    ///
    /// # Panics
    ///
    /// Panics if `block` is a lookaside cell of another connection.
    pub fn free(&mut self, block: Block) {
        match block.storage {
            Storage::Lookaside(slot) => {
                self.assert_owned(&slot);
                self.lookaside.release(slot);
            }
            Storage::Heap(buf) => self.runtime.malloc().free(buf),
        }
    }

    /// Usable size of `block`: the cell size for pool memory, otherwise what
    /// the heap strategy reports.
    #[must_use]
    pub fn block_size(&self, block: &Block) -> usize {
        match &block.storage {
            Storage::Lookaside(slot) => {
                self.assert_owned(slot);
                self.lookaside.slot_size()
            }
            Storage::Heap(buf) => self.runtime.malloc().size(buf),
        }
    }

    #[must_use]
    pub fn bytes<'b>(&'b self, block: &'b Block) -> &'b [u8] {
        match &block.storage {
            Storage::Lookaside(slot) => {
                self.assert_owned(slot);
                &self.lookaside.bytes(slot)[..block.len]
            }
            Storage::Heap(buf) => &buf[..block.len],
        }
    }

    pub fn bytes_mut<'b>(&'b mut self, block: &'b mut Block) -> &'b mut [u8] {
        let len = block.len;
        match &mut block.storage {
            Storage::Lookaside(slot) => {
                self.assert_owned(slot);
                &mut self.lookaside.bytes_mut(slot)[..len]
            }
            Storage::Heap(buf) => &mut buf[..len],
        }
    }

    // -----------------------------------------------------------------------
    // Lookaside control
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn lookaside(&self) -> &Lookaside {
        &self.lookaside
    }

    /// Rebuild the lookaside pool. Fails with BUSY while cells are out.
    pub fn configure_lookaside(&mut self, slot_size: usize, count: usize) -> Result<()> {
        self.lookaside.reconfigure(slot_size, count)
    }

    /// Enable or disable the pool, returning the previous setting.
    pub fn set_lookaside_enabled(&mut self, on: bool) -> bool {
        self.lookaside.set_enabled(on)
    }

    /// `(current, high_water)` for one lookaside counter. The hit and miss
    /// counters report their value in the second position.
    pub fn db_status(&mut self, op: DbStatusOp, reset: bool) -> (u64, u64) {
        match op {
            DbStatusOp::LookasideUsed => {
                let stats = self.lookaside.stats();
                if reset {
                    self.lookaside.reset_high_water();
                }
                (stats.outstanding as u64, stats.high_water as u64)
            }
            DbStatusOp::LookasideHit => (0, self.lookaside.read_counter(LookasideCounter::Hit, reset)),
            DbStatusOp::LookasideMissSize => (
                0,
                self.lookaside
                    .read_counter(LookasideCounter::MissSize, reset),
            ),
            DbStatusOp::LookasideMissFull => (
                0,
                self.lookaside
                    .read_counter(LookasideCounter::MissFull, reset),
            ),
        }
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.mutex.take() {
            self.runtime.mutex_free(handle);
        }
    }
}

impl std::fmt::Debug for Connection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("mutex", &self.mutex)
            .field("malloc_failed", &self.malloc_failed)
            .field("lookaside", &self.lookaside)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOp;

    fn small_pool_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime
            .configure(ConfigOp::Lookaside {
                slot_size: 64,
                count: 8,
            })
            .unwrap();
        runtime
    }

    #[test]
    fn test_small_requests_use_pool_until_exhausted() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let mut held = Vec::new();
        for _ in 0..8 {
            let block = conn.allocate(40).unwrap();
            assert!(block.is_lookaside());
            assert_eq!(block.mem_type(), MemType::DB | MemType::LOOKASIDE);
            held.push(block);
        }
        assert_eq!(conn.db_status(DbStatusOp::LookasideUsed, false), (8, 8));
        let ninth = conn.allocate(40).unwrap();
        assert!(ninth.is_heap());
        assert_eq!(ninth.mem_type(), MemType::DB | MemType::HEAP);
        assert_eq!(conn.db_status(DbStatusOp::LookasideMissFull, false).1, 1);
        conn.free(ninth);
        for block in held {
            conn.free(block);
        }
        assert_eq!(conn.lookaside().outstanding(), 0);
    }

    #[test]
    fn test_oversized_request_goes_to_heap() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let block = conn.allocate(100).unwrap();
        assert!(block.is_heap());
        assert_eq!(conn.db_status(DbStatusOp::LookasideMissSize, true).1, 1);
        assert_eq!(conn.db_status(DbStatusOp::LookasideMissSize, false).1, 0);
        assert_eq!(conn.lookaside().outstanding(), 0);
        conn.free(block);
    }

    #[test]
    fn test_reallocate_none_is_allocate() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let block = conn.reallocate(None, 50).unwrap();
        assert!(block.is_lookaside());
        assert_eq!(block.len(), 50);
        conn.free(block);
    }

    #[test]
    fn test_reallocate_preserves_prefix() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let mut block = conn.allocate(200).unwrap();
        conn.bytes_mut(&mut block).copy_from_slice(&[7_u8; 200]);
        let grown = conn.reallocate(Some(block), 400).unwrap();
        assert!(grown.is_heap());
        assert_eq!(grown.len(), 400);
        assert!(conn.bytes(&grown)[..200].iter().all(|b| *b == 7));
        assert_eq!(grown.mem_type(), MemType::DB | MemType::LOOKASIDE);
        conn.free(grown);
    }

    #[test]
    fn test_reallocate_tags_heap_when_pool_disabled() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        conn.set_lookaside_enabled(false);
        let block = conn.allocate(16).unwrap();
        assert!(block.is_heap());
        let grown = conn.reallocate(Some(block), 32).unwrap();
        assert_eq!(grown.mem_type(), MemType::DB | MemType::HEAP);
        conn.free(grown);
    }

    #[test]
    fn test_zeroed_allocation() {
        let runtime = Runtime::new();
        let mut conn = Connection::open(&runtime).unwrap();
        let block = conn.allocate_zeroed(300).unwrap();
        assert!(conn.bytes(&block).iter().all(|b| *b == 0));
        assert!(conn.block_size(&block) >= 300);
        conn.free(block);
    }

    #[test]
    fn test_block_size_of_pool_cell() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let block = conn.allocate(3).unwrap();
        assert_eq!(conn.block_size(&block), 64);
        assert_eq!(conn.bytes(&block).len(), 3);
        conn.free(block);
    }

    #[test]
    fn test_configure_lookaside_busy_while_outstanding() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let block = conn.allocate(8).unwrap();
        let err = conn.configure_lookaside(128, 4).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Busy);
        conn.free(block);
        conn.configure_lookaside(128, 4).unwrap();
        assert_eq!(conn.lookaside().slot_size(), 128);
    }

    #[test]
    fn test_migrate_to_heap_copies_and_frees_cell() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let mut block = conn.allocate(16).unwrap();
        conn.bytes_mut(&mut block).copy_from_slice(&[3_u8; 16]);
        let Storage::Lookaside(slot) = block.storage else {
            panic!("small request should come from the pool");
        };

        let buf = conn.migrate_to_heap(slot, 16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|b| *b == 3));
        assert_eq!(conn.lookaside().outstanding(), 0, "cell returned to the pool");
        runtime.malloc().free(buf);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "pool cells cannot be resized in place")]
    fn test_reallocate_pool_cell_is_a_bug() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let block = conn.allocate(16).unwrap();
        let _ = conn.reallocate(Some(block), 32);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_reallocate_pool_cell_moves_to_heap() {
        let runtime = small_pool_runtime();
        let mut conn = Connection::open(&runtime).unwrap();
        let mut block = conn.allocate(16).unwrap();
        conn.bytes_mut(&mut block).copy_from_slice(&[9_u8; 16]);
        let grown = conn.reallocate(Some(block), 200).unwrap();
        assert!(grown.is_heap());
        assert_eq!(grown.len(), 200);
        assert!(conn.bytes(&grown)[..16].iter().all(|b| *b == 9));
        assert_eq!(conn.lookaside().outstanding(), 0);
        conn.free(grown);
    }

    #[test]
    fn test_allocate_inside_connection_lock() {
        let runtime = Runtime::new();
        let mut conn = Connection::open(&runtime).unwrap();
        let mutex = conn.mutex().cloned().unwrap();
        let block = mutex.critical_section(|| {
            assert!(mutex.held());
            conn.allocate(24)
        });
        let block = block.unwrap();
        conn.free(block);
        assert!(!mutex.held());
    }

    #[test]
    fn test_serialized_connection_has_mutex() {
        let runtime = Runtime::new();
        let conn = Connection::open(&runtime).unwrap();
        assert_eq!(conn.mutex().map(MutexHandle::kind), Some(MutexKind::Recursive));

        let mut multi = Runtime::new();
        multi.configure(ConfigOp::MultiThread).unwrap();
        let conn = Connection::open(&multi).unwrap();
        assert!(conn.mutex().is_none());
    }
}
