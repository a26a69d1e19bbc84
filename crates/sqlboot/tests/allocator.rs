//! Connection allocator tests: lookaside routing, the failure latch, and
//! heap accounting through a pluggable strategy.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sqlboot::mem::{MemMethods, SystemMem};
use sqlboot::runtime::DirectoryKind;
use sqlboot::{
    AutoExtension, ConfigOp, Connection, DbStatusOp, ErrorCode, MemType, Result, Runtime,
    SqlbootError, StatusOp,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Heap strategy that counts calls and can be told to fail.
#[derive(Default)]
struct FlakyMem {
    failing: AtomicBool,
    mallocs: AtomicUsize,
    reallocs: AtomicUsize,
}

impl MemMethods for FlakyMem {
    fn malloc(&self, n: usize) -> Option<Vec<u8>> {
        self.mallocs.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        SystemMem.malloc(n)
    }

    fn realloc(&self, block: Vec<u8>, n: usize) -> std::result::Result<Vec<u8>, Vec<u8>> {
        self.reallocs.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(block);
        }
        SystemMem.realloc(block, n)
    }
}

fn runtime_with(mem: &Arc<FlakyMem>, slot_size: usize, count: usize) -> Runtime {
    let mut runtime = Runtime::new();
    runtime
        .configure(ConfigOp::Malloc(Arc::clone(mem) as Arc<dyn MemMethods>))
        .unwrap();
    runtime
        .configure(ConfigOp::Lookaside { slot_size, count })
        .unwrap();
    runtime
}

// ---------------------------------------------------------------------------
// Lookaside routing
// ---------------------------------------------------------------------------

#[test]
fn test_lookaside_serves_until_full_then_heap() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut conn = Connection::open(&runtime).unwrap();
    let before = mem.mallocs.load(Ordering::SeqCst);

    let cells: Vec<_> = (0..8).map(|_| conn.allocate(64).unwrap()).collect();
    assert!(cells.iter().all(sqlboot::Block::is_lookaside));
    assert_eq!(mem.mallocs.load(Ordering::SeqCst), before, "no heap traffic");
    assert_eq!(conn.db_status(DbStatusOp::LookasideUsed, false), (8, 8));
    assert_eq!(conn.db_status(DbStatusOp::LookasideHit, false).1, 8);

    let overflow = conn.allocate(64).unwrap();
    assert!(overflow.is_heap());
    assert_eq!(mem.mallocs.load(Ordering::SeqCst), before + 1);
    assert_eq!(conn.db_status(DbStatusOp::LookasideMissFull, false).1, 1);

    conn.free(overflow);
    for cell in cells {
        conn.free(cell);
    }
    assert_eq!(conn.db_status(DbStatusOp::LookasideUsed, true), (0, 8));
    assert_eq!(conn.db_status(DbStatusOp::LookasideUsed, false), (0, 0));
}

#[test]
fn test_large_request_is_size_miss() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut conn = Connection::open(&runtime).unwrap();

    let block = conn.allocate(100).unwrap();
    assert!(block.is_heap());
    assert_eq!(block.mem_type(), MemType::DB | MemType::HEAP);
    assert_eq!(conn.db_status(DbStatusOp::LookasideMissSize, false).1, 1);
    assert_eq!(conn.lookaside().outstanding(), 0);
    conn.free(block);
}

#[test]
fn test_default_lookaside_geometry() {
    let runtime = Runtime::new();
    let conn = Connection::open(&runtime).unwrap();
    assert_eq!(conn.lookaside().slot_size(), 128);
    assert_eq!(conn.lookaside().capacity(), 500);
}

#[test]
fn test_reallocate_from_nothing_matches_allocate() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut conn = Connection::open(&runtime).unwrap();

    let block = conn.reallocate(None, 50).unwrap();
    assert!(block.is_lookaside());
    assert_eq!(block.mem_type(), MemType::DB | MemType::LOOKASIDE);
    assert_eq!(conn.lookaside().outstanding(), 1);
    conn.free(block);
}

#[test]
fn test_cell_cannot_be_freed_through_another_connection() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut a = Connection::open(&runtime).unwrap();
    let mut b = Connection::open(&runtime).unwrap();

    let cell = a.allocate(10).unwrap();
    assert!(cell.is_lookaside());
    let rejected = panic::catch_unwind(AssertUnwindSafe(|| b.free(cell)));
    assert!(rejected.is_err(), "foreign cell must be rejected");

    assert_eq!(b.lookaside().outstanding(), 0, "b's free list untouched");
    let fresh: Vec<_> = (0..8).map(|_| b.allocate(10).unwrap()).collect();
    assert!(fresh.iter().all(sqlboot::Block::is_lookaside));
    assert!(b.allocate(10).unwrap().is_heap(), "no duplicated cell in b");
    for block in fresh {
        b.free(block);
    }
    b.configure_lookaside(128, 4).unwrap();
    assert_eq!(a.lookaside().outstanding(), 1);
}

#[test]
fn test_foreign_cell_bytes_are_rejected() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut a = Connection::open(&runtime).unwrap();
    let b = Connection::open(&runtime).unwrap();

    let cell = a.allocate(10).unwrap();
    let read = panic::catch_unwind(AssertUnwindSafe(|| b.bytes(&cell).len()));
    assert!(read.is_err());
    let sized = panic::catch_unwind(AssertUnwindSafe(|| b.block_size(&cell)));
    assert!(sized.is_err());
    a.free(cell);
}

// ---------------------------------------------------------------------------
// Failure latch
// ---------------------------------------------------------------------------

#[test]
fn test_heap_failure_latches_connection() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut conn = Connection::open(&runtime).unwrap();

    mem.failing.store(true, Ordering::SeqCst);
    assert!(conn.allocate(1000).is_none());
    assert!(conn.malloc_failed());
    let calls = mem.mallocs.load(Ordering::SeqCst);

    // Latched: neither the pool nor the heap is consulted, even for a
    // request the pool could serve.
    mem.failing.store(false, Ordering::SeqCst);
    assert!(conn.allocate(10).is_none());
    assert_eq!(mem.mallocs.load(Ordering::SeqCst), calls);
    assert_eq!(conn.db_status(DbStatusOp::LookasideHit, false).1, 0);
    assert!(matches!(conn.reallocate(None, 10), Err(None)));

    conn.clear_malloc_failed();
    let block = conn.allocate(10).unwrap();
    assert!(block.is_lookaside());
    conn.free(block);
}

#[test]
fn test_failed_reallocate_returns_original() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut conn = Connection::open(&runtime).unwrap();

    let mut block = conn.allocate(500).unwrap();
    conn.bytes_mut(&mut block).fill(0xAB);

    mem.failing.store(true, Ordering::SeqCst);
    let Err(Some(original)) = conn.reallocate(Some(block), 5000) else {
        panic!("resize should fail and hand the block back");
    };
    assert!(conn.malloc_failed());
    assert_eq!(original.len(), 500);
    assert!(conn.bytes(&original).iter().all(|b| *b == 0xAB));
    assert_eq!(mem.reallocs.load(Ordering::SeqCst), 1);
    conn.free(original);
}

#[test]
fn test_nomem_reported_to_log_callback() {
    let mem = Arc::new(FlakyMem::default());
    let mut runtime = runtime_with(&mem, 64, 8);
    let logged = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&logged);
    runtime
        .configure(ConfigOp::Log(Some(Arc::new(
            move |code: ErrorCode, _msg: &str| {
                if code == ErrorCode::NoMem {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
            },
        ))))
        .unwrap();
    let mut conn = Connection::open(&runtime).unwrap();

    mem.failing.store(true, Ordering::SeqCst);
    assert!(conn.allocate(4096).is_none());
    assert_eq!(logged.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_and_oversized_heap_requests_fail() {
    let runtime = Runtime::new();
    runtime.initialize().unwrap();
    assert!(runtime.malloc().malloc(0).is_none());
    assert!(
        runtime
            .malloc()
            .malloc(sqlboot::malloc::MAX_ALLOCATION_SIZE)
            .is_none()
    );
}

// ---------------------------------------------------------------------------
// Accounting
// ---------------------------------------------------------------------------

#[test]
fn test_memory_status_tracks_heap_blocks() {
    let mem = Arc::new(FlakyMem::default());
    let runtime = runtime_with(&mem, 64, 8);
    let mut conn = Connection::open(&runtime).unwrap();
    let baseline = runtime.memory_status();

    let block = conn.allocate(1000).unwrap();
    let status = runtime.memory_status();
    assert_eq!(status.memory_used, baseline.memory_used + 1000);
    assert_eq!(status.malloc_count, baseline.malloc_count + 1);
    assert!(runtime.status(StatusOp::MallocSize, false).1 >= 1000);

    conn.free(block);
    assert_eq!(runtime.memory_status().memory_used, baseline.memory_used);
}

// ---------------------------------------------------------------------------
// Connection lifecycle extras
// ---------------------------------------------------------------------------

#[test]
fn test_auto_extension_runs_on_open() {
    let runtime = Runtime::new();
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&opened);
    let ext: AutoExtension = Arc::new(move |conn: &mut Connection<'_>| -> Result<()> {
        conn.set_lookaside_enabled(false);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    runtime.register_auto_extension(Arc::clone(&ext)).unwrap();

    let conn = Connection::open(&runtime).unwrap();
    assert!(!conn.lookaside().is_enabled());
    drop(conn);
    let _second = Connection::open(&runtime).unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 2);

    runtime.reset_auto_extension();
    let _third = Connection::open(&runtime).unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failing_auto_extension_aborts_open() {
    let runtime = Runtime::new();
    let ext: AutoExtension = Arc::new(|_conn: &mut Connection<'_>| -> Result<()> {
        Err(SqlbootError::generic("extension refused"))
    });
    runtime.register_auto_extension(ext).unwrap();
    let err = Connection::open(&runtime).unwrap_err();
    assert_eq!(err, SqlbootError::generic("extension refused"));
}

#[test]
fn test_directories_cleared_by_shutdown() {
    let mut runtime = Runtime::new();
    runtime.initialize().unwrap();
    runtime.set_directory(DirectoryKind::Temp, Some("/var/tmp".into()));
    {
        let conn = Connection::open(&runtime).unwrap();
        assert!(conn.runtime().directory(DirectoryKind::Temp).is_some());
    }
    runtime.shutdown().unwrap();
    assert!(runtime.directory(DirectoryKind::Temp).is_none());
}
