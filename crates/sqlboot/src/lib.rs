//! Bootstrap and memory-allocation core of an embedded SQL engine.
//!
//! The crate brings the engine's process-wide subsystems up and down in a
//! fixed order and provides the allocator every connection uses:
//!
//! - [`mutex`]: pluggable mutex strategy and a reentrant blocking lock.
//! - [`config`]: the global configuration and its pre-init window.
//! - [`runtime`]: idempotent, thread-safe [`Runtime::initialize`] and the
//!   reverse-order [`Runtime::shutdown`].
//! - [`malloc`] / [`mem`]: the engine heap over a pluggable strategy, with
//!   memory status counters and a scratch pool.
//! - [`lookaside`]: the per-connection pool of fixed-size cells.
//! - [`connection`]: the connection-scoped allocator with its failure latch.

pub mod config;
pub mod connection;
pub mod func;
pub mod lookaside;
pub mod malloc;
pub mod mem;
pub mod mutex;
pub mod os;
pub mod pcache;
pub mod runtime;
pub mod slots;

pub use config::{BufferRegion, ConfigOp, ConfigReply, GlobalConfig, ThreadingMode};
pub use connection::{Block, Connection, DbStatusOp, MemType};
pub use lookaside::{Lookaside, LookasideStats};
pub use malloc::{Malloc, MemoryStatus, ScratchBuf, StatusOp};
pub use mem::{MemMethods, SystemMem};
pub use mutex::{MutexHandle, MutexKind, MutexStrategy};
pub use runtime::{AutoExtension, DirectoryKind, InitState, Runtime, RuntimeBuilder};
pub use sqlboot_error::{ErrorCode, Result, SqlbootError};
