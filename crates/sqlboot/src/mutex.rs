//! Mutex facade consumed by the bootstrap core.
//!
//! The engine never talks to an OS primitive directly. It asks the installed
//! [`MutexStrategy`] for a [`MutexHandle`] of a given [`MutexKind`] and then
//! enters/leaves that handle. Two strategies ship with the crate:
//!
//! - [`ThreadMutexStrategy`]: real blocking locks built on [`ReentrantLock`].
//!   Static kinds (the master lock) are created once with the strategy and
//!   handed out by reference, so they are usable before anything else is
//!   initialized.
//! - [`NoopMutexStrategy`]: every operation is a no-op; selected for
//!   single-thread mode.
//!
//! # Re-entrance
//!
//! A recursive handle may be entered again by the thread that already holds
//! it; the depth counter tracks nesting and the lock is released when the
//! outermost `leave` runs. Any other thread blocks until then. Only the
//! owning thread can re-enter without blocking.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use sqlboot_error::Result;

/// Flavor of mutex requested from a [`MutexStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexKind {
    /// Dynamically created, non-recursive.
    Fast,
    /// Dynamically created, re-entrant by the owning thread.
    Recursive,
    /// The always-available process-wide master lock (non-recursive).
    StaticMaster,
    /// Static lock guarding the VFS list.
    StaticVfs,
}

impl MutexKind {
    /// Static kinds are shared singletons owned by the strategy.
    #[must_use]
    pub const fn is_static(self) -> bool {
        matches!(self, Self::StaticMaster | Self::StaticVfs)
    }
}

/// Acquire/release contract of a concrete lock.
pub trait RawMutex: Send + Sync {
    /// Block until the calling thread holds the lock.
    fn enter(&self);
    /// Take the lock if it is immediately available.
    fn try_enter(&self) -> bool;
    /// Release one level of ownership.
    fn leave(&self);
    /// Whether the calling thread holds the lock. Strategies that cannot
    /// tell return `true` so the answer is only ever used in assertions.
    fn held(&self) -> bool;
}

/// Opaque, cheaply cloneable handle to a lock produced by a strategy.
#[derive(Clone)]
pub struct MutexHandle {
    kind: MutexKind,
    raw: Arc<dyn RawMutex>,
}

impl MutexHandle {
    /// Wrap a raw lock produced by a custom strategy.
    pub fn new(kind: MutexKind, raw: Arc<dyn RawMutex>) -> Self {
        Self { kind, raw }
    }

    #[must_use]
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    pub fn enter(&self) {
        self.raw.enter();
    }

    #[must_use]
    pub fn try_enter(&self) -> bool {
        self.raw.try_enter()
    }

    pub fn leave(&self) {
        self.raw.leave();
    }

    #[must_use]
    pub fn held(&self) -> bool {
        self.raw.held()
    }

    /// Enter the lock and return a guard that leaves it when dropped,
    /// including when the holder unwinds.
    pub fn lock(&self) -> HandleGuard<'_> {
        self.enter();
        HandleGuard { handle: self }
    }

    /// Run `f` with the lock held.
    pub fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }

    /// Whether two handles refer to the same underlying lock.
    #[must_use]
    pub fn same_lock(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw)
    }
}

impl fmt::Debug for MutexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// RAII guard returned by [`MutexHandle::lock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HandleGuard<'a> {
    handle: &'a MutexHandle,
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.handle.leave();
    }
}

/// Run `f` inside `handle` when one exists. A missing handle means mutexing
/// is disabled for that lock and `f` simply runs.
pub fn with_optional<R>(handle: Option<&MutexHandle>, f: impl FnOnce() -> R) -> R {
    match handle {
        Some(h) => h.critical_section(f),
        None => f(),
    }
}

/// Pluggable mutex implementation.
///
/// `init` must serialize itself; the bootstrap core calls it without holding
/// any lock. `alloc` returns `None` when a lock cannot be created.
pub trait MutexStrategy: Send + Sync {
    fn init(&self) -> Result<()>;
    fn end(&self);
    fn alloc(&self, kind: MutexKind) -> Option<MutexHandle>;
    /// Destroy a dynamic lock. Static handles are never freed.
    fn free(&self, handle: MutexHandle) {
        debug_assert!(
            !handle.kind().is_static(),
            "static mutexes must not be freed"
        );
        drop(handle);
    }
}

// ---------------------------------------------------------------------------
// ReentrantLock
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Blocking lock with an explicit owner thread and nesting depth.
///
/// With `recursive == false` a second `enter` from the owner is a
/// programming error (debug assertion) and would otherwise deadlock, as a
/// plain OS mutex does.
#[derive(Debug)]
pub struct ReentrantLock {
    state: Mutex<LockState>,
    released: Condvar,
    recursive: bool,
}

impl ReentrantLock {
    #[must_use]
    pub fn new(recursive: bool) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            recursive,
        }
    }

    /// Current nesting depth (0 when unowned).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }
}

impl RawMutex for ReentrantLock {
    fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    debug_assert!(self.recursive, "non-recursive mutex re-entered by its owner");
                    if self.recursive {
                        state.depth += 1;
                        return;
                    }
                    self.released.wait(&mut state);
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    fn try_enter(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me && self.recursive => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.owner,
            Some(thread::current().id()),
            "mutex released by a thread that does not hold it"
        );
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }

    fn held(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Default strategy: blocking locks shared across OS threads.
pub struct ThreadMutexStrategy {
    master: MutexHandle,
    vfs: MutexHandle,
}

impl ThreadMutexStrategy {
    #[must_use]
    pub fn new() -> Self {
        let fixed = |kind| MutexHandle::new(kind, Arc::new(ReentrantLock::new(false)));
        Self {
            master: fixed(MutexKind::StaticMaster),
            vfs: fixed(MutexKind::StaticVfs),
        }
    }
}

impl Default for ThreadMutexStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexStrategy for ThreadMutexStrategy {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn end(&self) {}

    fn alloc(&self, kind: MutexKind) -> Option<MutexHandle> {
        let handle = match kind {
            MutexKind::StaticMaster => self.master.clone(),
            MutexKind::StaticVfs => self.vfs.clone(),
            MutexKind::Fast => MutexHandle::new(kind, Arc::new(ReentrantLock::new(false))),
            MutexKind::Recursive => MutexHandle::new(kind, Arc::new(ReentrantLock::new(true))),
        };
        Some(handle)
    }
}

struct NoopMutex;

impl RawMutex for NoopMutex {
    fn enter(&self) {}

    fn try_enter(&self) -> bool {
        true
    }

    fn leave(&self) {}

    fn held(&self) -> bool {
        true
    }
}

/// Strategy whose locks do nothing. Used when the engine runs single-threaded.
#[derive(Debug, Default)]
pub struct NoopMutexStrategy;

impl MutexStrategy for NoopMutexStrategy {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn end(&self) {}

    fn alloc(&self, kind: MutexKind) -> Option<MutexHandle> {
        Some(MutexHandle::new(kind, Arc::new(NoopMutex)))
    }
}
