//! Engine runtime: bootstrap, shutdown and the configuration window.
//!
//! A [`Runtime`] owns the process-scoped [`GlobalConfig`] together with the
//! subsystem state that bootstrap brings up. It is passed around by
//! reference; nothing here is a hidden global.
//!
//! # Bootstrap
//!
//! [`Runtime::initialize`] is idempotent and safe to call from any number of
//! threads. The first thread to get past the master lock runs the bootstrap
//! body under a lazily created recursive *init lock*. While it does so:
//!
//! - calls from other threads block on the init lock until the outermost
//!   call of the bootstrapping thread returns, then observe `ready`;
//! - calls from the bootstrapping thread itself (typically from the OS-layer
//!   hook registering a VFS) re-enter the init lock without blocking and see
//!   the bootstrap already in progress.
//!
//! Allocator bring-up and init-lock creation happen in one master-lock
//! critical section, the rest of bootstrap in a second one under the init
//! lock, so nothing that allocates runs before the allocator is ready. The
//! init lock is reference counted and destroyed as soon as no caller is
//! between the two sections.
//!
//! # Shutdown
//!
//! [`Runtime::shutdown`] takes `&mut self`: it must not overlap any other
//! use of the runtime, and connections borrow the runtime, so the borrow
//! checker enforces that none are open.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use sqlboot_error::{ErrorCode, Result, SqlbootError};
use tracing::{debug, info, warn};

use crate::config::{ConfigOp, ConfigReply, GlobalConfig};
use crate::connection::Connection;
use crate::func::{BuiltinFunctions, GlobalFunctions};
use crate::malloc::{Malloc, MemoryStatus, ScratchBuf, StatusOp};
use crate::mem::SystemMem;
use crate::mutex::{self, MutexHandle, MutexKind, MutexStrategy, NoopMutexStrategy, ThreadMutexStrategy};
use crate::os::{DefaultOs, OsLayer, VfsRegistry};
use crate::pcache::{self, DefaultPageCache, PageCacheMethods};

/// Extension entry point run against every newly opened connection.
pub type AutoExtension = Arc<dyn Fn(&mut Connection<'_>) -> Result<()> + Send + Sync>;

/// Directory settings that may point into engine-owned memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryKind {
    Data,
    Temp,
}

#[derive(Debug, Default)]
struct InitLockSlot {
    handle: Option<MutexHandle>,
    refs: u32,
}

/// Reference on the init lock taken by one `initialize` call. Dropping it,
/// on return or on unwind, runs the third critical section.
struct InitLockRef<'a> {
    runtime: &'a Runtime,
    master: Option<&'a MutexHandle>,
}

impl Drop for InitLockRef<'_> {
    fn drop(&mut self) {
        mutex::with_optional(self.master, || self.runtime.leave_init_refs());
    }
}

/// Clears a state flag when dropped.
struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Snapshot of the bootstrap state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct InitState {
    pub mutex_ready: bool,
    pub malloc_ready: bool,
    pub pcache_ready: bool,
    pub ready: bool,
    pub in_progress: bool,
    pub init_lock_refs: u32,
    pub init_lock_present: bool,
}

pub struct Runtime {
    config: GlobalConfig,
    os: Arc<dyn OsLayer>,
    functions: Arc<dyn GlobalFunctions>,
    mutex_methods: RwLock<Option<Arc<dyn MutexStrategy>>>,
    malloc: Malloc,
    pcache: RwLock<Option<Arc<dyn PageCacheMethods>>>,
    mutex_ready: AtomicBool,
    malloc_ready: AtomicBool,
    pcache_ready: AtomicBool,
    ready: AtomicBool,
    in_progress: AtomicBool,
    /// Guarded by the master lock; the inner mutex only makes it `Sync`.
    init_lock: Mutex<InitLockSlot>,
    vfs: VfsRegistry,
    auto_extensions: Mutex<Vec<AutoExtension>>,
    data_directory: Mutex<Option<PathBuf>>,
    temp_directory: Mutex<Option<PathBuf>>,
}

/// Builder for a [`Runtime`] with non-default collaborators.
pub struct RuntimeBuilder {
    config: GlobalConfig,
    os: Arc<dyn OsLayer>,
    functions: Arc<dyn GlobalFunctions>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn os(mut self, os: Arc<dyn OsLayer>) -> Self {
        self.os = os;
        self
    }

    #[must_use]
    pub fn functions(mut self, functions: Arc<dyn GlobalFunctions>) -> Self {
        self.functions = functions;
        self
    }

    #[must_use]
    pub fn config(mut self, config: GlobalConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        Runtime {
            config: self.config,
            os: self.os,
            functions: self.functions,
            mutex_methods: RwLock::new(None),
            malloc: Malloc::new(),
            pcache: RwLock::new(None),
            mutex_ready: AtomicBool::new(false),
            malloc_ready: AtomicBool::new(false),
            pcache_ready: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            init_lock: Mutex::new(InitLockSlot::default()),
            vfs: VfsRegistry::default(),
            auto_extensions: Mutex::new(Vec::new()),
            data_directory: Mutex::new(None),
            temp_directory: Mutex::new(None),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime with the default OS layer and built-in function registry.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: GlobalConfig::default(),
            os: Arc::new(DefaultOs),
            functions: Arc::new(BuiltinFunctions::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn init_state(&self) -> InitState {
        let slot = self.init_lock.lock();
        InitState {
            mutex_ready: self.mutex_ready.load(Ordering::Acquire),
            malloc_ready: self.malloc_ready.load(Ordering::Acquire),
            pcache_ready: self.pcache_ready.load(Ordering::Acquire),
            ready: self.ready.load(Ordering::Acquire),
            in_progress: self.in_progress.load(Ordering::Acquire),
            init_lock_refs: slot.refs,
            init_lock_present: slot.handle.is_some(),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Apply one configuration request.
    ///
    /// Only allowed before initialization completes (or after shutdown);
    /// otherwise fails with MISUSE and changes nothing.
    pub fn configure(&mut self, op: ConfigOp) -> Result<ConfigReply> {
        if self.is_ready() {
            warn!(target: "sqlboot.config", op = op.name(), "configure after initialize");
            return Err(SqlbootError::misuse("configure"));
        }
        let name = op.name();
        let reply = self.config.apply(op)?;
        debug!(target: "sqlboot.config", op = name, "configuration applied");
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Bring every subsystem up. No-op once the runtime is ready.
    pub fn initialize(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let _span = tracing::debug_span!("initialize").entered();

        self.mutex_init()?;

        let master = self.mutex_alloc(MutexKind::StaticMaster);
        let init_lock = mutex::with_optional(master.as_ref(), || self.enter_init_refs())?;
        let init_ref = InitLockRef {
            runtime: self,
            master: master.as_ref(),
        };

        let result = mutex::with_optional(init_lock.as_ref(), || self.bootstrap_body());

        drop(init_ref);

        match &result {
            Ok(()) => debug!(target: "sqlboot.init", ready = self.is_ready(), "initialize returned"),
            Err(err) => warn!(target: "sqlboot.init", error = %err, "initialize failed"),
        }
        result
    }

    /// Install and initialize the mutex strategy. Serialized internally.
    fn mutex_init(&self) -> Result<()> {
        if self.mutex_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut installed = self.mutex_methods.write();
        if self.mutex_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let strategy: Arc<dyn MutexStrategy> = match self.config.mutex_strategy() {
            Some(custom) => Arc::clone(custom),
            None if self.config.core_mutex() => Arc::new(ThreadMutexStrategy::new()),
            None => Arc::new(NoopMutexStrategy),
        };
        strategy.init()?;
        *installed = Some(strategy);
        self.mutex_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// First critical section (master lock held): allocator bring-up and
    /// init-lock creation. Returns the init lock for the second section.
    fn enter_init_refs(&self) -> Result<Option<MutexHandle>> {
        if !self.malloc_ready.load(Ordering::Acquire) {
            let methods = self
                .config
                .mem_methods()
                .cloned()
                .unwrap_or_else(|| Arc::new(SystemMem));
            self.malloc
                .init(methods, self.config.memstat(), self.config.scratch())?;
            self.malloc_ready.store(true, Ordering::Release);
        }

        let mut slot = self.init_lock.lock();
        if slot.handle.is_none() {
            slot.handle = self.mutex_alloc(MutexKind::Recursive);
            if slot.handle.is_none() && self.config.core_mutex() {
                return Err(SqlbootError::OutOfMemory);
            }
        }
        slot.refs += 1;
        Ok(slot.handle.clone())
    }

    /// Second critical section (init lock held).
    fn bootstrap_body(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) || self.in_progress.load(Ordering::Acquire) {
            return Ok(());
        }
        self.in_progress.store(true, Ordering::Release);
        let _in_progress = ClearOnDrop(&self.in_progress);
        self.bootstrap_subsystems()
    }

    fn bootstrap_subsystems(&self) -> Result<()> {
        self.functions.clear();
        self.functions.register_builtins();

        if !self.pcache_ready.load(Ordering::Acquire) {
            let methods = self
                .config
                .pcache_methods()
                .cloned()
                .unwrap_or_else(|| Arc::new(DefaultPageCache::new()));
            methods.init()?;
            *self.pcache.write() = Some(methods);
            self.pcache_ready.store(true, Ordering::Release);
        }

        self.os.init(self)?;

        if let Some(cache) = self.page_cache() {
            cache.buffer_setup(pcache::normalize_page_region(self.config.page_cache_region()));
        }
        self.ready.store(true, Ordering::Release);
        info!(
            target: "sqlboot.init",
            threading = ?self.config.threading_mode(),
            memstat = self.config.memstat(),
            "engine initialized"
        );
        Ok(())
    }

    /// Third critical section (master lock held): drop our init-lock
    /// reference and destroy the lock when nobody else holds one.
    fn leave_init_refs(&self) {
        let mut slot = self.init_lock.lock();
        debug_assert!(slot.refs > 0, "init lock reference count underflow");
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            if let Some(handle) = slot.handle.take() {
                self.mutex_free(handle);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Undo [`initialize`](Self::initialize) in reverse order. Harmless when
    /// the runtime was never initialized.
    pub fn shutdown(&mut self) -> Result<()> {
        let _span = tracing::debug_span!("shutdown").entered();

        if *self.ready.get_mut() {
            let os = Arc::clone(&self.os);
            os.end(self);
            self.auto_extensions.get_mut().clear();
            *self.ready.get_mut() = false;
        }
        if *self.pcache_ready.get_mut() {
            if let Some(cache) = self.pcache.get_mut().take() {
                cache.shutdown();
            }
            *self.pcache_ready.get_mut() = false;
        }
        if *self.malloc_ready.get_mut() {
            self.malloc.end();
            *self.malloc_ready.get_mut() = false;
            // Directory values may refer to memory from the heap just torn down.
            *self.data_directory.get_mut() = None;
            *self.temp_directory.get_mut() = None;
        }
        if *self.mutex_ready.get_mut() {
            if let Some(strategy) = self.mutex_methods.get_mut().take() {
                strategy.end();
            }
            *self.mutex_ready.get_mut() = false;
        }
        info!(target: "sqlboot.init", "engine shut down");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mutexes
    // -----------------------------------------------------------------------

    /// Create (or fetch, for static kinds) a mutex from the installed
    /// strategy. `None` when core mutexing is off or the strategy fails.
    #[must_use]
    pub fn mutex_alloc(&self, kind: MutexKind) -> Option<MutexHandle> {
        if !self.config.core_mutex() {
            return None;
        }
        self.mutex_methods.read().as_ref()?.alloc(kind)
    }

    pub fn mutex_free(&self, handle: MutexHandle) {
        if let Some(strategy) = self.mutex_methods.read().as_ref() {
            strategy.free(handle);
        }
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// The engine-wide allocator.
    #[must_use]
    pub fn malloc(&self) -> &Malloc {
        &self.malloc
    }

    /// `(current, high_water)` of a memory counter.
    pub fn status(&self, op: StatusOp, reset: bool) -> (usize, usize) {
        self.malloc.status(op, reset)
    }

    #[must_use]
    pub fn memory_status(&self) -> MemoryStatus {
        self.malloc.memory_status()
    }

    pub fn scratch_malloc(&self, n: usize) -> Option<ScratchBuf> {
        self.malloc.scratch_malloc(n)
    }

    pub fn scratch_free(&self, scratch: ScratchBuf) {
        self.malloc.scratch_free(scratch);
    }

    /// The page cache installed by bootstrap, if any.
    #[must_use]
    pub fn page_cache(&self) -> Option<Arc<dyn PageCacheMethods>> {
        self.pcache.read().clone()
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Report an event to the configured log callback.
    pub fn log(&self, code: ErrorCode, message: &str) {
        debug!(target: "sqlboot.log", code = code.as_str(), "{message}");
        if let Some(callback) = self.config.log_callback() {
            callback(code, message);
        }
    }

    // -----------------------------------------------------------------------
    // VFS registry
    // -----------------------------------------------------------------------

    /// Register a VFS name, initializing the engine first.
    pub fn register_vfs(&self, name: &str, make_default: bool) -> Result<()> {
        self.initialize()?;
        let lock = self.mutex_alloc(MutexKind::StaticVfs);
        mutex::with_optional(lock.as_ref(), || self.vfs.register(name, make_default));
        debug!(target: "sqlboot.os", vfs = name, make_default, "vfs registered");
        Ok(())
    }

    pub fn unregister_vfs(&self, name: &str) -> Result<()> {
        let lock = self.mutex_alloc(MutexKind::StaticVfs);
        mutex::with_optional(lock.as_ref(), || self.vfs.unregister(name))
    }

    /// Find a VFS by name, or the default one for `None`. Initializes the
    /// engine; returns `None` if that fails.
    pub fn find_vfs(&self, name: Option<&str>) -> Option<String> {
        self.initialize().ok()?;
        let lock = self.mutex_alloc(MutexKind::StaticVfs);
        mutex::with_optional(lock.as_ref(), || self.vfs.find(name))
    }

    // -----------------------------------------------------------------------
    // Auto extensions
    // -----------------------------------------------------------------------

    /// Add an entry point to run on every new connection. Registering the
    /// same entry twice is a no-op.
    pub fn register_auto_extension(&self, extension: AutoExtension) -> Result<()> {
        self.initialize()?;
        let lock = self.mutex_alloc(MutexKind::StaticMaster);
        mutex::with_optional(lock.as_ref(), || {
            let mut list = self.auto_extensions.lock();
            if !list.iter().any(|e| Arc::ptr_eq(e, &extension)) {
                list.push(extension);
            }
        });
        Ok(())
    }

    /// Remove a previously registered entry point. Returns whether it was
    /// found.
    pub fn cancel_auto_extension(&self, extension: &AutoExtension) -> bool {
        let lock = self.mutex_alloc(MutexKind::StaticMaster);
        mutex::with_optional(lock.as_ref(), || {
            let mut list = self.auto_extensions.lock();
            let before = list.len();
            list.retain(|e| !Arc::ptr_eq(e, extension));
            list.len() != before
        })
    }

    pub fn reset_auto_extension(&self) {
        let lock = self.mutex_alloc(MutexKind::StaticMaster);
        mutex::with_optional(lock.as_ref(), || self.auto_extensions.lock().clear());
    }

    pub(crate) fn auto_extensions(&self) -> Vec<AutoExtension> {
        let lock = self.mutex_alloc(MutexKind::StaticMaster);
        mutex::with_optional(lock.as_ref(), || self.auto_extensions.lock().clone())
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    pub fn set_directory(&self, kind: DirectoryKind, path: Option<PathBuf>) {
        *self.directory_slot(kind).lock() = path;
    }

    #[must_use]
    pub fn directory(&self, kind: DirectoryKind) -> Option<PathBuf> {
        self.directory_slot(kind).lock().clone()
    }

    fn directory_slot(&self, kind: DirectoryKind) -> &Mutex<Option<PathBuf>> {
        match kind {
            DirectoryKind::Data => &self.data_directory,
            DirectoryKind::Temp => &self.temp_directory,
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("state", &self.init_state())
            .finish_non_exhaustive()
    }
}
