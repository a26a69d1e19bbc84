//! Process-wide configuration record and the opcode-dispatched setter.
//!
//! [`GlobalConfig`] holds every tunable the bootstrap core consults. It is
//! only writable through [`crate::Runtime::configure`], which takes the
//! runtime by `&mut` and refuses once initialization has completed.

use std::fmt;
use std::sync::Arc;

use sqlboot_error::{ErrorCode, Result, SqlbootError};

use crate::mem::{MemMethods, SystemMem};
use crate::mutex::MutexStrategy;
use crate::pcache::{DefaultPageCache, PageCacheMethods};

/// Hard ceiling for the memory-map size.
pub const MAX_MMAP_SIZE: i64 = 0x7fff_0000;

/// Memory-map size used when a negative default is configured.
pub const DEFAULT_MMAP_SIZE: i64 = 0;

/// Default lookaside geometry for new connections.
pub const DEFAULT_LOOKASIDE: BufferRegion = BufferRegion {
    slot_size: 128,
    count: 500,
};

/// Engine log sink. The closure captures whatever context it needs.
pub type LogCallback = Arc<dyn Fn(ErrorCode, &str) + Send + Sync>;

/// Geometry of a region carved into equal cells. A zero size or count means
/// the region is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferRegion {
    pub slot_size: usize,
    pub count: usize,
}

impl BufferRegion {
    pub const NONE: Self = Self {
        slot_size: 0,
        count: 0,
    };

    #[must_use]
    pub fn is_none(self) -> bool {
        self.slot_size == 0 || self.count == 0
    }
}

/// Threading mode, as selected by the three threading opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// No mutexing at all.
    SingleThread,
    /// Core structures are mutexed, connections are not.
    MultiThread,
    /// Everything is mutexed.
    Serialized,
}

/// One configuration request. Each variant carries its own payload.
pub enum ConfigOp {
    SingleThread,
    MultiThread,
    Serialized,
    /// Install a heap strategy.
    Malloc(Arc<dyn MemMethods>),
    /// Read the heap strategy, installing the built-in one if none is set.
    GetMalloc,
    /// Scratch buffer region.
    Scratch(BufferRegion),
    /// Page-cache buffer region, wired into the page cache at bootstrap.
    PageCache(BufferRegion),
    MemStatus(bool),
    Mutex(Arc<dyn MutexStrategy>),
    GetMutex,
    /// Default lookaside geometry for connections opened afterwards.
    Lookaside { slot_size: usize, count: usize },
    /// Retired page-cache setter; accepted and ignored.
    PageCacheLegacy,
    /// Retired page-cache getter; always an error.
    GetPageCacheLegacy,
    /// Install or clear the engine log callback.
    Log(Option<LogCallback>),
    Uri(bool),
    PageCacheV2(Arc<dyn PageCacheMethods>),
    /// Read the page-cache strategy, installing the default if none is set.
    GetPageCacheV2,
    CoveringIndexScan(bool),
    /// Default memory-map size and hard cap. Negative values select the
    /// compiled defaults.
    MmapSize { default: i64, cap: i64 },
    /// A raw opcode this build does not know.
    Unrecognized(i32),
}

impl ConfigOp {
    /// Numeric opcode, as in `sqlite3.h`.
    #[must_use]
    pub const fn opcode(&self) -> i32 {
        match self {
            Self::SingleThread => 1,
            Self::MultiThread => 2,
            Self::Serialized => 3,
            Self::Malloc(_) => 4,
            Self::GetMalloc => 5,
            Self::Scratch(_) => 6,
            Self::PageCache(_) => 7,
            Self::MemStatus(_) => 9,
            Self::Mutex(_) => 10,
            Self::GetMutex => 11,
            Self::Lookaside { .. } => 13,
            Self::PageCacheLegacy => 14,
            Self::GetPageCacheLegacy => 15,
            Self::Log(_) => 16,
            Self::Uri(_) => 17,
            Self::PageCacheV2(_) => 18,
            Self::GetPageCacheV2 => 19,
            Self::CoveringIndexScan(_) => 20,
            Self::MmapSize { .. } => 22,
            Self::Unrecognized(op) => *op,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SingleThread => "SINGLETHREAD",
            Self::MultiThread => "MULTITHREAD",
            Self::Serialized => "SERIALIZED",
            Self::Malloc(_) => "MALLOC",
            Self::GetMalloc => "GETMALLOC",
            Self::Scratch(_) => "SCRATCH",
            Self::PageCache(_) => "PAGECACHE",
            Self::MemStatus(_) => "MEMSTATUS",
            Self::Mutex(_) => "MUTEX",
            Self::GetMutex => "GETMUTEX",
            Self::Lookaside { .. } => "LOOKASIDE",
            Self::PageCacheLegacy => "PCACHE",
            Self::GetPageCacheLegacy => "GETPCACHE",
            Self::Log(_) => "LOG",
            Self::Uri(_) => "URI",
            Self::PageCacheV2(_) => "PCACHE2",
            Self::GetPageCacheV2 => "GETPCACHE2",
            Self::CoveringIndexScan(_) => "COVERING_INDEX_SCAN",
            Self::MmapSize { .. } => "MMAP_SIZE",
            Self::Unrecognized(_) => "UNRECOGNIZED",
        }
    }
}

impl fmt::Debug for ConfigOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigOp::{}({})", self.name(), self.opcode())
    }
}

/// Result of a successful [`ConfigOp`].
pub enum ConfigReply {
    /// A setter was applied.
    Done,
    Mutex(Option<Arc<dyn MutexStrategy>>),
    Malloc(Arc<dyn MemMethods>),
    PageCache(Arc<dyn PageCacheMethods>),
}

impl fmt::Debug for ConfigReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::Done => "Done",
            Self::Mutex(Some(_)) => "Mutex(Some)",
            Self::Mutex(None) => "Mutex(None)",
            Self::Malloc(_) => "Malloc",
            Self::PageCache(_) => "PageCache",
        };
        f.write_str(what)
    }
}

/// Process-wide configuration.
pub struct GlobalConfig {
    core_mutex: bool,
    full_mutex: bool,
    memstat: bool,
    open_uri: bool,
    use_cis: bool,
    mutex: Option<Arc<dyn MutexStrategy>>,
    malloc: Option<Arc<dyn MemMethods>>,
    pcache: Option<Arc<dyn PageCacheMethods>>,
    scratch: BufferRegion,
    page: BufferRegion,
    lookaside: BufferRegion,
    mmap_size: i64,
    max_mmap_size: i64,
    log: Option<LogCallback>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            core_mutex: true,
            full_mutex: true,
            memstat: true,
            open_uri: false,
            use_cis: true,
            mutex: None,
            malloc: None,
            pcache: None,
            scratch: BufferRegion::NONE,
            page: BufferRegion::NONE,
            lookaside: DEFAULT_LOOKASIDE,
            mmap_size: DEFAULT_MMAP_SIZE,
            max_mmap_size: MAX_MMAP_SIZE,
            log: None,
        }
    }
}

impl GlobalConfig {
    /// Apply `op`. The caller has already checked the pre-init window.
    pub(crate) fn apply(&mut self, op: ConfigOp) -> Result<ConfigReply> {
        match op {
            ConfigOp::SingleThread => {
                self.core_mutex = false;
                self.full_mutex = false;
            }
            ConfigOp::MultiThread => {
                self.core_mutex = true;
                self.full_mutex = false;
            }
            ConfigOp::Serialized => {
                self.core_mutex = true;
                self.full_mutex = true;
            }
            ConfigOp::Mutex(strategy) => self.mutex = Some(strategy),
            ConfigOp::GetMutex => return Ok(ConfigReply::Mutex(self.mutex.clone())),
            ConfigOp::Malloc(methods) => self.malloc = Some(methods),
            ConfigOp::GetMalloc => {
                let methods = self.malloc.get_or_insert_with(|| Arc::new(SystemMem));
                return Ok(ConfigReply::Malloc(Arc::clone(methods)));
            }
            ConfigOp::MemStatus(on) => self.memstat = on,
            ConfigOp::Scratch(region) => self.scratch = region,
            ConfigOp::PageCache(region) => self.page = region,
            ConfigOp::Lookaside { slot_size, count } => {
                self.lookaside = BufferRegion { slot_size, count };
            }
            ConfigOp::PageCacheLegacy => {}
            ConfigOp::GetPageCacheLegacy => {
                return Err(SqlbootError::RetiredConfigOption {
                    opcode: ConfigOp::GetPageCacheLegacy.opcode(),
                    replacement: "GETPCACHE2",
                });
            }
            ConfigOp::PageCacheV2(methods) => self.pcache = Some(methods),
            ConfigOp::GetPageCacheV2 => {
                let methods = self
                    .pcache
                    .get_or_insert_with(|| Arc::new(DefaultPageCache::new()));
                return Ok(ConfigReply::PageCache(Arc::clone(methods)));
            }
            ConfigOp::Log(callback) => self.log = callback,
            ConfigOp::Uri(on) => self.open_uri = on,
            ConfigOp::CoveringIndexScan(on) => self.use_cis = on,
            ConfigOp::MmapSize { default, cap } => {
                let cap = if (0..=MAX_MMAP_SIZE).contains(&cap) {
                    cap
                } else {
                    MAX_MMAP_SIZE
                };
                let default = if default < 0 {
                    DEFAULT_MMAP_SIZE
                } else {
                    default
                };
                self.max_mmap_size = cap;
                self.mmap_size = default.min(cap);
            }
            ConfigOp::Unrecognized(opcode) => {
                return Err(SqlbootError::UnknownConfigOption { opcode });
            }
        }
        Ok(ConfigReply::Done)
    }

    #[must_use]
    pub fn threading_mode(&self) -> ThreadingMode {
        match (self.core_mutex, self.full_mutex) {
            (false, _) => ThreadingMode::SingleThread,
            (true, false) => ThreadingMode::MultiThread,
            (true, true) => ThreadingMode::Serialized,
        }
    }

    /// Whether engine-wide structures are protected by mutexes.
    #[must_use]
    pub fn core_mutex(&self) -> bool {
        self.core_mutex
    }

    /// Whether each connection gets its own mutex.
    #[must_use]
    pub fn full_mutex(&self) -> bool {
        self.full_mutex
    }

    #[must_use]
    pub fn memstat(&self) -> bool {
        self.memstat
    }

    #[must_use]
    pub fn open_uri(&self) -> bool {
        self.open_uri
    }

    #[must_use]
    pub fn covering_index_scan(&self) -> bool {
        self.use_cis
    }

    #[must_use]
    pub fn scratch(&self) -> BufferRegion {
        self.scratch
    }

    #[must_use]
    pub fn page_cache_region(&self) -> BufferRegion {
        self.page
    }

    #[must_use]
    pub fn lookaside(&self) -> BufferRegion {
        self.lookaside
    }

    #[must_use]
    pub fn mmap_size(&self) -> i64 {
        self.mmap_size
    }

    #[must_use]
    pub fn max_mmap_size(&self) -> i64 {
        self.max_mmap_size
    }

    #[must_use]
    pub fn log_callback(&self) -> Option<&LogCallback> {
        self.log.as_ref()
    }

    pub(crate) fn mutex_strategy(&self) -> Option<&Arc<dyn MutexStrategy>> {
        self.mutex.as_ref()
    }

    pub(crate) fn mem_methods(&self) -> Option<&Arc<dyn MemMethods>> {
        self.malloc.as_ref()
    }

    pub(crate) fn pcache_methods(&self) -> Option<&Arc<dyn PageCacheMethods>> {
        self.pcache.as_ref()
    }
}

impl fmt::Debug for GlobalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalConfig")
            .field("threading_mode", &self.threading_mode())
            .field("memstat", &self.memstat)
            .field("open_uri", &self.open_uri)
            .field("use_cis", &self.use_cis)
            .field("scratch", &self.scratch)
            .field("page", &self.page)
            .field("lookaside", &self.lookaside)
            .field("mmap_size", &self.mmap_size)
            .field("max_mmap_size", &self.max_mmap_size)
            .field("log", &self.log.is_some())
            .finish_non_exhaustive()
    }
}
