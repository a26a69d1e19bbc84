//! OS-layer hooks and the VFS name registry.
//!
//! The OS layer's `init` hook runs inside the bootstrap critical section and
//! normally registers the platform VFS. Registration auto-initializes the
//! engine, so the hook re-enters [`Runtime::initialize`] from the thread that
//! is already bootstrapping; that nested call must return without blocking.

use parking_lot::Mutex;
use sqlboot_error::{Result, SqlbootError};

use crate::runtime::Runtime;

/// OS-layer bring-up and teardown.
pub trait OsLayer: Send + Sync {
    /// May call back into `runtime` (including `initialize`).
    fn init(&self, runtime: &Runtime) -> Result<()>;
    fn end(&self, runtime: &Runtime);
}

/// Name of the VFS registered by [`DefaultOs`].
#[cfg(unix)]
pub const PLATFORM_VFS: &str = "unix";
#[cfg(windows)]
pub const PLATFORM_VFS: &str = "win32";
#[cfg(not(any(unix, windows)))]
pub const PLATFORM_VFS: &str = "memdb";

/// Default OS layer: registers the platform VFS as the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOs;

impl OsLayer for DefaultOs {
    fn init(&self, runtime: &Runtime) -> Result<()> {
        runtime.register_vfs(PLATFORM_VFS, true)
    }

    fn end(&self, _runtime: &Runtime) {}
}

/// Ordered list of registered VFS names; the first entry is the default.
#[derive(Debug, Default)]
pub(crate) struct VfsRegistry {
    names: Mutex<Vec<String>>,
}

impl VfsRegistry {
    pub(crate) fn register(&self, name: &str, make_default: bool) {
        let mut names = self.names.lock();
        names.retain(|n| n != name);
        if make_default || names.is_empty() {
            names.insert(0, name.to_owned());
        } else {
            names.insert(1, name.to_owned());
        }
    }

    pub(crate) fn unregister(&self, name: &str) -> Result<()> {
        let mut names = self.names.lock();
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() == before {
            return Err(SqlbootError::NotFound {
                kind: "vfs",
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    /// `None` asks for the default VFS.
    pub(crate) fn find(&self, name: Option<&str>) -> Option<String> {
        let names = self.names.lock();
        match name {
            None => names.first().cloned(),
            Some(wanted) => names.iter().find(|n| *n == wanted).cloned(),
        }
    }
}
