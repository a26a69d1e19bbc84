//! Global built-in function registry.
//!
//! Bootstrap clears the registry and repopulates it with the built-in
//! function signatures every time it runs. Implementations of the functions
//! belong to the SQL layer; this registry only records which
//! `(name, num_args)` signatures exist and what kind they are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

/// Hook used by bootstrap to reset and repopulate the function registry.
pub trait GlobalFunctions: Send + Sync {
    fn clear(&self);
    fn register_builtins(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
}

/// Composite lookup key for functions: `(UPPERCASE name, num_args)`.
///
/// `-1` for `num_args` means variadic.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FunctionKey {
    pub name: String,
    pub num_args: i32,
}

impl FunctionKey {
    #[must_use]
    pub fn new(name: &str, num_args: i32) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            num_args,
        }
    }
}

const BUILTINS: &[(&str, i32, FunctionKind)] = &[
    ("abs", 1, FunctionKind::Scalar),
    ("changes", 0, FunctionKind::Scalar),
    ("char", -1, FunctionKind::Scalar),
    ("coalesce", -1, FunctionKind::Scalar),
    ("glob", 2, FunctionKind::Scalar),
    ("hex", 1, FunctionKind::Scalar),
    ("ifnull", 2, FunctionKind::Scalar),
    ("instr", 2, FunctionKind::Scalar),
    ("length", 1, FunctionKind::Scalar),
    ("like", 2, FunctionKind::Scalar),
    ("like", 3, FunctionKind::Scalar),
    ("lower", 1, FunctionKind::Scalar),
    ("ltrim", 1, FunctionKind::Scalar),
    ("ltrim", 2, FunctionKind::Scalar),
    ("max", -1, FunctionKind::Scalar),
    ("min", -1, FunctionKind::Scalar),
    ("nullif", 2, FunctionKind::Scalar),
    ("quote", 1, FunctionKind::Scalar),
    ("random", 0, FunctionKind::Scalar),
    ("randomblob", 1, FunctionKind::Scalar),
    ("replace", 3, FunctionKind::Scalar),
    ("round", 1, FunctionKind::Scalar),
    ("round", 2, FunctionKind::Scalar),
    ("rtrim", 1, FunctionKind::Scalar),
    ("rtrim", 2, FunctionKind::Scalar),
    ("sqlite_version", 0, FunctionKind::Scalar),
    ("substr", 2, FunctionKind::Scalar),
    ("substr", 3, FunctionKind::Scalar),
    ("trim", 1, FunctionKind::Scalar),
    ("trim", 2, FunctionKind::Scalar),
    ("typeof", 1, FunctionKind::Scalar),
    ("upper", 1, FunctionKind::Scalar),
    ("zeroblob", 1, FunctionKind::Scalar),
    ("date", -1, FunctionKind::Scalar),
    ("time", -1, FunctionKind::Scalar),
    ("datetime", -1, FunctionKind::Scalar),
    ("julianday", -1, FunctionKind::Scalar),
    ("strftime", -1, FunctionKind::Scalar),
    ("avg", 1, FunctionKind::Aggregate),
    ("count", 0, FunctionKind::Aggregate),
    ("count", 1, FunctionKind::Aggregate),
    ("group_concat", 1, FunctionKind::Aggregate),
    ("group_concat", 2, FunctionKind::Aggregate),
    ("sum", 1, FunctionKind::Aggregate),
    ("total", 1, FunctionKind::Aggregate),
];

/// Default registry holding the built-in signatures.
#[derive(Debug, Default)]
pub struct BuiltinFunctions {
    table: RwLock<HashMap<FunctionKey, FunctionKind>>,
    populations: AtomicUsize,
}

impl BuiltinFunctions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `(name, num_args)`, falling back to the variadic entry.
    #[must_use]
    pub fn find(&self, name: &str, num_args: i32) -> Option<FunctionKind> {
        let table = self.table.read();
        let exact = FunctionKey::new(name, num_args);
        if let Some(kind) = table.get(&exact) {
            return Some(*kind);
        }
        table.get(&FunctionKey::new(name, -1)).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// How many times [`GlobalFunctions::register_builtins`] has run.
    #[must_use]
    pub fn populations(&self) -> usize {
        self.populations.load(Ordering::Acquire)
    }
}

impl GlobalFunctions for BuiltinFunctions {
    fn clear(&self) {
        self.table.write().clear();
    }

    fn register_builtins(&self) {
        let mut table = self.table.write();
        for &(name, num_args, kind) in BUILTINS {
            table.insert(FunctionKey::new(name, num_args), kind);
        }
        let entries = table.len();
        drop(table);
        self.populations.fetch_add(1, Ordering::AcqRel);
        debug!(target: "sqlboot.func", entries, "built-in functions registered");
    }
}
