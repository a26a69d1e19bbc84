use thiserror::Error;

/// Primary error type for sqlboot operations.
///
/// Every variant maps onto one of SQLite's primary result codes through
/// [`SqlbootError::error_code`], so callers that speak the numeric protocol
/// can recover the exact code the engine would have returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlbootError {
    // === Memory ===
    /// A mutex the bootstrap needs could not be created.
    #[error("out of memory")]
    OutOfMemory,

    // === Lifecycle ===
    /// A routine was called while the library was in the wrong state
    /// (for example reconfiguring after initialization completed).
    #[error("{api} called out of sequence")]
    Misuse { api: &'static str },

    // === Configuration ===
    /// The configuration opcode is not known to this build.
    #[error("unknown configuration option {opcode}")]
    UnknownConfigOption { opcode: i32 },

    /// The configuration opcode was retired in favor of a replacement.
    #[error("configuration option {opcode} is retired; use {replacement}")]
    RetiredConfigOption {
        opcode: i32,
        replacement: &'static str,
    },

    /// A resource is in use and cannot be reconfigured right now.
    #[error("{resource} is busy")]
    Busy { resource: &'static str },

    // === Registries ===
    /// A named registry entry does not exist.
    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Generic error with a message, typically from a pluggable hook.
    #[error("{0}")]
    Generic(String),
}

/// SQLite result/error codes for wire protocol compatibility.
///
/// These match the numeric values from C SQLite's `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Database file is locked / resource busy.
    Busy = 5,
    /// Out of memory.
    NoMem = 7,
    /// Not found (internal).
    NotFound = 12,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Library used incorrectly.
    Misuse = 21,
}

impl ErrorCode {
    /// Code for an operation outcome: [`ErrorCode::Ok`] on success, otherwise
    /// the code of the error.
    #[must_use]
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.error_code(),
        }
    }

    /// Short English description, as returned by `sqlite3_errstr`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "not an error",
            Self::Error => "SQL logic error",
            Self::Internal => "internal error",
            Self::Busy => "database is locked",
            Self::NoMem => "out of memory",
            Self::NotFound => "unknown operation",
            Self::TooBig => "string or blob too big",
            Self::Misuse => "bad parameter or other API misuse",
        }
    }
}

impl SqlbootError {
    /// Map this error to a SQLite error code for compatibility.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::Misuse { .. } => ErrorCode::Misuse,
            Self::UnknownConfigOption { .. }
            | Self::RetiredConfigOption { .. }
            | Self::NotFound { .. }
            | Self::Generic(_) => ErrorCode::Error,
            Self::Busy { .. } => ErrorCode::Busy,
        }
    }

    /// Get the process exit code for this error (for CLI use).
    pub const fn exit_code(&self) -> i32 {
        self.error_code() as i32
    }

    /// Create a misuse error naming the offending routine.
    pub const fn misuse(api: &'static str) -> Self {
        Self::Misuse { api }
    }

    /// Create a generic error.
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}

/// Result type alias using `SqlbootError`.
pub type Result<T> = std::result::Result<T, SqlbootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(SqlbootError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            SqlbootError::misuse("configure").to_string(),
            "configure called out of sequence"
        );
        assert_eq!(
            SqlbootError::RetiredConfigOption {
                opcode: 15,
                replacement: "GetPageCacheV2"
            }
            .to_string(),
            "configuration option 15 is retired; use GetPageCacheV2"
        );
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(SqlbootError::OutOfMemory.error_code(), ErrorCode::NoMem);
        assert_eq!(
            SqlbootError::misuse("configure").error_code(),
            ErrorCode::Misuse
        );
        assert_eq!(
            SqlbootError::UnknownConfigOption { opcode: 999 }.error_code(),
            ErrorCode::Error
        );
        assert_eq!(
            SqlbootError::Busy {
                resource: "lookaside"
            }
            .error_code(),
            ErrorCode::Busy
        );
        assert_eq!(
            SqlbootError::NotFound {
                kind: "vfs",
                name: "nope".to_owned()
            }
            .error_code(),
            ErrorCode::Error
        );
    }

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::Error as i32, 1);
        assert_eq!(ErrorCode::Busy as i32, 5);
        assert_eq!(ErrorCode::NoMem as i32, 7);
        assert_eq!(ErrorCode::Misuse as i32, 21);
    }

    #[test]
    fn code_of_result() {
        let ok: Result<()> = Ok(());
        assert_eq!(ErrorCode::of(&ok), ErrorCode::Ok);
        let err: Result<()> = Err(SqlbootError::OutOfMemory);
        assert_eq!(ErrorCode::of(&err), ErrorCode::NoMem);
    }

    #[test]
    fn exit_code() {
        assert_eq!(SqlbootError::OutOfMemory.exit_code(), 7);
        assert_eq!(SqlbootError::misuse("x").exit_code(), 21);
        assert_eq!(SqlbootError::generic("x").exit_code(), 1);
    }

    #[test]
    fn errstr() {
        assert_eq!(ErrorCode::Ok.as_str(), "not an error");
        assert_eq!(ErrorCode::NoMem.as_str(), "out of memory");
        assert_eq!(
            ErrorCode::Misuse.as_str(),
            "bad parameter or other API misuse"
        );
    }
}
