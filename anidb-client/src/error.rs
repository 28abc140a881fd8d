//! Error types for the binding layer

use std::fmt;
use std::path::{Path, PathBuf};

use anidb_abi::ResultCode;
use thiserror::Error;

/// One kind per non-success native result code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidHandle,
    InvalidParameter,
    FileNotFound,
    Processing,
    OutOfMemory,
    Io,
    Network,
    Cancelled,
    InvalidUtf8,
    VersionMismatch,
    Timeout,
    PermissionDenied,
    Cache,
    Busy,
    Unknown,
}

impl ErrorKind {
    /// Kind for a raw result code; codes outside the enumeration (and
    /// SUCCESS, which is not a failure) are `Unknown`
    pub fn from_code(code: i32) -> Self {
        match ResultCode::try_from(code) {
            Ok(ResultCode::InvalidHandle) => ErrorKind::InvalidHandle,
            Ok(ResultCode::InvalidParameter) => ErrorKind::InvalidParameter,
            Ok(ResultCode::FileNotFound) => ErrorKind::FileNotFound,
            Ok(ResultCode::Processing) => ErrorKind::Processing,
            Ok(ResultCode::OutOfMemory) => ErrorKind::OutOfMemory,
            Ok(ResultCode::Io) => ErrorKind::Io,
            Ok(ResultCode::Network) => ErrorKind::Network,
            Ok(ResultCode::Cancelled) => ErrorKind::Cancelled,
            Ok(ResultCode::InvalidUtf8) => ErrorKind::InvalidUtf8,
            Ok(ResultCode::VersionMismatch) => ErrorKind::VersionMismatch,
            Ok(ResultCode::Timeout) => ErrorKind::Timeout,
            Ok(ResultCode::PermissionDenied) => ErrorKind::PermissionDenied,
            Ok(ResultCode::Cache) => ErrorKind::Cache,
            Ok(ResultCode::Busy) => ErrorKind::Busy,
            Ok(ResultCode::Success | ResultCode::Unknown) | Err(_) => ErrorKind::Unknown,
        }
    }

    pub fn result_code(self) -> ResultCode {
        match self {
            ErrorKind::InvalidHandle => ResultCode::InvalidHandle,
            ErrorKind::InvalidParameter => ResultCode::InvalidParameter,
            ErrorKind::FileNotFound => ResultCode::FileNotFound,
            ErrorKind::Processing => ResultCode::Processing,
            ErrorKind::OutOfMemory => ResultCode::OutOfMemory,
            ErrorKind::Io => ResultCode::Io,
            ErrorKind::Network => ResultCode::Network,
            ErrorKind::Cancelled => ResultCode::Cancelled,
            ErrorKind::InvalidUtf8 => ResultCode::InvalidUtf8,
            ErrorKind::VersionMismatch => ResultCode::VersionMismatch,
            ErrorKind::Timeout => ResultCode::Timeout,
            ErrorKind::PermissionDenied => ResultCode::PermissionDenied,
            ErrorKind::Cache => ResultCode::Cache,
            ErrorKind::Busy => ResultCode::Busy,
            ErrorKind::Unknown => ResultCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.result_code().description())
    }
}

/// Errors surfaced by the binding
#[derive(Debug, Error)]
pub enum AnidbError {
    #[error("Native library not found ({path}): {reason}")]
    LibraryNotFound { path: String, reason: String },

    #[error("{kind} (code {code}): {message}")]
    Native {
        kind: ErrorKind,
        code: i32,
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Session handle already closed")]
    HandleClosed,

    /// `kind` is `Unknown` when the engine reported success without an id
    #[error("Callback registration failed ({kind}): {message}")]
    RegistrationFailed { kind: ErrorKind, message: String },

    #[error("Unknown callback id {0}")]
    UnknownCallback(u64),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid text encoding: {0}")]
    InvalidTextEncoding(String),

    #[error("Native allocation already released")]
    AlreadyReleased,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, AnidbError>;

impl AnidbError {
    /// Map a native result code to a typed failure
    ///
    /// Deterministic: the same code always yields the same kind. Unknown
    /// codes keep their raw value under `ErrorKind::Unknown`.
    pub fn from_result(code: i32, message: impl Into<String>, path: Option<&Path>) -> Self {
        AnidbError::Native {
            kind: ErrorKind::from_code(code),
            code,
            message: message.into(),
            path: path.map(Path::to_path_buf),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        AnidbError::Validation(message.into())
    }

    /// Engine-reported error kind, `None` for binding-local failures
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AnidbError::Native { kind, .. } | AnidbError::RegistrationFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Raw native result code, when there is one
    pub fn code(&self) -> Option<i32> {
        match self {
            AnidbError::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// File path involved in a native failure
    pub fn path(&self) -> Option<&Path> {
        match self {
            AnidbError::Native { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_failure_code_has_a_distinct_kind() {
        let kinds: HashSet<ErrorKind> = ResultCode::ALL
            .iter()
            .filter(|code| !code.is_success())
            .map(|code| ErrorKind::from_code(code.raw()))
            .collect();
        assert_eq!(kinds.len(), ResultCode::ALL.len() - 1);
    }

    #[test]
    fn test_mapping_is_idempotent() {
        for code in ResultCode::ALL {
            let first = AnidbError::from_result(code.raw(), "x", None).kind();
            let second = AnidbError::from_result(code.raw(), "y", None).kind();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_kind_round_trips_to_code() {
        for code in ResultCode::ALL.iter().filter(|code| !code.is_success()) {
            assert_eq!(ErrorKind::from_code(code.raw()).result_code(), *code);
        }
    }

    #[test]
    fn test_unknown_code_keeps_raw_value() {
        let err = AnidbError::from_result(1234, "weird", Some(Path::new("a.mkv")));
        assert_eq!(err.kind(), Some(ErrorKind::Unknown));
        assert_eq!(err.code(), Some(1234));
        assert_eq!(err.path(), Some(Path::new("a.mkv")));
    }

    #[test]
    fn test_registration_failure_keeps_cause() {
        let err = AnidbError::RegistrationFailed {
            kind: ErrorKind::InvalidParameter,
            message: "callback is NULL".into(),
        };
        assert_eq!(err.kind(), Some(ErrorKind::InvalidParameter));
        assert!(err.to_string().contains("callback is NULL"));
    }

    #[test]
    fn test_local_errors_have_no_kind() {
        assert_eq!(AnidbError::HandleClosed.kind(), None);
        assert_eq!(AnidbError::Usage("twice".into()).code(), None);
    }
}
