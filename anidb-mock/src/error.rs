//! Error types for the mock engine

use anidb_abi::{anidb_result_t, ResultCode};
use thiserror::Error;

/// Failure inside an exported function, converted to a result code at the boundary
#[derive(Debug, Error)]
pub enum MockError {
    #[error("invalid or destroyed session handle")]
    InvalidHandle,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("ABI version mismatch: engine {engine}, caller {caller}")]
    VersionMismatch { engine: u32, caller: u32 },

    #[error("library not initialized")]
    NotInitialized,

    #[error("network unavailable while contacting {0}")]
    Network(String),

    #[error("event stream already connected")]
    Busy,

    #[error("unknown callback id {0}")]
    UnknownCallback(u64),

    #[error("processing failed for {path}: {reason}")]
    Processing { path: String, reason: String },
}

impl MockError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        MockError::InvalidParameter(msg.into())
    }

    pub fn io(path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => MockError::FileNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => MockError::PermissionDenied(path.to_string()),
            _ => MockError::Io {
                path: path.to_string(),
                source,
            },
        }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            MockError::InvalidHandle => ResultCode::InvalidHandle,
            MockError::InvalidParameter(_) | MockError::UnknownCallback(_) => ResultCode::InvalidParameter,
            MockError::FileNotFound(_) => ResultCode::FileNotFound,
            MockError::Io { .. } => ResultCode::Io,
            MockError::PermissionDenied(_) => ResultCode::PermissionDenied,
            MockError::InvalidUtf8 => ResultCode::InvalidUtf8,
            MockError::VersionMismatch { .. } => ResultCode::VersionMismatch,
            MockError::NotInitialized => ResultCode::InvalidHandle,
            MockError::Network(_) => ResultCode::Network,
            MockError::Busy => ResultCode::Busy,
            MockError::Processing { .. } => ResultCode::Processing,
        }
    }

    /// The file path involved, when there is one
    pub fn path(&self) -> Option<&str> {
        match self {
            MockError::FileNotFound(path) | MockError::PermissionDenied(path) => Some(path),
            MockError::Io { path, .. } | MockError::Processing { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<&MockError> for anidb_result_t {
    fn from(err: &MockError) -> Self {
        err.code().raw()
    }
}

pub type MockResult<T> = Result<T, MockError>;

/// Run an exported function body, turning panics into `ANIDB_ERROR_UNKNOWN`
macro_rules! ffi_guard {
    ($body:block) => {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $body)) {
            Ok(code) => code,
            Err(_) => {
                tracing::error!("panic caught at the C boundary");
                anidb_abi::ResultCode::Unknown.raw()
            }
        }
    };
    (void $body:block) => {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $body)).is_err() {
            tracing::error!("panic caught at the C boundary");
        }
    };
}

pub(crate) use ffi_guard;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = MockError::io("a.mkv", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.code(), ResultCode::FileNotFound);
        assert_eq!(err.path(), Some("a.mkv"));

        let err = MockError::io("a.mkv", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(err.code(), ResultCode::PermissionDenied);

        let err = MockError::io("a.mkv", std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert_eq!(err.code(), ResultCode::Io);
    }

    #[test]
    fn test_guard_catches_panic() {
        fn boom() -> anidb_result_t {
            ffi_guard!({
                if true {
                    panic!("boom");
                }
                0
            })
        }
        assert_eq!(boom(), ResultCode::Unknown.raw());
    }
}
