//! anidb C ABI
//!
//! Single source of truth for everything that crosses the boundary between
//! the native hashing/identification engine and its callers: struct layouts,
//! enumerant values, callback and entry-point signatures, and the ABI
//! version both sides must agree on before any data is exchanged.
//!
//! ## Ownership rules
//!
//! - Pointers returned through `out_*` parameters belong to the engine until
//!   released with the matching `anidb_free_*` function, exactly once.
//! - Input buffers only need to outlive the call they are passed to.
//! - Callback `user_data` is opaque to the engine and passed back verbatim.

pub mod api;
pub mod codes;
pub mod types;

pub use api::{AnidbApi, SYMBOLS};
pub use codes::{
    CallbackKind, EventKind, HashAlgorithm, IdentificationSource, ResultCode, Status, UnknownEnumerant,
};
pub use types::*;

/// Layout/enumerant contract version, checked by `anidb_init`
pub const ANIDB_ABI_VERSION: u32 = 1;

/// Size of the buffer used to fetch a session's last error message
pub const LAST_ERROR_BUFFER_SIZE: usize = 1024;

/// Default file name of the engine library on this platform
#[cfg(target_os = "windows")]
pub const LIBRARY_FILE_NAME: &str = "anidb_client_core.dll";
#[cfg(target_os = "macos")]
pub const LIBRARY_FILE_NAME: &str = "libanidb_client_core.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const LIBRARY_FILE_NAME: &str = "libanidb_client_core.so";
