//! Safe bindings to the anidb engine
//!
//! Loads the native hashing/identification engine, checks ABI compatibility
//! once per library, and exposes sessions whose results are plain owned
//! Rust values.
//!
//! ## Guarantees
//!
//! - Every engine allocation is released exactly once, on success and failure
//! - Closures registered with the engine outlive every invocation of them
//! - Panics in caller closures never unwind into the engine
//! - Operations on a closed session fail locally without reaching the engine
//!
//! ```no_run
//! use anidb_client::{HashAlgorithm, ProcessOptions, Session};
//!
//! let session = Session::open(None)?;
//! let options = ProcessOptions::with_algorithms([HashAlgorithm::Ed2k, HashAlgorithm::Crc32]);
//! let result = session.process_file("episode01.mkv", Some(&options))?;
//! println!("{:?}", result.hash(HashAlgorithm::Ed2k));
//! # Ok::<(), anidb_client::AnidbError>(())
//! ```

mod callback;
mod error;
mod event;
mod marshal;
mod native;
mod session;
mod types;

pub use anidb_abi::{CallbackKind, EventKind, HashAlgorithm, IdentificationSource, Status, ANIDB_ABI_VERSION};
pub use callback::{
    Callback, CompletionCallback, ErrorCallback, ErrorNotice, EventCallback, Progress, ProgressCallback,
};
pub use error::{AnidbError, ErrorKind, Result};
pub use event::{decode as decode_event, Event, EventPayload};
pub use marshal::{NativeAllocation, NativeRelease, NativeText};
pub use native::{Library, LIBRARY_PATH_ENV};
pub use session::Session;
pub use types::{AnimeInfo, BatchOptions, BatchResult, CacheStats, Config, FileResult, ProcessOptions};
