//! In-process anidb engine
//!
//! Exports the complete anidb C ABI with real ownership semantics: results
//! are heap allocated and must be released through the matching free
//! function, callbacks are invoked from worker threads, and events are
//! queued for polling or pushed to a connected stream. Hashing and
//! identification are simulated.
//!
//! ## Safety
//!
//! - Every exported function validates its pointers before use
//! - Panics never cross the C boundary
//! - Result pointers are tracked; invalid frees are counted, not executed

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use anidb_abi::{anidb_result_t, AnidbApi, HashAlgorithm, ResultCode, ANIDB_ABI_VERSION};

mod error;
mod event;
mod identify;
mod process;
mod results;
mod session;

pub use error::MockError;
pub use event::{
    anidb_event_connect, anidb_event_disconnect, anidb_event_poll, anidb_register_callback, anidb_unregister_callback,
    emit_memory_warning, emit_raw_event, is_event_stream_connected, registered_callbacks,
};
pub use identify::{anidb_identify_file, seed_identification};
pub use process::{anidb_hash_buffer, anidb_hash_file, anidb_process_batch, anidb_process_file};
pub use results::{
    anidb_free_anime_info, anidb_free_batch_result, anidb_free_file_result, anidb_free_string, corrupt_next_result,
    invalid_frees, live_allocations, AnimeRecord,
};
pub use session::{
    anidb_cache_check_file, anidb_cache_clear, anidb_cache_get_stats, anidb_session_create,
    anidb_session_create_with_config, anidb_session_destroy, anidb_session_get_last_error, live_sessions,
    set_network_available,
};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

static INIT_COUNT: AtomicU32 = AtomicU32::new(0);

pub(crate) fn is_initialized() -> bool {
    INIT_COUNT.load(Ordering::SeqCst) > 0
}

/// Initialize the engine for a caller built against `abi_version`
///
/// Reference counted; each successful call must be paired with
/// `anidb_cleanup`.
///
/// # Safety
/// Always safe to call.
#[no_mangle]
pub unsafe extern "C" fn anidb_init(abi_version: u32) -> anidb_result_t {
    error::ffi_guard!({
        if abi_version != ANIDB_ABI_VERSION {
            let err = MockError::VersionMismatch {
                engine: ANIDB_ABI_VERSION,
                caller: abi_version,
            };
            tracing::warn!(error = %err, "init rejected");
            return (&err).into();
        }
        let previous = INIT_COUNT.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(references = previous + 1, "engine initialized");
        ResultCode::Success.raw()
    })
}

/// Release one `anidb_init` reference
///
/// # Safety
/// Sessions must not be created after the last reference is released.
#[no_mangle]
pub unsafe extern "C" fn anidb_cleanup() {
    error::ffi_guard!(void {
        let _ = INIT_COUNT.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    })
}

/// Engine version string (static, not freed)
#[no_mangle]
pub extern "C" fn anidb_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn anidb_get_abi_version() -> u32 {
    ANIDB_ABI_VERSION
}

fn static_texts<K: Ord + Copy>(
    cell: &'static OnceLock<BTreeMap<K, CString>>,
    entries: impl Iterator<Item = (K, &'static str)>,
) -> &'static BTreeMap<K, CString> {
    cell.get_or_init(|| {
        entries
            .filter_map(|(key, text)| CString::new(text).ok().map(|text| (key, text)))
            .collect()
    })
}

/// Static description of a result code; unknown codes describe UNKNOWN
#[no_mangle]
pub extern "C" fn anidb_error_string(code: anidb_result_t) -> *const c_char {
    static TEXTS: OnceLock<BTreeMap<i32, CString>> = OnceLock::new();
    let texts = static_texts(
        &TEXTS,
        ResultCode::ALL.iter().map(|code| (code.raw(), code.description())),
    );
    let code = ResultCode::try_from(code).unwrap_or(ResultCode::Unknown);
    texts.get(&code.raw()).map_or(ptr::null(), |text| text.as_ptr())
}

/// Static algorithm name, NULL for an unknown algorithm
#[no_mangle]
pub extern "C" fn anidb_hash_algorithm_name(algorithm: i32) -> *const c_char {
    static NAMES: OnceLock<BTreeMap<i32, CString>> = OnceLock::new();
    let names = static_texts(
        &NAMES,
        HashAlgorithm::ALL.iter().map(|algorithm| (algorithm.raw(), algorithm.name())),
    );
    names.get(&algorithm).map_or(ptr::null(), |name| name.as_ptr())
}

/// Buffer size for a digest, terminator included; 0 for an unknown algorithm
#[no_mangle]
pub extern "C" fn anidb_hash_buffer_size(algorithm: i32) -> u64 {
    HashAlgorithm::try_from(algorithm).map_or(0, |algorithm| algorithm.buffer_size() as u64)
}

/// Binding table pointing at this engine's exports
pub fn api() -> AnidbApi {
    AnidbApi {
        init: anidb_init,
        cleanup: anidb_cleanup,
        get_version: anidb_get_version,
        get_abi_version: anidb_get_abi_version,
        session_create: anidb_session_create,
        session_create_with_config: anidb_session_create_with_config,
        session_destroy: anidb_session_destroy,
        session_get_last_error: anidb_session_get_last_error,
        process_file: anidb_process_file,
        process_batch: anidb_process_batch,
        hash_file: anidb_hash_file,
        hash_buffer: anidb_hash_buffer,
        cache_clear: anidb_cache_clear,
        cache_get_stats: anidb_cache_get_stats,
        cache_check_file: anidb_cache_check_file,
        identify_file: anidb_identify_file,
        free_string: anidb_free_string,
        free_file_result: anidb_free_file_result,
        free_batch_result: anidb_free_batch_result,
        free_anime_info: anidb_free_anime_info,
        register_callback: anidb_register_callback,
        unregister_callback: anidb_unregister_callback,
        event_connect: anidb_event_connect,
        event_disconnect: anidb_event_disconnect,
        event_poll: anidb_event_poll,
        error_string: anidb_error_string,
        hash_algorithm_name: anidb_hash_algorithm_name,
        hash_buffer_size: anidb_hash_buffer_size,
    }
}
