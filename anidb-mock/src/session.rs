//! Session FFI implementation
//!
//! Sessions are reference counted. The raw handle given to the caller is one
//! leaked `Arc`; the registry holds another so that lookups can validate a
//! handle and keep the state alive for the duration of a call even if
//! another thread destroys it concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use anidb_abi::{anidb_config_t, anidb_result_t, anidb_session_t, HashAlgorithm, ResultCode};

use crate::error::{ffi_guard, MockError, MockResult};
use crate::event::{CallbackTable, EventHub};

/// Owned copy of `anidb_config_t`
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_dir: Option<String>,
    pub username: Option<String>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub max_memory_usage: u64,
    pub chunk_size: u64,
    pub max_concurrent_files: u32,
    pub debug_logging: bool,
    has_password: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            username: None,
            client_name: None,
            client_version: None,
            max_memory_usage: 0,
            chunk_size: 64 * 1024,
            max_concurrent_files: 4,
            debug_logging: false,
            has_password: false,
        }
    }
}

impl EngineConfig {
    /// # Safety
    /// Every non-null string in `raw` must be a valid NUL-terminated string.
    unsafe fn from_raw(raw: &anidb_config_t) -> MockResult<Self> {
        if raw.chunk_size == 0 || raw.max_concurrent_files == 0 {
            return Err(MockError::invalid("chunk_size and max_concurrent_files must be non-zero"));
        }
        Ok(Self {
            cache_dir: read_opt_str(raw.cache_dir)?.map(str::to_string),
            username: read_opt_str(raw.username)?.map(str::to_string),
            client_name: read_opt_str(raw.client_name)?.map(str::to_string),
            client_version: read_opt_str(raw.client_version)?.map(str::to_string),
            max_memory_usage: raw.max_memory_usage,
            chunk_size: raw.chunk_size,
            max_concurrent_files: raw.max_concurrent_files,
            debug_logging: raw.enable_debug_logging != 0,
            has_password: !raw.password.is_null(),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.has_password
    }
}

/// Internal session state
pub struct SessionState {
    pub config: EngineConfig,
    last_error: Mutex<Option<String>>,
    /// (path, algorithm) -> digest
    pub cache: Mutex<HashMap<(String, HashAlgorithm), String>>,
    /// (hash, size) pairs already answered by the remote database
    pub identified: Mutex<HashSet<(String, u64)>>,
    pub network_available: AtomicBool,
    pub callbacks: CallbackTable,
    pub events: EventHub,
}

impl SessionState {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            last_error: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            identified: Mutex::new(HashSet::new()),
            network_available: AtomicBool::new(true),
            callbacks: CallbackTable::default(),
            events: EventHub::default(),
        }
    }

    pub fn set_last_error(&self, err: &MockError) {
        if self.config.debug_logging {
            tracing::debug!(error = %err, "session call failed");
        }
        *self.last_error.lock() = Some(err.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

static SESSIONS: Mutex<BTreeMap<usize, Arc<SessionState>>> = parking_lot::const_mutex(BTreeMap::new());

/// Resolve a handle to its live session
pub fn lookup(handle: *mut anidb_session_t) -> MockResult<Arc<SessionState>> {
    if handle.is_null() {
        return Err(MockError::InvalidHandle);
    }
    SESSIONS
        .lock()
        .get(&(handle as usize))
        .cloned()
        .ok_or(MockError::InvalidHandle)
}

/// Number of sessions not yet destroyed
pub fn live_sessions() -> usize {
    SESSIONS.lock().len()
}

/// Run `f` against a session, recording its error as the session's last error
pub fn session_call(
    handle: *mut anidb_session_t,
    f: impl FnOnce(&SessionState) -> MockResult<()>,
) -> anidb_result_t {
    let session = match lookup(handle) {
        Ok(session) => session,
        Err(err) => return (&err).into(),
    };
    match f(&session) {
        Ok(()) => ResultCode::Success.raw(),
        Err(err) => {
            session.set_last_error(&err);
            (&err).into()
        }
    }
}

/// Read a required C string
///
/// # Safety
/// `ptr` must be NULL or a valid NUL-terminated string outliving `'a`.
pub unsafe fn read_str<'a>(ptr: *const c_char, what: &str) -> MockResult<&'a str> {
    if ptr.is_null() {
        return Err(MockError::invalid(format!("{what} is NULL")));
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| MockError::InvalidUtf8)
}

/// # Safety
/// Same as [`read_str`].
pub unsafe fn read_opt_str<'a>(ptr: *const c_char) -> MockResult<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr).to_str().map(Some).map_err(|_| MockError::InvalidUtf8)
}

/// Copy `text` into a caller buffer, truncating to fit
///
/// # Safety
/// `buffer` must be valid for `size` bytes.
pub unsafe fn write_truncated(text: &str, buffer: *mut c_char, size: u64) -> MockResult<()> {
    if buffer.is_null() || size == 0 {
        return Err(MockError::invalid("output buffer is empty"));
    }
    let mut len = text.len().min(size as usize - 1);
    while !text.is_char_boundary(len) {
        len -= 1;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), buffer as *mut u8, len);
    *buffer.add(len) = 0;
    Ok(())
}

fn create(config: EngineConfig, out_handle: *mut *mut anidb_session_t) -> MockResult<()> {
    if out_handle.is_null() {
        return Err(MockError::invalid("out_handle is NULL"));
    }
    if !crate::is_initialized() {
        return Err(MockError::NotInitialized);
    }

    let state = Arc::new(SessionState::new(config));
    let raw = Arc::into_raw(Arc::clone(&state)) as *mut anidb_session_t;
    SESSIONS.lock().insert(raw as usize, state);
    unsafe { *out_handle = raw };

    tracing::debug!(handle = raw as usize, "session created");
    Ok(())
}

/// Create a session with the default configuration
///
/// # Safety
/// - `out_handle` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_session_create(out_handle: *mut *mut anidb_session_t) -> anidb_result_t {
    ffi_guard!({
        match create(EngineConfig::default(), out_handle) {
            Ok(()) => ResultCode::Success.raw(),
            Err(err) => (&err).into(),
        }
    })
}

/// Create a session with an explicit configuration
///
/// # Safety
/// - `config` must be a valid pointer
/// - `out_handle` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_session_create_with_config(
    config: *const anidb_config_t,
    out_handle: *mut *mut anidb_session_t,
) -> anidb_result_t {
    ffi_guard!({
        if config.is_null() {
            return ResultCode::InvalidParameter.raw();
        }
        let result = EngineConfig::from_raw(&*config).and_then(|config| create(config, out_handle));
        match result {
            Ok(()) => ResultCode::Success.raw(),
            Err(err) => (&err).into(),
        }
    })
}

/// Destroy a session
///
/// # Safety
/// - `handle` must be a pointer created by `anidb_session_create*` or NULL
#[no_mangle]
pub unsafe extern "C" fn anidb_session_destroy(handle: *mut anidb_session_t) -> anidb_result_t {
    ffi_guard!({
        if handle.is_null() {
            return ResultCode::InvalidHandle.raw();
        }
        let Some(state) = SESSIONS.lock().remove(&(handle as usize)) else {
            return ResultCode::InvalidHandle.raw();
        };

        state.events.disconnect();
        state.callbacks.clear();
        drop(Arc::from_raw(handle as *const SessionState));

        tracing::debug!(handle = handle as usize, "session destroyed");
        ResultCode::Success.raw()
    })
}

/// Copy the session's last error message into `buffer`
///
/// # Safety
/// - `buffer` must be valid for `buffer_size` bytes
#[no_mangle]
pub unsafe extern "C" fn anidb_session_get_last_error(
    handle: *mut anidb_session_t,
    buffer: *mut c_char,
    buffer_size: u64,
) -> anidb_result_t {
    ffi_guard!({
        let session = match lookup(handle) {
            Ok(session) => session,
            Err(err) => return (&err).into(),
        };
        let message = session.last_error().unwrap_or_default();
        match write_truncated(&message, buffer, buffer_size) {
            Ok(()) => ResultCode::Success.raw(),
            Err(err) => (&err).into(),
        }
    })
}

/// Clear the session's hash cache
///
/// # Safety
/// - `handle` must be a valid session handle
#[no_mangle]
pub unsafe extern "C" fn anidb_cache_clear(handle: *mut anidb_session_t) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            let removed = {
                let mut cache = session.cache.lock();
                let removed = cache.len();
                cache.clear();
                removed
            };
            tracing::debug!(removed, "cache cleared");
            Ok(())
        })
    })
}

/// Report cache entry count and the bytes held by cached digests
///
/// # Safety
/// - `out_entries` and `out_bytes` must be valid pointers for output
#[no_mangle]
pub unsafe extern "C" fn anidb_cache_get_stats(
    handle: *mut anidb_session_t,
    out_entries: *mut u64,
    out_bytes: *mut u64,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if out_entries.is_null() || out_bytes.is_null() {
                return Err(MockError::invalid("output pointer is NULL"));
            }
            let cache = session.cache.lock();
            let bytes: usize = cache.iter().map(|((path, _), digest)| path.len() + digest.len()).sum();
            *out_entries = cache.len() as u64;
            *out_bytes = bytes as u64;
            Ok(())
        })
    })
}

/// Check whether a digest for `file_path` is cached
///
/// # Safety
/// - `file_path` must be a valid NUL-terminated string
/// - `out_cached` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_cache_check_file(
    handle: *mut anidb_session_t,
    file_path: *const c_char,
    algorithm: i32,
    out_cached: *mut u32,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if out_cached.is_null() {
                return Err(MockError::invalid("out_cached is NULL"));
            }
            let path = read_str(file_path, "file_path")?;
            let algorithm =
                HashAlgorithm::try_from(algorithm).map_err(|err| MockError::invalid(err.to_string()))?;
            let cached = session.cache.lock().contains_key(&(path.to_string(), algorithm));
            *out_cached = u32::from(cached);
            Ok(())
        })
    })
}

/// Simulate losing (or regaining) network access for one session
pub fn set_network_available(handle: *mut anidb_session_t, available: bool) -> bool {
    match lookup(handle) {
        Ok(session) => {
            session.network_available.store(available, Ordering::SeqCst);
            true
        }
        Err(_) => false,
    }
}
