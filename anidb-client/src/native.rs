//! Native library loading and process-wide initialization
//!
//! A [`Library`] owns one bound [`AnidbApi`] table. The table only exists
//! after every symbol resolved, so no entry point can be reached before
//! loading succeeds. Sessions hold an `Arc<Library>`; the engine's
//! `anidb_cleanup` runs when the last of them is gone.

use std::ffi::{c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use anidb_abi::{AnidbApi, HashAlgorithm, ResultCode, ANIDB_ABI_VERSION, LIBRARY_FILE_NAME, SYMBOLS};

use crate::error::{AnidbError, ErrorKind, Result};
use crate::marshal::{read_hash_buffer, NativeText};

/// Environment variable naming the engine library to load
pub const LIBRARY_PATH_ENV: &str = "ANIDB_LIBRARY_PATH";

static GLOBAL: OnceCell<Arc<Library>> = OnceCell::new();

/// A loaded engine
pub struct Library {
    api: AnidbApi,
    origin: String,
    initialized: Mutex<bool>,
    outstanding: AtomicUsize,
    // Declared last: the code behind `api` must stay mapped until cleanup ran.
    _library: Option<libloading::Library>,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("origin", &self.origin)
            .field("initialized", &*self.initialized.lock())
            .field("outstanding", &self.outstanding_allocations())
            .finish()
    }
}

fn not_found(path: &Path, reason: impl Into<String>) -> AnidbError {
    AnidbError::LibraryNotFound {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// # Safety
/// `T` must be the function pointer type exported under `name`.
unsafe fn symbol<T: Copy>(library: &libloading::Library, name: &str, path: &Path) -> Result<T> {
    library
        .get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|err| not_found(path, format!("missing symbol {name}: {err}")))
}

macro_rules! bind_api {
    ($library:expr, $path:expr, { $($field:ident),+ $(,)? }) => {
        AnidbApi {
            $( $field: symbol($library, concat!("anidb_", stringify!($field)), $path)?, )+
        }
    };
}

impl Library {
    /// Load the engine from one file
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initializers; the engine has none with side effects.
        let library = unsafe { libloading::Library::new(path) }.map_err(|err| not_found(path, err.to_string()))?;

        let missing: Vec<&str> = SYMBOLS
            .iter()
            .copied()
            .filter(|name| unsafe { library.get::<*const c_void>(name.as_bytes()) }.is_err())
            .collect();
        if !missing.is_empty() {
            return Err(not_found(path, format!("missing symbols: {}", missing.join(", "))));
        }

        let api = unsafe {
            bind_api!(&library, path, {
                init,
                cleanup,
                get_version,
                get_abi_version,
                session_create,
                session_create_with_config,
                session_destroy,
                session_get_last_error,
                process_file,
                process_batch,
                hash_file,
                hash_buffer,
                cache_clear,
                cache_get_stats,
                cache_check_file,
                identify_file,
                free_string,
                free_file_result,
                free_batch_result,
                free_anime_info,
                register_callback,
                unregister_callback,
                event_connect,
                event_disconnect,
                event_poll,
                error_string,
                hash_algorithm_name,
                hash_buffer_size,
            })
        };

        debug!(path = %path.display(), "engine library loaded");
        Ok(Arc::new(Self::new(api, path.display().to_string(), Some(library))))
    }

    /// Find and load the engine
    ///
    /// Tries `$ANIDB_LIBRARY_PATH`, then the running executable's directory,
    /// then the platform file name through the system loader.
    pub fn locate() -> Result<Arc<Self>> {
        if let Some(path) = std::env::var_os(LIBRARY_PATH_ENV) {
            return Self::open(PathBuf::from(path));
        }

        let mut attempts = Vec::new();
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(LIBRARY_FILE_NAME)));
        if let Some(candidate) = beside_exe.filter(|candidate| candidate.is_file()) {
            match Self::open(&candidate) {
                Ok(library) => return Ok(library),
                Err(err) => attempts.push(err.to_string()),
            }
        }

        Self::open(LIBRARY_FILE_NAME).map_err(|err| {
            attempts.push(err.to_string());
            not_found(Path::new(LIBRARY_FILE_NAME), attempts.join("; "))
        })
    }

    /// Process-wide library, located once
    pub fn global() -> Result<Arc<Self>> {
        GLOBAL.get_or_try_init(Self::locate).cloned()
    }

    /// Bind an engine that is linked into this process
    pub fn from_api(api: AnidbApi) -> Arc<Self> {
        Arc::new(Self::new(api, "in-process".to_string(), None))
    }

    fn new(api: AnidbApi, origin: String, library: Option<libloading::Library>) -> Self {
        Self {
            api,
            origin,
            initialized: Mutex::new(false),
            outstanding: AtomicUsize::new(0),
            _library: library,
        }
    }

    pub fn api(&self) -> &AnidbApi {
        &self.api
    }

    /// Where the engine was loaded from
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Check ABI compatibility and call `anidb_init` once
    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        let mut initialized = self.initialized.lock();
        if *initialized {
            return Ok(());
        }

        let engine_abi = self.abi_version();
        if engine_abi != ANIDB_ABI_VERSION {
            return Err(version_mismatch(format!(
                "engine ABI {engine_abi}, binding ABI {ANIDB_ABI_VERSION}"
            )));
        }
        for algorithm in HashAlgorithm::ALL {
            let engine_size = unsafe { (self.api.hash_buffer_size)(algorithm.raw()) };
            if engine_size != algorithm.buffer_size() as u64 {
                return Err(version_mismatch(format!(
                    "{algorithm} buffer is {engine_size} bytes in the engine, {} in the binding",
                    algorithm.buffer_size()
                )));
            }
        }

        let code = unsafe { (self.api.init)(ANIDB_ABI_VERSION) };
        if code != ResultCode::Success.raw() {
            return Err(AnidbError::from_result(code, self.error_string(code), None));
        }
        *initialized = true;
        debug!(origin = %self.origin, abi = ANIDB_ABI_VERSION, "engine initialized");
        Ok(())
    }

    pub fn version(&self) -> Result<String> {
        let ptr = unsafe { (self.api.get_version)() };
        if ptr.is_null() {
            return Err(AnidbError::Decode("engine returned no version".into()));
        }
        unsafe { CStr::from_ptr(ptr) }
            .to_str()
            .map(str::to_string)
            .map_err(|err| AnidbError::InvalidTextEncoding(err.to_string()))
    }

    pub fn abi_version(&self) -> u32 {
        unsafe { (self.api.get_abi_version)() }
    }

    /// Engine's static description of a result code
    pub fn error_string(&self, code: i32) -> String {
        let ptr = unsafe { (self.api.error_string)(code) };
        if ptr.is_null() {
            return ErrorKind::from_code(code).to_string();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    pub fn algorithm_name(&self, algorithm: HashAlgorithm) -> Option<String> {
        let ptr = unsafe { (self.api.hash_algorithm_name)(algorithm.raw()) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    /// Hash a file; not tied to any session
    pub fn hash_file(&self, path: &Path, algorithm: HashAlgorithm) -> Result<String> {
        let text = NativeText::from_path(path)?;
        let mut buffer = vec![0u8; algorithm.buffer_size()];
        let code = unsafe {
            (self.api.hash_file)(
                text.as_ptr(),
                algorithm.raw(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u64,
            )
        };
        if code != ResultCode::Success.raw() {
            return Err(AnidbError::from_result(code, self.error_string(code), Some(path)));
        }
        read_hash_buffer(&buffer)
    }

    /// Hash an in-memory buffer; empty input is rejected locally
    pub fn hash_bytes(&self, data: &[u8], algorithm: HashAlgorithm) -> Result<String> {
        if data.is_empty() {
            return Err(AnidbError::validation("Data cannot be empty"));
        }
        let mut buffer = vec![0u8; algorithm.buffer_size()];
        let code = unsafe {
            (self.api.hash_buffer)(
                data.as_ptr(),
                data.len() as u64,
                algorithm.raw(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u64,
            )
        };
        if code != ResultCode::Success.raw() {
            return Err(AnidbError::from_result(code, self.error_string(code), None));
        }
        read_hash_buffer(&buffer)
    }

    /// Engine allocations adopted through this library and not yet released
    pub fn outstanding_allocations(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn allocation_adopted(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn allocation_released(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

fn version_mismatch(message: String) -> AnidbError {
    AnidbError::from_result(ResultCode::VersionMismatch.raw(), message, None)
}

impl Drop for Library {
    fn drop(&mut self) {
        if *self.initialized.get_mut() {
            unsafe { (self.api.cleanup)() };
            debug!(origin = %self.origin, "engine cleaned up");
        }
    }
}
