//! Conversions across the boundary
//!
//! Outbound values are built right before a call and borrowed for its
//! duration. Inbound structures are adopted as [`NativeAllocation`]s, copied
//! into owned Rust values, and released through their matching free
//! function exactly once.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use anidb_abi::{
    anidb_anime_info_t, anidb_batch_options_t, anidb_batch_result_t, anidb_config_t, anidb_file_result_t,
    anidb_process_options_t, AnidbApi, HashAlgorithm, IdentificationSource, Status,
};

use crate::callback::{completion_trampoline, progress_trampoline, Handlers};
use crate::error::{AnidbError, Result};
use crate::native::Library;
use crate::types::{AnimeInfo, BatchOptions, BatchResult, Config, FileResult, ProcessOptions};

/// NUL-terminated copy of a Rust string, owned for the duration of a call
#[derive(Debug, Clone)]
pub struct NativeText(CString);

impl NativeText {
    pub fn new(value: &str) -> Result<Self> {
        CString::new(value)
            .map(Self)
            .map_err(|_| AnidbError::InvalidTextEncoding(format!("interior NUL in {value:?}")))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let value = path
            .to_str()
            .ok_or_else(|| AnidbError::InvalidTextEncoding(format!("path is not UTF-8: {}", path.display())))?;
        Self::new(value)
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.0.as_ptr()
    }
}

fn optional_text(value: Option<&str>) -> Result<Option<NativeText>> {
    value.map(NativeText::new).transpose()
}

fn text_ptr(value: &Option<NativeText>) -> *const c_char {
    value.as_ref().map_or(ptr::null(), NativeText::as_ptr)
}

/// Engine-owned structure paired with its release function
pub trait NativeRelease {
    /// # Safety
    /// `ptr` must be a live allocation of this type produced by the engine behind `api`.
    unsafe fn release(api: &AnidbApi, ptr: *mut Self);
}

impl NativeRelease for anidb_file_result_t {
    unsafe fn release(api: &AnidbApi, ptr: *mut Self) {
        (api.free_file_result)(ptr)
    }
}

impl NativeRelease for anidb_batch_result_t {
    unsafe fn release(api: &AnidbApi, ptr: *mut Self) {
        (api.free_batch_result)(ptr)
    }
}

impl NativeRelease for anidb_anime_info_t {
    unsafe fn release(api: &AnidbApi, ptr: *mut Self) {
        (api.free_anime_info)(ptr)
    }
}

/// Owned pointer to an engine allocation
///
/// The pointer is nulled when released, so a second release is a no-op and
/// a read after release fails locally with [`AnidbError::AlreadyReleased`].
pub struct NativeAllocation<T: NativeRelease> {
    ptr: *mut T,
    library: Arc<Library>,
}

impl<T: NativeRelease> NativeAllocation<T> {
    /// Take ownership of an engine allocation; NULL yields `None`
    ///
    /// # Safety
    /// `ptr` must be NULL or a live allocation from `library`'s engine, not owned elsewhere.
    pub unsafe fn adopt(library: &Arc<Library>, ptr: *mut T) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        library.allocation_adopted();
        Some(Self {
            ptr,
            library: Arc::clone(library),
        })
    }

    pub fn get(&self) -> Result<&T> {
        // SAFETY: non-null means adopted and not yet released.
        unsafe { self.ptr.as_ref() }.ok_or(AnidbError::AlreadyReleased)
    }

    pub fn is_released(&self) -> bool {
        self.ptr.is_null()
    }

    /// Return the allocation to the engine; later calls do nothing
    pub fn release(&mut self) {
        let ptr = std::mem::replace(&mut self.ptr, ptr::null_mut());
        if !ptr.is_null() {
            unsafe { T::release(self.library.api(), ptr) };
            self.library.allocation_released();
        }
    }
}

impl<T: NativeRelease> Drop for NativeAllocation<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// # Safety
/// `ptr` must be NULL or a valid NUL-terminated string.
pub(crate) unsafe fn read_text(ptr: *const c_char) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|text| Some(text.to_string()))
        .map_err(|err| AnidbError::InvalidTextEncoding(err.to_string()))
}

/// Digest text from a fixed-size output buffer, up to the first NUL
pub(crate) fn read_hash_buffer(buffer: &[u8]) -> Result<String> {
    let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
    std::str::from_utf8(&buffer[..end])
        .map(str::to_string)
        .map_err(|err| AnidbError::InvalidTextEncoding(err.to_string()))
}

fn decode_status(raw: i32) -> Result<Status> {
    Status::try_from(raw).map_err(|err| AnidbError::Decode(err.to_string()))
}

/// # Safety
/// `raw` must be a fully initialized file result from the engine.
pub(crate) unsafe fn file_result(raw: &anidb_file_result_t) -> Result<FileResult> {
    let path = read_text(raw.file_path)?.unwrap_or_default();
    let mut hashes = BTreeMap::new();
    if !raw.hashes.is_null() {
        for entry in std::slice::from_raw_parts(raw.hashes, raw.hash_count as usize) {
            let algorithm =
                HashAlgorithm::try_from(entry.algorithm).map_err(|err| AnidbError::Decode(err.to_string()))?;
            let value = read_text(entry.hash_value)?.unwrap_or_default();
            hashes.insert(algorithm, value);
        }
    }
    Ok(FileResult {
        path: PathBuf::from(path),
        size: raw.file_size,
        status: decode_status(raw.status)?,
        hashes,
        processing_time_ms: raw.processing_time_ms,
        error: read_text(raw.error_message)?,
    })
}

/// Copy a file result out of the engine and release it, on every path
pub(crate) fn take_file_result(mut allocation: NativeAllocation<anidb_file_result_t>) -> Result<FileResult> {
    let result = allocation.get().and_then(|raw| unsafe { file_result(raw) });
    allocation.release();
    result
}

pub(crate) fn take_batch_result(mut allocation: NativeAllocation<anidb_batch_result_t>) -> Result<BatchResult> {
    let result = allocation.get().and_then(|raw| unsafe {
        let entries = if raw.results.is_null() {
            &[][..]
        } else {
            std::slice::from_raw_parts(raw.results, raw.total_files as usize)
        };
        Ok(BatchResult {
            results: entries
                .iter()
                .map(|entry| file_result(entry))
                .collect::<Result<Vec<_>>>()?,
            total_files: raw.total_files,
            successful_files: raw.successful_files,
            failed_files: raw.failed_files,
            total_time_ms: raw.total_time_ms,
        })
    });
    allocation.release();
    result
}

pub(crate) fn take_anime_info(mut allocation: NativeAllocation<anidb_anime_info_t>) -> Result<AnimeInfo> {
    let result = allocation.get().and_then(|raw| unsafe {
        Ok(AnimeInfo {
            anime_id: raw.anime_id,
            episode_id: raw.episode_id,
            title: read_text(raw.title)?.unwrap_or_default(),
            episode_number: raw.episode_number,
            confidence: raw.confidence,
            source: IdentificationSource::try_from(raw.source).map_err(|err| AnidbError::Decode(err.to_string()))?,
        })
    });
    allocation.release();
    result
}

/// `anidb_config_t` plus the strings it points into
pub(crate) struct RawConfig {
    cache_dir: NativeText,
    username: Option<NativeText>,
    password: Option<NativeText>,
    client_name: Option<NativeText>,
    client_version: Option<NativeText>,
    max_memory_usage: u64,
    chunk_size: u64,
    max_concurrent_files: u32,
    enable_debug_logging: bool,
}

impl RawConfig {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            cache_dir: NativeText::from_path(&config.cache_dir)?,
            username: optional_text(config.username.as_deref())?,
            password: optional_text(config.password.as_deref())?,
            client_name: optional_text(config.client_name.as_deref())?,
            client_version: optional_text(config.client_version.as_deref())?,
            max_memory_usage: config.max_memory_usage,
            chunk_size: config.chunk_size,
            max_concurrent_files: config.max_concurrent_files,
            enable_debug_logging: config.enable_debug_logging,
        })
    }

    /// Valid while `self` is borrowed
    pub fn as_raw(&self) -> anidb_config_t {
        anidb_config_t {
            cache_dir: self.cache_dir.as_ptr(),
            username: text_ptr(&self.username),
            password: text_ptr(&self.password),
            client_name: text_ptr(&self.client_name),
            client_version: text_ptr(&self.client_version),
            max_memory_usage: self.max_memory_usage,
            chunk_size: self.chunk_size,
            max_concurrent_files: self.max_concurrent_files,
            enable_debug_logging: u32::from(self.enable_debug_logging),
        }
    }
}

/// Per-call options with their algorithm array and callback context
pub(crate) struct RawProcessOptions {
    algorithms: Vec<i32>,
    handlers: Handlers,
    enable_progress: bool,
    verify_existing: bool,
}

impl RawProcessOptions {
    pub fn new(options: &ProcessOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            algorithms: options.algorithms.iter().map(|a| a.raw()).collect(),
            handlers: Handlers {
                progress: options.progress.clone(),
                ..Handlers::default()
            },
            enable_progress: options.enable_progress,
            verify_existing: options.verify_existing,
        })
    }

    /// Valid while `self` is borrowed
    pub fn as_raw(&self) -> anidb_process_options_t {
        anidb_process_options_t {
            algorithms: self.algorithms.as_ptr(),
            algorithm_count: self.algorithms.len() as u64,
            progress_callback: self.handlers.progress.as_ref().map(|_| progress_trampoline as _),
            user_data: self.handlers.as_context(),
            enable_progress: u32::from(self.enable_progress),
            verify_existing: u32::from(self.verify_existing),
        }
    }
}

pub(crate) struct RawBatchOptions {
    algorithms: Vec<i32>,
    handlers: Handlers,
    max_concurrent: u32,
    continue_on_error: bool,
    skip_existing: bool,
}

impl RawBatchOptions {
    pub fn new(options: &BatchOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            algorithms: options.algorithms.iter().map(|a| a.raw()).collect(),
            handlers: Handlers {
                progress: options.progress.clone(),
                completion: options.completion.clone(),
                ..Handlers::default()
            },
            max_concurrent: options.max_concurrent,
            continue_on_error: options.continue_on_error,
            skip_existing: options.skip_existing,
        })
    }

    /// Valid while `self` is borrowed
    pub fn as_raw(&self) -> anidb_batch_options_t {
        anidb_batch_options_t {
            algorithms: self.algorithms.as_ptr(),
            algorithm_count: self.algorithms.len() as u64,
            progress_callback: self.handlers.progress.as_ref().map(|_| progress_trampoline as _),
            completion_callback: self.handlers.completion.as_ref().map(|_| completion_trampoline as _),
            user_data: self.handlers.as_context(),
            max_concurrent: self.max_concurrent,
            continue_on_error: u32::from(self.continue_on_error),
            skip_existing: u32::from(self.skip_existing),
            _reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_rejects_interior_nul() {
        let err = NativeText::new("a\0b").unwrap_err();
        assert!(matches!(err, AnidbError::InvalidTextEncoding(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_path_must_be_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(OsStr::from_bytes(b"/tmp/\xff.mkv"));
        assert!(matches!(NativeText::from_path(path), Err(AnidbError::InvalidTextEncoding(_))));
    }

    #[test]
    fn test_hash_buffer_stops_at_nul() {
        assert_eq!(read_hash_buffer(b"abcd\0\0\0").unwrap(), "abcd");
        assert_eq!(read_hash_buffer(b"abcd").unwrap(), "abcd");
        assert!(read_hash_buffer(b"\xff\0").is_err());
    }

    #[test]
    fn test_config_pointers_follow_fields() {
        let config = Config {
            username: Some("user".into()),
            ..Config::default()
        };
        let raw = RawConfig::new(&config).unwrap();
        let view = raw.as_raw();
        assert!(!view.username.is_null());
        assert!(view.password.is_null());
        assert_eq!(unsafe { CStr::from_ptr(view.username) }.to_str().unwrap(), "user");
        assert_eq!(view.chunk_size, 65536);
    }

    static FREED: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    unsafe extern "C" fn count_free(_result: *mut anidb_file_result_t) {
        FREED.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn test_release_happens_once() {
        let mut api = anidb_mock::api();
        api.free_file_result = count_free;
        let library = Library::from_api(api);
        let mut raw: anidb_file_result_t = unsafe { std::mem::zeroed() };

        let mut allocation = unsafe { NativeAllocation::adopt(&library, &mut raw) }.unwrap();
        assert!(allocation.get().is_ok());
        assert_eq!(library.outstanding_allocations(), 1);

        allocation.release();
        allocation.release();
        assert_eq!(FREED.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(allocation.is_released());
        assert!(matches!(allocation.get(), Err(AnidbError::AlreadyReleased)));
        assert_eq!(library.outstanding_allocations(), 0);

        drop(allocation);
        assert_eq!(FREED.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(library.outstanding_allocations(), 0);
    }

    #[test]
    fn test_null_is_not_adopted() {
        let library = Library::from_api(anidb_mock::api());
        let allocation = unsafe { NativeAllocation::<anidb_file_result_t>::adopt(&library, ptr::null_mut()) };
        assert!(allocation.is_none());
        assert_eq!(library.outstanding_allocations(), 0);
    }

    #[test]
    fn test_options_without_callbacks_pass_null() {
        let raw = RawProcessOptions::new(&ProcessOptions::default()).unwrap();
        let view = raw.as_raw();
        assert!(view.progress_callback.is_none());
        assert_eq!(view.algorithm_count, 1);
        assert_eq!(unsafe { *view.algorithms }, HashAlgorithm::Ed2k.raw());
    }
}
