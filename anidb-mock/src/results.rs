//! Result allocation and release
//!
//! Every top-level pointer handed to a caller is recorded in a live set.
//! Release functions only free pointers found there; anything else (a
//! second free, or a pointer the engine never produced) is counted and
//! ignored so that tests can assert on it.

use std::collections::HashSet;
use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use anidb_abi::{
    anidb_anime_info_t, anidb_batch_result_t, anidb_file_result_t, anidb_hash_result_t, IdentificationSource, Status,
};

use crate::error::{ffi_guard, MockError};

static LIVE_ALLOCATIONS: Mutex<Option<HashSet<usize>>> = parking_lot::const_mutex(None);
static INVALID_FREES: AtomicUsize = AtomicUsize::new(0);
static CORRUPT_NEXT_RESULT: AtomicBool = AtomicBool::new(false);

fn track(ptr: usize) {
    LIVE_ALLOCATIONS.lock().get_or_insert_with(HashSet::new).insert(ptr);
}

fn untrack(ptr: usize) -> bool {
    let removed = LIVE_ALLOCATIONS
        .lock()
        .as_mut()
        .is_some_and(|live| live.remove(&ptr));
    if !removed {
        INVALID_FREES.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(ptr, "release of a pointer that is not live");
    }
    removed
}

/// Number of result pointers handed out and not yet released
pub fn live_allocations() -> usize {
    LIVE_ALLOCATIONS.lock().as_ref().map_or(0, HashSet::len)
}

/// Number of release calls that named an unknown or already released pointer
pub fn invalid_frees() -> usize {
    INVALID_FREES.load(Ordering::SeqCst)
}

/// Make the next published file result carry an unknown algorithm tag
pub fn corrupt_next_result() {
    CORRUPT_NEXT_RESULT.store(true, Ordering::SeqCst);
}

fn into_c_string(value: &str) -> *mut c_char {
    // Interior NULs never occur in paths or digests read back from C strings.
    CString::new(value).map_or(ptr::null_mut(), CString::into_raw)
}

unsafe fn free_c_string(value: *mut c_char) {
    if !value.is_null() {
        drop(CString::from_raw(value));
    }
}

/// Owned outcome of processing one file
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub status: Status,
    /// (raw algorithm, digest text)
    pub hashes: Vec<(i32, String)>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl FileRecord {
    pub fn failed(path: &str, err: &MockError, elapsed_ms: u64) -> Self {
        Self {
            path: path.to_string(),
            size: 0,
            status: Status::Failed,
            hashes: Vec::new(),
            error: Some(err.to_string()),
            elapsed_ms,
        }
    }

    fn into_raw(mut self) -> anidb_file_result_t {
        if !self.hashes.is_empty() && CORRUPT_NEXT_RESULT.swap(false, Ordering::SeqCst) {
            if let Some(last) = self.hashes.last_mut() {
                last.0 = 0;
            }
        }

        let hashes: Box<[anidb_hash_result_t]> = self
            .hashes
            .iter()
            .map(|(algorithm, value)| anidb_hash_result_t {
                hash_value: into_c_string(value),
                hash_length: value.len() as u64,
                algorithm: *algorithm,
                _reserved: 0,
            })
            .collect();
        let hash_count = hashes.len() as u64;
        let hashes = if hash_count == 0 {
            ptr::null_mut()
        } else {
            Box::into_raw(hashes) as *mut anidb_hash_result_t
        };

        anidb_file_result_t {
            file_path: into_c_string(&self.path),
            hashes,
            error_message: self.error.as_deref().map_or(ptr::null_mut(), into_c_string),
            file_size: self.size,
            hash_count,
            processing_time_ms: self.elapsed_ms,
            status: self.status.raw(),
            _reserved: 0,
        }
    }
}

/// # Safety
/// `result` must have been produced by [`FileRecord::into_raw`].
unsafe fn free_file_fields(result: &mut anidb_file_result_t) {
    free_c_string(result.file_path);
    free_c_string(result.error_message);
    if !result.hashes.is_null() {
        let hashes = Box::from_raw(ptr::slice_from_raw_parts_mut(result.hashes, result.hash_count as usize));
        for hash in hashes.iter() {
            free_c_string(hash.hash_value);
        }
    }
    result.file_path = ptr::null_mut();
    result.error_message = ptr::null_mut();
    result.hashes = ptr::null_mut();
}

pub fn publish_file(record: FileRecord) -> *mut anidb_file_result_t {
    let raw = Box::into_raw(Box::new(record.into_raw()));
    track(raw as usize);
    raw
}

pub fn publish_batch(records: Vec<FileRecord>, elapsed_ms: u64) -> *mut anidb_batch_result_t {
    let successful = records.iter().filter(|r| r.status == Status::Completed).count() as u64;
    let total = records.len() as u64;
    let results: Box<[anidb_file_result_t]> = records.into_iter().map(FileRecord::into_raw).collect();
    let results = if total == 0 {
        ptr::null_mut()
    } else {
        Box::into_raw(results) as *mut anidb_file_result_t
    };

    let raw = Box::into_raw(Box::new(anidb_batch_result_t {
        results,
        total_files: total,
        successful_files: successful,
        failed_files: total - successful,
        total_time_ms: elapsed_ms,
    }));
    track(raw as usize);
    raw
}

/// Owned identification record
#[derive(Debug, Clone, PartialEq)]
pub struct AnimeRecord {
    pub anime_id: u64,
    pub episode_id: u64,
    pub title: String,
    pub episode_number: u32,
    pub confidence: f64,
}

pub fn publish_anime(record: &AnimeRecord, source: IdentificationSource) -> *mut anidb_anime_info_t {
    let raw = Box::into_raw(Box::new(anidb_anime_info_t {
        title: into_c_string(&record.title),
        anime_id: record.anime_id,
        episode_id: record.episode_id,
        confidence: record.confidence,
        episode_number: record.episode_number,
        source: source.raw(),
    }));
    track(raw as usize);
    raw
}

/// Free a string allocated by the engine
///
/// # Safety
/// - `value` must be NULL or a string returned by this engine
#[no_mangle]
pub unsafe extern "C" fn anidb_free_string(value: *mut c_char) {
    ffi_guard!(void {
        if !value.is_null() && untrack(value as usize) {
            free_c_string(value);
        }
    })
}

/// Free a file result
///
/// # Safety
/// - `result` must be NULL or a pointer returned by `anidb_process_file`
#[no_mangle]
pub unsafe extern "C" fn anidb_free_file_result(result: *mut anidb_file_result_t) {
    ffi_guard!(void {
        if !result.is_null() && untrack(result as usize) {
            let mut result = Box::from_raw(result);
            free_file_fields(&mut result);
        }
    })
}

/// Free a batch result and every file result inside it
///
/// # Safety
/// - `result` must be NULL or a pointer returned by `anidb_process_batch`
#[no_mangle]
pub unsafe extern "C" fn anidb_free_batch_result(result: *mut anidb_batch_result_t) {
    ffi_guard!(void {
        if !result.is_null() && untrack(result as usize) {
            let batch = Box::from_raw(result);
            if !batch.results.is_null() {
                let mut entries =
                    Box::from_raw(ptr::slice_from_raw_parts_mut(batch.results, batch.total_files as usize));
                for entry in entries.iter_mut() {
                    free_file_fields(entry);
                }
            }
        }
    })
}

/// Free an identification record
///
/// # Safety
/// - `info` must be NULL or a pointer returned by `anidb_identify_file`
#[no_mangle]
pub unsafe extern "C" fn anidb_free_anime_info(info: *mut anidb_anime_info_t) {
    ffi_guard!(void {
        if !info.is_null() && untrack(info as usize) {
            let info = Box::from_raw(info);
            free_c_string(info.title);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    fn record(path: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size: 3,
            status: Status::Completed,
            hashes: vec![(1, "00112233445566778899aabbccddeeff".to_string())],
            error: None,
            elapsed_ms: 1,
        }
    }

    #[test]
    fn test_file_result_roundtrip() {
        let raw = publish_file(record("a.mkv"));
        unsafe {
            assert_eq!(CStr::from_ptr((*raw).file_path).to_str().unwrap(), "a.mkv");
            assert_eq!((*raw).hash_count, 1);
            assert_eq!((*(*raw).hashes).hash_length, 32);
            assert!((*raw).error_message.is_null());
            anidb_free_file_result(raw);
        }
    }

    #[test]
    fn test_double_free_is_counted_not_executed() {
        let raw = publish_file(record("b.mkv"));
        let before = invalid_frees();
        unsafe {
            anidb_free_file_result(raw);
            anidb_free_file_result(raw);
        }
        assert!(invalid_frees() > before);
    }

    #[test]
    fn test_batch_counts() {
        let failed = FileRecord::failed("missing.bin", &MockError::FileNotFound("missing.bin".into()), 0);
        let raw = publish_batch(vec![record("present.bin"), failed], 5);
        unsafe {
            assert_eq!((*raw).total_files, 2);
            assert_eq!((*raw).successful_files, 1);
            assert_eq!((*raw).failed_files, 1);
            let second = &*(*raw).results.add(1);
            assert_eq!(second.hash_count, 0);
            assert!(second.hashes.is_null());
            assert!(!second.error_message.is_null());
            anidb_free_batch_result(raw);
        }
    }
}
