//! C-compatible type definitions
//!
//! Pointer and 64-bit fields come first in every struct; trailing 32-bit
//! fields are paired, with an explicit `_reserved` word where a pair would
//! otherwise be incomplete. No struct relies on compiler-inserted padding.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_void};
use std::ptr;

/// Raw result code (`ResultCode` on the Rust side)
pub type anidb_result_t = i32;

/// Opaque handle for an engine session
#[repr(C)]
pub struct anidb_session_t {
    _private: [u8; 0],
}

/// Progress: percentage in 0..=100, bytes processed, total bytes
pub type anidb_progress_callback_t =
    unsafe extern "C" fn(percentage: f32, bytes_processed: u64, total_bytes: u64, user_data: *mut c_void);

/// Error: code, message, file path (may be NULL)
pub type anidb_error_callback_t = unsafe extern "C" fn(
    error_code: anidb_result_t,
    error_message: *const c_char,
    file_path: *const c_char,
    user_data: *mut c_void,
);

/// Completion: result code of the finished operation
pub type anidb_completion_callback_t = unsafe extern "C" fn(result: anidb_result_t, user_data: *mut c_void);

/// Event: pointer to a tagged event, NULL must be tolerated
pub type anidb_event_callback_t = unsafe extern "C" fn(event: *const anidb_event_t, user_data: *mut c_void);

/// Session configuration
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_config_t {
    pub cache_dir: *const c_char,
    pub username: *const c_char,
    pub password: *const c_char,
    pub client_name: *const c_char,
    pub client_version: *const c_char,
    /// 0 selects the engine default
    pub max_memory_usage: u64,
    pub chunk_size: u64,
    pub max_concurrent_files: u32,
    pub enable_debug_logging: u32,
}

impl Default for anidb_config_t {
    fn default() -> Self {
        Self {
            cache_dir: ptr::null(),
            username: ptr::null(),
            password: ptr::null(),
            client_name: ptr::null(),
            client_version: ptr::null(),
            max_memory_usage: 0,
            chunk_size: 64 * 1024,
            max_concurrent_files: 4,
            enable_debug_logging: 0,
        }
    }
}

/// Options for `anidb_process_file`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_process_options_t {
    /// Array of raw `HashAlgorithm` values
    pub algorithms: *const i32,
    pub algorithm_count: u64,
    pub progress_callback: Option<anidb_progress_callback_t>,
    pub user_data: *mut c_void,
    pub enable_progress: u32,
    pub verify_existing: u32,
}

/// Options for `anidb_process_batch`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_batch_options_t {
    pub algorithms: *const i32,
    pub algorithm_count: u64,
    pub progress_callback: Option<anidb_progress_callback_t>,
    pub completion_callback: Option<anidb_completion_callback_t>,
    pub user_data: *mut c_void,
    pub max_concurrent: u32,
    pub continue_on_error: u32,
    pub skip_existing: u32,
    pub _reserved: u32,
}

/// One digest inside a file result
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_hash_result_t {
    pub hash_value: *mut c_char,
    pub hash_length: u64,
    pub algorithm: i32,
    pub _reserved: u32,
}

/// Result of processing one file, released with `anidb_free_file_result`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_file_result_t {
    pub file_path: *mut c_char,
    pub hashes: *mut anidb_hash_result_t,
    /// NULL when processing succeeded
    pub error_message: *mut c_char,
    pub file_size: u64,
    pub hash_count: u64,
    pub processing_time_ms: u64,
    pub status: i32,
    pub _reserved: u32,
}

/// Result of a batch, released with `anidb_free_batch_result`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_batch_result_t {
    /// `total_files` entries
    pub results: *mut anidb_file_result_t,
    pub total_files: u64,
    pub successful_files: u64,
    pub failed_files: u64,
    pub total_time_ms: u64,
}

/// Identification record, released with `anidb_free_anime_info`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_anime_info_t {
    pub title: *mut c_char,
    pub anime_id: u64,
    pub episode_id: u64,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub episode_number: u32,
    pub source: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_file_event_t {
    pub file_path: *const c_char,
    pub file_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_hash_event_t {
    /// NULL on HASH_START
    pub hash_value: *const c_char,
    pub algorithm: i32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_cache_event_t {
    pub file_path: *const c_char,
    pub algorithm: i32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_network_event_t {
    pub endpoint: *const c_char,
    pub status_code: i32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct anidb_memory_event_t {
    pub current_usage: u64,
    pub max_usage: u64,
}

/// Event payload; the member to read is selected by `anidb_event_t::event_type`
#[repr(C)]
#[derive(Clone, Copy)]
pub union anidb_event_data_t {
    pub file: anidb_file_event_t,
    pub hash: anidb_hash_event_t,
    pub cache: anidb_cache_event_t,
    pub network: anidb_network_event_t,
    pub memory: anidb_memory_event_t,
}

/// Tagged event
#[repr(C)]
#[derive(Clone, Copy)]
pub struct anidb_event_t {
    /// Raw `EventKind`
    pub event_type: i32,
    pub _reserved: u32,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub data: anidb_event_data_t,
    /// Free-text context, may be NULL
    pub context: *const c_char,
}

impl Default for anidb_event_t {
    fn default() -> Self {
        Self {
            event_type: 0,
            _reserved: 0,
            timestamp_ms: 0,
            data: anidb_event_data_t {
                memory: anidb_memory_event_t {
                    current_usage: 0,
                    max_usage: 0,
                },
            },
            context: ptr::null(),
        }
    }
}

impl std::fmt::Debug for anidb_event_t {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The union is deliberately not printed: reading it requires the tag.
        f.debug_struct("anidb_event_t")
            .field("event_type", &self.event_type)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
