//! Entry-point signatures and the binding table
//!
//! `AnidbApi` holds one typed pointer per exported function. A dynamically
//! loaded engine fills it by symbol name (`SYMBOLS` lists them in field
//! order); an engine linked into the process fills it directly.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_void};

use crate::types::*;

// Lifecycle
pub type anidb_init_fn = unsafe extern "C" fn(abi_version: u32) -> anidb_result_t;
pub type anidb_cleanup_fn = unsafe extern "C" fn();
pub type anidb_get_version_fn = unsafe extern "C" fn() -> *const c_char;
pub type anidb_get_abi_version_fn = unsafe extern "C" fn() -> u32;

// Sessions
pub type anidb_session_create_fn = unsafe extern "C" fn(out_handle: *mut *mut anidb_session_t) -> anidb_result_t;
pub type anidb_session_create_with_config_fn = unsafe extern "C" fn(
    config: *const anidb_config_t,
    out_handle: *mut *mut anidb_session_t,
) -> anidb_result_t;
pub type anidb_session_destroy_fn = unsafe extern "C" fn(handle: *mut anidb_session_t) -> anidb_result_t;
pub type anidb_session_get_last_error_fn =
    unsafe extern "C" fn(handle: *mut anidb_session_t, buffer: *mut c_char, buffer_size: u64) -> anidb_result_t;

// Processing
pub type anidb_process_file_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    file_path: *const c_char,
    options: *const anidb_process_options_t,
    out_result: *mut *mut anidb_file_result_t,
) -> anidb_result_t;
pub type anidb_process_batch_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    file_paths: *const *const c_char,
    file_count: u64,
    options: *const anidb_batch_options_t,
    out_result: *mut *mut anidb_batch_result_t,
) -> anidb_result_t;

// Hashing
pub type anidb_hash_file_fn = unsafe extern "C" fn(
    file_path: *const c_char,
    algorithm: i32,
    buffer: *mut c_char,
    buffer_size: u64,
) -> anidb_result_t;
pub type anidb_hash_buffer_fn = unsafe extern "C" fn(
    data: *const u8,
    data_len: u64,
    algorithm: i32,
    buffer: *mut c_char,
    buffer_size: u64,
) -> anidb_result_t;

// Cache
pub type anidb_cache_clear_fn = unsafe extern "C" fn(handle: *mut anidb_session_t) -> anidb_result_t;
pub type anidb_cache_get_stats_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    out_entries: *mut u64,
    out_bytes: *mut u64,
) -> anidb_result_t;
pub type anidb_cache_check_file_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    file_path: *const c_char,
    algorithm: i32,
    out_cached: *mut u32,
) -> anidb_result_t;

// Identification
pub type anidb_identify_file_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    ed2k_hash: *const c_char,
    file_size: u64,
    out_info: *mut *mut anidb_anime_info_t,
) -> anidb_result_t;

// Release
pub type anidb_free_string_fn = unsafe extern "C" fn(value: *mut c_char);
pub type anidb_free_file_result_fn = unsafe extern "C" fn(result: *mut anidb_file_result_t);
pub type anidb_free_batch_result_fn = unsafe extern "C" fn(result: *mut anidb_batch_result_t);
pub type anidb_free_anime_info_fn = unsafe extern "C" fn(info: *mut anidb_anime_info_t);

// Callbacks and events
pub type anidb_register_callback_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    kind: i32,
    callback: *const c_void,
    user_data: *mut c_void,
    out_id: *mut u64,
) -> anidb_result_t;
pub type anidb_unregister_callback_fn =
    unsafe extern "C" fn(handle: *mut anidb_session_t, callback_id: u64) -> anidb_result_t;
pub type anidb_event_connect_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    callback: anidb_event_callback_t,
    user_data: *mut c_void,
) -> anidb_result_t;
pub type anidb_event_disconnect_fn = unsafe extern "C" fn(handle: *mut anidb_session_t) -> anidb_result_t;
pub type anidb_event_poll_fn = unsafe extern "C" fn(
    handle: *mut anidb_session_t,
    events: *mut anidb_event_t,
    max_events: u64,
    out_count: *mut u64,
) -> anidb_result_t;

// Utilities
pub type anidb_error_string_fn = unsafe extern "C" fn(code: anidb_result_t) -> *const c_char;
pub type anidb_hash_algorithm_name_fn = unsafe extern "C" fn(algorithm: i32) -> *const c_char;
pub type anidb_hash_buffer_size_fn = unsafe extern "C" fn(algorithm: i32) -> u64;

/// Every entry point, bound once
#[derive(Clone, Copy)]
pub struct AnidbApi {
    pub init: anidb_init_fn,
    pub cleanup: anidb_cleanup_fn,
    pub get_version: anidb_get_version_fn,
    pub get_abi_version: anidb_get_abi_version_fn,
    pub session_create: anidb_session_create_fn,
    pub session_create_with_config: anidb_session_create_with_config_fn,
    pub session_destroy: anidb_session_destroy_fn,
    pub session_get_last_error: anidb_session_get_last_error_fn,
    pub process_file: anidb_process_file_fn,
    pub process_batch: anidb_process_batch_fn,
    pub hash_file: anidb_hash_file_fn,
    pub hash_buffer: anidb_hash_buffer_fn,
    pub cache_clear: anidb_cache_clear_fn,
    pub cache_get_stats: anidb_cache_get_stats_fn,
    pub cache_check_file: anidb_cache_check_file_fn,
    pub identify_file: anidb_identify_file_fn,
    pub free_string: anidb_free_string_fn,
    pub free_file_result: anidb_free_file_result_fn,
    pub free_batch_result: anidb_free_batch_result_fn,
    pub free_anime_info: anidb_free_anime_info_fn,
    pub register_callback: anidb_register_callback_fn,
    pub unregister_callback: anidb_unregister_callback_fn,
    pub event_connect: anidb_event_connect_fn,
    pub event_disconnect: anidb_event_disconnect_fn,
    pub event_poll: anidb_event_poll_fn,
    pub error_string: anidb_error_string_fn,
    pub hash_algorithm_name: anidb_hash_algorithm_name_fn,
    pub hash_buffer_size: anidb_hash_buffer_size_fn,
}

impl std::fmt::Debug for AnidbApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnidbApi").finish_non_exhaustive()
    }
}

/// Exported symbol names, in `AnidbApi` field order
pub const SYMBOLS: &[&str] = &[
    "anidb_init",
    "anidb_cleanup",
    "anidb_get_version",
    "anidb_get_abi_version",
    "anidb_session_create",
    "anidb_session_create_with_config",
    "anidb_session_destroy",
    "anidb_session_get_last_error",
    "anidb_process_file",
    "anidb_process_batch",
    "anidb_hash_file",
    "anidb_hash_buffer",
    "anidb_cache_clear",
    "anidb_cache_get_stats",
    "anidb_cache_check_file",
    "anidb_identify_file",
    "anidb_free_string",
    "anidb_free_file_result",
    "anidb_free_batch_result",
    "anidb_free_anime_info",
    "anidb_register_callback",
    "anidb_unregister_callback",
    "anidb_event_connect",
    "anidb_event_disconnect",
    "anidb_event_poll",
    "anidb_error_string",
    "anidb_hash_algorithm_name",
    "anidb_hash_buffer_size",
];
