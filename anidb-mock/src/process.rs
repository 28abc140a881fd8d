//! File processing and hashing FFI implementation
//!
//! Digests are deterministic placeholders of the right width and alphabet,
//! derived from SHA-256 over the algorithm id and the content. They are not
//! the real ED2K/CRC32/MD5/SHA1/TTH values.

use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::os::raw::c_char;
use std::thread;
use std::time::Instant;

use sha2::{Digest, Sha256};

use anidb_abi::{
    anidb_batch_options_t, anidb_batch_result_t, anidb_completion_callback_t, anidb_file_result_t,
    anidb_process_options_t, anidb_progress_callback_t, anidb_result_t, anidb_session_t, EventKind, HashAlgorithm,
    ResultCode, Status,
};

use crate::error::{ffi_guard, MockError, MockResult};
use crate::event::QueuedEvent;
use crate::results::{publish_batch, publish_file, FileRecord};
use crate::session::{read_str, session_call, write_truncated, SessionState};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Progress callback plus its context, movable onto a worker thread
#[derive(Clone, Copy)]
struct ProgressSink {
    callback: anidb_progress_callback_t,
    user_data: *mut c_void,
}

// SAFETY: the caller promises its callbacks may be invoked from any thread.
unsafe impl Send for ProgressSink {}
unsafe impl Sync for ProgressSink {}

/// Whether progress is reported, and to which per-call callback
#[derive(Clone, Copy)]
struct Progress {
    enabled: bool,
    direct: Option<ProgressSink>,
}

impl Progress {
    fn report(&self, session: &SessionState, processed: u64, total: u64) {
        if !self.enabled {
            return;
        }
        let percentage = if total == 0 {
            100.0
        } else {
            (processed as f64 / total as f64 * 100.0) as f32
        };
        session.notify_progress(self.direct.map(|s| (s.callback, s.user_data)), percentage, processed, total);
    }
}

fn placeholder_hasher(algorithm: HashAlgorithm) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update([algorithm.raw() as u8]);
    hasher
}

fn render(algorithm: HashAlgorithm, hasher: Sha256) -> String {
    let digest = hasher.finalize();
    if algorithm.is_base32() {
        base32(&digest[..24])
    } else {
        hex::encode(&digest[..algorithm.text_len() / 2])
    }
}

/// RFC 4648 base32 without padding
fn base32(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer = 0u32;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Hash a whole file with every algorithm in one pass
fn hash_stream(
    path: &str,
    algorithms: &[HashAlgorithm],
    chunk_size: usize,
    mut on_chunk: impl FnMut(u64),
) -> MockResult<Vec<String>> {
    let mut file = File::open(path).map_err(|err| MockError::io(path, err))?;
    let mut hashers: Vec<Sha256> = algorithms.iter().map(|a| placeholder_hasher(*a)).collect();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut processed = 0u64;

    loop {
        let read = file.read(&mut buffer).map_err(|err| MockError::io(path, err))?;
        if read == 0 {
            break;
        }
        for hasher in &mut hashers {
            hasher.update(&buffer[..read]);
        }
        processed += read as u64;
        on_chunk(processed);
    }

    Ok(algorithms
        .iter()
        .zip(hashers)
        .map(|(algorithm, hasher)| render(*algorithm, hasher))
        .collect())
}

fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = placeholder_hasher(algorithm);
    hasher.update(data);
    render(algorithm, hasher)
}

/// # Safety
/// `algorithms` must be valid for `count` reads.
unsafe fn read_algorithms(algorithms: *const i32, count: u64) -> MockResult<Vec<HashAlgorithm>> {
    if algorithms.is_null() || count == 0 {
        return Err(MockError::invalid("At least one hash algorithm must be specified"));
    }
    std::slice::from_raw_parts(algorithms, count as usize)
        .iter()
        .map(|raw| HashAlgorithm::try_from(*raw).map_err(|err| MockError::invalid(err.to_string())))
        .collect()
}

fn parse_algorithm(raw: i32) -> MockResult<HashAlgorithm> {
    HashAlgorithm::try_from(raw).map_err(|err| MockError::invalid(err.to_string()))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Process one file against the session cache
fn process_one(
    session: &SessionState,
    path: &str,
    algorithms: &[HashAlgorithm],
    progress: Progress,
    verify_existing: bool,
) -> MockResult<FileRecord> {
    let start = Instant::now();
    let metadata = std::fs::metadata(path).map_err(|err| MockError::io(path, err))?;
    if !metadata.is_file() {
        return Err(MockError::Processing {
            path: path.to_string(),
            reason: "not a regular file".into(),
        });
    }
    let size = metadata.len();
    session.emit(QueuedEvent::file(EventKind::FileStart, path, size));

    let limit = session.config.max_memory_usage;
    if limit > 0 && size > limit {
        session.emit(QueuedEvent::memory(size, limit, Some(path)));
    }

    // Events are emitted outside the cache lock; callbacks may query the cache.
    let mut digests: Vec<Option<String>> = {
        let cache = session.cache.lock();
        algorithms
            .iter()
            .map(|algorithm| {
                if verify_existing {
                    None
                } else {
                    cache.get(&(path.to_string(), *algorithm)).cloned()
                }
            })
            .collect()
    };
    for (algorithm, cached) in algorithms.iter().zip(&digests) {
        let kind = if cached.is_some() { EventKind::CacheHit } else { EventKind::CacheMiss };
        session.emit(QueuedEvent::cache(kind, path, *algorithm));
    }

    let pending: Vec<HashAlgorithm> = algorithms
        .iter()
        .zip(&digests)
        .filter(|(_, cached)| cached.is_none())
        .map(|(algorithm, _)| *algorithm)
        .collect();

    if !pending.is_empty() {
        for algorithm in &pending {
            session.emit(QueuedEvent::hash(EventKind::HashStart, *algorithm, None));
        }

        let chunk_size = usize::try_from(session.config.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE);
        // Hashing runs on a worker so progress callbacks arrive off the calling thread.
        let computed = thread::scope(|scope| {
            scope
                .spawn(|| {
                    let result = hash_stream(path, &pending, chunk_size, |processed| {
                        progress.report(session, processed, size)
                    });
                    if size == 0 {
                        progress.report(session, 0, 0);
                    }
                    result
                })
                .join()
        })
        .map_err(|_| MockError::Processing {
            path: path.to_string(),
            reason: "hashing worker panicked".into(),
        })??;

        let mut computed = computed.into_iter();
        for (algorithm, slot) in algorithms.iter().zip(digests.iter_mut()) {
            if slot.is_none() {
                let value = computed.next().unwrap_or_default();
                session
                    .cache
                    .lock()
                    .insert((path.to_string(), *algorithm), value.clone());
                session.emit(QueuedEvent::hash(EventKind::HashComplete, *algorithm, Some(&value)));
                *slot = Some(value);
            }
        }
    }

    session.emit(QueuedEvent::file(EventKind::FileComplete, path, size));

    Ok(FileRecord {
        path: path.to_string(),
        size,
        status: Status::Completed,
        hashes: algorithms
            .iter()
            .zip(digests)
            .map(|(algorithm, value)| (algorithm.raw(), value.unwrap_or_default()))
            .collect(),
        error: None,
        elapsed_ms: elapsed_ms(start),
    })
}

/// Serve a file entirely from the cache, if every digest is present
fn from_cache(session: &SessionState, path: &str, algorithms: &[HashAlgorithm]) -> Option<FileRecord> {
    let cache = session.cache.lock();
    let hashes = algorithms
        .iter()
        .map(|algorithm| {
            cache
                .get(&(path.to_string(), *algorithm))
                .map(|value| (algorithm.raw(), value.clone()))
        })
        .collect::<Option<Vec<_>>>()?;
    drop(cache);

    for algorithm in algorithms {
        session.emit(QueuedEvent::cache(EventKind::CacheHit, path, *algorithm));
    }
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    Some(FileRecord {
        path: path.to_string(),
        size,
        status: Status::Completed,
        hashes,
        error: None,
        elapsed_ms: 0,
    })
}

/// Process a single file
///
/// # Safety
/// - `file_path` must be a valid NUL-terminated string
/// - `options` must be NULL or a valid pointer
/// - `out_result` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_process_file(
    handle: *mut anidb_session_t,
    file_path: *const c_char,
    options: *const anidb_process_options_t,
    out_result: *mut *mut anidb_file_result_t,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if out_result.is_null() {
                return Err(MockError::invalid("out_result is NULL"));
            }
            let path = read_str(file_path, "file_path")?;

            let (algorithms, progress, verify_existing) = match options.as_ref() {
                Some(options) => (
                    read_algorithms(options.algorithms, options.algorithm_count)?,
                    Progress {
                        enabled: options.enable_progress != 0,
                        direct: options.progress_callback.map(|callback| ProgressSink {
                            callback,
                            user_data: options.user_data,
                        }),
                    },
                    options.verify_existing != 0,
                ),
                None => (
                    vec![HashAlgorithm::Ed2k],
                    Progress {
                        enabled: false,
                        direct: None,
                    },
                    false,
                ),
            };

            match process_one(session, path, &algorithms, progress, verify_existing) {
                Ok(record) => {
                    *out_result = publish_file(record);
                    session.notify_completion(None, ResultCode::Success.raw());
                    Ok(())
                }
                Err(err) => {
                    session.notify_error(&err);
                    session.notify_completion(None, err.code().raw());
                    Err(err)
                }
            }
        })
    })
}

/// Process several files
///
/// With `continue_on_error` set, failing files become FAILED entries and
/// the call succeeds. Otherwise the first failure aborts the batch and its
/// code is returned; files in the same concurrent group may already have
/// been processed.
///
/// # Safety
/// - `file_paths` must be valid for `file_count` reads of NUL-terminated strings
/// - `options` must be NULL or a valid pointer
/// - `out_result` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_process_batch(
    handle: *mut anidb_session_t,
    file_paths: *const *const c_char,
    file_count: u64,
    options: *const anidb_batch_options_t,
    out_result: *mut *mut anidb_batch_result_t,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if out_result.is_null() {
                return Err(MockError::invalid("out_result is NULL"));
            }
            if file_paths.is_null() && file_count > 0 {
                return Err(MockError::invalid("file_paths is NULL"));
            }
            let paths = if file_count == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(file_paths, file_count as usize)
                    .iter()
                    .map(|path| read_str(*path, "file path"))
                    .collect::<MockResult<Vec<&str>>>()?
            };

            let defaults = anidb_batch_options_t {
                algorithms: std::ptr::null(),
                algorithm_count: 0,
                progress_callback: None,
                completion_callback: None,
                user_data: std::ptr::null_mut(),
                max_concurrent: 4,
                continue_on_error: 1,
                skip_existing: 0,
                _reserved: 0,
            };
            let options = options.as_ref().copied().unwrap_or(defaults);
            let algorithms = if options.algorithms.is_null() && options.algorithm_count == 0 {
                vec![HashAlgorithm::Ed2k]
            } else {
                read_algorithms(options.algorithms, options.algorithm_count)?
            };
            if options.max_concurrent == 0 {
                return Err(MockError::invalid("max_concurrent must be at least 1"));
            }

            let progress = Progress {
                enabled: true,
                direct: options.progress_callback.map(|callback| ProgressSink {
                    callback,
                    user_data: options.user_data,
                }),
            };
            let completion: Option<(anidb_completion_callback_t, *mut c_void)> =
                options.completion_callback.map(|callback| (callback, options.user_data));

            tracing::debug!(
                files = paths.len(),
                max_concurrent = options.max_concurrent,
                continue_on_error = options.continue_on_error != 0,
                "batch started"
            );

            let skip_existing = options.skip_existing != 0;
            let continue_on_error = options.continue_on_error != 0;
            let start = Instant::now();
            let mut records = Vec::with_capacity(paths.len());
            for group in paths.chunks(options.max_concurrent as usize) {
                let outcomes: Vec<(Instant, &str, MockResult<FileRecord>)> = thread::scope(|scope| {
                    let workers: Vec<_> = group
                        .iter()
                        .map(|path| {
                            let algorithms = &algorithms;
                            scope.spawn(move || {
                                let started = Instant::now();
                                if skip_existing {
                                    if let Some(record) = from_cache(session, path, algorithms) {
                                        return (started, *path, Ok(record));
                                    }
                                }
                                (started, *path, process_one(session, path, algorithms, progress, false))
                            })
                        })
                        .collect();
                    workers
                        .into_iter()
                        .zip(group)
                        .map(|(worker, path)| {
                            worker.join().unwrap_or_else(|_| {
                                (
                                    Instant::now(),
                                    *path,
                                    Err(MockError::Processing {
                                        path: path.to_string(),
                                        reason: "worker panicked".into(),
                                    }),
                                )
                            })
                        })
                        .collect()
                });

                for (started, path, outcome) in outcomes {
                    match outcome {
                        Ok(record) => records.push(record),
                        Err(err) => {
                            session.notify_error(&err);
                            if !continue_on_error {
                                session.notify_completion(completion, err.code().raw());
                                return Err(err);
                            }
                            records.push(FileRecord::failed(path, &err, elapsed_ms(started)));
                        }
                    }
                }
            }

            *out_result = publish_batch(records, elapsed_ms(start));
            session.notify_completion(completion, ResultCode::Success.raw());
            Ok(())
        })
    })
}

/// Hash a file with one algorithm into `buffer`
///
/// # Safety
/// - `file_path` must be a valid NUL-terminated string
/// - `buffer` must be valid for `buffer_size` bytes
#[no_mangle]
pub unsafe extern "C" fn anidb_hash_file(
    file_path: *const c_char,
    algorithm: i32,
    buffer: *mut c_char,
    buffer_size: u64,
) -> anidb_result_t {
    ffi_guard!({
        let result = (|| {
            let path = read_str(file_path, "file_path")?;
            let algorithm = parse_algorithm(algorithm)?;
            if (buffer_size as usize) < algorithm.buffer_size() {
                return Err(MockError::invalid("buffer too small for digest"));
            }
            let digest = hash_stream(path, &[algorithm], DEFAULT_CHUNK_SIZE, |_| {})?;
            write_truncated(&digest[0], buffer, buffer_size)
        })();
        match result {
            Ok(()) => ResultCode::Success.raw(),
            Err(err) => (&err).into(),
        }
    })
}

/// Hash an in-memory buffer with one algorithm into `buffer`
///
/// # Safety
/// - `data` must be valid for `data_len` bytes
/// - `buffer` must be valid for `buffer_size` bytes
#[no_mangle]
pub unsafe extern "C" fn anidb_hash_buffer(
    data: *const u8,
    data_len: u64,
    algorithm: i32,
    buffer: *mut c_char,
    buffer_size: u64,
) -> anidb_result_t {
    ffi_guard!({
        let result = (|| {
            if data.is_null() || data_len == 0 {
                return Err(MockError::invalid("Data cannot be empty"));
            }
            let algorithm = parse_algorithm(algorithm)?;
            if (buffer_size as usize) < algorithm.buffer_size() {
                return Err(MockError::invalid("buffer too small for digest"));
            }
            let data = std::slice::from_raw_parts(data, data_len as usize);
            write_truncated(&hash_bytes(data, algorithm), buffer, buffer_size)
        })();
        match result {
            Ok(()) => ResultCode::Success.raw(),
            Err(err) => (&err).into(),
        }
    })
}
