//! Engine events
//!
//! `anidb_event_t` carries a union whose valid member depends on the tag.
//! [`decode`] switches on the tag first and reads exactly one member, then
//! copies every string so the result outlives the engine's buffers.

use std::path::PathBuf;

use anidb_abi::{anidb_event_t, EventKind, HashAlgorithm};

use crate::error::{AnidbError, Result};
use crate::marshal::read_text;

/// Payload of one event; each variant carries only its kind's fields
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    FileStart { path: PathBuf, size: u64 },
    FileComplete { path: PathBuf, size: u64 },
    HashStart { algorithm: HashAlgorithm },
    HashComplete { algorithm: HashAlgorithm, hash: String },
    CacheHit { path: PathBuf, algorithm: HashAlgorithm },
    CacheMiss { path: PathBuf, algorithm: HashAlgorithm },
    NetworkStart { endpoint: String, status_code: i32 },
    NetworkComplete { endpoint: String, status_code: i32 },
    MemoryWarning { current_usage: u64, max_usage: u64 },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::FileStart { .. } => EventKind::FileStart,
            EventPayload::FileComplete { .. } => EventKind::FileComplete,
            EventPayload::HashStart { .. } => EventKind::HashStart,
            EventPayload::HashComplete { .. } => EventKind::HashComplete,
            EventPayload::CacheHit { .. } => EventKind::CacheHit,
            EventPayload::CacheMiss { .. } => EventKind::CacheMiss,
            EventPayload::NetworkStart { .. } => EventKind::NetworkStart,
            EventPayload::NetworkComplete { .. } => EventKind::NetworkComplete,
            EventPayload::MemoryWarning { .. } => EventKind::MemoryWarning,
        }
    }
}

/// A decoded engine event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub context: Option<String>,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

fn algorithm(raw: i32) -> Result<HashAlgorithm> {
    HashAlgorithm::try_from(raw).map_err(|err| AnidbError::Decode(err.to_string()))
}

unsafe fn required_text(ptr: *const std::os::raw::c_char, what: &str) -> Result<String> {
    read_text(ptr)?.ok_or_else(|| AnidbError::Decode(format!("{what} is NULL")))
}

/// Decode a raw event
///
/// # Safety
/// The union member selected by `raw.event_type` must be initialized, and its
/// string pointers must be NULL or valid NUL-terminated strings.
pub unsafe fn decode(raw: &anidb_event_t) -> Result<Event> {
    let kind = EventKind::try_from(raw.event_type).map_err(|err| AnidbError::Decode(err.to_string()))?;
    let data = &raw.data;

    let payload = match kind {
        EventKind::FileStart | EventKind::FileComplete => {
            let file = data.file;
            let path = PathBuf::from(required_text(file.file_path, "file path")?);
            if kind == EventKind::FileStart {
                EventPayload::FileStart { path, size: file.file_size }
            } else {
                EventPayload::FileComplete { path, size: file.file_size }
            }
        }
        EventKind::HashStart => EventPayload::HashStart {
            algorithm: algorithm(data.hash.algorithm)?,
        },
        EventKind::HashComplete => {
            let hash = data.hash;
            EventPayload::HashComplete {
                algorithm: algorithm(hash.algorithm)?,
                hash: required_text(hash.hash_value, "hash value")?,
            }
        }
        EventKind::CacheHit | EventKind::CacheMiss => {
            let cache = data.cache;
            let path = PathBuf::from(required_text(cache.file_path, "file path")?);
            let algorithm = algorithm(cache.algorithm)?;
            if kind == EventKind::CacheHit {
                EventPayload::CacheHit { path, algorithm }
            } else {
                EventPayload::CacheMiss { path, algorithm }
            }
        }
        EventKind::NetworkStart | EventKind::NetworkComplete => {
            let network = data.network;
            let endpoint = required_text(network.endpoint, "endpoint")?;
            if kind == EventKind::NetworkStart {
                EventPayload::NetworkStart {
                    endpoint,
                    status_code: network.status_code,
                }
            } else {
                EventPayload::NetworkComplete {
                    endpoint,
                    status_code: network.status_code,
                }
            }
        }
        EventKind::MemoryWarning => {
            let memory = data.memory;
            EventPayload::MemoryWarning {
                current_usage: memory.current_usage,
                max_usage: memory.max_usage,
            }
        }
    };

    Ok(Event {
        timestamp_ms: raw.timestamp_ms,
        context: read_text(raw.context)?,
        payload,
    })
}
