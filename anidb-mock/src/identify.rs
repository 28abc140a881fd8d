//! Identification FFI implementation
//!
//! The remote database is a process-wide table filled by tests through
//! [`seed_identification`]. A session remembers what it has already looked
//! up and answers repeats from its own cache without touching the network.

use std::collections::BTreeMap;
use std::os::raw::c_char;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use anidb_abi::{anidb_anime_info_t, anidb_result_t, anidb_session_t, EventKind, IdentificationSource};

use crate::error::{ffi_guard, MockError};
use crate::event::QueuedEvent;
use crate::results::{publish_anime, AnimeRecord};
use crate::session::{read_str, session_call};

const ENDPOINT: &str = "api.anidb.net:9000";

static CATALOG: Mutex<BTreeMap<(String, u64), AnimeRecord>> = parking_lot::const_mutex(BTreeMap::new());

/// Add an entry to the simulated remote database
pub fn seed_identification(ed2k: &str, file_size: u64, record: AnimeRecord) {
    CATALOG.lock().insert((ed2k.to_ascii_lowercase(), file_size), record);
}

fn lookup(key: &(String, u64)) -> Option<AnimeRecord> {
    CATALOG.lock().get(key).cloned()
}

/// Identify a file by ED2K hash and size
///
/// Not found is SUCCESS with `*out_info` set to NULL.
///
/// # Safety
/// - `ed2k_hash` must be a valid NUL-terminated string
/// - `out_info` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_identify_file(
    handle: *mut anidb_session_t,
    ed2k_hash: *const c_char,
    file_size: u64,
    out_info: *mut *mut anidb_anime_info_t,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if out_info.is_null() {
                return Err(MockError::invalid("out_info is NULL"));
            }
            let hash = read_str(ed2k_hash, "ed2k_hash")?;
            if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(MockError::invalid("ED2K hash must be 32 hexadecimal characters"));
            }
            if file_size == 0 {
                return Err(MockError::invalid("file size must be non-zero"));
            }
            *out_info = std::ptr::null_mut();

            let key = (hash.to_ascii_lowercase(), file_size);
            if session.identified.lock().contains(&key) {
                if let Some(record) = lookup(&key) {
                    *out_info = publish_anime(&record, IdentificationSource::Cache);
                    return Ok(());
                }
            }

            let context = if session.config.has_credentials() { "authenticated" } else { "anonymous" };
            session.emit(QueuedEvent::network(EventKind::NetworkStart, ENDPOINT, 0, Some(context)));
            if !session.network_available.load(Ordering::SeqCst) {
                return Err(MockError::Network(ENDPOINT.to_string()));
            }

            let found = lookup(&key);
            let status = if found.is_some() { 200 } else { 404 };
            session.emit(QueuedEvent::network(EventKind::NetworkComplete, ENDPOINT, status, Some(context)));

            if let Some(record) = found {
                session.identified.lock().insert(key);
                *out_info = publish_anime(&record, IdentificationSource::RemoteDatabase);
            }
            tracing::debug!(hash, file_size, status, "identification lookup");
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_case_insensitive() {
        let record = AnimeRecord {
            anime_id: 1,
            episode_id: 2,
            title: "Test".into(),
            episode_number: 3,
            confidence: 0.5,
        };
        seed_identification("ABCDEF0123456789ABCDEF0123456789", 10, record.clone());
        let key = ("abcdef0123456789abcdef0123456789".to_string(), 10);
        assert_eq!(lookup(&key), Some(record));
    }
}
