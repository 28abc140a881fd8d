//! Event and callback FFI implementation
//!
//! Events are queued for polling and, when a stream is connected, delivered
//! on a dedicated thread. Registered callbacks are invoked on whichever
//! engine thread produces the notification.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::{CString, c_void};
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use anidb_abi::{
    anidb_cache_event_t, anidb_completion_callback_t, anidb_error_callback_t, anidb_event_callback_t,
    anidb_event_data_t, anidb_event_t, anidb_file_event_t, anidb_hash_event_t, anidb_memory_event_t,
    anidb_network_event_t, anidb_progress_callback_t, anidb_result_t, anidb_session_t, CallbackKind, EventKind,
    HashAlgorithm,
};

use crate::error::{ffi_guard, MockError};
use crate::session::{lookup, session_call, SessionState};

/// Queue bound; older events are kept, newer ones dropped
const MAX_QUEUED_EVENTS: usize = 10_000;

/// An event together with the strings its pointers refer to
pub struct QueuedEvent {
    raw: anidb_event_t,
    _strings: Vec<CString>,
}

// SAFETY: every pointer inside `raw` targets a heap buffer owned by `_strings`.
unsafe impl Send for QueuedEvent {}

impl Clone for QueuedEvent {
    fn clone(&self) -> Self {
        // Re-point the copy at its own strings.
        let strings = self._strings.clone();
        let mut raw = self.raw;
        let remap = |old: *const c_char| -> *const c_char {
            self._strings
                .iter()
                .position(|s| s.as_ptr() == old)
                .map_or(ptr::null(), |i| strings[i].as_ptr())
        };
        raw.context = remap(raw.context);
        match EventKind::try_from(raw.event_type) {
            Ok(EventKind::FileStart | EventKind::FileComplete) => unsafe {
                raw.data.file.file_path = remap(raw.data.file.file_path);
            },
            Ok(EventKind::HashStart | EventKind::HashComplete) => unsafe {
                raw.data.hash.hash_value = remap(raw.data.hash.hash_value);
            },
            Ok(EventKind::CacheHit | EventKind::CacheMiss) => unsafe {
                raw.data.cache.file_path = remap(raw.data.cache.file_path);
            },
            Ok(EventKind::NetworkStart | EventKind::NetworkComplete) => unsafe {
                raw.data.network.endpoint = remap(raw.data.network.endpoint);
            },
            Ok(EventKind::MemoryWarning) | Err(_) => {}
        }
        Self {
            raw,
            _strings: strings,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct StringArena(Vec<CString>);

impl StringArena {
    fn push(&mut self, value: Option<&str>) -> *const c_char {
        match value.and_then(|v| CString::new(v).ok()) {
            Some(s) => {
                let ptr = s.as_ptr();
                self.0.push(s);
                ptr
            }
            None => ptr::null(),
        }
    }
}

impl QueuedEvent {
    fn build(kind: EventKind, context: Option<&str>, data: impl FnOnce(&mut StringArena) -> anidb_event_data_t) -> Self {
        let mut arena = StringArena(Vec::new());
        let data = data(&mut arena);
        let context = arena.push(context);
        Self {
            raw: anidb_event_t {
                event_type: kind.raw(),
                _reserved: 0,
                timestamp_ms: now_ms(),
                data,
                context,
            },
            _strings: arena.0,
        }
    }

    pub fn file(kind: EventKind, path: &str, size: u64) -> Self {
        Self::build(kind, None, |arena| anidb_event_data_t {
            file: anidb_file_event_t {
                file_path: arena.push(Some(path)),
                file_size: size,
            },
        })
    }

    pub fn hash(kind: EventKind, algorithm: HashAlgorithm, value: Option<&str>) -> Self {
        Self::build(kind, None, |arena| anidb_event_data_t {
            hash: anidb_hash_event_t {
                hash_value: arena.push(value),
                algorithm: algorithm.raw(),
                _reserved: 0,
            },
        })
    }

    pub fn cache(kind: EventKind, path: &str, algorithm: HashAlgorithm) -> Self {
        Self::build(kind, None, |arena| anidb_event_data_t {
            cache: anidb_cache_event_t {
                file_path: arena.push(Some(path)),
                algorithm: algorithm.raw(),
                _reserved: 0,
            },
        })
    }

    pub fn network(kind: EventKind, endpoint: &str, status_code: i32, context: Option<&str>) -> Self {
        Self::build(kind, context, |arena| anidb_event_data_t {
            network: anidb_network_event_t {
                endpoint: arena.push(Some(endpoint)),
                status_code,
                _reserved: 0,
            },
        })
    }

    pub fn memory(current_usage: u64, max_usage: u64, context: Option<&str>) -> Self {
        Self::build(EventKind::MemoryWarning, context, |_| anidb_event_data_t {
            memory: anidb_memory_event_t {
                current_usage,
                max_usage,
            },
        })
    }

    /// Event with an arbitrary raw tag, for exercising decoders
    pub fn raw_tag(event_type: i32) -> Self {
        let mut event = Self::memory(0, 0, None);
        event.raw.event_type = event_type;
        event
    }
}

struct Delivery {
    sender: mpsc::Sender<QueuedEvent>,
    stopped: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

/// Event queue plus the optional connected stream
#[derive(Default)]
pub struct EventHub {
    queue: Mutex<VecDeque<QueuedEvent>>,
    /// Events handed out by the last poll; their strings stay valid until the next one
    polled: Mutex<Vec<QueuedEvent>>,
    delivery: Mutex<Option<Delivery>>,
}

impl EventHub {
    fn connect(&self, callback: anidb_event_callback_t, user_data: *mut c_void) -> Result<(), MockError> {
        let mut delivery = self.delivery.lock();
        if delivery.is_some() {
            return Err(MockError::Busy);
        }

        let (sender, receiver) = mpsc::channel::<QueuedEvent>();
        let user_data = user_data as usize;
        let stopped = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stopped);
        let thread = thread::Builder::new()
            .name("anidb-events".into())
            .spawn(move || {
                // Events still buffered after a disconnect are never delivered.
                while let Ok(event) = receiver.recv() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    unsafe { callback(&event.raw, user_data as *mut c_void) };
                }
            })
            .map_err(|err| MockError::Processing {
                path: String::new(),
                reason: format!("failed to start event thread: {err}"),
            })?;
        let thread_id = thread.thread().id();
        *delivery = Some(Delivery {
            sender,
            stopped,
            thread,
            thread_id,
        });
        Ok(())
    }

    /// Stop delivery and drop queued events
    pub fn disconnect(&self) {
        let delivery = self.delivery.lock().take();
        if let Some(Delivery {
            sender,
            stopped,
            thread,
            thread_id,
        }) = delivery
        {
            stopped.store(true, Ordering::SeqCst);
            drop(sender);
            // Disconnecting from inside the event callback must not join itself.
            if thread::current().id() != thread_id {
                let _ = thread.join();
            }
        }
        self.queue.lock().clear();
        self.polled.lock().clear();
    }

    fn is_connected(&self) -> bool {
        self.delivery.lock().is_some()
    }

    fn poll(&self, out: &mut [anidb_event_t]) -> usize {
        let mut queue = self.queue.lock();
        let mut polled = self.polled.lock();
        polled.clear();
        while polled.len() < out.len() {
            let Some(event) = queue.pop_front() else { break };
            out[polled.len()] = event.raw;
            polled.push(event);
        }
        polled.len()
    }
}

/// One registered callback
#[derive(Clone, Copy)]
struct Registration {
    kind: CallbackKind,
    callback: usize,
    user_data: usize,
}

/// Callbacks registered through `anidb_register_callback`
pub struct CallbackTable {
    entries: Mutex<BTreeMap<u64, Registration>>,
    next_id: AtomicU64,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl CallbackTable {
    fn register(&self, kind: CallbackKind, callback: *const c_void, user_data: *mut c_void) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(
            id,
            Registration {
                kind,
                callback: callback as usize,
                user_data: user_data as usize,
            },
        );
        id
    }

    fn unregister(&self, id: u64) -> Result<(), MockError> {
        self.entries
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(MockError::UnknownCallback(id))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn of_kind(&self, kind: CallbackKind) -> Vec<Registration> {
        // Snapshot so callbacks can re-enter register/unregister.
        self.entries.lock().values().filter(|r| r.kind == kind).copied().collect()
    }
}

impl SessionState {
    /// Queue an event, hand it to the connected stream and to EVENT callbacks
    pub fn emit(&self, event: QueuedEvent) {
        for registration in self.callbacks.of_kind(CallbackKind::Event) {
            let callback: anidb_event_callback_t = unsafe { std::mem::transmute(registration.callback) };
            unsafe { callback(&event.raw, registration.user_data as *mut c_void) };
        }

        if let Some(delivery) = self.events.delivery.lock().as_ref() {
            let _ = delivery.sender.send(event.clone());
        }

        let mut queue = self.events.queue.lock();
        if queue.len() < MAX_QUEUED_EVENTS {
            queue.push_back(event);
        }
    }

    pub fn notify_progress(
        &self,
        direct: Option<(anidb_progress_callback_t, *mut c_void)>,
        percentage: f32,
        processed: u64,
        total: u64,
    ) {
        if let Some((callback, user_data)) = direct {
            unsafe { callback(percentage, processed, total, user_data) };
        }
        for registration in self.callbacks.of_kind(CallbackKind::Progress) {
            let callback: anidb_progress_callback_t = unsafe { std::mem::transmute(registration.callback) };
            unsafe { callback(percentage, processed, total, registration.user_data as *mut c_void) };
        }
    }

    pub fn notify_error(&self, err: &MockError) {
        let message = CString::new(err.to_string()).unwrap_or_default();
        let path = err.path().and_then(|p| CString::new(p).ok());
        let path_ptr = path.as_ref().map_or(ptr::null(), |p| p.as_ptr());
        for registration in self.callbacks.of_kind(CallbackKind::Error) {
            let callback: anidb_error_callback_t = unsafe { std::mem::transmute(registration.callback) };
            unsafe {
                callback(
                    err.code().raw(),
                    message.as_ptr(),
                    path_ptr,
                    registration.user_data as *mut c_void,
                )
            };
        }
    }

    pub fn notify_completion(
        &self,
        direct: Option<(anidb_completion_callback_t, *mut c_void)>,
        result: anidb_result_t,
    ) {
        if let Some((callback, user_data)) = direct {
            unsafe { callback(result, user_data) };
        }
        for registration in self.callbacks.of_kind(CallbackKind::Completion) {
            let callback: anidb_completion_callback_t = unsafe { std::mem::transmute(registration.callback) };
            unsafe { callback(result, registration.user_data as *mut c_void) };
        }
    }
}

/// Register a callback of the given kind
///
/// # Safety
/// - `callback` must be a function pointer whose signature matches `kind`
/// - `out_id` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_register_callback(
    handle: *mut anidb_session_t,
    kind: i32,
    callback: *const c_void,
    user_data: *mut c_void,
    out_id: *mut u64,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if callback.is_null() || out_id.is_null() {
                return Err(MockError::invalid("callback or out_id is NULL"));
            }
            let kind = CallbackKind::try_from(kind).map_err(|err| MockError::invalid(err.to_string()))?;
            let id = session.callbacks.register(kind, callback, user_data);
            *out_id = id;
            tracing::debug!(id, ?kind, "callback registered");
            Ok(())
        })
    })
}

/// Unregister a callback
///
/// # Safety
/// - `handle` must be a valid session handle
#[no_mangle]
pub unsafe extern "C" fn anidb_unregister_callback(handle: *mut anidb_session_t, callback_id: u64) -> anidb_result_t {
    ffi_guard!({ session_call(handle, |session| session.callbacks.unregister(callback_id)) })
}

/// Connect the event stream
///
/// # Safety
/// - `callback` must stay callable until `anidb_event_disconnect` returns
#[no_mangle]
pub unsafe extern "C" fn anidb_event_connect(
    handle: *mut anidb_session_t,
    callback: anidb_event_callback_t,
    user_data: *mut c_void,
) -> anidb_result_t {
    ffi_guard!({ session_call(handle, |session| session.events.connect(callback, user_data)) })
}

/// Disconnect the event stream; blocks until in-flight deliveries finish
///
/// # Safety
/// - `handle` must be a valid session handle
#[no_mangle]
pub unsafe extern "C" fn anidb_event_disconnect(handle: *mut anidb_session_t) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            session.events.disconnect();
            Ok(())
        })
    })
}

/// Drain up to `max_events` queued events
///
/// # Safety
/// - `events` must be valid for `max_events` writes
/// - `out_count` must be a valid pointer for output
#[no_mangle]
pub unsafe extern "C" fn anidb_event_poll(
    handle: *mut anidb_session_t,
    events: *mut anidb_event_t,
    max_events: u64,
    out_count: *mut u64,
) -> anidb_result_t {
    ffi_guard!({
        session_call(handle, |session| {
            if events.is_null() || out_count.is_null() || max_events == 0 {
                return Err(MockError::invalid("poll buffer is empty"));
            }
            let out = std::slice::from_raw_parts_mut(events, max_events as usize);
            *out_count = session.events.poll(out) as u64;
            Ok(())
        })
    })
}

/// Inject a MEMORY_WARNING event into a session
pub fn emit_memory_warning(handle: *mut anidb_session_t, current_usage: u64, max_usage: u64) -> bool {
    match lookup(handle) {
        Ok(session) => {
            session.emit(QueuedEvent::memory(current_usage, max_usage, Some("injected")));
            true
        }
        Err(_) => false,
    }
}

/// Inject an event with an arbitrary tag
pub fn emit_raw_event(handle: *mut anidb_session_t, event_type: i32) -> bool {
    match lookup(handle) {
        Ok(session) => {
            session.emit(QueuedEvent::raw_tag(event_type));
            true
        }
        Err(_) => false,
    }
}

/// Whether a session currently has an event stream connected
pub fn is_event_stream_connected(handle: *mut anidb_session_t) -> bool {
    lookup(handle).map(|s| s.events.is_connected()).unwrap_or(false)
}

/// Number of callbacks registered on a session
pub fn registered_callbacks(handle: *mut anidb_session_t) -> usize {
    lookup(handle).map(|s| s.callbacks.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_clone_repoints_strings() {
        let event = QueuedEvent::file(EventKind::FileStart, "/tmp/a.mkv", 42);
        let copy = event.clone();
        drop(event);
        let path = unsafe { CStr::from_ptr(copy.raw.data.file.file_path) };
        assert_eq!(path.to_str().unwrap(), "/tmp/a.mkv");
        assert_eq!(unsafe { copy.raw.data.file.file_size }, 42);
    }

    #[test]
    fn test_queue_and_poll() {
        let hub = EventHub::default();
        hub.queue.lock().push_back(QueuedEvent::memory(10, 20, None));
        hub.queue.lock().push_back(QueuedEvent::hash(EventKind::HashStart, HashAlgorithm::Md5, None));

        let mut out = [anidb_event_t::default(); 1];
        assert_eq!(hub.poll(&mut out), 1);
        assert_eq!(out[0].event_type, EventKind::MemoryWarning.raw());
        assert_eq!(hub.poll(&mut out), 1);
        assert_eq!(out[0].event_type, EventKind::HashStart.raw());
        assert_eq!(hub.poll(&mut out), 0);
    }

    static DELIVERED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_event(event: *const anidb_event_t, _user_data: *mut c_void) {
        if !event.is_null() {
            DELIVERED.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_connect_twice_is_busy() {
        let hub = EventHub::default();
        assert!(hub.connect(count_event, ptr::null_mut()).is_ok());
        assert!(matches!(hub.connect(count_event, ptr::null_mut()), Err(MockError::Busy)));
        hub.disconnect();
        assert!(!hub.is_connected());
    }

    #[test]
    fn test_unregister_unknown_id() {
        let table = CallbackTable::default();
        let id = table.register(CallbackKind::Progress, count_event as *const c_void, ptr::null_mut());
        assert!(table.unregister(id).is_ok());
        assert!(matches!(table.unregister(id), Err(MockError::UnknownCallback(_))));
    }
}
