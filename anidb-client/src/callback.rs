//! Callback trampolines
//!
//! The engine only sees `extern "C"` trampolines and an opaque context
//! pointer. The context is a [`Handlers`] owned by the session registry (or
//! by the options of a single call), so the closures it holds live at least
//! as long as the engine may invoke them. Each trampoline clones the closure
//! out of the context before running it, so a closure that unregisters or
//! disconnects itself keeps running on a live value.

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, warn};

use anidb_abi::{
    anidb_completion_callback_t, anidb_error_callback_t, anidb_event_callback_t, anidb_event_t,
    anidb_progress_callback_t, anidb_result_t, CallbackKind, ResultCode,
};

use crate::error::ErrorKind;
use crate::event::{decode, Event};
use crate::marshal::read_text;

/// Progress report for one file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// 0.0 to 100.0
    pub percentage: f32,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

/// Error reported by the engine through an error callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
    pub path: Option<PathBuf>,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ErrorNotice) + Send + Sync>;
/// Receives `true` when the operation finished with SUCCESS
pub type CompletionCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// A callback to register with a session; the variant fixes its kind
#[derive(Clone)]
pub enum Callback {
    Progress(ProgressCallback),
    Error(ErrorCallback),
    Completion(CompletionCallback),
    Event(EventCallback),
}

impl Callback {
    pub fn progress(f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Callback::Progress(Arc::new(f))
    }

    pub fn error(f: impl Fn(&ErrorNotice) + Send + Sync + 'static) -> Self {
        Callback::Error(Arc::new(f))
    }

    pub fn completion(f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Callback::Completion(Arc::new(f))
    }

    pub fn event(f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Callback::Event(Arc::new(f))
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::Progress(_) => CallbackKind::Progress,
            Callback::Error(_) => CallbackKind::Error,
            Callback::Completion(_) => CallbackKind::Completion,
            Callback::Event(_) => CallbackKind::Event,
        }
    }

    /// Trampoline the engine calls for this kind
    pub(crate) fn trampoline(&self) -> *const c_void {
        match self {
            Callback::Progress(_) => progress_trampoline as anidb_progress_callback_t as *const c_void,
            Callback::Error(_) => error_trampoline as anidb_error_callback_t as *const c_void,
            Callback::Completion(_) => completion_trampoline as anidb_completion_callback_t as *const c_void,
            Callback::Event(_) => event_trampoline as anidb_event_callback_t as *const c_void,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback::{:?}", self.kind())
    }
}

/// Closures reachable from one context pointer
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub progress: Option<ProgressCallback>,
    pub error: Option<ErrorCallback>,
    pub completion: Option<CompletionCallback>,
    pub event: Option<EventCallback>,
}

impl Handlers {
    /// Context pointer handed to the engine; valid while `self` neither moves nor drops
    pub fn as_context(&self) -> *mut c_void {
        self as *const Handlers as *mut c_void
    }
}

impl From<Callback> for Handlers {
    fn from(callback: Callback) -> Self {
        let mut handlers = Handlers::default();
        match callback {
            Callback::Progress(f) => handlers.progress = Some(f),
            Callback::Error(f) => handlers.error = Some(f),
            Callback::Completion(f) => handlers.completion = Some(f),
            Callback::Event(f) => handlers.event = Some(f),
        }
        handlers
    }
}

thread_local! {
    static CALLBACK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while this thread runs a caller closure on behalf of the engine
pub(crate) fn in_callback() -> bool {
    CALLBACK_DEPTH.with(|depth| depth.get() > 0)
}

/// Run caller code without letting a panic unwind into the engine
fn guarded(kind: &'static str, f: impl FnOnce()) {
    CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let outcome = catch_unwind(AssertUnwindSafe(f));
    CALLBACK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    if outcome.is_err() {
        error!(kind, "panic in callback discarded");
    }
}

/// # Safety
/// `user_data` must be NULL or point at a live `Handlers`.
unsafe fn handlers<'a>(user_data: *mut c_void) -> Option<&'a Handlers> {
    (user_data as *const Handlers).as_ref()
}

pub(crate) unsafe extern "C" fn progress_trampoline(
    percentage: f32,
    bytes_processed: u64,
    total_bytes: u64,
    user_data: *mut c_void,
) {
    guarded("progress", || {
        if let Some(f) = handlers(user_data).and_then(|h| h.progress.clone()) {
            f(Progress {
                percentage,
                bytes_processed,
                total_bytes,
            });
        }
    });
}

pub(crate) unsafe extern "C" fn error_trampoline(
    error_code: anidb_result_t,
    error_message: *const c_char,
    file_path: *const c_char,
    user_data: *mut c_void,
) {
    guarded("error", || {
        let Some(f) = handlers(user_data).and_then(|h| h.error.clone()) else {
            return;
        };
        let message = read_text(error_message).ok().flatten().unwrap_or_default();
        let path = read_text(file_path).ok().flatten().map(PathBuf::from);
        f(&ErrorNotice {
            kind: ErrorKind::from_code(error_code),
            code: error_code,
            message,
            path,
        });
    });
}

pub(crate) unsafe extern "C" fn completion_trampoline(result: anidb_result_t, user_data: *mut c_void) {
    guarded("completion", || {
        if let Some(f) = handlers(user_data).and_then(|h| h.completion.clone()) {
            f(result == ResultCode::Success.raw());
        }
    });
}

pub(crate) unsafe extern "C" fn event_trampoline(event: *const anidb_event_t, user_data: *mut c_void) {
    guarded("event", || {
        let (Some(raw), Some(f)) = (event.as_ref(), handlers(user_data).and_then(|h| h.event.clone())) else {
            return;
        };
        match decode(raw) {
            Ok(event) => f(&event),
            Err(err) => warn!(error = %err, "dropping undecodable event"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[test]
    fn test_kind_follows_variant() {
        assert_eq!(Callback::progress(|_| {}).kind(), CallbackKind::Progress);
        assert_eq!(Callback::error(|_| {}).kind(), CallbackKind::Error);
        assert_eq!(Callback::completion(|_| {}).kind(), CallbackKind::Completion);
        assert_eq!(Callback::event(|_| {}).kind(), CallbackKind::Event);
    }

    #[test]
    fn test_progress_trampoline_forwards() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let handlers = Handlers::from(Callback::progress(move |p| sink.store(p.bytes_processed, Ordering::SeqCst)));
        unsafe { progress_trampoline(50.0, 512, 1024, handlers.as_context()) };
        assert_eq!(seen.load(Ordering::SeqCst), 512);
    }

    #[test]
    fn test_panic_does_not_escape() {
        let handlers = Handlers::from(Callback::completion(|_| panic!("caller bug")));
        unsafe { completion_trampoline(0, handlers.as_context()) };
    }

    #[test]
    fn test_null_pointers_ignored() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handlers = Handlers::from(Callback::event(move |_| flag.store(true, Ordering::SeqCst)));
        unsafe {
            event_trampoline(std::ptr::null(), handlers.as_context());
            event_trampoline(&anidb_event_t::default(), std::ptr::null_mut());
        }
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_callback_depth_tracks_trampolines() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let handlers = Handlers::from(Callback::completion(move |_| flag.store(in_callback(), Ordering::SeqCst)));
        assert!(!in_callback());
        unsafe { completion_trampoline(0, handlers.as_context()) };
        assert!(seen.load(Ordering::SeqCst));
        assert!(!in_callback());

        let panicking = Handlers::from(Callback::completion(|_| panic!("caller bug")));
        unsafe { completion_trampoline(0, panicking.as_context()) };
        assert!(!in_callback());
    }

    #[test]
    fn test_closure_survives_context_drop() {
        // The context is released from inside the closure, as a self-unregistering callback would.
        let slot: Arc<parking_lot::Mutex<Option<Box<Handlers>>>> = Arc::new(parking_lot::Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));
        let (slot_inner, counter) = (Arc::clone(&slot), Arc::clone(&calls));
        let handlers = Box::new(Handlers::from(Callback::progress(move |_| {
            drop(slot_inner.lock().take());
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let context = handlers.as_context();
        *slot.lock() = Some(handlers);
        unsafe { progress_trampoline(1.0, 1, 1, context) };
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(slot.lock().is_none());
    }

    #[test]
    fn test_completion_reports_success_flag() {
        let outcome = Arc::new(AtomicU64::new(7));
        let sink = Arc::clone(&outcome);
        let handlers = Handlers::from(Callback::completion(move |ok| sink.store(u64::from(ok), Ordering::SeqCst)));
        unsafe { completion_trampoline(ResultCode::Network.raw(), handlers.as_context()) };
        assert_eq!(outcome.load(Ordering::SeqCst), 0);
        unsafe { completion_trampoline(ResultCode::Success.raw(), handlers.as_context()) };
        assert_eq!(outcome.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_trampoline_builds_notice() {
        let notices = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&notices);
        let handlers = Handlers::from(Callback::error(move |n| sink.lock().push(n.clone())));
        let message = std::ffi::CString::new("gone").unwrap();
        let path = std::ffi::CString::new("/a.mkv").unwrap();
        unsafe { error_trampoline(3, message.as_ptr(), path.as_ptr(), handlers.as_context()) };
        let notices = notices.lock();
        assert_eq!(notices[0].kind, ErrorKind::FileNotFound);
        assert_eq!(notices[0].message, "gone");
        assert_eq!(notices[0].path.as_deref(), Some(std::path::Path::new("/a.mkv")));
    }
}
