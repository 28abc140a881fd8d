//! Session lifecycle
//!
//! A [`Session`] owns one native handle. The handle slot sits behind a
//! read/write lock: ordinary calls hold a read guard for the duration of the
//! native call, while destroy and `cache_clear` take the write guard. The
//! closed check and the destroy call therefore never race.
//!
//! The callback registry and the event connection live behind a mutex that
//! is always taken after the handle lock. The engine may still invoke a
//! callback it looked up before `unregister_callback` returned, so dropped
//! closures are retired and freed only once no native call is in flight.
//!
//! Code running inside a callback never blocks on the write guard. A close
//! requested there is deferred to the last in-flight call, and `cache_clear`
//! fails with [`ErrorKind::Busy`](crate::ErrorKind::Busy) when it cannot
//! proceed at once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use anidb_abi::{
    anidb_anime_info_t, anidb_batch_result_t, anidb_event_t, anidb_file_result_t, anidb_session_t, HashAlgorithm,
    ResultCode, LAST_ERROR_BUFFER_SIZE,
};

use crate::callback::{event_trampoline, in_callback, Callback, Handlers};
use crate::error::{AnidbError, ErrorKind, Result};
use crate::event::{decode, Event};
use crate::marshal::{
    take_anime_info, take_batch_result, take_file_result, NativeAllocation, NativeText, RawBatchOptions, RawConfig,
    RawProcessOptions,
};
use crate::native::Library;
use crate::types::{AnimeInfo, BatchOptions, BatchResult, CacheStats, Config, FileResult, ProcessOptions};

/// Live native handle
struct RawSession(*mut anidb_session_t);

// SAFETY: the engine's session functions may be called from any thread.
unsafe impl Send for RawSession {}
unsafe impl Sync for RawSession {}

#[derive(Default)]
struct Registry {
    callbacks: BTreeMap<u64, Arc<Handlers>>,
    events: Option<Arc<Handlers>>,
    /// Detached closures the engine may still be running
    retired: Vec<Arc<Handlers>>,
}

/// A session with the native engine
pub struct Session {
    library: Arc<Library>,
    handle: RwLock<Option<RawSession>>,
    registry: Mutex<Registry>,
    /// Set by the first `close`; the handle is destroyed once the write guard is free
    closing: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("library", &self.library.origin())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Create a session on `library`, with the engine defaults when `config` is `None`
    pub fn create(library: Arc<Library>, config: Option<&Config>) -> Result<Self> {
        let raw_config = match config {
            Some(config) => {
                config.validate()?;
                Some(RawConfig::new(config)?)
            }
            None => None,
        };
        library.ensure_initialized()?;

        let api = library.api();
        let mut handle = ptr::null_mut();
        let code = match &raw_config {
            Some(raw) => {
                let view = raw.as_raw();
                unsafe { (api.session_create_with_config)(&view, &mut handle) }
            }
            None => unsafe { (api.session_create)(&mut handle) },
        };
        if code != ResultCode::Success.raw() || handle.is_null() {
            let code = if code == ResultCode::Success.raw() {
                ResultCode::InvalidHandle.raw()
            } else {
                code
            };
            return Err(AnidbError::from_result(code, library.error_string(code), None));
        }

        debug!(handle = handle as usize, origin = %library.origin(), "session created");
        Ok(Self {
            library,
            handle: RwLock::new(Some(RawSession(handle))),
            registry: Mutex::new(Registry::default()),
            closing: AtomicBool::new(false),
        })
    }

    /// Create a session on the process-wide library
    pub fn open(config: Option<&Config>) -> Result<Self> {
        Self::create(Library::global()?, config)
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// True once `close` was called, even while the destroy is still deferred
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.handle.read_recursive().is_none()
    }

    /// Native handle for engine-specific entry points; `None` once closed
    ///
    /// The pointer must not be used after [`Session::close`].
    pub fn as_raw(&self) -> Option<*mut anidb_session_t> {
        if self.closing.load(Ordering::Acquire) {
            return None;
        }
        self.handle.read_recursive().as_ref().map(|raw| raw.0)
    }

    /// Run `f` with the live handle under the read lock
    ///
    /// Recursive read: callbacks running inside a native call may use the
    /// session again even while a writer is waiting.
    fn with_handle<T>(&self, f: impl FnOnce(*mut anidb_session_t) -> Result<T>) -> Result<T> {
        let outcome = {
            let guard = self.handle.read_recursive();
            match guard.as_ref() {
                Some(raw) if !self.closing.load(Ordering::Acquire) => f(raw.0),
                _ => Err(AnidbError::HandleClosed),
            }
        };
        self.settle();
        outcome
    }

    /// Free retired closures and finish a deferred close, if no call is in flight
    fn settle(&self) {
        let closing = self.closing.load(Ordering::Acquire);
        if !closing && self.registry.lock().retired.is_empty() {
            return;
        }
        let Some(slot) = self.handle.try_write() else {
            return;
        };
        if closing {
            if let Err(err) = self.teardown(slot) {
                warn!(error = %err, "deferred close failed");
            }
            return;
        }
        let retired = std::mem::take(&mut self.registry.lock().retired);
        drop(slot);
        debug!(count = retired.len(), "retired callbacks released");
        drop(retired);
    }

    /// Session's last error message, `None` when it cannot be retrieved
    fn last_error(&self, handle: *mut anidb_session_t) -> Option<String> {
        let mut buffer = vec![0u8; LAST_ERROR_BUFFER_SIZE];
        let code = unsafe {
            (self.library.api().session_get_last_error)(handle, buffer.as_mut_ptr().cast(), buffer.len() as u64)
        };
        if code != ResultCode::Success.raw() {
            return None;
        }
        let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
        let message = String::from_utf8_lossy(&buffer[..end]).into_owned();
        (!message.is_empty()).then_some(message)
    }

    /// Turn a non-success code into a typed error, with the engine's message when available
    fn check(&self, handle: *mut anidb_session_t, code: i32, operation: &str, path: Option<&Path>) -> Result<()> {
        if code == ResultCode::Success.raw() {
            return Ok(());
        }
        let message = self.last_error(handle).unwrap_or_else(|| {
            warn!(code, operation, "last error unavailable");
            format!("{operation} failed")
        });
        Err(AnidbError::from_result(code, message, path))
    }

    /// Hash one file with the requested algorithms
    pub fn process_file(&self, path: impl AsRef<Path>, options: Option<&ProcessOptions>) -> Result<FileResult> {
        let path = path.as_ref();
        let defaults = ProcessOptions::default();
        let raw_options = RawProcessOptions::new(options.unwrap_or(&defaults))?;
        let text = NativeText::from_path(path)?;

        self.with_handle(|handle| {
            let view = raw_options.as_raw();
            let mut out: *mut anidb_file_result_t = ptr::null_mut();
            let code = unsafe { (self.library.api().process_file)(handle, text.as_ptr(), &view, &mut out) };
            self.check(handle, code, "process_file", Some(path))?;
            let allocation = unsafe { NativeAllocation::adopt(&self.library, out) }
                .ok_or_else(|| AnidbError::Decode("engine returned no file result".into()))?;
            take_file_result(allocation)
        })
    }

    /// Hash several files
    ///
    /// With `continue_on_error`, failing files come back as FAILED entries.
    /// Otherwise the first failure is returned with the failing path.
    pub fn process_batch<P: AsRef<Path>>(&self, paths: &[P], options: Option<&BatchOptions>) -> Result<BatchResult> {
        let defaults = BatchOptions::default();
        let raw_options = RawBatchOptions::new(options.unwrap_or(&defaults))?;
        let texts = paths
            .iter()
            .map(|path| NativeText::from_path(path.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let pointers: Vec<_> = texts.iter().map(NativeText::as_ptr).collect();

        self.with_handle(|handle| {
            let view = raw_options.as_raw();
            let mut out: *mut anidb_batch_result_t = ptr::null_mut();
            let code = unsafe {
                (self.library.api().process_batch)(
                    handle,
                    pointers.as_ptr(),
                    pointers.len() as u64,
                    &view,
                    &mut out,
                )
            };
            if let Err(err) = self.check(handle, code, "process_batch", None) {
                // Stop-on-error: the message names the failing input.
                return Err(match err {
                    AnidbError::Native { kind, code, message, .. } => {
                        // Longest match wins so `a.mkv` never shadows `a.mkv.part`.
                        let path = paths
                            .iter()
                            .map(|path| path.as_ref())
                            .filter(|path: &&Path| message.contains(&*path.to_string_lossy()))
                            .max_by_key(|path| path.as_os_str().len())
                            .map(Path::to_path_buf);
                        AnidbError::Native { kind, code, message, path }
                    }
                    other => other,
                });
            }
            let allocation = unsafe { NativeAllocation::adopt(&self.library, out) }
                .ok_or_else(|| AnidbError::Decode("engine returned no batch result".into()))?;
            take_batch_result(allocation)
        })
    }

    /// Offload [`Session::process_file`] onto the blocking pool
    ///
    /// The native call cannot be cancelled; dropping the future lets it run to completion.
    pub async fn process_file_async(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        options: Option<ProcessOptions>,
    ) -> Result<FileResult> {
        let session = Arc::clone(self);
        let path = path.into();
        tokio::task::spawn_blocking(move || session.process_file(&path, options.as_ref()))
            .await
            .map_err(|err| AnidbError::TaskFailed(err.to_string()))?
    }

    /// Offload [`Session::process_batch`] onto the blocking pool
    pub async fn process_batch_async(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
        options: Option<BatchOptions>,
    ) -> Result<BatchResult> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.process_batch(&paths, options.as_ref()))
            .await
            .map_err(|err| AnidbError::TaskFailed(err.to_string()))?
    }

    pub fn hash_file(&self, path: impl AsRef<Path>, algorithm: HashAlgorithm) -> Result<String> {
        self.with_handle(|_| self.library.hash_file(path.as_ref(), algorithm))
    }

    pub fn hash_bytes(&self, data: &[u8], algorithm: HashAlgorithm) -> Result<String> {
        self.with_handle(|_| self.library.hash_bytes(data, algorithm))
    }

    /// Look a file up by ED2K hash and size; `Ok(None)` when it is not known
    pub fn identify(&self, ed2k: &str, size: u64) -> Result<Option<AnimeInfo>> {
        let text = NativeText::new(ed2k)?;
        self.with_handle(|handle| {
            let mut out: *mut anidb_anime_info_t = ptr::null_mut();
            let code = unsafe { (self.library.api().identify_file)(handle, text.as_ptr(), size, &mut out) };
            self.check(handle, code, "identify_file", None)?;
            unsafe { NativeAllocation::adopt(&self.library, out) }
                .map(take_anime_info)
                .transpose()
        })
    }

    /// Drop every cached digest; waits for in-flight calls on this session
    ///
    /// From inside a callback it cannot wait and fails with a `Busy` error
    /// while any other call is in flight.
    pub fn cache_clear(&self) -> Result<()> {
        let slot = if in_callback() {
            self.handle.try_write().ok_or_else(|| {
                AnidbError::from_result(
                    ResultCode::Busy.raw(),
                    "cache_clear cannot wait for in-flight calls from inside a callback",
                    None,
                )
            })?
        } else {
            self.handle.write()
        };
        let outcome = match slot.as_ref() {
            Some(raw) if !self.closing.load(Ordering::Acquire) => {
                let code = unsafe { (self.library.api().cache_clear)(raw.0) };
                self.check(raw.0, code, "cache_clear", None)
            }
            _ => Err(AnidbError::HandleClosed),
        };
        drop(slot);
        self.settle();
        outcome
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.with_handle(|handle| {
            let mut entries = 0u64;
            let mut bytes = 0u64;
            let code = unsafe { (self.library.api().cache_get_stats)(handle, &mut entries, &mut bytes) };
            self.check(handle, code, "cache_get_stats", None)?;
            Ok(CacheStats { entries, bytes })
        })
    }

    pub fn cache_contains(&self, path: impl AsRef<Path>, algorithm: HashAlgorithm) -> Result<bool> {
        let path = path.as_ref();
        let text = NativeText::from_path(path)?;
        self.with_handle(|handle| {
            let mut cached = 0u32;
            let code =
                unsafe { (self.library.api().cache_check_file)(handle, text.as_ptr(), algorithm.raw(), &mut cached) };
            self.check(handle, code, "cache_check_file", Some(path))?;
            Ok(cached != 0)
        })
    }

    /// Register a callback; it stays alive until unregistered or the session closes
    pub fn register_callback(&self, callback: Callback) -> Result<u64> {
        let kind = callback.kind();
        let trampoline = callback.trampoline();
        let handlers = Arc::new(Handlers::from(callback));

        self.with_handle(|handle| {
            let mut registry = self.registry.lock();
            let mut id = 0u64;
            let code = unsafe {
                (self.library.api().register_callback)(handle, kind.raw(), trampoline, handlers.as_context(), &mut id)
            };
            if code != ResultCode::Success.raw() {
                debug!(code, ?kind, "callback registration rejected");
                let message = self.last_error(handle).unwrap_or_else(|| self.library.error_string(code));
                return Err(AnidbError::RegistrationFailed {
                    kind: ErrorKind::from_code(code),
                    message,
                });
            }
            if id == 0 {
                return Err(AnidbError::RegistrationFailed {
                    kind: ErrorKind::Unknown,
                    message: "engine returned no callback id".into(),
                });
            }
            registry.callbacks.insert(id, handlers);
            debug!(id, ?kind, "callback registered");
            Ok(id)
        })
    }

    /// Unregister a callback; an id is accepted once
    ///
    /// No new invocation starts after this returns. One already running may
    /// finish, and the closure is dropped once no native call is in flight.
    pub fn unregister_callback(&self, id: u64) -> Result<()> {
        self.with_handle(|handle| {
            let mut registry = self.registry.lock();
            if !registry.callbacks.contains_key(&id) {
                return Err(AnidbError::UnknownCallback(id));
            }
            let code = unsafe { (self.library.api().unregister_callback)(handle, id) };
            self.check(handle, code, "unregister_callback", None)?;
            if let Some(handlers) = registry.callbacks.remove(&id) {
                registry.retired.push(handlers);
            }
            debug!(id, "callback unregistered");
            Ok(())
        })
    }

    /// Number of callbacks currently registered through this session
    pub fn registered_callbacks(&self) -> usize {
        self.registry.lock().callbacks.len()
    }

    /// Connect the event stream; a second connect without disconnect is a usage error
    pub fn connect_events(&self, f: impl Fn(&Event) + Send + Sync + 'static) -> Result<()> {
        self.with_handle(|handle| {
            let mut registry = self.registry.lock();
            // A close that started meanwhile has already detached the stream.
            if self.closing.load(Ordering::Acquire) {
                return Err(AnidbError::HandleClosed);
            }
            if registry.events.is_some() {
                return Err(AnidbError::Usage("event stream already connected".into()));
            }
            let handlers = Arc::new(Handlers::from(Callback::event(f)));
            let code = unsafe { (self.library.api().event_connect)(handle, event_trampoline, handlers.as_context()) };
            self.check(handle, code, "event_connect", None)?;
            registry.events = Some(handlers);
            Ok(())
        })
    }

    /// Disconnect the event stream; does nothing when none is connected
    ///
    /// Waits for a delivery in progress on another thread, which may itself
    /// call back into this session.
    pub fn disconnect_events(&self) -> Result<()> {
        self.with_handle(|handle| self.detach_events(handle))
    }

    /// Disconnect without holding the registry lock across the native call
    fn detach_events(&self, handle: *mut anidb_session_t) -> Result<()> {
        let Some(handlers) = self.registry.lock().events.take() else {
            return Ok(());
        };
        let code = unsafe { (self.library.api().event_disconnect)(handle) };
        if let Err(err) = self.check(handle, code, "event_disconnect", None) {
            self.registry.lock().events = Some(handlers);
            return Err(err);
        }
        self.registry.lock().retired.push(handlers);
        Ok(())
    }

    pub fn events_connected(&self) -> bool {
        self.registry.lock().events.is_some()
    }

    /// Drain up to `max` queued events; undecodable ones are skipped
    pub fn poll_events(&self, max: usize) -> Result<Vec<Event>> {
        if max == 0 {
            return Err(AnidbError::validation("max events must be at least 1"));
        }
        self.with_handle(|handle| {
            let mut buffer = vec![anidb_event_t::default(); max];
            let mut count = 0u64;
            let code = unsafe {
                (self.library.api().event_poll)(handle, buffer.as_mut_ptr(), buffer.len() as u64, &mut count)
            };
            self.check(handle, code, "event_poll", None)?;

            let count = (count as usize).min(buffer.len());
            Ok(buffer[..count]
                .iter()
                .filter_map(|raw| match unsafe { decode(raw) } {
                    Ok(event) => Some(event),
                    Err(err) => {
                        warn!(error = %err, "skipping undecodable event");
                        None
                    }
                })
                .collect())
        })
    }

    /// Close the session; later calls do nothing
    ///
    /// Disconnects the event stream first, waiting for a delivery in
    /// progress. Then waits for in-flight calls, unregisters every callback
    /// and destroys the handle. Closures are dropped only after those calls
    /// return. Called from inside a callback, the destroy is left to the last
    /// in-flight call and this returns at once.
    pub fn close(&self) -> Result<()> {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let guard = self.handle.read_recursive();
            if let Some(raw) = guard.as_ref() {
                if let Err(err) = self.detach_events(raw.0) {
                    warn!(error = %err, "event disconnect failed during close");
                }
            }
        }

        let slot = if in_callback() {
            match self.handle.try_write() {
                Some(slot) => slot,
                None => {
                    debug!("close deferred until in-flight calls return");
                    return Ok(());
                }
            }
        } else {
            self.handle.write()
        };
        self.teardown(slot)
    }

    /// Destroy the handle under the write guard; closures drop after the guard
    fn teardown(&self, mut slot: RwLockWriteGuard<'_, Option<RawSession>>) -> Result<()> {
        let Some(RawSession(handle)) = slot.take() else {
            return Ok(());
        };
        let api = self.library.api();
        let released = std::mem::take(&mut *self.registry.lock());
        if released.events.is_some() {
            let code = unsafe { (api.event_disconnect)(handle) };
            if code != ResultCode::Success.raw() {
                warn!(code, "event disconnect failed during close");
            }
        }
        for id in released.callbacks.keys() {
            let code = unsafe { (api.unregister_callback)(handle, *id) };
            if code != ResultCode::Success.raw() {
                warn!(code, id, "unregister failed during close");
            }
        }

        let code = unsafe { (api.session_destroy)(handle) };
        drop(slot);
        drop(released);
        debug!(handle = handle as usize, "session closed");

        if code != ResultCode::Success.raw() {
            return Err(AnidbError::from_result(code, self.library.error_string(code), None));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            if let Some(handle) = self.handle.get_mut().as_ref().map(|raw| raw.0) {
                if let Err(err) = self.detach_events(handle) {
                    warn!(error = %err, "event disconnect failed on drop");
                }
            }
        }
        if let Err(err) = self.teardown(self.handle.write()) {
            warn!(error = %err, "session close failed on drop");
        }
    }
}
