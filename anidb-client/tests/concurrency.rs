use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use anidb_client::{AnidbError, Callback, Config, ErrorKind, Library, ProcessOptions, Session};

/// Small chunks so a few megabytes produce many progress notifications
fn session() -> Arc<Session> {
    let config = Config {
        chunk_size: 16 * 1024,
        ..Config::default()
    };
    Arc::new(Session::create(Library::from_api(anidb_mock::api()), Some(&config)).unwrap())
}

fn large_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&vec![7u8; 2 * 1024 * 1024]).unwrap();
    file
}

/// Sets its flag when dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_unregister_while_engine_is_notifying() {
    let session = session();
    let file = large_file();
    let dropped = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Barrier::new(2));
    let resume = Arc::new(Barrier::new(2));

    let guard = DropFlag(Arc::clone(&dropped));
    let (seen_dropped, late, count) = (Arc::clone(&dropped), Arc::clone(&late_calls), Arc::clone(&calls));
    let (entered, proceed) = (Arc::clone(&started), Arc::clone(&resume));
    let id = session
        .register_callback(Callback::progress(move |_| {
            let _ = &guard;
            if seen_dropped.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::SeqCst);
            }
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                entered.wait();
                proceed.wait();
                thread::sleep(Duration::from_millis(2));
            }
        }))
        .unwrap();

    thread::scope(|scope| {
        let worker = scope.spawn(|| session.process_file(file.path(), None));
        started.wait();
        session.unregister_callback(id).unwrap();
        // The engine is still inside the closure; it must outlive the unregister.
        assert!(!dropped.load(Ordering::SeqCst));
        resume.wait();
        assert!(worker.join().unwrap().is_ok());
    });

    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.registered_callbacks(), 0);
}

#[test]
fn test_close_waits_for_in_flight_processing() {
    let session = session();
    let file = large_file();
    let handle = session.as_raw().unwrap();
    let started = Arc::new(Barrier::new(2));
    let resume = Arc::new(Barrier::new(2));
    let inside = Arc::new(Mutex::new(None));

    let weak: Weak<Session> = Arc::downgrade(&session);
    let first = Arc::new(AtomicBool::new(true));
    let (entered, proceed, observed) = (Arc::clone(&started), Arc::clone(&resume), Arc::clone(&inside));
    let options = ProcessOptions::default().on_progress(move |_| {
        if first.swap(false, Ordering::SeqCst) {
            entered.wait();
            proceed.wait();
            if let Some(session) = weak.upgrade() {
                *observed.lock() = Some(matches!(session.cache_stats(), Err(AnidbError::HandleClosed)));
            }
        }
    });

    thread::scope(|scope| {
        let worker = scope.spawn(|| session.process_file(file.path(), Some(&options)));
        started.wait();
        let closer = scope.spawn(|| session.close());
        while !session.is_closed() {
            thread::yield_now();
        }
        // Destroy must wait for the call still inside the engine.
        assert!(anidb_mock::set_network_available(handle, true));
        resume.wait();
        assert!(worker.join().unwrap().is_ok());
        assert!(closer.join().unwrap().is_ok());
    });

    assert!(session.is_closed());
    assert_eq!(*inside.lock(), Some(true));
    assert!(!anidb_mock::set_network_available(handle, true));
    assert_eq!(session.library().outstanding_allocations(), 0);
}

#[test]
fn test_close_from_progress_callback_is_deferred() {
    let session = session();
    let file = large_file();
    let handle = session.as_raw().unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let weak = Arc::downgrade(&session);
    let sink = Arc::clone(&outcome);
    let options = ProcessOptions::default().on_progress(move |_| {
        if let Some(session) = weak.upgrade() {
            let mut outcome = sink.lock();
            if outcome.is_none() {
                *outcome = Some(session.close().is_ok());
            }
        }
    });

    let result = session.process_file(file.path(), Some(&options)).unwrap();
    assert_eq!(result.size, 2 * 1024 * 1024);
    assert_eq!(*outcome.lock(), Some(true));
    assert!(session.is_closed());
    assert!(!anidb_mock::set_network_available(handle, true));
    assert!(matches!(session.cache_stats(), Err(AnidbError::HandleClosed)));
    session.close().unwrap();
}

#[test]
fn test_cache_clear_from_progress_callback_fails_fast() {
    let session = session();
    let file = large_file();
    let outcome = Arc::new(Mutex::new(None));
    let weak = Arc::downgrade(&session);
    let sink = Arc::clone(&outcome);
    let options = ProcessOptions::default().on_progress(move |_| {
        if let Some(session) = weak.upgrade() {
            let mut outcome = sink.lock();
            if outcome.is_none() {
                *outcome = Some(session.cache_clear().map_err(|err| err.kind()));
            }
        }
    });

    session.process_file(file.path(), Some(&options)).unwrap();
    assert_eq!(*outcome.lock(), Some(Err(Some(ErrorKind::Busy))));
    session.cache_clear().unwrap();
    assert_eq!(session.cache_stats().unwrap().entries, 0);
}

#[test]
fn test_close_while_event_closure_reenters_session() {
    let session = session();
    let handle = session.as_raw().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let reentered = Arc::new(AtomicBool::new(false));

    let weak = Arc::downgrade(&session);
    let (gate, returned) = (Arc::clone(&entered), Arc::clone(&reentered));
    session
        .connect_events(move |_| {
            if let Some(session) = weak.upgrade() {
                gate.wait();
                thread::sleep(Duration::from_millis(50));
                // Either outcome is fine once close has started; it must not block.
                let _ = session.cache_stats();
                returned.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

    assert!(anidb_mock::emit_memory_warning(handle, 900, 1000));
    entered.wait();

    let (done, finished) = mpsc::channel();
    let closer = Arc::clone(&session);
    thread::spawn(move || {
        let _ = done.send(closer.close());
    });
    let closed = finished.recv_timeout(Duration::from_secs(5)).expect("close did not return");
    assert!(closed.is_ok());
    assert!(reentered.load(Ordering::SeqCst));
    assert!(!anidb_mock::is_event_stream_connected(handle));
    assert!(session.is_closed());
}

#[test]
fn test_event_closure_disconnects_itself() {
    let session = session();
    let handle = session.as_raw().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let weak = Arc::downgrade(&session);
    let count = Arc::clone(&calls);
    let (done, disconnected) = mpsc::channel();
    let done = Mutex::new(done);
    session
        .connect_events(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            if let Some(session) = weak.upgrade() {
                let _ = done.lock().send(session.disconnect_events());
            }
        })
        .unwrap();

    assert!(anidb_mock::emit_memory_warning(handle, 1, 2));
    assert!(anidb_mock::emit_memory_warning(handle, 1, 2));
    let outcome = disconnected.recv_timeout(Duration::from_secs(5)).expect("no delivery");
    assert!(outcome.is_ok());
    assert!(!session.events_connected());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    session.close().unwrap();
}
