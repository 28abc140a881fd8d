use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use anidb_client::{
    AnidbError, BatchOptions, Callback, Config, ErrorKind, EventKind, EventPayload, HashAlgorithm,
    IdentificationSource, Library, ProcessOptions, Session, Status,
};
use anidb_mock::AnimeRecord;

fn library() -> Arc<Library> {
    Library::from_api(anidb_mock::api())
}

fn session() -> Session {
    Session::create(library(), None).unwrap()
}

fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file
}

#[test]
fn test_create_close_leaves_nothing_behind() {
    let library = library();
    let invalid_before = anidb_mock::invalid_frees();
    for _ in 0..10 {
        let session = Session::create(Arc::clone(&library), Some(&Config::default())).unwrap();
        let file = temp_file(b"episode");
        session.process_file(file.path(), None).unwrap();
        session.close().unwrap();
    }
    assert_eq!(library.outstanding_allocations(), 0);
    assert_eq!(anidb_mock::invalid_frees(), invalid_before);
}

#[test]
fn test_close_is_idempotent_and_final() {
    let session = session();
    let file = temp_file(b"data");
    session.close().unwrap();
    session.close().unwrap();
    assert!(session.is_closed());
    assert!(session.as_raw().is_none());

    assert!(matches!(session.process_file(file.path(), None), Err(AnidbError::HandleClosed)));
    assert!(matches!(
        session.hash_bytes(b"abc", HashAlgorithm::Md5),
        Err(AnidbError::HandleClosed)
    ));
    assert!(matches!(
        session.register_callback(Callback::progress(|_| {})),
        Err(AnidbError::HandleClosed)
    ));
    assert!(matches!(session.connect_events(|_| {}), Err(AnidbError::HandleClosed)));
}

#[test]
fn test_process_file_returns_requested_digests() {
    let session = session();
    let file = temp_file(&vec![3u8; 200_000]);
    let options = ProcessOptions::with_algorithms([HashAlgorithm::Ed2k, HashAlgorithm::Crc32, HashAlgorithm::Tth]);

    let result = session.process_file(file.path(), Some(&options)).unwrap();
    assert!(result.is_success());
    assert_eq!(result.size, 200_000);
    assert_eq!(result.path, file.path());
    assert_eq!(result.hash(HashAlgorithm::Ed2k).map(str::len), Some(32));
    assert_eq!(result.hash(HashAlgorithm::Crc32).map(str::len), Some(8));
    assert_eq!(result.hash(HashAlgorithm::Tth).map(str::len), Some(39));
    assert!(result.hash(HashAlgorithm::Sha1).is_none());
    assert_eq!(session.library().outstanding_allocations(), 0);
}

#[test]
fn test_process_file_matches_direct_hash() {
    let session = session();
    let file = temp_file(b"the same bytes");
    let result = session.process_file(file.path(), None).unwrap();
    let direct = session.hash_file(file.path(), HashAlgorithm::Ed2k).unwrap();
    assert_eq!(result.hash(HashAlgorithm::Ed2k), Some(direct.as_str()));
    assert_eq!(session.hash_bytes(b"the same bytes", HashAlgorithm::Ed2k).unwrap(), direct);
}

#[test]
fn test_missing_file_is_file_not_found() {
    let session = session();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.mkv");

    let err = session.process_file(&missing, None).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::FileNotFound));
    assert_eq!(err.path(), Some(missing.as_path()));
    assert!(err.to_string().contains("missing.mkv"));
}

#[test]
fn test_empty_inputs_rejected_locally() {
    let session = session();
    let err = session.hash_bytes(&[], HashAlgorithm::Crc32).unwrap_err();
    assert!(matches!(err, AnidbError::Validation(ref m) if m == "Data cannot be empty"));

    let file = temp_file(b"x");
    let options = ProcessOptions::with_algorithms(Vec::new());
    let err = session.process_file(file.path(), Some(&options)).unwrap_err();
    assert!(err.to_string().contains("At least one hash algorithm must be specified"));
}

#[test]
fn test_batch_reports_each_file() {
    let session = session();
    let present = temp_file(b"present");
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.mkv");
    let paths = vec![present.path().to_path_buf(), missing.clone()];

    let batch = session.process_batch(&paths, None).unwrap();
    assert_eq!(batch.total_files, 2);
    assert_eq!(batch.successful_files, 1);
    assert_eq!(batch.failed_files, 1);
    assert_eq!(batch.results.len(), 2);

    let failed = batch.results.iter().find(|r| r.path == missing).unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert!(failed.error.as_deref().is_some_and(|m| !m.is_empty()));
    assert!(failed.hashes.is_empty());
    assert_eq!(session.library().outstanding_allocations(), 0);
}

#[test]
fn test_batch_stop_on_error_names_path() {
    let session = session();
    let present = temp_file(b"present");
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone.mkv");
    let options = BatchOptions {
        continue_on_error: false,
        ..BatchOptions::default()
    };

    let err = session
        .process_batch(&[present.path().to_path_buf(), missing.clone()], Some(&options))
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::FileNotFound));
    assert_eq!(err.path(), Some(missing.as_path()));
}

#[test]
fn test_batch_failure_names_exact_path_not_prefix() {
    let session = session();
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("ep1.mkv");
    std::fs::write(&present, b"complete episode").unwrap();
    let partial = dir.path().join("ep1.mkv.part");
    let options = BatchOptions {
        continue_on_error: false,
        ..BatchOptions::default()
    };

    let err = session
        .process_batch(&[present.clone(), partial.clone()], Some(&options))
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::FileNotFound));
    assert_eq!(err.path(), Some(partial.as_path()));
}

#[test]
fn test_batch_completion_callback() {
    let session = session();
    let file = temp_file(b"one");
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    let options = BatchOptions::default().on_completion(move |ok| *sink.lock() = Some(ok));

    session.process_batch(&[file.path()], Some(&options)).unwrap();
    assert_eq!(*outcome.lock(), Some(true));
}

#[test]
fn test_second_run_served_from_cache() {
    let session = session();
    let file = temp_file(&vec![9u8; 4096]);
    let first = session.process_file(file.path(), None).unwrap();
    assert!(session.cache_contains(file.path(), HashAlgorithm::Ed2k).unwrap());
    assert!(session.cache_stats().unwrap().entries >= 1);

    let second = session.process_file(file.path(), None).unwrap();
    assert_eq!(first.hashes, second.hashes);
    let hits = session
        .poll_events(100)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind() == EventKind::CacheHit)
        .count();
    assert_eq!(hits, 1);

    session.cache_clear().unwrap();
    assert_eq!(session.cache_stats().unwrap().entries, 0);
    assert!(!session.cache_contains(file.path(), HashAlgorithm::Ed2k).unwrap());
}

#[test]
fn test_progress_callback_runs_on_worker() {
    let session = session();
    let file = temp_file(&vec![1u8; 300_000]);
    let calls = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicU64::new(0));
    let (calls_sink, last_sink) = (Arc::clone(&calls), Arc::clone(&last));
    let options = ProcessOptions::default().on_progress(move |p| {
        assert!((0.0..=100.0).contains(&p.percentage));
        calls_sink.fetch_add(1, Ordering::SeqCst);
        last_sink.store(p.bytes_processed, Ordering::SeqCst);
    });

    session.process_file(file.path(), Some(&options)).unwrap();
    assert!(calls.load(Ordering::SeqCst) > 0);
    assert_eq!(last.load(Ordering::SeqCst), 300_000);
}

#[test]
fn test_panicking_callback_is_contained() {
    let session = session();
    let file = temp_file(&vec![2u8; 1024]);
    let options = ProcessOptions::default().on_progress(|_| panic!("caller bug"));
    assert!(session.process_file(file.path(), Some(&options)).is_ok());
}

#[test]
fn test_registered_callbacks() {
    let session = session();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let error_id = session
        .register_callback(Callback::error(move |notice| sink.lock().push(notice.clone())))
        .unwrap();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let event_id = session
        .register_callback(Callback::event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    assert_ne!(error_id, event_id);
    assert_eq!(session.registered_callbacks(), 2);

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.mkv");
    assert!(session.process_file(&missing, None).is_err());
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::FileNotFound);
        assert_eq!(errors[0].path.as_deref(), Some(missing.as_path()));
    }

    let file = temp_file(b"events");
    session.process_file(file.path(), None).unwrap();
    assert!(events.load(Ordering::SeqCst) > 0);

    session.unregister_callback(error_id).unwrap();
    assert!(matches!(
        session.unregister_callback(error_id),
        Err(AnidbError::UnknownCallback(id)) if id == error_id
    ));
    assert_eq!(anidb_mock::registered_callbacks(session.as_raw().unwrap()), 1);
}

#[test]
fn test_close_unregisters_everything() {
    let session = session();
    let handle = session.as_raw().unwrap();
    session.register_callback(Callback::progress(|_| {})).unwrap();
    session.register_callback(Callback::completion(|_| {})).unwrap();
    session.connect_events(|_| {}).unwrap();
    assert_eq!(anidb_mock::registered_callbacks(handle), 2);
    assert!(anidb_mock::is_event_stream_connected(handle));

    session.close().unwrap();
    assert_eq!(session.registered_callbacks(), 0);
    assert!(!session.events_connected());
}

#[test]
fn test_event_stream_delivers_and_rejects_double_connect() {
    let session = session();
    let (sender, receiver) = std::sync::mpsc::channel();
    let sender = Mutex::new(sender);
    session
        .connect_events(move |event| {
            let _ = sender.lock().send(event.clone());
        })
        .unwrap();
    assert!(matches!(session.connect_events(|_| {}), Err(AnidbError::Usage(_))));

    let file = temp_file(b"stream");
    session.process_file(file.path(), None).unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = receiver.recv_timeout(std::time::Duration::from_secs(5)) {
        kinds.push(event.kind());
        if event.kind() == EventKind::FileComplete {
            break;
        }
    }
    assert_eq!(kinds.first(), Some(&EventKind::FileStart));
    assert_eq!(kinds.last(), Some(&EventKind::FileComplete));

    session.disconnect_events().unwrap();
    session.disconnect_events().unwrap();
    session.connect_events(|_| {}).unwrap();
}

#[test]
fn test_poll_memory_warning() {
    let session = session();
    session.poll_events(1000).unwrap();
    assert!(anidb_mock::emit_memory_warning(session.as_raw().unwrap(), 900, 512));

    let events = session.poll_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].payload,
        EventPayload::MemoryWarning {
            current_usage: 900,
            max_usage: 512
        }
    );
    assert!(session.poll_events(10).unwrap().is_empty());
}

#[test]
fn test_poll_skips_undecodable_events() {
    let session = session();
    session.poll_events(1000).unwrap();
    let handle = session.as_raw().unwrap();
    assert!(anidb_mock::emit_raw_event(handle, 77));
    assert!(anidb_mock::emit_memory_warning(handle, 1, 2));

    let events = session.poll_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::MemoryWarning);
}

#[test]
fn test_identify() {
    let session = session();
    let ed2k = "0123456789abcdef0123456789abcdef";
    anidb_mock::seed_identification(
        ed2k,
        734_003_200,
        AnimeRecord {
            anime_id: 42,
            episode_id: 4242,
            title: "Cowboy Bebop".into(),
            episode_number: 1,
            confidence: 0.95,
        },
    );

    let info = session.identify(ed2k, 734_003_200).unwrap().unwrap();
    assert_eq!(info.anime_id, 42);
    assert_eq!(info.title, "Cowboy Bebop");
    assert_eq!(info.source, IdentificationSource::RemoteDatabase);

    let again = session.identify(ed2k, 734_003_200).unwrap().unwrap();
    assert_eq!(again.source, IdentificationSource::Cache);

    assert_eq!(session.identify("ffffffffffffffffffffffffffffffff", 1).unwrap(), None);
    assert_eq!(
        session.identify("not-a-hash", 1).unwrap_err().kind(),
        Some(ErrorKind::InvalidParameter)
    );
    assert_eq!(session.library().outstanding_allocations(), 0);
}

#[test]
fn test_identify_network_failure_differs_from_not_found() {
    let session = session();
    assert!(anidb_mock::set_network_available(session.as_raw().unwrap(), false));
    let err = session.identify("ffffffffffffffffffffffffffffffff", 1).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Network));
}

#[test]
fn test_callbacks_from_many_threads() {
    let session = Arc::new(session());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    session
        .register_callback(Callback::progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let files: Vec<_> = (0..4).map(|i| temp_file(&vec![i as u8; 50_000])).collect();
    let paths: Vec<PathBuf> = files.iter().map(|f| f.path().to_path_buf()).collect();
    std::thread::scope(|scope| {
        for path in &paths {
            let session = Arc::clone(&session);
            scope.spawn(move || session.process_file(path, None).unwrap());
        }
    });
    assert!(calls.load(Ordering::SeqCst) >= paths.len());
    session.close().unwrap();
}

#[test]
fn test_engine_version() {
    let library = library();
    assert!(!library.version().unwrap().is_empty());
    assert_eq!(library.abi_version(), anidb_client::ANIDB_ABI_VERSION);
}
