use std::io::Write;
use std::path::{Path, PathBuf};

use anidb_abi::LIBRARY_FILE_NAME;
use anidb_client::{HashAlgorithm, Library, ProcessOptions, Session, Status, ANIDB_ABI_VERSION};

/// The stand-in engine's shared library, built next to this test binary
fn built_engine() -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    let (stem, extension) = LIBRARY_FILE_NAME.rsplit_once('.').unwrap();
    let hashed = |path: &Path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(&format!(".{extension}")))
            .is_some_and(|name| name.starts_with(&format!("{stem}-")))
    };

    let found = [Some(deps), deps.parent()]
        .into_iter()
        .flatten()
        .find_map(|dir| {
            let exact = dir.join(LIBRARY_FILE_NAME);
            if exact.is_file() {
                return Some(exact);
            }
            std::fs::read_dir(dir)
                .ok()?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .find(|path| hashed(path))
        })
        .unwrap_or_else(|| panic!("{LIBRARY_FILE_NAME} not found near {}", exe.display()));
    found
}

#[test]
fn test_loaded_engine_processes_a_file() {
    let library = Library::open(built_engine()).unwrap();
    assert_eq!(library.abi_version(), ANIDB_ABI_VERSION);
    assert!(!library.version().unwrap().is_empty());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"loaded through the system loader").unwrap();

    let session = Session::create(library.clone(), None).unwrap();
    let options = ProcessOptions::with_algorithms(vec![HashAlgorithm::Ed2k, HashAlgorithm::Crc32]);
    let result = session.process_file(file.path(), Some(&options)).unwrap();
    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.hashes.len(), 2);
    assert_eq!(
        result.hash(HashAlgorithm::Crc32).map(str::len),
        Some(HashAlgorithm::Crc32.text_len())
    );
    session.close().unwrap();
    assert_eq!(library.outstanding_allocations(), 0);
}
