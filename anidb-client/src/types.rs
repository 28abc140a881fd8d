//! Caller-facing value types

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use anidb_abi::{HashAlgorithm, IdentificationSource, Status};

use crate::callback::{CompletionCallback, Progress, ProgressCallback};
use crate::error::{AnidbError, Result};

const MIN_CHUNK_SIZE: u64 = 1024;

/// Session configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub max_concurrent_files: u32,
    pub chunk_size: u64,
    /// 0 lets the engine pick
    pub max_memory_usage: u64,
    pub enable_debug_logging: bool,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".anidb_cache"),
            max_concurrent_files: 4,
            chunk_size: 64 * 1024,
            max_memory_usage: 0,
            enable_debug_logging: false,
            username: None,
            password: None,
            client_name: None,
            client_version: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("cache_dir", &self.cache_dir)
            .field("max_concurrent_files", &self.max_concurrent_files)
            .field("chunk_size", &self.chunk_size)
            .field("max_memory_usage", &self.max_memory_usage)
            .field("enable_debug_logging", &self.enable_debug_logging)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .finish()
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_files < 1 {
            return Err(AnidbError::validation("max_concurrent_files must be at least 1"));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(AnidbError::validation(format!(
                "chunk_size must be at least {MIN_CHUNK_SIZE} bytes"
            )));
        }
        Ok(())
    }

    /// Load a YAML configuration file; missing fields take their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| AnidbError::validation(format!("cannot read {}: {err}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|err| AnidbError::validation(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

fn check_algorithms(algorithms: &[HashAlgorithm]) -> Result<()> {
    if algorithms.is_empty() {
        return Err(AnidbError::validation("At least one hash algorithm must be specified"));
    }
    Ok(())
}

fn parse_raw_algorithms(raw: &[i32]) -> Result<Vec<HashAlgorithm>> {
    raw.iter()
        .map(|value| HashAlgorithm::try_from(*value).map_err(|err| AnidbError::validation(err.to_string())))
        .collect()
}

/// Options for processing one file
#[derive(Clone)]
pub struct ProcessOptions {
    /// Order preserving; duplicates are allowed
    pub algorithms: Vec<HashAlgorithm>,
    pub enable_progress: bool,
    /// Recompute even when the engine has cached digests
    pub verify_existing: bool,
    pub progress: Option<ProgressCallback>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            algorithms: vec![HashAlgorithm::Ed2k],
            enable_progress: true,
            verify_existing: false,
            progress: None,
        }
    }
}

impl ProcessOptions {
    pub fn with_algorithms(algorithms: impl Into<Vec<HashAlgorithm>>) -> Self {
        Self {
            algorithms: algorithms.into(),
            ..Self::default()
        }
    }

    /// Options from raw algorithm ids; unknown ids are rejected here
    pub fn from_raw_algorithms(raw: &[i32]) -> Result<Self> {
        Ok(Self::with_algorithms(parse_raw_algorithms(raw)?))
    }

    pub fn on_progress(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(std::sync::Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_algorithms(&self.algorithms)
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("algorithms", &self.algorithms)
            .field("enable_progress", &self.enable_progress)
            .field("verify_existing", &self.verify_existing)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Options for a batch
#[derive(Clone)]
pub struct BatchOptions {
    pub algorithms: Vec<HashAlgorithm>,
    /// Advisory; passed to the engine unmodified
    pub max_concurrent: u32,
    pub continue_on_error: bool,
    pub skip_existing: bool,
    pub progress: Option<ProgressCallback>,
    pub completion: Option<CompletionCallback>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            algorithms: vec![HashAlgorithm::Ed2k],
            max_concurrent: 4,
            continue_on_error: true,
            skip_existing: false,
            progress: None,
            completion: None,
        }
    }
}

impl BatchOptions {
    pub fn with_algorithms(algorithms: impl Into<Vec<HashAlgorithm>>) -> Self {
        Self {
            algorithms: algorithms.into(),
            ..Self::default()
        }
    }

    pub fn on_progress(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(std::sync::Arc::new(f));
        self
    }

    pub fn on_completion(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.completion = Some(std::sync::Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_algorithms(&self.algorithms)?;
        if self.max_concurrent < 1 {
            return Err(AnidbError::validation("max_concurrent must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("algorithms", &self.algorithms)
            .field("max_concurrent", &self.max_concurrent)
            .field("continue_on_error", &self.continue_on_error)
            .field("skip_existing", &self.skip_existing)
            .finish_non_exhaustive()
    }
}

/// Outcome of processing one file
#[derive(Debug, Clone, PartialEq)]
pub struct FileResult {
    pub path: PathBuf,
    pub size: u64,
    pub status: Status,
    /// Hex digests, base32 for TTH
    pub hashes: BTreeMap<HashAlgorithm, String>,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl FileResult {
    pub fn hash(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.hashes.get(&algorithm).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Completed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub results: Vec<FileResult>,
    pub total_files: u64,
    pub successful_files: u64,
    pub failed_files: u64,
    pub total_time_ms: u64,
}

/// Identification record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnimeInfo {
    pub anime_id: u64,
    pub episode_id: u64,
    pub title: String,
    pub episode_number: u32,
    /// 0.0 to 1.0
    pub confidence: f64,
    #[serde(serialize_with = "serialize_source")]
    pub source: IdentificationSource,
}

fn serialize_source<S: serde::Serializer>(source: &IdentificationSource, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let name = match source {
        IdentificationSource::RemoteDatabase => "remote_database",
        IdentificationSource::Cache => "cache",
        IdentificationSource::Filename => "filename",
    };
    serializer.serialize_str(name)
}

/// Cache occupancy reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_dir, PathBuf::from(".anidb_cache"));
    }

    #[test]
    fn test_config_rejects_small_values() {
        let config = Config {
            max_concurrent_files: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AnidbError::Validation(_))));

        let config = Config {
            chunk_size: 512,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AnidbError::Validation(_))));
    }

    #[test]
    fn test_config_from_yaml() {
        let config = Config::from_yaml_str("cache_dir: /tmp/anidb\nchunk_size: 131072\nusername: alice\n").unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/anidb"));
        assert_eq!(config.chunk_size, 131072);
        assert_eq!(config.max_concurrent_files, 4);
        assert_eq!(config.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_config_yaml_is_validated() {
        assert!(Config::from_yaml_str("chunk_size: 10\n").is_err());
    }

    #[test]
    fn test_password_not_printed() {
        let config = Config {
            password: Some("hunter2".into()),
            ..Config::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_empty_algorithms_rejected() {
        let err = ProcessOptions::with_algorithms(Vec::new()).validate().unwrap_err();
        assert!(err.to_string().contains("At least one hash algorithm"));
        assert!(BatchOptions::with_algorithms(Vec::new()).validate().is_err());
    }

    #[test]
    fn test_raw_algorithms_validated() {
        let options = ProcessOptions::from_raw_algorithms(&[1, 5, 1]).unwrap();
        assert_eq!(
            options.algorithms,
            vec![HashAlgorithm::Ed2k, HashAlgorithm::Tth, HashAlgorithm::Ed2k]
        );
        assert!(matches!(
            ProcessOptions::from_raw_algorithms(&[1, 9]),
            Err(AnidbError::Validation(_))
        ));
    }

    #[test]
    fn test_batch_concurrency_must_be_positive() {
        let options = BatchOptions {
            max_concurrent: 0,
            ..BatchOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
