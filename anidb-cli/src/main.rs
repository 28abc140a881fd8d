//! anidb CLI
//!
//! Command-line interface over the anidb engine bindings.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use anidb_client::{
    BatchOptions, Config, FileResult, HashAlgorithm, Library, ProcessOptions, Session,
};

#[derive(Parser)]
#[command(name = "anidb")]
#[command(about = "anidb - hash and identify anime files through the native engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine library to load instead of searching for it
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// YAML session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a single file with one algorithm
    Hash {
        file: PathBuf,

        #[arg(short, long, default_value = "ed2k")]
        algorithm: HashAlgorithm,
    },

    /// Process a file and print its result as JSON
    Process {
        file: PathBuf,

        /// Algorithms to compute, repeatable
        #[arg(short, long = "algorithm", default_value = "ed2k")]
        algorithms: Vec<HashAlgorithm>,

        /// Recompute even when cached
        #[arg(long)]
        verify: bool,

        /// Report progress on stderr
        #[arg(long)]
        progress: bool,
    },

    /// Process several files
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long = "algorithm", default_value = "ed2k")]
        algorithms: Vec<HashAlgorithm>,

        #[arg(long, default_value_t = 4)]
        max_concurrent: u32,

        /// Abort at the first failing file
        #[arg(long)]
        stop_on_error: bool,

        /// Reuse cached digests
        #[arg(long)]
        skip_existing: bool,
    },

    /// Identify a file by ED2K hash and size, or hash it first
    Identify {
        /// File to hash, or an ED2K hash when --size is given
        target: String,

        #[arg(long)]
        size: Option<u64>,
    },

    /// Inspect or clear the engine cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show engine version and capabilities
    Info,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print entry count and size
    Stats,
    /// Drop all cached digests
    Clear,
    /// Check whether a file's digest is cached
    Check {
        file: PathBuf,

        #[arg(short, long, default_value = "ed2k")]
        algorithm: HashAlgorithm,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    let library = load_library(cli.library.as_deref())?;
    let config = cli
        .config
        .as_deref()
        .map(Config::from_yaml_file)
        .transpose()
        .context("Failed to load configuration")?;

    if let Commands::Info = cli.command {
        return show_info(&library);
    }

    let session = Arc::new(Session::create(Arc::clone(&library), config.as_ref()).context("Failed to create session")?);
    let outcome = match cli.command {
        Commands::Hash { file, algorithm } => {
            let digest = session
                .hash_file(&file, algorithm)
                .with_context(|| format!("Failed to hash {}", file.display()))?;
            println!("{digest}  {}", file.display());
            Ok(())
        }
        Commands::Process {
            file,
            algorithms,
            verify,
            progress,
        } => process_file(&session, file, algorithms, verify, progress).await,
        Commands::Batch {
            files,
            algorithms,
            max_concurrent,
            stop_on_error,
            skip_existing,
        } => {
            let options = BatchOptions {
                max_concurrent,
                continue_on_error: !stop_on_error,
                skip_existing,
                ..BatchOptions::with_algorithms(algorithms)
            };
            process_batch(&session, files, options).await
        }
        Commands::Identify { target, size } => identify(&session, &target, size),
        Commands::Cache { action } => cache(&session, action),
        Commands::Info => Ok(()),
    };

    session.close().context("Failed to close session")?;
    outcome
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

fn load_library(path: Option<&Path>) -> Result<Arc<Library>> {
    let library = match path {
        Some(path) => Library::open(path),
        None => Library::global(),
    }
    .context("Failed to load the anidb engine")?;
    info!(origin = %library.origin(), "Engine loaded");
    Ok(library)
}

fn show_info(library: &Library) -> Result<()> {
    let algorithms: Vec<Value> = HashAlgorithm::ALL
        .iter()
        .map(|algorithm| {
            json!({
                "id": algorithm.raw(),
                "name": library.algorithm_name(*algorithm).unwrap_or_else(|| algorithm.to_string()),
                "buffer_size": algorithm.buffer_size(),
            })
        })
        .collect();
    let info = json!({
        "library": library.origin(),
        "version": library.version()?,
        "abi_version": library.abi_version(),
        "algorithms": algorithms,
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn file_json(result: &FileResult) -> Value {
    let hashes: serde_json::Map<String, Value> = result
        .hashes
        .iter()
        .map(|(algorithm, digest)| (algorithm.to_string(), Value::from(digest.as_str())))
        .collect();
    json!({
        "path": result.path,
        "size": result.size,
        "status": format!("{:?}", result.status),
        "hashes": hashes,
        "processing_time_ms": result.processing_time_ms,
        "error": result.error,
    })
}

async fn process_file(
    session: &Arc<Session>,
    file: PathBuf,
    algorithms: Vec<HashAlgorithm>,
    verify: bool,
    progress: bool,
) -> Result<()> {
    let mut options = ProcessOptions {
        verify_existing: verify,
        enable_progress: progress,
        ..ProcessOptions::with_algorithms(algorithms)
    };
    if progress {
        options = options.on_progress(|p| eprint!("\r{:6.2}% ({}/{} bytes)", p.percentage, p.bytes_processed, p.total_bytes));
    }

    let result = session
        .process_file_async(&file, Some(options))
        .await
        .with_context(|| format!("Failed to process {}", file.display()))?;
    if progress {
        eprintln!();
    }
    println!("{}", serde_json::to_string_pretty(&file_json(&result))?);
    Ok(())
}

async fn process_batch(session: &Arc<Session>, files: Vec<PathBuf>, options: BatchOptions) -> Result<()> {
    let batch = session
        .process_batch_async(files, Some(options))
        .await
        .context("Batch processing failed")?;

    info!(
        total = batch.total_files,
        successful = batch.successful_files,
        failed = batch.failed_files,
        "Batch complete"
    );
    let report = json!({
        "total_files": batch.total_files,
        "successful_files": batch.successful_files,
        "failed_files": batch.failed_files,
        "total_time_ms": batch.total_time_ms,
        "results": batch.results.iter().map(file_json).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if batch.failed_files > 0 {
        anyhow::bail!("{} of {} files failed", batch.failed_files, batch.total_files);
    }
    Ok(())
}

fn identify(session: &Session, target: &str, size: Option<u64>) -> Result<()> {
    let (ed2k, size) = match size {
        Some(size) => (target.to_string(), size),
        None => {
            let path = Path::new(target);
            let result = session
                .process_file(path, None)
                .with_context(|| format!("Failed to hash {target}"))?;
            let ed2k = result
                .hash(HashAlgorithm::Ed2k)
                .context("Engine returned no ED2K digest")?
                .to_string();
            (ed2k, result.size)
        }
    };

    match session.identify(&ed2k, size).context("Identification failed")? {
        Some(anime) => println!("{}", serde_json::to_string_pretty(&anime)?),
        None => {
            warn!(ed2k = %ed2k, size, "No match");
            println!("not found");
        }
    }
    Ok(())
}

fn cache(session: &Session, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Stats => {
            let stats = session.cache_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        CacheAction::Clear => {
            session.cache_clear()?;
            println!("cache cleared");
        }
        CacheAction::Check { file, algorithm } => {
            let cached = session.cache_contains(&file, algorithm)?;
            println!("{}: {}", file.display(), if cached { "cached" } else { "not cached" });
        }
    }
    Ok(())
}
