use std::{
    convert::Infallible,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tiercache::{
    cache::{CacheError, CacheKey, FsStore, MemoryStore, MultiLevelCacheManager},
    config::{self, DigestArgs, LoadError, Settings},
    telemetry::{self, TelemetryError},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const DIGEST_ENTITY: &str = "file-digest";
const DIGEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Derived artifact memoized per input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileDigest {
    path: String,
    bytes: u64,
    lines: u64,
    sha256: String,
}

impl FileDigest {
    fn compute(path: String, content: &[u8]) -> Self {
        let newlines = content.iter().filter(|byte| **byte == b'\n').count() as u64;
        let unterminated = u64::from(content.last().is_some_and(|byte| *byte != b'\n'));
        Self {
            path,
            bytes: content.len() as u64,
            lines: newlines + unterminated,
            sha256: hex::encode(Sha256::digest(content)),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Digest(args) => run_digest(settings, args).await,
    }
}

async fn run_digest(settings: Settings, args: DigestArgs) -> Result<(), AppError> {
    let l2 = Arc::new(FsStore::new(settings.store.directory.join("l2")));
    let l3 = Arc::new(
        MemoryStore::new("l3", settings.cache.l3_max_entries_non_zero())
            .with_latency(settings.store.l3_latency, settings.store.l3_latency / 2),
    );
    let cache = MultiLevelCacheManager::<FileDigest>::new(settings.cache.clone(), l2, l3);

    let digests = try_join_all(args.files.iter().map(|path| digest_file(&cache, path))).await;
    cache.shutdown().await;

    for digest in digests? {
        println!(
            "{}  {:>10} bytes  {:>8} lines  {}",
            digest.sha256, digest.bytes, digest.lines, digest.path
        );
    }
    println!("{}", cache.stats().summary());
    Ok(())
}

async fn digest_file(
    cache: &MultiLevelCacheManager<FileDigest>,
    path: &Path,
) -> Result<FileDigest, AppError> {
    let content = tokio::fs::read(path).await.map_err(|source| AppError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let source = path.display().to_string();

    let key = CacheKey::for_content(
        DIGEST_ENTITY,
        source.as_str(),
        &content,
        DIGEST_SCHEMA_VERSION,
    )
    .stamped();
    cache.track_source(source.as_str(), &content);
    cache.add_source_dependency(&key, source.as_str());

    let content = &content;
    let digest = cache
        .get_or_compute(&key, move |_| async move {
            info!(path = %source, "Computing file digest");
            Ok::<_, Infallible>(FileDigest::compute(source, content))
        })
        .await?;
    Ok(digest)
}
