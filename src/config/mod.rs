//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";
const ENV_PREFIX: &str = "TIERCACHE";
const DEFAULT_STORE_DIRECTORY: &str = ".tiercache";
const DEFAULT_L3_LATENCY_MS: u64 = 5;

/// Command-line arguments for the tiercache binary.
#[derive(Debug, Parser)]
#[command(name = "tiercache", version, about = "Multi-level memoization cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TIERCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Digest files through the cache and print the statistics summary.
    Digest(DigestArgs),
}

#[derive(Debug, Args, Clone)]
pub struct DigestArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Files to digest.
    #[arg(required = true, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory backing the durable tier.
    #[arg(long = "store-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub store_directory: Option<PathBuf>,

    /// Override the simulated latency of the remote tier.
    #[arg(long = "store-l3-latency-ms", value_name = "MILLIS")]
    pub l3_latency_ms: Option<u64>,

    /// Override the L1 entry bound.
    #[arg(long = "cache-l1-max-entries", value_name = "COUNT")]
    pub l1_max_entries: Option<usize>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheConfig,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub directory: PathBuf,
    pub l3_latency: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Digest(args) => raw.apply_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: CacheConfig,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(directory) = overrides.store_directory.as_ref() {
            self.store.directory = Some(directory.clone());
        }
        if let Some(latency) = overrides.l3_latency_ms {
            self.store.l3_latency_ms = Some(latency);
        }
        if let Some(limit) = overrides.l1_max_entries {
            self.cache.l1_max_entries = limit;
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            logging,
            store,
        } = raw;

        let cache = validate_cache_config(cache)?;
        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;

        Ok(Self {
            cache,
            logging,
            store,
        })
    }
}

fn validate_cache_config(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.l1_max_entries == 0 {
        return Err(LoadError::invalid(
            "cache.l1_max_entries",
            "must be greater than zero",
        ));
    }
    if cache.default_ttl_ms == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_ms",
            "must be greater than zero",
        ));
    }
    if cache.auto_cleanup && cache.cleanup_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.cleanup_interval_ms",
            "must be greater than zero when auto_cleanup is enabled",
        ));
    }
    if cache.write_queue_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.write_queue_capacity",
            "must be greater than zero",
        ));
    }
    if cache.enable_l2 && cache.enable_l3 && cache.l2_key_prefix == cache.l3_key_prefix {
        return Err(LoadError::invalid(
            "cache.l3_key_prefix",
            "must differ from cache.l2_key_prefix",
        ));
    }
    Ok(cache)
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let directory = store
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "store.directory",
            "directory must not be empty",
        ));
    }

    let l3_latency = Duration::from_millis(store.l3_latency_ms.unwrap_or(DEFAULT_L3_LATENCY_MS));

    Ok(StoreSettings {
        directory,
        l3_latency,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    directory: Option<PathBuf>,
    l3_latency_ms: Option<u64>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
