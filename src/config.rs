use crate::models::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, is_valid_chunk_size};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub chunk_size: u64,
    pub sweep_interval_secs: u64,
    pub upload_ttl_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked streaming object store")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks are stored (overrides CHUNK_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNK_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Default chunk size in bytes (overrides CHUNK_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Seconds between reconciling sweeps (overrides CHUNK_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds before an unowned upload counts as abandoned (overrides CHUNK_STORE_UPLOAD_TTL_SECS)
    #[arg(long)]
    pub upload_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values from `lookup` over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = lookup("CHUNK_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "CHUNK_STORE_PORT", 3000u16)?;
        let env_storage =
            lookup("CHUNK_STORE_STORAGE_DIR").unwrap_or_else(|| "./data/chunks".into());
        let env_db = lookup("CHUNK_STORE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/chunk_store.db".into());
        let env_chunk_size = parse_var(&lookup, "CHUNK_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let env_sweep = parse_var(&lookup, "CHUNK_STORE_SWEEP_INTERVAL_SECS", 300u64)?;
        let env_ttl = parse_var(&lookup, "CHUNK_STORE_UPLOAD_TTL_SECS", 3600u64)?;

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk_size),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep),
            upload_ttl_secs: args.upload_ttl_secs.unwrap_or(env_ttl),
        };

        if !is_valid_chunk_size(cfg.chunk_size) {
            bail!(
                "chunk size {} must be between {} and {} bytes",
                cfg.chunk_size,
                MIN_CHUNK_SIZE,
                MAX_CHUNK_SIZE
            );
        }
        if cfg.sweep_interval_secs == 0 {
            bail!("sweep interval must be at least one second");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
