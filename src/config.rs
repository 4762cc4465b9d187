use crate::services::validator::AdmissionPolicy;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Default request body ceiling: 1 GiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 << 20;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; built once at startup
/// and handed to the stores, the service and the router.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub public_base_url: String,
    pub api_key: String,
    pub max_body_bytes: usize,
    pub staging_dir: PathBuf,
    pub store_timeout: Duration,
    pub upload_policy: AdmissionPolicy,
    pub replace_policy: AdmissionPolicy,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File storage service with validated media uploads")]
pub struct Args {
    /// Host to bind to (overrides FILE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides FILE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store bucket name (overrides FILE_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Base URL used when building access URLs (overrides FILE_STORE_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Maximum request body size in bytes (overrides FILE_STORE_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Directory for request-scoped staging files (overrides FILE_STORE_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Per-call timeout for store operations, in seconds (overrides FILE_STORE_STORE_TIMEOUT_SECS)
    #[arg(long)]
    pub store_timeout_secs: Option<u64>,

    /// Comma-separated extensions admitted on upload (overrides FILE_STORE_UPLOAD_EXTENSIONS)
    #[arg(long)]
    pub upload_extensions: Option<String>,

    /// Comma-separated extensions admitted on replace (overrides FILE_STORE_REPLACE_EXTENSIONS)
    #[arg(long)]
    pub replace_extensions: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read a variable, treating "not set" as `None` and anything unreadable as an error.
fn env_var(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_var(name)?
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, value))
        })
        .transpose()
}

/// A missing .env file is normal outside development; a broken one is not.
fn env_file_loaded(result: dotenvy::Result<PathBuf>) -> Result<()> {
    match result {
        Ok(path) => {
            tracing::debug!("Loaded environment from {}", path.display());
            Ok(())
        }
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(err).context("loading .env file"),
    }
}

fn parse_policy(list: Option<String>, fallback: AdmissionPolicy) -> Result<AdmissionPolicy> {
    match list {
        Some(list) => AdmissionPolicy::from_extensions(list.split(','))
            .with_context(|| format!("parsing extension list `{}`", list)),
        None => Ok(fallback),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        env_file_loaded(dotenvy::dotenv())?;
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge parsed CLI args over environment defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env_var("FILE_STORE_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env_parsed::<u16>("FILE_STORE_PORT")?.unwrap_or(8080);
        let env_storage = env_var("FILE_STORE_STORAGE_DIR")?.unwrap_or_else(|| "./data/objects".into());
        let env_db = env_var("FILE_STORE_DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/file_store.db".into());
        let env_bucket = env_var("FILE_STORE_BUCKET")?.unwrap_or_else(|| "user-uploads".into());
        let env_max_body = env_parsed::<usize>("FILE_STORE_MAX_BODY_BYTES")?.unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let env_staging = env_var("FILE_STORE_STAGING_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        let env_timeout = env_parsed::<u64>("FILE_STORE_STORE_TIMEOUT_SECS")?.unwrap_or(30);

        let api_key = match env_var("FILE_STORE_API_KEY")? {
            Some(key) => Some(key),
            None => env_var("API_KEY")?,
        };
        let Some(api_key) = api_key.filter(|key| !key.trim().is_empty()) else {
            bail!("FILE_STORE_API_KEY (or API_KEY) must be set to a non-empty value");
        };

        // --- Merge ---
        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let public_base_url = match args.public_base_url {
            Some(url) => url,
            None => env_var("FILE_STORE_PUBLIC_BASE_URL")?
                .unwrap_or_else(|| format!("http://localhost:{}", port)),
        };
        let upload_policy = parse_policy(
            args.upload_extensions.or(env_var("FILE_STORE_UPLOAD_EXTENSIONS")?),
            AdmissionPolicy::upload_default(),
        )?;
        let replace_policy = parse_policy(
            args.replace_extensions.or(env_var("FILE_STORE_REPLACE_EXTENSIONS")?),
            AdmissionPolicy::replace_default(),
        )?;

        Ok(Self {
            host,
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            bucket: args.bucket.unwrap_or(env_bucket),
            public_base_url,
            api_key,
            max_body_bytes: args.max_body_bytes.unwrap_or(env_max_body),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            store_timeout: Duration::from_secs(args.store_timeout_secs.unwrap_or(env_timeout)),
            upload_policy,
            replace_policy,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
