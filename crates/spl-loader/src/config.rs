//! Configuration management
//!
//! Settings come from the process environment (optionally seeded from a
//! `.env` file). The database section is a closed set of adapters selected by
//! `DB_ADAPTER`; [`crate::storage::connect`] turns it into a backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EtlError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Listing page of the full and daily SPL archives.
pub const DEFAULT_SOURCE_URL: &str =
    "https://dailymed.nlm.nih.gov/dailymed/spl-resources-all-drug-labels.cfm";

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_DOWNLOAD_PATH: &str = "data/downloads";
pub const DEFAULT_QUARANTINE_PATH: &str = "data/quarantine";

pub const DEFAULT_POSTGRES_HOST: &str = "localhost";
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;
pub const DEFAULT_POSTGRES_DB: &str = "spl_data";
pub const DEFAULT_POSTGRES_USER: &str = "postgres";
pub const DEFAULT_POSTGRES_PASSWORD: &str = "postgres";
pub const DEFAULT_SQLITE_PATH: &str = "spl_data.db";

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Large archives can take minutes to stream.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_HTTP_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_USER_AGENT: &str = concat!("spl-loader/", env!("CARGO_PKG_VERSION"));

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Unset or blank is `None`; a value that does not parse is an error naming
/// the variable.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|v| {
            v.trim().parse().map_err(|e| {
                EtlError::config(format!("Invalid value '{}' for {}: {}", v.trim(), key, e))
            })
        })
        .transpose()
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    env_var(key)
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(EtlError::config(format!(
                "Invalid value '{}' for {}: expected true or false",
                other, key
            ))),
        })
        .transpose()
}

/// File format of the files between transform and staging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntermediateFormat {
    #[default]
    Csv,
    Parquet,
}

impl IntermediateFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntermediateFormat::Csv => "csv",
            IntermediateFormat::Parquet => "parquet",
        }
    }

    /// File extension, also used to recognize files in a directory
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        ext.parse().ok()
    }
}

impl std::fmt::Display for IntermediateFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntermediateFormat {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(IntermediateFormat::Csv),
            "parquet" => Ok(IntermediateFormat::Parquet),
            other => Err(EtlError::config(format!(
                "unsupported intermediate format '{}' (expected 'csv' or 'parquet')",
                other
            ))),
        }
    }
}

/// Postgres connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    /// Drop and restore secondary indexes/FKs around full loads
    pub optimize_full_load: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: format!(
                "postgresql://{}:{}@{}:{}/{}",
                DEFAULT_POSTGRES_USER,
                DEFAULT_POSTGRES_PASSWORD,
                DEFAULT_POSTGRES_HOST,
                DEFAULT_POSTGRES_PORT,
                DEFAULT_POSTGRES_DB
            ),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            optimize_full_load: true,
        }
    }
}

/// SQLite file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub optimize_full_load: bool,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            optimize_full_load: true,
        }
    }
}

/// Backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Postgres(PostgresConfig),
    Sqlite(SqliteConfig),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Postgres(PostgresConfig::default())
    }
}

impl DatabaseConfig {
    pub fn adapter_name(&self) -> &'static str {
        match self {
            DatabaseConfig::Postgres(_) => "postgresql",
            DatabaseConfig::Sqlite(_) => "sqlite",
        }
    }

    pub fn optimize_full_load(&self) -> bool {
        match self {
            DatabaseConfig::Postgres(c) => c.optimize_full_load,
            DatabaseConfig::Sqlite(c) => c.optimize_full_load,
        }
    }

    /// Read `DB_*` variables.
    ///
    /// `DB_ADAPTER` selects the variant (`postgresql` by default). For Postgres
    /// `DATABASE_URL` wins over the individual `DB_HOST`/`DB_PORT`/... parts.
    pub fn from_env() -> Result<Self> {
        let adapter = env_var("DB_ADAPTER").unwrap_or_else(|| "postgresql".to_string());
        let optimize_full_load = env_bool("DB_OPTIMIZE_FULL_LOAD")?.unwrap_or(true);
        let max_connections =
            env_parse("DB_MAX_CONNECTIONS")?.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);

        match adapter.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => {
                let port = env_parse("DB_PORT")?.unwrap_or(DEFAULT_POSTGRES_PORT);
                let url = env_var("DATABASE_URL").unwrap_or_else(|| {
                    format!(
                        "postgresql://{}:{}@{}:{}/{}",
                        env_var("DB_USER").unwrap_or_else(|| DEFAULT_POSTGRES_USER.to_string()),
                        env_var("DB_PASSWORD")
                            .unwrap_or_else(|| DEFAULT_POSTGRES_PASSWORD.to_string()),
                        env_var("DB_HOST").unwrap_or_else(|| DEFAULT_POSTGRES_HOST.to_string()),
                        port,
                        env_var("DB_NAME").unwrap_or_else(|| DEFAULT_POSTGRES_DB.to_string()),
                    )
                });
                Ok(DatabaseConfig::Postgres(PostgresConfig {
                    url,
                    max_connections,
                    connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT")?
                        .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS),
                    optimize_full_load,
                }))
            },
            "sqlite" => {
                let path = env_var("DB_SQLITE_PATH")
                    .or_else(|| env_var("DB_NAME"))
                    .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string());
                Ok(DatabaseConfig::Sqlite(SqliteConfig {
                    path: PathBuf::from(path),
                    max_connections,
                    optimize_full_load,
                }))
            },
            other => Err(EtlError::config(format!(
                "Unsupported DB_ADAPTER '{}' (expected 'postgresql' or 'sqlite')",
                other
            ))),
        }
    }
}

/// HTTP client and retry settings shared by listing and download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Attempt ceiling, including the first attempt
    pub max_retries: u32,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_retries: DEFAULT_HTTP_MAX_RETRIES,
            retry_min_delay_ms: DEFAULT_RETRY_MIN_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delays(mut self, min: Duration, max: Duration) -> Self {
        self.retry_min_delay_ms = min.as_millis() as u64;
        self.retry_max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Exponential backoff for the given 1-based attempt, clamped to the
    /// configured window (2s, 4s, 8s, 10s, ... with the defaults).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(32));
        let ms = (exp * 1000)
            .max(self.retry_min_delay_ms)
            .min(self.retry_max_delay_ms.max(self.retry_min_delay_ms));
        Duration::from_millis(ms)
    }

    fn from_env() -> Result<Self> {
        let default = Self::default();
        Ok(Self {
            timeout_secs: env_parse("HTTP_TIMEOUT_SECS")?.unwrap_or(default.timeout_secs),
            max_retries: env_parse("HTTP_MAX_RETRIES")?.unwrap_or(default.max_retries),
            retry_min_delay_ms: env_parse("HTTP_RETRY_MIN_DELAY_MS")?
                .unwrap_or(default.retry_min_delay_ms),
            retry_max_delay_ms: env_parse("HTTP_RETRY_MAX_DELAY_MS")?
                .unwrap_or(default.retry_max_delay_ms),
            user_agent: env_var("HTTP_USER_AGENT").unwrap_or(default.user_agent),
        })
    }
}

/// Loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub source_url: String,
    pub data_dir: PathBuf,
    pub download_path: PathBuf,
    pub quarantine_path: PathBuf,
    /// Worker bound for both downloads and parsing
    pub max_workers: usize,
    pub intermediate_format: IntermediateFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            http: HttpConfig::default(),
            source_url: DEFAULT_SOURCE_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            download_path: PathBuf::from(DEFAULT_DOWNLOAD_PATH),
            quarantine_path: PathBuf::from(DEFAULT_QUARANTINE_PATH),
            max_workers: default_max_workers(),
            intermediate_format: IntermediateFormat::default(),
        }
    }
}

/// Available CPU parallelism, falling back to 1
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Settings {
    /// Load configuration from `.env` and the environment, then validate
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let settings = Self::from_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read configuration from the environment without touching `.env`
    pub fn from_env() -> Result<Self> {
        let default = Self::default();
        let data_dir = env_var("DATA_DIR").map(PathBuf::from).unwrap_or(default.data_dir);

        Ok(Self {
            database: DatabaseConfig::from_env()?,
            http: HttpConfig::from_env()?,
            source_url: env_var("FDA_SOURCE_URL").unwrap_or(default.source_url),
            download_path: env_var("DOWNLOAD_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("downloads")),
            quarantine_path: env_var("QUARANTINE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("quarantine")),
            max_workers: env_parse("MAX_WORKERS")?.unwrap_or(default.max_workers),
            intermediate_format: env_var("INTERMEDIATE_FORMAT")
                .map(|v| v.parse::<IntermediateFormat>())
                .transpose()?
                .unwrap_or_default(),
            data_dir,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(EtlError::config("MAX_WORKERS must be greater than 0"));
        }

        if self.http.max_retries == 0 {
            return Err(EtlError::config("HTTP_MAX_RETRIES must be at least 1"));
        }

        if self.http.timeout_secs == 0 {
            return Err(EtlError::config("HTTP_TIMEOUT_SECS must be greater than 0"));
        }

        if !self.source_url.starts_with("http://") && !self.source_url.starts_with("https://") {
            return Err(EtlError::config(format!(
                "FDA_SOURCE_URL must be an http(s) URL, got '{}'",
                self.source_url
            )));
        }

        match &self.database {
            DatabaseConfig::Postgres(pg) => {
                if pg.url.is_empty() {
                    return Err(EtlError::config("Database URL cannot be empty"));
                }
                if pg.max_connections == 0 {
                    return Err(EtlError::config("DB_MAX_CONNECTIONS must be greater than 0"));
                }
            },
            DatabaseConfig::Sqlite(sqlite) => {
                if sqlite.path.as_os_str().is_empty() {
                    return Err(EtlError::config("SQLite path cannot be empty"));
                }
            },
        }

        Ok(())
    }
}
