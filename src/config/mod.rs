//! Configuration loading for the repo sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `REPOSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "REPOSYNC_";

/// Application configuration derived from `REPOSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Who may add external services of their own, and what they may sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalServiceUserMode {
    /// Users cannot add services
    Disabled,
    /// Users may sync public repositories only
    Public,
    /// Users may sync public and private repositories
    All,
}

impl ExternalServiceUserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Public => "public",
            Self::All => "all",
        }
    }
}

impl fmt::Display for ExternalServiceUserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExternalServiceUserMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "public" => Ok(Self::Public),
            "all" => Ok(Self::All),
            other => Err(ConfigError::InvalidUserMode {
                value: other.to_string(),
            }),
        }
    }
}

/// Reconciliation settings read by the syncer and the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    #[serde(default = "default_user_repos_max_per_user")]
    pub user_repos_max_per_user: u64,
    #[serde(default = "default_user_repos_max_per_site")]
    pub user_repos_max_per_site: u64,
    #[serde(default = "default_external_service_user_mode")]
    pub external_service_user_mode: ExternalServiceUserMode,
    /// Global kill-switch for the periodic enqueue loop
    #[serde(default)]
    pub disable_auto_code_host_syncs: bool,
    /// Reconcile per repository instead of per service
    #[serde(default)]
    pub streaming_sync: bool,
    /// Insert new site-owned repos while a batch listing is still running
    #[serde(default)]
    pub streaming_insert: bool,
    #[serde(default)]
    pub cloud_mode: bool,
    #[serde(default = "default_min_sync_interval_seconds")]
    pub min_sync_interval_seconds: u64,
    #[serde(default = "default_enqueue_interval_seconds")]
    pub enqueue_interval_seconds: u64,
    /// Capacity of the queue between a source and its consumer
    #[serde(default = "default_source_channel_capacity")]
    pub source_channel_capacity: usize,
}

impl SyncConfig {
    pub fn min_sync_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_sync_interval_seconds as i64)
    }

    /// Validate reconciliation settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_repos_max_per_user > self.user_repos_max_per_site {
            return Err(ConfigError::InvalidRepoCeilings {
                per_user: self.user_repos_max_per_user,
                per_site: self.user_repos_max_per_site,
            });
        }
        for (field, value) in [
            ("MIN_SYNC_INTERVAL_SECONDS", self.min_sync_interval_seconds),
            ("ENQUEUE_INTERVAL_SECONDS", self.enqueue_interval_seconds),
            ("SOURCE_CHANNEL_CAPACITY", self.source_channel_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }
        Ok(())
    }
}

/// Worker pool, resetter and cleaner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    #[serde(default = "default_concurrent_external_service_syncers")]
    pub concurrent_external_service_syncers: usize,
    #[serde(default = "default_dequeue_interval_seconds")]
    pub dequeue_interval_seconds: u64,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_stalled_max_age_seconds")]
    pub stalled_max_age_seconds: u64,
    #[serde(default = "default_max_num_resets")]
    pub max_num_resets: u32,
    #[serde(default)]
    pub max_num_retries: u32,
    #[serde(default = "default_resetter_interval_seconds")]
    pub resetter_interval_seconds: u64,
    #[serde(default = "default_cleanup_old_jobs")]
    pub cleanup_old_jobs: bool,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_job_retention_seconds")]
    pub job_retention_seconds: u64,
}

impl WorkerConfig {
    /// Validate worker settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent_external_service_syncers == 0 {
            return Err(ConfigError::ZeroValue {
                field: "CONCURRENT_EXTERNAL_SERVICE_SYNCERS",
            });
        }
        for (field, value) in [
            ("DEQUEUE_INTERVAL_SECONDS", self.dequeue_interval_seconds),
            ("HEARTBEAT_INTERVAL_SECONDS", self.heartbeat_interval_seconds),
            ("STALLED_MAX_AGE_SECONDS", self.stalled_max_age_seconds),
            ("RESETTER_INTERVAL_SECONDS", self.resetter_interval_seconds),
            ("CLEANUP_INTERVAL_SECONDS", self.cleanup_interval_seconds),
            ("JOB_RETENTION_SECONDS", self.job_retention_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            sync: SyncConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_repos_max_per_user: default_user_repos_max_per_user(),
            user_repos_max_per_site: default_user_repos_max_per_site(),
            external_service_user_mode: default_external_service_user_mode(),
            disable_auto_code_host_syncs: false,
            streaming_sync: false,
            streaming_insert: false,
            cloud_mode: false,
            min_sync_interval_seconds: default_min_sync_interval_seconds(),
            enqueue_interval_seconds: default_enqueue_interval_seconds(),
            source_channel_capacity: default_source_channel_capacity(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrent_external_service_syncers: default_concurrent_external_service_syncers(),
            dequeue_interval_seconds: default_dequeue_interval_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            stalled_max_age_seconds: default_stalled_max_age_seconds(),
            max_num_resets: default_max_num_resets(),
            max_num_retries: 0,
            resetter_interval_seconds: default_resetter_interval_seconds(),
            cleanup_old_jobs: default_cleanup_old_jobs(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            job_retention_seconds: default_job_retention_seconds(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (the database password is redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if let Ok(mut url) = Url::parse(&config.database_url) {
            if url.password().is_some() && url.set_password(Some("[REDACTED]")).is_ok() {
                config.database_url = url.to_string();
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::ZeroValue {
                field: "DB_MAX_CONNECTIONS",
            });
        }

        self.sync.validate()?;
        self.worker.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://reposync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_user_repos_max_per_user() -> u64 {
    2000
}

fn default_user_repos_max_per_site() -> u64 {
    200_000
}

fn default_external_service_user_mode() -> ExternalServiceUserMode {
    ExternalServiceUserMode::Public
}

fn default_min_sync_interval_seconds() -> u64 {
    60
}

fn default_enqueue_interval_seconds() -> u64 {
    60
}

fn default_source_channel_capacity() -> usize {
    64
}

fn default_concurrent_external_service_syncers() -> usize {
    3
}

fn default_dequeue_interval_seconds() -> u64 {
    10
}

fn default_heartbeat_interval_seconds() -> u64 {
    15
}

fn default_stalled_max_age_seconds() -> u64 {
    30
}

fn default_max_num_resets() -> u32 {
    5
}

fn default_resetter_interval_seconds() -> u64 {
    300
}

fn default_cleanup_old_jobs() -> bool {
    true
}

fn default_cleanup_interval_seconds() -> u64 {
    3600
}

fn default_job_retention_seconds() -> u64 {
    86_400
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid external service user mode '{value}'; expected disabled, public or all")]
    InvalidUserMode { value: String },
    #[error("invalid log format '{value}'; expected json or pretty")]
    InvalidLogFormat { value: String },
    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("per-user repo ceiling ({per_user}) cannot exceed per-site ceiling ({per_site})")]
    InvalidRepoCeilings { per_user: u64, per_site: u64 },
}

/// Loads configuration using layered `.env` files and `REPOSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let sync = SyncConfig {
            user_repos_max_per_user: take_parsed(&mut layered, "USER_REPOS_MAX_PER_USER")?
                .unwrap_or_else(default_user_repos_max_per_user),
            user_repos_max_per_site: take_parsed(&mut layered, "USER_REPOS_MAX_PER_SITE")?
                .unwrap_or_else(default_user_repos_max_per_site),
            external_service_user_mode: take_string(&mut layered, "EXTERNAL_SERVICE_USER_MODE")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_else(default_external_service_user_mode),
            disable_auto_code_host_syncs: take_bool(&mut layered, "DISABLE_AUTO_CODE_HOST_SYNCS")?
                .unwrap_or(false),
            streaming_sync: take_bool(&mut layered, "STREAMING_SYNC")?.unwrap_or(false),
            streaming_insert: take_bool(&mut layered, "STREAMING_INSERT")?.unwrap_or(false),
            cloud_mode: take_bool(&mut layered, "CLOUD_MODE")?.unwrap_or(false),
            min_sync_interval_seconds: take_parsed(&mut layered, "MIN_SYNC_INTERVAL_SECONDS")?
                .unwrap_or_else(default_min_sync_interval_seconds),
            enqueue_interval_seconds: take_parsed(&mut layered, "ENQUEUE_INTERVAL_SECONDS")?
                .unwrap_or_else(default_enqueue_interval_seconds),
            source_channel_capacity: take_parsed(&mut layered, "SOURCE_CHANNEL_CAPACITY")?
                .unwrap_or_else(default_source_channel_capacity),
        };

        let worker = WorkerConfig {
            concurrent_external_service_syncers: take_parsed(
                &mut layered,
                "CONCURRENT_EXTERNAL_SERVICE_SYNCERS",
            )?
            .unwrap_or_else(default_concurrent_external_service_syncers),
            dequeue_interval_seconds: take_parsed(&mut layered, "DEQUEUE_INTERVAL_SECONDS")?
                .unwrap_or_else(default_dequeue_interval_seconds),
            heartbeat_interval_seconds: take_parsed(&mut layered, "HEARTBEAT_INTERVAL_SECONDS")?
                .unwrap_or_else(default_heartbeat_interval_seconds),
            stalled_max_age_seconds: take_parsed(&mut layered, "STALLED_MAX_AGE_SECONDS")?
                .unwrap_or_else(default_stalled_max_age_seconds),
            max_num_resets: take_parsed(&mut layered, "MAX_NUM_RESETS")?
                .unwrap_or_else(default_max_num_resets),
            max_num_retries: take_parsed(&mut layered, "MAX_NUM_RETRIES")?.unwrap_or(0),
            resetter_interval_seconds: take_parsed(&mut layered, "RESETTER_INTERVAL_SECONDS")?
                .unwrap_or_else(default_resetter_interval_seconds),
            cleanup_old_jobs: take_bool(&mut layered, "CLEANUP_OLD_JOBS")?
                .unwrap_or_else(default_cleanup_old_jobs),
            cleanup_interval_seconds: take_parsed(&mut layered, "CLEANUP_INTERVAL_SECONDS")?
                .unwrap_or_else(default_cleanup_interval_seconds),
            job_retention_seconds: take_parsed(&mut layered, "JOB_RETENTION_SECONDS")?
                .unwrap_or_else(default_job_retention_seconds),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            sync,
            worker,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    take_string(layered, key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { field: key, value })
        })
        .transpose()
}

fn take_bool(
    layered: &mut BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    take_string(layered, key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { field: key, value }),
        })
        .transpose()
}
