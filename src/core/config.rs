use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_UPLOAD_BASE: &str = "https://upload.uploadcare.com/";

/// Environment keys, shared between the loader and the `init` command.
pub mod keys {
    pub const PUBLIC_KEY: &str = "PUBLIC_KEY";
    pub const SECRET_KEY: &str = "SECRET_KEY";
    pub const UPLOAD_BASE: &str = "UPLOAD_BASE";
    pub const FROM_URL_TIMEOUT: &str = "FROM_URL_TIMEOUT";
    pub const MAX_CONCURRENT_UPLOADS: &str = "MAX_CONCURRENT_UPLOADS";
    pub const MAX_CONCURRENT_CHECKS: &str = "MAX_CONCURRENT_CHECKS";
    pub const STATUS_CHECK_INTERVAL: &str = "STATUS_CHECK_INTERVAL";
    pub const S3_BUCKET_NAME: &str = "S3_BUCKET_NAME";
    pub const S3_REGION: &str = "S3_REGION";
    pub const S3_ENDPOINT: &str = "S3_ENDPOINT";
    pub const S3_ACCESS_KEY_ID: &str = "S3_ACCESS_KEY_ID";
    pub const S3_SECRET_ACCESS_KEY: &str = "S3_SECRET_ACCESS_KEY";
    pub const S3_URL_EXPIRATION_TIME: &str = "S3_URL_EXPIRATION_TIME";
    pub const DB_PATH: &str = "MIGRO_DB_PATH";
    pub const LOGS_DIR: &str = "MIGRO_LOGS_DIR";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

/// Settings for one migration run. Built once, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub public_key: String,
    pub secret_key: Option<String>,
    pub upload_base: String,
    /// Seconds to wait for a `from_url` upload to finish, counted from submission.
    pub upload_timeout_secs: u64,
    pub max_concurrent_uploads: usize,
    /// Separate bound for status checks. `None` means only `max_concurrent_uploads` applies.
    pub max_concurrent_checks: Option<usize>,
    pub status_check_interval_secs: u64,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_url_expiration_secs: u64,
    pub db_path: String,
    pub logs_dir: String,
    pub log_level: String,
}

fn default_upload_base() -> String {
    DEFAULT_UPLOAD_BASE.to_string()
}
fn default_db_path() -> String {
    "./migration.db".to_string()
}
fn default_logs_dir() -> String {
    "./logs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            secret_key: None,
            upload_base: default_upload_base(),
            upload_timeout_secs: 10,
            max_concurrent_uploads: 1,
            max_concurrent_checks: None,
            status_check_interval_secs: 3,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_url_expiration_secs: 24 * 60 * 60,
            db_path: default_db_path(),
            logs_dir: default_logs_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn status_check_interval(&self) -> Duration {
        Duration::from_secs(self.status_check_interval_secs)
    }

    pub fn s3_url_expiration(&self) -> Duration {
        Duration::from_secs(self.s3_url_expiration_secs)
    }

    /// Validate configuration values needed to start uploading.
    pub fn validate(&self) -> Result<()> {
        if self.public_key.trim().is_empty() {
            anyhow::bail!(
                "Uploadcare public key cannot be empty. Please specify it through the command line option or environment variable."
            );
        }
        if !(self.upload_base.starts_with("https://") || self.upload_base.starts_with("http://")) {
            anyhow::bail!("upload base URL must start with http:// or https://");
        }
        if self.max_concurrent_uploads == 0 {
            anyhow::bail!("max_concurrent_uploads must be > 0");
        }
        if self.max_concurrent_checks == Some(0) {
            anyhow::bail!("max_concurrent_checks must be > 0 when set");
        }
        if self.upload_timeout_secs == 0 {
            anyhow::bail!("upload_timeout must be > 0");
        }
        if self.status_check_interval_secs == 0 {
            anyhow::bail!("status_check_interval must be > 0");
        }
        if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
            anyhow::bail!(
                "S3 credentials incomplete: both access key ID and secret access key must be provided"
            );
        }
        Ok(())
    }
}

// --- Environment-backed config ---

/// Loads the `.env` file (searching parent directories) into the process environment
/// and returns its path. Falls back to `./.env` when none exists yet.
pub fn load_env_file() -> PathBuf {
    match dotenvy::dotenv() {
        Ok(path) => {
            debug!("Loaded environment from {:?}", path);
            path
        }
        Err(_) => PathBuf::from(".env"),
    }
}

pub fn load_config_from_env() -> Config {
    let vars: HashMap<String, String> = std::env::vars().collect();
    load_config_from_map(&vars)
}

pub fn load_config_from_map(settings: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> {
        settings
            .get(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let get_or = |key: &str, default: String| -> String { get(key).unwrap_or(default) };

    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    };

    let get_usize = |key: &str, default: usize| -> usize {
        get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    };

    let defaults = Config::default();

    Config {
        public_key: get_or(keys::PUBLIC_KEY, defaults.public_key),
        secret_key: get(keys::SECRET_KEY),
        upload_base: get_or(keys::UPLOAD_BASE, defaults.upload_base),
        upload_timeout_secs: get_u64(keys::FROM_URL_TIMEOUT, defaults.upload_timeout_secs),
        max_concurrent_uploads: get_usize(
            keys::MAX_CONCURRENT_UPLOADS,
            defaults.max_concurrent_uploads,
        ),
        max_concurrent_checks: get(keys::MAX_CONCURRENT_CHECKS).and_then(|s| s.parse().ok()),
        status_check_interval_secs: get_u64(
            keys::STATUS_CHECK_INTERVAL,
            defaults.status_check_interval_secs,
        ),
        s3_bucket: get(keys::S3_BUCKET_NAME),
        s3_region: get(keys::S3_REGION),
        s3_endpoint: get(keys::S3_ENDPOINT),
        s3_access_key_id: get(keys::S3_ACCESS_KEY_ID),
        s3_secret_access_key: get(keys::S3_SECRET_ACCESS_KEY),
        s3_url_expiration_secs: get_u64(
            keys::S3_URL_EXPIRATION_TIME,
            defaults.s3_url_expiration_secs,
        ),
        db_path: get_or(keys::DB_PATH, defaults.db_path),
        logs_dir: get_or(keys::LOGS_DIR, defaults.logs_dir),
        log_level: get_or(keys::LOG_LEVEL, defaults.log_level),
    }
}

/// Writes `entries` into the env file, replacing existing keys in place and appending new ones.
pub fn save_to_env_file(path: &Path, entries: &[(&str, String)]) -> Result<()> {
    let existing = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read env file {:?}", path))?
    } else {
        String::new()
    };

    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    for (key, value) in entries {
        let prefix = format!("{}=", key);
        let line = format!("{}={}", key, value);
        match lines.iter_mut().find(|l| l.starts_with(&prefix)) {
            Some(existing_line) => *existing_line = line,
            None => lines.push(line),
        }
    }

    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).with_context(|| format!("write env file {:?}", path))?;
    info!("Saved {} settings to {:?}", entries.len(), path);
    Ok(())
}
