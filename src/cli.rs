use crate::core::config::{Config, keys};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const WELCOME: &str = "Welcome to Migro! Please specify the migration method.
For more information on each method, use the following commands:
  migro s3 --help
  migro urls --help
";

#[derive(Parser, Debug)]
#[command(name = "migro")]
#[command(about = "Migro: A tool for migrating files to Uploadcare.")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialize .env file with credentials and other settings.
    Init(InitArgs),
    /// Migrate files from a file with URLs to Uploadcare.
    Urls(UrlsArgs),
    /// Migrate files from an S3 bucket to Uploadcare.
    S3(S3Args),
    /// Show the number and size of files that are not uploaded yet.
    Status,
    /// Drop the database, configuration and logs.
    Drop {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct UploadOptions {
    /// Base URL for uploads.
    #[arg(long, value_name = "URL")]
    pub upload_base_url: Option<String>,
    /// Number of seconds to wait till the file will be processed by `from_url` upload.
    #[arg(long, value_name = "SECONDS")]
    pub upload_timeout: Option<u64>,
    /// Maximum number of upload requests running in 'parallel'.
    #[arg(long, value_name = "N")]
    pub concurrent_uploads: Option<usize>,
    /// Maximum number of status checks running in 'parallel'.
    #[arg(long, value_name = "N")]
    pub concurrent_checks: Option<usize>,
    /// Number of seconds in between status check requests.
    #[arg(long, value_name = "SECONDS")]
    pub status_check_interval: Option<u64>,
}

impl UploadOptions {
    pub fn apply(&self, config: &mut Config) {
        if let Some(base) = &self.upload_base_url {
            config.upload_base = base.clone();
        }
        if let Some(timeout) = self.upload_timeout {
            config.upload_timeout_secs = timeout;
        }
        if let Some(n) = self.concurrent_uploads {
            config.max_concurrent_uploads = n;
        }
        if let Some(n) = self.concurrent_checks {
            config.max_concurrent_checks = Some(n);
        }
        if let Some(interval) = self.status_check_interval {
            config.status_check_interval_secs = interval;
        }
    }

    fn env_entries(&self, entries: &mut Vec<(&'static str, String)>) {
        push(entries, keys::UPLOAD_BASE, self.upload_base_url.clone());
        push(entries, keys::FROM_URL_TIMEOUT, self.upload_timeout);
        push(entries, keys::MAX_CONCURRENT_UPLOADS, self.concurrent_uploads);
        push(entries, keys::MAX_CONCURRENT_CHECKS, self.concurrent_checks);
        push(entries, keys::STATUS_CHECK_INTERVAL, self.status_check_interval);
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct S3Options {
    /// Your AWS S3 access key ID.
    #[arg(long)]
    pub s3_access_key_id: Option<String>,
    /// Your AWS S3 secret access key.
    #[arg(long)]
    pub s3_secret_access_key: Option<String>,
    /// Your S3 region.
    #[arg(long)]
    pub s3_region: Option<String>,
    /// Custom S3-compatible endpoint.
    #[arg(long, value_name = "URL")]
    pub s3_endpoint: Option<String>,
    /// Lifetime of the signed URLs handed to Uploadcare, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub s3_url_expiration: Option<u64>,
}

impl S3Options {
    pub fn apply(&self, config: &mut Config) {
        if self.s3_access_key_id.is_some() {
            config.s3_access_key_id = self.s3_access_key_id.clone();
        }
        if self.s3_secret_access_key.is_some() {
            config.s3_secret_access_key = self.s3_secret_access_key.clone();
        }
        if self.s3_region.is_some() {
            config.s3_region = self.s3_region.clone();
        }
        if self.s3_endpoint.is_some() {
            config.s3_endpoint = self.s3_endpoint.clone();
        }
        if let Some(secs) = self.s3_url_expiration {
            config.s3_url_expiration_secs = secs;
        }
    }

    fn env_entries(&self, entries: &mut Vec<(&'static str, String)>) {
        push(entries, keys::S3_ACCESS_KEY_ID, self.s3_access_key_id.clone());
        push(entries, keys::S3_SECRET_ACCESS_KEY, self.s3_secret_access_key.clone());
        push(entries, keys::S3_REGION, self.s3_region.clone());
        push(entries, keys::S3_ENDPOINT, self.s3_endpoint.clone());
        push(entries, keys::S3_URL_EXPIRATION_TIME, self.s3_url_expiration);
    }
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Your Uploadcare public key.
    #[arg(long)]
    pub uc_public_key: Option<String>,
    /// Your Uploadcare secret key.
    #[arg(long)]
    pub uc_secret_key: Option<String>,
    /// Your S3 bucket name.
    #[arg(long)]
    pub s3_bucket_name: Option<String>,
    #[command(flatten)]
    pub s3: S3Options,
    #[command(flatten)]
    pub upload: UploadOptions,
}

impl InitArgs {
    /// Settings given on the command line, as `.env` entries.
    pub fn env_entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = Vec::new();
        push(&mut entries, keys::PUBLIC_KEY, self.uc_public_key.clone());
        push(&mut entries, keys::SECRET_KEY, self.uc_secret_key.clone());
        push(&mut entries, keys::S3_BUCKET_NAME, self.s3_bucket_name.clone());
        self.s3.env_entries(&mut entries);
        self.upload.env_entries(&mut entries);
        entries
    }
}

#[derive(Args, Debug, Clone)]
pub struct UrlsArgs {
    /// Text file with one URL or Filestack handle per line.
    pub file: PathBuf,
    /// Uploadcare public key. Defaults to PUBLIC_KEY from the environment.
    pub pub_key: Option<String>,
    /// Uploadcare secret key, enables signed uploads.
    pub secret_key: Option<String>,
    /// Do not retry files that failed in earlier runs.
    #[arg(long)]
    pub skip_errors: bool,
    #[command(flatten)]
    pub upload: UploadOptions,
}

impl UrlsArgs {
    pub fn apply(&self, config: &mut Config) {
        apply_keys(config, &self.pub_key, &self.secret_key);
        self.upload.apply(config);
    }
}

#[derive(Args, Debug, Clone)]
pub struct S3Args {
    /// S3 bucket name. Defaults to S3_BUCKET_NAME from the environment.
    pub bucket_name: Option<String>,
    /// Uploadcare public key. Defaults to PUBLIC_KEY from the environment.
    pub pub_key: Option<String>,
    /// Uploadcare secret key, enables signed uploads.
    pub secret_key: Option<String>,
    /// Do not retry files that failed in earlier runs.
    #[arg(long)]
    pub skip_errors: bool,
    #[command(flatten)]
    pub s3: S3Options,
    #[command(flatten)]
    pub upload: UploadOptions,
}

impl S3Args {
    pub fn apply(&self, config: &mut Config) {
        if self.bucket_name.is_some() {
            config.s3_bucket = self.bucket_name.clone();
        }
        apply_keys(config, &self.pub_key, &self.secret_key);
        self.s3.apply(config);
        self.upload.apply(config);
    }
}

fn apply_keys(config: &mut Config, pub_key: &Option<String>, secret_key: &Option<String>) {
    if let Some(key) = pub_key {
        config.public_key = key.clone();
    }
    if secret_key.is_some() {
        config.secret_key = secret_key.clone();
    }
}

fn push<T: ToString>(
    entries: &mut Vec<(&'static str, String)>,
    key: &'static str,
    value: Option<T>,
) {
    if let Some(value) = value {
        entries.push((key, value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_no_subcommand_is_allowed() -> Result<()> {
        let cli = Cli::try_parse_from(["migro"])?;
        assert!(cli.command.is_none());
        Ok(())
    }

    #[test]
    fn test_urls_overrides_env_config() -> Result<()> {
        let cli = Cli::try_parse_from([
            "migro",
            "urls",
            "list.txt",
            "pub-from-cli",
            "--concurrent-uploads",
            "8",
            "--upload-timeout",
            "60",
            "--skip-errors",
        ])?;
        let Some(Commands::Urls(args)) = cli.command else {
            panic!("expected urls command");
        };
        assert!(args.skip_errors);
        assert_eq!(args.file, PathBuf::from("list.txt"));

        let mut config = Config {
            public_key: "pub-from-env".into(),
            secret_key: Some("secret-from-env".into()),
            status_check_interval_secs: 7,
            ..Config::default()
        };
        args.apply(&mut config);

        assert_eq!(config.public_key, "pub-from-cli");
        // Not given on the command line, so the environment value stays.
        assert_eq!(config.secret_key.as_deref(), Some("secret-from-env"));
        assert_eq!(config.max_concurrent_uploads, 8);
        assert_eq!(config.upload_timeout_secs, 60);
        assert_eq!(config.status_check_interval_secs, 7);
        Ok(())
    }

    #[test]
    fn test_s3_args_apply() -> Result<()> {
        let cli = Cli::try_parse_from([
            "migro",
            "s3",
            "my-bucket",
            "--s3-region",
            "eu-central-1",
            "--concurrent-checks",
            "5",
        ])?;
        let Some(Commands::S3(args)) = cli.command else {
            panic!("expected s3 command");
        };
        assert!(!args.skip_errors);

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.s3_bucket.as_deref(), Some("my-bucket"));
        assert_eq!(config.s3_region.as_deref(), Some("eu-central-1"));
        assert_eq!(config.max_concurrent_checks, Some(5));
        Ok(())
    }

    #[test]
    fn test_init_env_entries_only_given_options() -> Result<()> {
        let cli = Cli::try_parse_from([
            "migro",
            "init",
            "--uc-public-key",
            "abc",
            "--s3-bucket-name",
            "media",
            "--status-check-interval",
            "5",
        ])?;
        let Some(Commands::Init(args)) = cli.command else {
            panic!("expected init command");
        };
        assert_eq!(
            args.env_entries(),
            vec![
                ("PUBLIC_KEY", "abc".to_string()),
                ("S3_BUCKET_NAME", "media".to_string()),
                ("STATUS_CHECK_INTERVAL", "5".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_drop_flag() -> Result<()> {
        let cli = Cli::try_parse_from(["migro", "drop", "--yes"])?;
        assert!(matches!(cli.command, Some(Commands::Drop { yes: true })));
        Ok(())
    }
}
