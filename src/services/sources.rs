use crate::core::config::Config;
use crate::utils::build_url;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, SharedCredentialsProvider};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::presigning::PresigningConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

pub const URLS_SOURCE: &str = "urls";
pub const S3_SOURCE: &str = "s3";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Access Denied: {0}")]
    AccessDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A file found by a source, keyed by its stable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: String,
    pub size: Option<i64>,
}

/// Where files to migrate come from.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Tag stored in the `source` column.
    fn tag(&self) -> &'static str;

    /// Fails before any file is enrolled when the source cannot be read.
    async fn check_access(&self) -> Result<(), SourceError>;

    async fn discover(&self) -> Result<Vec<DiscoveredFile>, SourceError>;

    /// Turns a stored path into a URL the upload service can fetch.
    async fn resolve(&self, path: &str) -> Result<String, SourceError>;
}

// --- URL list ---

/// Text file with one URL or Filestack handle per line.
pub struct UrlListSource {
    input: PathBuf,
}

impl UrlListSource {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> SourceError {
        if source.kind() == std::io::ErrorKind::NotFound {
            SourceError::NotFound(format!("input file {:?} does not exist", self.input))
        } else {
            SourceError::Io {
                path: self.input.clone(),
                source,
            }
        }
    }
}

pub fn parse_url_list(content: &str) -> Vec<DiscoveredFile> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| DiscoveredFile {
            path: build_url(line),
            size: None,
        })
        .collect()
}

#[async_trait]
impl FileSource for UrlListSource {
    fn tag(&self) -> &'static str {
        URLS_SOURCE
    }

    async fn check_access(&self) -> Result<(), SourceError> {
        let meta = tokio::fs::metadata(&self.input)
            .await
            .map_err(|e| self.io_error(e))?;
        if !meta.is_file() {
            return Err(SourceError::NotFound(format!(
                "{:?} is not a file",
                self.input
            )));
        }
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<DiscoveredFile>, SourceError> {
        let content = tokio::fs::read_to_string(&self.input)
            .await
            .map_err(|e| self.io_error(e))?;
        let files = parse_url_list(&content);
        info!("Read {} URLs from {:?}", files.len(), self.input);
        Ok(files)
    }

    async fn resolve(&self, path: &str) -> Result<String, SourceError> {
        Ok(path.to_string())
    }
}

// --- S3 bucket ---

pub struct S3Source {
    client: Client,
    bucket: String,
    url_expiration: Duration,
}

impl S3Source {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let bucket = config
            .s3_bucket
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        if bucket.is_empty() {
            anyhow::bail!("S3 bucket not configured");
        }
        let client = create_client(config).await?;
        Ok(Self {
            client,
            bucket: bucket.to_string(),
            url_expiration: config.s3_url_expiration(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

async fn create_client(config: &Config) -> anyhow::Result<Client> {
    let region = config.s3_region.as_deref().unwrap_or("us-east-1").trim();
    let access_key = config.s3_access_key_id.as_deref().map(str::trim);
    let secret_key = config.s3_secret_access_key.as_deref().map(str::trim);

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()));

    if let (Some(ak), Some(sk)) = (access_key, secret_key) {
        let creds = Credentials::new(ak.to_string(), sk.to_string(), None, None, "static");
        loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
    } else if access_key.is_some() || secret_key.is_some() {
        anyhow::bail!(
            "S3 credentials incomplete: both access key ID and secret access key must be provided"
        );
    }

    let sdk_config = loader.load().await;
    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = config.s3_endpoint.as_deref() {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    Ok(Client::from_conf(builder.build()))
}

/// Maps an S3 error code onto the kinds the CLI reports.
pub fn classify_s3_error(code: Option<&str>, operation: &str, detail: String) -> SourceError {
    match code {
        Some("AccessDenied") => SourceError::AccessDenied(format!(
            "The credentials provided do not have permission to perform '{}'.",
            operation
        )),
        Some("NoSuchBucket" | "NoSuchKey" | "NotFound") => {
            SourceError::NotFound("The specified bucket or key does not exist.".to_string())
        }
        _ => SourceError::Unexpected(detail),
    }
}

#[async_trait]
impl FileSource for S3Source {
    fn tag(&self) -> &'static str {
        S3_SOURCE
    }

    async fn check_access(&self) -> Result<(), SourceError> {
        let listing = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                classify_s3_error(e.code(), "ListObjects", DisplayErrorContext(&e).to_string())
            })?;

        let first_key = listing.contents().first().and_then(|obj| obj.key());
        if let Some(key) = first_key {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    classify_s3_error(e.code(), "GetObject", DisplayErrorContext(&e).to_string())
                })?;
        }
        info!("S3 credentials verified for bucket {}", self.bucket);
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<DiscoveredFile>, SourceError> {
        let mut files = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.map_err(|e| {
                classify_s3_error(e.code(), "ListObjects", DisplayErrorContext(&e).to_string())
            })?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                // Directory placeholders have nothing to upload.
                if key.ends_with('/') {
                    continue;
                }
                files.push(DiscoveredFile {
                    path: key.to_string(),
                    size: obj.size(),
                });
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        info!("Found {} objects in bucket {}", files.len(), self.bucket);
        Ok(files)
    }

    async fn resolve(&self, path: &str) -> Result<String, SourceError> {
        let presigning = PresigningConfig::expires_in(self.url_expiration)
            .map_err(|e| SourceError::Unexpected(format!("invalid URL expiration: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning)
            .await
            .map_err(|e| SourceError::Unexpected(DisplayErrorContext(&e).to_string()))?;
        debug!("Signed URL created for {}", path);
        Ok(request.uri().to_string())
    }
}

/// Resolves every path, keeping the stored path next to its fetchable URL.
pub async fn resolve_all(
    source: &dyn FileSource,
    paths: impl IntoIterator<Item = &str>,
) -> Result<Vec<(String, String)>, SourceError> {
    let mut resolved = Vec::new();
    for path in paths {
        let url = source.resolve(path).await?;
        resolved.push((path.to_string(), url));
    }
    Ok(resolved)
}
