//! Uploadcare Upload API client for `from_url` uploads.
//!
//! Two calls are used: `GET from_url/` starts a fetch and returns a token,
//! `GET from_url/status/` reports the fetch progress for that token.

use crate::core::config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Signed requests stay valid this long after they are built.
pub const SIGNATURE_TTL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("UPLOAD_ERROR: {body}")]
    Rejected { status: u16, body: String },

    #[error("UPLOAD_ERROR: {0}")]
    Transport(String),

    #[error("UPLOAD_ERROR: malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("Request error: {0}")]
    Http(u16),

    #[error("Request error: {0}")]
    Transport(String),

    #[error("Request error: malformed response: {0}")]
    Malformed(String),
}

/// Result of a single status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Complete { remote_id: String },
    Failed { reason: String },
}

/// The two remote operations the upload worker depends on.
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// Asks Uploadcare to fetch `source_url`. Returns the `from_url` token.
    async fn submit(&self, source_url: &str) -> Result<String, SubmitError>;

    /// Checks the status of a previously submitted fetch. Has no side effects.
    async fn poll(&self, token: &str) -> Result<PollStatus, PollError>;
}

pub struct UploadClient {
    http: reqwest::Client,
    base_url: String,
    public_key: String,
    secret_key: Option<String>,
}

impl UploadClient {
    pub fn new(config: &Config) -> Result<Self> {
        // A stalled Upload API must not pin an upload permit forever.
        let http = reqwest::Client::builder()
            .user_agent(concat!("migro/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.upload_timeout())
            .timeout(config.upload_timeout())
            .build()
            .context("build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.upload_base.clone(),
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone().filter(|s| !s.is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// `pub_key` plus, when a secret key is configured, `expire` and `signature`.
    fn auth_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("pub_key", self.public_key.clone())];
        if let Some(secret) = &self.secret_key {
            let expire = unix_now() + SIGNATURE_TTL_SECS;
            params.push(("expire", expire.to_string()));
            params.push(("signature", sign(secret, expire)));
        }
        params
    }

    async fn get(
        &self,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> reqwest::Result<(u16, Vec<u8>)> {
        params.extend(self.auth_params());
        let url = self.endpoint(path);
        debug!("GET {}", url);
        let resp = self.http.get(&url).query(&params).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        Ok((status, body))
    }
}

#[async_trait]
impl UploadApi for UploadClient {
    async fn submit(&self, source_url: &str) -> Result<String, SubmitError> {
        let params = vec![
            ("source_url", source_url.to_string()),
            ("store", "auto".to_string()),
        ];
        let (status, body) = self
            .get("from_url/", params)
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        if status != 200 {
            return Err(SubmitError::Rejected {
                status,
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        parse_token(&body)
    }

    async fn poll(&self, token: &str) -> Result<PollStatus, PollError> {
        let params = vec![("token", token.to_string())];
        let (status, body) = self
            .get("from_url/status/", params)
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        if status != 200 {
            return Err(PollError::Http(status));
        }
        parse_status(&body)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Upload API signature: hex HMAC-SHA256 of the expiry timestamp keyed with the secret key.
pub fn sign(secret: &str, expire: u64) -> String {
    hmac_sha256_hex(secret, &expire.to_string())
}

fn hmac_sha256_hex(key: &str, message: &str) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC key of any length is valid"));
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn parse_token(body: &[u8]) -> Result<String, SubmitError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| SubmitError::Malformed(e.to_string()))?;
    value
        .get("token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SubmitError::Malformed("missing token".to_string()))
}

pub fn parse_status(body: &[u8]) -> Result<PollStatus, PollError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| PollError::Malformed(e.to_string()))?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let reason = match error.as_str() {
            Some(s) => s.to_string(),
            None => error.to_string(),
        };
        return Ok(PollStatus::Failed { reason });
    }

    match value.get("status").and_then(Value::as_str) {
        Some("success") => value
            .get("uuid")
            .and_then(Value::as_str)
            .map(|uuid| PollStatus::Complete {
                remote_id: uuid.to_string(),
            })
            .ok_or_else(|| PollError::Malformed("success status without uuid".to_string())),
        // "pending", "progress", "waiting" and unknown states keep polling.
        Some(_) => Ok(PollStatus::Pending),
        None => Err(PollError::Malformed("missing status".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_hmac_known_vector() {
        assert_eq!(
            hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_sign_depends_on_expiry() {
        let a = sign("secret", 1_700_000_000);
        let b = sign("secret", 1_700_000_300);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, hmac_sha256_hex("secret", "1700000000"));
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(br#"{"token": "abc"}"#), Ok("abc".to_string()));
        assert!(matches!(parse_token(br#"{"type": "token"}"#), Err(SubmitError::Malformed(_))));
        assert!(matches!(parse_token(b"<html>"), Err(SubmitError::Malformed(_))));
    }

    #[test]
    fn test_parse_status_variants() {
        assert_eq!(
            parse_status(br#"{"status": "success", "uuid": "u-1", "size": 10}"#),
            Ok(PollStatus::Complete {
                remote_id: "u-1".to_string()
            })
        );
        assert_eq!(parse_status(br#"{"status": "pending"}"#), Ok(PollStatus::Pending));
        assert_eq!(
            parse_status(br#"{"status": "progress", "done": 5, "total": 10}"#),
            Ok(PollStatus::Pending)
        );
        assert_eq!(
            parse_status(br#"{"status": "error", "error": "Host does not exist"}"#),
            Ok(PollStatus::Failed {
                reason: "Host does not exist".to_string()
            })
        );
        assert!(matches!(parse_status(br#"{"status": "success"}"#), Err(PollError::Malformed(_))));
        assert!(matches!(parse_status(br#"{}"#), Err(PollError::Malformed(_))));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(PollError::Http(503).to_string(), "Request error: 503");
        let rejected = SubmitError::Rejected {
            status: 400,
            body: "pub_key is required.".to_string(),
        };
        assert_eq!(rejected.to_string(), "UPLOAD_ERROR: pub_key is required.");
    }

    /// Serves one canned HTTP response per connection and records request lines.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let request = String::from_utf8_lossy(&buf);
                let line = request.lines().next().unwrap_or_default().to_string();
                seen.lock().unwrap().push(line);

                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{}/", addr), requests)
    }

    fn client_for(base: String, secret: Option<&str>) -> UploadClient {
        let config = Config {
            public_key: "demopublickey".to_string(),
            secret_key: secret.map(str::to_string),
            upload_base: base,
            ..Config::default()
        };
        UploadClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_poll_over_http() {
        let (base, requests) = serve(vec![
            (200, r#"{"type": "token", "token": "tok-1"}"#),
            (200, r#"{"status": "success", "uuid": "uuid-1"}"#),
        ])
        .await;
        let client = client_for(base, None);

        let token = client.submit("https://example.com/a.png").await.unwrap();
        assert_eq!(token, "tok-1");
        let status = client.poll(&token).await.unwrap();
        assert_eq!(
            status,
            PollStatus::Complete {
                remote_id: "uuid-1".to_string()
            }
        );

        let requests = requests.lock().unwrap();
        assert!(requests[0].starts_with("GET /from_url/?"));
        assert!(requests[0].contains("source_url=https%3A%2F%2Fexample.com%2Fa.png"));
        assert!(requests[0].contains("store=auto"));
        assert!(requests[0].contains("pub_key=demopublickey"));
        assert!(!requests[0].contains("signature="));
        assert!(requests[1].starts_with("GET /from_url/status/?token=tok-1"));
    }

    #[tokio::test]
    async fn test_signed_requests_carry_expire_and_signature() {
        let (base, requests) = serve(vec![(200, r#"{"token": "tok"}"#)]).await;
        let client = client_for(base, Some("secret"));

        client.submit("https://example.com/a.png").await.unwrap();

        let requests = requests.lock().unwrap();
        assert!(requests[0].contains("expire="));
        assert!(requests[0].contains("signature="));
    }

    #[tokio::test]
    async fn test_non_200_responses() {
        let (base, _) = serve(vec![
            (400, "pub_key is invalid."),
            (502, "bad gateway"),
        ])
        .await;
        let client = client_for(base, None);

        let err = client.submit("https://example.com/a.png").await.unwrap_err();
        assert_eq!(
            err,
            SubmitError::Rejected {
                status: 400,
                body: "pub_key is invalid.".to_string()
            }
        );
        assert_eq!(client.poll("tok").await.unwrap_err(), PollError::Http(502));
    }

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without ever answering.
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let config = Config {
            public_key: "demopublickey".to_string(),
            upload_base: format!("http://{}/", addr),
            upload_timeout_secs: 1,
            ..Config::default()
        };
        let client = UploadClient::new(&config).unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            client.submit("https://example.com/a.png"),
        )
        .await
        .expect("submit returned before the outer deadline");
        assert!(matches!(result, Err(SubmitError::Transport(_))));
    }
}
