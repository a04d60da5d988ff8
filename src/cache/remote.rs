/// Remote cache client
///
/// Speaks the Vercel-compatible artifacts API:
/// - `GET  /v8/artifacts/status`
/// - `HEAD /v8/artifacts/{hash}`
/// - `GET  /v8/artifacts/{hash}`
/// - `PUT  /v8/artifacts/{hash}`
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the duration (ms) of the execution that produced an artifact
pub const ARTIFACT_DURATION_HEADER: &str = "x-artifact-duration";

#[derive(Error, Debug)]
pub enum RemoteCacheError {
    #[error("Remote cache rejected the credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("Remote caching is disabled for this account")]
    Disabled,

    #[error("Remote cache request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote cache returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid remote cache configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Enabled,
    Disabled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: RemoteStatus,
}

/// An artifact downloaded from the remote cache
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    pub bytes: Bytes,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RemoteCacheOptions {
    pub url: String,
    pub team: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
}

pub struct RemoteCache {
    client: Client,
    base_url: String,
    team: Option<String>,
    token: Option<String>,
}

impl RemoteCache {
    pub fn new(options: RemoteCacheOptions) -> Result<Self, RemoteCacheError> {
        if !options.url.starts_with("http://") && !options.url.starts_with("https://") {
            return Err(RemoteCacheError::InvalidConfig(format!(
                "URL must start with http:// or https://, got {}",
                options.url
            )));
        }

        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: options.url.trim_end_matches('/').to_string(),
            team: options.team,
            token: options.token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!("{}/v8/artifacts/{}", self.base_url, hash)
    }

    /// Attach team query and bearer token
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.team {
            Some(team) if team.starts_with("team_") => request.query(&[("teamId", team)]),
            Some(team) => request.query(&[("slug", team)]),
            None => request,
        };

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map non-success statuses to errors
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteCacheError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RemoteCacheError::Unauthorized(status.as_u16()))
            }
            StatusCode::PRECONDITION_FAILED => Err(RemoteCacheError::Disabled),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteCacheError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    pub async fn status(&self) -> Result<RemoteStatus, RemoteCacheError> {
        let url = format!("{}/v8/artifacts/status", self.base_url);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::check(response).await?;
        let status: StatusResponse = response.json().await?;

        Ok(status.status)
    }

    pub async fn exists(&self, hash: &str) -> Result<bool, RemoteCacheError> {
        let url = self.artifact_url(hash);
        debug!("HEAD {}", url);

        let response = self.authorize(self.client.head(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;

        Ok(true)
    }

    /// Download an artifact; `None` on a miss
    pub async fn fetch(&self, hash: &str) -> Result<Option<RemoteArtifact>, RemoteCacheError> {
        let url = self.artifact_url(hash);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;

        let duration_ms = response
            .headers()
            .get(ARTIFACT_DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let bytes = response.bytes().await?;

        debug!(hash = %hash, size_bytes = bytes.len(), "Downloaded artifact");

        Ok(Some(RemoteArtifact { bytes, duration_ms }))
    }

    pub async fn put(
        &self,
        hash: &str,
        artifact: Vec<u8>,
        duration_ms: u64,
    ) -> Result<(), RemoteCacheError> {
        let url = self.artifact_url(hash);
        debug!("PUT {} ({} bytes)", url, artifact.len());

        let request = self
            .client
            .put(&url)
            .header("Content-Type", "application/octet-stream")
            .header(ARTIFACT_DURATION_HEADER, duration_ms.to_string())
            .body(artifact);

        let response = self.authorize(request).send().await?;
        Self::check(response).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(url: &str) -> RemoteCacheOptions {
        RemoteCacheOptions {
            url: url.to_string(),
            team: None,
            token: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_rejects_non_http_url() {
        let result = RemoteCache::new(options("ftp://cache.example.com"));
        assert!(matches!(result, Err(RemoteCacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let cache = RemoteCache::new(options("https://cache.example.com/")).unwrap();
        assert_eq!(cache.base_url(), "https://cache.example.com");
        assert_eq!(
            cache.artifact_url("abc"),
            "https://cache.example.com/v8/artifacts/abc"
        );
    }

    #[test]
    fn test_status_deserialization() {
        let status: StatusResponse = serde_json::from_str(r#"{"status": "enabled"}"#).unwrap();
        assert_eq!(status.status, RemoteStatus::Enabled);

        let status: StatusResponse = serde_json::from_str(r#"{"status": "paused"}"#).unwrap();
        assert_eq!(status.status, RemoteStatus::Unknown);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let cache = RemoteCache::new(RemoteCacheOptions {
            timeout: Duration::from_millis(500),
            ..options("http://127.0.0.1:1")
        })
        .unwrap();

        let result = cache.fetch("abc").await;
        assert!(matches!(result, Err(RemoteCacheError::Http(_))));
    }
}
