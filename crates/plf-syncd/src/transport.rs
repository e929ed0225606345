use async_trait::async_trait;
use plf_core::SyncConfig;
use plf_proto::{
    PushRequest, PushResponse, SnapshotInfo, PUSH_PATH, SNAPSHOTS_PATH, SNAPSHOT_PATH,
    SYNC_TOKEN_HEADER,
};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sync server url is not configured")]
    NotConfigured,

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server rejected the sync token")]
    Unauthorized,

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid server url {0:?}")]
    InvalidUrl(String),
}

/// How the daemon talks to the sync server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send one batch; the response lists the change ids the server accepted.
    async fn push(
        &self,
        config: &SyncConfig,
        request: &PushRequest,
    ) -> Result<PushResponse, TransportError>;

    /// Store an encrypted snapshot container under this device's id.
    async fn upload_snapshot(
        &self,
        config: &SyncConfig,
        container: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// reqwest-backed transport for a real server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plf-syncd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Fetch the latest snapshot container another device uploaded.
    pub async fn download_snapshot(
        &self,
        config: &SyncConfig,
        device_id: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let url = endpoint(config, SNAPSHOT_PATH, Some(device_id))?;
        let response = send(authed(self.client.get(url), config)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn list_snapshots(
        &self,
        config: &SyncConfig,
    ) -> Result<Vec<SnapshotInfo>, TransportError> {
        let url = endpoint(config, SNAPSHOTS_PATH, None)?;
        let response = send(authed(self.client.get(url), config)).await?;
        decode(response).await
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(
        &self,
        config: &SyncConfig,
        request: &PushRequest,
    ) -> Result<PushResponse, TransportError> {
        let url = endpoint(config, PUSH_PATH, None)?;
        let response = send(authed(self.client.post(url), config).json(request)).await?;
        decode(response).await
    }

    async fn upload_snapshot(
        &self,
        config: &SyncConfig,
        container: Vec<u8>,
    ) -> Result<(), TransportError> {
        let url = endpoint(config, SNAPSHOT_PATH, Some(&config.device_id))?;
        let request = authed(self.client.put(url), config)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(container);
        send(request).await?;
        Ok(())
    }
}

/// `server_url` joined with `path`, plus `device_id` as one escaped segment.
fn endpoint(
    config: &SyncConfig,
    path: &str,
    device_id: Option<&str>,
) -> Result<Url, TransportError> {
    let base = config.server_url.trim();
    if base.is_empty() {
        return Err(TransportError::NotConfigured);
    }
    let mut url = Url::parse(base).map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
        segments.pop_if_empty();
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        if let Some(device_id) = device_id {
            segments.push(device_id);
        }
    }
    Ok(url)
}

fn authed(request: RequestBuilder, config: &SyncConfig) -> RequestBuilder {
    request.header(SYNC_TOKEN_HEADER, &config.server_token)
}

async fn send(request: RequestBuilder) -> Result<Response, TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    Ok(response)
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Pull `error` out of a JSON error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}
