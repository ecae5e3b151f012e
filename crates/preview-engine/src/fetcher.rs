//! Preview retrieval: HTTP stream → staged payload.

use async_trait::async_trait;
use preview_proto::config::PreviewConfig;
use preview_proto::protocol::TrackDescriptor;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::janitor::{PreviewPayload, StagingArea, StagingKey};

/// What a fetch produced.  `NoPreview` is a normal outcome, not a failure.
#[derive(Debug)]
pub enum FetchOutcome {
    Staged(PreviewPayload),
    NoPreview,
}

#[async_trait]
pub trait PreviewFetcher: Send + Sync {
    /// Stage the preview of `track` under `key`.  Resolves only once the
    /// whole stream is committed; failures leave nothing on disk.
    async fn fetch(
        &self,
        track: &TrackDescriptor,
        key: StagingKey,
    ) -> Result<FetchOutcome, FetchError>;
}

pub struct HttpPreviewFetcher {
    http: reqwest::Client,
    staging: StagingArea,
    max_bytes: u64,
}

impl HttpPreviewFetcher {
    pub fn new(config: &PreviewConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("preview-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(
            http,
            StagingArea::new(config.staging_dir.clone()),
            config.max_bytes,
        ))
    }

    pub fn with_client(http: reqwest::Client, staging: StagingArea, max_bytes: u64) -> Self {
        Self {
            http,
            staging,
            max_bytes,
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }
}

#[async_trait]
impl PreviewFetcher for HttpPreviewFetcher {
    async fn fetch(
        &self,
        track: &TrackDescriptor,
        key: StagingKey,
    ) -> Result<FetchOutcome, FetchError> {
        let Some(url) = track.preview_url.as_deref() else {
            debug!("Fetcher: {} has no preview", track.title);
            return Ok(FetchOutcome::NoPreview);
        };

        debug!("Fetcher: GET {} for {}", url, key);
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let payload = self
            .staging
            .stage_stream(key, response.bytes_stream(), self.max_bytes)
            .await?;
        info!(
            "Fetcher: staged {} bytes of \"{}\" at {}",
            payload.len(),
            track.title,
            payload.path().display()
        );
        Ok(FetchOutcome::Staged(payload))
    }
}
